use std::fmt;
use std::io;
use std::time::Duration;

use itertools::Itertools;
use thiserror::Error;

/// Errors that make further measurement meaningless.
///
/// None of these are recovered from inside the crate. A sample that merely could not be produced
/// is not an error - it is reported as [`MeasurementSample::Invalid`][crate::MeasurementSample]
/// and the run continues.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// One or more parameters were missing or malformed. Every problem found is listed, not
    /// just the first one.
    #[error("invalid configuration:\n{}", .0.iter().map(ToString::to_string).join("\n"))]
    Configuration(Vec<ConfigProblem>),

    /// Memory or some other operating system resource could not be obtained.
    #[error("could not allocate {what}: {source}")]
    ResourceExhaustion {
        /// What we were trying to obtain.
        what: String,

        /// The operating system error behind the failure.
        source: io::Error,
    },

    /// The configuration is well-formed but asks for something this hardware cannot do, such as
    /// a coherence state without the CPUs needed to produce it or a TLB level that does not exist.
    #[error("unsupported on this system: {0}")]
    UnsupportedState(String),

    /// A worker thread failed while executing a command. A worker that failed cannot take part
    /// in later coherence protocols, so the whole measurement is abandoned.
    #[error("worker {worker} failed: {problem}")]
    WorkerFailed {
        /// Index of the failed worker.
        worker: usize,

        /// Description of what went wrong on the worker thread.
        problem: String,
    },

    /// A worker did not acknowledge its initialization in time.
    #[error("worker {worker} did not acknowledge initialization within {waited:?}")]
    WorkerUnresponsive {
        /// Index of the unresponsive worker.
        worker: usize,

        /// How long we waited before giving up.
        waited: Duration,
    },

    /// A hardware performance counter could not be opened.
    #[error("hardware counter '{name}' is not available: {source}")]
    Counter {
        /// Name of the counter as configured.
        name: String,

        /// The operating system error behind the failure.
        source: io::Error,
    },
}

impl Error {
    /// The process exit code a harness should use when terminating because of this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Configuration(_) | Self::UnsupportedState(_) | Self::Counter { .. } => 1,
            Self::WorkerFailed { .. } | Self::WorkerUnresponsive { .. } => 2,
            Self::ResourceExhaustion { .. } => 127,
        }
    }

    pub(crate) fn resource(what: impl Into<String>, source: io::Error) -> Self {
        Self::ResourceExhaustion {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedState(message.into())
    }
}

/// A single problem with a single configuration key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigProblem {
    key: String,
    problem: String,
}

impl ConfigProblem {
    pub(crate) fn new(key: impl Into<String>, problem: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            problem: problem.into(),
        }
    }

    /// The parameter key the problem relates to.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Human-readable description of the problem.
    #[must_use]
    pub fn problem(&self) -> &str {
        &self.problem
    }
}

impl fmt::Display for ConfigProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  {}: {}", self.key, self.problem)
    }
}

/// Accumulates configuration problems so they can be reported together.
#[derive(Debug, Default)]
pub(crate) struct ConfigProblems {
    problems: Vec<ConfigProblem>,
}

impl ConfigProblems {
    pub(crate) fn push(&mut self, key: impl Into<String>, problem: impl Into<String>) {
        self.problems.push(ConfigProblem::new(key, problem));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.problems.is_empty()
    }

    /// Converts the accumulated problems into an error, if there are any.
    pub(crate) fn into_result(self) -> Result<()> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Configuration(self.problems))
        }
    }
}

/// A specialized `Result` type for measurement operations, returning the crate's
/// [`Error`] type as the error value.
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(Error: Send, Sync, Debug);

    #[test]
    fn configuration_error_lists_every_problem() {
        let mut problems = ConfigProblems::default();
        problems.push("MIN", "not set");
        problems.push("ALLOC", "invalid setting 'X'");

        let error = problems.into_result().unwrap_err();
        let message = error.to_string();

        assert!(message.contains("MIN: not set"));
        assert!(message.contains("ALLOC: invalid setting 'X'"));
        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn empty_problems_are_ok() {
        ConfigProblems::default().into_result().unwrap();
    }

    #[test]
    fn resource_exhaustion_exit_code() {
        let error = Error::resource("test buffer", io::Error::from(io::ErrorKind::OutOfMemory));
        assert_eq!(error.exit_code(), 127);
    }
}
