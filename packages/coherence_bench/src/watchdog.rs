use std::process;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::pal::{Bindings, BindingsFacade};
use crate::{Error, Result};

/// Terminates the whole process if a measurement takes longer than allowed.
///
/// A hung coherence protocol cannot be interrupted safely, so there is no gentler way out: when
/// the timeout expires, the process is sent `SIGTERM`. The watchdog thread blocks `SIGINT` and
/// `SIGTERM` for itself so that those signals always reach a thread that can act on them.
///
/// Dropping the watchdog cancels it.
#[derive(Debug)]
pub struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Starts a watchdog for the current process. A zero timeout disables it and returns `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ResourceExhaustion`] if the watchdog thread cannot be started.
    pub fn start(timeout: Duration) -> Result<Option<Self>> {
        Self::start_with(timeout, process::id(), BindingsFacade::target())
    }

    pub(crate) fn start_with(
        timeout: Duration,
        pid: u32,
        bindings: BindingsFacade,
    ) -> Result<Option<Self>> {
        if timeout.is_zero() {
            return Ok(None);
        }

        let (cancel, cancelled) = mpsc::channel::<()>();

        let thread = thread::Builder::new()
            .name("watchdog".to_string())
            .spawn(move || {
                if let Err(e) = bindings.block_termination_signals() {
                    warn!("watchdog could not block termination signals: {e}");
                }

                match cancelled.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        error!("measurement exceeded the timeout of {timeout:?}, terminating");

                        if let Err(e) = bindings.terminate_process(pid) {
                            error!("watchdog could not terminate process {pid}: {e}");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        debug!("watchdog cancelled");
                    }
                }
            })
            .map_err(|e| Error::resource("watchdog thread", e))?;

        debug!(?timeout, "watchdog started");

        Ok(Some(Self {
            cancel: Some(cancel),
            thread: Some(thread),
        }))
    }

    /// Stops the watchdog and waits for its thread to exit.
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // The thread may already have fired and exited, which is fine.
            _ = cancel.send(());
        }

        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            warn!("watchdog thread panicked");
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    use super::*;
    use crate::pal::MockBindings;

    #[test]
    fn zero_timeout_is_disabled() {
        let watchdog =
            Watchdog::start_with(Duration::ZERO, 1, BindingsFacade::from_mock(MockBindings::new()))
                .unwrap();

        assert!(watchdog.is_none());
    }

    #[test]
    fn fires_after_timeout_and_not_before() {
        const TIMEOUT: Duration = Duration::from_millis(200);

        let fired_at = Arc::new(Mutex::new(None));

        let mut bindings = MockBindings::new();
        bindings
            .expect_block_termination_signals()
            .times(1)
            .returning(|| Ok(()));
        bindings.expect_terminate_process().times(1).returning({
            let fired_at = Arc::clone(&fired_at);
            move |pid| {
                assert_eq!(pid, 4242);
                *fired_at.lock().unwrap() = Some(Instant::now());
                Ok(())
            }
        });

        let started = Instant::now();
        let watchdog = Watchdog::start_with(TIMEOUT, 4242, BindingsFacade::from_mock(bindings))
            .unwrap()
            .unwrap();

        // Simulates a measurement that never finishes on its own.
        while fired_at.lock().unwrap().is_none() {
            assert!(started.elapsed() < Duration::from_secs(30), "watchdog never fired");
            thread::sleep(Duration::from_millis(5));
        }

        let fired_after = fired_at.lock().unwrap().unwrap() - started;
        assert!(fired_after >= TIMEOUT);
        assert!(fired_after < TIMEOUT + Duration::from_secs(10));

        watchdog.cancel();
    }

    #[test]
    fn cancel_prevents_termination() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_block_termination_signals()
            .times(1)
            .returning(|| Ok(()));
        bindings.expect_terminate_process().never();

        let watchdog = Watchdog::start_with(
            Duration::from_secs(3600),
            1,
            BindingsFacade::from_mock(bindings),
        )
        .unwrap()
        .unwrap();

        let started = Instant::now();
        watchdog.cancel();
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn signal_mask_failure_is_not_fatal() {
        let mut bindings = MockBindings::new();
        bindings
            .expect_block_termination_signals()
            .times(1)
            .returning(|| Err(std::io::Error::from_raw_os_error(libc::EINVAL)));

        let watchdog = Watchdog::start_with(
            Duration::from_secs(3600),
            1,
            BindingsFacade::from_mock(bindings),
        )
        .unwrap();

        drop(watchdog);
    }
}
