use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use std::{env, fs};

use itertools::Itertools;
use toml::{Table, Value};

use crate::{ConfigProblem, ConfigProblems, Error, Result};

/// Environment variable prefix used by the harness unless told otherwise.
pub const DEFAULT_ENV_PREFIX: &str = "CCBENCH_";

/// String key-value parameters from which a [`RunConfig`][crate::RunConfig] is built.
///
/// Parameters come from a parameter file and/or from environment variables. Later sources
/// override earlier ones, so the usual setup is a file with the defaults of a measurement series
/// plus a few environment variables varying one of them.
///
/// # Parameter file format
///
/// The file is TOML. Every top-level key is a parameter; nested tables are not allowed.
///
/// ```toml
/// MIN = 32000
/// MAX = 200000000
/// STEPS = 70
/// CPU_LIST = "0,2-8/2"
/// USE_MODE = "E"
/// COUNTERS = ["cycles", "instructions"]
/// ```
///
/// Integers, floats and booleans are stored in their textual form (booleans as `1`/`0`). Arrays
/// become comma-separated lists.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ParameterStore {
    values: HashMap<String, String>,
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding exactly the given parameters.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            values: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Loads parameters from a TOML parameter file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] if the file cannot be read or is not a flat TOML table.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path).map_err(|e| {
            Error::Configuration(vec![ConfigProblem::new(
                path.display().to_string(),
                format!("cannot read parameter file: {e}"),
            )])
        })?;

        Self::from_toml(&contents).map_err(|e| match e {
            Error::Configuration(problems) => Error::Configuration(
                problems
                    .into_iter()
                    .map(|p| {
                        ConfigProblem::new(
                            format!("{}: {}", path.display(), p.key()),
                            p.problem().to_string(),
                        )
                    })
                    .collect(),
            ),
            other => other,
        })
    }

    /// Parses parameters from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Configuration`] listing every entry that cannot be used as a parameter.
    pub fn from_toml(text: &str) -> Result<Self> {
        let table: Table = toml::from_str(text).map_err(|e| {
            Error::Configuration(vec![ConfigProblem::new(
                "<parameter file>",
                e.message().to_string(),
            )])
        })?;

        let mut problems = ConfigProblems::default();
        let mut values = HashMap::with_capacity(table.len());

        for (key, value) in table {
            match value_to_string(&value) {
                Ok(text) => {
                    values.insert(key, text);
                }
                Err(problem) => problems.push(key, problem),
            }
        }

        problems.into_result()?;
        Ok(Self { values })
    }

    /// Overrides parameters with the process environment variables that start with `prefix`.
    /// The prefix is removed from the variable name to form the parameter key.
    #[must_use]
    pub fn with_environment(self, prefix: &str) -> Self {
        self.with_variables(prefix, env::vars())
    }

    /// Overrides parameters with those of `variables` whose name starts with `prefix`.
    #[must_use]
    pub fn with_variables(
        mut self,
        prefix: &str,
        variables: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        for (name, value) in variables {
            if let Some(key) = name.strip_prefix(prefix)
                && !key.is_empty()
            {
                self.values.insert(key.to_string(), value);
            }
        }

        self
    }

    /// Sets a single parameter, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// The raw value of a parameter. Blank values count as not set.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// Parses a parameter that must be present.
    pub(crate) fn required<T>(&self, key: &str, problems: &mut ConfigProblems) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        if self.get(key).is_none() {
            problems.push(key, "not set");
            return None;
        }

        self.optional(key, problems)
    }

    /// Parses a parameter that may be absent. A present but malformed value is a problem.
    pub(crate) fn optional<T>(&self, key: &str, problems: &mut ConfigProblems) -> Option<T>
    where
        T: FromStr,
        T::Err: Display,
    {
        let raw = self.get(key)?;

        match raw.parse::<T>() {
            Ok(value) => Some(value),
            Err(e) => {
                problems.push(key, format!("invalid value '{raw}': {e}"));
                None
            }
        }
    }

    /// Parses a parameter, falling back to `default` if absent or malformed.
    pub(crate) fn or_default<T>(&self, key: &str, default: T, problems: &mut ConfigProblems) -> T
    where
        T: FromStr,
        T::Err: Display,
    {
        self.optional(key, problems).unwrap_or(default)
    }

    /// Parses a `0`/`1` switch.
    pub(crate) fn flag(&self, key: &str, default: bool, problems: &mut ConfigProblems) -> bool {
        match self.get(key) {
            None => default,
            Some("0") => false,
            Some("1") => true,
            Some(other) => {
                problems.push(key, format!("invalid value '{other}', expected 0 or 1"));
                default
            }
        }
    }

    /// Parses a `0`/`1` switch that must be present.
    pub(crate) fn required_flag(&self, key: &str, problems: &mut ConfigProblems) -> bool {
        if self.get(key).is_none() {
            problems.push(key, "not set");
            return false;
        }

        self.flag(key, false, problems)
    }
}

fn value_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Float(f) => Ok(f.to_string()),
        Value::Boolean(b) => Ok(if *b { "1" } else { "0" }.to_string()),
        Value::Array(items) => Ok(items
            .iter()
            .map(value_to_string)
            .collect::<std::result::Result<Vec<_>, _>>()?
            .into_iter()
            .join(",")),
        Value::Datetime(_) | Value::Table(_) => {
            Err("only strings, numbers, booleans and arrays of them are allowed".to_string())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn file_values_become_strings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
MIN = 32000
CPU_LIST = "0,2-8/2"
HUGEPAGES = false
CPU_FREQUENCY = 2.5e9
COUNTERS = ["cycles", "instructions"]
"#
        )
        .unwrap();

        let store = ParameterStore::from_file(file.path()).unwrap();

        assert_eq!(store.get("MIN"), Some("32000"));
        assert_eq!(store.get("CPU_LIST"), Some("0,2-8/2"));
        assert_eq!(store.get("HUGEPAGES"), Some("0"));
        assert_eq!(store.get("CPU_FREQUENCY"), Some("2500000000"));
        assert_eq!(store.get("COUNTERS"), Some("cycles,instructions"));
        assert_eq!(store.get("MAX"), None);
    }

    #[test]
    fn nested_tables_are_rejected() {
        let error = ParameterStore::from_toml("[section]\nMIN = 1\n").unwrap_err();
        assert!(matches!(error, Error::Configuration(problems) if problems.len() == 1));
    }

    #[test]
    fn missing_file_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let error = ParameterStore::from_file(dir.path().join("absent.toml")).unwrap_err();

        assert_eq!(error.exit_code(), 1);
    }

    #[test]
    fn environment_overrides_file() {
        let store = ParameterStore::from_pairs([("MIN", "1000"), ("MAX", "2000")]).with_variables(
            DEFAULT_ENV_PREFIX,
            [
                ("CCBENCH_MIN".to_string(), "500".to_string()),
                ("UNRELATED".to_string(), "x".to_string()),
                ("CCBENCH_".to_string(), "ignored".to_string()),
            ],
        );

        assert_eq!(store.get("MIN"), Some("500"));
        assert_eq!(store.get("MAX"), Some("2000"));
        assert_eq!(store.get("UNRELATED"), None);
    }

    #[test]
    fn typed_accessors_collect_problems() {
        let store = ParameterStore::from_pairs([
            ("GOOD", "42"),
            ("BAD", "forty-two"),
            ("BLANK", "  "),
            ("SWITCH", "2"),
        ]);
        let mut problems = ConfigProblems::default();

        assert_eq!(store.required::<u64>("GOOD", &mut problems), Some(42));
        assert_eq!(store.required::<u64>("BAD", &mut problems), None);
        assert_eq!(store.required::<u64>("BLANK", &mut problems), None);
        assert_eq!(store.optional::<u64>("ABSENT", &mut problems), None);
        assert_eq!(store.or_default::<u64>("ABSENT", 7, &mut problems), 7);
        assert!(store.flag("SWITCH", true, &mut problems));

        let Err(Error::Configuration(problems)) = problems.into_result() else {
            panic!("expected configuration problems");
        };

        let keys: Vec<_> = problems.iter().map(ConfigProblem::key).collect();
        assert_eq!(keys, vec!["BAD", "BLANK", "SWITCH"]);
    }
}
