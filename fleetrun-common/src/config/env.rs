//! Environment variable parsing with type safety.
//!
//! Errors are collected rather than returned one at a time so a single run
//! reports every missing or malformed variable.

use std::env;
use thiserror::Error;

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EnvError {
    /// Required variable is unset or empty.
    #[error("Missing required variable {var}")]
    Missing { var: String },

    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },

    /// Value out of valid range.
    #[error("Value out of range for {var}: {value} (valid: {min}..={max})")]
    OutOfRange {
        var: String,
        value: String,
        min: String,
        max: String,
    },
}

/// Type-safe environment variable parser scoped to one prefix.
pub struct EnvParser {
    prefix: &'static str,
    errors: Vec<EnvError>,
}

impl EnvParser {
    /// Create a parser for variables starting with `prefix` (e.g. `"VM_"`).
    pub fn with_prefix(prefix: &'static str) -> Self {
        Self {
            prefix,
            errors: Vec::new(),
        }
    }

    pub fn errors(&self) -> &[EnvError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn take_errors(&mut self) -> Vec<EnvError> {
        std::mem::take(&mut self.errors)
    }

    fn var_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Raw value, treating an empty string as unset.
    fn lookup(&self, var_name: &str) -> Option<String> {
        env::var(var_name)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Get a string value with default.
    pub fn get_string(&mut self, name: &str, default: &str) -> String {
        let var_name = self.var_name(name);
        self.lookup(&var_name)
            .unwrap_or_else(|| default.to_string())
    }

    /// Get an optional string; empty counts as unset.
    pub fn get_optional_string(&mut self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        self.lookup(&var_name)
    }

    /// Get one of `allowed` (case-insensitive, returned lowercase) or the
    /// default. Anything else records [`EnvError::InvalidValue`].
    pub fn get_choice(&mut self, name: &str, default: &str, allowed: &[&str]) -> String {
        let var_name = self.var_name(name);
        let Some(raw) = self.lookup(&var_name) else {
            return default.to_string();
        };
        let lower = raw.to_ascii_lowercase();
        if allowed.contains(&lower.as_str()) {
            lower
        } else {
            self.errors.push(EnvError::InvalidValue {
                var: var_name,
                expected: format!("one of {}", allowed.join(", ")),
                value: raw,
            });
            default.to_string()
        }
    }

    /// Get a required string. Records [`EnvError::Missing`] when absent.
    pub fn require_string(&mut self, name: &str) -> Option<String> {
        let var_name = self.var_name(name);
        let value = self.lookup(&var_name);
        if value.is_none() {
            self.errors.push(EnvError::Missing { var: var_name });
        }
        value
    }

    /// Get a required unsigned integer.
    pub fn require_u32(&mut self, name: &str) -> Option<u32> {
        let var_name = self.var_name(name);
        let raw = self.require_string(name)?;
        match raw.parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var: var_name,
                    expected: "unsigned 32-bit integer".to_string(),
                    value: raw,
                });
                None
            }
        }
    }

    /// Get a required u64 value within `min..=max`.
    pub fn require_u64_range(&mut self, name: &str, min: u64, max: u64) -> Option<u64> {
        let var_name = self.var_name(name);
        let raw = self.require_string(name)?;
        self.parse_u64_range(var_name, raw, min, max)
    }

    /// Get a u64 value with default and range validation.
    pub fn get_u64_range(&mut self, name: &str, default: u64, min: u64, max: u64) -> u64 {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(raw) => self
                .parse_u64_range(var_name, raw, min, max)
                .unwrap_or(default),
            None => default,
        }
    }

    fn parse_u64_range(&mut self, var: String, raw: String, min: u64, max: u64) -> Option<u64> {
        match raw.parse::<u64>() {
            Ok(n) if n >= min && n <= max => Some(n),
            Ok(n) => {
                self.errors.push(EnvError::OutOfRange {
                    var,
                    value: n.to_string(),
                    min: min.to_string(),
                    max: max.to_string(),
                });
                None
            }
            Err(_) => {
                self.errors.push(EnvError::InvalidValue {
                    var,
                    expected: "unsigned 64-bit integer".to_string(),
                    value: raw,
                });
                None
            }
        }
    }

    /// Get a required whitespace separated id list with at least one entry.
    pub fn require_id_list(&mut self, name: &str) -> Option<Vec<u32>> {
        let var_name = self.var_name(name);
        let raw = self.require_string(name)?;
        self.parse_id_list(var_name, &raw)
    }

    /// Get an optional id list; unset yields an empty list.
    pub fn optional_id_list(&mut self, name: &str) -> Vec<u32> {
        let var_name = self.var_name(name);
        match self.lookup(&var_name) {
            Some(raw) => self.parse_id_list(var_name, &raw).unwrap_or_default(),
            None => Vec::new(),
        }
    }

    fn parse_id_list(&mut self, var: String, raw: &str) -> Option<Vec<u32>> {
        let mut ids = Vec::new();
        for token in raw.split_whitespace() {
            match token.parse::<u32>() {
                Ok(id) => ids.push(id),
                Err(_) => {
                    self.errors.push(EnvError::InvalidValue {
                        var,
                        expected: "whitespace separated unsigned integers".to_string(),
                        value: raw.to_string(),
                    });
                    return None;
                }
            }
        }
        Some(ids)
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use crate::config::env_test_lock;

    fn cleanup_env(vars: &[&str]) {
        for var in vars {
            // SAFETY: Tests are serialized via env_test_lock
            unsafe { env::remove_var(var) };
        }
    }

    fn set_env(key: &str, value: &str) {
        // SAFETY: Tests are serialized via env_test_lock
        unsafe { env::set_var(key, value) };
    }

    #[test]
    fn test_require_string_missing_records_error() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_REQ_STR"];
        cleanup_env(&vars);

        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_string("REQ_STR"), None);
        assert_eq!(
            parser.errors(),
            &[EnvError::Missing {
                var: "FRTEST_REQ_STR".to_string()
            }]
        );

        // Whitespace only counts as unset
        set_env("FRTEST_REQ_STR", "   ");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_string("REQ_STR"), None);
        assert!(parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_require_u32_invalid() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_U32"];
        cleanup_env(&vars);

        set_env("FRTEST_U32", "eleven");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_u32("U32"), None);
        assert!(matches!(
            parser.errors(),
            [EnvError::InvalidValue { var, .. }] if var == "FRTEST_U32"
        ));

        set_env("FRTEST_U32", "100");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_u32("U32"), Some(100));
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_id_list_parsing() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_IDS"];
        cleanup_env(&vars);

        set_env("FRTEST_IDS", " 11  12\t13 ");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_id_list("IDS"), Some(vec![11, 12, 13]));
        assert!(!parser.has_errors());

        set_env("FRTEST_IDS", "11 x 13");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.require_id_list("IDS"), None);
        assert_eq!(parser.errors().len(), 1);

        cleanup_env(&vars);
    }

    #[test]
    fn test_optional_id_list_unset_is_empty() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_OPT_IDS"];
        cleanup_env(&vars);

        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert!(parser.optional_id_list("OPT_IDS").is_empty());
        assert!(!parser.has_errors());

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_u64_range_out_of_range_uses_default() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_U64_OOR"];
        cleanup_env(&vars);

        set_env("FRTEST_U64_OOR", "500");
        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.get_u64_range("U64_OOR", 10, 1, 300), 10);
        assert!(matches!(parser.errors(), [EnvError::OutOfRange { .. }]));

        cleanup_env(&vars);
    }

    #[test]
    fn test_get_choice() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_FORMAT"];
        cleanup_env(&vars);

        let mut parser = EnvParser::with_prefix("FRTEST_");
        assert_eq!(parser.get_choice("FORMAT", "pretty", &["pretty", "json"]), "pretty");

        set_env("FRTEST_FORMAT", "JSON");
        assert_eq!(parser.get_choice("FORMAT", "pretty", &["pretty", "json"]), "json");
        assert!(!parser.has_errors());

        set_env("FRTEST_FORMAT", "xml");
        assert_eq!(parser.get_choice("FORMAT", "pretty", &["pretty", "json"]), "pretty");
        assert!(matches!(
            parser.errors(),
            [EnvError::InvalidValue { value, .. }] if value == "xml"
        ));

        cleanup_env(&vars);
    }

    #[test]
    fn test_take_errors_drains() {
        let _guard = env_test_lock();
        let vars = ["FRTEST_GONE_A", "FRTEST_GONE_B"];
        cleanup_env(&vars);

        let mut parser = EnvParser::with_prefix("FRTEST_");
        parser.require_string("GONE_A");
        parser.require_string("GONE_B");
        let errors = parser.take_errors();
        assert_eq!(errors.len(), 2);
        assert!(!parser.has_errors());
    }

    mod proptest_id_lists {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(100))]

            #[test]
            fn test_id_list_roundtrip(ids in prop::collection::vec(0u32..1000, 1..8)) {
                let _guard = env_test_lock();
                let var = "FRTEST_PROPTEST_IDS";
                let joined = ids.iter().map(u32::to_string).collect::<Vec<_>>().join(" ");
                set_env(var, &joined);

                let mut parser = EnvParser::with_prefix("FRTEST_");
                prop_assert_eq!(parser.require_id_list("PROPTEST_IDS"), Some(ids));
                prop_assert!(!parser.has_errors());

                cleanup_env(&[var]);
            }

            #[test]
            fn test_id_list_never_panics(raw in ".{0,40}") {
                let _guard = env_test_lock();
                let var = "FRTEST_PROPTEST_RAW";
                // set_var rejects interior NUL
                if raw.contains('\0') {
                    return Ok(());
                }
                set_env(var, &raw);
                let mut parser = EnvParser::with_prefix("FRTEST_");
                let _ = parser.optional_id_list("PROPTEST_RAW");
                cleanup_env(&[var]);
            }
        }
    }
}
