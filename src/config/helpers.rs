use std::fmt::Display;
use std::str::FromStr;

use crate::error::ConfigError;

/// Variable lookup. The process environment in production, a map in tests.
pub(crate) type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub(crate) fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Read an optional variable. Blank values count as unset.
pub(crate) fn optional_env(lookup: Lookup<'_>, key: &str) -> Option<String> {
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn required_env(lookup: Lookup<'_>, key: &str, hint: &str) -> Result<String, ConfigError> {
    optional_env(lookup, key).ok_or_else(|| ConfigError::MissingRequired {
        key: key.to_string(),
        hint: hint.to_string(),
    })
}

/// Parse an optional variable, falling back to `default` when unset.
pub(crate) fn parse_optional_env<T>(lookup: Lookup<'_>, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    optional_env(lookup, key)
        .map(|s| s.parse::<T>())
        .transpose()
        .map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: e.to_string(),
        })
        .map(|v| v.unwrap_or(default))
}

pub(crate) fn parse_bool_env(lookup: Lookup<'_>, key: &str, default: bool) -> Result<bool, ConfigError> {
    match optional_env(lookup, key) {
        None => Ok(default),
        Some(v) => match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Ok(true),
            "false" | "0" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("must be 'true' or 'false', got '{v}'"),
            }),
        },
    }
}

/// Parse a positive number of seconds.
pub(crate) fn parse_secs_env(lookup: Lookup<'_>, key: &str, default: u64) -> Result<u64, ConfigError> {
    let secs = parse_optional_env(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".to_string(),
        });
    }
    Ok(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &'static [(&'static str, &'static str)]) -> impl Fn(&str) -> Option<String> {
        move |key: &str| {
            pairs
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string())
        }
    }

    #[test]
    fn test_blank_is_unset() {
        let lookup = env(&[("A", "  ")]);
        assert_eq!(optional_env(&lookup, "A"), None);
        assert!(matches!(
            required_env(&lookup, "A", "set it"),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_parse_optional_env() {
        let lookup = env(&[("N", "42"), ("BAD", "forty")]);
        assert_eq!(parse_optional_env(&lookup, "N", 7u64).unwrap(), 42);
        assert_eq!(parse_optional_env(&lookup, "MISSING", 7u64).unwrap(), 7);
        let err = parse_optional_env(&lookup, "BAD", 7u64).unwrap_err();
        assert!(err.to_string().contains("BAD"));
    }

    #[test]
    fn test_parse_bool_env() {
        let lookup = env(&[("Y", "TRUE"), ("N", "0"), ("X", "maybe")]);
        assert!(parse_bool_env(&lookup, "Y", false).unwrap());
        assert!(!parse_bool_env(&lookup, "N", true).unwrap());
        assert!(parse_bool_env(&lookup, "UNSET", true).unwrap());
        assert!(parse_bool_env(&lookup, "X", true).is_err());
    }

    #[test]
    fn test_zero_seconds_rejected() {
        let lookup = env(&[("T", "0")]);
        assert!(parse_secs_env(&lookup, "T", 60).is_err());
        assert_eq!(parse_secs_env(&lookup, "U", 60).unwrap(), 60);
    }
}
