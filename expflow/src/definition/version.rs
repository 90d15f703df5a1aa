//! Parameter versions.

use crate::errors::ConfigurationError;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Placeholder for a missing training date.
pub const NO_TRAIN_DATE: &str = "NA";

/// Discriminates the artifact directory of one (cutoff, hyperparameter) run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterVersion(String);

impl ParameterVersion {
    /// `last_train_date_<date|NA>-last_test_date_<date>`.
    #[must_use]
    pub fn for_window(last_train_date: Option<NaiveDate>, test_date: NaiveDate) -> Self {
        let train = last_train_date.map_or_else(|| NO_TRAIN_DATE.to_string(), |d| d.format("%Y-%m-%d").to_string());
        Self(format!("last_train_date_{train}-last_test_date_{}", test_date.format("%Y-%m-%d")))
    }

    /// Uses a caller-chosen version.
    pub fn explicit(version: impl Into<String>) -> Result<Self, ConfigurationError> {
        let version = version.into();
        let valid = !version.is_empty()
            && version
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
        if valid && version != "." && version != ".." {
            Ok(Self(version))
        } else {
            Err(ConfigurationError::new(format!(
                "Parameter version '{version}' must be a single path component of [A-Za-z0-9_.-]"
            )))
        }
    }

    /// The version string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParameterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ParameterVersion {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
    }

    #[test]
    fn test_window_format() {
        let v = ParameterVersion::for_window(Some(date("2022-09-02")), date("2022-09-03"));
        assert_eq!(v.as_str(), "last_train_date_2022-09-02-last_test_date_2022-09-03");
        let v = ParameterVersion::for_window(None, date("2022-09-03"));
        assert_eq!(v.to_string(), "last_train_date_NA-last_test_date_2022-09-03");
    }

    #[test]
    fn test_explicit_must_be_path_component() {
        assert!(ParameterVersion::explicit("prod-2024.1").is_ok());
        assert!(ParameterVersion::explicit("a/b").is_err());
        assert!(ParameterVersion::explicit("..").is_err());
        assert!(ParameterVersion::explicit("").is_err());
    }
}
