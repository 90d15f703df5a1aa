//! Backtest cutoffs and the train/test windows they imply.

use crate::definition::ParameterVersion;
use crate::errors::ConfigurationError;
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};

/// Format of every date in paths and parameter versions.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parses a `YYYY-MM-DD` date.
pub fn parse_date(text: &str) -> Result<NaiveDate, ConfigurationError> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .map_err(|e| ConfigurationError::new(format!("Invalid date '{text}': {e}")))
}

fn shift(date: NaiveDate, days: i64) -> Result<NaiveDate, ConfigurationError> {
    let magnitude = Days::new(days.unsigned_abs());
    let shifted = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    shifted.ok_or_else(|| ConfigurationError::new(format!("Date {date} shifted by {days} days is out of range")))
}

/// The training and test dates of one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CutoffWindow {
    /// Last day of training data, `None` for untrained algorithms.
    pub last_training_date: Option<NaiveDate>,
    /// Day whose data is used for testing.
    pub test_date: NaiveDate,
}

impl CutoffWindow {
    /// Window for `cutoff`, testing `test_lag_days` later.
    pub fn for_cutoff(cutoff: NaiveDate, test_lag_days: u32, trained: bool) -> Result<Self, ConfigurationError> {
        Ok(Self {
            last_training_date: trained.then_some(cutoff),
            test_date: shift(cutoff, i64::from(test_lag_days))?,
        })
    }

    /// Parameter version naming this window.
    #[must_use]
    pub fn parameter_version(&self) -> ParameterVersion {
        ParameterVersion::for_window(self.last_training_date, self.test_date)
    }
}

/// Daily partitions `[end - days + 1, end]`, oldest first.
pub fn training_dates(end: NaiveDate, days: u32) -> Result<Vec<NaiveDate>, ConfigurationError> {
    if days == 0 {
        return Err(ConfigurationError::new("training_days must be at least 1").with_key("training_days"));
    }
    (0..i64::from(days)).rev().map(|back| shift(end, -back)).collect()
}

/// A series of backtest cutoffs ending at `last_cutoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BacktestPlan {
    /// Most recent cutoff.
    pub last_cutoff: NaiveDate,
    /// Number of cutoffs.
    pub number_of_runs: u32,
    /// Days between consecutive cutoffs.
    #[serde(default = "default_step_days")]
    pub step_days: u32,
}

fn default_step_days() -> u32 {
    1
}

impl BacktestPlan {
    /// Creates a daily plan.
    #[must_use]
    pub const fn daily(last_cutoff: NaiveDate, number_of_runs: u32) -> Self {
        Self {
            last_cutoff,
            number_of_runs,
            step_days: 1,
        }
    }

    /// Sets the spacing between cutoffs.
    #[must_use]
    pub const fn with_step_days(mut self, step_days: u32) -> Self {
        self.step_days = step_days;
        self
    }

    /// Cutoffs, most recent first.
    pub fn cutoffs(&self) -> Result<Vec<NaiveDate>, ConfigurationError> {
        if self.number_of_runs == 0 || self.step_days == 0 {
            return Err(ConfigurationError::new("A backtest needs at least one run and a positive step"));
        }
        (0..i64::from(self.number_of_runs))
            .map(|i| shift(self.last_cutoff, -i * i64::from(self.step_days)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn d(s: &str) -> NaiveDate {
        parse_date(s).unwrap()
    }

    #[test]
    fn test_window_for_cutoff() {
        let w = CutoffWindow::for_cutoff(d("2022-09-02"), 1, true).unwrap();
        assert_eq!(w.test_date, d("2022-09-03"));
        assert_eq!(
            w.parameter_version().as_str(),
            "last_train_date_2022-09-02-last_test_date_2022-09-03"
        );
        let w = CutoffWindow::for_cutoff(d("2022-09-02"), 3, false).unwrap();
        assert_eq!(w.parameter_version().as_str(), "last_train_date_NA-last_test_date_2022-09-05");
    }

    #[test]
    fn test_training_dates() {
        assert_eq!(
            training_dates(d("2022-03-01"), 3).unwrap(),
            vec![d("2022-02-27"), d("2022-02-28"), d("2022-03-01")]
        );
        assert!(training_dates(d("2022-03-01"), 0).is_err());
    }

    #[test]
    fn test_backtest_cutoffs() {
        let plan = BacktestPlan::daily(d("2022-01-03"), 3);
        assert_eq!(plan.cutoffs().unwrap(), vec![d("2022-01-03"), d("2022-01-02"), d("2022-01-01")]);
        let weekly = plan.with_step_days(7);
        assert_eq!(weekly.cutoffs().unwrap()[2], d("2021-12-20"));
        assert!(BacktestPlan::daily(d("2022-01-03"), 0).cutoffs().is_err());
    }

    #[test]
    fn test_parse_date_rejects_garbage() {
        assert!(parse_date("2022-13-01").is_err());
        assert!(parse_date("yesterday").is_err());
    }
}
