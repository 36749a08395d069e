use chrono::{Duration, NaiveDateTime};

use crate::model::features::FeatureRow;
use crate::model::patient::Sex;
use crate::storage::store::HistoryRow;

const SECONDS_PER_DAY: f64 = 86_400.0;

/// History no older than this (in days, against the most recent prior test)
/// anchors the ratio on the minimum over the patient's history.
const RECENT_WINDOW_DAYS: f64 = 7.0;

/// History up to this old anchors the ratio on the median instead.
const MEDIUM_WINDOW_DAYS: f64 = 365.0;

/// Creatinine ratios against recent (RV1) or medium-term (RV2) history.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceValues {
    pub c1: f64,
    pub rv1: f64,
    pub rv1_ratio: f64,
    pub rv2: f64,
    pub rv2_ratio: f64,
}

/// Computes C1/RV1/RV2 and their ratios for an incoming result against the
/// patient's prior history. The incoming result itself is not part of
/// `history`. With no prior tests only C1 is carried; with the most recent
/// prior test over a year old every value is zeroed.
pub fn reference_values(
    c1: f64,
    observed_at: NaiveDateTime,
    history: &[HistoryRow],
) -> ReferenceValues {
    let Some(latest) = history.last() else {
        return ReferenceValues {
            c1,
            rv1: 0.0,
            rv1_ratio: 0.0,
            rv2: 0.0,
            rv2_ratio: 0.0,
        };
    };

    let diff_days = (latest.date - observed_at).num_seconds().abs() as f64 / SECONDS_PER_DAY;
    if diff_days <= RECENT_WINDOW_DAYS {
        let rv1 = history
            .iter()
            .map(|row| row.result)
            .fold(f64::INFINITY, f64::min);
        ReferenceValues {
            c1,
            rv1,
            rv1_ratio: c1 / rv1,
            rv2: 0.0,
            rv2_ratio: 0.0,
        }
    } else if diff_days <= MEDIUM_WINDOW_DAYS {
        let rv2 = median(history.iter().map(|row| row.result).collect());
        ReferenceValues {
            c1,
            rv1: 0.0,
            rv1_ratio: 0.0,
            rv2,
            rv2_ratio: c1 / rv2,
        }
    } else {
        ReferenceValues {
            c1: 0.0,
            rv1: 0.0,
            rv1_ratio: 0.0,
            rv2: 0.0,
            rv2_ratio: 0.0,
        }
    }
}

/// D (difference against the lowest result at least 48 hours old) and the
/// change-within-48h flag (more than one such prior result).
pub fn d_value(c1: f64, observed_at: NaiveDateTime, history: &[HistoryRow]) -> (f64, bool) {
    let cutoff = observed_at - Duration::hours(48);
    let prior: Vec<f64> = history
        .iter()
        .filter(|row| row.date <= cutoff)
        .map(|row| row.result)
        .collect();
    let change = prior.len() > 1;
    if prior.is_empty() {
        return (0.0, false);
    }
    let minimum = prior.iter().copied().fold(f64::INFINITY, f64::min);
    (c1 - minimum, change)
}

/// Assembles the full feature row for one incoming result.
pub fn feature_row(
    age: i64,
    sex: Sex,
    c1: f64,
    observed_at: NaiveDateTime,
    history: &[HistoryRow],
) -> FeatureRow {
    let reference = reference_values(c1, observed_at, history);
    let (d, change_within_48h) = d_value(c1, observed_at, history);
    FeatureRow {
        age,
        sex,
        c1: reference.c1,
        rv1: reference.rv1,
        rv1_ratio: reference.rv1_ratio,
        rv2: reference.rv2,
        rv2_ratio: reference.rv2_ratio,
        change_within_48h,
        d,
    }
}

/// Median of the values; an even count averages the two middle values.
pub(crate) fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

// ============================================================================
// UNIT TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_result::parse_timestamp;

    fn history(entries: &[(&str, f64)]) -> Vec<HistoryRow> {
        entries
            .iter()
            .map(|(date, result)| HistoryRow {
                mrn: "31251122".to_string(),
                age: 42,
                sex: Sex::Male,
                date: parse_timestamp(date).unwrap(),
                result: *result,
            })
            .collect()
    }

    fn at(date: &str) -> chrono::NaiveDateTime {
        parse_timestamp(date).unwrap()
    }

    #[test]
    fn test_recent_history_uses_the_minimum() {
        let history = history(&[("2024-01-01 00:00:00", 80.0), ("2024-01-05 00:00:00", 90.0)]);
        let reference = reference_values(120.0, at("2024-01-07 00:00:00"), &history);
        assert_eq!(reference.c1, 120.0);
        assert_eq!(reference.rv1, 80.0);
        assert_eq!(reference.rv1_ratio, 1.5);
        assert_eq!(reference.rv2, 0.0);
        assert_eq!(reference.rv2_ratio, 0.0);
    }

    #[test]
    fn test_exactly_seven_days_still_counts_as_recent() {
        let history = history(&[("2024-01-01 00:00:00", 80.0)]);
        let reference = reference_values(100.0, at("2024-01-08 00:00:00"), &history);
        assert_eq!(reference.rv1, 80.0);
        assert_eq!(reference.rv2, 0.0);
    }

    #[test]
    fn test_medium_history_uses_the_median() {
        let history = history(&[
            ("2024-01-01 00:00:00", 70.0),
            ("2024-01-02 00:00:00", 80.0),
            ("2024-01-03 00:00:00", 90.0),
        ]);
        let reference = reference_values(120.0, at("2024-03-01 00:00:00"), &history);
        assert_eq!(reference.c1, 120.0);
        assert_eq!(reference.rv1, 0.0);
        assert_eq!(reference.rv1_ratio, 0.0);
        assert_eq!(reference.rv2, 80.0);
        assert_eq!(reference.rv2_ratio, 1.5);
    }

    #[test]
    fn test_exactly_a_year_still_counts_as_medium() {
        let history = history(&[("2023-03-01 00:00:00", 80.0)]);
        let reference = reference_values(100.0, at("2024-02-29 00:00:00"), &history);
        assert_eq!(reference.rv2, 80.0);
        assert_eq!(reference.rv2_ratio, 1.25);
    }

    #[test]
    fn test_history_older_than_a_year_zeroes_everything() {
        let history = history(&[("2022-01-01 00:00:00", 80.0)]);
        let reference = reference_values(100.0, at("2024-01-01 00:00:00"), &history);
        assert_eq!(
            reference,
            ReferenceValues {
                c1: 0.0,
                rv1: 0.0,
                rv1_ratio: 0.0,
                rv2: 0.0,
                rv2_ratio: 0.0,
            }
        );
    }

    #[test]
    fn test_d_against_minimum_prior_value() {
        // Results at d1-72h and d1-60h; both are at least 48h old.
        let history = history(&[("2024-01-01 00:00:00", 70.0), ("2024-01-01 12:00:00", 75.0)]);
        let (d, change) = d_value(100.0, at("2024-01-04 00:00:00"), &history);
        assert_eq!(d, 30.0);
        assert!(change);
    }

    #[test]
    fn test_single_prior_result_means_no_change() {
        let history = history(&[("2024-01-01 00:00:00", 70.0)]);
        let (d, change) = d_value(100.0, at("2024-01-04 00:00:00"), &history);
        assert_eq!(d, 30.0);
        assert!(!change);
    }

    #[test]
    fn test_no_prior_results_within_window() {
        // The only test is more recent than 48h before the incoming one.
        let history = history(&[("2024-01-03 12:00:00", 70.0)]);
        let (d, change) = d_value(100.0, at("2024-01-04 00:00:00"), &history);
        assert_eq!(d, 0.0);
        assert!(!change);
    }

    #[test]
    fn test_boundary_at_exactly_48_hours_is_included() {
        let history = history(&[("2024-01-02 00:00:00", 70.0)]);
        let (d, change) = d_value(100.0, at("2024-01-04 00:00:00"), &history);
        assert_eq!(d, 30.0);
        assert!(!change);
    }

    #[test]
    fn test_no_history_feature_row_only_carries_c1() {
        let row = feature_row(35, Sex::Female, 103.5, at("2024-09-24 15:36:00"), &[]);
        assert_eq!(row.c1, 103.5);
        assert_eq!(row.rv1, 0.0);
        assert_eq!(row.rv1_ratio, 0.0);
        assert_eq!(row.rv2, 0.0);
        assert_eq!(row.rv2_ratio, 0.0);
        assert_eq!(row.d, 0.0);
        assert!(!row.change_within_48h);
    }

    #[test]
    fn test_median_handles_even_and_odd_counts() {
        assert_eq!(median(vec![3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(vec![4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(vec![5.0]), 5.0);
    }
}
