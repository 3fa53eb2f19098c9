//! Growth-kinetics calculations.
//!
//! Pure functions over cell counts, densities and timestamps:
//! - population doublings (generation) from seed and harvest counts
//! - doubling time from elapsed time and population doublings
//! - cumulative population doublings across a lineage
//! - measured growth parameters from two observed densities

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{KineticsError, KineticsResult};

/// Naive timestamp layouts accepted in addition to RFC 3339.
const NAIVE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"];

/// Growth past this multiple of the start density suggests the culture is far from its limit.
const HIGH_GROWTH_RATIO: f64 = 1.5;
const HIGH_GROWTH_LIMIT_FACTOR: f64 = 2.0;
const LOW_GROWTH_LIMIT_FACTOR: f64 = 1.2;

/// Growth parameters derived from two density observations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MeasuredParameters {
    /// Exponential growth rate per hour.
    pub growth_rate: Option<f64>,
    /// Hours for the population to double at `growth_rate`.
    pub doubling_time: Option<f64>,
    /// Heuristic estimate of the density ceiling, not a fitted logistic model.
    pub density_limit: Option<f64>,
}

impl MeasuredParameters {
    /// True when no parameter could be derived.
    pub fn is_empty(&self) -> bool {
        self.growth_rate.is_none() && self.doubling_time.is_none() && self.density_limit.is_none()
    }
}

/// Population doublings between seeding and harvest: `log2(harvest / seed)`.
pub fn calc_generation(seed_count: f64, harvest_count: f64) -> KineticsResult<f64> {
    if seed_count <= 0.0 || harvest_count <= 0.0 {
        return Err(KineticsError::NonPositiveCount {
            seed_count,
            harvest_count,
        });
    }
    Ok((harvest_count / seed_count).log2())
}

/// Population doublings offset by the parent's generation, when one is known.
pub fn calc_generation_with_parent(
    seed_count: f64,
    harvest_count: f64,
    parent_generation: Option<f64>,
) -> KineticsResult<f64> {
    let pd = calc_generation(seed_count, harvest_count)?;
    Ok(match parent_generation {
        Some(parent) => parent + pd,
        None => pd,
    })
}

/// Hours per population doubling. Undefined for non-growing populations.
pub fn calc_doubling_time_hours(start: DateTime<Utc>, end: DateTime<Utc>, pd: f64) -> Option<f64> {
    if pd <= 0.0 {
        return None;
    }
    Some(elapsed_hours(start, end) / pd)
}

/// Cumulative population doublings including ancestors.
pub fn calc_cumulative_pd(current_pd: Option<f64>, parent_pd: Option<f64>) -> Option<f64> {
    let current = current_pd?;
    Some(current + parent_pd.unwrap_or(0.0))
}

/// Estimate growth rate, doubling time and density limit from two observations.
///
/// Returns all-`None` when the interval is not increasing, a density is not
/// positive, or the population shrank (decay is not modeled).
pub fn calculate_measured_parameters(
    start_density: f64,
    end_density: f64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> MeasuredParameters {
    if end_time <= start_time || start_density <= 0.0 || end_density <= 0.0 {
        return MeasuredParameters::default();
    }
    if end_density < start_density {
        return MeasuredParameters::default();
    }

    let hours = elapsed_hours(start_time, end_time);
    let growth_rate = (end_density / start_density).ln() / hours;
    let doubling_time = (growth_rate > 0.0).then(|| std::f64::consts::LN_2 / growth_rate);

    let factor = if end_density > start_density * HIGH_GROWTH_RATIO {
        HIGH_GROWTH_LIMIT_FACTOR
    } else {
        LOW_GROWTH_LIMIT_FACTOR
    };

    MeasuredParameters {
        growth_rate: Some(growth_rate),
        doubling_time,
        density_limit: Some(end_density * factor),
    }
}

/// Like [`calculate_measured_parameters`], but reports why nothing could be derived.
pub fn try_calculate_measured_parameters(
    start_density: f64,
    end_density: f64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
) -> KineticsResult<MeasuredParameters> {
    if start_density <= 0.0 || end_density <= 0.0 {
        return Err(KineticsError::NonPositiveDensity {
            start: start_density,
            end: end_density,
        });
    }
    if end_time <= start_time {
        return Err(KineticsError::NonIncreasingTime);
    }
    Ok(calculate_measured_parameters(
        start_density,
        end_density,
        start_time,
        end_time,
    ))
}

/// Real-valued hours between two instants; negative when `end` precedes `start`.
pub fn elapsed_hours(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 3_600_000.0
}

/// Parse an RFC 3339 timestamp, or a naive `YYYY-MM-DDTHH:MM[:SS[.f]]` one taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_calc_generation() {
        assert_eq!(calc_generation(1.0, 8.0).unwrap(), 3.0);
        assert_eq!(calc_generation(1.0, 2.0).unwrap(), 1.0);
        assert_eq!(calc_generation(2.0, 8.0).unwrap(), 2.0);
    }

    #[test]
    fn test_calc_generation_invalid_input() {
        assert!(calc_generation(0.0, 1.0).is_err());
        assert!(calc_generation(1.0, 0.0).is_err());
        assert!(calc_generation(-1.0, 1.0).is_err());
        assert!(calc_generation(1.0, -1.0).is_err());
        assert_eq!(
            calc_generation(0.0, 4.0),
            Err(KineticsError::NonPositiveCount {
                seed_count: 0.0,
                harvest_count: 4.0
            })
        );
    }

    #[test]
    fn test_calc_generation_shrinking_population_is_negative() {
        assert_eq!(calc_generation(8.0, 2.0).unwrap(), -2.0);
    }

    #[test]
    fn test_calc_generation_with_parent() {
        assert_eq!(calc_generation_with_parent(1.0, 8.0, None).unwrap(), 3.0);
        assert_eq!(calc_generation_with_parent(1.0, 8.0, Some(4.5)).unwrap(), 7.5);
        assert!(calc_generation_with_parent(0.0, 8.0, Some(1.0)).is_err());
    }

    #[test]
    fn test_calc_doubling_time_hours() {
        let start = t0();
        let end = start + Duration::hours(48);
        assert_eq!(calc_doubling_time_hours(start, end, 2.0), Some(24.0));
    }

    #[test]
    fn test_calc_doubling_time_keeps_fractional_hours() {
        let start = t0();
        let end = start + Duration::minutes(90);
        assert_eq!(calc_doubling_time_hours(start, end, 1.0), Some(1.5));
    }

    #[test]
    fn test_calc_doubling_time_none_for_non_positive_pd() {
        let start = t0();
        let end = start + Duration::hours(24);
        assert_eq!(calc_doubling_time_hours(start, end, 0.0), None);
        assert_eq!(calc_doubling_time_hours(start, end, -1.0), None);
        assert_eq!(calc_doubling_time_hours(end, start, 0.0), None);
    }

    #[test]
    fn test_calc_cumulative_pd() {
        assert_eq!(calc_cumulative_pd(None, Some(3.0)), None);
        assert_eq!(calc_cumulative_pd(None, None), None);
        assert_eq!(calc_cumulative_pd(Some(2.5), None), Some(2.5));
        assert_eq!(calc_cumulative_pd(Some(2.5), Some(4.0)), Some(6.5));
    }

    #[test]
    fn test_measured_parameters_no_growth() {
        let start = t0();
        let end = start + Duration::hours(12);
        let result = calculate_measured_parameters(1e6, 1e6, start, end);
        assert_eq!(result.growth_rate, Some(0.0));
        assert_eq!(result.doubling_time, None);
        assert!(approx(result.density_limit.unwrap(), 1.2e6));
    }

    #[test]
    fn test_measured_parameters_doubling() {
        let start = t0();
        let end = start + Duration::hours(24);
        let result = calculate_measured_parameters(1e5, 4e5, start, end);

        let rate = result.growth_rate.unwrap();
        assert!(approx(rate, 4.0_f64.ln() / 24.0));
        assert!(approx(result.doubling_time.unwrap(), 12.0));
        assert!(approx(result.density_limit.unwrap(), 8e5));
    }

    #[test]
    fn test_measured_parameters_modest_growth_uses_low_factor() {
        let start = t0();
        let end = start + Duration::hours(10);
        let result = calculate_measured_parameters(1e6, 1.4e6, start, end);
        assert!(approx(result.density_limit.unwrap(), 1.4e6 * 1.2));
    }

    #[test]
    fn test_measured_parameters_decay_is_unmodeled() {
        let start = t0();
        let end = start + Duration::hours(10);
        let result = calculate_measured_parameters(2e6, 1e6, start, end);
        assert!(result.is_empty());
    }

    #[test]
    fn test_measured_parameters_invalid_inputs() {
        let start = t0();
        let end = start + Duration::hours(10);
        assert!(calculate_measured_parameters(1e6, 2e6, end, start).is_empty());
        assert!(calculate_measured_parameters(1e6, 2e6, start, start).is_empty());
        assert!(calculate_measured_parameters(0.0, 2e6, start, end).is_empty());
        assert!(calculate_measured_parameters(1e6, -1.0, start, end).is_empty());
    }

    #[test]
    fn test_try_calculate_reports_reason() {
        let start = t0();
        let end = start + Duration::hours(10);
        assert_eq!(
            try_calculate_measured_parameters(1e6, 2e6, end, start),
            Err(KineticsError::NonIncreasingTime)
        );
        assert!(matches!(
            try_calculate_measured_parameters(0.0, 2e6, start, end),
            Err(KineticsError::NonPositiveDensity { .. })
        ));
        let decayed = try_calculate_measured_parameters(2e6, 1e6, start, end).unwrap();
        assert!(decayed.is_empty());
    }

    #[test]
    fn test_elapsed_hours() {
        let start = t0();
        assert_eq!(elapsed_hours(start, start + Duration::minutes(45)), 0.75);
        assert_eq!(elapsed_hours(start + Duration::hours(2), start), -2.0);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T09:30"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T09:30:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T09:30:00Z"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T11:30:00+02:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-03-01T09:30:00.000"), Some(expected));
        assert_eq!(parse_timestamp("yesterday"), None);
    }
}
