//! Currency and ratio derivations for cached metrics.
//!
//! Costs travel as integer micros until they are persisted; every value
//! written to the cache goes through here and comes out as a scale-2
//! `BigDecimal`. Rounding is half away from zero.

use bigdecimal::BigDecimal;
use chrono::{Duration, NaiveDate};

use crate::google_ads_models::Metrics;

const MICROS_PER_CENT: i64 = 10_000;

/// Length of the metrics window, in days.
pub const METRICS_WINDOW_DAYS: i64 = 30;

/// Integer division rounded half away from zero. `d` must be positive.
fn round_div(n: i64, d: i64) -> i64 {
    let q = n / d;
    let r = n % d;
    if r.abs() >= d - r.abs() {
        q + n.signum()
    } else {
        q
    }
}

/// `cents / 100` with exactly two fractional digits.
pub fn cents_to_decimal(cents: i64) -> BigDecimal {
    (BigDecimal::from(cents) / BigDecimal::from(100)).with_scale(2)
}

pub fn zero() -> BigDecimal {
    cents_to_decimal(0)
}

/// Micros to currency units, rounded to cents.
pub fn micros_to_currency(micros: i64) -> BigDecimal {
    cents_to_decimal(round_div(micros, MICROS_PER_CENT))
}

/// Rounds a float (conversions) to two decimals.
pub fn round2(value: f64) -> BigDecimal {
    if !value.is_finite() {
        return zero();
    }
    cents_to_decimal((value * 100.0).round() as i64)
}

/// Click-through rate in percent; zero when there are no impressions.
pub fn ctr(clicks: i64, impressions: i64) -> BigDecimal {
    if impressions <= 0 {
        return zero();
    }
    cents_to_decimal(round_div(clicks.saturating_mul(10_000), impressions))
}

/// Average cost per click in currency units; zero when there are no clicks.
pub fn avg_cpc(cost_micros: i64, clicks: i64) -> BigDecimal {
    if clicks <= 0 {
        return zero();
    }
    cents_to_decimal(round_div(
        cost_micros,
        clicks.saturating_mul(MICROS_PER_CENT),
    ))
}

/// Whole-number percentage of `part` in `whole`; zero when `whole` is not positive.
pub fn percent(part: i64, whole: i64) -> i32 {
    if whole <= 0 {
        return 0;
    }
    round_div(part.saturating_mul(100), whole).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

/// Persistable figures derived from raw metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetrics {
    pub cost: BigDecimal,
    pub conversions: BigDecimal,
    pub ctr: BigDecimal,
    pub avg_cpc: BigDecimal,
}

impl DerivedMetrics {
    pub fn from_metrics(m: &Metrics) -> Self {
        Self {
            cost: micros_to_currency(m.cost_micros),
            conversions: round2(m.conversions),
            ctr: ctr(m.clicks, m.impressions),
            avg_cpc: avg_cpc(m.cost_micros, m.clicks),
        }
    }
}

/// Inclusive date range queried for metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl MetricsWindow {
    /// The `METRICS_WINDOW_DAYS` days ending on `today`.
    pub fn ending_on(today: NaiveDate) -> Self {
        Self {
            start: today - Duration::days(METRICS_WINDOW_DAYS),
            end: today,
        }
    }

    /// Campaign-level metrics query restricted to this window.
    pub fn campaign_metrics_query(&self) -> String {
        format!(
            "SELECT metrics.clicks, metrics.impressions, metrics.cost_micros, metrics.conversions \
             FROM campaign \
             WHERE segments.date BETWEEN '{}' AND '{}'",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }
}
