//! Demand forecasting: diurnal/weekly pattern detection blended with
//! exponential smoothing. CPU-bound; callers run it off the critical
//! path.

use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};

use warden_model::UsageRecord;

mod history;

pub use history::{InMemoryUsageHistory, RedisUsageHistory, UsageHistory};

/// Default smoothing factor for the level update `L <- a*x + (1-a)*L`.
pub const DEFAULT_ALPHA: f64 = 0.3;

/// Pattern confidence is capped here; even a perfect fit on a short
/// window is not certainty.
pub const MAX_CONFIDENCE: f64 = 0.95;

/// One step of a demand forecast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    pub at: DateTime<Utc>,
    pub demand: f64,
    pub lower: f64,
    pub upper: f64,
    pub confidence: f64,
}

/// Anything that can produce a demand curve for a coming window.
pub trait DemandForecaster: Send + Sync {
    fn forecast(&self, start: DateTime<Utc>, step: Duration, steps: usize) -> Vec<Prediction>;
}

/// Mean demand per hour-of-day and day-of-week, with an overall baseline
/// and a fit-quality summary.
#[derive(Debug, Clone, PartialEq)]
pub struct DemandPattern {
    pub hourly: [f64; 24],
    pub daily: [f64; 7],
    pub baseline: f64,
    /// In [0, 0.95], derived from the MSE of observations against the
    /// bucket means.
    pub confidence: f64,
    /// Population standard deviation of demand over the training window.
    pub sigma: f64,
}

impl Default for DemandPattern {
    fn default() -> Self {
        Self {
            hourly: [0.0; 24],
            daily: [0.0; 7],
            baseline: 0.0,
            confidence: 0.0,
            sigma: 0.0,
        }
    }
}

/// Computes bucket means over a usage history.
#[derive(Debug, Default)]
pub struct PatternDetector;

impl PatternDetector {
    pub fn train(&self, records: &[UsageRecord]) -> DemandPattern {
        if records.is_empty() {
            return DemandPattern::default();
        }

        let n = records.len() as f64;
        let baseline = records.iter().map(|r| r.demand()).sum::<f64>() / n;

        let mut hourly_sum = [0.0; 24];
        let mut hourly_count = [0usize; 24];
        let mut daily_sum = [0.0; 7];
        let mut daily_count = [0usize; 7];
        for record in records {
            let hour = record.timestamp.hour() as usize;
            let weekday = record.timestamp.weekday().num_days_from_monday() as usize;
            hourly_sum[hour] += record.demand();
            hourly_count[hour] += 1;
            daily_sum[weekday] += record.demand();
            daily_count[weekday] += 1;
        }

        let mut hourly = [0.0; 24];
        for (bucket, (sum, count)) in hourly.iter_mut().zip(hourly_sum.iter().zip(hourly_count)) {
            *bucket = if count > 0 { sum / count as f64 } else { baseline };
        }
        let mut daily = [0.0; 7];
        for (bucket, (sum, count)) in daily.iter_mut().zip(daily_sum.iter().zip(daily_count)) {
            *bucket = if count > 0 { sum / count as f64 } else { baseline };
        }

        let variance = records
            .iter()
            .map(|r| (r.demand() - baseline).powi(2))
            .sum::<f64>()
            / n;
        let mse = records
            .iter()
            .map(|r| {
                let hour = r.timestamp.hour() as usize;
                (r.demand() - hourly[hour]).powi(2)
            })
            .sum::<f64>()
            / n;

        let confidence = if variance > 0.0 {
            (1.0 - mse / variance).clamp(0.0, MAX_CONFIDENCE)
        } else {
            // Flat history: the buckets reproduce it exactly.
            MAX_CONFIDENCE
        };

        DemandPattern {
            hourly,
            daily,
            baseline,
            confidence,
            sigma: variance.sqrt(),
        }
    }
}

/// Single-level exponential smoothing.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialSmoother {
    alpha: f64,
    level: Option<f64>,
}

impl Default for ExponentialSmoother {
    fn default() -> Self {
        Self::new(DEFAULT_ALPHA)
    }
}

impl ExponentialSmoother {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, level: None }
    }

    pub fn observe(&mut self, x: f64) {
        self.level = Some(match self.level {
            Some(level) => self.alpha * x + (1.0 - self.alpha) * level,
            None => x,
        });
    }

    pub fn level(&self) -> f64 {
        self.level.unwrap_or(0.0)
    }
}

/// Blends the bucket pattern with the smoothed level:
/// `pattern(t) = 0.7*hourly + 0.3*daily` (baseline fallback when the
/// pattern value drops under half the baseline), then
/// `combined = 0.6*pattern + 0.4*level`, with a `±2σ` interval clamped
/// at zero below.
#[derive(Debug, Clone)]
pub struct HybridForecaster {
    pattern: DemandPattern,
    level: f64,
}

impl HybridForecaster {
    pub fn train(records: &[UsageRecord]) -> Self {
        Self::train_with_alpha(records, DEFAULT_ALPHA)
    }

    pub fn train_with_alpha(records: &[UsageRecord], alpha: f64) -> Self {
        let pattern = PatternDetector.train(records);
        let mut smoother = ExponentialSmoother::new(alpha);
        for record in records {
            smoother.observe(record.demand());
        }
        Self {
            pattern,
            level: smoother.level(),
        }
    }

    pub fn pattern(&self) -> &DemandPattern {
        &self.pattern
    }
}

impl DemandForecaster for HybridForecaster {
    fn forecast(&self, start: DateTime<Utc>, step: Duration, steps: usize) -> Vec<Prediction> {
        let step = chrono::Duration::from_std(step).unwrap_or_else(|_| chrono::Duration::hours(1));
        (0..steps)
            .map(|i| {
                let at = start + step * i as i32;
                let hour = at.hour() as usize;
                let weekday = at.weekday().num_days_from_monday() as usize;

                let mut pattern =
                    0.7 * self.pattern.hourly[hour] + 0.3 * self.pattern.daily[weekday];
                if pattern < self.pattern.baseline / 2.0 {
                    pattern = self.pattern.baseline;
                }
                let demand = 0.6 * pattern + 0.4 * self.level;

                Prediction {
                    at,
                    demand,
                    lower: (demand - 2.0 * self.pattern.sigma).max(0.0),
                    upper: demand + 2.0 * self.pattern.sigma,
                    confidence: self.pattern.confidence,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    /// Seven days of hourly samples: quiet at 10 sandboxes, a recurring
    /// 100-sandbox spike at 14:00.
    fn spiky_week(start: DateTime<Utc>) -> Vec<UsageRecord> {
        let mut records = Vec::new();
        for day in 0..7 {
            for hour in 0..24 {
                let at = start + chrono::Duration::hours(day * 24 + hour);
                let demand = if at.hour() == 14 { 100 } else { 10 };
                records.push(UsageRecord::at(at, demand));
            }
        }
        records
    }

    fn monday_midnight() -> DateTime<Utc> {
        // 2026-03-02 is a Monday.
        Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap()
    }

    #[test]
    fn detector_finds_the_hourly_spike() {
        let pattern = PatternDetector.train(&spiky_week(monday_midnight()));
        assert!((pattern.hourly[14] - 100.0).abs() < f64::EPSILON);
        assert!((pattern.hourly[3] - 10.0).abs() < f64::EPSILON);
        // 23 quiet hours at 10 + one at 100.
        let expected_baseline = (23.0 * 10.0 + 100.0) / 24.0;
        assert!((pattern.baseline - expected_baseline).abs() < 1e-9);
        // The hourly buckets explain the spike perfectly.
        assert!(pattern.confidence > 0.9);
    }

    #[test]
    fn flat_history_has_max_confidence_and_zero_sigma() {
        let records: Vec<UsageRecord> = (0..48)
            .map(|i| {
                UsageRecord::at(monday_midnight() + chrono::Duration::hours(i), 5)
            })
            .collect();
        let pattern = PatternDetector.train(&records);
        assert_eq!(pattern.confidence, MAX_CONFIDENCE);
        assert_eq!(pattern.sigma, 0.0);
    }

    #[test]
    fn empty_history_trains_to_zero()  {
        let pattern = PatternDetector.train(&[]);
        assert_eq!(pattern.baseline, 0.0);
        assert_eq!(pattern.confidence, 0.0);
    }

    #[test]
    fn smoother_follows_the_level_update() {
        let mut smoother = ExponentialSmoother::new(0.3);
        smoother.observe(10.0);
        assert!((smoother.level() - 10.0).abs() < f64::EPSILON);
        smoother.observe(20.0);
        assert!((smoother.level() - (0.3 * 20.0 + 0.7 * 10.0)).abs() < 1e-9);
    }

    #[test]
    fn forecast_predicts_the_spike_hour() {
        let start = monday_midnight();
        let forecaster = HybridForecaster::train(&spiky_week(start));

        // Forecast the eighth day hour by hour.
        let predictions = forecaster.forecast(
            start + chrono::Duration::days(7),
            Duration::from_secs(3600),
            24,
        );
        assert_eq!(predictions.len(), 24);

        let spike = &predictions[14];
        let quiet = &predictions[3];
        assert!(spike.demand > 40.0, "spike demand was {}", spike.demand);
        assert!(quiet.demand < 20.0, "quiet demand was {}", quiet.demand);
        assert!(spike.lower >= 0.0);
        assert!(spike.upper > spike.demand);
    }

    #[test]
    fn interval_lower_bound_clamps_at_zero() {
        let records: Vec<UsageRecord> = (0..48)
            .map(|i| {
                let demand = if i % 2 == 0 { 0 } else { 40 };
                UsageRecord::at(monday_midnight() + chrono::Duration::hours(i), demand)
            })
            .collect();
        let forecaster = HybridForecaster::train(&records);
        let predictions =
            forecaster.forecast(monday_midnight(), Duration::from_secs(3600), 4);
        assert!(predictions.iter().all(|p| p.lower >= 0.0));
    }
}
