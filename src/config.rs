use crate::error::{AdvanceError, Result};
use rust_decimal::Decimal;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Business thresholds of the advance engine.
///
/// The two day-of-month thresholds are separate settings: one
/// governs when a late-received advance starts covering, the other when the
/// current month counts as elapsed for consumption.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct EngineConfig {
    #[schemars(
        description = "An advance received on a day strictly after this one starts covering the following month (automatic mode only)."
    )]
    pub late_payment_day: u32,

    #[schemars(
        description = "The current calendar month counts as elapsed, and may be consumed, once today's day-of-month is at least this value."
    )]
    pub consumption_day_threshold: u32,

    #[schemars(
        description = "Largest stored-vs-ledger balance difference tolerated as rounding noise."
    )]
    pub drift_epsilon: Decimal,

    #[schemars(description = "Consumed percentage at or above which a plan is CRITICAL.")]
    pub critical_percent: Decimal,

    #[schemars(description = "Consumed percentage at or above which a plan is IN_PROGRESS.")]
    pub in_progress_percent: Decimal,

    #[schemars(
        description = "Emit an expiry alert when an active plan has this many months or fewer left."
    )]
    pub expiry_warning_months: u32,

    #[schemars(
        description = "Stop walking a contiguous plan at the first month that has not elapsed yet."
    )]
    pub stop_at_first_pending: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            late_payment_day: 15,
            consumption_day_threshold: 20,
            drift_epsilon: Decimal::new(1, 2),
            critical_percent: Decimal::from(80),
            in_progress_percent: Decimal::from(50),
            expiry_warning_months: 1,
            stop_at_first_pending: true,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=31).contains(&self.late_payment_day) {
            return Err(AdvanceError::InvalidConfig(format!(
                "late_payment_day {} must be between 1 and 31",
                self.late_payment_day
            )));
        }

        if !(1..=31).contains(&self.consumption_day_threshold) {
            return Err(AdvanceError::InvalidConfig(format!(
                "consumption_day_threshold {} must be between 1 and 31",
                self.consumption_day_threshold
            )));
        }

        if self.drift_epsilon < Decimal::ZERO {
            return Err(AdvanceError::InvalidConfig(format!(
                "drift_epsilon {} must not be negative",
                self.drift_epsilon
            )));
        }

        if self.in_progress_percent <= Decimal::ZERO
            || self.in_progress_percent >= self.critical_percent
            || self.critical_percent > Decimal::ONE_HUNDRED
        {
            return Err(AdvanceError::InvalidConfig(format!(
                "severity thresholds must satisfy 0 < in_progress ({}) < critical ({}) <= 100",
                self.in_progress_percent, self.critical_percent
            )));
        }

        Ok(())
    }

    pub fn generate_json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(EngineConfig)
    }

    pub fn schema_as_json() -> std::result::Result<String, serde_json::Error> {
        let schema = Self::generate_json_schema();
        serde_json::to_string_pretty(&schema)
    }
}
