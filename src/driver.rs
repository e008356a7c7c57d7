use crate::config::EngineConfig;
use crate::error::Result;
use crate::ledger::{ConsumptionLedger, ConsumptionRejection, ElapsedMonthRule};
use crate::schema::{BatchSummary, ContractId, CoveragePlan, PlanId};
use crate::store::AdvanceBook;
use crate::utils::{first_of_month, next_month};
use chrono::{Datelike, NaiveDate};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

/// What one pass over one plan did.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanSweep {
    pub plan_id: Option<PlanId>,
    pub consumed: Vec<NaiveDate>,
    pub already_consumed: usize,
    pub pending: usize,
    pub rejections: Vec<ConsumptionRejection>,
}

impl PlanSweep {
    pub fn consumed_any(&self) -> bool {
        !self.consumed.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SweepReport {
    pub summary: BatchSummary,
    pub plans: Vec<PlanSweep>,
}

impl SweepReport {
    pub fn months_consumed(&self) -> usize {
        self.plans.iter().map(|p| p.consumed.len()).sum()
    }
}

/// The next month a plan will consume, and the first day it may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextConsumption {
    pub month: NaiveDate,
    pub eligible_on: NaiveDate,
}

/// Walks covered months forward from "now" and consumes those that have
/// fully elapsed. Never writes a month that has not.
pub struct TimeBasedConsumptionDriver {
    rule: ElapsedMonthRule,
    stop_at_first_pending: bool,
}

impl TimeBasedConsumptionDriver {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            rule: ElapsedMonthRule::new(config.consumption_day_threshold),
            stop_at_first_pending: config.stop_at_first_pending,
        }
    }

    pub fn is_month_elapsed(&self, month: NaiveDate, today: NaiveDate) -> bool {
        self.rule.is_elapsed(month, today)
    }

    pub fn sweep_plan(
        &self,
        book: &mut AdvanceBook,
        plan_id: PlanId,
        today: NaiveDate,
    ) -> Result<PlanSweep> {
        book.in_plan_transaction(plan_id, |book| {
            let (plan, ledger) = book.plan_and_ledger_mut(plan_id)?;
            Ok(self.sweep(plan, ledger, today))
        })
    }

    fn sweep(
        &self,
        plan: &mut CoveragePlan,
        ledger: &mut ConsumptionLedger,
        today: NaiveDate,
    ) -> PlanSweep {
        let mut sweep = PlanSweep {
            plan_id: Some(plan.id),
            ..PlanSweep::default()
        };

        if !plan.is_active() {
            debug!("Plan {} is {:?}, nothing to consume", plan.id, plan.status);
            return sweep;
        }

        let contiguous = plan.is_contiguous();

        for month in plan.covered_months() {
            if ledger.is_consumed(plan.id, month) {
                sweep.already_consumed += 1;
                continue;
            }

            if !self.rule.is_elapsed(month, today) {
                sweep.pending += 1;
                if contiguous && self.stop_at_first_pending {
                    break;
                }
                continue;
            }

            let available = ledger.recompute_balance(plan);
            if available.is_zero() {
                break;
            }
            let amount = plan.monthly_rent.min(available);

            match ledger.record_consumption(plan, month, amount, today) {
                Ok(entry) => sweep.consumed.push(entry.month),
                Err(rejection) => {
                    warn!("Plan {}: {}", plan.id, rejection);
                    sweep.rejections.push(rejection);
                }
            }

            if !plan.is_active() {
                break;
            }
        }

        sweep
    }

    /// Sweeps every active plan (optionally of one contract). Each plan is
    /// its own unit of work; failures are collected, never raised.
    pub fn sweep_all(
        &self,
        book: &mut AdvanceBook,
        today: NaiveDate,
        contract_id: Option<ContractId>,
    ) -> SweepReport {
        let plan_ids = book.active_plan_ids(contract_id);
        info!(
            "Consumption sweep on {} over {} active plans",
            today,
            plan_ids.len()
        );

        let mut report = SweepReport::default();

        for plan_id in plan_ids {
            match self.sweep_plan(book, plan_id, today) {
                Ok(sweep) if sweep.rejections.is_empty() => {
                    report.summary.record_success();
                    report.plans.push(sweep);
                }
                Ok(sweep) => {
                    let reasons: Vec<String> =
                        sweep.rejections.iter().map(|r| r.to_string()).collect();
                    report.summary.record_failure(plan_id, reasons.join("; "));
                    report.plans.push(sweep);
                }
                Err(err) => {
                    warn!("Sweep of plan {} failed: {}", plan_id, err);
                    report.summary.record_failure(plan_id, err);
                }
            }
        }

        info!(
            "Consumption sweep done: {} months consumed, {} plans ok, {} failed",
            report.months_consumed(),
            report.summary.succeeded,
            report.summary.failed
        );

        report
    }

    /// Elapsed covered months with no ledger entry yet.
    pub fn pending_months(
        &self,
        plan: &CoveragePlan,
        ledger: &ConsumptionLedger,
        today: NaiveDate,
    ) -> Vec<NaiveDate> {
        plan.covered_months()
            .into_iter()
            .filter(|month| !ledger.is_consumed(plan.id, *month))
            .filter(|month| self.rule.is_elapsed(*month, today))
            .collect()
    }

    pub fn next_consumption(
        &self,
        plan: &CoveragePlan,
        ledger: &ConsumptionLedger,
        today: NaiveDate,
    ) -> Option<NextConsumption> {
        if !plan.is_active() {
            return None;
        }

        let month = plan
            .covered_months()
            .into_iter()
            .find(|month| !ledger.is_consumed(plan.id, *month))?;

        let eligible_on = if self.rule.is_elapsed(month, today) {
            today
        } else {
            threshold_day_of(month, self.rule.day_threshold)
        };

        Some(NextConsumption { month, eligible_on })
    }
}

/// The threshold day within `month`, clamped to the month's last day.
fn threshold_day_of(month: NaiveDate, day: u32) -> NaiveDate {
    let month = first_of_month(month);
    month
        .with_day(day)
        .or_else(|| next_month(month).pred_opt())
        .unwrap_or(month)
}
