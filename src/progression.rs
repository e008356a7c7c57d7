//! Read-only progress metrics for plans, contracts and the whole book.
//!
//! Percentages come from the consumption ledger, never from the number of
//! months elapsed since the coverage start: the two disagree as soon as a
//! consumption has been corrected by hand.

use crate::config::EngineConfig;
use crate::contract_status::ContractAdvanceSummary;
use crate::driver::{NextConsumption, TimeBasedConsumptionDriver};
use crate::error::Result;
use crate::ledger::ConsumptionLedger;
use crate::schema::{ContractId, CoveragePlan, PlanId, PlanStatus};
use crate::store::AdvanceBook;
use crate::utils::{first_of_month, months_between, prev_month};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Early,
    InProgress,
    Critical,
    Exhausted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanProgress {
    pub plan_id: PlanId,
    pub contract_id: ContractId,
    pub status: PlanStatus,
    pub advance_amount: Decimal,
    pub consumed_amount: Decimal,
    pub remaining_amount: Decimal,
    pub percent_consumed: Decimal,
    pub months_consumed: u32,
    pub months_remaining: u32,
    pub estimated_exhaustion_date: NaiveDate,
    pub severity: Severity,
    pub next_consumption: Option<NextConsumption>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregateReport {
    pub total_plans: usize,
    pub active: usize,
    pub exhausted: usize,
    pub cancelled: usize,
    pub total_advanced: Decimal,
    pub total_remaining: Decimal,
    /// Mean consumed percentage over plans that are not cancelled.
    pub average_progress: Decimal,
    pub critical_or_worse: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractReport {
    pub contract_id: ContractId,
    pub plans: Vec<PlanProgress>,
    pub total_advanced: Decimal,
    pub total_consumed: Decimal,
    pub months_covered: u32,
    pub months_consumed: u32,
    /// Consumed months over covered months, in percent.
    pub global_progress: Decimal,
    pub summary: ContractAdvanceSummary,
}

/// Something an operator should look at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "alert", rename_all = "snake_case")]
pub enum AdvanceAlert {
    Critical {
        plan_id: PlanId,
        contract_id: ContractId,
        percent_consumed: Decimal,
    },
    ExpiringSoon {
        plan_id: PlanId,
        contract_id: ContractId,
        coverage_end: NaiveDate,
        months_left: u32,
    },
    Exhausted {
        plan_id: PlanId,
        contract_id: ContractId,
        coverage_end: NaiveDate,
    },
    PendingConsumption {
        plan_id: PlanId,
        contract_id: ContractId,
        months: Vec<NaiveDate>,
    },
    BalanceDrift {
        plan_id: PlanId,
        contract_id: ContractId,
        delta: Decimal,
    },
}

pub struct ProgressionReporter {
    driver: TimeBasedConsumptionDriver,
    critical_percent: Decimal,
    in_progress_percent: Decimal,
    expiry_warning_months: u32,
}

impl ProgressionReporter {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            driver: TimeBasedConsumptionDriver::new(config),
            critical_percent: config.critical_percent,
            in_progress_percent: config.in_progress_percent,
            expiry_warning_months: config.expiry_warning_months,
        }
    }

    pub fn severity(&self, percent_consumed: Decimal) -> Severity {
        if percent_consumed >= Decimal::ONE_HUNDRED {
            Severity::Exhausted
        } else if percent_consumed >= self.critical_percent {
            Severity::Critical
        } else if percent_consumed >= self.in_progress_percent {
            Severity::InProgress
        } else {
            Severity::Early
        }
    }

    pub fn plan_progress(
        &self,
        plan: &CoveragePlan,
        ledger: &ConsumptionLedger,
        today: NaiveDate,
    ) -> PlanProgress {
        let consumed = ledger.consumed_amount(plan.id);
        let percent = if plan.advance_amount.is_zero() {
            Decimal::ZERO
        } else {
            (consumed / plan.advance_amount * Decimal::ONE_HUNDRED).round_dp(2)
        };
        let months_consumed = ledger.count_for(plan.id) as u32;

        PlanProgress {
            plan_id: plan.id,
            contract_id: plan.contract_id,
            status: plan.status,
            advance_amount: plan.advance_amount,
            consumed_amount: consumed,
            remaining_amount: ledger.recompute_balance(plan),
            percent_consumed: percent,
            months_consumed,
            months_remaining: plan.months_covered.saturating_sub(months_consumed),
            estimated_exhaustion_date: plan.coverage_end,
            severity: self.severity(percent),
            next_consumption: self.driver.next_consumption(plan, ledger, today),
        }
    }

    pub fn aggregate(&self, book: &AdvanceBook, today: NaiveDate) -> AggregateReport {
        let mut report = AggregateReport::default();
        let mut progress_sum = Decimal::ZERO;
        let mut counted = 0u32;

        for plan in book.plans() {
            report.total_plans += 1;
            report.total_advanced += plan.advance_amount;
            report.total_remaining += plan.remaining_balance;

            match plan.status {
                PlanStatus::Active => report.active += 1,
                PlanStatus::Exhausted => report.exhausted += 1,
                PlanStatus::Cancelled => {
                    report.cancelled += 1;
                    continue;
                }
            }

            let progress = self.plan_progress(plan, book.ledger(), today);
            progress_sum += progress.percent_consumed;
            counted += 1;
            if progress.severity >= Severity::Critical {
                report.critical_or_worse += 1;
            }
        }

        if counted > 0 {
            report.average_progress = (progress_sum / Decimal::from(counted)).round_dp(2);
        }

        report
    }

    pub fn contract_report(
        &self,
        book: &AdvanceBook,
        contract_id: ContractId,
        today: NaiveDate,
    ) -> Result<ContractReport> {
        book.contract(contract_id)?;

        let plans: Vec<PlanProgress> = book
            .plans_for_contract(contract_id)
            .into_iter()
            .map(|plan| self.plan_progress(plan, book.ledger(), today))
            .collect();

        let counted = plans.iter().filter(|p| p.status != PlanStatus::Cancelled);
        let months_covered: u32 = counted
            .clone()
            .map(|p| p.months_consumed + p.months_remaining)
            .sum();
        let months_consumed: u32 = counted.clone().map(|p| p.months_consumed).sum();
        let total_advanced: Decimal = counted.clone().map(|p| p.advance_amount).sum();
        let total_consumed: Decimal = counted.map(|p| p.consumed_amount).sum();

        let global_progress = if months_covered == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(months_consumed) / Decimal::from(months_covered) * Decimal::ONE_HUNDRED)
                .round_dp(2)
        };

        Ok(ContractReport {
            contract_id,
            plans,
            total_advanced,
            total_consumed,
            months_covered,
            months_consumed,
            global_progress,
            summary: ContractAdvanceSummary::compute(book, contract_id, today),
        })
    }

    pub fn alerts(&self, book: &AdvanceBook, today: NaiveDate) -> Vec<AdvanceAlert> {
        let current_month = first_of_month(today);
        let recent = prev_month(current_month);
        let mut alerts = Vec::new();

        for plan in book.plans() {
            let ledger = book.ledger();

            if let Some(delta) = ledger.detect_drift(plan) {
                alerts.push(AdvanceAlert::BalanceDrift {
                    plan_id: plan.id,
                    contract_id: plan.contract_id,
                    delta,
                });
            }

            match plan.status {
                PlanStatus::Cancelled => continue,
                PlanStatus::Exhausted => {
                    if plan.coverage_end >= recent {
                        alerts.push(AdvanceAlert::Exhausted {
                            plan_id: plan.id,
                            contract_id: plan.contract_id,
                            coverage_end: plan.coverage_end,
                        });
                    }
                    continue;
                }
                PlanStatus::Active => {}
            }

            let progress = self.plan_progress(plan, ledger, today);
            if progress.severity == Severity::Critical {
                alerts.push(AdvanceAlert::Critical {
                    plan_id: plan.id,
                    contract_id: plan.contract_id,
                    percent_consumed: progress.percent_consumed,
                });
            }

            let months_left = months_between(current_month, plan.coverage_end);
            if (0..=self.expiry_warning_months as i32).contains(&months_left) {
                alerts.push(AdvanceAlert::ExpiringSoon {
                    plan_id: plan.id,
                    contract_id: plan.contract_id,
                    coverage_end: plan.coverage_end,
                    months_left: months_left as u32,
                });
            }

            let pending = self.driver.pending_months(plan, ledger, today);
            if !pending.is_empty() {
                alerts.push(AdvanceAlert::PendingConsumption {
                    plan_id: plan.id,
                    contract_id: plan.contract_id,
                    months: pending,
                });
            }
        }

        alerts
    }
}
