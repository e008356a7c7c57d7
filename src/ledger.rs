use crate::config::EngineConfig;
use crate::schema::{CoveragePlan, EntryId, LedgerEntry, PaymentId, PlanId, PlanStatus};
use crate::utils::first_of_month;
use chrono::{Datelike, NaiveDate};
use log::{debug, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Decides whether a covered month is far enough in the past to be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElapsedMonthRule {
    pub day_threshold: u32,
}

impl ElapsedMonthRule {
    pub fn new(day_threshold: u32) -> Self {
        Self { day_threshold }
    }

    /// A month is elapsed when it lies before the current month, or is the
    /// current month and today's day reached the threshold. Future months
    /// never are.
    pub fn is_elapsed(&self, month: NaiveDate, today: NaiveDate) -> bool {
        let month = first_of_month(month);
        let current = first_of_month(today);

        if month < current {
            true
        } else if month == current {
            today.day() >= self.day_threshold
        } else {
            false
        }
    }
}

/// Why a consumption was not recorded. Rejections are data, not failures:
/// batch callers keep going past them.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rejection", rename_all = "snake_case")]
pub enum ConsumptionRejection {
    #[error("plan {plan} is not active")]
    PlanNotActive { plan: PlanId },

    #[error("month {month} is outside the coverage of plan {plan}")]
    OutsideCoverage { plan: PlanId, month: NaiveDate },

    #[error("month {month} already consumed for plan {plan}")]
    DuplicateMonth { plan: PlanId, month: NaiveDate },

    #[error("month {month} has not elapsed yet for plan {plan}")]
    FutureMonth { plan: PlanId, month: NaiveDate },

    #[error("consuming {requested} would exceed the {available} left on plan {plan}")]
    Overconsumption {
        plan: PlanId,
        requested: Decimal,
        available: Decimal,
    },
}

/// Result of an explicit balance write-back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceCorrection {
    pub plan_id: PlanId,
    pub previous: Decimal,
    pub recomputed: Decimal,
}

impl BalanceCorrection {
    pub fn delta(&self) -> Decimal {
        self.previous - self.recomputed
    }
}

/// Append-only record of consumed months, unique per `(plan, month)`.
#[derive(Debug, Clone)]
pub struct ConsumptionLedger {
    entries: BTreeMap<(PlanId, NaiveDate), LedgerEntry>,
    next_entry_id: u64,
    rule: ElapsedMonthRule,
    drift_epsilon: Decimal,
}

impl ConsumptionLedger {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_entry_id: 1,
            rule: ElapsedMonthRule::new(config.consumption_day_threshold),
            drift_epsilon: config.drift_epsilon,
        }
    }

    pub fn elapsed_rule(&self) -> ElapsedMonthRule {
        self.rule
    }

    pub fn record_consumption(
        &mut self,
        plan: &mut CoveragePlan,
        month: NaiveDate,
        amount: Decimal,
        today: NaiveDate,
    ) -> Result<LedgerEntry, ConsumptionRejection> {
        self.record(plan, month, amount, today, None)
    }

    /// Records a consumption matched against a rent payment.
    pub fn record_matched_consumption(
        &mut self,
        plan: &mut CoveragePlan,
        month: NaiveDate,
        amount: Decimal,
        today: NaiveDate,
        payment_id: PaymentId,
    ) -> Result<LedgerEntry, ConsumptionRejection> {
        self.record(plan, month, amount, today, Some(payment_id))
    }

    fn record(
        &mut self,
        plan: &mut CoveragePlan,
        month: NaiveDate,
        amount: Decimal,
        today: NaiveDate,
        payment_id: Option<PaymentId>,
    ) -> Result<LedgerEntry, ConsumptionRejection> {
        let month = first_of_month(month);

        if !plan.is_active() {
            return Err(ConsumptionRejection::PlanNotActive { plan: plan.id });
        }

        if !plan.covers(month) {
            return Err(ConsumptionRejection::OutsideCoverage {
                plan: plan.id,
                month,
            });
        }

        if self.is_consumed(plan.id, month) {
            return Err(ConsumptionRejection::DuplicateMonth {
                plan: plan.id,
                month,
            });
        }

        if !self.rule.is_elapsed(month, today) {
            warn!(
                "Refusing to consume {} for plan {}: month has not elapsed on {}",
                month, plan.id, today
            );
            return Err(ConsumptionRejection::FutureMonth {
                plan: plan.id,
                month,
            });
        }

        let available = self.recompute_balance(plan);
        if amount <= Decimal::ZERO || amount > available {
            return Err(ConsumptionRejection::Overconsumption {
                plan: plan.id,
                requested: amount,
                available,
            });
        }

        let id = EntryId(self.next_entry_id);
        self.next_entry_id += 1;

        let balance_after = available - amount;
        let entry = LedgerEntry {
            id,
            plan_id: plan.id,
            month,
            amount_consumed: amount,
            balance_after,
            payment_id,
        };
        self.entries.insert((plan.id, month), entry.clone());

        self.write_back_balance(plan);

        debug!(
            "Plan {} consumed {} for {}, {} left",
            plan.id, amount, month, plan.remaining_balance
        );

        Ok(entry)
    }

    pub fn is_consumed(&self, plan_id: PlanId, month: NaiveDate) -> bool {
        self.entries.contains_key(&(plan_id, first_of_month(month)))
    }

    /// Entries of one plan, ordered by month.
    pub fn entries_for(&self, plan_id: PlanId) -> Vec<&LedgerEntry> {
        self.entries
            .range((plan_id, NaiveDate::MIN)..=(plan_id, NaiveDate::MAX))
            .map(|(_, entry)| entry)
            .collect()
    }

    pub fn count_for(&self, plan_id: PlanId) -> usize {
        self.entries_for(plan_id).len()
    }

    pub fn consumed_amount(&self, plan_id: PlanId) -> Decimal {
        self.entries_for(plan_id)
            .iter()
            .map(|entry| entry.amount_consumed)
            .sum()
    }

    pub fn all_entries(&self) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.values()
    }

    /// Remaining balance implied by the ledger, never below zero.
    pub fn recompute_balance(&self, plan: &CoveragePlan) -> Decimal {
        (plan.advance_amount - self.consumed_amount(plan.id)).max(Decimal::ZERO)
    }

    /// Stored balance minus ledger-derived balance, when beyond the epsilon.
    pub fn detect_drift(&self, plan: &CoveragePlan) -> Option<Decimal> {
        let delta = plan.remaining_balance - self.recompute_balance(plan);
        if delta.abs() > self.drift_epsilon {
            Some(delta)
        } else {
            None
        }
    }

    /// Writes the ledger-derived balance back onto the plan and keeps the
    /// exhausted flag in step with it.
    pub fn write_back_balance(&self, plan: &mut CoveragePlan) -> BalanceCorrection {
        let previous = plan.remaining_balance;
        let recomputed = self.recompute_balance(plan);
        plan.remaining_balance = recomputed;

        match plan.status {
            PlanStatus::Active if recomputed.is_zero() => plan.status = PlanStatus::Exhausted,
            PlanStatus::Exhausted if !recomputed.is_zero() => plan.status = PlanStatus::Active,
            _ => {}
        }

        BalanceCorrection {
            plan_id: plan.id,
            previous,
            recomputed,
        }
    }

    /// Deletes an erroneous entry and recomputes the plan's balance from
    /// what is left.
    pub fn remove_entry(
        &mut self,
        plan: &mut CoveragePlan,
        month: NaiveDate,
    ) -> Option<LedgerEntry> {
        let removed = self.entries.remove(&(plan.id, first_of_month(month)));
        if let Some(entry) = &removed {
            warn!(
                "Removed consumption of {} for {} on plan {}",
                entry.amount_consumed, entry.month, plan.id
            );
            self.write_back_balance(plan);
        }
        removed
    }

    pub(crate) fn take_plan_entries(&mut self, plan_id: PlanId) -> Vec<LedgerEntry> {
        let keys: Vec<(PlanId, NaiveDate)> = self
            .entries
            .range((plan_id, NaiveDate::MIN)..=(plan_id, NaiveDate::MAX))
            .map(|(key, _)| *key)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .collect()
    }

    pub(crate) fn restore_plan_entries(&mut self, plan_id: PlanId, entries: Vec<LedgerEntry>) {
        self.take_plan_entries(plan_id);
        for entry in entries {
            self.entries.insert((plan_id, entry.month), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ContractId, SelectionMode};
    use rust_decimal_macros::dec;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn plan(amount: Decimal) -> CoveragePlan {
        CoveragePlan {
            id: PlanId(1),
            contract_id: ContractId(1),
            payment_id: None,
            advance_amount: amount,
            monthly_rent: dec!(150000),
            selection_mode: SelectionMode::Automatic,
            months_covered: 3,
            coverage_start: ymd(2024, 1, 1),
            coverage_end: ymd(2024, 3, 1),
            remaining_balance: amount,
            remainder: dec!(0),
            status: PlanStatus::Active,
            advance_date: ymd(2023, 12, 10),
            manual_months: vec![],
            stacked_after: None,
            notes: String::new(),
        }
    }

    fn ledger() -> ConsumptionLedger {
        ConsumptionLedger::new(&EngineConfig::default())
    }

    #[test]
    fn test_elapsed_rule() {
        let rule = ElapsedMonthRule::new(20);
        assert!(rule.is_elapsed(ymd(2024, 2, 1), ymd(2024, 3, 1)));
        assert!(!rule.is_elapsed(ymd(2024, 3, 1), ymd(2024, 3, 19)));
        assert!(rule.is_elapsed(ymd(2024, 3, 1), ymd(2024, 3, 20)));
        assert!(!rule.is_elapsed(ymd(2024, 4, 1), ymd(2024, 3, 31)));
    }

    #[test]
    fn test_record_consumption_is_idempotent() {
        let mut ledger = ledger();
        let mut plan = plan(dec!(450000));
        let today = ymd(2024, 6, 1);

        let entry = ledger
            .record_consumption(&mut plan, ymd(2024, 1, 1), dec!(150000), today)
            .unwrap();
        assert_eq!(entry.balance_after, dec!(300000));
        assert_eq!(plan.remaining_balance, dec!(300000));

        let second = ledger.record_consumption(&mut plan, ymd(2024, 1, 1), dec!(150000), today);
        assert!(matches!(
            second,
            Err(ConsumptionRejection::DuplicateMonth { .. })
        ));
        assert_eq!(ledger.count_for(plan.id), 1);
        assert_eq!(plan.remaining_balance, dec!(300000));
    }

    #[test]
    fn test_exhausted_only_after_last_consumption() {
        let mut ledger = ledger();
        let mut plan = plan(dec!(450000));
        let today = ymd(2024, 6, 1);

        for (idx, month) in [ymd(2024, 1, 1), ymd(2024, 2, 1), ymd(2024, 3, 1)]
            .into_iter()
            .enumerate()
        {
            assert_eq!(plan.status, PlanStatus::Active, "still active before month {}", idx + 1);
            ledger
                .record_consumption(&mut plan, month, dec!(150000), today)
                .unwrap();
        }

        assert_eq!(plan.remaining_balance, dec!(0));
        assert_eq!(plan.status, PlanStatus::Exhausted);
    }

    #[test]
    fn test_rejections() {
        let mut ledger = ledger();
        let mut plan = plan(dec!(400000));

        let outside =
            ledger.record_consumption(&mut plan, ymd(2024, 4, 1), dec!(150000), ymd(2024, 6, 1));
        assert!(matches!(outside, Err(ConsumptionRejection::OutsideCoverage { .. })));

        let future =
            ledger.record_consumption(&mut plan, ymd(2024, 2, 1), dec!(150000), ymd(2024, 2, 10));
        assert!(matches!(future, Err(ConsumptionRejection::FutureMonth { .. })));

        let today = ymd(2024, 6, 1);
        ledger
            .record_consumption(&mut plan, ymd(2024, 1, 1), dec!(150000), today)
            .unwrap();
        ledger
            .record_consumption(&mut plan, ymd(2024, 2, 1), dec!(150000), today)
            .unwrap();
        let over = ledger.record_consumption(&mut plan, ymd(2024, 3, 1), dec!(150000), today);
        assert!(matches!(
            over,
            Err(ConsumptionRejection::Overconsumption { available, .. })
                if available == dec!(100000)
        ));
        assert_eq!(plan.remaining_balance, dec!(100000));

        plan.status = PlanStatus::Cancelled;
        let cancelled = ledger.record_consumption(&mut plan, ymd(2024, 3, 1), dec!(100000), today);
        assert!(matches!(cancelled, Err(ConsumptionRejection::PlanNotActive { .. })));
    }

    #[test]
    fn test_drift_round_trip() {
        let mut ledger = ledger();
        let mut plan = plan(dec!(450000));
        ledger
            .record_consumption(&mut plan, ymd(2024, 1, 1), dec!(150000), ymd(2024, 6, 1))
            .unwrap();
        assert_eq!(ledger.detect_drift(&plan), None);

        plan.remaining_balance = dec!(123456.78);
        assert_eq!(ledger.detect_drift(&plan), Some(dec!(-176543.22)));

        let correction = ledger.write_back_balance(&mut plan);
        assert_eq!(correction.delta(), dec!(-176543.22));
        assert_eq!(ledger.detect_drift(&plan), None);
        assert_eq!(plan.remaining_balance, dec!(300000));
    }

    #[test]
    fn test_rounding_noise_is_not_drift() {
        let ledger = ledger();
        let mut plan = plan(dec!(450000));
        plan.remaining_balance = dec!(450000.01);
        assert_eq!(ledger.detect_drift(&plan), None);
        plan.remaining_balance = dec!(450000.02);
        assert_eq!(ledger.detect_drift(&plan), Some(dec!(0.02)));
    }

    #[test]
    fn test_remove_entry_recomputes_and_reactivates() {
        let mut ledger = ledger();
        let mut plan = plan(dec!(300000));
        plan.months_covered = 2;
        plan.coverage_end = ymd(2024, 2, 1);
        let today = ymd(2024, 6, 1);

        ledger
            .record_consumption(&mut plan, ymd(2024, 1, 1), dec!(150000), today)
            .unwrap();
        ledger
            .record_consumption(&mut plan, ymd(2024, 2, 1), dec!(150000), today)
            .unwrap();
        assert_eq!(plan.status, PlanStatus::Exhausted);

        let removed = ledger.remove_entry(&mut plan, ymd(2024, 2, 1)).unwrap();
        assert_eq!(removed.amount_consumed, dec!(150000));
        assert_eq!(plan.remaining_balance, dec!(150000));
        assert_eq!(plan.status, PlanStatus::Active);
        assert!(ledger.remove_entry(&mut plan, ymd(2024, 2, 1)).is_none());
    }

    #[test]
    fn test_entries_are_scoped_per_plan() {
        let mut ledger = ledger();
        let mut first = plan(dec!(450000));
        let mut second = plan(dec!(450000));
        second.id = PlanId(2);
        let today = ymd(2024, 6, 1);

        ledger
            .record_consumption(&mut first, ymd(2024, 1, 1), dec!(150000), today)
            .unwrap();
        ledger
            .record_consumption(&mut second, ymd(2024, 1, 1), dec!(150000), today)
            .unwrap();
        ledger
            .record_consumption(&mut second, ymd(2024, 2, 1), dec!(150000), today)
            .unwrap();

        assert_eq!(ledger.count_for(PlanId(1)), 1);
        assert_eq!(ledger.count_for(PlanId(2)), 2);
        assert_eq!(ledger.consumed_amount(PlanId(2)), dec!(300000));
    }
}
