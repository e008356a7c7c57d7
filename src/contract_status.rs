//! Contract-level views over a contract's advances: what a given month
//! costs the tenant, when the next rent is due, how far coverage reaches.

use crate::error::Result;
use crate::schema::{ContractId, PaymentId, PlanId, PlanStatus};
use crate::store::AdvanceBook;
use crate::utils::{first_of_month, next_month};
use chrono::NaiveDate;
use log::debug;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Snapshot of a contract's advance position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractAdvanceSummary {
    pub contract_id: ContractId,
    pub active_plans: usize,
    pub total_remaining: Decimal,
    pub total_months_covered: u32,
    pub coverage_until: Option<NaiveDate>,
    pub next_payment_month: NaiveDate,
}

impl ContractAdvanceSummary {
    pub fn compute(book: &AdvanceBook, contract_id: ContractId, today: NaiveDate) -> Self {
        let active: Vec<_> = book
            .plans_for_contract(contract_id)
            .into_iter()
            .filter(|plan| plan.status == PlanStatus::Active)
            .collect();

        Self {
            contract_id,
            active_plans: active.len(),
            total_remaining: active.iter().map(|plan| plan.remaining_balance).sum(),
            total_months_covered: total_months_covered(book, contract_id),
            coverage_until: advance_expiry(book, contract_id),
            next_payment_month: next_payment_month(book, contract_id, today),
        }
    }
}

/// Rent owed for one month once advance coverage is taken into account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthDue {
    pub month: NaiveDate,
    pub rent_and_charges: Decimal,
    pub covered_by_advance: Decimal,
    pub amount_due: Decimal,
    pub plan_id: Option<PlanId>,
    /// Whether the covering month is already in the ledger.
    pub consumed: bool,
}

/// Active plan that would pay for `month`, and how much it would pay.
pub fn advance_for_month(
    book: &AdvanceBook,
    contract_id: ContractId,
    month: NaiveDate,
) -> Option<(PlanId, Decimal)> {
    let month = first_of_month(month);

    book.plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.is_active() && plan.covers(month))
        .find(|plan| !book.ledger().is_consumed(plan.id, month))
        .map(|plan| {
            let available = book.ledger().recompute_balance(plan);
            (plan.id, plan.monthly_rent.min(available))
        })
}

/// Read-only preview of what the tenant owes for `month`.
pub fn amount_due_for_month(
    book: &AdvanceBook,
    contract_id: ContractId,
    month: NaiveDate,
) -> Result<MonthDue> {
    let contract = book.contract(contract_id)?;
    let month = first_of_month(month);
    let rent_and_charges = contract.monthly_rent + contract.monthly_charges;

    let consumed_entry = book
        .plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.status != PlanStatus::Cancelled)
        .find_map(|plan| {
            book.ledger()
                .entries_for(plan.id)
                .into_iter()
                .find(|entry| entry.month == month)
                .map(|entry| (plan.id, entry.amount_consumed))
        });

    let (plan_id, covered, consumed) = match consumed_entry {
        Some((plan_id, amount)) => (Some(plan_id), amount, true),
        None => match advance_for_month(book, contract_id, month) {
            Some((plan_id, amount)) => (Some(plan_id), amount, false),
            None => (None, Decimal::ZERO, false),
        },
    };

    Ok(MonthDue {
        month,
        rent_and_charges,
        covered_by_advance: covered,
        amount_due: (rent_and_charges - covered).max(Decimal::ZERO),
        plan_id,
        consumed,
    })
}

/// Settles a month against the contract's advances. The covering month is
/// consumed only if it has already elapsed; otherwise the preview is
/// returned and the consumption driver will pick it up later.
pub fn settle_month(
    book: &mut AdvanceBook,
    contract_id: ContractId,
    month: NaiveDate,
    today: NaiveDate,
    rent_payment: Option<PaymentId>,
) -> Result<MonthDue> {
    let preview = amount_due_for_month(book, contract_id, month)?;

    let (Some(plan_id), false) = (preview.plan_id, preview.consumed) else {
        return Ok(preview);
    };

    if !book.ledger().elapsed_rule().is_elapsed(preview.month, today) {
        debug!(
            "Month {} is covered by plan {} but has not elapsed on {}",
            preview.month, plan_id, today
        );
        return Ok(preview);
    }

    book.in_plan_transaction(plan_id, |book| {
        let (plan, ledger) = book.plan_and_ledger_mut(plan_id)?;
        let recorded = match rent_payment {
            Some(payment_id) => ledger.record_matched_consumption(
                plan,
                preview.month,
                preview.covered_by_advance,
                today,
                payment_id,
            ),
            None => ledger.record_consumption(
                plan,
                preview.month,
                preview.covered_by_advance,
                today,
            ),
        };

        Ok(recorded?)
    })?;

    Ok(MonthDue {
        consumed: true,
        ..preview
    })
}

/// First month the tenant has to pay out of pocket again.
pub fn next_payment_month(
    book: &AdvanceBook,
    contract_id: ContractId,
    today: NaiveDate,
) -> NaiveDate {
    let funded_until = book
        .plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.is_active() && plan.remaining_balance > Decimal::ZERO)
        .map(|plan| plan.coverage_end)
        .max();

    if let Some(end) = funded_until {
        return next_month(end);
    }

    match book.last_paid_rent_month(contract_id) {
        Some(last_paid) => next_month(last_paid),
        None => next_month(first_of_month(today)),
    }
}

pub fn total_months_covered(book: &AdvanceBook, contract_id: ContractId) -> u32 {
    book.plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.is_active())
        .map(|plan| plan.months_covered)
        .sum()
}

/// Last covered month across the contract's active plans.
pub fn advance_expiry(book: &AdvanceBook, contract_id: ContractId) -> Option<NaiveDate> {
    book.plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.is_active())
        .map(|plan| plan.coverage_end)
        .max()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::AdvanceError;
    use crate::ledger::ConsumptionRejection;
    use crate::schema::{
        Contract, CoveragePlan, PaymentEvent, PaymentKind, PaymentStatus, SelectionMode,
    };
    use rust_decimal_macros::dec;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn book() -> AdvanceBook {
        let mut book = AdvanceBook::new(&EngineConfig::default());
        book.upsert_contract(Contract {
            id: ContractId(1),
            monthly_rent: dec!(100000),
            monthly_charges: dec!(10000),
            start_date: ymd(2023, 10, 1),
            active: true,
            terminated: false,
        });
        book.insert_plan(CoveragePlan {
            id: PlanId(1),
            contract_id: ContractId(1),
            payment_id: None,
            advance_amount: dec!(300000),
            monthly_rent: dec!(100000),
            selection_mode: SelectionMode::Automatic,
            months_covered: 3,
            coverage_start: ymd(2024, 1, 1),
            coverage_end: ymd(2024, 3, 1),
            remaining_balance: dec!(300000),
            remainder: dec!(0),
            status: PlanStatus::Active,
            advance_date: ymd(2023, 12, 4),
            manual_months: vec![],
            stacked_after: None,
            notes: String::new(),
        });
        book
    }

    #[test]
    fn test_amount_due_is_read_only() {
        let book = book();
        let due = amount_due_for_month(&book, ContractId(1), ymd(2024, 2, 1)).unwrap();

        assert_eq!(due.rent_and_charges, dec!(110000));
        assert_eq!(due.covered_by_advance, dec!(100000));
        assert_eq!(due.amount_due, dec!(10000));
        assert!(!due.consumed);
        assert_eq!(book.ledger().count_for(PlanId(1)), 0);

        let uncovered = amount_due_for_month(&book, ContractId(1), ymd(2024, 4, 1)).unwrap();
        assert_eq!(uncovered.amount_due, dec!(110000));
        assert_eq!(uncovered.plan_id, None);
    }

    #[test]
    fn test_settle_month_consumes_elapsed_month_once() {
        let mut book = book();
        let jan = ymd(2024, 1, 1);
        let today = ymd(2024, 2, 3);
        let due = settle_month(&mut book, ContractId(1), jan, today, Some(PaymentId(8))).unwrap();
        assert!(due.consumed);

        let entries = book.ledger().entries_for(PlanId(1));
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].payment_id, Some(PaymentId(8)));

        let again = settle_month(&mut book, ContractId(1), jan, today, None).unwrap();
        assert!(again.consumed);
        assert_eq!(book.ledger().count_for(PlanId(1)), 1);
        assert_eq!(book.plan(PlanId(1)).unwrap().remaining_balance, dec!(200000));
    }

    #[test]
    fn test_settle_month_reports_the_actual_rejection() {
        let mut book = book();
        book.plan_mut(PlanId(1)).unwrap().monthly_rent = dec!(0);

        let err = settle_month(&mut book, ContractId(1), ymd(2024, 1, 1), ymd(2024, 2, 3), None)
            .unwrap_err();
        assert!(matches!(
            err,
            AdvanceError::ConsumptionRejected(ConsumptionRejection::Overconsumption { .. })
        ));
        assert_eq!(book.ledger().count_for(PlanId(1)), 0);
        assert_eq!(book.plan(PlanId(1)).unwrap().remaining_balance, dec!(300000));
    }

    #[test]
    fn test_settle_month_leaves_future_month_alone() {
        let mut book = book();
        let due =
            settle_month(&mut book, ContractId(1), ymd(2024, 3, 1), ymd(2024, 2, 3), None).unwrap();
        assert!(!due.consumed);
        assert_eq!(due.covered_by_advance, dec!(100000));
        assert_eq!(book.ledger().count_for(PlanId(1)), 0);
    }

    #[test]
    fn test_next_payment_month() {
        let mut book = book();
        assert_eq!(next_payment_month(&book, ContractId(1), ymd(2024, 1, 10)), ymd(2024, 4, 1));

        book.plan_mut(PlanId(1)).unwrap().status = PlanStatus::Exhausted;
        assert_eq!(next_payment_month(&book, ContractId(1), ymd(2024, 1, 10)), ymd(2024, 2, 1));

        book.record_payment(PaymentEvent {
            id: PaymentId(2),
            contract_id: ContractId(1),
            amount: dec!(100000),
            date: ymd(2024, 5, 2),
            kind: PaymentKind::Rent,
            status: PaymentStatus::Valid,
        });
        assert_eq!(next_payment_month(&book, ContractId(1), ymd(2024, 1, 10)), ymd(2024, 6, 1));
    }

    #[test]
    fn test_summary() {
        let book = book();
        let summary = ContractAdvanceSummary::compute(&book, ContractId(1), ymd(2024, 1, 10));
        assert_eq!(summary.active_plans, 1);
        assert_eq!(summary.total_remaining, dec!(300000));
        assert_eq!(summary.total_months_covered, 3);
        assert_eq!(summary.coverage_until, Some(ymd(2024, 3, 1)));
        assert_eq!(summary.next_payment_month, ymd(2024, 4, 1));
    }
}
