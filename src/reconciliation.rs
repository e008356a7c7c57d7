//! Keeps coverage plans in line with the payments they came from, and finds
//! (then, on request, fixes) plans whose stored state disagrees with the
//! calculator or the ledger.
//!
//! Checks are read-only. Every mutation goes through an explicit call:
//! [`ReconciliationService::synchronize`], [`ReconciliationService::repair_all`],
//! [`ReconciliationService::repair_drift`] and friends.

use crate::calculator::{CoverageCalculator, CoverageOutcome, CoverageRequest, CoverageWarning};
use crate::config::EngineConfig;
use crate::contract_status::ContractAdvanceSummary;
use crate::error::{AdvanceError, Result};
use crate::ledger::BalanceCorrection;
use crate::schema::{
    BatchSummary, ContractId, CoveragePlan, Inconsistency, InconsistencyKind, LedgerEntry,
    PaymentEvent, PaymentId, PaymentKind, PlanId, PlanStatus, SelectionMode,
};
use crate::store::AdvanceBook;
use chrono::NaiveDate;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Created,
    Updated,
    /// The payment was refused or cancelled after the plan was made.
    Cancelled,
    /// The plan was cancelled by hand and is left alone.
    SkippedCancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub plan_id: PlanId,
    pub action: SyncAction,
    /// Ledger rows dropped because the new coverage no longer backs them.
    pub removed_entries: Vec<LedgerEntry>,
    pub warnings: Vec<CoverageWarning>,
}

/// How the months of an advance entered by hand are chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "value", rename_all = "snake_case")]
pub enum AdvanceSelection {
    Automatic { effective_month: Option<NaiveDate> },
    Manual(Vec<NaiveDate>),
}

/// An advance entered by an operator rather than derived from a payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAdvance {
    pub contract_id: ContractId,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub selection: AdvanceSelection,
    #[serde(default)]
    pub notes: String,
}

/// A ledger-level anomaly found by [`ReconciliationService::audit_ledgers`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "finding", rename_all = "snake_case")]
pub enum LedgerFinding {
    BalanceDrift {
        plan_id: PlanId,
        stored: Decimal,
        recomputed: Decimal,
    },
    FutureEntry {
        plan_id: PlanId,
        month: NaiveDate,
    },
    OutsideCoverage {
        plan_id: PlanId,
        month: NaiveDate,
    },
}

pub struct ReconciliationService {
    calculator: CoverageCalculator,
    amount_epsilon: Decimal,
}

impl ReconciliationService {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            calculator: CoverageCalculator::new(config),
            amount_epsilon: config.drift_epsilon,
        }
    }

    /// Brings the plan of an advance payment in line with the payment,
    /// creating it on first sight. An existing plan is overwritten with what
    /// the calculator produces today, from the rent it snapshotted.
    pub fn synchronize(
        &self,
        book: &mut AdvanceBook,
        payment_id: PaymentId,
        today: NaiveDate,
    ) -> Result<SyncOutcome> {
        let payment = book.payment(payment_id)?.clone();
        let existing = book.plan_for_payment(payment_id).map(|plan| plan.id);

        if payment.kind != PaymentKind::Advance {
            return Err(AdvanceError::NotAnAdvancePayment(payment_id));
        }

        let outcome = match (existing, payment.is_valid_advance()) {
            (None, false) => return Err(AdvanceError::NotAnAdvancePayment(payment_id)),
            (Some(plan_id), false) if book.plan(plan_id)?.status == PlanStatus::Cancelled => {
                SyncOutcome {
                    plan_id,
                    action: SyncAction::SkippedCancelled,
                    removed_entries: Vec::new(),
                    warnings: Vec::new(),
                }
            }
            (Some(plan_id), false) => {
                self.cancel_plan(book, plan_id, "payment no longer valid", today)?;
                SyncOutcome {
                    plan_id,
                    action: SyncAction::Cancelled,
                    removed_entries: Vec::new(),
                    warnings: Vec::new(),
                }
            }
            (None, true) => self.create_from_payment(book, &payment)?,
            (Some(plan_id), true) => self.overwrite_from_payment(book, plan_id, &payment)?,
        };

        self.apply_consequences(book, payment.contract_id, today);
        Ok(outcome)
    }

    fn create_from_payment(
        &self,
        book: &mut AdvanceBook,
        payment: &PaymentEvent,
    ) -> Result<SyncOutcome> {
        let contract = book.contract(payment.contract_id)?.clone();
        let anchor = funded_predecessor(book, contract.id);

        let request =
            CoverageRequest::automatic(contract.monthly_rent, payment.amount, payment.date)
                .with_contract_start(contract.start_date)
                .with_last_paid_month(book.last_paid_rent_month_before(contract.id, payment.date))
                .stacked_after(anchor.map(|(_, end)| end));
        let outcome = self.calculator.calculate_or_cancel(&request)?;

        let plan_id = book.allocate_plan_id();
        let mut plan = plan_from_outcome(
            plan_id,
            contract.id,
            Some(payment.id),
            payment.amount,
            contract.monthly_rent,
            payment.date,
            &outcome,
            String::new(),
        );
        plan.stacked_after = anchor.map(|(id, _)| id);

        info!(
            "Created plan {} for payment {}: {} months from {} to {}",
            plan_id, payment.id, plan.months_covered, plan.coverage_start, plan.coverage_end
        );
        book.insert_plan(plan);

        Ok(SyncOutcome {
            plan_id,
            action: SyncAction::Created,
            removed_entries: Vec::new(),
            warnings: outcome.warnings,
        })
    }

    fn overwrite_from_payment(
        &self,
        book: &mut AdvanceBook,
        plan_id: PlanId,
        payment: &PaymentEvent,
    ) -> Result<SyncOutcome> {
        let current = book.plan(plan_id)?.clone();

        if is_cancelled_by_hand(&current) {
            debug!("Plan {} was cancelled by hand, not resynchronized", plan_id);
            return Ok(SyncOutcome {
                plan_id,
                action: SyncAction::SkippedCancelled,
                removed_entries: Vec::new(),
                warnings: Vec::new(),
            });
        }

        let request = self.request_for_plan(book, &current, payment)?;
        let outcome = self.calculator.calculate_or_cancel(&request)?;

        let removed_entries = book.in_plan_transaction(plan_id, |book| {
            let (plan, ledger) = book.plan_and_ledger_mut(plan_id)?;
            plan.monthly_rent = request.monthly_rent;
            plan.advance_amount = payment.amount;
            plan.advance_date = payment.date;
            plan.selection_mode = outcome.selection_mode;
            plan.months_covered = outcome.months_covered;
            plan.coverage_start = outcome.coverage_start;
            plan.coverage_end = outcome.coverage_end;
            plan.manual_months = outcome.manual_months.clone();
            plan.remainder = outcome.remainder;

            let mut removed = Vec::new();

            let uncovered: Vec<NaiveDate> = ledger
                .entries_for(plan_id)
                .into_iter()
                .map(|entry| entry.month)
                .filter(|month| !plan.covers(*month))
                .collect();
            for month in uncovered {
                removed.extend(ledger.remove_entry(plan, month));
            }

            // A smaller amount cannot back what was already consumed: drop
            // the latest months until it can.
            while ledger.consumed_amount(plan_id) > plan.advance_amount {
                let latest = ledger.entries_for(plan_id).last().map(|entry| entry.month);
                let Some(latest) = latest else {
                    break;
                };
                removed.extend(ledger.remove_entry(plan, latest));
            }

            plan.status = match outcome.status {
                PlanStatus::Cancelled => PlanStatus::Cancelled,
                _ => PlanStatus::Active,
            };
            ledger.write_back_balance(plan);

            Ok(removed)
        })?;

        if !removed_entries.is_empty() {
            warn!(
                "Resynchronizing plan {} removed {} consumed month(s)",
                plan_id,
                removed_entries.len()
            );
        }
        info!(
            "Updated plan {} from payment {}: {} months from {} to {}",
            plan_id,
            payment.id,
            outcome.months_covered,
            outcome.coverage_start,
            outcome.coverage_end
        );

        Ok(SyncOutcome {
            plan_id,
            action: SyncAction::Updated,
            removed_entries,
            warnings: outcome.warnings,
        })
    }

    /// What the calculator would be asked for an existing payment-backed plan.
    fn request_for_plan(
        &self,
        book: &AdvanceBook,
        plan: &CoveragePlan,
        payment: &PaymentEvent,
    ) -> Result<CoverageRequest> {
        let contract = book.contract(plan.contract_id)?;

        // The rent snapshot is kept unless it was never usable.
        let monthly_rent = if plan.monthly_rent > Decimal::ZERO {
            plan.monthly_rent
        } else {
            contract.monthly_rent
        };

        let request = match plan.selection_mode {
            SelectionMode::Manual => CoverageRequest::manual(
                monthly_rent,
                payment.amount,
                payment.date,
                plan.manual_months.clone(),
            ),
            SelectionMode::Automatic => {
                CoverageRequest::automatic(monthly_rent, payment.amount, payment.date)
            }
        };

        let last_paid = book.last_paid_rent_month_before(plan.contract_id, payment.date);
        Ok(request
            .with_contract_start(contract.start_date)
            .with_last_paid_month(last_paid)
            .stacked_after(anchored_end(book, plan)))
    }

    /// Records an advance entered by hand. No payment is linked.
    pub fn create_advance(
        &self,
        book: &mut AdvanceBook,
        advance: NewAdvance,
        today: NaiveDate,
    ) -> Result<SyncOutcome> {
        let contract = book.contract(advance.contract_id)?.clone();

        let mut anchor = None;
        let request = match &advance.selection {
            AdvanceSelection::Manual(months) => CoverageRequest::manual(
                contract.monthly_rent,
                advance.amount,
                advance.date,
                months.clone(),
            ),
            AdvanceSelection::Automatic { effective_month } => {
                anchor = funded_predecessor(book, contract.id);
                let request =
                    CoverageRequest::automatic(contract.monthly_rent, advance.amount, advance.date)
                        .with_contract_start(contract.start_date)
                        .with_last_paid_month(
                            book.last_paid_rent_month_before(contract.id, advance.date),
                        )
                        .stacked_after(anchor.map(|(_, end)| end));
                match effective_month {
                    Some(month) => request.with_effective_month(*month),
                    None => request,
                }
            }
        };

        // Hand-entered advances are refused outright on a bad rent.
        let outcome = self.calculator.calculate(&request)?;
        let plan_id = book.allocate_plan_id();
        let mut plan = plan_from_outcome(
            plan_id,
            contract.id,
            None,
            advance.amount,
            contract.monthly_rent,
            advance.date,
            &outcome,
            advance.notes,
        );
        plan.stacked_after = anchor.map(|(id, _)| id);

        info!(
            "Created {:?} plan {} for contract {}: {}",
            plan.selection_mode,
            plan_id,
            contract.id,
            plan.months_label()
        );
        book.insert_plan(plan);
        self.apply_consequences(book, contract.id, today);

        Ok(SyncOutcome {
            plan_id,
            action: SyncAction::Created,
            removed_entries: Vec::new(),
            warnings: outcome.warnings,
        })
    }

    /// Compares every advance payment with its plan. Never mutates.
    pub fn verify_all(&self, book: &AdvanceBook) -> Vec<Inconsistency> {
        let mut issues = Vec::new();

        for payment in book.advance_payments() {
            let Some(plan) = book.plan_for_payment(payment.id) else {
                issues.push(Inconsistency {
                    payment_id: payment.id,
                    kind: InconsistencyKind::MissingPlan,
                    expected: "coverage plan".to_string(),
                    actual: "none".to_string(),
                });
                continue;
            };

            if (plan.advance_amount - payment.amount).abs() > self.amount_epsilon {
                issues.push(Inconsistency {
                    payment_id: payment.id,
                    kind: InconsistencyKind::AmountMismatch,
                    expected: payment.amount.to_string(),
                    actual: plan.advance_amount.to_string(),
                });
            }

            if is_cancelled_by_hand(plan) {
                continue;
            }

            let expected = self
                .request_for_plan(book, plan, payment)
                .and_then(|request| self.calculator.calculate_or_cancel(&request));

            match expected {
                Ok(outcome) if outcome.months_covered != plan.months_covered => {
                    issues.push(Inconsistency {
                        payment_id: payment.id,
                        kind: InconsistencyKind::MonthsMismatch,
                        expected: outcome.months_covered.to_string(),
                        actual: plan.months_covered.to_string(),
                    });
                }
                Ok(_) => {}
                Err(err) => warn!("Cannot verify payment {}: {}", payment.id, err),
            }
        }

        if !issues.is_empty() {
            info!("Verification found {} inconsistencies", issues.len());
        }
        issues
    }

    /// Resynchronizes every advance payment. Without `force`, any reported
    /// inconsistency refuses the whole batch before anything is written.
    pub fn repair_all(
        &self,
        book: &mut AdvanceBook,
        force: bool,
        today: NaiveDate,
    ) -> Result<BatchSummary> {
        if !force {
            let issues = self.verify_all(book);
            if !issues.is_empty() {
                warn!(
                    "Repair refused: {} inconsistencies need review",
                    issues.len()
                );
                return Err(AdvanceError::RepairRefused {
                    count: issues.len(),
                });
            }
        }

        // Creation order: an anchor is resynced before the plans stacked on
        // it. Payments without a plan come last.
        let mut payment_ids: Vec<(Option<PlanId>, PaymentId)> = book
            .advance_payments()
            .iter()
            .map(|p| (book.plan_for_payment(p.id).map(|plan| plan.id), p.id))
            .collect();
        payment_ids.sort_by_key(|(plan_id, payment_id)| (plan_id.is_none(), *plan_id, *payment_id));
        let mut summary = BatchSummary::default();

        for (_, payment_id) in payment_ids {
            match self.synchronize(book, payment_id, today) {
                Ok(_) => summary.record_success(),
                Err(err) => {
                    warn!("Repair of payment {} failed: {}", payment_id, err);
                    summary.record_failure(payment_id, err);
                }
            }
        }

        info!(
            "Repair done: {} repaired, {} errors, {} total",
            summary.succeeded, summary.failed, summary.total
        );
        Ok(summary)
    }

    /// Ledger-level checks: balance drift, entries for months that have
    /// not elapsed, entries outside their plan's coverage. Never mutates.
    pub fn audit_ledgers(&self, book: &AdvanceBook, today: NaiveDate) -> Vec<LedgerFinding> {
        let rule = book.ledger().elapsed_rule();
        let mut findings = Vec::new();

        for plan in book.plans() {
            if book.ledger().detect_drift(plan).is_some() {
                findings.push(LedgerFinding::BalanceDrift {
                    plan_id: plan.id,
                    stored: plan.remaining_balance,
                    recomputed: book.ledger().recompute_balance(plan),
                });
            }

            for entry in book.ledger().entries_for(plan.id) {
                if !rule.is_elapsed(entry.month, today) {
                    findings.push(LedgerFinding::FutureEntry {
                        plan_id: plan.id,
                        month: entry.month,
                    });
                }
                if !plan.covers(entry.month) {
                    findings.push(LedgerFinding::OutsideCoverage {
                        plan_id: plan.id,
                        month: entry.month,
                    });
                }
            }
        }

        debug!("Ledger audit on {}: {} findings", today, findings.len());
        findings
    }

    /// Overwrites a plan's stored balance with the ledger-derived one.
    pub fn repair_drift(
        &self,
        book: &mut AdvanceBook,
        plan_id: PlanId,
    ) -> Result<BalanceCorrection> {
        let (plan, ledger) = book.plan_and_ledger_mut(plan_id)?;
        let correction = ledger.write_back_balance(plan);

        if !correction.delta().is_zero() {
            info!(
                "Plan {} balance corrected from {} to {}",
                plan_id, correction.previous, correction.recomputed
            );
        }
        Ok(correction)
    }

    /// Deletes ledger rows for months that have not elapsed yet.
    pub fn purge_future_entries(
        &self,
        book: &mut AdvanceBook,
        today: NaiveDate,
    ) -> Vec<LedgerEntry> {
        let rule = book.ledger().elapsed_rule();
        let future: Vec<(PlanId, NaiveDate)> = book
            .ledger()
            .all_entries()
            .filter(|entry| !rule.is_elapsed(entry.month, today))
            .map(|entry| (entry.plan_id, entry.month))
            .collect();

        let mut removed = Vec::new();
        for (plan_id, month) in future {
            match book.plan_and_ledger_mut(plan_id) {
                Ok((plan, ledger)) => removed.extend(ledger.remove_entry(plan, month)),
                Err(err) => warn!("Cannot purge {} for plan {}: {}", month, plan_id, err),
            }
        }

        if !removed.is_empty() {
            warn!("Purged {} consumption(s) of months not yet elapsed", removed.len());
        }
        removed
    }

    /// Stops a plan from covering anything further. Its ledger stays as is.
    pub fn cancel_plan(
        &self,
        book: &mut AdvanceBook,
        plan_id: PlanId,
        reason: &str,
        today: NaiveDate,
    ) -> Result<()> {
        let plan = book.plan_mut(plan_id)?;
        plan.status = PlanStatus::Cancelled;
        if !plan.notes.is_empty() {
            plan.notes.push('\n');
        }
        plan.notes.push_str(&format!("Annulée le {}: {}", today, reason));
        let contract_id = plan.contract_id;

        info!("Plan {} cancelled: {}", plan_id, reason);
        self.apply_consequences(book, contract_id, today);
        Ok(())
    }

    /// Refreshes what the rest of the system sees of a contract after one of
    /// its plans changed.
    pub fn apply_consequences(
        &self,
        book: &mut AdvanceBook,
        contract_id: ContractId,
        today: NaiveDate,
    ) -> ContractAdvanceSummary {
        let summary = ContractAdvanceSummary::compute(book, contract_id, today);
        debug!(
            "Contract {}: {} active plans, {} remaining, next payment {}",
            contract_id, summary.active_plans, summary.total_remaining, summary.next_payment_month
        );
        book.store_advance_summary(summary.clone());
        summary
    }
}

/// Plans cancelled over an invalid rent cover nothing and are retried on
/// every sync; any other cancelled plan stays cancelled.
fn is_cancelled_by_hand(plan: &CoveragePlan) -> bool {
    plan.status == PlanStatus::Cancelled && plan.months_covered > 0
}

/// Still-funded plan of the contract whose coverage reaches furthest. A new
/// automatic plan starts the month after it, whatever the advance dates.
fn funded_predecessor(
    book: &AdvanceBook,
    contract_id: ContractId,
) -> Option<(PlanId, NaiveDate)> {
    book.plans_for_contract(contract_id)
        .into_iter()
        .filter(|plan| plan.is_active() && plan.remaining_balance > Decimal::ZERO)
        .filter(|plan| plan.months_covered > 0)
        .max_by_key(|plan| (plan.coverage_end, plan.id))
        .map(|plan| (plan.id, plan.coverage_end))
}

/// Coverage end of the plan `plan` was stacked after at creation. The anchor
/// holds even once that plan is exhausted.
fn anchored_end(book: &AdvanceBook, plan: &CoveragePlan) -> Option<NaiveDate> {
    let anchor = book.plan(plan.stacked_after?).ok()?;
    (anchor.months_covered > 0).then_some(anchor.coverage_end)
}

#[allow(clippy::too_many_arguments)]
fn plan_from_outcome(
    id: PlanId,
    contract_id: ContractId,
    payment_id: Option<PaymentId>,
    amount: Decimal,
    monthly_rent: Decimal,
    advance_date: NaiveDate,
    outcome: &CoverageOutcome,
    notes: String,
) -> CoveragePlan {
    CoveragePlan {
        id,
        contract_id,
        payment_id,
        advance_amount: amount,
        monthly_rent,
        selection_mode: outcome.selection_mode,
        months_covered: outcome.months_covered,
        coverage_start: outcome.coverage_start,
        coverage_end: outcome.coverage_end,
        remaining_balance: amount,
        remainder: outcome.remainder,
        status: outcome.status,
        advance_date,
        manual_months: outcome.manual_months.clone(),
        stacked_after: None,
        notes,
    }
}
