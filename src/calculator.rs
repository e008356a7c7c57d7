//! Pure transformation of an advance into its coverage fields.
//!
//! Nothing here touches storage: callers feed in the rent snapshot, the
//! money received and whatever calendar context they have (contract start,
//! last paid rent month, a previous plan to stack after) and persist the
//! resulting [`CoverageOutcome`] themselves.

use crate::config::EngineConfig;
use crate::error::{AdvanceError, Result};
use crate::schema::{PlanStatus, SelectionMode};
use crate::utils::{add_months, first_of_month, next_month};
use chrono::{Datelike, NaiveDate};
use log::{debug, warn};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct CoverageRequest {
    pub monthly_rent: Decimal,
    pub advance_amount: Decimal,
    pub advance_date: NaiveDate,
    pub selection_mode: SelectionMode,
    pub manual_months: Vec<NaiveDate>,
    pub contract_start: Option<NaiveDate>,
    pub last_paid_month: Option<NaiveDate>,
    pub effective_month_override: Option<NaiveDate>,
    /// Coverage end of the latest still-funded plan on the same contract.
    pub stack_after: Option<NaiveDate>,
}

impl CoverageRequest {
    pub fn automatic(
        monthly_rent: Decimal,
        advance_amount: Decimal,
        advance_date: NaiveDate,
    ) -> Self {
        Self {
            monthly_rent,
            advance_amount,
            advance_date,
            selection_mode: SelectionMode::Automatic,
            manual_months: Vec::new(),
            contract_start: None,
            last_paid_month: None,
            effective_month_override: None,
            stack_after: None,
        }
    }

    pub fn manual(
        monthly_rent: Decimal,
        advance_amount: Decimal,
        advance_date: NaiveDate,
        months: Vec<NaiveDate>,
    ) -> Self {
        Self {
            selection_mode: SelectionMode::Manual,
            manual_months: months,
            ..Self::automatic(monthly_rent, advance_amount, advance_date)
        }
    }

    pub fn with_contract_start(mut self, start: NaiveDate) -> Self {
        self.contract_start = Some(start);
        self
    }

    pub fn with_last_paid_month(mut self, month: Option<NaiveDate>) -> Self {
        self.last_paid_month = month;
        self
    }

    pub fn with_effective_month(mut self, month: NaiveDate) -> Self {
        self.effective_month_override = Some(month);
        self
    }

    pub fn stacked_after(mut self, coverage_end: Option<NaiveDate>) -> Self {
        self.stack_after = coverage_end;
        self
    }
}

/// Which rule picked the first covered month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartRule {
    StackedAfterPreviousAdvance,
    EffectiveMonthOverride,
    AfterLastPaidMonth,
    ContractStart,
    AdvanceMonth,
    ManualSelection,
}

/// Non-fatal conditions surfaced alongside a computed coverage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "warning", rename_all = "snake_case")]
pub enum CoverageWarning {
    InsufficientFundsForManualSelection { requested: u32, affordable: u32 },
    InvalidRent { monthly_rent: Decimal },
    MinimumMonthApplied { advance_amount: Decimal, monthly_rent: Decimal },
    LatePaymentShift { day: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoverageOutcome {
    pub selection_mode: SelectionMode,
    pub months_covered: u32,
    pub coverage_start: NaiveDate,
    pub coverage_end: NaiveDate,
    pub remainder: Decimal,
    pub status: PlanStatus,
    pub manual_months: Vec<NaiveDate>,
    pub start_rule: StartRule,
    pub warnings: Vec<CoverageWarning>,
}

impl CoverageOutcome {
    pub fn has_warning(&self, predicate: impl Fn(&CoverageWarning) -> bool) -> bool {
        self.warnings.iter().any(predicate)
    }
}

pub struct CoverageCalculator {
    late_payment_day: u32,
}

impl CoverageCalculator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            late_payment_day: config.late_payment_day,
        }
    }

    pub fn calculate(&self, request: &CoverageRequest) -> Result<CoverageOutcome> {
        if request.monthly_rent <= Decimal::ZERO {
            return Err(AdvanceError::InvalidRent(request.monthly_rent));
        }

        if request.advance_amount <= Decimal::ZERO {
            return Err(AdvanceError::InvalidAmount(request.advance_amount));
        }

        match request.selection_mode {
            SelectionMode::Automatic => self.calculate_automatic(request),
            SelectionMode::Manual => self.calculate_manual(request),
        }
    }

    /// Like [`calculate`](Self::calculate), but an invalid rent degrades into
    /// a cancelled zero-month coverage instead of an error.
    pub fn calculate_or_cancel(&self, request: &CoverageRequest) -> Result<CoverageOutcome> {
        match self.calculate(request) {
            Err(AdvanceError::InvalidRent(rent)) => {
                warn!(
                    "Monthly rent {} is not positive; advance of {} received {} is cancelled",
                    rent, request.advance_amount, request.advance_date
                );
                let month = first_of_month(request.advance_date);
                Ok(CoverageOutcome {
                    selection_mode: request.selection_mode,
                    months_covered: 0,
                    coverage_start: month,
                    coverage_end: month,
                    remainder: Decimal::ZERO,
                    status: PlanStatus::Cancelled,
                    manual_months: Vec::new(),
                    start_rule: StartRule::AdvanceMonth,
                    warnings: vec![CoverageWarning::InvalidRent { monthly_rent: rent }],
                })
            }
            other => other,
        }
    }

    /// Number of months an amount pays for in automatic mode, plus the
    /// leftover amount.
    pub fn automatic_month_count(
        &self,
        monthly_rent: Decimal,
        advance_amount: Decimal,
    ) -> Result<(u32, Decimal)> {
        if monthly_rent <= Decimal::ZERO {
            return Err(AdvanceError::InvalidRent(monthly_rent));
        }

        let whole_months = whole_months(advance_amount, monthly_rent)?;
        let remainder = advance_amount % monthly_rent;

        // Strictly more than half a month's rent buys one more, partial, month.
        let half_rent = monthly_rent * Decimal::new(5, 1);
        let counted = if remainder > half_rent {
            whole_months + 1
        } else {
            whole_months
        };

        // Product review pending: an advance below one month's rent still
        // covers a full month.
        Ok((counted.max(1), remainder))
    }

    fn calculate_automatic(&self, request: &CoverageRequest) -> Result<CoverageOutcome> {
        let (months_covered, remainder) =
            self.automatic_month_count(request.monthly_rent, request.advance_amount)?;

        let mut warnings = Vec::new();
        if request.advance_amount < request.monthly_rent {
            warnings.push(CoverageWarning::MinimumMonthApplied {
                advance_amount: request.advance_amount,
                monthly_rent: request.monthly_rent,
            });
        }

        let (coverage_start, start_rule, shifted) = self.resolve_start(request);
        if shifted {
            warnings.push(CoverageWarning::LatePaymentShift {
                day: request.advance_date.day(),
            });
        }

        let coverage_end = add_months(coverage_start, months_covered - 1);

        debug!(
            "Automatic coverage: {} / {} => {} months ({:?}) from {} to {}, remainder {}",
            request.advance_amount,
            request.monthly_rent,
            months_covered,
            start_rule,
            coverage_start,
            coverage_end,
            remainder
        );

        Ok(CoverageOutcome {
            selection_mode: SelectionMode::Automatic,
            months_covered,
            coverage_start,
            coverage_end,
            remainder,
            status: PlanStatus::Active,
            manual_months: Vec::new(),
            start_rule,
            warnings,
        })
    }

    fn calculate_manual(&self, request: &CoverageRequest) -> Result<CoverageOutcome> {
        let mut months: Vec<NaiveDate> = request
            .manual_months
            .iter()
            .map(|m| first_of_month(*m))
            .collect();
        months.sort();
        months.dedup();

        let Some(&first_month) = months.first() else {
            return Err(AdvanceError::EmptyManualSelection);
        };

        let requested = months.len() as u32;
        let mut warnings = Vec::new();

        let cost = request.monthly_rent * Decimal::from(requested);
        if request.advance_amount < cost {
            let affordable = whole_months(request.advance_amount, request.monthly_rent)?;
            warn!(
                "Manual selection of {} months costs {} but only {} was advanced; \
                 keeping {} months",
                requested, cost, request.advance_amount, affordable
            );
            months.truncate(affordable as usize);
            warnings.push(CoverageWarning::InsufficientFundsForManualSelection {
                requested,
                affordable,
            });
        }

        let months_covered = months.len() as u32;
        let coverage_start = months.first().copied().unwrap_or(first_month);
        let coverage_end = months.last().copied().unwrap_or(coverage_start);
        let remainder =
            request.advance_amount - request.monthly_rent * Decimal::from(months_covered);

        Ok(CoverageOutcome {
            selection_mode: SelectionMode::Manual,
            months_covered,
            coverage_start,
            coverage_end,
            remainder,
            status: PlanStatus::Active,
            manual_months: months,
            start_rule: StartRule::ManualSelection,
            warnings,
        })
    }

    /// Picks the first covered month. Returns whether the late-payment shift
    /// was applied.
    fn resolve_start(&self, request: &CoverageRequest) -> (NaiveDate, StartRule, bool) {
        if let Some(previous_end) = request.stack_after {
            return (
                next_month(first_of_month(previous_end)),
                StartRule::StackedAfterPreviousAdvance,
                false,
            );
        }

        if let Some(month) = request.effective_month_override {
            return (
                first_of_month(month),
                StartRule::EffectiveMonthOverride,
                false,
            );
        }

        let (base, rule) = if let Some(last_paid) = request.last_paid_month {
            (next_month(first_of_month(last_paid)), StartRule::AfterLastPaidMonth)
        } else if let Some(start) = request.contract_start {
            (first_of_month(start), StartRule::ContractStart)
        } else {
            (first_of_month(request.advance_date), StartRule::AdvanceMonth)
        };

        if request.advance_date.day() > self.late_payment_day {
            (next_month(base), rule, true)
        } else {
            (base, rule, false)
        }
    }
}

fn whole_months(amount: Decimal, monthly_rent: Decimal) -> Result<u32> {
    (amount / monthly_rent)
        .floor()
        .to_u32()
        .ok_or(AdvanceError::InvalidAmount(amount))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn calculator() -> CoverageCalculator {
        CoverageCalculator::new(&EngineConfig::default())
    }

    #[test]
    fn test_exact_multiple() {
        let request = CoverageRequest::automatic(dec!(150000), dec!(450000), ymd(2024, 1, 5))
            .with_contract_start(ymd(2024, 1, 1));
        let outcome = calculator().calculate(&request).unwrap();

        assert_eq!(outcome.months_covered, 3);
        assert_eq!(outcome.remainder, dec!(0));
        assert_eq!(outcome.coverage_start, ymd(2024, 1, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 3, 1));
        assert_eq!(outcome.status, PlanStatus::Active);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_remainder_above_half_rent_adds_partial_month() {
        let (months, remainder) = calculator()
            .automatic_month_count(dec!(150000), dec!(400000))
            .unwrap();
        assert_eq!(months, 3, "100000 > 75000 must buy a partial third month");
        assert_eq!(remainder, dec!(100000));
    }

    #[test]
    fn test_remainder_exactly_half_rent_does_not_count() {
        let (months, remainder) = calculator()
            .automatic_month_count(dec!(150000), dec!(375000))
            .unwrap();
        assert_eq!(months, 2, "75000 is not strictly greater than half the rent");
        assert_eq!(remainder, dec!(75000));

        let (months, _) = calculator()
            .automatic_month_count(dec!(150000), dec!(375000.01))
            .unwrap();
        assert_eq!(months, 3);
    }

    #[test]
    fn test_tiny_advance_still_covers_one_month() {
        let request = CoverageRequest::automatic(dec!(150000), dec!(50000), ymd(2024, 3, 2));
        let outcome = calculator().calculate(&request).unwrap();

        assert_eq!(outcome.months_covered, 1);
        assert_eq!(outcome.coverage_start, outcome.coverage_end);
        assert!(outcome.has_warning(|w| matches!(w, CoverageWarning::MinimumMonthApplied { .. })));
    }

    #[test]
    fn test_start_after_last_paid_month() {
        let request = CoverageRequest::automatic(dec!(100000), dec!(200000), ymd(2024, 5, 10))
            .with_contract_start(ymd(2023, 9, 1))
            .with_last_paid_month(Some(ymd(2024, 4, 3)));
        let outcome = calculator().calculate(&request).unwrap();

        assert_eq!(outcome.start_rule, StartRule::AfterLastPaidMonth);
        assert_eq!(outcome.coverage_start, ymd(2024, 5, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 6, 1));
    }

    #[test]
    fn test_late_payment_shifts_start() {
        let on_fifteenth = CoverageRequest::automatic(dec!(100000), dec!(100000), ymd(2024, 5, 15))
            .with_contract_start(ymd(2024, 5, 1));
        let outcome = calculator().calculate(&on_fifteenth).unwrap();
        assert_eq!(outcome.coverage_start, ymd(2024, 5, 1));

        let on_sixteenth = CoverageRequest::automatic(dec!(100000), dec!(100000), ymd(2024, 5, 16))
            .with_contract_start(ymd(2024, 5, 1));
        let outcome = calculator().calculate(&on_sixteenth).unwrap();
        assert_eq!(outcome.coverage_start, ymd(2024, 6, 1));
        assert!(outcome
            .has_warning(|w| matches!(w, CoverageWarning::LatePaymentShift { day: 16 })));
    }

    #[test]
    fn test_override_and_stacking_precedence() {
        let request = CoverageRequest::automatic(dec!(100000), dec!(300000), ymd(2024, 2, 25))
            .with_last_paid_month(Some(ymd(2024, 1, 1)))
            .with_effective_month(ymd(2024, 7, 1));
        let outcome = calculator().calculate(&request).unwrap();
        assert_eq!(outcome.start_rule, StartRule::EffectiveMonthOverride);
        assert_eq!(outcome.coverage_start, ymd(2024, 7, 1));

        let stacked = request.stacked_after(Some(ymd(2024, 3, 1)));
        let outcome = calculator().calculate(&stacked).unwrap();
        assert_eq!(outcome.start_rule, StartRule::StackedAfterPreviousAdvance);
        assert_eq!(outcome.coverage_start, ymd(2024, 4, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 6, 1));
    }

    #[test]
    fn test_manual_truncation() {
        let months = vec![
            ymd(2024, 5, 1),
            ymd(2024, 1, 1),
            ymd(2024, 3, 1),
            ymd(2024, 2, 1),
            ymd(2024, 4, 1),
        ];
        let request =
            CoverageRequest::manual(dec!(100000), dec!(250000), ymd(2023, 12, 20), months);
        let outcome = calculator().calculate(&request).unwrap();

        assert_eq!(outcome.months_covered, 2);
        assert_eq!(outcome.manual_months, vec![ymd(2024, 1, 1), ymd(2024, 2, 1)]);
        assert_eq!(outcome.coverage_start, ymd(2024, 1, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 2, 1));
        assert_eq!(outcome.remainder, dec!(50000));
        assert!(outcome.has_warning(|w| matches!(
            w,
            CoverageWarning::InsufficientFundsForManualSelection {
                requested: 5,
                affordable: 2
            }
        )));
    }

    #[test]
    fn test_manual_selection_sorted_and_deduplicated() {
        let months = vec![ymd(2024, 6, 10), ymd(2024, 2, 1), ymd(2024, 6, 1)];
        let request = CoverageRequest::manual(dec!(100000), dec!(500000), ymd(2024, 1, 3), months);
        let outcome = calculator().calculate(&request).unwrap();

        assert_eq!(outcome.months_covered, 2);
        assert_eq!(outcome.coverage_start, ymd(2024, 2, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 6, 1));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_empty_manual_selection_is_an_error() {
        let request = CoverageRequest::manual(dec!(100000), dec!(500000), ymd(2024, 1, 3), vec![]);
        assert!(matches!(
            calculator().calculate(&request),
            Err(AdvanceError::EmptyManualSelection)
        ));
    }

    #[test]
    fn test_invalid_rent_degrades_to_cancelled() {
        let request = CoverageRequest::automatic(dec!(0), dec!(300000), ymd(2024, 4, 18));
        assert!(matches!(
            calculator().calculate(&request),
            Err(AdvanceError::InvalidRent(_))
        ));

        let outcome = calculator().calculate_or_cancel(&request).unwrap();
        assert_eq!(outcome.status, PlanStatus::Cancelled);
        assert_eq!(outcome.months_covered, 0);
        assert_eq!(outcome.coverage_start, ymd(2024, 4, 1));
        assert_eq!(outcome.coverage_end, ymd(2024, 4, 1));
    }

    #[test]
    fn test_non_positive_amount_rejected() {
        let request = CoverageRequest::automatic(dec!(100000), dec!(0), ymd(2024, 4, 18));
        assert!(matches!(
            calculator().calculate_or_cancel(&request),
            Err(AdvanceError::InvalidAmount(_))
        ));
    }
}
