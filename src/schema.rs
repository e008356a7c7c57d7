use crate::utils::{first_of_month, french_month_label, months_in_range};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! id_type {
    ($name:ident, $prefix:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }
    };
}

id_type!(ContractId, "CTR");
id_type!(PaymentId, "PAY");
id_type!(PlanId, "AVL");
id_type!(EntryId, "CSM");

/// Lease contract as seen by the advance engine. Owned by the surrounding
/// application; the engine only reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contract {
    pub id: ContractId,
    pub monthly_rent: Decimal,
    #[serde(default)]
    pub monthly_charges: Decimal,
    pub start_date: NaiveDate,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub terminated: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    Rent,
    Advance,
    Deposit,
    Charges,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Valid,
    Refused,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub id: PaymentId,
    pub contract_id: ContractId,
    pub amount: Decimal,
    pub date: NaiveDate,
    pub kind: PaymentKind,
    pub status: PaymentStatus,
}

impl PaymentEvent {
    pub fn is_valid_advance(&self) -> bool {
        self.kind == PaymentKind::Advance && self.status == PaymentStatus::Valid
    }

    pub fn is_valid_rent(&self) -> bool {
        self.kind == PaymentKind::Rent && self.status == PaymentStatus::Valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Active,
    Exhausted,
    Cancelled,
}

/// One lump-sum rent prepayment and the months it pays for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoveragePlan {
    pub id: PlanId,
    pub contract_id: ContractId,
    /// Originating payment; `None` for advances entered by hand.
    pub payment_id: Option<PaymentId>,
    pub advance_amount: Decimal,
    /// Snapshot of the contract rent at creation time.
    pub monthly_rent: Decimal,
    pub selection_mode: SelectionMode,
    pub months_covered: u32,
    pub coverage_start: NaiveDate,
    pub coverage_end: NaiveDate,
    pub remaining_balance: Decimal,
    /// `advance_amount mod monthly_rent`, kept for receipts.
    pub remainder: Decimal,
    pub status: PlanStatus,
    pub advance_date: NaiveDate,
    #[serde(default)]
    pub manual_months: Vec<NaiveDate>,
    /// Plan this one was stacked after when it was created. Coverage always
    /// resumes the month after that plan's end, whatever its balance now.
    #[serde(default)]
    pub stacked_after: Option<PlanId>,
    #[serde(default)]
    pub notes: String,
}

impl CoveragePlan {
    /// Ordered first-of-month dates this plan pays for.
    pub fn covered_months(&self) -> Vec<NaiveDate> {
        if self.months_covered == 0 {
            return Vec::new();
        }

        match self.selection_mode {
            SelectionMode::Manual if !self.manual_months.is_empty() => self.manual_months.clone(),
            _ => months_in_range(self.coverage_start, self.coverage_end),
        }
    }

    pub fn covers(&self, month: NaiveDate) -> bool {
        let month = first_of_month(month);
        if self.months_covered == 0 || month < self.coverage_start || month > self.coverage_end {
            return false;
        }

        match self.selection_mode {
            SelectionMode::Manual if !self.manual_months.is_empty() => {
                self.manual_months.contains(&month)
            }
            _ => true,
        }
    }

    /// True when the covered months form one unbroken run.
    pub fn is_contiguous(&self) -> bool {
        match self.selection_mode {
            SelectionMode::Automatic => true,
            SelectionMode::Manual => {
                let months = self.covered_months();
                months.windows(2).all(|w| crate::utils::next_month(w[0]) == w[1])
            }
        }
    }

    pub fn consumed_amount(&self) -> Decimal {
        self.advance_amount - self.remaining_balance
    }

    pub fn is_active(&self) -> bool {
        self.status == PlanStatus::Active
    }

    /// Receipt text listing the covered months, e.g. "Janvier 2024, Février 2024".
    pub fn months_label(&self) -> String {
        let months = self.covered_months();
        if months.is_empty() {
            return "Aucun mois couvert".to_string();
        }

        months
            .into_iter()
            .map(french_month_label)
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// One consumed month of one plan. Entries are never edited in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub plan_id: PlanId,
    pub month: NaiveDate,
    pub amount_consumed: Decimal,
    pub balance_after: Decimal,
    /// Rent payment the consumption was matched against, if any.
    pub payment_id: Option<PaymentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InconsistencyKind {
    MissingPlan,
    AmountMismatch,
    MonthsMismatch,
}

/// A disagreement between an advance payment and its coverage plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inconsistency {
    pub payment_id: PaymentId,
    pub kind: InconsistencyKind,
    pub expected: String,
    pub actual: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub subject: String,
    pub reason: String,
}

/// Outcome of a batch run. Batches never abort on the first failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub total: usize,
    pub failures: Vec<BatchFailure>,
}

impl BatchSummary {
    pub fn record_success(&mut self) {
        self.succeeded += 1;
        self.total += 1;
    }

    pub fn record_failure(&mut self, subject: impl fmt::Display, reason: impl fmt::Display) {
        self.failed += 1;
        self.total += 1;
        self.failures.push(BatchFailure {
            subject: subject.to_string(),
            reason: reason.to_string(),
        });
    }
}
