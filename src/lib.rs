//! # Rent Advance Engine
//!
//! A library for turning lump-sum rent prepayments ("advances") into covered
//! months, consuming those months as time passes, and keeping the stored
//! coverage consistent with the payments and the consumption ledger.
//!
//! ## Core Concepts
//!
//! - **Coverage Plan**: One advance and the months it pays for, at the rent
//!   snapshotted when it was created
//! - **Consumption Ledger**: Append-only record of consumed months, at most one
//!   row per plan and month
//! - **Elapsed Month**: A month before the current one, or the current one once
//!   today's day reaches the threshold
//! - **Reconciliation**: Read-only verification of plans against payments, plus gated repair
//! - **Progression**: Ledger-derived percentages, severities and alerts
//!
//! ## Example
//!
//! ```rust,ignore
//! use rent_advance_engine::*;
//! use chrono::NaiveDate;
//! use rust_decimal_macros::dec;
//!
//! let mut engine = AdvanceEngine::new(EngineConfig::default()).unwrap();
//! engine.add_contract(Contract {
//!     id: ContractId(1),
//!     monthly_rent: dec!(150000),
//!     monthly_charges: dec!(0),
//!     start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
//!     active: true,
//!     terminated: false,
//! });
//!
//! let today = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
//! engine
//!     .record_payment(
//!         PaymentEvent {
//!             id: PaymentId(1),
//!             contract_id: ContractId(1),
//!             amount: dec!(450000),
//!             date: today,
//!             kind: PaymentKind::Advance,
//!             status: PaymentStatus::Valid,
//!         },
//!         today,
//!     )
//!     .unwrap();
//!
//! let report = engine.run_consumption(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), None);
//! assert_eq!(report.months_consumed(), 2);
//! ```

pub mod calculator;
pub mod config;
pub mod contract_status;
pub mod driver;
pub mod error;
pub mod ledger;
pub mod progression;
pub mod reconciliation;
pub mod schema;
pub mod store;
pub mod utils;

pub use calculator::{
    CoverageCalculator, CoverageOutcome, CoverageRequest, CoverageWarning, StartRule,
};
pub use config::EngineConfig;
pub use contract_status::{
    advance_expiry, advance_for_month, amount_due_for_month, next_payment_month, settle_month,
    total_months_covered, ContractAdvanceSummary, MonthDue,
};
pub use driver::{NextConsumption, PlanSweep, SweepReport, TimeBasedConsumptionDriver};
pub use error::{AdvanceError, Result};
pub use ledger::{BalanceCorrection, ConsumptionLedger, ConsumptionRejection, ElapsedMonthRule};
pub use progression::{
    AdvanceAlert, AggregateReport, ContractReport, PlanProgress, ProgressionReporter, Severity,
};
pub use reconciliation::{
    AdvanceSelection, LedgerFinding, NewAdvance, ReconciliationService, SyncAction, SyncOutcome,
};
pub use schema::*;
pub use store::AdvanceBook;
pub use utils::*;

use chrono::NaiveDate;
use log::{debug, info};

/// Owns the book and wires every service to one configuration.
pub struct AdvanceEngine {
    config: EngineConfig,
    book: AdvanceBook,
    driver: TimeBasedConsumptionDriver,
    reconciliation: ReconciliationService,
    progression: ProgressionReporter,
}

impl AdvanceEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;

        debug!(
            "Advance engine configured: late payment after day {}, months elapse on day {}",
            config.late_payment_day, config.consumption_day_threshold
        );

        Ok(Self {
            book: AdvanceBook::new(&config),
            driver: TimeBasedConsumptionDriver::new(&config),
            reconciliation: ReconciliationService::new(&config),
            progression: ProgressionReporter::new(&config),
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn book(&self) -> &AdvanceBook {
        &self.book
    }

    pub fn book_mut(&mut self) -> &mut AdvanceBook {
        &mut self.book
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    pub fn add_contract(&mut self, contract: Contract) {
        self.book.upsert_contract(contract);
    }

    /// Stores a payment. Advance payments are synchronized into their plan
    /// straight away; anything else is only stored.
    pub fn record_payment(
        &mut self,
        payment: PaymentEvent,
        today: NaiveDate,
    ) -> Result<Option<SyncOutcome>> {
        let payment_id = payment.id;
        let is_advance = payment.kind == PaymentKind::Advance;
        let known = self.book.plan_for_payment(payment_id).is_some();
        let valid = payment.is_valid_advance();
        self.book.record_payment(payment);

        if is_advance && (valid || known) {
            self.reconciliation
                .synchronize(&mut self.book, payment_id, today)
                .map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn create_advance(&mut self, advance: NewAdvance, today: NaiveDate) -> Result<SyncOutcome> {
        self.reconciliation
            .create_advance(&mut self.book, advance, today)
    }

    /// Consumes every elapsed covered month, then refreshes the touched
    /// contracts' summaries.
    pub fn run_consumption(
        &mut self,
        today: NaiveDate,
        contract_id: Option<ContractId>,
    ) -> SweepReport {
        let report = self.driver.sweep_all(&mut self.book, today, contract_id);

        let mut touched: Vec<ContractId> = report
            .plans
            .iter()
            .filter(|sweep| sweep.consumed_any())
            .filter_map(|sweep| sweep.plan_id)
            .filter_map(|plan_id| self.book.plan(plan_id).ok())
            .map(|plan| plan.contract_id)
            .collect();
        touched.sort();
        touched.dedup();

        for contract_id in touched {
            self.reconciliation
                .apply_consequences(&mut self.book, contract_id, today);
        }

        report
    }

    pub fn verify(&self) -> Vec<Inconsistency> {
        self.reconciliation.verify_all(&self.book)
    }

    pub fn repair(&mut self, force: bool, today: NaiveDate) -> Result<BatchSummary> {
        info!("Repair requested (force: {})", force);
        self.reconciliation.repair_all(&mut self.book, force, today)
    }

    pub fn audit(&self, today: NaiveDate) -> Vec<LedgerFinding> {
        self.reconciliation.audit_ledgers(&self.book, today)
    }

    pub fn repair_drift(&mut self, plan_id: PlanId) -> Result<BalanceCorrection> {
        self.reconciliation.repair_drift(&mut self.book, plan_id)
    }

    pub fn purge_future_entries(&mut self, today: NaiveDate) -> Vec<LedgerEntry> {
        self.reconciliation.purge_future_entries(&mut self.book, today)
    }

    pub fn cancel_plan(&mut self, plan_id: PlanId, reason: &str, today: NaiveDate) -> Result<()> {
        self.reconciliation
            .cancel_plan(&mut self.book, plan_id, reason, today)
    }

    pub fn progress(&self, plan_id: PlanId, today: NaiveDate) -> Result<PlanProgress> {
        let plan = self.book.plan(plan_id)?;
        Ok(self
            .progression
            .plan_progress(plan, self.book.ledger(), today))
    }

    pub fn aggregate(&self, today: NaiveDate) -> AggregateReport {
        self.progression.aggregate(&self.book, today)
    }

    pub fn contract_report(
        &self,
        contract_id: ContractId,
        today: NaiveDate,
    ) -> Result<ContractReport> {
        self.progression.contract_report(&self.book, contract_id, today)
    }

    pub fn alerts(&self, today: NaiveDate) -> Vec<AdvanceAlert> {
        self.progression.alerts(&self.book, today)
    }
}
