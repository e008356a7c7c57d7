use crate::config::EngineConfig;
use crate::contract_status::ContractAdvanceSummary;
use crate::error::{AdvanceError, Result};
use crate::ledger::ConsumptionLedger;
use crate::schema::{
    Contract, ContractId, CoveragePlan, PaymentEvent, PaymentId, PlanId, PlanStatus,
};
use crate::utils::first_of_month;
use chrono::NaiveDate;
use log::warn;
use std::collections::BTreeMap;

/// In-process store for contracts, payments, coverage plans and the
/// consumption ledger.
#[derive(Debug, Clone)]
pub struct AdvanceBook {
    contracts: BTreeMap<ContractId, Contract>,
    payments: BTreeMap<PaymentId, PaymentEvent>,
    plans: BTreeMap<PlanId, CoveragePlan>,
    ledger: ConsumptionLedger,
    summaries: BTreeMap<ContractId, ContractAdvanceSummary>,
    next_plan_id: u64,
}

impl AdvanceBook {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            contracts: BTreeMap::new(),
            payments: BTreeMap::new(),
            plans: BTreeMap::new(),
            ledger: ConsumptionLedger::new(config),
            summaries: BTreeMap::new(),
            next_plan_id: 1,
        }
    }

    pub fn upsert_contract(&mut self, contract: Contract) {
        self.contracts.insert(contract.id, contract);
    }

    pub fn contract(&self, id: ContractId) -> Result<&Contract> {
        self.contracts
            .get(&id)
            .ok_or(AdvanceError::ContractNotFound(id))
    }

    pub fn contracts(&self) -> impl Iterator<Item = &Contract> {
        self.contracts.values()
    }

    pub fn record_payment(&mut self, payment: PaymentEvent) {
        self.payments.insert(payment.id, payment);
    }

    pub fn payment(&self, id: PaymentId) -> Result<&PaymentEvent> {
        self.payments
            .get(&id)
            .ok_or(AdvanceError::PaymentNotFound(id))
    }

    pub fn payments(&self) -> impl Iterator<Item = &PaymentEvent> {
        self.payments.values()
    }

    /// Valid advance payments, oldest first.
    pub fn advance_payments(&self) -> Vec<&PaymentEvent> {
        let mut payments: Vec<&PaymentEvent> = self
            .payments
            .values()
            .filter(|p| p.is_valid_advance())
            .collect();
        payments.sort_by_key(|p| (p.date, p.id));
        payments
    }

    /// Month of the most recent valid rent payment on a contract.
    pub fn last_paid_rent_month(&self, contract_id: ContractId) -> Option<NaiveDate> {
        self.payments
            .values()
            .filter(|p| p.contract_id == contract_id && p.is_valid_rent())
            .map(|p| first_of_month(p.date))
            .max()
    }

    /// Month of the latest valid rent payment made on or before `date`.
    pub fn last_paid_rent_month_before(
        &self,
        contract_id: ContractId,
        date: NaiveDate,
    ) -> Option<NaiveDate> {
        self.payments
            .values()
            .filter(|p| p.contract_id == contract_id && p.is_valid_rent() && p.date <= date)
            .map(|p| first_of_month(p.date))
            .max()
    }

    pub(crate) fn allocate_plan_id(&mut self) -> PlanId {
        let id = PlanId(self.next_plan_id);
        self.next_plan_id += 1;
        id
    }

    pub(crate) fn insert_plan(&mut self, plan: CoveragePlan) {
        if plan.id.0 >= self.next_plan_id {
            self.next_plan_id = plan.id.0 + 1;
        }
        self.plans.insert(plan.id, plan);
    }

    pub fn plan(&self, id: PlanId) -> Result<&CoveragePlan> {
        self.plans.get(&id).ok_or(AdvanceError::PlanNotFound(id))
    }

    pub fn plan_mut(&mut self, id: PlanId) -> Result<&mut CoveragePlan> {
        self.plans.get_mut(&id).ok_or(AdvanceError::PlanNotFound(id))
    }

    pub fn plans(&self) -> impl Iterator<Item = &CoveragePlan> {
        self.plans.values()
    }

    pub fn plan_for_payment(&self, payment_id: PaymentId) -> Option<&CoveragePlan> {
        self.plans
            .values()
            .find(|plan| plan.payment_id == Some(payment_id))
    }

    /// Plans of one contract ordered by advance date, then id.
    pub fn plans_for_contract(&self, contract_id: ContractId) -> Vec<&CoveragePlan> {
        let mut plans: Vec<&CoveragePlan> = self
            .plans
            .values()
            .filter(|plan| plan.contract_id == contract_id)
            .collect();
        plans.sort_by_key(|plan| (plan.advance_date, plan.id));
        plans
    }

    pub fn active_plan_ids(&self, contract_id: Option<ContractId>) -> Vec<PlanId> {
        self.plans
            .values()
            .filter(|plan| plan.status == PlanStatus::Active)
            .filter(|plan| contract_id.map_or(true, |id| plan.contract_id == id))
            .map(|plan| plan.id)
            .collect()
    }

    /// Advance summary last stored for a contract by an explicit refresh.
    pub fn advance_summary(&self, contract_id: ContractId) -> Option<&ContractAdvanceSummary> {
        self.summaries.get(&contract_id)
    }

    pub(crate) fn store_advance_summary(&mut self, summary: ContractAdvanceSummary) {
        self.summaries.insert(summary.contract_id, summary);
    }

    pub fn ledger(&self) -> &ConsumptionLedger {
        &self.ledger
    }

    /// Mutable access to one plan together with the ledger.
    pub fn plan_and_ledger_mut(
        &mut self,
        id: PlanId,
    ) -> Result<(&mut CoveragePlan, &mut ConsumptionLedger)> {
        let plan = self
            .plans
            .get_mut(&id)
            .ok_or(AdvanceError::PlanNotFound(id))?;
        Ok((plan, &mut self.ledger))
    }

    /// Runs `f` as an all-or-nothing unit for one plan: if it fails, the
    /// plan and its ledger rows are put back as they were. Other plans are
    /// not touched either way.
    pub fn in_plan_transaction<T, F>(&mut self, plan_id: PlanId, f: F) -> Result<T>
    where
        F: FnOnce(&mut AdvanceBook) -> Result<T>,
    {
        let plan_snapshot = self.plan(plan_id)?.clone();
        let entries_snapshot: Vec<_> = self
            .ledger
            .entries_for(plan_id)
            .into_iter()
            .cloned()
            .collect();

        match f(self) {
            Ok(value) => Ok(value),
            Err(err) => {
                warn!("Rolling back plan {} after error: {}", plan_id, err);
                self.plans.insert(plan_id, plan_snapshot);
                self.ledger.restore_plan_entries(plan_id, entries_snapshot);
                Err(err)
            }
        }
    }
}
