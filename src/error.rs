use crate::ledger::ConsumptionRejection;
use crate::schema::{ContractId, PaymentId, PlanId};
use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AdvanceError {
    #[error("Invalid monthly rent {0}: must be strictly positive")]
    InvalidRent(Decimal),

    #[error("Invalid advance amount {0}: must be strictly positive")]
    InvalidAmount(Decimal),

    #[error("Manual month selection is empty")]
    EmptyManualSelection,

    #[error("Date calculation error: {0}")]
    DateError(String),

    #[error("Contract not found: {0}")]
    ContractNotFound(ContractId),

    #[error("Payment not found: {0}")]
    PaymentNotFound(PaymentId),

    #[error("Coverage plan not found: {0}")]
    PlanNotFound(PlanId),

    #[error("Payment {0} is not a valid advance payment")]
    NotAnAdvancePayment(PaymentId),

    #[error("Coverage plan {0} is not active")]
    PlanNotActive(PlanId),

    #[error("Consumption rejected: {0}")]
    ConsumptionRejected(#[from] ConsumptionRejection),

    #[error("Repair refused: {count} inconsistencies need review (use force to override)")]
    RepairRefused { count: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AdvanceError>;
