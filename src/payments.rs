//! Derived payment fields for an expense. Amounts are in minor units.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    PartiallyPaid,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentSummary {
    pub amount: i64,
    pub amount_paid: i64,
    pub amount_due: i64,
    pub status: PaymentStatus,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PaymentError {
    #[error("amounts must not be negative, got {0}")]
    NegativeAmount(i64),

    #[error("payment total overflows")]
    Overflow,
}

impl PaymentSummary {
    pub fn for_expense(amount: i64, payments: &[i64]) -> Result<Self, PaymentError> {
        if amount < 0 {
            return Err(PaymentError::NegativeAmount(amount));
        }

        let amount_paid = payments.iter().try_fold(0i64, |total, payment| {
            if *payment < 0 {
                return Err(PaymentError::NegativeAmount(*payment));
            }
            total.checked_add(*payment).ok_or(PaymentError::Overflow)
        })?;

        let status = if amount_paid >= amount {
            PaymentStatus::Paid
        } else if amount_paid > 0 {
            PaymentStatus::PartiallyPaid
        } else {
            PaymentStatus::Unpaid
        };

        Ok(PaymentSummary {
            amount,
            amount_paid,
            amount_due: (amount - amount_paid).max(0),
            status,
        })
    }
}
