//! Negotiated server policy and payment arithmetic.

use std::time::Duration;

use crate::error::{PaymentError, Result};

/// Max message size for version 0 of the size table.
pub const MAX_MSG_SIZE_V0: u64 = 1_887_437;

/// Minimum payment for a single push, in milliatoms.
pub const MIN_RM_PUSH_PAYMENT: u64 = 1000;

/// Time before expiry at which an invoice is considered stale.
pub const INVOICE_EXPIRY_AFFORDANCE: Duration = Duration::from_secs(15);

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PING_LIMIT: Duration = Duration::from_secs(45);

pub const PUSH_PAY_RATE_DEFAULT: u64 = 100;
pub const PUSH_PAY_RATE_BYTES_DEFAULT: u64 = 1;
pub const PUSH_PAY_RATE_MIN_MATOMS_DEFAULT: u64 = MIN_RM_PUSH_PAYMENT;
pub const SUB_PAY_RATE_DEFAULT: u64 = 1000;
pub const EXPIRATION_DAYS_DEFAULT: u32 = 7;
pub const PUSH_PAYMENT_LIFETIME_DEFAULT: Duration = Duration::from_secs(15 * 60);
pub const MAX_PUSH_INVOICES_DEFAULT: u32 = 1;
pub const MAX_MSG_SIZE_VERSION_DEFAULT: u32 = 0;

/// Max message size for a size table version, or `None` when unsupported.
pub fn max_msg_size_for_version(version: u32) -> Option<u64> {
    match version {
        0 => Some(MAX_MSG_SIZE_V0),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerPolicy {
    /// Milliatoms per `push_pay_rate_bytes` bytes.
    pub push_pay_rate: u64,
    pub push_pay_rate_bytes: u64,
    pub push_pay_rate_min_matoms: u64,
    /// Milliatoms per subscribed RV.
    pub sub_pay_rate: u64,
    pub expiration_days: u32,
    pub push_payment_lifetime: Duration,
    pub max_push_invoices: u32,
    pub max_msg_size_version: u32,
    pub max_msg_size: u64,
    pub ping_limit: Duration,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            push_pay_rate: PUSH_PAY_RATE_DEFAULT,
            push_pay_rate_bytes: PUSH_PAY_RATE_BYTES_DEFAULT,
            push_pay_rate_min_matoms: PUSH_PAY_RATE_MIN_MATOMS_DEFAULT,
            sub_pay_rate: SUB_PAY_RATE_DEFAULT,
            expiration_days: EXPIRATION_DAYS_DEFAULT,
            push_payment_lifetime: PUSH_PAYMENT_LIFETIME_DEFAULT,
            max_push_invoices: MAX_PUSH_INVOICES_DEFAULT,
            max_msg_size_version: MAX_MSG_SIZE_VERSION_DEFAULT,
            max_msg_size: MAX_MSG_SIZE_V0,
            ping_limit: DEFAULT_PING_LIMIT,
        }
    }
}

impl ServerPolicy {
    /// Cost in milliatoms to push `size` bytes.
    pub fn calc_push_cost(&self, size: u64) -> Result<u64> {
        calc_push_cost(
            self.push_pay_rate_min_matoms,
            self.push_pay_rate,
            self.push_pay_rate_bytes,
            size,
        )
    }

    /// Cost in milliatoms to subscribe to `count` RVs.
    pub fn calc_sub_cost(&self, count: usize) -> Result<u64> {
        (count as u64)
            .checked_mul(self.sub_pay_rate)
            .ok_or_else(|| PaymentError::PushCostOverflow.into())
    }
}

/// `max(size * rate / rate_bytes, min_rate)`, failing when the product
/// overflows or the result does not fit an i64.
pub fn calc_push_cost(min_rate: u64, rate: u64, rate_bytes: u64, size: u64) -> Result<u64> {
    let rate_bytes = rate_bytes.max(1);
    let cost = size
        .checked_mul(rate)
        .ok_or(PaymentError::PushCostOverflow)?
        / rate_bytes;
    if cost > i64::MAX as u64 {
        return Err(PaymentError::PushCostOverflow.into());
    }
    Ok(cost.max(min_rate))
}
