//! Invoice fetching and validation shared by the outbound queue and the
//! rendezvous manager.

use tracing::debug;

use relaynet_core::error::{PaymentError, ProtocolError, RelayError, Result};
use relaynet_core::policy::INVOICE_EXPIRY_AFFORDANCE;
use relaynet_core::protocol::{GetInvoice, InvoiceAction, Payload};

use crate::intf::{DecodedInvoice, PaymentClient, ServerSession};

/// Request a fresh invoice for `action` and check it is payable.
pub async fn fetch_invoice(sess: &dyn ServerSession, action: InvoiceAction) -> Result<String> {
    let req = Payload::GetInvoice(GetInvoice {
        payment_scheme: sess.pay_scheme().to_string(),
        action,
    });
    let invoice = match sess.request(req).await? {
        Payload::GetInvoiceReply(r) => r.invoice,
        Payload::Ack(ack) if !ack.error.is_empty() => {
            return Err(RelayError::Application {
                code: ack.error_code,
                msg: ack.error,
                non_fatal: ack.non_fatal,
            })
        }
        other => return Err(ProtocolError::UnexpectedReply(other.command().to_string()).into()),
    };

    check_invoice(sess.pay_client().as_ref(), &invoice).await?;
    Ok(invoice)
}

/// Decode `invoice` and require it to be zero-amount and not about to expire.
pub async fn check_invoice(pc: &dyn PaymentClient, invoice: &str) -> Result<DecodedInvoice> {
    let decoded = pc.decode_invoice(invoice).await?;
    if decoded.is_expired(INVOICE_EXPIRY_AFFORDANCE) {
        return Err(PaymentError::InvoiceExpired.into());
    }
    if decoded.amount_matoms != 0 {
        return Err(PaymentError::NonZeroInvoice.into());
    }
    Ok(decoded)
}

/// Whether a cached invoice can still be paid.
pub async fn is_usable(pc: &dyn PaymentClient, invoice: &str) -> bool {
    if invoice.is_empty() {
        return false;
    }
    match check_invoice(pc, invoice).await {
        Ok(_) => true,
        Err(e) => {
            debug!(error = %e, "discarding cached invoice");
            false
        }
    }
}
