//! Welcome property negotiation.
//!
//! Folds the server's property list into a [`ServerPolicy`] plus the session
//! parameters and validates the result against client limits.

use std::time::Duration;

use crate::error::{ProtocolError, RelayError, Result};
use crate::policy::{self, ServerPolicy};
use crate::protocol::message::{ServerProperty, Welcome, PROTOCOL_VERSION};

pub const PROP_TAG_DEPTH: &str = "tagdepth";
pub const PROP_SERVER_TIME: &str = "servertime";
pub const PROP_PAYMENT_SCHEME: &str = "payscheme";
pub const PROP_PUSH_PAYMENT_RATE: &str = "pushpayrate";
pub const PROP_PUSH_PAYMENT_RATE_BYTES: &str = "pushpayratebytes";
pub const PROP_PUSH_PAYMENT_RATE_MIN_MATOMS: &str = "pushpayrateminmatoms";
pub const PROP_SUB_PAYMENT_RATE: &str = "subpayrate";
pub const PROP_SERVER_LN_NODE: &str = "serverlnnode";
pub const PROP_EXPIRATION_DAYS: &str = "expirationdays";
pub const PROP_PUSH_PAYMENT_LIFETIME: &str = "pushpaylifetime";
pub const PROP_MAX_PUSH_INVOICES: &str = "maxpushinvoices";
pub const PROP_MAX_MSG_SIZE_VERSION: &str = "maxmsgsizeversion";
pub const PROP_PING_LIMIT: &str = "pinglimit";

pub const PAY_SCHEME_FREE: &str = "free";

pub const MIN_TAG_DEPTH: i64 = 2;
pub const MAX_TAG_DEPTH: i64 = 32;
pub const MIN_PUSH_PAYMENT_LIFETIME: Duration = Duration::from_secs(15 * 60);

/// Result of a successful property fold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiated {
    /// Depth advertised by the server, before reserving the ping tag.
    pub tag_depth: u32,
    pub server_time: i64,
    pub pay_scheme: String,
    pub ln_node: String,
    pub policy: ServerPolicy,
    /// Optional properties the client did not recognize.
    pub ignored: Vec<ServerProperty>,
}

/// Check the version, fold the properties and validate them.
pub fn negotiate(w: &Welcome) -> Result<Negotiated> {
    if w.version != PROTOCOL_VERSION {
        return Err(ProtocolError::Unwelcome(format!(
            "protocol version mismatch: got {} wanted {}",
            w.version, PROTOCOL_VERSION
        ))
        .into());
    }

    let mut policy = ServerPolicy::default();
    let mut tag_depth: i64 = -1;
    let mut server_time: i64 = -1;
    let mut pay_scheme = String::new();
    let mut ln_node = String::new();
    let mut ignored = Vec::new();

    for p in &w.properties {
        match p.key.as_str() {
            PROP_TAG_DEPTH => tag_depth = parse(p, "tag depth")?,
            PROP_SERVER_TIME => server_time = parse(p, "server time")?,
            PROP_PAYMENT_SCHEME => pay_scheme = p.value.clone(),
            PROP_PUSH_PAYMENT_RATE => policy.push_pay_rate = parse(p, "payment rate")?,
            PROP_PUSH_PAYMENT_RATE_BYTES => {
                policy.push_pay_rate_bytes = parse(p, "payment rate bytes")?
            }
            PROP_PUSH_PAYMENT_RATE_MIN_MATOMS => {
                policy.push_pay_rate_min_matoms = parse(p, "payment rate min matoms")?
            }
            PROP_SUB_PAYMENT_RATE => policy.sub_pay_rate = parse(p, "sub payment rate")?,
            PROP_SERVER_LN_NODE => ln_node = p.value.clone(),
            PROP_EXPIRATION_DAYS => policy.expiration_days = parse(p, "expiration days")?,
            PROP_PUSH_PAYMENT_LIFETIME => {
                policy.push_payment_lifetime =
                    Duration::from_secs(parse(p, "push payment lifetime")?)
            }
            PROP_MAX_PUSH_INVOICES => policy.max_push_invoices = parse(p, "max push invoices")?,
            PROP_MAX_MSG_SIZE_VERSION => {
                policy.max_msg_size_version = parse(p, "max msg size version")?;
                policy.max_msg_size =
                    policy::max_msg_size_for_version(policy.max_msg_size_version).unwrap_or(0);
            }
            PROP_PING_LIMIT => policy.ping_limit = Duration::from_secs(parse(p, "ping limit")?),
            _ if p.required => {
                return Err(ProtocolError::Unwelcome(format!(
                    "unhandled server property: {}",
                    p.key
                ))
                .into())
            }
            _ => ignored.push(p.clone()),
        }
    }

    if tag_depth < MIN_TAG_DEPTH {
        return Err(invalid("server did not provide a valid tag depth".into()));
    }
    if tag_depth > MAX_TAG_DEPTH {
        return Err(invalid(format!(
            "tag depth higher than maximum: got {tag_depth}, want {MAX_TAG_DEPTH}"
        )));
    }

    let max_push_rate = policy::PUSH_PAY_RATE_DEFAULT * 10;
    if policy.push_pay_rate > max_push_rate {
        return Err(invalid(format!(
            "push payment rate higher than maximum: got {} want {max_push_rate}",
            policy.push_pay_rate
        )));
    }
    let max_min_rate = policy::PUSH_PAY_RATE_MIN_MATOMS_DEFAULT * 100;
    if policy.push_pay_rate_min_matoms > max_min_rate {
        return Err(invalid(format!(
            "push payment min matoms higher than maximum: got {} want {max_min_rate}",
            policy.push_pay_rate_min_matoms
        )));
    }
    let max_sub_rate = policy::SUB_PAY_RATE_DEFAULT * 10;
    if policy.sub_pay_rate > max_sub_rate {
        return Err(invalid(format!(
            "sub payment rate higher than maximum: got {} want {max_sub_rate}",
            policy.sub_pay_rate
        )));
    }
    if policy.push_payment_lifetime < MIN_PUSH_PAYMENT_LIFETIME {
        return Err(invalid(format!(
            "push payment lifetime lower than minimum: got {:?} want {:?}",
            policy.push_payment_lifetime, MIN_PUSH_PAYMENT_LIFETIME
        )));
    }
    if policy.max_push_invoices < 1 {
        return Err(invalid("max push invoices < 1".into()));
    }
    if server_time == -1 {
        return Err(invalid("server did not provide time".into()));
    }
    if policy.max_msg_size == 0 {
        return Err(ProtocolError::Unwelcome(
            "server did not send a supported max msg size version".into(),
        )
        .into());
    }
    policy.calc_push_cost(policy.max_msg_size).map_err(|e| {
        invalid(format!(
            "invalid combination of push pay rates and max msg size: {e}"
        ))
    })?;
    if policy.expiration_days < 1 {
        return Err(invalid(format!(
            "server provided expiration days {} < 1",
            policy.expiration_days
        )));
    }

    Ok(Negotiated {
        tag_depth: tag_depth as u32,
        server_time,
        pay_scheme,
        ln_node,
        policy,
        ignored,
    })
}

fn parse<T: std::str::FromStr>(p: &ServerProperty, what: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    p.value
        .parse()
        .map_err(|e| invalid(format!("invalid {what} {:?}: {e}", p.value)))
}

fn invalid(msg: String) -> RelayError {
    ProtocolError::InvalidWelcome(msg).into()
}
