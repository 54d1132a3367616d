use std::time::Duration;

use serde::Deserialize;
use relaynet_core::error::{RejectError, Result};

fn bad(msg: &str) -> relaynet_core::RelayError {
    RejectError::Config(msg.into()).into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub version: u32,

    #[serde(default)]
    pub session: SessionSection,

    #[serde(default)]
    pub keeper: KeeperSection,

    #[serde(default)]
    pub rendezvous: RendezvousSection,

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            version: 1,
            session: SessionSection::default(),
            keeper: KeeperSection::default(),
            rendezvous: RendezvousSection::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(bad("unsupported config version"));
        }

        self.session.validate()?;
        self.keeper.validate()?;
        self.rendezvous.validate()?;

        if self.log_filter.trim().is_empty() {
            return Err(bad("log_filter must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSection {
    /// Zero disables keepalive pings.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default)]
    pub log_pings: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            log_pings: false,
        }
    }
}

impl SessionSection {
    pub fn validate(&self) -> Result<()> {
        if self.ping_interval_ms != 0 && !(1000..=600000).contains(&self.ping_interval_ms) {
            return Err(bad(
                "session.ping_interval_ms must be 0 or between 1000 and 600000",
            ));
        }
        Ok(())
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeeperSection {
    #[serde(default = "default_dial_timeout_ms")]
    pub dial_timeout_ms: u64,

    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    #[serde(default = "default_true")]
    pub go_online: bool,
}

impl Default for KeeperSection {
    fn default() -> Self {
        Self {
            dial_timeout_ms: default_dial_timeout_ms(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            go_online: true,
        }
    }
}

impl KeeperSection {
    pub fn validate(&self) -> Result<()> {
        if !(1000..=300000).contains(&self.dial_timeout_ms) {
            return Err(bad("keeper.dial_timeout_ms must be between 1000 and 300000"));
        }
        if self.reconnect_delay_ms > 600000 {
            return Err(bad("keeper.reconnect_delay_ms must be at most 600000"));
        }
        Ok(())
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendezvousSection {
    #[serde(default = "default_subs_hysteresis_ms")]
    pub subs_hysteresis_ms: u64,
}

impl Default for RendezvousSection {
    fn default() -> Self {
        Self {
            subs_hysteresis_ms: default_subs_hysteresis_ms(),
        }
    }
}

impl RendezvousSection {
    pub fn validate(&self) -> Result<()> {
        if self.subs_hysteresis_ms > 60000 {
            return Err(bad("rendezvous.subs_hysteresis_ms must be at most 60000"));
        }
        Ok(())
    }

    pub fn subs_hysteresis(&self) -> Duration {
        Duration::from_millis(self.subs_hysteresis_ms)
    }
}

fn default_ping_interval_ms() -> u64 {
    30000
}
fn default_dial_timeout_ms() -> u64 {
    30000
}
fn default_reconnect_delay_ms() -> u64 {
    5000
}
fn default_subs_hysteresis_ms() -> u64 {
    1000
}
fn default_log_filter() -> String {
    "info".into()
}
fn default_true() -> bool {
    true
}
