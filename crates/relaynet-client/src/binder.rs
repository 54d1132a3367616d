//! Fans session transitions from the [`ConnKeeper`] out to the outbound
//! queue and the rendezvous manager.

use tokio_util::sync::CancellationToken;
use tracing::debug;

use relaynet_core::error::{RelayError, Result, Subsystem};

use crate::connkeeper::ConnKeeper;
use crate::rendezvous::RvManager;
use crate::rmq::Rmq;

#[derive(Debug, Clone)]
pub struct SessionBinder {
    keeper: ConnKeeper,
    rmq: Rmq,
    rvm: RvManager,
}

impl SessionBinder {
    pub fn new(keeper: ConnKeeper, rmq: Rmq, rvm: RvManager) -> Self {
        Self { keeper, rmq, rvm }
    }

    /// Rebind on every transition until `cancel` fires or one of the
    /// components exits.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        loop {
            let sess = self.keeper.next_session(&cancel).await;
            if cancel.is_cancelled() {
                return Ok(());
            }
            if sess.is_none() && self.keeper.is_done() {
                return Err(RelayError::Exiting(Subsystem::ConnKeeper));
            }
            debug!(bound = sess.is_some(), "session transition");
            self.rmq.bind_to_session(sess.clone()).await?;
            self.rvm.bind_to_session(sess).await?;
        }
    }
}
