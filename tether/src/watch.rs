use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;

use crate::channel::{BridgeResult, Channel};
use crate::completion::{CompletionQueue, Continuation};
use crate::engine::{ConnectivityState, Deadline, EngineChannel, RpcEngine};

// -------------------------------------------------------------------------------------------------------

/// What a connectivity watch resolves to: the state the channel moved to, or
/// notice that the deadline passed first. Timeouts travel this way, never as
/// errors.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum WatchOutcome {
    StateChanged(ConnectivityState),
    DeadlineExceeded,
}

// -------------------------------------------------------------------------------------------------------

/// Hand a one-shot watch to the engine: the continuation goes onto the
/// completion queue first, then the engine learns the tag to resolve it
/// under. The queue's mailbox is always draining, so registration is all it
/// takes to arm delivery.
pub(crate) fn register_watch(
    engine: &Arc<dyn RpcEngine>,
    channel: &EngineChannel,
    queue: &CompletionQueue,
    last_state: ConnectivityState,
    deadline: Deadline,
    continuation: Continuation,
) {
    let tag = queue.register(continuation);
    engine.watch_connectivity_state(channel, last_state, deadline, queue.clone(), tag);
}

// -------------------------------------------------------------------------------------------------------

/// Await-friendly wrapper over the callback watch.
#[async_trait]
pub trait ChannelWatchExt {
    /// Resolves once the connectivity state differs from `last_state`, or
    /// with [`WatchOutcome::DeadlineExceeded`] once `deadline` passes.
    async fn next_state_change(
        &self,
        last_state: ConnectivityState,
        deadline: Deadline,
    ) -> BridgeResult<WatchOutcome>;
}

#[async_trait]
impl ChannelWatchExt for Channel {
    async fn next_state_change(
        &self,
        last_state: ConnectivityState,
        deadline: Deadline,
    ) -> BridgeResult<WatchOutcome> {
        let (tx, rx) = futures::channel::oneshot::channel();

        self.watch_connectivity_state(last_state.raw(), deadline, move |outcome| {
            let _ = tx.send(outcome);
        })?;

        rx.await
            .map_err(|_| anyhow!("connectivity watch was dropped without resolving"))
    }
}
