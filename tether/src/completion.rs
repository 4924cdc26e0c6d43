use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::anyhow;
use log::{debug, error};
use ractor::{
    Actor, ActorProcessingErr, ActorRef, RpcReplyPort, async_trait, concurrency::Duration,
    rpc::CallResult,
};

use crate::watch::WatchOutcome;

// -------------------------------------------------------------------------------------------------------

/// Identifies one registered operation on the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CompletionTag(pub u64);

impl std::fmt::Display for CompletionTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single-invocation continuation. Registered once, resolved exactly once.
pub type Continuation = Box<dyn FnOnce(WatchOutcome) + Send + 'static>;

pub enum CompletionQueueMessage {
    Register(CompletionTag, Continuation),
    Complete(CompletionTag, WatchOutcome),
    PendingOps(RpcReplyPort<usize>),
}

// -------------------------------------------------------------------------------------------------------

struct CompletionQueueActor;

struct CompletionQueueState {
    pending: HashMap<CompletionTag, Continuation>,
}

#[async_trait]
impl Actor for CompletionQueueActor {
    type Msg = CompletionQueueMessage;
    type State = CompletionQueueState;
    type Arguments = ();

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        _args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(CompletionQueueState {
            pending: HashMap::new(),
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            CompletionQueueMessage::Register(tag, continuation) => {
                debug!("Registered operation {tag}");
                if state.pending.insert(tag, continuation).is_some() {
                    error!("Operation tag {tag} was registered twice");
                }
            }

            CompletionQueueMessage::Complete(tag, outcome) => {
                // removing before invoking makes a second resolution impossible
                match state.pending.remove(&tag) {
                    Some(continuation) => {
                        debug!("Resolving operation {tag}: {outcome:?}");
                        continuation(outcome);
                    }
                    None => {
                        error!("Received completion for unknown operation tag: {tag}");
                    }
                }
            }

            CompletionQueueMessage::PendingOps(reply) => {
                reply.send(state.pending.len())?;
            }
        }
        Ok(())
    }
}

// -------------------------------------------------------------------------------------------------------

/// Handle to the completion queue the engine resolves asynchronous operations
/// through. The backing actor's mailbox serializes delivery, so continuations
/// run one at a time, in completion order, off the caller's stack.
#[derive(Clone)]
pub struct CompletionQueue {
    actor: ActorRef<CompletionQueueMessage>,
    next_tag: Arc<AtomicU64>,
}

impl CompletionQueue {
    pub async fn start() -> Result<CompletionQueue, anyhow::Error> {
        let (actor, _handle) = Actor::spawn(None, CompletionQueueActor, ()).await?;
        Ok(CompletionQueue {
            actor,
            next_tag: Arc::new(AtomicU64::new(rand::random::<u32>() as u64)),
        })
    }

    /// Register a continuation and return the tag the engine must resolve it
    /// under. The registration is enqueued before the caller can hand the tag
    /// to the engine, so a completion can never overtake it.
    pub fn register(&self, continuation: Continuation) -> CompletionTag {
        let tag = CompletionTag(self.next_tag.fetch_add(1, Ordering::Relaxed));
        if let Err(err) = self
            .actor
            .cast(CompletionQueueMessage::Register(tag, continuation))
        {
            tracing::error!(
                "Failed to register operation {} with the completion queue: {}",
                tag,
                err
            );
        }
        tag
    }

    /// Resolve a registered operation. Called by the engine; a tag that was
    /// never registered (or already resolved) is logged and dropped.
    pub fn complete(&self, tag: CompletionTag, outcome: WatchOutcome) {
        if let Err(err) = self
            .actor
            .cast(CompletionQueueMessage::Complete(tag, outcome))
        {
            error!("Failed to deliver completion for operation {tag}: {err}");
        }
    }

    /// Number of operations registered but not yet resolved.
    pub async fn pending_ops(&self) -> Result<usize, anyhow::Error> {
        let call_result = self
            .actor
            .call(
                CompletionQueueMessage::PendingOps,
                Some(Duration::from_secs(5)),
            )
            .await?;

        match call_result {
            CallResult::Success(count) => Ok(count),
            CallResult::Timeout => Err(anyhow!("pending_ops: completion queue did not answer")),
            CallResult::SenderError => Err(anyhow!("pending_ops: completion queue dropped the reply")),
        }
    }

    pub fn shutdown(&self) {
        self.actor.stop(Some("Completion queue shut down".into()));
    }
}

// -------------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------------
