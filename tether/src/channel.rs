use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use serde_json::Value;

use crate::args::encode_channel_args;
use crate::call::Call;
use crate::completion::CompletionQueue;
use crate::engine::{
    ChannelCredentials, ConnectivityState, Deadline, EngineChannel, PROPAGATE_DEFAULTS, RpcEngine,
    WireString,
};
use crate::watch::{self, WatchOutcome};

// -------------------------------------------------------------------------------------------------------

pub type BridgeResult<T> = Result<T, anyhow::Error>;

/// Everything that can go wrong synchronously at the channel surface.
/// Timeouts are not here: a watch that runs out of time resolves through its
/// callback, it does not raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The caller handed over a value of the wrong shape.
    TypeMismatch(String),
    /// The named operation needs an open channel, and this one was closed.
    AlreadyClosed(&'static str),
    /// The engine refused to produce a handle.
    CreationFailed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::TypeMismatch(what) => write!(f, "{what}"),
            ChannelError::AlreadyClosed(op) => {
                write!(f, "Cannot call {op} on a closed channel")
            }
            ChannelError::CreationFailed => write!(f, "The engine failed to create the handle"),
        }
    }
}

impl std::error::Error for ChannelError {}

// -------------------------------------------------------------------------------------------------------

/// Sole owner of one engine channel handle.
///
/// The handle is either live or gone, never dangling: `close` takes it out
/// under the lock and hands it back to the engine exactly once, and every
/// operation that needs it goes through the same lock, so a close is visible
/// to the very next operation issued.
struct RawChannel {
    engine: Arc<dyn RpcEngine>,
    handle: Mutex<Option<EngineChannel>>,
}

impl RawChannel {
    fn new(engine: Arc<dyn RpcEngine>, handle: EngineChannel) -> RawChannel {
        RawChannel {
            engine,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Idempotent: the first close releases the handle, later ones (and the
    /// eventual drop) find nothing left to do.
    fn close(&self) {
        let taken = self.lock().take();
        if let Some(handle) = taken {
            debug!("Destroying channel handle {handle}");
            self.engine.destroy_channel(handle);
        }
    }

    /// Run `op` against the live handle, or fail because `name` was invoked
    /// on a closed channel. The lock is held across the engine call.
    fn with_handle<T>(
        &self,
        name: &'static str,
        op: impl FnOnce(&EngineChannel) -> T,
    ) -> BridgeResult<T> {
        let guard = self.lock();
        match guard.as_ref() {
            Some(handle) => Ok(op(handle)),
            None => Err(ChannelError::AlreadyClosed(name).into()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<EngineChannel>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RawChannel {
    fn drop(&mut self) {
        self.close();
    }
}

// -------------------------------------------------------------------------------------------------------

/// A long-lived, reusable link to one RPC target.
///
/// Created through [`Channel::connect`], closed explicitly through
/// [`Channel::close`] or implicitly on drop. Once closed, every query and
/// call-creation operation fails with [`ChannelError::AlreadyClosed`]; calls
/// created earlier keep working, their lifetime is their own.
pub struct Channel {
    raw: RawChannel,
    queue: CompletionQueue,
}

impl Channel {
    /// Build a channel to `target`. Without credentials the engine creates an
    /// unauthenticated channel, with credentials a secured one. `options` is
    /// the host's configuration mapping, encoded per [`crate::args`]; the
    /// encoded list only lives for the duration of the engine call.
    pub fn connect(
        engine: Arc<dyn RpcEngine>,
        queue: CompletionQueue,
        target: &str,
        credentials: Option<&ChannelCredentials>,
        options: Option<&Value>,
    ) -> BridgeResult<Channel> {
        let args = encode_channel_args(options)?;

        let handle = match credentials {
            None => engine.create_insecure_channel(target, &args),
            Some(credentials) => engine.create_secure_channel(credentials, target, &args),
        };
        drop(args);

        let Some(handle) = handle else {
            return Err(ChannelError::CreationFailed.into());
        };

        info!("Created channel {handle} to {target}");
        Ok(Channel {
            raw: RawChannel::new(engine, handle),
            queue,
        })
    }

    /// Release the underlying handle. Safe to call any number of times.
    pub fn close(&self) {
        self.raw.close();
    }

    pub fn is_open(&self) -> bool {
        self.raw.is_open()
    }

    /// The target string the engine resolved for this channel.
    pub fn target(&self) -> BridgeResult<String> {
        self.raw
            .with_handle("getTarget", |handle| self.raw.engine.get_target(handle))
    }

    /// Current connectivity state. With `try_to_connect` the engine is also
    /// asked to start connecting if it was idle.
    pub fn connectivity_state(&self, try_to_connect: bool) -> BridgeResult<ConnectivityState> {
        self.raw.with_handle("getConnectivityState", |handle| {
            self.raw
                .engine
                .check_connectivity_state(handle, try_to_connect)
        })
    }

    /// Register a one-shot watch: `callback` is invoked exactly once, with
    /// the new state once it differs from `last_state`, or with a timeout
    /// notice once `deadline` passes. Never blocks; all precondition
    /// failures surface here, synchronously, before anything is registered.
    pub fn watch_connectivity_state<F>(
        &self,
        last_state: u32,
        deadline: Deadline,
        callback: F,
    ) -> BridgeResult<()>
    where
        F: FnOnce(WatchOutcome) + Send + 'static,
    {
        let Some(last_state) = ConnectivityState::from_raw(last_state) else {
            return Err(ChannelError::TypeMismatch(format!(
                "watchConnectivityState's first argument must be a connectivity state code, got {last_state}"
            ))
            .into());
        };
        if !deadline.is_valid() {
            return Err(ChannelError::TypeMismatch(
                "watchConnectivityState's second argument must be a date or a number".to_string(),
            )
            .into());
        }

        self.raw.with_handle("watchConnectivityState", |handle| {
            watch::register_watch(
                &self.raw.engine,
                handle,
                &self.queue,
                last_state,
                deadline,
                Box::new(callback),
            );
        })
    }

    /// Spawn a call on this channel. The returned [`Call`] owns its handle
    /// outright and survives a later [`Channel::close`]. An omitted
    /// `propagation_flags` means [`PROPAGATE_DEFAULTS`]; a `parent` links the
    /// new call to an existing one for cancellation and deadline propagation.
    pub fn create_call(
        &self,
        method: &str,
        deadline: Deadline,
        host: Option<&str>,
        parent: Option<&Call>,
        propagation_flags: Option<u32>,
    ) -> BridgeResult<Call> {
        if !deadline.is_valid() {
            return Err(ChannelError::TypeMismatch(
                "createCall's second argument must be a date or a number".to_string(),
            )
            .into());
        }
        let flags = propagation_flags.unwrap_or(PROPAGATE_DEFAULTS);

        let created = self.raw.with_handle("createCall", |handle| {
            // transient wire encodings, dropped on every path out of this block
            let method = WireString::encode(method);
            let host = host.map(WireString::encode);

            self.raw.engine.create_call(
                handle,
                parent.map(Call::raw_handle),
                flags,
                &self.queue,
                &method,
                host.as_ref(),
                deadline,
            )
        })?;

        let Some(handle) = created else {
            return Err(ChannelError::CreationFailed.into());
        };

        debug!("Created call {handle} for method {method}");
        Ok(Call::new(self.raw.engine.clone(), handle))
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("open", &self.raw.is_open())
            .finish_non_exhaustive()
    }
}

static_assertions::assert_impl_all!(Channel: Send, Sync);
