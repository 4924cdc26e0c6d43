use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info};
use tokio::sync::watch;

use crate::args::ChannelArgs;
use crate::completion::{CompletionQueue, CompletionTag};
use crate::watch::WatchOutcome;

use super::{
    ChannelCredentials, ConnectivityState, Deadline, EngineCall, EngineChannel, RpcEngine,
    WireString,
};

// -------------------------------------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// State a freshly created channel reports.
    pub initial_state: ConnectivityState,
    /// How long a simulated connect takes to go from Connecting to Ready.
    pub connect_latency: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> LoopbackConfig {
        LoopbackConfig {
            initial_state: ConnectivityState::Idle,
            connect_latency: Duration::from_millis(20),
        }
    }
}

// -------------------------------------------------------------------------------------------------------

/// What the engine remembers about one created call.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub handle: EngineCall,
    pub channel: EngineChannel,
    pub method: String,
    pub host: Option<String>,
    pub parent: Option<EngineCall>,
    pub propagation_flags: u32,
    pub deadline: Deadline,
    pub released: bool,
}

struct ChannelEntry {
    target: String,
    secured: bool,
    args: ChannelArgs,
    // shared with connect/watch tasks; send_replace only needs &self
    state: Arc<watch::Sender<ConnectivityState>>,
}

#[derive(Default)]
struct LoopbackState {
    channels: HashMap<EngineChannel, ChannelEntry>,
    calls: HashMap<EngineCall, CallRecord>,
    issued_credentials: Vec<u128>,
    fail_next_create: bool,
}

/// A fully in-memory engine: no sockets, no frames, just bookkeeping and
/// simulated connectivity transitions. Backs the test suite and the demo app.
pub struct LoopbackEngine {
    config: LoopbackConfig,
    inner: Mutex<LoopbackState>,
}

impl LoopbackEngine {
    pub fn new() -> LoopbackEngine {
        LoopbackEngine::with_config(LoopbackConfig::default())
    }

    pub fn with_config(config: LoopbackConfig) -> LoopbackEngine {
        LoopbackEngine {
            config,
            inner: Mutex::new(LoopbackState::default()),
        }
    }

    /// Mint credential material this engine will accept back.
    pub fn issue_credentials(&self) -> ChannelCredentials {
        let material = rand::random::<u128>();
        self.lock().issued_credentials.push(material);
        ChannelCredentials { material }
    }

    /// Make the next channel creation fail, as a refusing engine would.
    pub fn fail_next_channel_create(&self) {
        self.lock().fail_next_create = true;
    }

    /// Drive every channel with the given target to `state`, waking its watchers.
    pub fn transition(&self, target: &str, state: ConnectivityState) {
        let inner = self.lock();
        for entry in inner.channels.values().filter(|e| e.target == target) {
            info!("loopback: channel to {target} moves to {state:?}");
            entry.state.send_replace(state);
        }
    }

    /// Whether the channel to `target` came through the secure creation path.
    pub fn channel_secured(&self, target: &str) -> Option<bool> {
        let inner = self.lock();
        inner
            .channels
            .values()
            .find(|e| e.target == target)
            .map(|e| e.secured)
    }

    /// The argument list a channel to `target` was created with.
    pub fn channel_args(&self, target: &str) -> Option<ChannelArgs> {
        let inner = self.lock();
        inner
            .channels
            .values()
            .find(|e| e.target == target)
            .map(|e| e.args.clone())
    }

    pub fn open_channels(&self) -> usize {
        self.lock().channels.len()
    }

    /// Every call ever created, released or not, in no particular order.
    pub fn calls(&self) -> Vec<CallRecord> {
        self.lock().calls.values().cloned().collect()
    }

    fn create_channel(
        &self,
        target: &str,
        args: &ChannelArgs,
        secured: bool,
    ) -> Option<EngineChannel> {
        let mut inner = self.lock();
        if inner.fail_next_create {
            inner.fail_next_create = false;
            return None;
        }

        let handle = EngineChannel(uuid::Uuid::new_v4().to_u128_le());
        let (state, _) = watch::channel(self.config.initial_state);
        inner.channels.insert(
            handle,
            ChannelEntry {
                target: target.to_string(),
                secured,
                args: args.clone(),
                state: Arc::new(state),
            },
        );

        info!(
            "loopback: created {} channel {handle} to {target}",
            if secured { "secure" } else { "insecure" }
        );
        Some(handle)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LoopbackEngine {
    fn default() -> LoopbackEngine {
        LoopbackEngine::new()
    }
}

// -------------------------------------------------------------------------------------------------------

impl RpcEngine for LoopbackEngine {
    fn create_insecure_channel(&self, target: &str, args: &ChannelArgs) -> Option<EngineChannel> {
        self.create_channel(target, args, false)
    }

    fn create_secure_channel(
        &self,
        credentials: &ChannelCredentials,
        target: &str,
        args: &ChannelArgs,
    ) -> Option<EngineChannel> {
        if !self
            .lock()
            .issued_credentials
            .contains(&credentials.material)
        {
            info!("loopback: refusing secure channel to {target}: unknown credential material");
            return None;
        }
        self.create_channel(target, args, true)
    }

    fn destroy_channel(&self, channel: EngineChannel) {
        let entry = self.lock().channels.remove(&channel);
        if let Some(entry) = entry {
            info!("loopback: destroyed channel {channel} to {}", entry.target);
            // pending watchers observe the shutdown instead of hanging
            entry.state.send_replace(ConnectivityState::Shutdown);
        }
    }

    fn get_target(&self, channel: &EngineChannel) -> String {
        self.lock()
            .channels
            .get(channel)
            .map(|e| e.target.clone())
            .unwrap_or_default()
    }

    fn check_connectivity_state(
        &self,
        channel: &EngineChannel,
        try_to_connect: bool,
    ) -> ConnectivityState {
        let inner = self.lock();
        let Some(entry) = inner.channels.get(channel) else {
            return ConnectivityState::Shutdown;
        };

        let current = *entry.state.borrow();
        if try_to_connect && current == ConnectivityState::Idle {
            debug!("loopback: channel {channel} starts connecting");
            entry.state.send_replace(ConnectivityState::Connecting);

            let state = entry.state.clone();
            let latency = self.config.connect_latency;
            tokio::spawn(async move {
                tokio::time::sleep(latency).await;
                if *state.borrow() == ConnectivityState::Connecting {
                    state.send_replace(ConnectivityState::Ready);
                }
            });
        }
        current
    }

    fn watch_connectivity_state(
        &self,
        channel: &EngineChannel,
        last_state: ConnectivityState,
        deadline: Deadline,
        queue: CompletionQueue,
        tag: CompletionTag,
    ) {
        let mut rx = {
            let inner = self.lock();
            match inner.channels.get(channel) {
                Some(entry) => entry.state.subscribe(),
                None => {
                    queue.complete(tag, WatchOutcome::StateChanged(ConnectivityState::Shutdown));
                    return;
                }
            }
        };

        let expires_at = deadline
            .remaining()
            .map(|left| tokio::time::Instant::now() + left);

        tokio::spawn(async move {
            loop {
                let current = *rx.borrow_and_update();
                if current != last_state {
                    queue.complete(tag, WatchOutcome::StateChanged(current));
                    return;
                }

                let changed = match expires_at {
                    Some(at) => tokio::select! {
                        changed = rx.changed() => changed,
                        _ = tokio::time::sleep_until(at) => {
                            queue.complete(tag, WatchOutcome::DeadlineExceeded);
                            return;
                        }
                    },
                    None => rx.changed().await,
                };

                if changed.is_err() {
                    // sender gone, the channel entry was torn down
                    queue.complete(tag, WatchOutcome::StateChanged(ConnectivityState::Shutdown));
                    return;
                }
            }
        });
    }

    fn create_call(
        &self,
        channel: &EngineChannel,
        parent: Option<EngineCall>,
        propagation_flags: u32,
        _queue: &CompletionQueue,
        method: &WireString,
        host: Option<&WireString>,
        deadline: Deadline,
    ) -> Option<EngineCall> {
        let mut inner = self.lock();
        if !inner.channels.contains_key(channel) {
            return None;
        }
        if let Some(parent) = parent {
            if !inner.calls.contains_key(&parent) {
                return None;
            }
        }

        let handle = EngineCall(uuid::Uuid::new_v4().to_u128_le());
        let record = CallRecord {
            handle,
            channel: *channel,
            method: String::from_utf8_lossy(method.as_bytes()).into_owned(),
            host: host.map(|h| String::from_utf8_lossy(h.as_bytes()).into_owned()),
            parent,
            propagation_flags,
            deadline,
            released: false,
        };
        debug!(
            "loopback: created call {handle} on channel {channel} for {}",
            record.method
        );
        inner.calls.insert(handle, record);
        Some(handle)
    }

    fn destroy_call(&self, call: EngineCall) {
        if let Some(record) = self.lock().calls.get_mut(&call) {
            record.released = true;
        }
    }
}

// -------------------------------------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------------------------------------
