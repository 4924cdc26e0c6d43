use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::args::ChannelArgs;
use crate::completion::{CompletionQueue, CompletionTag};

#[cfg(feature = "loopback")]
pub mod loopback;

// -------------------------------------------------------------------------------------------------------

/// Default propagation mask for calls created without explicit flags.
pub const PROPAGATE_DEFAULTS: u32 = 0xffff;

/// Connectivity status of a channel, as reported by the engine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
pub enum ConnectivityState {
    Idle,
    Connecting,
    Ready,
    TransientFailure,
    Shutdown,
}

impl ConnectivityState {
    /// The raw state code used at the embedding boundary.
    pub fn raw(self) -> u32 {
        match self {
            ConnectivityState::Idle => 0,
            ConnectivityState::Connecting => 1,
            ConnectivityState::Ready => 2,
            ConnectivityState::TransientFailure => 3,
            ConnectivityState::Shutdown => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Option<ConnectivityState> {
        match raw {
            0 => Some(ConnectivityState::Idle),
            1 => Some(ConnectivityState::Connecting),
            2 => Some(ConnectivityState::Ready),
            3 => Some(ConnectivityState::TransientFailure),
            4 => Some(ConnectivityState::Shutdown),
            _ => None,
        }
    }
}

// -------------------------------------------------------------------------------------------------------

/// Opaque handle to an engine-side channel. Only the engine that minted it can interpret it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineChannel(pub u128);

impl Display for EngineChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle to an engine-side call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineCall(pub u128);

impl Display for EngineCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Previously-constructed credential material. The bridge never looks inside;
/// engines both mint and validate it.
#[derive(Debug, Clone)]
pub struct ChannelCredentials {
    pub(crate) material: u128,
}

// -------------------------------------------------------------------------------------------------------

/// An absolute point in time, in the shapes an embedding hands over:
/// a millisecond clock reading, a wall-clock instant, or "never".
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Deadline {
    Infinite,
    /// Milliseconds since the unix epoch, as read from a host clock.
    EpochMillis(f64),
    At(SystemTime),
}

impl Deadline {
    /// A deadline `d` from now.
    pub fn after(d: Duration) -> Deadline {
        Deadline::At(SystemTime::now() + d)
    }

    /// False only for values that cannot be converted to an absolute time (NaN clock readings).
    pub fn is_valid(&self) -> bool {
        match self {
            Deadline::EpochMillis(ms) => !ms.is_nan(),
            _ => true,
        }
    }

    /// Time left until the deadline. `None` means it never expires.
    pub fn remaining(&self) -> Option<Duration> {
        match *self {
            Deadline::Infinite => None,
            Deadline::EpochMillis(ms) => {
                if ms.is_infinite() && ms > 0.0 {
                    return None;
                }
                if !ms.is_finite() || ms <= 0.0 {
                    return Some(Duration::ZERO);
                }
                let at = UNIX_EPOCH + Duration::from_secs_f64(ms / 1000.0);
                Some(
                    at.duration_since(SystemTime::now())
                        .unwrap_or(Duration::ZERO),
                )
            }
            Deadline::At(at) => Some(
                at.duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
            ),
        }
    }
}

impl From<f64> for Deadline {
    fn from(ms: f64) -> Deadline {
        Deadline::EpochMillis(ms)
    }
}

impl From<SystemTime> for Deadline {
    fn from(at: SystemTime) -> Deadline {
        Deadline::At(at)
    }
}

// -------------------------------------------------------------------------------------------------------

/// Wire-format encoding of a method or host name. Built immediately before a
/// call is created and dropped right after, whatever the outcome.
pub struct WireString(Box<[u8]>);

impl WireString {
    pub fn encode(s: &str) -> WireString {
        WireString(s.as_bytes().into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

// -------------------------------------------------------------------------------------------------------

/// The RPC engine the bridge delegates all transport work to.
///
/// Channel and call handles returned from here are exclusively owned by the
/// wrappers in [`crate::channel`] and [`crate::call`]; `destroy_*` take them
/// back by value. A `None` from a create operation means the engine refused
/// the handle, which the facade surfaces as a creation failure.
pub trait RpcEngine: Send + Sync {
    fn create_insecure_channel(&self, target: &str, args: &ChannelArgs) -> Option<EngineChannel>;

    fn create_secure_channel(
        &self,
        credentials: &ChannelCredentials,
        target: &str,
        args: &ChannelArgs,
    ) -> Option<EngineChannel>;

    fn destroy_channel(&self, channel: EngineChannel);

    fn get_target(&self, channel: &EngineChannel) -> String;

    fn check_connectivity_state(
        &self,
        channel: &EngineChannel,
        try_to_connect: bool,
    ) -> ConnectivityState;

    /// Register a one-shot state watch. The engine resolves `tag` through
    /// `queue` exactly once: with the new state once it differs from
    /// `last_state`, or with a timeout once `deadline` passes.
    fn watch_connectivity_state(
        &self,
        channel: &EngineChannel,
        last_state: ConnectivityState,
        deadline: Deadline,
        queue: CompletionQueue,
        tag: CompletionTag,
    );

    #[allow(clippy::too_many_arguments)]
    fn create_call(
        &self,
        channel: &EngineChannel,
        parent: Option<EngineCall>,
        propagation_flags: u32,
        queue: &CompletionQueue,
        method: &WireString,
        host: Option<&WireString>,
        deadline: Deadline,
    ) -> Option<EngineCall>;

    fn destroy_call(&self, call: EngineCall);
}
