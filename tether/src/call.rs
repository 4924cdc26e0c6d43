use std::sync::Arc;

use log::debug;

use crate::engine::{EngineCall, RpcEngine};

// -------------------------------------------------------------------------------------------------------

/// One RPC invocation's handle.
///
/// Created through [`crate::channel::Channel::create_call`] and sole owner of
/// its engine handle from then on. It keeps no reference to the channel that
/// spawned it: closing the channel later does not invalidate the call. The
/// handle is released when the call is dropped.
pub struct Call {
    engine: Arc<dyn RpcEngine>,
    handle: EngineCall,
}

impl Call {
    pub(crate) fn new(engine: Arc<dyn RpcEngine>, handle: EngineCall) -> Call {
        Call { engine, handle }
    }

    /// The raw engine handle, for linking child calls to this one.
    pub(crate) fn raw_handle(&self) -> EngineCall {
        self.handle
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        debug!("Destroying call handle {}", self.handle);
        self.engine.destroy_call(self.handle);
    }
}

impl std::fmt::Debug for Call {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Call").field("handle", &self.handle).finish_non_exhaustive()
    }
}
