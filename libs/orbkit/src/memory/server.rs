use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use orbkit_errors::OrbError;

use super::{NAME, publish, withdraw};
use crate::server::{
    Entrypoint, EntrypointRegistration, EntrypointSetup, MemoryMux, RegistrationFn, ServerMux,
};

/// Serves handlers to memory-transport clients in the same process.
#[derive(Debug)]
pub struct MemoryEntrypoint {
    name: String,
    service: String,
    mux: MemoryMux,
    started: AtomicBool,
}

impl MemoryEntrypoint {
    #[must_use]
    pub fn new(setup: EntrypointSetup) -> Self {
        Self {
            name: setup.config.name,
            service: setup.service,
            mux: MemoryMux::new(setup.table),
            started: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Entrypoint for MemoryEntrypoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn transport(&self) -> &'static str {
        NAME
    }

    fn register(&self, f: &RegistrationFn) {
        f(ServerMux::Memory(&self.mux));
    }

    fn endpoints(&self) -> Vec<String> {
        self.mux.table().endpoints()
    }

    fn address(&self) -> String {
        String::new()
    }

    async fn start(&self) -> Result<(), OrbError> {
        if !self.started.swap(true, Ordering::SeqCst) {
            publish(&self.service, Arc::clone(self.mux.table()));
        }
        Ok(())
    }

    async fn stop(&self) -> Result<(), OrbError> {
        if self.started.swap(false, Ordering::SeqCst) {
            withdraw(&self.service, self.mux.table());
        }
        Ok(())
    }
}

#[allow(clippy::unnecessary_wraps)]
fn factory(setup: EntrypointSetup) -> Result<Arc<dyn Entrypoint>, OrbError> {
    Ok(Arc::new(MemoryEntrypoint::new(setup)))
}

inventory::submit! {
    EntrypointRegistration { transports: &[NAME], factory }
}
