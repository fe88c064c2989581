//! The in-process `memory` transport.
//!
//! A memory entrypoint publishes its handler table in a process-wide map
//! keyed by service name; the memory client transport calls straight into
//! it. Unary calls invoke the handler directly, streams are simulated with a
//! pair of bounded channels. Both paths honor the same metadata, deadline and
//! cancellation rules as the wire transports.

mod client;
mod server;
mod stream;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use orbkit_errors::OrbError;
use parking_lot::RwLock;

use crate::server::HandlerTable;

pub use client::MemoryTransport;
pub use server::MemoryEntrypoint;

/// Transport and entrypoint plugin name.
pub const NAME: &str = "memory";

static SERVERS: LazyLock<RwLock<HashMap<String, Arc<HandlerTable>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Whether a started memory entrypoint serves `service` in this process.
#[must_use]
pub fn is_serving(service: &str) -> bool {
    SERVERS.read().contains_key(service)
}

fn lookup(service: &str) -> Result<Arc<HandlerTable>, OrbError> {
    SERVERS
        .read()
        .get(service)
        .cloned()
        .ok_or_else(|| OrbError::NOT_FOUND.wrap(format!("no memory server for service {service}")))
}

fn publish(service: &str, table: Arc<HandlerTable>) {
    if SERVERS.write().insert(service.to_owned(), table).is_some() {
        tracing::warn!(%service, "memory server replaced");
    }
}

/// Removes `table` unless another entrypoint replaced it meanwhile.
fn withdraw(service: &str, table: &Arc<HandlerTable>) {
    let mut servers = SERVERS.write();
    if servers.get(service).is_some_and(|t| Arc::ptr_eq(t, table)) {
        servers.remove(service);
    }
}
