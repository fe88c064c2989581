//! Server middleware, applied to unary handlers on every entrypoint.

use std::sync::Arc;
use std::time::Instant;

use orbkit_errors::OrbError;

use super::mux::UnaryHandler;
use crate::client::MiddlewareConfig;
use crate::metadata;

pub trait ServerMiddleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Wraps `next` once, when the handler is registered.
    fn wrap(&self, next: UnaryHandler) -> UnaryHandler;
}

pub type ServerMiddlewareFactory = fn(&MiddlewareConfig) -> Result<Arc<dyn ServerMiddleware>, OrbError>;

/// Link-time registration of a server middleware under `name`.
pub struct ServerMiddlewareRegistration {
    pub name: &'static str,
    pub factory: ServerMiddlewareFactory,
}

inventory::collect!(ServerMiddlewareRegistration);

/// Instantiates the configured server middlewares, in order.
///
/// # Errors
/// Returns 400 for an unregistered name.
pub fn from_config(configs: &[MiddlewareConfig]) -> Result<Vec<Arc<dyn ServerMiddleware>>, OrbError> {
    configs
        .iter()
        .map(|cfg| {
            let reg = inventory::iter::<ServerMiddlewareRegistration>
                .into_iter()
                .find(|r| r.name == cfg.name)
                .ok_or_else(|| {
                    OrbError::BAD_REQUEST.wrap(format!("server middleware '{}' not found", cfg.name))
                })?;
            (reg.factory)(cfg)
        })
        .collect()
}

pub(super) fn chain(middlewares: &[Arc<dyn ServerMiddleware>], handler: UnaryHandler) -> UnaryHandler {
    middlewares.iter().rev().fold(handler, |next, m| m.wrap(next))
}

/// Logs each handled call with its duration and outcome.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMiddleware;

impl ServerMiddleware for LogMiddleware {
    fn name(&self) -> &'static str {
        "log"
    }

    fn wrap(&self, next: UnaryHandler) -> UnaryHandler {
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let service = ctx.incoming().get(metadata::SERVICE).unwrap_or_default();
                let method = ctx.incoming().get(metadata::METHOD).unwrap_or_default();
                let started = Instant::now();
                let res = next(ctx, req).await;
                let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
                match &res {
                    Ok(_) => tracing::debug!(%service, %method, elapsed_ms, "handled request"),
                    Err(err) => tracing::warn!(
                        %service,
                        %method,
                        elapsed_ms,
                        code = err.code(),
                        error = %err,
                        "handler failed"
                    ),
                }
                res
            })
        })
    }
}

#[allow(clippy::unnecessary_wraps)]
fn log_factory(_cfg: &MiddlewareConfig) -> Result<Arc<dyn ServerMiddleware>, OrbError> {
    Ok(Arc::new(LogMiddleware))
}

inventory::submit! {
    ServerMiddlewareRegistration { name: "log", factory: log_factory }
}
