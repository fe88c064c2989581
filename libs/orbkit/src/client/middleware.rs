//! Client middleware chains.
//!
//! A middleware wraps the next handler once, when the client is built; the
//! per-call work happens inside the returned closure. The first registered
//! middleware is the outermost one.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures::future::BoxFuture;
use orbkit_errors::OrbError;

use super::options::{CallOptions, MiddlewareConfig};
use super::transport::RawResponse;
use crate::context::Context;
use crate::message::DynMessage;
use crate::registry::Node;

/// A codec-mediated call travelling down the chain.
#[derive(Clone)]
pub struct RawRequest {
    pub service: String,
    pub endpoint: String,
    pub body: Bytes,
    pub opts: Arc<CallOptions>,
    /// Node picked before the first attempt, if any.
    pub node: Option<Node>,
}

/// A call whose transport does its own encoding.
#[derive(Clone)]
pub struct NoCodecRequest {
    pub service: String,
    pub endpoint: String,
    pub request: Arc<dyn DynMessage>,
    /// Empty value of the expected response type.
    pub result: Arc<dyn DynMessage>,
    pub opts: Arc<CallOptions>,
    pub node: Option<Node>,
}

pub type RequestHandler =
    Arc<dyn Fn(Context, RawRequest) -> BoxFuture<'static, Result<RawResponse, OrbError>> + Send + Sync>;

pub type NoCodecHandler = Arc<
    dyn Fn(Context, NoCodecRequest) -> BoxFuture<'static, Result<Box<dyn DynMessage>, OrbError>>
        + Send
        + Sync,
>;

pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn request(&self, next: RequestHandler) -> RequestHandler;

    fn request_no_codec(&self, next: NoCodecHandler) -> NoCodecHandler;
}

/// Builds a middleware from its configuration entry.
pub type MiddlewareFactory = fn(&MiddlewareConfig) -> Result<Arc<dyn Middleware>, OrbError>;

/// Link-time registration of a client middleware under `name`.
pub struct MiddlewareRegistration {
    pub name: &'static str,
    pub factory: MiddlewareFactory,
}

inventory::collect!(MiddlewareRegistration);

/// Instantiates the configured middlewares, in order.
///
/// # Errors
/// Returns 400 for a name no linked crate registered.
pub fn from_config(configs: &[MiddlewareConfig]) -> Result<Vec<Arc<dyn Middleware>>, OrbError> {
    configs
        .iter()
        .map(|cfg| {
            let reg = inventory::iter::<MiddlewareRegistration>
                .into_iter()
                .find(|r| r.name == cfg.name)
                .ok_or_else(|| {
                    OrbError::BAD_REQUEST.wrap(format!("client middleware '{}' not found", cfg.name))
                })?;
            (reg.factory)(cfg)
        })
        .collect()
}

pub(crate) fn chain_request(middlewares: &[Arc<dyn Middleware>], terminal: RequestHandler) -> RequestHandler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, m| m.request(next))
}

pub(crate) fn chain_no_codec(
    middlewares: &[Arc<dyn Middleware>],
    terminal: NoCodecHandler,
) -> NoCodecHandler {
    middlewares
        .iter()
        .rev()
        .fold(terminal, |next, m| m.request_no_codec(next))
}

/// Logs every call with its duration and outcome. Never alters the result.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMiddleware;

fn log_outcome<T>(service: &str, endpoint: &str, started: Instant, res: &Result<T, OrbError>) {
    let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    match res {
        Ok(_) => tracing::debug!(%service, %endpoint, elapsed_ms, "client call succeeded"),
        Err(err) => tracing::warn!(
            %service,
            %endpoint,
            elapsed_ms,
            code = err.code(),
            error = %err,
            "client call failed"
        ),
    }
}

impl Middleware for LogMiddleware {
    fn name(&self) -> &'static str {
        "log"
    }

    fn request(&self, next: RequestHandler) -> RequestHandler {
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let (service, endpoint) = (req.service.clone(), req.endpoint.clone());
                let started = Instant::now();
                let res = next(ctx, req).await;
                log_outcome(&service, &endpoint, started, &res);
                res
            })
        })
    }

    fn request_no_codec(&self, next: NoCodecHandler) -> NoCodecHandler {
        Arc::new(move |ctx, req| {
            let next = Arc::clone(&next);
            Box::pin(async move {
                let (service, endpoint) = (req.service.clone(), req.endpoint.clone());
                let started = Instant::now();
                let res = next(ctx, req).await;
                log_outcome(&service, &endpoint, started, &res);
                res
            })
        })
    }
}

#[allow(clippy::unnecessary_wraps)]
fn log_factory(_cfg: &MiddlewareConfig) -> Result<Arc<dyn Middleware>, OrbError> {
    Ok(Arc::new(LogMiddleware))
}

inventory::submit! {
    MiddlewareRegistration { name: "log", factory: log_factory }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    struct Recording {
        name: &'static str,
        seen: Arc<Mutex<Vec<&'static str>>>,
        short_circuit: bool,
    }

    impl Middleware for Recording {
        fn name(&self) -> &'static str {
            self.name
        }

        fn request(&self, next: RequestHandler) -> RequestHandler {
            let (name, seen, stop) = (self.name, Arc::clone(&self.seen), self.short_circuit);
            Arc::new(move |ctx, req| {
                let next = Arc::clone(&next);
                let seen = Arc::clone(&seen);
                Box::pin(async move {
                    seen.lock().push(name);
                    if stop {
                        return Err(OrbError::FORBIDDEN);
                    }
                    next(ctx, req).await
                })
            })
        }

        fn request_no_codec(&self, next: NoCodecHandler) -> NoCodecHandler {
            next
        }
    }

    fn request() -> RawRequest {
        RawRequest {
            service: "svc".to_owned(),
            endpoint: "/svc/M".to_owned(),
            body: Bytes::new(),
            opts: Arc::new(CallOptions::default()),
            node: None,
        }
    }

    fn terminal(seen: Arc<Mutex<Vec<&'static str>>>) -> RequestHandler {
        Arc::new(move |_ctx, _req| {
            let seen = Arc::clone(&seen);
            Box::pin(async move {
                seen.lock().push("terminal");
                Ok(RawResponse::default())
            })
        })
    }

    #[tokio::test]
    async fn test_first_registered_is_outermost() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording { name: "a", seen: seen.clone(), short_circuit: false }),
            Arc::new(Recording { name: "b", seen: seen.clone(), short_circuit: false }),
        ];
        let call = chain_request(&mws, terminal(seen.clone()));
        call(Context::background(), request()).await.unwrap();
        assert_eq!(*seen.lock(), vec!["a", "b", "terminal"]);
    }

    #[tokio::test]
    async fn test_short_circuit_skips_next() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mws: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recording { name: "gate", seen: seen.clone(), short_circuit: true }),
            Arc::new(Recording { name: "inner", seen: seen.clone(), short_circuit: false }),
        ];
        let call = chain_request(&mws, terminal(seen.clone()));
        let err = call(Context::background(), request()).await.unwrap_err();
        assert_eq!(err.code(), 403);
        assert_eq!(*seen.lock(), vec!["gate"]);
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn test_log_reports_outcome() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let ok = LogMiddleware.request(terminal(seen));
        ok(Context::background(), request()).await.unwrap();
        assert!(logs_contain("client call succeeded"));

        let failing: RequestHandler = Arc::new(|_ctx, _req| Box::pin(async { Err(OrbError::NOT_FOUND) }));
        let err = LogMiddleware.request(failing)(Context::background(), request())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(logs_contain("client call failed"));
    }

    #[test]
    fn test_log_is_registered() {
        let mws = from_config(&[MiddlewareConfig { name: "log".to_owned() }]).unwrap();
        assert_eq!(mws[0].name(), "log");
        assert!(from_config(&[MiddlewareConfig { name: "nope".to_owned() }]).is_err());
    }
}
