//! Handler tables and the per-transport muxes generated code registers on.
//!
//! Every entrypoint owns one [`HandlerTable`]. The mux types are thin,
//! transport-named views over it; a [`RegistrationFn`] receives one of them
//! wrapped in [`ServerMux`] and matches on the variant.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use orbkit_errors::OrbError;
use parking_lot::RwLock;

use super::middleware::{self, ServerMiddleware};
use crate::codec;
use crate::context::Context;
use crate::message::{DynMessage, Message, MessageFactory, factory};
use crate::stream::{RawStream, ServerStream};

pub type UnaryHandler = Arc<
    dyn Fn(Context, Box<dyn DynMessage>) -> BoxFuture<'static, Result<Box<dyn DynMessage>, OrbError>>
        + Send
        + Sync,
>;

pub type StreamHandler =
    Arc<dyn Fn(Box<dyn RawStream>) -> BoxFuture<'static, Result<(), OrbError>> + Send + Sync>;

#[derive(Clone)]
pub enum Method {
    Unary {
        /// Builds the empty request value to decode into.
        request: MessageFactory,
        handler: UnaryHandler,
    },
    Stream(StreamHandler),
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unary { .. } => f.write_str("Unary"),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

fn unknown_endpoint(endpoint: &str) -> OrbError {
    OrbError::NOT_FOUND.wrap(format!("unknown endpoint {endpoint}"))
}

/// Handlers of one entrypoint keyed by `/<service>/<Method>`.
pub struct HandlerTable {
    methods: RwLock<HashMap<String, Method>>,
    endpoints: RwLock<BTreeSet<String>>,
    middlewares: Vec<Arc<dyn ServerMiddleware>>,
    handler_timeout: Duration,
}

impl HandlerTable {
    /// `handler_timeout` bounds every unary handler; zero disables it.
    #[must_use]
    pub fn new(middlewares: Vec<Arc<dyn ServerMiddleware>>, handler_timeout: Duration) -> Self {
        Self {
            methods: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(BTreeSet::new()),
            middlewares,
            handler_timeout,
        }
    }

    /// Registers a type-erased unary handler, wrapped in the middleware chain.
    pub fn add_unary(&self, endpoint: &str, request: MessageFactory, handler: UnaryHandler) {
        let handler = middleware::chain(&self.middlewares, handler);
        self.insert(endpoint, Method::Unary { request, handler });
    }

    pub fn add_stream(&self, endpoint: &str, handler: StreamHandler) {
        self.insert(endpoint, Method::Stream(handler));
    }

    fn insert(&self, endpoint: &str, method: Method) {
        if self.methods.write().insert(endpoint.to_owned(), method).is_some() {
            tracing::warn!(%endpoint, "handler replaced");
        }
    }

    /// Declares an endpoint to be advertised in the registry.
    pub fn add_endpoint(&self, endpoint: &str) {
        self.endpoints.write().insert(endpoint.to_owned());
    }

    #[must_use]
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints.read().iter().cloned().collect()
    }

    #[must_use]
    pub fn method(&self, endpoint: &str) -> Option<Method> {
        self.methods.read().get(endpoint).cloned()
    }

    #[must_use]
    pub fn handler_timeout(&self) -> Duration {
        self.handler_timeout
    }

    /// Decodes `body` into the request type registered for `endpoint`.
    ///
    /// # Errors
    /// 404 for an unknown or streaming endpoint, 400 for an undecodable body
    /// or an unsupported content type.
    pub fn decode_request(
        &self,
        endpoint: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Box<dyn DynMessage>, OrbError> {
        let Some(Method::Unary { request, .. }) = self.method(endpoint) else {
            return Err(unknown_endpoint(endpoint));
        };
        let mut msg = request();
        codec::unmarshal(content_type, body, msg.as_mut())?;
        Ok(msg)
    }

    /// Runs the unary handler for `endpoint` under the handler timeout.
    ///
    /// The handler's writes to `ctx.outgoing()` are visible to the caller.
    ///
    /// # Errors
    /// 404 for an unknown endpoint, 504 on handler timeout, or the handler's
    /// error.
    pub async fn invoke_unary(
        &self,
        ctx: &Context,
        endpoint: &str,
        req: Box<dyn DynMessage>,
    ) -> Result<Box<dyn DynMessage>, OrbError> {
        let Some(Method::Unary { handler, .. }) = self.method(endpoint) else {
            return Err(unknown_endpoint(endpoint));
        };
        let ctx = ctx.with_timeout(self.handler_timeout);
        ctx.run(handler(ctx.clone(), req)).await
    }

    /// Runs the streaming handler for `endpoint` until it returns.
    ///
    /// # Errors
    /// 404 for an unknown endpoint, or the handler's error.
    pub async fn invoke_stream(&self, endpoint: &str, stream: Box<dyn RawStream>) -> Result<(), OrbError> {
        let Some(Method::Stream(handler)) = self.method(endpoint) else {
            return Err(unknown_endpoint(endpoint));
        };
        handler(stream).await
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("methods", &self.methods.read().keys().collect::<Vec<_>>())
            .field("endpoints", &*self.endpoints.read())
            .field("handler_timeout", &self.handler_timeout)
            .finish_non_exhaustive()
    }
}

fn typed_unary<Req, Resp, F, Fut>(f: F) -> UnaryHandler
where
    Req: Message,
    Resp: Message,
    F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, OrbError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |ctx, req| {
        let f = Arc::clone(&f);
        Box::pin(async move {
            let req = req.downcast::<Req>()?;
            let resp = f(ctx, req).await?;
            Ok(Box::new(resp) as Box<dyn DynMessage>)
        })
    })
}

fn typed_stream<Req, Resp, F, Fut>(f: F) -> StreamHandler
where
    Req: Message,
    Resp: Message,
    F: Fn(ServerStream<Req, Resp>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), OrbError>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |raw| {
        let f = Arc::clone(&f);
        Box::pin(async move { f(ServerStream::new(raw)).await })
    })
}

macro_rules! mux {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone)]
        pub struct $name {
            table: Arc<HandlerTable>,
        }

        impl $name {
            #[must_use]
            pub fn new(table: Arc<HandlerTable>) -> Self {
                Self { table }
            }

            #[must_use]
            pub fn table(&self) -> &Arc<HandlerTable> {
                &self.table
            }

            pub fn add_unary<Req, Resp, F, Fut>(&self, endpoint: &str, f: F)
            where
                Req: Message,
                Resp: Message,
                F: Fn(Context, Req) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<Resp, OrbError>> + Send + 'static,
            {
                self.table.add_unary(endpoint, factory::<Req>(), typed_unary(f));
            }

            pub fn add_endpoint(&self, endpoint: &str) {
                self.table.add_endpoint(endpoint);
            }
        }
    };
}

macro_rules! streaming {
    ($name:ident) => {
        impl $name {
            pub fn add_stream<Req, Resp, F, Fut>(&self, endpoint: &str, f: F)
            where
                Req: Message,
                Resp: Message,
                F: Fn(ServerStream<Req, Resp>) -> Fut + Send + Sync + 'static,
                Fut: Future<Output = Result<(), OrbError>> + Send + 'static,
            {
                self.table.add_stream(endpoint, typed_stream(f));
            }
        }
    };
}

mux!(
    /// Handlers served by the `grpc`/`grpcs` entrypoint.
    GrpcMux
);
mux!(
    /// Handlers served by the `drpc` entrypoint.
    DrpcMux
);
mux!(
    /// Handlers served by the HTTP entrypoints. Unary only.
    HttpMux
);
mux!(
    /// Handlers served in-process by the `memory` entrypoint.
    MemoryMux
);
streaming!(GrpcMux);
streaming!(DrpcMux);
streaming!(MemoryMux);

/// The server object a [`RegistrationFn`] receives.
#[non_exhaustive]
#[derive(Debug, Clone, Copy)]
pub enum ServerMux<'a> {
    Grpc(&'a GrpcMux),
    Drpc(&'a DrpcMux),
    Http(&'a HttpMux),
    Memory(&'a MemoryMux),
}

impl ServerMux<'_> {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Grpc(_) => "grpc",
            Self::Drpc(_) => "drpc",
            Self::Http(_) => "http",
            Self::Memory(_) => "memory",
        }
    }
}

/// Binds one service's handlers to whichever mux it is given.
pub type RegistrationFn = Arc<dyn Fn(ServerMux<'_>) + Send + Sync>;
