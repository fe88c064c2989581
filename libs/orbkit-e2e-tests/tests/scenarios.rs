#![allow(clippy::unwrap_used, clippy::expect_used)]

//! End-to-end scenarios against real entrypoints, driven through the
//! generated clients.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http::header::CONTENT_TYPE;
use http_body_util::{BodyExt as _, Full};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use orbkit::codec::{MIME_JSON, MIME_PROTO};
use orbkit::pool::{Connector, Pool, PoolConfig};
use orbkit::registry::kv::{KvRegistry, KvRegistryConfig};
use orbkit::registry::{MemoryRegistry, MemoryRegistryConfig, RegisterOptions};
use orbkit::tls::TlsConfig;
use orbkit::{CallOptions, ClientConfig, Context, EntrypointConfig, Metadata, Node, OrbError, Registry, Service};
use orbkit_e2e_tests::Harness;
use orbkit_e2e_tests::handlers::{NAME_BOOM, NAME_ERROR, NAME_SLEEP, TOKEN, TRACING_ID};
use orbkit_e2e_tests::proto::echo::{CallRequest, ENDPOINT_STREAMS_CALL};
use orbkit_e2e_tests::proto::file::FileChunk;
use orbkit_transport_drpc::envelope::Envelope;
use orbkit_transport_drpc::{DrpcConn, DrpcConnector, Kind};

const UNARY_TRANSPORTS: &[&str] = &["memory", "grpc", "drpc", "http", "h2c"];
const STREAM_TRANSPORTS: &[&str] = &["memory", "grpc", "drpc"];

fn prefer(transport: &str) -> ClientConfig {
    ClientConfig::default()
        .with_retries(0)
        .with_preferred_transports([transport])
}

fn req(name: &str) -> CallRequest {
    CallRequest { name: name.to_owned() }
}

#[tokio::test]
async fn test_s1_unary_echo_over_http1() {
    let h = Harness::start("e2e.s1", &["http"], prefer("http")).await.unwrap();
    let client = HyperClient::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let request = http::Request::post(format!("http://{}{ENDPOINT_STREAMS_CALL}", h.address("http").unwrap()))
        .header(CONTENT_TYPE, MIME_JSON)
        .body(Full::new(Bytes::from_static(br#"{"name":"Alex"}"#)))
        .unwrap();
    let resp = client.request(request).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], MIME_JSON);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), br#"{"msg":"Hello Alex"}"#);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_s2_unary_echo_over_grpc() {
    let h = Harness::start("e2e.s2", &["grpc"], prefer("grpc")).await.unwrap();
    let resp = h
        .echo()
        .call(&Context::background(), &req("Alex"), h.client.options())
        .await
        .unwrap();
    assert_eq!(resp.msg, "Hello Alex");
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_unary_echo_on_every_transport_and_codec() {
    for &transport in UNARY_TRANSPORTS {
        let service = format!("e2e.unary.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        for content_type in [MIME_PROTO, MIME_JSON] {
            let resp = h
                .echo()
                .call(&Context::background(), &req("Alex"), h.client.options().with_content_type(content_type))
                .await
                .unwrap();
            assert_eq!(resp.msg, "Hello Alex", "{transport} {content_type}");
        }
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_s3_request_timeout() {
    for &transport in UNARY_TRANSPORTS {
        let service = format!("e2e.s3.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let started = Instant::now();
        let err = h
            .echo()
            .call(
                &Context::background(),
                &req(NAME_SLEEP),
                h.client.options().with_request_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), 504, "{transport}");
        assert!(started.elapsed() <= Duration::from_millis(150), "{transport} took {:?}", started.elapsed());
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_context_deadline_beats_request_timeout() {
    let h = Harness::start("e2e.deadline", &["drpc"], prefer("drpc")).await.unwrap();
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    let started = Instant::now();
    let err = h.echo().call(&ctx, &req(NAME_SLEEP), h.client.options()).await.unwrap_err();
    assert_eq!(err.code(), 504);
    assert!(started.elapsed() < Duration::from_millis(150));
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_cancellation_returns_promptly() {
    for transport in ["memory", "drpc", "grpc"] {
        let service = format!("e2e.cancel.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });
        let started = Instant::now();
        let err = h.echo().call(&ctx, &req(NAME_SLEEP), h.client.options()).await.unwrap_err();
        assert_eq!(err.code(), 499, "{transport}");
        assert!(started.elapsed() < Duration::from_millis(200), "{transport}");
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_s4_metadata_round_trip() {
    for &transport in UNARY_TRANSPORTS {
        let service = format!("e2e.s4.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let ctx = Context::background();
        ctx.outgoing().set("authorization", TOKEN);
        let response = Metadata::new();
        let resp = h
            .echo()
            .authorized_call(&ctx, &req("Alex"), h.client.options().with_response_metadata(response.clone()))
            .await
            .unwrap();
        assert_eq!(resp.msg, "Hello Alex");
        assert_eq!(response.get("tracing-id").as_deref(), Some(TRACING_ID), "{transport}");

        // Keys set by the caller reach the handler, which echoes this one.
        let ctx = Context::background();
        ctx.outgoing().set("echo", "ping");
        let response = Metadata::new();
        h.echo()
            .call(&ctx, &req("md"), h.client.options().with_response_metadata(response.clone()))
            .await
            .unwrap();
        assert_eq!(response.get("echo").as_deref(), Some("ping"), "{transport}");
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_s5_unauthorized_rejection() {
    for &transport in UNARY_TRANSPORTS {
        let service = format!("e2e.s5.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let err = h
            .echo()
            .authorized_call(&Context::background(), &req("Alex"), h.client.options())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 401, "{transport}");

        let err = h
            .echo()
            .call(&Context::background(), &req(NAME_ERROR), h.client.options())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 401, "{transport}");
        h.stop().await.unwrap();
    }
}

/// Counts dials and live connections around the DRPC connector.
#[derive(Clone, Default)]
struct Counting {
    dials: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    max_live: Arc<AtomicUsize>,
}

struct CountedConn {
    conn: DrpcConn,
    live: Arc<AtomicUsize>,
}

impl Drop for CountedConn {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for Counting {
    type Conn = CountedConn;

    async fn connect(&self, address: &str) -> Result<CountedConn, OrbError> {
        let conn = DrpcConnector.connect(address).await?;
        self.dials.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(CountedConn {
            conn,
            live: Arc::clone(&self.live),
        })
    }
}

async fn drpc_call(conn: &mut DrpcConn, name: &str) -> Envelope {
    let md = std::collections::HashMap::from([("content-type".to_owned(), MIME_JSON.to_owned())]);
    conn.invoke(ENDPOINT_STREAMS_CALL, md).await.unwrap();
    let body = format!(r#"{{"name":"{name}"}}"#);
    conn.send(Kind::Message, Bytes::from(body)).await.unwrap();
    conn.send(Kind::CloseSend, Bytes::new()).await.unwrap();
    let reply = conn.recv().await.unwrap();
    assert_eq!(reply.kind, Kind::Message);
    let envelope = Envelope::from_frame(&reply.data).unwrap();
    assert_eq!(conn.recv().await.unwrap().kind, Kind::Close);
    envelope
}

#[tokio::test]
async fn test_s6_pool_recycling() {
    let h = Harness::start("e2e.s6", &["drpc"], prefer("drpc")).await.unwrap();
    let address = h.address("drpc").unwrap();
    let counting = Counting::default();
    let pool = Pool::new(
        counting.clone(),
        PoolConfig::default()
            .with_size(2)
            .with_ttl(Duration::from_millis(100)),
    );

    let ctx = Context::background();
    for i in 0..4 {
        if i > 0 {
            tokio::time::sleep(Duration::from_millis(120)).await;
        }
        let mut conn = pool.get(&ctx, &address).await.unwrap();
        let envelope = drpc_call(&mut conn.conn, "Pool").await;
        assert_eq!(envelope.payload().unwrap(), br#"{"msg":"Hello Pool"}"#);
    }
    assert_eq!(counting.dials.load(Ordering::SeqCst), 4);
    assert!(counting.max_live.load(Ordering::SeqCst) <= 2);
    pool.close();
    h.stop().await.unwrap();
}

fn foo(node: Node) -> Service {
    Service::new("orb.svc.foo", "v1").with_node(node)
}

async fn assert_grouped(registry: &dyn Registry) {
    let nodes = [
        Node::new("node-1", "127.0.0.1:8001", "http"),
        Node::new("node-2", "127.0.0.1:8002", "grpc"),
        Node::new("node-3", "127.0.0.1:8003", "drpc"),
    ];
    // Out of order on purpose.
    for i in [2, 0, 1] {
        registry
            .register(&foo(nodes[i].clone()), RegisterOptions::default())
            .await
            .unwrap();
    }
    let services = registry.get_service("orb.svc.foo").await.unwrap();
    assert_eq!(services.len(), 1, "{}", registry.name());
    assert_eq!(services[0].version, "v1");
    let mut transports: Vec<_> = services[0].nodes.iter().map(|n| n.transport.as_str()).collect();
    transports.sort_unstable();
    assert_eq!(transports, ["drpc", "grpc", "http"], "{}", registry.name());
}

#[tokio::test]
async fn test_s7_registry_grouping() {
    assert_grouped(&MemoryRegistry::standalone(MemoryRegistryConfig::default())).await;
    assert_grouped(&KvRegistry::in_memory(KvRegistryConfig::default())).await;
}

/// Server and client TLS settings around a fresh self-signed certificate.
fn self_signed() -> (TlsConfig, TlsConfig) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    let cert = certified.cert.pem();
    let server = TlsConfig::default().with_identity(cert.clone(), certified.key_pair.serialize_pem());
    let client = TlsConfig::default().with_ca(cert).with_server_name("localhost");
    (server, client)
}

#[tokio::test]
async fn test_tls_transports() {
    for transport in ["grpcs", "https"] {
        let service = format!("e2e.tls.{transport}");
        let (server_tls, client_tls) = self_signed();
        let h = Harness::start_with(
            &service,
            [EntrypointConfig::new(transport).with_tls(server_tls)],
            prefer(transport).with_tls(client_tls),
        )
        .await
        .unwrap();

        let ctx = Context::background();
        ctx.outgoing().set("authorization", TOKEN);
        let response = Metadata::new();
        let resp = h
            .echo()
            .authorized_call(&ctx, &req("Alex"), h.client.options().with_response_metadata(response.clone()))
            .await
            .unwrap();
        assert_eq!(resp.msg, "Hello Alex", "{transport}");
        assert_eq!(response.get("tracing-id").as_deref(), Some(TRACING_ID), "{transport}");

        if transport == "grpcs" {
            let mut stream = h
                .files()
                .upload(&Context::background(), &h.client.options())
                .await
                .unwrap();
            for size in [32, 64, 128] {
                stream.send(FileChunk { content: vec![1; size] }).await.unwrap();
            }
            stream.close_send().await.unwrap();
            assert_eq!(stream.recv().await.unwrap().unwrap().size, 224);
        }
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_s8_file_upload_stream() {
    for &transport in STREAM_TRANSPORTS {
        let service = format!("e2e.s8.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let mut stream = h
            .files()
            .upload(&Context::background(), &h.client.options())
            .await
            .unwrap();
        for size in [32, 64, 128] {
            stream.send(FileChunk { content: vec![7; size] }).await.unwrap();
        }
        stream.close_send().await.unwrap();
        let resp = stream.recv().await.unwrap().unwrap();
        assert_eq!(resp.size, 224, "{transport}");
        assert!(resp.success);
        assert!(stream.recv().await.unwrap().is_none());
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_bidi_echo_and_stream_error() {
    for &transport in STREAM_TRANSPORTS {
        let service = format!("e2e.bidi.{transport}");
        let h = Harness::start(&service, &[transport], prefer(transport)).await.unwrap();
        let mut stream = h.echo().echo(&Context::background(), &h.client.options()).await.unwrap();
        for name in ["a", "b", "c"] {
            stream.send(req(name)).await.unwrap();
            assert_eq!(stream.recv().await.unwrap().unwrap().msg, name, "{transport}");
        }
        stream.send(req(NAME_BOOM)).await.unwrap();
        assert_eq!(stream.recv().await.unwrap_err().code(), 403, "{transport}");
        h.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_streaming_over_http_is_unimplemented() {
    let h = Harness::start("e2e.http.stream", &["http"], prefer("http")).await.unwrap();
    let err = h
        .echo()
        .echo(&Context::background(), &h.client.options())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 501);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_transport_choice_follows_preferences() {
    let h = Harness::start("e2e.prefs", &["grpc"], prefer("nope")).await.unwrap();
    let call = |opts: CallOptions| {
        let echo = h.echo();
        async move { echo.call(&Context::background(), &req("Alex"), opts).await }
    };

    // Nothing known matches.
    assert_eq!(call(h.client.options()).await.unwrap_err().code(), 400);
    // Falls back to a known transport the server offers.
    assert_eq!(call(h.client.options().with_any_transport(true)).await.unwrap().msg, "Hello Alex");
    // Known, but the server does not offer it.
    let err = call(h.client.options().with_preferred_transports(["drpc"])).await.unwrap_err();
    assert_eq!(err.code(), 503);
    h.stop().await.unwrap();
}

#[tokio::test]
async fn test_memory_and_drpc_agree() {
    let h = Harness::start("e2e.fidelity", &["memory", "drpc"], prefer("memory")).await.unwrap();
    for transport in ["memory", "drpc"] {
        let ctx = Context::background();
        ctx.outgoing().set("authorization", TOKEN);
        let response = Metadata::new();
        let resp = h
            .echo()
            .authorized_call(
                &ctx,
                &req("Same"),
                h.client
                    .options()
                    .with_preferred_transports([transport])
                    .with_response_metadata(response.clone()),
            )
            .await
            .unwrap();
        assert_eq!(resp.msg, "Hello Same", "{transport}");
        assert_eq!(response.get("tracing-id").as_deref(), Some(TRACING_ID), "{transport}");
    }
    h.stop().await.unwrap();
}
