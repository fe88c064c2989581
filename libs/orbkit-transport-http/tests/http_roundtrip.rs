#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Real HTTP entrypoints on loopback ports, called raw and through the
//! OrbKit client over `http`, `h2c`, `https` and `http3`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::StatusCode;
use http::header::{ACCEPT_ENCODING, CONTENT_ENCODING, CONTENT_TYPE};
use http_body_util::{BodyExt as _, Full};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use orbkit::codec::{MIME_JSON, MIME_PROTO};
use orbkit::registry::{MemoryRegistry, MemoryRegistryConfig};
use orbkit::tls::TlsConfig;
use orbkit::{
    Client, ClientConfig, Context, EntrypointConfig, Metadata, OrbError, RegistrationFn, Registry, Server,
    ServerConfig, ServerMux,
};
use orbkit_transport_http::encoding;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
struct CallRequest {
    #[prost(string, tag = "1")]
    #[serde(default)]
    name: String,
}

#[derive(Clone, PartialEq, ::prost::Message, Serialize, Deserialize)]
struct CallResponse {
    #[prost(string, tag = "1")]
    #[serde(default)]
    msg: String,
}

const CALL: &str = "/echo.Streams/Call";
const ECHO: &str = "/echo.Streams/Echo";

fn handlers() -> RegistrationFn {
    Arc::new(|mux: ServerMux<'_>| {
        let ServerMux::Http(mux) = mux else {
            return;
        };
        mux.add_unary(CALL, |ctx: Context, req: CallRequest| async move {
            match req.name.as_str() {
                "IShouldReturnAnError" => return Err(OrbError::UNAUTHORIZED),
                "sleep" => tokio::time::sleep(Duration::from_millis(500)).await,
                _ => {}
            }
            if let Some(auth) = ctx.incoming().get("authorization") {
                ctx.outgoing().set("tracing-id", format!("seen:{auth}"));
            }
            Ok(CallResponse { msg: format!("Hello {}", req.name) })
        });
        mux.add_endpoint(CALL);
        mux.add_endpoint(ECHO);
    })
}

struct Harness {
    server: Server,
    client: Client,
}

impl Harness {
    async fn new(service: &str, entrypoint: EntrypointConfig, client: ClientConfig) -> Self {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::standalone(MemoryRegistryConfig::default()));
        let config = ServerConfig::default().with_entrypoint(entrypoint);
        let server = Server::new(service, "v1", config, Arc::clone(&registry)).unwrap();
        server.register(&handlers());
        server.start().await.unwrap();
        let client = Client::new(client.with_retries(0), registry).unwrap();
        Self { server, client }
    }

    async fn echo(&self, service: &str, name: &str) -> Result<CallResponse, OrbError> {
        self.client
            .call(&Context::background(), service, CALL, &CallRequest { name: name.into() }, self.client.options())
            .await
    }
}

fn prefer(transport: &str) -> ClientConfig {
    ClientConfig::default().with_preferred_transports([transport])
}

fn self_signed() -> (String, String) {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
    (certified.cert.pem(), certified.key_pair.serialize_pem())
}

async fn raw_post(address: &str, req: http::request::Builder, body: &'static [u8]) -> http::Response<Bytes> {
    let client = HyperClient::builder(TokioExecutor::new()).build_http::<Full<Bytes>>();
    let req = req
        .uri(format!("http://{address}{CALL}"))
        .body(Full::new(Bytes::from_static(body)))
        .unwrap();
    let (parts, body) = client.request(req).await.unwrap().into_parts();
    http::Response::from_parts(parts, body.collect().await.unwrap().to_bytes())
}

#[tokio::test]
async fn test_unary_echo_over_http1_raw() {
    let h = Harness::new("echo.raw", EntrypointConfig::new("http"), prefer("http")).await;
    let address = h.server.address("http").unwrap();
    let resp = raw_post(
        &address,
        http::Request::post("/").header(CONTENT_TYPE, MIME_JSON),
        br#"{"name":"Alex"}"#,
    )
    .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()[CONTENT_TYPE], MIME_JSON);
    assert_eq!(resp.body().as_ref(), br#"{"msg":"Hello Alex"}"#);
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_client_over_http_and_h2c() {
    for transport in ["http", "h2c"] {
        let service = format!("echo.{transport}");
        let h = Harness::new(&service, EntrypointConfig::new(transport), prefer(transport)).await;
        let services = h.client.registry().get_service(&service).await.unwrap();
        assert_eq!(services[0].nodes[0].transport, transport);

        for content_type in [MIME_PROTO, MIME_JSON] {
            let resp: CallResponse = h
                .client
                .call(
                    &Context::background(),
                    &service,
                    CALL,
                    &CallRequest { name: "Alex".into() },
                    h.client.options().with_content_type(content_type),
                )
                .await
                .unwrap();
            assert_eq!(resp.msg, "Hello Alex", "{transport} {content_type}");
        }
        h.server.stop().await.unwrap();
        h.client.stop().await.unwrap();
    }
}

#[tokio::test]
async fn test_errors_and_metadata() {
    let h = Harness::new("echo.errors", EntrypointConfig::new("http"), prefer("http")).await;
    let err = h.echo("echo.errors", "IShouldReturnAnError").await.unwrap_err();
    assert_eq!(err.code(), 401);
    assert_eq!(err.message(), "unauthorized");

    let err = h
        .client
        .call::<CallRequest, CallResponse>(&Context::background(), "echo.errors", "/echo.Streams/Nope", &CallRequest::default(), h.client.options())
        .await
        .unwrap_err();
    assert_eq!(err.code(), 404);

    let ctx = Context::background();
    ctx.outgoing().set("authorization", "Bearer pleaseHackMe");
    let response = Metadata::new();
    let _: CallResponse = h
        .client
        .call(&ctx, "echo.errors", CALL, &CallRequest { name: "md".into() }, h.client.options().with_response_metadata(response.clone()))
        .await
        .unwrap();
    assert_eq!(response.get("tracing-id").as_deref(), Some("seen:Bearer pleaseHackMe"));
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_stream_is_unimplemented() {
    let h = Harness::new("echo.nostream", EntrypointConfig::new("http"), prefer("http")).await;
    let err = h
        .client
        .stream::<CallRequest, CallResponse>(&Context::background(), "echo.nostream", ECHO, &h.client.options())
        .await
        .err()
        .unwrap();
    assert_eq!(err.code(), 501);
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_request_timeout() {
    let h = Harness::new("echo.deadline", EntrypointConfig::new("http"), prefer("http")).await;
    let started = Instant::now();
    let err = h
        .client
        .call::<CallRequest, CallResponse>(
            &Context::background(),
            "echo.deadline",
            CALL,
            &CallRequest { name: "sleep".into() },
            h.client.options().with_request_timeout(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), 504);
    assert!(started.elapsed() < Duration::from_millis(400), "took {:?}", started.elapsed());
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_gzip_negotiated_on_the_wire() {
    let h = Harness::new("echo.gzip", EntrypointConfig::new("http").with_gzip(true), prefer("http")).await;
    let address = h.server.address("http").unwrap();
    let resp = raw_post(
        &address,
        http::Request::post("/")
            .header(CONTENT_TYPE, MIME_JSON)
            .header(ACCEPT_ENCODING, "gzip"),
        br#"{"name":"Zip"}"#,
    )
    .await;
    assert_eq!(resp.headers()[CONTENT_ENCODING], "gzip");
    assert_eq!(encoding::decompress(resp.body()).unwrap().as_ref(), br#"{"msg":"Hello Zip"}"#);

    // The OrbKit client asks for gzip and inflates transparently.
    assert_eq!(h.echo("echo.gzip", "Client").await.unwrap().msg, "Hello Client");
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_https_with_self_signed_cert() {
    let (cert, key) = self_signed();
    let entrypoint = EntrypointConfig::new("https").with_tls(TlsConfig::default().with_identity(cert.clone(), key));
    let client = prefer("https").with_tls(TlsConfig::default().with_ca(cert).with_server_name("localhost"));
    let h = Harness::new("echo.https", entrypoint, client).await;

    let services = h.client.registry().get_service("echo.https").await.unwrap();
    assert_eq!(services[0].nodes[0].transport, "https");
    assert_eq!(h.echo("echo.https", "Tls").await.unwrap().msg, "Hello Tls");
    h.server.stop().await.unwrap();
}

#[tokio::test]
async fn test_http3_shares_the_port_with_https() {
    let (cert, key) = self_signed();
    let entrypoint = EntrypointConfig::new("http3").with_tls(TlsConfig::default().with_identity(cert.clone(), key));
    let tls = TlsConfig::default().with_ca(cert).with_server_name("localhost");
    let h = Harness::new("echo.h3", entrypoint, prefer("http3").with_tls(tls.clone())).await;

    let services = h.client.registry().get_service("echo.h3").await.unwrap();
    assert_eq!(services[0].nodes[0].transport, "http3");
    assert_eq!(h.echo("echo.h3", "Quic").await.unwrap().msg, "Hello Quic");
    let err = h.echo("echo.h3", "IShouldReturnAnError").await.unwrap_err();
    assert_eq!(err.code(), 401);

    // The TCP side of the same port answers HTTPS.
    let address = h.server.address("http3").unwrap();
    let https = Client::new(prefer("https").with_retries(0).with_tls(tls), Arc::clone(h.client.registry())).unwrap();
    let url = Url::parse(&format!("https://{address}")).unwrap();
    let resp: CallResponse = https
        .call(
            &Context::background(),
            "echo.h3",
            CALL,
            &CallRequest { name: "Tcp".into() },
            https.options().with_url(url),
        )
        .await
        .unwrap();
    assert_eq!(resp.msg, "Hello Tcp");
    https.stop().await.unwrap();
    h.server.stop().await.unwrap();
    h.client.stop().await.unwrap();
}
