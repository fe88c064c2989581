//! The `prost-build` service generator.
//!
//! For a service `Foo` in package `pkg` it emits, next to the message types
//! prost generates:
//!
//! - `ENDPOINT_FOO_<METHOD>` constants holding `/pkg.Foo/<Method>`;
//! - a `FooHandler` trait with one method per RPC;
//! - `register_foo_handler(handler) -> orbkit::RegistrationFn`, the single
//!   bridge between the handler and every server entrypoint;
//! - a `FooClient` wrapper over `orbkit::Client`.
//!
//! Any streaming RPC (client, server or bidirectional) is served as a
//! bidirectional stream. HTTP entrypoints only receive the unary methods.

use std::fmt::{self, Write as _};

use heck::{ToShoutySnakeCase, ToSnakeCase};
use prost_build::{Method, Service, ServiceGenerator};

/// Muxes the registration closure matches on, and whether each can stream.
const MUXES: &[(&str, bool)] = &[("Grpc", true), ("Drpc", true), ("Memory", true), ("Http", false)];

const ARC: &str = "::std::sync::Arc";
const SEND: &str = "::core::marker::Send";

/// Emits OrbKit bindings for every service prost compiles.
#[derive(Debug, Clone, Copy)]
pub struct OrbServiceGenerator {
    server: bool,
    client: bool,
}

impl Default for OrbServiceGenerator {
    fn default() -> Self {
        Self { server: true, client: true }
    }
}

impl OrbServiceGenerator {
    #[must_use]
    pub fn with_server(mut self, enable: bool) -> Self {
        self.server = enable;
        self
    }

    #[must_use]
    pub fn with_client(mut self, enable: bool) -> Self {
        self.client = enable;
        self
    }

    fn render(self, service: &Service, buf: &mut String) -> fmt::Result {
        let svc = ServiceNames::new(service);
        render_endpoints(&svc, service, buf)?;
        if self.server {
            render_handler_trait(&svc, service, buf)?;
            render_registration(&svc, service, buf)?;
        }
        if self.client {
            render_client(&svc, service, buf)?;
        }
        Ok(())
    }
}

impl ServiceGenerator for OrbServiceGenerator {
    fn generate(&mut self, service: Service, buf: &mut String) {
        tracing::debug!(package = %service.package, service = %service.proto_name, "generating orbkit bindings");
        // Writing into a String does not fail.
        let rendered = self.render(&service, buf);
        debug_assert!(rendered.is_ok());
    }
}

/// Names derived once per service.
struct ServiceNames {
    full_name: String,
    handler: String,
    client: String,
    register: String,
    shouty: String,
}

impl ServiceNames {
    fn new(service: &Service) -> Self {
        let full_name = if service.package.is_empty() {
            service.proto_name.clone()
        } else {
            format!("{}.{}", service.package, service.proto_name)
        };
        Self {
            full_name,
            handler: format!("{}Handler", service.name),
            client: format!("{}Client", service.name),
            register: format!("register_{}_handler", service.name.to_snake_case()),
            shouty: service.name.to_shouty_snake_case(),
        }
    }

    fn endpoint_const(&self, method: &Method) -> String {
        format!("ENDPOINT_{}_{}", self.shouty, method.name.to_shouty_snake_case())
    }

    fn endpoint_path(&self, method: &Method) -> String {
        format!("/{}/{}", self.full_name, method.proto_name)
    }
}

fn is_streaming(method: &Method) -> bool {
    method.client_streaming || method.server_streaming
}

/// Rust identifier for a method name, escaping keywords.
fn ident(name: &str) -> String {
    const KEYWORDS: &[&str] = &[
        "as", "async", "await", "break", "const", "continue", "dyn", "else", "enum", "extern", "false", "fn", "for",
        "gen", "if", "impl", "in", "let", "loop", "match", "mod", "move", "mut", "pub", "ref", "return", "static",
        "struct", "trait", "true", "try", "type", "unsafe", "use", "where", "while", "abstract", "become", "box",
        "do", "final", "macro", "override", "priv", "typeof", "unsized", "virtual", "yield",
    ];
    let snake = name.to_snake_case();
    match snake.as_str() {
        "self" | "super" | "crate" => format!("{snake}_"),
        s if KEYWORDS.contains(&s) => format!("r#{snake}"),
        _ => snake,
    }
}

fn render_endpoints(svc: &ServiceNames, service: &Service, buf: &mut String) -> fmt::Result {
    writeln!(buf)?;
    writeln!(buf, "/// Registry name of the `{}` proto service.", svc.full_name)?;
    writeln!(buf, "pub const {}_SERVICE_NAME: &str = \"{}\";", svc.shouty, svc.full_name)?;
    for method in &service.methods {
        writeln!(buf, "/// Endpoint of `{}.{}`.", svc.full_name, method.proto_name)?;
        writeln!(buf, "pub const {}: &str = \"{}\";", svc.endpoint_const(method), svc.endpoint_path(method))?;
    }
    Ok(())
}

fn render_handler_trait(svc: &ServiceNames, service: &Service, buf: &mut String) -> fmt::Result {
    writeln!(buf)?;
    service.comments.append_with_indent(0, buf);
    writeln!(buf, "/// Server side of `{}`.", svc.full_name)?;
    writeln!(buf, "pub trait {}: {SEND} + ::core::marker::Sync + 'static {{", svc.handler)?;
    for method in &service.methods {
        method.comments.append_with_indent(1, buf);
        let name = ident(&method.name);
        let (input, output) = (&method.input_type, &method.output_type);
        if is_streaming(method) {
            writeln!(
                buf,
                "    fn {name}(&self, stream: ::orbkit::ServerStream<{input}, {output}>) -> impl ::core::future::Future<Output = ::orbkit::Result<()>> + {SEND};"
            )?;
        } else {
            writeln!(
                buf,
                "    fn {name}(&self, ctx: ::orbkit::Context, req: {input}) -> impl ::core::future::Future<Output = ::orbkit::Result<{output}>> + {SEND};"
            )?;
        }
    }
    writeln!(buf, "}}")
}

fn render_registration(svc: &ServiceNames, service: &Service, buf: &mut String) -> fmt::Result {
    writeln!(buf)?;
    writeln!(buf, "/// Binds `handler` to every entrypoint of a server, whatever its transport.")?;
    writeln!(
        buf,
        "pub fn {}<H: {}>(handler: H) -> ::orbkit::RegistrationFn {{",
        svc.register, svc.handler
    )?;
    writeln!(buf, "    let handler = {ARC}::new(handler);")?;
    writeln!(buf, "    {ARC}::new(move |mux: ::orbkit::ServerMux<'_>| match mux {{")?;
    for &(kind, streams) in MUXES {
        let served: Vec<&Method> = service
            .methods
            .iter()
            .filter(|m| streams || !is_streaming(m))
            .collect();
        if served.is_empty() {
            writeln!(buf, "        ::orbkit::ServerMux::{kind}(_) => {{}}")?;
            continue;
        }
        writeln!(buf, "        ::orbkit::ServerMux::{kind}(mux) => {{")?;
        for method in served {
            render_binding(svc, method, buf)?;
        }
        writeln!(buf, "        }}")?;
    }
    writeln!(buf, "        _ => {{}}")?;
    writeln!(buf, "    }})")?;
    writeln!(buf, "}}")
}

fn render_binding(svc: &ServiceNames, method: &Method, buf: &mut String) -> fmt::Result {
    let endpoint = svc.endpoint_const(method);
    let name = ident(&method.name);
    let (input, output) = (&method.input_type, &method.output_type);
    writeln!(buf, "            {{")?;
    writeln!(buf, "                let handler = {ARC}::clone(&handler);")?;
    if is_streaming(method) {
        writeln!(
            buf,
            "                mux.add_stream({endpoint}, move |stream: ::orbkit::ServerStream<{input}, {output}>| {{"
        )?;
        writeln!(buf, "                    let handler = {ARC}::clone(&handler);")?;
        writeln!(buf, "                    async move {{ handler.{name}(stream).await }}")?;
    } else {
        writeln!(buf, "                mux.add_unary({endpoint}, move |ctx: ::orbkit::Context, req: {input}| {{")?;
        writeln!(buf, "                    let handler = {ARC}::clone(&handler);")?;
        writeln!(buf, "                    async move {{ handler.{name}(ctx, req).await }}")?;
    }
    writeln!(buf, "                }});")?;
    writeln!(buf, "            }}")?;
    writeln!(buf, "            mux.add_endpoint({endpoint});")
}

fn render_client(svc: &ServiceNames, service: &Service, buf: &mut String) -> fmt::Result {
    let client = &svc.client;
    writeln!(buf)?;
    writeln!(buf, "/// Typed caller of `{}`.", svc.full_name)?;
    writeln!(buf, "#[derive(Debug, Clone)]")?;
    writeln!(buf, "pub struct {client} {{")?;
    writeln!(buf, "    client: ::orbkit::Client,")?;
    writeln!(buf, "    service: ::std::string::String,")?;
    writeln!(buf, "}}")?;
    writeln!(buf)?;
    writeln!(buf, "impl {client} {{")?;
    writeln!(buf, "    /// Calls the server registered under `service`.")?;
    writeln!(buf, "    #[must_use]")?;
    writeln!(
        buf,
        "    pub fn new(client: ::orbkit::Client, service: impl ::core::convert::Into<::std::string::String>) -> Self {{"
    )?;
    writeln!(buf, "        Self {{ client, service: service.into() }}")?;
    writeln!(buf, "    }}")?;
    for method in &service.methods {
        render_client_method(svc, method, buf)?;
    }
    writeln!(buf, "}}")
}

fn render_client_method(svc: &ServiceNames, method: &Method, buf: &mut String) -> fmt::Result {
    let endpoint = svc.endpoint_const(method);
    let name = match ident(&method.name) {
        n if n == "new" => "new_".to_owned(),
        n => n,
    };
    let (input, output) = (&method.input_type, &method.output_type);
    writeln!(buf)?;
    method.comments.append_with_indent(1, buf);
    if is_streaming(method) {
        writeln!(
            buf,
            "    pub async fn {name}(&self, ctx: &::orbkit::Context, opts: &::orbkit::CallOptions) -> ::orbkit::Result<::orbkit::ClientStream<{input}, {output}>> {{"
        )?;
        writeln!(buf, "        self.client.stream(ctx, &self.service, {endpoint}, opts).await")?;
    } else {
        writeln!(
            buf,
            "    pub async fn {name}(&self, ctx: &::orbkit::Context, req: &{input}, opts: ::orbkit::CallOptions) -> ::orbkit::Result<{output}> {{"
        )?;
        writeln!(buf, "        self.client.call(ctx, &self.service, {endpoint}, req, opts).await")?;
    }
    writeln!(buf, "    }}")
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use prost_build::Comments;

    use super::*;

    fn method(name: &str, streaming: bool) -> Method {
        Method {
            name: name.to_snake_case(),
            proto_name: name.to_owned(),
            comments: Comments::default(),
            input_type: "CallRequest".to_owned(),
            output_type: "CallResponse".to_owned(),
            input_proto_type: ".echo.CallRequest".to_owned(),
            output_proto_type: ".echo.CallResponse".to_owned(),
            options: prost_types::MethodOptions::default(),
            client_streaming: streaming,
            server_streaming: streaming,
        }
    }

    fn streams() -> Service {
        Service {
            name: "Streams".to_owned(),
            proto_name: "Streams".to_owned(),
            package: "echo".to_owned(),
            comments: Comments {
                leading: vec![" Echo service.".to_owned()],
                ..Comments::default()
            },
            methods: vec![method("Call", false), method("Echo", true)],
            options: prost_types::ServiceOptions::default(),
        }
    }

    fn generate(generator: OrbServiceGenerator, service: Service) -> String {
        let mut buf = String::new();
        let mut generator = generator;
        generator.generate(service, &mut buf);
        buf
    }

    #[test]
    fn test_endpoint_constants() {
        let out = generate(OrbServiceGenerator::default(), streams());
        assert!(out.contains("pub const STREAMS_SERVICE_NAME: &str = \"echo.Streams\";"));
        assert!(out.contains("pub const ENDPOINT_STREAMS_CALL: &str = \"/echo.Streams/Call\";"));
        assert!(out.contains("pub const ENDPOINT_STREAMS_ECHO: &str = \"/echo.Streams/Echo\";"));
    }

    #[test]
    fn test_single_registration_function_per_service() {
        let out = generate(OrbServiceGenerator::default(), streams());
        assert_eq!(out.matches("pub fn register_").count(), 1);
        assert!(out.contains("pub fn register_streams_handler<H: StreamsHandler>(handler: H) -> ::orbkit::RegistrationFn"));
        for kind in ["Grpc", "Drpc", "Memory", "Http"] {
            assert!(out.contains(&format!("::orbkit::ServerMux::{kind}(mux) =>")), "{kind}");
        }
        assert!(out.contains("_ => {}"));
    }

    #[test]
    fn test_every_mux_adds_the_endpoints_it_serves() {
        let out = generate(OrbServiceGenerator::default(), streams());
        // Unary on all four muxes, streaming everywhere but HTTP.
        assert_eq!(out.matches("mux.add_endpoint(ENDPOINT_STREAMS_CALL);").count(), 4);
        assert_eq!(out.matches("mux.add_endpoint(ENDPOINT_STREAMS_ECHO);").count(), 3);
        assert_eq!(out.matches("mux.add_stream(ENDPOINT_STREAMS_ECHO").count(), 3);

        let http = &out[out.find("ServerMux::Http").unwrap()..];
        assert!(!http.contains("add_stream"));
    }

    #[test]
    fn test_handler_trait_shapes() {
        let out = generate(OrbServiceGenerator::default(), streams());
        assert!(out.contains("/// Echo service."));
        assert!(out.contains(
            "fn call(&self, ctx: ::orbkit::Context, req: CallRequest) -> impl ::core::future::Future<Output = ::orbkit::Result<CallResponse>>"
        ));
        assert!(out.contains("fn echo(&self, stream: ::orbkit::ServerStream<CallRequest, CallResponse>)"));
    }

    #[test]
    fn test_client_methods() {
        let out = generate(OrbServiceGenerator::default(), streams());
        assert!(out.contains("pub struct StreamsClient {"));
        assert!(out.contains("self.client.call(ctx, &self.service, ENDPOINT_STREAMS_CALL, req, opts).await"));
        assert!(out.contains("self.client.stream(ctx, &self.service, ENDPOINT_STREAMS_ECHO, opts).await"));
    }

    #[test]
    fn test_server_or_client_only() {
        let server = generate(OrbServiceGenerator::default().with_client(false), streams());
        assert!(server.contains("register_streams_handler"));
        assert!(!server.contains("StreamsClient"));

        let client = generate(OrbServiceGenerator::default().with_server(false), streams());
        assert!(!client.contains("register_streams_handler"));
        assert!(client.contains("StreamsClient"));
        assert!(client.contains("ENDPOINT_STREAMS_CALL"));
    }

    #[test]
    fn test_server_streaming_is_served_as_a_stream() {
        let mut service = streams();
        let mut watch = method("Watch", false);
        watch.server_streaming = true;
        service.methods = vec![watch];
        let out = generate(OrbServiceGenerator::default(), service);
        assert!(out.contains("mux.add_stream(ENDPOINT_STREAMS_WATCH"));
        assert!(!out.contains("mux.add_unary"));
        assert!(out.contains("::orbkit::ServerMux::Http(_) => {}"));
    }

    #[test]
    fn test_keyword_and_package_less_names() {
        let mut service = streams();
        service.package = String::new();
        service.methods = vec![method("Type", false), method("New", false)];
        let out = generate(OrbServiceGenerator::default(), service);
        assert!(out.contains("pub const ENDPOINT_STREAMS_TYPE: &str = \"/Streams/Type\";"));
        assert!(out.contains("fn r#type(&self, ctx"));
        assert!(out.contains("pub async fn new_(&self"));
    }

    #[test]
    fn test_ident() {
        assert_eq!(ident("GetFile"), "get_file");
        assert_eq!(ident("Match"), "r#match");
        assert_eq!(ident("Self"), "self_");
    }
}
