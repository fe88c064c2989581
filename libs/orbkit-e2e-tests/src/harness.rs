use std::sync::Arc;

use anyhow::Context as _;
use orbkit::registry::{MemoryRegistry, MemoryRegistryConfig};
use orbkit::{Client, ClientConfig, EntrypointConfig, Registry, Server, ServerConfig};

use crate::handlers::{EchoHandler, FileHandler};
use crate::proto::echo::{StreamsClient, register_streams_handler};
use crate::proto::file::{FileServiceClient, register_file_service_handler};

/// A started server hosting both test services, with a client sharing its
/// registry.
pub struct Harness {
    pub service: String,
    pub server: Server,
    pub client: Client,
    pub registry: Arc<dyn Registry>,
}

impl Harness {
    /// Starts `service` on `entrypoints` (plugin names).
    ///
    /// # Errors
    /// Fails when an entrypoint cannot be built or bound.
    pub async fn start(service: &str, entrypoints: &[&str], client: ClientConfig) -> anyhow::Result<Self> {
        let configs = entrypoints.iter().map(|plugin| EntrypointConfig::new(*plugin));
        Self::start_with(service, configs, client).await
    }

    /// Starts `service` on fully configured entrypoints.
    ///
    /// # Errors
    /// Fails when an entrypoint cannot be built or bound.
    pub async fn start_with(
        service: &str,
        entrypoints: impl IntoIterator<Item = EntrypointConfig>,
        client: ClientConfig,
    ) -> anyhow::Result<Self> {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::standalone(MemoryRegistryConfig::default()));
        let config = entrypoints
            .into_iter()
            .fold(ServerConfig::default(), ServerConfig::with_entrypoint);
        let server = Server::new(service, "v1", config, Arc::clone(&registry)).context("build server")?;
        server.register(&register_streams_handler(EchoHandler));
        server.register(&register_file_service_handler(FileHandler));
        server.start().await.with_context(|| format!("start {service}"))?;
        tracing::info!(%service, "e2e server started");

        let client = Client::new(client, Arc::clone(&registry)).context("build client")?;
        Ok(Self {
            service: service.to_owned(),
            server,
            client,
            registry,
        })
    }

    #[must_use]
    pub fn echo(&self) -> StreamsClient {
        StreamsClient::new(self.client.clone(), self.service.clone())
    }

    #[must_use]
    pub fn files(&self) -> FileServiceClient {
        FileServiceClient::new(self.client.clone(), self.service.clone())
    }

    /// Bound address of the entrypoint named `name`.
    ///
    /// # Errors
    /// Fails when no such entrypoint exists.
    pub fn address(&self, name: &str) -> anyhow::Result<String> {
        self.server
            .address(name)
            .with_context(|| format!("no entrypoint named {name}"))
    }

    /// Stops the server and the client's transports.
    ///
    /// # Errors
    /// Returns the first stop failure.
    pub async fn stop(self) -> anyhow::Result<()> {
        self.server.stop().await?;
        self.client.stop().await?;
        Ok(())
    }
}
