//! Code generation for OrbKit services.
//!
//! Wraps `prost-build`: messages get the prost and serde derives OrbKit's
//! codecs need, and every proto service gets a registration function,
//! endpoint constants and a typed client (see [`OrbServiceGenerator`]).
//!
//! ```rust,ignore
//! // build.rs
//! fn main() -> std::io::Result<()> {
//!     orbkit_codegen::configure().compile_protos(&["proto/echo.proto"], &["proto"])
//! }
//! ```
//!
//! The generated code refers to `::orbkit`, `::prost` and `::serde`, so the
//! including crate depends on all three.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod generator;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use prost_build::{Config, Module};
use prost_types::FileDescriptorSet;

pub use generator::OrbServiceGenerator;

const SERDE_DERIVE: &str = "#[derive(::serde::Serialize, ::serde::Deserialize)]";
const SERDE_MESSAGE: &str = "#[serde(default, rename_all = \"camelCase\")]";

/// Starts a generator configuration with server and client output enabled.
#[must_use]
pub fn configure() -> Builder {
    Builder::default()
}

/// Configures and runs code generation.
#[derive(Default)]
pub struct Builder {
    generator: OrbServiceGenerator,
    out_dir: Option<PathBuf>,
    protoc_args: Vec<String>,
}

impl fmt::Debug for Builder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Builder")
            .field("generator", &self.generator)
            .field("out_dir", &self.out_dir)
            .finish_non_exhaustive()
    }
}

impl Builder {
    /// Emit handler traits and registration functions.
    #[must_use]
    pub fn build_server(mut self, enable: bool) -> Self {
        self.generator = self.generator.with_server(enable);
        self
    }

    /// Emit typed clients.
    #[must_use]
    pub fn build_client(mut self, enable: bool) -> Self {
        self.generator = self.generator.with_client(enable);
        self
    }

    /// Output directory; defaults to `OUT_DIR`.
    #[must_use]
    pub fn out_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.out_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    #[must_use]
    pub fn protoc_arg(mut self, arg: impl Into<String>) -> Self {
        self.protoc_args.push(arg.into());
        self
    }

    fn config(&self) -> Config {
        let mut config = Config::new();
        config
            .type_attribute(".", SERDE_DERIVE)
            .message_attribute(".", SERDE_MESSAGE)
            .service_generator(Box::new(self.generator));
        if let Some(dir) = &self.out_dir {
            config.out_dir(dir);
        }
        for arg in &self.protoc_args {
            config.protoc_arg(arg);
        }
        config
    }

    /// Runs `protoc` on `protos` and writes one Rust file per package.
    ///
    /// # Errors
    /// Fails when `protoc` is missing or rejects the input, or when the
    /// output cannot be written.
    pub fn compile_protos(self, protos: &[impl AsRef<Path>], includes: &[impl AsRef<Path>]) -> io::Result<()> {
        for proto in protos {
            println!("cargo:rerun-if-changed={}", proto.as_ref().display());
        }
        self.config().compile_protos(protos, includes)
    }

    /// Writes one Rust file per package from already parsed descriptors.
    ///
    /// # Errors
    /// Fails when the output cannot be written.
    pub fn compile_fds(self, fds: FileDescriptorSet) -> io::Result<()> {
        self.config().compile_fds(fds)
    }

    /// Generates code in memory, keyed by protobuf package name.
    ///
    /// # Errors
    /// Fails when the descriptors reference unknown types.
    pub fn generate(self, fds: FileDescriptorSet) -> io::Result<BTreeMap<String, String>> {
        let mut packages = BTreeMap::new();
        let requests = fds
            .file
            .into_iter()
            .map(|file| {
                let module = Module::from_protobuf_package_name(file.package());
                packages.insert(module.clone(), file.package().to_owned());
                (module, file)
            })
            .collect();
        let modules = self.config().generate(requests)?;
        Ok(modules
            .into_iter()
            .filter_map(|(module, code)| packages.get(&module).map(|name| (name.clone(), code)))
            .collect())
    }
}
