use std::time::Duration;

use orbkit::{Context, OrbError, ServerStream};

use crate::proto::echo::{CallRequest, CallResponse, StreamsHandler};
use crate::proto::file::{FileChunk, FileServiceHandler, UploadResponse};

/// The only credential [`EchoHandler::authorized_call`] accepts.
pub const TOKEN: &str = "Bearer pleaseHackMe";
/// Value of the `tracing-id` key an authorized call sets.
pub const TRACING_ID: &str = "asfdjhladhsfashf";

/// Request names with special behavior.
pub const NAME_ERROR: &str = "IShouldReturnAnError";
pub const NAME_SLEEP: &str = "sleep";
pub const NAME_BOOM: &str = "boom";

/// How long a [`NAME_SLEEP`] call takes.
pub const SLEEP: Duration = Duration::from_millis(500);

/// Greets the caller; see the `NAME_*` constants for the special cases.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl StreamsHandler for EchoHandler {
    async fn call(&self, ctx: Context, req: CallRequest) -> orbkit::Result<CallResponse> {
        match req.name.as_str() {
            NAME_ERROR => return Err(OrbError::UNAUTHORIZED),
            NAME_SLEEP => tokio::time::sleep(SLEEP).await,
            _ => {}
        }
        if let Some(value) = ctx.incoming().get("echo") {
            ctx.outgoing().set("echo", value);
        }
        Ok(CallResponse {
            msg: format!("Hello {}", req.name),
        })
    }

    async fn authorized_call(&self, ctx: Context, req: CallRequest) -> orbkit::Result<CallResponse> {
        if ctx.incoming().get("authorization").as_deref() != Some(TOKEN) {
            tracing::debug!("rejecting call without a valid token");
            return Err(OrbError::UNAUTHORIZED);
        }
        ctx.outgoing().set("tracing-id", TRACING_ID);
        Ok(CallResponse {
            msg: format!("Hello {}", req.name),
        })
    }

    async fn echo(&self, mut stream: ServerStream<CallRequest, CallResponse>) -> orbkit::Result<()> {
        while let Some(req) = stream.recv().await? {
            if req.name == NAME_BOOM {
                return Err(OrbError::FORBIDDEN);
            }
            stream.send(CallResponse { msg: req.name }).await?;
        }
        Ok(())
    }
}

/// Counts uploaded bytes and reports the total once the client closes its
/// side.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileHandler;

impl FileServiceHandler for FileHandler {
    async fn upload(&self, mut stream: ServerStream<FileChunk, UploadResponse>) -> orbkit::Result<()> {
        let mut size = 0usize;
        while let Some(chunk) = stream.recv().await? {
            size += chunk.content.len();
        }
        let size = i64::try_from(size).map_err(|_| OrbError::BAD_REQUEST.wrap("upload too large"))?;
        tracing::debug!(size, "upload finished");
        stream.send(UploadResponse { size, success: true }).await
    }
}
