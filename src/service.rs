// ABOUTME: Request/response types and the operation layer callers use to drive the pool
// ABOUTME: Every request counts as activity for the auto-exit watchdog

use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_stream::Stream;
use tracing::{error, info};

use crate::auto_exit::AutoExit;
use crate::error::{Outcome, PoolResult};
use crate::pool::KernelPool;
use crate::session::{ExecutionSession, OutputEvent};

/// NDJSON lines of one execution
pub type ExecutionStream = Pin<Box<dyn Stream<Item = String> + Send>>;

/// Addresses one kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelRequest {
    pub kernel_id: String,

    /// Kind to create if the kernel does not exist yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

impl KernelRequest {
    pub fn new(kernel_id: impl Into<String>) -> Self {
        Self {
            kernel_id: kernel_id.into(),
            kernel_name: None,
        }
    }
}

/// Code to run on one kernel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub kernel_id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,

    pub code: String,
}

/// Any request, tagged by `op`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Request {
    Start(KernelRequest),
    Status(KernelRequest),
    Shutdown(KernelRequest),
    Restart(KernelRequest),
    Interrupt(KernelRequest),
    Ready,
    Execute(ExecuteRequest),
}

/// Single-value reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status_code: u16,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Response {
    pub const fn ok() -> Self {
        Self {
            status_code: 200,
            data: None,
            message: None,
        }
    }

    pub fn with_data(data: impl Into<String>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::ok()
        }
    }

    pub fn error(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            status_code,
            data: None,
            message: Some(message.into()),
        }
    }

    pub const fn is_ok(&self) -> bool {
        self.status_code == 200
    }

    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// What an operation hands back to the front end
pub enum Reply {
    Response(Response),
    Stream(ExecutionStream),
}

impl std::fmt::Debug for Reply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Response(response) => f.debug_tuple("Response").field(response).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Kernel operations on top of the pool
pub struct KernelService {
    pool: Arc<KernelPool>,
    auto_exit: Arc<AutoExit>,
    default_kind: String,
}

impl KernelService {
    pub fn new(pool: Arc<KernelPool>, auto_exit: Arc<AutoExit>, default_kind: &str) -> Self {
        Self {
            pool,
            auto_exit,
            default_kind: default_kind.to_string(),
        }
    }

    pub fn pool(&self) -> &Arc<KernelPool> {
        &self.pool
    }

    /// Dispatch a tagged request
    pub async fn handle(&self, request: Request) -> Reply {
        match request {
            Request::Start(req) => Reply::Response(self.start(&req).await),
            Request::Status(req) => Reply::Response(self.status(&req.kernel_id)),
            Request::Shutdown(req) => Reply::Response(self.shutdown(&req).await),
            Request::Restart(req) => Reply::Response(self.restart(&req).await),
            Request::Interrupt(req) => Reply::Response(self.interrupt(&req).await),
            Request::Ready => Reply::Response(self.ready()),
            Request::Execute(req) => Reply::Stream(self.execute(req).await),
        }
    }

    pub async fn start(&self, req: &KernelRequest) -> Response {
        self.auto_exit.record_activity();
        let kind = self.kind_of(req.kernel_name.as_deref());
        respond(
            "start",
            &req.kernel_id,
            self.pool.ensure_started(&req.kernel_id, kind).await,
        )
    }

    /// Never fails
    pub fn status(&self, kernel_id: &str) -> Response {
        self.auto_exit.record_activity();
        Response::with_data(self.pool.status(kernel_id).as_str())
    }

    pub async fn shutdown(&self, req: &KernelRequest) -> Response {
        self.auto_exit.record_activity();
        respond(
            "shutdown",
            &req.kernel_id,
            self.pool.shutdown(&req.kernel_id).await.map(ignore_outcome),
        )
    }

    pub async fn restart(&self, req: &KernelRequest) -> Response {
        self.auto_exit.record_activity();
        let kind = self.kind_of(req.kernel_name.as_deref());
        respond(
            "restart",
            &req.kernel_id,
            self.pool.restart(&req.kernel_id, kind).await,
        )
    }

    pub async fn interrupt(&self, req: &KernelRequest) -> Response {
        self.auto_exit.record_activity();
        respond(
            "interrupt",
            &req.kernel_id,
            self.pool.interrupt(&req.kernel_id).await.map(ignore_outcome),
        )
    }

    pub fn ready(&self) -> Response {
        self.auto_exit.record_activity();
        Response::with_data("ready")
    }

    /// Run `req.code`, streaming the kernel's output
    ///
    /// Always returns a stream; failures before the first event become a
    /// stream holding only the terminal error line.
    pub async fn execute(&self, req: ExecuteRequest) -> ExecutionStream {
        self.auto_exit.record_activity();
        self.pool.metrics().execution_started();

        let key = req.kernel_id.as_str();
        let kind = self.kind_of(req.kernel_name.as_deref());

        let runtime = match self.pool.fetch(key, kind).await {
            Ok(runtime) => runtime,
            Err(e) => {
                error!(key = %key, error = %e, "Execute failed to get kernel");
                return error_stream(e.to_string());
            }
        };

        info!(key = %key, code = %req.code, "Executing code");

        // Subscribe before submitting so no event is missed
        let mut channel = runtime.open_channel();
        if let Err(e) = runtime.submit(&req.code).await {
            error!(key = %key, error = %e, "Execute failed to submit code");
            channel.close();
            return error_stream(e.to_string());
        }

        let mut session = ExecutionSession::new(channel);
        if let Some(handle) = self.pool.get(key) {
            session = session.with_activity(handle);
        }
        Box::pin(session.into_stream())
    }

    fn kind_of<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        requested.unwrap_or(&self.default_kind)
    }
}

fn ignore_outcome(_: Outcome) {}

fn respond(op: &str, key: &str, result: PoolResult<()>) -> Response {
    match result {
        Ok(()) => Response::ok(),
        Err(e) => {
            error!(op = %op, key = %key, error = %e, "Kernel operation failed");
            Response::error(500, e.to_string())
        }
    }
}

fn error_stream(description: String) -> ExecutionStream {
    Box::pin(tokio_stream::once(OutputEvent::error(description).to_line()))
}
