// ABOUTME: TCP front end: one JSON request line per connection, answered with JSON lines
// ABOUTME: Execute replies stream NDJSON until the execution ends, then the connection closes

//! TCP front end for the kernel service.
//!
//! # Protocol
//!
//! ```text
//! client -> {"op":"execute","kernelId":"user-1","code":"print(1)"}\n
//! server <- {"msg_type":"execute_input","content":{"execution_count":1}}\n
//! server <- {"msg_type":"stream","content":{"name":"stdout","text":"1\n"}}\n
//! server closes the connection
//!
//! client -> {"op":"status","kernelId":"user-1"}\n
//! server <- {"statusCode":200,"data":"running"}\n
//! ```
//!
//! A line that is not a valid request is answered with
//! `{"statusCode":400,"message":...}`.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::service::{KernelService, Reply, Request, Response};

/// Longest request line accepted, in bytes
const MAX_REQUEST_LINE: u64 = 16 * 1024 * 1024;

/// Errors from the TCP front end
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind TCP listener on {addr}: {source}")]
    BindFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Connection I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Serves a [`KernelService`] over TCP
pub struct KernelServer {
    listener: TcpListener,
    service: Arc<KernelService>,
}

impl KernelServer {
    /// Bind to `addr`
    ///
    /// # Errors
    ///
    /// Returns `BindFailed` if the address cannot be bound.
    pub async fn bind(addr: &str, service: Arc<KernelService>) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Kernel server listening");

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    debug!("Accept loop shutdown requested");
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&self.service);
                        tokio::spawn(async move {
                            let conn_id = Uuid::new_v4();
                            debug!(conn = %conn_id, peer = %peer, "New connection");
                            if let Err(e) = handle_connection(stream, &service, conn_id).await {
                                // Clients disconnecting mid-stream land here
                                debug!(conn = %conn_id, error = %e, "Connection ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(addr = %addr, error = %e, "Accept error");
                    }
                },
            }
        }

        info!(addr = %addr, "Kernel server stopped");
        Ok(())
    }
}

/// Read one request, write its reply, close
async fn handle_connection(
    stream: TcpStream,
    service: &KernelService,
    conn_id: Uuid,
) -> Result<(), ServerError> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader.take(MAX_REQUEST_LINE));

    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        debug!(conn = %conn_id, "Connection closed before a request");
        return Ok(());
    }

    // Invalid UTF-8 surfaces as a parse error, not an I/O error
    let request = match serde_json::from_slice::<Request>(&line) {
        Ok(request) => request,
        Err(e) => {
            warn!(conn = %conn_id, error = %e, "Malformed request");
            writer
                .write_all(Response::error(400, format!("Invalid request: {e}")).to_line().as_bytes())
                .await?;
            writer.shutdown().await?;
            return Ok(());
        }
    };

    debug!(conn = %conn_id, request = ?request, "Request");

    match service.handle(request).await {
        Reply::Response(response) => {
            writer.write_all(response.to_line().as_bytes()).await?;
        }
        Reply::Stream(mut lines) => {
            // A write error drops `lines`, which releases the kernel channel
            while let Some(line) = lines.next().await {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await?;
            }
        }
    }

    writer.shutdown().await?;
    Ok(())
}
