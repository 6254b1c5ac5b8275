// ABOUTME: Subprocess-backed kernel runtime speaking newline-delimited JSON over stdio
// ABOUTME: One stdout reader task fans events out to every open channel via broadcast

//! Process kernels.
//!
//! The child reads execute requests on stdin and writes events on stdout,
//! one JSON object per line:
//!
//! ```text
//! stdin : {"msg_type":"execute_request","content":{"code":"print(1)"}}
//! stdout: {"msg_type":"status","content":{"execution_state":"busy"}}
//!         {"msg_type":"execute_input","content":{"code":"print(1)","execution_count":1}}
//!         {"msg_type":"stream","content":{"name":"stdout","text":"1\n"}}
//!         {"msg_type":"status","content":{"execution_state":"idle"}}
//! ```
//!
//! The broadcast sender lives as long as the `ProcessKernel`. A channel
//! open across a restart first reports the old process's exit, then keeps
//! receiving events from the new process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::supervisor::ProcessSupervisor;
use super::{EventChannel, KernelEvent, KernelRuntime, RuntimeFactory};
use crate::config::{KernelSpec, PoolConfig};
use crate::error::{ChannelError, KernelError};

/// How long shutdown waits for the stdout reader to drain after the child exits
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Item carried on the kernel's broadcast channel
#[derive(Debug, Clone)]
enum ChannelItem {
    Event(KernelEvent),
    Exited(String),
}

/// A kernel running as a child process
pub struct ProcessKernel {
    kind: String,
    spec: KernelSpec,
    events: broadcast::Sender<ChannelItem>,
    supervisor: Mutex<ProcessSupervisor>,
    stdin: Mutex<Option<ChildStdin>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessKernel {
    pub fn new(kind: &str, spec: KernelSpec, event_buffer: usize, grace: Duration) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            kind: kind.to_string(),
            spec,
            events,
            supervisor: Mutex::new(ProcessSupervisor::new(grace)),
            stdin: Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    /// Spawn the child and wire its stdio
    async fn spawn(&self) -> Result<(), KernelError> {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.check_status().is_running() {
            return Ok(());
        }

        let pid = supervisor.spawn(&self.spec)?;
        let stdout = supervisor.take_stdout().ok_or(KernelError::NotRunning)?;
        *self.stdin.lock().await = supervisor.take_stdin();

        let kind = self.kind.clone();
        let events = self.events.clone();
        let handle = tokio::spawn(async move {
            read_events(kind, pid, stdout, events).await;
        });
        *self.reader.lock().await = Some(handle);

        Ok(())
    }

    /// Stop the child and wait for its reader to publish the exit
    async fn terminate(&self) -> Result<(), KernelError> {
        self.stdin.lock().await.take();
        let result = self.supervisor.lock().await.terminate().await;

        if let Some(handle) = self.reader.lock().await.take() {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, handle).await.is_err() {
                warn!(kind = %self.kind, "Kernel stdout reader did not finish after termination");
            }
        }

        result
    }

    /// Whether the child process is alive
    pub async fn is_running(&self) -> bool {
        self.supervisor.lock().await.check_status().is_running()
    }
}

#[async_trait]
impl KernelRuntime for ProcessKernel {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn start(&self) -> Result<(), KernelError> {
        self.spawn().await
    }

    async fn restart(&self) -> Result<(), KernelError> {
        info!(kind = %self.kind, "Restarting kernel process");
        self.terminate().await?;
        self.spawn().await
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        self.supervisor.lock().await.interrupt()
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        self.terminate().await
    }

    fn open_channel(&self) -> Box<dyn EventChannel> {
        Box::new(BroadcastChannel {
            rx: Some(self.events.subscribe()),
        })
    }

    async fn submit(&self, code: &str) -> Result<(), KernelError> {
        let request = serde_json::json!({
            "msg_type": "execute_request",
            "content": { "code": code },
        });
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(KernelError::NotRunning)?;
        pipe.write_all(&line).await?;
        pipe.flush().await?;
        Ok(())
    }
}

/// Forward parsed stdout lines to subscribers until the pipe closes
async fn read_events(
    kind: String,
    pid: u32,
    stdout: ChildStdout,
    events: broadcast::Sender<ChannelItem>,
) {
    let mut lines = BufReader::new(stdout).lines();

    let reason = loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_str::<KernelEvent>(line) {
                    Ok(event) => {
                        debug!(kind = %kind, pid = pid, msg_type = %event.kind, "Kernel event");
                        // No subscribers is fine; events outside an execution are dropped
                        let _ = events.send(ChannelItem::Event(event));
                    }
                    Err(e) => {
                        warn!(kind = %kind, pid = pid, error = %e, line = %line, "Skipping non-JSON kernel output");
                    }
                }
            }
            Ok(None) => break format!("kernel process {pid} closed its output"),
            Err(e) => break format!("failed reading kernel process {pid} output: {e}"),
        }
    };

    debug!(kind = %kind, pid = pid, reason = %reason, "Kernel stdout reader finished");
    let _ = events.send(ChannelItem::Exited(reason));
}

/// Event channel backed by a broadcast subscription
struct BroadcastChannel {
    rx: Option<broadcast::Receiver<ChannelItem>>,
}

#[async_trait]
impl EventChannel for BroadcastChannel {
    async fn next_event(&mut self) -> Result<KernelEvent, ChannelError> {
        let rx = self.rx.as_mut().ok_or(ChannelError::Closed)?;
        match rx.recv().await {
            Ok(ChannelItem::Event(event)) => Ok(event),
            Ok(ChannelItem::Exited(reason)) => Err(ChannelError::KernelExited(reason)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Err(ChannelError::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => Err(ChannelError::Closed),
        }
    }

    fn close(&mut self) {
        self.rx = None;
    }
}

/// Creates process kernels from configured kernel specs
#[derive(Debug, Clone)]
pub struct ProcessKernelFactory {
    kernels: HashMap<String, KernelSpec>,
    event_buffer: usize,
    shutdown_grace: Duration,
}

impl ProcessKernelFactory {
    pub fn new(
        kernels: HashMap<String, KernelSpec>,
        event_buffer: usize,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            kernels,
            event_buffer,
            shutdown_grace,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(
            config.kernels.clone(),
            config.event_buffer,
            config.shutdown_grace,
        )
    }

    /// Names of the kinds this factory can build
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.kernels.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

impl RuntimeFactory for ProcessKernelFactory {
    fn create(&self, kind: &str) -> Result<Arc<dyn KernelRuntime>, KernelError> {
        let spec = self
            .kernels
            .get(kind)
            .ok_or_else(|| KernelError::UnknownKind(kind.to_string()))?;

        Ok(Arc::new(ProcessKernel::new(
            kind,
            spec.clone(),
            self.event_buffer,
            self.shutdown_grace,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A shell kernel: echoes each request back as a stream event
    fn echo_spec() -> KernelSpec {
        let script = r#"
while IFS= read -r line; do
  printf '%s\n' '{"msg_type":"status","content":{"execution_state":"busy"}}'
  printf '%s\n' 'not json'
  printf '{"msg_type":"stream","content":{"name":"stdout","text":%s}}\n' "$(printf '%s' "$line" | wc -c)"
  printf '%s\n' '{"msg_type":"status","content":{"execution_state":"idle"}}'
done
"#;
        KernelSpec {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: HashMap::new(),
            cwd: None,
        }
    }

    fn kernel() -> ProcessKernel {
        ProcessKernel::new("sh", echo_spec(), 64, Duration::from_secs(1))
    }

    async fn next(channel: &mut Box<dyn EventChannel>) -> Result<KernelEvent, ChannelError> {
        tokio::time::timeout(Duration::from_secs(5), channel.next_event())
            .await
            .expect("kernel event within timeout")
    }

    #[tokio::test]
    async fn test_submit_streams_events_and_skips_garbage() {
        let kernel = kernel();
        kernel.start().await.unwrap();
        assert!(kernel.is_running().await);

        let mut channel = kernel.open_channel();
        kernel.submit("print(1)").await.unwrap();

        assert_eq!(next(&mut channel).await.unwrap().execution_state(), Some("busy"));
        let stream = next(&mut channel).await.unwrap();
        assert_eq!(stream.kind, "stream");
        assert!(stream.payload["text"].as_u64().unwrap() > 0);
        assert_eq!(next(&mut channel).await.unwrap().execution_state(), Some("idle"));

        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_reports_exit_to_open_channels() {
        let kernel = kernel();
        kernel.start().await.unwrap();
        let mut channel = kernel.open_channel();

        kernel.shutdown().await.unwrap();

        assert!(matches!(
            next(&mut channel).await,
            Err(ChannelError::KernelExited(_))
        ));
        assert!(!kernel.is_running().await);
    }

    #[tokio::test]
    async fn test_submit_without_start_fails() {
        let kernel = kernel();
        assert!(matches!(
            kernel.submit("x").await,
            Err(KernelError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn test_restart_keeps_channel_subscribed() {
        let kernel = kernel();
        kernel.start().await.unwrap();
        let mut channel = kernel.open_channel();

        kernel.restart().await.unwrap();
        assert!(kernel.is_running().await);

        // The old process's exit, then events from the new one
        assert!(matches!(
            next(&mut channel).await,
            Err(ChannelError::KernelExited(_))
        ));
        kernel.submit("again").await.unwrap();
        assert_eq!(next(&mut channel).await.unwrap().execution_state(), Some("busy"));

        kernel.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_channel_reads_fail() {
        let kernel = kernel();
        let mut channel = kernel.open_channel();
        channel.close();
        assert_eq!(channel.next_event().await, Err(ChannelError::Closed));
    }

    #[test]
    fn test_factory_unknown_kind() {
        let factory = ProcessKernelFactory::new(HashMap::new(), 16, Duration::from_secs(1));
        assert!(matches!(
            factory.create("ruby"),
            Err(KernelError::UnknownKind(kind)) if kind == "ruby"
        ));
    }

    #[test]
    fn test_factory_from_config() {
        let factory = ProcessKernelFactory::from_config(&PoolConfig::default());
        assert_eq!(factory.kinds(), vec!["python3".to_string()]);

        let runtime = factory.create("python3").unwrap();
        assert_eq!(runtime.kind(), "python3");
    }
}
