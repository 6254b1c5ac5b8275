// ABOUTME: In-memory kernel runtimes for unit tests
// ABOUTME: Count lifecycle calls and replay scripted event sequences

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::{EventChannel, KernelEvent, KernelRuntime, RuntimeFactory};
use crate::error::{ChannelError, KernelError};

type Item = Result<KernelEvent, ChannelError>;

/// Channel replaying a fixed script, counting how often it is closed
pub struct ScriptedChannel {
    items: VecDeque<Item>,
    closes: Arc<AtomicUsize>,
    closed: bool,
}

impl ScriptedChannel {
    pub fn new(items: Vec<Item>) -> (Self, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        (
            Self {
                items: items.into(),
                closes: Arc::clone(&closes),
                closed: false,
            },
            closes,
        )
    }
}

#[async_trait]
impl EventChannel for ScriptedChannel {
    async fn next_event(&mut self) -> Result<KernelEvent, ChannelError> {
        if self.closed {
            return Err(ChannelError::Closed);
        }
        match self.items.pop_front() {
            Some(item) => item,
            // An exhausted script behaves like a kernel that never goes idle
            None => std::future::pending().await,
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared counters and knobs for every kernel a [`FakeFactory`] builds
#[derive(Default)]
pub struct FakeState {
    pub spawns: AtomicUsize,
    pub restarts: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub submits: AtomicUsize,
    pub fail_shutdown: AtomicBool,
    pub fail_interrupt: AtomicBool,
}

pub struct FakeKernel {
    kind: String,
    state: Arc<FakeState>,
    start_delay: Duration,
    fail_start: bool,
    script: Vec<Item>,
    events: broadcast::Sender<Item>,
}

#[async_trait]
impl KernelRuntime for FakeKernel {
    fn kind(&self) -> &str {
        &self.kind
    }

    async fn start(&self) -> Result<(), KernelError> {
        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_start {
            return Err(KernelError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "fake spawn failure",
            )));
        }
        self.state.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<(), KernelError> {
        self.state.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), KernelError> {
        if self.state.fail_interrupt.load(Ordering::SeqCst) {
            return Err(KernelError::Signal("fake interrupt failure".to_string()));
        }
        self.state.interrupts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), KernelError> {
        if self.state.fail_shutdown.load(Ordering::SeqCst) {
            return Err(KernelError::TerminateFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fake shutdown failure",
            )));
        }
        self.state.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_channel(&self) -> Box<dyn EventChannel> {
        Box::new(FakeChannel {
            rx: Some(self.events.subscribe()),
        })
    }

    async fn submit(&self, _code: &str) -> Result<(), KernelError> {
        self.state.submits.fetch_add(1, Ordering::SeqCst);
        for item in &self.script {
            let _ = self.events.send(item.clone());
        }
        Ok(())
    }
}

struct FakeChannel {
    rx: Option<broadcast::Receiver<Item>>,
}

#[async_trait]
impl EventChannel for FakeChannel {
    async fn next_event(&mut self) -> Result<KernelEvent, ChannelError> {
        let rx = self.rx.as_mut().ok_or(ChannelError::Closed)?;
        rx.recv().await.map_err(|_| ChannelError::Closed)?
    }

    fn close(&mut self) {
        self.rx = None;
    }
}

/// Factory producing [`FakeKernel`]s
pub struct FakeFactory {
    pub state: Arc<FakeState>,
    pub start_delay: Duration,
    pub failing_kinds: HashSet<String>,
    pub script: Vec<Item>,
    created: Mutex<usize>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            state: Arc::new(FakeState::default()),
            start_delay: Duration::ZERO,
            failing_kinds: HashSet::new(),
            script: vec![KernelEvent::status("busy"), KernelEvent::status("idle")]
                .into_iter()
                .map(Ok)
                .collect(),
            created: Mutex::new(0),
        }
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    pub fn with_failing_kind(mut self, kind: &str) -> Self {
        self.failing_kinds.insert(kind.to_string());
        self
    }

    pub fn with_script(mut self, script: Vec<Item>) -> Self {
        self.script = script;
        self
    }

    pub fn spawns(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    pub fn created(&self) -> usize {
        *self.created.lock().unwrap()
    }
}

impl RuntimeFactory for FakeFactory {
    fn create(&self, kind: &str) -> Result<Arc<dyn KernelRuntime>, KernelError> {
        if kind == "unknown" {
            return Err(KernelError::UnknownKind(kind.to_string()));
        }
        *self.created.lock().unwrap() += 1;
        let (events, _) = broadcast::channel(64);
        Ok(Arc::new(FakeKernel {
            kind: kind.to_string(),
            state: Arc::clone(&self.state),
            start_delay: self.start_delay,
            fail_start: self.failing_kinds.contains(kind),
            script: self.script.clone(),
            events,
        }))
    }
}
