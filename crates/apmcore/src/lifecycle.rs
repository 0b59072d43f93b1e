//! Process-wide ownership of the Flusher's scheduling task, and recovery
//! from `fork()` (spec §4.7's "fork handling").
//!
//! The scheduling task dies across a fork because the child process gets
//! none of the parent's threads; the buffer survives because it's plain
//! heap memory owned by `Core`. `Lifecycle::ensure_running` is meant to be
//! called from the hot path (the host's request middleware) on every
//! request — the common case is a single atomic load.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::warn;

use crate::buffer::Buffer;
use crate::circuit::CircuitBreaker;
use crate::collector::Collector;
use crate::config::Config;
use crate::events::EventsPath;
use crate::flusher::Flusher;

/// The long-lived, process-wide state one embedding host constructs once.
pub struct Core {
    pub config: Config,
    pub buffer: Arc<Buffer>,
    pub circuit: Arc<CircuitBreaker>,
    pub flusher: Arc<Flusher>,
    pub collector: Arc<Collector>,
    pub events: EventsPath,
}

impl Core {
    pub fn new(config: Config, adapter: Box<dyn crate::persistence::PersistenceAdapter>, param_filter: Box<dyn crate::collector::filters::ParamFilter>) -> Self {
        let buffer = Arc::new(Buffer::new(config.max_buffer_memory));
        let circuit = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_recovery_timeout,
        ));
        let flusher = Arc::new(Flusher::new(config.clone(), buffer.clone(), circuit.clone(), adapter));
        let collector = Arc::new(Collector::new(config.clone(), buffer.clone(), param_filter));
        let events = EventsPath::new(config.clone(), buffer.clone());
        Self {
            config,
            buffer,
            circuit,
            flusher,
            collector,
            events,
        }
    }
}

pub struct Lifecycle {
    core: Arc<Core>,
    owner_pid: AtomicU32,
    flusher_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Lifecycle {
    pub fn new(core: Arc<Core>) -> Arc<Self> {
        let lifecycle = Arc::new(Self {
            core,
            owner_pid: AtomicU32::new(0),
            flusher_task: Mutex::new(None),
        });
        lifecycle.ensure_running();
        lifecycle
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Cheap on the common path: one atomic load-and-compare. Restarts the
    /// flusher's scheduling task when the recorded owner PID no longer
    /// matches the current process — i.e. we forked since it was started.
    pub fn ensure_running(&self) {
        let current = std::process::id();
        let previous = self.owner_pid.swap(current, Ordering::SeqCst);
        if previous == current {
            return;
        }
        self.restart_flusher();
    }

    fn restart_flusher(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("lifecycle: no tokio runtime on this thread, flusher scheduling task not started");
            return;
        };
        let flusher = self.core.flusher.clone();
        let task = handle.spawn(async move { flusher.run_forever().await });

        let mut slot = self.flusher_task.lock();
        if let Some(old) = slot.take() {
            old.abort();
        }
        *slot = Some(task);
    }

    /// Signals the flusher to stop after its current cycle and waits up to
    /// `shutdown_timeout` for it to finish.
    pub async fn shutdown(&self) {
        self.core.flusher.request_shutdown();
        let task = self.flusher_task.lock().take();
        if let Some(task) = task {
            let _ = tokio::time::timeout(self.core.config.shutdown_timeout, task).await;
        }
    }
}

static GLOBAL: OnceLock<Arc<Lifecycle>> = OnceLock::new();

/// Installs the process-wide `Lifecycle`. Returns the lifecycle already
/// installed (unused) if called more than once — hosts are expected to
/// call this exactly once at boot.
pub fn install_global(lifecycle: Arc<Lifecycle>) -> Result<(), Arc<Lifecycle>> {
    GLOBAL.set(lifecycle)
}

pub fn global() -> Option<&'static Arc<Lifecycle>> {
    GLOBAL.get()
}
