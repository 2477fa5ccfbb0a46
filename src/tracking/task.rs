use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use prometheus::IntGauge;
use tokio::task::JoinHandle;
use tracing::debug;

/// Cleared when the owning handle is dropped. Tasks check it before every
/// side effect so nothing leaks out after teardown.
#[derive(Debug, Clone)]
pub struct Liveness(Arc<AtomicBool>);

impl Liveness {
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One slot in a live-task gauge, given back exactly once: when the task
/// ends on its own or when its handle is dropped, whichever comes first.
#[derive(Debug)]
struct GaugeSlot {
    gauge: Option<IntGauge>,
    released: AtomicBool,
}

impl GaugeSlot {
    fn take(gauge: Option<IntGauge>) -> Arc<Self> {
        if let Some(gauge) = &gauge {
            gauge.inc();
        }
        Arc::new(Self {
            gauge,
            released: AtomicBool::new(false),
        })
    }

    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(gauge) = &self.gauge {
            gauge.dec();
        }
    }
}

/// Moved into the task; releases the slot when the future is dropped.
struct ReleaseOnExit(Arc<GaugeSlot>);

impl Drop for ReleaseOnExit {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Owner of one background task. Dropping it stops the task and releases
/// its slot in the matching gauge.
pub struct TaskHandle {
    name: &'static str,
    handle: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    slot: Arc<GaugeSlot>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(name: &'static str, gauge: Option<IntGauge>, task: F) -> Self
    where
        F: FnOnce(Liveness) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let alive = Arc::new(AtomicBool::new(true));
        let slot = GaugeSlot::take(gauge);
        let on_exit = ReleaseOnExit(slot.clone());
        let task = task(Liveness(alive.clone()));
        let handle = tokio::spawn(async move {
            let _on_exit = on_exit;
            task.await;
        });
        debug!(task = name, "background task started");

        Self {
            name,
            handle,
            alive,
            slot,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Release);
        self.handle.abort();
        self.slot.release();
        debug!(task = self.name, "background task stopped");
    }
}

impl std::fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskHandle")
            .field("name", &self.name)
            .field("finished", &self.handle.is_finished())
            .finish()
    }
}
