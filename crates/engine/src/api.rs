//! Public API types for running a `checkmill` worker pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use checkmill_core::Options;

use crate::broker::Broker;
use crate::counter::JobCounter;

/// Tuning knobs of the pool supervisor.
///
/// The defaults match production behaviour; tests shrink the intervals.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Period of the population-maintenance cycle.
    pub control_interval: Duration,
    /// Pause after a cycle that spawned workers, limiting fork storms.
    pub spawn_pause: Duration,
}

impl PoolConfig {
    /// Default maintenance period.
    pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(30);

    /// Default post-spawn pause.
    pub const DEFAULT_SPAWN_PAUSE: Duration = Duration::from_secs(1);
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            control_interval: Self::DEFAULT_CONTROL_INTERVAL,
            spawn_pause: Self::DEFAULT_SPAWN_PAUSE,
        }
    }
}

/// Point-in-time view of the pool.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    /// Live worker tasks.
    pub population: usize,
    /// Jobs currently executing, clamped to the population.
    pub in_flight: u32,
    /// Whether shutdown has been requested.
    pub shutdown: bool,
}

pub(crate) struct PoolInner {
    pub(crate) stop_tx: watch::Sender<bool>,
    pub(crate) snapshot_rx: watch::Receiver<PoolSnapshot>,
}

/// Cloneable control surface of a running pool.
#[derive(Clone)]
pub struct PoolController {
    inner: Arc<PoolInner>,
}

impl PoolController {
    /// Ask the pool to shut down; workers finish their current job first.
    pub fn request_stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    /// Latest published pool snapshot.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }
}

/// Handle to a running worker pool.
pub struct PoolHandle {
    inner: Arc<PoolInner>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl PoolHandle {
    /// Ask the pool to shut down; workers finish their current job first.
    pub fn request_stop(&self) {
        let _ = self.inner.stop_tx.send(true);
    }

    /// Latest published pool snapshot.
    pub fn snapshot(&self) -> PoolSnapshot {
        self.inner.snapshot_rx.borrow().clone()
    }

    /// A cloneable controller, e.g. for a signal-handler task.
    pub fn controller(&self) -> PoolController {
        PoolController { inner: self.inner.clone() }
    }

    /// Wait for the pool to stop completely.
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(result) => result,
            Err(err) => Err(anyhow::anyhow!("pool task join error: {err}")),
        }
    }
}

/// Start a worker pool for `opts`, pulling jobs through `broker`.
///
/// With `min_worker == max_worker == 1` the worker loop runs without the
/// pool machinery.
pub fn start_pool<B: Broker>(broker: B, opts: Options, cfg: PoolConfig) -> PoolHandle {
    let (stop_tx, stop_rx) = watch::channel(false);
    let (snapshot_tx, snapshot_rx) = watch::channel(PoolSnapshot::default());
    let counter = JobCounter::new();

    let join = tokio::spawn(crate::supervisor::run_pool(
        broker,
        Arc::new(opts),
        cfg,
        counter,
        stop_rx,
        snapshot_tx,
    ));

    PoolHandle {
        inner: Arc::new(PoolInner { stop_tx, snapshot_rx }),
        join,
    }
}
