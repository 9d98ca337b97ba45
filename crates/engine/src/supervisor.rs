//! Adaptive worker-pool supervisor.
//!
//! Keeps between `min_worker` and `max_worker` worker tasks alive, grows
//! the pool when most workers are busy and lets it shrink through the
//! workers' voluntary exits. The control loop runs on a fixed period but
//! is woken early by worker exits, counter changes and shutdown.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info};

use checkmill_core::Options;

use crate::api::{PoolConfig, PoolSnapshot};
use crate::broker::Broker;
use crate::counter::JobCounter;
use crate::worker::run_worker;

/// Pick the pool size for the next cycle.
///
/// Returns a value in `[min, max]`. Grows by two whenever jobs are
/// running and over 90% of the workers are busy or at most two are idle.
/// Deliberately never shrinks below `min` on its own; the pool shrinks
/// only through workers exiting after their job limit.
pub(crate) fn adjust(min: usize, max: usize, workers: usize, jobs: usize) -> usize {
    if workers == 0 || workers >= max {
        return workers.clamp(min, max);
    }
    let busy_pct = jobs * 100 / workers;
    let idle = workers.saturating_sub(jobs);

    let target = if jobs > 0 && (busy_pct > 90 || idle <= 2) {
        workers + 2
    } else {
        min
    };
    target.clamp(min, max)
}

struct Pool<B: Broker> {
    broker: B,
    opts: Arc<Options>,
    cfg: PoolConfig,
    counter: JobCounter,
    workers: JoinSet<()>,
    next_worker_idx: usize,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
}

impl<B: Broker> Pool<B> {
    fn spawn_worker(&mut self) {
        let idx = self.next_worker_idx;
        self.next_worker_idx += 1;
        self.workers.spawn(run_worker(
            idx,
            self.broker.clone(),
            self.opts.clone(),
            self.counter.clone(),
            self.stop_rx.clone(),
        ));
    }

    fn in_flight(&self) -> u32 {
        self.counter.load().min(self.workers.len() as u32)
    }

    fn push_snapshot(&self) {
        let _ = self.snapshot_tx.send(PoolSnapshot {
            population: self.workers.len(),
            in_flight: self.in_flight(),
            shutdown: *self.stop_rx.borrow(),
        });
    }

    /// One control cycle: reap, top up to the minimum, then to the
    /// adjusted target. Spawning is followed by a short pause so a load
    /// spike cannot trigger a spawn storm.
    async fn maintain(&mut self) {
        while self.workers.try_join_next().is_some() {}

        let population = self.workers.len();
        let in_flight = self.in_flight() as usize;

        let mut spawned = 0usize;
        while self.workers.len() < self.opts.min_worker {
            self.spawn_worker();
            spawned += 1;
        }

        let target = adjust(self.opts.min_worker, self.opts.max_worker, self.workers.len(), in_flight);
        while self.workers.len() < target {
            self.spawn_worker();
            spawned += 1;
        }

        if spawned > 0 {
            debug!(population, in_flight, spawned, "pool grown");
            tokio::time::sleep(self.cfg.spawn_pause).await;
        }
    }

    async fn run(mut self) -> anyhow::Result<()> {
        for _ in 0..self.opts.min_worker {
            self.spawn_worker();
        }
        info!(workers = self.workers.len(), "worker pool started");

        let mut tick = tokio::time::interval(self.cfg.control_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            self.push_snapshot();

            tokio::select! {
                _ = tick.tick() => {
                    self.maintain().await;
                }
                _ = self.counter.changed() => {}
                joined = self.workers.join_next(), if !self.workers.is_empty() => {
                    if joined.is_some() {
                        debug!(population = self.workers.len(), "worker exited");
                    }
                }
                changed = self.stop_rx.changed() => {
                    // A closed channel means the handle is gone; stop too.
                    if changed.is_err() || *self.stop_rx.borrow() {
                        break;
                    }
                }
            }
        }

        info!(population = self.workers.len(), "shutting down, waiting for running checks");
        self.push_snapshot();
        while self.workers.join_next().await.is_some() {}
        self.push_snapshot();
        info!("worker pool stopped");
        Ok(())
    }
}

/// Run the worker loop in-process, without pool machinery.
///
/// Used when the pool is pinned to exactly one worker.
async fn run_single<B: Broker>(
    broker: B,
    opts: Arc<Options>,
    counter: JobCounter,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
) -> anyhow::Result<()> {
    info!("running standalone, one worker in-process");
    let worker = run_worker(0, broker, opts, counter.clone(), stop_rx.clone());
    tokio::pin!(worker);

    loop {
        let _ = snapshot_tx.send(PoolSnapshot {
            population: 1,
            in_flight: counter.load().min(1),
            shutdown: *stop_rx.borrow(),
        });
        tokio::select! {
            _ = &mut worker => break,
            _ = counter.changed() => {}
        }
    }

    let _ = snapshot_tx.send(PoolSnapshot {
        population: 0,
        in_flight: 0,
        shutdown: *stop_rx.borrow(),
    });
    Ok(())
}

pub(crate) async fn run_pool<B: Broker>(
    broker: B,
    opts: Arc<Options>,
    cfg: PoolConfig,
    counter: JobCounter,
    stop_rx: watch::Receiver<bool>,
    snapshot_tx: watch::Sender<PoolSnapshot>,
) -> anyhow::Result<()> {
    if opts.min_worker == 1 && opts.max_worker == 1 {
        return run_single(broker, opts, counter, stop_rx, snapshot_tx).await;
    }

    let pool = Pool {
        broker,
        opts,
        cfg,
        counter,
        workers: JoinSet::new(),
        next_worker_idx: 0,
        stop_rx,
        snapshot_tx,
    };
    pool.run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_stays_within_bounds() {
        for min in 1..=4usize {
            for max in min..=12usize {
                for workers in 0..=max {
                    for jobs in 0..=workers {
                        let target = adjust(min, max, workers, jobs);
                        assert!(target >= min, "adjust({min},{max},{workers},{jobs}) = {target}");
                        assert!(target <= max, "adjust({min},{max},{workers},{jobs}) = {target}");
                    }
                }
            }
        }
    }

    #[test]
    fn adjust_holds_at_max() {
        assert_eq!(adjust(1, 10, 10, 10), 10);
        assert_eq!(adjust(1, 10, 10, 0), 10);
    }

    #[test]
    fn adjust_never_shrinks_under_load() {
        for workers in 1..10usize {
            let jobs = workers; // fully loaded
            assert!(adjust(1, 10, workers, jobs) >= workers);
        }
        // 9 of 10 busy is > 90%.
        assert!(adjust(1, 20, 10, 10) >= 10);
    }

    #[test]
    fn adjust_grows_by_two_when_nearly_saturated() {
        assert_eq!(adjust(1, 10, 4, 4), 6);
        // Two idle workers still trigger growth.
        assert_eq!(adjust(1, 10, 6, 4), 8);
        // Plenty of idle capacity returns to the minimum.
        assert_eq!(adjust(2, 10, 8, 1), 2);
    }

    #[test]
    fn adjust_returns_min_when_idle() {
        assert_eq!(adjust(3, 10, 5, 0), 3);
    }
}
