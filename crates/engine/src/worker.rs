//! The worker loop: pull a job, run it, publish the result.

use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use checkmill_core::job::{CheckResult, Job};
use checkmill_core::{Codec, Options};

use crate::broker::{Broker, Connection, Delivery};
use crate::counter::JobCounter;
use crate::executor;

/// Reconnect policy for a lost broker connection.
const MAX_CONNECT_ATTEMPTS: u32 = 10;
const RECONNECT_DELAY_MIN: Duration = Duration::from_secs(1);
const RECONNECT_DELAY_MAX: Duration = Duration::from_secs(30);

/// Result submissions are retried this often before the result is dropped.
const SUBMIT_ATTEMPTS: u32 = 3;

/// Remembered payload digests for the nack-once policy.
const NACK_MEMO_SIZE: usize = 64;

/// Priority assigned to the per-group queues; generic queues get 0.
const GROUP_QUEUE_PRIORITY: u32 = 1;

/// Queues a worker subscribes to, highest priority first.
pub(crate) fn queue_list(opts: &Options) -> Vec<(String, u32)> {
    let mut queues = Vec::new();
    for group in &opts.hostgroups {
        queues.push((format!("hostgroup_{group}"), GROUP_QUEUE_PRIORITY));
    }
    for group in &opts.servicegroups {
        queues.push((format!("servicegroup_{group}"), GROUP_QUEUE_PRIORITY));
    }
    if opts.hosts {
        queues.push(("host".to_string(), 0));
    }
    if opts.services {
        queues.push(("service".to_string(), 0));
    }
    if opts.events {
        queues.push(("eventhandler".to_string(), 0));
    }
    queues
}

fn source_name() -> String {
    format!("checkmill worker @ {}", gethostname::gethostname().to_string_lossy())
}

/// Bounded memory of payloads that were already nacked once.
///
/// A payload seen here again is discarded instead of being handed back,
/// so a poison message cannot ping-pong with the broker forever.
struct NackMemo {
    digests: VecDeque<u64>,
}

impl NackMemo {
    fn new() -> Self {
        Self { digests: VecDeque::new() }
    }

    /// True when this payload has not been nacked before.
    fn first_sighting(&mut self, payload: &[u8]) -> bool {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        payload.hash(&mut hasher);
        let digest = hasher.finish();

        if self.digests.contains(&digest) {
            return false;
        }
        if self.digests.len() >= NACK_MEMO_SIZE {
            self.digests.pop_front();
        }
        self.digests.push_back(digest);
        true
    }
}

/// True once shutdown has been requested (or the supervisor is gone).
fn stop_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Connect and subscribe, backing off between attempts.
///
/// Returns `None` when the broker stayed unreachable or shutdown was
/// requested while waiting; the caller exits in both cases.
async fn establish<B: Broker>(
    worker_idx: usize,
    broker: &B,
    opts: &Options,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<B::Conn> {
    let mut delay = RECONNECT_DELAY_MIN;
    for attempt in 1..=MAX_CONNECT_ATTEMPTS {
        if stop_requested(shutdown) {
            return None;
        }
        match broker.connect().await {
            Ok(mut conn) => {
                let mut subscribed = true;
                for (queue, priority) in queue_list(opts) {
                    if let Err(err) = conn.subscribe(&queue, priority).await {
                        warn!(worker_idx, %queue, "subscribe failed: {err}");
                        subscribed = false;
                        break;
                    }
                }
                if subscribed {
                    return Some(conn);
                }
            }
            Err(err) => {
                warn!(worker_idx, attempt, "broker connect failed: {err}");
            }
        }
        if attempt == MAX_CONNECT_ATTEMPTS {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stopped(shutdown) => return None,
        }
        delay = (delay * 2).min(RECONNECT_DELAY_MAX);
    }
    error!(worker_idx, "giving up on the broker after {MAX_CONNECT_ATTEMPTS} attempts");
    None
}

/// Publish a result payload, retrying across servers before dropping it.
async fn publish<B: Broker>(
    worker_idx: usize,
    conn: &mut B::Conn,
    broker: &B,
    opts: &Options,
    payload: &str,
) {
    for attempt in 1..=SUBMIT_ATTEMPTS {
        match conn.submit(&opts.result_queue, payload.as_bytes()).await {
            Ok(()) => return,
            Err(err) => {
                warn!(worker_idx, attempt, "result submit failed: {err}");
            }
        }
        if attempt < SUBMIT_ATTEMPTS {
            // Rotate to the next server for the retry.
            match broker.connect().await {
                Ok(mut fresh) => {
                    for (queue, priority) in queue_list(opts) {
                        if fresh.subscribe(&queue, priority).await.is_err() {
                            break;
                        }
                    }
                    *conn = fresh;
                }
                Err(err) => {
                    warn!(worker_idx, attempt, "reconnect for retry failed: {err}");
                }
            }
        }
    }
    error!(worker_idx, "result lost after {SUBMIT_ATTEMPTS} submit attempts");
}

/// Handle one delivery end to end. Returns 1 when a job was completed
/// (a result was produced), 0 when the message was discarded.
async fn process_delivery<B: Broker>(
    worker_idx: usize,
    conn: &mut B::Conn,
    broker: &B,
    opts: &Options,
    codec: &Codec,
    counter: &JobCounter,
    memo: &mut NackMemo,
    source: &str,
    delivery: Delivery,
) -> u64 {
    let fields = match codec.decode(&delivery.payload) {
        Ok(fields) => fields,
        Err(err) => {
            warn!(worker_idx, queue = %delivery.queue, "dropping undecodable payload: {err}");
            reject(conn, memo, &delivery).await;
            return 0;
        }
    };

    let job = match Job::from_fields(&fields, opts.job_timeout) {
        Ok(job) => job,
        Err(err) => {
            warn!(worker_idx, queue = %delivery.queue, "{err}");
            reject(conn, memo, &delivery).await;
            return 0;
        }
    };

    let now = executor::now_epoch();
    if job.expired(now, opts.max_age) {
        debug!(
            worker_idx,
            host = %job.host_name,
            "job exceeded max age of {}s, answering without running it",
            opts.max_age
        );
        let result = CheckResult::too_old(&job, now, source);
        publish::<B>(worker_idx, conn, broker, opts, &codec.encode(&result.to_fields())).await;
        if let Err(err) = conn.ack(&delivery).await {
            warn!(worker_idx, "ack failed: {err}");
        }
        return 1;
    }

    trace!(worker_idx, host = %job.host_name, command = %job.command_line, "starting check");
    counter.increment();
    let outcome = executor::run(&job.command_line, Duration::from_secs(job.timeout)).await;
    counter.decrement();

    let mut result = CheckResult::for_job(&job, source);
    result.start_time = outcome.start;
    result.finish_time = outcome.finish;
    result.latency = job.latency_at(outcome.start);
    result.early_timeout = outcome.early_timeout;
    result.return_code = outcome.return_code;
    result.exited_ok = outcome.exited_ok;
    result.output = outcome.output;
    if opts.debug_result {
        result.output.push_str(&format!("\n(worker: {source})"));
    }

    debug!(
        worker_idx,
        host = %job.host_name,
        return_code = result.return_code,
        early_timeout = result.early_timeout,
        "check finished"
    );

    publish::<B>(worker_idx, conn, broker, opts, &codec.encode(&result.to_fields())).await;
    if let Err(err) = conn.ack(&delivery).await {
        warn!(worker_idx, "ack failed: {err}");
    }
    1
}

async fn reject<C: Connection>(conn: &mut C, memo: &mut NackMemo, delivery: &Delivery) {
    let result = if memo.first_sighting(&delivery.payload) {
        conn.nack(delivery).await
    } else {
        conn.ack(delivery).await
    };
    if let Err(err) = result {
        warn!("could not hand back message: {err}");
    }
}

/// Body of one worker task.
///
/// Runs until shutdown is requested, the broker stays unreachable, or
/// `max_jobs` checks have been handled; the current job is always
/// finished and its result published before exiting.
pub(crate) async fn run_worker<B: Broker>(
    worker_idx: usize,
    broker: B,
    opts: Arc<Options>,
    counter: JobCounter,
    mut shutdown: watch::Receiver<bool>,
) {
    let codec = Codec::new(opts.effective_key());
    let source = source_name();
    let mut memo = NackMemo::new();
    let mut jobs_done: u64 = 0;

    debug!(worker_idx, "worker started");

    'connection: loop {
        let Some(mut conn) = establish(worker_idx, &broker, &opts, &mut shutdown).await else {
            break;
        };

        loop {
            if stop_requested(&shutdown) {
                break 'connection;
            }
            let delivery = tokio::select! {
                _ = stopped(&mut shutdown) => break 'connection,
                received = conn.receive() => match received {
                    Ok(delivery) => delivery,
                    Err(err) => {
                        warn!(worker_idx, "receive failed: {err}");
                        continue 'connection;
                    }
                },
            };

            jobs_done += process_delivery::<B>(
                worker_idx, &mut conn, &broker, &opts, &codec, &counter, &mut memo, &source,
                delivery,
            )
            .await;

            if jobs_done >= opts.max_jobs {
                info!(worker_idx, jobs_done, "job limit reached, exiting");
                break 'connection;
            }
        }
    }

    debug!(worker_idx, jobs_done, "worker finished");
}
