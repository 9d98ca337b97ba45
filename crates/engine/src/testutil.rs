//! Helpers shared by the engine test modules.

use std::collections::BTreeMap;
use std::time::Duration;

use checkmill_core::{Codec, Options};

use crate::broker::MemoryBroker;
use crate::executor::now_epoch;

/// Options wired for the in-memory broker, generic queues enabled.
pub(crate) fn test_opts(encryption: bool) -> Options {
    let mut opts = Options {
        hosts: true,
        services: true,
        queues_set: true,
        encryption,
        ..Options::default()
    };
    if encryption {
        opts.crypt_key = Some("A".repeat(32));
    }
    opts.add_servers("memory-broker");
    opts
}

/// Envelope fields of a service check starting now.
pub(crate) fn job_fields(command: &str, timeout: u64) -> BTreeMap<String, String> {
    let now = now_epoch();
    [
        ("type", "service".to_string()),
        ("host_name", "h1".to_string()),
        ("service_description", "cpu".to_string()),
        ("command_line", command.to_string()),
        ("timeout", timeout.to_string()),
        ("start_time", format!("{now:.6}")),
        ("core_start_time", format!("{now:.6}")),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

/// Poll the result queue until `count` payloads have arrived.
pub(crate) async fn collect_results(broker: &MemoryBroker, queue: &str, count: usize) -> Vec<Vec<u8>> {
    let mut results = Vec::new();
    for _ in 0..400 {
        results.extend(broker.drain(queue));
        if results.len() >= count {
            return results;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("expected {count} results on {queue:?}, got {}", results.len());
}

/// Decode a result payload with the codec matching `opts`.
pub(crate) fn decode_result(opts: &Options, payload: &[u8]) -> BTreeMap<String, String> {
    Codec::new(opts.effective_key())
        .decode(payload)
        .expect("result payload should decode")
}
