use std::path::PathBuf;

use clap::Parser;

use checkmill_core::Options;
use checkmill_core::options::OptionsError;

fn parse_switch(input: &str) -> Result<bool, String> {
    match input.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => Ok(true),
        "no" | "off" | "false" | "0" => Ok(false),
        _ => Err(format!("expected yes or no, got {input:?}")),
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "checkmill", version, about = "Distributed monitoring-check worker")]
pub struct Cli {
    /// Configuration file, applied before the other flags (repeatable).
    #[arg(long, value_name = "FILE")]
    pub config: Vec<PathBuf>,

    /// Broker endpoint as host[:port]; repeat or comma-separate for failover.
    #[arg(
        long = "server",
        env = "CHECKMILL_SERVER",
        value_name = "HOST[:PORT]",
        value_delimiter = ','
    )]
    pub server: Vec<String>,

    /// Work on the generic host queue.
    #[arg(long)]
    pub hosts: bool,

    /// Work on the generic service queue.
    #[arg(long)]
    pub services: bool,

    /// Work on the eventhandler queue.
    #[arg(long)]
    pub events: bool,

    /// Hostgroups to serve through their dedicated queues.
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub hostgroups: Vec<String>,

    /// Servicegroups to serve through their dedicated queues.
    #[arg(long, value_name = "NAMES", value_delimiter = ',')]
    pub servicegroups: Vec<String>,

    /// Minimum number of workers.
    #[arg(long = "min-worker", value_name = "NR", value_parser = clap::value_parser!(u16).range(1..))]
    pub min_worker: Option<u16>,

    /// Maximum number of workers.
    #[arg(long = "max-worker", value_name = "NR", value_parser = clap::value_parser!(u16).range(1..))]
    pub max_worker: Option<u16>,

    /// Default per-job wall clock in seconds.
    #[arg(long = "job-timeout", value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub job_timeout: Option<u64>,

    /// Drop jobs that waited on the queue longer than this many seconds.
    #[arg(long = "max-age", value_name = "SECONDS", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_age: Option<u64>,

    /// Jobs a worker handles before it exits and is replaced.
    #[arg(long = "max-jobs", value_name = "NR", value_parser = clap::value_parser!(u64).range(1..))]
    pub max_jobs: Option<u64>,

    /// Shared encryption key.
    #[arg(long, env = "CHECKMILL_KEY", value_name = "KEY")]
    pub key: Option<String>,

    /// Read the shared encryption key from a file (first 32 bytes).
    #[arg(long, value_name = "FILE")]
    pub keyfile: Option<PathBuf>,

    /// Encrypt payloads; base64-only transport when disabled.
    #[arg(long, value_name = "YES|NO", value_parser = parse_switch)]
    pub encryption: Option<bool>,

    /// Log verbosity, 0 (info) to 5 (trace).
    #[arg(long = "debug", value_name = "LEVEL", value_parser = clap::value_parser!(u8).range(0..=5))]
    pub debug: Option<u8>,

    /// Append the worker identity to every check output.
    #[arg(long = "debug-result", value_name = "YES|NO", value_parser = parse_switch)]
    pub debug_result: Option<bool>,

    /// Queue the results are published on.
    #[arg(long = "result-queue", value_name = "QUEUE")]
    pub result_queue: Option<String>,

    /// Write the supervisor pid to this file.
    #[arg(long, value_name = "FILE")]
    pub pidfile: Option<PathBuf>,
}

impl Cli {
    /// Merge config files and flags into the final option record.
    ///
    /// Files are applied first, in the order given; flags win over files.
    pub fn into_options(self) -> Result<Options, OptionsError> {
        let mut opts = Options::default();

        for path in &self.config {
            opts.load_file(path)?;
        }

        for server in &self.server {
            opts.add_servers(server);
        }
        if self.hosts {
            opts.hosts = true;
            opts.queues_set = true;
        }
        if self.services {
            opts.services = true;
            opts.queues_set = true;
        }
        if self.events {
            opts.events = true;
            opts.queues_set = true;
        }
        if !self.hostgroups.is_empty() {
            opts.hostgroups.extend(self.hostgroups.iter().cloned());
            opts.queues_set = true;
        }
        if !self.servicegroups.is_empty() {
            opts.servicegroups.extend(self.servicegroups.iter().cloned());
            opts.queues_set = true;
        }

        if let Some(value) = self.min_worker {
            opts.min_worker = value as usize;
        }
        if let Some(value) = self.max_worker {
            opts.max_worker = value as usize;
        }
        if let Some(value) = self.job_timeout {
            opts.job_timeout = value;
        }
        if let Some(value) = self.max_age {
            opts.max_age = value;
        }
        if let Some(value) = self.max_jobs {
            opts.max_jobs = value;
        }
        if let Some(value) = self.key {
            opts.crypt_key = Some(value);
        }
        if let Some(value) = self.keyfile {
            opts.keyfile = Some(value);
        }
        if let Some(value) = self.encryption {
            opts.encryption = value;
        }
        if let Some(value) = self.debug {
            opts.debug_level = value;
        }
        if let Some(value) = self.debug_result {
            opts.debug_result = value;
        }
        if let Some(value) = self.result_queue {
            opts.result_queue = value;
        }
        if let Some(value) = self.pidfile {
            opts.pidfile = Some(value);
        }

        opts.load_keyfile()?;
        opts.normalize();
        Ok(opts)
    }
}
