//! Typed view of a single check job and its result.

use std::collections::BTreeMap;

/// Output used when a job sat on the queue longer than `max_age`.
pub const OUTPUT_TOO_OLD: &str = "(Could Not Start Check In Time)";

/// Output used when the check ran past its wall-clock deadline.
pub const OUTPUT_TIMED_OUT: &str = "(Check Timed Out)";

/// Kind of check a job describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckType {
    /// Host check.
    Host,
    /// Service check; carries a `service_description`.
    Service,
    /// Event handler invocation.
    EventHandler,
}

impl CheckType {
    /// Wire name, as used in the `type` envelope field and queue names.
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Host => "host",
            CheckType::Service => "service",
            CheckType::EventHandler => "eventhandler",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "host" => Some(CheckType::Host),
            "service" => Some(CheckType::Service),
            "eventhandler" => Some(CheckType::EventHandler),
            _ => None,
        }
    }
}

/// A job failed validation; the envelope is handed back to the broker.
#[derive(Debug, thiserror::Error)]
#[error("invalid job: {field}: {reason}")]
pub struct InvalidJob {
    /// Envelope field that failed.
    pub field: &'static str,
    /// What was wrong with it.
    pub reason: String,
}

fn invalid(field: &'static str, reason: impl Into<String>) -> InvalidJob {
    InvalidJob { field, reason: reason.into() }
}

/// One check to execute, parsed from a queue envelope.
#[derive(Debug, Clone)]
pub struct Job {
    pub check_type: CheckType,
    pub host_name: String,
    pub service_description: Option<String>,
    pub command_line: String,
    /// Wall-clock limit in seconds, always >= 1.
    pub timeout: u64,
    /// When the scheduler wanted the check to start (epoch seconds).
    pub start_time: Option<f64>,
    /// When the monitoring core dispatched the job (epoch seconds).
    pub core_start_time: Option<f64>,
    pub next_check: Option<f64>,
    /// Scheduler-side latency carried through into the result.
    pub latency: f64,
    pub check_options: Option<String>,
    pub scheduled_check: i64,
    pub reschedule_check: i64,
}

impl Job {
    /// Build and validate a job from decoded envelope fields.
    ///
    /// `default_timeout` fills in a missing `timeout`; either way the
    /// effective timeout is clamped to at least one second.
    pub fn from_fields(
        fields: &BTreeMap<String, String>,
        default_timeout: u64,
    ) -> Result<Self, InvalidJob> {
        let type_raw = req(fields, "type")?;
        let check_type =
            CheckType::parse(type_raw).ok_or_else(|| invalid("type", format!("unknown check type {type_raw:?}")))?;

        let host_name = req(fields, "host_name")?.to_string();
        let command_line = req(fields, "command_line")?.to_string();

        let service_description = opt(fields, "service_description").map(str::to_string);
        if check_type == CheckType::Service && service_description.is_none() {
            return Err(invalid("service_description", "required for service checks"));
        }

        let timeout = match opt(fields, "timeout") {
            Some(raw) => raw
                .parse::<u64>()
                .map_err(|_| invalid("timeout", format!("not a number: {raw:?}")))?,
            None => default_timeout,
        }
        .max(1);

        Ok(Job {
            check_type,
            host_name,
            service_description,
            command_line,
            timeout,
            start_time: parse_time(fields, "start_time")?,
            core_start_time: parse_time(fields, "core_start_time")?,
            next_check: parse_time(fields, "next_check")?,
            latency: parse_time(fields, "latency")?.unwrap_or(0.0),
            check_options: opt(fields, "check_options").map(str::to_string),
            scheduled_check: parse_flag(fields, "scheduled_check")?,
            reschedule_check: parse_flag(fields, "reschedule_check")?,
        })
    }

    /// True when the job has been sitting on the queue longer than `max_age`.
    ///
    /// A job without a `start_time` is never considered expired.
    pub fn expired(&self, now: f64, max_age: u64) -> bool {
        match self.start_time {
            Some(start) => now - start > max_age as f64,
            None => false,
        }
    }

    /// Seconds between dispatch by the core and the actual execution start.
    pub fn latency_at(&self, exec_start: f64) -> f64 {
        match self.core_start_time {
            Some(core) => (exec_start - core).max(0.0),
            None => self.latency,
        }
    }
}

fn req<'a>(fields: &'a BTreeMap<String, String>, key: &'static str) -> Result<&'a str, InvalidJob> {
    match fields.get(key).map(String::as_str) {
        Some("") | None => Err(invalid(key, "missing")),
        Some(value) => Ok(value),
    }
}

fn opt<'a>(fields: &'a BTreeMap<String, String>, key: &str) -> Option<&'a str> {
    fields.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_time(fields: &BTreeMap<String, String>, key: &'static str) -> Result<Option<f64>, InvalidJob> {
    match opt(fields, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| invalid(key, format!("not a timestamp: {raw:?}"))),
    }
}

fn parse_flag(fields: &BTreeMap<String, String>, key: &'static str) -> Result<i64, InvalidJob> {
    match opt(fields, key) {
        None => Ok(0),
        Some(raw) => raw
            .parse::<i64>()
            .map_err(|_| invalid(key, format!("not a number: {raw:?}"))),
    }
}

/// Outcome of one check, published on the result queue.
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub host_name: String,
    pub service_description: Option<String>,
    pub check_options: Option<String>,
    pub scheduled_check: i64,
    pub reschedule_check: i64,
    pub latency: f64,
    pub start_time: f64,
    pub finish_time: f64,
    pub early_timeout: bool,
    pub return_code: i32,
    /// False when the child was killed by a signal or never ran.
    pub exited_ok: bool,
    pub output: String,
    /// Which worker produced the result.
    pub source: String,
}

impl CheckResult {
    /// Result skeleton carrying the job's identity fields.
    pub fn for_job(job: &Job, source: &str) -> Self {
        CheckResult {
            host_name: job.host_name.clone(),
            service_description: job.service_description.clone(),
            check_options: job.check_options.clone(),
            scheduled_check: job.scheduled_check,
            reschedule_check: job.reschedule_check,
            latency: job.latency,
            start_time: 0.0,
            finish_time: 0.0,
            early_timeout: false,
            return_code: 0,
            exited_ok: false,
            output: String::new(),
            source: source.to_string(),
        }
    }

    /// UNKNOWN result for a job that aged out before it could run.
    pub fn too_old(job: &Job, now: f64, source: &str) -> Self {
        let mut result = CheckResult::for_job(job, source);
        result.start_time = job.start_time.unwrap_or(now);
        result.finish_time = now;
        result.return_code = 3;
        result.output = OUTPUT_TOO_OLD.to_string();
        result
    }

    /// Render the result envelope fields.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("host_name".to_string(), self.host_name.clone());
        if let Some(desc) = &self.service_description {
            fields.insert("service_description".to_string(), desc.clone());
        }
        if let Some(options) = &self.check_options {
            fields.insert("check_options".to_string(), options.clone());
        }
        fields.insert("scheduled_check".to_string(), self.scheduled_check.to_string());
        fields.insert("reschedule_check".to_string(), self.reschedule_check.to_string());
        fields.insert("latency".to_string(), format!("{:.6}", self.latency));
        fields.insert("start_time".to_string(), format!("{:.6}", self.start_time));
        fields.insert("finish_time".to_string(), format!("{:.6}", self.finish_time));
        fields.insert("early_timeout".to_string(), flag(self.early_timeout));
        fields.insert("return_code".to_string(), self.return_code.to_string());
        fields.insert("exited_ok".to_string(), flag(self.exited_ok));
        fields.insert("output".to_string(), self.output.clone());
        fields.insert("source".to_string(), self.source.clone());
        fields
    }
}

fn flag(value: bool) -> String {
    if value { "1".to_string() } else { "0".to_string() }
}
