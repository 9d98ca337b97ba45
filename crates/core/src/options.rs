//! The option record built once at startup and read-only afterwards.
//!
//! Values come from the command line and from `key=value` configuration
//! files; the file syntax matches the existing worker deployments
//! (`#` comments, blank lines, recursive `config=<file>` includes).

use std::path::{Path, PathBuf};

/// Default gearmand port appended to bare `host` server entries.
pub const DEFAULT_SERVER_PORT: u16 = 4730;

/// Default per-job wall clock in seconds.
pub const DEFAULT_JOB_TIMEOUT: u64 = 60;

/// Default maximum queue age in seconds.
pub const DEFAULT_MAX_AGE: u64 = 600;

/// Default number of jobs a worker handles before exiting voluntarily.
pub const DEFAULT_MAX_JOBS: u64 = 1000;

/// Default queue the results are published on.
pub const DEFAULT_RESULT_QUEUE: &str = "check_results";

const MAX_CONFIG_DEPTH: u32 = 10;

/// Configuration problems that prevent startup.
#[derive(Debug, thiserror::Error)]
pub enum OptionsError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config files nested deeper than {MAX_CONFIG_DEPTH} levels")]
    TooDeep,
    #[error("{0}")]
    Invalid(String),
}

/// Everything the worker processes need to know, resolved once at startup.
#[derive(Debug, Clone)]
pub struct Options {
    /// Broker endpoints as `host:port`, tried in order.
    pub servers: Vec<String>,
    pub hosts: bool,
    pub services: bool,
    pub events: bool,
    pub hostgroups: Vec<String>,
    pub servicegroups: Vec<String>,
    /// True once any queue selection was made explicitly; without it the
    /// three generic queues are enabled by default.
    pub queues_set: bool,
    pub min_worker: usize,
    pub max_worker: usize,
    pub job_timeout: u64,
    pub max_age: u64,
    pub max_jobs: u64,
    pub crypt_key: Option<String>,
    pub keyfile: Option<PathBuf>,
    pub encryption: bool,
    pub debug_level: u8,
    pub debug_result: bool,
    pub result_queue: String,
    pub pidfile: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            servers: Vec::new(),
            hosts: false,
            services: false,
            events: false,
            hostgroups: Vec::new(),
            servicegroups: Vec::new(),
            queues_set: false,
            min_worker: 1,
            max_worker: 20,
            job_timeout: DEFAULT_JOB_TIMEOUT,
            max_age: DEFAULT_MAX_AGE,
            max_jobs: DEFAULT_MAX_JOBS,
            crypt_key: None,
            keyfile: None,
            encryption: true,
            debug_level: 0,
            debug_result: false,
            result_queue: DEFAULT_RESULT_QUEUE.to_string(),
            pidfile: None,
        }
    }
}

impl Options {
    /// Read a configuration file, applying each `key=value` line.
    pub fn load_file(&mut self, path: &Path) -> Result<(), OptionsError> {
        self.load_file_at(path, 0)
    }

    fn load_file_at(&mut self, path: &Path, depth: u32) -> Result<(), OptionsError> {
        if depth > MAX_CONFIG_DEPTH {
            return Err(OptionsError::TooDeep);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        for line in raw.lines() {
            let line = match line.find('#') {
                Some(pos) => &line[..pos],
                None => line,
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = match line.split_once('=') {
                Some((k, v)) => (k.trim(), Some(v.trim())),
                None => (line, None),
            };
            self.apply(key, value, depth)?;
        }
        Ok(())
    }

    fn apply(&mut self, key: &str, value: Option<&str>, depth: u32) -> Result<(), OptionsError> {
        let key = key.trim_start_matches('-').to_ascii_lowercase();
        match key.as_str() {
            "server" => {
                if let Some(value) = value {
                    self.add_servers(value);
                }
            }
            "hosts" | "host" => {
                self.queues_set = true;
                self.hosts = parse_yes_or_no(value, true);
            }
            "services" | "service" => {
                self.queues_set = true;
                self.services = parse_yes_or_no(value, true);
            }
            "events" | "event" | "eventhandler" | "eventhandlers" => {
                self.queues_set = true;
                self.events = parse_yes_or_no(value, true);
            }
            "hostgroups" | "hostgroup" => {
                if let Some(value) = value {
                    self.queues_set = true;
                    add_names(&mut self.hostgroups, value);
                }
            }
            "servicegroups" | "servicegroup" => {
                if let Some(value) = value {
                    self.queues_set = true;
                    add_names(&mut self.servicegroups, value);
                }
            }
            "min-worker" | "min_worker" => self.min_worker = parse_at_least_one(&key, value)?,
            "max-worker" | "max_worker" => self.max_worker = parse_at_least_one(&key, value)?,
            "job_timeout" | "timeout" => self.job_timeout = parse_at_least_one(&key, value)? as u64,
            "max-age" | "max_age" => self.max_age = parse_at_least_one(&key, value)? as u64,
            "max-jobs" | "max_jobs" => self.max_jobs = parse_at_least_one(&key, value)? as u64,
            "key" | "password" => self.crypt_key = value.map(str::to_string),
            "keyfile" | "passwordfile" => self.keyfile = value.map(PathBuf::from),
            "encryption" => self.encryption = parse_yes_or_no(value, true),
            "debug" => {
                let raw = value.unwrap_or("0");
                let level: i64 = raw
                    .parse()
                    .map_err(|_| OptionsError::Invalid(format!("invalid debug level: {raw:?}")))?;
                self.debug_level = level.clamp(0, 5) as u8;
            }
            "debug-result" | "debug_result" => self.debug_result = parse_yes_or_no(value, true),
            "result_queue" => {
                if let Some(value) = value {
                    self.result_queue = value.to_string();
                }
            }
            "pidfile" => self.pidfile = value.map(PathBuf::from),
            "config" | "configfile" => {
                let Some(value) = value else {
                    return Err(OptionsError::Invalid("config= needs a file name".to_string()));
                };
                self.load_file_at(Path::new(value), depth + 1)?;
            }
            other => {
                return Err(OptionsError::Invalid(format!("unknown option: {other}")));
            }
        }
        Ok(())
    }

    /// Append comma-separated `host[:port]` entries to the server list.
    pub fn add_servers(&mut self, value: &str) {
        for server in value.split(',') {
            let server = server.trim();
            if server.is_empty() {
                continue;
            }
            if server.contains(':') {
                self.servers.push(server.to_string());
            } else {
                self.servers.push(format!("{server}:{DEFAULT_SERVER_PORT}"));
            }
        }
    }

    /// Replace the key with the contents of the keyfile, if one is set.
    ///
    /// Only the first 32 bytes are used, matching the key derivation.
    pub fn load_keyfile(&mut self) -> Result<(), OptionsError> {
        let Some(path) = &self.keyfile else {
            return Ok(());
        };
        let raw = std::fs::read(path).map_err(|source| OptionsError::Io {
            path: path.clone(),
            source,
        })?;
        let head = &raw[..raw.len().min(crate::envelope::KEY_LEN)];
        let key = String::from_utf8_lossy(head).trim_end().to_string();
        self.crypt_key = Some(key);
        Ok(())
    }

    /// Apply defaulting rules after all sources have been merged.
    pub fn normalize(&mut self) {
        if !self.queues_set {
            self.hosts = true;
            self.services = true;
            self.events = true;
        }
        if self.min_worker > self.max_worker {
            self.min_worker = self.max_worker;
        }
    }

    /// Reject configurations the worker cannot run with.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.servers.is_empty() {
            return Err(OptionsError::Invalid("at least one server is required".to_string()));
        }
        if !self.hosts
            && !self.services
            && !self.events
            && self.hostgroups.is_empty()
            && self.servicegroups.is_empty()
        {
            return Err(OptionsError::Invalid("no queues enabled, nothing to do".to_string()));
        }
        if self.encryption && self.crypt_key.as_deref().is_none_or(str::is_empty) {
            return Err(OptionsError::Invalid(
                "encryption is enabled but no key is set (key= or keyfile=)".to_string(),
            ));
        }
        if self.max_age == 0 || self.job_timeout == 0 {
            return Err(OptionsError::Invalid("max_age and job_timeout must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The key the payload codec should use, honouring the encryption switch.
    pub fn effective_key(&self) -> Option<&str> {
        if self.encryption { self.crypt_key.as_deref() } else { None }
    }
}

fn add_names(list: &mut Vec<String>, value: &str) {
    for name in value.split(',') {
        let name = name.trim();
        if !name.is_empty() {
            list.push(name.to_string());
        }
    }
}

fn parse_at_least_one(key: &str, value: Option<&str>) -> Result<usize, OptionsError> {
    let raw = value.ok_or_else(|| OptionsError::Invalid(format!("{key} needs a value")))?;
    let parsed: i64 = raw
        .parse()
        .map_err(|_| OptionsError::Invalid(format!("invalid {key}: {raw:?}")))?;
    Ok(parsed.max(1) as usize)
}

/// Parse the usual yes/no spellings, falling back to `default`.
///
/// A bare flag (no value) counts as yes.
pub fn parse_yes_or_no(value: Option<&str>, default: bool) -> bool {
    let Some(value) = value else {
        return default;
    };
    match value.to_ascii_lowercase().as_str() {
        "yes" | "on" | "true" | "1" => true,
        "no" | "off" | "false" | "0" => false,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("checkmill-test-{name}-{}", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn yes_no_spellings() {
        assert!(parse_yes_or_no(None, true));
        assert!(!parse_yes_or_no(None, false));
        for yes in ["yes", "on", "TRUE", "1"] {
            assert!(parse_yes_or_no(Some(yes), false));
        }
        for no in ["no", "off", "False", "0"] {
            assert!(!parse_yes_or_no(Some(no), true));
        }
        assert!(parse_yes_or_no(Some("maybe"), true));
    }

    #[test]
    fn servers_get_a_default_port() {
        let mut opts = Options::default();
        opts.add_servers("localhost, broker.example.com:4731,,");
        assert_eq!(opts.servers, vec!["localhost:4730", "broker.example.com:4731"]);
    }

    #[test]
    fn config_file_round_trip() {
        let path = write_config(
            "basic",
            "# worker config\nserver=localhost:4730\nhostgroups=web,db\nmin-worker=2\nmax-worker=8\nencryption=no\ndebug=3\n",
        );
        let mut opts = Options::default();
        opts.load_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(opts.servers, vec!["localhost:4730"]);
        assert_eq!(opts.hostgroups, vec!["web", "db"]);
        assert_eq!(opts.min_worker, 2);
        assert_eq!(opts.max_worker, 8);
        assert!(!opts.encryption);
        assert_eq!(opts.debug_level, 3);
        assert!(opts.queues_set);
    }

    #[test]
    fn unknown_option_is_rejected() {
        let path = write_config("unknown", "no_such_option=1\n");
        let mut opts = Options::default();
        let err = opts.load_file(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, OptionsError::Invalid(_)));
    }

    #[test]
    fn default_queues_when_none_selected() {
        let mut opts = Options::default();
        opts.normalize();
        assert!(opts.hosts && opts.services && opts.events);
    }

    #[test]
    fn explicit_selection_disables_the_rest() {
        let mut opts = Options {
            queues_set: true,
            services: true,
            ..Options::default()
        };
        opts.normalize();
        assert!(!opts.hosts && opts.services && !opts.events);
    }

    #[test]
    fn min_is_clamped_to_max() {
        let mut opts = Options {
            min_worker: 10,
            max_worker: 4,
            ..Options::default()
        };
        opts.normalize();
        assert_eq!(opts.min_worker, 4);
    }

    #[test]
    fn validation_needs_a_server_and_a_queue() {
        let mut opts = Options {
            encryption: false,
            ..Options::default()
        };
        opts.queues_set = true;
        assert!(opts.validate().is_err());

        opts.add_servers("localhost");
        assert!(opts.validate().is_err());

        opts.hosts = true;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn encryption_requires_a_key() {
        let mut opts = Options::default();
        opts.add_servers("localhost");
        opts.normalize();
        assert!(opts.validate().is_err());

        opts.crypt_key = Some("secret".to_string());
        assert!(opts.validate().is_ok());
        assert_eq!(opts.effective_key(), Some("secret"));

        opts.encryption = false;
        assert_eq!(opts.effective_key(), None);
    }

    #[test]
    fn keyfile_takes_the_first_32_bytes() {
        let path = write_config("keyfile", &format!("{}\n", "k".repeat(48)));
        let mut opts = Options {
            keyfile: Some(path.clone()),
            ..Options::default()
        };
        opts.load_keyfile().unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(opts.crypt_key.as_deref(), Some("k".repeat(32).as_str()));
    }
}
