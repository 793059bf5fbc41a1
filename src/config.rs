//! Launch-time configuration, read once from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

/// Default per-thread ring capacity, in records.
const DEFAULT_RING_CAPACITY: usize = 524288;
/// Default mutex-event threshold, nanoseconds.
const DEFAULT_MUTEX_THRESH_NS: u64 = 1000;

pub(crate) struct Config {
    /// Monitor pacing in nanoseconds; 0 means free-run.
    pub(crate) monitor_period_ns: u64,
    /// Mutex triples are emitted when wait or hold reaches this, ns.
    pub(crate) mutex_thresh_ns: u64,
    /// Per-thread ring capacity, power of two.
    pub(crate) ring_capacity: usize,
    pub(crate) monitor_cpu: Option<usize>,
    pub(crate) logger_cpu: Option<usize>,
    pub(crate) output: PathBuf,
    pub(crate) maps_output: PathBuf,
}

impl Config {
    pub(crate) fn from_env() -> Self {
        let mut ring_capacity = parse("LDB_RING_CAPACITY").unwrap_or(DEFAULT_RING_CAPACITY);
        if !ring_capacity.is_power_of_two() {
            let rounded = ring_capacity.max(2).next_power_of_two();
            log::warn!(
                target: "ldb::config",
                "LDB_RING_CAPACITY {} is not a power of two; using {}",
                ring_capacity,
                rounded
            );
            ring_capacity = rounded;
        }
        Self {
            monitor_period_ns: parse("LDB_MONITOR_PERIOD_NS").unwrap_or(0),
            mutex_thresh_ns: parse("LDB_MUTEX_THRESH_NS").unwrap_or(DEFAULT_MUTEX_THRESH_NS),
            ring_capacity,
            monitor_cpu: parse("LDB_MONITOR_CPU"),
            logger_cpu: parse("LDB_LOGGER_CPU"),
            output: std::env::var_os("LDB_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("ldb.data")),
            maps_output: std::env::var_os("LDB_MAPS_OUTPUT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("maps.data")),
        }
    }
}

/// Parses an environment variable, logging and falling back on nonsense.
fn parse<T: FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!(
                target: "ldb::config",
                "ignoring unparseable {}={:?}",
                name,
                value
            );
            None
        }
    }
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// The process-wide configuration, read from the environment on first use.
pub(crate) fn get() -> &'static Config {
    CONFIG.get_or_init(Config::from_env)
}
