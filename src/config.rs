use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration loaded from `SANDBOX_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding one build context per exercise.
    pub exercises_dir: PathBuf,
    pub control_port_base: u16,
    pub secondary_port_base: u16,
    pub tertiary_port_base: u16,
    /// Width of each of the three port ranges.
    pub port_range: u16,
    pub instance_ttl: Duration,
    pub reaper_interval: Duration,
    pub build_timeout: Duration,
    /// Grace period handed to `docker stop` before the runtime kills.
    pub stop_grace: Duration,
    pub memory_limit: String,
    pub cpus: String,
    pub pids_limit: u32,
    /// Docker network to attach sandboxes to; the daemon default when unset.
    pub network: Option<String>,
    pub state_file: PathBuf,
    pub catalog_file: PathBuf,
}

impl Config {
    /// Load configuration from the environment; unset or unparsable values
    /// fall back to the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            exercises_dir: env_string("SANDBOX_EXERCISES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.exercises_dir),
            control_port_base: env_parse("SANDBOX_CONTROL_PORT_BASE")
                .unwrap_or(defaults.control_port_base),
            secondary_port_base: env_parse("SANDBOX_SECONDARY_PORT_BASE")
                .unwrap_or(defaults.secondary_port_base),
            tertiary_port_base: env_parse("SANDBOX_TERTIARY_PORT_BASE")
                .unwrap_or(defaults.tertiary_port_base),
            port_range: env_parse("SANDBOX_PORT_RANGE")
                .filter(|width: &u16| *width > 0)
                .unwrap_or(defaults.port_range),
            instance_ttl: env_secs("SANDBOX_TTL_SECS").unwrap_or(defaults.instance_ttl),
            reaper_interval: env_secs("SANDBOX_REAPER_INTERVAL_SECS")
                .filter(|interval| interval.as_secs() > 0)
                .unwrap_or(defaults.reaper_interval),
            build_timeout: env_secs("SANDBOX_BUILD_TIMEOUT_SECS")
                .unwrap_or(defaults.build_timeout),
            stop_grace: env_secs("SANDBOX_STOP_GRACE_SECS").unwrap_or(defaults.stop_grace),
            memory_limit: env_string("SANDBOX_MEMORY").unwrap_or(defaults.memory_limit),
            cpus: env_string("SANDBOX_CPUS").unwrap_or(defaults.cpus),
            pids_limit: env_parse("SANDBOX_PIDS_LIMIT").unwrap_or(defaults.pids_limit),
            network: env_string("SANDBOX_NETWORK"),
            state_file: env_string("SANDBOX_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_file),
            catalog_file: env_string("SANDBOX_CATALOG")
                .map(PathBuf::from)
                .unwrap_or(defaults.catalog_file),
        }
    }

    /// Bases of the control, secondary and tertiary port ranges, in that order.
    pub fn port_bases(&self) -> [u16; 3] {
        [
            self.control_port_base,
            self.secondary_port_base,
            self.tertiary_port_base,
        ]
    }

    /// The three ranges must not overlap, and each must fit below 65536.
    pub fn port_ranges_are_disjoint(&self) -> bool {
        let width = u32::from(self.port_range);
        let mut ranges: Vec<(u32, u32)> = self
            .port_bases()
            .iter()
            .map(|base| (u32::from(*base), u32::from(*base) + width))
            .collect();
        ranges.sort();

        ranges.iter().all(|(_, end)| *end <= 65536)
            && ranges.windows(2).all(|pair| pair[0].1 <= pair[1].0)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            exercises_dir: PathBuf::from("/app/challenges"),
            control_port_base: 30000,
            secondary_port_base: 31000,
            tertiary_port_base: 32000,
            port_range: 1000,
            instance_ttl: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(60),
            build_timeout: Duration::from_secs(300),
            stop_grace: Duration::from_secs(10),
            memory_limit: "512m".to_string(),
            cpus: "1.0".to_string(),
            pids_limit: 256,
            network: None,
            state_file: PathBuf::from("sandbox-state.json"),
            catalog_file: PathBuf::from("catalog.json"),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_secs)
}
