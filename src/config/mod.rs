//! Configuration module
//!
//! Settings are layered: built-in defaults, then an optional YAML settings
//! file, then environment overrides, then CLI flags (applied in `main`).

use crate::tunnel::ListenPorts;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Environment variable holding a comma-separated probe target list
pub const ENV_TEST_URLS: &str = "TEST_URLS";

/// Environment variable holding the re-evaluation interval in seconds
pub const ENV_TEST_INTERVAL: &str = "TEST_INTERVAL";

/// Environment variable overriding the tunnel binary path
pub const ENV_TUNNEL_BINARY: &str = "TUNNEL_BINARY";

/// Environment variable overriding the candidate directory
pub const ENV_CONFIG_DIR: &str = "CONFIG_DIR";

/// Default candidate directory
pub const DEFAULT_CONFIG_DIR: &str = "/etc/hysteria";

/// Default tunnel binary
pub const DEFAULT_BINARY: &str = "hysteria";

/// Default probe targets
pub const DEFAULT_TEST_URLS: &[&str] = &[
    "https://www.google.com/generate_204",
    "https://www.gstatic.com/generate_204",
    "https://cp.cloudflare.com/generate_204",
];

/// Default re-evaluation interval in seconds
pub const DEFAULT_INTERVAL_SECS: u64 = 180;

/// Main settings structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Settings {
    /// Directory holding one YAML file per candidate
    pub config_dir: PathBuf,

    /// Tunnel binary executable
    pub binary: PathBuf,

    /// Directory for rendered per-run tunnel configs
    pub runtime_dir: PathBuf,

    /// Client-facing listen addresses
    pub public: PublicConfig,

    /// Port range reserved for probing
    pub auxiliary: AuxiliaryConfig,

    /// Probe behaviour
    pub probe: ProbeConfig,

    /// Supervisor timing
    pub supervisor: SupervisorConfig,

    /// Periodic controller policy
    pub controller: ControllerConfig,

    /// Log level
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            binary: PathBuf::from(DEFAULT_BINARY),
            runtime_dir: std::env::temp_dir().join("tunnel-pilot"),
            public: PublicConfig::default(),
            auxiliary: AuxiliaryConfig::default(),
            probe: ProbeConfig::default(),
            supervisor: SupervisorConfig::default(),
            controller: ControllerConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        Self::from_str(&content)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(content)?;
        Ok(settings)
    }

    /// Apply environment overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides using `lookup` to read variables
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_TEST_URLS) {
            let targets = parse_target_list(&raw);
            if !targets.is_empty() {
                self.probe.targets = targets;
            }
        }

        if let Some(raw) = lookup(ENV_TEST_INTERVAL) {
            let secs: u64 = raw.trim().parse().map_err(|_| {
                Error::config(format!("{} must be an integer, got '{}'", ENV_TEST_INTERVAL, raw))
            })?;
            self.controller.interval_secs = secs;
        }

        if let Some(binary) = lookup(ENV_TUNNEL_BINARY) {
            if !binary.trim().is_empty() {
                self.binary = PathBuf::from(binary.trim());
            }
        }

        if let Some(dir) = lookup(ENV_CONFIG_DIR) {
            if !dir.trim().is_empty() {
                self.config_dir = PathBuf::from(dir.trim());
            }
        }

        Ok(())
    }

    /// Validate settings
    pub fn validate(&self) -> Result<()> {
        if self.probe.targets.is_empty() {
            return Err(Error::config("at least one probe target is required"));
        }
        for target in &self.probe.targets {
            reqwest::Url::parse(target)
                .map_err(|e| Error::config(format!("invalid probe target '{}': {}", target, e)))?;
        }

        if self.probe.concurrency == 0 {
            return Err(Error::config("probe concurrency must be at least 1"));
        }

        if self.controller.interval_secs == 0 {
            return Err(Error::config("re-evaluation interval must be at least 1 second"));
        }

        if !(0.0..1.0).contains(&self.controller.min_improvement) {
            return Err(Error::config("min-improvement must be in [0, 1)"));
        }

        if self.controller.max_ratio < 1.0 {
            return Err(Error::config("max-ratio must be at least 1.0"));
        }

        if self.public.socks_port == self.public.http_port {
            return Err(Error::config("public SOCKS and HTTP ports must differ"));
        }

        let aux = &self.auxiliary;
        if aux.pair_count() == 0 {
            return Err(Error::config(format!(
                "auxiliary range {}-{} holds no port pair",
                aux.port_start, aux.port_end
            )));
        }
        for port in [self.public.socks_port, self.public.http_port] {
            if aux.contains(port) {
                return Err(Error::config(format!(
                    "public port {} overlaps the auxiliary range {}-{}",
                    port, aux.port_start, aux.port_end
                )));
            }
        }

        Ok(())
    }

    /// Public listen ports
    pub fn public_ports(&self) -> ListenPorts {
        ListenPorts::new(self.public.host, self.public.socks_port, self.public.http_port)
    }
}

/// Split a comma-separated target list, dropping blanks
pub fn parse_target_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Client-facing listen configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PublicConfig {
    pub host: IpAddr,
    pub socks_port: u16,
    pub http_port: u16,
}

impl Default for PublicConfig {
    fn default() -> Self {
        PublicConfig {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            socks_port: 1080,
            http_port: 8080,
        }
    }
}

/// Auxiliary port range used by probes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuxiliaryConfig {
    pub host: IpAddr,
    /// First port of the range (inclusive)
    pub port_start: u16,
    /// Last port of the range (inclusive)
    pub port_end: u16,
}

impl AuxiliaryConfig {
    /// Number of SOCKS/HTTP pairs the range can hold
    pub fn pair_count(&self) -> usize {
        if self.port_end < self.port_start {
            return 0;
        }
        (usize::from(self.port_end - self.port_start) + 1) / 2
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.port_start..=self.port_end).contains(&port)
    }
}

impl Default for AuxiliaryConfig {
    fn default() -> Self {
        AuxiliaryConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port_start: 21080,
            port_end: 21179,
        }
    }
}

/// Probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProbeConfig {
    /// URLs requested through the tunnel
    pub targets: Vec<String>,
    /// Status codes counted as success
    pub expected_status: Vec<u16>,
    /// Delay between spawning a probe tunnel and the first request
    pub warmup_ms: u64,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Upper bound for all requests of one probe
    pub probe_timeout_ms: u64,
    /// Grace period when terminating a probe tunnel
    pub terminate_grace_ms: u64,
    /// Maximum number of probes running at once
    pub concurrency: usize,
}

impl ProbeConfig {
    pub fn warmup(&self) -> Duration {
        Duration::from_millis(self.warmup_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        ProbeConfig {
            targets: DEFAULT_TEST_URLS.iter().map(|s| s.to_string()).collect(),
            expected_status: vec![200, 204],
            warmup_ms: 3000,
            request_timeout_ms: 5000,
            probe_timeout_ms: 30_000,
            terminate_grace_ms: 2000,
            concurrency: 4,
        }
    }
}

/// Supervisor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SupervisorConfig {
    /// The tunnel must survive this long to count as started
    pub startup_grace_ms: u64,
    /// Wait this long after SIGTERM before killing
    pub stop_grace_ms: u64,
}

impl SupervisorConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        SupervisorConfig {
            startup_grace_ms: 2000,
            stop_grace_ms: 5000,
        }
    }
}

/// Periodic controller policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ControllerConfig {
    /// Tick period for the cheap check
    pub interval_secs: u64,
    /// Crash detection period
    pub watchdog_ms: u64,
    /// Absolute latency increase over baseline that counts as degraded
    pub max_increase_ms: u64,
    /// Relative latency increase over baseline that counts as degraded
    pub max_ratio: f64,
    /// Fraction by which a new winner must beat the current candidate
    pub min_improvement: f64,
}

impl ControllerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms.max(1))
    }

    pub fn max_increase(&self) -> Duration {
        Duration::from_millis(self.max_increase_ms)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            interval_secs: DEFAULT_INTERVAL_SECS,
            watchdog_ms: 5000,
            max_increase_ms: 200,
            max_ratio: 4.0,
            min_improvement: 0.2,
        }
    }
}
