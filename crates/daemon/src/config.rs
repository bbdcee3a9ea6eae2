//! Daemon configuration management

use crate::signer::{SignerOptions, Timeouts};
use crate::usb::CoreOptions;
use anyhow::{Context, Result, anyhow};
use common::BusConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSettings,
    #[serde(default)]
    pub bus: BusSettings,
    #[serde(default)]
    pub usb: UsbSettings,
    #[serde(default)]
    pub signer: SignerSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonSettings {
    #[serde(default = "DaemonSettings::default_log_level")]
    pub log_level: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl DaemonSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Capacity of every subscriber channel
    #[serde(default = "BusSettings::default_channel_capacity")]
    pub channel_capacity: usize,
    /// Limits for the adapters' per-report USB fetches
    #[serde(default = "BusSettings::default_soft_limit")]
    pub fetch_soft_limit_secs: u64,
    #[serde(default = "BusSettings::default_hard_limit")]
    pub fetch_hard_limit_secs: u64,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            channel_capacity: Self::default_channel_capacity(),
            fetch_soft_limit_secs: Self::default_soft_limit(),
            fetch_hard_limit_secs: Self::default_hard_limit(),
        }
    }
}

impl BusSettings {
    fn default_channel_capacity() -> usize {
        common::bus::DEFAULT_CHANNEL_CAPACITY
    }

    fn default_soft_limit() -> u64 {
        30
    }

    fn default_hard_limit() -> u64 {
        60
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsbSettings {
    /// VID:PID patterns of devices to expose
    #[serde(default = "UsbSettings::default_filters")]
    pub filters: Vec<String>,
    #[serde(default)]
    pub allow_stealing: bool,
    #[serde(default = "UsbSettings::default_reset_on_acquire")]
    pub reset_on_acquire: bool,
    #[serde(default = "UsbSettings::default_listen_interval")]
    pub listen_interval_ms: u64,
    #[serde(default = "UsbSettings::default_listen_iterations")]
    pub listen_iterations: u32,
    /// How long one report read may block; below `bus.fetch_soft_limit_secs`
    #[serde(default = "UsbSettings::default_read_timeout")]
    pub read_timeout_secs: u64,
}

impl Default for UsbSettings {
    fn default() -> Self {
        Self {
            filters: Self::default_filters(),
            allow_stealing: false,
            reset_on_acquire: Self::default_reset_on_acquire(),
            listen_interval_ms: Self::default_listen_interval(),
            listen_iterations: Self::default_listen_iterations(),
            read_timeout_secs: Self::default_read_timeout(),
        }
    }
}

impl UsbSettings {
    fn default_filters() -> Vec<String> {
        vec![
            "0x534c:0x0001".to_string(), // Trezor One
            "0x1209:0x53c1".to_string(), // Trezor T
            "0x1209:0x53c0".to_string(), // Trezor T bootloader
            "0x2c97:*".to_string(),      // Ledger
        ]
    }

    fn default_reset_on_acquire() -> bool {
        true
    }

    fn default_listen_interval() -> u64 {
        500
    }

    fn default_listen_iterations() -> u32 {
        600
    }

    fn default_read_timeout() -> u64 {
        10
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn core_options(&self) -> CoreOptions {
        CoreOptions {
            allow_stealing: self.allow_stealing,
            reset_on_acquire: self.reset_on_acquire,
            listen_interval: Duration::from_millis(self.listen_interval_ms),
            listen_iterations: self.listen_iterations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignerSettings {
    /// How long a PIN, passphrase or confirmation prompt may stay open
    #[serde(default = "SignerSettings::default_interactive_timeout")]
    pub interactive_timeout_secs: u64,
    #[serde(default = "SignerSettings::default_poll_interval")]
    pub ledger_poll_interval_ms: u64,
    #[serde(default = "SignerSettings::default_require_passphrase")]
    pub require_passphrase: bool,
}

impl Default for SignerSettings {
    fn default() -> Self {
        Self {
            interactive_timeout_secs: Self::default_interactive_timeout(),
            ledger_poll_interval_ms: Self::default_poll_interval(),
            require_passphrase: Self::default_require_passphrase(),
        }
    }
}

impl SignerSettings {
    fn default_interactive_timeout() -> u64 {
        300 // 5 minutes
    }

    fn default_poll_interval() -> u64 {
        1000
    }

    fn default_require_passphrase() -> bool {
        true
    }
}

impl DaemonConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![Self::default_path(), PathBuf::from("/etc/hwbus/daemon.toml")];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: DaemonConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("hwbus").join("daemon.toml")
        } else {
            PathBuf::from(".config/hwbus/daemon.toml")
        }
    }

    /// Expand `~` in a user-supplied path
    pub fn expand_path(path: &str) -> PathBuf {
        PathBuf::from(shellexpand::tilde(path).as_ref())
    }

    pub fn bus_config(&self) -> BusConfig {
        BusConfig {
            channel_capacity: self.bus.channel_capacity,
        }
    }

    pub fn signer_options(&self) -> SignerOptions {
        SignerOptions {
            timeouts: Timeouts {
                soft: Duration::from_secs(self.bus.fetch_soft_limit_secs),
                hard: Duration::from_secs(self.bus.fetch_hard_limit_secs),
                interactive: Duration::from_secs(self.signer.interactive_timeout_secs),
            },
            ledger_poll_interval: Duration::from_millis(self.signer.ledger_poll_interval_ms),
            require_passphrase: self.signer.require_passphrase,
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.daemon.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.daemon.log_level,
                valid_levels.join(", ")
            ));
        }

        for filter in &self.usb.filters {
            Self::validate_filter(filter)?;
        }

        if self.bus.channel_capacity == 0 {
            return Err(anyhow!("bus.channel_capacity must be greater than 0"));
        }
        if self.bus.fetch_soft_limit_secs == 0 {
            return Err(anyhow!("bus.fetch_soft_limit_secs must be greater than 0"));
        }
        if self.bus.fetch_soft_limit_secs > self.bus.fetch_hard_limit_secs {
            return Err(anyhow!(
                "bus.fetch_soft_limit_secs ({}) exceeds bus.fetch_hard_limit_secs ({})",
                self.bus.fetch_soft_limit_secs,
                self.bus.fetch_hard_limit_secs
            ));
        }

        // A read still blocking after its fetch gave up would swallow the
        // device's next report
        if self.usb.read_timeout_secs >= self.bus.fetch_soft_limit_secs {
            return Err(anyhow!(
                "usb.read_timeout_secs ({}) must be below bus.fetch_soft_limit_secs ({})",
                self.usb.read_timeout_secs,
                self.bus.fetch_soft_limit_secs
            ));
        }

        let intervals = [
            ("usb.listen_interval_ms", self.usb.listen_interval_ms),
            ("usb.listen_iterations", u64::from(self.usb.listen_iterations)),
            ("usb.read_timeout_secs", self.usb.read_timeout_secs),
            (
                "signer.interactive_timeout_secs",
                self.signer.interactive_timeout_secs,
            ),
            (
                "signer.ledger_poll_interval_ms",
                self.signer.ledger_poll_interval_ms,
            ),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }

    /// Validate a USB device filter pattern (VID:PID)
    pub fn validate_filter(filter: &str) -> Result<()> {
        let parts: Vec<&str> = filter.split(':').collect();
        if parts.len() != 2 {
            return Err(anyhow!(
                "Invalid filter format '{}', expected VID:PID (e.g., '0x534c:0x0001' or '0x2c97:*')",
                filter
            ));
        }

        let (vid, pid) = (parts[0], parts[1]);
        if vid != "*" {
            Self::validate_hex_id(vid, "VID")?;
        }
        if pid != "*" {
            Self::validate_hex_id(pid, "PID")?;
        }

        Ok(())
    }

    /// Validate a hex ID (VID or PID)
    fn validate_hex_id(id: &str, name: &str) -> Result<()> {
        let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
            return Err(anyhow!(
                "Invalid {} '{}', must start with '0x' (e.g., '0x534c')",
                name,
                id
            ));
        };

        if hex_part.is_empty() || hex_part.len() > 4 {
            return Err(anyhow!(
                "Invalid {} '{}', hex part must be 1-4 digits",
                name,
                id
            ));
        }

        u16::from_str_radix(hex_part, 16)
            .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))?;

        Ok(())
    }
}
