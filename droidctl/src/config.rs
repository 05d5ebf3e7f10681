//! Configuration for the `droidctl` command-line tool.

use std::path::{Path, PathBuf};
use std::time::Duration;

use droidctl_core::ConnectOptions;
use droidctl_core::device::DEFAULT_INSTALL_TIMEOUT;
use droidctl_core::mirror::{AgentOptions, AgentSource, MirrorOptions, QualityPreset};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DroidctlConfig {
    /// Transport settings.
    pub network: NetworkConfig,
    /// Client key and certificate location.
    pub identity: IdentityConfig,
    /// Device command settings.
    pub device: DeviceConfig,
    /// Screen mirroring settings.
    pub mirror: MirrorConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Deadline for TCP connect plus handshake, in seconds.
    pub connect_timeout_secs: u64,
    /// Deadline for stream opens and write acknowledgements, in seconds.
    /// 0 waits forever.
    pub socket_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding `adbkey` and the certificate. Empty = per-user
    /// config directory.
    pub dir: String,
    /// `user@host` comment sent with the public key. Empty = `$USER@droidctl`.
    pub key_comment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// How long to wait for `pm install`, in seconds.
    pub install_timeout_secs: u64,
}

/// Mirroring configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// "standard" (720p, 2 Mbit/s) or "high" (1080p, 4 Mbit/s).
    pub quality: QualityPreset,
    /// Encoder bit rate override in bits/s; 0 uses the preset.
    pub bit_rate: u32,
    pub max_fps: u32,
    /// Local path of the streaming agent jar.
    pub agent_path: String,
    /// Attempts at opening the video socket after launch.
    pub open_attempts: u32,
    pub open_retry_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            socket_timeout_secs: 10,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            install_timeout_secs: DEFAULT_INSTALL_TIMEOUT.as_secs(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            quality: QualityPreset::Standard,
            bit_rate: 0,
            max_fps: 30,
            agent_path: "scrcpy-server.jar".into(),
            open_attempts: 5,
            open_retry_ms: 300,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl DroidctlConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::debug!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn connect_options(&self) -> ConnectOptions {
        let socket_timeout = match self.network.socket_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        ConnectOptions::default()
            .with_connect_timeout(Duration::from_secs(self.network.connect_timeout_secs.max(1)))
            .with_socket_timeout(socket_timeout)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.device.install_timeout_secs.max(1))
    }

    /// Where the client identity lives.
    pub fn identity_dir(&self) -> PathBuf {
        if !self.identity.dir.is_empty() {
            return PathBuf::from(&self.identity.dir);
        }
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("droidctl")
    }

    pub fn mirror_options(&self, quality: Option<QualityPreset>) -> MirrorOptions {
        let agent = AgentOptions::new(AgentSource::File(PathBuf::from(&self.mirror.agent_path)))
            .with_max_fps(self.mirror.max_fps);
        let mut options = MirrorOptions::new(agent)
            .with_preset(quality.unwrap_or(self.mirror.quality))
            .with_open_retry(
                self.mirror.open_attempts,
                Duration::from_millis(self.mirror.open_retry_ms),
            );
        if self.mirror.bit_rate > 0 {
            options = options.with_bit_rate(self.mirror.bit_rate);
        }
        options
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&DroidctlConfig::default()).unwrap();
        assert!(text.contains("connect_timeout_secs"));
        assert!(text.contains("quality = \"standard\""));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: DroidctlConfig = toml::from_str("[mirror]\nquality = \"high\"\n").unwrap();
        assert_eq!(cfg.mirror.quality, QualityPreset::High);
        assert_eq!(cfg.mirror.open_attempts, 5);
        assert_eq!(cfg.logging.level, "info");

        let opts = cfg.mirror_options(None);
        assert_eq!(opts.bit_rate(), 4_000_000);
        assert_eq!(opts.open_attempts, 5);
    }

    #[test]
    fn zero_socket_timeout_waits_forever() {
        let mut cfg = DroidctlConfig::default();
        cfg.network.socket_timeout_secs = 0;
        assert_eq!(cfg.connect_options().socket_timeout, None);
    }

    #[test]
    fn explicit_quality_overrides_file() {
        let mut cfg = DroidctlConfig::default();
        cfg.mirror.bit_rate = 1_500_000;
        let opts = cfg.mirror_options(Some(QualityPreset::High));
        assert_eq!(opts.preset, QualityPreset::High);
        assert_eq!(opts.bit_rate(), 1_500_000);
    }

    #[test]
    fn install_timeout_from_file() {
        assert_eq!(
            DroidctlConfig::default().install_timeout(),
            Duration::from_secs(180)
        );
        let cfg: DroidctlConfig = toml::from_str("[device]\ninstall_timeout_secs = 600\n").unwrap();
        assert_eq!(cfg.install_timeout(), Duration::from_secs(600));
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = DroidctlConfig::load(&dir.path().join("absent.toml"));
        assert_eq!(cfg.network.connect_timeout_secs, 10);
    }
}
