//! Device summaries and small management actions built from shell queries.
//!
//! Queries in a batch are independent: a failed or non-zero `getprop` leaves
//! that one field empty and the batch carries on.

use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::command::CommandChannel;
use crate::error::AdbError;
use crate::protocol::service::quote;
use crate::protocol::sync::{self, DirEntry, SyncClient};

/// Staging directory for pushed packages.
pub const REMOTE_TMP_DIR: &str = "/data/local/tmp";
/// How long `install` waits for the package manager.
pub const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(180);

// ── Result types ─────────────────────────────────────────────────

/// Short identification shown in device lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub model: String,
    pub manufacturer: String,
    pub android_version: String,
    pub sdk_version: String,
    pub address: String,
}

impl DeviceInfo {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.manufacturer, self.model).trim().to_string()
    }
}

/// Detailed hardware/software summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceFullInfo {
    /// Brand and model, e.g. "Google Pixel 7".
    pub model: String,
    pub android_version: String,
    pub sdk_version: String,
    pub serial: String,
    pub resolution: String,
    pub density: String,
    /// Board platform, falling back to `ro.hardware`.
    pub cpu_model: String,
    /// SoC vendor ("Qualcomm", "MediaTek", ...) or "SoC" when unknown.
    pub cpu_brand: String,
    pub storage_total: String,
    pub storage_used: String,
    /// 0.0 ..= 1.0
    pub storage_percent: f32,
    pub brightness: String,
    pub ac_powered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Resident set size in KiB.
    pub rss_kb: u64,
    pub name: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemorySummary {
    pub total_kb: u64,
    pub free_kb: u64,
    pub used_kb: u64,
}

/// Common Android key codes for `input keyevent`.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    Home = 3,
    Back = 4,
    DpadUp = 19,
    DpadDown = 20,
    DpadLeft = 21,
    DpadRight = 22,
    DpadCenter = 23,
    VolumeUp = 24,
    VolumeDown = 25,
    Power = 26,
    Space = 62,
    Enter = 66,
    Delete = 67,
    Menu = 82,
    MediaPlayPause = 85,
    MediaNext = 87,
    MediaPrevious = 88,
    VolumeMute = 164,
    Sleep = 223,
    Wakeup = 224,
}

impl KeyCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    /// Parse a lowercase name like `home` or `volume_up`.
    pub fn from_name(name: &str) -> Option<Self> {
        let key = match name.to_ascii_lowercase().as_str() {
            "home" => Self::Home,
            "back" => Self::Back,
            "up" => Self::DpadUp,
            "down" => Self::DpadDown,
            "left" => Self::DpadLeft,
            "right" => Self::DpadRight,
            "center" => Self::DpadCenter,
            "volume_up" => Self::VolumeUp,
            "volume_down" => Self::VolumeDown,
            "power" => Self::Power,
            "space" => Self::Space,
            "enter" => Self::Enter,
            "del" | "delete" => Self::Delete,
            "menu" => Self::Menu,
            "play_pause" => Self::MediaPlayPause,
            "next" => Self::MediaNext,
            "prev" | "previous" => Self::MediaPrevious,
            "mute" => Self::VolumeMute,
            "sleep" => Self::Sleep,
            "wakeup" => Self::Wakeup,
            _ => return None,
        };
        Some(key)
    }
}

// ── DeviceQuery ──────────────────────────────────────────────────

pub struct DeviceQuery {
    channel: CommandChannel,
    install_timeout: Duration,
}

impl DeviceQuery {
    pub fn new(channel: CommandChannel) -> Self {
        Self {
            channel,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
        }
    }

    pub fn with_install_timeout(mut self, timeout: Duration) -> Self {
        self.install_timeout = timeout;
        self
    }

    pub fn channel(&self) -> &CommandChannel {
        &self.channel
    }

    /// `getprop key`, or empty on any failure.
    pub async fn property(&self, key: &str) -> String {
        match self.channel.shell(&format!("getprop {}", quote(key))).await {
            Ok(r) if r.success() => r.output.trim().to_string(),
            Ok(r) => {
                debug!(key, exit = r.exit_code, "getprop failed");
                String::new()
            }
            Err(e) => {
                debug!(key, "getprop failed: {e}");
                String::new()
            }
        }
    }

    /// Trimmed combined output of `command`, or empty on failure.
    async fn query(&self, command: &str) -> String {
        match self.channel.shell(command).await {
            Ok(r) => r.all_output().trim().to_string(),
            Err(e) => {
                debug!(command, "query failed: {e}");
                String::new()
            }
        }
    }

    pub async fn info(&self) -> DeviceInfo {
        DeviceInfo {
            model: self.property("ro.product.model").await,
            manufacturer: self.property("ro.product.manufacturer").await,
            android_version: self.property("ro.build.version.release").await,
            sdk_version: self.property("ro.build.version.sdk").await,
            address: self.channel.session().target().to_string(),
        }
    }

    pub async fn full_info(&self) -> DeviceFullInfo {
        let brand = self.query("getprop ro.product.brand").await;
        let model = self.query("getprop ro.product.model").await;
        let serial = self.query("getprop ro.serialno").await;

        let mut vendor = self.query("getprop ro.soc.manufacturer").await;
        if vendor.eq_ignore_ascii_case("unknown") {
            vendor.clear();
        }
        if vendor.is_empty() {
            let cpuinfo = self.query("cat /proc/cpuinfo").await;
            if let Some(line) = cpuinfo.lines().find(|l| l.contains("Hardware")) {
                let value = line.split_once(':').map(|(_, v)| v).unwrap_or("");
                vendor = infer_soc_vendor(value.trim()).to_string();
            }
        }
        let platform = self.query("getprop ro.board.platform").await;
        let hardware = self.query("getprop ro.hardware").await;
        if vendor.is_empty() {
            vendor = infer_soc_vendor(&format!("{platform} {hardware}")).to_string();
        }

        let density = self
            .query("wm density")
            .await
            .replace("Physical density:", "")
            .trim()
            .to_string();
        let wm_size = self.query("wm size").await;
        let resolution = match wm_size.split_once(':') {
            Some((_, rest)) => rest.lines().next().unwrap_or("").trim().to_string(),
            None => wm_size,
        };
        let storage = parse_df(&self.query("df -h /data").await).unwrap_or_default();
        let brightness = self.query("settings get system screen_brightness").await;
        let battery = self.query("dumpsys battery").await;

        DeviceFullInfo {
            model: display_model(&brand, &model),
            android_version: self.query("getprop ro.build.version.release").await,
            sdk_version: self.query("getprop ro.build.version.sdk").await,
            serial,
            resolution,
            density,
            cpu_model: first_non_empty(&[&platform, &hardware]).unwrap_or("Unknown").to_string(),
            cpu_brand: if vendor.is_empty() {
                "SoC".to_string()
            } else {
                proper_case(&vendor)
            },
            storage_total: storage.total,
            storage_used: storage.used,
            storage_percent: storage.percent,
            brightness: if brightness.is_empty() { "0".into() } else { brightness },
            ac_powered: battery
                .lines()
                .any(|l| l.contains("AC powered") && l.contains("true")),
        }
    }

    /// Running app processes, largest resident set first.
    pub async fn processes(&self) -> Result<Vec<ProcessInfo>, AdbError> {
        let response = self.channel.shell("ps -A -o PID,RSS,NAME").await?;
        Ok(parse_processes(&response.output))
    }

    pub async fn memory(&self) -> Result<MemorySummary, AdbError> {
        let response = self.channel.shell("dumpsys meminfo").await?;
        Ok(parse_meminfo(&response.output))
    }

    pub async fn force_stop(&self, package: &str) -> Result<(), AdbError> {
        self.checked(&format!("am force-stop {}", quote(package))).await
    }

    pub async fn key_event(&self, key: KeyCode) -> Result<(), AdbError> {
        self.key_code(key.code() as u32).await
    }

    pub async fn key_code(&self, code: u32) -> Result<(), AdbError> {
        self.checked(&format!("input keyevent {code}")).await
    }

    /// Type text on the device. Spaces are sent as `%s`.
    pub async fn input_text(&self, text: &str) -> Result<(), AdbError> {
        if text.is_empty() {
            return Ok(());
        }
        self.checked(&format!("input text {}", quote(&text.replace(' ', "%s"))))
            .await
    }

    /// Push an APK to the staging directory and install it (`pm install -r`).
    ///
    /// Waiting is bounded by the install timeout. On expiry the staged file
    /// is still removed but `pm` itself is left running on the device.
    pub async fn install(&self, apk: &Path) -> Result<String, AdbError> {
        let file_name = apk
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| AdbError::Other(format!("not a file: {}", apk.display())))?;
        let remote = format!("{REMOTE_TMP_DIR}/{file_name}");
        sync::push_file(self.channel.session(), apk, &remote, Some(0o644)).await?;
        info!(remote, "installing package");

        let result = self
            .channel
            .shell_with_timeout(
                &format!("pm install -r {}", quote(&remote)),
                self.install_timeout,
            )
            .await;
        if let Err(e) = self.channel.shell(&format!("rm -f {}", quote(&remote))).await {
            debug!(remote, "cleanup failed: {e}");
        }
        package_manager_result(result?.all_output())
    }

    pub async fn uninstall(&self, package: &str) -> Result<String, AdbError> {
        let response = self
            .channel
            .shell(&format!("pm uninstall {}", quote(package)))
            .await?;
        package_manager_result(response.all_output())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>, AdbError> {
        let mut client = SyncClient::open(self.channel.session()).await?;
        let entries = client.list(path).await?;
        client.quit().await?;
        Ok(entries)
    }

    async fn checked(&self, command: &str) -> Result<(), AdbError> {
        let response = self.channel.shell(command).await?;
        if response.success() {
            Ok(())
        } else {
            Err(AdbError::DeviceFailure(format!(
                "`{command}` exited with {}: {}",
                response.exit_code,
                response.all_output().trim()
            )))
        }
    }
}

// ── Output parsing ───────────────────────────────────────────────

fn package_manager_result(output: String) -> Result<String, AdbError> {
    let trimmed = output.trim().to_string();
    if trimmed.lines().any(|l| l.trim() == "Success") {
        Ok(trimmed)
    } else {
        Err(AdbError::DeviceFailure(trimmed))
    }
}

fn first_non_empty<'a>(values: &[&'a str]) -> Option<&'a str> {
    values.iter().copied().find(|v| !v.is_empty())
}

/// `ps -A -o PID,RSS,NAME` rows whose name looks like an app package.
pub fn parse_processes(output: &str) -> Vec<ProcessInfo> {
    let mut processes: Vec<ProcessInfo> = output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            let name = parts[parts.len() - 1];
            if !name.contains('.') || name.starts_with('/') {
                return None;
            }
            Some(ProcessInfo {
                pid: parts[0].parse().ok()?,
                rss_kb: parts[1].parse().unwrap_or(0),
                name: name.to_string(),
            })
        })
        .collect();
    processes.sort_by(|a, b| b.rss_kb.cmp(&a.rss_kb));
    processes
}

static NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,.]*").expect("number pattern"));

/// First number on the first line mentioning `key`, separators removed.
fn mem_value(raw: &str, key: &str) -> u64 {
    let key = key.to_ascii_lowercase();
    raw.lines()
        .find(|l| l.to_ascii_lowercase().contains(&key))
        .and_then(|l| NUMBER.find(l))
        .map(|m| {
            m.as_str()
                .chars()
                .filter(char::is_ascii_digit)
                .collect::<String>()
        })
        .and_then(|digits| digits.parse().ok())
        .unwrap_or(0)
}

pub fn parse_meminfo(raw: &str) -> MemorySummary {
    let total_kb = mem_value(raw, "Total RAM");
    let free_kb = mem_value(raw, "Free RAM");
    MemorySummary {
        total_kb,
        free_kb,
        used_kb: total_kb.saturating_sub(free_kb),
    }
}

#[derive(Debug, Default, PartialEq)]
struct StorageUsage {
    total: String,
    used: String,
    percent: f32,
}

/// Last row of `df -h` as (size, used, use%).
fn parse_df(output: &str) -> Option<StorageUsage> {
    let lines: Vec<&str> = output.trim().lines().collect();
    if lines.len() < 2 {
        return None;
    }
    let parts: Vec<&str> = lines[lines.len() - 1].split_whitespace().collect();
    if parts.len() < 5 {
        return None;
    }
    let percent = parts[4].trim_end_matches('%').parse::<f32>().unwrap_or(0.0) / 100.0;
    Some(StorageUsage {
        total: parts[1].to_string(),
        used: parts[2].to_string(),
        percent,
    })
}

/// Guess the SoC vendor from a platform/hardware string.
pub fn infer_soc_vendor(clue: &str) -> &'static str {
    let c = clue.to_ascii_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| c.contains(n));
    if any(&["qualcomm", "qcom", "msm", "sdm", "sm", "apq"]) {
        "Qualcomm"
    } else if any(&["mediatek", "mtk", "mt", "dimensity", "helio"]) {
        "MediaTek"
    } else if any(&["samsung", "exynos", "s5e"]) {
        "Samsung"
    } else if any(&["hisilicon", "kirin", "hi3", "hi6"]) {
        "HiSilicon"
    } else if any(&["unisoc", "spreadtrum", "sc"]) {
        "Unisoc"
    } else if any(&["rockchip", "rk"]) {
        "Rockchip"
    } else if any(&["amlogic"]) {
        "Amlogic"
    } else {
        ""
    }
}

/// "gOOGLE  pixel" -> "Google Pixel"
pub fn proper_case(text: &str) -> String {
    text.split_whitespace()
        .map(|word| {
            let lower = word.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Brand-prefixed model name without repeating the brand.
pub fn display_model(brand: &str, model: &str) -> String {
    let (brand, model) = (brand.trim(), model.trim());
    if brand.is_empty() {
        return model.to_string();
    }
    let brand_proper = proper_case(brand);
    let prefixed = model.len() >= brand.len()
        && model.is_char_boundary(brand.len())
        && model[..brand.len()].eq_ignore_ascii_case(brand);
    if prefixed {
        let suffix = model[brand.len()..].trim();
        if suffix.is_empty() {
            brand_proper
        } else {
            format!("{brand_proper} {}", proper_case(suffix))
        }
    } else {
        format!("{brand_proper} {model}").trim().to_string()
    }
}
