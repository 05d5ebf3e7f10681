//! The on-device screen capture agent (scrcpy server, raw stream mode).

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::command::CommandChannel;
use crate::error::AdbError;
use crate::protocol::service::quote;
use crate::protocol::sync::{self, SyncClient};

pub const AGENT_REMOTE_PATH: &str = "/data/local/tmp/scrcpy-server.jar";
pub const AGENT_VERSION: &str = "2.4";
pub const AGENT_MAIN_CLASS: &str = "com.genymobile.scrcpy.Server";
/// Abstract socket the agent listens on; first client is video, second control.
pub const AGENT_SOCKET: &str = "scrcpy";
pub const AGENT_PROCESS_PATTERN: &str = "scrcpy-server";

/// Where the agent binary comes from.
#[derive(Debug, Clone)]
pub enum AgentSource {
    File(PathBuf),
    Bytes(Arc<Vec<u8>>),
}

impl AgentSource {
    pub async fn len(&self) -> Result<u64, AdbError> {
        match self {
            Self::File(path) => Ok(tokio::fs::metadata(path).await?.len()),
            Self::Bytes(bytes) => Ok(bytes.len() as u64),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub source: AgentSource,
    pub remote_path: String,
    pub version: String,
    pub video_codec: String,
    pub max_fps: u32,
    pub log_level: String,
}

impl AgentOptions {
    pub fn new(source: AgentSource) -> Self {
        Self {
            source,
            remote_path: AGENT_REMOTE_PATH.to_string(),
            version: AGENT_VERSION.to_string(),
            video_codec: "h264".to_string(),
            max_fps: 30,
            log_level: "info".to_string(),
        }
    }

    pub fn with_max_fps(mut self, fps: u32) -> Self {
        self.max_fps = fps.max(1);
        self
    }
}

/// Per-session launch parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchParams {
    /// 0 = native size.
    pub max_size: u32,
    pub bit_rate: u32,
}

/// The `app_process` command line that starts the agent.
///
/// Raw stream mode: no device/codec/frame metadata, the video socket
/// carries only the H.264 elementary stream.
pub fn launch_command(options: &AgentOptions, params: LaunchParams) -> String {
    let args = [
        format!("video_codec={}", options.video_codec),
        "audio=false".to_string(),
        format!("max_size={}", params.max_size),
        format!("video_bit_rate={}", params.bit_rate),
        format!("max_fps={}", options.max_fps),
        format!("log_level={}", options.log_level),
        "lock_video_orientation=-1".to_string(),
        "tunnel_forward=true".to_string(),
        "control=true".to_string(),
        "display_id=0".to_string(),
        "show_touches=false".to_string(),
        "stay_awake=true".to_string(),
        "codec_options=i-frame-interval=1".to_string(),
        "encoder_name=-".to_string(),
        "power_off_on_close=false".to_string(),
        "downsize_on_error=true".to_string(),
        "cleanup=true".to_string(),
        "send_device_meta=false".to_string(),
        "send_frame_meta=false".to_string(),
        "send_dummy_byte=false".to_string(),
        "raw_stream=true".to_string(),
    ];
    format!(
        "CLASSPATH={} app_process / {} {} {}",
        quote(&options.remote_path),
        AGENT_MAIN_CLASS,
        options.version,
        args.join(" ")
    )
}

/// Kill any agent left over from an earlier session. Best effort.
pub async fn kill_stale(channel: &CommandChannel) {
    if let Err(e) = channel
        .shell(&format!("pkill -f {AGENT_PROCESS_PATTERN}"))
        .await
    {
        debug!("pkill failed: {e}");
    }
}

/// Push the agent unless an identical-size copy is already on the device,
/// then make it executable. Returns whether a push happened.
pub async fn deploy(channel: &CommandChannel, options: &AgentOptions) -> Result<bool, AdbError> {
    let session = channel.session();
    let local_len = options.source.len().await?;

    let mut client = SyncClient::open(session).await?;
    let remote = client.stat(&options.remote_path).await?;
    client.quit().await?;

    let pushed = if remote.is_file() && remote.size as u64 == local_len {
        debug!(path = %options.remote_path, "agent already deployed");
        false
    } else {
        info!(path = %options.remote_path, bytes = local_len, "pushing agent");
        match &options.source {
            AgentSource::File(path) => {
                sync::push_file(session, path, &options.remote_path, Some(0o644)).await?;
            }
            AgentSource::Bytes(bytes) => {
                sync::push_bytes(session, bytes, &options.remote_path, 0o644).await?;
            }
        }
        true
    };

    let chmod = channel
        .shell(&format!("chmod 755 {}", quote(&options.remote_path)))
        .await?;
    if !chmod.success() {
        return Err(AdbError::DeviceFailure(format!(
            "chmod {} failed: {}",
            options.remote_path,
            chmod.all_output().trim()
        )));
    }
    Ok(pushed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_line() {
        let opts = AgentOptions::new(AgentSource::Bytes(Arc::new(vec![])));
        let cmd = launch_command(
            &opts,
            LaunchParams {
                max_size: 1600,
                bit_rate: 2_000_000,
            },
        );
        assert!(cmd.starts_with(
            "CLASSPATH=/data/local/tmp/scrcpy-server.jar app_process / com.genymobile.scrcpy.Server 2.4 "
        ));
        for arg in [
            "video_codec=h264",
            "audio=false",
            "max_size=1600",
            "video_bit_rate=2000000",
            "max_fps=30",
            "raw_stream=true",
            "control=true",
            "send_frame_meta=false",
        ] {
            assert!(cmd.split(' ').any(|a| a == arg), "missing {arg}");
        }
    }

    #[tokio::test]
    async fn source_length() {
        let bytes = AgentSource::Bytes(Arc::new(vec![0u8; 42]));
        assert_eq!(bytes.len().await.unwrap(), 42);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.jar");
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(AgentSource::File(path).len().await.unwrap(), 3);
        assert!(AgentSource::File(dir.path().join("missing")).len().await.is_err());
    }
}
