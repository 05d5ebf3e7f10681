//! Device transports: addressing, handshake and stream multiplexing.

pub mod handshake;
pub mod session;
pub mod stream;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::AdbError;
use crate::message::MAX_PAYLOAD;

pub use handshake::DeviceBanner;
pub use session::AdbSession;
pub use stream::{AdbStream, AdbStreamReader, AdbStreamWriter};

/// Default port of `adbd` in TCP mode.
pub const DEFAULT_ADB_PORT: u16 = 5555;

// ── ConnectionInfo ───────────────────────────────────────────────

/// `host:port` of a device.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionInfo {
    host: String,
    port: u16,
}

impl ConnectionInfo {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for ConnectionInfo {
    type Err = AdbError;

    /// Accepts `host`, `host:port` and `[v6]:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(AdbError::Other("empty device address".into()));
        }
        let bad_port = |p: &str| AdbError::Other(format!("invalid port in {s:?}: {p:?}"));

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AdbError::Other(format!("unterminated '[' in {s:?}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().map_err(|_| bad_port(p))?,
                None => DEFAULT_ADB_PORT,
            };
            return Ok(Self::new(host, port));
        }

        match s.rsplit_once(':') {
            Some((host, p)) if !host.contains(':') => {
                Ok(Self::new(host, p.parse().map_err(|_| bad_port(p))?))
            }
            _ => Ok(Self::new(s, DEFAULT_ADB_PORT)),
        }
    }
}

// ── ConnectOptions ───────────────────────────────────────────────

/// Tunables for [`AdbSession::connect`].
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Deadline for TCP connect plus the whole handshake.
    pub connect_timeout: Duration,
    /// Deadline for stream opens, write acknowledgements and liveness
    /// probes. `None` waits forever.
    pub socket_timeout: Option<Duration>,
    /// Largest payload we advertise.
    pub max_payload: usize,
    /// Features advertised in our banner.
    pub features: Vec<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            socket_timeout: Some(Duration::from_secs(10)),
            max_payload: MAX_PAYLOAD,
            features: [
                "shell_v2",
                "cmd",
                "stat_v2",
                "ls_v2",
                "fixed_push_mkdir",
                "apex",
                "abb",
                "fixed_push_symlink_timestamp",
                "abb_exec",
                "remount_shell",
                "track_app",
                "sendrecv_v2",
                "sendrecv_v2_brotli",
                "sendrecv_v2_lz4",
                "sendrecv_v2_zstd",
                "sendrecv_v2_dry_run_send",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ConnectOptions {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_socket_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.socket_timeout = timeout;
        self
    }

    /// The `CNXN` banner sent to the device.
    pub fn banner(&self) -> String {
        format!("host::features={}", self.features.join(","))
    }
}

// ── Boxed I/O ────────────────────────────────────────────────────

/// Byte stream a session runs over: plain TCP or TLS on top of it.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

pub type BoxedIo = Box<dyn AsyncIo>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addresses() {
        let a: ConnectionInfo = "192.168.1.5:37001".parse().unwrap();
        assert_eq!(a.host(), "192.168.1.5");
        assert_eq!(a.port(), 37001);

        let b: ConnectionInfo = "pixel.lan".parse().unwrap();
        assert_eq!(b.port(), DEFAULT_ADB_PORT);

        let c: ConnectionInfo = "[fe80::1]:5556".parse().unwrap();
        assert_eq!(c.host(), "fe80::1");
        assert_eq!(c.to_string(), "[fe80::1]:5556");

        assert!("host:notaport".parse::<ConnectionInfo>().is_err());
        assert!("".parse::<ConnectionInfo>().is_err());
    }

    #[test]
    fn banner_lists_features() {
        let opts = ConnectOptions {
            features: vec!["shell_v2".into(), "cmd".into()],
            ..Default::default()
        };
        assert_eq!(opts.banner(), "host::features=shell_v2,cmd");
    }
}
