//! One-shot and interactive shell commands over a session.
//!
//! Every call opens a fresh stream, so concurrent commands on one session
//! never share output. Devices advertising `shell_v2` report stderr and the
//! exit status natively; older devices get the legacy `shell:` service with
//! an exit marker appended to the command line.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::AdbError;
use crate::network::AdbSession;
use crate::protocol::service::{Service, ShellMode, ShellProtocol, command_line};
use crate::protocol::shell::{ShellResponse, ShellStream};

/// Feature flag for the packetized shell protocol.
pub const FEATURE_SHELL_V2: &str = "shell_v2";

const EXIT_MARKER: &str = "__DROIDCTL_EXIT__";

/// Run `command` to completion on a new stream.
pub async fn run_shell(session: &AdbSession, command: &str) -> Result<ShellResponse, AdbError> {
    debug!(target = %session.target(), command, "shell");
    if session.supports_feature(FEATURE_SHELL_V2) {
        let stream = session.open_service(&Service::shell_v2(command)).await?;
        return ShellStream::new(stream, ShellProtocol::V2).collect().await;
    }
    let wrapped = format!("{command}; echo \"{EXIT_MARKER}$?\"");
    let stream = session.open_service(&Service::shell_legacy(wrapped)).await?;
    let raw = ShellStream::new(stream, ShellProtocol::V1).collect().await?;
    Ok(split_exit_marker(raw.output))
}

/// Strip the trailing exit marker from legacy shell output.
///
/// Output without a marker (the stream was cut short) keeps exit code 0,
/// the same as the legacy service itself would report.
fn split_exit_marker(output: String) -> ShellResponse {
    let Some(idx) = output.rfind(EXIT_MARKER) else {
        return ShellResponse {
            output,
            ..Default::default()
        };
    };
    let code = output[idx + EXIT_MARKER.len()..]
        .trim()
        .parse::<i32>()
        .unwrap_or(0);
    let mut body = output;
    body.truncate(idx);
    ShellResponse {
        output: body,
        error_output: String::new(),
        exit_code: code,
    }
}

// ── CommandChannel ───────────────────────────────────────────────

/// Shell and raw-exec commands against one shared session.
#[derive(Debug, Clone)]
pub struct CommandChannel {
    session: Arc<AdbSession>,
}

impl CommandChannel {
    pub fn new(session: Arc<AdbSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<AdbSession> {
        &self.session
    }

    /// Run a command and collect all output and its exit status.
    ///
    /// Fails if the session is dead. There is no built-in time limit; use
    /// [`shell_with_timeout`](Self::shell_with_timeout) for long commands.
    pub async fn shell(&self, command: &str) -> Result<ShellResponse, AdbError> {
        run_shell(&self.session, command).await
    }

    /// Like [`shell`](Self::shell) but each argument is quoted for the
    /// remote `sh`.
    pub async fn shell_args<I, S>(&self, args: I) -> Result<ShellResponse, AdbError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.shell(&command_line(args)).await
    }

    /// Run a command, giving up locally after `timeout`.
    ///
    /// On expiry this returns [`AdbError::Timeout`] but the remote process
    /// is NOT signalled: it keeps running and its output is drained by a
    /// detached task until the device closes the stream.
    pub async fn shell_with_timeout(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<ShellResponse, AdbError> {
        let session = Arc::clone(&self.session);
        let owned = command.to_string();
        let task = tokio::spawn(async move { run_shell(&session, &owned).await });
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(AdbError::Other(format!("shell task failed: {join}"))),
            Err(_) => {
                warn!(command, "shell command timed out after {timeout:?}; remote keeps running");
                Err(AdbError::Timeout(timeout))
            }
        }
    }

    /// Open a long-lived shell for incremental reads and writes.
    ///
    /// An empty command starts an interactive login shell.
    pub async fn open_shell(&self, command: &str, pty: bool) -> Result<ShellStream, AdbError> {
        let protocol = if self.session.supports_feature(FEATURE_SHELL_V2) {
            ShellProtocol::V2
        } else {
            ShellProtocol::V1
        };
        let service = Service::Shell {
            command: command.to_string(),
            mode: if pty { ShellMode::Pty } else { ShellMode::Raw },
            protocol,
        };
        let stream = self.session.open_service(&service).await?;
        Ok(ShellStream::new(stream, protocol))
    }

    /// Run through `exec:` and return raw stdout bytes (binary safe).
    pub async fn exec(&self, command: &str) -> Result<Vec<u8>, AdbError> {
        let mut stream = self
            .session
            .open_service(&Service::Exec(command.to_string()))
            .await?;
        stream.read_to_end().await
    }

    /// Restart `adbd` as root. The session drops shortly after.
    pub async fn root(&self) -> Result<String, AdbError> {
        self.simple_service(Service::Root).await
    }

    pub async fn unroot(&self) -> Result<String, AdbError> {
        self.simple_service(Service::Unroot).await
    }

    /// Reboot into `target` (empty for a normal boot).
    pub async fn reboot(&self, target: &str) -> Result<(), AdbError> {
        self.simple_service(Service::Reboot(target.to_string()))
            .await
            .map(|_| ())
    }

    async fn simple_service(&self, service: Service) -> Result<String, AdbError> {
        let mut stream = self.session.open_service(&service).await?;
        let reply = match stream.read_to_end().await {
            Ok(bytes) => bytes,
            // adbd restarts without a clean CLSE.
            Err(AdbError::SessionClosed(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok(String::from_utf8_lossy(&reply).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_marker_is_stripped() {
        let r = split_exit_marker(format!("hello\n{EXIT_MARKER}3\n"));
        assert_eq!(r.output, "hello\n");
        assert_eq!(r.exit_code, 3);
        assert!(!r.success());
    }

    #[test]
    fn last_marker_wins() {
        let r = split_exit_marker(format!("{EXIT_MARKER}9\nmore\n{EXIT_MARKER}0\r\n"));
        assert_eq!(r.output, format!("{EXIT_MARKER}9\nmore\n"));
        assert_eq!(r.exit_code, 0);
    }

    #[test]
    fn missing_marker_keeps_output() {
        let r = split_exit_marker("partial".to_string());
        assert_eq!(r.output, "partial");
        assert_eq!(r.exit_code, 0);
    }
}
