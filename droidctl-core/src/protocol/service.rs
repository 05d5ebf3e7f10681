//! Service destinations understood by `adbd`.
//!
//! Destinations are plain strings on the wire (`OPEN` payload). Building
//! them through [`Service`] keeps the set closed and the formatting in one
//! place; [`quote`] makes arguments safe for the remote `sh`.

use std::fmt;
use std::str::FromStr;

use crate::error::AdbError;

/// Terminal handling for shell services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellMode {
    /// No pty: stdout and stderr stay separate, binary safe.
    Raw,
    /// Allocate a pty (interactive use).
    Pty,
}

/// Framing used on the shell stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShellProtocol {
    /// Unframed bytes; no exit status.
    V1,
    /// Packetized stdin/stdout/stderr/exit (`shell_v2` feature).
    V2,
}

/// A device service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Service {
    Shell {
        command: String,
        mode: ShellMode,
        protocol: ShellProtocol,
    },
    /// Raw command execution without a shell wrapper's framing.
    Exec(String),
    /// File sync sub-protocol.
    Sync,
    /// A named abstract UNIX socket on the device.
    LocalAbstract(String),
    /// A TCP port on the device loopback.
    Tcp(u16),
    /// Restart `adbd` as root.
    Root,
    /// Restart `adbd` unprivileged.
    Unroot,
    /// Reboot, optionally into `bootloader`/`recovery`/...
    Reboot(String),
}

impl Service {
    /// Shell command using the v2 protocol without a pty.
    pub fn shell_v2(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
            mode: ShellMode::Raw,
            protocol: ShellProtocol::V2,
        }
    }

    /// Legacy unframed shell command.
    pub fn shell_legacy(command: impl Into<String>) -> Self {
        Self::Shell {
            command: command.into(),
            mode: ShellMode::Raw,
            protocol: ShellProtocol::V1,
        }
    }

    /// The string sent in `OPEN`.
    pub fn to_destination(&self) -> String {
        match self {
            Self::Shell {
                command,
                mode,
                protocol: ShellProtocol::V2,
            } => {
                let mode = match mode {
                    ShellMode::Raw => "raw",
                    ShellMode::Pty => "pty",
                };
                format!("shell,v2,{mode}:{command}")
            }
            Self::Shell { command, .. } => format!("shell:{command}"),
            Self::Exec(command) => format!("exec:{command}"),
            Self::Sync => "sync:".to_string(),
            Self::LocalAbstract(name) => format!("localabstract:{name}"),
            Self::Tcp(port) => format!("tcp:{port}"),
            Self::Root => "root:".to_string(),
            Self::Unroot => "unroot:".to_string(),
            Self::Reboot(target) => format!("reboot:{target}"),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_destination())
    }
}

impl FromStr for Service {
    type Err = AdbError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (head, rest) = s
            .split_once(':')
            .ok_or_else(|| AdbError::protocol(format!("destination without ':': {s:?}")))?;

        if head == "shell" || head.starts_with("shell,") {
            let mut protocol = ShellProtocol::V1;
            let mut mode = ShellMode::Raw;
            for arg in head.split(',').skip(1) {
                match arg {
                    "v2" => protocol = ShellProtocol::V2,
                    "raw" => mode = ShellMode::Raw,
                    "pty" => mode = ShellMode::Pty,
                    other => {
                        return Err(AdbError::protocol(format!("unknown shell option {other:?}")));
                    }
                }
            }
            return Ok(Self::Shell {
                command: rest.to_string(),
                mode,
                protocol,
            });
        }

        match head {
            "exec" => Ok(Self::Exec(rest.to_string())),
            "sync" => Ok(Self::Sync),
            "localabstract" => Ok(Self::LocalAbstract(rest.to_string())),
            "tcp" => rest
                .parse()
                .map(Self::Tcp)
                .map_err(|_| AdbError::protocol(format!("invalid tcp port {rest:?}"))),
            "root" => Ok(Self::Root),
            "unroot" => Ok(Self::Unroot),
            "reboot" => Ok(Self::Reboot(rest.to_string())),
            other => Err(AdbError::protocol(format!("unknown service {other:?}"))),
        }
    }
}

/// Quote one argument for the device's `sh`.
///
/// Plain tokens pass through unchanged; anything else is wrapped in
/// single quotes with embedded quotes escaped.
pub fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"_-./:=@%+,".contains(&b));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Join a program and its arguments into one shell command line.
pub fn command_line<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destinations() {
        assert_eq!(Service::shell_v2("ls -l").to_destination(), "shell,v2,raw:ls -l");
        assert_eq!(Service::shell_legacy("id").to_destination(), "shell:id");
        assert_eq!(
            Service::Shell {
                command: String::new(),
                mode: ShellMode::Pty,
                protocol: ShellProtocol::V2
            }
            .to_destination(),
            "shell,v2,pty:"
        );
        assert_eq!(Service::Sync.to_destination(), "sync:");
        assert_eq!(
            Service::LocalAbstract("scrcpy".into()).to_destination(),
            "localabstract:scrcpy"
        );
        assert_eq!(Service::Tcp(8080).to_string(), "tcp:8080");
    }

    #[test]
    fn parse_inverts_render() {
        for service in [
            Service::shell_v2("echo 1"),
            Service::shell_legacy("getprop"),
            Service::Exec("cat /x".into()),
            Service::Sync,
            Service::LocalAbstract("scrcpy".into()),
            Service::Tcp(27183),
            Service::Root,
            Service::Reboot("bootloader".into()),
        ] {
            assert_eq!(service.to_destination().parse::<Service>().unwrap(), service);
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("nonsense".parse::<Service>().is_err());
        assert!("tcp:http".parse::<Service>().is_err());
        assert!("shell,v9:ls".parse::<Service>().is_err());
        assert!("bogus:x".parse::<Service>().is_err());
    }

    #[test]
    fn quoting() {
        assert_eq!(quote("/data/local/tmp/a.jar"), "/data/local/tmp/a.jar");
        assert_eq!(quote("hello world"), "'hello world'");
        assert_eq!(quote("it's"), r"'it'\''s'");
        assert_eq!(quote(""), "''");
        assert_eq!(quote("a;rm -rf /"), "'a;rm -rf /'");
        assert_eq!(command_line(["pm", "uninstall", "com.example.app"]), "pm uninstall com.example.app");
    }
}
