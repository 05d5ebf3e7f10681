//! droidctl: ADB over the network, from the command line.
//!
//! ```text
//! droidctl pair <host:port> <code>          Pair using the six-digit code
//! droidctl shell <host:port> <cmd...>       Run a command, exit with its status
//! droidctl push|pull <host:port> <a> <b>    Copy files
//! droidctl ls <host:port> <dir>             List a remote directory
//! droidctl info|ps|mem <host:port>          Device queries
//! droidctl install|uninstall <host:port> .. Package management
//! droidctl key|text <host:port> ..          Input
//! droidctl mirror <host:port> -o out.h264   Record the screen stream
//! droidctl --gen-config                     Write default config to stdout
//! ```

mod config;
mod recorder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use droidctl_core::auth::{CertificateOptions, FileCertificateStore, get_or_create_identity};
use droidctl_core::mirror::QualityPreset;
use droidctl_core::protocol::sync;
use droidctl_core::{
    AdbIdentity, AdbSession, CommandChannel, ConnectionInfo, ConnectionRegistry, DeviceQuery,
    KeyCode, MirrorController,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::DroidctlConfig;
use recorder::{FileSurface, RecordingDecoder};

type BoxError = Box<dyn std::error::Error>;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "droidctl", version, about = "ADB device sessions and screen mirroring")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "droidctl.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Pair with a device's wireless-debugging pairing port.
    Pair { address: ConnectionInfo, code: String },
    /// Connect and report the device banner.
    Connect { address: ConnectionInfo },
    /// Run a shell command.
    Shell {
        address: ConnectionInfo,
        /// Give up after this many seconds (the remote process keeps running).
        #[arg(long)]
        timeout: Option<u64>,
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Copy a local file to the device.
    Push {
        address: ConnectionInfo,
        local: PathBuf,
        remote: String,
    },
    /// Copy a device file to the local machine.
    Pull {
        address: ConnectionInfo,
        remote: String,
        local: PathBuf,
    },
    /// List a remote directory.
    Ls { address: ConnectionInfo, path: String },
    /// Model, Android version and hardware summary.
    Info {
        address: ConnectionInfo,
        /// Include display, storage, SoC and battery details.
        #[arg(long)]
        full: bool,
        #[arg(long)]
        json: bool,
    },
    /// App processes by resident memory.
    Ps {
        address: ConnectionInfo,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// RAM totals.
    Mem { address: ConnectionInfo },
    /// Install an APK (replacing an existing install).
    Install { address: ConnectionInfo, apk: PathBuf },
    Uninstall { address: ConnectionInfo, package: String },
    /// Force-stop an app.
    Stop { address: ConnectionInfo, package: String },
    /// Send a key: a name (home, back, power, ...) or a numeric key code.
    Key { address: ConnectionInfo, key: String },
    /// Type text.
    Text { address: ConnectionInfo, text: String },
    /// Reboot, optionally into bootloader/recovery.
    Reboot {
        address: ConnectionInfo,
        #[arg(default_value = "")]
        target: String,
    },
    /// Stream the screen to a raw H.264 file until Ctrl-C or --duration.
    Mirror {
        address: ConnectionInfo,
        #[arg(short, long, default_value = "screen.h264")]
        output: PathBuf,
        /// standard | high
        #[arg(short, long)]
        quality: Option<QualityPreset>,
        /// Stop after this many seconds.
        #[arg(long)]
        duration: Option<u64>,
    },
}

impl Cmd {
    fn address(&self) -> &ConnectionInfo {
        match self {
            Cmd::Pair { address, .. }
            | Cmd::Connect { address }
            | Cmd::Shell { address, .. }
            | Cmd::Push { address, .. }
            | Cmd::Pull { address, .. }
            | Cmd::Ls { address, .. }
            | Cmd::Info { address, .. }
            | Cmd::Ps { address, .. }
            | Cmd::Mem { address }
            | Cmd::Install { address, .. }
            | Cmd::Uninstall { address, .. }
            | Cmd::Stop { address, .. }
            | Cmd::Key { address, .. }
            | Cmd::Text { address, .. }
            | Cmd::Reboot { address, .. }
            | Cmd::Mirror { address, .. } => address,
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&DroidctlConfig::default())?;
        println!("{text}");
        return Ok(());
    }
    let Some(command) = cli.command else {
        eprintln!("no command given; see --help");
        std::process::exit(2);
    };

    let config = DroidctlConfig::load(&cli.config);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let identity = load_identity(&config)?;
    let options = config.connect_options();

    if let Cmd::Pair { address, code } = &command {
        if AdbSession::pair(address, code, &identity, &options).await {
            println!("Paired with {address}");
            return Ok(());
        }
        eprintln!("Pairing with {address} failed");
        std::process::exit(1);
    }

    let registry: ConnectionRegistry = ConnectionRegistry::new();
    let session = registry
        .connect(command.address(), &identity, &options)
        .await?;
    let result = run(command, &config, Arc::clone(&session)).await;
    registry.close_all().await;

    match result {
        Ok(code) if code != 0 => std::process::exit(code),
        Ok(_) => Ok(()),
        Err(e) => Err(e),
    }
}

fn load_identity(config: &DroidctlConfig) -> Result<AdbIdentity, BoxError> {
    let mut store = FileCertificateStore::new(config.identity_dir());
    let mut options = CertificateOptions::default();
    if !config.identity.key_comment.is_empty() {
        store = store.with_key_comment(config.identity.key_comment.clone());
        options.key_comment = config.identity.key_comment.clone();
    }
    Ok(get_or_create_identity(&store, &options)?)
}

/// Execute one connected command. Returns the process exit code.
async fn run(
    command: Cmd,
    config: &DroidctlConfig,
    session: Arc<AdbSession>,
) -> Result<i32, BoxError> {
    let channel = CommandChannel::new(Arc::clone(&session));
    let query = DeviceQuery::new(channel.clone()).with_install_timeout(config.install_timeout());

    match command {
        Cmd::Pair { .. } => return Err("pairing does not use a session".into()),

        Cmd::Connect { address } => {
            let banner = session.banner();
            println!("connected to {address} ({})", banner.state);
            if let Some(model) = banner.property("ro.product.model") {
                println!("model: {model}");
            }
            let features: Vec<&str> = banner.features.iter().map(String::as_str).collect();
            println!("features: {}", features.join(","));
        }

        Cmd::Shell {
            command, timeout, ..
        } => {
            let line = command.join(" ");
            let response = match timeout {
                Some(secs) => channel.shell_with_timeout(&line, Duration::from_secs(secs)).await?,
                None => channel.shell(&line).await?,
            };
            print!("{}", response.output);
            eprint!("{}", response.error_output);
            return Ok(response.exit_code);
        }

        Cmd::Push { local, remote, .. } => {
            let bytes = sync::push_file(&session, &local, &remote, None).await?;
            println!("{} -> {remote}: {bytes} bytes", local.display());
        }

        Cmd::Pull { remote, local, .. } => {
            let bytes = sync::pull_file(&session, &remote, &local).await?;
            println!("{remote} -> {}: {bytes} bytes", local.display());
        }

        Cmd::Ls { path, .. } => {
            for entry in query.list_dir(&path).await? {
                let kind = if entry.stat.is_dir() { 'd' } else { '-' };
                println!(
                    "{kind}{:o} {:>10} {}",
                    entry.stat.permissions(),
                    entry.stat.size,
                    entry.name
                );
            }
        }

        Cmd::Info { full, json, .. } => {
            if full {
                let info = query.full_info().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!("model:      {}", info.model);
                    println!("android:    {} (sdk {})", info.android_version, info.sdk_version);
                    println!("serial:     {}", info.serial);
                    println!("display:    {} @ {}dpi", info.resolution, info.density);
                    println!("soc:        {} {}", info.cpu_brand, info.cpu_model);
                    println!(
                        "storage:    {} / {} ({:.0}%)",
                        info.storage_used, info.storage_total, info.storage_percent
                    );
                    println!("brightness: {}", info.brightness);
                    println!("ac power:   {}", info.ac_powered);
                }
            } else {
                let info = query.info().await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&info)?);
                } else {
                    println!(
                        "{} (Android {}, sdk {})",
                        info.display_name(),
                        info.android_version,
                        info.sdk_version
                    );
                }
            }
        }

        Cmd::Ps { limit, .. } => {
            println!("{:>7} {:>10}  NAME", "PID", "RSS(KB)");
            for p in query.processes().await?.into_iter().take(limit) {
                println!("{:>7} {:>10}  {}", p.pid, p.rss_kb, p.name);
            }
        }

        Cmd::Mem { .. } => {
            let mem = query.memory().await?;
            println!(
                "total {} KB, used {} KB, free {} KB",
                mem.total_kb, mem.used_kb, mem.free_kb
            );
        }

        Cmd::Install { apk, .. } => println!("{}", query.install(&apk).await?),
        Cmd::Uninstall { package, .. } => println!("{}", query.uninstall(&package).await?),
        Cmd::Stop { package, .. } => query.force_stop(&package).await?,

        Cmd::Key { key, .. } => match (KeyCode::from_name(&key), key.parse::<u32>()) {
            (Some(named), _) => query.key_event(named).await?,
            (None, Ok(code)) => query.key_code(code).await?,
            (None, Err(_)) => return Err(format!("unknown key {key:?}").into()),
        },

        Cmd::Text { text, .. } => query.input_text(&text).await?,

        Cmd::Reboot { target, .. } => channel.reboot(&target).await?,

        Cmd::Mirror {
            output,
            quality,
            duration,
            ..
        } => mirror(channel, config, output, quality, duration).await?,
    }
    Ok(0)
}

async fn mirror(
    channel: CommandChannel,
    config: &DroidctlConfig,
    output: PathBuf,
    quality: Option<QualityPreset>,
    duration: Option<u64>,
) -> Result<(), BoxError> {
    let controller = Arc::new(MirrorController::new(channel, config.mirror_options(quality)));
    let surface = FileSurface::new(&output);

    // Ctrl-C or the time limit ends the session.
    let stopper = Arc::clone(&controller);
    tokio::spawn(async move {
        match duration {
            Some(secs) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                }
            }
            None => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
        info!("stopping mirror");
        stopper.stop();
    });

    let mut status = controller.status_receiver();
    tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let message = status.borrow_and_update().message.clone();
            info!("{message}");
        }
    });

    let outcome = controller.run(&surface, RecordingDecoder::new()).await;
    let stats = controller.stats_receiver().borrow().clone();
    info!(
        bytes = stats.total_bytes,
        chunks = stats.chunks_queued,
        dropped = stats.chunks_dropped,
        "mirror finished"
    );
    if controller.input_error_count() > 0 {
        warn!(errors = controller.input_error_count(), "input events were lost");
    }
    let end = outcome?;
    println!("{} -> {} ({end:?})", stats.total_bytes, output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_mirror() {
        let cli = Cli::try_parse_from([
            "droidctl",
            "mirror",
            "192.168.1.20:40123",
            "-o",
            "x.h264",
            "--quality",
            "high",
        ])
        .unwrap();
        match cli.command.unwrap() {
            Cmd::Mirror {
                address, quality, ..
            } => {
                assert_eq!(address.port(), 40123);
                assert_eq!(quality, Some(QualityPreset::High));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cli_shell_keeps_hyphenated_args() {
        let cli = Cli::try_parse_from(["droidctl", "shell", "10.0.0.2", "ls", "-la", "/sdcard"])
            .unwrap();
        match cli.command.unwrap() {
            Cmd::Shell {
                address, command, ..
            } => {
                assert_eq!(address.port(), 5555);
                assert_eq!(command, vec!["ls", "-la", "/sdcard"]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cli_rejects_bad_address() {
        assert!(Cli::try_parse_from(["droidctl", "connect", "host:notaport"]).is_err());
    }
}
