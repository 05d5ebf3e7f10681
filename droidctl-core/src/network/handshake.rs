//! `CNXN` / `AUTH` / `STLS` negotiation.
//!
//! ```text
//! Host ──[CNXN A_VERSION, max_payload, "host::features=..."]──► Device
//!
//! Device ──[CNXN]──► done
//! Device ──[STLS]──► Host ──[STLS]──► TLS 1.3 handshake ──► Device ──[CNXN]──► done
//! Device ──[AUTH TOKEN]──► Host ──[AUTH SIGNATURE]──►
//!     Device ──[CNXN]──► done
//!     Device ──[AUTH TOKEN]──► Host ──[AUTH RSAPUBLICKEY]──► (user confirms) ──[CNXN]──► done
//! ```

use std::collections::{BTreeMap, BTreeSet};

use futures::{SinkExt, StreamExt};
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;
use tracing::{debug, info};

use crate::auth::cert::AdbIdentity;
use crate::auth::tls;
use crate::codec::AdbCodec;
use crate::error::AdbError;
use crate::message::{AuthType, Command};
use crate::network::{BoxedIo, ConnectOptions, ConnectionInfo};
use crate::packet::Packet;

// ── DeviceBanner ─────────────────────────────────────────────────

/// Parsed `CNXN` payload from the device:
/// `<state>:<serial>:<key>=<value>;...;features=a,b,c`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBanner {
    /// `device`, `recovery`, `sideload`, ...
    pub state: String,
    pub serial: String,
    pub properties: BTreeMap<String, String>,
    pub features: BTreeSet<String>,
}

impl DeviceBanner {
    pub fn parse(text: &str) -> Self {
        let mut parts = text.splitn(3, ':');
        let state = parts.next().unwrap_or_default().to_string();
        let serial = parts.next().unwrap_or_default().to_string();
        let mut properties = BTreeMap::new();
        let mut features = BTreeSet::new();

        for entry in parts.next().unwrap_or_default().split(';') {
            let Some((key, value)) = entry.split_once('=') else {
                continue;
            };
            if key == "features" {
                features.extend(
                    value
                        .split(',')
                        .filter(|f| !f.is_empty())
                        .map(String::from),
                );
            } else {
                properties.insert(key.to_string(), value.to_string());
            }
        }

        Self {
            state,
            serial,
            properties,
            features,
        }
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

// ── Handshake ────────────────────────────────────────────────────

/// A transport that completed the handshake.
pub(crate) struct Handshake {
    pub framed: Framed<BoxedIo, AdbCodec>,
    pub banner: DeviceBanner,
    pub protocol_version: u32,
    /// Smaller of our limit and the device's.
    pub max_payload: usize,
    pub tls: bool,
}

/// Drive the handshake to completion. The caller bounds it with a timeout.
pub(crate) async fn perform(
    mut framed: Framed<BoxedIo, AdbCodec>,
    target: &ConnectionInfo,
    identity: &AdbIdentity,
    options: &ConnectOptions,
) -> Result<Handshake, AdbError> {
    framed
        .send(Packet::connect(
            crate::message::A_VERSION,
            options.max_payload as u32,
            &options.banner(),
        ))
        .await?;

    let mut secured = false;
    let mut signed = false;
    let mut key_offered = false;

    loop {
        let packet = match framed.next().await {
            Some(result) => result?,
            None => {
                return Err(AdbError::Handshake(
                    "device closed the connection during handshake".into(),
                ));
            }
        };
        debug!(?packet, "handshake");

        match packet.command {
            Command::Cnxn => {
                let banner = DeviceBanner::parse(&packet.payload_str());
                let max_payload = (packet.arg1 as usize).clamp(1, options.max_payload);
                info!(
                    %target,
                    state = %banner.state,
                    version = format_args!("{:#x}", packet.arg0),
                    max_payload,
                    tls = secured,
                    "device connected"
                );
                return Ok(Handshake {
                    framed,
                    banner,
                    protocol_version: packet.arg0,
                    max_payload,
                    tls: secured,
                });
            }

            Command::Stls => {
                if secured {
                    return Err(AdbError::protocol("STLS received on a TLS transport"));
                }
                framed.send(Packet::stls()).await?;
                let parts = framed.into_parts();
                if !parts.read_buf.is_empty() {
                    return Err(AdbError::protocol("plaintext data after STLS"));
                }
                let connector = TlsConnector::from(tls::client_config(identity)?);
                let stream = connector
                    .connect(tls::server_name(target.host())?, parts.io)
                    .await
                    .map_err(|e| AdbError::Handshake(format!("tls handshake failed: {e}")))?;
                debug!(%target, "transport upgraded to tls");
                framed = Framed::new(
                    Box::new(stream) as BoxedIo,
                    AdbCodec::with_max_payload(options.max_payload),
                );
                secured = true;
            }

            Command::Auth => match AuthType::try_from(packet.arg0)? {
                AuthType::Token if !signed => {
                    let signature = identity.key().sign_token(&packet.payload)?;
                    framed
                        .send(Packet::auth(AuthType::Signature, signature))
                        .await?;
                    signed = true;
                }
                AuthType::Token if !key_offered => {
                    let key = identity.key().auth_public_key_payload(identity.key_comment());
                    framed.send(Packet::auth(AuthType::RsaPublicKey, key)).await?;
                    key_offered = true;
                    info!(%target, "waiting for the key to be accepted on the device");
                }
                AuthType::Token => {
                    return Err(AdbError::Handshake("device rejected our key".into()));
                }
                other => {
                    return Err(AdbError::protocol(format!(
                        "unexpected AUTH {other:?} from device"
                    )));
                }
            },

            other => debug!("ignoring {other} during handshake"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_banner() {
        let banner = DeviceBanner::parse(
            "device::ro.product.name=oriole;ro.product.model=Pixel 6;ro.product.device=oriole;features=shell_v2,cmd,stat_v2",
        );
        assert_eq!(banner.state, "device");
        assert_eq!(banner.serial, "");
        assert_eq!(banner.property("ro.product.model"), Some("Pixel 6"));
        assert!(banner.has_feature("shell_v2"));
        assert!(banner.has_feature("stat_v2"));
        assert!(!banner.has_feature("abb"));
    }

    #[test]
    fn parse_minimal_banner() {
        let banner = DeviceBanner::parse("device");
        assert_eq!(banner.state, "device");
        assert!(banner.features.is_empty());
        assert!(banner.properties.is_empty());
    }
}
