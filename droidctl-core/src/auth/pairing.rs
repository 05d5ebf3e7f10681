//! Wireless-debugging pairing.
//!
//! # Wire Protocol
//!
//! ```text
//! Host ══[TLS 1.3, client cert]═══════════════► Device pairing port
//!   exported keying material: 64 bytes, label "adb-label\0"
//!   password = pairing code ‖ keying material
//!
//! Host ──[hdr(SPAKE2_MSG) + msg (32)]─────────► Device
//! Host ◄─────────[hdr(SPAKE2_MSG) + msg (32)]── Device
//!   key = HKDF-SHA256(spake2 key (64), info "adb pairing_auth aes-128-gcm key")
//!
//! Host ──[hdr(PEER_INFO) + AES-128-GCM(peer info)]──► Device
//! Host ◄──[hdr(PEER_INFO) + AES-128-GCM(peer info)]── Device
//!
//! hdr = version u8 (1) | type u8 | payload length u32 BE
//! ```
//!
//! A wrong pairing code gives the two sides different keys, so the
//! device's peer info fails to decrypt.

use std::time::Duration;

use ring::aead::{AES_128_GCM, Aad, LessSafeKey, Nonce, UnboundKey};
use ring::hkdf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info};

use crate::auth::cert::AdbIdentity;
use crate::auth::spake2::{Spake2Context, Spake2Role};
use crate::auth::tls::{client_config, server_name};
use crate::error::AdbError;
use crate::network::ConnectionInfo;

pub const PAIRING_PACKET_VERSION: u8 = 1;
pub const PAIRING_HEADER_SIZE: usize = 6;
/// Upper bound on any pairing payload.
pub const MAX_PAIRING_PAYLOAD: usize = 16 * 1024;
/// Fixed size of the peer-info record (type byte + data).
pub const PEER_INFO_SIZE: usize = 8192;

const EXPORT_LABEL: &[u8] = b"adb-label\0";
const EXPORT_LEN: usize = 64;
const CLIENT_ID: &[u8] = b"adb pair client\0";
const SERVER_ID: &[u8] = b"adb pair server\0";
const HKDF_INFO: &[u8] = b"adb pairing_auth aes-128-gcm key";

// ── Packet header ────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingPacketType {
    Spake2Message = 0,
    PeerInfo = 1,
}

impl TryFrom<u8> for PairingPacketType {
    type Error = AdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Spake2Message),
            1 => Ok(Self::PeerInfo),
            _ => Err(AdbError::UnknownVariant {
                type_name: "PairingPacketType",
                value: value as u64,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PairingHeader {
    pub kind: PairingPacketType,
    pub payload_len: u32,
}

impl PairingHeader {
    pub fn to_bytes(&self) -> [u8; PAIRING_HEADER_SIZE] {
        let mut out = [0u8; PAIRING_HEADER_SIZE];
        out[0] = PAIRING_PACKET_VERSION;
        out[1] = self.kind as u8;
        out[2..6].copy_from_slice(&self.payload_len.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; PAIRING_HEADER_SIZE]) -> Result<Self, AdbError> {
        if bytes[0] != PAIRING_PACKET_VERSION {
            return Err(AdbError::Pairing(format!(
                "unsupported pairing packet version {}",
                bytes[0]
            )));
        }
        let payload_len = u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]);
        if payload_len as usize > MAX_PAIRING_PAYLOAD {
            return Err(AdbError::PayloadTooLarge {
                size: payload_len as usize,
                max: MAX_PAIRING_PAYLOAD,
            });
        }
        Ok(Self {
            kind: PairingPacketType::try_from(bytes[1])?,
            payload_len,
        })
    }
}

pub(crate) async fn write_pairing_packet<S>(
    stream: &mut S,
    kind: PairingPacketType,
    payload: &[u8],
) -> Result<(), AdbError>
where
    S: AsyncWrite + Unpin,
{
    let header = PairingHeader {
        kind,
        payload_len: payload.len() as u32,
    };
    stream.write_all(&header.to_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

pub(crate) async fn read_pairing_packet<S>(
    stream: &mut S,
    expected: PairingPacketType,
) -> Result<Vec<u8>, AdbError>
where
    S: AsyncRead + Unpin,
{
    let mut raw = [0u8; PAIRING_HEADER_SIZE];
    stream.read_exact(&mut raw).await?;
    let header = PairingHeader::from_bytes(&raw)?;
    if header.kind != expected {
        return Err(AdbError::Pairing(format!(
            "expected {expected:?}, got {:?}",
            header.kind
        )));
    }
    let mut payload = vec![0u8; header.payload_len as usize];
    stream.read_exact(&mut payload).await?;
    Ok(payload)
}

// ── Key exchange ─────────────────────────────────────────────────

/// The password-authenticated key exchange run inside the TLS channel.
pub trait PairingKeyExchange: Send {
    /// Our message for the peer.
    fn outbound_message(&self) -> &[u8];

    /// Consume the peer's message and produce the shared secret.
    fn finish(self: Box<Self>, peer_message: &[u8]) -> Result<Vec<u8>, AdbError>;
}

/// SPAKE2 as adbd runs it (BoringSSL's edwards25519 variant).
pub struct Spake2Exchange {
    context: Spake2Context,
}

impl Spake2Exchange {
    /// Host side ("alice").
    pub fn client(password: &[u8]) -> Self {
        Self {
            context: Spake2Context::new(Spake2Role::Alice, CLIENT_ID, SERVER_ID, password),
        }
    }

    /// Device side ("bob").
    pub fn server(password: &[u8]) -> Self {
        Self {
            context: Spake2Context::new(Spake2Role::Bob, SERVER_ID, CLIENT_ID, password),
        }
    }
}

impl PairingKeyExchange for Spake2Exchange {
    fn outbound_message(&self) -> &[u8] {
        self.context.message()
    }

    fn finish(self: Box<Self>, peer_message: &[u8]) -> Result<Vec<u8>, AdbError> {
        Ok(self.context.process(peer_message)?.to_vec())
    }
}

// ── Cipher ───────────────────────────────────────────────────────

/// AES-128-GCM with independent 64-bit message counters per direction.
pub struct PairingCipher {
    key: LessSafeKey,
    encrypt_seq: u64,
    decrypt_seq: u64,
}

impl PairingCipher {
    pub fn from_shared_secret(secret: &[u8]) -> Result<Self, AdbError> {
        let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &[]).extract(secret);
        let okm = prk
            .expand(&[HKDF_INFO], &AES_128_GCM)
            .map_err(|_| AdbError::Pairing("key derivation failed".into()))?;
        Ok(Self {
            key: LessSafeKey::new(UnboundKey::from(okm)),
            encrypt_seq: 0,
            decrypt_seq: 0,
        })
    }

    fn nonce(seq: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&seq.to_le_bytes());
        Nonce::assume_unique_for_key(bytes)
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, AdbError> {
        let mut buf = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(Self::nonce(self.encrypt_seq), Aad::empty(), &mut buf)
            .map_err(|_| AdbError::Pairing("encryption failed".into()))?;
        self.encrypt_seq += 1;
        Ok(buf)
    }

    /// Fails when the peer derived a different key (wrong pairing code).
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, AdbError> {
        let mut buf = ciphertext.to_vec();
        let len = self
            .key
            .open_in_place(Self::nonce(self.decrypt_seq), Aad::empty(), &mut buf)
            .map_err(|_| AdbError::Pairing("peer message failed to decrypt (wrong code?)".into()))?
            .len();
        buf.truncate(len);
        self.decrypt_seq += 1;
        Ok(buf)
    }
}

// ── Peer info ────────────────────────────────────────────────────

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerInfoType {
    RsaPublicKey = 0,
    DeviceGuid = 1,
}

/// Identity record exchanged once the channel is keyed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub kind: PeerInfoType,
    pub data: Vec<u8>,
}

impl PeerInfo {
    pub fn public_key(line: &str) -> Self {
        Self {
            kind: PeerInfoType::RsaPublicKey,
            data: line.as_bytes().to_vec(),
        }
    }

    /// Fixed-size record, zero padded.
    pub fn to_bytes(&self) -> Result<Vec<u8>, AdbError> {
        if self.data.len() >= PEER_INFO_SIZE {
            return Err(AdbError::PayloadTooLarge {
                size: self.data.len(),
                max: PEER_INFO_SIZE - 1,
            });
        }
        let mut out = vec![0u8; PEER_INFO_SIZE];
        out[0] = self.kind as u8;
        out[1..1 + self.data.len()].copy_from_slice(&self.data);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, AdbError> {
        if bytes.len() != PEER_INFO_SIZE {
            return Err(AdbError::Pairing(format!(
                "peer info must be {PEER_INFO_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        let kind = match bytes[0] {
            0 => PeerInfoType::RsaPublicKey,
            1 => PeerInfoType::DeviceGuid,
            other => {
                return Err(AdbError::UnknownVariant {
                    type_name: "PeerInfoType",
                    value: other as u64,
                });
            }
        };
        let end = bytes[1..].iter().position(|b| *b == 0).map_or(bytes.len(), |p| p + 1);
        Ok(Self {
            kind,
            data: bytes[1..end].to_vec(),
        })
    }

    /// Data as text (device GUID or key line).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

// ── Exchange ─────────────────────────────────────────────────────

/// Run the key exchange and peer-info swap over an established channel.
pub async fn exchange_peer_info<S>(
    stream: &mut S,
    key_exchange: Box<dyn PairingKeyExchange>,
    ours: &PeerInfo,
) -> Result<PeerInfo, AdbError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_pairing_packet(
        stream,
        PairingPacketType::Spake2Message,
        key_exchange.outbound_message(),
    )
    .await?;
    let peer_msg = read_pairing_packet(stream, PairingPacketType::Spake2Message).await?;
    let secret = key_exchange.finish(&peer_msg)?;
    let mut cipher = PairingCipher::from_shared_secret(&secret)?;

    let sealed = cipher.encrypt(&ours.to_bytes()?)?;
    write_pairing_packet(stream, PairingPacketType::PeerInfo, &sealed).await?;

    let theirs = read_pairing_packet(stream, PairingPacketType::PeerInfo).await?;
    PeerInfo::from_bytes(&cipher.decrypt(&theirs)?)
}

/// Pair with the device's pairing service using a six-digit code.
///
/// Returns the device's peer info on success.
pub async fn pair(
    target: &ConnectionInfo,
    code: &str,
    identity: &AdbIdentity,
    timeout: Duration,
) -> Result<PeerInfo, AdbError> {
    let run = async {
        let tcp = TcpStream::connect(target.to_string()).await.map_err(|e| {
            AdbError::Unreachable {
                address: target.to_string(),
                reason: e.to_string(),
            }
        })?;
        tcp.set_nodelay(true)?;

        let connector = TlsConnector::from(client_config(identity)?);
        let mut tls = connector.connect(server_name(target.host())?, tcp).await?;
        debug!(%target, "pairing tls established");

        let exported = tls
            .get_ref()
            .1
            .export_keying_material([0u8; EXPORT_LEN], EXPORT_LABEL, None)?;
        let mut password = code.trim().as_bytes().to_vec();
        password.extend_from_slice(&exported);

        let ours = PeerInfo::public_key(&identity.key().public_key_line(identity.key_comment()));
        let peer = exchange_peer_info(&mut tls, Box::new(Spake2Exchange::client(&password)), &ours)
            .await?;
        let _ = tls.shutdown().await;
        Ok::<_, AdbError>(peer)
    };

    let peer = tokio::time::timeout(timeout, run)
        .await
        .map_err(|_| AdbError::Timeout(timeout))??;
    info!(%target, guid = %peer.text(), "paired");
    Ok(peer)
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Device side of the exchange.
    async fn fake_device<S>(mut stream: S, password: &[u8]) -> Result<PeerInfo, AdbError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let exchange = Box::new(Spake2Exchange::server(password));
        let client_msg = read_pairing_packet(&mut stream, PairingPacketType::Spake2Message).await?;
        assert_eq!(client_msg.len(), 32);
        write_pairing_packet(
            &mut stream,
            PairingPacketType::Spake2Message,
            exchange.outbound_message(),
        )
        .await?;
        let secret = exchange.finish(&client_msg)?;
        assert_eq!(secret.len(), 64);
        let mut cipher = PairingCipher::from_shared_secret(&secret)?;

        let info = PeerInfo {
            kind: PeerInfoType::DeviceGuid,
            data: b"adb-guid-1234".to_vec(),
        };
        let sealed = cipher.encrypt(&info.to_bytes()?)?;
        write_pairing_packet(&mut stream, PairingPacketType::PeerInfo, &sealed).await?;

        let theirs = read_pairing_packet(&mut stream, PairingPacketType::PeerInfo).await?;
        PeerInfo::from_bytes(&cipher.decrypt(&theirs)?)
    }

    #[test]
    fn header_layout_is_big_endian() {
        let h = PairingHeader {
            kind: PairingPacketType::PeerInfo,
            payload_len: 0x0102,
        };
        assert_eq!(h.to_bytes(), [1, 1, 0, 0, 1, 2]);
        assert_eq!(PairingHeader::from_bytes(&h.to_bytes()).unwrap(), h);
        assert!(PairingHeader::from_bytes(&[2, 0, 0, 0, 0, 0]).is_err());
        assert!(PairingHeader::from_bytes(&[1, 0, 0xff, 0, 0, 0]).is_err());
    }

    #[test]
    fn peer_info_is_fixed_size() {
        let info = PeerInfo::public_key("QUFB user@host");
        let bytes = info.to_bytes().unwrap();
        assert_eq!(bytes.len(), PEER_INFO_SIZE);
        assert_eq!(PeerInfo::from_bytes(&bytes).unwrap(), info);
    }

    #[test]
    fn cipher_counters_advance_per_direction() {
        let mut a = PairingCipher::from_shared_secret(b"shared").unwrap();
        let mut b = PairingCipher::from_shared_secret(b"shared").unwrap();
        let first = a.encrypt(b"one").unwrap();
        let second = a.encrypt(b"one").unwrap();
        assert_ne!(first, second);
        assert_eq!(b.decrypt(&first).unwrap(), b"one");
        assert_eq!(b.decrypt(&second).unwrap(), b"one");
    }

    #[tokio::test]
    async fn matching_codes_exchange_peer_info() {
        let (mut client, device) = tokio::io::duplex(64 * 1024);
        let device = tokio::spawn(async move { fake_device(device, b"123456ekm").await });

        let ours = PeerInfo::public_key("QUFB me@host");
        let peer = exchange_peer_info(
            &mut client,
            Box::new(Spake2Exchange::client(b"123456ekm")),
            &ours,
        )
        .await
        .unwrap();
        assert_eq!(peer.kind, PeerInfoType::DeviceGuid);
        assert_eq!(peer.text(), "adb-guid-1234");
        assert_eq!(device.await.unwrap().unwrap(), ours);
    }

    #[tokio::test]
    async fn wrong_code_fails_to_decrypt() {
        let (mut client, device) = tokio::io::duplex(64 * 1024);
        let device = tokio::spawn(async move { fake_device(device, b"000000ekm").await });

        let err = exchange_peer_info(
            &mut client,
            Box::new(Spake2Exchange::client(b"123456ekm")),
            &PeerInfo::public_key("QUFB me@host"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, AdbError::Pairing(_)));
        assert!(device.await.unwrap().is_err());
    }
}
