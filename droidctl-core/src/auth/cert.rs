//! Client identity: RSA key plus self-signed X.509 certificate.
//!
//! The same identity is used for legacy `AUTH`, for the TLS transport
//! after `STLS`, and for pairing. It is created once and persisted through
//! a [`CertificateStore`]; later runs load it back.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SerialNumber};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::auth::keys::AdbKeyPair;
use crate::error::AdbError;

// ── Stored form ──────────────────────────────────────────────────

/// Persisted identity material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    /// PKCS#8 PEM private key.
    pub private_key_pem: String,
    /// PEM certificate.
    pub certificate_pem: String,
    /// Certificate expiry, seconds since the Unix epoch.
    pub not_after: u64,
}

impl StoredCredentials {
    pub fn is_expired(&self) -> bool {
        unix_now() >= self.not_after
    }
}

/// Where identity material lives between runs.
pub trait CertificateStore: Send + Sync {
    /// `Ok(None)` when nothing has been stored yet.
    fn load(&self) -> Result<Option<StoredCredentials>, AdbError>;
    fn save(&self, credentials: &StoredCredentials) -> Result<(), AdbError>;
    fn clear(&self) -> Result<(), AdbError>;
}

// ── File store ───────────────────────────────────────────────────

const KEY_FILE: &str = "adbkey";
const PUBKEY_FILE: &str = "adbkey.pub";
const CERT_FILE: &str = "adbcert.pem";
const META_FILE: &str = "adbcert.json";

#[derive(Debug, Serialize, Deserialize)]
struct CertMeta {
    not_after: u64,
}

/// Stores identity files in a directory using the usual `adbkey` /
/// `adbkey.pub` names, plus the certificate and its expiry.
#[derive(Debug, Clone)]
pub struct FileCertificateStore {
    dir: PathBuf,
    key_comment: String,
}

impl FileCertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            key_comment: default_key_comment(),
        }
    }

    /// Comment written after the key in `adbkey.pub`.
    pub fn with_key_comment(mut self, comment: impl Into<String>) -> Self {
        self.key_comment = comment.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl CertificateStore for FileCertificateStore {
    fn load(&self) -> Result<Option<StoredCredentials>, AdbError> {
        let key_path = self.dir.join(KEY_FILE);
        let cert_path = self.dir.join(CERT_FILE);
        if !key_path.exists() || !cert_path.exists() {
            return Ok(None);
        }
        let private_key_pem = fs::read_to_string(&key_path)?;
        let certificate_pem = fs::read_to_string(&cert_path)?;
        let not_after = match fs::read_to_string(self.dir.join(META_FILE)) {
            Ok(text) => serde_json::from_str::<CertMeta>(&text)
                .map_err(|e| AdbError::Certificate(e.to_string()))?
                .not_after,
            // Without metadata the certificate's age is unknown; treat as expired.
            Err(_) => 0,
        };
        Ok(Some(StoredCredentials {
            private_key_pem,
            certificate_pem,
            not_after,
        }))
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), AdbError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.dir.join(KEY_FILE), &credentials.private_key_pem)?;
        fs::write(self.dir.join(CERT_FILE), &credentials.certificate_pem)?;
        let meta = serde_json::to_string_pretty(&CertMeta {
            not_after: credentials.not_after,
        })
        .map_err(|e| AdbError::Certificate(e.to_string()))?;
        fs::write(self.dir.join(META_FILE), meta)?;

        let key = AdbKeyPair::from_pkcs8_pem(&credentials.private_key_pem)?;
        fs::write(
            self.dir.join(PUBKEY_FILE),
            format!("{}\n", key.public_key_line(&self.key_comment)),
        )?;
        debug!(dir = %self.dir.display(), "identity files written");
        Ok(())
    }

    fn clear(&self) -> Result<(), AdbError> {
        for name in [KEY_FILE, PUBKEY_FILE, CERT_FILE, META_FILE] {
            match fs::remove_file(self.dir.join(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// ── Memory store ─────────────────────────────────────────────────

/// Keeps the identity in memory only.
#[derive(Debug, Default)]
pub struct MemoryCertificateStore {
    slot: Mutex<Option<StoredCredentials>>,
}

impl MemoryCertificateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CertificateStore for MemoryCertificateStore {
    fn load(&self) -> Result<Option<StoredCredentials>, AdbError> {
        let slot = self.slot.lock().map_err(|_| AdbError::from("store lock poisoned"))?;
        Ok(slot.clone())
    }

    fn save(&self, credentials: &StoredCredentials) -> Result<(), AdbError> {
        let mut slot = self.slot.lock().map_err(|_| AdbError::from("store lock poisoned"))?;
        *slot = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), AdbError> {
        let mut slot = self.slot.lock().map_err(|_| AdbError::from("store lock poisoned"))?;
        *slot = None;
        Ok(())
    }
}

// ── Identity ─────────────────────────────────────────────────────

/// Subject and validity of generated certificates.
#[derive(Debug, Clone)]
pub struct CertificateOptions {
    pub common_name: String,
    pub organization: String,
    pub organizational_unit: String,
    pub country: String,
    pub validity: Duration,
    /// `user@host` comment sent with the public key.
    pub key_comment: String,
}

impl Default for CertificateOptions {
    fn default() -> Self {
        Self {
            common_name: "droidctl".into(),
            organization: "droidctl".into(),
            organizational_unit: "droidctl".into(),
            country: "US".into(),
            validity: Duration::from_secs(365 * 24 * 60 * 60),
            key_comment: default_key_comment(),
        }
    }
}

/// A loaded client identity.
#[derive(Debug, Clone)]
pub struct AdbIdentity {
    key: AdbKeyPair,
    key_comment: String,
    certificate_der: Vec<u8>,
    private_key_der: Vec<u8>,
    not_after: u64,
}

impl AdbIdentity {
    /// Build from stored PEM material.
    pub fn from_credentials(
        credentials: &StoredCredentials,
        key_comment: impl Into<String>,
    ) -> Result<Self, AdbError> {
        let key = AdbKeyPair::from_pkcs8_pem(&credentials.private_key_pem)?;
        let certificate_der = rustls_pemfile::certs(&mut credentials.certificate_pem.as_bytes())
            .next()
            .ok_or_else(|| AdbError::Certificate("no certificate in PEM".into()))?
            .map_err(|e| AdbError::Certificate(e.to_string()))?
            .to_vec();
        let private_key_der = key.to_pkcs8_der()?;
        Ok(Self {
            key,
            key_comment: key_comment.into(),
            certificate_der,
            private_key_der,
            not_after: credentials.not_after,
        })
    }

    /// Generate a key and a self-signed certificate.
    pub fn generate(options: &CertificateOptions) -> Result<(Self, StoredCredentials), AdbError> {
        let key = AdbKeyPair::generate()?;
        let private_key_pem = key.to_pkcs8_pem()?;
        let signing_key = KeyPair::from_pem(&private_key_pem)?;

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, options.common_name.clone());
        dn.push(DnType::OrganizationName, options.organization.clone());
        dn.push(DnType::OrganizationalUnitName, options.organizational_unit.clone());
        dn.push(DnType::CountryName, options.country.clone());

        let now = time::OffsetDateTime::now_utc();
        let validity = time::Duration::seconds(options.validity.as_secs() as i64);
        let mut serial = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut serial);
        // Positive serial number.
        serial[0] &= 0x7f;

        let mut params = CertificateParams::default();
        params.distinguished_name = dn;
        params.not_before = now;
        params.not_after = now + validity;
        params.serial_number = Some(SerialNumber::from_slice(&serial));
        let cert = params.self_signed(&signing_key)?;

        let credentials = StoredCredentials {
            private_key_pem,
            certificate_pem: cert.pem(),
            not_after: unix_now() + options.validity.as_secs(),
        };
        let identity = Self {
            private_key_der: key.to_pkcs8_der()?,
            key,
            key_comment: options.key_comment.clone(),
            certificate_der: cert.der().to_vec(),
            not_after: credentials.not_after,
        };
        Ok((identity, credentials))
    }

    pub fn key(&self) -> &AdbKeyPair {
        &self.key
    }

    pub fn key_comment(&self) -> &str {
        &self.key_comment
    }

    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate_der
    }

    /// PKCS#8 DER private key, as used by the TLS layer.
    pub fn private_key_der(&self) -> &[u8] {
        &self.private_key_der
    }

    pub fn not_after(&self) -> u64 {
        self.not_after
    }
}

/// Load the stored identity, or create and store a new one.
///
/// Expired or unreadable stored material is replaced.
pub fn get_or_create_identity(
    store: &dyn CertificateStore,
    options: &CertificateOptions,
) -> Result<AdbIdentity, AdbError> {
    match store.load() {
        Ok(Some(stored)) if !stored.is_expired() => {
            match AdbIdentity::from_credentials(&stored, options.key_comment.clone()) {
                Ok(identity) => return Ok(identity),
                Err(e) => warn!("stored identity unusable, regenerating: {e}"),
            }
        }
        Ok(Some(_)) => info!("stored certificate expired, regenerating"),
        Ok(None) => info!("no stored identity, generating one"),
        Err(e) => warn!("failed to load identity, regenerating: {e}"),
    }

    let (identity, credentials) = AdbIdentity::generate(options)?;
    store.save(&credentials)?;
    Ok(identity)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn default_key_comment() -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "droidctl".into());
    format!("{user}@droidctl")
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_generates_once() {
        let store = MemoryCertificateStore::new();
        let opts = CertificateOptions::default();
        let first = get_or_create_identity(&store, &opts).unwrap();
        let second = get_or_create_identity(&store, &opts).unwrap();
        assert_eq!(first.certificate_der(), second.certificate_der());
        assert!(!first.certificate_der().is_empty());
    }

    #[test]
    fn expired_identity_is_replaced() {
        let store = MemoryCertificateStore::new();
        let opts = CertificateOptions::default();
        let first = get_or_create_identity(&store, &opts).unwrap();

        let mut stored = store.load().unwrap().unwrap();
        stored.not_after = 1;
        store.save(&stored).unwrap();

        let second = get_or_create_identity(&store, &opts).unwrap();
        assert_ne!(first.certificate_der(), second.certificate_der());
    }

    #[test]
    fn file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path()).with_key_comment("me@box");
        assert!(store.load().unwrap().is_none());

        let opts = CertificateOptions::default();
        let identity = get_or_create_identity(&store, &opts).unwrap();
        assert!(dir.path().join("adbkey").exists());
        let pubkey = std::fs::read_to_string(dir.path().join("adbkey.pub")).unwrap();
        assert!(pubkey.trim_end().ends_with(" me@box"));

        let reloaded = get_or_create_identity(&store, &opts).unwrap();
        assert_eq!(identity.certificate_der(), reloaded.certificate_der());

        store.clear().unwrap();
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn missing_metadata_counts_as_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCertificateStore::new(dir.path());
        get_or_create_identity(&store, &CertificateOptions::default()).unwrap();
        std::fs::remove_file(dir.path().join("adbcert.json")).unwrap();
        assert!(store.load().unwrap().unwrap().is_expired());
    }
}
