//! Client identity, TLS and pairing.

pub mod cert;
pub mod keys;
pub mod pairing;
pub mod spake2;
pub mod tls;

pub use cert::{
    AdbIdentity, CertificateOptions, CertificateStore, FileCertificateStore,
    MemoryCertificateStore, StoredCredentials, get_or_create_identity,
};
pub use keys::AdbKeyPair;
pub use pairing::{PairingKeyExchange, PeerInfo, Spake2Exchange};
