//! SPAKE2 over edwards25519, wire-compatible with BoringSSL's
//! `SPAKE2_generate_msg` / `SPAKE2_process_msg` as used by adbd.
//!
//! ```text
//! w    = SHA-512(password) mod l, cofactor-cleared
//! x    = random scalar, cofactor-cleared
//! msg  = x·B + w·(M | N)                           32 bytes
//! K    = x·(peer_msg − w·(N | M))
//! key  = SHA-512(lp(alice) lp(bob) lp(msg_a) lp(msg_b) lp(K) lp(SHA-512(password)))
//!        lp(v) = len(v) as u64 LE ‖ v              64 bytes
//! ```
//!
//! M and N are not in the prime-order subgroup. BoringSSL adds multiples
//! of l to w until it is divisible by 8, which makes w·M equal to
//! (w/8 mod l)·8M. The same holds for the 8x private scalar, so every
//! product here is computed on 8-multiplied points with reduced scalars.

use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use rand::RngCore;
use ring::digest::{SHA512, digest};

use crate::error::AdbError;

pub const SPAKE2_MSG_SIZE: usize = 32;
pub const SPAKE2_KEY_SIZE: usize = 64;

/// BoringSSL `kSpakeM`: first valid point after SHA-256 of
/// "edwards25519 point generation seed (M)".
const SPAKE_M: [u8; 32] = [
    0x5a, 0xda, 0x7e, 0x4b, 0xf6, 0xdd, 0xd9, 0xad, 0xb6, 0x62, 0x6d, 0x32, 0x13, 0x1c, 0x6b, 0x5c,
    0x51, 0xa1, 0xe3, 0x47, 0xa3, 0x47, 0x8f, 0x53, 0xcf, 0xcf, 0x44, 0x1b, 0x88, 0xee, 0xd1, 0x2e,
];

/// BoringSSL `kSpakeN`, same construction with seed "(N)".
const SPAKE_N: [u8; 32] = [
    0x10, 0xe3, 0xdf, 0x0a, 0xe3, 0x7d, 0x8e, 0x7a, 0x99, 0xb5, 0xfe, 0x74, 0xb4, 0x46, 0x72, 0x10,
    0x3d, 0xbd, 0xdc, 0xbd, 0x06, 0xaf, 0x68, 0x0d, 0x71, 0x32, 0x9a, 0x11, 0x69, 0x3b, 0xc7, 0x78,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Spake2Role {
    /// Pairing client (the host).
    Alice,
    /// Pairing server (the device).
    Bob,
}

/// One side of a SPAKE2 run. Generate a message, then process the peer's.
pub struct Spake2Context {
    role: Spake2Role,
    my_name: Vec<u8>,
    their_name: Vec<u8>,
    /// Private scalar before the ×8.
    private: Scalar,
    /// Password scalar divided by the cofactor.
    password_scalar: Scalar,
    password_hash: [u8; 64],
    my_msg: [u8; SPAKE2_MSG_SIZE],
}

impl Spake2Context {
    pub fn new(role: Spake2Role, my_name: &[u8], their_name: &[u8], password: &[u8]) -> Self {
        let mut seed = [0u8; 64];
        rand::rngs::OsRng.fill_bytes(&mut seed);
        Self::from_seed(role, my_name, their_name, password, &seed)
    }

    /// Deterministic variant: `seed` stands in for the 64 random bytes
    /// BoringSSL reduces into the private key.
    pub(crate) fn from_seed(
        role: Spake2Role,
        my_name: &[u8],
        their_name: &[u8],
        password: &[u8],
        seed: &[u8; 64],
    ) -> Self {
        let private = Scalar::from_bytes_mod_order_wide(seed);

        let mut password_hash = [0u8; 64];
        password_hash.copy_from_slice(digest(&SHA512, password).as_ref());
        let password_scalar =
            Scalar::from_bytes_mod_order_wide(&password_hash) * Scalar::from(8u8).invert();

        let mask = password_scalar * cleared_point(mask_point(role));
        let public = EdwardsPoint::mul_base(&(Scalar::from(8u8) * private));
        let my_msg = (public + mask).compress().to_bytes();

        Self {
            role,
            my_name: my_name.to_vec(),
            their_name: their_name.to_vec(),
            private,
            password_scalar,
            password_hash,
            my_msg,
        }
    }

    pub fn message(&self) -> &[u8; SPAKE2_MSG_SIZE] {
        &self.my_msg
    }

    /// Derive the 64-byte shared key from the peer's message.
    ///
    /// A wrong password is not detected here; the two sides simply end up
    /// with different keys.
    pub fn process(&self, their_msg: &[u8]) -> Result<[u8; SPAKE2_KEY_SIZE], AdbError> {
        let their_point = CompressedEdwardsY::from_slice(their_msg)
            .map_err(|_| {
                AdbError::Pairing(format!(
                    "spake2 message must be {SPAKE2_MSG_SIZE} bytes, got {}",
                    their_msg.len()
                ))
            })?
            .decompress()
            .ok_or_else(|| AdbError::Pairing("spake2 message is not a curve point".into()))?;

        let peer_role = match self.role {
            Spake2Role::Alice => Spake2Role::Bob,
            Spake2Role::Bob => Spake2Role::Alice,
        };
        let peers_mask = self.password_scalar * cleared_point(mask_point(peer_role));
        let shared = self.private * (their_point - peers_mask).mul_by_cofactor();
        let shared = shared.compress().to_bytes();

        let mut transcript = Vec::with_capacity(256);
        let (alice_name, bob_name, alice_msg, bob_msg) = match self.role {
            Spake2Role::Alice => (&self.my_name, &self.their_name, &self.my_msg[..], their_msg),
            Spake2Role::Bob => (&self.their_name, &self.my_name, their_msg, &self.my_msg[..]),
        };
        for part in [
            alice_name.as_slice(),
            bob_name.as_slice(),
            alice_msg,
            bob_msg,
            &shared[..],
            &self.password_hash[..],
        ] {
            transcript.extend_from_slice(&(part.len() as u64).to_le_bytes());
            transcript.extend_from_slice(part);
        }

        let mut key = [0u8; SPAKE2_KEY_SIZE];
        key.copy_from_slice(digest(&SHA512, &transcript).as_ref());
        Ok(key)
    }
}

fn mask_point(role: Spake2Role) -> &'static [u8; 32] {
    match role {
        Spake2Role::Alice => &SPAKE_M,
        Spake2Role::Bob => &SPAKE_N,
    }
}

/// 8·P for one of the fixed generators.
fn cleared_point(encoded: &[u8; 32]) -> EdwardsPoint {
    // Both constants decode; the fallback is unreachable.
    CompressedEdwardsY(*encoded)
        .decompress()
        .map(|p| p.mul_by_cofactor())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALICE: &[u8] = b"adb pair client\0";
    const BOB: &[u8] = b"adb pair server\0";

    fn seed(start: u8) -> [u8; 64] {
        std::array::from_fn(|i| start.wrapping_add(i as u8))
    }

    fn password(code: &[u8]) -> Vec<u8> {
        let mut pw = code.to_vec();
        pw.extend(0u8..64);
        pw
    }

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn generators_decode() {
        for point in [SPAKE_M, SPAKE_N] {
            let decoded = CompressedEdwardsY(point).decompress().unwrap();
            assert!(!decoded.is_torsion_free());
            assert!(cleared_point(&point).is_torsion_free());
        }
    }

    #[test]
    fn matches_boringssl_transcript() {
        let pw = password(b"123456");
        let alice = Spake2Context::from_seed(Spake2Role::Alice, ALICE, BOB, &pw, &seed(1));
        let bob = Spake2Context::from_seed(Spake2Role::Bob, BOB, ALICE, &pw, &seed(101));

        assert_eq!(
            hex(alice.message()),
            "18021ab6f94baaad3f460edc2d2af18255f1f3f783346fe32c5d7c59ba508794"
        );
        assert_eq!(
            hex(bob.message()),
            "b843b31b32de241cb524757b3732d969a2a0ed841cc4bed04cfc2606712a5d1d"
        );

        let expected = "2dd534d590b364676348927af33c8538095dec7bc5650b07b383341f4a867625\
                        2c0e43752ef1d79838edf22d5c3dcadfcf5ee568ad044f2971b78b55a695bf51";
        assert_eq!(hex(&alice.process(bob.message()).unwrap()), expected);
        assert_eq!(hex(&bob.process(alice.message()).unwrap()), expected);
    }

    #[test]
    fn different_passwords_disagree() {
        let alice = Spake2Context::new(Spake2Role::Alice, ALICE, BOB, &password(b"123456"));
        let bob = Spake2Context::new(Spake2Role::Bob, BOB, ALICE, &password(b"654321"));
        let a = alice.process(bob.message()).unwrap();
        let b = bob.process(alice.message()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_messages() {
        let alice = Spake2Context::new(Spake2Role::Alice, ALICE, BOB, b"pw");
        assert!(alice.process(&[0u8; 33]).is_err());
        assert!(alice.process(&[]).is_err());
    }
}
