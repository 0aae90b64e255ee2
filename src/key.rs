//! # Keys and XOR Distance
//!
//! A [`Key`] is the 256-bit identifier shared by nodes and stored values.
//! Content keys are the SHA-256 digest of the value bytes, so the store is
//! content-addressed; node keys are drawn at random from the same space.
//!
//! Internally a key is four `u64` limbs. Limb `i` holds bytes `8i..8i+8` of
//! the digest interpreted little-endian, and limb 0 is the most significant
//! under the distance order. The hex form prints limb 0 first, 16 lowercase
//! digits per limb (64 characters total).
//!
//! [`Distance`] is the limb-wise XOR of two keys, totally ordered by
//! comparing limb 0 first. `distance(a, a)` is [`Distance::ZERO`] and the
//! metric is symmetric; everything the routing table and lookup engine do
//! rests on those two properties.

use std::cmp::Ordering;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of `u64` limbs in a key.
pub const KEY_LIMBS: usize = 4;

/// Width of the key space in bits.
pub const KEY_BITS: usize = KEY_LIMBS * 64;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key([u64; KEY_LIMBS]);

impl Key {
    /// The all-zero key, the identity element of XOR.
    pub const ZERO: Key = Key([0; KEY_LIMBS]);

    #[inline]
    pub fn from_limbs(limbs: [u64; KEY_LIMBS]) -> Self {
        Self(limbs)
    }

    #[inline]
    pub fn limbs(&self) -> &[u64; KEY_LIMBS] {
        &self.0
    }

    /// Build a key from 32 raw bytes (e.g. a hash digest). Limb `i` is the
    /// little-endian interpretation of bytes `8i..8i+8`.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        let mut limbs = [0u64; KEY_LIMBS];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *limb = u64::from_le_bytes(chunk);
        }
        Self(limbs)
    }

    /// Inverse of [`Key::from_bytes`]: recovers the original digest bytes.
    pub fn to_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        for (i, limb) in self.0.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_le_bytes());
        }
        bytes
    }

    /// Content key for a byte string: the SHA-256 digest of the bytes.
    pub fn compute(data: &[u8]) -> Self {
        let digest = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Self::from_bytes(bytes)
    }

    /// Fresh random key for a new node identity.
    pub fn random() -> Self {
        let mut rng = OsRng;
        Self(std::array::from_fn(|_| rng.next_u64()))
    }

    /// Bit `index` of the key, where bit 0 is the most significant bit of
    /// limb 0. The routing tree walks keys in this order.
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < KEY_BITS);
        let limb = self.0[index / 64];
        limb >> (63 - (index % 64)) & 1 == 1
    }

    /// XOR distance to another key.
    #[inline]
    pub fn distance(&self, other: &Key) -> Distance {
        Distance(std::array::from_fn(|i| self.0[i] ^ other.0[i]))
    }

    /// 64 lowercase hex characters, most significant limb first.
    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(64);
        for limb in self.0 {
            out.extend(hex::encode(limb.to_be_bytes()).chars());
        }
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut limbs = [0u64; KEY_LIMBS];
        for (i, limb) in limbs.iter_mut().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..(i + 1) * 8]);
            *limb = u64::from_be_bytes(chunk);
        }
        Ok(Self(limbs))
    }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Key({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u64; KEY_LIMBS]> for Key {
    fn from(limbs: [u64; KEY_LIMBS]) -> Self {
        Self(limbs)
    }
}

/// XOR distance between two keys, ordered limb 0 first.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u64; KEY_LIMBS]);

impl Distance {
    pub const ZERO: Distance = Distance([0; KEY_LIMBS]);

    /// Number of leading zero bits; grows as keys get closer.
    pub fn leading_zeros(&self) -> u32 {
        let mut zeros = 0u32;
        for limb in self.0 {
            if limb == 0 {
                zeros += 64;
            } else {
                zeros += limb.leading_zeros();
                break;
            }
        }
        zeros
    }

    /// Bit `index` of the distance, same bit order as [`Key::bit`].
    #[inline]
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < KEY_BITS);
        self.0[index / 64] >> (63 - (index % 64)) & 1 == 1
    }

    pub fn to_hex(self) -> String {
        let mut out = String::with_capacity(64);
        for limb in self.0 {
            out.extend(hex::encode(limb.to_be_bytes()).chars());
        }
        out
    }
}

impl std::fmt::Debug for Distance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Distance({})", &self.to_hex()[..16])
    }
}

/// Compare two distances; `Ordering::Less` means `a` is closer.
#[inline]
pub fn distance_cmp(a: &Distance, b: &Distance) -> Ordering {
    a.cmp(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        for _ in 0..16 {
            let key = Key::random();
            assert_eq!(key.distance(&key), Distance::ZERO);
        }
    }

    #[test]
    fn distance_is_symmetric() {
        for _ in 0..16 {
            let a = Key::random();
            let b = Key::random();
            assert_eq!(a.distance(&b), b.distance(&a));
        }
    }

    #[test]
    fn distance_order_matches_xor_order() {
        for _ in 0..64 {
            let a = Key::random();
            let b = Key::random();
            let c = Key::random();
            let xor_ab: Vec<u64> = a.limbs().iter().zip(b.limbs()).map(|(x, y)| x ^ y).collect();
            let xor_ac: Vec<u64> = a.limbs().iter().zip(c.limbs()).map(|(x, y)| x ^ y).collect();
            assert_eq!(
                a.distance(&b) < a.distance(&c),
                xor_ab < xor_ac,
                "distance order must be the lexicographic order of the XOR limbs"
            );
        }
    }

    #[test]
    fn computed_key_distance_matches_reference_vector() {
        let a = Key::compute(b"key1");
        let b = Key::compute(b"key2");
        assert_eq!(
            a.distance(&b).to_hex(),
            "1e4529cbe05a76306e7402f8358f974740603a1740993e9ead8c3f56ad5c9fae"
        );
    }

    #[test]
    fn hex_round_trip() {
        let key = Key::compute(b"round trip");
        let hex = key.to_hex();
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(Key::from_hex(&hex).expect("parse"), key);

        assert!(Key::from_hex("abcd").is_err());
        assert!(Key::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn byte_round_trip_preserves_digest() {
        let data = b"some value";
        let key = Key::compute(data);
        assert_eq!(Key::from_bytes(key.to_bytes()), key);
        assert_eq!(key.to_bytes().to_vec(), Sha256::digest(data).to_vec());
    }

    #[test]
    fn bit_order_is_most_significant_first() {
        let key = Key::from_limbs([1 << 63, 0, 0, 0]);
        assert!(key.bit(0));
        for i in 1..KEY_BITS {
            assert!(!key.bit(i), "only bit 0 should be set, found bit {i}");
        }

        let key = Key::from_limbs([0, 1, 0, 0]);
        assert!(key.bit(127));
        assert!(!key.bit(126));
    }

    #[test]
    fn leading_zeros_counts_from_limb_zero() {
        assert_eq!(Distance::ZERO.leading_zeros(), KEY_BITS as u32);
        let d = Key::from_limbs([0, 1 << 62, 0, 0]).distance(&Key::ZERO);
        assert_eq!(d.leading_zeros(), 65);
    }
}
