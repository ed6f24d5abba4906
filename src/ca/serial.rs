//! Serial numbers and key identifiers.

use rcgen::SerialNumber;
use ring::digest::{SHA1_FOR_LEGACY_USE_ONLY, digest};
use ring::rand::{SecureRandom, SystemRandom};

use super::{CaError, CaResult};

/// Default serial ceiling, as a power of two: serials fall in `[0, 2^159)`.
///
/// 159 bits keeps the DER INTEGER within the 20 octets RFC 5280 allows
/// without a sign-padding byte.
pub const DEFAULT_SERIAL_BITS: u32 = 159;

/// Draws certificate serial numbers uniformly from `[0, 2^bits)`.
///
/// Collisions are not tracked.
pub struct SerialGenerator {
    bits: u32,
    rng: SystemRandom,
}

impl SerialGenerator {
    /// Creates a generator with the given ceiling exponent, clamped to `1..=159`.
    pub fn new(bits: u32) -> Self {
        Self {
            bits: bits.clamp(1, DEFAULT_SERIAL_BITS),
            rng: SystemRandom::new(),
        }
    }

    /// Returns the ceiling exponent.
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Returns a fresh random serial as big-endian bytes.
    pub fn next_bytes(&self) -> CaResult<Vec<u8>> {
        let len = self.bits.div_ceil(8) as usize;
        let mut bytes = vec![0u8; len];
        self.rng.fill(&mut bytes).map_err(|_| CaError::Random)?;

        // Drop the excess high bits of the leading byte.
        let excess = (len as u32) * 8 - self.bits;
        bytes[0] &= 0xff >> excess;
        Ok(bytes)
    }

    /// Returns a fresh random serial in rcgen's representation.
    pub fn next(&self) -> CaResult<SerialNumber> {
        Ok(SerialNumber::from(self.next_bytes()?))
    }
}

impl Default for SerialGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_SERIAL_BITS)
    }
}

/// SHA-1 digest of a DER-encoded SubjectPublicKeyInfo.
pub fn key_id(spki_der: &[u8]) -> Vec<u8> {
    digest(&SHA1_FOR_LEGACY_USE_ONLY, spki_der).as_ref().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_stays_below_ceiling() {
        let serials = SerialGenerator::default();
        for _ in 0..64 {
            let bytes = serials.next_bytes().unwrap();
            assert_eq!(bytes.len(), 20);
            assert_eq!(bytes[0] & 0x80, 0);
        }
    }

    #[test]
    fn small_ceiling_masks_leading_byte() {
        let serials = SerialGenerator::new(12);
        for _ in 0..64 {
            let bytes = serials.next_bytes().unwrap();
            assert_eq!(bytes.len(), 2);
            assert_eq!(bytes[0] & 0xf0, 0);
        }
    }

    #[test]
    fn ceiling_is_clamped() {
        assert_eq!(SerialGenerator::new(0).bits(), 1);
        assert_eq!(SerialGenerator::new(4096).bits(), DEFAULT_SERIAL_BITS);
    }

    #[test]
    fn serials_differ() {
        let serials = SerialGenerator::default();
        assert_ne!(serials.next_bytes().unwrap(), serials.next_bytes().unwrap());
    }

    #[test]
    fn key_id_is_sha1_sized() {
        let id = key_id(b"not really a public key");
        assert_eq!(id.len(), 20);
        assert_eq!(id, key_id(b"not really a public key"));
        assert_ne!(id, key_id(b"another key"));
    }
}
