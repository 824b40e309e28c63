//! Seed→key computation for UDS security access (0x27)
//!
//! A closed set of byte-wise algorithms plus one escape hatch for opaque
//! OEM providers (DLL wrappers, remote services). The opaque path runs on
//! the blocking pool under a 500 ms wall-clock deadline; its failures
//! surface to the client without a key ever being sent.

use std::fmt;
use std::sync::Arc;

use crc::{Crc, CRC_16_IBM_3740};
use tokio::time::Duration;
use tracing::debug;

use crate::error::SecurityError;

/// Wall-clock deadline for an external provider.
pub const PROVIDER_DEADLINE_MS: u64 = 500;

/// CRC-16/IBM-3740 ("CCITT-FALSE"): poly 0x1021, init 0xFFFF.
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Externally supplied seed→key computation. May block (e.g. a vendor
/// DLL); the engine calls it off the async runtime.
pub trait SeedKeyProvider: Send + Sync {
    fn compute_key(&self, level: u8, seed: &[u8]) -> Result<Vec<u8>, SecurityError>;
}

impl<F> SeedKeyProvider for F
where
    F: Fn(u8, &[u8]) -> Result<Vec<u8>, SecurityError> + Send + Sync,
{
    fn compute_key(&self, level: u8, seed: &[u8]) -> Result<Vec<u8>, SecurityError> {
        self(level, seed)
    }
}

/// Seed→key algorithm selection.
///
/// All built-ins produce a key of the same length as the seed.
#[derive(Clone)]
pub enum SeedKeyAlgorithm {
    /// `key[i] = seed[i] ^ constant_byte(i)` with a 16-bit constant
    Xor { constant: u16 },
    /// `key[i] = (seed[i] + constant_byte(i)) mod 256`
    Add { constant: u16 },
    /// `key[i] = !seed[i]`
    Complement,
    /// CRC16-CCITT of the seed, big-endian, right-padded with 0x00
    Crc16Ccitt,
    /// Opaque external provider, bounded to 500 ms
    External(Arc<dyn SeedKeyProvider>),
}

impl SeedKeyAlgorithm {
    /// XOR with the conventional default constant 0x1234.
    pub fn xor_default() -> Self {
        Self::Xor { constant: 0x1234 }
    }

    /// ADD with the conventional default constant 0x5678.
    pub fn add_default() -> Self {
        Self::Add { constant: 0x5678 }
    }

    /// Compute the key for `seed` at `level`.
    pub async fn compute(&self, level: u8, seed: &[u8]) -> Result<Vec<u8>, SecurityError> {
        let key = match self {
            Self::Xor { constant } => byte_wise(seed, *constant, |byte, k| byte ^ k),
            Self::Add { constant } => {
                byte_wise(seed, *constant, |byte, k| byte.wrapping_add(k))
            }
            Self::Complement => seed.iter().map(|byte| !byte).collect(),
            Self::Crc16Ccitt => {
                let mut key = CRC16.checksum(seed).to_be_bytes().to_vec();
                key.resize(seed.len(), 0x00);
                key
            }
            Self::External(provider) => {
                let provider = provider.clone();
                let seed = seed.to_vec();
                let computed = tokio::time::timeout(
                    Duration::from_millis(PROVIDER_DEADLINE_MS),
                    tokio::task::spawn_blocking(move || provider.compute_key(level, &seed)),
                )
                .await
                .map_err(|_| SecurityError::ProviderTimeout(PROVIDER_DEADLINE_MS))?
                .map_err(|e| SecurityError::Provider(format!("provider panicked: {e}")))??;
                computed
            }
        };
        debug!(level, seed_len = seed.len(), key_len = key.len(), "seed/key computed");
        Ok(key)
    }
}

/// Apply `op` byte-wise with the constant's low byte at even indices and
/// high byte at odd indices (`(constant >> (8 * (i % 2))) & 0xFF`).
fn byte_wise(seed: &[u8], constant: u16, op: impl Fn(u8, u8) -> u8) -> Vec<u8> {
    seed.iter()
        .enumerate()
        .map(|(i, &byte)| op(byte, (constant >> (8 * (i % 2))) as u8))
        .collect()
}

impl fmt::Debug for SeedKeyAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Xor { constant } => write!(f, "Xor(0x{constant:04X})"),
            Self::Add { constant } => write!(f, "Add(0x{constant:04X})"),
            Self::Complement => write!(f, "Complement"),
            Self::Crc16Ccitt => write!(f, "Crc16Ccitt"),
            Self::External(_) => write!(f, "External(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn xor_matches_the_worked_example() {
        // seed 12 34 56 78 with constant 0x1234:
        // low byte 0x34 at even indices, high byte 0x12 at odd
        let key = SeedKeyAlgorithm::xor_default()
            .compute(1, &[0x12, 0x34, 0x56, 0x78])
            .await
            .unwrap();
        assert_eq!(key, vec![0x26, 0x26, 0x62, 0x6A]);
    }

    #[tokio::test]
    async fn xor_is_an_involution() {
        let seed = vec![0xDE, 0xAD, 0xBE, 0xEF, 0x01];
        let algorithm = SeedKeyAlgorithm::Xor { constant: 0xA5C3 };
        let once = algorithm.compute(1, &seed).await.unwrap();
        let twice = algorithm.compute(1, &once).await.unwrap();
        assert_eq!(twice, seed);
    }

    #[tokio::test]
    async fn complement_is_an_involution() {
        let seed = vec![0x00, 0x7F, 0x80, 0xFF];
        let algorithm = SeedKeyAlgorithm::Complement;
        let once = algorithm.compute(1, &seed).await.unwrap();
        assert_eq!(once, vec![0xFF, 0x80, 0x7F, 0x00]);
        let twice = algorithm.compute(1, &once).await.unwrap();
        assert_eq!(twice, seed);
    }

    #[tokio::test]
    async fn every_builtin_preserves_seed_length() {
        let algorithms = [
            SeedKeyAlgorithm::xor_default(),
            SeedKeyAlgorithm::add_default(),
            SeedKeyAlgorithm::Complement,
            SeedKeyAlgorithm::Crc16Ccitt,
        ];
        for algorithm in &algorithms {
            for len in [1usize, 2, 4, 16] {
                let seed: Vec<u8> = (0..len as u8).map(|i| i.wrapping_mul(37)).collect();
                let key = algorithm.compute(1, &seed).await.unwrap();
                assert_eq!(key.len(), seed.len(), "{algorithm:?} with {len}-byte seed");
            }
        }
    }

    #[tokio::test]
    async fn crc16_matches_the_reference_vector() {
        // CRC-16/IBM-3740 of "123456789" is 0x29B1
        assert_eq!(CRC16.checksum(b"123456789"), 0x29B1);

        let key = SeedKeyAlgorithm::Crc16Ccitt
            .compute(1, b"123456789")
            .await
            .unwrap();
        assert_eq!(&key[..2], &[0x29, 0xB1]);
        assert!(key[2..].iter().all(|&b| b == 0x00));
    }

    #[tokio::test]
    async fn external_provider_result_is_passed_through() {
        let algorithm = SeedKeyAlgorithm::External(Arc::new(
            |level: u8, seed: &[u8]| -> Result<Vec<u8>, SecurityError> {
                Ok(seed.iter().map(|b| b.wrapping_add(level)).collect())
            },
        ));
        let key = algorithm.compute(3, &[1, 2, 3]).await.unwrap();
        assert_eq!(key, vec![4, 5, 6]);
    }

    #[tokio::test]
    async fn external_provider_errors_surface() {
        let algorithm = SeedKeyAlgorithm::External(Arc::new(
            |_: u8, _: &[u8]| -> Result<Vec<u8>, SecurityError> {
                Err(SecurityError::Provider("dongle missing".to_string()))
            },
        ));
        let err = algorithm.compute(1, &[0x55]).await.unwrap_err();
        assert_eq!(err, SecurityError::Provider("dongle missing".to_string()));
    }

    #[tokio::test]
    async fn external_provider_is_bounded_to_its_deadline() {
        let algorithm = SeedKeyAlgorithm::External(Arc::new(
            |_: u8, _: &[u8]| -> Result<Vec<u8>, SecurityError> {
                std::thread::sleep(std::time::Duration::from_millis(2000));
                Ok(vec![])
            },
        ));
        let started = std::time::Instant::now();
        let err = algorithm.compute(1, &[0x55]).await.unwrap_err();
        assert_eq!(err, SecurityError::ProviderTimeout(PROVIDER_DEADLINE_MS));
        assert!(started.elapsed() < std::time::Duration::from_millis(1500));
    }
}
