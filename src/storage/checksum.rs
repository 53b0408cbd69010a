//! Checksum 验证模块
//!
//! CRC32 over stored artifact bytes. The value travels in the sidecar record
//! and is checked on every read, so a truncated or bit-flipped blob is
//! reported as corruption instead of being deserialized.

use crc32fast::Hasher;

/// Checksum 计算器
pub struct Checksum;

impl Checksum {
    /// CRC32 of `data`
    pub fn compute(data: &[u8]) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(data);
        hasher.finalize()
    }

    /// Verify `data` against `expected`
    pub fn verify(data: &[u8], expected: u32) -> Result<(), ChecksumError> {
        let actual = Self::compute(data);
        if actual != expected {
            return Err(ChecksumError::Mismatch {
                expected,
                actual,
                data_len: data.len(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Checksum mismatch: expected {expected:#010x}, got {actual:#010x} (data_len={data_len})")]
    Mismatch {
        expected: u32,
        actual: u32,
        data_len: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_basic() {
        let data = b"shard blob bytes";
        let checksum = Checksum::compute(data);

        assert!(Checksum::verify(data, checksum).is_ok());
        assert!(Checksum::verify(data, checksum.wrapping_add(1)).is_err());

        // 数据被篡改
        let corrupted = b"shard blob bytez";
        assert!(matches!(
            Checksum::verify(corrupted, checksum),
            Err(ChecksumError::Mismatch { data_len: 16, .. })
        ));
    }

    #[test]
    fn test_checksum_empty_data() {
        // CRC32 对空数据返回 0
        assert_eq!(Checksum::compute(b""), 0);
    }
}
