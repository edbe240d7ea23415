use crc32fast::Hasher;

#[inline]
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc32_empty() {
        assert_eq!(crc32(&[]), 0);
    }

    #[test]
    fn test_crc32_stable() {
        let data = b"skiff log record";
        assert_ne!(crc32(data), 0);
        assert_eq!(crc32(data), crc32(data));
    }

    #[test]
    fn test_crc32_detects_single_byte_flip() {
        let data = b"0123456789abcdef".to_vec();
        let clean = crc32(&data);
        for i in 0..data.len() {
            let mut corrupt = data.clone();
            corrupt[i] ^= 0x40;
            assert_ne!(crc32(&corrupt), clean, "flip at {i} not detected");
        }
    }
}
