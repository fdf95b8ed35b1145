//! CRC-8 checksum of bulk transfer chunks.
//!
//! Polynomial 0x69, MSB first, zero initial value, no final XOR.

/// Lookup table of the checksum.
static TABLE: [u8; 256] = [
    0x00, 0x69, 0xd2, 0xbb, 0xcd, 0xa4, 0x1f, 0x76, 0xf3, 0x9a, 0x21, 0x48, 0x3e, 0x57, 0xec, 0x85,
    0x8f, 0xe6, 0x5d, 0x34, 0x42, 0x2b, 0x90, 0xf9, 0x7c, 0x15, 0xae, 0xc7, 0xb1, 0xd8, 0x63, 0x0a,
    0x77, 0x1e, 0xa5, 0xcc, 0xba, 0xd3, 0x68, 0x01, 0x84, 0xed, 0x56, 0x3f, 0x49, 0x20, 0x9b, 0xf2,
    0xf8, 0x91, 0x2a, 0x43, 0x35, 0x5c, 0xe7, 0x8e, 0x0b, 0x62, 0xd9, 0xb0, 0xc6, 0xaf, 0x14, 0x7d,
    0xee, 0x87, 0x3c, 0x55, 0x23, 0x4a, 0xf1, 0x98, 0x1d, 0x74, 0xcf, 0xa6, 0xd0, 0xb9, 0x02, 0x6b,
    0x61, 0x08, 0xb3, 0xda, 0xac, 0xc5, 0x7e, 0x17, 0x92, 0xfb, 0x40, 0x29, 0x5f, 0x36, 0x8d, 0xe4,
    0x99, 0xf0, 0x4b, 0x22, 0x54, 0x3d, 0x86, 0xef, 0x6a, 0x03, 0xb8, 0xd1, 0xa7, 0xce, 0x75, 0x1c,
    0x16, 0x7f, 0xc4, 0xad, 0xdb, 0xb2, 0x09, 0x60, 0xe5, 0x8c, 0x37, 0x5e, 0x28, 0x41, 0xfa, 0x93,
    0xb5, 0xdc, 0x67, 0x0e, 0x78, 0x11, 0xaa, 0xc3, 0x46, 0x2f, 0x94, 0xfd, 0x8b, 0xe2, 0x59, 0x30,
    0x3a, 0x53, 0xe8, 0x81, 0xf7, 0x9e, 0x25, 0x4c, 0xc9, 0xa0, 0x1b, 0x72, 0x04, 0x6d, 0xd6, 0xbf,
    0xc2, 0xab, 0x10, 0x79, 0x0f, 0x66, 0xdd, 0xb4, 0x31, 0x58, 0xe3, 0x8a, 0xfc, 0x95, 0x2e, 0x47,
    0x4d, 0x24, 0x9f, 0xf6, 0x80, 0xe9, 0x52, 0x3b, 0xbe, 0xd7, 0x6c, 0x05, 0x73, 0x1a, 0xa1, 0xc8,
    0x5b, 0x32, 0x89, 0xe0, 0x96, 0xff, 0x44, 0x2d, 0xa8, 0xc1, 0x7a, 0x13, 0x65, 0x0c, 0xb7, 0xde,
    0xd4, 0xbd, 0x06, 0x6f, 0x19, 0x70, 0xcb, 0xa2, 0x27, 0x4e, 0xf5, 0x9c, 0xea, 0x83, 0x38, 0x51,
    0x2c, 0x45, 0xfe, 0x97, 0xe1, 0x88, 0x33, 0x5a, 0xdf, 0xb6, 0x0d, 0x64, 0x12, 0x7b, 0xc0, 0xa9,
    0xa3, 0xca, 0x71, 0x18, 0x6e, 0x07, 0xbc, 0xd5, 0x50, 0x39, 0x82, 0xeb, 0x9d, 0xf4, 0x4f, 0x26,
];

/// Calculates the CRC-8 of a slice of binary data.
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0, |crc, &b| TABLE[(crc ^ b) as usize])
}

/// Checks a chunk whose last byte is the CRC-8 of the preceding bytes.
///
/// Chunks shorter than two bytes are never valid.
pub fn is_valid(chunk: &[u8]) -> bool {
    match chunk.split_last() {
        Some((&crc, data)) if !data.is_empty() => crc8(data) == crc,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitwise(data: &[u8]) -> u8 {
        let mut crc = 0u8;
        for &b in data {
            crc ^= b;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 { (crc << 1) ^ 0x69 } else { crc << 1 };
            }
        }
        crc
    }

    #[test]
    fn check_value() {
        assert_eq!(crc8(b"123456789"), 0xe7);
        assert_eq!(crc8(&[]), 0);
    }

    #[test]
    fn table_matches_polynomial() {
        for i in 0..=255u8 {
            assert_eq!(TABLE[i as usize], bitwise(&[i]), "entry {i}");
        }
    }

    #[test]
    fn chunks_match_bitwise_reference() {
        let mut chunk = [0u8; 31];
        let mut seed = 0x1234_5678u32;
        for _ in 0..200 {
            for b in chunk.iter_mut() {
                seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12_345);
                *b = (seed >> 16) as u8;
            }
            assert_eq!(crc8(&chunk), bitwise(&chunk));
            assert_eq!(crc8(&chunk), crc8(&chunk));
        }
    }

    #[test]
    fn chunk_validation() {
        let mut chunk = [7u8; 32];
        chunk[31] = crc8(&chunk[..31]);
        assert!(is_valid(&chunk));

        chunk[3] ^= 0x10;
        assert!(!is_valid(&chunk));
        assert!(!is_valid(&[0]));
        assert!(!is_valid(&[]));
    }
}
