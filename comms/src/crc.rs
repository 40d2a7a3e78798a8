//! # Link Checksums
//!
//! Both checksums are table driven; the tables are built at compile time.
//!
//! - **CRC-8**: reflected polynomial 0xD9, seed 0xFF, no final XOR (variant A
//!   frames and the persisted config record)
//! - **CRC-16**: CCITT polynomial 0x1021, MSB first, seed 0xFFFF, ones'
//!   complement output (variant B frames). Running it over data plus the
//!   big-endian CRC always yields [`CRC16_RESIDUAL`].

/// Value of [`crc16`] over a frame that still carries its own valid CRC
pub const CRC16_RESIDUAL: u16 = 0xE2F0;

const CRC8_SEED: u8 = 0xFF;
const CRC16_SEED: u16 = 0xFFFF;

static CRC8_TABLE: [u8; 256] = crc8_table();
static CRC16_TABLE: [u16; 256] = crc16_table();

const fn crc8_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x01 != 0 { (crc >> 1) ^ 0xD9 } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

const fn crc16_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ 0x1021 } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// CRC-8 over `data`
pub fn crc8(data: &[u8]) -> u8 {
    data.iter()
        .fold(CRC8_SEED, |crc, byte| CRC8_TABLE[(crc ^ byte) as usize])
}

/// CRC-16-CCITT over `data`, complemented
pub fn crc16(data: &[u8]) -> u16 {
    !data.iter().fold(CRC16_SEED, |crc, byte| {
        (crc << 8) ^ CRC16_TABLE[((crc >> 8) as u8 ^ byte) as usize]
    })
}

/// True if the last byte of `data` is the CRC-8 of the rest
pub fn crc8_verify(data: &[u8]) -> bool {
    match data.split_last() {
        Some((crc, body)) => crc8(body) == *crc,
        None => false,
    }
}

/// True if `data` ends in a valid big-endian CRC-16
pub fn crc16_verify(data: &[u8]) -> bool {
    data.len() >= 2 && crc16(data) == CRC16_RESIDUAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc8_vectors() {
        assert_eq!(crc8(&[0x12, 0x03]), 0x18);
        assert_eq!(crc8(&[0x22, 0x03]), 0x0F);
        assert_eq!(crc8(&[0x33, 0x00, 0x01]), 0x3D);
        assert_eq!(crc8(&[0x41]), 0xBB);
        assert_eq!(crc8(&[0x31]), 0x15);
    }

    #[test]
    fn test_crc16_vectors() {
        assert_eq!(crc16(&[0x20, 0x03, 0x03]), 0xD095);
        assert_eq!(crc16(&[0x40, 0x02]), 0xCF7E);
        assert_eq!(crc16(&[0x30, 0x02]), 0xC727);
    }

    #[test]
    fn test_crc16_residual() {
        let frame = [0x80, 0x05, 0x01, 0x00, 0x21, 0x73, 0x15];
        assert_eq!(crc16(&frame), CRC16_RESIDUAL);
        assert!(crc16_verify(&frame));
    }

    #[test]
    fn test_single_bit_flips_detected() {
        let mut frame = [0x20, 0x03, 0x03, 0xD0, 0x95];
        assert!(crc16_verify(&frame));
        for n in 0..frame.len() * 8 {
            frame[n / 8] ^= 1 << (n % 8);
            assert!(!crc16_verify(&frame), "bit {} not detected", n);
            frame[n / 8] ^= 1 << (n % 8);
        }

        let mut frame = [0x22, 0x03, 0x0F];
        assert!(crc8_verify(&frame));
        for n in 0..frame.len() * 8 {
            frame[n / 8] ^= 1 << (n % 8);
            assert!(!crc8_verify(&frame), "bit {} not detected", n);
            frame[n / 8] ^= 1 << (n % 8);
        }
    }

    #[test]
    fn test_verify_rejects_short_input() {
        assert!(!crc8_verify(&[]));
        assert!(!crc16_verify(&[0xFF]));
    }
}
