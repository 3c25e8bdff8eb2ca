//! DS18B20 one-wire probe protocol: commands and scratchpad decoding.

pub const CMD_SKIP_ROM: u8 = 0xCC;
pub const CMD_CONVERT_T: u8 = 0x44;
pub const CMD_READ_SCRATCHPAD: u8 = 0xBE;

pub const SCRATCHPAD_LEN: usize = 9;

/// Power-on value of the temperature register, reported before the first conversion.
const POWER_ON_RAW: i16 = 0x0550;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchpadError {
    /// Every bit read back high: nothing pulled the line.
    Absent,
    Crc { expected: u8, actual: u8 },
    NotConverted,
}

/// Dallas/Maxim CRC-8 (x^8 + x^5 + x^4 + 1), LSB first.
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc = 0_u8;
    for &byte in bytes {
        let mut byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
    }
    crc
}

/// Decodes a 12-bit scratchpad into degrees Celsius.
pub fn decode_scratchpad(pad: &[u8; SCRATCHPAD_LEN]) -> Result<f32, ScratchpadError> {
    if pad.iter().all(|byte| *byte == 0xFF) {
        return Err(ScratchpadError::Absent);
    }
    let actual = crc8(&pad[..8]);
    if actual != pad[8] {
        return Err(ScratchpadError::Crc {
            expected: pad[8],
            actual,
        });
    }

    let raw = i16::from_le_bytes([pad[0], pad[1]]);
    if raw == POWER_ON_RAW {
        return Err(ScratchpadError::NotConverted);
    }
    Ok(raw as f32 / 16.0)
}
