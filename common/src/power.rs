use crate::types::PowerReading;

pub const INA260_ADDR: u8 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRegister {
    Current,
    BusVoltage,
    Power,
}

impl PowerRegister {
    pub fn address(self) -> u8 {
        match self {
            Self::Current => 0x01,
            Self::BusVoltage => 0x02,
            Self::Power => 0x03,
        }
    }

    /// Converts a raw register word into amps, volts or watts.
    pub fn scale(self, raw: u16) -> f32 {
        match self {
            Self::Current => raw as f32 * 1.25 / 1000.0,
            Self::BusVoltage => raw as f32 * 1.25 / 1000.0,
            Self::Power => raw as f32 * 10.0 / 1000.0,
        }
    }
}

pub fn word_from_be(bytes: [u8; 2]) -> u16 {
    u16::from_be_bytes(bytes)
}

pub fn reading_from_raw(current: u16, voltage: u16, power: u16) -> PowerReading {
    PowerReading {
        volts: PowerRegister::BusVoltage.scale(voltage),
        amps: PowerRegister::Current.scale(current),
        watts: PowerRegister::Power.scale(power),
    }
}

impl PowerReading {
    pub fn display_line(&self) -> String {
        format!("V:{:.2}V I:{:.2}A P:{:.2}W", self.volts, self.amps, self.watts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_registers() {
        assert_eq!(PowerRegister::BusVoltage.scale(9_600), 12.0);
        assert_eq!(PowerRegister::Current.scale(800), 1.0);
        assert_eq!(PowerRegister::Power.scale(1_200), 12.0);
    }

    #[test]
    fn words_are_big_endian() {
        assert_eq!(word_from_be([0x25, 0x80]), 9_600);
    }

    #[test]
    fn formats_display_line() {
        let reading = reading_from_raw(800, 9_600, 1_200);
        assert_eq!(reading.display_line(), "V:12.00V I:1.00A P:12.00W");
    }
}
