use std::{fmt, str::FromStr, time::Duration};

use super::{ProtoError, Result};

/// Default read and write timeout of a channel.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    #[default]
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    #[default]
    One,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    Seven,
    #[default]
    Eight,
}

/// Byte-level settings of a serial link. Fixed for the lifetime of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingConfig {
    pub bit_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub data_bits: DataBits,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            bit_rate: crate::DEFAULT_BAUDRATE,
            parity: Parity::None,
            stop_bits: StopBits::One,
            data_bits: DataBits::Eight,
            read_timeout: DEFAULT_IO_TIMEOUT,
            write_timeout: DEFAULT_IO_TIMEOUT,
        }
    }
}

impl FramingConfig {
    pub fn with_bit_rate(self, bit_rate: u32) -> Self {
        Self { bit_rate, ..self }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bit_rate == 0 {
            return Err(ProtoError::InvalidFraming("bit rate must be positive".into()));
        }
        if self.read_timeout.is_zero() || self.write_timeout.is_zero() {
            return Err(ProtoError::InvalidFraming("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}

impl fmt::Display for FramingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Even => 'E',
            Parity::Odd => 'O',
        };
        write!(f, "{} {}{}{}", self.bit_rate, self.data_bits, parity, self.stop_bits)
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parity::None => f.write_str("none"),
            Parity::Even => f.write_str("even"),
            Parity::Odd => f.write_str("odd"),
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopBits::One => f.write_str("1"),
            StopBits::Two => f.write_str("2"),
        }
    }
}

impl fmt::Display for DataBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataBits::Seven => f.write_str("7"),
            DataBits::Eight => f.write_str("8"),
        }
    }
}

impl FromStr for Parity {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Parity::None),
            "even" | "e" => Ok(Parity::Even),
            "odd" | "o" => Ok(Parity::Odd),
            _ => Err(format!("Invalid parity: {}", s)),
        }
    }
}

impl FromStr for StopBits {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "1" => Ok(StopBits::One),
            "2" => Ok(StopBits::Two),
            _ => Err(format!("Invalid stop bits: {}", s)),
        }
    }
}

impl FromStr for DataBits {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "7" => Ok(DataBits::Seven),
            "8" => Ok(DataBits::Eight),
            _ => Err(format!("Invalid byte size: {}", s)),
        }
    }
}

impl From<Parity> for tokio_serial::Parity {
    fn from(value: Parity) -> Self {
        match value {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        }
    }
}

impl From<StopBits> for tokio_serial::StopBits {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => tokio_serial::StopBits::One,
            StopBits::Two => tokio_serial::StopBits::Two,
        }
    }
}

impl From<DataBits> for tokio_serial::DataBits {
    fn from(value: DataBits) -> Self {
        match value {
            DataBits::Seven => tokio_serial::DataBits::Seven,
            DataBits::Eight => tokio_serial::DataBits::Eight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_8n1() {
        let framing = FramingConfig::default();
        assert_eq!(framing.to_string(), "9600 8N1");
        assert_eq!(framing.read_timeout, Duration::from_secs(1));
        assert_eq!(framing.write_timeout, Duration::from_secs(1));
        assert!(framing.validate().is_ok());
    }

    #[test]
    fn bit_rate_override_keeps_rest() {
        let framing = FramingConfig {
            parity: Parity::Even,
            data_bits: DataBits::Seven,
            ..FramingConfig::default()
        }
        .with_bit_rate(115200);
        assert_eq!(framing.to_string(), "115200 7E1");
    }

    #[test]
    fn zero_bit_rate_rejected() {
        let framing = FramingConfig::default().with_bit_rate(0);
        assert!(matches!(framing.validate(), Err(ProtoError::InvalidFraming(_))));
    }

    #[test]
    fn parse_settings() {
        assert_eq!("Odd".parse::<Parity>().unwrap(), Parity::Odd);
        assert_eq!("2".parse::<StopBits>().unwrap(), StopBits::Two);
        assert_eq!("7".parse::<DataBits>().unwrap(), DataBits::Seven);
        assert!("9".parse::<DataBits>().is_err());
        assert!("mark".parse::<Parity>().is_err());
    }
}
