use core::fmt;
use std::time::Duration;

/// Factory default for STS/SMS servos.
pub const DEFAULT_BAUD_RATE: u32 = 1_000_000;

/// Time on the wire for one byte (8N1 framing, 10 bit times).
pub fn byte_time(baud_rate: u32) -> Duration {
    if baud_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(10_000_000_000 / u64::from(baud_rate))
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PortInfo {
    pub name: String,
    pub driver: String,
}

impl fmt::Display for PortInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}", self.name, self.driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_time_at_one_megabaud_is_ten_micros() {
        assert_eq!(byte_time(1_000_000), Duration::from_micros(10));
        assert_eq!(byte_time(0), Duration::ZERO);
    }
}
