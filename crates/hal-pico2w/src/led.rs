//! Status LED control
//!
//! The Pico 2 W LED sits behind the CYW43439 (radio GPIO 0); the lifecycle
//! worker picks a pattern per state, a small task renders it.

/// LED pattern for status indication
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LedPattern {
    /// Solid off (sleeping)
    Off,
    /// Solid on (mode running)
    On,
    /// Slow blink (waiting for config or network)
    SlowBlink,
    /// Fast blink (booting, pairing)
    FastBlink,
    /// Error pattern (double flash)
    Error,
}

impl LedPattern {
    /// Whether the LED is lit at `elapsed_ms` into the pattern cycle
    pub fn is_on(&self, elapsed_ms: u64) -> bool {
        match self {
            Self::Off => false,
            Self::On => true,
            Self::SlowBlink => elapsed_ms % 2000 < 1000,
            Self::FastBlink => elapsed_ms % 250 < 125,
            Self::Error => matches!(elapsed_ms % 1000, 0..=99 | 200..=299),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blink_duty_cycles() {
        assert!(LedPattern::SlowBlink.is_on(500));
        assert!(!LedPattern::SlowBlink.is_on(1500));
        assert!(LedPattern::FastBlink.is_on(0));
        assert!(!LedPattern::FastBlink.is_on(130));
        assert!(LedPattern::On.is_on(123_456));
        assert!(!LedPattern::Off.is_on(0));
    }

    #[test]
    fn test_error_double_flash() {
        assert!(LedPattern::Error.is_on(50));
        assert!(!LedPattern::Error.is_on(150));
        assert!(LedPattern::Error.is_on(250));
        assert!(!LedPattern::Error.is_on(600));
    }
}
