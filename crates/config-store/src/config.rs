//! The configuration structure and its validated setters

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Longest permitted hostname / stream-name string
pub const MAX_NAME_LEN: usize = 63;

/// Name-sized string (hostname, SAP stream name, AP SSID)
pub type NameString = heapless::String<MAX_NAME_LEN>;

/// Credential-sized string (AP password)
pub type SecretString = heapless::String<63>;

/// Sample rates the PCM path accepts (no resampling is performed)
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [44100, 48000, 96000];

/// Highest GPIO number accepted for the S/PDIF data pin
pub const MAX_SPDIF_PIN: u8 = 39;

/// IPv4 address as four octets
///
/// Kept as a plain newtype so the configuration crate stays free of any
/// network-stack dependency. Parses from and formats to dotted notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    /// The unspecified address 0.0.0.0
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);

    /// Create from four octets
    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    /// Get the address octets
    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }

    /// Last octet (used for the multicast SSRC filter derivation)
    pub const fn last_octet(&self) -> u8 {
        self.0[3]
    }

    /// True for 224.0.0.0/4
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0xF0 == 0xE0
    }

    /// True for 0.0.0.0
    pub const fn is_unspecified(&self) -> bool {
        self.0[0] == 0 && self.0[1] == 0 && self.0[2] == 0 && self.0[3] == 0
    }

    /// Parse dotted notation ("192.168.4.20")
    pub fn parse(s: &str) -> Option<Self> {
        let mut octets = [0u8; 4];
        let mut parts = s.split('.');
        for octet in octets.iter_mut() {
            *octet = parts.next()?.parse().ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(octets))
    }
}

impl fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// The four runtime roles of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum DeviceMode {
    /// Network to USB DAC playback
    ReceiverUsb = 0,
    /// Network to S/PDIF playback
    #[default]
    ReceiverSpdif = 1,
    /// USB sound-card capture to network
    SenderUsb = 2,
    /// S/PDIF capture to network
    SenderSpdif = 3,
}

impl DeviceMode {
    /// Decode the persisted u8 representation
    pub const fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Self::ReceiverUsb),
            1 => Some(Self::ReceiverSpdif),
            2 => Some(Self::SenderUsb),
            3 => Some(Self::SenderSpdif),
            _ => None,
        }
    }

    /// Persisted representation
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// True for the two playback roles
    pub const fn is_receiver(self) -> bool {
        matches!(self, Self::ReceiverUsb | Self::ReceiverSpdif)
    }

    /// True for the two capture roles
    pub const fn is_sender(self) -> bool {
        !self.is_receiver()
    }

    /// True when the role touches the USB audio path
    pub const fn uses_usb(self) -> bool {
        matches!(self, Self::ReceiverUsb | Self::SenderUsb)
    }

    /// Derive a mode from the legacy sender flags of older firmware images
    ///
    /// Both flags false means the image predates sender support; fall back
    /// to the default receiver role.
    pub const fn from_legacy_flags(usb_sender: bool, spdif_sender: bool) -> Self {
        match (usb_sender, spdif_sender) {
            (true, _) => Self::SenderUsb,
            (false, true) => Self::SenderSpdif,
            (false, false) => Self::ReceiverSpdif,
        }
    }
}

/// Complete device configuration
///
/// All fields are kept valid at all times: mutation goes through the
/// validated setters, which clamp or reject and keep the legacy sender
/// flags consistent with `device_mode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Local UDP port for RTP ingress
    pub port: u16,
    /// Device name advertised via mDNS
    pub hostname: NameString,
    /// Authoritative runtime role
    pub device_mode: DeviceMode,
    /// PCM sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample, fixed at 16 in this firmware generation
    pub bit_depth: u8,
    /// Software gain for the USB sink, stored as integer percent 0..=100
    pub volume_percent: u8,
    /// Jitter buffer fill line at mode start, in chunks
    pub initial_buffer_size: u8,
    /// Chunks added to the fill line per underrun
    pub buffer_grow_step_size: u8,
    /// Ring capacity in chunks
    pub max_buffer_size: u8,
    /// Ceiling the fill line may grow to
    pub max_grow_size: u8,
    /// GPIO carrying the S/PDIF output
    pub spdif_data_pin: u8,
    /// Continuous silence before the device sleeps
    pub silence_threshold_ms: u32,
    /// Network poll period while sleeping
    pub network_check_interval_ms: u32,
    /// Idle time after which a sleeping check gives up a wake attempt
    pub network_inactivity_timeout_ms: u32,
    /// Inbound packets during one check that trigger a wake
    pub activity_threshold_packets: u8,
    /// Peak sample magnitude below which sender capture counts as silent
    pub silence_amplitude_threshold: u16,
    /// RTP egress destination
    pub sender_destination_ip: Ipv4Address,
    /// RTP egress destination port
    pub sender_destination_port: u16,
    /// Fallback access-point SSID
    pub ap_ssid: NameString,
    /// Fallback access-point password
    pub ap_password: SecretString,
    /// Drop the fallback AP once a station link is up
    pub hide_ap_when_connected: bool,
    /// Write full chunks to the sink with an unbounded timeout
    pub use_direct_write: bool,
    /// Announce and browse via mDNS
    pub enable_mdns_discovery: bool,
    /// Adopt the first SAP stream found without a name match
    pub auto_select_best_device: bool,
    /// First-run wizard finished; mode config is authoritative
    pub setup_wizard_completed: bool,
    /// SAP/mDNS browse period
    pub discovery_interval_ms: u32,
    /// SAP stream to adopt when auto-select is off
    pub sap_stream_name: NameString,
    /// Legacy flag kept consistent with `device_mode`
    pub enable_usb_sender: bool,
    /// Legacy flag kept consistent with `device_mode`
    pub enable_spdif_sender: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            hostname: name_str("rtp-bridge"),
            device_mode: DeviceMode::ReceiverSpdif,
            sample_rate: 48000,
            bit_depth: 16,
            volume_percent: 100,
            initial_buffer_size: 4,
            buffer_grow_step_size: 1,
            max_buffer_size: 16,
            max_grow_size: 12,
            spdif_data_pin: 15,
            silence_threshold_ms: 10_000,
            network_check_interval_ms: 1000,
            network_inactivity_timeout_ms: 5000,
            activity_threshold_packets: 3,
            silence_amplitude_threshold: 16,
            sender_destination_ip: Ipv4Address::UNSPECIFIED,
            sender_destination_port: 4010,
            ap_ssid: name_str("rtp-bridge-setup"),
            ap_password: name_str("audio-bridge"),
            hide_ap_when_connected: true,
            use_direct_write: true,
            enable_mdns_discovery: true,
            auto_select_best_device: false,
            setup_wizard_completed: false,
            discovery_interval_ms: 30_000,
            sap_stream_name: NameString::new(),
            enable_usb_sender: false,
            enable_spdif_sender: false,
        }
    }
}

fn name_str(s: &str) -> NameString {
    let mut out = NameString::new();
    // Callers only pass compile-time defaults that fit.
    let _ = out.push_str(s);
    out
}

impl Config {
    /// Volume as the 0.0..=1.0 float the control plane exposes
    pub fn volume(&self) -> f32 {
        f32::from(self.volume_percent) / 100.0
    }

    /// Set the software volume, clamped to [0.0, 1.0]
    pub fn set_volume(&mut self, volume: f32) {
        let clamped = volume.clamp(0.0, 1.0);
        self.volume_percent = (clamped * 100.0 + 0.5) as u8;
    }

    /// Set the device mode and force the legacy flags consistent
    pub fn set_device_mode(&mut self, mode: DeviceMode) {
        self.device_mode = mode;
        self.enable_usb_sender = mode == DeviceMode::SenderUsb;
        self.enable_spdif_sender = mode == DeviceMode::SenderSpdif;
    }

    /// Legacy setter: flips `device_mode` to match, never leaves the pair
    /// inconsistent
    pub fn set_enable_usb_sender(&mut self, enabled: bool) {
        if enabled {
            self.set_device_mode(DeviceMode::SenderUsb);
        } else if self.device_mode == DeviceMode::SenderUsb {
            self.set_device_mode(DeviceMode::default());
        }
    }

    /// Legacy setter, S/PDIF side
    pub fn set_enable_spdif_sender(&mut self, enabled: bool) {
        if enabled {
            self.set_device_mode(DeviceMode::SenderSpdif);
        } else if self.device_mode == DeviceMode::SenderSpdif {
            self.set_device_mode(DeviceMode::default());
        }
    }

    /// Set the RTP ingress port; the ephemeral range is allowed, zero is not
    pub fn set_port(&mut self, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidValue);
        }
        self.port = port;
        Ok(())
    }

    /// Set the mDNS hostname
    pub fn set_hostname(&mut self, name: &str) -> Result<(), ConfigError> {
        if name.is_empty() {
            return Err(ConfigError::InvalidValue);
        }
        self.hostname = NameString::try_from(name).map_err(|_| ConfigError::StringTooLong)?;
        Ok(())
    }

    /// Set the PCM sample rate; only rates the hardware clocks support
    pub fn set_sample_rate(&mut self, rate: u32) -> Result<(), ConfigError> {
        if !SUPPORTED_SAMPLE_RATES.contains(&rate) {
            return Err(ConfigError::InvalidValue);
        }
        self.sample_rate = rate;
        Ok(())
    }

    /// Bit depth is fixed at 16 for this firmware generation
    pub fn set_bit_depth(&mut self, bits: u8) -> Result<(), ConfigError> {
        if bits != 16 {
            return Err(ConfigError::InvalidValue);
        }
        self.bit_depth = bits;
        Ok(())
    }

    /// Set the S/PDIF output pin, clamped to the valid GPIO range
    pub fn set_spdif_pin(&mut self, pin: u8) {
        self.spdif_data_pin = pin.min(MAX_SPDIF_PIN);
    }

    /// Set the jitter-buffer shaping parameters
    ///
    /// Zero capacity and a fill line above capacity are rejected; the grow
    /// ceiling is clamped into the capacity.
    pub fn set_buffer_shape(
        &mut self,
        initial: u8,
        grow_step: u8,
        max_size: u8,
        max_grow: u8,
    ) -> Result<(), ConfigError> {
        if max_size == 0 || initial == 0 || initial > max_size {
            return Err(ConfigError::InvalidValue);
        }
        self.initial_buffer_size = initial;
        self.buffer_grow_step_size = grow_step;
        self.max_buffer_size = max_size;
        self.max_grow_size = max_grow.clamp(initial, max_size);
        Ok(())
    }

    /// Set the egress destination
    pub fn set_destination(&mut self, ip: Ipv4Address, port: u16) -> Result<(), ConfigError> {
        if port == 0 {
            return Err(ConfigError::InvalidValue);
        }
        self.sender_destination_ip = ip;
        self.sender_destination_port = port;
        Ok(())
    }

    /// Set the SAP stream to adopt
    pub fn set_sap_stream_name(&mut self, name: &str) -> Result<(), ConfigError> {
        self.sap_stream_name =
            NameString::try_from(name).map_err(|_| ConfigError::StringTooLong)?;
        Ok(())
    }

    /// Set the fallback AP credentials
    pub fn set_ap_credentials(&mut self, ssid: &str, password: &str) -> Result<(), ConfigError> {
        if ssid.is_empty() {
            return Err(ConfigError::InvalidValue);
        }
        self.ap_ssid = NameString::try_from(ssid).map_err(|_| ConfigError::StringTooLong)?;
        self.ap_password =
            SecretString::try_from(password).map_err(|_| ConfigError::StringTooLong)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let cfg = Config::default();
        assert_eq!(cfg.device_mode, DeviceMode::ReceiverSpdif);
        assert!(!cfg.enable_usb_sender);
        assert!(!cfg.enable_spdif_sender);
        assert_eq!(cfg.bit_depth, 16);
        assert!(cfg.initial_buffer_size <= cfg.max_buffer_size);
    }

    #[test]
    fn test_mode_forces_legacy_flags() {
        let mut cfg = Config::default();

        cfg.set_device_mode(DeviceMode::SenderUsb);
        assert!(cfg.enable_usb_sender);
        assert!(!cfg.enable_spdif_sender);

        cfg.set_device_mode(DeviceMode::SenderSpdif);
        assert!(!cfg.enable_usb_sender);
        assert!(cfg.enable_spdif_sender);

        cfg.set_device_mode(DeviceMode::ReceiverUsb);
        assert!(!cfg.enable_usb_sender);
        assert!(!cfg.enable_spdif_sender);

        cfg.set_device_mode(DeviceMode::ReceiverSpdif);
        assert!(!cfg.enable_usb_sender);
        assert!(!cfg.enable_spdif_sender);
    }

    #[test]
    fn test_legacy_flags_force_mode() {
        let mut cfg = Config::default();

        cfg.set_enable_usb_sender(true);
        assert_eq!(cfg.device_mode, DeviceMode::SenderUsb);
        assert!(!cfg.enable_spdif_sender);

        cfg.set_enable_spdif_sender(true);
        assert_eq!(cfg.device_mode, DeviceMode::SenderSpdif);
        assert!(!cfg.enable_usb_sender);

        cfg.set_enable_spdif_sender(false);
        assert_eq!(cfg.device_mode, DeviceMode::ReceiverSpdif);
    }

    #[test]
    fn test_volume_clamping() {
        let mut cfg = Config::default();

        cfg.set_volume(-0.1);
        assert_eq!(cfg.volume_percent, 0);

        cfg.set_volume(1.5);
        assert_eq!(cfg.volume_percent, 100);

        cfg.set_volume(0.8);
        assert_eq!(cfg.volume_percent, 80);
    }

    #[test]
    fn test_spdif_pin_clamping() {
        let mut cfg = Config::default();
        cfg.set_spdif_pin(200);
        assert_eq!(cfg.spdif_data_pin, MAX_SPDIF_PIN);

        cfg.set_spdif_pin(27);
        assert_eq!(cfg.spdif_data_pin, 27);
    }

    #[test]
    fn test_sample_rate_validation() {
        let mut cfg = Config::default();
        assert!(cfg.set_sample_rate(44100).is_ok());
        assert!(cfg.set_sample_rate(12345).is_err());
        assert_eq!(cfg.sample_rate, 44100);
    }

    #[test]
    fn test_buffer_shape_validation() {
        let mut cfg = Config::default();
        assert!(cfg.set_buffer_shape(0, 1, 16, 12).is_err());
        assert!(cfg.set_buffer_shape(20, 1, 16, 12).is_err());

        assert!(cfg.set_buffer_shape(2, 2, 8, 32).is_ok());
        assert_eq!(cfg.max_grow_size, 8); // clamped into capacity
    }

    #[test]
    fn test_ipv4_parse_and_classify() {
        let ip = Ipv4Address::parse("239.255.77.77").unwrap();
        assert!(ip.is_multicast());
        assert_eq!(ip.last_octet(), 77);

        let ip = Ipv4Address::parse("192.168.4.20").unwrap();
        assert!(!ip.is_multicast());

        assert!(Ipv4Address::parse("1.2.3").is_none());
        assert!(Ipv4Address::parse("1.2.3.4.5").is_none());
        assert!(Ipv4Address::parse("1.2.3.256").is_none());
    }

    #[test]
    fn test_legacy_migration() {
        assert_eq!(
            DeviceMode::from_legacy_flags(true, false),
            DeviceMode::SenderUsb
        );
        assert_eq!(
            DeviceMode::from_legacy_flags(false, true),
            DeviceMode::SenderSpdif
        );
        assert_eq!(
            DeviceMode::from_legacy_flags(false, false),
            DeviceMode::ReceiverSpdif
        );
    }
}
