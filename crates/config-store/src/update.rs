//! Batch configuration updates
//!
//! The web control plane collects any subset of options into one
//! [`ConfigUpdate`] and applies it with a single persistent commit.

use crate::config::{DeviceMode, Ipv4Address};
use crate::{Config, ConfigError};

/// Present/value pairs for a batch update
///
/// `None` leaves the option untouched. String options are borrowed from the
/// request buffer; validation happens field by field when the batch is
/// applied, and a failing field rejects the whole batch before anything is
/// committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfigUpdate<'a> {
    pub port: Option<u16>,
    pub hostname: Option<&'a str>,
    pub device_mode: Option<DeviceMode>,
    pub sample_rate: Option<u32>,
    pub bit_depth: Option<u8>,
    pub volume: Option<f32>,
    pub initial_buffer_size: Option<u8>,
    pub buffer_grow_step_size: Option<u8>,
    pub max_buffer_size: Option<u8>,
    pub max_grow_size: Option<u8>,
    pub spdif_data_pin: Option<u8>,
    pub silence_threshold_ms: Option<u32>,
    pub network_check_interval_ms: Option<u32>,
    pub network_inactivity_timeout_ms: Option<u32>,
    pub activity_threshold_packets: Option<u8>,
    pub silence_amplitude_threshold: Option<u16>,
    pub sender_destination_ip: Option<Ipv4Address>,
    pub sender_destination_port: Option<u16>,
    pub ap_ssid: Option<&'a str>,
    pub ap_password: Option<&'a str>,
    pub hide_ap_when_connected: Option<bool>,
    pub use_direct_write: Option<bool>,
    pub enable_mdns_discovery: Option<bool>,
    pub auto_select_best_device: Option<bool>,
    pub setup_wizard_completed: Option<bool>,
    pub discovery_interval_ms: Option<u32>,
    pub sap_stream_name: Option<&'a str>,
    pub enable_usb_sender: Option<bool>,
    pub enable_spdif_sender: Option<bool>,
}

impl ConfigUpdate<'_> {
    /// Apply every present option to `cfg`, validating as the setters do
    pub fn apply(&self, cfg: &mut Config) -> Result<(), ConfigError> {
        if let Some(v) = self.port {
            cfg.set_port(v)?;
        }
        if let Some(v) = self.hostname {
            cfg.set_hostname(v)?;
        }
        // Legacy flags first so an explicit mode in the same batch wins.
        if let Some(v) = self.enable_usb_sender {
            cfg.set_enable_usb_sender(v);
        }
        if let Some(v) = self.enable_spdif_sender {
            cfg.set_enable_spdif_sender(v);
        }
        if let Some(v) = self.device_mode {
            cfg.set_device_mode(v);
        }
        if let Some(v) = self.sample_rate {
            cfg.set_sample_rate(v)?;
        }
        if let Some(v) = self.bit_depth {
            cfg.set_bit_depth(v)?;
        }
        if let Some(v) = self.volume {
            cfg.set_volume(v);
        }
        if self.initial_buffer_size.is_some()
            || self.buffer_grow_step_size.is_some()
            || self.max_buffer_size.is_some()
            || self.max_grow_size.is_some()
        {
            cfg.set_buffer_shape(
                self.initial_buffer_size.unwrap_or(cfg.initial_buffer_size),
                self.buffer_grow_step_size
                    .unwrap_or(cfg.buffer_grow_step_size),
                self.max_buffer_size.unwrap_or(cfg.max_buffer_size),
                self.max_grow_size.unwrap_or(cfg.max_grow_size),
            )?;
        }
        if let Some(v) = self.spdif_data_pin {
            cfg.set_spdif_pin(v);
        }
        if let Some(v) = self.silence_threshold_ms {
            cfg.silence_threshold_ms = v;
        }
        if let Some(v) = self.network_check_interval_ms {
            cfg.network_check_interval_ms = v;
        }
        if let Some(v) = self.network_inactivity_timeout_ms {
            cfg.network_inactivity_timeout_ms = v;
        }
        if let Some(v) = self.activity_threshold_packets {
            cfg.activity_threshold_packets = v;
        }
        if let Some(v) = self.silence_amplitude_threshold {
            cfg.silence_amplitude_threshold = v;
        }
        if self.sender_destination_ip.is_some() || self.sender_destination_port.is_some() {
            cfg.set_destination(
                self.sender_destination_ip
                    .unwrap_or(cfg.sender_destination_ip),
                self.sender_destination_port
                    .unwrap_or(cfg.sender_destination_port),
            )?;
        }
        if self.ap_ssid.is_some() || self.ap_password.is_some() {
            let ssid = cfg.ap_ssid.clone();
            let password = cfg.ap_password.clone();
            cfg.set_ap_credentials(
                self.ap_ssid.unwrap_or(ssid.as_str()),
                self.ap_password.unwrap_or(password.as_str()),
            )?;
        }
        if let Some(v) = self.hide_ap_when_connected {
            cfg.hide_ap_when_connected = v;
        }
        if let Some(v) = self.use_direct_write {
            cfg.use_direct_write = v;
        }
        if let Some(v) = self.enable_mdns_discovery {
            cfg.enable_mdns_discovery = v;
        }
        if let Some(v) = self.auto_select_best_device {
            cfg.auto_select_best_device = v;
        }
        if let Some(v) = self.setup_wizard_completed {
            cfg.setup_wizard_completed = v;
        }
        if let Some(v) = self.discovery_interval_ms {
            cfg.discovery_interval_ms = v;
        }
        if let Some(v) = self.sap_stream_name {
            cfg.set_sap_stream_name(v)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_update_changes_nothing() {
        let update = ConfigUpdate::default();
        let mut cfg = Config::default();
        update.apply(&mut cfg).unwrap();
        assert_eq!(cfg, Config::default());
    }

    #[test]
    fn test_partial_buffer_shape_merges_with_current() {
        let mut cfg = Config::default();
        let update = ConfigUpdate {
            max_buffer_size: Some(8),
            ..Default::default()
        };
        update.apply(&mut cfg).unwrap();
        assert_eq!(cfg.max_buffer_size, 8);
        assert_eq!(cfg.initial_buffer_size, Config::default().initial_buffer_size);
        // Ceiling follows the capacity down.
        assert_eq!(cfg.max_grow_size, 8);
    }

    #[test]
    fn test_invalid_field_rejects_batch() {
        let mut cfg = Config::default();
        let update = ConfigUpdate {
            port: Some(0),
            volume: Some(0.2),
            ..Default::default()
        };
        assert!(update.apply(&mut cfg).is_err());
    }

    #[test]
    fn test_explicit_mode_wins_over_legacy_flags() {
        let mut cfg = Config::default();
        let update = ConfigUpdate {
            enable_usb_sender: Some(true),
            device_mode: Some(DeviceMode::ReceiverUsb),
            ..Default::default()
        };
        update.apply(&mut cfg).unwrap();
        assert_eq!(cfg.device_mode, DeviceMode::ReceiverUsb);
        assert!(!cfg.enable_usb_sender);
        assert!(!cfg.enable_spdif_sender);
    }
}
