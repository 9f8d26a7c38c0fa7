//! Field-group delta detection between two configuration snapshots
//!
//! The lifecycle controller keeps a private snapshot of the configuration
//! and, on every `ConfigurationChanged` event, diffs the live values against
//! it to decide between in-place reconfiguration and a mode restart. The
//! diff is grouped by the action each change requires, not by raw field.

use crate::Config;

/// Which groups of options changed between two snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConfigDelta {
    /// RTP ingress port: reopen the unicast socket
    pub port: bool,
    /// Hostname: refresh the mDNS advertisement
    pub hostname: bool,
    /// Device mode: stop the current mode, start the new one
    pub device_mode: bool,
    /// Sample rate: pause, reconfigure the sink, resume
    pub sample_rate: bool,
    /// Volume: apply to the USB sink immediately
    pub volume: bool,
    /// Any jitter-buffer shaping parameter: empty + re-read growth params
    pub buffer_shape: bool,
    /// S/PDIF data pin: reinitialize the bit-streamer at the new pin
    pub spdif_pin: bool,
    /// Egress destination: update in place while sending
    pub destination: bool,
    /// Sleep thresholds: refresh the values cached by the PCM pump
    pub sleep_policy: bool,
    /// Direct-write toggle for the pump
    pub pump_policy: bool,
    /// AP visibility while connected: switch STA-only vs AP+STA
    pub ap_visibility: bool,
    /// AP credentials: picked up at the next provisioning cycle
    pub ap_credentials: bool,
    /// Discovery knobs (mDNS enable, auto-select, interval, SAP name)
    pub discovery: bool,
    /// Wizard completion latch
    pub wizard: bool,
}

impl ConfigDelta {
    /// True when the two snapshots were identical
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Config {
    /// Diff `self` (the prior snapshot) against the new values
    pub fn diff(&self, new: &Config) -> ConfigDelta {
        ConfigDelta {
            port: self.port != new.port,
            hostname: self.hostname != new.hostname,
            device_mode: self.device_mode != new.device_mode,
            sample_rate: self.sample_rate != new.sample_rate,
            volume: self.volume_percent != new.volume_percent,
            buffer_shape: self.initial_buffer_size != new.initial_buffer_size
                || self.buffer_grow_step_size != new.buffer_grow_step_size
                || self.max_buffer_size != new.max_buffer_size
                || self.max_grow_size != new.max_grow_size,
            spdif_pin: self.spdif_data_pin != new.spdif_data_pin,
            destination: self.sender_destination_ip != new.sender_destination_ip
                || self.sender_destination_port != new.sender_destination_port,
            sleep_policy: self.silence_threshold_ms != new.silence_threshold_ms
                || self.network_check_interval_ms != new.network_check_interval_ms
                || self.network_inactivity_timeout_ms != new.network_inactivity_timeout_ms
                || self.activity_threshold_packets != new.activity_threshold_packets
                || self.silence_amplitude_threshold != new.silence_amplitude_threshold,
            pump_policy: self.use_direct_write != new.use_direct_write,
            ap_visibility: self.hide_ap_when_connected != new.hide_ap_when_connected,
            ap_credentials: self.ap_ssid != new.ap_ssid || self.ap_password != new.ap_password,
            discovery: self.enable_mdns_discovery != new.enable_mdns_discovery
                || self.auto_select_best_device != new.auto_select_best_device
                || self.discovery_interval_ms != new.discovery_interval_ms
                || self.sap_stream_name != new.sap_stream_name,
            wizard: self.setup_wizard_completed != new.setup_wizard_completed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{DeviceMode, Ipv4Address};

    #[test]
    fn test_identical_snapshots_diff_empty() {
        let cfg = Config::default();
        assert!(cfg.diff(&cfg.clone()).is_empty());
    }

    #[test]
    fn test_volume_change_is_isolated() {
        let old = Config::default();
        let mut new = old.clone();
        new.set_volume(0.8);

        let delta = old.diff(&new);
        assert!(delta.volume);
        assert!(!delta.device_mode);
        assert!(!delta.port);
        assert!(!delta.buffer_shape);
    }

    #[test]
    fn test_mode_change_drags_legacy_flags_only() {
        let old = Config::default();
        let mut new = old.clone();
        new.set_device_mode(DeviceMode::SenderSpdif);

        let delta = old.diff(&new);
        assert!(delta.device_mode);
        assert!(!delta.destination);
    }

    #[test]
    fn test_buffer_fields_collapse_to_one_group() {
        let old = Config::default();
        let mut new = old.clone();
        new.set_buffer_shape(2, 2, 8, 8).unwrap();

        let delta = old.diff(&new);
        assert!(delta.buffer_shape);
        assert!(!delta.sleep_policy);
    }

    #[test]
    fn test_destination_and_sleep_groups() {
        let old = Config::default();
        let mut new = old.clone();
        new.set_destination(Ipv4Address::new(10, 0, 0, 9), 4012).unwrap();
        new.silence_threshold_ms = 20_000;

        let delta = old.diff(&new);
        assert!(delta.destination);
        assert!(delta.sleep_policy);
        assert!(!delta.port);
    }
}
