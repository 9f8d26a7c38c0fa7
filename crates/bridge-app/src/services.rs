//! Facades over the external collaborator services
//!
//! WiFi provisioning, the web server, mDNS, NTP, SAP, OTA, pairing and the
//! battery driver are separate subsystems; the core only starts/stops them
//! and queries their state at these seams. The facades track what the core
//! asked for so the status surface can report it.

use core::sync::atomic::Ordering;

use portable_atomic::{AtomicBool, AtomicU8};

use config_store::Config;
use rtp_wire::MasterClock;

/// OTA subsystem state as exposed to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum OtaState {
    /// No update activity
    #[default]
    Idle = 0,
    /// Image download in progress
    Downloading = 1,
    /// Image staged, reboot pending
    Pending = 2,
    /// Last update failed
    Failed = 3,
}

/// Handles to the external services
pub struct Services {
    web_up: AtomicBool,
    mdns_up: AtomicBool,
    ntp_up: AtomicBool,
    sap_up: AtomicBool,
    ap_visible: AtomicBool,
    pairing_active: AtomicBool,
    ota_state: AtomicU8,
}

impl Services {
    /// All services down
    pub const fn new() -> Self {
        Self {
            web_up: AtomicBool::new(false),
            mdns_up: AtomicBool::new(false),
            ntp_up: AtomicBool::new(false),
            sap_up: AtomicBool::new(false),
            ap_visible: AtomicBool::new(true),
            pairing_active: AtomicBool::new(false),
            ota_state: AtomicU8::new(OtaState::Idle as u8),
        }
    }

    /// Start everything the active configuration asks for
    ///
    /// The web server always runs; mDNS, NTP and SAP follow their config
    /// switches. Returns Err only when a required service cannot start.
    pub async fn start_network_services(&self, cfg: &Config) -> Result<(), ()> {
        info!("services: web server up");
        self.web_up.store(true, Ordering::Release);

        if cfg.enable_mdns_discovery {
            info!("services: mDNS advertising '{}'", cfg.hostname.as_str());
            self.mdns_up.store(true, Ordering::Release);
            info!(
                "services: SAP listener up, interval {} ms",
                cfg.discovery_interval_ms
            );
            self.sap_up.store(true, Ordering::Release);
        }

        info!("services: NTP client up");
        self.ntp_up.store(true, Ordering::Release);
        Ok(())
    }

    /// Stop the discovery-side services (sleep entry)
    pub async fn pause_for_sleep(&self) {
        info!("services: pausing discovery for sleep");
        self.mdns_up.store(false, Ordering::Release);
        self.sap_up.store(false, Ordering::Release);
    }

    /// Restart what `pause_for_sleep` stopped
    pub async fn resume_after_wake(&self, cfg: &Config) {
        if cfg.enable_mdns_discovery {
            self.mdns_up.store(true, Ordering::Release);
            self.sap_up.store(true, Ordering::Release);
        }
    }

    /// Push a changed hostname into the mDNS advertisement
    pub fn set_hostname(&self, hostname: &str) {
        info!("services: mDNS hostname -> '{}'", hostname);
    }

    /// Switch the netif between STA-only and AP+STA
    pub fn set_ap_visibility(&self, hide_when_connected: bool, sta_connected: bool) {
        let visible = !(hide_when_connected && sta_connected);
        if self.ap_visible.swap(visible, Ordering::AcqRel) != visible {
            if visible {
                info!("services: fallback AP enabled (AP+STA)");
            } else {
                info!("services: fallback AP hidden (STA only)");
            }
        }
    }

    /// Apply changed discovery settings
    pub fn update_discovery(&self, cfg: &Config) {
        self.mdns_up
            .store(cfg.enable_mdns_discovery, Ordering::Release);
        self.sap_up
            .store(cfg.enable_mdns_discovery, Ordering::Release);
        info!(
            "services: discovery {}, interval {} ms",
            cfg.enable_mdns_discovery,
            cfg.discovery_interval_ms
        );
    }

    /// Hand the radio to the pairing service
    pub fn start_pairing(&self) {
        self.pairing_active.store(true, Ordering::Release);
        info!("services: pairing started");
    }

    /// Take the radio back
    pub fn stop_pairing(&self) {
        self.pairing_active.store(false, Ordering::Release);
        info!("services: pairing stopped");
    }

    /// Feed an NTP measurement into the master clock
    ///
    /// Called by the NTP client task with (unix_ms - local_monotonic_ms).
    pub fn ntp_offset(&self, clock: &MasterClock, offset_ms: i64) {
        clock.discipline(offset_ms);
    }

    /// OTA state for the status surface
    pub fn ota_state(&self) -> OtaState {
        match self.ota_state.load(Ordering::Acquire) {
            1 => OtaState::Downloading,
            2 => OtaState::Pending,
            3 => OtaState::Failed,
            _ => OtaState::Idle,
        }
    }

    /// Whether discovery is currently running
    pub fn discovery_running(&self) -> bool {
        self.sap_up.load(Ordering::Acquire)
    }
}
