//! CYW43439 station and fallback-AP helpers
//!
//! WiFi provisioning proper (captive portal, credential storage) is an
//! external collaborator; this module only drives the radio: join a
//! station network with bounded retries, or raise the fallback AP with the
//! configured credentials so the portal can take over.

use cyw43::{Control, JoinOptions};
use embassy_time::{Duration, Timer};

/// Join attempts before giving up on a network
const JOIN_ATTEMPTS: u32 = 4;

/// Delay between join attempts
const JOIN_RETRY_MS: u64 = 2000;

/// Fallback AP channel
const AP_CHANNEL: u8 = 6;

/// Station credentials handed over by the provisioning layer
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StationCredentials {
    /// Network SSID
    pub ssid: &'static str,
    /// WPA2 passphrase; empty joins open networks
    pub password: &'static str,
}

/// Join a station network, retrying a few times
pub async fn join_station(
    control: &mut Control<'_>,
    creds: &StationCredentials,
) -> Result<(), ()> {
    for attempt in 1..=JOIN_ATTEMPTS {
        let result = if creds.password.is_empty() {
            control.join(creds.ssid, JoinOptions::new_open()).await
        } else {
            control
                .join(creds.ssid, JoinOptions::new(creds.password.as_bytes()))
                .await
        };
        match result {
            Ok(()) => {
                #[cfg(feature = "defmt")]
                defmt::info!("wifi: joined '{}'", creds.ssid);
                return Ok(());
            }
            Err(_) => {
                #[cfg(feature = "defmt")]
                defmt::warn!(
                    "wifi: join '{}' failed (attempt {}/{})",
                    creds.ssid,
                    attempt,
                    JOIN_ATTEMPTS
                );
                Timer::after(Duration::from_millis(JOIN_RETRY_MS)).await;
            }
        }
    }
    Err(())
}

/// Raise the fallback access point for provisioning
pub async fn start_fallback_ap(control: &mut Control<'_>, ssid: &str, password: &str) {
    if password.is_empty() {
        control.start_ap_open(ssid, AP_CHANNEL).await;
    } else {
        control.start_ap_wpa2(ssid, password, AP_CHANNEL).await;
    }
    #[cfg(feature = "defmt")]
    defmt::info!("wifi: fallback AP '{}' up on channel {}", ssid, AP_CHANNEL);
}
