//! Lifecycle state machine for the bridge
//!
//! Pure event-to-action logic: the runtime worker feeds it one event at a
//! time and executes whatever action comes back. All process-wide state
//! lives here, mutated by exactly one task, so there is never concurrent
//! access to it.

use config_store::DeviceMode;
use heapless::String;

/// Events posted through the single lifecycle queue
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Event {
    /// Boot entry; begins hardware init
    PowerOn,
    /// NVS, config, OTA, battery and power management are up
    HardwareReady,
    /// A hardware init substep failed beyond recovery
    HardwareFailed,
    /// WiFi, web server, mDNS and NTP services are running
    ServicesStarted,
    /// A required service refused to start
    ServicesFailed,

    /// Station link went up (advisory; modes wait for an address)
    WifiConnected,
    /// Station link dropped (advisory)
    WifiDisconnected,
    /// DHCP finished; sockets can bind
    IpAcquired,

    /// A USB DAC was plugged in
    UsbDacConnected,
    /// The USB DAC disappeared
    UsbDacDisconnected,

    /// The authoritative mode/wizard values (re)announced by the config
    /// delta handler
    ModeConfigured {
        /// Mode the configuration now names
        mode: DeviceMode,
        /// First-run wizard latch
        wizard_completed: bool,
    },
    /// The control plane committed new settings
    ConfigurationChanged,
    /// A peer or the local source switched PCM rate
    SampleRateChange(u32),
    /// The SAP listener announced a stream
    SapStreamFound {
        /// Announced session name
        name: String<63>,
        /// Announcing host
        origin: config_store::Ipv4Address,
        /// Stream destination (multicast group or our unicast address)
        dest: config_store::Ipv4Address,
        /// Stream port
        port: u16,
    },

    /// A pipeline worker could not bring its device up
    ModeStartFailed,
    /// The PCM pump observed enough continuous silence
    EnterSleep,
    /// Activity was detected during a sleep check
    WakeUp,

    /// The pairing service takes over the radio
    StartPairing,
    /// Pairing finished
    PairingComplete,
    /// Pairing aborted
    CancelPairing,
}

/// What the runtime must do after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Action {
    /// Nothing to do
    None,
    /// Run the hardware init substeps
    RunHwInit,
    /// Start the external services
    StartServices,
    /// Bring up the pipeline for a mode
    StartMode(DeviceMode),
    /// Tear one mode down completely, then bring another up
    SwitchMode {
        /// Mode to stop first
        stop: DeviceMode,
        /// Mode to start once teardown finished
        start: DeviceMode,
    },
    /// Abort a mode whose entry failed; tear down whatever came up
    StopMode(DeviceMode),
    /// Stop the pipeline (saving USB device params) and drop to the
    /// low-power network check
    StopModeAndSleep(DeviceMode),
    /// Restore the pre-sleep mode with its saved configuration
    WakeInto(DeviceMode),
    /// Park the pipeline and hand control to the pairing service
    SuspendForPairing(DeviceMode),
    /// Take control back from the pairing service
    ResumeFromPairing(DeviceMode),
    /// Re-enable playback on the already-running USB receiver
    EnableUsbPlayback,
    /// Mute/suspend playback without leaving the mode
    DisableUsbPlayback,
    /// Try in-place sample-rate reconfiguration; fall back to a restart
    AdaptSampleRate(u32),
    /// Unrecoverable; stay dark
    Fatal,
}

/// Lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LifecycleState {
    /// Power-on entry point
    #[default]
    Initializing,
    /// Hardware init substeps running
    HwInit,
    /// External services starting
    StartingServices,
    /// Idle until a valid mode is configured
    AwaitingModeConfig,
    /// Sending USB capture to the network
    ModeSenderUsb,
    /// Sending S/PDIF capture to the network
    ModeSenderSpdif,
    /// Playing network audio to a USB DAC
    ModeReceiverUsb,
    /// Playing network audio over S/PDIF
    ModeReceiverSpdif,
    /// Pairing service in control
    Pairing,
    /// Pipelines parked, periodic network check running
    Sleeping,
    /// Absorbing state for fatal init failures
    Error,
}

impl LifecycleState {
    /// The device mode a mode state corresponds to
    pub const fn mode(self) -> Option<DeviceMode> {
        match self {
            Self::ModeSenderUsb => Some(DeviceMode::SenderUsb),
            Self::ModeSenderSpdif => Some(DeviceMode::SenderSpdif),
            Self::ModeReceiverUsb => Some(DeviceMode::ReceiverUsb),
            Self::ModeReceiverSpdif => Some(DeviceMode::ReceiverSpdif),
            _ => None,
        }
    }

    /// The state a device mode runs in
    pub const fn for_mode(mode: DeviceMode) -> Self {
        match mode {
            DeviceMode::SenderUsb => Self::ModeSenderUsb,
            DeviceMode::SenderSpdif => Self::ModeSenderSpdif,
            DeviceMode::ReceiverUsb => Self::ModeReceiverUsb,
            DeviceMode::ReceiverSpdif => Self::ModeReceiverSpdif,
        }
    }
}

/// The lifecycle controller
pub struct Controller {
    state: LifecycleState,
    configured_mode: Option<DeviceMode>,
    wizard_completed: bool,
    ip_up: bool,
    /// Mode to return to after Sleeping or Pairing
    resume_mode: Option<DeviceMode>,
}

impl Controller {
    /// Create a controller at the power-on state
    pub const fn new() -> Self {
        Self {
            state: LifecycleState::Initializing,
            configured_mode: None,
            wizard_completed: false,
            ip_up: false,
            resume_mode: None,
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Start the configured mode if every precondition holds
    fn try_start_mode(&mut self) -> Action {
        if self.state != LifecycleState::AwaitingModeConfig {
            return Action::None;
        }
        if !self.wizard_completed || !self.ip_up {
            return Action::None;
        }
        let Some(mode) = self.configured_mode else {
            return Action::None;
        };
        self.state = LifecycleState::for_mode(mode);
        Action::StartMode(mode)
    }

    /// Process one event and return the action to take
    pub fn process(&mut self, event: &Event) -> Action {
        match (self.state, event) {
            // Boot chain
            (LifecycleState::Initializing, Event::PowerOn) => {
                self.state = LifecycleState::HwInit;
                Action::RunHwInit
            }
            (LifecycleState::HwInit, Event::HardwareReady) => {
                self.state = LifecycleState::StartingServices;
                Action::StartServices
            }
            (LifecycleState::HwInit, Event::HardwareFailed)
            | (LifecycleState::StartingServices, Event::ServicesFailed) => {
                self.state = LifecycleState::Error;
                Action::Fatal
            }
            (LifecycleState::StartingServices, Event::ServicesStarted) => {
                self.state = LifecycleState::AwaitingModeConfig;
                self.try_start_mode()
            }

            // Network advisories
            (_, Event::IpAcquired) => {
                self.ip_up = true;
                self.try_start_mode()
            }
            (_, Event::WifiDisconnected) => {
                self.ip_up = false;
                Action::None
            }
            (_, Event::WifiConnected) => Action::None,

            // Mode selection and restart routing
            (state, Event::ModeConfigured { mode, wizard_completed }) => {
                self.configured_mode = Some(*mode);
                self.wizard_completed = *wizard_completed;
                match state.mode() {
                    Some(current) if current != *mode => {
                        self.state = LifecycleState::for_mode(*mode);
                        Action::SwitchMode {
                            stop: current,
                            start: *mode,
                        }
                    }
                    Some(_) => Action::None,
                    None => self.try_start_mode(),
                }
            }

            // DAC hotplug gates playback without a state change
            (LifecycleState::ModeReceiverUsb, Event::UsbDacConnected) => {
                Action::EnableUsbPlayback
            }
            (LifecycleState::ModeReceiverUsb, Event::UsbDacDisconnected) => {
                Action::DisableUsbPlayback
            }

            // Sample-rate changes are only meaningful while a pipeline runs
            (state, Event::SampleRateChange(rate)) if state.mode().is_some() => {
                Action::AdaptSampleRate(*rate)
            }

            // A device refused to come up; abort the mode entry
            (state, Event::ModeStartFailed) if state.mode().is_some() => {
                let mode = state.mode().unwrap_or(DeviceMode::ReceiverSpdif);
                self.state = LifecycleState::AwaitingModeConfig;
                // Do not retry until the configuration changes.
                self.configured_mode = None;
                Action::StopMode(mode)
            }

            // Sleep is only honored in a mode state
            (state, Event::EnterSleep) => match state.mode() {
                Some(mode) => {
                    self.resume_mode = Some(mode);
                    self.state = LifecycleState::Sleeping;
                    Action::StopModeAndSleep(mode)
                }
                None => Action::None,
            },
            (LifecycleState::Sleeping, Event::WakeUp) => match self.resume_mode.take() {
                Some(mode) => {
                    self.state = LifecycleState::for_mode(mode);
                    Action::WakeInto(mode)
                }
                None => {
                    self.state = LifecycleState::AwaitingModeConfig;
                    Action::None
                }
            },

            // Pairing suspends whatever was running
            (state, Event::StartPairing)
                if state.mode().is_some() || state == LifecycleState::AwaitingModeConfig =>
            {
                self.resume_mode = state.mode();
                self.state = LifecycleState::Pairing;
                match self.resume_mode {
                    Some(mode) => Action::SuspendForPairing(mode),
                    None => Action::None,
                }
            }
            (LifecycleState::Pairing, Event::PairingComplete)
            | (LifecycleState::Pairing, Event::CancelPairing) => {
                match self.resume_mode.take() {
                    Some(mode) => {
                        self.state = LifecycleState::for_mode(mode);
                        Action::ResumeFromPairing(mode)
                    }
                    None => {
                        self.state = LifecycleState::AwaitingModeConfig;
                        Action::None
                    }
                }
            }

            // Everything else is a no-op in the current state
            _ => Action::None,
        }
    }
}

impl Default for Controller {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive a controller through boot into the given mode
    fn booted(mode: DeviceMode) -> Controller {
        let mut c = Controller::new();
        assert_eq!(c.process(&Event::PowerOn), Action::RunHwInit);
        assert_eq!(c.process(&Event::HardwareReady), Action::StartServices);
        assert_eq!(c.process(&Event::ServicesStarted), Action::None);
        c.process(&Event::WifiConnected);
        assert_eq!(c.process(&Event::IpAcquired), Action::None);
        let action = c.process(&Event::ModeConfigured {
            mode,
            wizard_completed: true,
        });
        assert_eq!(action, Action::StartMode(mode));
        c
    }

    #[test]
    fn test_boot_reaches_configured_mode() {
        let c = booted(DeviceMode::ReceiverSpdif);
        assert_eq!(c.state(), LifecycleState::ModeReceiverSpdif);
    }

    #[test]
    fn test_wizard_gates_mode_start() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        c.process(&Event::HardwareReady);
        c.process(&Event::ServicesStarted);
        c.process(&Event::IpAcquired);

        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::ReceiverUsb,
            wizard_completed: false,
        });
        assert_eq!(action, Action::None);
        assert_eq!(c.state(), LifecycleState::AwaitingModeConfig);

        // Completing the wizard releases the hold.
        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::ReceiverUsb,
            wizard_completed: true,
        });
        assert_eq!(action, Action::StartMode(DeviceMode::ReceiverUsb));
    }

    #[test]
    fn test_mode_waits_for_ip() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        c.process(&Event::HardwareReady);
        c.process(&Event::ServicesStarted);

        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::SenderSpdif,
            wizard_completed: true,
        });
        assert_eq!(action, Action::None, "no sockets before an address");

        assert_eq!(
            c.process(&Event::IpAcquired),
            Action::StartMode(DeviceMode::SenderSpdif)
        );
    }

    #[test]
    fn test_mode_change_is_stop_then_start() {
        let mut c = booted(DeviceMode::ReceiverUsb);
        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::SenderSpdif,
            wizard_completed: true,
        });
        assert_eq!(
            action,
            Action::SwitchMode {
                stop: DeviceMode::ReceiverUsb,
                start: DeviceMode::SenderSpdif,
            }
        );
        assert_eq!(c.state(), LifecycleState::ModeSenderSpdif);
    }

    #[test]
    fn test_same_mode_reconfigured_is_noop() {
        let mut c = booted(DeviceMode::ReceiverSpdif);
        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::ReceiverSpdif,
            wizard_completed: true,
        });
        assert_eq!(action, Action::None);
    }

    #[test]
    fn test_hw_failure_is_absorbing() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        assert_eq!(c.process(&Event::HardwareFailed), Action::Fatal);
        assert_eq!(c.state(), LifecycleState::Error);

        // Nothing gets the controller out of Error.
        assert_eq!(c.process(&Event::IpAcquired), Action::None);
        assert_eq!(
            c.process(&Event::ModeConfigured {
                mode: DeviceMode::ReceiverUsb,
                wizard_completed: true
            }),
            Action::None
        );
        assert_eq!(c.state(), LifecycleState::Error);
    }

    #[test]
    fn test_sleep_only_from_mode_state() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        assert_eq!(c.process(&Event::EnterSleep), Action::None);

        let mut c = booted(DeviceMode::ReceiverSpdif);
        assert_eq!(
            c.process(&Event::EnterSleep),
            Action::StopModeAndSleep(DeviceMode::ReceiverSpdif)
        );
        assert_eq!(c.state(), LifecycleState::Sleeping);
    }

    #[test]
    fn test_wake_restores_prior_mode() {
        let mut c = booted(DeviceMode::ReceiverUsb);
        c.process(&Event::EnterSleep);
        assert_eq!(
            c.process(&Event::WakeUp),
            Action::WakeInto(DeviceMode::ReceiverUsb)
        );
        assert_eq!(c.state(), LifecycleState::ModeReceiverUsb);
    }

    #[test]
    fn test_pairing_suspends_and_resumes() {
        let mut c = booted(DeviceMode::SenderUsb);
        assert_eq!(
            c.process(&Event::StartPairing),
            Action::SuspendForPairing(DeviceMode::SenderUsb)
        );
        assert_eq!(c.state(), LifecycleState::Pairing);

        assert_eq!(
            c.process(&Event::PairingComplete),
            Action::ResumeFromPairing(DeviceMode::SenderUsb)
        );
        assert_eq!(c.state(), LifecycleState::ModeSenderUsb);
    }

    #[test]
    fn test_pairing_cancel_from_idle_returns_to_idle() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        c.process(&Event::HardwareReady);
        c.process(&Event::ServicesStarted);

        assert_eq!(c.process(&Event::StartPairing), Action::None);
        assert_eq!(c.state(), LifecycleState::Pairing);
        assert_eq!(c.process(&Event::CancelPairing), Action::None);
        assert_eq!(c.state(), LifecycleState::AwaitingModeConfig);
    }

    #[test]
    fn test_dac_hotplug_gates_playback_in_place() {
        let mut c = booted(DeviceMode::ReceiverUsb);
        assert_eq!(
            c.process(&Event::UsbDacDisconnected),
            Action::DisableUsbPlayback
        );
        assert_eq!(c.state(), LifecycleState::ModeReceiverUsb);
        assert_eq!(
            c.process(&Event::UsbDacConnected),
            Action::EnableUsbPlayback
        );

        // Irrelevant in S/PDIF modes.
        let mut c = booted(DeviceMode::ReceiverSpdif);
        assert_eq!(c.process(&Event::UsbDacConnected), Action::None);
    }

    #[test]
    fn test_failed_mode_entry_aborts_to_idle() {
        let mut c = booted(DeviceMode::ReceiverUsb);
        assert_eq!(
            c.process(&Event::ModeStartFailed),
            Action::StopMode(DeviceMode::ReceiverUsb)
        );
        assert_eq!(c.state(), LifecycleState::AwaitingModeConfig);

        // No retry loop: the same mode is not restarted by itself.
        assert_eq!(c.process(&Event::IpAcquired), Action::None);

        // A fresh configuration is allowed to try again.
        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::ReceiverSpdif,
            wizard_completed: true,
        });
        assert_eq!(action, Action::StartMode(DeviceMode::ReceiverSpdif));
    }

    #[test]
    fn test_sample_rate_change_only_in_mode() {
        let mut c = booted(DeviceMode::ReceiverSpdif);
        assert_eq!(
            c.process(&Event::SampleRateChange(44100)),
            Action::AdaptSampleRate(44100)
        );

        let mut idle = Controller::new();
        idle.process(&Event::PowerOn);
        assert_eq!(idle.process(&Event::SampleRateChange(44100)), Action::None);
    }

    #[test]
    fn test_wifi_drop_clears_ip_gate() {
        let mut c = Controller::new();
        c.process(&Event::PowerOn);
        c.process(&Event::HardwareReady);
        c.process(&Event::IpAcquired);
        c.process(&Event::WifiDisconnected);
        c.process(&Event::ServicesStarted);

        let action = c.process(&Event::ModeConfigured {
            mode: DeviceMode::ReceiverSpdif,
            wizard_completed: true,
        });
        assert_eq!(action, Action::None, "address was lost with the link");
    }
}
