//! Control-plane surface consumed by the external web server
//!
//! Getters for every option, single setters that validate, persist and post
//! `ConfigurationChanged`, one batch update with exactly one commit, and
//! the counters view. The web server itself lives outside the core; this
//! module is the data contract it calls into.

use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use portable_atomic::{AtomicU32, AtomicU8};

use config_store::{
    Config, ConfigError, ConfigStorage, ConfigStore, ConfigUpdate, DeviceMode, Ipv4Address,
};

use crate::lifecycle::{Event, LifecycleState};
use crate::{EventSender, JitterMutex};

/// Stream and pipeline counters, updated lock-free by the workers
#[derive(Debug)]
pub struct Counters {
    /// RTP datagrams accepted
    pub packets_received: AtomicU32,
    /// Packets the sequence gap analysis says the network dropped
    pub packets_lost: AtomicU32,
    /// Chunks discarded because the ring was full
    pub packets_dropped: AtomicU32,
    /// Datagrams rejected by the parsers
    pub packets_rejected: AtomicU32,
    /// Frames emitted in sender modes
    pub packets_sent: AtomicU32,
    /// Jitter buffer underrun entries
    pub underruns: AtomicU32,
    /// RTCP sender reports consumed
    pub rtcp_received: AtomicU32,
    /// Audio sink bring-up/write failures
    pub sink_errors: AtomicU32,
}

impl Counters {
    /// All zeros
    pub const fn new() -> Self {
        Self {
            packets_received: AtomicU32::new(0),
            packets_lost: AtomicU32::new(0),
            packets_dropped: AtomicU32::new(0),
            packets_rejected: AtomicU32::new(0),
            packets_sent: AtomicU32::new(0),
            underruns: AtomicU32::new(0),
            rtcp_received: AtomicU32::new(0),
            sink_errors: AtomicU32::new(0),
        }
    }

    /// Reset between mode runs
    pub fn clear(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.packets_lost.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.packets_rejected.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.rtcp_received.store(0, Ordering::Relaxed);
        self.sink_errors.store(0, Ordering::Relaxed);
    }
}

/// Lifecycle state mirror readable without touching the controller
///
/// The runtime stores the state ordinal here after every transition.
pub struct StateMirror(AtomicU8);

impl StateMirror {
    /// Starts at `Initializing`
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Record a transition
    pub fn set(&self, state: LifecycleState) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Raw ordinal for the status report
    pub fn raw(&self) -> u8 {
        self.0.load(Ordering::Acquire)
    }
}

/// Snapshot handed to the web layer
#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusView {
    /// Packets accepted since mode start
    pub packets_received: u32,
    /// Packets lost on the network
    pub packets_lost: u32,
    /// Loss as a percentage of expected packets
    pub loss_rate_percent: f32,
    /// Chunks dropped at the full ring
    pub packets_dropped: u32,
    /// Frames sent (sender modes)
    pub packets_sent: u32,
    /// Underrun entries
    pub underruns: u32,
    /// Current jitter-buffer occupancy in chunks
    pub buffer_level: u32,
    /// Current refill target in chunks
    pub buffer_target: u32,
    /// Lifecycle state ordinal
    pub state: u8,
}

/// The control-plane entry points
///
/// One instance is created at boot and handed to the web server; every
/// setter validates, persists with a single commit, and posts
/// `ConfigurationChanged` for the lifecycle worker to act on.
pub struct ControlPlane<'a, S: ConfigStorage> {
    store: &'a Mutex<CriticalSectionRawMutex, ConfigStore<S>>,
    events: EventSender,
    counters: &'a Counters,
    jitter: &'a JitterMutex,
    state: &'a StateMirror,
}

impl<'a, S: ConfigStorage> ControlPlane<'a, S> {
    /// Wire the control plane to the shared state
    pub fn new(
        store: &'a Mutex<CriticalSectionRawMutex, ConfigStore<S>>,
        events: EventSender,
        counters: &'a Counters,
        jitter: &'a JitterMutex,
        state: &'a StateMirror,
    ) -> Self {
        Self {
            store,
            events,
            counters,
            jitter,
            state,
        }
    }

    /// The persisted configuration
    pub async fn config(&self) -> Config {
        self.store.lock().await.config().clone()
    }

    async fn commit_and_notify(
        &self,
        apply: impl FnOnce(&mut Config) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        self.store.lock().await.commit(apply)?;
        let _ = self.events.try_send(Event::ConfigurationChanged);
        Ok(())
    }

    /// Set the software volume
    pub async fn set_volume(&self, volume: f32) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| {
            cfg.set_volume(volume);
            Ok(())
        })
        .await
    }

    /// Set the RTP ingress port
    pub async fn set_port(&self, port: u16) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| cfg.set_port(port)).await
    }

    /// Set the advertised hostname
    pub async fn set_hostname(&self, name: &str) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| cfg.set_hostname(name)).await
    }

    /// Set the device mode
    pub async fn set_device_mode(&self, mode: DeviceMode) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| {
            cfg.set_device_mode(mode);
            Ok(())
        })
        .await
    }

    /// Set the PCM sample rate
    pub async fn set_sample_rate(&self, rate: u32) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| cfg.set_sample_rate(rate)).await
    }

    /// Set the S/PDIF output pin
    pub async fn set_spdif_pin(&self, pin: u8) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| {
            cfg.set_spdif_pin(pin);
            Ok(())
        })
        .await
    }

    /// Set the egress destination
    pub async fn set_destination(&self, ip: Ipv4Address, port: u16) -> Result<(), ConfigError> {
        self.commit_and_notify(|cfg| cfg.set_destination(ip, port))
            .await
    }

    /// Apply any batch of options with exactly one persistent commit
    pub async fn apply_update(&self, update: &ConfigUpdate<'_>) -> Result<(), ConfigError> {
        self.store.lock().await.apply_update(update)?;
        let _ = self.events.try_send(Event::ConfigurationChanged);
        Ok(())
    }

    /// Persist the whole current configuration
    pub async fn save_all(&self) -> Result<(), ConfigError> {
        self.store.lock().await.save_all()
    }

    /// Erase everything and return to defaults
    pub async fn factory_reset(&self) -> Result<(), ConfigError> {
        self.store.lock().await.reset_to_defaults()?;
        let _ = self.events.try_send(Event::ConfigurationChanged);
        Ok(())
    }

    /// Counters and buffer statistics for the status page
    pub fn status(&self) -> StatusView {
        let received = self.counters.packets_received.load(Ordering::Relaxed);
        let lost = self.counters.packets_lost.load(Ordering::Relaxed);
        let expected = received + lost;
        let (level, target) = self
            .jitter
            .lock(|buf| {
                let buf = buf.borrow();
                (buf.len() as u32, buf.target() as u32)
            });

        StatusView {
            packets_received: received,
            packets_lost: lost,
            loss_rate_percent: if expected == 0 {
                0.0
            } else {
                lost as f32 * 100.0 / expected as f32
            },
            packets_dropped: self.counters.packets_dropped.load(Ordering::Relaxed),
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            underruns: self.counters.underruns.load(Ordering::Relaxed),
            buffer_level: level,
            buffer_target: target,
            state: self.state.raw(),
        }
    }
}
