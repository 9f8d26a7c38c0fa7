//! RTP egress
//!
//! Two cooperating tasks in sender modes: the capture worker drains the
//! local audio source into the SPSC chunk ring, and the egress pump frames
//! one chunk per iteration and sends it to the configured destination. The
//! destination is re-read on every send, so runtime changes apply without
//! a restart. Sender-side silence watches the captured amplitude.

use core::sync::atomic::Ordering;

use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, IpEndpoint, Ipv4Address, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32};

use audio_io::{gain, AudioSource};
use audio_pipeline::{CaptureRing, FRAMES_PER_CHUNK, PCM_CHUNK_SIZE, SILENT_CHUNK};

use crate::control::Counters;
use crate::lifecycle::Event;
use crate::pump::SilenceDetector;
use crate::{EventSender, CAPTURE_SLOTS};

use rtp_wire::{Packetizer, RTP_HEADER_LEN};

/// Lock-free egress destination, updated in place by the delta handler
pub struct Destination {
    ip: AtomicU32,
    port: AtomicU16,
}

impl Destination {
    /// An unset destination (sends are skipped)
    pub const fn new() -> Self {
        Self {
            ip: AtomicU32::new(0),
            port: AtomicU16::new(0),
        }
    }

    /// Replace the destination; the next frame goes to the new address
    pub fn update(&self, ip: config_store::Ipv4Address, port: u16) {
        self.ip.store(u32::from_be_bytes(ip.octets()), Ordering::Release);
        self.port.store(port, Ordering::Release);
    }

    /// Current endpoint, or `None` while unset
    pub fn endpoint(&self) -> Option<IpEndpoint> {
        let ip = self.ip.load(Ordering::Acquire);
        let port = self.port.load(Ordering::Acquire);
        if ip == 0 || port == 0 {
            return None;
        }
        let o = ip.to_be_bytes();
        Some(IpEndpoint::new(
            IpAddress::Ipv4(Ipv4Address::new(o[0], o[1], o[2], o[3])),
            port,
        ))
    }
}

/// Local port frames are sent from (smoltcp has no ephemeral binding)
const EGRESS_LOCAL_PORT: u16 = 50004;

/// Start parameters for one egress run
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct EgressParams {
    /// Deterministic SSRC derived from the device MAC
    pub ssrc: u32,
    /// Cached sender sleep threshold
    pub silence_threshold_ms: u32,
}

/// Shared control block for the egress pump
pub struct EgressShared {
    /// Start request for the egress pump
    pub start: Signal<CriticalSectionRawMutex, EgressParams>,
    /// Stop flag
    pub stop: AtomicBool,
    /// Egress pump acknowledged stop
    pub stopped: Signal<CriticalSectionRawMutex, ()>,
    /// Where frames go; re-read on every send
    pub destination: Destination,
    /// Peak amplitude at or below which capture counts as silent
    pub silence_amplitude: AtomicU16,
    /// Live sender sleep threshold
    pub silence_threshold_ms: AtomicU32,
}

/// Shared control block for a capture worker (one per source flavor)
pub struct CaptureShared {
    /// Start request
    pub start: Signal<CriticalSectionRawMutex, CaptureParams>,
    /// Stop flag
    pub stop: AtomicBool,
    /// Park the source for sleep instead of releasing it
    pub stop_for_sleep: AtomicBool,
    /// Acknowledged once the source is released
    pub stopped: Signal<CriticalSectionRawMutex, ()>,
}

impl CaptureShared {
    /// Create an idle control block
    pub const fn new() -> Self {
        Self {
            start: Signal::new(),
            stop: AtomicBool::new(false),
            stop_for_sleep: AtomicBool::new(false),
            stopped: Signal::new(),
        }
    }
}

/// Start parameters for the capture worker
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureParams {
    /// PCM format for the source
    pub format: audio_pipeline::AudioFormat,
    /// Wake from sleep: restore instead of full init
    pub resume: bool,
}

impl EgressShared {
    /// Create an idle control block
    pub const fn new() -> Self {
        Self {
            start: Signal::new(),
            stop: AtomicBool::new(false),
            stopped: Signal::new(),
            destination: Destination::new(),
            silence_amplitude: AtomicU16::new(16),
            silence_threshold_ms: AtomicU32::new(10_000),
        }
    }
}

/// Run the capture worker forever over a concrete source
pub async fn run_capture<S: AudioSource>(
    shared: &CaptureShared,
    ring: &CaptureRing<CAPTURE_SLOTS>,
    source: &mut S,
    events: EventSender,
) -> ! {
    loop {
        let params = shared.start.wait().await;
        shared.stop.store(false, Ordering::Release);

        let up = if params.resume {
            source.restore_after_wake().await
        } else {
            source.initialize(params.format).await
        };
        let up = match up {
            Ok(()) => source.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = up {
            error!("capture: source bring-up failed: {}", e);
            let _ = events.try_send(Event::ModeStartFailed);
            while !shared.stop.load(Ordering::Acquire) {
                Timer::after_millis(10).await;
            }
            shared.stopped.signal(());
            continue;
        }

        ring.clear();
        let mut chunk = SILENT_CHUNK;
        info!("capture: running");
        while !shared.stop.load(Ordering::Acquire) {
            match source.read(&mut chunk, 20).await {
                Ok(_) => {
                    if !ring.produce(&chunk) {
                        // Egress is behind; freshest audio wins, so spin
                        // once around and overwrite later.
                        Timer::after_millis(1).await;
                    }
                }
                Err(_) => Timer::after_millis(1).await,
            }
        }

        source.stop().await;
        if shared.stop_for_sleep.load(Ordering::Acquire) {
            source.prepare_for_sleep().await;
        } else {
            source.deinitialize().await;
        }
        info!("capture: stopped");
        shared.stopped.signal(());
    }
}

/// Run the egress pump forever
pub async fn run_egress(
    shared: &EgressShared,
    stack: Stack<'static>,
    ring: &CaptureRing<CAPTURE_SLOTS>,
    counters: &Counters,
    events: EventSender,
) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buf = [0u8; 256];
    let mut tx_meta = [PacketMetadata::EMPTY; 8];
    let mut tx_buf = [0u8; (RTP_HEADER_LEN + PCM_CHUNK_SIZE) * 2];

    loop {
        let params = shared.start.wait().await;
        shared.stop.store(false, Ordering::Release);

        let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
        if socket.bind(EGRESS_LOCAL_PORT).is_err() {
            error!("egress: cannot open socket");
            let _ = events.try_send(Event::ModeStartFailed);
            while !shared.stop.load(Ordering::Acquire) {
                Timer::after_millis(10).await;
            }
            shared.stopped.signal(());
            continue;
        }

        let mut packetizer = Packetizer::new(params.ssrc, FRAMES_PER_CHUNK as u32);
        let mut detector = SilenceDetector::new(params.silence_threshold_ms);
        let mut chunk = SILENT_CHUNK;
        let mut packet = [0u8; RTP_HEADER_LEN + PCM_CHUNK_SIZE];

        info!("egress: running, ssrc {=u32:x}", params.ssrc);
        while !shared.stop.load(Ordering::Acquire) {
            if !ring.consume(&mut chunk) {
                Timer::after_millis(1).await;
                continue;
            }

            detector.set_threshold(shared.silence_threshold_ms.load(Ordering::Relaxed));
            let amplitude = gain::peak_magnitude(&chunk);
            if amplitude <= shared.silence_amplitude.load(Ordering::Relaxed) {
                if detector.on_silence(Instant::now().as_millis()) {
                    info!("egress: captured silence, requesting sleep");
                    let _ = events.try_send(Event::EnterSleep);
                }
            } else {
                detector.on_audio();
            }

            let Some(endpoint) = shared.destination.endpoint() else {
                continue; // no destination configured yet
            };
            match packetizer.frame(&chunk, &mut packet) {
                Ok(len) => {
                    if socket.send_to(&packet[..len], endpoint).await.is_ok() {
                        counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(_) => counters.packets_rejected.fetch_add(1, Ordering::Relaxed),
            }
        }

        socket.close();
        info!("egress: stopped");
        shared.stopped.signal(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config_store::Ipv4Address as CfgIp;

    #[test]
    fn test_destination_unset_then_updated() {
        let dest = Destination::new();
        assert!(dest.endpoint().is_none());

        dest.update(CfgIp::new(192, 168, 4, 7), 4010);
        let endpoint = dest.endpoint().unwrap();
        assert_eq!(endpoint.port, 4010);
        assert_eq!(
            endpoint.addr,
            IpAddress::Ipv4(Ipv4Address::new(192, 168, 4, 7))
        );
    }

    #[test]
    fn test_destination_zero_port_is_unset() {
        let dest = Destination::new();
        dest.update(CfgIp::new(10, 0, 0, 1), 0);
        assert!(dest.endpoint().is_none());
    }
}
