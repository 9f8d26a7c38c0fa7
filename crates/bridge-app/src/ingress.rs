//! RTP ingress
//!
//! Dual-socket receive path: a unicast socket that exists for the whole
//! life of a receiver mode, a multicast socket created only while a
//! subscription is active, and the RTCP socket on the adjacent port. One
//! task owns all three; readiness is multiplexed with `select`, one
//! datagram is handled per wakeup.

use core::sync::atomic::Ordering;

use embassy_futures::select::{select3, select4, Either3, Either4};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, Ipv4Address, Stack};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Instant, Timer};
use portable_atomic::AtomicBool;

use audio_pipeline::PCM_CHUNK_SIZE;
use rtp_wire::rtcp::{self, ReceiverReport, RtcpPacket};
use rtp_wire::{samples, MasterClock, RtpClockMap, RtpPacket, SequenceTracker, RTCP_PORT_OFFSET};

use crate::control::Counters;
use crate::JitterMutex;

/// Largest datagram the bridge accepts (one chunk + headers, with margin)
const RECV_BUFFER_LEN: usize = 2048;

/// How long a receive may park before the stop flag is rechecked
const IDLE_POLL_MS: u64 = 100;

/// RR cadence while clock sync is valid
const RR_INTERVAL_MS: u64 = 5000;

/// An active multicast subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Subscription {
    /// Joined group
    pub group: config_store::Ipv4Address,
    /// Group port the socket listens on
    pub port: u16,
    /// Expected stream SSRC; non-matching packets are dropped
    pub ssrc_filter: Option<u32>,
}

/// What `configure_stream` decided to do with an announced stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamAction {
    /// Join the announced group with the derived SSRC filter
    JoinMulticast(Subscription),
    /// The stream is addressed straight at us; stay on the configured
    /// unicast port (the announced port is ignored)
    UseUnicast,
    /// Neither multicast nor addressed to us
    Reject,
}

/// Decide how to receive a stream announced as (dest, origin, port)
pub fn configure_stream(
    dest: config_store::Ipv4Address,
    origin: config_store::Ipv4Address,
    port: u16,
    local: config_store::Ipv4Address,
) -> StreamAction {
    if dest.is_multicast() {
        let ssrc = (u32::from(origin.last_octet()) << 16) | u32::from(port);
        StreamAction::JoinMulticast(Subscription {
            group: dest,
            port,
            ssrc_filter: Some(ssrc),
        })
    } else if dest == local && !dest.is_unspecified() {
        StreamAction::UseUnicast
    } else {
        StreamAction::Reject
    }
}

/// Commands applied between datagrams while the worker runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IngressCommand {
    /// Reopen the unicast (and RTCP) socket on a new port
    ReopenPort(u16),
    /// Subscribe to a multicast group; idempotent for identical parameters
    Join(Subscription),
    /// Drop the multicast subscription, keep unicast untouched
    Leave,
    /// The stream rate changed; re-anchor clock projections
    SetSampleRate(u32),
}

/// Start parameters for one ingress run
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct IngressParams {
    /// Local RTP port
    pub port: u16,
    /// Scheduling delay added to each packet's playout deadline
    pub jitter_delay_ms: u32,
    /// Stream sample rate for clock projections
    pub sample_rate: u32,
    /// Our SSRC, stamped on outgoing receiver reports
    pub local_ssrc: u32,
}

/// Shared control block between the lifecycle worker and the ingress task
pub struct IngressShared {
    /// Start request
    pub start: Signal<CriticalSectionRawMutex, IngressParams>,
    /// Stop request flag
    pub stop: AtomicBool,
    /// Acknowledged once the sockets are closed
    pub stopped: Signal<CriticalSectionRawMutex, ()>,
    /// Runtime commands (port change, join/leave, rate change)
    pub commands: Channel<CriticalSectionRawMutex, IngressCommand, 4>,
}

impl IngressShared {
    /// Create an idle control block
    pub const fn new() -> Self {
        Self {
            start: Signal::new(),
            stop: AtomicBool::new(false),
            stopped: Signal::new(),
            commands: Channel::new(),
        }
    }
}

fn net_v4(ip: config_store::Ipv4Address) -> Ipv4Address {
    let o = ip.octets();
    Ipv4Address::new(o[0], o[1], o[2], o[3])
}

/// Per-run receive state
struct Session {
    tracker: SequenceTracker,
    clock_map: RtpClockMap,
    subscription: Option<Subscription>,
    jitter_delay_ms: u32,
    local_ssrc: u32,
    /// Where the last SR came from; RRs go back there
    sr_origin: Option<IpEndpoint>,
    last_rr_ms: u64,
}

/// Run the ingress worker forever
///
/// Spawned once at boot; each receiver-mode start arrives via
/// `shared.start` and runs until `shared.stop` is observed.
pub async fn run_ingress(
    shared: &IngressShared,
    stack: Stack<'static>,
    jitter: &JitterMutex,
    clock: &MasterClock,
    counters: &Counters,
    events: crate::EventSender,
) -> ! {
    let mut uni_rx_meta = [PacketMetadata::EMPTY; 8];
    let mut uni_rx_buf = [0u8; RECV_BUFFER_LEN * 2];
    let mut uni_tx_meta = [PacketMetadata::EMPTY; 2];
    let mut uni_tx_buf = [0u8; 128];
    let mut mc_rx_meta = [PacketMetadata::EMPTY; 8];
    let mut mc_rx_buf = [0u8; RECV_BUFFER_LEN * 2];
    let mut mc_tx_meta = [PacketMetadata::EMPTY; 2];
    let mut mc_tx_buf = [0u8; 32];
    let mut rtcp_rx_meta = [PacketMetadata::EMPTY; 4];
    let mut rtcp_rx_buf = [0u8; 1024];
    let mut rtcp_tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rtcp_tx_buf = [0u8; 256];

    loop {
        let params = shared.start.wait().await;
        shared.stop.store(false, Ordering::Release);
        while shared.commands.try_receive().is_ok() {} // drop stale commands

        let mut unicast = UdpSocket::new(
            stack,
            &mut uni_rx_meta,
            &mut uni_rx_buf,
            &mut uni_tx_meta,
            &mut uni_tx_buf,
        );
        let mut multicast = UdpSocket::new(
            stack,
            &mut mc_rx_meta,
            &mut mc_rx_buf,
            &mut mc_tx_meta,
            &mut mc_tx_buf,
        );
        let mut rtcp_sock = UdpSocket::new(
            stack,
            &mut rtcp_rx_meta,
            &mut rtcp_rx_buf,
            &mut rtcp_tx_meta,
            &mut rtcp_tx_buf,
        );

        let mut port = params.port;
        if unicast.bind(port).is_err() {
            error!("ingress: cannot bind RTP port {}", port);
            let _ = events.try_send(crate::lifecycle::Event::ModeStartFailed);
            while !shared.stop.load(Ordering::Acquire) {
                Timer::after(Duration::from_millis(10)).await;
            }
            shared.stopped.signal(());
            continue;
        }
        if rtcp_sock.bind(port + RTCP_PORT_OFFSET).is_err() {
            warn!("ingress: RTCP port unavailable, sync disabled");
        }

        let mut session = Session {
            tracker: SequenceTracker::new(),
            clock_map: RtpClockMap::new(params.sample_rate),
            subscription: None,
            jitter_delay_ms: params.jitter_delay_ms,
            local_ssrc: params.local_ssrc,
            sr_origin: None,
            last_rr_ms: 0,
        };
        let mut uni_buf = [0u8; RECV_BUFFER_LEN];
        let mut mc_buf = [0u8; RECV_BUFFER_LEN];
        let mut rtcp_buf = [0u8; 1024];

        info!("ingress: listening on {}", port);
        while !shared.stop.load(Ordering::Acquire) {
            // Apply any pending runtime command first.
            if let Ok(command) = shared.commands.try_receive() {
                match command {
                    IngressCommand::ReopenPort(new_port) => {
                        // A port change never touches multicast membership.
                        unicast.close();
                        rtcp_sock.close();
                        port = new_port;
                        if unicast.bind(port).is_err() {
                            error!("ingress: rebind to {} failed", port);
                        }
                        let _ = rtcp_sock.bind(port + RTCP_PORT_OFFSET);
                        info!("ingress: moved to port {}", port);
                    }
                    IngressCommand::Join(sub) => {
                        join_group(stack, &mut multicast, &mut session, sub);
                    }
                    IngressCommand::Leave => {
                        leave_group(stack, &mut multicast, &mut session);
                    }
                    IngressCommand::SetSampleRate(rate) => {
                        session.clock_map.set_sample_rate(rate);
                    }
                }
                continue;
            }

            let timeout = Timer::after(Duration::from_millis(IDLE_POLL_MS));
            if session.subscription.is_some() {
                match select4(
                    unicast.recv_from(&mut uni_buf),
                    multicast.recv_from(&mut mc_buf),
                    rtcp_sock.recv_from(&mut rtcp_buf),
                    timeout,
                )
                .await
                {
                    Either4::First(Ok((len, _meta))) => {
                        handle_rtp(&mut session, &mut uni_buf[..len], false, jitter, clock, counters);
                    }
                    Either4::Second(Ok((len, _meta))) => {
                        handle_rtp(&mut session, &mut mc_buf[..len], true, jitter, clock, counters);
                    }
                    Either4::Third(Ok((len, meta))) => {
                        handle_rtcp(&mut session, &rtcp_buf[..len], meta.endpoint, clock, counters);
                    }
                    Either4::First(Err(_))
                    | Either4::Second(Err(_))
                    | Either4::Third(Err(_))
                    | Either4::Fourth(()) => {}
                }
            } else {
                match select3(
                    unicast.recv_from(&mut uni_buf),
                    rtcp_sock.recv_from(&mut rtcp_buf),
                    timeout,
                )
                .await
                {
                    Either3::First(Ok((len, _meta))) => {
                        handle_rtp(&mut session, &mut uni_buf[..len], false, jitter, clock, counters);
                    }
                    Either3::Second(Ok((len, meta))) => {
                        handle_rtcp(&mut session, &rtcp_buf[..len], meta.endpoint, clock, counters);
                    }
                    Either3::First(Err(_)) | Either3::Second(Err(_)) | Either3::Third(()) => {}
                }
            }

            maybe_send_rr(&mut session, &mut rtcp_sock, counters).await;
        }

        leave_group(stack, &mut multicast, &mut session);
        unicast.close();
        rtcp_sock.close();
        info!("ingress: stopped");
        shared.stopped.signal(());
    }
}

fn join_group(
    stack: Stack<'static>,
    socket: &mut UdpSocket<'_>,
    session: &mut Session,
    sub: Subscription,
) {
    if session.subscription == Some(sub) {
        return; // idempotent join
    }
    if session.subscription.is_some() {
        leave_group(stack, socket, session);
    }
    if stack.join_multicast_group(net_v4(sub.group)).is_err() {
        error!("ingress: multicast join {} failed", sub.group);
        return;
    }
    if socket.bind(sub.port).is_err() {
        error!("ingress: bind group port {} failed", sub.port);
        let _ = stack.leave_multicast_group(net_v4(sub.group));
        return;
    }
    info!("ingress: joined {} port {}", sub.group, sub.port);
    session.subscription = Some(sub);
}

fn leave_group(stack: Stack<'static>, socket: &mut UdpSocket<'_>, session: &mut Session) {
    if let Some(sub) = session.subscription.take() {
        let _ = stack.leave_multicast_group(net_v4(sub.group));
        socket.close();
        info!("ingress: left {}", sub.group);
    }
}

/// Parse, filter, normalize and enqueue one RTP datagram
fn handle_rtp(
    session: &mut Session,
    datagram: &mut [u8],
    from_multicast: bool,
    jitter: &JitterMutex,
    clock: &MasterClock,
    counters: &Counters,
) {
    let (sequence, timestamp, payload_range) = match RtpPacket::parse(datagram) {
        Ok(packet) => {
            if from_multicast {
                if let Some(filter) = session.subscription.and_then(|s| s.ssrc_filter) {
                    if packet.ssrc != filter {
                        return; // someone else's stream on the same group
                    }
                }
            }
            let start = packet.payload.as_ptr() as usize - datagram.as_ptr() as usize;
            (packet.sequence, packet.timestamp, start..start + packet.payload.len())
        }
        Err(_) => {
            counters.packets_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    let lost = session.tracker.record(sequence);
    if lost > 0 {
        counters.packets_lost.fetch_add(u32::from(lost), Ordering::Relaxed);
    }
    counters.packets_received.fetch_add(1, Ordering::Relaxed);

    let payload = &mut datagram[payload_range];
    if payload.len() > PCM_CHUNK_SIZE {
        counters.packets_rejected.fetch_add(1, Ordering::Relaxed);
        return;
    }
    samples::swap_sample_bytes(payload);

    let now_master = clock.master_ms(Instant::now().as_millis());
    let deadline = session
        .clock_map
        .playout_time(timestamp, session.jitter_delay_ms)
        .unwrap_or(now_master + u64::from(session.jitter_delay_ms));

    let accepted =
        jitter.lock(|buf| buf.borrow_mut().push(payload, deadline, timestamp, now_master));
    if !accepted {
        counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }
}

/// Process one RTCP compound datagram
fn handle_rtcp(
    session: &mut Session,
    datagram: &[u8],
    from: IpEndpoint,
    clock: &MasterClock,
    counters: &Counters,
) {
    for packet in rtcp::compound(datagram) {
        match packet {
            Ok(RtcpPacket::SenderReport(info)) => {
                session
                    .clock_map
                    .on_sender_report(&info, Instant::now().as_millis());
                session.sr_origin = Some(from);
                counters.rtcp_received.fetch_add(1, Ordering::Relaxed);
                // An SR is also how we learn the master clock when the NTP
                // service has nothing yet.
                if !clock.is_valid() {
                    let local = Instant::now().as_millis();
                    clock.discipline(info.ntp_unix_ms() as i64 - local as i64);
                }
            }
            Ok(RtcpPacket::Bye { ssrc }) => {
                info!("ingress: BYE from {=u32:x}", ssrc);
                session.clock_map.invalidate();
                session.sr_origin = None;
            }
            Ok(RtcpPacket::SourceDescription { cname }) => {
                if let Some(name) = cname {
                    trace!("ingress: SDES cname {}", name);
                }
            }
            Ok(_) => {}
            Err(_) => {
                counters.packets_rejected.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    }
}

/// Answer the last SR with a receiver report on the RR cadence
async fn maybe_send_rr(session: &mut Session, socket: &mut UdpSocket<'_>, counters: &Counters) {
    let Some(origin) = session.sr_origin else {
        return;
    };
    if !session.clock_map.is_valid() {
        return;
    }
    let local = Instant::now().as_millis();
    if local.saturating_sub(session.last_rr_ms) < RR_INTERVAL_MS {
        return;
    }
    session.last_rr_ms = local;

    let report = ReceiverReport {
        sender_ssrc: session.local_ssrc,
        source_ssrc: session.subscription.and_then(|s| s.ssrc_filter).unwrap_or(0),
        fraction_lost: 0,
        cumulative_lost: session.tracker.lost(),
        highest_seq: u32::from(counters.packets_received.load(Ordering::Relaxed)),
        jitter: 0,
        last_sr: session.clock_map.last_sr(),
        delay_since_last_sr: session.clock_map.delay_since_last_sr(local),
    };
    let mut out = [0u8; ReceiverReport::LEN];
    if report.to_bytes(&mut out).is_ok() {
        let _ = socket.send_to(&out, origin).await;
    }
}
