//! The lifecycle worker
//!
//! Drains the single FIFO event queue, feeds the pure state machine, and
//! executes the actions it returns: mode start/stop with synchronous
//! teardown, the config delta handler with its private snapshot, sleep
//! entry with the periodic network check, and the service facade calls.
//! This task is the only mutator of lifecycle state.

use core::sync::atomic::Ordering;

use embassy_futures::select::{select, Either};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::Stack;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};

use audio_pipeline::{AudioFormat, LatePolicy};
use config_store::{Config, ConfigStorage, ConfigStore, DeviceMode};
use rtp_wire::{ssrc_from_mac, MasterClock};

use crate::control::{Counters, StateMirror};
use crate::egress::{CaptureParams, CaptureShared, EgressParams, EgressShared};
use crate::ingress::{configure_stream, IngressCommand, IngressParams, IngressShared, StreamAction};
use crate::lifecycle::{Action, Controller, Event};
use crate::pump::{PumpParams, PumpReconfig, PumpShared};
use crate::services::Services;
use crate::{EventQueue, JitterMutex, JITTER_SLOTS};

/// Everything the lifecycle worker reaches, all 'static singletons
pub struct RuntimeCtx<S: ConfigStorage + 'static> {
    pub events: &'static EventQueue,
    pub store: &'static Mutex<CriticalSectionRawMutex, ConfigStore<S>>,
    pub jitter: &'static JitterMutex,
    pub clock: &'static MasterClock,
    pub counters: &'static Counters,
    pub services: &'static Services,
    pub state_mirror: &'static StateMirror,
    pub ingress: &'static IngressShared,
    pub pump_usb: &'static PumpShared,
    pub pump_spdif: &'static PumpShared,
    pub capture_usb: &'static CaptureShared,
    pub capture_spdif: &'static CaptureShared,
    pub egress: &'static EgressShared,
    pub stack: Stack<'static>,
    pub mac: [u8; 6],
}

/// Run the lifecycle worker forever
pub async fn run_lifecycle<S: ConfigStorage>(ctx: RuntimeCtx<S>) -> ! {
    let mut worker = Worker {
        snapshot: ctx.store.lock().await.config().clone(),
        controller: Controller::new(),
        ssrc: ssrc_from_mac(ctx.mac),
        ctx,
    };

    worker.dispatch(Event::PowerOn).await;

    loop {
        let event = if worker.controller.state() == crate::lifecycle::LifecycleState::Sleeping {
            let interval = worker.snapshot.network_check_interval_ms;
            match select(
                worker.ctx.events.receive(),
                Timer::after(Duration::from_millis(u64::from(interval.max(100)))),
            )
            .await
            {
                Either::First(event) => event,
                Either::Second(()) => {
                    if worker.sleep_network_check().await {
                        Event::WakeUp
                    } else {
                        continue;
                    }
                }
            }
        } else {
            worker.ctx.events.receive().await
        };

        match event {
            Event::ConfigurationChanged => worker.handle_config_changed().await,
            Event::SapStreamFound {
                ref name,
                origin,
                dest,
                port,
            } => worker.handle_sap_stream(name.as_str(), origin, dest, port).await,
            other => worker.dispatch(other).await,
        }
    }
}

struct Worker<S: ConfigStorage + 'static> {
    ctx: RuntimeCtx<S>,
    controller: Controller,
    /// Private config snapshot the delta handler diffs against
    snapshot: Config,
    ssrc: u32,
}

impl<S: ConfigStorage> Worker<S> {
    /// Feed one event to the machine and execute the resulting action
    async fn dispatch(&mut self, event: Event) {
        let previous = self.controller.state();
        let action = self.controller.process(&event);
        let state = self.controller.state();
        if state != previous {
            info!("lifecycle: {} -> {}", previous, state);
            self.ctx.state_mirror.set(state);
        }
        self.execute(action).await;
    }

    async fn execute(&mut self, action: Action) {
        match action {
            Action::None => {}
            Action::RunHwInit => {
                // NVS and config were opened before this worker started;
                // the remaining substeps are external collaborators.
                info!("hwinit: OTA ready, battery driver ready, power mgmt configured");
                self.ctx.events.send(Event::HardwareReady).await;
            }
            Action::StartServices => {
                let result = self
                    .ctx
                    .services
                    .start_network_services(&self.snapshot)
                    .await;
                let event = if result.is_ok() {
                    Event::ServicesStarted
                } else {
                    Event::ServicesFailed
                };
                self.ctx.events.send(event).await;
            }
            Action::StartMode(mode) => self.start_mode(mode, false).await,
            Action::StopMode(mode) => self.stop_mode(mode, false).await,
            Action::SwitchMode { stop, start } => {
                self.stop_mode(stop, false).await;
                self.start_mode(start, false).await;
            }
            Action::StopModeAndSleep(mode) => {
                self.stop_mode(mode, true).await;
                self.ctx.services.pause_for_sleep().await;
                info!("lifecycle: sleeping, checks every {} ms",
                    self.snapshot.network_check_interval_ms);
            }
            Action::WakeInto(mode) => {
                self.ctx.services.resume_after_wake(&self.snapshot).await;
                self.start_mode(mode, true).await;
            }
            Action::SuspendForPairing(mode) => {
                self.stop_mode(mode, false).await;
                self.ctx.services.start_pairing();
            }
            Action::ResumeFromPairing(mode) => {
                self.ctx.services.stop_pairing();
                self.start_mode(mode, false).await;
            }
            Action::EnableUsbPlayback => {
                self.ctx.pump_usb.playback_enabled.store(true, Ordering::Release);
            }
            Action::DisableUsbPlayback => {
                self.ctx.pump_usb.playback_enabled.store(false, Ordering::Release);
            }
            Action::AdaptSampleRate(rate) => self.adapt_sample_rate(rate).await,
            Action::Fatal => {
                error!("lifecycle: unrecoverable init failure");
            }
        }
    }

    fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.snapshot.sample_rate,
            channels: 2,
            bits_per_sample: self.snapshot.bit_depth,
        }
    }

    fn pump_for(&self, mode: DeviceMode) -> &'static PumpShared {
        if mode == DeviceMode::ReceiverUsb {
            self.ctx.pump_usb
        } else {
            self.ctx.pump_spdif
        }
    }

    fn capture_for(&self, mode: DeviceMode) -> &'static CaptureShared {
        if mode == DeviceMode::SenderUsb {
            self.ctx.capture_usb
        } else {
            self.ctx.capture_spdif
        }
    }

    /// Bring up the pipeline for `mode`; `resume` restores saved devices
    /// after a wake instead of a cold bring-up
    async fn start_mode(&mut self, mode: DeviceMode, resume: bool) {
        let cfg = &self.snapshot;
        self.ctx.counters.clear();
        info!("lifecycle: starting {}", mode);

        if mode.is_receiver() {
            let capacity = self.ctx.jitter.lock(|buf| {
                buf.borrow_mut().configure(
                    cfg.initial_buffer_size,
                    cfg.buffer_grow_step_size,
                    cfg.max_buffer_size,
                    cfg.max_grow_size,
                    LatePolicy::Strict,
                )
            });
            if capacity < cfg.max_buffer_size as usize {
                warn!(
                    "jitter: configured size {} clamped to slab of {}",
                    cfg.max_buffer_size,
                    JITTER_SLOTS
                );
            }

            let pump = self.pump_for(mode);
            pump.stopped.reset();
            pump.stop_for_sleep.store(false, Ordering::Release);
            pump.playback_enabled.store(true, Ordering::Release);
            pump.volume_percent.store(cfg.volume_percent, Ordering::Release);
            pump.silence_threshold_ms
                .store(cfg.silence_threshold_ms, Ordering::Release);
            pump.direct_write.store(cfg.use_direct_write, Ordering::Release);
            pump.start.signal(PumpParams {
                format: self.format(),
                volume_percent: cfg.volume_percent,
                silence_threshold_ms: cfg.silence_threshold_ms,
                direct_write: cfg.use_direct_write,
                resume,
            });

            let chunk_ms = self.format().chunk_duration_ms();
            self.ctx.ingress.stopped.reset();
            self.ctx.ingress.start.signal(IngressParams {
                port: cfg.port,
                jitter_delay_ms: u32::from(cfg.initial_buffer_size) * chunk_ms,
                sample_rate: cfg.sample_rate,
                local_ssrc: self.ssrc,
            });
        } else {
            self.ctx
                .egress
                .destination
                .update(cfg.sender_destination_ip, cfg.sender_destination_port);
            self.ctx
                .egress
                .silence_amplitude
                .store(cfg.silence_amplitude_threshold, Ordering::Release);
            self.ctx
                .egress
                .silence_threshold_ms
                .store(cfg.silence_threshold_ms, Ordering::Release);

            let capture = self.capture_for(mode);
            capture.stopped.reset();
            capture.stop_for_sleep.store(false, Ordering::Release);
            capture.start.signal(CaptureParams {
                format: self.format(),
                resume,
            });

            self.ctx.egress.stopped.reset();
            self.ctx.egress.start.signal(EgressParams {
                ssrc: self.ssrc,
                silence_threshold_ms: cfg.silence_threshold_ms,
            });
        }
    }

    /// Tear a mode down; returns only after every worker acknowledged
    async fn stop_mode(&mut self, mode: DeviceMode, for_sleep: bool) {
        info!("lifecycle: stopping {}", mode);
        if mode.is_receiver() {
            let pump = self.pump_for(mode);
            pump.stopped.reset();
            self.ctx.ingress.stopped.reset();
            pump.stop_for_sleep.store(for_sleep, Ordering::Release);
            pump.stop.store(true, Ordering::Release);
            self.ctx.ingress.stop.store(true, Ordering::Release);

            self.ctx.ingress.stopped.wait().await;
            pump.stopped.wait().await;
            self.ctx.jitter.lock(|buf| buf.borrow_mut().empty());
        } else {
            let capture = self.capture_for(mode);
            capture.stopped.reset();
            self.ctx.egress.stopped.reset();
            capture.stop_for_sleep.store(for_sleep, Ordering::Release);
            capture.stop.store(true, Ordering::Release);
            self.ctx.egress.stop.store(true, Ordering::Release);

            capture.stopped.wait().await;
            self.ctx.egress.stopped.wait().await;
        }
        info!("lifecycle: {} stopped", mode);
    }

    /// The config delta handler
    ///
    /// Diffs the committed configuration against the private snapshot,
    /// applies every in-place action, then routes a mode change through
    /// the state machine. The snapshot advances only after the actions
    /// completed.
    async fn handle_config_changed(&mut self) {
        let new = self.ctx.store.lock().await.config().clone();
        let delta = self.snapshot.diff(&new);
        if delta.is_empty() {
            return;
        }
        let mode = self.controller.state().mode();
        let receiver_running = mode.is_some_and(|m| m.is_receiver());
        let sender_running = mode.is_some_and(|m| m.is_sender());
        let mut restart_needed = false;

        if delta.port && receiver_running {
            self.ctx
                .ingress
                .commands
                .send(IngressCommand::ReopenPort(new.port))
                .await;
        }
        if delta.hostname {
            self.ctx.services.set_hostname(&new.hostname);
        }
        if delta.destination {
            // Effective on the next frame; harmless outside sender modes.
            self.ctx
                .egress
                .destination
                .update(new.sender_destination_ip, new.sender_destination_port);
        }
        if delta.buffer_shape {
            // Growth parameters alone reload in place; a changed ring size
            // or fill line means flushing and re-accumulating.
            let structural = self.snapshot.initial_buffer_size != new.initial_buffer_size
                || self.snapshot.max_buffer_size != new.max_buffer_size;
            self.ctx.jitter.lock(|buf| {
                let mut buf = buf.borrow_mut();
                if structural {
                    buf.configure(
                        new.initial_buffer_size,
                        new.buffer_grow_step_size,
                        new.max_buffer_size,
                        new.max_grow_size,
                        LatePolicy::Strict,
                    );
                } else {
                    buf.update_growth_params(new.buffer_grow_step_size, new.max_grow_size);
                }
            });
        }
        if delta.volume {
            self.ctx
                .pump_usb
                .volume_percent
                .store(new.volume_percent, Ordering::Release);
        }
        if delta.spdif_pin {
            if mode == Some(DeviceMode::ReceiverSpdif) {
                let pump = self.ctx.pump_spdif;
                pump.reconfig_result.reset();
                pump.reconfig
                    .signal(PumpReconfig::OutputPin(new.spdif_data_pin, new.sample_rate));
                if pump.reconfig_result.wait().await.is_err() {
                    restart_needed = true;
                }
            } else if mode == Some(DeviceMode::SenderSpdif) {
                restart_needed = true;
            }
        }
        if delta.sample_rate {
            if receiver_running {
                if self.in_place_rate_change(new.sample_rate).await.is_err() {
                    restart_needed = true;
                }
            } else if sender_running {
                restart_needed = true;
            }
        }
        if delta.sleep_policy {
            for pump in [self.ctx.pump_usb, self.ctx.pump_spdif] {
                pump.silence_threshold_ms
                    .store(new.silence_threshold_ms, Ordering::Release);
            }
            self.ctx
                .egress
                .silence_threshold_ms
                .store(new.silence_threshold_ms, Ordering::Release);
            self.ctx
                .egress
                .silence_amplitude
                .store(new.silence_amplitude_threshold, Ordering::Release);
        }
        if delta.pump_policy {
            for pump in [self.ctx.pump_usb, self.ctx.pump_spdif] {
                pump.direct_write.store(new.use_direct_write, Ordering::Release);
            }
        }
        if delta.ap_visibility {
            self.ctx
                .services
                .set_ap_visibility(new.hide_ap_when_connected, true);
        }
        if delta.discovery {
            self.ctx.services.update_discovery(&new);
        }

        // In-place work done; the snapshot moves forward before any mode
        // restart so the new pipeline starts from the new values.
        self.snapshot = new.clone();

        let mode_event = Event::ModeConfigured {
            mode: new.device_mode,
            wizard_completed: new.setup_wizard_completed,
        };
        self.dispatch(mode_event).await;

        if restart_needed && !delta.device_mode {
            if let Some(mode) = self.controller.state().mode() {
                info!("lifecycle: in-place reconfig not possible, restarting {}", mode);
                self.stop_mode(mode, false).await;
                self.start_mode(mode, false).await;
            }
        }
    }

    /// In-place sample-rate change on a running receiver
    async fn in_place_rate_change(&mut self, rate: u32) -> Result<(), ()> {
        let mode = self.controller.state().mode().ok_or(())?;
        let pump = self.pump_for(mode);
        pump.reconfig_result.reset();
        pump.reconfig.signal(PumpReconfig::SampleRate(rate));
        let result = pump.reconfig_result.wait().await.map_err(|_| ());
        self.ctx
            .ingress
            .commands
            .send(IngressCommand::SetSampleRate(rate))
            .await;
        result
    }

    /// A peer or host changed the stream rate at runtime
    async fn adapt_sample_rate(&mut self, rate: u32) {
        if self.snapshot.sample_rate == rate {
            return;
        }
        // Persist first so a fallback restart starts at the new rate.
        let persisted = self
            .ctx
            .store
            .lock()
            .await
            .commit(|cfg| cfg.set_sample_rate(rate));
        if persisted.is_err() {
            warn!("lifecycle: rate {} rejected", rate);
            return;
        }
        self.snapshot.sample_rate = rate;

        let Some(mode) = self.controller.state().mode() else {
            return;
        };
        let in_place_ok = if mode.is_receiver() {
            self.in_place_rate_change(rate).await.is_ok()
        } else {
            false
        };
        if !in_place_ok {
            info!("lifecycle: restarting {} for rate {}", mode, rate);
            self.stop_mode(mode, false).await;
            self.start_mode(mode, false).await;
        }
    }

    /// A SAP announcement arrived; adopt it if configuration says so
    async fn handle_sap_stream(
        &mut self,
        name: &str,
        origin: config_store::Ipv4Address,
        dest: config_store::Ipv4Address,
        port: u16,
    ) {
        if !self.controller.state().mode().is_some_and(|m| m.is_receiver()) {
            return;
        }
        let wanted = self.snapshot.auto_select_best_device
            || (!self.snapshot.sap_stream_name.is_empty()
                && self.snapshot.sap_stream_name.as_str() == name);
        if !wanted {
            return;
        }

        let local = self
            .ctx
            .stack
            .config_v4()
            .map(|c| config_store::Ipv4Address(c.address.address().octets()))
            .unwrap_or(config_store::Ipv4Address::UNSPECIFIED);

        match configure_stream(dest, origin, port, local) {
            StreamAction::JoinMulticast(sub) => {
                info!("lifecycle: adopting SAP stream '{}' on {}", name, sub.group);
                self.ctx
                    .ingress
                    .commands
                    .send(IngressCommand::Join(sub))
                    .await;
            }
            StreamAction::UseUnicast => {
                // Addressed straight at us; the configured port stays.
                self.ctx.ingress.commands.send(IngressCommand::Leave).await;
            }
            StreamAction::Reject => {
                warn!("lifecycle: SAP stream '{}' is not receivable here", name);
            }
        }
    }

    /// One bounded listen window on the RTP port while sleeping
    async fn sleep_network_check(&mut self) -> bool {
        let cfg = &self.snapshot;
        let mut rx_meta = [PacketMetadata::EMPTY; 4];
        let mut rx_buf = [0u8; 2048];
        let mut tx_meta = [PacketMetadata::EMPTY; 1];
        let mut tx_buf = [0u8; 16];
        let mut socket = UdpSocket::new(
            self.ctx.stack,
            &mut rx_meta,
            &mut rx_buf,
            &mut tx_meta,
            &mut tx_buf,
        );
        if socket.bind(cfg.port).is_err() {
            return false;
        }

        let mut buf = [0u8; 2048];
        let mut seen: u8 = 0;
        let deadline =
            Instant::now() + Duration::from_millis(u64::from(cfg.network_inactivity_timeout_ms));
        while Instant::now() < deadline {
            match select(socket.recv_from(&mut buf), Timer::at(deadline)).await {
                Either::First(Ok(_)) => {
                    seen = seen.saturating_add(1);
                    if seen >= cfg.activity_threshold_packets {
                        info!("sleep: {} packets seen, waking", seen);
                        return true;
                    }
                }
                Either::First(Err(_)) => {}
                Either::Second(()) => break,
            }
        }
        false
    }
}
