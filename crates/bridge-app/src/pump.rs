//! The PCM pump
//!
//! One long-lived task per boot: waits for a start command, then moves
//! chunks from the jitter buffer into the active audio sink until stopped.
//! Owns receiver-side silence detection and applies in-place
//! reconfiguration (volume, sample rate, S/PDIF pin) without a restart.

use core::sync::atomic::Ordering;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use embassy_time::{Instant, Timer};
use portable_atomic::{AtomicBool, AtomicU32, AtomicU8};

use audio_io::{AudioIoError, AudioSink};
use audio_pipeline::{AudioFormat, PopOutcome, SILENT_CHUNK};

use crate::control::Counters;
use crate::lifecycle::Event;
use crate::{EventSender, JitterMutex};

use rtp_wire::MasterClock;

/// Silence durations beyond this are clock anomalies, not real silence
pub const SILENCE_ANOMALY_MS: u64 = 30_000;

/// Write timeout used when direct write is off
const BOUNDED_WRITE_TIMEOUT_MS: u32 = 20;

/// Tracks continuous buffer silence and fires the sleep request once
///
/// Elapsed time is recomputed from the monotonic clock on every empty
/// iteration; tick-counter semantics never leak in here.
pub struct SilenceDetector {
    threshold_ms: u32,
    silent_since: Option<u64>,
    fired: bool,
}

impl SilenceDetector {
    /// Create a detector with the configured threshold
    pub const fn new(threshold_ms: u32) -> Self {
        Self {
            threshold_ms,
            silent_since: None,
            fired: false,
        }
    }

    /// Adopt a changed threshold without restarting the window
    pub fn set_threshold(&mut self, threshold_ms: u32) {
        self.threshold_ms = threshold_ms;
    }

    /// Audio flowed; the silence window restarts
    pub fn on_audio(&mut self) {
        self.silent_since = None;
        self.fired = false;
    }

    /// Nothing to play right now; true exactly once per continuous window
    /// when the threshold is crossed
    pub fn on_silence(&mut self, now_ms: u64) -> bool {
        let Some(since) = self.silent_since else {
            self.silent_since = Some(now_ms);
            return false;
        };
        let elapsed = now_ms.saturating_sub(since);
        if elapsed > SILENCE_ANOMALY_MS {
            // A jump this large is a stepped clock, not silence.
            self.silent_since = Some(now_ms);
            return false;
        }
        if !self.fired && elapsed >= u64::from(self.threshold_ms) {
            self.fired = true;
            return true;
        }
        false
    }
}

/// Start parameters for one pump run
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PumpParams {
    /// PCM format the sink is brought up with
    pub format: AudioFormat,
    /// Initial software volume (percent)
    pub volume_percent: u8,
    /// Cached sleep threshold
    pub silence_threshold_ms: u32,
    /// Unbounded sink writes when set
    pub direct_write: bool,
    /// Wake from sleep: restore the saved device instead of enumerating
    pub resume: bool,
}

/// In-place reconfiguration requests the pump applies between chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PumpReconfig {
    /// Pause, retune the sink clock, resume
    SampleRate(u32),
    /// Re-route the S/PDIF output (pin, current rate)
    OutputPin(u8, u32),
}

/// Shared control block between the lifecycle worker and the pump task
pub struct PumpShared {
    /// Start request with parameters
    pub start: Signal<CriticalSectionRawMutex, PumpParams>,
    /// Stop request flag, observed between chunks
    pub stop: AtomicBool,
    /// Park for sleep instead of releasing the device on stop
    pub stop_for_sleep: AtomicBool,
    /// Acknowledged once the sink is released
    pub stopped: Signal<CriticalSectionRawMutex, ()>,
    /// DAC hotplug gate; cleared while no sink device is present
    pub playback_enabled: AtomicBool,
    /// Live volume (percent), applied on change
    pub volume_percent: AtomicU8,
    /// Live sleep threshold
    pub silence_threshold_ms: AtomicU32,
    /// Live direct-write policy
    pub direct_write: AtomicBool,
    /// One pending in-place reconfiguration
    pub reconfig: Signal<CriticalSectionRawMutex, PumpReconfig>,
    /// Outcome of the last reconfiguration request
    pub reconfig_result: Signal<CriticalSectionRawMutex, Result<(), AudioIoError>>,
}

impl PumpShared {
    /// Create an idle control block
    pub const fn new() -> Self {
        Self {
            start: Signal::new(),
            stop: AtomicBool::new(false),
            stop_for_sleep: AtomicBool::new(false),
            stopped: Signal::new(),
            playback_enabled: AtomicBool::new(true),
            volume_percent: AtomicU8::new(100),
            silence_threshold_ms: AtomicU32::new(10_000),
            direct_write: AtomicBool::new(false),
            reconfig: Signal::new(),
            reconfig_result: Signal::new(),
        }
    }
}

/// Run the pump forever over a concrete sink
///
/// Spawned once at boot from the task wrapper in `main.rs`; mode start and
/// stop arrive through `shared`.
pub async fn run_pump<S: AudioSink>(
    shared: &PumpShared,
    jitter: &JitterMutex,
    clock: &MasterClock,
    counters: &Counters,
    events: EventSender,
    sink: &mut S,
) -> ! {
    loop {
        let params = shared.start.wait().await;
        shared.stop.store(false, Ordering::Release);

        let up = if params.resume {
            sink.restore_after_wake().await
        } else {
            sink.initialize(params.format).await
        };
        let up = match up {
            Ok(()) => sink.start().await,
            Err(e) => Err(e),
        };
        if let Err(e) = up {
            error!("pump: sink bring-up failed: {}", e);
            counters.sink_errors.fetch_add(1, Ordering::Relaxed);
            let _ = events.try_send(Event::ModeStartFailed);
            // Park until the lifecycle worker tears the mode down, so the
            // stop handshake stays symmetric with the healthy path.
            while !shared.stop.load(Ordering::Acquire) {
                Timer::after_millis(10).await;
            }
            shared.stopped.signal(());
            continue;
        }

        sink.set_volume(f32::from(params.volume_percent) / 100.0);
        let mut last_volume = params.volume_percent;
        let mut detector = SilenceDetector::new(params.silence_threshold_ms);
        let mut chunk = SILENT_CHUNK;
        let mut in_underrun = false;

        info!("pump: running");
        while !shared.stop.load(Ordering::Acquire) {
            // Live settings pushed by the delta handler.
            let volume = shared.volume_percent.load(Ordering::Relaxed);
            if volume != last_volume {
                sink.set_volume(f32::from(volume) / 100.0);
                last_volume = volume;
            }
            detector.set_threshold(shared.silence_threshold_ms.load(Ordering::Relaxed));
            if let Some(request) = shared.reconfig.try_take() {
                let result = apply_reconfig(sink, jitter, request).await;
                if let Err(e) = result {
                    warn!("pump: in-place reconfig failed: {}", e);
                }
                shared.reconfig_result.signal(result);
            }

            // Playout deadlines live in the master domain; the silence
            // timer stays on the monotonic clock, which NTP cannot step.
            let local_ms = Instant::now().as_millis();
            let master_ms = clock.master_ms(local_ms);
            let outcome = jitter.lock(|buf| buf.borrow_mut().pop_timed(master_ms, &mut chunk));

            match outcome {
                PopOutcome::Ready(popped) => {
                    detector.on_audio();
                    in_underrun = false;
                    if !shared.playback_enabled.load(Ordering::Acquire) {
                        continue;
                    }
                    let pcm = &chunk[popped.skip_bytes.min(chunk.len())..];
                    let timeout = if shared.direct_write.load(Ordering::Relaxed) {
                        u32::MAX
                    } else {
                        BOUNDED_WRITE_TIMEOUT_MS
                    };
                    if sink.write(pcm, timeout).await.is_err() {
                        counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
                PopOutcome::NotYet => Timer::after_millis(1).await,
                PopOutcome::Empty => {
                    if !in_underrun {
                        in_underrun = true;
                        counters.underruns.fetch_add(1, Ordering::Relaxed);
                    }
                    if detector.on_silence(local_ms) {
                        info!("pump: silence threshold crossed, requesting sleep");
                        let _ = events.try_send(Event::EnterSleep);
                    }
                    Timer::after_millis(1).await;
                }
            }
        }

        sink.stop().await;
        if shared.stop_for_sleep.load(Ordering::Acquire) {
            sink.prepare_for_sleep().await;
        } else {
            sink.deinitialize().await;
        }
        info!("pump: stopped");
        shared.stopped.signal(());
    }
}

async fn apply_reconfig<S: AudioSink>(
    sink: &mut S,
    jitter: &JitterMutex,
    request: PumpReconfig,
) -> Result<(), AudioIoError> {
    match request {
        PumpReconfig::SampleRate(rate) => {
            // Pause, retune, resume; stale chunks are at the old rate.
            sink.stop().await;
            jitter.lock(|buf| buf.borrow_mut().empty());
            sink.set_sample_rate(rate).await?;
            sink.start().await
        }
        PumpReconfig::OutputPin(pin, rate) => sink.set_output_pin(pin, rate).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fires_once_at_threshold() {
        let mut d = SilenceDetector::new(5000);
        assert!(!d.on_silence(1000));
        assert!(!d.on_silence(3000));
        assert!(!d.on_silence(5999));
        assert!(d.on_silence(6000), "threshold crossed");
        assert!(!d.on_silence(7000), "fires exactly once");
    }

    #[test]
    fn test_audio_resets_window() {
        let mut d = SilenceDetector::new(5000);
        assert!(!d.on_silence(0));
        d.on_audio();
        assert!(!d.on_silence(5500), "window restarted");
        assert!(d.on_silence(10_500));

        // And the one-shot latch re-arms too.
        d.on_audio();
        assert!(!d.on_silence(20_000));
        assert!(d.on_silence(25_000));
    }

    #[test]
    fn test_clock_jump_resets_instead_of_sleeping() {
        let mut d = SilenceDetector::new(5000);
        assert!(!d.on_silence(1000));
        // Clock stepped far forward: treat as anomaly, not silence.
        assert!(!d.on_silence(100_000));
        // The window restarted at the new time base.
        assert!(d.on_silence(105_000));
    }

    #[test]
    fn test_threshold_change_applies_to_running_window() {
        let mut d = SilenceDetector::new(30_000);
        assert!(!d.on_silence(0));
        assert!(!d.on_silence(6000));
        d.set_threshold(5000);
        assert!(d.on_silence(6001));
    }
}
