//! S/PDIF sink and source
//!
//! Thin adapters over the PIO bit-streamer. The driver exposes a hardware
//! FIFO with non-blocking writes; the sink paces itself against it. There
//! is no gain stage on this path, so `set_volume` is a no-op.

use embedded_hal_async::delay::DelayNs;

use audio_pipeline::{AudioChunk, AudioFormat, PCM_CHUNK_SIZE};

use crate::{AudioIoError, AudioSink, AudioSource};

/// S/PDIF bit-streamer seam
///
/// Implemented by the platform PIO driver; biphase-mark encoding and
/// subframe packing happen behind this trait.
pub trait SpdifPort {
    /// Set up the streamer on `pin` at `sample_rate`
    fn init(&mut self, sample_rate: u32, pin: u8) -> Result<(), AudioIoError>;
    /// Non-blocking: push PCM into the hardware FIFO, returning the bytes
    /// accepted
    fn write(&mut self, pcm_le: &[u8]) -> usize;
    /// Non-blocking: pull captured PCM, returning the bytes produced
    fn read(&mut self, out: &mut [u8]) -> usize;
    /// Retune the output clock at runtime
    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), AudioIoError>;
    /// Release the state machine and pin
    fn deinit(&mut self);
}

/// S/PDIF output adapter
pub struct SpdifSink<P: SpdifPort, D: DelayNs> {
    port: P,
    delay: D,
    pin: u8,
    format: AudioFormat,
    initialized: bool,
    running: bool,
}

impl<P: SpdifPort, D: DelayNs> SpdifSink<P, D> {
    /// Create a sink that will stream on `pin`
    pub fn new(port: P, delay: D, pin: u8) -> Self {
        Self {
            port,
            delay,
            pin,
            format: AudioFormat::default(),
            initialized: false,
            running: false,
        }
    }

    /// Re-initialize on a different pin with the current clock
    ///
    /// Serves the in-place `spdif_data_pin` reconfiguration.
    pub fn change_pin(&mut self, pin: u8, sample_rate: u32) -> Result<(), AudioIoError> {
        self.pin = pin;
        if self.initialized {
            self.port.deinit();
            self.port.init(sample_rate, pin)?;
        }
        Ok(())
    }

    /// Retune the output clock (in-place sample-rate reconfiguration)
    pub fn retune(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        if !self.initialized {
            return Err(AudioIoError::InvalidState);
        }
        self.port.set_sample_rate(sample_rate)
    }
}

impl<P: SpdifPort, D: DelayNs> AudioSink for SpdifSink<P, D> {
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError> {
        self.port.init(format.sample_rate, self.pin)?;
        self.format = format;
        self.initialized = true;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), AudioIoError> {
        if !self.initialized {
            return Err(AudioIoError::InvalidState);
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;
    }

    async fn deinitialize(&mut self) {
        self.port.deinit();
        self.initialized = false;
        self.running = false;
    }

    fn is_connected(&self) -> bool {
        // The optical link has no presence detection.
        self.initialized
    }

    async fn write(&mut self, pcm: &[u8], timeout_ms: u32) -> Result<(), AudioIoError> {
        if !self.running {
            return Err(AudioIoError::InvalidState);
        }

        let mut offset = 0;
        let mut waited_ms: u32 = 0;
        while offset < pcm.len() {
            let accepted = self.port.write(&pcm[offset..]);
            if accepted == 0 {
                // FIFO full; one chunk drains in ~6 ms, poll at 1 ms.
                if timeout_ms != u32::MAX && waited_ms >= timeout_ms {
                    return Err(AudioIoError::Timeout);
                }
                self.delay.delay_ms(1).await;
                waited_ms = waited_ms.saturating_add(1);
                continue;
            }
            offset += accepted;
        }
        Ok(())
    }

    fn set_volume(&mut self, _volume: f32) {
        // Bit-exact path; the receiver owns its own attenuation.
    }

    async fn prepare_for_sleep(&mut self) {
        self.port.deinit();
        self.initialized = false;
        self.running = false;
    }

    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError> {
        self.port.init(self.format.sample_rate, self.pin)?;
        self.initialized = true;
        Ok(())
    }

    async fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        self.format.sample_rate = sample_rate;
        self.retune(sample_rate)
    }

    async fn set_output_pin(&mut self, pin: u8, sample_rate: u32) -> Result<(), AudioIoError> {
        self.change_pin(pin, sample_rate)
    }
}

/// S/PDIF capture adapter
pub struct SpdifSource<P: SpdifPort, D: DelayNs> {
    port: P,
    delay: D,
    pin: u8,
    format: AudioFormat,
    initialized: bool,
    running: bool,
}

impl<P: SpdifPort, D: DelayNs> SpdifSource<P, D> {
    /// Create a source capturing from `pin`
    pub fn new(port: P, delay: D, pin: u8) -> Self {
        Self {
            port,
            delay,
            pin,
            format: AudioFormat::default(),
            initialized: false,
            running: false,
        }
    }
}

impl<P: SpdifPort, D: DelayNs> AudioSource for SpdifSource<P, D> {
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError> {
        self.port.init(format.sample_rate, self.pin)?;
        self.format = format;
        self.initialized = true;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), AudioIoError> {
        if !self.initialized {
            return Err(AudioIoError::InvalidState);
        }
        self.running = true;
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;
    }

    async fn deinitialize(&mut self) {
        self.port.deinit();
        self.initialized = false;
        self.running = false;
    }

    fn is_connected(&self) -> bool {
        self.initialized
    }

    async fn read(&mut self, out: &mut AudioChunk, timeout_ms: u32) -> Result<usize, AudioIoError> {
        if !self.running {
            return Err(AudioIoError::InvalidState);
        }

        let mut filled = 0;
        let mut waited_ms: u32 = 0;
        while filled < PCM_CHUNK_SIZE {
            let got = self.port.read(&mut out[filled..]);
            if got == 0 {
                if timeout_ms != u32::MAX && waited_ms >= timeout_ms {
                    return Err(AudioIoError::Timeout);
                }
                self.delay.delay_ms(1).await;
                waited_ms = waited_ms.saturating_add(1);
                continue;
            }
            filled += got;
        }
        Ok(filled)
    }

    async fn prepare_for_sleep(&mut self) {
        self.port.deinit();
        self.initialized = false;
        self.running = false;
    }

    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError> {
        self.port.init(self.format.sample_rate, self.pin)?;
        self.initialized = true;
        Ok(())
    }
}
