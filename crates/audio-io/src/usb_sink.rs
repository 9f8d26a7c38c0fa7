//! USB DAC sink
//!
//! Drives an attached USB audio device through the host-side port trait.
//! The adapter owns the connection state machine
//! (Disconnected -> Enumerating -> Ready -> Streaming), bounded transfer
//! retries with exponential backoff, and reconnection after persistent
//! failures. The device address and stream configuration of the last
//! successful open are kept so a wake from sleep re-opens the exact same
//! device without re-enumeration.

use embedded_hal_async::delay::DelayNs;

use audio_pipeline::{AudioChunk, AudioFormat, PCM_CHUNK_SIZE};

use crate::{gain, AudioIoError, AudioSink};

/// Enumeration deadline
pub const ENUMERATION_TIMEOUT_MS: u32 = 5000;

/// First retry delay after a failed transfer
const WRITE_RETRY_BASE_MS: u32 = 100;

/// Transfer attempts before reconnection kicks in
const WRITE_ATTEMPTS: u32 = 3;

/// Reconnection attempts before the sink gives up
const RECONNECT_ATTEMPTS: u32 = 5;

/// First reconnection delay; doubles per attempt
const RECONNECT_BASE_MS: u32 = 200;

/// Identity of an enumerated DAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DacDevice {
    /// Bus address assigned at enumeration
    pub address: u8,
    /// Streaming interface number
    pub interface: u8,
}

/// Stream parameters negotiated with the DAC
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamConfig {
    /// Channel count (always 2 on this bridge)
    pub channels: u8,
    /// Bits per sample
    pub bit_resolution: u8,
    /// Sample rate in Hz
    pub sample_freq: u32,
}

impl StreamConfig {
    /// Derive from the pipeline format
    pub const fn from_format(format: AudioFormat) -> Self {
        Self {
            channels: format.channels,
            bit_resolution: format.bits_per_sample,
            sample_freq: format.sample_rate,
        }
    }
}

/// Host-side USB audio driver seam
///
/// Implemented by the platform USB host stack; the adapter never touches
/// descriptors or endpoints itself.
#[allow(async_fn_in_trait)]
pub trait DacPort {
    /// Wait for a DAC to appear and enumerate it
    async fn enumerate(&mut self, timeout_ms: u32) -> Result<DacDevice, AudioIoError>;
    /// Open the streaming interface at the given configuration
    async fn open(&mut self, device: DacDevice, config: StreamConfig) -> Result<(), AudioIoError>;
    /// Submit one PCM block
    async fn write(&mut self, pcm: &[u8], timeout_ms: u32) -> Result<(), AudioIoError>;
    /// Release the interface
    async fn close(&mut self);
    /// Whether the device is physically present
    fn is_attached(&self) -> bool;
}

/// Connection state of the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SinkState {
    /// No device
    #[default]
    Disconnected,
    /// Waiting for enumeration to finish
    Enumerating,
    /// Device open, not streaming
    Ready,
    /// Accepting PCM
    Streaming,
}

/// The USB DAC sink adapter
pub struct UsbSink<P: DacPort, D: DelayNs> {
    port: P,
    delay: D,
    state: SinkState,
    volume_percent: u8,
    saved_device: Option<(DacDevice, StreamConfig)>,
    format: AudioFormat,
    scratch: AudioChunk,
}

impl<P: DacPort, D: DelayNs> UsbSink<P, D> {
    /// Create a sink over a driver port
    pub fn new(port: P, delay: D) -> Self {
        Self {
            port,
            delay,
            state: SinkState::Disconnected,
            volume_percent: 100,
            saved_device: None,
            format: AudioFormat::default(),
            scratch: [0u8; PCM_CHUNK_SIZE],
        }
    }

    /// Current connection state
    pub fn state(&self) -> SinkState {
        self.state
    }

    /// Device parameters of the last successful open
    pub fn saved_device(&self) -> Option<(DacDevice, StreamConfig)> {
        self.saved_device
    }

    async fn open_device(
        &mut self,
        device: DacDevice,
        config: StreamConfig,
    ) -> Result<(), AudioIoError> {
        self.port.open(device, config).await?;
        self.saved_device = Some((device, config));
        self.state = SinkState::Ready;
        Ok(())
    }

    /// Tear down and re-open the saved device, backing off between attempts
    async fn reconnect(&mut self) -> Result<(), AudioIoError> {
        let Some((device, config)) = self.saved_device else {
            return Err(AudioIoError::NotConnected);
        };
        let was_streaming = self.state == SinkState::Streaming;

        for attempt in 0..RECONNECT_ATTEMPTS {
            self.port.close().await;
            self.delay.delay_ms(RECONNECT_BASE_MS << attempt).await;

            let result = match self.port.open(device, config).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    // The device may have re-enumerated at a new address.
                    match self.port.enumerate(ENUMERATION_TIMEOUT_MS).await {
                        Ok(fresh) => self.port.open(fresh, config).await.map(|()| {
                            self.saved_device = Some((fresh, config));
                        }),
                        Err(e) => Err(e),
                    }
                }
            };
            if result.is_ok() {
                self.state = if was_streaming {
                    SinkState::Streaming
                } else {
                    SinkState::Ready
                };
                return Ok(());
            }
        }

        self.state = SinkState::Disconnected;
        Err(AudioIoError::NotConnected)
    }
}

impl<P: DacPort, D: DelayNs> AudioSink for UsbSink<P, D> {
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError> {
        self.format = format;
        self.state = SinkState::Enumerating;
        let device = match self.port.enumerate(ENUMERATION_TIMEOUT_MS).await {
            Ok(device) => device,
            Err(e) => {
                self.state = SinkState::Disconnected;
                return Err(e);
            }
        };
        match self
            .open_device(device, StreamConfig::from_format(format))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                self.state = SinkState::Disconnected;
                Err(e)
            }
        }
    }

    async fn start(&mut self) -> Result<(), AudioIoError> {
        match self.state {
            SinkState::Ready => {
                self.state = SinkState::Streaming;
                Ok(())
            }
            SinkState::Streaming => Ok(()),
            _ => Err(AudioIoError::InvalidState),
        }
    }

    async fn stop(&mut self) {
        if self.state == SinkState::Streaming {
            self.state = SinkState::Ready;
        }
    }

    async fn deinitialize(&mut self) {
        self.port.close().await;
        self.state = SinkState::Disconnected;
        self.saved_device = None;
    }

    fn is_connected(&self) -> bool {
        matches!(self.state, SinkState::Ready | SinkState::Streaming) && self.port.is_attached()
    }

    async fn write(&mut self, pcm: &[u8], timeout_ms: u32) -> Result<(), AudioIoError> {
        if self.state != SinkState::Streaming {
            return Err(AudioIoError::InvalidState);
        }
        if pcm.len() > PCM_CHUNK_SIZE {
            return Err(AudioIoError::DriverRejected);
        }

        // Gain is applied on a scratch copy; the caller's chunk may be
        // retransmitted at a different volume.
        let block = &mut self.scratch[..pcm.len()];
        block.copy_from_slice(pcm);
        gain::apply_volume(block, self.volume_percent);

        for attempt in 0..WRITE_ATTEMPTS {
            match self.port.write(&self.scratch[..pcm.len()], timeout_ms).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    self.delay.delay_ms(WRITE_RETRY_BASE_MS << attempt).await;
                }
            }
        }

        // Transfers keep failing; try to get the device back.
        self.reconnect().await?;
        self.port
            .write(&self.scratch[..pcm.len()], timeout_ms)
            .await
            .map_err(|_| {
                self.state = SinkState::Disconnected;
                AudioIoError::TransferFailed
            })
    }

    fn set_volume(&mut self, volume: f32) {
        self.volume_percent = (volume.clamp(0.0, 1.0) * 100.0 + 0.5) as u8;
    }

    async fn prepare_for_sleep(&mut self) {
        // Keep saved_device: the wake path re-opens it directly.
        self.port.close().await;
        self.state = SinkState::Disconnected;
    }

    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError> {
        match self.saved_device {
            Some((device, config)) => self.open_device(device, config).await,
            // Nothing saved: full bring-up.
            None => self.initialize(self.format).await,
        }
    }

    async fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        // The DAC follows the stream clock; remember the rate for the next
        // open so a reconnection negotiates it.
        self.format.sample_rate = sample_rate;
        if let Some((device, mut config)) = self.saved_device {
            config.sample_freq = sample_rate;
            self.saved_device = Some((device, config));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    #[derive(Default)]
    struct MockPort {
        attached: bool,
        enumerations: u32,
        opens: Vec<DacDevice>,
        writes: Vec<Vec<u8>>,
        closes: u32,
        fail_writes: u32,
        fail_opens: u32,
        fail_enumerate: bool,
    }

    impl DacPort for &mut MockPort {
        async fn enumerate(&mut self, _timeout_ms: u32) -> Result<DacDevice, AudioIoError> {
            self.enumerations += 1;
            if self.fail_enumerate {
                return Err(AudioIoError::Timeout);
            }
            self.attached = true;
            Ok(DacDevice {
                address: 4,
                interface: 1,
            })
        }

        async fn open(
            &mut self,
            device: DacDevice,
            _config: StreamConfig,
        ) -> Result<(), AudioIoError> {
            if self.fail_opens > 0 {
                self.fail_opens -= 1;
                return Err(AudioIoError::NotConnected);
            }
            self.opens.push(device);
            Ok(())
        }

        async fn write(&mut self, pcm: &[u8], _timeout_ms: u32) -> Result<(), AudioIoError> {
            if self.fail_writes > 0 {
                self.fail_writes -= 1;
                return Err(AudioIoError::TransferFailed);
            }
            self.writes.push(pcm.to_vec());
            Ok(())
        }

        async fn close(&mut self) {
            self.closes += 1;
        }

        fn is_attached(&self) -> bool {
            self.attached
        }
    }

    /// Delay that only records what it was asked to wait
    #[derive(Default)]
    struct MockDelay {
        waits_ms: Vec<u32>,
    }

    impl DelayNs for &mut MockDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.waits_ms.push(ns / 1_000_000);
        }
    }

    fn pcm(fill: i16) -> Vec<u8> {
        core::iter::repeat(fill.to_le_bytes())
            .take(64)
            .flatten()
            .collect()
    }

    #[tokio::test]
    async fn test_initialize_saves_device_params() {
        let mut port = MockPort::default();
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);

        sink.initialize(AudioFormat::default()).await.unwrap();
        assert_eq!(sink.state(), SinkState::Ready);
        let (device, config) = sink.saved_device().unwrap();
        assert_eq!(device.address, 4);
        assert_eq!(config.sample_freq, 48000);
        assert_eq!(config.channels, 2);
    }

    #[tokio::test]
    async fn test_enumeration_timeout_leaves_disconnected() {
        let mut port = MockPort {
            fail_enumerate: true,
            ..Default::default()
        };
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);

        assert_eq!(
            sink.initialize(AudioFormat::default()).await,
            Err(AudioIoError::Timeout)
        );
        assert_eq!(sink.state(), SinkState::Disconnected);
        assert!(!sink.is_connected());
    }

    #[tokio::test]
    async fn test_write_requires_streaming() {
        let mut port = MockPort::default();
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();

        assert_eq!(
            sink.write(&pcm(1), 100).await,
            Err(AudioIoError::InvalidState)
        );
        sink.start().await.unwrap();
        sink.write(&pcm(1), 100).await.unwrap();
    }

    #[tokio::test]
    async fn test_volume_applied_to_transfers_only() {
        let mut port = MockPort::default();
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();
        sink.start().await.unwrap();
        sink.set_volume(0.5);

        let original = pcm(1000);
        sink.write(&original, 100).await.unwrap();

        let sent = &sink.port.writes[0];
        assert_eq!(i16::from_le_bytes([sent[0], sent[1]]), 500);
        assert_eq!(original, pcm(1000), "caller's buffer untouched");
    }

    #[tokio::test]
    async fn test_write_retries_back_off_exponentially() {
        let mut port = MockPort {
            fail_writes: 2,
            ..Default::default()
        };
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();
        sink.start().await.unwrap();

        sink.write(&pcm(7), 100).await.unwrap();
        assert_eq!(sink.delay.waits_ms, std::vec![100, 200]);
    }

    #[tokio::test]
    async fn test_persistent_failure_reconnects_saved_device() {
        let mut port = MockPort {
            fail_writes: 3, // all bounded retries fail, reconnect write succeeds
            ..Default::default()
        };
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();
        sink.start().await.unwrap();

        sink.write(&pcm(7), 100).await.unwrap();
        assert_eq!(sink.state(), SinkState::Streaming);
        assert!(sink.port.closes >= 1);
        assert_eq!(sink.port.opens.len(), 2, "initial open plus reconnection");
        // Backoffs: three write retries then the first reconnect delay.
        assert_eq!(sink.delay.waits_ms, std::vec![100, 200, 400, 200]);
    }

    #[tokio::test]
    async fn test_sleep_wake_reopens_without_enumeration() {
        let mut port = MockPort::default();
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();
        sink.start().await.unwrap();

        sink.prepare_for_sleep().await;
        assert_eq!(sink.state(), SinkState::Disconnected);

        let enumerations_before = sink.port.enumerations;
        sink.restore_after_wake().await.unwrap();
        assert_eq!(sink.state(), SinkState::Ready);
        assert_eq!(
            sink.port.enumerations, enumerations_before,
            "wake must re-open the saved device, not re-enumerate"
        );
    }

    #[tokio::test]
    async fn test_deinitialize_forgets_device() {
        let mut port = MockPort::default();
        let mut delay = MockDelay::default();
        let mut sink = UsbSink::new(&mut port, &mut delay);
        sink.initialize(AudioFormat::default()).await.unwrap();

        sink.deinitialize().await;
        assert_eq!(sink.saved_device(), None);
        assert!(!sink.is_connected());
    }
}
