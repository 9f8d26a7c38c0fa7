//! USB capture source (UAC2 device side)
//!
//! Assembles the host's 1 ms isochronous packets into full PCM chunks for
//! the egress pump. The endpoint itself lives behind [`UacPort`], driven by
//! the platform USB device stack.

use embedded_hal_async::delay::DelayNs;

use audio_pipeline::{AudioChunk, AudioFormat, PCM_CHUNK_SIZE};

use crate::uac::CaptureStats;
use crate::{AudioIoError, AudioSource};

/// Device-side USB audio seam
#[allow(async_fn_in_trait)]
pub trait UacPort {
    /// Start the function (descriptors up, endpoint armed)
    async fn enable(&mut self, format: AudioFormat) -> Result<(), AudioIoError>;
    /// Stop the function
    async fn disable(&mut self);
    /// Receive one isochronous packet; returns the bytes written
    async fn read_packet(&mut self, out: &mut [u8]) -> Result<usize, AudioIoError>;
    /// Whether the host selected the streaming alternate
    fn is_streaming(&self) -> bool;
}

/// The USB capture adapter
pub struct UsbSource<P: UacPort, D: DelayNs> {
    port: P,
    delay: D,
    running: bool,
    pending: AudioChunk,
    pending_len: usize,
    stats: CaptureStats,
}

impl<P: UacPort, D: DelayNs> UsbSource<P, D> {
    /// Create a source over a UAC2 function port
    pub fn new(port: P, delay: D) -> Self {
        Self {
            port,
            delay,
            running: false,
            pending: [0u8; PCM_CHUNK_SIZE],
            pending_len: 0,
            stats: CaptureStats::default(),
        }
    }

    /// Capture statistics
    pub fn stats(&self) -> CaptureStats {
        self.stats
    }
}

impl<P: UacPort, D: DelayNs> AudioSource for UsbSource<P, D> {
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError> {
        self.port.enable(format).await
    }

    async fn start(&mut self) -> Result<(), AudioIoError> {
        self.running = true;
        self.pending_len = 0;
        Ok(())
    }

    async fn stop(&mut self) {
        self.running = false;
    }

    async fn deinitialize(&mut self) {
        self.port.disable().await;
        self.running = false;
    }

    fn is_connected(&self) -> bool {
        self.port.is_streaming()
    }

    async fn read(&mut self, out: &mut AudioChunk, timeout_ms: u32) -> Result<usize, AudioIoError> {
        if !self.running {
            return Err(AudioIoError::InvalidState);
        }

        let mut waited_ms: u32 = 0;
        while self.pending_len < PCM_CHUNK_SIZE {
            if !self.port.is_streaming() {
                if timeout_ms != u32::MAX && waited_ms >= timeout_ms {
                    return Err(AudioIoError::Timeout);
                }
                self.delay.delay_ms(1).await;
                waited_ms = waited_ms.saturating_add(1);
                continue;
            }

            let free = &mut self.pending[self.pending_len..];
            let got = self.port.read_packet(free).await?.min(free.len());
            if got == 0 {
                if timeout_ms != u32::MAX && waited_ms >= timeout_ms {
                    return Err(AudioIoError::Timeout);
                }
                self.delay.delay_ms(1).await;
                waited_ms = waited_ms.saturating_add(1);
                continue;
            }
            self.pending_len += got;
            self.stats.packets_received = self.stats.packets_received.saturating_add(1);
            self.stats.samples_received =
                self.stats.samples_received.saturating_add((got / 2) as u64);
        }

        out.copy_from_slice(&self.pending);
        self.pending_len = 0;
        Ok(PCM_CHUNK_SIZE)
    }

    async fn prepare_for_sleep(&mut self) {
        self.port.disable().await;
        self.running = false;
    }

    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError> {
        self.port.enable(AudioFormat::default()).await?;
        self.running = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    struct MockUac {
        streaming: bool,
        packet: Vec<u8>,
        enabled: bool,
    }

    impl UacPort for &mut MockUac {
        async fn enable(&mut self, _format: AudioFormat) -> Result<(), AudioIoError> {
            self.enabled = true;
            Ok(())
        }

        async fn disable(&mut self) {
            self.enabled = false;
        }

        async fn read_packet(&mut self, out: &mut [u8]) -> Result<usize, AudioIoError> {
            let n = self.packet.len().min(out.len());
            out[..n].copy_from_slice(&self.packet[..n]);
            Ok(n)
        }

        fn is_streaming(&self) -> bool {
            self.streaming
        }
    }

    #[derive(Default)]
    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    #[tokio::test]
    async fn test_assembles_full_chunk_from_frames() {
        // 192-byte packets, as a 48 kHz host sends them.
        let mut port = MockUac {
            streaming: true,
            packet: std::vec![0x5A; 192],
            enabled: false,
        };
        let mut source = UsbSource::new(&mut port, NoDelay);
        source.initialize(AudioFormat::default()).await.unwrap();
        source.start().await.unwrap();

        let mut out = [0u8; PCM_CHUNK_SIZE];
        let got = source.read(&mut out, 100).await.unwrap();
        assert_eq!(got, PCM_CHUNK_SIZE);
        assert!(out.iter().all(|&b| b == 0x5A));
        assert_eq!(source.stats().packets_received, 6); // 6 * 192 = 1152
    }

    #[tokio::test]
    async fn test_read_before_start_rejected() {
        let mut port = MockUac {
            streaming: true,
            packet: std::vec![0; 192],
            enabled: false,
        };
        let mut source = UsbSource::new(&mut port, NoDelay);
        let mut out = [0u8; PCM_CHUNK_SIZE];
        assert_eq!(
            source.read(&mut out, 10).await,
            Err(AudioIoError::InvalidState)
        );
    }

    #[tokio::test]
    async fn test_idle_host_times_out() {
        let mut port = MockUac {
            streaming: false,
            packet: Vec::new(),
            enabled: false,
        };
        let mut source = UsbSource::new(&mut port, NoDelay);
        source.initialize(AudioFormat::default()).await.unwrap();
        source.start().await.unwrap();

        let mut out = [0u8; PCM_CHUNK_SIZE];
        assert_eq!(source.read(&mut out, 5).await, Err(AudioIoError::Timeout));
    }
}
