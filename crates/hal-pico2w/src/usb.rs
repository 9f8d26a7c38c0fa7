//! USB plumbing for the bridge
//!
//! Device side: the UAC2 streaming endpoint behind [`UacEndpointPort`],
//! used in SenderUsb mode where a host computer plays into the bridge.
//! Host side: the RP2350 USB stack has no host mode, so the DAC port
//! reports the peripheral as unsupported and ReceiverUsb refuses to start
//! on this board (the adapters handle that as a mode-entry failure).

use embassy_usb::driver::{Endpoint, EndpointError, EndpointOut};

use audio_io::usb_sink::{DacDevice, DacPort, StreamConfig};
use audio_io::usb_source::UacPort;
use audio_io::AudioIoError;
use audio_pipeline::AudioFormat;

/// UAC2 streaming endpoint wrapper
///
/// The enclosing USB device (descriptors, control requests, the
/// `embassy-usb` runner task) is assembled in `main.rs` with the
/// descriptor builders from `audio-io::uac`; this port only pulls
/// isochronous packets off the OUT endpoint.
pub struct UacEndpointPort<E: EndpointOut> {
    endpoint: E,
    streaming: bool,
}

impl<E: EndpointOut> UacEndpointPort<E> {
    /// Wrap the allocated isochronous OUT endpoint
    pub fn new(endpoint: E) -> Self {
        Self {
            endpoint,
            streaming: false,
        }
    }
}

impl<E: EndpointOut> UacPort for UacEndpointPort<E> {
    async fn enable(&mut self, _format: AudioFormat) -> Result<(), AudioIoError> {
        // Resolves once the host selects the streaming alternate.
        self.endpoint.wait_enabled().await;
        self.streaming = true;
        Ok(())
    }

    async fn disable(&mut self) {
        self.streaming = false;
    }

    async fn read_packet(&mut self, out: &mut [u8]) -> Result<usize, AudioIoError> {
        match self.endpoint.read(out).await {
            Ok(n) => Ok(n),
            Err(EndpointError::Disabled) => {
                self.streaming = false;
                Ok(0)
            }
            Err(EndpointError::BufferOverflow) => Err(AudioIoError::DriverRejected),
        }
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

/// Host-side DAC port on a board without USB host support
///
/// Every open attempt reports `Unsupported`; the lifecycle layer treats
/// that as a failed mode entry for ReceiverUsb.
pub struct NoUsbHost;

impl DacPort for NoUsbHost {
    async fn enumerate(&mut self, _timeout_ms: u32) -> Result<DacDevice, AudioIoError> {
        Err(AudioIoError::Unsupported)
    }

    async fn open(
        &mut self,
        _device: DacDevice,
        _config: StreamConfig,
    ) -> Result<(), AudioIoError> {
        Err(AudioIoError::Unsupported)
    }

    async fn write(&mut self, _pcm: &[u8], _timeout_ms: u32) -> Result<(), AudioIoError> {
        Err(AudioIoError::Unsupported)
    }

    async fn close(&mut self) {}

    fn is_attached(&self) -> bool {
        false
    }
}
