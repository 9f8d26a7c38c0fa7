//! Audio I/O adapters for the RTP bridge
//!
//! A uniform capability set over the two local audio paths:
//! - USB: a host-side DAC sink and a UAC2 device-side source
//! - S/PDIF: the PIO bit-streamer behind a sink and a source
//!
//! Adapters own their device handles exclusively and never share them
//! across tasks. The actual USB and S/PDIF drivers live behind the port
//! traits defined here; this crate contains the state machines, retry
//! policy and software volume only, which keeps everything host-testable.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

#[cfg(any(feature = "std", test))]
extern crate std;

pub mod gain;
pub mod spdif;
pub mod uac;
pub mod usb_sink;
pub mod usb_source;

pub use spdif::{SpdifPort, SpdifSink, SpdifSource};
pub use usb_sink::{DacDevice, DacPort, StreamConfig, UsbSink};
pub use usb_source::{UacPort, UsbSource};

use audio_pipeline::{AudioChunk, AudioFormat};

/// Errors surfaced by the audio adapters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AudioIoError {
    /// The platform lacks this peripheral
    Unsupported,
    /// No device present (unplugged, not enumerated)
    NotConnected,
    /// Enumeration or transfer deadline passed
    Timeout,
    /// Transfer failed after the bounded retries
    TransferFailed,
    /// Operation not valid in the adapter's current state
    InvalidState,
    /// The underlying driver rejected a parameter
    DriverRejected,
}

/// A local audio output the PCM pump writes to
#[allow(async_fn_in_trait)]
pub trait AudioSink {
    /// Bring the device up for `format`
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError>;
    /// Begin accepting PCM
    async fn start(&mut self) -> Result<(), AudioIoError>;
    /// Stop accepting PCM (device stays initialized)
    async fn stop(&mut self);
    /// Release the device
    async fn deinitialize(&mut self);
    /// Whether a device is currently attached and usable
    fn is_connected(&self) -> bool;
    /// Render PCM; `timeout_ms` of `u32::MAX` means wait forever
    async fn write(&mut self, pcm: &[u8], timeout_ms: u32) -> Result<(), AudioIoError>;
    /// Software gain in [0.0, 1.0]; ignored by sinks with no gain stage
    fn set_volume(&mut self, volume: f32);
    /// Park the device so the system can sleep
    async fn prepare_for_sleep(&mut self);
    /// Undo `prepare_for_sleep` using the saved device parameters
    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError>;
    /// In-place sample-rate change; USB adapts on the next open, S/PDIF
    /// retunes its output clock
    async fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        let _ = sample_rate;
        Ok(())
    }
    /// Re-route the output to another pin (S/PDIF only)
    async fn set_output_pin(&mut self, pin: u8, sample_rate: u32) -> Result<(), AudioIoError> {
        let _ = (pin, sample_rate);
        Err(AudioIoError::Unsupported)
    }
}

/// A local audio input the egress pump reads from
#[allow(async_fn_in_trait)]
pub trait AudioSource {
    /// Bring the device up for `format`
    async fn initialize(&mut self, format: AudioFormat) -> Result<(), AudioIoError>;
    /// Begin capturing
    async fn start(&mut self) -> Result<(), AudioIoError>;
    /// Stop capturing
    async fn stop(&mut self);
    /// Release the device
    async fn deinitialize(&mut self);
    /// Whether the capture side is live
    fn is_connected(&self) -> bool;
    /// Fill one chunk; returns the bytes captured
    async fn read(&mut self, out: &mut AudioChunk, timeout_ms: u32) -> Result<usize, AudioIoError>;
    /// Park the device so the system can sleep
    async fn prepare_for_sleep(&mut self);
    /// Undo `prepare_for_sleep`
    async fn restore_after_wake(&mut self) -> Result<(), AudioIoError>;
}
