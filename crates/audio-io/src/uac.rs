//! USB Audio Class 2.0 device function
//!
//! In SenderUsb mode the bridge enumerates as a UAC2 speaker so a host
//! computer streams PCM into it; that PCM leaves over RTP. This module
//! holds the descriptor builders and streaming bookkeeping; endpoint
//! plumbing belongs to the platform USB device stack.
//!
//! The topology is the smallest legal speaker: one internal clock source
//! feeding a USB-streaming input terminal wired straight to a speaker
//! output terminal, plus one streaming interface with a zero-bandwidth
//! alternate and one active alternate carrying the isochronous OUT
//! endpoint.

use heapless::Vec;

/// Largest isochronous audio packet (48 kHz stereo 16-bit @ 1 ms + margin)
pub const MAX_USB_AUDIO_PACKET: usize = 196;

/// USB Audio Class codes
pub mod class {
    /// Audio class
    pub const AUDIO: u8 = 0x01;
    /// Audio Control subclass
    pub const AUDIO_CONTROL: u8 = 0x01;
    /// Audio Streaming subclass
    pub const AUDIO_STREAMING: u8 = 0x02;
    /// UAC2 protocol
    pub const UAC2_PROTOCOL: u8 = 0x20;
}

/// Descriptor types used by the audio function
mod desc {
    pub const INTERFACE: u8 = 0x04;
    pub const ENDPOINT: u8 = 0x05;
    pub const CS_INTERFACE: u8 = 0x24;
    pub const CS_ENDPOINT: u8 = 0x25;
}

/// UAC2 class-specific subtypes
mod subtype {
    pub const AC_HEADER: u8 = 0x01;
    pub const INPUT_TERMINAL: u8 = 0x02;
    pub const OUTPUT_TERMINAL: u8 = 0x03;
    pub const CLOCK_SOURCE: u8 = 0x0A;
    pub const AS_GENERAL: u8 = 0x01;
    pub const FORMAT_TYPE: u8 = 0x02;
    pub const EP_GENERAL: u8 = 0x01;
}

/// Entity IDs of the speaker topology
mod entity {
    /// Internal fixed-frequency clock
    pub const CLOCK: u8 = 1;
    /// USB-streaming input terminal
    pub const USB_IN: u8 = 1;
    /// Speaker output terminal
    pub const SPEAKER_OUT: u8 = 2;
}

/// bmChannelConfig for front left + front right
const STEREO_CHANNEL_CONFIG: [u8; 4] = 0x0000_0003u32.to_le_bytes();

/// UAC2 function configuration
#[derive(Debug, Clone)]
pub struct Uac2Config {
    /// Product string shown to the host
    pub name: &'static str,
    /// Vendor ID
    pub vid: u16,
    /// Product ID
    pub pid: u16,
    /// Number of channels
    pub channels: u8,
    /// Bits per sample
    pub bit_depth: u8,
    /// Sample rates offered to the host
    pub sample_rates: &'static [u32],
}

impl Default for Uac2Config {
    fn default() -> Self {
        Self {
            name: "RTP Audio Bridge",
            vid: 0x1209, // pid.codes test VID
            pid: 0x4A10,
            channels: 2,
            bit_depth: 16,
            sample_rates: &[44100, 48000],
        }
    }
}

/// Appends length-prefixed descriptor elements to a caller buffer
///
/// Every USB descriptor is `[bLength, bDescriptorType, body...]`; keeping
/// the framing here lets the builders work from plain body tables.
struct ElementWriter<'a> {
    buf: &'a mut [u8],
    len: usize,
}

impl<'a> ElementWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, len: 0 }
    }

    fn put(&mut self, descriptor_type: u8, body: &[u8]) {
        let total = 2 + body.len();
        assert!(self.len + total <= self.buf.len(), "Buffer too small");
        self.buf[self.len] = total as u8;
        self.buf[self.len + 1] = descriptor_type;
        self.buf[self.len + 2..self.len + total].copy_from_slice(body);
        self.len += total;
    }

    fn finish(self) -> usize {
        self.len
    }
}

/// Standard interface descriptor body for an audio interface
fn interface_body(number: u8, alternate: u8, endpoints: u8, sub_class: u8) -> [u8; 7] {
    [
        number,
        alternate,
        endpoints,
        class::AUDIO,
        sub_class,
        class::UAC2_PROTOCOL,
        0, // iInterface
    ]
}

/// Audio Control interface descriptor builder
pub struct AudioControlDescriptor {
    config: Uac2Config,
}

impl AudioControlDescriptor {
    /// Create a builder for `config`
    pub fn new(config: Uac2Config) -> Self {
        Self { config }
    }

    /// Build the control interface with its entity chain
    pub fn build(&self, buf: &mut [u8]) -> usize {
        // Entity bodies first so the header can carry the real
        // wTotalLength of the class-specific block.
        let clock_source = [
            subtype::CLOCK_SOURCE,
            entity::CLOCK,
            0x01, // internal fixed clock
            0x01, // frequency readable
            0x00, // no associated terminal
            0x00, // iClockSource
        ];

        let mut input_terminal = [0u8; 15];
        input_terminal[0] = subtype::INPUT_TERMINAL;
        input_terminal[1] = entity::USB_IN;
        input_terminal[2..4].copy_from_slice(&0x0101u16.to_le_bytes()); // USB streaming
        input_terminal[4] = 0x00; // no associated terminal
        input_terminal[5] = entity::CLOCK;
        input_terminal[6] = self.config.channels;
        input_terminal[7..11].copy_from_slice(&STEREO_CHANNEL_CONFIG);
        // iChannelNames, bmControls, iTerminal stay zero.

        let mut output_terminal = [0u8; 10];
        output_terminal[0] = subtype::OUTPUT_TERMINAL;
        output_terminal[1] = entity::SPEAKER_OUT;
        output_terminal[2..4].copy_from_slice(&0x0301u16.to_le_bytes()); // speaker
        output_terminal[4] = 0x00; // no associated terminal
        output_terminal[5] = entity::USB_IN; // audio comes from the input terminal
        output_terminal[6] = entity::CLOCK;
        // bmControls and iTerminal stay zero.

        let cs_total = (2 + 7) // the header itself
            + (2 + clock_source.len())
            + (2 + input_terminal.len())
            + (2 + output_terminal.len());
        let mut header = [0u8; 7];
        header[0] = subtype::AC_HEADER;
        header[1..3].copy_from_slice(&0x0200u16.to_le_bytes()); // bcdADC 2.0
        header[3] = 0x08; // function category: I/O box
        header[4..6].copy_from_slice(&(cs_total as u16).to_le_bytes());
        // bmControls stays zero.

        let mut w = ElementWriter::new(buf);
        w.put(
            desc::INTERFACE,
            &interface_body(0, 0, 0, class::AUDIO_CONTROL),
        );
        w.put(desc::CS_INTERFACE, &header);
        w.put(desc::CS_INTERFACE, &clock_source);
        w.put(desc::CS_INTERFACE, &input_terminal);
        w.put(desc::CS_INTERFACE, &output_terminal);
        w.finish()
    }
}

/// Audio Streaming interface descriptor builder
pub struct AudioStreamingDescriptor {
    config: Uac2Config,
}

impl AudioStreamingDescriptor {
    /// Create a builder for `config`
    pub fn new(config: Uac2Config) -> Self {
        Self { config }
    }

    /// Alternate setting 0: zero bandwidth, nothing but the interface
    pub fn build_alt0(&self, buf: &mut [u8], interface_num: u8) -> usize {
        let mut w = ElementWriter::new(buf);
        w.put(
            desc::INTERFACE,
            &interface_body(interface_num, 0, 0, class::AUDIO_STREAMING),
        );
        w.finish()
    }

    /// Alternate setting 1: active streaming with the isochronous OUT
    /// endpoint
    pub fn build_alt1(&self, buf: &mut [u8], interface_num: u8, ep_addr: u8) -> usize {
        let mut as_general = [0u8; 14];
        as_general[0] = subtype::AS_GENERAL;
        as_general[1] = entity::USB_IN; // terminal this interface feeds
        as_general[2] = 0x00; // bmControls
        as_general[3] = 0x01; // format type I
        as_general[4..8].copy_from_slice(&0x0000_0001u32.to_le_bytes()); // PCM
        as_general[8] = self.config.channels;
        as_general[9..13].copy_from_slice(&STEREO_CHANNEL_CONFIG);
        // iChannelNames stays zero.

        let format_type = [
            subtype::FORMAT_TYPE,
            0x01, // type I
            self.config.bit_depth / 8,
            self.config.bit_depth,
        ];

        let mut endpoint = [0u8; 5];
        endpoint[0] = ep_addr;
        endpoint[1] = 0x05; // isochronous, asynchronous
        endpoint[2..4].copy_from_slice(&(MAX_USB_AUDIO_PACKET as u16).to_le_bytes());
        endpoint[4] = 1; // one packet per 1 ms frame

        let cs_endpoint = [
            subtype::EP_GENERAL,
            0x00, // bmAttributes
            0x00, // bmControls
            0x00, // lock delay units
            0x00, // wLockDelay
            0x00,
        ];

        let mut w = ElementWriter::new(buf);
        w.put(
            desc::INTERFACE,
            &interface_body(interface_num, 1, 1, class::AUDIO_STREAMING),
        );
        w.put(desc::CS_INTERFACE, &as_general);
        w.put(desc::CS_INTERFACE, &format_type);
        w.put(desc::ENDPOINT, &endpoint);
        w.put(desc::CS_ENDPOINT, &cs_endpoint);
        w.finish()
    }
}

/// Streaming state of the UAC2 function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StreamState {
    /// Host has the zero-bandwidth alternate selected
    #[default]
    Idle,
    /// Host is streaming
    Active,
    /// Host stopped feeding mid-stream
    Underrun,
    /// Host outran the capture ring
    Overrun,
}

/// Capture-side statistics
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CaptureStats {
    /// Isochronous packets received from the host
    pub packets_received: u32,
    /// Samples received
    pub samples_received: u64,
    /// Underrun count
    pub underruns: u32,
    /// Overrun count
    pub overruns: u32,
}

/// One host-side isochronous packet's worth of samples
pub type UsbFrame = Vec<u8, MAX_USB_AUDIO_PACKET>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_descriptor_layout() {
        let desc = AudioControlDescriptor::new(Uac2Config::default());
        let mut buf = [0u8; 128];
        let len = desc.build(&mut buf);
        assert_eq!(len, 9 + 9 + 8 + 17 + 12);
        assert_eq!(buf[5], class::AUDIO_CONTROL);
        assert_eq!(buf[6], class::UAC2_PROTOCOL);
    }

    #[test]
    fn test_control_header_counts_class_block() {
        let desc = AudioControlDescriptor::new(Uac2Config::default());
        let mut buf = [0u8; 128];
        let len = desc.build(&mut buf);

        // The AC header sits right after the 9-byte interface element;
        // its wTotalLength covers every class-specific element.
        let total = u16::from_le_bytes([buf[15], buf[16]]);
        assert_eq!(usize::from(total), len - 9);
    }

    #[test]
    fn test_streaming_descriptor_alternates() {
        let desc = AudioStreamingDescriptor::new(Uac2Config::default());
        let mut buf = [0u8; 128];

        let alt0 = desc.build_alt0(&mut buf, 1);
        assert_eq!(alt0, 9);
        assert_eq!(buf[4], 0, "alt 0 has no endpoints");

        let alt1 = desc.build_alt1(&mut buf, 1, 0x01);
        assert_eq!(alt1, 9 + 16 + 6 + 7 + 8);
        assert_eq!(buf[4], 1, "alt 1 carries the iso endpoint");
    }

    #[test]
    fn test_every_element_is_length_prefixed() {
        let desc = AudioStreamingDescriptor::new(Uac2Config::default());
        let mut buf = [0u8; 128];
        let len = desc.build_alt1(&mut buf, 1, 0x01);

        let mut pos = 0;
        let mut elements = 0;
        while pos < len {
            let elem_len = buf[pos] as usize;
            assert!(elem_len >= 2);
            pos += elem_len;
            elements += 1;
        }
        assert_eq!(pos, len, "elements tile the blob exactly");
        assert_eq!(elements, 5);
    }
}
