//! PIO S/PDIF transmitter
//!
//! The PIO state machine shifts pre-encoded biphase-mark cells out of its
//! FIFO at 128 cells per frame; subframe assembly, preambles and parity
//! happen here in software. Each stereo frame becomes four 32-bit FIFO
//! words (two per subframe).

use embassy_rp::pio::{
    Common, Config as PioConfig, Direction, Instance, PioPin, ShiftDirection, StateMachine,
};
use embassy_rp::Peri;
use fixed::traits::ToFixed;

use audio_io::{AudioIoError, SpdifPort};

use crate::clocks::spdif_pio_divider;

/// Subframes per channel-status block
const BLOCK_FRAMES: u32 = 192;

/// Biphase-mark cells for one data nibble, LSB-first, starting from a low
/// last cell. A set MSB in the result means the encoding ended high and
/// the next nibble must be inverted.
const NIBBLE_CELLS: [u8; 16] = [
    0b10101010, 0b10101001, 0b10100110, 0b10100101,
    0b10011010, 0b10011001, 0b10010110, 0b10010101,
    0b01101010, 0b01101001, 0b01100110, 0b01100101,
    0b01011010, 0b01011001, 0b01010110, 0b01010101,
];

/// Preamble cell patterns (8 cells), previous cell low
const PREAMBLE_B: u8 = 0b00111001; // block start, left
const PREAMBLE_M: u8 = 0b00011101; // left
const PREAMBLE_W: u8 = 0b00011011; // right

/// The transmitter over one PIO state machine
pub struct PioSpdifTx<'d, P: Instance, const SM: usize> {
    common: Common<'d, P>,
    sm: StateMachine<'d, P, SM>,
    pin: Option<Peri<'d, embassy_rp::gpio::AnyPin>>,
    sys_clk: u32,
    frame_count: u32,
    /// Running biphase polarity at the end of the last cell
    polarity: bool,
    configured: bool,
}

impl<'d, P: Instance, const SM: usize> PioSpdifTx<'d, P, SM> {
    /// Wrap a PIO block and the pin the transformer is wired to
    pub fn new(
        common: Common<'d, P>,
        sm: StateMachine<'d, P, SM>,
        pin: Peri<'d, embassy_rp::gpio::AnyPin>,
        sys_clk: u32,
    ) -> Self {
        Self {
            common,
            sm,
            pin: Some(pin),
            sys_clk,
            frame_count: 0,
            polarity: false,
            configured: false,
        }
    }

    fn program(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        // One instruction: shift one cell per cycle, autopull at 32 bits.
        let program = pio::pio_asm!(
            ".wrap_target",
            "out pins, 1",
            ".wrap",
        );
        let loaded = self.common.load_program(&program.program);

        let pin = self.pin.take().ok_or(AudioIoError::DriverRejected)?;
        let out_pin = self.common.make_pio_pin(pin);
        let mut cfg = PioConfig::default();
        cfg.use_program(&loaded, &[]);
        cfg.set_out_pins(&[&out_pin]);
        let (div_int, div_frac) = spdif_pio_divider(self.sys_clk, sample_rate);
        cfg.clock_divider = (f32::from(div_int) + f32::from(div_frac) / 256.0).to_fixed();
        cfg.shift_out.auto_fill = true;
        cfg.shift_out.threshold = 32;
        cfg.shift_out.direction = ShiftDirection::Right;
        self.sm.set_config(&cfg);
        self.sm.set_pin_dirs(Direction::Out, &[&out_pin]);
        self.sm.set_enable(true);
        Ok(())
    }

    /// Encode one 28-bit payload (aux+sample+status+parity, LSB first)
    /// into 56 biphase cells
    fn encode_payload(&mut self, payload: u32) -> u64 {
        let mut cells: u64 = 0;
        for nibble_idx in 0..7 {
            let nibble = ((payload >> (nibble_idx * 4)) & 0xF) as usize;
            let mut pattern = NIBBLE_CELLS[nibble];
            if self.polarity {
                pattern = !pattern;
            }
            self.polarity = pattern & 0x80 != 0;
            cells |= u64::from(pattern) << (nibble_idx * 8);
        }
        cells
    }

    /// Assemble and enqueue one subframe; false when the FIFO is full
    fn push_subframe(&mut self, sample: i16, right: bool) -> bool {
        if self.sm.tx().full() {
            return false;
        }

        let preamble = if right {
            PREAMBLE_W
        } else if self.frame_count == 0 {
            PREAMBLE_B
        } else {
            PREAMBLE_M
        };
        let preamble = if self.polarity { !preamble } else { preamble };
        self.polarity = preamble & 0x80 != 0;

        // 24-bit audio slot carries the 16-bit sample left-justified;
        // validity/user/channel-status stay zero, parity evens the word.
        let audio = u32::from(sample as u16) << 8;
        let mut payload = audio >> 4; // bits 4..27 of the subframe
        let parity = (payload.count_ones() & 1) != 0;
        if parity {
            payload |= 1 << 27;
        }

        let cells = self.encode_payload(payload);
        let word0 = u32::from(preamble) | ((cells as u32) << 8);
        let word1 = (cells >> 24) as u32;

        if !self.sm.tx().try_push(word0) {
            return false;
        }
        // The FIFO is four words deep and we just made room; a failed
        // second push means the divider is misconfigured.
        let _ = self.sm.tx().try_push(word1);

        if right {
            self.frame_count = (self.frame_count + 1) % BLOCK_FRAMES;
        }
        true
    }
}

/// S/PDIF input is not wired on this board revision
///
/// Init reports the peripheral as unsupported, which the lifecycle layer
/// turns into a failed SenderSpdif mode entry.
pub struct NoSpdifRx;

impl SpdifPort for NoSpdifRx {
    fn init(&mut self, _sample_rate: u32, _pin: u8) -> Result<(), AudioIoError> {
        Err(AudioIoError::Unsupported)
    }

    fn write(&mut self, _pcm_le: &[u8]) -> usize {
        0
    }

    fn read(&mut self, _out: &mut [u8]) -> usize {
        0
    }

    fn set_sample_rate(&mut self, _sample_rate: u32) -> Result<(), AudioIoError> {
        Err(AudioIoError::Unsupported)
    }

    fn deinit(&mut self) {}
}

impl<P: Instance, const SM: usize> SpdifPort for PioSpdifTx<'_, P, SM> {
    fn init(&mut self, sample_rate: u32, _pin: u8) -> Result<(), AudioIoError> {
        // The PIO pin is fixed by board wiring; a configured pin change
        // re-runs the program on the same state machine.
        self.program(sample_rate)?;
        self.frame_count = 0;
        self.polarity = false;
        self.configured = true;
        Ok(())
    }

    fn write(&mut self, pcm_le: &[u8]) -> usize {
        if !self.configured {
            return 0;
        }
        let mut written = 0;
        for frame in pcm_le.chunks_exact(4) {
            let left = i16::from_le_bytes([frame[0], frame[1]]);
            let right = i16::from_le_bytes([frame[2], frame[3]]);
            if !self.push_subframe(left, false) {
                break;
            }
            let _ = self.push_subframe(right, true);
            written += 4;
        }
        written
    }

    fn read(&mut self, _out: &mut [u8]) -> usize {
        0 // transmit-only state machine
    }

    fn set_sample_rate(&mut self, sample_rate: u32) -> Result<(), AudioIoError> {
        if !self.configured {
            return Err(AudioIoError::InvalidState);
        }
        let (div_int, div_frac) = spdif_pio_divider(self.sys_clk, sample_rate);
        self.sm.set_clock_divider(
            (f32::from(div_int) + f32::from(div_frac) / 256.0).to_fixed(),
        );
        self.sm.clkdiv_restart();
        Ok(())
    }

    fn deinit(&mut self) {
        self.sm.set_enable(false);
        self.configured = false;
    }
}
