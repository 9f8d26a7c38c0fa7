//! RTP audio bridge application
//!
//! Orchestrates the whole device:
//! - lifecycle state machine and its worker (the only owner of state)
//! - RTP ingress, PCM pump, capture and egress workers
//! - configuration delta handling and the web control-plane surface

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

use core::cell::RefCell;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::{Channel, Sender};

use audio_pipeline::JitterBuffer;

// This mod must come first so the others see its macros.
mod fmt;

pub mod control;
pub mod egress;
pub mod ingress;
pub mod lifecycle;
pub mod pump;
pub mod runtime;
pub mod services;

pub use lifecycle::{Action, Controller, Event, LifecycleState};

/// Compile-time jitter ring slab, in chunks (36 KB of PCM)
///
/// The configured `max_buffer_size` is clamped to this; growing past it
/// would need a reallocation the firmware does not do.
pub const JITTER_SLOTS: usize = 32;

/// Capture ring depth for sender modes
pub const CAPTURE_SLOTS: usize = 8;

/// Depth of the lifecycle event queue
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// The jitter buffer behind its mutex; every pipeline operation takes the
/// lock for one short critical section
pub type JitterMutex =
    Mutex<CriticalSectionRawMutex, RefCell<JitterBuffer<JITTER_SLOTS>>>;

/// The single FIFO lifecycle event queue
pub type EventQueue = Channel<CriticalSectionRawMutex, Event, EVENT_QUEUE_DEPTH>;

/// Posting side of the event queue, handed to workers and services
pub type EventSender = Sender<'static, CriticalSectionRawMutex, Event, EVENT_QUEUE_DEPTH>;
