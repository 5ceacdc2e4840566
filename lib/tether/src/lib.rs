//! The link engine: framing codec, ring buffers, the ARQ/handshake state
//! machine, the command router and the MCU-side bridge model. Everything in
//! this crate is pure state-machine code; no I/O, no clocks of its own.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod buffer;
pub mod codec;
pub mod link;
pub mod mcu;
pub mod pending;
pub mod router;
pub mod shared;
