//! `teleop-stream` – Point-cloud stream decoding
//!
//! Turns the binary frames pushed on the streaming channel into
//! [`DecodedFrame`](teleop_types::DecodedFrame)s.
//!
//! # Modules
//!
//! - [`encoding`] – The six wire encodings and their pure decode functions.
//! - [`worker`] – Decoder actor running on its own thread, owning the
//!   streaming socket and talking to its owner only through messages.

pub mod encoding;
pub mod worker;

pub use encoding::{ColorPacking, PositionType, WireEncoding, decode_tagged};
pub use worker::{DecoderCommand, DecoderEvent, DecoderHandle};
