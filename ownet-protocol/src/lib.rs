//! # ownet Protocol Library
//!
//! This crate implements the wire format spoken between one-wire network servers
//! (`owserver`) and their clients.
//!
//! ## Overview
//!
//! A client sends one [`Request`] and receives one or more [`Response`]s on the same TCP
//! connection. Every header is six 32-bit words in network byte order, followed by a payload:
//!
//! - **Request**: `version, payload, kind, control flags, size, offset`, then the
//!   null-terminated path, the data (writes only) and the anti-loop tokens (forwarded requests only)
//! - **Response**: `version, payload, ret, control flags, size, offset`, then the payload bytes
//!
//! A response whose payload length is `-1` is a keep-alive and carries no data. An empty
//! response ends a streamed directory listing.
//!
//! ## Basic Usage
//!
//! ```
//! use ownet_protocol::{ControlFlags, Request, MAX_PAYLOAD_SIZE};
//! use std::io::Cursor;
//!
//! let request = Request::read("/10.67C6697351FF/temperature", 12, 0)
//!     .with_flags(ControlFlags::default().with_persistent(true));
//! let mut buffer = Vec::new();
//! request.write_to(&mut buffer).expect("Writing to vector shouldn't fail");
//!
//! let decoded = Request::from_reader(&mut Cursor::new(buffer), MAX_PAYLOAD_SIZE).unwrap();
//! assert_eq!(decoded, request);
//! ```
//!
//! ## Error Handling
//!
//! Decoding failures are reported through [`error::ReadError`]. The announced payload size is
//! validated against a caller supplied maximum before anything is allocated.
//!
//! ## Feature Flags
//!
//! - `tokio`: adds [`tokio_codec::ServerCodec`], a `tokio_util` decoder/encoder pair for
//!   asynchronous servers.

pub mod protocol;
pub use protocol::*;
pub mod codec;
pub mod error;
#[cfg(feature = "tokio")]
pub mod tokio_codec;
