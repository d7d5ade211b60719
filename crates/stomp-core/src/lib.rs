//! STOMP 1.2 frame codec.
//!
//! This crate contains the protocol-level pieces shared by the client and
//! server session state machines: the command and header vocabularies, the
//! typed codec errors, and the [`StompFrame`] type itself.
//!
//! The codec is transport-agnostic. It sees one complete frame per call —
//! message framing is the WebSocket layer's job.

mod frame;

pub use frame::{StompCommand, StompError, StompFrame, StompHeader};
