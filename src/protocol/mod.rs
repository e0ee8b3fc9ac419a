//! Host side of the Lys protocol.
//!
//! Lys passes typed parameters from the host to firmware running on a target,
//! and typed results back, over any byte stream. This module defines the
//! message format and the state machine that drives a session; it knows
//! nothing about how the bytes travel (see [`transport`](crate::transport)).
//!
//! # Overview
//!
//! A session moves through these states:
//!
//! ```text
//! UNKNOWN -> INIT -> START -> RESULT -> FINISHED
//! ```
//!
//! The board sends `INIT` once it has booted. The host answers with one
//! `PARAM` message per initial parameter followed by `START`, each of which
//! must be ACK'd before the next goes out. The board later sends `RESULT`,
//! any number of `PARAM` results, and finally `FINISHED`. Every message the
//! board sends is ACK'd by the host. `LOG` messages may arrive at any time.
//!
//! # Key Components
//!
//! - [`Value`] and [`ParamType`]: typed payloads and their byte layout.
//! - [`Message`]: one length-prefixed frame.
//! - [`Lys`]: the session state machine and ACK flow control.
//!
//! # Binary Format
//!
//! | Field      | Size | Notes                                              |
//! |------------|------|----------------------------------------------------|
//! | LEN        | 1    | total message length including LEN, at most 64     |
//! | OP         | 1    | see [`Op`]                                         |
//! | PARAM_TYPE | 1    | `PARAM` and `LOG` only, see [`ParamType`]          |
//! | ELEM_TYPE  | 1    | arrays only, any param type except `ARRAY`         |
//! | DATA       | n    | native-endian scalars, raw string bytes, elements  |
//!
//! Strings carry no terminator; their length follows from `LEN`.
mod machine;
mod message;
mod value;

pub use machine::{FrameSink, Lys, Notification, SessionState, Violation};
pub use message::{FrameError, MAX_MESSAGE_LEN, Message, Op};
pub use value::{CodecError, ParamType, Value, decode, encode};
