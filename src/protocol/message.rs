use std::fmt;

use thiserror::Error;

use super::value::{self, CodecError, ParamType, Value};

/// Longest message allowed on the wire, including the length byte itself.
pub const MAX_MESSAGE_LEN: usize = 64;

const HEADER_LEN: usize = 2;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("message is too long: {0} bytes")]
    TooLong(usize),

    #[error("message is too short: {0} bytes")]
    TooShort(usize),

    #[error("truncated message: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("{0} messages can not carry a payload")]
    PayloadNotAllowed(Op),

    #[error("{0} messages require a payload")]
    MissingPayload(Op),

    #[error("{extra} bytes left over after the {kind} payload")]
    TrailingBytes { kind: ParamType, extra: usize },

    #[error("unknown op {0:#04x}")]
    UnknownOp(u8),

    #[error("unknown param type {0:#04x}")]
    UnknownParamType(u8),

    #[error("bad payload: {0}")]
    Codec(CodecError),
}

impl From<CodecError> for FrameError {
    fn from(value: CodecError) -> Self {
        match value {
            CodecError::UnknownParamType(tag) => FrameError::UnknownParamType(tag),
            other => FrameError::Codec(other),
        }
    }
}

/// Operation carried by a message, doubling as the session state names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Unknown,
    Init,
    Start,
    Result,
    Finished,
    Param,
    Ack,
    Log,
}

impl Op {
    /// Only `Param` and `Log` messages carry a value.
    pub fn has_payload(self) -> bool {
        matches!(self, Op::Param | Op::Log)
    }
}

impl TryFrom<u8> for Op {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Op::Unknown,
            1 => Op::Init,
            2 => Op::Start,
            3 => Op::Result,
            4 => Op::Finished,
            5 => Op::Param,
            6 => Op::Ack,
            7 => Op::Log,
            _ => return Err(FrameError::UnknownOp(value)),
        })
    }
}

impl From<Op> for u8 {
    fn from(value: Op) -> Self {
        value as u8
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Op::Unknown => "UNKNOWN",
            Op::Init => "INIT",
            Op::Start => "START",
            Op::Result => "RESULT",
            Op::Finished => "FINISHED",
            Op::Param => "PARAM",
            Op::Ack => "ACK",
            Op::Log => "LOG",
        };
        f.write_str(name)
    }
}

/// One length-prefixed protocol message.
///
/// Wire layouts:
/// - `[LEN][OP]` for messages without a payload
/// - `[LEN][OP][PARAM_TYPE][DATA]` for a scalar `Param` or `Log`
/// - `[LEN][OP][ARRAY][ELEM_TYPE][DATA...]` for an array payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    op: Op,
    payload: Option<Value>,
}

impl Message {
    /// Message without a payload.
    ///
    /// # Panics
    /// If `op` requires a payload; use [`Message::with_payload`] instead.
    pub fn new(op: Op) -> Self {
        assert!(!op.has_payload(), "{op} messages require a payload");
        Self { op, payload: None }
    }

    pub fn with_payload(op: Op, value: Value) -> Result<Self, FrameError> {
        if !op.has_payload() {
            return Err(FrameError::PayloadNotAllowed(op));
        }
        Ok(Self {
            op,
            payload: Some(value),
        })
    }

    pub fn param(value: Value) -> Self {
        Self {
            op: Op::Param,
            payload: Some(value),
        }
    }

    pub fn op(&self) -> Op {
        self.op
    }

    pub fn payload(&self) -> Option<&Value> {
        self.payload.as_ref()
    }

    pub fn into_payload(self) -> Option<Value> {
        self.payload
    }

    /// Serialize into a complete frame. Fails rather than truncating when the
    /// frame would exceed [`MAX_MESSAGE_LEN`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        let mut out = vec![0, self.op.into()];

        match &self.payload {
            Some(value) => {
                out.push(value.param_type().into());
                value::encode(value, &mut out)?;
            }
            None if self.op.has_payload() => return Err(FrameError::MissingPayload(self.op)),
            None => {}
        }

        if out.len() > MAX_MESSAGE_LEN {
            return Err(FrameError::TooLong(out.len()));
        }
        out[0] = out.len() as u8;

        Ok(out)
    }

    /// Decode exactly one message from the front of `buf`, returning it along
    /// with whatever follows it.
    pub fn decode(buf: &[u8]) -> Result<(Message, &[u8]), FrameError> {
        let Some(&len) = buf.first() else {
            return Err(FrameError::Truncated {
                needed: 1,
                available: 0,
            });
        };
        let len = len as usize;

        if len > MAX_MESSAGE_LEN {
            return Err(FrameError::TooLong(len));
        }
        if len < HEADER_LEN {
            return Err(FrameError::TooShort(len));
        }
        if buf.len() < len {
            return Err(FrameError::Truncated {
                needed: len,
                available: buf.len(),
            });
        }

        let (frame, remainder) = buf.split_at(len);
        let op = Op::try_from(frame[1])?;

        if !op.has_payload() {
            if len != HEADER_LEN {
                return Err(FrameError::PayloadNotAllowed(op));
            }
            return Ok((Message { op, payload: None }, remainder));
        }

        let Some(&tag) = frame.get(HEADER_LEN) else {
            return Err(FrameError::MissingPayload(op));
        };
        let kind = ParamType::try_from(tag)?;
        let data = &frame[HEADER_LEN + 1..];

        let (value, used) = value::decode(kind, data)?;
        if used != data.len() {
            return Err(FrameError::TrailingBytes {
                kind,
                extra: data.len() - used,
            });
        }

        Ok((
            Message {
                op,
                payload: Some(value),
            },
            remainder,
        ))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.payload {
            Some(value) => write!(f, "{}({}: {value})", self.op, value.param_type()),
            None => write!(f, "{}", self.op),
        }
    }
}
