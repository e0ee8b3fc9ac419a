//! Handshake state machine and ACK-gated flow control.
//!
//! A [`Lys`] consumes bytes received from the board, advances the session
//! through `Unknown -> Init -> Start -> Result -> Finished`, and writes its
//! own messages through a [`FrameSink`]. Every message it sends that needs an
//! ACK blocks the rest of the outbound queue until the board acknowledges it.
//!
//! State changes are not reported through callbacks. They are queued as
//! [`Notification`]s and drained by the caller with
//! [`Lys::poll_notification`] after each [`Lys::feed`].
use std::collections::VecDeque;
use std::fmt;

use log::{debug, trace, warn};
use thiserror::Error;

use super::message::{FrameError, Message, Op};
use super::value::Value;

/// Destination for encoded frames, usually the transport's outbound queue.
///
/// Sending must never block.
pub trait FrameSink {
    fn send_frame(&mut self, frame: Vec<u8>);
}

impl FrameSink for Vec<Vec<u8>> {
    fn send_frame(&mut self, frame: Vec<u8>) {
        self.push(frame);
    }
}

/// Handshake phase of the current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Initial state, and the state every protocol violation falls back to.
    #[default]
    Unknown,
    Init,
    Start,
    Result,
    Finished,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Unknown => "UNKNOWN",
            SessionState::Init => "INIT",
            SessionState::Start => "START",
            SessionState::Result => "RESULT",
            SessionState::Finished => "FINISHED",
        };
        f.write_str(name)
    }
}

/// A message arrived that the current state does not allow.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Violation {
    #[error("the board reported an error")]
    BoardError,

    #[error("ACK not received, got {0} instead")]
    AckNotReceived(Op),

    #[error("unexpected ACK message received")]
    UnexpectedAck,

    #[error("unexpected {op} message received in state {state}")]
    UnexpectedMessage { op: Op, state: SessionState },
}

/// Record of a state change or delivery, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Init,
    Start,
    Result,
    /// Collected results, delivered once per session.
    Finished(Vec<Value>),
    Log(Value),
    /// The session fell back to [`SessionState::Unknown`].
    Violation(Violation),
}

#[derive(Debug)]
struct Outbound {
    message: Message,
    ack_required: bool,
}

/// Host side of the Lys protocol for a single connection.
pub struct Lys<S: FrameSink> {
    sink: S,
    init_params: Vec<Value>,
    state: SessionState,
    remainder: Vec<u8>,
    awaiting_ack: bool,
    outbound: VecDeque<Outbound>,
    results: Vec<Value>,
    notifications: VecDeque<Notification>,
    discarded: usize,
}

impl<S: FrameSink> Lys<S> {
    /// `init_params` are sent to the board, in order, every time it reports
    /// `Init`.
    pub fn new(sink: S, init_params: Vec<Value>) -> Self {
        Self {
            sink,
            init_params,
            state: SessionState::Unknown,
            remainder: Vec::new(),
            awaiting_ack: false,
            outbound: VecDeque::new(),
            results: Vec::new(),
            notifications: VecDeque::new(),
            discarded: 0,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn awaiting_ack(&self) -> bool {
        self.awaiting_ack
    }

    /// Bytes of malformed data dropped after an otherwise good frame.
    pub fn discarded_bytes(&self) -> usize {
        self.discarded
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn poll_notification(&mut self) -> Option<Notification> {
        self.notifications.pop_front()
    }

    /// Process a chunk of received bytes.
    ///
    /// Bytes left over from an earlier call are processed first. A trailing
    /// partial frame is kept for the next call. An error in the first frame is
    /// returned and the buffered bytes are dropped; a malformed frame after
    /// at least one good one is dropped with a warning instead.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        let mut buf = std::mem::take(&mut self.remainder);
        buf.extend_from_slice(bytes);

        let mut rest = buf.as_slice();
        let mut decoded = 0;

        while !rest.is_empty() {
            match Message::decode(rest) {
                Ok((message, tail)) => {
                    trace!("received {message}");
                    decoded += 1;
                    rest = tail;
                    self.update(message);
                }
                Err(FrameError::Truncated { .. }) => {
                    trace!("holding {} bytes of a partial frame", rest.len());
                    self.remainder = rest.to_vec();
                    break;
                }
                Err(e) if decoded == 0 => return Err(e),
                Err(e) => {
                    warn!("discarding {} bytes after a good frame: {e}", rest.len());
                    self.discarded += rest.len();
                    break;
                }
            }
        }

        Ok(())
    }

    /// Drop all session progress. Safe to call at any time.
    pub fn reset(&mut self) {
        debug!("resetting from {}", self.state);
        self.state = SessionState::Unknown;
        self.remainder.clear();
        self.awaiting_ack = false;
        self.outbound.clear();
        self.results.clear();
    }

    fn update(&mut self, message: Message) {
        if self.awaiting_ack {
            self.awaiting_ack = false;

            if message.op() != Op::Ack {
                self.violation(Violation::AckNotReceived(message.op()));
                return;
            }

            if !self.outbound.is_empty() {
                self.send_next();
            } else if self.state == SessionState::Init {
                self.enter(SessionState::Start);
                self.notify(Notification::Start);
            }
            return;
        }

        match message.op() {
            Op::Log => {
                if let Some(value) = message.into_payload() {
                    self.notify(Notification::Log(value));
                }
                self.queue_ack();
            }
            Op::Unknown => self.violation(Violation::BoardError),
            Op::Ack => self.violation(Violation::UnexpectedAck),
            Op::Init => {
                self.queue_ack();
                if self.state == SessionState::Unknown {
                    self.results.clear();
                    self.enter(SessionState::Init);
                    self.notify(Notification::Init);

                    for param in &self.init_params {
                        self.outbound.push_back(Outbound {
                            message: Message::param(param.clone()),
                            ack_required: true,
                        });
                    }
                    self.queue(Message::new(Op::Start), true);
                } else {
                    self.unexpected(Op::Init);
                }
            }
            Op::Result => {
                self.queue_ack();
                if self.state == SessionState::Start {
                    self.enter(SessionState::Result);
                    self.notify(Notification::Result);
                } else {
                    self.unexpected(Op::Result);
                }
            }
            Op::Param => {
                self.queue_ack();
                match (self.state, message.into_payload()) {
                    (SessionState::Result, Some(value)) => {
                        debug!("result {}: {value}", value.param_type());
                        self.results.push(value);
                    }
                    _ => self.unexpected(Op::Param),
                }
            }
            Op::Finished => {
                self.queue_ack();
                if self.state == SessionState::Result {
                    self.enter(SessionState::Finished);
                    let results = std::mem::take(&mut self.results);
                    self.notify(Notification::Finished(results));
                } else {
                    self.unexpected(Op::Finished);
                }
            }
            Op::Start => self.unexpected(Op::Start),
        }

        self.send_next();
    }

    fn send_next(&mut self) {
        debug_assert!(!self.awaiting_ack, "attempt to send while waiting for an ACK");
        if self.awaiting_ack {
            return;
        }

        while let Some(next) = self.outbound.pop_front() {
            match next.message.encode() {
                Ok(frame) => {
                    trace!("sending {}", next.message);
                    self.sink.send_frame(frame);
                }
                Err(e) => {
                    warn!("dropping unsendable {}: {e}", next.message);
                    continue;
                }
            }

            if next.ack_required {
                self.awaiting_ack = true;
                break;
            }
        }
    }

    fn queue(&mut self, message: Message, ack_required: bool) {
        self.outbound.push_back(Outbound {
            message,
            ack_required,
        });
    }

    fn queue_ack(&mut self) {
        self.queue(Message::new(Op::Ack), false);
    }

    fn enter(&mut self, state: SessionState) {
        debug!("state {} -> {state}", self.state);
        self.state = state;
    }

    fn unexpected(&mut self, op: Op) {
        let state = self.state;
        self.violation(Violation::UnexpectedMessage { op, state });
    }

    fn violation(&mut self, violation: Violation) {
        warn!("protocol violation: {violation}");
        self.state = SessionState::Unknown;
        self.notify(Notification::Violation(violation));
    }

    fn notify(&mut self, notification: Notification) {
        self.notifications.push_back(notification);
    }
}

#[cfg(test)]
mod tests {
    use crate::protocol::ParamType;

    use super::*;

    fn frame(op: Op) -> Vec<u8> {
        Message::new(op).encode().unwrap()
    }

    fn param(value: Value) -> Vec<u8> {
        Message::param(value).encode().unwrap()
    }

    fn notifications<S: FrameSink>(lys: &mut Lys<S>) -> Vec<Notification> {
        std::iter::from_fn(|| lys.poll_notification()).collect()
    }

    #[test]
    fn init_queues_params_then_start() {
        let params = vec![Value::Uint32(1), Value::Int8(-1)];
        let mut lys = Lys::new(Vec::new(), params.clone());

        lys.feed(&frame(Op::Init)).unwrap();
        assert_eq!(lys.state(), SessionState::Init);
        assert_eq!(notifications(&mut lys), vec![Notification::Init]);
        // ACK reply goes out at once, the first param then waits for its ACK.
        assert_eq!(lys.sink().clone(), vec![frame(Op::Ack), param(params[0].clone())]);
        assert!(lys.awaiting_ack());

        lys.feed(&frame(Op::Ack)).unwrap();
        assert_eq!(lys.sink().len(), 3);
        assert_eq!(lys.sink()[2], param(params[1].clone()));

        lys.feed(&frame(Op::Ack)).unwrap();
        assert_eq!(lys.sink().len(), 4);
        assert_eq!(lys.sink()[3], frame(Op::Start));
        assert_eq!(lys.state(), SessionState::Init);

        lys.feed(&frame(Op::Ack)).unwrap();
        assert_eq!(lys.sink().len(), 4);
        assert_eq!(lys.state(), SessionState::Start);
        assert_eq!(notifications(&mut lys), vec![Notification::Start]);
        assert!(!lys.awaiting_ack());
    }

    #[test]
    fn full_session_without_params() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        let inbound = [
            frame(Op::Init),
            frame(Op::Ack),
            frame(Op::Result),
            param(Value::Uint32(7)),
            frame(Op::Finished),
        ];
        for bytes in inbound {
            lys.feed(&bytes).unwrap();
        }

        assert_eq!(lys.state(), SessionState::Finished);
        assert_eq!(
            notifications(&mut lys),
            vec![
                Notification::Init,
                Notification::Start,
                Notification::Result,
                Notification::Finished(vec![Value::Uint32(7)]),
            ]
        );
        // ACK for Init, Start, then ACKs for Result, Param and Finished.
        let sent = lys.sink().clone();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[1], frame(Op::Start));
        assert!(sent.iter().enumerate().all(|(i, f)| i == 1 || *f == frame(Op::Ack)));
    }

    #[test]
    fn full_session_with_three_params_in_one_chunk() {
        let params = vec![
            Value::Uint8(1),
            Value::String("two".into()),
            Value::Array(ParamType::Int32, vec![Value::Int32(3)]),
        ];
        let mut lys = Lys::new(Vec::new(), params);

        let chunk: Vec<u8> = [
            frame(Op::Init),
            frame(Op::Ack),
            frame(Op::Ack),
            frame(Op::Ack),
            frame(Op::Ack),
            frame(Op::Result),
            param(Value::Uint32(7)),
            frame(Op::Finished),
        ]
        .concat();
        lys.feed(&chunk).unwrap();

        assert_eq!(lys.state(), SessionState::Finished);
        assert_eq!(
            notifications(&mut lys).last(),
            Some(&Notification::Finished(vec![Value::Uint32(7)]))
        );
    }

    #[test]
    fn result_out_of_order() {
        let mut lys = Lys::new(Vec::new(), vec![]);

        lys.feed(&frame(Op::Result)).unwrap();
        assert_eq!(lys.state(), SessionState::Unknown);
        assert_eq!(
            notifications(&mut lys),
            vec![Notification::Violation(Violation::UnexpectedMessage {
                op: Op::Result,
                state: SessionState::Unknown
            })]
        );
        assert_eq!(lys.sink().clone(), vec![frame(Op::Ack)]);
    }

    #[test]
    fn missing_ack_is_a_violation() {
        let mut lys = Lys::new(Vec::new(), vec![Value::Bool(true)]);
        lys.feed(&frame(Op::Init)).unwrap();
        notifications(&mut lys);

        lys.feed(&frame(Op::Result)).unwrap();
        assert_eq!(lys.state(), SessionState::Unknown);
        assert!(!lys.awaiting_ack());
        assert_eq!(
            notifications(&mut lys),
            vec![Notification::Violation(Violation::AckNotReceived(Op::Result))]
        );
        // Nothing is acknowledged or sent while recovering.
        assert_eq!(lys.sink().len(), 2);
    }

    #[test]
    fn stray_ack_and_board_error() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        lys.feed(&frame(Op::Ack)).unwrap();
        lys.feed(&frame(Op::Unknown)).unwrap();

        assert_eq!(
            notifications(&mut lys),
            vec![
                Notification::Violation(Violation::UnexpectedAck),
                Notification::Violation(Violation::BoardError),
            ]
        );
        assert!(lys.sink().is_empty());
    }

    #[test]
    fn second_init_is_rejected() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        lys.feed(&[frame(Op::Init), frame(Op::Ack)].concat()).unwrap();
        assert_eq!(lys.state(), SessionState::Start);
        notifications(&mut lys);

        lys.feed(&frame(Op::Init)).unwrap();
        assert_eq!(lys.state(), SessionState::Unknown);
        assert_eq!(
            notifications(&mut lys),
            vec![Notification::Violation(Violation::UnexpectedMessage {
                op: Op::Init,
                state: SessionState::Start
            })]
        );
    }

    #[test]
    fn logs_are_delivered_in_any_state() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        let log = Message::with_payload(Op::Log, Value::String("booting".into()))
            .unwrap()
            .encode()
            .unwrap();

        lys.feed(&log).unwrap();
        assert_eq!(lys.state(), SessionState::Unknown);
        assert_eq!(
            notifications(&mut lys),
            vec![Notification::Log(Value::String("booting".into()))]
        );
        assert_eq!(lys.sink().clone(), vec![frame(Op::Ack)]);
    }

    #[test]
    fn split_frames_are_reassembled() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        lys.feed(&[frame(Op::Init), frame(Op::Ack), frame(Op::Result)].concat())
            .unwrap();
        notifications(&mut lys);

        let bytes = param(Value::Uint32(0xdead_beef));
        lys.feed(&bytes[..3]).unwrap();
        lys.feed(&bytes[3..]).unwrap();
        lys.feed(&frame(Op::Finished)).unwrap();

        assert_eq!(
            notifications(&mut lys),
            vec![Notification::Finished(vec![Value::Uint32(0xdead_beef)])]
        );
    }

    #[test]
    fn garbage_after_a_good_frame_is_discarded() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        lys.feed(&[frame(Op::Init), vec![2, 42]].concat()).unwrap();

        assert_eq!(lys.state(), SessionState::Init);
        assert_eq!(lys.discarded_bytes(), 2);

        // The next chunk starts clean.
        lys.feed(&frame(Op::Ack)).unwrap();
        assert_eq!(lys.state(), SessionState::Start);
    }

    #[test]
    fn leading_garbage_is_an_error() {
        let mut lys = Lys::new(Vec::new(), vec![]);
        assert_eq!(lys.feed(&[70, 1]), Err(FrameError::TooLong(70)));
        assert_eq!(lys.state(), SessionState::Unknown);
    }

    #[test]
    fn reset_clears_everything() {
        let mut lys = Lys::new(Vec::new(), vec![Value::Uint8(1)]);
        lys.feed(&frame(Op::Init)).unwrap();
        lys.feed(&[4, 5]).unwrap();
        assert!(lys.awaiting_ack());

        lys.reset();
        lys.reset();
        assert_eq!(lys.state(), SessionState::Unknown);
        assert!(!lys.awaiting_ack());

        // Nothing queued or buffered survives: a fresh Init starts over.
        lys.feed(&frame(Op::Init)).unwrap();
        assert_eq!(lys.state(), SessionState::Init);
        assert_eq!(lys.sink().len(), 4);
    }
}
