//! Duplex byte transport to the target, normally SEGGER's RTT telnet socket.
//!
//! A [`Transport`] runs a worker thread that owns the connection. The worker
//! waits a short, bounded time for incoming data, sends queued outbound bytes
//! one write at a time, and reports what happened as a stream of events. The
//! consumer reads those events with [`Transport::read`] and queues outbound
//! bytes with [`Transport::write`]. Nothing else is shared between the two
//! threads.
//!
//! The transport knows nothing about the Lys protocol. Before any received
//! data is passed on it confirms the J-Link serial number printed in the RTT
//! banner (see [`banner`]).
//!
//! # Events
//!
//! - [`TransportEvent::Startup`]: banner text or other noise, not protocol data.
//! - [`TransportEvent::Connected`]: the serial number matched, data follows.
//! - [`TransportEvent::Received`]: a chunk of protocol data.
//! - [`TransportEvent::Idle`]: nothing happened during one poll interval.
//! - [`TransportEvent::Error`]: the transport has failed and closed itself.
pub mod banner;
mod thread;

use std::{
    io::{self, Read, Write},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender},
    time::Duration,
};

use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::protocol::FrameSink;

use banner::SerialGate;
use thread::{Command, Worker};

/// Address of the RTT telnet server started by the J-Link software.
pub const DEFAULT_RTT_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 19021));

/// Longest the worker waits for the link to become readable.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("socket connection broken")]
    ConnectionBroken,

    #[error("socket closed by peer")]
    ConnectionClosed,

    #[error("incorrect J-Link serial number: expected {expected}, found {found}")]
    SerialMismatch { expected: u32, found: u32 },

    #[error("J-Link serial number could not be confirmed")]
    SerialUnconfirmed,

    #[error("transport is closed")]
    Closed,

    #[error("no transport event before the timeout")]
    Timeout,
}

/// What the worker observed, before serial confirmation.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Received(Vec<u8>),
    Idle,
    Error(TransportError),
}

#[derive(Debug)]
pub enum TransportEvent {
    Startup,
    Connected,
    Received(Vec<u8>),
    Idle,
    Error(TransportError),
}

/// A duplex byte stream the worker can poll.
pub trait Link: Read + Write + Send + 'static {
    /// Bound how long a single read or write may block.
    fn set_poll_interval(&mut self, interval: Duration) -> io::Result<()>;
}

impl Link for TcpStream {
    fn set_poll_interval(&mut self, interval: Duration) -> io::Result<()> {
        self.set_read_timeout(Some(interval))?;
        self.set_write_timeout(Some(interval))?;
        self.set_nodelay(true)
    }
}

/// Queue handle for outbound bytes, usable while the [`Transport`] itself is
/// borrowed for reading.
#[derive(Debug, Clone)]
pub struct TransportWriter {
    commands: Sender<Command>,
}

impl TransportWriter {
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        trace!("writing {bytes:?}");
        self.commands
            .send(Command::Write(bytes.to_vec()))
            .map_err(|_| TransportError::Closed)
    }
}

impl FrameSink for TransportWriter {
    fn send_frame(&mut self, frame: Vec<u8>) {
        trace!("writing {frame:?}");
        if self.commands.send(Command::Write(frame)).is_err() {
            warn!("dropping frame, transport is closed");
        }
    }
}

/// Connection to the target, confirmed against a J-Link serial number.
#[derive(Debug)]
pub struct Transport {
    events: Receiver<WorkerEvent>,
    commands: Sender<Command>,
    worker: Worker,
    gate: SerialGate,
    closed: bool,
}

impl Transport {
    /// Connect to an RTT telnet server. Connection failures are reported as
    /// the first event.
    pub fn open(addr: SocketAddr, serial_number: u32) -> Self {
        info!("opening RTT at {addr}");
        Self::spawn(
            move || TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT),
            serial_number,
        )
    }

    /// Run the transport over an already established link.
    pub fn from_link<L: Link>(link: L, serial_number: u32) -> Self {
        Self::spawn(move || Ok(link), serial_number)
    }

    fn spawn<L, C>(connect: C, serial_number: u32) -> Self
    where
        L: Link,
        C: FnOnce() -> io::Result<L> + Send + 'static,
    {
        let (event_tx, events) = mpsc::channel();
        let (commands, command_rx) = mpsc::channel();
        let worker = Worker::spawn(connect, event_tx, command_rx);

        Self {
            events,
            commands,
            worker,
            gate: SerialGate::new(serial_number),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn serial_confirmed(&self) -> bool {
        self.gate.confirmed()
    }

    /// Queue bytes to be sent in order.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.writer().write(bytes)
    }

    pub fn writer(&self) -> TransportWriter {
        TransportWriter {
            commands: self.commands.clone(),
        }
    }

    /// Wait for the next event, forever if `timeout` is `None`.
    ///
    /// Any [`TransportEvent::Error`] closes the transport before it is
    /// returned.
    pub fn read(&mut self, timeout: Option<Duration>) -> Result<TransportEvent, TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }

        let raw = match timeout {
            Some(timeout) => self.events.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => TransportError::Timeout,
                RecvTimeoutError::Disconnected => TransportError::Closed,
            }),
            None => self.events.recv().map_err(|_| TransportError::Closed),
        };

        let event = match raw {
            Ok(raw) => self.gate.classify(raw),
            Err(TransportError::Closed) => {
                self.close();
                return Err(TransportError::Closed);
            }
            Err(e) => return Err(e),
        };

        if let TransportEvent::Error(e) = &event {
            warn!("transport error: {e}");
            self.close();
        }

        Ok(event)
    }

    /// Stop the worker and release the link. Calling this more than once is
    /// harmless.
    pub fn close(&mut self) {
        if !self.closed {
            debug!("closing transport");
            self.closed = true;
            let _ = self.commands.send(Command::Stop);
        }
        self.worker.join();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        thread,
    };

    use super::*;

    const BANNER: &[u8] = b"SEGGER J-Link V6.00 - Real time terminal output\r\n\
        J-Link OB-SAM3U128-V2-NordicSemi compiled Mar 15 2016 18:03:17 V1.0, SN=123456\r\n";

    fn listener() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    /// Read until something other than `Idle` or `Startup` turns up.
    fn next_event(transport: &mut Transport) -> TransportEvent {
        for _ in 0..50 {
            match transport.read(Some(Duration::from_secs(5))).unwrap() {
                TransportEvent::Idle | TransportEvent::Startup => continue,
                event => return event,
            }
        }
        panic!("no event of interest within 50 polls");
    }

    #[test]
    fn confirms_serial_and_passes_data_both_ways() {
        let (listener, addr) = listener();
        let board = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(BANNER).unwrap();
            thread::sleep(Duration::from_millis(50));
            stream.write_all(b"Process: JLinkExe\r\n").unwrap();
            thread::sleep(Duration::from_millis(50));
            stream.write_all(&[2, 1]).unwrap();

            let mut reply = [0u8; 2];
            stream.read_exact(&mut reply).unwrap();
            reply
        });

        let mut transport = Transport::open(addr, 123456);
        assert!(matches!(next_event(&mut transport), TransportEvent::Connected));
        assert!(transport.serial_confirmed());

        match next_event(&mut transport) {
            TransportEvent::Received(data) => assert_eq!(data, vec![2, 1]),
            other => panic!("unexpected event {other:?}"),
        }

        transport.write(&[2, 6]).unwrap();
        assert_eq!(board.join().unwrap(), [2, 6]);

        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert!(matches!(transport.write(&[1]), Err(TransportError::Closed)));
    }

    #[test]
    fn runs_over_an_established_link() {
        let (listener, addr) = listener();
        let host = TcpStream::connect(addr).unwrap();
        let (mut board, _) = listener.accept().unwrap();
        board.write_all(BANNER).unwrap();

        let mut transport = Transport::from_link(host, 123456);
        assert!(matches!(next_event(&mut transport), TransportEvent::Connected));

        board.write_all(&[2, 4]).unwrap();
        match next_event(&mut transport) {
            TransportEvent::Received(data) => assert_eq!(data, vec![2, 4]),
            other => panic!("unexpected event {other:?}"),
        }

        transport.write(&[2, 6]).unwrap();
        let mut reply = [0u8; 2];
        board.read_exact(&mut reply).unwrap();
        assert_eq!(reply, [2, 6]);
    }

    #[test]
    fn wrong_serial_closes_the_transport() {
        let (listener, addr) = listener();
        let board = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(BANNER).unwrap();
            // Hold the socket open until the host hangs up.
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf);
        });

        let mut transport = Transport::open(addr, 999);
        let mut errors = 0;
        while !transport.is_closed() {
            if let Ok(TransportEvent::Error(e)) = transport.read(Some(Duration::from_secs(5))) {
                assert!(matches!(
                    e,
                    TransportError::SerialMismatch {
                        expected: 999,
                        found: 123456
                    }
                ));
                errors += 1;
            }
        }

        assert_eq!(errors, 1);
        assert!(matches!(
            transport.read(None),
            Err(TransportError::Closed)
        ));
        board.join().unwrap();
    }

    #[test]
    fn silent_link_fails_serial_confirmation() {
        let (listener, addr) = listener();
        let board = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let _ = stream.read(&mut buf);
        });

        let mut transport = Transport::open(addr, 123456);
        match transport.read(Some(Duration::from_secs(5))).unwrap() {
            TransportEvent::Error(TransportError::SerialUnconfirmed) => {}
            other => panic!("unexpected event {other:?}"),
        }
        assert!(transport.is_closed());
        board.join().unwrap();
    }

    #[test]
    fn peer_hangup_is_an_error() {
        let (listener, addr) = listener();
        let board = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(BANNER).unwrap();
            thread::sleep(Duration::from_millis(50));
        });

        let mut transport = Transport::open(addr, 123456);
        assert!(matches!(next_event(&mut transport), TransportEvent::Connected));
        board.join().unwrap();

        assert!(matches!(
            next_event(&mut transport),
            TransportEvent::Error(TransportError::ConnectionClosed)
        ));
        assert!(transport.is_closed());
    }

    #[test]
    fn refused_connection_is_reported() {
        let (listener, addr) = listener();
        drop(listener);

        let mut transport = Transport::open(addr, 1);
        assert!(matches!(
            transport.read(Some(Duration::from_secs(5))),
            Ok(TransportEvent::Error(TransportError::Io(_)))
        ));
        assert!(transport.is_closed());
    }
}
