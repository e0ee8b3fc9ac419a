use std::{
    collections::VecDeque,
    io::{self, ErrorKind},
    sync::mpsc::{Receiver, Sender, TryRecvError},
    thread,
};

use log::{debug, trace, warn};

use super::{Link, POLL_INTERVAL, READ_CHUNK, TransportError, WorkerEvent};

/// Instructions from the consumer to the worker.
#[derive(Debug)]
pub(crate) enum Command {
    Write(Vec<u8>),
    Stop,
}

/// The thread that owns the link.
#[derive(Debug)]
pub(crate) struct Worker {
    thread: Option<thread::JoinHandle<()>>,
}

impl Worker {
    pub fn spawn<L, C>(connect: C, events: Sender<WorkerEvent>, commands: Receiver<Command>) -> Self
    where
        L: Link,
        C: FnOnce() -> io::Result<L> + Send + 'static,
    {
        let thread = thread::spawn(move || {
            let link = match connect().and_then(|mut link| {
                link.set_poll_interval(POLL_INTERVAL)?;
                Ok(link)
            }) {
                Ok(link) => link,
                Err(e) => {
                    warn!("failed to open link: {e}");
                    let _ = events.send(WorkerEvent::Error(e.into()));
                    return;
                }
            };

            debug!("link open");
            run(link, &events, &commands);
            debug!("link released");
        });

        Self {
            thread: Some(thread),
        }
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("transport worker panicked");
            }
        }
    }
}

/// Multiplex the link until told to stop or it fails. The link is dropped
/// when this returns.
fn run<L: Link>(mut link: L, events: &Sender<WorkerEvent>, commands: &Receiver<Command>) {
    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
    let mut buf = [0u8; READ_CHUNK];

    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Write(bytes)) => pending.push_back(bytes),
                Ok(Command::Stop) => {
                    drain(&mut link, pending);
                    return;
                }
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => break,
            }
        }

        let mut idle = true;

        if let Some(front) = pending.front_mut() {
            match link.write(front) {
                Ok(0) => {
                    let _ = events.send(WorkerEvent::Error(TransportError::ConnectionBroken));
                    return;
                }
                Ok(n) => {
                    trace!("sent {n} bytes");
                    idle = false;
                    if n < front.len() {
                        front.drain(..n);
                    } else {
                        pending.pop_front();
                    }
                    if let Err(e) = link.flush() {
                        let _ = events.send(WorkerEvent::Error(e.into()));
                        return;
                    }
                }
                Err(e) if would_block(&e) => {}
                Err(e) => {
                    let _ = events.send(WorkerEvent::Error(e.into()));
                    return;
                }
            }
        }

        // Blocks for at most the poll interval.
        match link.read(&mut buf) {
            Ok(0) => {
                let _ = events.send(WorkerEvent::Error(TransportError::ConnectionClosed));
                return;
            }
            Ok(n) => {
                trace!("received {n} bytes");
                idle = false;
                if events.send(WorkerEvent::Received(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
            Err(e) if would_block(&e) => {}
            Err(e) => {
                let _ = events.send(WorkerEvent::Error(e.into()));
                return;
            }
        }

        if idle && events.send(WorkerEvent::Idle).is_err() {
            return;
        }
    }
}

/// Best effort delivery of writes queued before a stop.
fn drain<L: Link>(link: &mut L, pending: VecDeque<Vec<u8>>) {
    for bytes in pending {
        if let Err(e) = link.write_all(&bytes).and_then(|_| link.flush()) {
            debug!("dropping {} queued bytes on stop: {e}", bytes.len());
            return;
        }
    }
}

fn would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
    )
}
