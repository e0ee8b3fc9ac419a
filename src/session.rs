//! Runs one experiment from start to finish.
//!
//! A [`Session`] checks that the probe is attached, optionally builds and
//! flashes the firmware, resets the target, opens the RTT transport and then
//! drives the Lys state machine from transport events until the board
//! finishes, something fails, the optional timer expires or the session is
//! cancelled.
//!
//! # Steps
//!
//! 1. [`Probe::enumerate`]: the requested probe must be attached.
//! 2. [`Maker::build_and_flash`], if a project directory was given.
//! 3. [`Probe::attach_and_reset`].
//! 4. [`Transport::open`], then the event loop:
//!    - `Connected`: create the [`Lys`] state machine and [`Probe::resume`]
//!    - `Received`: feed the state machine
//!    - `Idle`: close once the board has finished
//!    - `Error`: flag the record and stop
//! 5. [`Probe::close`].
use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use thiserror::Error;

use crate::{
    cli::ParamError,
    maker::{BuildError, Maker},
    probe::{Probe, ProbeError},
    protocol::{Lys, Message, Notification, SessionState, Value},
    record::SessionRecord,
    transport::{
        DEFAULT_RTT_ADDR, POLL_INTERVAL, Transport, TransportError, TransportEvent,
        TransportWriter,
    },
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("invalid init params: {0}")]
    InvalidInitParams(#[from] ParamError),

    #[error("no J-Link debuggers found")]
    NoProbes,

    #[error("the specified J-Link was not found (SN={0})")]
    ProbeNotFound(u32),

    #[error("probe error: {0}")]
    Probe(#[from] ProbeError),

    #[error("build failed: {0}")]
    Build(#[from] BuildError),
}

impl SessionError {
    /// Process exit status for this error. `0` is reserved for success.
    pub fn exit_code(&self) -> u8 {
        match self {
            SessionError::InvalidParams(_) => 1,
            SessionError::InvalidInitParams(_) => 2,
            SessionError::NoProbes | SessionError::ProbeNotFound(_) => 3,
            SessionError::Probe(_) => 4,
            SessionError::Build(_) => 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// J-Link serial number, checked against the RTT banner.
    pub serial_number: u32,
    /// Sent to the board, in order, before it is started.
    pub init_params: Vec<Value>,
    /// Build and flash before attaching.
    pub maker: Option<Maker>,
    /// Stop as soon as the firmware has been started.
    pub no_result: bool,
    /// Stop this long after the firmware has been started.
    pub timeout: Option<Duration>,
    pub rtt_addr: SocketAddr,
}

impl SessionConfig {
    pub fn new(serial_number: u32) -> Self {
        Self {
            serial_number,
            init_params: Vec::new(),
            maker: None,
            no_result: false,
            timeout: None,
            rtt_addr: DEFAULT_RTT_ADDR,
        }
    }
}

/// Cancels a running session from another thread, e.g. a Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

pub struct Session<P: Probe> {
    config: SessionConfig,
    probe: P,
    cancel: CancelToken,
}

impl<P: Probe> Session<P> {
    pub fn new(config: SessionConfig, probe: P) -> Self {
        Self {
            config,
            probe,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn run(&mut self) -> Result<SessionRecord, SessionError> {
        self.validate()?;
        let serial = self.config.serial_number;

        let probes = self.probe.enumerate()?;
        if probes.is_empty() {
            return Err(SessionError::NoProbes);
        }
        if !probes.contains(&serial) {
            return Err(SessionError::ProbeNotFound(serial));
        }

        if let Some(maker) = &self.config.maker {
            info!("building and flashing project in {}", maker.dir().display());
            maker.build_and_flash(serial)?;
        }

        info!("connecting to J-Link {serial} and resetting target");
        self.probe.attach_and_reset(serial)?;

        let transport = Transport::open(self.config.rtt_addr, serial);
        let outcome = self.interact(transport);
        let released = self.probe.close();

        let mut record = outcome?;
        released?;
        record.stamp();
        Ok(record)
    }

    fn validate(&self) -> Result<(), SessionError> {
        if self.config.no_result && self.config.timeout.is_some() {
            return Err(SessionError::InvalidParams(
                "no_result and timeout are mutually exclusive".into(),
            ));
        }

        for value in &self.config.init_params {
            Message::param(value.clone())
                .encode()
                .map_err(|e| ParamError::Unsendable(e.to_string()))?;
        }
        Ok(())
    }

    /// Drive the protocol over `transport` until the session ends.
    pub fn interact(&mut self, mut transport: Transport) -> Result<SessionRecord, SessionError> {
        let mut record = SessionRecord::new(self.config.init_params.clone());
        let mut lys: Option<Lys<TransportWriter>> = None;
        let mut deadline: Option<Instant> = None;

        while !transport.is_closed() {
            let mut stop = false;

            if self.cancel.is_cancelled() {
                warn!("session cancelled");
                record.error = true;
                stop = true;
            } else if deadline.is_some_and(|at| Instant::now() >= at) {
                info!("timer expired, closing");
                stop = true;
            } else {
                let event = match transport.read(Some(POLL_INTERVAL)) {
                    Ok(event) => event,
                    Err(TransportError::Timeout) => continue,
                    Err(e) => {
                        debug!("transport gone: {e}");
                        break;
                    }
                };

                match event {
                    TransportEvent::Startup => debug!("RTT starting up"),
                    TransportEvent::Connected => {
                        info!("initializing Lys");
                        lys = Some(Lys::new(
                            transport.writer(),
                            self.config.init_params.clone(),
                        ));
                        self.probe.resume()?;
                    }
                    TransportEvent::Received(data) => match lys.as_mut() {
                        Some(lys) => {
                            debug!("data received: {data:?}");
                            if let Err(e) = lys.feed(&data) {
                                error!("malformed data from the board: {e}");
                                record.error = true;
                                stop = true;
                            }
                        }
                        None => debug!("ignoring stale data: {data:?}"),
                    },
                    TransportEvent::Idle => {
                        if lys.as_ref().is_some_and(|l| l.state() == SessionState::Finished) {
                            info!("finished, shutting down");
                            stop = true;
                        }
                    }
                    TransportEvent::Error(e) => {
                        error!("transport error: {e}");
                        record.error = true;
                        stop = true;
                    }
                }
            }

            if let Some(lys) = lys.as_mut() {
                while let Some(notification) = lys.poll_notification() {
                    stop |= self.notified(notification, &mut record, &mut deadline);
                }
            }

            if stop {
                if let Some(lys) = lys.as_mut() {
                    lys.reset();
                }
                transport.close();
            }
        }

        Ok(record)
    }

    /// Apply a state machine notification to the record. Returns whether the
    /// session should stop.
    fn notified(
        &self,
        notification: Notification,
        record: &mut SessionRecord,
        deadline: &mut Option<Instant>,
    ) -> bool {
        match notification {
            Notification::Init => debug!("board initialized"),
            Notification::Result => debug!("board reporting results"),
            Notification::Log(value) => {
                info!("board log: {value}");
                record.log.push(value);
            }
            Notification::Finished(results) => {
                info!("finished, saving {} results", results.len());
                record.result = Some(results);
            }
            Notification::Start => {
                if self.config.no_result {
                    info!("firmware started, exiting");
                    return true;
                }
                if let Some(timeout) = self.config.timeout {
                    info!("setting timer for {timeout:?}");
                    *deadline = Some(Instant::now() + timeout);
                    record.timeout_secs = Some(timeout.as_secs());
                }
            }
            Notification::Violation(violation) => {
                error!("error reported, shutting down: {violation}");
                record.error = true;
                return true;
            }
        }

        false
    }
}
