//! J-Link serial number confirmation.
//!
//! The first time the RTT socket is read the J-Link prints a few lines of
//! banner before any target data:
//!
//! ```text
//! SEGGER J-Link V5.02k - Real time terminal output
//! J-Link OB-SAM3U128-V2-NordicSemi compiled Mar 15 2016 18:03:17 V1.0, SN=682371263
//! Process: JLinkExe
//! ```
//!
//! The serial number in that banner must match the probe the session was
//! opened for before any received data is treated as protocol traffic.
use log::{debug, info};

use super::{TransportError, TransportEvent, WorkerEvent};

const PROBE_LINE: &str = "J-Link ";
const SERIAL_KEY: &str = "SN=";
const PROCESS_LINE: &[u8] = b"Process: ";

/// Find the probe serial number in a chunk of banner text.
pub fn parse_serial(chunk: &[u8]) -> Option<u32> {
    let text = String::from_utf8_lossy(chunk);

    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| line.starts_with(PROBE_LINE))
        .find_map(|line| {
            let at = line.find(SERIAL_KEY)?;
            line[at + SERIAL_KEY.len()..].trim().parse().ok()
        })
}

/// Turns raw worker events into session events, holding back data until the
/// serial number has been confirmed.
#[derive(Debug)]
pub(crate) struct SerialGate {
    expected: u32,
    confirmed: bool,
}

impl SerialGate {
    pub fn new(expected: u32) -> Self {
        Self {
            expected,
            confirmed: false,
        }
    }

    pub fn confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn classify(&mut self, event: WorkerEvent) -> TransportEvent {
        match event {
            WorkerEvent::Received(chunk) if self.confirmed => {
                if chunk.starts_with(PROCESS_LINE) {
                    TransportEvent::Startup
                } else {
                    TransportEvent::Received(chunk)
                }
            }
            WorkerEvent::Received(chunk) => match parse_serial(&chunk) {
                Some(found) if found == self.expected => {
                    info!("confirmed J-Link serial number {found}");
                    self.confirmed = true;
                    TransportEvent::Connected
                }
                Some(found) => TransportEvent::Error(TransportError::SerialMismatch {
                    expected: self.expected,
                    found,
                }),
                None => {
                    debug!("startup banter: {:?}", String::from_utf8_lossy(&chunk));
                    TransportEvent::Startup
                }
            },
            WorkerEvent::Idle if self.confirmed => TransportEvent::Idle,
            WorkerEvent::Idle => TransportEvent::Error(TransportError::SerialUnconfirmed),
            WorkerEvent::Error(e) => TransportEvent::Error(e),
        }
    }
}
