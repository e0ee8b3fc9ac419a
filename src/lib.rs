pub mod cli;
pub mod maker;
pub mod probe;
pub mod protocol;
pub mod record;
pub mod session;
pub mod transport;

pub use probe::{NrfJprog, Probe};
pub use record::{RecordLog, SessionRecord};
pub use session::{CancelToken, Session, SessionConfig, SessionError};
