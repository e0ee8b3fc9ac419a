//! Session results and the append-only record log.
//!
//! Every finished session produces one [`SessionRecord`]. The command line
//! tool prints it, or appends it to a [`RecordLog`] so that a long series of
//! experiments can be collected in one file and read back later.
use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, BufRead, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info};
use thiserror::Error;

use crate::protocol::Value;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record log I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode record: {0}")]
    Serialize(#[from] bincode::error::EncodeError),

    #[error("corrupt record log: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
}

/// Outcome of one session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Encode, Decode)]
pub struct SessionRecord {
    pub init_params: Vec<Value>,
    pub log: Vec<Value>,
    /// `None` unless the board reached `Finished`.
    pub result: Option<Vec<Value>>,
    pub error: bool,
    /// Seconds since the Unix epoch at the end of the session.
    pub timestamp: u64,
    /// Set when the session was cut short by a timer.
    pub timeout_secs: Option<u64>,
}

impl SessionRecord {
    pub fn new(init_params: Vec<Value>) -> Self {
        Self {
            init_params,
            ..Default::default()
        }
    }

    pub fn stamp(&mut self) {
        self.timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
    }
}

struct Params<'a>(&'a [Value]);

impl fmt::Display for Params<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            let kind = match value {
                Value::Array(element, _) => *element,
                other => other.param_type(),
            };
            write!(f, "({kind}, {value})")?;
        }
        write!(f, "]")
    }
}

impl fmt::Display for SessionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "TIMESTAMP: {}", self.timestamp)?;
        writeln!(f, "ERROR: {}", self.error)?;
        if let Some(secs) = self.timeout_secs {
            writeln!(f, "TIMEOUT_S: {secs}")?;
        }
        writeln!(f, "INIT_PARAMS: {}", Params(&self.init_params))?;
        writeln!(f, "LOG: {}", Params(&self.log))?;
        match &self.result {
            Some(result) => write!(f, "RESULT: {}", Params(result)),
            None => write!(f, "RESULT: none"),
        }
    }
}

/// Append-only file of [`SessionRecord`]s.
pub struct RecordLog {
    config: Configuration<BigEndian, Fixint>,
    writer: BufWriter<File>,
    path: PathBuf,
}

impl RecordLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding();

        debug!("record log open at {}", path.display());
        Ok(Self {
            config,
            writer: BufWriter::new(file),
            path,
        })
    }

    pub fn append(&mut self, record: &SessionRecord) -> Result<(), RecordError> {
        encode_into_std_write(record, &mut self.writer, self.config)?;
        self.writer.flush()?;
        info!("record appended to {}", self.path.display());
        Ok(())
    }

    /// Every record in the log, oldest first.
    pub fn records(&self) -> Result<Vec<SessionRecord>, RecordError> {
        read_records(&self.path)
    }
}

/// Read back a record log without opening it for writing.
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<SessionRecord>, RecordError> {
    let config = bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding();
    let mut reader = BufReader::new(File::open(path)?);
    let mut out = Vec::new();

    while !reader.fill_buf()?.is_empty() {
        let record: SessionRecord = decode_from_std_read(&mut reader, config)?;
        out.push(record);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use crate::protocol::ParamType;

    use super::*;

    fn finished() -> SessionRecord {
        SessionRecord {
            init_params: vec![
                Value::Uint32(10),
                Value::Array(ParamType::Int8, vec![Value::Int8(-2), Value::Int8(1)]),
            ],
            log: vec![Value::String("started".into())],
            result: Some(vec![Value::Uint32(20)]),
            error: false,
            timestamp: 1_700_000_000,
            timeout_secs: None,
        }
    }

    #[test]
    fn log_appends_records() {
        let temp = TempDir::new("records").unwrap();
        let path = temp.path().join("results.log");

        let mut log = RecordLog::open(&path).unwrap();
        let mut failed = SessionRecord::new(vec![]);
        failed.error = true;
        failed.timeout_secs = Some(5);

        log.append(&finished()).unwrap();
        log.append(&failed).unwrap();
        assert_eq!(log.records().unwrap(), vec![finished(), failed.clone()]);
        drop(log);

        // Reopening appends rather than truncating.
        let mut log = RecordLog::open(&path).unwrap();
        log.append(&finished()).unwrap();
        assert_eq!(
            read_records(&path).unwrap(),
            vec![finished(), failed, finished()]
        );
    }

    #[test]
    fn truncated_log_is_an_error() {
        let temp = TempDir::new("records").unwrap();
        let path = temp.path().join("results.log");

        let mut log = RecordLog::open(&path).unwrap();
        log.append(&finished()).unwrap();
        drop(log);

        let len = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 3).unwrap();

        assert!(matches!(
            read_records(&path),
            Err(RecordError::Deserialize(_))
        ));
    }

    #[test]
    fn record_display() {
        let text = finished().to_string();
        assert!(text.contains("INIT_PARAMS: [(UINT32, 10), (INT8, [-2, 1])]"));
        assert!(text.contains("LOG: [(STRING, \"started\")]"));
        assert!(text.ends_with("RESULT: [(UINT32, 20)]"));

        let text = SessionRecord::new(vec![]).to_string();
        assert!(text.contains("RESULT: none"));
        assert!(!text.contains("TIMEOUT_S"));
    }
}
