//! Debug probe and target control.
//!
//! A session only needs four things from the probe: list the attached probes,
//! attach to one and reset the target, let the target run once the RTT
//! transport is up, and let go afterwards. [`NrfJprog`] does this with
//! Nordic's `nrfjprog` command-line tool.
use std::{
    io,
    process::{Command, Output},
};

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} {action} failed with exit code {code:?}: {stderr}")]
    Failed {
        program: String,
        action: &'static str,
        code: Option<i32>,
        stderr: String,
    },

    #[error("no probe attached, attach_and_reset must come first")]
    NotAttached,

    #[error("already attached to probe {0}")]
    AlreadyAttached(u32),
}

pub trait Probe {
    /// Serial numbers of the attached probes.
    fn enumerate(&mut self) -> Result<Vec<u32>, ProbeError>;

    /// Connect to the probe with `serial_number` and reset the target,
    /// leaving it halted.
    fn attach_and_reset(&mut self, serial_number: u32) -> Result<(), ProbeError>;

    /// Let the target run.
    fn resume(&mut self) -> Result<(), ProbeError>;

    /// Release the probe.
    fn close(&mut self) -> Result<(), ProbeError>;
}

/// Probe control through the `nrfjprog` command-line tool.
#[derive(Debug, Clone)]
pub struct NrfJprog {
    program: String,
    family: String,
    attached: Option<u32>,
}

impl Default for NrfJprog {
    fn default() -> Self {
        Self::new("NRF52")
    }
}

impl NrfJprog {
    pub fn new(family: impl Into<String>) -> Self {
        Self {
            program: "nrfjprog".into(),
            family: family.into(),
            attached: None,
        }
    }

    /// Use a different executable, e.g. a full path.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    fn run(&self, action: &'static str, args: &[&str]) -> Result<Output, ProbeError> {
        debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .map_err(|source| ProbeError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(output)
        } else {
            Err(ProbeError::Failed {
                program: self.program.clone(),
                action,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn run_attached(&self, action: &'static str, flag: &str) -> Result<(), ProbeError> {
        let serial = self.attached.ok_or(ProbeError::NotAttached)?.to_string();
        self.run(action, &["--family", &self.family, "--snr", &serial, flag])?;
        Ok(())
    }
}

impl Probe for NrfJprog {
    fn enumerate(&mut self) -> Result<Vec<u32>, ProbeError> {
        let output = self.run("enumerate", &["--ids"])?;
        Ok(parse_ids(&String::from_utf8_lossy(&output.stdout)))
    }

    fn attach_and_reset(&mut self, serial_number: u32) -> Result<(), ProbeError> {
        if let Some(attached) = self.attached {
            return Err(ProbeError::AlreadyAttached(attached));
        }
        self.attached = Some(serial_number);

        info!("resetting target behind probe {serial_number}");
        let result = self
            .run_attached("reset", "--reset")
            .and_then(|_| self.run_attached("halt", "--halt"));
        if result.is_err() {
            self.attached = None;
        }
        result
    }

    fn resume(&mut self) -> Result<(), ProbeError> {
        self.run_attached("run", "--run")
    }

    fn close(&mut self) -> Result<(), ProbeError> {
        self.attached.take().ok_or(ProbeError::NotAttached)?;
        Ok(())
    }
}

/// Parse `nrfjprog --ids` output: one serial number per line.
pub fn parse_ids(output: &str) -> Vec<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}
