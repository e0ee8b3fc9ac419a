//! Build and flash firmware with `make`.
//!
//! Projects are expected to provide `flash_debug` and `flash_release` targets
//! that accept the probe serial number as `SN=<serial>`.
use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::Command,
};

use log::{debug, info};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("'{0}' is not a directory")]
    NotADirectory(PathBuf),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("make exited with error number {code:?}")]
    Failed { code: Option<i32> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuildProfile {
    #[default]
    Debug,
    Release,
}

impl fmt::Display for BuildProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildProfile::Debug => f.write_str("debug"),
            BuildProfile::Release => f.write_str("release"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Maker {
    dir: PathBuf,
    profile: BuildProfile,
    program: String,
}

impl Maker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            profile: BuildProfile::default(),
            program: "make".into(),
        }
    }

    pub fn profile(mut self, profile: BuildProfile) -> Self {
        self.profile = profile;
        self
    }

    /// Use a different executable in place of `make`.
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Build the project and download it to the probe with `serial_number`.
    pub fn build_and_flash(&self, serial_number: u32) -> Result<(), BuildError> {
        if !self.dir.is_dir() {
            return Err(BuildError::NotADirectory(self.dir.clone()));
        }

        let target = format!("flash_{}", self.profile);
        let serial = format!("SN={serial_number}");
        info!("building {target} in {}", self.dir.display());

        let output = Command::new(&self.program)
            .arg(&target)
            .arg(&serial)
            .current_dir(&self.dir)
            .output()
            .map_err(|source| BuildError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        debug!("{} stdout: {}", self.program, String::from_utf8_lossy(&output.stdout));
        if output.status.success() {
            Ok(())
        } else {
            debug!("{} stderr: {}", self.program, String::from_utf8_lossy(&output.stderr));
            Err(BuildError::Failed {
                code: output.status.code(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;

    use super::*;

    #[test]
    fn successful_build() {
        let temp = TempDir::new("maker").unwrap();
        let maker = Maker::new(temp.path()).program("true");
        maker.build_and_flash(123).unwrap();
    }

    #[test]
    fn failed_build_reports_exit_code() {
        let temp = TempDir::new("maker").unwrap();
        let maker = Maker::new(temp.path())
            .profile(BuildProfile::Release)
            .program("false");

        assert!(matches!(
            maker.build_and_flash(123),
            Err(BuildError::Failed { code: Some(1) })
        ));
    }

    #[test]
    fn missing_directory() {
        let temp = TempDir::new("maker").unwrap();
        let maker = Maker::new(temp.path().join("nope"));

        assert!(matches!(
            maker.build_and_flash(1),
            Err(BuildError::NotADirectory(_))
        ));
    }

    #[test]
    fn profile_names_make_targets() {
        assert_eq!(BuildProfile::Debug.to_string(), "debug");
        assert_eq!(BuildProfile::Release.to_string(), "release");
    }
}
