//! Command line surface of the `lcli` tool.
//!
//! Init parameters are written `TYPE:VALUE`. The type is a name such as
//! `uint32` (any case, optionally prefixed with `LYS_PARAM_TYPE_`) or its
//! numeric tag. A value in brackets is an array of that type:
//!
//! ```text
//! -i UINT32:10 -i int8:-3 -i BOOL:true -i STRING:hello -i UINT8:[1, 2, 3]
//! ```
use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::Parser;
use log::LevelFilter;
use thiserror::Error;

use crate::{
    maker::{BuildProfile, Maker},
    protocol::{CodecError, ParamType, Value},
    session::SessionConfig,
    transport::DEFAULT_RTT_ADDR,
};

const TYPE_PREFIX: &str = "LYS_PARAM_TYPE_";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("expected TYPE:VALUE, got '{0}'")]
    Syntax(String),

    #[error("unknown parameter type '{0}'")]
    UnknownType(String),

    #[error("arrays are written TYPE:[a, b, ...]")]
    UntypedArray,

    #[error("'{value}' is not a valid {kind}")]
    BadValue { kind: ParamType, value: String },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("parameter does not fit in a message: {0}")]
    Unsendable(String),
}

/// Run an experiment on a Lys board and report its results.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Serial number of the J-Link probe
    #[arg(short, long)]
    pub serial_number: u32,

    /// Build and flash the project in this directory first
    #[arg(short = 'd', long)]
    pub makefile_dir: Option<PathBuf>,

    /// Flash the release build instead of the debug build
    #[arg(long, requires = "makefile_dir")]
    pub release: bool,

    /// Init parameter, TYPE:VALUE (repeatable)
    #[arg(short, long = "init-param", value_name = "TYPE:VALUE", value_parser = parse_param)]
    pub init_params: Vec<Value>,

    /// Stop this many seconds after the firmware has started
    #[arg(short, long, value_name = "SECS", conflicts_with = "no_result")]
    pub timeout: Option<u64>,

    /// Stop as soon as the firmware has started
    #[arg(short, long)]
    pub no_result: bool,

    /// Append the session record to this file instead of printing it
    #[arg(short = 'f', long)]
    pub log_file: Option<PathBuf>,

    /// Address of the RTT telnet server
    #[arg(long, default_value_t = DEFAULT_RTT_ADDR)]
    pub rtt_addr: SocketAddr,

    /// Debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Cli {
    pub fn session_config(&self) -> SessionConfig {
        let profile = if self.release {
            BuildProfile::Release
        } else {
            BuildProfile::Debug
        };

        SessionConfig {
            serial_number: self.serial_number,
            init_params: self.init_params.clone(),
            maker: self
                .makefile_dir
                .as_ref()
                .map(|dir| Maker::new(dir).profile(profile)),
            no_result: self.no_result,
            timeout: self.timeout.map(Duration::from_secs),
            rtt_addr: self.rtt_addr,
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        if self.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        }
    }
}

/// Parse a `TYPE:VALUE` init parameter.
pub fn parse_param(arg: &str) -> Result<Value, ParamError> {
    let (kind, value) = arg
        .split_once(':')
        .ok_or_else(|| ParamError::Syntax(arg.to_string()))?;

    let kind = parse_type(kind)?;
    if kind == ParamType::Array {
        return Err(ParamError::UntypedArray);
    }

    let bracketed = value
        .trim()
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'));

    match bracketed {
        Some(_) if kind == ParamType::String => Err(CodecError::StringArray.into()),
        Some(inner) if inner.trim().is_empty() => Err(CodecError::EmptyArray.into()),
        Some(inner) => {
            let items = inner
                .split(',')
                .map(|item| parse_scalar(kind, item.trim()))
                .collect::<Result<_, _>>()?;
            Ok(Value::Array(kind, items))
        }
        None => parse_scalar(kind, value),
    }
}

fn parse_type(name: &str) -> Result<ParamType, ParamError> {
    let upper = name.trim().to_ascii_uppercase();
    let bare = upper.strip_prefix(TYPE_PREFIX).unwrap_or(upper.as_str());
    let unknown = || ParamError::UnknownType(name.to_string());

    if let Ok(tag) = bare.parse::<u8>() {
        return ParamType::try_from(tag).map_err(|_| unknown());
    }
    ParamType::ALL
        .into_iter()
        .find(|kind| kind.name() == bare)
        .ok_or_else(unknown)
}

fn parse_scalar(kind: ParamType, text: &str) -> Result<Value, ParamError> {
    if kind == ParamType::String {
        return Ok(Value::String(text.to_string()));
    }

    let text = text.trim();
    if kind == ParamType::Bool {
        match text.to_ascii_lowercase().as_str() {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            _ => {}
        }
    }

    let number = parse_integer(text).ok_or_else(|| ParamError::BadValue {
        kind,
        value: text.to_string(),
    })?;
    Ok(Value::integer(kind, number)?)
}

/// Decimal or `0x` hexadecimal, with an optional sign.
fn parse_integer(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };

    let magnitude = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16).ok()?,
        None => digits.parse::<i64>().ok()?,
    };

    Some(if negative { -magnitude } else { magnitude })
}
