use std::process::ExitCode;

use clap::Parser;
use log::warn;

use lys::{CancelToken, NrfJprog, RecordLog, Session, cli::Cli};

/// Exit status when the session ran but its record could not be saved.
const RECORD_FAILED: u8 = 4;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // `-v` sets the default level, RUST_LOG still overrides it.
    env_logger::Builder::new()
        .filter_level(cli.log_level())
        .parse_default_env()
        .init();

    let cancel = CancelToken::new();
    let handler = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || handler.cancel()) {
        warn!("failed to install Ctrl-C handler: {e}");
    }

    let mut session = Session::new(cli.session_config(), NrfJprog::default()).with_cancel(cancel);
    let record = match session.run() {
        Ok(record) => record,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(e.exit_code());
        }
    };

    match &cli.log_file {
        Some(path) => {
            if let Err(e) = RecordLog::open(path).and_then(|mut log| log.append(&record)) {
                eprintln!("failed to save session record. error: {e}");
                return ExitCode::from(RECORD_FAILED);
            }
        }
        None => println!("{record}"),
    }

    ExitCode::SUCCESS
}
