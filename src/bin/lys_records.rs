use std::{error::Error, path::PathBuf};

use clap::Parser;
use lys::record::read_records;

#[derive(Parser)]
#[command(version, about = "Print the session records saved by lcli -f", long_about = None)]
struct Cli {
    /// Path to the record log
    path: PathBuf,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    for (i, record) in read_records(&cli.path)?.iter().enumerate() {
        if i > 0 {
            println!();
        }
        println!("{record}");
    }

    Ok(())
}
