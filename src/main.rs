use altherma_modbus_tools::commands;
use clap::Parser as _;
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

const LOG_VARIABLE: &str = "ALTHERMA_MODBUS_TOOLS_LOG";

#[derive(clap::Parser)]
#[clap(version, about, author)]
enum Commands {
    Registers(commands::registers_list::Args),
    Read(commands::read::Args),
    Watch(commands::watch::Args),
    Write(commands::write::Args),
}

fn end<E: std::error::Error>(r: Result<(), E>) {
    std::process::exit(match r {
        Ok(_) => 0,
        Err(e) => {
            eprintln!("error: {e}");
            let mut cause = e.source();
            while let Some(e) = cause {
                eprintln!("  because: {e}");
                cause = e.source();
            }
            1
        }
    });
}

fn main() {
    let filter_description = std::env::var(LOG_VARIABLE).unwrap_or_else(|_| "info".to_string());
    let filter = match filter_description.parse::<tracing_subscriber::filter::targets::Targets>() {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("error: {LOG_VARIABLE} is not a valid filter: {e}");
            std::process::exit(1);
        }
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
    match Commands::parse() {
        Commands::Registers(args) => end(commands::registers_list::run(args)),
        Commands::Read(args) => end(commands::read::run(args)),
        Commands::Watch(args) => end(commands::watch::run(args)),
        Commands::Write(args) => end(commands::write::run(args)),
    }
}
