use std::{io, path::PathBuf, process};

use ::tracing::{error, info, info_span};
use clap::{Parser, Subcommand};
use service::SubscriberService;
use state_store::ContainerJournal;

mod config;
mod inspect;
mod service;
mod tracing;
use crate::tracing::setup_tracing;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    #[arg(
        short,
        long,
        global = true,
        value_name = "config file",
        help = "Path to config file"
    )]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Container state journal tools.
    Journal {
        #[command(subcommand)]
        command: JournalCommand,
    },
    /// Stream tuples from a buffer server into a logging sink.
    Subscribe {
        #[arg(long, help = "Buffer server address, host:port")]
        addr: String,
        #[arg(long, default_value = "console")]
        sink: String,
    },
}

#[derive(Subcommand)]
enum JournalCommand {
    /// Print every journal entry as a JSON line.
    Inspect,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match cli.config {
        Some(path) => match config::ServerConfig::from_path(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("invalid config {}: {:#}", path.display(), err);
                process::exit(2);
            }
        },
        None => config::ServerConfig::default(),
    };

    let telemetry = match setup_tracing(&config) {
        Ok(telemetry) => telemetry,
        Err(err) => {
            eprintln!("Error setting up tracing: {:?}", err);
            process::exit(2);
        }
    };

    let root_span = info_span!(
        "streamgrid",
        env = config.env,
        "streamgrid-instance" = config.instance_id()
    );
    let _guard = root_span.enter();

    let result = match cli.command {
        Command::Journal {
            command: JournalCommand::Inspect,
        } => ContainerJournal::open(&config.journal).and_then(|journal| {
            inspect::inspect_journal(&journal, &mut io::stdout().lock()).map(|_| ())
        }),
        Command::Subscribe { addr, sink } => SubscriberService::new(config)
            .run(&addr, &sink)
            .await
            .map(|delivered| info!(delivered, "subscriber finished")),
    };

    let failed = result.is_err();
    if let Err(err) = result {
        error!("command failed: {:?}", err);
    }

    // export traces before shutdown
    telemetry.shutdown();
    if failed {
        process::exit(1);
    }
}
