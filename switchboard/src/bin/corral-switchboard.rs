use std::process::ExitCode;

use clap::{Parser, Subcommand};
use corral_switchboard::serve::{self, ServeCommand};

#[derive(Debug, Parser)]
#[command(version, about = "Corral control plane")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the agent and admin HTTP APIs.
    Serve(ServeCommand),
    /// Enqueue due scheduled backups and prunes once, then exit.
    SchedulePass(ServeCommand),
}

#[tokio::main]
async fn main() -> ExitCode {
    let (name, result) = match Args::parse().command {
        Command::Serve(cmd) => ("serve", serve::serve(cmd).await),
        Command::SchedulePass(cmd) => ("schedule-pass", serve::schedule_once(cmd).await),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("corral-switchboard {name}: {e:?}");
            ExitCode::FAILURE
        }
    }
}
