//! `nvmc`: Find My accessory settings provisioning/extraction CLI.
//!
//! Covers the two commands this toolkit implements (`provision`, `extract`);
//! UARP firmware-update provisioning is out of scope.

mod cmd_extract;
mod cmd_provision;
mod tool;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "nvmc", about = "Find My accessory settings provisioning and extraction toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Provision(cmd_provision::ProvisionArgs),
    Extract(cmd_extract::ExtractArgs),
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Provision(args) => cmd_provision::run(args),
        Command::Extract(args) => cmd_extract::run(args),
    };

    if let Err(err) = result {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
