use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(about = "Host for the cooperative script VM", version)]
pub struct Args {
    #[command(subcommand)]
    pub command: CommandArgs,
}

#[derive(Subcommand, Debug)]
pub enum CommandArgs {
    /// Run a script bundle for a number of ticks
    Run(RunFlags),
    /// Decode a save file and print it as JSON
    InspectSave {
        /// Save file written by `run --save`
        path: PathBuf,
    },
}

#[derive(ClapArgs, Debug)]
pub struct RunFlags {
    /// JSON script bundle to load
    #[arg(long)]
    pub bundle: PathBuf,

    /// Optional VM configuration JSON (defaults apply to missing fields)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Number of scheduler ticks to run
    #[arg(long, default_value_t = 10)]
    pub ticks: u32,

    /// Extra scripts to start after entering the first room
    #[arg(long = "start", value_name = "SCRIPT")]
    pub start: Vec<u16>,

    /// Ticks at which to send the cutscene skip signal
    #[arg(long = "skip-at", value_name = "TICK")]
    pub skip_at: Vec<u32>,

    /// Path to write the VM event log as JSON
    #[arg(long)]
    pub event_log_json: Option<PathBuf>,

    /// Path to write a save file after the last tick
    #[arg(long)]
    pub save: Option<PathBuf>,

    /// Log scheduling decisions at debug level
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug)]
pub enum Command {
    Run(RunArgs),
    InspectSave(PathBuf),
}

#[derive(Debug, Clone)]
pub struct RunArgs {
    pub bundle: PathBuf,
    pub config: Option<PathBuf>,
    pub ticks: u32,
    pub start: Vec<u16>,
    pub skip_at: Vec<u32>,
    pub event_log_json: Option<PathBuf>,
    pub save: Option<PathBuf>,
    pub verbose: bool,
}

pub fn parse() -> Result<Command> {
    let args = Args::parse();
    args.into_command()
}

impl Args {
    pub fn into_command(self) -> Result<Command> {
        match self.command {
            CommandArgs::Run(flags) => {
                if let Some(tick) = flags.skip_at.iter().find(|&&tick| tick >= flags.ticks) {
                    bail!(
                        "--skip-at {tick} is never reached with --ticks {}",
                        flags.ticks
                    );
                }
                if flags.start.contains(&0) {
                    bail!("--start 0 does not name a script");
                }
                Ok(Command::Run(RunArgs {
                    bundle: flags.bundle,
                    config: flags.config,
                    ticks: flags.ticks,
                    start: flags.start,
                    skip_at: flags.skip_at,
                    event_log_json: flags.event_log_json,
                    save: flags.save,
                    verbose: flags.verbose,
                }))
            }
            CommandArgs::InspectSave { path } => Ok(Command::InspectSave(path)),
        }
    }
}
