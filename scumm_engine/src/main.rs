use anyhow::Result;
use scumm_engine::cli::{self, Command};
use scumm_engine::runtime;

fn main() -> Result<()> {
    let command = cli::parse()?;
    let verbose = matches!(&command, Command::Run(args) if args.verbose);
    let default_filter = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    match command {
        Command::Run(args) => runtime::execute(args),
        Command::InspectSave(path) => runtime::inspect_save(&path),
    }
}
