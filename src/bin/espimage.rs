use clap::Parser;
use espimage::{cli, cli::Cli, logging::initialize_logger};
use miette::Result;

fn main() -> Result<()> {
    miette::set_panic_hook();

    // Parse any provided command-line arguments, or print the help message
    // and terminate if the invocation is not correct.
    let args = Cli::parse();
    initialize_logger(args.log_level());

    cli::run(args)?;
    Ok(())
}
