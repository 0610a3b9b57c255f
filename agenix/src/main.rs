use std::process::ExitCode;

use clap::Parser;

use agenix::cmd::Cli;

fn main() -> ExitCode {
    let cmd = Cli::parse();
    cmd.init_tracing();

    match cmd.main() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("agenix: {err}");
            ExitCode::from(err.exit_code())
        }
    }
}
