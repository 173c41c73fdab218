// workbench CLI entry point.

use clap::Parser;

mod commands;
mod exit_code;
mod output;

use exit_code::ExitCode;
use output::OutputFormat;

#[derive(Parser)]
#[command(name = "workbench", about = "Inspect and edit workflow history")]
struct Cli {
    #[command(flatten)]
    global: commands::GlobalArgs,

    #[command(subcommand)]
    command: commands::Command,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let format = OutputFormat::detect(cli.global.json);
    match commands::run(&cli.global, cli.command, format) {
        Ok(()) => ExitCode::Success.into(),
        Err(error) => {
            output::print_anyhow_error(format, &error);
            ExitCode::from_error(&error).into()
        }
    }
}
