//! Subcommand dispatch and execution.
//!
//! The [`dispatch`] function routes the parsed CLI to the appropriate
//! subcommand handler: [`run`], [`init`], or [`validate`]. Each handler
//! lives in its own submodule.

pub mod init;
pub mod run;
pub mod validate;

use crate::cli::{Cli, Commands};
use crate::error::DoormanError;

pub async fn dispatch(cli: Cli) -> Result<(), DoormanError> {
    match cli.command {
        Some(Commands::Run(args)) => run::execute(*args).await,
        Some(Commands::Init(ref args)) => init::execute(args),
        Some(Commands::Validate(ref args)) => validate::execute(args),
        None => {
            print_welcome();
            Ok(())
        }
    }
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        "\n  doorman v{version} \u{2014} identity-aware OIDC reverse proxy\n\n  \
         No command provided. To get started:\n\n    \
         doorman init                  Generate a starter config\n    \
         doorman run                   Start the proxy (auto-detects ./doorman.yaml)\n    \
         doorman run -c gate.yaml      Start with a specific config file\n    \
         doorman --help                See all commands and options\n"
    );
}
