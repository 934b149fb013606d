//! Provider CLI commands.

use clap::Subcommand;

use super::build_switchboard;
use crate::config::Config;

#[derive(Subcommand, Debug)]
pub enum ProvidersCommand {
    /// List provider configs and which one is active at startup.
    List,
}

pub async fn run_providers_command(cmd: &ProvidersCommand, config: &Config) -> anyhow::Result<()> {
    match cmd {
        ProvidersCommand::List => {
            let switchboard = build_switchboard(config)?;
            println!("{:<2}{:<20} {:<11} {:<40} DESCRIPTION", "", "NAME", "CREDENTIAL", "BASE URL");
            for provider in switchboard.list() {
                println!(
                    "{:<2}{:<20} {:<11} {:<40} {}",
                    if provider.is_active { "*" } else { "" },
                    provider.name,
                    if provider.credential_present { "set" } else { "missing" },
                    provider.base_url,
                    provider.description
                );
            }
        }
    }
    Ok(())
}
