use clap::Parser;
use tracing_subscriber::EnvFilter;

use ironrelay::cli::{Cli, Command, run_plugins_command, run_providers_command, run_serve};
use ironrelay::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing();

    let config = Config::from_env()?;
    match cli.command {
        None | Some(Command::Serve) => run_serve(config).await,
        Some(Command::Plugins(cmd)) => run_plugins_command(&cmd, &config).await,
        Some(Command::Providers(cmd)) => run_providers_command(&cmd, &config).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ironrelay=info,tower_http=info"));
    let json = std::env::var("IRONRELAY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
}
