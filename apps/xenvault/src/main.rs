const BANNER: &str = r#"
__  _____ _ ____   ____ _ _   _| | |_
\ \/ / _ \ '_ \ \ / / _` | | | | | __|
 >  <  __/ | | \ V / (_| | |_| | | |_
/_/\_\___|_| |_|\_/ \__,_|\__,_|_|\__|
  "#;

mod cli;
mod config;
mod jobs;
mod monitoring;
mod orchestrator;
mod shutdown;
mod snapshot;
mod storage;

use clap::Parser;
use colored::Colorize;
use eyre::Context;
use figment::{
    providers::{Format, Serialized, Yaml},
    Figment,
};
use tracing::Level;

use crate::cli::SubCommand;
use crate::config::AppConfig;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    // initialize colored eyre for better-looking panics
    color_eyre::install().unwrap();

    // print banner
    println!("{}", BANNER.cyan());

    // parse cli args
    let cli = cli::XenvaultCli::parse();

    // load default config, then override/merge using the yaml config file
    let config = Figment::from(Serialized::defaults(AppConfig::default()))
        .merge(Yaml::file(&cli.config))
        .extract::<AppConfig>()
        .wrap_err("Failed to load configuration")?;

    // initialize tracing/logging
    let log_level = match config.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_max_level(log_level)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // wire termination signals to the cancellation token
    let cancel = shutdown::install();

    let any_failed = match cli.subcmd {
        SubCommand::Backup(args) => orchestrator::backup(&config, &args, &cancel).await?,
        SubCommand::Restore(args) => {
            orchestrator::restore(&args, &cancel).await?;
            false
        }
        SubCommand::Transfer(args) => orchestrator::transfer(&args, &cancel).await?,
        SubCommand::Clean(args) => orchestrator::clean(&config, &args, &cancel).await?,
        SubCommand::SendReport(_) => {
            orchestrator::send_report(&config).await?;
            false
        }
    };

    if any_failed {
        std::process::exit(1);
    }
    Ok(())
}
