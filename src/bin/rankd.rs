use std::path::PathBuf;

use clap::Parser;
use dotenv::dotenv;
use rankmsg::{setup_tracing, AppResult, MessengerConfig, Rank};
use tokio::runtime;
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    /// namer address, overrides the config file
    #[arg(long)]
    pub namer: Option<String>,
    /// listen port, overrides the config file
    #[arg(short, long)]
    pub port: Option<u16>,
    /// directory for the rolling log file
    #[arg(long, default_value = "./logs")]
    pub log_dir: String,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

fn level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn load_config(commandline: &CommandLine) -> AppResult<MessengerConfig> {
    let config_path = commandline.conf.as_ref().map(PathBuf::from);
    let mut config = match config_path {
        Some(path) => MessengerConfig::set_up_config(path)?,
        None => {
            let default_path = PathBuf::from("./conf.toml");
            if default_path.exists() {
                MessengerConfig::set_up_config(default_path)?
            } else {
                MessengerConfig::default()
            }
        }
    };
    if let Some(namer) = &commandline.namer {
        config.namer.addr = Some(namer.clone());
    }
    if let Some(port) = commandline.port {
        config.network.port = port;
    }
    config.validate()?;
    Ok(config)
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline = CommandLine::parse();
    let config = load_config(&commandline)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads())
        .thread_name("rankd-worker")
        .enable_all()
        .build()?;

    let _tracing_guard = setup_tracing(&commandline.log_dir, level(commandline.verbose))?;

    rt.block_on(async move {
        let rank = Rank::start(config).await?;
        info!(
            rank = rank.my_rank(),
            addr = %rank.listen_addr(),
            "rankd started"
        );

        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl-c: {}", e);
        }
        info!(stats = ?rank.stats(), "rankd stopping");
        rank.show_dir();
        rank.shutdown().await;
        Ok(())
    })
}
