use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use tgrab::app::App;
use tgrab::config::Config;
use tgrab::prompt::StdinPrompts;
use tgrab::session::SessionStore;
use tgrab::shutdown::ShutdownController;

#[derive(Parser, Debug)]
#[command(name = "tgrab", version, about = "Telegram chat media downloader (pure Rust, no TDLib)")]
struct Cli {
    /// Path to the YAML config file
    #[arg(short = 'c', long, default_value = "config.yaml")]
    config: PathBuf,

    /// Delete the saved session and exit
    #[arg(long)]
    clear_session: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config)
        .context("failed to load configuration (see config.yaml.example)")?;
    init_logging(&config.log.level);

    if cli.clear_session {
        let store = SessionStore::new(&config.session.dir);
        store.clear(&config.api.phone)?;
        println!("Session cleared; the next start will require a fresh login.");
        return Ok(());
    }

    log::info!("tgrab starting");
    let shutdown = ShutdownController::new();
    shutdown.listen_for_signals();

    let prompts = StdinPrompts;
    let app = App::new(config, shutdown, &prompts).await?;
    app.run(&prompts).await?;

    log::info!("done");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = match level {
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };
    env_logger::Builder::new()
        .filter_level(filter)
        .parse_default_env()
        .init();
}
