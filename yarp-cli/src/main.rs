//! Process entrypoint for the yarp reverse proxy.
//!
//! Loads the TOML configuration, starts every configured listener plus the
//! stats rate sampler, then either serves the dashboard or parks on the
//! listener set. Startup failures (unreadable config, bind errors) exit
//! non-zero; everything after startup is handled inside the listeners.

use std::path::PathBuf;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use tokio::task::JoinSet;

use yarp_core::api::{self, DashboardAuth};
use yarp_core::config;
use yarp_core::service::stats::StatsRegistry;
use yarp_core::system::listeners;

const LOG_FILE: &str = "./yarp.log";

#[derive(Parser, Debug)]
#[command(name = "yarp", version, about = "Multi-protocol reverse proxy")]
struct Cli {
    /// Config file
    #[arg(short = 'c', value_name = "PATH", default_value = "./yarp.toml")]
    config: PathBuf,
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(LOG_FILE)
    {
        Ok(file) => {
            builder.target(env_logger::Target::Pipe(Box::new(file)));
        }
        Err(e) => eprintln!("couldn't open {}, logging to stderr: {}", LOG_FILE, e),
    }
    builder.init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging();

    let config = config::load(&cli.config)
        .with_context(|| format!("couldn't load config {}", cli.config.display()))?;

    let stats = StatsRegistry::new();
    stats.start_rate_sampler();

    let mut tasks = JoinSet::new();
    listeners::spawn_all(&config, &stats, &mut tasks)
        .await
        .context("failed to start listeners")?;

    if tasks.is_empty() && config.dashboard.is_none() {
        anyhow::bail!("nothing to do: no listeners or dashboard configured");
    }

    match &config.dashboard {
        Some(dashboard) => {
            let auth = DashboardAuth::new(&dashboard.http_user, &dashboard.http_password);
            let registry = Arc::clone(&stats);
            log::info!("dashboard running at http://{}", dashboard.bind_addr);
            HttpServer::new(move || {
                App::new()
                    .app_data(web::Data::new(Arc::clone(&registry)))
                    .app_data(web::Data::new(auth.clone()))
                    .configure(api::configure)
            })
            .bind(&dashboard.bind_addr)
            .with_context(|| format!("failed to bind dashboard {}", dashboard.bind_addr))?
            .workers(2)
            .run()
            .await?;
        }
        None => {
            // The accept loops never return; park on them.
            while tasks.join_next().await.is_some() {}
        }
    }

    Ok(())
}
