use clap::{Parser, Subcommand};
use flyoverhead_ingest::Config;
use flyoverhead_ingest::log_format::TargetFirstFormat;
use tracing_subscriber::prelude::*;

mod commands;

#[derive(Parser)]
#[command(name = "flyoverhead-ingest", version, about = "Aircraft telemetry ingestion and webhook fan-out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start source adapters, ingestion workers, webhook dispatcher, and the read/feeder API together.
    Run {
        #[arg(long, env = "WEB_INTERFACE", default_value = "0.0.0.0")]
        web_interface: String,
        #[arg(long, env = "WEB_PORT", default_value_t = 8080)]
        web_port: u16,
        #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
        metrics_port: u16,
    },
    /// Apply embedded Diesel migrations to DATABASE_URL.
    Migrate,
    /// Run the Prometheus/pprof metrics server standalone.
    ServeMetrics {
        #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
        metrics_port: u16,
    },
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(TargetFirstFormat)
        .with_ansi(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(sentry_tracing::layer())
        .init();
}

fn init_sentry() -> Option<sentry::ClientInitGuard> {
    std::env::var("SENTRY_DSN").ok().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                traces_sample_rate: 0.0,
                ..Default::default()
            },
        ))
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();
    let _sentry_guard = init_sentry();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { web_interface, web_port, metrics_port } => {
            let config = Config::from_env()?;
            commands::handle_run(config, web_interface, web_port, metrics_port).await
        }
        Commands::Migrate => commands::handle_migrate().await,
        Commands::ServeMetrics { metrics_port } => commands::handle_serve_metrics(metrics_port).await,
    }
}
