use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use iptv_relay::client::Client;
use iptv_relay::config::Settings;
use iptv_relay::output::{self, CatchupFormat, PlaylistOptions};
use iptv_relay::scheduler::{Pipeline, Scheduler};
use iptv_relay::store::Store;
use iptv_relay::create_app;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve playlists and programme guides over HTTP, refreshing periodically
    Serve {
        /// Listen port (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
        /// udpxy base URL for multicast channels, e.g. http://192.168.1.1:4022
        #[arg(short, long)]
        udpxy: Option<String>,
        /// Refresh interval in minutes (overrides config)
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// Fetch the channel list once and write a playlist file
    Channel {
        #[arg(short, long, value_enum, default_value_t = Format::M3u)]
        format: Format,
        /// udpxy base URL for multicast channels
        #[arg(short, long)]
        udpxy: Option<String>,
        /// Prefer multicast URLs when a channel has several
        #[arg(short, long)]
        multicast_first: bool,
        /// Catch-up placeholder syntax
        #[arg(long, value_enum, default_value_t = CatchupArg::Diyp)]
        catchup: CatchupArg,
        /// Output file, defaults to iptv.<format>
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum Format {
    M3u,
    Txt,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CatchupArg {
    Diyp,
    Kodi,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    info!("Configuration loaded from {}: server_host={}", args.config, settings.iptv.server_host);

    match args.command {
        Command::Serve { port, udpxy, interval } => {
            if let Some(port) = port {
                settings.server.port = port;
            }
            if udpxy.is_some() {
                settings.server.udpxy_url = udpxy;
            }
            if let Some(interval) = interval {
                settings.server.interval_minutes = interval;
            }
            settings.validate()?;
            serve(settings).await
        }
        Command::Channel {
            format,
            udpxy,
            multicast_first,
            catchup,
            output,
        } => {
            let opts = PlaylistOptions {
                relay: udpxy.or(settings.server.udpxy_url.clone()),
                multicast_first,
                catchup: match catchup {
                    CatchupArg::Diyp => CatchupFormat::Diyp,
                    CatchupArg::Kodi => CatchupFormat::Kodi,
                },
                logo_base_url: settings.server.logo_base_url.clone(),
            };
            write_playlist(settings, format, opts, output.as_deref()).await
        }
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let tz = settings.server.timezone()?;
    let cancel = CancellationToken::new();
    let client = Client::new(settings.iptv.clone(), settings.rules.compile(), tz)?.with_cancellation(cancel.clone());
    let store = Arc::new(Store::new());

    let mut pipeline = Pipeline::new(client, Arc::clone(&store));
    if let Err(e) = pipeline.refresh().await {
        error!("Initial refresh incomplete: err={}", e);
    }

    let interval = Duration::from_secs(settings.server.interval_minutes * 60);
    let scheduler = tokio::spawn(Scheduler::new(pipeline, interval, cancel.clone()).run());

    let app = create_app(Arc::clone(&store), settings.server.clone(), tz);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    if let Err(e) = scheduler.await {
        error!("Scheduler task failed: err={}", e);
    }
    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown requested"),
        Err(e) => {
            error!("Failed to listen for shutdown signal: err={}", e);
            std::future::pending::<()>().await;
        }
    }
    cancel.cancel();
}

async fn write_playlist(settings: Settings, format: Format, opts: PlaylistOptions, path: Option<&str>) -> anyhow::Result<()> {
    let tz = settings.server.timezone()?;
    let mut client = Client::new(settings.iptv, settings.rules.compile(), tz)?;
    let token = client.request_token().await?;
    let channels = client.fetch_channels(&token).await?;
    if channels.is_empty() {
        anyhow::bail!("no channels found");
    }

    let (content, default_name) = match format {
        Format::M3u => (output::to_m3u(&channels, &opts), "iptv.m3u"),
        Format::Txt => (output::to_txt(&channels, &opts), "iptv.txt"),
    };
    let path = path.unwrap_or(default_name);
    tokio::fs::write(path, content)
        .await
        .with_context(|| format!("failed to write {path}"))?;
    info!("Wrote {} channels to {}", channels.len(), path);
    Ok(())
}
