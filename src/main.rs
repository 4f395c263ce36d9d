use anyhow::Result;
use serenity::{model::gateway::GatewayIntents, Client};
use songbird::{SerenityInit, Songbird};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod audio;
mod bot;
mod buffer;
mod cache;
mod config;
mod notify;
mod sources;

use crate::audio::{SessionManager, SongbirdConnector};
use crate::bot::GrooveBot;
use crate::cache::CacheIndex;
use crate::config::Config;
use crate::sources::YtDlpFetcher;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing()?;

    if std::env::args().any(|arg| arg == "--health-check") {
        return health_check().await;
    }

    info!("🎵 Groove Bot v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(Config::load()?);

    // Composición explícita: el índice, el descargador y las sesiones se
    // construyen aquí y viajan como handles a quien los necesite
    let cache = CacheIndex::new(config.data_dir.clone())?;
    let fetcher = Arc::new(YtDlpFetcher::new(
        cache.clone(),
        config.cache_dir.clone(),
        Duration::from_secs(config.fetch_timeout_secs),
    ));
    if let Err(e) = fetcher.verify_dependencies().await {
        warn!("⚠️ {:#}; solo se podrán reproducir archivos locales", e);
    }

    let songbird = Songbird::serenity();
    let connector = Arc::new(SongbirdConnector::new(Arc::clone(&songbird)));
    let sessions = Arc::new(SessionManager::new(&config, connector));

    let handler = GrooveBot::new(
        Arc::clone(&config),
        cache,
        fetcher,
        Arc::clone(&sessions),
    );

    let intents = GatewayIntents::GUILDS
        | GatewayIntents::GUILD_VOICE_STATES
        | GatewayIntents::GUILD_MESSAGES
        | GatewayIntents::MESSAGE_CONTENT;

    let mut client = Client::builder(&config.discord_token, intents)
        .event_handler(handler)
        .register_songbird_with(songbird)
        .await?;

    // Ctrl+C apaga los shards con gracia en vez de matar el proceso
    let shard_manager = client.shard_manager.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("⚠️ Señal de apagado recibida, cerrando shards...");
            shard_manager.shutdown_all().await;
        }
    });

    info!("🚀 Bot listo");
    if let Err(why) = client.start().await {
        error!("Error al ejecutar cliente: {:?}", why);
    }

    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("groove_bot=debug".parse()?)
                .add_directive("serenity=info".parse()?)
                .add_directive("songbird=info".parse()?),
        )
        .init();
    Ok(())
}

/// Sonda para orquestadores (Docker, systemd): sale con 0 solo si las
/// herramientas externas de descarga y transcodificación responden.
async fn health_check() -> Result<()> {
    for (tool, flag) in [("yt-dlp", "--version"), ("ffmpeg", "-version")] {
        let probe = async_process::Command::new(tool).arg(flag).output().await;
        match probe {
            Ok(output) if output.status.success() => {}
            _ => {
                println!("FAIL {}", tool);
                anyhow::bail!("{} no disponible", tool);
            }
        }
    }
    println!("OK");
    Ok(())
}
