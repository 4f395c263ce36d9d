pub mod queue;

use anyhow::{anyhow, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Message, Ready},
    async_trait,
    http::Http,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::audio::{PlayerState, SessionManager};
use crate::buffer::BufferManager;
use crate::cache::CacheIndex;
use crate::config::Config;
use crate::notify::ChannelNotifier;
use crate::sources::{Track, TrackFetcher, YtDlpFetcher};

use queue::GuildQueue;

/// Estado de reproducción de un guild: su cola y su buffer de pre-descarga
struct GuildPlayback {
    queue: Mutex<GuildQueue>,
    buffer: BufferManager,
    /// El task de auto-avance se lanza una sola vez por guild
    autoplay_started: AtomicBool,
}

/// Handler principal del bot: comandos con prefijo sobre el motor de
/// reproducción (sesiones, buffer y caché).
pub struct GrooveBot {
    config: Arc<Config>,
    cache: CacheIndex,
    fetcher: Arc<YtDlpFetcher>,
    sessions: Arc<SessionManager>,
    guilds: DashMap<GuildId, Arc<GuildPlayback>>,
}

impl GrooveBot {
    pub fn new(
        config: Arc<Config>,
        cache: CacheIndex,
        fetcher: Arc<YtDlpFetcher>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            config,
            cache,
            fetcher,
            sessions,
            guilds: DashMap::new(),
        }
    }

    fn playback(&self, guild_id: GuildId) -> Arc<GuildPlayback> {
        self.guilds
            .entry(guild_id)
            .or_insert_with(|| {
                let buffer = BufferManager::new(
                    &self.config,
                    self.cache.clone(),
                    Arc::clone(&self.fetcher) as Arc<dyn TrackFetcher>,
                );
                Arc::new(GuildPlayback {
                    queue: Mutex::new(GuildQueue::new(self.config.max_queue_size)),
                    buffer,
                    autoplay_started: AtomicBool::new(false),
                })
            })
            .clone()
    }

    async fn cmd_join(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        let channel_id = author_voice_channel(ctx, msg)?;
        self.sessions.join(guild_id, channel_id).await?;
        let _ = msg.channel_id.say(&ctx.http, "🔊 Conectado al canal de voz").await;
        Ok(())
    }

    async fn cmd_leave(&self, guild_id: GuildId) -> Result<()> {
        if let Some((_, playback)) = self.guilds.remove(&guild_id) {
            playback.queue.lock().clear();
            playback.buffer.stop();
        }
        self.sessions.leave(guild_id).await?;
        Ok(())
    }

    async fn cmd_play(&self, ctx: &Context, msg: &Message, guild_id: GuildId, args: &str) -> Result<()> {
        if args.is_empty() {
            anyhow::bail!("uso: {}play <url o búsqueda>", self.config.command_prefix);
        }

        if !self.sessions.is_connected(guild_id).await {
            let channel_id = author_voice_channel(ctx, msg)?;
            self.sessions.join(guild_id, channel_id).await?;
        }

        let track = self.fetcher.probe(args).await?;
        let playback = self.playback(guild_id);
        playback.buffer.start();
        self.ensure_autoplay(ctx, msg.channel_id, guild_id, &playback).await;

        let position = {
            let mut queue = playback.queue.lock();
            queue.push(track.clone())?
        };
        sync_buffer(&playback);

        let should_start = {
            let queue = playback.queue.lock();
            queue.current_index().is_none()
        } && !matches!(
            self.sessions.state(guild_id).await,
            PlayerState::Playing | PlayerState::Paused
        );

        if should_start {
            let items = playback.queue.lock().items().to_vec();
            let notifier = ChannelNotifier::new(ctx.http.clone(), msg.channel_id);
            playback.buffer.pre_download_initial(&items, &notifier).await;

            play_next(
                &self.sessions,
                &self.cache,
                &self.fetcher,
                &ctx.http,
                msg.channel_id,
                guild_id,
                &playback,
            )
            .await?;
        } else {
            let _ = msg
                .channel_id
                .say(
                    &ctx.http,
                    format!("➕ En cola (#{}): {}", position + 1, format_track(&track)),
                )
                .await;
        }
        Ok(())
    }

    async fn cmd_skip(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        self.sessions.stop(guild_id).await?;
        let playback = self.playback(guild_id);
        play_next(
            &self.sessions,
            &self.cache,
            &self.fetcher,
            &ctx.http,
            msg.channel_id,
            guild_id,
            &playback,
        )
        .await
    }

    async fn cmd_stop(&self, guild_id: GuildId) -> Result<()> {
        if let Some(playback) = self.guilds.get(&guild_id).map(|p| Arc::clone(&p)) {
            playback.queue.lock().clear();
            playback.buffer.stop();
        }
        self.sessions.stop(guild_id).await?;
        Ok(())
    }

    async fn cmd_volume(&self, ctx: &Context, msg: &Message, guild_id: GuildId, args: &str) -> Result<()> {
        let volume: f32 = args
            .parse()
            .map_err(|_| anyhow!("uso: {}volume <0.0 a 2.0>", self.config.command_prefix))?;
        self.sessions.set_volume(guild_id, volume).await?;
        let _ = msg
            .channel_id
            .say(&ctx.http, format!("🔊 Volumen: {}%", (volume * 100.0) as u32))
            .await;
        Ok(())
    }

    async fn cmd_queue(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        let playback = self.playback(guild_id);
        let (current, upcoming) = {
            let queue = playback.queue.lock();
            (queue.current().cloned(), queue.upcoming().to_vec())
        };

        let mut lines = Vec::new();
        if let Some(track) = current {
            lines.push(format!("▶️ {}", format_track(&track)));
        }
        for (i, track) in upcoming.iter().take(10).enumerate() {
            lines.push(format!("{}. {}", i + 1, format_track(track)));
        }
        if upcoming.len() > 10 {
            lines.push(format!("... y {} más", upcoming.len() - 10));
        }

        let body = if lines.is_empty() {
            "📭 La cola está vacía".to_string()
        } else {
            lines.join("\n")
        };
        let _ = msg.channel_id.say(&ctx.http, body).await;
        Ok(())
    }

    async fn cmd_nowplaying(&self, ctx: &Context, msg: &Message, guild_id: GuildId) -> Result<()> {
        let body = match self.sessions.current_track(guild_id).await {
            Some(track) => format!("🎵 Sonando: {}", format_track(&track)),
            None => "📭 No suena nada ahora mismo".to_string(),
        };
        let _ = msg.channel_id.say(&ctx.http, body).await;
        Ok(())
    }

    async fn cmd_stats(&self, ctx: &Context, msg: &Message) -> Result<()> {
        let stats = self.cache.stats();
        let oldest = stats
            .oldest_download
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        let body = format!(
            "📊 Caché: {} tracks, {:.1} MB, uso máximo {}, descargando desde {}",
            stats.count,
            stats.total_bytes as f64 / (1024.0 * 1024.0),
            stats.max_use_count,
            oldest
        );
        let _ = msg.channel_id.say(&ctx.http, body).await;
        Ok(())
    }

    // Lanza (una vez por guild) el task que encadena la cola cuando una
    // reproducción termina sola.
    async fn ensure_autoplay(
        &self,
        ctx: &Context,
        text_channel: ChannelId,
        guild_id: GuildId,
        playback: &Arc<GuildPlayback>,
    ) {
        if playback.autoplay_started.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut rx = self.sessions.subscribe(guild_id).await;
        let sessions = Arc::clone(&self.sessions);
        let cache = self.cache.clone();
        let fetcher = Arc::clone(&self.fetcher);
        let playback = Arc::clone(playback);
        let http = ctx.http.clone();

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                debug!(
                    "Guild {}: {:?} -> {:?} a las {}",
                    guild_id, event.old, event.new, event.at
                );
                // Solo el fin natural de una reproducción encadena la cola
                if event.new != PlayerState::Idle {
                    continue;
                }
                if let Err(e) = play_next(
                    &sessions,
                    &cache,
                    &fetcher,
                    &http,
                    text_channel,
                    guild_id,
                    &playback,
                )
                .await
                {
                    error!("Error encadenando la cola de {}: {:#}", guild_id, e);
                }
            }
        });
    }
}

#[async_trait]
impl EventHandler for GrooveBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 Conectado como {}", ready.user.name);

        // Barrido periódico de sesiones inactivas
        let sessions = Arc::clone(&self.sessions);
        let threshold = Duration::from_secs(self.config.idle_timeout_secs);
        let sweep = Duration::from_secs(self.config.idle_sweep_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep);
            loop {
                ticker.tick().await;
                let reaped = sessions.reap_idle(threshold).await;
                if reaped > 0 {
                    info!("💤 {} sesiones inactivas liberadas", reaped);
                }
            }
        });
    }

    async fn message(&self, ctx: Context, msg: Message) {
        if msg.author.bot {
            return;
        }
        let Some(content) = msg.content.strip_prefix(&self.config.command_prefix) else {
            return;
        };
        let Some(guild_id) = msg.guild_id else {
            return;
        };

        let mut parts = content.trim().splitn(2, char::is_whitespace);
        let command = parts.next().unwrap_or("").to_lowercase();
        let args = parts.next().unwrap_or("").trim().to_string();

        let result = match command.as_str() {
            "join" => self.cmd_join(&ctx, &msg, guild_id).await,
            "leave" => self.cmd_leave(guild_id).await,
            "play" | "p" => self.cmd_play(&ctx, &msg, guild_id, &args).await,
            "pause" => self.sessions.pause(guild_id).await.map_err(Into::into),
            "resume" => self.sessions.resume(guild_id).await.map_err(Into::into),
            "skip" => self.cmd_skip(&ctx, &msg, guild_id).await,
            "stop" => self.cmd_stop(guild_id).await,
            "volume" | "vol" => self.cmd_volume(&ctx, &msg, guild_id, &args).await,
            "queue" | "q" => self.cmd_queue(&ctx, &msg, guild_id).await,
            "nowplaying" | "np" => self.cmd_nowplaying(&ctx, &msg, guild_id).await,
            "stats" => self.cmd_stats(&ctx, &msg).await,
            _ => return,
        };

        if let Err(e) = result {
            let _ = msg.channel_id.say(&ctx.http, format!("❌ {:#}", e)).await;
        }
    }
}

/// Canal de voz donde está el autor del mensaje.
fn author_voice_channel(ctx: &Context, msg: &Message) -> Result<ChannelId> {
    let channel_id = {
        let guild = msg
            .guild(&ctx.cache)
            .ok_or_else(|| anyhow!("guild no disponible en la caché"))?;
        guild
            .voice_states
            .get(&msg.author.id)
            .and_then(|vs| vs.channel_id)
    };
    channel_id.ok_or_else(|| anyhow!("entra a un canal de voz primero"))
}

// Reempuja la ventana del buffer tras cada mutación de la cola.
fn sync_buffer(playback: &GuildPlayback) {
    let queue = playback.queue.lock();
    playback.buffer.update_queue(queue.items(), queue.current_index());
}

/// Avanza la cola y reproduce el siguiente track disponible, saltando
/// los que no se puedan resolver a un archivo local.
async fn play_next(
    sessions: &SessionManager,
    cache: &CacheIndex,
    fetcher: &YtDlpFetcher,
    http: &Arc<Http>,
    text_channel: ChannelId,
    guild_id: GuildId,
    playback: &GuildPlayback,
) -> Result<()> {
    loop {
        let next = playback.queue.lock().advance();
        sync_buffer(playback);

        let Some(track) = next else {
            let _ = text_channel.say(http, "📭 Cola terminada").await;
            return Ok(());
        };

        match resolve_source(cache, fetcher, &track).await {
            Some(source) => match sessions.play(guild_id, track.clone(), &source).await {
                Ok(()) => {
                    let _ = text_channel
                        .say(http, format!("🎵 Reproduciendo: {}", format_track(&track)))
                        .await;
                    return Ok(());
                }
                Err(e) => {
                    let _ = text_channel
                        .say(http, format!("❌ No se pudo reproducir {}: {}", track.title, e))
                        .await;
                }
            },
            None => {
                let _ = text_channel
                    .say(http, format!("❌ No se pudo descargar: {}", track.title))
                    .await;
            }
        }
    }
}

// El buffer debería tener el archivo listo; si no, un intento directo.
async fn resolve_source(
    cache: &CacheIndex,
    fetcher: &YtDlpFetcher,
    track: &Track,
) -> Option<String> {
    if track.is_local_file() {
        let path = track.url.strip_prefix("file://").unwrap_or(&track.url);
        return Some(path.to_string());
    }

    if let Some(entry) = cache.get(&track.id) {
        if entry.file_path.exists() {
            return Some(entry.file_path.to_string_lossy().into_owned());
        }
    }

    match fetcher.fetch(track).await {
        Ok(true) => cache
            .get(&track.id)
            .map(|entry| entry.file_path.to_string_lossy().into_owned()),
        _ => None,
    }
}

fn format_track(track: &Track) -> String {
    let mut text = track.title.clone();
    if let Some(artist) = &track.artist {
        text.push_str(&format!(" — {}", artist));
    }
    if let Some(duration) = track.duration {
        text.push_str(&format!(" ({})", humantime::format_duration(duration)));
    }
    text
}
