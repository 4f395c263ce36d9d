use dashmap::DashMap;
use serenity::model::id::{ChannelId, GuildId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::session::{PlayerState, Session, StateChange};
use super::voice::{EncoderOptions, VoiceConnector};
use super::PlayerError;
use crate::config::Config;
use crate::sources::Track;

/// Dueño de las sesiones de reproducción, una por guild.
///
/// El mapa de sesiones solo se bloquea para insertar, quitar o enumerar;
/// toda mutación de reproducción pasa por el lock propio de cada sesión.
pub struct SessionManager {
    sessions: DashMap<GuildId, Session>,
    connector: Arc<dyn VoiceConnector>,
    options: EncoderOptions,
    default_volume: f32,
    monitor_poll: Duration,
    connect_timeout: Duration,
}

impl SessionManager {
    pub fn new(config: &Config, connector: Arc<dyn VoiceConnector>) -> Self {
        Self {
            sessions: DashMap::new(),
            connector,
            options: EncoderOptions {
                bitrate: config.opus_bitrate,
                volume: config.default_volume,
                ..EncoderOptions::default()
            },
            default_volume: config.default_volume,
            monitor_poll: Duration::from_millis(config.monitor_poll_ms),
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }

    /// Conecta la sesión del guild a un canal de voz.
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> Result<(), PlayerError> {
        let joined = tokio::time::timeout(
            self.connect_timeout,
            self.connector.join(guild_id, channel_id),
        )
        .await;

        let connection = match joined {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => return Err(PlayerError::Connection(format!("{:#}", e))),
            Err(_) => {
                return Err(PlayerError::Connection(
                    "tiempo de espera agotado al conectar".to_string(),
                ))
            }
        };

        self.session(guild_id).connect(connection).await;
        Ok(())
    }

    /// Desconecta y destruye la sesión del guild.
    pub async fn leave(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        if let Some((_, session)) = self.sessions.remove(&guild_id) {
            session.shutdown().await;
        }
        self.connector
            .leave(guild_id)
            .await
            .map_err(|e| PlayerError::Connection(format!("{:#}", e)))
    }

    /// Reproduce un track ya resuelto a un locator local.
    pub async fn play(
        &self,
        guild_id: GuildId,
        track: Track,
        source: &str,
    ) -> Result<(), PlayerError> {
        self.session(guild_id)
            .play(track, source, self.options.clone())
            .await
    }

    pub async fn pause(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.session(guild_id).pause().await
    }

    pub async fn resume(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.session(guild_id).resume().await
    }

    pub async fn stop(&self, guild_id: GuildId) -> Result<(), PlayerError> {
        self.session(guild_id).stop().await
    }

    pub async fn set_volume(&self, guild_id: GuildId, volume: f32) -> Result<(), PlayerError> {
        self.session(guild_id).set_volume(volume).await
    }

    pub async fn is_connected(&self, guild_id: GuildId) -> bool {
        match self.existing(guild_id) {
            Some(session) => session.is_connected().await,
            None => false,
        }
    }

    pub async fn state(&self, guild_id: GuildId) -> PlayerState {
        match self.existing(guild_id) {
            Some(session) => session.state().await,
            None => PlayerState::Idle,
        }
    }

    pub async fn current_track(&self, guild_id: GuildId) -> Option<Track> {
        match self.existing(guild_id) {
            Some(session) => session.current_track().await,
            None => None,
        }
    }

    /// Suscripción a las transiciones de estado del guild.
    pub async fn subscribe(&self, guild_id: GuildId) -> mpsc::Receiver<StateChange> {
        self.session(guild_id).subscribe().await
    }

    /// Barrido de sesiones inactivas: desmonta y quita las que no están
    /// reproduciendo y llevan más de `threshold` sin actividad. Lo invoca
    /// un caller externo a intervalo fijo.
    pub async fn reap_idle(&self, threshold: Duration) -> usize {
        let candidates: Vec<(GuildId, Session)> = self
            .sessions
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();

        let mut reaped = 0;
        for (guild_id, session) in candidates {
            if session.state().await == PlayerState::Playing {
                continue;
            }
            if session.idle_for().await <= threshold {
                continue;
            }

            info!("💤 Liberando sesión inactiva de guild {}", guild_id);
            self.sessions.remove(&guild_id);
            session.shutdown().await;
            if let Err(e) = self.connector.leave(guild_id).await {
                warn!("Error liberando la conexión de {}: {:#}", guild_id, e);
            }
            reaped += 1;
        }
        reaped
    }

    #[allow(dead_code)]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    // La sesión se crea perezosamente en el primer acceso del guild
    fn session(&self, guild_id: GuildId) -> Session {
        self.sessions
            .entry(guild_id)
            .or_insert_with(|| Session::new(guild_id, self.default_volume, self.monitor_poll))
            .clone()
    }

    fn existing(&self, guild_id: GuildId) -> Option<Session> {
        self.sessions.get(&guild_id).map(|entry| entry.value().clone())
    }
}
