use chrono::{DateTime, Utc};
use serenity::model::id::GuildId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use super::voice::{EncodeHandle, EncoderOptions, VoiceConnection};
use super::PlayerError;
use crate::sources::Track;

/// Capacidad del canal de cada suscriptor; un canal lleno descarta
/// eventos en vez de bloquear la sesión
const SUBSCRIBER_BUFFER: usize = 16;

/// Estados del ciclo de reproducción de una sesión
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Error,
}

/// Evento emitido en cada transición de estado
#[derive(Debug, Clone)]
pub struct StateChange {
    pub old: PlayerState,
    pub new: PlayerState,
    pub track: Option<Track>,
    pub at: DateTime<Utc>,
}

struct SessionState {
    state: PlayerState,
    /// Track sonando ahora; `None` significa explícitamente "nada"
    current: Option<Track>,
    volume: f32,
    paused: bool,
    speaking: bool,
    last_activity: Instant,
    connection: Option<Arc<dyn VoiceConnection>>,
    stream: Option<Box<dyn EncodeHandle>>,
    subscribers: Vec<mpsc::Sender<StateChange>>,
    /// Se incrementa cada vez que el stream se crea o destruye, para que
    /// un monitor viejo no actúe sobre un stream que ya no es el suyo
    generation: u64,
}

struct SessionShared {
    guild_id: GuildId,
    monitor_poll: Duration,
    state: RwLock<SessionState>,
}

/// Sesión de reproducción de un guild.
///
/// Cada sesión tiene su propio lock: los guilds nunca compiten entre sí.
/// El handle se clona barato; todos los clones ven la misma sesión.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub fn new(guild_id: GuildId, default_volume: f32, monitor_poll: Duration) -> Self {
        Self {
            shared: Arc::new(SessionShared {
                guild_id,
                monitor_poll,
                state: RwLock::new(SessionState {
                    state: PlayerState::Idle,
                    current: None,
                    volume: default_volume,
                    paused: false,
                    speaking: false,
                    last_activity: Instant::now(),
                    connection: None,
                    stream: None,
                    subscribers: Vec::new(),
                    generation: 0,
                }),
            }),
        }
    }

    /// Asocia una conexión de voz viva a la sesión.
    pub async fn connect(&self, connection: Arc<dyn VoiceConnection>) {
        let mut state = self.shared.state.write().await;
        state.connection = Some(connection);
        state.last_activity = Instant::now();
    }

    pub async fn is_connected(&self) -> bool {
        self.shared.state.read().await.connection.is_some()
    }

    /// Arranca la reproducción de un track ya resuelto a un locator local.
    ///
    /// Derriba cualquier stream anterior antes de crear el nuevo. Si el
    /// encoder falla, la sesión queda en `Error` y el fallo se devuelve
    /// al caller para que decida reintentar.
    pub async fn play(
        &self,
        track: Track,
        source: &str,
        options: EncoderOptions,
    ) -> Result<(), PlayerError> {
        let mut state = self.shared.state.write().await;

        let connection = match &state.connection {
            Some(connection) => Arc::clone(connection),
            None => return Err(PlayerError::NotConnected),
        };

        // Limpieza idempotente del stream anterior
        if let Some(old) = state.stream.take() {
            old.cleanup().await;
        }
        state.generation += 1;

        let mut options = options;
        options.volume = state.volume;

        match connection.start_stream(source, &options).await {
            Ok(stream) => {
                state.stream = Some(stream);
                state.current = Some(track);
                state.paused = false;
                state.speaking = true;
                self.transition(&mut state, PlayerState::Playing);

                let generation = state.generation;
                drop(state);

                let session = self.clone();
                tokio::spawn(async move {
                    session.monitor(generation).await;
                });
                Ok(())
            }
            Err(e) => {
                state.current = None;
                state.speaking = false;
                self.transition(&mut state, PlayerState::Error);
                Err(PlayerError::Encode(format!("{:#}", e)))
            }
        }
    }

    /// Pausa la emisión sin destruir el stream. Solo legal desde `Playing`.
    pub async fn pause(&self) -> Result<(), PlayerError> {
        let mut state = self.shared.state.write().await;
        if state.state != PlayerState::Playing {
            return Err(PlayerError::InvalidState(state.state));
        }
        if let Some(stream) = &state.stream {
            let _ = stream.pause();
        }
        state.paused = true;
        state.speaking = false;
        self.transition(&mut state, PlayerState::Paused);
        Ok(())
    }

    /// Reanuda la emisión. Solo legal desde `Paused`.
    pub async fn resume(&self) -> Result<(), PlayerError> {
        let mut state = self.shared.state.write().await;
        if state.state != PlayerState::Paused {
            return Err(PlayerError::InvalidState(state.state));
        }
        if let Some(stream) = &state.stream {
            let _ = stream.resume();
        }
        state.paused = false;
        state.speaking = true;
        self.transition(&mut state, PlayerState::Playing);
        Ok(())
    }

    /// Detiene la reproducción y libera el stream. Legal desde cualquier
    /// estado e idempotente.
    pub async fn stop(&self) -> Result<(), PlayerError> {
        let mut state = self.shared.state.write().await;
        if let Some(stream) = state.stream.take() {
            stream.cleanup().await;
        }
        state.current = None;
        state.paused = false;
        state.speaking = false;
        state.generation += 1;
        self.transition(&mut state, PlayerState::Stopped);
        Ok(())
    }

    /// Ajusta el volumen de la sesión y del stream en vivo si lo hay.
    /// Legal en cualquier estado.
    pub async fn set_volume(&self, volume: f32) -> Result<(), PlayerError> {
        if !(0.0..=2.0).contains(&volume) {
            return Err(PlayerError::InvalidVolume(volume));
        }
        let mut state = self.shared.state.write().await;
        state.volume = volume;
        state.last_activity = Instant::now();
        if let Some(stream) = &state.stream {
            let _ = stream.set_volume(volume);
        }
        Ok(())
    }

    pub async fn state(&self) -> PlayerState {
        self.shared.state.read().await.state
    }

    pub async fn current_track(&self) -> Option<Track> {
        self.shared.state.read().await.current.clone()
    }

    #[allow(dead_code)]
    pub async fn volume(&self) -> f32 {
        self.shared.state.read().await.volume
    }

    /// Si la sesión está emitiendo hacia el canal ahora mismo.
    #[allow(dead_code)]
    pub async fn is_speaking(&self) -> bool {
        self.shared.state.read().await.speaking
    }

    pub async fn idle_for(&self) -> Duration {
        self.shared.state.read().await.last_activity.elapsed()
    }

    /// Registra un suscriptor de transiciones de estado. La entrega es de
    /// mejor esfuerzo: un canal lleno pierde el evento.
    pub async fn subscribe(&self) -> mpsc::Receiver<StateChange> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.shared.state.write().await.subscribers.push(tx);
        rx
    }

    /// Desmonta la sesión entera: stream, conexión y estado.
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.write().await;
        if let Some(stream) = state.stream.take() {
            stream.cleanup().await;
        }
        if let Some(connection) = state.connection.take() {
            if let Err(e) = connection.disconnect().await {
                warn!("Error desconectando guild {}: {:#}", self.shared.guild_id, e);
            }
        }
        state.current = None;
        state.paused = false;
        state.speaking = false;
        state.generation += 1;
        self.transition(&mut state, PlayerState::Stopped);
    }

    // Observa la vida del stream y devuelve la sesión a `Idle` cuando la
    // reproducción termina sola. En pausa no se comprueba nada.
    async fn monitor(&self, generation: u64) {
        loop {
            tokio::time::sleep(self.shared.monitor_poll).await;

            {
                let state = self.shared.state.read().await;
                if state.generation != generation {
                    return;
                }
                if state.paused {
                    continue;
                }
                if let Some(stream) = &state.stream {
                    if stream.is_running().await {
                        continue;
                    }
                }
            }

            let mut state = self.shared.state.write().await;
            // Re-verificar: alguien pudo reemplazar el stream entre locks
            if state.generation != generation {
                return;
            }
            if state.paused {
                continue;
            }

            debug!("🏁 Reproducción terminada en guild {}", self.shared.guild_id);
            if let Some(stream) = state.stream.take() {
                stream.cleanup().await;
            }
            state.current = None;
            state.speaking = false;
            state.generation += 1;
            self.transition(&mut state, PlayerState::Idle);
            return;
        }
    }

    // Aplica la transición, marca actividad y avisa a los suscriptores.
    fn transition(&self, state: &mut SessionState, new: PlayerState) {
        let old = state.state;
        state.state = new;
        state.last_activity = Instant::now();

        let event = StateChange {
            old,
            new,
            track: state.current.clone(),
            at: Utc::now(),
        };

        state.subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Suscriptor lleno en guild {}, evento {:?} descartado",
                    self.shared.guild_id, new
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        debug!("🎚️ Guild {}: {:?} -> {:?}", self.shared.guild_id, old, new);
    }
}
