use anyhow::Result;
use async_trait::async_trait;
use serenity::model::id::{ChannelId, GuildId};
use songbird::driver::Bitrate;
use songbird::tracks::{PlayMode, TrackHandle};
use songbird::{Call, Songbird};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};

/// Opciones del encoder aplicadas al crear un stream. No todas las
/// implementaciones respetan todas las opciones; el driver de Songbird
/// solo expone bitrate y volumen.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Bits por segundo del stream Opus
    pub bitrate: u32,
    pub volume: f32,
    /// Frecuencia de muestreo en Hz
    pub frame_rate: u32,
    /// Duración de cada frame en ms
    pub frame_duration: u32,
    pub compression_level: u8,
    /// Tolerancia esperada de pérdida de paquetes, en porcentaje
    pub packet_loss: u8,
    pub buffered_frames: usize,
    /// Bitrate variable
    pub vbr: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            bitrate: 96_000,
            volume: 0.5,
            frame_rate: 48_000,
            frame_duration: 20,
            compression_level: 10,
            packet_loss: 1,
            buffered_frames: 100,
            vbr: true,
        }
    }
}

/// Handle opaco de encode/stream sobre la conexión de voz.
#[async_trait]
pub trait EncodeHandle: Send + Sync {
    /// Verifica si el stream sigue vivo (reproduciéndose o en pausa).
    async fn is_running(&self) -> bool;
    /// Ajusta el volumen del stream en vivo.
    fn set_volume(&self, volume: f32) -> Result<()>;
    /// Deja de emitir sin destruir el stream.
    fn pause(&self) -> Result<()>;
    fn resume(&self) -> Result<()>;
    /// Detiene y libera los recursos del stream (idempotente).
    async fn cleanup(&self);
}

/// Conexión de voz viva de un guild.
#[async_trait]
pub trait VoiceConnection: Send + Sync {
    /// Crea un handle de encode/stream para el locator dado.
    async fn start_stream(
        &self,
        source: &str,
        options: &EncoderOptions,
    ) -> Result<Box<dyn EncodeHandle>>;
    /// Corta la conexión a nivel del driver de voz.
    async fn disconnect(&self) -> Result<()>;
}

/// Colaborador que establece conexiones de voz por guild.
#[async_trait]
pub trait VoiceConnector: Send + Sync {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>>;
    /// Libera la conexión del guild a nivel de gateway.
    async fn leave(&self, guild_id: GuildId) -> Result<()>;
}

/// Implementación de producción sobre Songbird.
pub struct SongbirdConnector {
    manager: Arc<Songbird>,
}

impl SongbirdConnector {
    pub fn new(manager: Arc<Songbird>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl VoiceConnector for SongbirdConnector {
    async fn join(
        &self,
        guild_id: GuildId,
        channel_id: ChannelId,
    ) -> Result<Arc<dyn VoiceConnection>> {
        match self.manager.join(guild_id, channel_id).await {
            Ok(call) => {
                info!("🔊 Conectado al canal de voz en guild {}", guild_id);
                Ok(Arc::new(SongbirdConnection { call }))
            }
            Err(e) => {
                error!("Error al conectar al canal de voz: {:?}", e);
                Err(anyhow::anyhow!("no se pudo conectar al canal de voz"))
            }
        }
    }

    async fn leave(&self, guild_id: GuildId) -> Result<()> {
        self.manager
            .remove(guild_id)
            .await
            .map_err(|e| anyhow::anyhow!("no se pudo liberar la conexión: {:?}", e))
    }
}

struct SongbirdConnection {
    call: Arc<Mutex<Call>>,
}

#[async_trait]
impl VoiceConnection for SongbirdConnection {
    async fn start_stream(
        &self,
        source: &str,
        options: &EncoderOptions,
    ) -> Result<Box<dyn EncodeHandle>> {
        let input = songbird::input::File::new(PathBuf::from(source));

        let mut call = self.call.lock().await;
        call.set_bitrate(Bitrate::BitsPerSecond(options.bitrate as i32));
        let handle = call.play_input(input.into());
        let _ = handle.set_volume(options.volume);

        Ok(Box::new(SongbirdStream { handle }))
    }

    async fn disconnect(&self) -> Result<()> {
        let mut call = self.call.lock().await;
        call.leave()
            .await
            .map_err(|e| anyhow::anyhow!("no se pudo desconectar: {:?}", e))
    }
}

struct SongbirdStream {
    handle: TrackHandle,
}

#[async_trait]
impl EncodeHandle for SongbirdStream {
    async fn is_running(&self) -> bool {
        match self.handle.get_info().await {
            Ok(state) => matches!(state.playing, PlayMode::Play | PlayMode::Pause),
            Err(_) => false,
        }
    }

    fn set_volume(&self, volume: f32) -> Result<()> {
        self.handle
            .set_volume(volume)
            .map_err(|e| anyhow::anyhow!("no se pudo ajustar el volumen: {:?}", e))
    }

    fn pause(&self) -> Result<()> {
        self.handle
            .pause()
            .map_err(|e| anyhow::anyhow!("no se pudo pausar: {:?}", e))
    }

    fn resume(&self) -> Result<()> {
        self.handle
            .play()
            .map_err(|e| anyhow::anyhow!("no se pudo reanudar: {:?}", e))
    }

    async fn cleanup(&self) {
        let _ = self.handle.stop();
    }
}
