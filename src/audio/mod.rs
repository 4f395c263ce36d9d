//! Sesiones de reproducción por guild: máquina de estados sobre un
//! handle opaco de encode/stream y la conexión de voz.

pub mod manager;
pub mod session;
pub mod voice;

pub use manager::SessionManager;
pub use session::{PlayerState, Session, StateChange};
pub use voice::{
    EncodeHandle, EncoderOptions, SongbirdConnector, VoiceConnection, VoiceConnector,
};

use thiserror::Error;

/// Fallos del ciclo de reproducción, tipados para que la capa de
/// comandos pueda distinguirlos.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("operación inválida en estado {0:?}")]
    InvalidState(PlayerState),
    #[error("no hay conexión de voz activa")]
    NotConnected,
    #[error("fallo del encoder: {0}")]
    Encode(String),
    #[error("fallo de conexión de voz: {0}")]
    Connection(String),
    #[error("volumen fuera de rango (0.0 a 2.0): {0}")]
    InvalidVolume(f32),
}
