use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    // Discord
    pub discord_token: String,
    pub command_prefix: String,

    // Buffer de pre-descarga
    pub max_buffer: usize,
    pub fetch_concurrency: usize,
    pub max_fetch_attempts: u32,
    pub fetch_backoff_mins: u64,
    pub buffer_poll_ms: u64,

    // Reproducción
    pub default_volume: f32,
    pub opus_bitrate: u32,
    pub monitor_poll_ms: u64,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub idle_sweep_secs: u64,

    // Paths
    pub data_dir: PathBuf,
    pub cache_dir: PathBuf,

    // Límites
    pub fetch_timeout_secs: u64,
    pub max_queue_size: usize,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            // Discord
            discord_token: std::env::var("DISCORD_TOKEN")?,
            command_prefix: std::env::var("COMMAND_PREFIX")
                .unwrap_or_else(|_| "!".to_string()),

            // Buffer
            max_buffer: std::env::var("BUFFER_WINDOW")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            fetch_concurrency: std::env::var("FETCH_CONCURRENCY")
                .unwrap_or_else(|_| "4".to_string())
                .parse()?,
            max_fetch_attempts: std::env::var("MAX_FETCH_ATTEMPTS")
                .unwrap_or_else(|_| "3".to_string())
                .parse()?,
            fetch_backoff_mins: std::env::var("FETCH_BACKOFF_MINS")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            buffer_poll_ms: std::env::var("BUFFER_POLL_MS")
                .unwrap_or_else(|_| "2000".to_string())
                .parse()?,

            // Reproducción
            default_volume: std::env::var("DEFAULT_VOLUME")
                .unwrap_or_else(|_| "0.5".to_string())
                .parse()?,
            opus_bitrate: std::env::var("OPUS_BITRATE")
                .unwrap_or_else(|_| "96000".to_string()) // 96kbps (default de Discord)
                .parse()?,
            monitor_poll_ms: std::env::var("MONITOR_POLL_MS")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
            connect_timeout_secs: std::env::var("CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()?,
            idle_timeout_secs: std::env::var("IDLE_TIMEOUT_SECS")
                .unwrap_or_else(|_| "600".to_string()) // 10 minutos
                .parse()?,
            idle_sweep_secs: std::env::var("IDLE_SWEEP_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()?,

            // Paths
            data_dir: std::env::var("DATA_DIR")
                .unwrap_or_else(|_| "./data".to_string())
                .into(),
            cache_dir: std::env::var("CACHE_DIR")
                .unwrap_or_else(|_| "./cache".to_string())
                .into(),

            // Límites
            fetch_timeout_secs: std::env::var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|_| "120".to_string())
                .parse()?,
            max_queue_size: std::env::var("MAX_QUEUE_SIZE")
                .unwrap_or_else(|_| "500".to_string())
                .parse()?,
        };

        // Crear directorios si no existen
        std::fs::create_dir_all(&config.data_dir)?;
        std::fs::create_dir_all(&config.cache_dir)?;

        config.validate()?;

        Ok(config)
    }

    /// Validates configuration values for correctness.
    ///
    /// Catches the common mistakes before the bot starts: a volume out of
    /// the supported range, an Opus bitrate Discord would reject, or
    /// zero-sized windows that would disable buffering entirely.
    pub fn validate(&self) -> Result<()> {
        if self.default_volume < 0.0 || self.default_volume > 2.0 {
            anyhow::bail!(
                "El volumen por defecto debe estar entre 0.0 y 2.0, recibido: {}",
                self.default_volume
            );
        }

        if self.opus_bitrate > 510_000 {
            anyhow::bail!(
                "El bitrate Opus no puede superar 510kbps, recibido: {}",
                self.opus_bitrate
            );
        }
        if self.opus_bitrate < 8_000 {
            anyhow::bail!(
                "Bitrate Opus demasiado bajo, mínimo 8kbps, recibido: {}",
                self.opus_bitrate
            );
        }

        if self.max_buffer == 0 {
            anyhow::bail!("La ventana del buffer debe ser mayor que 0");
        }
        if self.fetch_concurrency == 0 {
            anyhow::bail!("La concurrencia de descarga debe ser mayor que 0");
        }
        if self.max_fetch_attempts == 0 {
            anyhow::bail!("El tope de intentos de descarga debe ser mayor que 0");
        }
        if self.buffer_poll_ms == 0 || self.monitor_poll_ms == 0 {
            anyhow::bail!("Los intervalos de sondeo deben ser mayores que 0");
        }
        if self.max_queue_size == 0 {
            anyhow::bail!("El tamaño máximo de cola debe ser mayor que 0");
        }

        Ok(())
    }
}

/// Valores por defecto, pensados para un buen equilibrio entre calidad
/// y consumo. El token no tiene default: debe venir del entorno.
impl Default for Config {
    fn default() -> Self {
        Self {
            discord_token: String::new(),
            command_prefix: "!".to_string(),

            max_buffer: 4,
            fetch_concurrency: 4,
            max_fetch_attempts: 3,
            fetch_backoff_mins: 30,
            buffer_poll_ms: 2000,

            default_volume: 0.5,
            opus_bitrate: 96_000,
            monitor_poll_ms: 500,
            connect_timeout_secs: 10,
            idle_timeout_secs: 600,
            idle_sweep_secs: 60,

            data_dir: "./data".into(),
            cache_dir: "./cache".into(),

            fetch_timeout_secs: 120,
            max_queue_size: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.default_volume = 3.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.opus_bitrate = 600_000;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_buffer = 0;
        assert!(config.validate().is_err());
    }
}
