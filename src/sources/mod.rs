pub mod ytdlp;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;
use url::Url;

pub use ytdlp::YtDlpFetcher;

/// Unidad reproducible, identificada por una clave externa estable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    /// Clave estable del catálogo externo (video ID, etc.)
    pub id: String,
    pub title: String,
    pub artist: Option<String>,
    pub duration: Option<Duration>,
    /// Locator de origen: URL o ruta local
    pub url: String,
}

impl Track {
    pub fn new(id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artist: None,
            duration: None,
            url: url.into(),
        }
    }

    pub fn with_artist(mut self, artist: impl Into<String>) -> Self {
        self.artist = Some(artist.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Verifica si el locator apunta a un archivo ya presente en disco.
    /// Esos tracks no pasan por el colaborador de descarga.
    pub fn is_local_file(&self) -> bool {
        if let Ok(parsed) = Url::parse(&self.url) {
            if parsed.scheme() == "file" {
                return parsed.to_file_path().map(|p| p.exists()).unwrap_or(false);
            }
            if !parsed.cannot_be_a_base() {
                // URL remota (http, https, ...)
                return false;
            }
        }
        Path::new(&self.url).is_absolute() && Path::new(&self.url).exists()
    }
}

/// Colaborador de descarga: obtiene el audio de un track y, en caso de
/// éxito, deja el resultado registrado en el índice de caché.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrackFetcher: Send + Sync {
    /// Descarga el track. `Ok(true)` implica que el CacheEntry ya quedó
    /// registrado; `Ok(false)` o `Err` cuentan como fallo de descarga.
    async fn fetch(&self, track: &Track) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_file_detection() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cancion.opus");
        std::fs::write(&file, b"opus").unwrap();

        let local = Track::new("abc", "Canción", file.to_string_lossy());
        assert!(local.is_local_file());

        let file_url = Track::new("abc", "Canción", format!("file://{}", file.display()));
        assert!(file_url.is_local_file());

        let remote = Track::new(
            "dQw4w9WgXcQ",
            "Video",
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
        );
        assert!(!remote.is_local_file());

        let missing = Track::new("xyz", "Fantasma", "/no/existe/archivo.opus");
        assert!(!missing.is_local_file());
    }
}
