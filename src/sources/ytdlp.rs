use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use url::Url;

use super::{Track, TrackFetcher};
use crate::cache::CacheIndex;

/// Colaborador de descarga basado en yt-dlp: baja el audio al directorio
/// de caché y registra el resultado en el índice.
pub struct YtDlpFetcher {
    cache: CacheIndex,
    cache_dir: PathBuf,
    timeout: Duration,
}

impl YtDlpFetcher {
    pub fn new(cache: CacheIndex, cache_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            cache,
            cache_dir,
            timeout,
        }
    }

    /// Verifica que yt-dlp y ffmpeg estén disponibles
    pub async fn verify_dependencies(&self) -> Result<()> {
        let ytdlp = tokio::process::Command::new("yt-dlp")
            .arg("--version")
            .output()
            .await;

        match ytdlp {
            Ok(output) if output.status.success() => {
                let version = String::from_utf8_lossy(&output.stdout);
                info!("✅ yt-dlp versión: {}", version.trim());
            }
            _ => {
                error!("❌ yt-dlp no encontrado. Instala con: pip install yt-dlp");
                anyhow::bail!("yt-dlp no disponible");
            }
        }

        let ffmpeg = tokio::process::Command::new("ffmpeg")
            .arg("-version")
            .output()
            .await;

        match ffmpeg {
            Ok(output) if output.status.success() => {
                info!("✅ ffmpeg disponible");
            }
            _ => {
                error!("❌ ffmpeg no encontrado. Instala con: sudo apt install ffmpeg");
                anyhow::bail!("ffmpeg no disponible");
            }
        }

        Ok(())
    }

    /// Resuelve una URL o término de búsqueda a un track con identidad.
    pub async fn probe(&self, query: &str) -> Result<Track> {
        let mut cmd = tokio::process::Command::new("yt-dlp");
        cmd.args([
            "--print",
            "%(id)s|%(title)s|%(uploader)s|%(duration)s",
            "--default-search",
            "ytsearch",
            "--no-playlist",
            "--socket-timeout",
            "30",
        ])
        .arg(query);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| anyhow::anyhow!("tiempo de espera agotado consultando yt-dlp"))??;

        if !output.status.success() {
            anyhow::bail!(
                "yt-dlp no pudo resolver {}: {}",
                query,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().unwrap_or("").trim();
        parse_probe_line(line, query)
    }

    fn audio_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.opus", sanitize_id(id)))
    }
}

#[async_trait]
impl TrackFetcher for YtDlpFetcher {
    async fn fetch(&self, track: &Track) -> Result<bool> {
        let final_path = self.audio_path(&track.id);

        // Descarga previa sin registro en el índice: reaprovechar
        if final_path.exists() {
            let size = tokio::fs::metadata(&final_path).await?.len();
            self.cache.put(track, &final_path, size)?;
            return Ok(true);
        }

        let template = self
            .cache_dir
            .join(format!("{}.%(ext)s", sanitize_id(&track.id)));

        let mut cmd = tokio::process::Command::new("yt-dlp");
        cmd.args([
            "-x",
            "--audio-format",
            "opus",
            "--no-playlist",
            "--socket-timeout",
            "30",
            "--retries",
            "3",
            "--quiet",
            "-o",
        ])
        .arg(&template)
        .arg(&track.url);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!("⏱️ La descarga de {} superó el tiempo límite", track.id);
                return Ok(false);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("yt-dlp falló para {}: {}", track.id, stderr.trim());
            return Ok(false);
        }

        let size = match tokio::fs::metadata(&final_path).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                warn!("yt-dlp no produjo {}", final_path.display());
                return Ok(false);
            }
        };

        self.cache.put(track, &final_path, size)?;
        info!("📦 Descargado: {} ({} bytes)", track.title, size);
        Ok(true)
    }
}

// La línea de --print es id|título|uploader|duración. El título puede
// contener '|', así que se parsea desde los extremos.
fn parse_probe_line(line: &str, query: &str) -> Result<Track> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 2 || parts[0].is_empty() {
        anyhow::bail!("respuesta de yt-dlp inesperada: {:?}", line);
    }

    let id = parts[0];
    let (title, uploader, duration) = if parts.len() >= 4 {
        (
            parts[1..parts.len() - 2].join("|"),
            Some(parts[parts.len() - 2]),
            parts[parts.len() - 1].parse::<f64>().ok(),
        )
    } else {
        (parts[1].to_string(), None, None)
    };

    let url = if is_probable_url(query) {
        query.to_string()
    } else {
        format!("https://www.youtube.com/watch?v={}", id)
    };

    let mut track = Track::new(id, title, url);
    if let Some(artist) = uploader.filter(|s| !s.is_empty() && *s != "NA") {
        track = track.with_artist(artist);
    }
    if let Some(secs) = duration.filter(|d| *d > 0.0) {
        track = track.with_duration(Duration::from_secs(secs.round() as u64));
    }
    Ok(track)
}

fn is_probable_url(query: &str) -> bool {
    Url::parse(query)
        .map(|u| matches!(u.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn sanitize_id(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe_line() {
        let track = parse_probe_line("dQw4w9WgXcQ|Una Canción|Un Artista|212.0", "una canción").unwrap();
        assert_eq!(track.id, "dQw4w9WgXcQ");
        assert_eq!(track.title, "Una Canción");
        assert_eq!(track.artist.as_deref(), Some("Un Artista"));
        assert_eq!(track.duration, Some(Duration::from_secs(212)));
        assert_eq!(track.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
    }

    #[test]
    fn test_parse_probe_line_title_with_pipes() {
        let track = parse_probe_line("abc123|Tema | Con | Barras|Artista|90", "q").unwrap();
        assert_eq!(track.title, "Tema | Con | Barras");
        assert_eq!(track.artist.as_deref(), Some("Artista"));
    }

    #[test]
    fn test_parse_probe_line_keeps_original_url() {
        let url = "https://www.youtube.com/watch?v=abc123";
        let track = parse_probe_line("abc123|Tema|NA|NA", url).unwrap();
        assert_eq!(track.url, url);
        assert!(track.artist.is_none());
        assert!(track.duration.is_none());
    }

    #[test]
    fn test_parse_probe_line_rejects_garbage() {
        assert!(parse_probe_line("", "q").is_err());
        assert!(parse_probe_line("solo-id", "q").is_err());
    }

    #[test]
    fn test_sanitize_id() {
        assert_eq!(sanitize_id("abc-123_XYZ"), "abc-123_XYZ");
        assert_eq!(sanitize_id("../etc/passwd"), "___etc_passwd");
    }
}
