use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::sources::Track;

const STORE_FILE: &str = "cache_index.json";

/// Palabras de relleno que no aportan identidad al título
const NOISE_WORDS: &[&str] = &[
    "official", "oficial", "video", "videoclip", "audio", "lyrics", "lyric",
    "letra", "hd", "hq", "4k", "1080p", "remastered", "remaster", "feat",
    "ft", "live", "mv", "music", "topic", "visualizer",
];

/// Registro persistente de un track ya descargado
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub video_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    /// Duración en segundos (0 si se desconoce)
    pub duration: u64,
    pub file_path: PathBuf,
    pub file_size: u64,
    pub downloaded_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub use_count: u64,
    /// Firma normalizada del título, para búsqueda de duplicados aproximados
    pub title_hash: String,
}

/// Resumen del estado del índice
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub count: usize,
    pub total_bytes: u64,
    pub oldest_download: Option<DateTime<Utc>>,
    pub max_use_count: u64,
}

struct IndexInner {
    entries: RwLock<HashMap<String, CacheEntry>>,
    store_path: PathBuf,
}

/// Índice persistente de descargas, respaldado por un único archivo JSON.
///
/// Las operaciones que mutan reescriben el archivo completo de forma
/// síncrona bajo el lock exclusivo; las lecturas usan el lock compartido.
/// El handle se clona barato; todos los clones comparten el mismo índice.
#[derive(Clone)]
pub struct CacheIndex {
    inner: Arc<IndexInner>,
}

impl CacheIndex {
    /// Carga el índice desde `data_dir`. Un archivo ausente o corrupto
    /// se trata como índice vacío.
    pub fn new(data_dir: impl Into<PathBuf>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("no se pudo crear {}", data_dir.display()))?;

        let store_path = data_dir.join(STORE_FILE);
        let entries = match std::fs::read_to_string(&store_path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, CacheEntry>>(&contents) {
                Ok(map) => {
                    info!("📂 Índice de caché cargado: {} tracks", map.len());
                    map
                }
                Err(e) => {
                    warn!("Índice de caché corrupto, empezando vacío: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Ok(Self {
            inner: Arc::new(IndexInner {
                entries: RwLock::new(entries),
                store_path,
            }),
        })
    }

    /// Verifica si un track está cacheado y su archivo sigue en disco.
    /// Una entrada sin archivo se programa para eliminación asíncrona.
    pub fn has(&self, id: &str) -> bool {
        let file_path = {
            let entries = self.inner.entries.read();
            match entries.get(id) {
                Some(entry) => entry.file_path.clone(),
                None => return false,
            }
        };

        if file_path.exists() {
            return true;
        }

        // El archivo desapareció: purgar la entrada fuera de este camino
        let index = self.clone();
        let stale_id = id.to_string();
        tokio::spawn(async move {
            debug!("🧹 Purgando entrada sin archivo: {}", stale_id);
            if let Err(e) = index.remove(&stale_id) {
                warn!("No se pudo purgar la entrada {}: {:#}", stale_id, e);
            }
        });

        false
    }

    /// Inserta o actualiza la entrada de un track descargado.
    ///
    /// Si la entrada ya existía conserva su `downloaded_at` original e
    /// incrementa el contador de usos. El índice en memoria queda
    /// actualizado aunque la persistencia falle.
    pub fn put(&self, track: &Track, file_path: &Path, file_size: u64) -> Result<()> {
        let mut entries = self.inner.entries.write();
        let now = Utc::now();

        match entries.get_mut(&track.id) {
            Some(existing) => {
                existing.title = track.title.clone();
                existing.artist = track.artist.clone();
                existing.duration = track.duration.map(|d| d.as_secs()).unwrap_or(0);
                existing.file_path = file_path.to_path_buf();
                existing.file_size = file_size;
                existing.last_used = now;
                existing.use_count += 1;
                existing.title_hash = title_signature(&track.title).join(" ");
            }
            None => {
                entries.insert(
                    track.id.clone(),
                    CacheEntry {
                        video_id: track.id.clone(),
                        title: track.title.clone(),
                        artist: track.artist.clone(),
                        duration: track.duration.map(|d| d.as_secs()).unwrap_or(0),
                        file_path: file_path.to_path_buf(),
                        file_size,
                        downloaded_at: now,
                        last_used: now,
                        use_count: 1,
                        title_hash: title_signature(&track.title).join(" "),
                    },
                );
            }
        }

        self.persist(&entries)
    }

    /// Devuelve una copia de la entrada y marca el uso.
    pub fn get(&self, id: &str) -> Option<CacheEntry> {
        let mut entries = self.inner.entries.write();
        let entry = entries.get_mut(id)?;
        entry.last_used = Utc::now();
        entry.use_count += 1;
        let copy = entry.clone();

        // El toque de uso se persiste con mejor esfuerzo: una lectura no
        // debe fallar por un problema de E/S del almacén
        if let Err(e) = self.persist(&entries) {
            warn!("No se pudo persistir el índice tras un hit: {:#}", e);
        }

        Some(copy)
    }

    /// Elimina la entrada y, con mejor esfuerzo, su archivo de audio.
    pub fn remove(&self, id: &str) -> Result<()> {
        let mut entries = self.inner.entries.write();
        if let Some(entry) = entries.remove(id) {
            if entry.file_path.exists() {
                if let Err(e) = std::fs::remove_file(&entry.file_path) {
                    warn!(
                        "No se pudo borrar {}: {}",
                        entry.file_path.display(),
                        e
                    );
                }
            }
            self.persist(&entries)?;
        }
        Ok(())
    }

    /// Busca entradas con título parecido usando solapamiento de firmas.
    ///
    /// La similitud es el índice de Jaccard entre los conjuntos de
    /// palabras significativas de ambas firmas.
    #[allow(dead_code)]
    pub fn find_similar(&self, title: &str, threshold: f64) -> Vec<CacheEntry> {
        let query: HashSet<String> = title_signature(title).into_iter().collect();
        if query.is_empty() {
            return Vec::new();
        }

        let entries = self.inner.entries.read();
        entries
            .values()
            .filter(|entry| {
                let candidate: HashSet<String> =
                    entry.title_hash.split_whitespace().map(String::from).collect();
                jaccard(&query, &candidate) >= threshold
            })
            .cloned()
            .collect()
    }

    /// Resumen del índice para diagnóstico.
    pub fn stats(&self) -> CacheStats {
        let entries = self.inner.entries.read();
        CacheStats {
            count: entries.len(),
            total_bytes: entries.values().map(|e| e.file_size).sum(),
            oldest_download: entries.values().map(|e| e.downloaded_at).min(),
            max_use_count: entries.values().map(|e| e.use_count).max().unwrap_or(0),
        }
    }

    #[allow(dead_code)]
    pub fn store_path(&self) -> &Path {
        &self.inner.store_path
    }

    // Reescribe el almacén completo. Se llama con el lock de escritura tomado,
    // así el archivo siempre refleja un estado consistente del índice.
    fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        if let Some(parent) = self.inner.store_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("no se pudo crear {}", parent.display()))?;
        }
        let contents = serde_json::to_string_pretty(entries)?;
        std::fs::write(&self.inner.store_path, contents)
            .with_context(|| format!("no se pudo escribir {}", self.inner.store_path.display()))?;
        Ok(())
    }
}

/// Firma normalizada de un título: minúsculas, sin palabras de relleno,
/// hasta 5 palabras significativas (de más de 2 caracteres).
fn title_signature(title: &str) -> Vec<String> {
    let lowered: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();

    lowered
        .split_whitespace()
        .filter(|w| w.len() > 2 && !NOISE_WORDS.contains(w))
        .take(5)
        .map(String::from)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    let overlap = a.intersection(b).count();
    overlap as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn track(id: &str, title: &str) -> Track {
        Track::new(id, title, format!("https://www.youtube.com/watch?v={}", id))
            .with_duration(Duration::from_secs(180))
    }

    fn write_audio(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, b"not really opus").unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_has_get_remove() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "a1.opus");

        assert!(!index.has("a1"));

        index.put(&track("a1", "Una Canción"), &audio, 15).unwrap();
        assert!(index.has("a1"));

        let entry = index.get("a1").unwrap();
        assert_eq!(entry.video_id, "a1");
        assert_eq!(entry.file_size, 15);
        assert_eq!(entry.duration, 180);

        index.remove("a1").unwrap();
        assert!(!index.has("a1"));
        assert!(!audio.exists());

        // El almacén reescrito ya no contiene la entrada
        let reloaded = CacheIndex::new(dir.path()).unwrap();
        assert_eq!(reloaded.stats().count, 0);
    }

    #[tokio::test]
    async fn test_put_preserves_downloaded_at() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "a2.opus");

        index.put(&track("a2", "Otra"), &audio, 10).unwrap();
        let first = index.get("a2").unwrap();

        index.put(&track("a2", "Otra"), &audio, 12).unwrap();
        let second = index.get("a2").unwrap();

        assert_eq!(first.downloaded_at, second.downloaded_at);
        assert!(second.use_count > first.use_count);
        assert_eq!(second.file_size, 12);
    }

    #[tokio::test]
    async fn test_has_purges_stale_entry() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "a3.opus");

        index.put(&track("a3", "Efímera"), &audio, 10).unwrap();
        std::fs::remove_file(&audio).unwrap();

        assert!(!index.has("a3"));

        // La purga corre en segundo plano
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(index.inner.entries.read().get("a3").is_none());
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "a4.opus");

        // Un directorio donde debería estar el archivo hace fallar la escritura
        let store = index.store_path().to_path_buf();
        let _ = std::fs::remove_file(&store);
        std::fs::create_dir(&store).unwrap();

        assert!(index.put(&track("a4", "Resistente"), &audio, 10).is_err());

        // El índice en memoria sigue siendo la autoridad para el proceso
        assert!(index.has("a4"));
        assert!(index.get("a4").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_puts_all_land() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let index = index.clone();
            let audio = write_audio(dir.path(), &format!("c{}.opus", i));
            tasks.push(tokio::spawn(async move {
                index
                    .put(&track(&format!("c{}", i), "Concurrente"), &audio, 1)
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(index.stats().count, 10);

        // El estado final en disco refleja todas las escrituras
        let reloaded = CacheIndex::new(dir.path()).unwrap();
        assert_eq!(reloaded.stats().count, 10);
    }

    #[tokio::test]
    async fn test_find_similar() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "s1.opus");

        index
            .put(
                &track("s1", "Gran Artista - Canción Bonita (Official Video) [HD]"),
                &audio,
                10,
            )
            .unwrap();
        index
            .put(&track("s2", "Algo Completamente Distinto"), &audio, 10)
            .unwrap();

        let hits = index.find_similar("canción bonita gran artista", 0.5);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].video_id, "s1");

        assert!(index.find_similar("otra cosa cualquiera", 0.5).is_empty());
    }

    #[test]
    fn test_title_signature_strips_noise() {
        let sig = title_signature("Artista - Tema Increíble (Official Video) [4K] ft. Alguien");
        assert!(!sig.contains(&"official".to_string()));
        assert!(!sig.contains(&"video".to_string()));
        assert!(sig.contains(&"artista".to_string()));
        assert!(sig.contains(&"tema".to_string()));
        assert!(sig.len() <= 5);
    }

    #[tokio::test]
    async fn test_stats() {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        let audio = write_audio(dir.path(), "st.opus");

        index.put(&track("st1", "Uno"), &audio, 100).unwrap();
        index.put(&track("st2", "Dos"), &audio, 200).unwrap();

        let stats = index.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_bytes, 300);
        assert!(stats.oldest_download.is_some());
        assert!(stats.max_use_count >= 1);
    }
}
