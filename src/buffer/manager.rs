use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::backoff::FetchBackoffTracker;
use crate::cache::CacheIndex;
use crate::config::Config;
use crate::notify::ProgressSink;
use crate::sources::{Track, TrackFetcher};

/// Estado transitorio del buffer, protegido por un único lock
#[derive(Default)]
struct BufferState {
    /// Ventana objetivo: los próximos tracks de la cola a tener en disco
    window: Vec<Track>,
    /// Tracks con una descarga en vuelo, para no duplicar trabajo
    in_flight: HashSet<String>,
    active: bool,
}

struct BufferInner {
    state: RwLock<BufferState>,
    backoff: FetchBackoffTracker,
    cache: CacheIndex,
    fetcher: Arc<dyn TrackFetcher>,
    fetch_permits: Semaphore,
    max_buffer: usize,
    poll_interval: Duration,
    shutdown: RwLock<CancellationToken>,
}

/// Mantiene la ventana de pre-descarga en segundo plano.
///
/// Las mutaciones de la cola entran por `update_queue`; un task de
/// mantenimiento periódico decide qué descargar, con concurrencia
/// acotada y saltándose tracks cacheados, en vuelo o castigados por
/// el tracker de backoff. El handle se clona barato.
#[derive(Clone)]
pub struct BufferManager {
    inner: Arc<BufferInner>,
}

impl BufferManager {
    pub fn new(config: &Config, cache: CacheIndex, fetcher: Arc<dyn TrackFetcher>) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                state: RwLock::new(BufferState::default()),
                backoff: FetchBackoffTracker::new(
                    config.max_fetch_attempts,
                    Duration::from_secs(config.fetch_backoff_mins * 60),
                ),
                cache,
                fetcher,
                fetch_permits: Semaphore::new(config.fetch_concurrency),
                max_buffer: config.max_buffer,
                poll_interval: Duration::from_millis(config.buffer_poll_ms),
                shutdown: RwLock::new(CancellationToken::new()),
            }),
        }
    }

    /// Activa el buffer y lanza el task de mantenimiento periódico.
    pub fn start(&self) {
        {
            let mut state = self.inner.state.write();
            if state.active {
                return;
            }
            state.active = true;
        }

        let token = CancellationToken::new();
        *self.inner.shutdown.write() = token.clone();

        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.inner.poll_interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // El flag manda: la cancelación es solo mejor esfuerzo
                        if !manager.is_active() {
                            break;
                        }
                        manager.maintain().await;
                    }
                }
            }
            debug!("Task de mantenimiento del buffer terminado");
        });

        info!("📥 Buffer activo (ventana de {} tracks)", self.inner.max_buffer);
    }

    /// Desactiva el buffer y descarta todo el estado transitorio.
    /// Las descargas ya en vuelo terminan solas; no se fuerza su cancelación.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.write();
            state.active = false;
            state.window.clear();
            state.in_flight.clear();
        }
        self.inner.backoff.clear();
        self.inner.shutdown.read().cancel();
        info!("📥 Buffer detenido");
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.read().active
    }

    /// Recalcula la ventana objetivo: los siguientes `max_buffer` tracks
    /// estrictamente después del que está sonando (o desde el principio
    /// si no suena nada). El reemplazo es atómico; ninguna descarga se
    /// dispara aquí: el próximo tick del mantenimiento la recoge.
    pub fn update_queue(&self, queue: &[Track], current: Option<usize>) {
        let start = current.map(|i| i + 1).unwrap_or(0);
        let window: Vec<Track> = queue
            .iter()
            .skip(start)
            .take(self.inner.max_buffer)
            .cloned()
            .collect();

        let mut state = self.inner.state.write();
        debug!(
            "Ventana de buffer recalculada: {} tracks (cola de {}, actual {:?})",
            window.len(),
            queue.len(),
            current
        );
        state.window = window;
    }

    /// Copia de la ventana objetivo actual.
    #[allow(dead_code)]
    pub fn window(&self) -> Vec<Track> {
        self.inner.state.read().window.clone()
    }

    /// Descarga en bloque los primeros `min(max_buffer, len)` tracks antes
    /// de arrancar la reproducción. Espera a que terminen todas las
    /// descargas paralelas y reporta el éxito parcial al sink.
    pub async fn pre_download_initial(&self, items: &[Track], sink: &dyn ProgressSink) -> usize {
        let targets: Vec<&Track> = items.iter().take(self.inner.max_buffer).collect();
        let total = targets.len();
        if total == 0 {
            return 0;
        }

        sink.notify(&format!("⏳ Pre-cargando {} tracks...", total)).await;

        let fetches = targets.into_iter().map(|track| async move {
            if track.is_local_file() || self.inner.cache.has(&track.id) {
                return true;
            }
            let _permit = match self.inner.fetch_permits.acquire().await {
                Ok(permit) => permit,
                Err(_) => return false,
            };
            match self.inner.fetcher.fetch(track).await {
                Ok(true) => true,
                Ok(false) => {
                    self.inner.backoff.record_failure(&track.id);
                    false
                }
                Err(e) => {
                    warn!("Error pre-cargando {}: {:#}", track.id, e);
                    self.inner.backoff.record_failure(&track.id);
                    false
                }
            }
        });

        let results = futures::future::join_all(fetches).await;
        let succeeded = results.into_iter().filter(|ok| *ok).count();

        sink.notify(&format!("✅ Buffer inicial listo: {}/{}", succeeded, total)).await;
        info!("Pre-carga inicial: {}/{} tracks", succeeded, total);
        succeeded
    }

    /// Un tick de mantenimiento: lanza descargas en segundo plano para los
    /// tracks de la ventana que aún faltan, hasta el límite de concurrencia.
    async fn maintain(&self) {
        let window = self.inner.state.read().window.clone();

        for track in window {
            if track.is_local_file() {
                continue;
            }
            if self.inner.cache.has(&track.id) {
                continue;
            }
            if self.inner.backoff.should_skip(&track.id) {
                continue;
            }

            // Marcar en vuelo; si ya estaba, otro task la está bajando
            {
                let mut state = self.inner.state.write();
                if state.in_flight.contains(&track.id) {
                    continue;
                }
                state.in_flight.insert(track.id.clone());
            }

            let manager = self.clone();
            tokio::spawn(async move {
                let result = async {
                    let _permit = manager.inner.fetch_permits.acquire().await?;
                    manager.inner.fetcher.fetch(&track).await
                }
                .await;

                match result {
                    Ok(true) => debug!("📦 Track {} listo en el buffer", track.id),
                    Ok(false) => manager.inner.backoff.record_failure(&track.id),
                    Err(e) => {
                        warn!("Error descargando {}: {:#}", track.id, e);
                        manager.inner.backoff.record_failure(&track.id);
                    }
                }

                manager.inner.state.write().in_flight.remove(&track.id);
            });
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.inner.state.read().in_flight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::NullSink;
    use crate::sources::MockTrackFetcher;
    use anyhow::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    fn test_config(max_buffer: usize) -> Config {
        Config {
            max_buffer,
            fetch_concurrency: 4,
            max_fetch_attempts: 3,
            fetch_backoff_mins: 0, // sin ventana temporal: solo cuenta el tope
            buffer_poll_ms: 10,
            ..Config::default()
        }
    }

    fn tracks(ids: &[&str]) -> Vec<Track> {
        ids.iter()
            .map(|id| Track::new(*id, format!("Título {}", id), format!("https://yt.example/{}", id)))
            .collect()
    }

    fn new_index() -> (tempfile::TempDir, CacheIndex) {
        let dir = tempfile::tempdir().unwrap();
        let index = CacheIndex::new(dir.path()).unwrap();
        (dir, index)
    }

    /// Fetcher que falla para un id concreto y cachea el resto.
    struct SelectiveFetcher {
        cache: CacheIndex,
        dir: PathBuf,
        fail_id: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TrackFetcher for SelectiveFetcher {
        async fn fetch(&self, track: &Track) -> Result<bool> {
            self.calls.lock().push(track.id.clone());
            if track.id == self.fail_id {
                return Ok(false);
            }
            let path = self.dir.join(format!("{}.opus", track.id));
            std::fs::write(&path, b"audio").unwrap();
            self.cache.put(track, &path, 5)?;
            Ok(true)
        }
    }

    /// Fetcher que se queda bloqueado hasta que el test lo libere.
    struct BlockingFetcher {
        started: AtomicU32,
        release: Notify,
    }

    #[async_trait]
    impl TrackFetcher for BlockingFetcher {
        async fn fetch(&self, _track: &Track) -> Result<bool> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_update_queue_window_math() {
        let (_dir, cache) = new_index();
        let fetcher = Arc::new(MockTrackFetcher::new());
        let manager = BufferManager::new(&test_config(4), cache, fetcher);

        let queue = tracks(&["t0", "t1", "t2", "t3", "t4", "t5"]);

        // Ventana = los 4 siguientes estrictamente después del actual
        manager.update_queue(&queue, Some(0));
        let ids: Vec<String> = manager.window().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3", "t4"]);

        // Idempotente: mismos argumentos, misma ventana
        manager.update_queue(&queue, Some(0));
        let again: Vec<String> = manager.window().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, again);

        // Recortada al final de la cola
        manager.update_queue(&queue, Some(4));
        let tail: Vec<String> = manager.window().iter().map(|t| t.id.clone()).collect();
        assert_eq!(tail, vec!["t5"]);

        // Sin actual: desde el principio de la cola
        manager.update_queue(&queue, None);
        let head: Vec<String> = manager.window().iter().map(|t| t.id.clone()).collect();
        assert_eq!(head, vec!["t0", "t1", "t2", "t3"]);

        // Cola vacía
        manager.update_queue(&[], None);
        assert!(manager.window().is_empty());
    }

    #[tokio::test]
    async fn test_stop_clears_transient_state() {
        let (_dir, cache) = new_index();
        let fetcher = Arc::new(MockTrackFetcher::new());
        let manager = BufferManager::new(&test_config(4), cache, fetcher);

        manager.start();
        assert!(manager.is_active());

        manager.update_queue(&tracks(&["t1", "t2"]), None);
        manager.inner.backoff.record_failure("t9");

        manager.stop();
        assert!(!manager.is_active());
        assert!(manager.window().is_empty());
        assert_eq!(manager.inner.backoff.attempts("t9"), 0);
    }

    #[tokio::test]
    async fn test_pre_download_reports_partial_success() {
        let (dir, cache) = new_index();
        let fetcher = Arc::new(SelectiveFetcher {
            cache: cache.clone(),
            dir: dir.path().to_path_buf(),
            fail_id: "p2".to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let manager = BufferManager::new(&test_config(4), cache.clone(), fetcher);

        let queue = tracks(&["p1", "p2", "p3"]);
        let ok = manager.pre_download_initial(&queue, &NullSink).await;

        assert_eq!(ok, 2);
        assert!(cache.has("p1"));
        assert!(!cache.has("p2"));
        assert!(cache.has("p3"));
    }

    #[tokio::test]
    async fn test_pre_download_respects_window_size() {
        let (_dir, cache) = new_index();
        let mut mock = MockTrackFetcher::new();
        // Solo los 2 primeros de la cola entran en la ventana
        mock.expect_fetch().times(2).returning(|_| Ok(true));
        let manager = BufferManager::new(&test_config(2), cache, Arc::new(mock));

        let queue = tracks(&["q1", "q2", "q3", "q4"]);
        let ok = manager.pre_download_initial(&queue, &NullSink).await;
        assert_eq!(ok, 2);
    }

    #[tokio::test]
    async fn test_overlapping_ticks_fetch_once() {
        let (_dir, cache) = new_index();
        let fetcher = Arc::new(BlockingFetcher {
            started: AtomicU32::new(0),
            release: Notify::new(),
        });
        let manager =
            BufferManager::new(&test_config(4), cache, Arc::clone(&fetcher) as Arc<dyn TrackFetcher>);

        manager.update_queue(&tracks(&["dup"]), None);

        // Dos ticks seguidos mientras la primera descarga sigue en vuelo
        manager.maintain().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        manager.maintain().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(fetcher.started.load(Ordering::SeqCst), 1);
        assert_eq!(manager.in_flight_len(), 1);

        fetcher.release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(manager.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn test_failure_ceiling_excludes_track() {
        let (dir, cache) = new_index();
        let fetcher = Arc::new(SelectiveFetcher {
            cache: cache.clone(),
            dir: dir.path().to_path_buf(),
            fail_id: "roto".to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let manager =
            BufferManager::new(&test_config(4), cache, Arc::clone(&fetcher) as Arc<dyn TrackFetcher>);

        manager.update_queue(&tracks(&["roto"]), None);

        // Tres ticks: tres intentos fallidos
        for _ in 0..3 {
            manager.maintain().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(manager.inner.backoff.attempts("roto"), 3);

        // El cuarto tick ya no intenta nada
        manager.maintain().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fetcher.calls.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_buffer_scenario_end_to_end() {
        // Ventana 4, cola de 6, sonando el índice 0: objetivo = t1..t4.
        // t3 falla 3 veces y queda excluido; t1, t2 y t4 se cachean.
        let (dir, cache) = new_index();
        let fetcher = Arc::new(SelectiveFetcher {
            cache: cache.clone(),
            dir: dir.path().to_path_buf(),
            fail_id: "t3".to_string(),
            calls: Mutex::new(Vec::new()),
        });
        let manager = BufferManager::new(
            &test_config(4),
            cache.clone(),
            Arc::clone(&fetcher) as Arc<dyn TrackFetcher>,
        );

        let queue = tracks(&["t0", "t1", "t2", "t3", "t4", "t5"]);
        manager.update_queue(&queue, Some(0));

        let window_ids: Vec<String> = manager.window().iter().map(|t| t.id.clone()).collect();
        assert_eq!(window_ids, vec!["t1", "t2", "t3", "t4"]);

        for _ in 0..5 {
            manager.maintain().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(cache.has("t1"));
        assert!(cache.has("t2"));
        assert!(cache.has("t4"));
        assert!(!cache.has("t3"));
        assert!(manager.inner.backoff.should_skip("t3"));

        let calls = fetcher.calls.lock();
        let t3_calls = calls.iter().filter(|id| id.as_str() == "t3").count();
        let t1_calls = calls.iter().filter(|id| id.as_str() == "t1").count();
        assert_eq!(t3_calls, 3);
        assert_eq!(t1_calls, 1);
    }
}
