use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Fallos acumulados de un track (solo en memoria; un reinicio los borra)
#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    attempts: u32,
    last_failure: Instant,
}

/// Lleva la cuenta de descargas fallidas por track para no martillear
/// fuentes rotas: por debajo del tope los reintentos esperan la ventana
/// de backoff; al llegar al tope el track queda excluido hasta `clear`.
pub struct FetchBackoffTracker {
    failures: RwLock<HashMap<String, FailureRecord>>,
    max_attempts: u32,
    backoff: Duration,
}

impl FetchBackoffTracker {
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            failures: RwLock::new(HashMap::new()),
            max_attempts,
            backoff,
        }
    }

    /// Registra un fallo de descarga para el track.
    pub fn record_failure(&self, id: &str) {
        let mut failures = self.failures.write();
        let record = failures.entry(id.to_string()).or_insert(FailureRecord {
            attempts: 0,
            last_failure: Instant::now(),
        });
        record.attempts += 1;
        record.last_failure = Instant::now();

        if record.attempts >= self.max_attempts {
            warn!(
                "⛔ Track {} excluido tras {} intentos fallidos",
                id, record.attempts
            );
        } else {
            debug!(
                "Fallo {}/{} para {}, reintento en {:?}",
                record.attempts, self.max_attempts, id, self.backoff
            );
        }
    }

    /// Decide si el track debe saltarse: exclusión permanente al llegar
    /// al tope de intentos, o temporal dentro de la ventana de backoff.
    pub fn should_skip(&self, id: &str) -> bool {
        let failures = self.failures.read();
        match failures.get(id) {
            Some(record) if record.attempts >= self.max_attempts => true,
            Some(record) => record.last_failure.elapsed() < self.backoff,
            None => false,
        }
    }

    #[allow(dead_code)]
    pub fn attempts(&self, id: &str) -> u32 {
        self.failures.read().get(id).map(|r| r.attempts).unwrap_or(0)
    }

    /// Olvida todos los fallos registrados.
    pub fn clear(&self) {
        self.failures.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_skip_at_ceiling() {
        // Ventana cortísima para que el tope sea lo único que bloquee
        let tracker = FetchBackoffTracker::new(3, Duration::from_millis(10));

        assert!(!tracker.should_skip("v1"));

        tracker.record_failure("v1");
        tracker.record_failure("v1");
        assert_eq!(tracker.attempts("v1"), 2);

        tracker.record_failure("v1");
        assert!(tracker.should_skip("v1"));

        // Ni siquiera una ventana de backoff vencida lo rehabilita
        std::thread::sleep(Duration::from_millis(30));
        assert!(tracker.should_skip("v1"));
    }

    #[test]
    fn test_backoff_window_gates_retries() {
        let tracker = FetchBackoffTracker::new(3, Duration::from_millis(50));

        tracker.record_failure("v2");
        assert!(tracker.should_skip("v2"));

        // Con la ventana vencida el reintento vuelve a permitirse
        std::thread::sleep(Duration::from_millis(60));
        assert!(!tracker.should_skip("v2"));

        // Dos fallos siguen por debajo del tope: backoff temporal, no exclusión
        tracker.record_failure("v2");
        assert_eq!(tracker.attempts("v2"), 2);
        assert!(tracker.should_skip("v2"));
        std::thread::sleep(Duration::from_millis(60));
        assert!(!tracker.should_skip("v2"));
    }

    #[test]
    fn test_clear_forgets_everything() {
        let tracker = FetchBackoffTracker::new(3, Duration::from_millis(10));
        tracker.record_failure("v4");
        tracker.record_failure("v4");
        tracker.record_failure("v4");
        assert!(tracker.should_skip("v4"));

        tracker.clear();
        assert!(!tracker.should_skip("v4"));
        assert_eq!(tracker.attempts("v4"), 0);
    }
}
