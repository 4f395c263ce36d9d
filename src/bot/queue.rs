use anyhow::Result;
use tracing::{debug, info};

use crate::sources::Track;

/// Cola de reproducción de un guild.
///
/// El índice actual es explícito: `None` significa que no suena nada,
/// nunca se confunde con un track real. Cada mutación debe ir seguida de
/// un `update_queue` del buffer (lo hace la capa de comandos).
pub struct GuildQueue {
    items: Vec<Track>,
    current: Option<usize>,
    max_size: usize,
}

impl GuildQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: Vec::new(),
            current: None,
            max_size,
        }
    }

    /// Agrega un track al final; devuelve su posición.
    pub fn push(&mut self, track: Track) -> Result<usize> {
        if self.items.len() >= self.max_size {
            anyhow::bail!("la cola está llena (máximo {} tracks)", self.max_size);
        }
        info!("➕ En cola: {}", track.title);
        self.items.push(track);
        Ok(self.items.len() - 1)
    }

    /// Avanza al siguiente track y lo devuelve. Al agotarse la cola se
    /// vacía y el actual vuelve a ser "nada".
    pub fn advance(&mut self) -> Option<Track> {
        let next = self.current.map(|i| i + 1).unwrap_or(0);
        if next < self.items.len() {
            self.current = Some(next);
            Some(self.items[next].clone())
        } else {
            if !self.items.is_empty() {
                debug!("Cola agotada ({} tracks reproducidos)", self.items.len());
            }
            self.items.clear();
            self.current = None;
            None
        }
    }

    /// Quita un track pendiente por posición. El que está sonando no se
    /// quita por aquí (para eso está `skip`).
    #[allow(dead_code)]
    pub fn remove(&mut self, index: usize) -> Result<Track> {
        if index >= self.items.len() {
            anyhow::bail!("posición fuera de rango");
        }
        if self.current == Some(index) {
            anyhow::bail!("ese track está sonando ahora; usa skip");
        }
        let removed = self.items.remove(index);
        if let Some(current) = self.current {
            if index < current {
                self.current = Some(current - 1);
            }
        }
        Ok(removed)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.and_then(|i| self.items.get(i))
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    /// Tracks pendientes después del actual.
    pub fn upcoming(&self) -> &[Track] {
        let start = self.current.map(|i| i + 1).unwrap_or(0);
        &self.items[start.min(self.items.len())..]
    }

    pub fn items(&self) -> &[Track] {
        &self.items
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn track(id: &str) -> Track {
        Track::new(id, format!("Título {}", id), format!("https://yt.example/{}", id))
    }

    #[test]
    fn test_push_and_advance() {
        let mut queue = GuildQueue::new(10);
        assert!(queue.advance().is_none());

        queue.push(track("a")).unwrap();
        queue.push(track("b")).unwrap();

        assert_eq!(queue.advance().unwrap().id, "a");
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.upcoming().len(), 1);

        assert_eq!(queue.advance().unwrap().id, "b");

        // Agotada: se vacía y vuelve a "nada sonando"
        assert!(queue.advance().is_none());
        assert!(queue.is_empty());
        assert_eq!(queue.current_index(), None);
    }

    #[test]
    fn test_full_queue_rejects() {
        let mut queue = GuildQueue::new(1);
        queue.push(track("a")).unwrap();
        assert!(queue.push(track("b")).is_err());
    }

    #[test]
    fn test_remove_adjusts_current() {
        let mut queue = GuildQueue::new(10);
        for id in ["a", "b", "c", "d"] {
            queue.push(track(id)).unwrap();
        }
        queue.advance();
        queue.advance(); // sonando "b" (índice 1)

        // Quitar el actual está prohibido
        assert!(queue.remove(1).is_err());

        // Quitar algo anterior desplaza el índice actual
        queue.remove(0).unwrap();
        assert_eq!(queue.current_index(), Some(0));
        assert_eq!(queue.current().unwrap().id, "b");

        // Quitar algo posterior no lo toca
        queue.remove(1).unwrap();
        assert_eq!(queue.current().unwrap().id, "b");
        assert_eq!(queue.upcoming().iter().map(|t| t.id.as_str()).collect::<Vec<_>>(), vec!["d"]);
    }
}
