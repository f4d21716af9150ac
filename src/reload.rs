// Program source watcher for hot reload
//
// Watches the directory holding the source file (editors often replace the
// file rather than writing it in place) and reports changes to that one
// file. Polled once per frame by the driver.

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, TryRecvError};

pub struct KernelWatcher {
    path: PathBuf,
    events: Receiver<notify::Result<Event>>,
    _watcher: RecommendedWatcher,
}

impl KernelWatcher {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (tx, events) = channel();
        let mut watcher = notify::recommended_watcher(tx).context("Failed to create file watcher")?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch {:?}", dir))?;

        log::info!("Watching {:?} for changes", path);
        Ok(Self {
            path,
            events,
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Drain pending events; true if the watched file was written or
    /// replaced since the last poll.
    pub fn poll(&self) -> bool {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(Ok(event)) => changed |= self.is_relevant(&event),
                Ok(Err(err)) => log::warn!("File watcher error: {}", err),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("File watcher for {:?} stopped", self.path);
                    break;
                }
            }
        }
        changed
    }

    fn is_relevant(&self, event: &Event) -> bool {
        let kind_matches = matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_));
        kind_matches
            && event
                .paths
                .iter()
                .any(|p| p.file_name() == self.path.file_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};

    fn watcher_for(name: &str) -> KernelWatcher {
        let (_tx, events) = channel();
        KernelWatcher {
            path: PathBuf::from("kernels").join(name),
            events,
            _watcher: notify::recommended_watcher(|_: notify::Result<Event>| {}).unwrap(),
        }
    }

    #[test]
    fn only_writes_to_the_watched_file_count() {
        let watcher = watcher_for("particles.cl");

        let modified = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/work/kernels/particles.cl"));
        let other = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/work/kernels/particles.cl.swp"));
        let removed = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/work/kernels/particles.cl"));

        assert!(watcher.is_relevant(&modified));
        assert!(!watcher.is_relevant(&other));
        assert!(!watcher.is_relevant(&removed));
    }

    #[test]
    fn poll_with_no_events_is_quiet() {
        let watcher = watcher_for("particles.cl");
        assert!(!watcher.poll());
    }
}
