use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    ConfigChanged,
    ConfigRemoved,
}

pub fn classify_event(event: &Event, config_path: &Path) -> Option<WatchEvent> {
    if !event.paths.iter().any(|p| p == config_path) {
        return None;
    }
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) => Some(WatchEvent::ConfigChanged),
        EventKind::Remove(_) => Some(WatchEvent::ConfigRemoved),
        _ => None,
    }
}

/// Watch the directory holding `config_path` so atomic replace-by-rename
/// saves are still seen.
pub fn watch_config(
    tx: UnboundedSender<WatchEvent>,
    config_path: PathBuf,
) -> Result<RecommendedWatcher, notify::Error> {
    let dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let target = config_path.clone();
    let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
        match res {
            Ok(event) => {
                if let Some(watch_event) = classify_event(&event, &target) {
                    let _ = tx.send(watch_event);
                }
            }
            Err(e) => debug!(error = %e, "Config watch error"),
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    debug!(path = %config_path.display(), "Watching config file");
    Ok(watcher)
}
