//! Debug-only hot reload for the custom post-process shader.
//!
//! The notify callback runs on the watcher's thread; the only state it
//! shares with the renderer is a single `AtomicI64` holding either the idle
//! sentinel or a debounced deadline in milliseconds since the watcher epoch.
//! The frame driver polls the atomic and recompiles once the deadline
//! passes.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use notify::{RecursiveMode, Watcher};

/// Sentinel: no reload pending.
pub const WATCH_IDLE: i64 = i64::MAX;

const DEBOUNCE_MS: i64 = 100;

pub struct ShaderWatcher {
    _watcher: notify::RecommendedWatcher,
}

impl ShaderWatcher {
    /// Watches the shader's parent directory (editors with atomic saves
    /// replace the file, which breaks watching the file itself) and arms
    /// `invalidation` when the file changes.
    pub fn new(shader_path: &Path, invalidation: Arc<AtomicI64>, epoch: Instant) -> Result<Self> {
        let canonical = shader_path
            .canonicalize()
            .unwrap_or_else(|_| shader_path.to_path_buf());
        let file_name = canonical
            .file_name()
            .context("shader path has no file name")?
            .to_os_string();
        let parent = canonical
            .parent()
            .context("shader path has no parent directory")?
            .to_path_buf();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| {
                let Ok(event) = result else {
                    return;
                };
                if !matches!(
                    event.kind,
                    notify::EventKind::Modify(_)
                        | notify::EventKind::Create(_)
                        | notify::EventKind::Remove(_)
                ) {
                    return;
                }
                for path in &event.paths {
                    if path.file_name() == Some(file_name.as_os_str()) {
                        let deadline = epoch.elapsed().as_millis() as i64 + DEBOUNCE_MS;
                        // Only arm from idle: a pending reload keeps its
                        // deadline instead of being pushed out by editor
                        // event bursts.
                        let _ = invalidation.compare_exchange(
                            WATCH_IDLE,
                            deadline,
                            Ordering::Relaxed,
                            Ordering::Relaxed,
                        );
                    }
                }
            },
        )
        .context("failed to create file watcher")?;

        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch shader directory: {}", parent.display()))?;

        log::info!("shader hot reload: watching {}", canonical.display());
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const SHADER: &str = "@fragment fn fs_main() -> @location(0) vec4<f32> { return vec4<f32>(1.0); }";

    #[test]
    fn watcher_creation_with_valid_path() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("effect.wgsl");
        fs::write(&path, SHADER).expect("write shader");

        let invalidation = Arc::new(AtomicI64::new(WATCH_IDLE));
        let watcher = ShaderWatcher::new(&path, Arc::clone(&invalidation), Instant::now());
        assert!(watcher.is_ok());
        assert_eq!(invalidation.load(Ordering::Relaxed), WATCH_IDLE);
    }

    #[test]
    fn watcher_creation_without_parent_fails() {
        let invalidation = Arc::new(AtomicI64::new(WATCH_IDLE));
        let result = ShaderWatcher::new(Path::new("/"), invalidation, Instant::now());
        assert!(result.is_err());
    }

    #[test]
    fn file_change_arms_the_deadline() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join("effect.wgsl");
        fs::write(&path, SHADER).expect("write shader");

        let invalidation = Arc::new(AtomicI64::new(WATCH_IDLE));
        let _watcher = ShaderWatcher::new(&path, Arc::clone(&invalidation), Instant::now())
            .expect("create watcher");

        std::thread::sleep(std::time::Duration::from_millis(100));
        fs::write(&path, format!("{SHADER}\n// edited")).expect("rewrite shader");
        std::thread::sleep(std::time::Duration::from_millis(400));

        // Event delivery is platform dependent; when it does arrive the
        // deadline must be a small positive offset, not the sentinel.
        let value = invalidation.load(Ordering::Relaxed);
        if value != WATCH_IDLE {
            assert!(value >= DEBOUNCE_MS);
            assert!(value < 60_000);
        }
    }
}
