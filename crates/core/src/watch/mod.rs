//! Change monitor: recursive directory watching feeding a per-path debouncer.

pub mod debounce;

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;

pub use debounce::Debouncer;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Watch root {0} is not a directory")]
    NotADirectory(String),
    #[error("Failed to watch {path}: {source}")]
    Notify {
        path: String,
        #[source]
        source: notify::Error,
    },
}

/// Which paths count as module files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchFilter {
    /// Required file-name suffix, e.g. `.hsm`.
    pub suffix: String,
    /// Directory names whose contents are never reported (intermediate build output).
    pub ignored_dirs: Vec<String>,
}

impl WatchFilter {
    pub fn new(suffix: impl Into<String>, ignored_dirs: Vec<String>) -> Self {
        Self { suffix: suffix.into(), ignored_dirs }
    }

    pub fn matches(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name().and_then(OsStr::to_str) else {
            return false;
        };
        if !file_name.ends_with(&self.suffix) {
            return false;
        }
        let in_ignored_dir = path.parent().into_iter().flat_map(Path::components).any(|c| {
            let name = c.as_os_str().to_string_lossy();
            self.ignored_dirs.iter().any(|ignored| name.eq_ignore_ascii_case(ignored))
        });
        !in_ignored_dir
    }
}

/// Content changes worth a reload. Freshly created files count too: many build tools replace
/// a module by writing a new file over the old one.
fn is_content_change(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_))
        || matches!(kind, EventKind::Modify(modify) if !matches!(modify, ModifyKind::Metadata(_)))
}

pub struct ChangeMonitor {
    watcher: RecommendedWatcher,
    roots: Vec<PathBuf>,
}

impl ChangeMonitor {
    pub fn new(filter: WatchFilter, debouncer: Arc<Debouncer>) -> Result<Self, WatchError> {
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_content_change(&event.kind) => {
                for path in event.paths.into_iter().filter(|p| filter.matches(p)) {
                    debouncer.add(path);
                }
            }
            Ok(_) => {}
            Err(e) => error!("File watcher error: {e}"),
        })
        .map_err(|source| WatchError::Notify { path: String::new(), source })?;
        Ok(Self { watcher, roots: Vec::new() })
    }

    /// Start watching `root` and everything below it.
    pub fn watch(&mut self, root: &Path) -> Result<(), WatchError> {
        if !root.is_dir() {
            return Err(WatchError::NotADirectory(root.display().to_string()));
        }
        self.watcher
            .watch(root, RecursiveMode::Recursive)
            .map_err(|source| WatchError::Notify { path: root.display().to_string(), source })?;
        info!("Watching for module changes in {}", root.display());
        self.roots.push(root.to_path_buf());
        Ok(())
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }
}
