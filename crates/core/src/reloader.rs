//! Process-scoped facade wiring the loader, registry, patch installer and change monitor.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ReloaderConfig;
use crate::loader::ModuleLoader;
use crate::model::LoadError;
use crate::patch::{PatchInstaller, PatchReport};
use crate::registry::MemberRegistry;
use crate::runtime::{LoadedModule, Runtime};
use crate::watch::{ChangeMonitor, Debouncer, WatchError};

/// One reload attempt, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct ReloadRecord {
    pub path: PathBuf,
    pub revision: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    /// RFC 3339 timestamp.
    pub reloaded_at: String,
    pub report: PatchReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The settled-reload action, shared between direct callers and the debounce worker.
struct Pipeline {
    runtime: Arc<Runtime>,
    loader: Arc<ModuleLoader>,
    installer: PatchInstaller,
    history: Mutex<VecDeque<ReloadRecord>>,
    history_limit: usize,
}

impl Pipeline {
    fn reload(&self, path: &Path) -> Result<ReloadRecord, LoadError> {
        let reloaded_at = Utc::now().to_rfc3339();
        let outcome = self.loader.reload(&self.runtime, path);
        let record = match &outcome {
            Ok(reloaded) => {
                let report = self.installer.apply(reloaded);
                info!(
                    "Reloaded {} revision {}: {} armed, {} deferred, {} skipped, {} ignored, {} failed",
                    path.display(),
                    reloaded.revision,
                    report.armed.len(),
                    report.deferred.len(),
                    report.skipped.len(),
                    report.ignored.len(),
                    report.failed.len()
                );
                ReloadRecord {
                    path: path.to_path_buf(),
                    revision: reloaded.revision,
                    content_hash: Some(reloaded.content_hash.clone()),
                    reloaded_at,
                    report,
                    error: None,
                }
            }
            Err(e) => {
                error!("Failed to reload {}: {e}", path.display());
                ReloadRecord {
                    path: path.to_path_buf(),
                    revision: self.loader.revision(path),
                    content_hash: None,
                    reloaded_at,
                    report: PatchReport::default(),
                    error: Some(e.to_string()),
                }
            }
        };
        let mut history = self.history.lock();
        if history.len() >= self.history_limit.max(1) {
            history.pop_front();
        }
        history.push_back(record.clone());
        drop(history);
        outcome.map(|_| record)
    }
}

pub struct Reloader {
    config: ReloaderConfig,
    registry: Arc<MemberRegistry>,
    pipeline: Arc<Pipeline>,
    debouncer: Arc<Debouncer>,
    monitor: Mutex<Option<ChangeMonitor>>,
}

impl Reloader {
    /// Hook the runtime's module loading and start watching the configured roots.
    pub fn install(runtime: Arc<Runtime>, config: ReloaderConfig) -> Result<Arc<Self>, WatchError> {
        let registry = Arc::new(MemberRegistry::new());
        let loader = Arc::new(ModuleLoader::new(registry.clone()));
        runtime.set_load_interceptor(loader.clone());

        let pipeline = Arc::new(Pipeline {
            runtime,
            loader,
            installer: PatchInstaller::new(registry.clone(), config.version_policy),
            history: Mutex::new(VecDeque::new()),
            history_limit: config.history_limit,
        });
        let worker_pipeline = pipeline.clone();
        let debouncer = Arc::new(Debouncer::new(config.debounce(), move |path| {
            // Failures are logged and recorded in the history.
            let _ = worker_pipeline.reload(path);
        }));

        let reloader =
            Arc::new(Self { config, registry, pipeline, debouncer, monitor: Mutex::new(None) });
        for root in reloader.config.watch_roots.clone() {
            reloader.watch(&root)?;
        }
        info!("Reloader installed (debounce {} ms)", reloader.config.debounce_ms);
        Ok(reloader)
    }

    /// Watch `dir` recursively; settled changes to matching files trigger a reload.
    pub fn watch(&self, dir: &Path) -> Result<(), WatchError> {
        let mut monitor = self.monitor.lock();
        if monitor.is_none() {
            *monitor = Some(ChangeMonitor::new(self.config.filter(), self.debouncer.clone())?);
        }
        match monitor.as_mut() {
            Some(monitor) => monitor.watch(dir),
            None => Ok(()),
        }
    }

    /// Load a module through the runtime's (intercepted) loading entry point.
    pub fn load(&self, path: &Path) -> Result<Arc<LoadedModule>, LoadError> {
        self.pipeline.runtime.load_from(path)
    }

    /// Run the reload action for `path` immediately, bypassing the debounce window.
    pub fn reload_path(&self, path: &Path) -> Result<ReloadRecord, LoadError> {
        self.pipeline.reload(path)
    }

    /// Reload records, oldest first; only the last `history_limit` attempts are kept.
    pub fn history(&self) -> Vec<ReloadRecord> {
        self.pipeline.history.lock().iter().cloned().collect()
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.pipeline.runtime
    }

    pub fn config(&self) -> &ReloaderConfig {
        &self.config
    }

    pub fn watched_roots(&self) -> Vec<PathBuf> {
        self.monitor.lock().as_ref().map(|m| m.roots().to_vec()).unwrap_or_default()
    }

    /// Paths with a change notification still inside the debounce window.
    pub fn pending_reloads(&self) -> usize {
        self.debouncer.pending()
    }
}
