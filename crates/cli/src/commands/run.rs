use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use hotswap_core::runtime::{Runtime, StdoutConsole};
use hotswap_core::{Reloader, ReloaderConfig};
use log::{error, info};

use crate::canonicalize_or_current;
use crate::commands::parse_identity;

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub module: String,
    pub entry: String,
    pub watch: Vec<String>,
    pub config: Option<String>,
    pub interval_ms: u64,
    /// Number of calls to make; 0 runs until the process is stopped.
    pub iterations: u64,
}

/// Sample host loop: load the module through the reloader, then call `entry` repeatedly.
pub fn run_command(options: &RunOptions) -> Result<()> {
    let config_path = options.config.as_deref().map(canonicalize_or_current).transpose()?;
    let config = ReloaderConfig::load(config_path.as_deref())
        .context("Failed to load reloader configuration")?;

    let runtime = Arc::new(Runtime::with_options(
        Arc::new(StdoutConsole),
        config.version_policy,
    )?);
    let reloader = Reloader::install(runtime.clone(), config)?;

    let module = canonicalize_or_current(&options.module)?;
    reloader.load(&module).with_context(|| format!("Failed to load {}", module.display()))?;
    for dir in &options.watch {
        let dir = canonicalize_or_current(dir)?;
        reloader.watch(&dir).with_context(|| format!("Failed to watch {}", dir.display()))?;
    }

    let entry = parse_identity(&options.entry)?;
    if runtime.find_method(&entry).is_none() {
        return Err(anyhow!("Entry point {entry} not found in any live module"));
    }
    info!("Calling {entry} every {} ms", options.interval_ms);

    let mut calls = 0u64;
    loop {
        // A managed exception in the entry point is reported and the loop keeps going.
        if let Err(e) = runtime.call(&entry, Vec::new()) {
            error!("{entry} failed: {e}");
        }
        calls += 1;
        if options.iterations != 0 && calls >= options.iterations {
            break;
        }
        thread::sleep(Duration::from_millis(options.interval_ms));
    }

    for record in reloader.history() {
        let path = record.path.display();
        match &record.error {
            Some(err) => info!("{path} r{}: failed ({err})", record.revision),
            None => info!("{path} r{}: {} armed", record.revision, record.report.armed.len()),
        }
    }
    Ok(())
}
