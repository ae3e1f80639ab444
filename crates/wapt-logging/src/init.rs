use std::path::Path;

use anyhow::Result;
use once_cell::sync::OnceCell;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_error::ErrorLayer;
use tracing_log::LogTracer;
use tracing_subscriber::filter::{LevelFilter, Targets};
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Layer, Registry};

use crate::config::LoggingConfig;
use crate::targets::SUBSYSTEMS;

static RELOAD: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();

/// Keeps the non-blocking file writers alive. Drop flushes them.
pub struct LoggingGuards {
    _file_guards: Vec<WorkerGuard>,
}

pub fn init(component: &str, root: &Path, cfg: &LoggingConfig) -> Result<LoggingGuards> {
    let (filter_layer, handle) = reload::Layer::new(build_filter(cfg));
    let _ = RELOAD.set(handle);

    let stdout_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_writer(std::io::stderr)
        .compact();

    let base = tracing_subscriber::registry()
        .with(filter_layer)
        .with(ErrorLayer::default())
        .with(stdout_layer);

    let log_dir = root.join("logs");
    if let Err(err) = std::fs::create_dir_all(&log_dir) {
        base.try_init().ok();
        let _ = LogTracer::init();
        tracing::warn!("File logging disabled ({}): {}", log_dir.display(), err);
        return Ok(LoggingGuards {
            _file_guards: Vec::new(),
        });
    }

    let mut guards = Vec::new();

    let component_appender = tracing_appender::rolling::daily(&log_dir, format!("{component}.log"));
    let (component_writer, component_guard) = tracing_appender::non_blocking(component_appender);
    guards.push(component_guard);
    let component_layer = fmt::layer()
        .with_target(true)
        .with_level(true)
        .with_line_number(true)
        .with_ansi(false)
        .compact()
        .with_writer(component_writer);

    let mut subsystem_layers = Vec::new();
    for (target, filename) in SUBSYSTEMS {
        let appender = tracing_appender::rolling::daily(&log_dir, filename);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        guards.push(guard);
        subsystem_layers.push(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_ansi(false)
                .compact()
                .with_writer(writer)
                .with_filter(Targets::new().with_target(target, LevelFilter::TRACE))
                .boxed(),
        );
    }

    base.with(component_layer)
        .with(subsystem_layers)
        .try_init()
        .ok();
    let _ = LogTracer::init();

    Ok(LoggingGuards {
        _file_guards: guards,
    })
}

/// Swaps the active filter for one built from `cfg`.
pub fn apply(cfg: &LoggingConfig) -> Result<()> {
    let handle = RELOAD
        .get()
        .ok_or_else(|| anyhow::anyhow!("logging not initialized"))?;
    handle.reload(build_filter(cfg))?;
    Ok(())
}

fn build_filter(cfg: &LoggingConfig) -> EnvFilter {
    if !cfg.enabled {
        return EnvFilter::new("off");
    }
    if let Ok(directive) = std::env::var("WAPT_LOG") {
        if let Ok(filter) = EnvFilter::try_new(directive) {
            return filter;
        }
    }
    EnvFilter::try_new(cfg.level.clone()).unwrap_or_else(|_| EnvFilter::new("info"))
}
