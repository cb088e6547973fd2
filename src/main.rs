use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nrtk_sync::config::{self, RunMode};
use nrtk_sync::logging;
use nrtk_sync::metrics::{spawn_metrics_logger, Metrics};
use nrtk_sync::server::{self, RequestHandler};
use nrtk_sync::sync::{SyncEngine, SyncError, SyncOutcome};

fn run_cycle(engine: &SyncEngine) -> Result<Option<SyncOutcome>, SyncError> {
    match engine.run_cycle() {
        Ok(outcome) => {
            tracing::info!(%outcome, "sync cycle finished");
            Ok(Some(outcome))
        }
        Err(err) if err.is_fatal() => Err(err),
        Err(err) => {
            tracing::error!(error = %err, "sync cycle failed");
            Ok(None)
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dotenv = config::load_dotenv();
    logging::init();

    match dotenv {
        Some(Ok(path)) => tracing::info!(path = %path.display(), "overriding envs from .env"),
        Some(Err(err)) => tracing::warn!(error = %err, "unable to read config from .env"),
        None => {}
    }

    let cfg = config::load()?;
    if cfg.story_extension_ignored() {
        tracing::warn!(
            extension = %cfg.story_extension,
            "story extension must be lowercase letters only; serving without suffix"
        );
    }

    let layout = cfg.layout();
    tracing::info!(
        root = %layout.root.display(),
        mode = ?cfg.run_mode(),
        fetch_local = cfg.mode_fetch_local,
        force_update = cfg.mode_force_update,
        "starting nrtk-sync"
    );

    let metrics = Arc::new(Metrics::new());
    if cfg.metrics_interval_secs > 0 {
        spawn_metrics_logger(
            Arc::clone(&metrics),
            Duration::from_secs(cfg.metrics_interval_secs),
        );
    }

    let engine = Arc::new(SyncEngine::from_config(&cfg, Arc::clone(&metrics))?);
    let startup = run_cycle(&engine)?;

    match cfg.run_mode() {
        RunMode::Serve { port } => {
            let listener = server::bind(port)?;
            let handler = Arc::new(RequestHandler::new(
                Arc::clone(&engine),
                cfg.sync_handler.clone(),
                cfg.api_token.clone(),
                Arc::clone(&metrics),
            ));
            server::serve(listener, handler, cfg.http_server_workers);
            Ok(())
        }
        RunMode::Poll { interval } => loop {
            tracing::info!(seconds = interval.as_secs_f64(), "taking a nap");
            thread::sleep(interval);
            run_cycle(&engine)?;
        },
        RunMode::Once => match startup {
            Some(_) => Ok(()),
            None => Err("sync cycle failed".into()),
        },
    }
}
