pub mod accounting;
pub mod audio;
pub mod capture;
pub mod db;
pub mod detection;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod settings;
mod utils;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use audio::AlertPlayer;
use capture::{FileCapture, SidecarTextRecognizer};
use db::Database;
use detection::{
    FallbackDetector, FrameScorer, ReferenceSet, StateDetector, TemplateDetector, TextDetector,
};
use monitor::{status_reporter, MonitorController, MonitorServices};
use notify::LogNotifier;
use settings::{MonitorSettings, SettingsStore};

/// Cadence of the status reporter; kept below the fastest check interval.
const STATUS_REFRESH: Duration = Duration::from_millis(500);

/// Builds the template detector, wrapped with the text fallback when enabled.
fn build_detector(settings: &MonitorSettings) -> Result<Arc<dyn StateDetector>> {
    let references = ReferenceSet::load(&settings.reference_dirs, settings.pyramid_levels)
        .context("failed to load reference images")?;
    let template = TemplateDetector::new(
        Arc::new(references),
        FrameScorer::new(settings.pyramid_levels),
        settings.arbiter(),
    );

    let fallback: Option<Box<dyn StateDetector>> = if settings.text_signal.enabled {
        let recognizer = SidecarTextRecognizer::for_capture(&settings.capture_path);
        Some(Box::new(TextDetector::new(
            recognizer,
            &settings.text_signal.idle_keywords,
        )))
    } else {
        None
    };

    Ok(Arc::new(FallbackDetector::new(Box::new(template), fallback)))
}

/// Closes a session a crash left running and drops expired events.
async fn recover(db: &Database, retention_days: u32) -> Result<()> {
    if let Some(session) = db.get_incomplete_session().await? {
        warn!(
            "Recovered incomplete session {}; marking as Interrupted",
            session.id
        );
        db.mark_session_interrupted(&session.id, Utc::now())
            .await?;
    }

    let removed = db.cleanup_old_events(retention_days).await?;
    if removed > 0 {
        info!("Removed {removed} telemetry events older than {retention_days} days");
    }
    Ok(())
}

/// Runs the monitor until Ctrl-C, then closes the session cleanly.
pub async fn run() -> Result<()> {
    // RUST_LOG wins; info otherwise
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("agentwatch starting up...");

    let settings_store = Arc::new(SettingsStore::new(settings::default_settings_path())?);
    let settings = settings_store.current()?;

    let database = Database::new(settings.db_path.clone())?;
    recover(&database, settings.event_retention_days).await?;

    let player = AlertPlayer::new();
    let services = MonitorServices {
        capture: Arc::new(FileCapture::new(settings.capture_path.clone())),
        detector: build_detector(&settings)?,
        notifier: Arc::new(LogNotifier),
        sounds: Arc::new(player.clone()),
        db: database,
    };

    let mut controller = MonitorController::new(services, settings_store);
    controller.start().await?;

    let cancel_token = CancellationToken::new();
    let reporter = tokio::spawn(status_reporter(
        controller.subscribe(),
        STATUS_REFRESH,
        settings::debug_enabled(),
        cancel_token.clone(),
    ));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Shutdown requested");

    let totals = controller.stop().await?;
    cancel_token.cancel();
    if let Err(err) = reporter.await {
        warn!("status reporter failed to join: {err}");
    }
    player.stop();

    if let Some(totals) = totals {
        info!(
            "Session totals: idle {:.0}s, active {:.0}s, run_command {:.0}s, unknown {:.0}s",
            totals.idle, totals.active, totals.run_command, totals.unknown
        );
    }
    Ok(())
}
