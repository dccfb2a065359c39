use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use log::{info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::accounting::DurationAccountant;
use crate::audio::AlertKind;
use crate::capture::CaptureProvider;
use crate::db::{Database, StateSeconds};
use crate::detection::StateDetector;
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::settings::SettingsStore;

use super::effects::{EffectRunner, Notifier, SoundPlayer};
use super::snapshot::MonitorSnapshot;
use super::telemetry::Telemetry;
use super::worker::{monitor_loop, MonitorFlags, MonitorWorker};

/// External collaborators the monitor runs against.
#[derive(Clone)]
pub struct MonitorServices {
    pub capture: Arc<dyn CaptureProvider>,
    pub detector: Arc<dyn StateDetector>,
    pub notifier: Arc<dyn Notifier>,
    pub sounds: Arc<dyn SoundPlayer>,
    pub db: Database,
}

/// Starts, stops and steers the monitor worker. One session runs at a time.
pub struct MonitorController {
    services: MonitorServices,
    settings: Arc<SettingsStore>,
    effects: EffectRunner,
    metrics: MetricsCollector,
    flags: Arc<MonitorFlags>,
    snapshot: Arc<watch::Sender<MonitorSnapshot>>,
    handle: Option<JoinHandle<Result<StateSeconds>>>,
    cancel_token: Option<CancellationToken>,
    session_id: Option<String>,
}

impl MonitorController {
    pub fn new(services: MonitorServices, settings: Arc<SettingsStore>) -> Self {
        let effects = EffectRunner::new(
            Arc::clone(&services.notifier),
            Arc::clone(&services.sounds),
            Telemetry::new(services.db.clone()),
        );
        let (tx, _rx) = watch::channel(MonitorSnapshot::default());

        Self {
            services,
            settings,
            effects,
            metrics: MetricsCollector::new(),
            flags: Arc::new(MonitorFlags::default()),
            snapshot: Arc::new(tx),
            handle: None,
            cancel_token: None,
            session_id: None,
        }
    }

    /// Opens a new session and spawns the worker loop. Returns the session id.
    pub async fn start(&mut self) -> Result<String> {
        if self.handle.is_some() {
            bail!("monitor already running");
        }

        let settings = self.settings.current()?;
        let started_at = Utc::now();
        let session_id = Uuid::new_v4().to_string();
        let config_snapshot = serde_json::to_string(&settings).ok();

        let accountant = DurationAccountant::begin(
            self.services.db.clone(),
            session_id.clone(),
            started_at,
            config_snapshot,
        )
        .await
        .context("failed to open monitoring session")?;

        self.metrics.reset().await;
        self.flags.set_paused(false);
        self.flags.set_muted(settings.muted);
        self.snapshot.send_replace(MonitorSnapshot {
            running: true,
            muted: settings.muted,
            session_id: Some(session_id.clone()),
            state_entered_at: Some(started_at),
            updated_at: Some(started_at),
            ..MonitorSnapshot::default()
        });

        let worker = MonitorWorker::new(
            Arc::clone(&self.services.capture),
            Arc::clone(&self.services.detector),
            self.effects.clone(),
            self.metrics.clone(),
            self.services.db.clone(),
            Arc::clone(&self.flags),
            Arc::clone(&self.snapshot),
            accountant,
            &settings,
            started_at,
        );

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            worker,
            Duration::from_secs(settings.check_interval_secs),
            cancel_token.clone(),
        ));

        info!(
            "Monitoring started (session {session_id}, every {}s)",
            settings.check_interval_secs
        );
        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.session_id = Some(session_id.clone());
        Ok(session_id)
    }

    /// Lets the in-flight cycle finish, then closes the session. Returns the
    /// session's per-state totals, or `None` if nothing was running.
    pub async fn stop(&mut self) -> Result<Option<StateSeconds>> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }

        let Some(handle) = self.handle.take() else {
            return Ok(None);
        };
        let session_id = self.session_id.take();
        let totals = handle
            .await
            .context("monitor loop task failed to join")??;

        self.flags.set_paused(false);
        self.snapshot.send_modify(|snapshot| {
            snapshot.running = false;
            snapshot.paused = false;
            snapshot.state_seconds = totals;
            snapshot.updated_at = Some(Utc::now());
        });
        info!(
            "Monitoring stopped (session {}, {:.0}s tracked)",
            session_id.as_deref().unwrap_or("?"),
            totals.total()
        );
        Ok(Some(totals))
    }

    /// Closes the current session and opens a fresh one.
    pub async fn restart(&mut self) -> Result<String> {
        self.stop().await?;
        self.start().await
    }

    pub async fn pause(&self) -> Result<()> {
        self.set_paused(true, AlertKind::Error, "monitoring paused")
            .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.set_paused(false, AlertKind::Success, "monitoring resumed")
            .await
    }

    async fn set_paused(&self, paused: bool, sound: AlertKind, message: &str) -> Result<()> {
        if !self.is_running() {
            bail!("monitor is not running");
        }
        if self.flags.is_paused() == paused {
            return Ok(());
        }

        self.flags.set_paused(paused);
        self.snapshot
            .send_modify(|snapshot| snapshot.paused = paused);
        self.effects.play(sound, self.flags.is_muted());
        self.effects
            .telemetry()
            .record_info(self.session_id.as_deref(), message, Utc::now())
            .await;
        info!("{message}");
        Ok(())
    }

    /// Mute silences alert sounds only; notifications keep flowing. The
    /// choice is persisted to the settings file.
    pub fn set_muted(&self, muted: bool) {
        self.flags.set_muted(muted);
        self.snapshot.send_modify(|snapshot| snapshot.muted = muted);
        if let Err(err) = self.settings.set_muted(muted) {
            warn!("Failed to persist mute setting: {err:#}");
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MonitorSnapshot> {
        self.snapshot.subscribe()
    }

    pub async fn metrics(&self) -> MetricsSnapshot {
        self.metrics.get_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{EventFilter, EventKind, SessionStatus};
    use crate::detection::AgentState;
    use crate::monitor::cycle::tests::{ScriptedCapture, ScriptedDetector};
    use crate::monitor::effects::tests::{RecordingNotifier, RecordingSounds};
    use tempfile::TempDir;

    struct Fixture {
        controller: MonitorController,
        db: Database,
        sounds: Arc<RecordingSounds>,
        settings: Arc<SettingsStore>,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = Arc::new(SettingsStore::new(dir.path().join("agentwatch.json")).unwrap());
        settings
            .update(|s| s.check_interval_secs = 1)
            .unwrap();
        let db = Database::open_in_memory().unwrap();
        let sounds = Arc::new(RecordingSounds::default());
        let services = MonitorServices {
            capture: Arc::new(ScriptedCapture::default()),
            detector: Arc::new(ScriptedDetector::new(&[AgentState::Active; 4])),
            notifier: Arc::new(RecordingNotifier::default()),
            sounds: sounds.clone(),
            db: db.clone(),
        };

        Fixture {
            controller: MonitorController::new(services, settings.clone()),
            db,
            sounds,
            settings,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn start_and_stop_complete_a_session() {
        let mut f = fixture();

        let session_id = f.controller.start().await.unwrap();
        assert!(f.controller.is_running());
        assert!(f.controller.snapshot().running);
        assert!(f.controller.start().await.is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let totals = f.controller.stop().await.unwrap().unwrap();
        assert!(totals.total() >= 0.0);
        assert!(!f.controller.is_running());
        assert!(!f.controller.snapshot().running);

        let session = f.db.get_session(&session_id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Completed);
        assert!(f.controller.stop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn restart_opens_a_new_session() {
        let mut f = fixture();

        let first = f.controller.start().await.unwrap();
        let second = f.controller.restart().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(f.controller.session_id(), Some(second.as_str()));

        let closed = f.db.get_session(&first).await.unwrap().unwrap();
        assert!(closed.ended_at.is_some());
        f.controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn pause_and_resume_play_cues_and_log() {
        let mut f = fixture();
        assert!(f.controller.pause().await.is_err());

        f.controller.start().await.unwrap();
        f.controller.pause().await.unwrap();
        assert!(f.controller.snapshot().paused);
        f.controller.pause().await.unwrap();
        f.controller.resume().await.unwrap();
        assert!(!f.controller.snapshot().paused);

        assert_eq!(
            *f.sounds.played.lock().unwrap(),
            vec![AlertKind::Error, AlertKind::Success]
        );
        let infos = f
            .db
            .get_events(EventFilter {
                kind: Some(EventKind::Info),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(infos.len(), 2);
        f.controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn mute_is_published_and_persisted() {
        let f = fixture();

        f.controller.set_muted(true);
        assert!(f.controller.snapshot().muted);
        assert!(f.settings.current().unwrap().muted);

        let reloaded = SettingsStore::new(f.settings.path().clone()).unwrap();
        assert!(reloaded.current().unwrap().muted);
    }
}
