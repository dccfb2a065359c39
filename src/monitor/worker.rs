use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::accounting::DurationAccountant;
use crate::capture::CaptureProvider;
use crate::db::{Database, PerformanceMetric, StateSeconds};
use crate::detection::{AgentState, Detection, StabilityFilter, StateDetector};
use crate::metrics::{CycleMetrics, MetricsCollector};
use crate::settings::MonitorSettings;

use super::cycle::{run_cycle, BlockingSlot, CycleFailure, CycleOutcome, CycleTimings};
use super::effects::{EffectContext, EffectRunner};
use super::snapshot::MonitorSnapshot;
use super::state_machine::{StateMachine, StateMachineConfig, Step};

// Set to false to silence per-cycle logging
const ENABLE_LOGS: bool = true;

use crate::{log_debug, log_error, log_info, log_warn};

/// Every this many cycles one cycle's metrics are written to the database.
const METRICS_PERSIST_EVERY: u64 = 30;

/// Control flags shared between the controller and the running worker.
#[derive(Debug, Default)]
pub struct MonitorFlags {
    paused: AtomicBool,
    muted: AtomicBool,
}

impl MonitorFlags {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }
}

/// Sole owner of the pipeline's mutable state for one session. Readers only
/// ever see it through the published snapshot.
pub struct MonitorWorker {
    capture: Arc<dyn CaptureProvider>,
    detector: Arc<dyn StateDetector>,
    effects: EffectRunner,
    metrics: MetricsCollector,
    db: Database,
    flags: Arc<MonitorFlags>,
    snapshot: Arc<watch::Sender<MonitorSnapshot>>,
    filter: StabilityFilter,
    machine: StateMachine,
    accountant: DurationAccountant,
    blocking: BlockingSlot,
    cycle_timeout: Duration,
    cycles: u64,
}

impl MonitorWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        capture: Arc<dyn CaptureProvider>,
        detector: Arc<dyn StateDetector>,
        effects: EffectRunner,
        metrics: MetricsCollector,
        db: Database,
        flags: Arc<MonitorFlags>,
        snapshot: Arc<watch::Sender<MonitorSnapshot>>,
        accountant: DurationAccountant,
        settings: &MonitorSettings,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            capture,
            detector,
            effects,
            metrics,
            db,
            flags,
            snapshot,
            filter: StabilityFilter::new(settings.required_confirmations, settings.history_window()),
            machine: StateMachine::new(StateMachineConfig::from_settings(settings), started_at),
            accountant,
            blocking: BlockingSlot::default(),
            cycle_timeout: Duration::from_secs(settings.cycle_timeout_secs),
            cycles: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        self.accountant.session_id()
    }

    /// Runs one full cycle. Skipped entirely while paused.
    pub async fn tick(&mut self, now: DateTime<Utc>) {
        if self.flags.is_paused() {
            log_debug!("monitor paused, skipping cycle");
            return;
        }

        let cycle_start = Instant::now();
        let (outcome, timings) = run_cycle(
            &self.capture,
            &self.detector,
            &self.blocking,
            self.cycle_timeout,
        )
        .await;

        let (raw_state, failed) = match outcome {
            CycleOutcome::Classified(detection) => {
                let raw = detection.state;
                self.on_detection(detection, now).await;
                (raw, false)
            }
            CycleOutcome::Failed(failure) => {
                self.on_failure(failure, now).await;
                (AgentState::Unknown, true)
            }
        };

        let total_ms = cycle_start.elapsed().as_millis() as u64;
        self.record_metrics(now, timings, total_ms, raw_state, failed)
            .await;
    }

    async fn on_detection(&mut self, detection: Detection, now: DateTime<Utc>) {
        let stable = self.filter.observe(detection.state, now);
        let step = self.machine.observe(stable, now);

        if let Some(transition) = step.transition {
            log_info!(
                "state {} -> {} (confidence {:?}, session {})",
                transition.from,
                transition.to,
                detection.confidence,
                self.accountant.session_id()
            );
            self.accountant
                .on_transition(&transition, Some(&detection))
                .await;
        }
        if step.suppressed {
            log_debug!(
                "stable {:?} ignored inside the state change cooldown",
                stable
            );
        }
        if step.repeat_alert {
            log_info!("{} repeat alert", self.machine.current());
        }

        let ctx = EffectContext {
            session_id: self.accountant.session_id(),
            muted: self.flags.is_muted(),
            detection: Some(&detection),
        };
        self.effects.run(&step.effects, &ctx).await;

        self.publish_detection(&detection, &step, now);
    }

    async fn on_failure(&mut self, failure: CycleFailure, now: DateTime<Utc>) {
        match &failure {
            CycleFailure::CaptureTimedOut(_)
            | CycleFailure::DetectionTimedOut(_)
            | CycleFailure::StillRunning => log_warn!(
                "cycle timed out for session {}: {failure}",
                self.accountant.session_id()
            ),
            _ => log_error!(
                "cycle failed for session {}: {failure}",
                self.accountant.session_id()
            ),
        }

        let message = failure.to_string();
        let totals = self.accountant.totals_at(now);
        self.snapshot.send_modify(|snapshot| {
            snapshot.displayed_state = AgentState::Unknown;
            snapshot.raw_state = AgentState::Unknown;
            snapshot.last_confidence = None;
            snapshot.last_rect = None;
            snapshot.scores.clear();
            snapshot.cycle_count += 1;
            snapshot.failure_count += 1;
            snapshot.consecutive_failures += 1;
            snapshot.last_failure = Some(message);
            snapshot.state_seconds = totals;
            snapshot.updated_at = Some(now);
        });

        self.effects
            .telemetry()
            .record_failure(self.accountant.session_id(), &failure, now)
            .await;

        // A confirmed Idle or RunCommand keeps re-alerting while frames fail.
        let step = self.machine.observe(None, now);
        if step.repeat_alert {
            log_info!("{} repeat alert", self.machine.current());
            let ctx = EffectContext {
                session_id: self.accountant.session_id(),
                muted: self.flags.is_muted(),
                detection: None,
            };
            self.effects.run(&step.effects, &ctx).await;
        }
    }

    fn publish_detection(&self, detection: &Detection, step: &Step, now: DateTime<Utc>) {
        let machine = &self.machine;
        let totals = self.accountant.totals_at(now);
        self.snapshot.send_modify(|snapshot| {
            snapshot.confirmed_state = machine.current();
            snapshot.displayed_state = machine.displayed();
            snapshot.raw_state = detection.state;
            snapshot.last_confidence = detection.confidence;
            snapshot.last_rect = detection.rect;
            snapshot.last_method = Some(detection.method);
            snapshot.scores = detection
                .scores
                .iter()
                .map(|(state, m)| (*state, m.confidence))
                .collect();
            snapshot.cycle_count += 1;
            snapshot.consecutive_failures = 0;
            if let Some(transition) = step.transition {
                *snapshot.transition_counts.entry(transition.to).or_default() += 1;
            }
            snapshot.state_entered_at = Some(machine.entered_at());
            snapshot.state_seconds = totals;
            snapshot.updated_at = Some(now);
        });
    }

    async fn record_metrics(
        &mut self,
        now: DateTime<Utc>,
        timings: CycleTimings,
        total_ms: u64,
        raw_state: AgentState,
        failed: bool,
    ) {
        self.cycles += 1;
        let system = self.metrics.sample_system_metrics().await;
        self.metrics
            .record_cycle(CycleMetrics {
                timestamp: now,
                capture_ms: timings.capture_ms,
                detect_ms: timings.detect_ms,
                total_ms,
                frame_width: timings.frame_width,
                frame_height: timings.frame_height,
                raw_state,
                failed,
                cpu_percent: system.cpu_percent,
                memory_mb: system.memory_mb,
            })
            .await;

        if self.cycles % METRICS_PERSIST_EVERY != 1 {
            return;
        }
        let metric = PerformanceMetric {
            timestamp: now,
            session_id: Some(self.accountant.session_id().to_string()),
            cycle_ms: total_ms as f64,
            capture_ms: timings.capture_ms as f64,
            detect_ms: timings.detect_ms as f64,
            memory_mb: system.memory_mb,
            cpu_percent: system.cpu_percent,
            frame_width: timings.frame_width,
            frame_height: timings.frame_height,
        };
        if let Err(err) = self.db.insert_performance_metric(&metric).await {
            log_error!("failed to persist cycle metrics: {err:#}");
        }
    }

    /// Closes the session: final duration record and per-state totals.
    pub async fn finish(self, ended_at: DateTime<Utc>) -> Result<StateSeconds> {
        self.accountant.close(ended_at).await
    }
}

/// Drives `worker` every `every` until cancelled. A cycle already running when
/// the token fires completes before the session is closed.
pub async fn monitor_loop(
    mut worker: MonitorWorker,
    every: Duration,
    cancel_token: CancellationToken,
) -> Result<StateSeconds> {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    log_info!("monitor loop started for session {}", worker.session_id());
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                worker.tick(Utc::now()).await;
            }
            _ = cancel_token.cancelled() => {
                log_info!("monitor loop shutting down");
                break;
            }
        }
    }

    worker.finish(Utc::now()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AlertKind;
    use crate::db::{EventFilter, EventKind};
    use crate::monitor::cycle::tests::{ScriptedCapture, ScriptedDetector};
    use crate::monitor::effects::tests::{RecordingNotifier, RecordingSounds};
    use crate::monitor::telemetry::Telemetry;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 6, 9, 0, 0).unwrap() + ChronoDuration::seconds(secs)
    }

    struct Harness {
        worker: MonitorWorker,
        db: Database,
        flags: Arc<MonitorFlags>,
        snapshot: Arc<watch::Sender<MonitorSnapshot>>,
        capture: Arc<ScriptedCapture>,
        notifier: Arc<RecordingNotifier>,
        sounds: Arc<RecordingSounds>,
    }

    async fn harness(capture: ScriptedCapture, states: &[AgentState]) -> Harness {
        let capture = Arc::new(capture);
        let db = Database::open_in_memory().unwrap();
        let notifier = Arc::new(RecordingNotifier::default());
        let sounds = Arc::new(RecordingSounds::default());
        let effects = EffectRunner::new(
            notifier.clone(),
            sounds.clone(),
            Telemetry::new(db.clone()),
        );
        let flags = Arc::new(MonitorFlags::default());
        let (tx, _rx) = watch::channel(MonitorSnapshot::default());
        let snapshot = Arc::new(tx);
        let accountant = DurationAccountant::begin(db.clone(), "s1".to_string(), t(0), None)
            .await
            .unwrap();

        let worker = MonitorWorker::new(
            capture.clone(),
            Arc::new(ScriptedDetector::new(states)),
            effects,
            MetricsCollector::new(),
            db.clone(),
            flags.clone(),
            snapshot.clone(),
            accountant,
            &MonitorSettings::default(),
            t(0),
        );

        Harness {
            worker,
            db,
            flags,
            snapshot,
            capture,
            notifier,
            sounds,
        }
    }

    #[tokio::test]
    async fn two_idle_frames_confirm_idle_and_alert() {
        let mut h = harness(ScriptedCapture::default(), &[AgentState::Idle, AgentState::Idle]).await;

        h.worker.tick(t(2)).await;
        assert_eq!(h.snapshot.borrow().confirmed_state, AgentState::Unknown);
        h.worker.tick(t(4)).await;

        let snapshot = h.snapshot.borrow().clone();
        assert_eq!(snapshot.confirmed_state, AgentState::Idle);
        assert_eq!(snapshot.raw_state, AgentState::Idle);
        assert_eq!(snapshot.last_confidence, Some(0.9));
        assert_eq!(snapshot.cycle_count, 2);
        assert_eq!(snapshot.transition_counts.get(&AgentState::Idle), Some(&1));
        assert_eq!(snapshot.state_entered_at, Some(t(4)));

        assert_eq!(h.notifier.messages.lock().unwrap().len(), 1);
        assert_eq!(*h.sounds.played.lock().unwrap(), vec![AlertKind::Waiting]);

        let events = h.db.get_events(EventFilter::default()).await.unwrap();
        assert!(events.iter().any(|e| e.kind == EventKind::IdleDetection));
    }

    #[tokio::test]
    async fn capture_failure_counts_and_shows_unknown() {
        let capture = ScriptedCapture {
            failures: Mutex::new(vec![false, false, true]),
            ..ScriptedCapture::default()
        };
        let mut h = harness(capture, &[AgentState::Active, AgentState::Active]).await;

        h.worker.tick(t(2)).await;
        h.worker.tick(t(4)).await;
        h.worker.tick(t(6)).await;

        let snapshot = h.snapshot.borrow().clone();
        assert_eq!(snapshot.confirmed_state, AgentState::Active);
        assert_eq!(snapshot.displayed_state, AgentState::Unknown);
        assert_eq!(snapshot.failure_count, 1);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert!(snapshot.last_failure.unwrap().contains("display asleep"));

        let failures = h
            .db
            .get_events(EventFilter {
                kind: Some(EventKind::DetectionFailure),
                ..EventFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(failures.len(), 1);
    }

    #[tokio::test]
    async fn confirmed_idle_re_alerts_through_capture_failures() {
        let capture = ScriptedCapture {
            failures: Mutex::new(vec![false, false, true, true]),
            ..ScriptedCapture::default()
        };
        let mut h = harness(capture, &[AgentState::Idle, AgentState::Idle]).await;

        h.worker.tick(t(2)).await;
        h.worker.tick(t(4)).await;
        h.worker.tick(t(30)).await;
        assert_eq!(h.notifier.messages.lock().unwrap().len(), 1);

        h.worker.tick(t(64)).await;
        let snapshot = h.snapshot.borrow().clone();
        assert_eq!(snapshot.confirmed_state, AgentState::Idle);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert_eq!(h.notifier.messages.lock().unwrap().len(), 2);
        assert_eq!(
            *h.sounds.played.lock().unwrap(),
            vec![AlertKind::Waiting, AlertKind::Waiting]
        );
    }

    #[tokio::test]
    async fn paused_worker_skips_cycles() {
        let mut h = harness(ScriptedCapture::default(), &[AgentState::Idle, AgentState::Idle]).await;
        h.flags.set_paused(true);

        h.worker.tick(t(2)).await;
        h.worker.tick(t(4)).await;

        assert_eq!(h.snapshot.borrow().cycle_count, 0);
        assert_eq!(h.capture.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn muted_worker_notifies_without_sound() {
        let mut h = harness(ScriptedCapture::default(), &[AgentState::Idle, AgentState::Idle]).await;
        h.flags.set_muted(true);

        h.worker.tick(t(2)).await;
        h.worker.tick(t(4)).await;

        assert_eq!(h.notifier.messages.lock().unwrap().len(), 1);
        assert!(h.sounds.played.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn finish_accounts_the_whole_session() {
        let mut h = harness(
            ScriptedCapture::default(),
            &[AgentState::Active, AgentState::Active, AgentState::Idle, AgentState::Idle],
        )
        .await;
        for secs in [2, 4, 10, 12] {
            h.worker.tick(t(secs)).await;
        }

        let totals = h.worker.finish(t(20)).await.unwrap();
        assert!((totals.unknown - 4.0).abs() < 1e-6);
        assert!((totals.active - 8.0).abs() < 1e-6);
        assert!((totals.idle - 8.0).abs() < 1e-6);
        assert!((totals.total() - 20.0).abs() < 1e-6);

        let session = h.db.get_session("s1").await.unwrap().unwrap();
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn loop_closes_session_on_cancel() {
        let h = harness(ScriptedCapture::default(), &[AgentState::Active]).await;
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(monitor_loop(
            h.worker,
            Duration::from_millis(10),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let session = h.db.get_session("s1").await.unwrap().unwrap();
        assert!(session.ended_at.is_some());
        assert!(h.snapshot.borrow().cycle_count >= 1);
    }
}
