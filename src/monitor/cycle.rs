//! One capture-and-classify pass, bounded by a timeout at every blocking step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use crate::capture::CaptureProvider;
use crate::detection::{Detection, StateDetector};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CycleFailure {
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("capture timed out after {0:?}")]
    CaptureTimedOut(Duration),
    #[error("detection failed: {0}")]
    DetectionFailed(String),
    #[error("detection timed out after {0:?}")]
    DetectionTimedOut(Duration),
    #[error("cycle worker join failed: {0}")]
    WorkerJoin(String),
    #[error("previous capture or detection is still running")]
    StillRunning,
}

/// Marks blocking cycle work in flight. A timed out capture or detection
/// cannot be cancelled, so it keeps the slot until it actually returns and
/// later cycles are skipped instead of piling up more blocking threads.
#[derive(Debug, Clone, Default)]
pub struct BlockingSlot(Arc<AtomicBool>);

impl BlockingSlot {
    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn try_claim(&self) -> Option<SlotGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| SlotGuard(Arc::clone(&self.0)))
    }
}

struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone)]
pub enum CycleOutcome {
    Classified(Detection),
    Failed(CycleFailure),
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CycleTimings {
    pub capture_ms: u64,
    pub detect_ms: u64,
    pub frame_width: Option<u32>,
    pub frame_height: Option<u32>,
}

pub async fn run_cycle(
    capture: &Arc<dyn CaptureProvider>,
    detector: &Arc<dyn StateDetector>,
    slot: &BlockingSlot,
    timeout: Duration,
) -> (CycleOutcome, CycleTimings) {
    let mut timings = CycleTimings::default();

    let Some(guard) = slot.try_claim() else {
        return (CycleOutcome::Failed(CycleFailure::StillRunning), timings);
    };
    let capture_start = Instant::now();
    let provider = Arc::clone(capture);
    let captured = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            provider.capture()
        }),
    )
    .await;
    timings.capture_ms = capture_start.elapsed().as_millis() as u64;

    let frame = match captured {
        Ok(Ok(Ok(frame))) => frame,
        Ok(Ok(Err(err))) => {
            return (
                CycleOutcome::Failed(CycleFailure::CaptureFailed(format!("{err:#}"))),
                timings,
            )
        }
        Ok(Err(join_err)) => {
            return (
                CycleOutcome::Failed(CycleFailure::WorkerJoin(join_err.to_string())),
                timings,
            )
        }
        Err(_) => return (CycleOutcome::Failed(CycleFailure::CaptureTimedOut(timeout)), timings),
    };
    timings.frame_width = Some(frame.width());
    timings.frame_height = Some(frame.height());

    let Some(guard) = slot.try_claim() else {
        return (CycleOutcome::Failed(CycleFailure::StillRunning), timings);
    };
    let detect_start = Instant::now();
    let detector = Arc::clone(detector);
    let detected = tokio::time::timeout(
        timeout,
        tokio::task::spawn_blocking(move || {
            let _guard = guard;
            detector.detect(&frame)
        }),
    )
    .await;
    timings.detect_ms = detect_start.elapsed().as_millis() as u64;

    let outcome = match detected {
        Ok(Ok(Ok(detection))) => CycleOutcome::Classified(detection),
        Ok(Ok(Err(err))) => CycleOutcome::Failed(CycleFailure::DetectionFailed(format!("{err:#}"))),
        Ok(Err(join_err)) => CycleOutcome::Failed(CycleFailure::WorkerJoin(join_err.to_string())),
        Err(_) => CycleOutcome::Failed(CycleFailure::DetectionTimedOut(timeout)),
    };
    (outcome, timings)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::detection::{AgentState, DetectionMethod, Frame};
    use anyhow::{anyhow, Result};
    use chrono::Utc;
    use image::GrayImage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Capture that fails for scripted calls and otherwise returns a blank frame.
    #[derive(Default)]
    pub(crate) struct ScriptedCapture {
        pub(crate) failures: Mutex<Vec<bool>>,
        pub(crate) delay: Option<Duration>,
        pub(crate) calls: AtomicUsize,
    }

    impl CaptureProvider for ScriptedCapture {
        fn capture(&self) -> Result<Frame> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            let fail = {
                let mut failures = self.failures.lock().unwrap();
                if failures.is_empty() {
                    false
                } else {
                    failures.remove(0)
                }
            };
            if fail {
                Err(anyhow!("display asleep"))
            } else {
                Ok(Frame::new(GrayImage::new(64, 48), Utc::now()))
            }
        }
    }

    /// Detector that replays a fixed list of raw states, then `Unknown`.
    #[derive(Default)]
    pub(crate) struct ScriptedDetector {
        pub(crate) states: Mutex<Vec<AgentState>>,
    }

    impl ScriptedDetector {
        pub(crate) fn new(states: &[AgentState]) -> Self {
            Self {
                states: Mutex::new(states.to_vec()),
            }
        }
    }

    impl StateDetector for ScriptedDetector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn detect(&self, _frame: &Frame) -> Result<Detection> {
            let mut states = self.states.lock().unwrap();
            let state = if states.is_empty() {
                AgentState::Unknown
            } else {
                states.remove(0)
            };
            Ok(Detection {
                state,
                confidence: (state != AgentState::Unknown).then_some(0.9),
                ..Detection::unknown(DetectionMethod::Template)
            })
        }
    }

    #[tokio::test]
    async fn classified_cycle_reports_frame_size() {
        let capture: Arc<dyn CaptureProvider> = Arc::new(ScriptedCapture::default());
        let detector: Arc<dyn StateDetector> =
            Arc::new(ScriptedDetector::new(&[AgentState::Active]));

        let (outcome, timings) = run_cycle(
            &capture,
            &detector,
            &BlockingSlot::default(),
            Duration::from_secs(5),
        )
        .await;

        match outcome {
            CycleOutcome::Classified(d) => assert_eq!(d.state, AgentState::Active),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(timings.frame_width, Some(64));
        assert_eq!(timings.frame_height, Some(48));
    }

    #[tokio::test]
    async fn capture_error_is_a_typed_failure() {
        let capture: Arc<dyn CaptureProvider> = Arc::new(ScriptedCapture {
            failures: Mutex::new(vec![true]),
            ..ScriptedCapture::default()
        });
        let detector: Arc<dyn StateDetector> = Arc::new(ScriptedDetector::default());

        let (outcome, _) = run_cycle(
            &capture,
            &detector,
            &BlockingSlot::default(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::CaptureFailed(msg)) if msg.contains("display asleep")
        ));
    }

    #[tokio::test]
    async fn slow_capture_times_out() {
        let capture: Arc<dyn CaptureProvider> = Arc::new(ScriptedCapture {
            delay: Some(Duration::from_millis(500)),
            ..ScriptedCapture::default()
        });
        let detector: Arc<dyn StateDetector> = Arc::new(ScriptedDetector::default());

        let (outcome, _) = run_cycle(
            &capture,
            &detector,
            &BlockingSlot::default(),
            Duration::from_millis(50),
        )
        .await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::CaptureTimedOut(_))
        ));
    }

    #[tokio::test]
    async fn timed_out_capture_blocks_the_next_cycle_until_it_returns() {
        let scripted = Arc::new(ScriptedCapture {
            delay: Some(Duration::from_millis(300)),
            ..ScriptedCapture::default()
        });
        let capture: Arc<dyn CaptureProvider> = scripted.clone();
        let detector: Arc<dyn StateDetector> =
            Arc::new(ScriptedDetector::new(&[AgentState::Idle]));
        let slot = BlockingSlot::default();

        let (outcome, _) = run_cycle(&capture, &detector, &slot, Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::CaptureTimedOut(_))
        ));
        assert!(slot.is_busy());

        let (outcome, _) = run_cycle(&capture, &detector, &slot, Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::StillRunning)
        ));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!slot.is_busy());
        let (outcome, _) = run_cycle(&capture, &detector, &slot, Duration::from_secs(2)).await;
        assert!(matches!(outcome, CycleOutcome::Classified(_)));
        assert_eq!(scripted.calls.load(Ordering::SeqCst), 2);
    }

    struct SlowDetector(Duration);

    impl StateDetector for SlowDetector {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn detect(&self, _frame: &Frame) -> Result<Detection> {
            std::thread::sleep(self.0);
            Ok(Detection::unknown(DetectionMethod::Template))
        }
    }

    #[tokio::test]
    async fn slow_detection_times_out_and_holds_the_slot() {
        let capture: Arc<dyn CaptureProvider> = Arc::new(ScriptedCapture::default());
        let detector: Arc<dyn StateDetector> =
            Arc::new(SlowDetector(Duration::from_millis(300)));
        let slot = BlockingSlot::default();

        let (outcome, _) = run_cycle(&capture, &detector, &slot, Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::DetectionTimedOut(_))
        ));

        let (outcome, _) = run_cycle(&capture, &detector, &slot, Duration::from_millis(50)).await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::StillRunning)
        ));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!slot.is_busy());
    }

    struct FailingDetector;

    impl StateDetector for FailingDetector {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn detect(&self, _frame: &Frame) -> Result<Detection> {
            Err(anyhow!("reference set corrupted"))
        }
    }

    #[tokio::test]
    async fn detector_error_is_a_typed_failure() {
        let capture: Arc<dyn CaptureProvider> = Arc::new(ScriptedCapture::default());
        let detector: Arc<dyn StateDetector> = Arc::new(FailingDetector);

        let (outcome, _) = run_cycle(
            &capture,
            &detector,
            &BlockingSlot::default(),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(CycleFailure::DetectionFailed(_))
        ));
    }
}
