use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::warn;

use crate::audio::AlertKind;
use crate::detection::Detection;

use super::state_machine::Effect;
use super::telemetry::Telemetry;

/// Delivers a user-facing notification (desktop banner, log line, ...).
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str) -> Result<()>;
}

pub trait SoundPlayer: Send + Sync {
    fn play(&self, kind: AlertKind) -> Result<()>;
}

/// What an effect may need beyond the effect itself.
pub struct EffectContext<'a> {
    pub session_id: &'a str,
    pub muted: bool,
    /// Detection that produced the current step.
    pub detection: Option<&'a Detection>,
}

/// Carries out state-machine effects. Every effect is best effort: a failing
/// notifier, speaker or database never stops the cycle.
#[derive(Clone)]
pub struct EffectRunner {
    notifier: Arc<dyn Notifier>,
    sounds: Arc<dyn SoundPlayer>,
    telemetry: Telemetry,
}

impl EffectRunner {
    pub fn new(notifier: Arc<dyn Notifier>, sounds: Arc<dyn SoundPlayer>, telemetry: Telemetry) -> Self {
        Self {
            notifier,
            sounds,
            telemetry,
        }
    }

    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    pub async fn run(&self, effects: &[Effect], ctx: &EffectContext<'_>) {
        for effect in effects {
            match effect {
                Effect::Notify { title, message } => {
                    if let Err(err) = self.notifier.notify(title, message) {
                        warn!("Notification failed: {err:#}");
                    }
                }
                Effect::Sound(kind) => self.play(*kind, ctx.muted),
                Effect::Telemetry(transition) => {
                    self.telemetry
                        .record_transition(ctx.session_id, transition, ctx.detection)
                        .await;
                }
            }
        }
    }

    /// Plays `kind` unless muted.
    pub fn play(&self, kind: AlertKind, muted: bool) {
        if muted {
            return;
        }
        if let Err(err) = self.sounds.play(kind) {
            warn!("Failed to play {} sound: {err:#}", kind.as_str());
        }
    }
}

/// Upper bound for one telemetry write before it is abandoned.
pub(crate) const TELEMETRY_TIMEOUT: Duration = Duration::from_secs(2);
