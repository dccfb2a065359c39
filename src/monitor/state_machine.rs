//! Confirmed-state tracking with cooldowns and repeat alerts.
//!
//! The machine is pure: every call returns the transition (if any) and the
//! side effects the caller should carry out. Nothing here performs I/O.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::audio::AlertKind;
use crate::detection::AgentState;
use crate::settings::MonitorSettings;

const NOTIFICATION_TITLE: &str = "Agent Watcher";

#[derive(Debug, Clone, PartialEq)]
pub struct StateMachineConfig {
    pub min_state_change_interval: Duration,
    pub min_notification_interval: Duration,
    pub repeat_idle: Option<Duration>,
    pub repeat_run_command: Option<Duration>,
}

impl StateMachineConfig {
    pub fn from_settings(settings: &MonitorSettings) -> Self {
        Self {
            min_state_change_interval: settings.min_state_change_interval(),
            min_notification_interval: settings.min_notification_interval(),
            repeat_idle: settings.alert_repeat_interval(AgentState::Idle),
            repeat_run_command: settings.alert_repeat_interval(AgentState::RunCommand),
        }
    }

    fn repeat_interval(&self, state: AgentState) -> Option<Duration> {
        match state {
            AgentState::Idle => self.repeat_idle,
            AgentState::RunCommand => self.repeat_run_command,
            AgentState::Active | AgentState::Unknown => None,
        }
    }
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self::from_settings(&MonitorSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Notify { title: String, message: String },
    Sound(AlertKind),
    /// Persist the accepted transition.
    Telemetry(StateTransition),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Step {
    pub transition: Option<StateTransition>,
    pub effects: Vec<Effect>,
    /// A differing stable state arrived inside the change cooldown.
    pub suppressed: bool,
    pub repeat_alert: bool,
}

#[derive(Debug, Clone)]
pub struct StateMachine {
    config: StateMachineConfig,
    current: AgentState,
    displayed: AgentState,
    entered_at: DateTime<Utc>,
    last_transition_at: Option<DateTime<Utc>>,
    last_alert_at: Option<DateTime<Utc>>,
    last_notification: Option<(AgentState, DateTime<Utc>)>,
}

impl StateMachine {
    pub fn new(config: StateMachineConfig, started_at: DateTime<Utc>) -> Self {
        Self {
            config,
            current: AgentState::Unknown,
            displayed: AgentState::Unknown,
            entered_at: started_at,
            last_transition_at: None,
            last_alert_at: None,
            last_notification: None,
        }
    }

    pub fn current(&self) -> AgentState {
        self.current
    }

    /// Latest stable classification, `Unknown` included.
    pub fn displayed(&self) -> AgentState {
        self.displayed
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn time_in_state(&self, now: DateTime<Utc>) -> Duration {
        (now - self.entered_at).max(Duration::zero())
    }

    /// Feeds one cycle's stability result. `None` means nothing was confirmed
    /// this cycle; the repeat-alert check still runs.
    pub fn observe(&mut self, stable: Option<AgentState>, now: DateTime<Utc>) -> Step {
        match stable {
            Some(AgentState::Unknown) => {
                self.displayed = AgentState::Unknown;
                Step::default()
            }
            Some(state) if state != self.current => {
                let step = self.transition_to(state, now);
                if !step.suppressed {
                    self.displayed = state;
                }
                step
            }
            Some(state) => {
                self.displayed = state;
                self.check_repeat(now)
            }
            None => self.check_repeat(now),
        }
    }

    fn transition_to(&mut self, to: AgentState, now: DateTime<Utc>) -> Step {
        if let Some(last) = self.last_transition_at {
            if now - last < self.config.min_state_change_interval {
                return Step {
                    suppressed: true,
                    ..Step::default()
                };
            }
        }

        let transition = StateTransition {
            from: self.current,
            to,
            occurred_at: now,
        };
        self.current = to;
        self.entered_at = now;
        self.last_transition_at = Some(now);
        self.last_alert_at = None;

        let mut effects = vec![Effect::Telemetry(transition)];
        if to.is_alerting() {
            self.last_alert_at = Some(now);
            self.last_notification = Some((to, now));
            effects.push(notify(arrival_message(to)));
            effects.push(Effect::Sound(alert_sound(to)));
        }

        Step {
            transition: Some(transition),
            effects,
            ..Step::default()
        }
    }

    fn check_repeat(&mut self, now: DateTime<Utc>) -> Step {
        let state = self.current;
        let (Some(interval), Some(last_alert)) =
            (self.config.repeat_interval(state), self.last_alert_at)
        else {
            return Step::default();
        };
        if now - last_alert < interval {
            return Step::default();
        }

        self.last_alert_at = Some(now);
        let message = repeat_message(state, self.time_in_state(now));
        let mut effects = Vec::new();
        if self.may_repeat_notification(state, now) {
            self.last_notification = Some((state, now));
            effects.push(notify(message));
        }
        effects.push(Effect::Sound(alert_sound(state)));

        Step {
            effects,
            repeat_alert: true,
            ..Step::default()
        }
    }

    /// Repeat notifications for an unchanged state stay one notification
    /// interval apart. Transitions always notify.
    fn may_repeat_notification(&self, state: AgentState, now: DateTime<Utc>) -> bool {
        match self.last_notification {
            Some((last_state, at)) => {
                last_state != state || now - at >= self.config.min_notification_interval
            }
            None => true,
        }
    }
}

fn notify(message: String) -> Effect {
    Effect::Notify {
        title: NOTIFICATION_TITLE.to_string(),
        message,
    }
}

fn alert_sound(state: AgentState) -> AlertKind {
    match state {
        AgentState::RunCommand => AlertKind::Warning,
        _ => AlertKind::Waiting,
    }
}

fn arrival_message(state: AgentState) -> String {
    match state {
        AgentState::RunCommand => "Agent wants to run a command, approval needed".to_string(),
        _ => "Agent idle, input may be needed".to_string(),
    }
}

fn repeat_message(state: AgentState, waited: Duration) -> String {
    let waited = format_wait(waited);
    match state {
        AgentState::RunCommand => format!("Command still awaiting approval ({waited})"),
        _ => format!("Agent still idle ({waited})"),
    }
}

pub fn format_wait(waited: Duration) -> String {
    let secs = waited.num_seconds().max(0);
    if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap() + Duration::seconds(secs)
    }

    fn config() -> StateMachineConfig {
        StateMachineConfig {
            min_state_change_interval: Duration::seconds(3),
            min_notification_interval: Duration::seconds(30),
            repeat_idle: Some(Duration::seconds(60)),
            repeat_run_command: Some(Duration::seconds(60)),
        }
    }

    fn notifications(step: &Step) -> usize {
        step.effects
            .iter()
            .filter(|e| matches!(e, Effect::Notify { .. }))
            .count()
    }

    #[test]
    fn idle_transition_notifies_sounds_and_records() {
        let mut machine = StateMachine::new(config(), t(0));
        let step = machine.observe(Some(AgentState::Idle), t(4));

        let transition = step.transition.unwrap();
        assert_eq!(transition.from, AgentState::Unknown);
        assert_eq!(transition.to, AgentState::Idle);
        assert_eq!(step.effects.len(), 3);
        assert!(step.effects.contains(&Effect::Telemetry(transition)));
        assert!(step.effects.contains(&Effect::Sound(AlertKind::Waiting)));
        assert_eq!(notifications(&step), 1);
    }

    #[test]
    fn active_transition_only_records() {
        let mut machine = StateMachine::new(config(), t(0));
        let step = machine.observe(Some(AgentState::Active), t(1));
        assert_eq!(step.effects.len(), 1);
        assert!(matches!(step.effects[0], Effect::Telemetry(_)));
    }

    #[test]
    fn run_command_uses_warning_sound() {
        let mut machine = StateMachine::new(config(), t(0));
        let step = machine.observe(Some(AgentState::RunCommand), t(1));
        assert!(step.effects.contains(&Effect::Sound(AlertKind::Warning)));
    }

    #[test]
    fn same_state_is_not_a_transition() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Active), t(1));
        let step = machine.observe(Some(AgentState::Active), t(10));
        assert_eq!(step, Step::default());
    }

    #[test]
    fn cooldown_limits_transitions() {
        let mut machine = StateMachine::new(config(), t(0));
        let mut transitions = Vec::new();
        // a new stable state every second, alternating
        for i in 0..30 {
            let state = if i % 2 == 0 {
                AgentState::Idle
            } else {
                AgentState::Active
            };
            if let Some(tr) = machine.observe(Some(state), t(i)).transition {
                transitions.push(tr.occurred_at);
            }
        }

        assert!(!transitions.is_empty());
        for pair in transitions.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::seconds(3));
        }
    }

    #[test]
    fn suppressed_change_is_reported() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Active), t(1));
        let step = machine.observe(Some(AgentState::Idle), t(2));
        assert!(step.suppressed);
        assert!(step.transition.is_none());
        assert_eq!(machine.current(), AgentState::Active);
        assert_eq!(machine.displayed(), AgentState::Active);

        // once the cooldown has passed the same classification is accepted
        let step = machine.observe(Some(AgentState::Idle), t(5));
        assert!(step.transition.is_some());
        assert_eq!(machine.displayed(), AgentState::Idle);
    }

    #[test]
    fn unknown_is_display_only() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Idle), t(1));
        let step = machine.observe(Some(AgentState::Unknown), t(10));

        assert_eq!(step, Step::default());
        assert_eq!(machine.current(), AgentState::Idle);
        assert_eq!(machine.displayed(), AgentState::Unknown);
        assert_eq!(machine.entered_at(), t(1));
    }

    #[test]
    fn repeat_alert_while_waiting() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Idle), t(0));

        assert!(!machine.observe(Some(AgentState::Idle), t(59)).repeat_alert);
        let step = machine.observe(None, t(61));
        assert!(step.repeat_alert);
        assert!(step.transition.is_none());
        assert!(step.effects.contains(&Effect::Sound(AlertKind::Waiting)));
        match &step.effects[0] {
            Effect::Notify { message, .. } => assert!(message.contains("1m 1s")),
            other => panic!("expected notification, got {other:?}"),
        }

        // the next repeat counts from the last alert
        assert!(!machine.observe(Some(AgentState::Idle), t(100)).repeat_alert);
        assert!(machine.observe(Some(AgentState::Idle), t(121)).repeat_alert);
    }

    #[test]
    fn repeat_survives_unknown_frames() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::RunCommand), t(0));
        machine.observe(Some(AgentState::Unknown), t(30));
        assert!(machine.observe(None, t(60)).repeat_alert);
    }

    #[test]
    fn quick_return_to_idle_notifies_again() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Idle), t(0));
        machine.observe(Some(AgentState::Active), t(5));
        let step = machine.observe(Some(AgentState::Idle), t(10));

        let transition = step.transition.unwrap();
        assert_eq!(transition.from, AgentState::Active);
        assert_eq!(transition.to, AgentState::Idle);
        assert_eq!(notifications(&step), 1);
        assert!(step.effects.contains(&Effect::Sound(AlertKind::Waiting)));
        assert!(step.effects.contains(&Effect::Telemetry(transition)));
    }

    #[test]
    fn repeat_notification_respects_notification_interval() {
        let config = StateMachineConfig {
            repeat_idle: Some(Duration::seconds(10)),
            ..config()
        };
        let mut machine = StateMachine::new(config, t(0));
        machine.observe(Some(AgentState::Idle), t(0));

        // repeat due after 10s, but the last notification is under 30s old
        let step = machine.observe(None, t(10));
        assert!(step.repeat_alert);
        assert_eq!(notifications(&step), 0);
        assert!(step.effects.contains(&Effect::Sound(AlertKind::Waiting)));

        let step = machine.observe(None, t(30));
        assert!(step.repeat_alert);
        assert_eq!(notifications(&step), 1);
    }

    #[test]
    fn active_never_repeats() {
        let mut machine = StateMachine::new(config(), t(0));
        machine.observe(Some(AgentState::Active), t(0));
        assert!(!machine.observe(None, t(600)).repeat_alert);
    }
}
