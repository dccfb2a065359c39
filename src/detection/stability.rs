use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

use super::types::AgentState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionHistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub state: AgentState,
}

/// Confirms a raw classification only once the `required` most recent entries
/// inside the trailing window all agree.
///
/// A single dissenting entry among the last `required` resets progress.
#[derive(Debug)]
pub struct StabilityFilter {
    required: usize,
    window: Duration,
    history: VecDeque<DetectionHistoryEntry>,
}

impl StabilityFilter {
    pub fn new(required: usize, window: Duration) -> Self {
        Self {
            required: required.max(1),
            window,
            history: VecDeque::new(),
        }
    }

    pub fn required(&self) -> usize {
        self.required
    }

    /// Records one raw classification and returns the stable state, if any.
    pub fn observe(&mut self, state: AgentState, at: DateTime<Utc>) -> Option<AgentState> {
        self.history.push_back(DetectionHistoryEntry {
            timestamp: at,
            state,
        });
        self.evict(at);

        if self.history.len() < self.required {
            return None;
        }

        let mut recent = self.history.iter().rev().take(self.required);
        let first = recent.next()?.state;
        recent.all(|entry| entry.state == first).then_some(first)
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn history(&self) -> impl Iterator<Item = &DetectionHistoryEntry> {
        self.history.iter()
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.window;
        while self
            .history
            .front()
            .is_some_and(|entry| entry.timestamp < cutoff)
        {
            self.history.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn confirms_only_after_consecutive_agreement() {
        let mut filter = StabilityFilter::new(2, Duration::seconds(10));
        let raw = [
            AgentState::Idle,
            AgentState::Active,
            AgentState::Idle,
            AgentState::Idle,
        ];
        let results: Vec<_> = raw
            .iter()
            .enumerate()
            .map(|(i, state)| filter.observe(*state, t(i as i64 * 2)))
            .collect();

        assert_eq!(results, vec![None, None, None, Some(AgentState::Idle)]);
    }

    #[test]
    fn stale_entries_do_not_count() {
        let mut filter = StabilityFilter::new(2, Duration::seconds(10));
        assert_eq!(filter.observe(AgentState::Active, t(0)), None);
        // the first entry has left the window by now
        assert_eq!(filter.observe(AgentState::Active, t(11)), None);
        assert_eq!(filter.history().count(), 1);
        assert_eq!(
            filter.observe(AgentState::Active, t(13)),
            Some(AgentState::Active)
        );
    }

    #[test]
    fn keeps_confirming_while_run_continues() {
        let mut filter = StabilityFilter::new(3, Duration::seconds(30));
        let mut confirmed = Vec::new();
        for i in 0..5 {
            confirmed.push(filter.observe(AgentState::RunCommand, t(i)));
        }
        assert_eq!(confirmed[..2], [None, None]);
        assert!(confirmed[2..]
            .iter()
            .all(|c| *c == Some(AgentState::RunCommand)));
    }

    #[test]
    fn alternating_input_never_confirms() {
        let mut filter = StabilityFilter::new(2, Duration::seconds(10));
        for i in 0..20 {
            let state = if i % 2 == 0 {
                AgentState::Idle
            } else {
                AgentState::Active
            };
            assert_eq!(filter.observe(state, t(i)), None);
        }
    }

    #[test]
    fn unknown_can_be_confirmed_by_repetition() {
        let mut filter = StabilityFilter::new(2, Duration::seconds(10));
        filter.observe(AgentState::Unknown, t(0));
        assert_eq!(
            filter.observe(AgentState::Unknown, t(1)),
            Some(AgentState::Unknown)
        );
        filter.reset();
        assert_eq!(filter.history().count(), 0);
    }
}
