use rodio::Source;
use std::f32::consts::TAU;
use std::time::Duration;

use super::AlertKind;

const SAMPLE_RATE: u32 = 44_100;
/// Fade in/out per note, in seconds, to avoid clicks between tones.
const RAMP_SECS: f32 = 0.02;
const MASTER_GAIN: f32 = 0.35;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Note {
    freq: f32,
    secs: f32,
    amp: f32,
}

const fn note(freq: f32, secs: f32, amp: f32) -> Note {
    Note { freq, secs, amp }
}

// G4 x3, fading
const WAITING: &[Note] = &[
    note(392.0, 0.2, 0.7),
    note(392.0, 0.2, 0.5),
    note(392.0, 0.2, 0.3),
];
// G4 E4 G4 E4
const WARNING: &[Note] = &[
    note(392.0, 0.2, 1.0),
    note(330.0, 0.2, 0.8),
    note(392.0, 0.2, 1.0),
    note(330.0, 0.2, 0.8),
];
// G4 B4 D5
const SUCCESS: &[Note] = &[
    note(392.0, 0.2, 0.7),
    note(494.0, 0.2, 0.8),
    note(587.0, 0.5, 1.0),
];
// A#4 Ab4
const ERROR: &[Note] = &[note(466.0, 0.3, 1.0), note(415.0, 0.4, 0.7)];

fn pattern(kind: AlertKind) -> &'static [Note] {
    match kind {
        AlertKind::Waiting => WAITING,
        AlertKind::Warning => WARNING,
        AlertKind::Success => SUCCESS,
        AlertKind::Error => ERROR,
    }
}

/// Finite mono tone sequence for one alert.
pub struct Chime {
    notes: &'static [Note],
    note_index: usize,
    sample_in_note: u32,
    phase: f32,
}

impl Chime {
    pub fn new(kind: AlertKind) -> Self {
        Self {
            notes: pattern(kind),
            note_index: 0,
            sample_in_note: 0,
            phase: 0.0,
        }
    }

    fn note_samples(note: &Note) -> u32 {
        (note.secs * SAMPLE_RATE as f32) as u32
    }

    fn envelope(position: u32, total: u32) -> f32 {
        let ramp = (RAMP_SECS * SAMPLE_RATE as f32) as u32;
        if ramp == 0 || total == 0 {
            return 1.0;
        }
        let from_end = total.saturating_sub(position);
        let attack = (position as f32 / ramp as f32).min(1.0);
        let release = (from_end as f32 / ramp as f32).min(1.0);
        attack.min(release)
    }
}

impl Iterator for Chime {
    type Item = f32;

    fn next(&mut self) -> Option<Self::Item> {
        let note = *self.notes.get(self.note_index)?;
        let total = Self::note_samples(&note);

        let sample =
            self.phase.sin() * note.amp * MASTER_GAIN * Self::envelope(self.sample_in_note, total);

        self.phase += TAU * note.freq / SAMPLE_RATE as f32;
        if self.phase > TAU {
            self.phase -= TAU;
        }

        self.sample_in_note += 1;
        if self.sample_in_note >= total {
            self.note_index += 1;
            self.sample_in_note = 0;
            self.phase = 0.0;
        }

        Some(sample)
    }
}

impl Source for Chime {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        1
    }

    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn total_duration(&self) -> Option<Duration> {
        let secs: f32 = self.notes.iter().map(|n| n.secs).sum();
        Some(Duration::from_secs_f32(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chime_is_finite_and_bounded() {
        for kind in [
            AlertKind::Waiting,
            AlertKind::Warning,
            AlertKind::Success,
            AlertKind::Error,
        ] {
            let expected: u32 = pattern(kind).iter().map(Chime::note_samples).sum();
            let samples: Vec<f32> = Chime::new(kind).collect();
            assert_eq!(samples.len() as u32, expected);
            assert!(samples.iter().all(|s| s.abs() <= MASTER_GAIN + 1e-6));
        }
    }

    #[test]
    fn notes_start_silent() {
        let first = Chime::new(AlertKind::Success).next().unwrap();
        assert_eq!(first, 0.0);
    }
}
