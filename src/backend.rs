//! The scheduler's port to whatever actually makes sound (spec §4.8).
//!
//! The scheduler (C10) never talks to MIDI, OSC, or an audio device
//! directly, it calls through this trait, so the same scheduling logic
//! runs identically against a real synth engine or a test double.

use crate::events::Event;

/// Signalled once a backend has finished whatever setup it needs (opening a
/// device, connecting a socket) before the scheduler starts feeding it
/// events.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Ready {
    pub sample_rate: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("backend not ready: {0}")]
    NotReady(String),
    #[error("backend rejected event: {0}")]
    Rejected(String),
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// The port the scheduler drives. `schedule`/`cancel_after`/`set_tempo` are
/// called from the scheduling tick; `current_time`/`init` bracket a run.
pub trait Backend {
    fn init(&mut self) -> BackendResult<Ready>;

    /// Hand one event to the backend for playback at `audio_time` seconds
    /// on the backend's own clock.
    fn schedule(&mut self, event: &Event, audio_time: f64) -> BackendResult<()>;

    /// Cancel every still-pending event at or after `beat` for `track_id`
    /// (or every track, if `None`).
    fn cancel_after(&mut self, beat: f64, track_id: Option<&str>) -> BackendResult<()>;

    fn cancel_all(&mut self) -> BackendResult<()>;

    /// The backend's current transport time, in seconds, used to compute
    /// the beat<->time base per spec §4.8.
    fn current_time(&self) -> f64;

    fn set_tempo(&mut self, bpm: f64) -> BackendResult<()>;

    /// Release whatever resources `init` acquired. Default no-op: most test
    /// doubles and in-process backends have nothing to release.
    fn dispose(&mut self) -> BackendResult<()> {
        Ok(())
    }
}

/// An in-memory backend for tests and for driving the scheduler without a
/// real synth attached: records every call it receives instead of acting on
/// it, and tracks "current time" as whatever the test last told it to be.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    pub scheduled: Vec<(f64, Event)>,
    pub cancellations: Vec<(f64, Option<String>)>,
    pub cancel_all_count: u32,
    pub tempo_changes: Vec<f64>,
    pub now: f64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the backend's clock, as a test driving the scheduler would.
    pub fn advance_to(&mut self, time: f64) {
        self.now = time;
    }
}

impl Backend for RecordingBackend {
    fn init(&mut self) -> BackendResult<Ready> {
        Ok(Ready { sample_rate: None })
    }

    fn schedule(&mut self, event: &Event, audio_time: f64) -> BackendResult<()> {
        self.scheduled.push((audio_time, event.clone()));
        Ok(())
    }

    fn cancel_after(&mut self, beat: f64, track_id: Option<&str>) -> BackendResult<()> {
        self.cancellations.push((beat, track_id.map(str::to_string)));
        Ok(())
    }

    fn cancel_all(&mut self) -> BackendResult<()> {
        self.cancel_all_count += 1;
        self.scheduled.clear();
        Ok(())
    }

    fn current_time(&self) -> f64 {
        self.now
    }

    fn set_tempo(&mut self, bpm: f64) -> BackendResult<()> {
        self.tempo_changes.push(bpm);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventPayload;

    fn ev() -> Event {
        Event {
            start_seconds: 0.0,
            duration_seconds: None,
            channel: None,
            input_order: 0,
            payload: EventPayload::Control { controller: 1, value: 0.5 },
        }
    }

    #[test]
    fn recording_backend_tracks_calls() {
        let mut backend = RecordingBackend::new();
        backend.init().unwrap();
        backend.schedule(&ev(), 1.5).unwrap();
        backend.set_tempo(128.0).unwrap();
        backend.cancel_after(4.0, Some("lead")).unwrap();
        assert_eq!(backend.scheduled.len(), 1);
        assert_eq!(backend.tempo_changes, vec![128.0]);
        assert_eq!(backend.cancellations, vec![(4.0, Some("lead".to_string()))]);
    }

    #[test]
    fn cancel_all_clears_scheduled() {
        let mut backend = RecordingBackend::new();
        backend.schedule(&ev(), 0.0).unwrap();
        backend.cancel_all().unwrap();
        assert!(backend.scheduled.is_empty());
        assert_eq!(backend.cancel_all_count, 1);
    }
}
