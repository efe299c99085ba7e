//! Emitted event model (spec §3): the output of the compile pipeline.
//!
//! An [`Event`] carries absolute timing (`start_seconds`, optional
//! `duration_seconds`), an optional MIDI-style channel, the `input_order` it
//! was produced in (used to break exact-time ties deterministically), and a
//! kind-specific [`EventPayload`].

use crate::tree::AftertouchTarget;
use serde::{Deserialize, Serialize};

/// Kind-specific event data. The emitter (C7) is a total function over
/// op kinds producing exactly one of these per op (plus the tie coalescer's
/// merges, which still produce a single `Note` payload).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    Note {
        pitch: i32,
        /// 0-127, rounded from `velocity * 127`.
        velocity: u8,
        articulation: Option<String>,
        detune_cents: Option<f32>,
    },
    Control {
        controller: u32,
        value: f32,
    },
    PitchBend {
        normalized: f32,
    },
    Aftertouch {
        target: AftertouchTarget,
        value: f32,
    },
    Automation {
        target: String,
        value: f32,
        ramp_seconds: Option<f64>,
    },
    Tempo {
        bpm: f64,
        transition_seconds: Option<f64>,
    },
    Articulation {
        name: String,
    },
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            EventPayload::Note { .. } => "note",
            EventPayload::Control { .. } => "control",
            EventPayload::PitchBend { .. } => "pitch_bend",
            EventPayload::Aftertouch { .. } => "aftertouch",
            EventPayload::Automation { .. } => "automation",
            EventPayload::Tempo { .. } => "tempo",
            EventPayload::Articulation { .. } => "articulation",
        }
    }
}

/// A single timed, typed event, the unit the emitter produces and the
/// scheduler consumes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub start_seconds: f64,
    pub duration_seconds: Option<f64>,
    pub channel: Option<u8>,
    /// Monotonic production order, used to break `start_seconds` ties.
    pub input_order: u64,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        self.payload.kind()
    }

    /// Sort key used everywhere events need a total order: spec invariant
    /// "after the emitter, events are sorted by (startSeconds, inputOrder)".
    pub fn sort_key(&self) -> (OrderedSeconds, u64) {
        (OrderedSeconds(self.start_seconds), self.input_order)
    }
}

/// `f64` wrapper with a total order for sorting event streams. Event
/// timestamps are always finite (validated at the tempo-integration layer),
/// so this never hits the NaN case in practice; it still defines one so a
/// `sort_by_key` never panics on a stray NaN from upstream data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OrderedSeconds(pub f64);

impl Eq for OrderedSeconds {}

impl PartialOrd for OrderedSeconds {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedSeconds {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.partial_cmp(&other.0).unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// Sort a batch of events in place by the spec's canonical order.
pub fn sort_events(events: &mut [Event]) {
    events.sort_by_key(|e| e.sort_key());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(start: f64, order: u64) -> Event {
        Event {
            start_seconds: start,
            duration_seconds: None,
            channel: None,
            input_order: order,
            payload: EventPayload::Articulation { name: "x".into() },
        }
    }

    #[test]
    fn sorts_by_time_then_input_order() {
        let mut events = vec![ev(1.0, 2), ev(1.0, 1), ev(0.5, 5)];
        sort_events(&mut events);
        assert_eq!(events[0].input_order, 5);
        assert_eq!(events[1].input_order, 1);
        assert_eq!(events[2].input_order, 2);
    }
}
