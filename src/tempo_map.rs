//! Piecewise BPM function built from `Tempo` ops (spec component C6).
//!
//! A [`TempoMap`] is a list of contiguous segments, each either a constant
//! tempo or a curved ramp between two tempos. `beat_to_seconds` integrates
//! forward from the containing segment's start using a precomputed
//! cumulative-seconds table, so a query never re-integrates from beat zero.

use crate::duration::{self, IntegrationPrecision, TempoCurve};
use crate::errors::{CompileError, CompileResult};
use crate::expander::ExpandedKind;
use crate::timer::TimedItem;
use crate::tree::{Curve, Operation};

#[derive(Clone, Copy, Debug, PartialEq)]
struct Segment {
    start_beat: f64,
    end_beat: f64,
    start_bpm: f64,
    end_bpm: f64,
    curve: Option<TempoCurve>,
    /// Cumulative elapsed seconds at `start_beat`.
    cumulative_seconds: f64,
}

impl Segment {
    fn is_constant(&self) -> bool {
        self.curve.is_none()
    }
}

/// A piecewise BPM function, queryable for `bpm_at`, `beat_to_seconds`, and
/// `duration_to_seconds`.
#[derive(Clone, Debug)]
pub struct TempoMap {
    segments: Vec<Segment>,
    precision: IntegrationPrecision,
    total_seconds: f64,
}

const OPEN_END: f64 = f64::INFINITY;

struct Builder {
    clip: String,
    segments: Vec<Segment>,
    current_bpm: f64,
    precision: IntegrationPrecision,
    /// One entry per open `Scope`/`Transpose` nesting level. `Some(bpm)` when
    /// the scope isolates tempo: the bpm to restore (and ramp to cut off to)
    /// on exit.
    tempo_save_stack: Vec<Option<f64>>,
}

impl Builder {
    fn close_open_segment(&mut self, at_beat: f64) {
        if let Some(last) = self.segments.last_mut() {
            if last.end_beat == OPEN_END {
                last.end_beat = at_beat.max(last.start_beat);
            }
        }
    }

    fn push_constant_from(&mut self, start_beat: f64, bpm: f64) {
        self.close_open_segment(start_beat);
        let cumulative = self.cumulative_at(start_beat);
        self.segments.push(Segment {
            start_beat,
            end_beat: OPEN_END,
            start_bpm: bpm,
            end_bpm: bpm,
            curve: None,
            cumulative_seconds: cumulative,
        });
        self.current_bpm = bpm;
    }

    fn push_ramp(
        &mut self,
        start_beat: f64,
        start_bpm: f64,
        end_bpm: f64,
        duration_beats: f64,
        curve: TempoCurve,
    ) -> CompileResult<()> {
        self.close_open_segment(start_beat);
        let cumulative = self.cumulative_at(start_beat);
        let end_beat = start_beat + duration_beats.max(0.0);
        self.segments.push(Segment {
            start_beat,
            end_beat,
            start_bpm,
            end_bpm,
            curve: Some(curve),
            cumulative_seconds: cumulative,
        });
        self.current_bpm = end_bpm;
        // Integration is validated eagerly so a malformed ramp fails at
        // build time rather than at an arbitrary later query.
        duration::integrate_tempo_seconds(
            &self.clip,
            start_bpm,
            end_bpm,
            duration_beats,
            curve,
            IntegrationPrecision::Standard,
        )?;
        // The segment after the ramp starts flat at `end_bpm` until the next
        // tempo op (or scope exit) changes it.
        self.push_constant_from(end_beat, end_bpm);
        Ok(())
    }

    /// Seconds elapsed from beat `0` to `beat`, found by locating `beat`'s
    /// containing (or immediately preceding) segment and integrating within
    /// it from that segment's own cumulative start.
    fn cumulative_at(&self, beat: f64) -> f64 {
        let Some(seg) = self
            .segments
            .iter()
            .rev()
            .find(|s| s.start_beat <= beat + 1e-9)
        else {
            return 0.0;
        };
        let clamped = beat.clamp(seg.start_beat, if seg.end_beat.is_finite() { seg.end_beat } else { beat });
        seg.cumulative_seconds + seconds_within(seg, seg.start_beat, clamped, self.precision)
    }
}

/// Build a [`TempoMap`] from a timed sequence. `default_bpm` seeds the
/// tempo in effect before the first `Tempo` op (falls back to 120 if the
/// caller has no better default).
pub fn build_tempo_map(
    clip: &str,
    timed: &[TimedItem],
    default_bpm: f64,
    precision: IntegrationPrecision,
) -> CompileResult<TempoMap> {
    let mut b = Builder {
        clip: clip.to_string(),
        segments: Vec::new(),
        current_bpm: default_bpm,
        precision,
        tempo_save_stack: Vec::new(),
    };
    b.push_constant_from(0.0, default_bpm);

    for timed_item in timed {
        match &timed_item.item.kind {
            ExpandedKind::Op(Operation::Tempo { bpm, transition }) => match transition {
                Some(t) => {
                    b.push_ramp(
                        timed_item.beat_start,
                        b.current_bpm,
                        *bpm,
                        t.duration_beats,
                        t.curve.into(),
                    )?;
                }
                None => {
                    b.push_constant_from(timed_item.beat_start, *bpm);
                }
            },
            ExpandedKind::ScopeStart { isolate, .. } => {
                b.tempo_save_stack
                    .push(isolate.tempo.then_some(b.current_bpm));
            }
            ExpandedKind::ScopeEnd => {
                if let Some(Some(saved_bpm)) = b.tempo_save_stack.pop() {
                    // Cut off any in-progress ramp: restore to the bpm that
                    // was current when the isolated scope was entered.
                    b.push_constant_from(timed_item.beat_start, saved_bpm);
                }
            }
            _ => {}
        }
    }

    let end_beat = last_beat(timed);
    b.close_open_segment(end_beat);
    let total_seconds = b.cumulative_at(end_beat);

    Ok(TempoMap { segments: b.segments, precision, total_seconds })
}

fn last_beat(timed: &[TimedItem]) -> f64 {
    timed
        .iter()
        .map(|t| t.beat_start + t.beat_duration)
        .fold(0.0_f64, f64::max)
}

/// Seconds elapsed between `from` and `to` (both absolute beats, both within
/// `seg`'s span) under that segment's tempo function.
fn seconds_within(seg: &Segment, from: f64, to: f64, precision: IntegrationPrecision) -> f64 {
    if to <= from {
        return 0.0;
    }
    if seg.is_constant() {
        return 60.0 * (to - from) / seg.start_bpm;
    }
    let curve = seg.curve.unwrap();
    let span = (seg.end_beat - seg.start_beat).max(1e-12);
    let steps = match precision {
        IntegrationPrecision::Standard => 100,
        IntegrationPrecision::High => 10_000,
        IntegrationPrecision::Sample { sample_rate } => {
            let avg_bpm = (seg.start_bpm + seg.end_bpm) / 2.0;
            let approx = 60.0 * (to - from) / avg_bpm;
            ((approx * sample_rate).ceil() as usize).clamp(2, 2_000_000)
        }
    };
    let steps = if steps % 2 == 1 { steps + 1 } else { steps };
    let h = (to - from) / steps as f64;
    let f = |beat: f64| {
        let u = (beat - seg.start_beat) / span;
        60.0 / duration::bpm_at_u(seg.start_bpm, seg.end_bpm, curve, u)
    };
    let mut sum = f(from) + f(to);
    for i in 1..steps {
        let beat = from + i as f64 * h;
        let weight = if i % 2 == 0 { 2.0 } else { 4.0 };
        sum += weight * f(beat);
    }
    sum * h / 3.0
}

impl TempoMap {
    fn segment_for(&self, beat: f64) -> &Segment {
        self.segments
            .iter()
            .rev()
            .find(|s| s.start_beat <= beat + 1e-9)
            .unwrap_or(&self.segments[0])
    }

    /// Instantaneous bpm at an absolute beat position.
    pub fn bpm_at(&self, beat: f64) -> f64 {
        let seg = self.segment_for(beat);
        if seg.is_constant() {
            return seg.start_bpm;
        }
        let span = (seg.end_beat - seg.start_beat).max(1e-12);
        let u = ((beat - seg.start_beat) / span).clamp(0.0, 1.0);
        duration::bpm_at_u(seg.start_bpm, seg.end_bpm, seg.curve.unwrap(), u)
    }

    /// Elapsed seconds from beat `0` to `beat`. Monotonically non-decreasing
    /// for `beat` increasing, since every segment's tempo is positive.
    pub fn beat_to_seconds(&self, beat: f64) -> f64 {
        let seg = self.segment_for(beat);
        let upper = if seg.end_beat.is_finite() { seg.end_beat } else { beat.max(seg.start_beat) };
        let clamped_beat = beat.clamp(seg.start_beat, upper.max(seg.start_beat));
        seg.cumulative_seconds + seconds_within(seg, seg.start_beat, clamped_beat, self.precision)
    }

    /// Elapsed seconds for `beats` beats starting at `start_beat`, correctly
    /// spanning a segment boundary (e.g. a note that starts inside a ramp
    /// and ends after it completes).
    pub fn duration_to_seconds(&self, start_beat: f64, beats: f64) -> f64 {
        if beats <= 0.0 {
            return 0.0;
        }
        self.beat_to_seconds(start_beat + beats) - self.beat_to_seconds(start_beat)
    }

    pub fn total_seconds(&self) -> f64 {
        self.total_seconds
    }
}

/// Consistency check used by the compile API: `beat_to_seconds` must never
/// regress. Exposed so integration tests/property tests can assert it over
/// arbitrary sampled beats without reaching into private fields.
pub fn assert_monotonic(map: &TempoMap, beats: &[f64]) -> CompileResult<()> {
    let mut prev = f64::NEG_INFINITY;
    for &b in beats {
        let s = map.beat_to_seconds(b);
        if s + 1e-9 < prev {
            return Err(CompileError::InternalInvariant(format!(
                "tempo map beat_to_seconds regressed at beat {b}: {s} < {prev}"
            )));
        }
        prev = s;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{expand_clip, ExpansionLimits};
    use crate::timer::time_sequence;
    use crate::tree::{ClipNode, DurationSpec, TempoTransition};

    fn note(beats: f64) -> Operation {
        Operation::Note {
            pitch: 60,
            duration: DurationSpec::beats(beats),
            velocity: 1.0,
            articulation: None,
            detune_cents: None,
            timbre: None,
            pressure: None,
            glide: None,
            tie: None,
            voice_id: None,
        }
    }

    fn timed_of(clip: ClipNode) -> Vec<TimedItem> {
        let seq = expand_clip(&clip, ExpansionLimits::default()).unwrap();
        time_sequence(&seq).unwrap()
    }

    #[test]
    fn constant_tempo_scale() {
        let clip = ClipNode::new("c").with_operations(vec![note(1.0), note(1.0), note(1.0)]);
        let timed = timed_of(clip);
        let map = build_tempo_map("c", &timed, 120.0, IntegrationPrecision::Standard).unwrap();
        assert!((map.beat_to_seconds(1.0) - 0.5).abs() < 1e-9);
        assert!((map.beat_to_seconds(3.0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn linear_ramp_matches_spec_example() {
        let clip = ClipNode::new("c").with_operations(vec![
            Operation::Tempo { bpm: 60.0, transition: None },
            Operation::Tempo {
                bpm: 120.0,
                transition: Some(TempoTransition {
                    duration_beats: 4.0,
                    curve: Curve::Linear,
                    precise: false,
                }),
            },
            note(1.0),
            note(1.0),
            note(1.0),
            note(1.0),
        ]);
        let timed = timed_of(clip);
        let map = build_tempo_map("c", &timed, 120.0, IntegrationPrecision::Standard).unwrap();
        let total = map.beat_to_seconds(4.0);
        let expected = 60.0 * std::f64::consts::LN_2 / 15.0;
        assert!((total - expected).abs() < 1e-4, "{total} vs {expected}");
    }

    #[test]
    fn ramp_durations_strictly_decrease() {
        let clip = ClipNode::new("c").with_operations(vec![
            Operation::Tempo { bpm: 60.0, transition: None },
            Operation::Tempo {
                bpm: 120.0,
                transition: Some(TempoTransition {
                    duration_beats: 4.0,
                    curve: Curve::Linear,
                    precise: false,
                }),
            },
            note(1.0),
            note(1.0),
            note(1.0),
            note(1.0),
        ]);
        let timed = timed_of(clip);
        let map = build_tempo_map("c", &timed, 120.0, IntegrationPrecision::Standard).unwrap();
        let durations: Vec<f64> = (0..4)
            .map(|i| map.duration_to_seconds(i as f64, 1.0))
            .collect();
        for w in durations.windows(2) {
            assert!(w[1] < w[0], "{durations:?} not strictly decreasing");
        }
    }

    #[test]
    fn monotonic_over_random_sweep() {
        let clip = ClipNode::new("c").with_operations(vec![
            Operation::Tempo { bpm: 90.0, transition: None },
            Operation::Tempo {
                bpm: 30.0,
                transition: Some(TempoTransition {
                    duration_beats: 8.0,
                    curve: Curve::EaseInOut,
                    precise: false,
                }),
            },
            note(1.0),
        ]);
        let timed = timed_of(clip);
        let map = build_tempo_map("c", &timed, 120.0, IntegrationPrecision::Standard).unwrap();
        let beats: Vec<f64> = (0..80).map(|i| i as f64 * 0.1).collect();
        assert!(assert_monotonic(&map, &beats).is_ok());
    }

    #[test]
    fn scope_isolated_tempo_cuts_off_ramp() {
        let clip = ClipNode::new("c").with_operations(vec![
            Operation::Tempo { bpm: 60.0, transition: None },
            Operation::Scope {
                isolate: crate::tree::ScopeIsolation { tempo: true, ..Default::default() },
                inner: Box::new(Operation::Tempo {
                    bpm: 240.0,
                    transition: Some(TempoTransition {
                        duration_beats: 16.0,
                        curve: Curve::Linear,
                        precise: false,
                    }),
                }),
            },
            note(1.0),
        ]);
        let timed = timed_of(clip);
        let map = build_tempo_map("c", &timed, 120.0, IntegrationPrecision::Standard).unwrap();
        // After the scope exits, tempo should be back to 60bpm, not still
        // ramping toward 240, so one beat costs 1s, not a fraction of it.
        let last_beat_start = timed
            .iter()
            .rev()
            .find(|t| matches!(&t.item.kind, ExpandedKind::Op(Operation::Note { .. })))
            .unwrap()
            .beat_start;
        let dur = map.duration_to_seconds(last_beat_start, 1.0);
        assert!((dur - 1.0).abs() < 1e-6, "expected 1s at 60bpm, got {dur}");
    }
}
