//! Beat-position assignment over an expanded stream (spec component C4).
//!
//! A single linear pass assigns `beat_start`/`beat_duration`/`measure`/
//! `beat_in_measure` to every item, including structural markers. Only
//! `Note`, `Rest`, and `Block` advance the write head; everything else sits
//! at zero duration at the current beat.

use crate::errors::{CompileError, CompileResult};
use crate::expander::{ExpandedItem, ExpandedKind, ExpandedSequence};
use crate::timing::TimeSignature;
use crate::tree::Operation;

/// A time-signature segment: starts at `start_beat`, holds `beats_per_measure`,
/// and continues the measure count from `start_measure` (so measure numbers
/// keep climbing across a signature change instead of resetting).
#[derive(Clone, Copy, Debug)]
struct Segment {
    start_beat: f64,
    beats_per_measure: f64,
    start_measure: u32,
}

struct SegmentMap {
    segments: Vec<Segment>,
}

impl SegmentMap {
    fn new() -> Self {
        Self {
            segments: vec![Segment { start_beat: 0.0, beats_per_measure: 4.0, start_measure: 0 }],
        }
    }

    fn push(&mut self, start_beat: f64, numerator: u32, denominator: u32) {
        let beats_per_measure = TimeSignature::new(numerator, denominator).beats_per_measure();
        let (measure, _) = self.locate(start_beat);
        self.segments.push(Segment { start_beat, beats_per_measure, start_measure: measure });
    }

    /// Returns (measure, beat_in_measure) for an absolute beat position.
    fn locate(&self, beat: f64) -> (u32, f64) {
        let seg = self
            .segments
            .iter()
            .rev()
            .find(|s| s.start_beat <= beat + 1e-9)
            .unwrap_or(&self.segments[0]);
        let into = (beat - seg.start_beat).max(0.0);
        let measure_offset = (into / seg.beats_per_measure).floor();
        let measure = seg.start_measure + measure_offset as u32;
        let beat_in_measure = into - measure_offset * seg.beats_per_measure;
        (measure, beat_in_measure)
    }
}

struct StackFrame {
    start_time: f64,
    max_duration: f64,
}

/// An [`ExpandedItem`] with its resolved beat position.
#[derive(Clone, Debug, PartialEq)]
pub struct TimedItem {
    pub item: ExpandedItem,
    pub beat_start: f64,
    pub beat_duration: f64,
    pub measure: u32,
    pub beat_in_measure: f64,
}

pub fn time_sequence(seq: &ExpandedSequence) -> CompileResult<Vec<TimedItem>> {
    let mut segments = SegmentMap::new();
    let mut current_beat = 0.0_f64;
    let mut stack_frames: Vec<StackFrame> = Vec::new();
    let mut scope_depth: u32 = 0;
    let mut out = Vec::with_capacity(seq.items.len());

    for item in &seq.items {
        let (advance, beat_start): (f64, f64) = match &item.kind {
            ExpandedKind::Op(Operation::Note { duration, .. })
            | ExpandedKind::Op(Operation::Rest { duration }) => (duration.beats, current_beat),

            ExpandedKind::Op(Operation::TimeSignature { numerator, denominator }) => {
                let beat_start = current_beat;
                segments.push(current_beat, *numerator, *denominator);
                (0.0, beat_start)
            }

            ExpandedKind::Op(_) => (0.0, current_beat),

            ExpandedKind::BlockMarker { precompiled } => (precompiled.beat_duration, current_beat),

            ExpandedKind::StackStart => {
                stack_frames.push(StackFrame { start_time: current_beat, max_duration: 0.0 });
                (0.0, current_beat)
            }

            ExpandedKind::BranchStart => {
                let frame = stack_frames.last().ok_or_else(|| {
                    CompileError::InternalInvariant("branch_start with no enclosing stack".into())
                })?;
                current_beat = frame.start_time;
                (0.0, current_beat)
            }

            ExpandedKind::BranchEnd => {
                let frame = stack_frames.last_mut().ok_or_else(|| {
                    CompileError::InternalInvariant("branch_end with no enclosing stack".into())
                })?;
                let elapsed = current_beat - frame.start_time;
                frame.max_duration = frame.max_duration.max(elapsed);
                (0.0, current_beat)
            }

            ExpandedKind::StackEnd => {
                let frame = stack_frames.pop().ok_or_else(|| {
                    CompileError::InternalInvariant("stack_end with no matching stack_start".into())
                })?;
                current_beat = frame.start_time + frame.max_duration;
                (0.0, current_beat)
            }

            ExpandedKind::ScopeStart { .. } => {
                scope_depth += 1;
                (0.0, current_beat)
            }

            ExpandedKind::ScopeEnd => {
                scope_depth = scope_depth.checked_sub(1).ok_or_else(|| {
                    CompileError::InternalInvariant("scope_end with no matching scope_start".into())
                })?;
                (0.0, current_beat)
            }
        };

        let (measure, beat_in_measure) = segments.locate(beat_start);
        out.push(TimedItem {
            item: item.clone(),
            beat_start,
            beat_duration: advance.max(0.0),
            measure,
            beat_in_measure,
        });
        current_beat += advance.max(0.0);
    }

    if !stack_frames.is_empty() {
        return Err(CompileError::InternalInvariant("unclosed stack at end of stream".into()));
    }
    if scope_depth != 0 {
        return Err(CompileError::InternalInvariant("unclosed scope at end of stream".into()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{expand_clip, ExpansionLimits};
    use crate::tree::{ClipNode, DurationSpec};

    fn note(pitch: i32, beats: f64) -> Operation {
        Operation::Note {
            pitch,
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

    #[test]
    fn sequential_notes_advance_beat() {
        let clip = ClipNode::new("lead").with_operations(vec![note(60, 1.0), note(64, 1.0), note(67, 1.0)]);
        let seq = expand_clip(&clip, ExpansionLimits::default()).unwrap();
        let timed = time_sequence(&seq).unwrap();
        assert_eq!(timed[0].beat_start, 0.0);
        assert_eq!(timed[1].beat_start, 1.0);
        assert_eq!(timed[2].beat_start, 2.0);
    }

    #[test]
    fn stack_branches_reset_and_rejoin_at_max() {
        let clip = ClipNode::new("chord").with_operations(vec![Operation::Stack {
            children: vec![note(60, 2.0), note(64, 1.0)],
        }, note(67, 1.0)]);
        let seq = expand_clip(&clip, ExpansionLimits::default()).unwrap();
        let timed = time_sequence(&seq).unwrap();
        let notes: Vec<_> = timed
            .iter()
            .filter(|t| matches!(t.item.kind, ExpandedKind::Op(Operation::Note { .. })))
            .collect();
        assert_eq!(notes[0].beat_start, 0.0); // branch 0
        assert_eq!(notes[1].beat_start, 0.0); // branch 1 reset
        assert_eq!(notes[2].beat_start, 2.0); // after stack, max(2,1)=2
    }

    #[test]
    fn measure_tracks_time_signature_changes() {
        let clip = ClipNode::new("meter").with_operations(vec![
            note(60, 4.0), // measure 0
            Operation::TimeSignature { numerator: 3, denominator: 4 },
            note(62, 3.0), // measure 1 in new signature
            note(64, 3.0), // measure 2
        ]);
        let seq = expand_clip(&clip, ExpansionLimits::default()).unwrap();
        let timed = time_sequence(&seq).unwrap();
        let notes: Vec<_> = timed
            .iter()
            .filter(|t| matches!(t.item.kind, ExpandedKind::Op(Operation::Note { .. })))
            .collect();
        assert_eq!(notes[0].measure, 0);
        assert_eq!(notes[1].measure, 1);
        assert_eq!(notes[2].measure, 2);
    }

    #[test]
    fn malformed_branch_end_is_internal_invariant() {
        let seq = ExpandedSequence {
            items: vec![ExpandedItem {
                kind: ExpandedKind::BranchEnd,
                depth: 0,
                source_clip_name: "x".into(),
                loop_iteration: None,
                input_order: 0,
            }],
        };
        assert!(matches!(time_sequence(&seq), Err(CompileError::InternalInvariant(_))));
    }
}
