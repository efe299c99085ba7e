//! Tie coalescing (spec component C5): merges `tie=start / continue / end`
//! chains on the same `(voiceId, pitch)` key into one extended note.
//!
//! Two variants share the same transition table: [`coalesce_ties`] (batch,
//! operates on the whole timed sequence and re-sorts at the end) and
//! [`StreamingCoalescer`] (a min-heap driver that yields items in order as
//! they arrive, for the incremental cache's section-by-section rebuild).

use crate::errors::Diagnostic;
use crate::expander::ExpandedKind;
use crate::timer::TimedItem;
use crate::tree::{Operation, TieKind};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

type TieKeyTuple = (u8, i32);

fn tie_key(voice_id: Option<u8>, pitch: i32) -> TieKeyTuple {
    (voice_id.unwrap_or(0), pitch)
}

/// Clear the `tie` field on a Note item. No-op for anything else.
fn untied(mut item: TimedItem) -> TimedItem {
    if let ExpandedKind::Op(Operation::Note { tie, .. }) = &mut item.item.kind {
        *tie = None;
    }
    item
}

/// Build the merged note: the start note's identity (pitch, velocity,
/// articulation, ...) with the summed duration and the end op's
/// `input_order` (the fixed rule for tie-breaking, see design notes).
fn merge_note(start: TimedItem, total_beats: f64, end_input_order: u64) -> TimedItem {
    let mut merged = untied(start);
    merged.beat_duration = total_beats;
    merged.item.input_order = end_input_order;
    merged
}

struct ActiveTie {
    start_item: TimedItem,
    accumulated: f64,
}

/// Batch tie coalescer: one pass over the timed sequence, then a final
/// re-sort since merged notes are appended at their `end` op's processing
/// position, not their `start`'s.
pub fn coalesce_ties(items: Vec<TimedItem>) -> (Vec<TimedItem>, Vec<Diagnostic>) {
    let mut active: HashMap<TieKeyTuple, ActiveTie> = HashMap::new();
    let mut out = Vec::with_capacity(items.len());
    let mut diagnostics = Vec::new();

    for timed in items {
        let note_tie = match &timed.item.kind {
            ExpandedKind::Op(Operation::Note { pitch, voice_id, tie: Some(kind), .. }) => {
                Some((tie_key(*voice_id, *pitch), *kind))
            }
            _ => None,
        };

        let Some((key, kind)) = note_tie else {
            out.push(timed);
            continue;
        };

        match kind {
            TieKind::Start => {
                if let Some(prev) = active.remove(&key) {
                    diagnostics.push(Diagnostic::OrphanedTieStart {
                        beat: prev.start_item.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    out.push(untied(prev.start_item));
                }
                let accumulated = timed.beat_duration;
                active.insert(key, ActiveTie { start_item: timed, accumulated });
            }
            TieKind::Continue => {
                if let Some(tie) = active.get_mut(&key) {
                    tie.accumulated += timed.beat_duration;
                } else {
                    diagnostics.push(Diagnostic::OrphanedTieContinue {
                        beat: timed.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    out.push(untied(timed));
                }
            }
            TieKind::End => {
                if let Some(tie) = active.remove(&key) {
                    let total = tie.accumulated + timed.beat_duration;
                    out.push(merge_note(tie.start_item, total, timed.item.input_order));
                } else {
                    diagnostics.push(Diagnostic::OrphanedTieEnd {
                        beat: timed.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    out.push(untied(timed));
                }
            }
        }
    }

    // Anything still active at end-of-stream never got an end: flush as-is.
    let mut leftovers: Vec<_> = active.into_values().collect();
    leftovers.sort_by(|a, b| a.start_item.item.input_order.cmp(&b.start_item.item.input_order));
    for tie in leftovers {
        let (voice_id, pitch) = match &tie.start_item.item.kind {
            ExpandedKind::Op(Operation::Note { pitch, voice_id, .. }) => (voice_id.unwrap_or(0), *pitch),
            _ => (0, 0),
        };
        diagnostics.push(Diagnostic::OrphanedTieStart { beat: tie.start_item.beat_start, pitch, voice_id });
        out.push(untied(tie.start_item));
    }

    out.sort_by(|a, b| {
        a.beat_start
            .partial_cmp(&b.beat_start)
            .unwrap_or(Ordering::Equal)
            .then(a.item.input_order.cmp(&b.item.input_order))
    });

    (out, diagnostics)
}

// ---------------------------------------------------------------------------
// Streaming variant
// ---------------------------------------------------------------------------

/// Per-key tie state carried across a section boundary so the streaming
/// coalescer can resume mid-chain.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedTieState {
    pub voice_id: u8,
    pub pitch: i32,
    pub start_beat: f64,
    pub accumulated_duration: f64,
    pub input_order: u64,
}

#[derive(Clone, Debug, PartialEq)]
struct HeapKey {
    beat_start: f64,
    input_order: u64,
}

impl Eq for HeapKey {}
impl PartialEq<HeapKey> for &HeapKey {
    fn eq(&self, other: &HeapKey) -> bool {
        self.beat_start == other.beat_start && self.input_order == other.input_order
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the smallest (beat, order) pops first.
        other
            .beat_start
            .partial_cmp(&self.beat_start)
            .unwrap_or(Ordering::Equal)
            .then(other.input_order.cmp(&self.input_order))
    }
}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct HeapEntry {
    key: HeapKey,
    item: TimedItem,
}
impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// Min-heap-driven tie coalescer. Yields items already in `(beatStart,
/// inputOrder)` order, so no final sort is needed, at the cost of holding
/// ready-but-unordered items in a heap until a watermark proves nothing
/// still active can land earlier: a merged note's `beat_start` always
/// equals its tie-start's `beat_start`, so a ready item only releases once
/// its `beat_start` is strictly below every currently active tie's start.
pub struct StreamingCoalescer {
    active: HashMap<TieKeyTuple, ActiveTie>,
    ready: BinaryHeap<HeapEntry>,
    diagnostics: Vec<Diagnostic>,
}

impl StreamingCoalescer {
    pub fn new() -> Self {
        Self { active: HashMap::new(), ready: BinaryHeap::new(), diagnostics: Vec::new() }
    }

    /// Rebuild `active` from a prelude captured at a previous section
    /// boundary, so a tie spanning the boundary keeps accumulating.
    pub fn resume(states: &[SerializedTieState]) -> Self {
        let mut c = Self::new();
        for s in states {
            c.active.insert(
                (s.voice_id, s.pitch),
                ActiveTie {
                    start_item: TimedItem {
                        item: crate::expander::ExpandedItem {
                            kind: ExpandedKind::Op(Operation::Note {
                                pitch: s.pitch,
                                duration: crate::tree::DurationSpec::beats(0.0),
                                velocity: 1.0,
                                articulation: None,
                                detune_cents: None,
                                timbre: None,
                                pressure: None,
                                glide: None,
                                tie: Some(TieKind::Start),
                                voice_id: Some(s.voice_id),
                            }),
                            depth: 0,
                            source_clip_name: String::new(),
                            loop_iteration: None,
                            input_order: s.input_order,
                        },
                        beat_start: s.start_beat,
                        beat_duration: 0.0,
                        measure: 0,
                        beat_in_measure: 0.0,
                    },
                    accumulated: s.accumulated_duration,
                },
            );
        }
        c
    }

    /// Feed one timed item in arrival order; returns any items now safe to
    /// emit (their final position is known and nothing earlier is pending).
    pub fn push(&mut self, timed: TimedItem) -> Vec<TimedItem> {
        let note_tie = match &timed.item.kind {
            ExpandedKind::Op(Operation::Note { pitch, voice_id, tie: Some(kind), .. }) => {
                Some((tie_key(*voice_id, *pitch), *kind))
            }
            _ => None,
        };

        match note_tie {
            None => {
                self.ready.push(HeapEntry {
                    key: HeapKey { beat_start: timed.beat_start, input_order: timed.item.input_order },
                    item: timed,
                });
            }
            Some((key, TieKind::Start)) => {
                if let Some(prev) = self.active.remove(&key) {
                    self.diagnostics.push(Diagnostic::OrphanedTieStart {
                        beat: prev.start_item.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    let item = untied(prev.start_item);
                    self.ready.push(HeapEntry {
                        key: HeapKey { beat_start: item.beat_start, input_order: item.item.input_order },
                        item,
                    });
                }
                let accumulated = timed.beat_duration;
                self.active.insert(key, ActiveTie { start_item: timed, accumulated });
            }
            Some((key, TieKind::Continue)) => {
                if let Some(tie) = self.active.get_mut(&key) {
                    tie.accumulated += timed.beat_duration;
                } else {
                    self.diagnostics.push(Diagnostic::OrphanedTieContinue {
                        beat: timed.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    let item = untied(timed);
                    self.ready.push(HeapEntry {
                        key: HeapKey { beat_start: item.beat_start, input_order: item.item.input_order },
                        item,
                    });
                }
            }
            Some((key, TieKind::End)) => {
                if let Some(tie) = self.active.remove(&key) {
                    let total = tie.accumulated + timed.beat_duration;
                    let merged = merge_note(tie.start_item, total, timed.item.input_order);
                    self.ready.push(HeapEntry {
                        key: HeapKey { beat_start: merged.beat_start, input_order: merged.item.input_order },
                        item: merged,
                    });
                } else {
                    self.diagnostics.push(Diagnostic::OrphanedTieEnd {
                        beat: timed.beat_start,
                        pitch: key.1,
                        voice_id: key.0,
                    });
                    let item = untied(timed);
                    self.ready.push(HeapEntry {
                        key: HeapKey { beat_start: item.beat_start, input_order: item.item.input_order },
                        item,
                    });
                }
            }
        }

        self.drain_ready()
    }

    /// The earliest `beat_start` any currently active tie could still land
    /// at once it resolves. A ready item sorts ahead of every future merged
    /// note only if its own `beat_start` falls strictly before this.
    fn watermark(&self) -> f64 {
        self.active
            .values()
            .map(|tie| tie.start_item.beat_start)
            .fold(f64::INFINITY, f64::min)
    }

    fn drain_ready(&mut self) -> Vec<TimedItem> {
        let watermark = self.watermark();
        let mut out = Vec::new();
        while let Some(entry) = self.ready.peek() {
            if entry.key.beat_start >= watermark {
                break;
            }
            out.push(self.ready.pop().expect("just peeked").item);
        }
        out
    }

    /// Flush remaining active ties at end-of-stream and drain the heap.
    pub fn finish(mut self) -> (Vec<TimedItem>, Vec<Diagnostic>) {
        let active = std::mem::take(&mut self.active);
        let mut leftovers: Vec<_> = active.into_values().collect();
        leftovers.sort_by(|a, b| a.start_item.item.input_order.cmp(&b.start_item.item.input_order));
        for tie in leftovers {
            let key_pitch = match &tie.start_item.item.kind {
                ExpandedKind::Op(Operation::Note { pitch, voice_id, .. }) => (voice_id.unwrap_or(0), *pitch),
                _ => (0, 0),
            };
            self.diagnostics.push(Diagnostic::OrphanedTieStart {
                beat: tie.start_item.beat_start,
                pitch: key_pitch.1,
                voice_id: key_pitch.0,
            });
            let item = untied(tie.start_item);
            self.ready.push(HeapEntry {
                key: HeapKey { beat_start: item.beat_start, input_order: item.item.input_order },
                item,
            });
        }
        let out = self.drain_ready();
        (out, self.diagnostics)
    }

    pub fn serialize_active(&self) -> Vec<SerializedTieState> {
        self.active
            .iter()
            .map(|(key, tie)| SerializedTieState {
                voice_id: key.0,
                pitch: key.1,
                start_beat: tie.start_item.beat_start,
                accumulated_duration: tie.accumulated,
                input_order: tie.start_item.item.input_order,
            })
            .collect()
    }
}

impl Default for StreamingCoalescer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expander::{expand_clip, ExpansionLimits};
    use crate::timer::time_sequence;
    use crate::tree::{ClipNode, DurationSpec};

    fn tied_note(pitch: i32, beats: f64, tie: Option<TieKind>) -> Operation {
        Operation::Note {
            pitch,
            duration: DurationSpec::beats(beats),
            velocity: 1.0,
            articulation: None,
            detune_cents: None,
            timbre: None,
            pressure: None,
            glide: None,
            tie,
            voice_id: None,
        }
    }

    fn timed_of(clip: ClipNode) -> Vec<TimedItem> {
        let seq = expand_clip(&clip, ExpansionLimits::default()).unwrap();
        time_sequence(&seq).unwrap()
    }

    #[test]
    fn merges_start_and_end_into_one_note() {
        let clip = ClipNode::new("tie").with_operations(vec![
            tied_note(60, 2.0, Some(TieKind::Start)),
            tied_note(60, 2.0, Some(TieKind::End)),
        ]);
        let (out, diags) = coalesce_ties(timed_of(clip));
        assert!(diags.is_empty());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].beat_duration, 4.0);
        assert!(matches!(&out[0].item.kind, ExpandedKind::Op(Operation::Note { tie: None, .. })));
    }

    #[test]
    fn continue_accumulates_across_chain() {
        let clip = ClipNode::new("tie").with_operations(vec![
            tied_note(60, 1.0, Some(TieKind::Start)),
            tied_note(60, 1.0, Some(TieKind::Continue)),
            tied_note(60, 1.0, Some(TieKind::End)),
        ]);
        let (out, diags) = coalesce_ties(timed_of(clip));
        assert!(diags.is_empty());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].beat_duration, 3.0);
    }

    #[test]
    fn orphan_start_produces_diagnostic() {
        let clip = ClipNode::new("tie").with_operations(vec![
            tied_note(60, 2.0, Some(TieKind::Start)),
            tied_note(62, 2.0, None),
        ]);
        let (out, diags) = coalesce_ties(timed_of(clip));
        assert_eq!(out.len(), 2);
        assert_eq!(diags.len(), 1);
        assert!(matches!(diags[0], Diagnostic::OrphanedTieStart { pitch: 60, .. }));
    }

    #[test]
    fn merged_note_input_order_is_the_end_ops() {
        let clip = ClipNode::new("tie").with_operations(vec![
            tied_note(60, 1.0, Some(TieKind::Start)),
            tied_note(61, 1.0, None),
            tied_note(60, 1.0, Some(TieKind::End)),
        ]);
        let (out, _diags) = coalesce_ties(timed_of(clip));
        let merged = out.iter().find(|t| matches!(&t.item.kind, ExpandedKind::Op(Operation::Note{pitch:60,..}))).unwrap();
        assert_eq!(merged.item.input_order, 2); // the tie=end op's input_order
    }

    #[test]
    fn streaming_matches_batch_output() {
        let clip = ClipNode::new("tie").with_operations(vec![
            tied_note(60, 1.0, Some(TieKind::Start)),
            tied_note(61, 1.0, None),
            tied_note(60, 1.0, Some(TieKind::End)),
        ]);
        let timed = timed_of(clip.clone());
        let (batch_out, _) = coalesce_ties(timed.clone());

        let mut streaming = StreamingCoalescer::new();
        let mut stream_out = Vec::new();
        for item in timed {
            stream_out.extend(streaming.push(item));
        }
        let (flushed, _) = streaming.finish();
        stream_out.extend(flushed);

        assert_eq!(stream_out.len(), batch_out.len());
        for (a, b) in stream_out.iter().zip(batch_out.iter()) {
            assert_eq!(a.beat_start, b.beat_start);
            assert_eq!(a.item.input_order, b.item.input_order);
        }
    }
}
