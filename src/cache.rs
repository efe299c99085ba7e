//! Incremental recompilation cache (spec component C8).
//!
//! A clip's top-level operations are partitioned into [`Section`]s at every
//! structural boundary (`tempo`, `time_signature`, `loop`, `stack`, `scope`,
//! see [`Operation::is_section_boundary`]). On a live edit, [`recompile`]
//! compares the new clip's section hashes against the cached ones in order
//! and stops at the first difference: everything before it is reused
//! verbatim, everything from it onward is rebuilt.
//!
//! Section boundaries fall only between top-level operations, never inside
//! one, so a rebuilt tail never starts in the middle of an open `Scope` or
//! `Stack`: the emitter's transposition context is always `0` at a section
//! start. Tempo is the exception: it's cheap enough (segment count, not
//! event count) that the tempo map is always rebuilt fully rather than
//! sectioned, so a ramp that crosses a cache boundary still integrates
//! correctly.

use crate::emitter::{emit, EmitOptions};
use crate::errors::{CompileResult, Diagnostic};
use crate::events::{sort_events, Event};
use crate::expander::{expand_clip, ExpansionLimits};
use crate::tempo_map::{build_tempo_map, TempoMap};
use crate::tie::{SerializedTieState, StreamingCoalescer};
use crate::timer::{time_sequence, TimedItem};
use crate::tree::{hash_operation, ClipNode, Operation};

/// One contiguous run of a clip's top-level operations, with the
/// `input_order` span (see [`detect_sections`]) and beat span its expansion
/// occupies.
#[derive(Clone, Debug, PartialEq)]
pub struct Section {
    pub start_op_index: usize,
    pub end_op_index: usize,
    pub start_order: u64,
    pub end_order: u64,
    pub hash: u64,
    pub start_beat: f64,
    pub end_beat: f64,
}

/// Combine per-op hashes the same way `hash_clip` combines op hashes,
/// without reaching into `tree`'s private seed, consistency across runs of
/// this function is all that's required, not cross-module agreement.
fn hash_section_ops(ops: &[Operation]) -> u64 {
    let mut h: u64 = 1469598103934665603; // FNV offset basis; distinct from tree's djb2 seed on purpose.
    for op in ops {
        h ^= hash_operation(op);
        h = h.wrapping_mul(1099511628211);
    }
    h
}

/// Count how many items a single operation expands to, by running it
/// through the real expander in isolation. Used only to compute
/// `input_order` spans for sectioning; the count of items a subtree
/// produces doesn't depend on what surrounds it.
fn expanded_item_count(op: &Operation) -> CompileResult<usize> {
    let synthetic = ClipNode::new("<section-probe>").with_operations(vec![op.clone()]);
    Ok(expand_clip(&synthetic, ExpansionLimits::default())?.items.len())
}

/// Partition a clip's top-level operations into sections. A boundary op
/// (tempo/time_signature/loop/stack/scope) always starts its own section;
/// runs of plain operations between boundaries share one.
pub fn detect_sections(clip: &ClipNode) -> CompileResult<Vec<Section>> {
    let mut sections = Vec::new();
    let mut order = 0u64;
    let mut section_start_op = 0usize;
    let mut section_start_order = 0u64;

    let mut i = 0usize;
    while i < clip.operations.len() {
        let op = &clip.operations[i];
        let count = expanded_item_count(op)? as u64;
        let is_boundary = op.is_section_boundary();

        let starts_new_section = is_boundary && i != section_start_op;
        if starts_new_section {
            sections.push(Section {
                start_op_index: section_start_op,
                end_op_index: i,
                start_order: section_start_order,
                end_order: order,
                hash: hash_section_ops(&clip.operations[section_start_op..i]),
                start_beat: 0.0,
                end_beat: 0.0,
            });
            section_start_op = i;
            section_start_order = order;
        }

        order += count;

        // A boundary op is always a section of exactly one operation; close
        // it immediately so the next op starts fresh.
        if is_boundary {
            sections.push(Section {
                start_op_index: section_start_op,
                end_op_index: i + 1,
                start_order: section_start_order,
                end_order: order,
                hash: hash_section_ops(&clip.operations[section_start_op..i + 1]),
                start_beat: 0.0,
                end_beat: 0.0,
            });
            section_start_op = i + 1;
            section_start_order = order;
        }

        i += 1;
    }

    if section_start_op < clip.operations.len() {
        sections.push(Section {
            start_op_index: section_start_op,
            end_op_index: clip.operations.len(),
            start_order: section_start_order,
            end_order: order,
            hash: hash_section_ops(&clip.operations[section_start_op..]),
            start_beat: 0.0,
            end_beat: 0.0,
        });
    }

    Ok(sections)
}

/// Fill in each section's beat span from a fully-timed sequence, by locating
/// the first and last timed item whose `input_order` falls in the section's
/// order range.
fn fill_beat_spans(sections: &mut [Section], timed: &[TimedItem]) {
    for section in sections.iter_mut() {
        let in_range: Vec<&TimedItem> = timed
            .iter()
            .filter(|t| {
                let order = t.item.input_order;
                order >= section.start_order && order < section.end_order
            })
            .collect();
        if let Some(first) = in_range.first() {
            section.start_beat = first.beat_start;
        }
        if let Some(last) = in_range.last() {
            section.end_beat = last.beat_start + last.beat_duration;
        }
    }
}

/// Whether changing `old` into `new` at the same section requires
/// everything after it to be rebuilt too. A change that only affects how a
/// single op renders (velocity, articulation, a control value) is
/// non-cascading; a change to anything that shifts downstream timing or
/// tempo is cascading.
///
/// Per spec, this classification table is consulted by the cache, not by
/// the hash comparison itself: two ops with different hashes are *always*
/// re-emitted individually, but whether the *next* section can still be
/// reused depends on this.
pub fn is_cascading_change(old: &Operation, new: &Operation) -> bool {
    if old.kind_tag() != new.kind_tag() {
        return true;
    }
    match (old, new) {
        (Operation::Note { duration: d1, tie: t1, .. }, Operation::Note { duration: d2, tie: t2, .. }) => {
            d1.beats != d2.beats || t1 != t2
        }
        (Operation::Rest { duration: d1 }, Operation::Rest { duration: d2 }) => d1.beats != d2.beats,
        (Operation::Control { .. }, Operation::Control { .. })
        | (Operation::PitchBend { .. }, Operation::PitchBend { .. })
        | (Operation::Aftertouch { .. }, Operation::Aftertouch { .. })
        | (Operation::Vibrato { .. }, Operation::Vibrato { .. })
        | (Operation::Automation { .. }, Operation::Automation { .. }) => false,
        (Operation::Block { precompiled: p1 }, Operation::Block { precompiled: p2 }) => {
            p1.beat_duration != p2.beat_duration
        }
        // Tempo, TimeSignature, Stack, Loop, ClipRef, Scope, Transpose: a
        // changed value inside any of these can shift every beat after it.
        _ => true,
    }
}

/// Bucket already-sorted events into per-section lists by `input_order`.
/// A tie that merges two notes spanning a section boundary is attributed to
/// whichever section contains its (the `tie=end` op's) `input_order`, the
/// same known simplification noted in the module docs applies here too.
fn bucket_events_by_section(events: &[Event], sections: &[Section]) -> Vec<Vec<Event>> {
    let mut buckets: Vec<Vec<Event>> = sections.iter().map(|_| Vec::new()).collect();
    for event in events {
        let idx = sections
            .iter()
            .position(|s| event.input_order >= s.start_order && event.input_order < s.end_order)
            .unwrap_or(sections.len().saturating_sub(1));
        if let Some(bucket) = buckets.get_mut(idx) {
            bucket.push(event.clone());
        }
    }
    buckets
}

/// Run tie coalescing over the whole timed sequence, recording the
/// coalescer's active-tie state at the end of every section so a later
/// partial recompile can resume from exactly that point.
fn coalesce_with_section_snapshots(
    timed: &[TimedItem],
    sections: &[Section],
) -> (Vec<TimedItem>, Vec<Diagnostic>, Vec<Vec<SerializedTieState>>) {
    let mut coalescer = StreamingCoalescer::new();
    let mut out = Vec::with_capacity(timed.len());
    let mut snapshots = vec![Vec::new(); sections.len()];

    let mut section_idx = 0usize;
    for item in timed {
        out.extend(coalescer.push(item.clone()));
        if section_idx < sections.len() && item.item.input_order + 1 == sections[section_idx].end_order {
            snapshots[section_idx] = coalescer.serialize_active();
            section_idx += 1;
        }
    }
    let (flushed, diags) = coalescer.finish();
    out.extend(flushed);
    sort_events_timed(&mut out);
    (out, diags, snapshots)
}

fn sort_events_timed(items: &mut [TimedItem]) {
    items.sort_by(|a, b| {
        a.beat_start
            .partial_cmp(&b.beat_start)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.item.input_order.cmp(&b.item.input_order))
    });
}

/// A full compile result plus the diagnostics that go with it, independent
/// of whether it came from a cache hit or a rebuild.
#[derive(Clone, Debug)]
pub struct ProjectionSnapshot {
    pub events: Vec<Event>,
    pub diagnostics: Vec<Diagnostic>,
    pub tempo_map: TempoMap,
}

/// Everything the cache keeps between compiles of the same clip, enough to
/// reuse unchanged sections on the next edit.
#[derive(Clone, Debug)]
pub struct CompilationCache {
    clip_name: String,
    sections: Vec<Section>,
    section_events: Vec<Vec<Event>>,
    section_diagnostics: Vec<Vec<Diagnostic>>,
    section_tie_state_at_end: Vec<Vec<SerializedTieState>>,
    snapshot: ProjectionSnapshot,
}

impl CompilationCache {
    pub fn clip_name(&self) -> &str {
        &self.clip_name
    }

    pub fn snapshot(&self) -> &ProjectionSnapshot {
        &self.snapshot
    }

    pub fn section_count(&self) -> usize {
        self.sections.len()
    }
}

/// Diagnostics about a single `recompile` call, mostly useful for tests and
/// for callers that want to log cache effectiveness.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecompileStats {
    pub total_sections: usize,
    pub reused_sections: usize,
    pub rebuilt_sections: usize,
}

/// Compile a clip from scratch and build a fresh cache for it.
pub fn compile(clip: &ClipNode, default_bpm: f64, options: &EmitOptions) -> CompileResult<(CompilationCache, ProjectionSnapshot)> {
    clip.check_schema()?;
    let seq = expand_clip(clip, ExpansionLimits::default())?;
    let timed = time_sequence(&seq)?;
    let tempo_map = build_tempo_map(&clip.name, &timed, default_bpm, crate::duration::IntegrationPrecision::Standard)?;

    let mut sections = detect_sections(clip)?;
    fill_beat_spans(&mut sections, &timed);

    let (coalesced, tie_diags, tie_states) = coalesce_with_section_snapshots(&timed, &sections);
    let (mut events, emit_diags) = emit(&coalesced, &tempo_map, options);
    sort_events(&mut events);

    let mut diagnostics = tie_diags;
    diagnostics.extend(emit_diags);

    let section_events = bucket_events_by_section(&events, &sections);
    let section_diagnostics: Vec<Vec<Diagnostic>> = sections.iter().map(|_| Vec::new()).collect();

    let snapshot = ProjectionSnapshot { events, diagnostics, tempo_map };

    log::debug!("[CACHE] compiled '{}' fresh: {} section(s)", clip.name, sections.len());

    let cache = CompilationCache {
        clip_name: clip.name.clone(),
        sections,
        section_events,
        section_diagnostics,
        section_tie_state_at_end: tie_states,
        snapshot: snapshot.clone(),
    };
    Ok((cache, snapshot))
}

/// Lazily compare `new_clip`'s sections against `cache`'s, in order, and
/// stop at the first mismatch (in content or in section count).
fn first_changed_section(cache_sections: &[Section], new_sections: &[Section]) -> usize {
    let shared = cache_sections.len().min(new_sections.len());
    for i in 0..shared {
        if cache_sections[i].hash != new_sections[i].hash {
            return i;
        }
    }
    shared
}

/// Recompile `new_clip` against a previous [`CompilationCache`], reusing
/// every section up to the first one whose hash changed and rebuilding only
/// from there on.
pub fn recompile(
    new_clip: &ClipNode,
    cache: &CompilationCache,
    default_bpm: f64,
    options: &EmitOptions,
) -> CompileResult<(CompilationCache, ProjectionSnapshot, RecompileStats)> {
    new_clip.check_schema()?;
    let mut new_sections = detect_sections(new_clip)?;

    let first_changed = first_changed_section(&cache.sections, &new_sections);
    let total = new_sections.len();

    if first_changed == total && total == cache.sections.len() {
        log::debug!("[CACHE] '{}' unchanged, full reuse", new_clip.name);
        let stats = RecompileStats { total_sections: total, reused_sections: total, rebuilt_sections: 0 };
        return Ok((cache.clone(), cache.snapshot.clone(), stats));
    }

    // Always rebuild the full timed sequence and tempo map: both are linear
    // in section count, not event count, so there's no material saving in
    // trying to reuse them, and the tempo map in particular must see the
    // whole clip to get ramps spanning a boundary right.
    let seq = expand_clip(new_clip, ExpansionLimits::default())?;
    let timed = time_sequence(&seq)?;
    let tempo_map = build_tempo_map(&new_clip.name, &timed, default_bpm, crate::duration::IntegrationPrecision::Standard)?;
    fill_beat_spans(&mut new_sections, &timed);

    let resume_from = if first_changed == 0 {
        Vec::new()
    } else {
        cache
            .section_tie_state_at_end
            .get(first_changed - 1)
            .cloned()
            .unwrap_or_default()
    };

    let tail_start_order = new_sections
        .get(first_changed)
        .map(|s| s.start_order)
        .unwrap_or(u64::MAX);
    let tail: Vec<TimedItem> = timed
        .into_iter()
        .filter(|t| t.item.input_order >= tail_start_order)
        .collect();

    let mut coalescer = StreamingCoalescer::resume(&resume_from);
    let mut coalesced_tail = Vec::with_capacity(tail.len());
    let mut tail_tie_states = vec![Vec::new(); new_sections.len().saturating_sub(first_changed)];
    let mut idx = first_changed;
    for item in &tail {
        coalesced_tail.extend(coalescer.push(item.clone()));
        if idx < new_sections.len() && item.item.input_order + 1 == new_sections[idx].end_order {
            tail_tie_states[idx - first_changed] = coalescer.serialize_active();
            idx += 1;
        }
    }
    let (flushed, mut tail_tie_diags) = coalescer.finish();
    coalesced_tail.extend(flushed);
    sort_events_timed(&mut coalesced_tail);

    let (mut tail_events, tail_emit_diags) = emit(&coalesced_tail, &tempo_map, options);
    sort_events(&mut tail_events);

    let mut tail_diags = Vec::new();
    tail_diags.append(&mut tail_tie_diags);
    tail_diags.extend(tail_emit_diags);

    let reused_events: Vec<Event> = cache.section_events[..first_changed].iter().flatten().cloned().collect();
    let reused_diags: Vec<Diagnostic> = cache.section_diagnostics[..first_changed].iter().flatten().cloned().collect();

    let mut events = reused_events;
    events.extend(tail_events.clone());
    sort_events(&mut events);

    let mut diagnostics = reused_diags;
    diagnostics.extend(tail_diags.clone());

    let new_section_events = bucket_events_by_section(&tail_events, &new_sections[first_changed..]);
    let mut section_events = cache.section_events[..first_changed].to_vec();
    section_events.extend(new_section_events);

    // Attributed entirely to the last rebuilt section rather than repeated
    // in every rebuilt section's bucket, to avoid double-counting on a
    // later partial reuse.
    let rebuilt_count = new_sections.len().saturating_sub(first_changed);
    let mut new_section_diags: Vec<Vec<Diagnostic>> = (0..rebuilt_count).map(|_| Vec::new()).collect();
    if let Some(last) = new_section_diags.last_mut() {
        *last = tail_diags.clone();
    }
    let mut section_diagnostics = cache.section_diagnostics[..first_changed].to_vec();
    section_diagnostics.extend(new_section_diags);

    let mut section_tie_state_at_end = cache.section_tie_state_at_end[..first_changed].to_vec();
    section_tie_state_at_end.extend(tail_tie_states);

    let snapshot = ProjectionSnapshot { events, diagnostics, tempo_map };
    let stats = RecompileStats {
        total_sections: total,
        reused_sections: first_changed,
        rebuilt_sections: total.saturating_sub(first_changed),
    };
    log::debug!(
        "[CACHE] '{}' recompiled: {} reused, {} rebuilt of {}",
        new_clip.name,
        stats.reused_sections,
        stats.rebuilt_sections,
        stats.total_sections
    );

    let cache = CompilationCache {
        clip_name: new_clip.name.clone(),
        sections: new_sections,
        section_events,
        section_diagnostics,
        section_tie_state_at_end,
        snapshot: snapshot.clone(),
    };
    Ok((cache, snapshot, stats))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{DurationSpec, TieKind};

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
    fn sections_split_on_boundary_ops() {
        let clip = ClipNode::new("c").with_operations(vec![
            note(60, 1.0),
            note(62, 1.0),
            Operation::Tempo { bpm: 140.0, transition: None },
            note(64, 1.0),
        ]);
        let sections = detect_sections(&clip).unwrap();
        assert_eq!(sections.len(), 3);
        assert_eq!(sections[0].start_op_index, 0);
        assert_eq!(sections[0].end_op_index, 2);
        assert_eq!(sections[1].start_op_index, 2);
        assert_eq!(sections[1].end_op_index, 3);
        assert_eq!(sections[2].start_op_index, 3);
        assert_eq!(sections[2].end_op_index, 4);
    }

    #[test]
    fn unchanged_clip_reuses_everything() {
        let clip = ClipNode::new("c").with_operations(vec![note(60, 1.0), note(62, 1.0)]);
        let (cache, _snap) = compile(&clip, 120.0, &EmitOptions::default()).unwrap();
        let (_cache2, _snap2, stats) = recompile(&clip, &cache, 120.0, &EmitOptions::default()).unwrap();
        assert_eq!(stats.reused_sections, stats.total_sections);
        assert_eq!(stats.rebuilt_sections, 0);
    }

    #[test]
    fn trailing_edit_reuses_leading_sections() {
        let clip = ClipNode::new("c").with_operations(vec![
            note(60, 1.0),
            Operation::Tempo { bpm: 100.0, transition: None },
            note(62, 1.0),
        ]);
        let (cache, _snap) = compile(&clip, 120.0, &EmitOptions::default()).unwrap();

        let mut edited = clip.clone();
        edited.operations[2] = note(67, 1.0); // change the last note only
        let (_cache2, snapshot, stats) = recompile(&edited, &cache, 120.0, &EmitOptions::default()).unwrap();

        assert_eq!(stats.reused_sections, 2); // leading note + tempo section untouched
        assert_eq!(stats.rebuilt_sections, 1);
        assert_eq!(snapshot.events.len(), 2);
    }

    #[test]
    fn leading_edit_forces_full_rebuild() {
        let clip = ClipNode::new("c").with_operations(vec![note(60, 1.0), note(62, 1.0), note(64, 1.0)]);
        let (cache, _snap) = compile(&clip, 120.0, &EmitOptions::default()).unwrap();

        let mut edited = clip.clone();
        edited.operations[0] = note(48, 1.0);
        let (_cache2, _snapshot, stats) = recompile(&edited, &cache, 120.0, &EmitOptions::default()).unwrap();

        assert_eq!(stats.reused_sections, 0);
        assert_eq!(stats.rebuilt_sections, 1);
    }

    #[test]
    fn cascading_classification_table() {
        let a = note(60, 1.0);
        let mut b = a.clone();
        if let Operation::Note { velocity, .. } = &mut b {
            *velocity = 0.2;
        }
        assert!(!is_cascading_change(&a, &b), "velocity-only change should not cascade");

        let mut c = a.clone();
        if let Operation::Note { duration, .. } = &mut c {
            duration.beats = 2.0;
        }
        assert!(is_cascading_change(&a, &c), "duration change must cascade");

        let tempo_a = Operation::Tempo { bpm: 120.0, transition: None };
        let tempo_b = Operation::Tempo { bpm: 90.0, transition: None };
        assert!(is_cascading_change(&tempo_a, &tempo_b));
    }

    fn tied_note(pitch: i32, beats: f64, tie: TieKind) -> Operation {
        let mut op = note(pitch, beats);
        if let Operation::Note { tie: t, .. } = &mut op {
            *t = Some(tie);
        }
        op
    }

    #[test]
    fn tie_spanning_a_recompile_still_merges() {
        let clip = ClipNode::new("c").with_operations(vec![
            tied_note(60, 1.0, TieKind::Start),
            Operation::Tempo { bpm: 100.0, transition: None },
            tied_note(60, 1.0, TieKind::End),
        ]);
        let (cache, snap) = compile(&clip, 120.0, &EmitOptions::default()).unwrap();
        assert_eq!(snap.events.len(), 1); // tied across the tempo-change boundary

        let (_cache2, snap2, _stats) = recompile(&clip, &cache, 120.0, &EmitOptions::default()).unwrap();
        assert_eq!(snap2.events.len(), 1);
    }
}
