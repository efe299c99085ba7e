//! Score compiler and live-update scheduler.
//!
//! This crate turns a declarative score tree into a flat, time-ordered event
//! stream, and keeps that stream live as the tree is edited. It is organized
//! around the pipeline a clip goes through on its way to sound:
//!
//! - **Duration** ([`duration`]) - exact rational note durations and the
//!   tempo-curve integration math used to turn beats into seconds.
//! - **Tree** ([`tree`]) / **Session** ([`session`]) - the score's input
//!   shape: clips of [`tree::Operation`]s, grouped into tracks by
//!   [`session::SessionNode`].
//! - **Expander** ([`expander`]) - an explicit-stack walk that unrolls loops,
//!   inlines clip references, and flattens stacks/scopes into a linear
//!   stream, enforcing resource limits along the way.
//! - **Timer** ([`timer`]) - assigns beat positions and measure numbers to
//!   the expanded stream.
//! - **Tie** ([`tie`]) - coalesces tied notes, in both a batch and a
//!   streaming (incremental) form.
//! - **Tempo map** ([`tempo_map`]) - the piecewise BPM function used to
//!   convert beat positions to seconds.
//! - **Emitter** ([`emitter`]) - the total function from timed, tied
//!   operations to typed [`events::Event`]s.
//! - **Cache** ([`cache`]) - section-based incremental recompilation.
//! - **Bytecode** ([`bytecode`]) - an alternate, tick-based compile target
//!   for VM-style backends.
//! - **Scheduler** ([`scheduler`]) / **Backend** ([`backend`]) - a beat-aware
//!   live scheduler that drains compiled events into a pluggable backend.
//!
//! # Compiling a clip
//!
//! [`compile_clip`] runs a clip through the whole pipeline once.
//! [`estimate_expansion`] answers "how big would this get" without doing the
//! work. [`incremental_compile`] re-runs the pipeline against a previous
//! [`cache::CompilationCache`], reusing everything upstream of the first
//! edited section.

pub mod backend;
pub mod bytecode;
pub mod cache;
pub mod duration;
pub mod emitter;
pub mod errors;
pub mod events;
pub mod expander;
pub mod scheduler;
pub mod session;
pub mod tempo_map;
pub mod tie;
pub mod timer;
pub mod timing;
pub mod transforms;
pub mod tree;

use cache::{CompilationCache, ProjectionSnapshot, RecompileStats};
use emitter::EmitOptions;
use errors::{CompileResult, Diagnostic};
use expander::ExpansionEstimate;
use tempo_map::TempoMap;
use tree::ClipNode;

/// Result of [`compile_clip`]: the flattened event stream plus everything a
/// caller needs to schedule or re-derive timing from it.
#[derive(Clone, Debug)]
pub struct CompiledClip {
    pub events: Vec<events::Event>,
    pub duration_seconds: f64,
    pub duration_beats: f64,
    pub tempo_map: TempoMap,
    pub metadata: CompileMetadata,
}

/// Non-fatal diagnostics collected during a compile, surfaced separately
/// from the events so a caller can log or display them without having to
/// filter the event stream.
#[derive(Clone, Debug, Default)]
pub struct CompileMetadata {
    pub warnings: Vec<Diagnostic>,
}

/// Compile a single clip end to end: expand, time, coalesce ties, build the
/// tempo map, and emit events. `default_bpm` is used when neither the clip
/// nor a caller-provided session supplies a tempo.
pub fn compile_clip(
    clip: &ClipNode,
    default_bpm: f64,
    options: &EmitOptions,
) -> CompileResult<CompiledClip> {
    let (_cache, snapshot) = cache::compile(clip, default_bpm, options)?;
    Ok(compiled_from_snapshot(snapshot))
}

/// Re-derive duration in beats from the tempo map, so callers don't need
/// their own separate "walk the tree and sum durations" pass.
fn compiled_from_snapshot(snapshot: ProjectionSnapshot) -> CompiledClip {
    let last_end_seconds = snapshot
        .events
        .iter()
        .map(|e| e.start_seconds + e.duration_seconds)
        .fold(0.0_f64, f64::max);
    let duration_seconds = snapshot.tempo_map.total_seconds().max(last_end_seconds);
    let duration_beats = invert_seconds_to_beats(&snapshot.tempo_map, duration_seconds);
    CompiledClip {
        events: snapshot.events,
        duration_seconds,
        duration_beats,
        tempo_map: snapshot.tempo_map,
        metadata: CompileMetadata { warnings: snapshot.diagnostics },
    }
}

/// Binary search for the beat whose `beat_to_seconds` is closest to
/// `target_seconds`. Used only to report a human-facing beat count
/// alongside the authoritative seconds duration.
fn invert_seconds_to_beats(map: &TempoMap, target_seconds: f64) -> f64 {
    if target_seconds <= 0.0 {
        return 0.0;
    }
    let mut lo = 0.0_f64;
    let mut hi = 1.0_f64;
    while map.beat_to_seconds(hi) < target_seconds && hi < 1e9 {
        hi *= 2.0;
    }
    for _ in 0..64 {
        let mid = (lo + hi) / 2.0;
        if map.beat_to_seconds(mid) < target_seconds {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    hi
}

/// Estimate the worst-case size of expanding a clip, without expanding it.
/// Intended for callers deciding whether a clip is safe to compile at all
/// before paying for the real pass.
pub fn estimate_expansion(clip: &ClipNode) -> ExpansionEstimate {
    expander::estimate(clip)
}

/// Result of [`incremental_compile`]: the refreshed compiled clip, the
/// updated cache to keep for the next edit, and stats about how much of the
/// previous compile was reused.
pub struct IncrementalResult {
    pub compiled: CompiledClip,
    pub cache: CompilationCache,
    pub stats: RecompileStats,
}

/// Recompile `clip` against a cache from a previous [`compile_clip`] or
/// [`incremental_compile`] call, reusing every section up to the first one
/// whose content changed.
pub fn incremental_compile(
    clip: &ClipNode,
    cache: &CompilationCache,
    default_bpm: f64,
    options: &EmitOptions,
) -> CompileResult<IncrementalResult> {
    let (new_cache, snapshot, stats) = cache::recompile(clip, cache, default_bpm, options)?;
    Ok(IncrementalResult {
        compiled: compiled_from_snapshot(snapshot),
        cache: new_cache,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree::{ClipNode, Operation};

    fn note(pitch: i32, beats: f64) -> Operation {
        Operation::Note {
            pitch,
            duration: tree::DurationSpec { beats },
            velocity: 0.8,
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
    fn compiles_a_simple_clip() {
        let mut clip = ClipNode::new("lead");
        clip.operations = vec![note(60, 1.0), note(62, 1.0), note(64, 1.0)];
        let compiled = compile_clip(&clip, 120.0, &EmitOptions::default()).unwrap();
        assert_eq!(compiled.events.len(), 3);
        assert!(compiled.duration_seconds > 0.0);
        assert!(compiled.metadata.warnings.is_empty());
    }

    #[test]
    fn estimate_does_not_expand() {
        let mut clip = ClipNode::new("lead");
        clip.operations = vec![Operation::Loop {
            count: 10_000,
            children: vec![note(60, 1.0)],
        }];
        let estimate = estimate_expansion(&clip);
        assert_eq!(estimate.estimated_operations, 10_000);
    }

    #[test]
    fn incremental_compile_reuses_unchanged_clip() {
        let mut clip = ClipNode::new("lead");
        clip.operations = vec![note(60, 1.0), note(62, 1.0)];
        let (cache, _) = cache::compile(&clip, 120.0, &EmitOptions::default()).unwrap();
        let result = incremental_compile(&clip, &cache, 120.0, &EmitOptions::default()).unwrap();
        assert_eq!(result.stats.reused_sections, result.stats.total_sections);
        assert_eq!(result.stats.rebuilt_sections, 0);
    }
}
