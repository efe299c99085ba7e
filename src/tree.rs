//! Immutable operation tree with versioned schema and structural hashing
//! (spec component C2).
//!
//! A [`ClipNode`] is the root of a tree of [`Operation`]s. The tree is plain
//! data, no back-pointers, no shared mutable state, which is what lets the
//! expander walk it with an explicit stack and the cache hash it section by
//! section.

use crate::events::Event;
use serde::{Deserialize, Serialize};

/// Current schema version understood by this compiler. A clip whose major
/// version doesn't match surfaces [`crate::errors::CompileError::SchemaVersionMismatch`].
pub const SCHEMA_VERSION: u32 = 1;

/// Tie role on a [`Operation::Note`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TieKind {
    Start,
    Continue,
    End,
}

/// Aftertouch addressing: either a whole-channel pressure value or a
/// per-pitch (polyphonic) one.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum AftertouchTarget {
    Channel,
    Poly { pitch: i32 },
}

/// Easing curve for an [`Operation::Tempo`] transition. Mirrors
/// [`crate::duration::TempoCurve`] at the tree level so the tree module has
/// no dependency on the duration module's integration machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Curve {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl From<Curve> for crate::duration::TempoCurve {
    fn from(c: Curve) -> Self {
        match c {
            Curve::Linear => crate::duration::TempoCurve::Linear,
            Curve::EaseIn => crate::duration::TempoCurve::EaseIn,
            Curve::EaseOut => crate::duration::TempoCurve::EaseOut,
            Curve::EaseInOut => crate::duration::TempoCurve::EaseInOut,
        }
    }
}

/// A tempo ramp attached to a [`Operation::Tempo`] op.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempoTransition {
    pub duration_beats: f64,
    pub curve: Curve,
    /// Request sample-accurate rounding for events inside the ramp.
    pub precise: bool,
}

/// Which ambient properties a [`Operation::Scope`] isolates and restores on
/// exit.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeIsolation {
    pub tempo: bool,
    pub transposition: bool,
    pub velocity: bool,
}

/// A token for a musical duration, symbolic (`4n`) or already resolved to a
/// beat count (used by synthetic/generated trees that skip the parser).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DurationSpec {
    pub beats: f64,
}

impl DurationSpec {
    pub fn beats(beats: f64) -> Self {
        Self { beats }
    }

    pub fn from_token(token: &str) -> Result<Self, crate::duration::DurationParseError> {
        Ok(Self {
            beats: crate::duration::NoteDuration::parse(token)?.to_beats(),
        })
    }
}

/// An already-compiled sub-sequence spliced in verbatim by the emitter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrecompiledBlock {
    #[serde(skip)]
    pub events: Vec<Event>,
    pub beat_duration: f64,
}

impl PartialEq for PrecompiledBlock {
    fn eq(&self, other: &Self) -> bool {
        // Precompiled blocks are opaque; two are equal (for change
        // classification) iff they have the same duration and event count.
        self.beat_duration == other.beat_duration && self.events.len() == other.events.len()
    }
}

/// The operation sum type (spec §3).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Note {
        pitch: i32,
        duration: DurationSpec,
        velocity: f32,
        articulation: Option<String>,
        detune_cents: Option<f32>,
        timbre: Option<String>,
        pressure: Option<f32>,
        glide: Option<f32>,
        tie: Option<TieKind>,
        voice_id: Option<u8>,
    },
    Rest {
        duration: DurationSpec,
    },
    Stack {
        children: Vec<Operation>,
    },
    Loop {
        count: u32,
        children: Vec<Operation>,
    },
    ClipRef {
        inner: Box<ClipNode>,
    },
    Scope {
        isolate: ScopeIsolation,
        inner: Box<Operation>,
    },
    Tempo {
        bpm: f64,
        transition: Option<TempoTransition>,
    },
    TimeSignature {
        numerator: u32,
        denominator: u32,
    },
    Transpose {
        semitones: i32,
        inner: Box<Operation>,
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
    Vibrato {
        depth: f32,
        rate: Option<f32>,
    },
    Automation {
        target: String,
        value: f32,
        ramp_beats: Option<f64>,
        curve: Option<Curve>,
    },
    Block {
        precompiled: PrecompiledBlock,
    },
}

impl Operation {
    /// A short kind tag, used by the cache's change classifier and by
    /// logging, stable across versions even if fields are added.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            Operation::Note { .. } => "note",
            Operation::Rest { .. } => "rest",
            Operation::Stack { .. } => "stack",
            Operation::Loop { .. } => "loop",
            Operation::ClipRef { .. } => "clip",
            Operation::Scope { .. } => "scope",
            Operation::Tempo { .. } => "tempo",
            Operation::TimeSignature { .. } => "time_signature",
            Operation::Transpose { .. } => "transpose",
            Operation::Control { .. } => "control",
            Operation::PitchBend { .. } => "pitch_bend",
            Operation::Aftertouch { .. } => "aftertouch",
            Operation::Vibrato { .. } => "vibrato",
            Operation::Automation { .. } => "automation",
            Operation::Block { .. } => "block",
        }
    }

    /// Whether this op is one of the boundary kinds that split incremental
    /// cache sections (spec §4.6: tempo, time_signature, loop, stack, scope).
    pub fn is_section_boundary(&self) -> bool {
        matches!(
            self,
            Operation::Tempo { .. }
                | Operation::TimeSignature { .. }
                | Operation::Loop { .. }
                | Operation::Stack { .. }
                | Operation::Scope { .. }
        )
    }
}

/// The root of a tree: a named clip with its own default tempo/time
/// signature/groove context.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClipNode {
    pub version: u32,
    pub name: String,
    pub operations: Vec<Operation>,
    pub tempo: Option<f64>,
    pub time_signature: Option<(u32, u32)>,
    pub swing: Option<f32>,
    pub groove: Option<Vec<f64>>,
}

impl ClipNode {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: SCHEMA_VERSION,
            name: name.into(),
            operations: Vec::new(),
            tempo: None,
            time_signature: None,
            swing: None,
            groove: None,
        }
    }

    pub fn with_operations(mut self, ops: Vec<Operation>) -> Self {
        self.operations = ops;
        self
    }

    /// Check the clip's schema major version against what this compiler
    /// understands. Only a mismatch in the major component is an error;
    /// this crate treats the whole version as major (no minor drift yet).
    pub fn check_schema(&self) -> crate::errors::CompileResult<()> {
        if self.version != SCHEMA_VERSION {
            return Err(crate::errors::CompileError::SchemaVersionMismatch {
                clip: self.name.clone(),
                expected: SCHEMA_VERSION,
                got: self.version,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Structural hashing
// ---------------------------------------------------------------------------

/// djb2 hash seed, per spec §4.6 (`hashClip` combines metadata and ordered
/// operation hashes via this algorithm).
const DJB2_SEED: u64 = 5381;

fn djb2(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u64);
    }
    hash
}

/// Stable, sorted-key JSON-ish serialization used only for hashing. Skips
/// nothing here since the tree has no `_source`/debug fields to begin with;
/// numbers are serialized via their bit pattern so -0.0/0.0 and NaN variants
/// hash distinctly but deterministically.
fn stable_serialize_into(op: &Operation, out: &mut String) {
    use std::fmt::Write;
    match op {
        Operation::Note {
            pitch,
            duration,
            velocity,
            articulation,
            detune_cents,
            timbre,
            pressure,
            glide,
            tie,
            voice_id,
        } => {
            let _ = write!(
                out,
                "{{\"k\":\"note\",\"art\":{:?},\"det\":{},\"dur\":{},\"glide\":{},\"pitch\":{},\"press\":{},\"tie\":{:?},\"timbre\":{:?},\"v\":{},\"voice\":{:?}}}",
                articulation,
                opt_f32(*detune_cents),
                duration.beats.to_bits(),
                opt_f32(*glide),
                pitch,
                opt_f32(*pressure),
                tie,
                timbre,
                velocity.to_bits(),
                voice_id
            );
        }
        Operation::Rest { duration } => {
            let _ = write!(out, "{{\"dur\":{},\"k\":\"rest\"}}", duration.beats.to_bits());
        }
        Operation::Stack { children } => {
            out.push_str("{\"children\":[");
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                stable_serialize_into(c, out);
            }
            out.push_str("],\"k\":\"stack\"}");
        }
        Operation::Loop { count, children } => {
            let _ = write!(out, "{{\"children\":[");
            for (i, c) in children.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                stable_serialize_into(c, out);
            }
            let _ = write!(out, "],\"count\":{},\"k\":\"loop\"}}", count);
        }
        Operation::ClipRef { inner } => {
            out.push_str("{\"inner\":");
            out.push_str(&hash_clip(inner).to_string());
            out.push_str(",\"k\":\"clip\"}");
        }
        Operation::Scope { isolate, inner } => {
            let _ = write!(
                out,
                "{{\"inner\":"
            );
            stable_serialize_into(inner, out);
            let _ = write!(
                out,
                ",\"iso_t\":{},\"iso_tr\":{},\"iso_v\":{},\"k\":\"scope\"}}",
                isolate.tempo, isolate.transposition, isolate.velocity
            );
        }
        Operation::Tempo { bpm, transition } => {
            let _ = write!(
                out,
                "{{\"bpm\":{},\"k\":\"tempo\",\"trans\":{:?}}}",
                bpm.to_bits(),
                transition
            );
        }
        Operation::TimeSignature { numerator, denominator } => {
            let _ = write!(
                out,
                "{{\"den\":{},\"k\":\"time_signature\",\"num\":{}}}",
                denominator, numerator
            );
        }
        Operation::Transpose { semitones, inner } => {
            let _ = write!(out, "{{\"inner\":");
            stable_serialize_into(inner, out);
            let _ = write!(out, ",\"k\":\"transpose\",\"semi\":{}}}", semitones);
        }
        Operation::Control { controller, value } => {
            let _ = write!(
                out,
                "{{\"ctrl\":{},\"k\":\"control\",\"val\":{}}}",
                controller,
                value.to_bits()
            );
        }
        Operation::PitchBend { normalized } => {
            let _ = write!(out, "{{\"k\":\"pitch_bend\",\"v\":{}}}", normalized.to_bits());
        }
        Operation::Aftertouch { target, value } => {
            let _ = write!(
                out,
                "{{\"k\":\"aftertouch\",\"target\":{:?},\"v\":{}}}",
                target,
                value.to_bits()
            );
        }
        Operation::Vibrato { depth, rate } => {
            let _ = write!(
                out,
                "{{\"depth\":{},\"k\":\"vibrato\",\"rate\":{}}}",
                depth.to_bits(),
                opt_f32(*rate)
            );
        }
        Operation::Automation {
            target,
            value,
            ramp_beats,
            curve,
        } => {
            let _ = write!(
                out,
                "{{\"curve\":{:?},\"k\":\"automation\",\"ramp\":{},\"target\":{:?},\"v\":{}}}",
                curve,
                opt_f64(*ramp_beats),
                target,
                value.to_bits()
            );
        }
        Operation::Block { precompiled } => {
            let _ = write!(
                out,
                "{{\"dur\":{},\"k\":\"block\",\"n\":{}}}",
                precompiled.beat_duration.to_bits(),
                precompiled.events.len()
            );
        }
    }
}

fn opt_f32(v: Option<f32>) -> u32 {
    v.map(|x| x.to_bits()).unwrap_or(0)
}

fn opt_f64(v: Option<f64>) -> u64 {
    v.map(|x| x.to_bits()).unwrap_or(0)
}

/// Hash a single operation (and, recursively, its children) with djb2 over
/// its stable serialization.
pub fn hash_operation(op: &Operation) -> u64 {
    let mut buf = String::new();
    stable_serialize_into(op, &mut buf);
    djb2(DJB2_SEED, buf.as_bytes())
}

/// Hash a clip: combines clip-level metadata with the ordered hash of every
/// top-level operation.
pub fn hash_clip(clip: &ClipNode) -> u64 {
    let mut h = DJB2_SEED;
    h = djb2(h, clip.name.as_bytes());
    h = djb2(h, &clip.version.to_le_bytes());
    h = djb2(h, &opt_f64(clip.tempo).to_le_bytes());
    if let Some((n, d)) = clip.time_signature {
        h = djb2(h, &n.to_le_bytes());
        h = djb2(h, &d.to_le_bytes());
    }
    for op in &clip.operations {
        h = djb2(h, &hash_operation(op).to_le_bytes());
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn hash_is_deterministic() {
        let a = note(60, 1.0);
        let b = note(60, 1.0);
        assert_eq!(hash_operation(&a), hash_operation(&b));
    }

    #[test]
    fn hash_distinguishes_pitch() {
        let a = note(60, 1.0);
        let b = note(61, 1.0);
        assert_ne!(hash_operation(&a), hash_operation(&b));
    }

    #[test]
    fn hash_distinguishes_non_cascading_fields_too() {
        // Hashing is strict equality; cascading classification (C8) is the
        // layer that decides which differences matter for cache reuse.
        let mut a = note(60, 1.0);
        if let Operation::Note { velocity, .. } = &mut a {
            *velocity = 0.5;
        }
        let b = note(60, 1.0);
        assert_ne!(hash_operation(&a), hash_operation(&b));
    }

    #[test]
    fn clip_schema_check() {
        let clip = ClipNode::new("lead");
        assert!(clip.check_schema().is_ok());
        let mut bad = clip.clone();
        bad.version = 99;
        assert!(bad.check_schema().is_err());
    }

    #[test]
    fn section_boundary_kinds() {
        assert!(Operation::Tempo { bpm: 120.0, transition: None }.is_section_boundary());
        assert!(!note(60, 1.0).is_section_boundary());
    }
}
