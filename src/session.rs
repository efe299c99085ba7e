//! Session and track boundary types (spec §6, external interfaces).
//!
//! A [`SessionNode`] is what a caller hands to the compiler: a set of named
//! tracks, each wrapping a [`ClipNode`]. Per the ingestion rule in the
//! design notes, anything that could form a cycle (an instrument sidechained
//! to another instrument, a bus fed by another bus) is resolved at this
//! boundary into a plain ID. `TrackNode` never holds a reference to
//! another track, only `instrument_id: String`.

use crate::timing::TimeSignature;
use crate::tree::{ClipNode, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

/// One track in a session: a clip plus the routing metadata the compiler
/// doesn't interpret but carries through to the emitted events' `channel`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackNode {
    pub version: u32,
    pub name: Option<String>,
    pub clip: ClipNode,
    /// Opaque identifier into a caller-owned instrument registry. Never a
    /// direct reference, see module docs.
    pub instrument_id: String,
    pub midi_channel: Option<u8>,
}

impl TrackNode {
    pub fn new(instrument_id: impl Into<String>, clip: ClipNode) -> Self {
        Self {
            version: SCHEMA_VERSION,
            name: None,
            clip,
            instrument_id: instrument_id.into(),
            midi_channel: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_midi_channel(mut self, channel: u8) -> Self {
        self.midi_channel = Some(channel);
        self
    }

    pub fn check_schema(&self) -> crate::errors::CompileResult<()> {
        if self.version != SCHEMA_VERSION {
            return Err(crate::errors::CompileError::SchemaVersionMismatch {
                clip: self.clip.name.clone(),
                expected: SCHEMA_VERSION,
                got: self.version,
            });
        }
        self.clip.check_schema()
    }
}

/// A full session: every track that should compile and schedule together,
/// plus session-wide defaults a track's clip can omit and fall back to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionNode {
    pub version: u32,
    pub tracks: Vec<TrackNode>,
    pub tempo: Option<f64>,
    pub time_signature: Option<(u32, u32)>,
}

impl SessionNode {
    pub fn new() -> Self {
        Self {
            version: SCHEMA_VERSION,
            tracks: Vec::new(),
            tempo: None,
            time_signature: None,
        }
    }

    pub fn with_tracks(mut self, tracks: Vec<TrackNode>) -> Self {
        self.tracks = tracks;
        self
    }

    pub fn with_tempo(mut self, bpm: f64) -> Self {
        self.tempo = Some(bpm);
        self
    }

    /// A track's own clip tempo/time-signature wins; otherwise it inherits
    /// the session's default so every track compiles with a concrete value.
    pub fn effective_tempo(&self, track: &TrackNode) -> f64 {
        track.clip.tempo.or(self.tempo).unwrap_or(120.0)
    }

    pub fn effective_time_signature(&self, track: &TrackNode) -> TimeSignature {
        track
            .clip
            .time_signature
            .or(self.time_signature)
            .map(TimeSignature::from)
            .unwrap_or_default()
    }

    pub fn check_schema(&self) -> crate::errors::CompileResult<()> {
        if self.version != SCHEMA_VERSION {
            return Err(crate::errors::CompileError::SchemaVersionMismatch {
                clip: "<session>".into(),
                expected: SCHEMA_VERSION,
                got: self.version,
            });
        }
        for track in &self.tracks {
            track.check_schema()?;
        }
        Ok(())
    }

    /// Find a track by name, the usual way callers address one for splice
    /// or live-update purposes.
    pub fn track_by_name(&self, name: &str) -> Option<&TrackNode> {
        self.tracks.iter().find(|t| t.name.as_deref() == Some(name))
    }
}

impl Default for SessionNode {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::ClipNode;

    #[test]
    fn effective_tempo_falls_back_to_session() {
        let session = SessionNode::new().with_tempo(140.0);
        let track = TrackNode::new("inst:lead", ClipNode::new("lead"));
        assert_eq!(session.effective_tempo(&track), 140.0);
    }

    #[test]
    fn track_tempo_overrides_session() {
        let session = SessionNode::new().with_tempo(140.0);
        let mut clip = ClipNode::new("lead");
        clip.tempo = Some(90.0);
        let track = TrackNode::new("inst:lead", clip);
        assert_eq!(session.effective_tempo(&track), 90.0);
    }

    #[test]
    fn finds_track_by_name() {
        let track = TrackNode::new("inst:lead", ClipNode::new("lead")).with_name("lead");
        let session = SessionNode::new().with_tracks(vec![track]);
        assert!(session.track_by_name("lead").is_some());
        assert!(session.track_by_name("bass").is_none());
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let mut session = SessionNode::new();
        session.version = 99;
        assert!(session.check_schema().is_err());
    }
}
