//! Typed errors and non-fatal diagnostics surfaced at the compile API boundary.
//!
//! Two tiers per the error handling design: [`CompileError`] aborts a compile
//! outright (programmer errors / resource violations), while [`Diagnostic`]
//! rides along with a best-effort result (musical ambiguities). Diagnostics
//! are never thrown, they accumulate in `metadata.warnings`.

use thiserror::Error;

/// The kind of resource bound an expansion tripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LimitKind {
    Operations,
    Depth,
    LoopExpansions,
    ContextStack,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LimitKind::Operations => write!(f, "operations"),
            LimitKind::Depth => write!(f, "depth"),
            LimitKind::LoopExpansions => write!(f, "loop expansions"),
            LimitKind::ContextStack => write!(f, "context stack"),
        }
    }
}

/// Errors that abort a compile. Carries enough context (clip name, limit
/// value) for a caller to report something actionable.
#[derive(Error, Debug, Clone)]
pub enum CompileError {
    /// A tempo endpoint was <= 0 during integration.
    #[error("bad tempo in clip '{clip}': {detail}")]
    BadTempo { clip: String, detail: String },

    /// A resource bound configured on the expander was exceeded.
    #[error("limit exceeded in clip '{clip}': {kind} at {at} (limit {limit})")]
    LimitExceeded {
        clip: String,
        kind: LimitKind,
        at: usize,
        limit: usize,
    },

    /// An `Automation`/`Control` targeted a bus the caller never declared.
    #[error("unknown bus '{bus}' referenced in clip '{clip}'")]
    UnknownBus { clip: String, bus: String },

    /// A cached or incoming clip's schema version doesn't match what this
    /// compiler understands (major-version drift).
    #[error("schema version mismatch in clip '{clip}': expected {expected}, got {got}")]
    SchemaVersionMismatch {
        clip: String,
        expected: u32,
        got: u32,
    },

    /// A malformed structural marker pairing or other internal invariant
    /// violation. Always a bug in this crate, never in caller input.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Non-fatal musical ambiguities. Reported through `metadata.warnings`,
/// never thrown.
#[derive(Clone, Debug, PartialEq)]
pub enum Diagnostic {
    /// A `tie=start` was active when another `tie=start` arrived on the
    /// same voice/pitch key. The previous one was flushed as-is.
    OrphanedTieStart { beat: f64, pitch: i32, voice_id: u8 },
    /// A `tie=continue` arrived with no active tie on the key; passed
    /// through as an untied note.
    OrphanedTieContinue { beat: f64, pitch: i32, voice_id: u8 },
    /// A `tie=end` arrived with no active tie on the key; passed through
    /// as an untied note.
    OrphanedTieEnd { beat: f64, pitch: i32, voice_id: u8 },
    /// An `Automation`/`Control` targeted a bus name the caller's registry
    /// doesn't recognize. Non-fatal variant of [`CompileError::UnknownBus`],
    /// used when the caller opted into "warn, don't fail" mode.
    SendToUnknownBus { beat: f64, bus: String },
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Diagnostic::OrphanedTieStart { beat, pitch, voice_id } => write!(
                f,
                "orphaned tie-start at beat {beat} for pitch {pitch} (voice {voice_id})"
            ),
            Diagnostic::OrphanedTieContinue { beat, pitch, voice_id } => write!(
                f,
                "orphaned tie-continue at beat {beat} for pitch {pitch} (voice {voice_id})"
            ),
            Diagnostic::OrphanedTieEnd { beat, pitch, voice_id } => write!(
                f,
                "orphaned tie-end at beat {beat} for pitch {pitch} (voice {voice_id})"
            ),
            Diagnostic::SendToUnknownBus { beat, bus } => {
                write!(f, "send to unknown bus '{bus}' at beat {beat}")
            }
        }
    }
}
