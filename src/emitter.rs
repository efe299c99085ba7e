//! Converts timed, tie-coalesced ops into typed [`Event`]s (spec component
//! C7).
//!
//! The emitter is a total function over op kinds: every leaf operation in
//! [`Operation`] maps to exactly one (or, for `Vibrato`, one-or-two) emitted
//! event. Structural markers (`stack_start`, `scope_start`, ...) carry no
//! event of their own but drive the running transposition context and the
//! block-splice offset.

use crate::errors::Diagnostic;
use crate::expander::ExpandedKind;
use crate::events::{sort_events, Event, EventPayload};
use crate::tempo_map::TempoMap;
use crate::timer::TimedItem;
use crate::transforms::TransformPipeline;
use crate::tree::Operation;
use std::collections::HashSet;

/// Options threaded through a single emit pass.
#[derive(Clone, Debug, Default)]
pub struct EmitOptions {
    pub channel: Option<u8>,
    /// If set, an `Automation` targeting a bus not in this set produces a
    /// [`Diagnostic::SendToUnknownBus`] instead of being silently accepted.
    pub known_buses: Option<HashSet<String>>,
    pub transform: Option<TransformPipeline>,
}

fn clamp01(v: f32) -> f32 {
    v.clamp(0.0, 1.0)
}

/// Emit events for an already-timed, already-tie-coalesced sequence.
/// Returns events sorted by `(start_seconds, input_order)` per the emitter
/// invariant, plus any non-fatal diagnostics.
pub fn emit(timed: &[TimedItem], tempo_map: &TempoMap, options: &EmitOptions) -> (Vec<Event>, Vec<Diagnostic>) {
    let mut out = Vec::with_capacity(timed.len());
    let mut diagnostics = Vec::new();
    let mut transposition_stack: Vec<i32> = vec![0];

    for timed_item in timed {
        let beat_start = timed_item.beat_start;
        let start_seconds = tempo_map.beat_to_seconds(beat_start);
        let order = timed_item.item.input_order;
        let beat_index = beat_start.floor().max(0.0) as usize;
        let transposition = *transposition_stack.last().unwrap_or(&0);

        match &timed_item.item.kind {
            ExpandedKind::ScopeStart { transpose_delta, .. } => {
                let base = *transposition_stack.last().unwrap_or(&0);
                transposition_stack.push(base + transpose_delta);
                continue;
            }
            ExpandedKind::ScopeEnd => {
                if transposition_stack.len() > 1 {
                    transposition_stack.pop();
                }
                continue;
            }
            ExpandedKind::StackStart
            | ExpandedKind::BranchStart
            | ExpandedKind::BranchEnd
            | ExpandedKind::StackEnd => continue,

            ExpandedKind::BlockMarker { precompiled } => {
                for inner in &precompiled.events {
                    out.push(Event {
                        start_seconds: start_seconds + inner.start_seconds,
                        duration_seconds: inner.duration_seconds,
                        channel: inner.channel.or(options.channel),
                        input_order: order,
                        payload: inner.payload.clone(),
                    });
                }
                continue;
            }

            ExpandedKind::Op(op) => {
                emit_op(
                    op,
                    timed_item,
                    start_seconds,
                    transposition,
                    beat_index,
                    order,
                    tempo_map,
                    options,
                    &mut out,
                    &mut diagnostics,
                );
            }
        }
    }

    sort_events(&mut out);
    (out, diagnostics)
}

#[allow(clippy::too_many_arguments)]
fn emit_op(
    op: &Operation,
    timed_item: &TimedItem,
    start_seconds: f64,
    transposition: i32,
    beat_index: usize,
    order: u64,
    tempo_map: &TempoMap,
    options: &EmitOptions,
    out: &mut Vec<Event>,
    diagnostics: &mut Vec<Diagnostic>,
) {
    let position = |beats: f64| -> f64 {
        match &options.transform {
            Some(p) => p.apply_position(beats, beat_index, order),
            None => beats,
        }
    };

    match op {
        Operation::Note {
            pitch,
            velocity,
            articulation,
            detune_cents,
            tie,
            ..
        } => {
            debug_assert!(tie.is_none(), "tie coalescer must resolve all ties before emit");
            let velocity_final = match &options.transform {
                Some(p) => p.apply_velocity(clamp01(*velocity), order),
                None => clamp01(*velocity),
            };
            let beat_start_h = position(timed_item.beat_start);
            let duration_beats_h = timed_item.beat_duration;
            let start_seconds = tempo_map.beat_to_seconds(beat_start_h);
            let duration_seconds = tempo_map.duration_to_seconds(beat_start_h, duration_beats_h);
            out.push(Event {
                start_seconds,
                duration_seconds: Some(duration_seconds),
                channel: options.channel,
                input_order: order,
                payload: EventPayload::Note {
                    pitch: pitch + transposition,
                    velocity: (velocity_final * 127.0).round() as u8,
                    articulation: articulation.clone(),
                    detune_cents: *detune_cents,
                },
            });
        }

        Operation::Rest { .. } => {
            // Rests advance time (handled by the timer) but emit nothing.
        }

        Operation::Control { controller, value } => {
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: options.channel,
                input_order: order,
                payload: EventPayload::Control { controller: *controller, value: *value },
            });
        }

        Operation::PitchBend { normalized } => {
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: options.channel,
                input_order: order,
                payload: EventPayload::PitchBend { normalized: *normalized },
            });
        }

        Operation::Aftertouch { target, value } => {
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: options.channel,
                input_order: order,
                payload: EventPayload::Aftertouch { target: *target, value: *value },
            });
        }

        Operation::Vibrato { depth, rate } => {
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: options.channel,
                input_order: order,
                payload: EventPayload::Automation {
                    target: "vibrato.depth".to_string(),
                    value: *depth,
                    ramp_seconds: None,
                },
            });
            if let Some(rate) = rate {
                out.push(Event {
                    start_seconds,
                    duration_seconds: None,
                    channel: options.channel,
                    input_order: order,
                    payload: EventPayload::Automation {
                        target: "vibrato.rate".to_string(),
                        value: *rate,
                        ramp_seconds: None,
                    },
                });
            }
        }

        Operation::Automation { target, value, ramp_beats, .. } => {
            if let Some(known) = &options.known_buses {
                if !known.contains(target) {
                    diagnostics.push(Diagnostic::SendToUnknownBus {
                        beat: timed_item.beat_start,
                        bus: target.clone(),
                    });
                }
            }
            // §9 design notes: ramp_beats is converted to ramp_seconds here
            // even though the source emitter did not always do so.
            let ramp_seconds = ramp_beats.map(|beats| tempo_map.duration_to_seconds(timed_item.beat_start, beats));
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: options.channel,
                input_order: order,
                payload: EventPayload::Automation { target: target.clone(), value: *value, ramp_seconds },
            });
        }

        Operation::Tempo { bpm, transition } => {
            let transition_seconds = transition
                .as_ref()
                .map(|t| tempo_map.duration_to_seconds(timed_item.beat_start, t.duration_beats));
            out.push(Event {
                start_seconds,
                duration_seconds: None,
                channel: None,
                input_order: order,
                payload: EventPayload::Tempo { bpm: *bpm, transition_seconds },
            });
        }

        Operation::TimeSignature { .. } => {
            // Carried by the timer's measure/beat-in-measure bookkeeping;
            // nothing in the event model represents it directly.
        }

        // These are consumed at expansion time (unrolled into a Stack,
        // Loop, ClipRef, Scope, Transpose, or Block) and never reach the
        // emitter as an `Op` variant of the expanded stream.
        Operation::Stack { .. }
        | Operation::Loop { .. }
        | Operation::ClipRef { .. }
        | Operation::Scope { .. }
        | Operation::Transpose { .. }
        | Operation::Block { .. } => {
            debug_assert!(false, "structural op reached the emitter as a leaf: {op:?}");
        }
    }
}
