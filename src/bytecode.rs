//! Tick-based opcode stream, an alternative compile target to the direct
//! event emitter (spec component C9).
//!
//! Where the emitter (C7) produces absolute-time [`Event`]s in one pass, the
//! bytecode backend compiles to a small instruction stream a player can
//! step through tick by tick, useful when the consumer wants to re-run the
//! same compiled program under different humanize seeds without
//! recompiling the tree. Loops can either be unrolled at compile time
//! (`LoopMode::Unroll`) or kept as real jumps the player executes
//! (`LoopMode::Structural`).

use crate::errors::{CompileError, CompileResult, Diagnostic, LimitKind};
use crate::events::{Event, EventPayload};
use crate::tempo_map::TempoMap;
use crate::transforms::TransformPipeline;
use crate::tree::{AftertouchTarget, ClipNode, Operation};

/// One instruction. Ticks are integer beat-subdivisions (spec: 480 per
/// quarter note, matching the usual MIDI PPQ so durations always round to
/// an exact tick count).
pub const TICKS_PER_BEAT: u32 = 480;

#[derive(Clone, Debug, PartialEq)]
pub enum Opcode {
    Note { pitch: i32, velocity: f32, duration_ticks: u32, articulation: Option<String>, detune_cents: Option<f32> },
    Rest { duration_ticks: u32 },
    Tempo { bpm: f64, transition_ticks: Option<u32> },
    Cc { controller: u32, value: f32 },
    Bend { normalized: f32 },
    Aftertouch { target: AftertouchTarget, value: f32 },
    LoopStart { count: u32 },
    LoopEnd,
    StackStart,
    BranchStart,
    BranchEnd,
    StackEnd,
    ScopeStart { transpose_delta: i32 },
    ScopeEnd,
    Eof,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub opcode: Opcode,
    /// Absolute tick position at which this instruction's effect begins.
    /// Structural markers share the tick of their surrounding context.
    pub tick: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopMode {
    /// Compile a `Loop` into real `LOOP_START(count)`/`LOOP_END` jumps; the
    /// player repeats the body `count` times itself.
    Structural,
    /// Unroll each iteration into its own copy of the body at compile time.
    /// Each iteration draws from a distinct humanize seed (`seed + i*1000`,
    /// spec's fixed derivation) and the whole program is globally resorted
    /// by tick afterward, since unrolled iterations interleave with
    /// whatever follows the loop.
    Unroll,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BytecodeOptions {
    pub loop_mode: LoopMode,
    /// Fixed-depth context stack for the zero-allocation player variant;
    /// compiling with a nesting depth beyond this fails with
    /// `LimitExceeded(ContextStack)` rather than growing unboundedly.
    pub max_context_stack: usize,
    pub base_seed: u32,
}

impl Default for BytecodeOptions {
    fn default() -> Self {
        Self { loop_mode: LoopMode::Structural, max_context_stack: 32, base_seed: 0 }
    }
}

fn ticks_for_beats(beats: f64) -> u32 {
    (beats * TICKS_PER_BEAT as f64).round().max(0.0) as u32
}

struct Compiler<'a> {
    options: &'a BytecodeOptions,
    clip_name: String,
    out: Vec<Instruction>,
    context_depth: usize,
}

impl<'a> Compiler<'a> {
    fn check_context_depth(&self) -> CompileResult<()> {
        if self.context_depth > self.options.max_context_stack {
            return Err(CompileError::LimitExceeded {
                clip: self.clip_name.clone(),
                kind: LimitKind::ContextStack,
                at: self.context_depth,
                limit: self.options.max_context_stack,
            });
        }
        Ok(())
    }

    fn emit(&mut self, opcode: Opcode, tick: u32) {
        self.out.push(Instruction { opcode, tick });
    }

    fn walk(&mut self, ops: &[Operation], tick: &mut u32, seed_offset: u32) -> CompileResult<()> {
        for op in ops {
            self.walk_one(op, tick, seed_offset)?;
        }
        Ok(())
    }

    fn walk_one(&mut self, op: &Operation, tick: &mut u32, seed_offset: u32) -> CompileResult<()> {
        match op {
            Operation::Note { pitch, duration, velocity, articulation, detune_cents, .. } => {
                let dur = ticks_for_beats(duration.beats);
                self.emit(
                    Opcode::Note {
                        pitch: *pitch,
                        velocity: *velocity,
                        duration_ticks: dur,
                        articulation: articulation.clone(),
                        detune_cents: *detune_cents,
                    },
                    *tick,
                );
                *tick += dur;
            }
            Operation::Rest { duration } => {
                let dur = ticks_for_beats(duration.beats);
                self.emit(Opcode::Rest { duration_ticks: dur }, *tick);
                *tick += dur;
            }
            Operation::Control { controller, value } => {
                self.emit(Opcode::Cc { controller: *controller, value: *value }, *tick);
            }
            Operation::PitchBend { normalized } => {
                self.emit(Opcode::Bend { normalized: *normalized }, *tick);
            }
            Operation::Aftertouch { target, value } => {
                self.emit(Opcode::Aftertouch { target: *target, value: *value }, *tick);
            }
            Operation::Tempo { bpm, transition } => {
                let transition_ticks = transition.map(|t| ticks_for_beats(t.duration_beats));
                self.emit(Opcode::Tempo { bpm: *bpm, transition_ticks }, *tick);
            }
            Operation::Stack { children } => {
                self.context_depth += 1;
                self.check_context_depth()?;
                self.emit(Opcode::StackStart, *tick);
                let branch_start = *tick;
                let mut max_tick = branch_start;
                for child in children {
                    let mut branch_tick = branch_start;
                    self.emit(Opcode::BranchStart, branch_tick);
                    self.walk_one(child, &mut branch_tick, seed_offset)?;
                    self.emit(Opcode::BranchEnd, branch_tick);
                    max_tick = max_tick.max(branch_tick);
                }
                self.emit(Opcode::StackEnd, max_tick);
                *tick = max_tick;
                self.context_depth -= 1;
            }
            Operation::Loop { count, children } => match self.options.loop_mode {
                LoopMode::Structural => {
                    self.context_depth += 1;
                    self.check_context_depth()?;
                    self.emit(Opcode::LoopStart { count: *count }, *tick);
                    self.walk(children, tick, seed_offset)?;
                    self.emit(Opcode::LoopEnd, *tick);
                    self.context_depth -= 1;
                }
                LoopMode::Unroll => {
                    for i in 0..*count {
                        // Spec's fixed per-iteration seed derivation.
                        self.walk(children, tick, seed_offset + i * 1000)?;
                    }
                }
            },
            Operation::ClipRef { inner } => {
                self.context_depth += 1;
                self.check_context_depth()?;
                self.walk(&inner.operations, tick, seed_offset)?;
                self.context_depth -= 1;
            }
            Operation::Scope { isolate, inner } => {
                self.context_depth += 1;
                self.check_context_depth()?;
                self.emit(Opcode::ScopeStart { transpose_delta: 0 }, *tick);
                let _ = isolate;
                self.walk_one(inner, tick, seed_offset)?;
                self.emit(Opcode::ScopeEnd, *tick);
                self.context_depth -= 1;
            }
            Operation::Transpose { semitones, inner } => {
                self.context_depth += 1;
                self.check_context_depth()?;
                self.emit(Opcode::ScopeStart { transpose_delta: *semitones }, *tick);
                self.walk_one(inner, tick, seed_offset)?;
                self.emit(Opcode::ScopeEnd, *tick);
                self.context_depth -= 1;
            }
            // Vibrato/automation/time_signature/block have no dedicated
            // opcode yet: the bytecode backend targets the tick-sequenced
            // note/cc/bend/aftertouch/tempo subset real players consume;
            // richer automation stays on the direct emitter path.
            Operation::TimeSignature { .. }
            | Operation::Vibrato { .. }
            | Operation::Automation { .. }
            | Operation::Block { .. } => {}
        }
        Ok(())
    }
}

/// Compile a clip to a tick-ordered instruction stream.
pub fn compile_bytecode(clip: &ClipNode, options: &BytecodeOptions) -> CompileResult<Vec<Instruction>> {
    clip.check_schema()?;
    let mut compiler = Compiler {
        options,
        clip_name: clip.name.clone(),
        out: Vec::new(),
        context_depth: 0,
    };
    let mut tick = 0u32;
    if let Some(bpm) = clip.tempo {
        compiler.emit(Opcode::Tempo { bpm, transition_ticks: None }, 0);
    }
    compiler.walk(&clip.operations, &mut tick, options.base_seed)?;
    compiler.emit(Opcode::Eof, tick);

    if options.loop_mode == LoopMode::Unroll {
        // Unrolled iterations were appended in source order, not merged by
        // tick; a player (or this function's own callers) expects a single
        // ascending-tick stream, so resort now, keeping EOF last.
        let eof = compiler.out.pop();
        compiler.out.sort_by_key(|i| i.tick);
        if let Some(eof) = eof {
            compiler.out.push(eof);
        }
    }

    Ok(compiler.out)
}

/// Render a compiled instruction stream to [`Event`]s, the same output
/// shape the direct emitter produces, useful for running both compile
/// paths through identical downstream (scheduler, diagnostics) code.
pub fn render(
    instructions: &[Instruction],
    tempo_map: &TempoMap,
    transform: Option<&TransformPipeline>,
) -> (Vec<Event>, Vec<Diagnostic>) {
    let mut events = Vec::new();
    let mut transposition_stack = vec![0i32];
    let mut order = 0u64;

    for inst in instructions {
        let beat = inst.tick as f64 / TICKS_PER_BEAT as f64;
        let transposition = *transposition_stack.last().unwrap_or(&0);
        match &inst.opcode {
            Opcode::Note { pitch, velocity, duration_ticks, articulation, detune_cents } => {
                let beat_index = beat.floor().max(0.0) as usize;
                let beat = match transform {
                    Some(p) => p.apply_position(beat, beat_index, order),
                    None => beat,
                };
                let velocity = match transform {
                    Some(p) => p.apply_velocity(*velocity, order),
                    None => *velocity,
                };
                let duration_beats = *duration_ticks as f64 / TICKS_PER_BEAT as f64;
                events.push(Event {
                    start_seconds: tempo_map.beat_to_seconds(beat),
                    duration_seconds: Some(tempo_map.duration_to_seconds(beat, duration_beats)),
                    channel: None,
                    input_order: order,
                    payload: EventPayload::Note {
                        pitch: pitch + transposition,
                        velocity: (velocity.clamp(0.0, 1.0) * 127.0).round() as u8,
                        articulation: articulation.clone(),
                        detune_cents: *detune_cents,
                    },
                });
            }
            Opcode::Cc { controller, value } => {
                events.push(Event {
                    start_seconds: tempo_map.beat_to_seconds(beat),
                    duration_seconds: None,
                    channel: None,
                    input_order: order,
                    payload: EventPayload::Control { controller: *controller, value: *value },
                });
            }
            Opcode::Bend { normalized } => {
                events.push(Event {
                    start_seconds: tempo_map.beat_to_seconds(beat),
                    duration_seconds: None,
                    channel: None,
                    input_order: order,
                    payload: EventPayload::PitchBend { normalized: *normalized },
                });
            }
            Opcode::Aftertouch { target, value } => {
                events.push(Event {
                    start_seconds: tempo_map.beat_to_seconds(beat),
                    duration_seconds: None,
                    channel: None,
                    input_order: order,
                    payload: EventPayload::Aftertouch { target: *target, value: *value },
                });
            }
            Opcode::Tempo { bpm, transition_ticks } => {
                let transition_seconds = transition_ticks
                    .map(|t| tempo_map.duration_to_seconds(beat, t as f64 / TICKS_PER_BEAT as f64));
                events.push(Event {
                    start_seconds: tempo_map.beat_to_seconds(beat),
                    duration_seconds: None,
                    channel: None,
                    input_order: order,
                    payload: EventPayload::Tempo { bpm: *bpm, transition_seconds },
                });
            }
            Opcode::ScopeStart { transpose_delta } => {
                let base = *transposition_stack.last().unwrap_or(&0);
                transposition_stack.push(base + transpose_delta);
            }
            Opcode::ScopeEnd => {
                if transposition_stack.len() > 1 {
                    transposition_stack.pop();
                }
            }
            Opcode::Rest { .. }
            | Opcode::LoopStart { .. }
            | Opcode::LoopEnd
            | Opcode::StackStart
            | Opcode::BranchStart
            | Opcode::BranchEnd
            | Opcode::StackEnd
            | Opcode::Eof => {}
        }
        order += 1;
    }

    events.sort_by_key(|e| e.sort_key());
    (events, Vec::new())
}
