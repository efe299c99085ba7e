//! Deterministic humanize/quantize/groove transforms applied by the emitter
//! (C7) and bytecode backend (C9).
//!
//! Pipeline order is fixed: **Quantize → Groove → Humanize** (spec §4.5).
//! Humanize draws from a seeded Mulberry32 PRNG keyed by
//! `(global_seed + input_order)` so results are deterministic per seed and
//! independent of evaluation order.

/// Mulberry32: a small, fast, deterministic 32-bit PRNG. Chosen because the
/// spec pins this exact algorithm for humanize jitter, any other generator
/// would silently change output for the same seed.
#[derive(Clone, Copy, Debug)]
pub struct Mulberry32 {
    state: u32,
}

impl Mulberry32 {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Next raw 32-bit output.
    pub fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_add(0x6D2B79F5);
        let mut t = self.state;
        t = (t ^ (t >> 15)).wrapping_mul(t | 1);
        t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
        t ^ (t >> 14)
    }

    /// Next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u32() as f64) / (u32::MAX as f64 + 1.0)
    }

    /// Next value in `[-1, 1)`.
    pub fn next_signed(&mut self) -> f64 {
        self.next_f64() * 2.0 - 1.0
    }
}

/// Derive a per-event Mulberry32 instance from the run's global seed and the
/// event's `input_order`, per spec §4.5.
fn keyed_rng(global_seed: u32, input_order: u64) -> Mulberry32 {
    // input_order can exceed u32 range over a long compile; fold it down
    // rather than truncate silently losing only the high bits.
    let folded = (input_order ^ (input_order >> 32)) as u32;
    Mulberry32::new(global_seed.wrapping_add(folded))
}

/// Snap-to-grid configuration. `strength` in `[0,1]` interpolates between no
/// snap (0) and a full snap (1).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct QuantizeConfig {
    pub grid_beats: f64,
    pub strength: f64,
}

/// A cyclic per-beat-index offset table (e.g. a swing/shuffle feel).
#[derive(Clone, Debug, PartialEq)]
pub struct GrooveConfig {
    pub offsets_beats: Vec<f64>,
}

/// Bounded random jitter applied last, after quantize/groove have settled
/// the nominal position.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HumanizeConfig {
    pub max_jitter_beats: f64,
    pub velocity_jitter: f32,
    pub global_seed: u32,
}

/// Snap `position` (in beats) toward the nearest multiple of `grid_beats`,
/// blended by `strength`.
pub fn quantize(position: f64, cfg: &QuantizeConfig) -> f64 {
    if cfg.grid_beats <= 0.0 {
        return position;
    }
    let snapped = (position / cfg.grid_beats).round() * cfg.grid_beats;
    let strength = cfg.strength.clamp(0.0, 1.0);
    position + (snapped - position) * strength
}

/// Add this beat-index's cyclic groove offset.
pub fn groove(position: f64, beat_index: usize, cfg: &GrooveConfig) -> f64 {
    if cfg.offsets_beats.is_empty() {
        return position;
    }
    position + cfg.offsets_beats[beat_index % cfg.offsets_beats.len()]
}

/// Jitter `position` by a bounded random offset, deterministic per
/// `(global_seed, input_order)`.
pub fn humanize_position(position: f64, input_order: u64, cfg: &HumanizeConfig) -> f64 {
    if cfg.max_jitter_beats <= 0.0 {
        return position;
    }
    let mut rng = keyed_rng(cfg.global_seed, input_order);
    position + rng.next_signed() * cfg.max_jitter_beats
}

/// Jitter `velocity` (already in `[0,1]`) by a bounded random offset, using
/// a distinct draw from the same seeded generator so position and velocity
/// jitter never correlate trivially.
pub fn humanize_velocity(velocity: f32, input_order: u64, cfg: &HumanizeConfig) -> f32 {
    if cfg.velocity_jitter <= 0.0 {
        return velocity;
    }
    let mut rng = keyed_rng(cfg.global_seed, input_order.wrapping_add(0x9E3779B1));
    let jitter = rng.next_signed() as f32 * cfg.velocity_jitter;
    (velocity + jitter).clamp(0.0, 1.0)
}

/// The fixed three-stage transform pipeline. Any stage left `None` is
/// skipped entirely (a cheap no-op clip is the common case: no groove/humanize
/// configured).
#[derive(Clone, Debug, Default)]
pub struct TransformPipeline {
    pub quantize: Option<QuantizeConfig>,
    pub groove: Option<GrooveConfig>,
    pub humanize: Option<HumanizeConfig>,
}

impl TransformPipeline {
    /// Apply quantize, then groove, then humanize to a beat (or tick, for
    /// the bytecode backend, the math is unit-agnostic) position.
    pub fn apply_position(&self, position: f64, beat_index: usize, input_order: u64) -> f64 {
        let mut p = position;
        if let Some(q) = &self.quantize {
            p = quantize(p, q);
        }
        if let Some(g) = &self.groove {
            p = groove(p, beat_index, g);
        }
        if let Some(h) = &self.humanize {
            p = humanize_position(p, input_order, h);
        }
        p
    }

    /// Velocity only ever goes through humanize (quantize/groove act on
    /// timing, not velocity).
    pub fn apply_velocity(&self, velocity: f32, input_order: u64) -> f32 {
        match &self.humanize {
            Some(h) => humanize_velocity(velocity, input_order, h),
            None => velocity,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.quantize.is_none() && self.groove.is_none() && self.humanize.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulberry32_is_deterministic_per_seed() {
        let mut a = Mulberry32::new(42);
        let mut b = Mulberry32::new(42);
        for _ in 0..10 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn mulberry32_differs_across_seeds() {
        let mut a = Mulberry32::new(1);
        let mut b = Mulberry32::new(2);
        assert_ne!(a.next_u32(), b.next_u32());
    }

    #[test]
    fn quantize_full_strength_snaps_exactly() {
        let cfg = QuantizeConfig { grid_beats: 0.25, strength: 1.0 };
        assert!((quantize(0.31, &cfg) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn quantize_zero_strength_is_identity() {
        let cfg = QuantizeConfig { grid_beats: 0.25, strength: 0.0 };
        assert_eq!(quantize(0.31, &cfg), 0.31);
    }

    #[test]
    fn groove_cycles_through_offsets() {
        let cfg = GrooveConfig { offsets_beats: vec![0.0, 0.05] };
        assert_eq!(groove(1.0, 0, &cfg), 1.0);
        assert!((groove(1.0, 1, &cfg) - 1.05).abs() < 1e-9);
        assert_eq!(groove(1.0, 2, &cfg), 1.0);
    }

    #[test]
    fn humanize_is_bounded_and_deterministic() {
        let cfg = HumanizeConfig { max_jitter_beats: 0.1, velocity_jitter: 0.0, global_seed: 7 };
        for order in 0..50u64 {
            let jittered = humanize_position(1.0, order, &cfg);
            assert!((jittered - 1.0).abs() <= 0.1 + 1e-12);
        }
        let a = humanize_position(1.0, 3, &cfg);
        let b = humanize_position(1.0, 3, &cfg);
        assert_eq!(a, b);
    }

    #[test]
    fn humanize_velocity_clamped_to_unit_range() {
        let cfg = HumanizeConfig { max_jitter_beats: 0.0, velocity_jitter: 0.5, global_seed: 1 };
        for order in 0..100u64 {
            let v = humanize_velocity(0.95, order, &cfg);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn pipeline_order_is_quantize_then_groove_then_humanize() {
        let pipeline = TransformPipeline {
            quantize: Some(QuantizeConfig { grid_beats: 1.0, strength: 1.0 }),
            groove: Some(GrooveConfig { offsets_beats: vec![0.1] }),
            humanize: None,
        };
        // 0.4 snaps to 0.0, then +0.1 groove = 0.1.
        let result = pipeline.apply_position(0.4, 0, 0);
        assert!((result - 0.1).abs() < 1e-9);
    }
}
