//! Duration parsing and tempo-curve integration (spec component C1).
//!
//! Durations are symbolic tokens (`4n`, `8n.`, `4nt`, ...) parsed to exact
//! rationals and reduced to beats, where one beat is a quarter note. The
//! tempo integrator turns a beat span under a (possibly curved) tempo ramp
//! into elapsed seconds, using closed-form solutions where tractable and a
//! Simpson's-rule numerical fallback otherwise.

use crate::errors::{CompileError, CompileResult};
use thiserror::Error;

/// An exact rational number, kept reduced after every constructive operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rational {
    pub num: i64,
    pub den: i64,
}

impl Rational {
    pub fn new(num: i64, den: i64) -> Self {
        assert!(den != 0, "rational denominator must not be zero");
        let (num, den) = if den < 0 { (-num, -den) } else { (num, den) };
        let g = gcd(num.unsigned_abs(), den.unsigned_abs()).max(1);
        Rational {
            num: num / g as i64,
            den: den / g as i64,
        }
    }

    pub fn to_f64(self) -> f64 {
        self.num as f64 / self.den as f64
    }

    pub fn add(self, other: Rational) -> Rational {
        Rational::new(
            self.num * other.den + other.num * self.den,
            self.den * other.den,
        )
    }

    pub fn mul(self, other: Rational) -> Rational {
        Rational::new(self.num * other.num, self.den * other.den)
    }
}

fn gcd(a: u64, b: u64) -> u64 {
    if b == 0 { a.max(1) } else { gcd(b, a % b) }
}

/// Errors from parsing a symbolic duration token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DurationParseError {
    #[error("empty duration token")]
    Empty,
    #[error("invalid divisor in duration token '{0}'")]
    BadDivisor(String),
    #[error("divisor must be a power of two in duration token '{0}'")]
    NotPowerOfTwo(String),
}

/// A symbolic duration: integer divisor (4 = quarter, 8 = eighth, ...) with
/// optional dotted and triplet modifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NoteDuration {
    pub divisor: u32,
    pub dotted: bool,
    pub triplet: bool,
}

impl NoteDuration {
    pub fn new(divisor: u32, dotted: bool, triplet: bool) -> Self {
        Self { divisor, dotted, triplet }
    }

    /// Parse a token like `"4"`, `"4n"`, `"8n."`, `"4nt"`, `"16nt."`.
    /// The trailing `n` is optional; `.` marks dotted, `t` marks triplet.
    pub fn parse(token: &str) -> Result<Self, DurationParseError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(DurationParseError::Empty);
        }
        let mut chars = token.chars().peekable();
        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return Err(DurationParseError::BadDivisor(token.to_string()));
        }
        let divisor: u32 = digits
            .parse()
            .map_err(|_| DurationParseError::BadDivisor(token.to_string()))?;
        if !divisor.is_power_of_two() {
            return Err(DurationParseError::NotPowerOfTwo(token.to_string()));
        }
        let mut dotted = false;
        let mut triplet = false;
        for c in chars {
            match c {
                'n' | 'N' => {}
                '.' => dotted = true,
                't' | 'T' => triplet = true,
                _ => return Err(DurationParseError::BadDivisor(token.to_string())),
            }
        }
        Ok(Self { divisor, dotted, triplet })
    }

    /// Exact number of beats (one beat = one quarter note) as a rational.
    pub fn to_beats_exact(self) -> Rational {
        // A whole note is 4 beats; divisor d -> 4/d beats base value.
        let base = Rational::new(4, self.divisor as i64);
        let base = if self.dotted {
            base.add(Rational::new(base.num, base.den * 2))
        } else {
            base
        };
        if self.triplet {
            base.mul(Rational::new(2, 3))
        } else {
            base
        }
    }

    /// Beats as `f64`, for use throughout the rest of the pipeline.
    pub fn to_beats(self) -> f64 {
        self.to_beats_exact().to_f64()
    }
}

/// Easing shape for a tempo transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TempoCurve {
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

/// Numerical-integration precision when a closed form isn't used.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum IntegrationPrecision {
    /// 100 Simpson steps.
    Standard,
    /// 10,000 Simpson steps.
    High,
    /// Steps derived from a sample rate so each step is ~1 sample.
    Sample { sample_rate: f64 },
}

const NEAR_EQUAL_BPM: f64 = 1e-3;
const ATANH_DOMAIN_GUARD: f64 = 0.999;

/// Elapsed seconds for `beats` beats under a tempo ramp from `start_bpm` to
/// `end_bpm` via `curve`. Fails with [`CompileError::BadTempo`] if either
/// endpoint is <= 0. Returns `0.0` for `beats == 0`.
pub fn integrate_tempo_seconds(
    clip: &str,
    start_bpm: f64,
    end_bpm: f64,
    beats: f64,
    curve: TempoCurve,
    precision: IntegrationPrecision,
) -> CompileResult<f64> {
    if start_bpm <= 0.0 || end_bpm <= 0.0 {
        return Err(CompileError::BadTempo {
            clip: clip.to_string(),
            detail: format!("tempo endpoints must be positive (start={start_bpm}, end={end_bpm})"),
        });
    }
    if beats == 0.0 {
        return Ok(0.0);
    }
    if (end_bpm - start_bpm).abs() < NEAR_EQUAL_BPM {
        return finite_nonneg(clip, 60.0 * beats / start_bpm);
    }

    let seconds = match curve {
        TempoCurve::Linear => linear_closed_form(start_bpm, end_bpm, beats),
        TempoCurve::EaseIn => ease_in_closed_form(start_bpm, end_bpm, beats)
            .unwrap_or_else(|| numerical_integral(start_bpm, end_bpm, beats, bpm_ease_in, precision)),
        TempoCurve::EaseOut => ease_in_closed_form(end_bpm, start_bpm, beats)
            .unwrap_or_else(|| numerical_integral(start_bpm, end_bpm, beats, bpm_ease_out, precision)),
        TempoCurve::EaseInOut => {
            let mid = (start_bpm + end_bpm) / 2.0;
            let first = integrate_tempo_seconds(
                clip,
                start_bpm,
                mid,
                beats / 2.0,
                TempoCurve::EaseIn,
                precision,
            )?;
            let second = integrate_tempo_seconds(
                clip,
                mid,
                end_bpm,
                beats / 2.0,
                TempoCurve::EaseOut,
                precision,
            )?;
            first + second
        }
    };
    finite_nonneg(clip, seconds)
}

fn finite_nonneg(clip: &str, seconds: f64) -> CompileResult<f64> {
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(CompileError::BadTempo {
            clip: clip.to_string(),
            detail: format!("tempo integration produced a non-finite or negative result ({seconds})"),
        });
    }
    Ok(seconds)
}

fn linear_closed_form(s: f64, e: f64, n: f64) -> f64 {
    60.0 * n * (e / s).ln() / (e - s)
}

fn bpm_linear(s: f64, e: f64, u: f64) -> f64 {
    s + (e - s) * u
}

fn bpm_ease_in(s: f64, e: f64, u: f64) -> f64 {
    s + (e - s) * u * u
}

fn bpm_ease_out(s: f64, e: f64, u: f64) -> f64 {
    s + (e - s) * (2.0 * u - u * u)
}

/// Pointwise `bpm(u)` for `u` in `[0,1]` across the whole transition, for all
/// four curves. Used by the tempo map (C6) to evaluate bpm at an arbitrary
/// fraction of a ramp, not just to integrate the whole thing at once.
pub(crate) fn bpm_at_u(s: f64, e: f64, curve: TempoCurve, u: f64) -> f64 {
    match curve {
        TempoCurve::Linear => bpm_linear(s, e, u),
        TempoCurve::EaseIn => bpm_ease_in(s, e, u),
        TempoCurve::EaseOut => bpm_ease_out(s, e, u),
        TempoCurve::EaseInOut => {
            let mid = (s + e) / 2.0;
            if u < 0.5 {
                bpm_ease_in(s, mid, u * 2.0)
            } else {
                bpm_ease_out(mid, e, (u - 0.5) * 2.0)
            }
        }
    }
}

/// Closed form for `bpm(u) = s + (e-s)u^2`, `u in [0,1]`, scaled by `n` beats.
/// Returns `None` when the atanh branch's argument approaches the domain
/// boundary, signalling the caller to fall back to numerical integration.
fn ease_in_closed_form(s: f64, e: f64, n: f64) -> Option<f64> {
    let k = e - s;
    if k > 0.0 {
        // ∫du/(s + k u^2) = atan(u*sqrt(k/s)) / sqrt(s*k)
        let root = (s * k).sqrt();
        Some(60.0 * n * (u_scaled_atan(1.0, k / s)) / root)
    } else {
        let abs_k = -k;
        let ratio = abs_k / s;
        if ratio.sqrt() >= ATANH_DOMAIN_GUARD {
            return None;
        }
        let root = (s * abs_k).sqrt();
        Some(60.0 * n * (1.0_f64).atanh_scaled(ratio) / root)
    }
}

fn u_scaled_atan(u: f64, ratio: f64) -> f64 {
    (u * ratio.sqrt()).atan()
}

trait AtanhScaled {
    fn atanh_scaled(self, ratio: f64) -> f64;
}

impl AtanhScaled for f64 {
    fn atanh_scaled(self, ratio: f64) -> f64 {
        (self * ratio.sqrt()).atanh()
    }
}

/// Simpson's rule over `u in [0,1]` for `f(u) = 60*n/bpm(u)`.
fn numerical_integral(
    s: f64,
    e: f64,
    n: f64,
    bpm: fn(f64, f64, f64) -> f64,
    precision: IntegrationPrecision,
) -> f64 {
    let steps = match precision {
        IntegrationPrecision::Standard => 100,
        IntegrationPrecision::High => 10_000,
        IntegrationPrecision::Sample { sample_rate } => {
            let avg_bpm = (s + e) / 2.0;
            let approx_seconds = 60.0 * n / avg_bpm;
            ((approx_seconds * sample_rate).ceil() as usize).clamp(2, 2_000_000)
        }
    };
    let steps = if steps % 2 == 1 { steps + 1 } else { steps };
    let h = 1.0 / steps as f64;
    let f = |u: f64| 60.0 * n / bpm(s, e, u);

    let mut sum = f(0.0) + f(1.0);
    for i in 1..steps {
        let u = i as f64 * h;
        let weight = if i % 2 == 0 { 2.0 } else { 4.0 };
        sum += weight * f(u);
    }
    sum * h / 3.0
}

/// Quantize a time in seconds to the nearest sample boundary.
pub fn quantize_to_sample(seconds: f64, sample_rate: f64) -> f64 {
    (seconds * sample_rate).round() / sample_rate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_tokens() {
        let q = NoteDuration::parse("4").unwrap();
        assert!((q.to_beats() - 1.0).abs() < 1e-9);

        let dotted_eighth = NoteDuration::parse("8.").unwrap();
        assert!((dotted_eighth.to_beats() - 0.75).abs() < 1e-9);

        let quarter_triplet = NoteDuration::parse("4t").unwrap();
        assert!((quarter_triplet.to_beats() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn rejects_non_power_of_two() {
        assert!(NoteDuration::parse("5").is_err());
    }

    #[test]
    fn ramp_matches_spec_example() {
        // 60 -> 120 bpm over 4 beats, linear: 60*ln(2)/15
        let secs = integrate_tempo_seconds(
            "clip",
            60.0,
            120.0,
            4.0,
            TempoCurve::Linear,
            IntegrationPrecision::Standard,
        )
        .unwrap();
        let expected = 60.0 * std::f64::consts::LN_2 / 15.0;
        assert!((secs - expected).abs() < 1e-9);
    }

    #[test]
    fn bad_tempo_rejected() {
        let err = integrate_tempo_seconds(
            "clip",
            0.0,
            120.0,
            4.0,
            TempoCurve::Linear,
            IntegrationPrecision::Standard,
        );
        assert!(matches!(err, Err(CompileError::BadTempo { .. })));
    }

    #[test]
    fn zero_beats_is_zero() {
        let secs = integrate_tempo_seconds(
            "clip",
            60.0,
            120.0,
            0.0,
            TempoCurve::Linear,
            IntegrationPrecision::Standard,
        )
        .unwrap();
        assert_eq!(secs, 0.0);
    }

    #[test]
    fn curves_agree_with_numerical_integration() {
        for (s, e) in [(60.0, 120.0), (120.0, 60.0), (90.0, 30.0), (30.0, 280.0)] {
            for curve in [
                TempoCurve::Linear,
                TempoCurve::EaseIn,
                TempoCurve::EaseOut,
                TempoCurve::EaseInOut,
            ] {
                let analytical =
                    integrate_tempo_seconds("clip", s, e, 8.0, curve, IntegrationPrecision::Standard)
                        .unwrap();
                if curve == TempoCurve::EaseInOut {
                    continue;
                }
                let bpm_fn: fn(f64, f64, f64) -> f64 = match curve {
                    TempoCurve::Linear => bpm_linear,
                    TempoCurve::EaseIn => bpm_ease_in,
                    TempoCurve::EaseOut => bpm_ease_out,
                    TempoCurve::EaseInOut => unreachable!(),
                };
                let numerical = numerical_integral(
                    s,
                    e,
                    8.0,
                    bpm_fn,
                    IntegrationPrecision::High,
                );
                assert!(
                    (analytical - numerical).abs() < 1e-4,
                    "curve {:?} s={} e={}: {} vs {}",
                    curve,
                    s,
                    e,
                    analytical,
                    numerical
                );
            }
        }
    }

    #[test]
    fn sample_quantization_is_exact() {
        let sr = 48_000.0;
        let t = 1.23456789;
        let q = quantize_to_sample(t, sr);
        assert_eq!((q * sr).round(), q * sr);
    }
}
