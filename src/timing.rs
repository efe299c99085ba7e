//! Time signature representation shared by the session and timer layers.

/// A musical time signature, e.g. 4/4 or 6/8.
#[derive(Clone, Copy, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TimeSignature {
    pub numerator: u32,
    pub denominator: u32,
}

impl TimeSignature {
    /// Construct a time signature, clamping both fields to a minimum of 1.
    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator: numerator.max(1),
            denominator: denominator.max(1),
        }
    }

    /// Number of quarter-note beats per measure under this signature.
    pub fn beats_per_measure(&self) -> f64 {
        self.numerator as f64 * (4.0 / self.denominator as f64)
    }
}

impl Default for TimeSignature {
    fn default() -> Self {
        Self { numerator: 4, denominator: 4 }
    }
}

impl From<(u32, u32)> for TimeSignature {
    fn from((numerator, denominator): (u32, u32)) -> Self {
        Self::new(numerator, denominator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beats_per_measure() {
        assert_eq!(TimeSignature::new(4, 4).beats_per_measure(), 4.0);
        assert_eq!(TimeSignature::new(3, 4).beats_per_measure(), 3.0);
        assert_eq!(TimeSignature::new(6, 8).beats_per_measure(), 3.0);
    }

    #[test]
    fn zero_denominator_clamped() {
        let sig = TimeSignature::new(4, 0);
        assert_eq!(sig.denominator, 1);
    }

    #[test]
    fn default_is_four_four() {
        assert_eq!(TimeSignature::default(), TimeSignature::new(4, 4));
    }
}
