//! Concurrency feedback expressions.
//!
//! A destination's window moves by a feedback amount after every delivery.
//! The amount is a constant (`"1"`, `"1/4"`) or shrinks as the window grows
//! (`"1/concurrency"`, `"1/sqrt_concurrency"`).

use std::{fmt, str::FromStr};

use serde::Deserialize;

use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Scale {
    Constant,
    Window,
    SqrtWindow,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct Feedback {
    base: f64,
    scale: Scale,
}

impl Feedback {
    pub const ONE: Self = Self {
        base: 1.0,
        scale: Scale::Constant,
    };

    /// Feedback for a destination whose window is `window`.
    #[must_use]
    pub fn value(&self, window: i64) -> f64 {
        let window = window.max(1) as f64;
        match self.scale {
            Scale::Constant => self.base,
            Scale::Window => self.base / window,
            Scale::SqrtWindow => self.base / window.sqrt(),
        }
    }
}

impl Default for Feedback {
    fn default() -> Self {
        Self::ONE
    }
}

impl FromStr for Feedback {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let bad = |reason: &str| ConfigError::Feedback {
            value: text.to_string(),
            reason: reason.to_string(),
        };

        let text = text.trim();
        let (numerator, denominator) = match text.split_once('/') {
            Some((numerator, denominator)) => (numerator.trim(), Some(denominator.trim())),
            None => (text, None),
        };
        let numerator: f64 = numerator.parse().map_err(|_| bad("bad numerator"))?;

        let (base, scale) = match denominator {
            None => (numerator, Scale::Constant),
            Some("concurrency") => (numerator, Scale::Window),
            Some("sqrt_concurrency") => (numerator, Scale::SqrtWindow),
            Some(denominator) => {
                let denominator: f64 = denominator.parse().map_err(|_| bad("bad denominator"))?;
                if denominator <= 0.0 {
                    return Err(bad("denominator must be positive"));
                }
                (numerator / denominator, Scale::Constant)
            }
        };

        if !(base > 0.0 && base <= 1.0) {
            return Err(bad("value must be in (0, 1]"));
        }

        Ok(Self { base, scale })
    }
}

impl TryFrom<String> for Feedback {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for Feedback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scale {
            Scale::Constant => write!(f, "{}", self.base),
            Scale::Window => write!(f, "{}/concurrency", self.base),
            Scale::SqrtWindow => write!(f, "{}/sqrt_concurrency", self.base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_forms() {
        let one: Feedback = "1".parse().unwrap();
        assert!((one.value(20) - 1.0).abs() < f64::EPSILON);

        let quarter: Feedback = "1/4".parse().unwrap();
        assert!((quarter.value(3) - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_window_forms() {
        let inverse: Feedback = "1/concurrency".parse().unwrap();
        assert!((inverse.value(4) - 0.25).abs() < f64::EPSILON);

        let sqrt: Feedback = "1/sqrt_concurrency".parse().unwrap();
        assert!((sqrt.value(16) - 0.25).abs() < f64::EPSILON);
        // A zero window is treated as one
        assert!((sqrt.value(0) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!("2".parse::<Feedback>().is_err());
        assert!("0".parse::<Feedback>().is_err());
        assert!("1/0".parse::<Feedback>().is_err());
        assert!("1/window".parse::<Feedback>().is_err());
        assert!("x".parse::<Feedback>().is_err());
    }

    #[test]
    fn test_deserialize_from_ron() {
        let feedback: Feedback = ron::from_str("\"1/concurrency\"").unwrap();
        assert_eq!(feedback.to_string(), "1/concurrency");
    }
}
