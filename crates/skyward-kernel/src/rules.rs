//! [`ReadingVerifier`] – limit rules applied to environmental readings.
//!
//! A weather station reports its own safe/unsafe flag, but the facility
//! usually has stricter limits than the station's firmware (a wind speed the
//! station calls fine may still be too much for an open dome).  Each source
//! can carry a list of [`Rule`]s; a reading that violates any of them is
//! treated as unsafe no matter what the sensor claimed.
//!
//! One built-in rule is provided:
//! - [`LimitRule`] – keeps a named numeric value inside `[min, max]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ────────────────────────────────────────────────────────────────────────────
// Reading
// ────────────────────────────────────────────────────────────────────────────

/// One report from an environmental sensor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// The sensor's own verdict.
    pub safe: bool,
    /// Named measurements, e.g. `wind_speed` or `humidity`.
    #[serde(default)]
    pub values: BTreeMap<String, f64>,
}

impl SensorReading {
    pub fn new(safe: bool) -> Self {
        Self {
            safe,
            values: BTreeMap::new(),
        }
    }

    pub fn safe() -> Self {
        Self::new(true)
    }

    /// Builder-style helper to attach a measurement.
    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Self {
        self.values.insert(key.into(), value);
        self
    }
}

/// A reading failed a [`Rule`].
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{rule}: {details}")]
pub struct RuleViolation {
    pub rule: String,
    pub details: String,
}

// ────────────────────────────────────────────────────────────────────────────
// Rule trait
// ────────────────────────────────────────────────────────────────────────────

/// A single environmental invariant a reading must satisfy.
pub trait Rule: Send + Sync {
    /// Human-readable name used in violation messages.
    fn name(&self) -> &str;

    fn check(&self, reading: &SensorReading) -> Result<(), RuleViolation>;
}

// ────────────────────────────────────────────────────────────────────────────
// ReadingVerifier
// ────────────────────────────────────────────────────────────────────────────

/// Evaluates a reading against every registered [`Rule`].
///
/// # Example
///
/// ```
/// use skyward_kernel::rules::{LimitRule, ReadingVerifier, SensorReading};
///
/// let verifier = ReadingVerifier::from_limits([LimitRule::at_most("wind_speed", 15.0)]);
///
/// let calm = SensorReading::safe().with_value("wind_speed", 4.0);
/// assert!(verifier.verify(&calm).is_ok());
///
/// let gusty = SensorReading::safe().with_value("wind_speed", 22.0);
/// assert!(verifier.verify(&gusty).is_err());
/// ```
#[derive(Default)]
pub struct ReadingVerifier {
    rules: Vec<Box<dyn Rule>>,
}

impl ReadingVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_limits(limits: impl IntoIterator<Item = LimitRule>) -> Self {
        let mut verifier = Self::new();
        for limit in limits {
            verifier.add_rule(Box::new(limit));
        }
        verifier
    }

    /// Rules are evaluated in insertion order.
    pub fn add_rule(&mut self, rule: Box<dyn Rule>) {
        self.rules.push(rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First violation, or `Ok(())` when every rule passes.
    pub fn verify(&self, reading: &SensorReading) -> Result<(), RuleViolation> {
        for rule in &self.rules {
            rule.check(reading)?;
        }
        Ok(())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Built-in rules
// ────────────────────────────────────────────────────────────────────────────

/// Keeps `values[key]` inside `[min, max]` (both bounds inclusive and
/// optional).  A reading without the key passes; the sensor's own flag
/// still applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitRule {
    pub key: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl LimitRule {
    pub fn at_most(key: impl Into<String>, max: f64) -> Self {
        Self {
            key: key.into(),
            min: None,
            max: Some(max),
        }
    }

    pub fn at_least(key: impl Into<String>, min: f64) -> Self {
        Self {
            key: key.into(),
            min: Some(min),
            max: None,
        }
    }
}

impl Rule for LimitRule {
    fn name(&self) -> &str {
        &self.key
    }

    fn check(&self, reading: &SensorReading) -> Result<(), RuleViolation> {
        let Some(&value) = reading.values.get(&self.key) else {
            return Ok(());
        };
        if value.is_nan() {
            return Err(RuleViolation {
                rule: self.key.clone(),
                details: "value is NaN".to_string(),
            });
        }
        if let Some(min) = self.min
            && value < min
        {
            return Err(RuleViolation {
                rule: self.key.clone(),
                details: format!("{value} below minimum {min}"),
            });
        }
        if let Some(max) = self.max
            && value > max
        {
            return Err(RuleViolation {
                rule: self.key.clone(),
                details: format!("{value} above maximum {max}"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_verifier_accepts_everything() {
        let v = ReadingVerifier::new();
        assert!(v.is_empty());
        assert!(v.verify(&SensorReading::new(false)).is_ok());
    }

    #[test]
    fn value_at_boundary_passes() {
        let v = ReadingVerifier::from_limits([LimitRule::at_most("wind_speed", 15.0)]);
        assert!(v.verify(&SensorReading::safe().with_value("wind_speed", 15.0)).is_ok());
    }

    #[test]
    fn value_above_max_is_rejected() {
        let v = ReadingVerifier::from_limits([LimitRule::at_most("humidity", 85.0)]);
        let err = v
            .verify(&SensorReading::safe().with_value("humidity", 91.5))
            .unwrap_err();
        assert_eq!(err.rule, "humidity");
        assert!(err.details.contains("above maximum"));
    }

    #[test]
    fn value_below_min_is_rejected() {
        let v = ReadingVerifier::from_limits([LimitRule::at_least("dew_margin", 2.0)]);
        assert!(v.verify(&SensorReading::safe().with_value("dew_margin", 0.5)).is_err());
    }

    #[test]
    fn missing_value_passes() {
        let v = ReadingVerifier::from_limits([LimitRule::at_most("wind_speed", 15.0)]);
        assert!(v.verify(&SensorReading::safe().with_value("humidity", 99.0)).is_ok());
    }

    #[test]
    fn nan_is_rejected() {
        let v = ReadingVerifier::from_limits([LimitRule::at_most("wind_speed", 15.0)]);
        assert!(v.verify(&SensorReading::safe().with_value("wind_speed", f64::NAN)).is_err());
    }

    #[test]
    fn first_violation_wins() {
        let v = ReadingVerifier::from_limits([
            LimitRule::at_most("wind_speed", 15.0),
            LimitRule::at_most("humidity", 85.0),
        ]);
        let reading = SensorReading::safe()
            .with_value("wind_speed", 30.0)
            .with_value("humidity", 95.0);
        assert_eq!(v.verify(&reading).unwrap_err().rule, "wind_speed");
    }

    #[test]
    fn limit_rule_deserializes_with_optional_bounds() {
        let rule: LimitRule = serde_json::from_str(r#"{"key":"wind_speed","max":15.0}"#).unwrap();
        assert_eq!(rule, LimitRule::at_most("wind_speed", 15.0));
    }
}
