//! Parameters
//!
//! Named parameter sets shared by every stage of a pipeline, and the tuned
//! default tables for each analysis kind.
//!
//! The default values come from the reference command line trackers of the
//! madmom project (`DBNBeatTracker`, `TempoDetector`, `OnsetDetectorLL`) and
//! are empirically tuned. Do not round them.

use std::{borrow::Cow, collections::BTreeMap, fmt::Display};

/// A single parameter value.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(untagged)
)]
pub enum ParamValue {
    /// Boolean switch, e.g. `online` or `correct`.
    Bool(bool),
    /// Integer constant, e.g. `hist_smooth`.
    Int(i64),
    /// Floating point constant, e.g. `min_bpm`.
    Float(f64),
    /// Text selector, e.g. the tempo `method`.
    Text(Cow<'static, str>),
}

impl ParamValue {
    /// Numeric view of the value. Integers widen to `f64`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Int(v) => Some(*v as f64),
            ParamValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Boolean view of the value.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Text view of the value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(v) => Some(&**v),
            _ => None,
        }
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParamValue::Bool(v) => write!(f, "{v}"),
            ParamValue::Int(v) => write!(f, "{v}"),
            ParamValue::Float(v) => write!(f, "{v}"),
            ParamValue::Text(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        ParamValue::Bool(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<i32> for ParamValue {
    fn from(v: i32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(v.into())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

impl From<f32> for ParamValue {
    fn from(v: f32) -> Self {
        ParamValue::Float(v.into())
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Text(Cow::Owned(v.to_owned()))
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Text(Cow::Owned(v))
    }
}

/// An ordered mapping of parameter name to value.
///
/// Later layers win: [`Params::layer`] overwrites every key it carries.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(
    feature = "serialization",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct Params {
    values: BTreeMap<String, ParamValue>,
}

impl Params {
    /// An empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a parameter set from a static default table.
    pub fn from_table(table: &[(&str, ParamValue)]) -> Self {
        let mut params = Self::new();
        for (name, value) in table {
            params.insert(*name, value.clone());
        }
        params
    }

    /// Chainable insert.
    pub fn with(mut self, name: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(name, value);
        self
    }

    /// Insert or replace a value, returning the previous one.
    pub fn insert(&mut self, name: &str, value: impl Into<ParamValue>) -> Option<ParamValue> {
        self.values.insert(name.to_owned(), value.into())
    }

    /// Overwrite this set with every entry of `other`.
    pub fn layer(&mut self, other: &Params) {
        for (name, value) in &other.values {
            self.values.insert(name.clone(), value.clone());
        }
    }

    /// Raw lookup.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Numeric lookup; integers widen to `f64`.
    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    /// Boolean lookup.
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.get(name).and_then(ParamValue::as_bool)
    }

    /// Text lookup.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_str)
    }

    /// Whether `name` is present.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Iterate entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }
}

impl<K: Into<String>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Params {
            values: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Beat tracking defaults (`DBNBeatTracker`).
pub static BEAT_TRACKING_DEFAULTS: &[(&str, ParamValue)] = &[
    ("min_bpm", ParamValue::Float(55.0)),
    ("max_bpm", ParamValue::Float(215.0)),
    ("transition_lambda", ParamValue::Int(100)),
    ("observation_lambda", ParamValue::Int(16)),
    ("threshold", ParamValue::Int(0)),
    ("correct", ParamValue::Bool(true)),
];

/// Tempo estimation defaults (`TempoDetector`, comb filter method).
pub static TEMPO_ESTIMATION_DEFAULTS: &[(&str, ParamValue)] = &[
    ("method", ParamValue::Text(Cow::Borrowed("comb"))),
    ("min_bpm", ParamValue::Float(40.0)),
    ("max_bpm", ParamValue::Float(250.0)),
    ("act_smooth", ParamValue::Float(0.14)),
    ("hist_smooth", ParamValue::Int(9)),
    ("hist_buffer", ParamValue::Float(10.0)),
    ("alpha", ParamValue::Float(0.79)),
];

/// Onset detection defaults (`OnsetDetectorLL`).
///
/// `pre_max` is missing on purpose: it is one analysis frame, `1 / fps`,
/// and is filled in when a pipeline is built.
pub static ONSET_DETECTION_DEFAULTS: &[(&str, ParamValue)] = &[
    ("post_max", ParamValue::Int(0)),
    ("post_avg", ParamValue::Int(0)),
    ("threshold", ParamValue::Float(0.23)),
    ("combine", ParamValue::Float(0.03)),
    ("delay", ParamValue::Float(0.0)),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_widen_to_floats() {
        let params = Params::new().with("hist_smooth", 9).with("alpha", 0.79);
        assert_eq!(params.get_f64("hist_smooth"), Some(9.0));
        assert_eq!(params.get_f64("alpha"), Some(0.79));
        assert_eq!(params.get_bool("alpha"), None);
    }

    #[test]
    fn layer_overwrites_existing_keys() {
        let mut base = Params::from_table(BEAT_TRACKING_DEFAULTS);
        base.layer(&Params::from_table(TEMPO_ESTIMATION_DEFAULTS));
        assert_eq!(base.get_f64("min_bpm"), Some(40.0));
        assert_eq!(base.get_f64("max_bpm"), Some(250.0));
        assert_eq!(base.get_f64("transition_lambda"), Some(100.0));
        assert_eq!(base.get_str("method"), Some("comb"));
    }

    #[test]
    fn collects_from_pairs() {
        let params: Params = [("threshold", 0.5), ("delay", 0.01)].into_iter().collect();
        assert_eq!(params.len(), 2);
        assert!(params.contains("delay"));
    }
}
