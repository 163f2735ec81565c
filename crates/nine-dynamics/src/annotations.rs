//! Namespaced key/value annotations attached to dynamics and their elements.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Namespace of annotations written by the build pipeline
pub const BUILD_NS: &str = "http://nine.dev/build";

/// Namespace of annotations recorded by the NMODL importer
pub const NMODL_NS: &str = "http://nine.dev/nmodl";

/// Build annotation keys
pub mod keys {
    /// State variable treated as membrane potential
    pub const MEMBRANE_VOLTAGE: &str = "membrane_voltage";
    /// Parameter treated as membrane capacitance
    pub const MEMBRANE_CAPACITANCE: &str = "membrane_capacitance";
    /// Receive ports routed to an injection channel
    pub const EXTERNAL_CURRENTS: &str = "external_currents";
    /// One of `full_cell`, `artificial_cell`, `sub_component`
    pub const MECHANISM_TYPE: &str = "mechanism_type";
    /// States lacking a derivative in at least one regime
    pub const NO_TIME_DERIVS: &str = "no_time_derivatives";
    /// Count of states with a derivative somewhere
    pub const NUM_TIME_DERIVS: &str = "num_time_derivatives";
    /// Ion species of a port
    pub const ION_SPECIES: &str = "ion_species";
    /// Name of the element this one was derived from
    pub const TRANSFORM_SRC: &str = "transform_src";
    /// Name of the element this one was rewritten into
    pub const TRANSFORM_DEST: &str = "transform_dest";
    /// Pipeline version that produced the build
    pub const BUILD_VERSION: &str = "build_version";
    /// Regime the state machine starts in
    pub const DEFAULT_REGIME: &str = "default_regime";
    /// Receptor ordinal of a reduce or event-receive port
    pub const RECEPTOR_INDEX: &str = "receptor_index";
}

/// Annotation value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnnotationValue {
    /// Explicitly unset (e.g. a synthesized element with no source)
    None,
    /// Boolean flag
    Bool(bool),
    /// Integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// Text
    Text(String),
    /// List of names
    List(Vec<String>),
}

impl AnnotationValue {
    /// Text content, if any
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AnnotationValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer content, if any
    pub fn as_int(&self) -> Option<i64> {
        match self {
            AnnotationValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// List content (a single text is a one-element list)
    pub fn as_list(&self) -> Vec<String> {
        match self {
            AnnotationValue::List(v) => v.clone(),
            AnnotationValue::Text(s) => vec![s.clone()],
            _ => Vec::new(),
        }
    }

    /// True for [`AnnotationValue::None`]
    pub fn is_none(&self) -> bool {
        matches!(self, AnnotationValue::None)
    }
}

impl Display for AnnotationValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AnnotationValue::None => write!(f, "none"),
            AnnotationValue::Bool(b) => write!(f, "{}", b),
            AnnotationValue::Int(i) => write!(f, "{}", i),
            AnnotationValue::Float(x) => write!(f, "{}", x),
            AnnotationValue::Text(s) => write!(f, "\"{}\"", s),
            AnnotationValue::List(v) => write!(f, "[{}]", v.join(", ")),
        }
    }
}

impl From<&str> for AnnotationValue {
    fn from(s: &str) -> Self {
        AnnotationValue::Text(s.to_string())
    }
}

impl From<String> for AnnotationValue {
    fn from(s: String) -> Self {
        AnnotationValue::Text(s)
    }
}

impl From<bool> for AnnotationValue {
    fn from(b: bool) -> Self {
        AnnotationValue::Bool(b)
    }
}

impl From<i64> for AnnotationValue {
    fn from(i: i64) -> Self {
        AnnotationValue::Int(i)
    }
}

impl From<usize> for AnnotationValue {
    fn from(i: usize) -> Self {
        AnnotationValue::Int(i as i64)
    }
}

impl From<f64> for AnnotationValue {
    fn from(x: f64) -> Self {
        AnnotationValue::Float(x)
    }
}

impl From<Vec<String>> for AnnotationValue {
    fn from(v: Vec<String>) -> Self {
        AnnotationValue::List(v)
    }
}

impl<T: Into<AnnotationValue>> From<Option<T>> for AnnotationValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(AnnotationValue::None)
    }
}

/// Nested `namespace -> key -> value` map
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(BTreeMap<String, BTreeMap<String, AnnotationValue>>);

impl Annotations {
    /// Empty annotations
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no namespace holds a key
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Value under `ns`/`key`
    pub fn get(&self, ns: &str, key: &str) -> Option<&AnnotationValue> {
        self.0.get(ns).and_then(|m| m.get(key))
    }

    /// Value under `ns`/`key`, or `default` when absent
    pub fn get_or(&self, ns: &str, key: &str, default: AnnotationValue) -> AnnotationValue {
        self.get(ns, key).cloned().unwrap_or(default)
    }

    /// Text value under `ns`/`key`
    pub fn get_str(&self, ns: &str, key: &str) -> Option<&str> {
        self.get(ns, key).and_then(AnnotationValue::as_str)
    }

    /// True if `ns`/`key` is present
    pub fn contains(&self, ns: &str, key: &str) -> bool {
        self.get(ns, key).is_some()
    }

    /// Set `ns`/`key`, replacing any previous value
    pub fn set(&mut self, ns: &str, key: &str, value: impl Into<AnnotationValue>) {
        self.0
            .entry(ns.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    /// Remove `ns`/`key`
    pub fn remove(&mut self, ns: &str, key: &str) -> Option<AnnotationValue> {
        let ns_map = self.0.get_mut(ns)?;
        let removed = ns_map.remove(key);
        if ns_map.is_empty() {
            self.0.remove(ns);
        }
        removed
    }

    /// Namespaces in use
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Entries of one namespace
    pub fn entries(&self, ns: &str) -> impl Iterator<Item = (&str, &AnnotationValue)> {
        self.0
            .get(ns)
            .into_iter()
            .flat_map(|m| m.iter().map(|(k, v)| (k.as_str(), v)))
    }

    /// Drop every namespace not in `namespaces`
    pub fn retain_namespaces(&mut self, namespaces: &[&str]) {
        self.0
            .retain(|ns, m| namespaces.contains(&ns.as_str()) && !m.is_empty());
    }

    /// Copy keeping only the given namespaces
    pub fn filtered(&self, namespaces: &[&str]) -> Annotations {
        Annotations(
            self.0
                .iter()
                .filter(|(ns, m)| namespaces.contains(&ns.as_str()) && !m.is_empty())
                .map(|(ns, m)| (ns.clone(), m.clone()))
                .collect(),
        )
    }
}
