//! The dynamics object model.
//!
//! Every named collection is an [`IndexMap`] keyed by element name, so
//! declaration order survives a JSON round trip and two dynamics compare equal
//! only if their collections agree element-wise in order.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::annotations::Annotations;
use crate::expr::Expr;
use crate::units::{Dimension, Quantity, Unit};
use crate::{DynamicsError, Result};

macro_rules! annotated {
    ($($ty:ident),* $(,)?) => {
        $(
            impl $ty {
                /// Annotations of the element
                pub fn annotations(&self) -> &Annotations {
                    &self.annotations
                }

                /// Mutable annotations of the element
                pub fn annotations_mut(&mut self) -> &mut Annotations {
                    &mut self.annotations
                }
            }
        )*
    };
}

/// A settable, dimensioned parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    /// Name
    pub name: String,
    /// Dimension
    pub dimension: Dimension,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// A state variable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateVariable {
    /// Name
    pub name: String,
    /// Dimension
    pub dimension: Dimension,
    /// Initial value, if the model fixes one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<Quantity>,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// A named constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    /// Name
    pub name: String,
    /// Value in `unit`
    pub value: f64,
    /// Unit of `value`
    pub unit: Unit,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// A named expression
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alias {
    /// Name
    pub name: String,
    /// Defining expression
    pub rhs: Expr,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// Transition fired when a trigger condition becomes true
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnCondition {
    /// Boolean trigger
    pub trigger: Expr,
    /// State assignments, applied in order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state_assignments: IndexMap<String, Expr>,
    /// Event-send ports emitted on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_events: Vec<String>,
    /// Regime entered; `None` stays in the current regime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_regime: Option<String>,
}

/// Transition fired when an event arrives on a port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnEvent {
    /// Event-receive port
    pub src_port: String,
    /// State assignments, applied in order
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub state_assignments: IndexMap<String, Expr>,
    /// Event-send ports emitted on
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_events: Vec<String>,
    /// Regime entered; `None` stays in the current regime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_regime: Option<String>,
}

impl OnCondition {
    /// Transition on `trigger` staying in the current regime
    pub fn new(trigger: Expr) -> Self {
        Self {
            trigger,
            state_assignments: IndexMap::new(),
            output_events: Vec::new(),
            target_regime: None,
        }
    }

    /// Add a state assignment
    pub fn with_assignment(mut self, state: impl Into<String>, rhs: Expr) -> Self {
        self.state_assignments.insert(state.into(), rhs);
        self
    }

    /// Add an output event
    pub fn with_output_event(mut self, port: impl Into<String>) -> Self {
        self.output_events.push(port.into());
        self
    }

    /// Set the target regime
    pub fn with_target(mut self, regime: impl Into<String>) -> Self {
        self.target_regime = Some(regime.into());
        self
    }

    /// Target regime, resolving "stay" to `current`
    pub fn target<'a>(&'a self, current: &'a str) -> &'a str {
        self.target_regime.as_deref().unwrap_or(current)
    }
}

impl OnEvent {
    /// Transition on events arriving at `port`
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            src_port: port.into(),
            state_assignments: IndexMap::new(),
            output_events: Vec::new(),
            target_regime: None,
        }
    }

    /// Add a state assignment
    pub fn with_assignment(mut self, state: impl Into<String>, rhs: Expr) -> Self {
        self.state_assignments.insert(state.into(), rhs);
        self
    }

    /// Add an output event
    pub fn with_output_event(mut self, port: impl Into<String>) -> Self {
        self.output_events.push(port.into());
        self
    }

    /// Set the target regime
    pub fn with_target(mut self, regime: impl Into<String>) -> Self {
        self.target_regime = Some(regime.into());
        self
    }

    /// Target regime, resolving "stay" to `current`
    pub fn target<'a>(&'a self, current: &'a str) -> &'a str {
        self.target_regime.as_deref().unwrap_or(current)
    }
}

/// A regime: derivatives, transitions and regime-local aliases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Regime {
    /// Name
    pub name: String,
    /// `d<state>/dt` keyed by state name
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub time_derivatives: IndexMap<String, Expr>,
    /// Condition-triggered transitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_conditions: Vec<OnCondition>,
    /// Event-triggered transitions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_events: Vec<OnEvent>,
    /// Aliases valid only inside this regime
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub aliases: IndexMap<String, Alias>,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Regime {
    /// Empty regime
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            time_derivatives: IndexMap::new(),
            on_conditions: Vec::new(),
            on_events: Vec::new(),
            aliases: IndexMap::new(),
            annotations: Annotations::new(),
        }
    }

    /// Add a time derivative
    pub fn with_derivative(mut self, state: impl Into<String>, rhs: Expr) -> Self {
        self.time_derivatives.insert(state.into(), rhs);
        self
    }

    /// Add an on-condition transition
    pub fn with_on_condition(mut self, oc: OnCondition) -> Self {
        self.on_conditions.push(oc);
        self
    }

    /// Add an on-event transition
    pub fn with_on_event(mut self, oe: OnEvent) -> Self {
        self.on_events.push(oe);
        self
    }

    /// Add a regime-local alias
    pub fn with_alias(mut self, name: impl Into<String>, rhs: Expr) -> Self {
        let name = name.into();
        self.aliases.insert(
            name.clone(),
            Alias {
                name,
                rhs,
                annotations: Annotations::new(),
            },
        );
        self
    }

    /// All expressions of the regime
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.time_derivatives.values().collect();
        out.extend(self.aliases.values().map(|a| &a.rhs));
        for oc in &self.on_conditions {
            out.push(&oc.trigger);
            out.extend(oc.state_assignments.values());
        }
        for oe in &self.on_events {
            out.extend(oe.state_assignments.values());
        }
        out
    }

    /// Target regimes of all transitions, with "stay" resolved
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .on_conditions
            .iter()
            .map(|oc| oc.target(&self.name))
            .collect();
        out.extend(self.on_events.iter().map(|oe| oe.target(&self.name)));
        out
    }

    fn map_expressions(&mut self, f: &mut dyn FnMut(&Expr) -> Expr) {
        for rhs in self.time_derivatives.values_mut() {
            *rhs = f(rhs);
        }
        for alias in self.aliases.values_mut() {
            alias.rhs = f(&alias.rhs);
        }
        for oc in &mut self.on_conditions {
            oc.trigger = f(&oc.trigger);
            for rhs in oc.state_assignments.values_mut() {
                *rhs = f(rhs);
            }
        }
        for oe in &mut self.on_events {
            for rhs in oe.state_assignments.values_mut() {
                *rhs = f(rhs);
            }
        }
    }
}

/// Analog output of a named element
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogSendPort {
    /// Name of the exposed element
    pub name: String,
    /// Dimension
    pub dimension: Dimension,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// Analog input from a single source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogReceivePort {
    /// Name
    pub name: String,
    /// Dimension
    pub dimension: Dimension,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// Analog input reduced over many sources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogReducePort {
    /// Name
    pub name: String,
    /// Dimension
    pub dimension: Dimension,
    /// Reduction operator (only `+` is supported)
    #[serde(default = "default_reduce_op")]
    pub operator: String,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

fn default_reduce_op() -> String {
    "+".to_string()
}

/// Event output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSendPort {
    /// Name
    pub name: String,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

/// Event input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceivePort {
    /// Name
    pub name: String,
    /// Annotations
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

annotated!(
    Parameter,
    StateVariable,
    Constant,
    Alias,
    Regime,
    AnalogSendPort,
    AnalogReceivePort,
    AnalogReducePort,
    EventSendPort,
    EventReceivePort,
);

/// Kind of a named element
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Parameter
    Parameter,
    /// State variable
    StateVariable,
    /// Constant
    Constant,
    /// Global alias
    Alias,
    /// Analog receive port
    AnalogReceivePort,
    /// Analog reduce port
    AnalogReducePort,
}

/// Abstract dynamics of a spiking component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dynamics {
    /// Component class name
    pub name: String,
    /// Parameters
    #[serde(default)]
    pub parameters: IndexMap<String, Parameter>,
    /// State variables
    #[serde(default)]
    pub state_variables: IndexMap<String, StateVariable>,
    /// Constants
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub constants: IndexMap<String, Constant>,
    /// Global aliases
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub aliases: IndexMap<String, Alias>,
    /// Regimes
    #[serde(default)]
    pub regimes: IndexMap<String, Regime>,
    /// Analog send ports
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub analog_send_ports: IndexMap<String, AnalogSendPort>,
    /// Analog receive ports
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub analog_receive_ports: IndexMap<String, AnalogReceivePort>,
    /// Analog reduce ports
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub analog_reduce_ports: IndexMap<String, AnalogReducePort>,
    /// Event send ports
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub event_send_ports: IndexMap<String, EventSendPort>,
    /// Event receive ports
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub event_receive_ports: IndexMap<String, EventReceivePort>,
    /// Annotations of the class itself
    #[serde(default, skip_serializing_if = "Annotations::is_empty")]
    pub annotations: Annotations,
}

impl Dynamics {
    /// Empty dynamics
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: IndexMap::new(),
            state_variables: IndexMap::new(),
            constants: IndexMap::new(),
            aliases: IndexMap::new(),
            regimes: IndexMap::new(),
            analog_send_ports: IndexMap::new(),
            analog_receive_ports: IndexMap::new(),
            analog_reduce_ports: IndexMap::new(),
            event_send_ports: IndexMap::new(),
            event_receive_ports: IndexMap::new(),
            annotations: Annotations::new(),
        }
    }

    /// Add a parameter
    pub fn with_parameter(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        self.add_parameter(name, dimension);
        self
    }

    /// Add a state variable
    pub fn with_state(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        self.add_state(name, dimension);
        self
    }

    /// Add a constant
    pub fn with_constant(mut self, name: impl Into<String>, value: f64, unit: Unit) -> Self {
        self.add_constant(name, value, unit);
        self
    }

    /// Add a global alias
    pub fn with_alias(mut self, name: impl Into<String>, rhs: Expr) -> Self {
        self.add_alias(name, rhs);
        self
    }

    /// Add a regime
    pub fn with_regime(mut self, regime: Regime) -> Self {
        self.regimes.insert(regime.name.clone(), regime);
        self
    }

    /// Add an analog send port
    pub fn with_analog_send(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        self.add_analog_send(name, dimension);
        self
    }

    /// Add an analog receive port
    pub fn with_analog_receive(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        self.add_analog_receive(name, dimension);
        self
    }

    /// Add an analog reduce port (`+`)
    pub fn with_analog_reduce(mut self, name: impl Into<String>, dimension: Dimension) -> Self {
        let name = name.into();
        self.analog_reduce_ports.insert(
            name.clone(),
            AnalogReducePort {
                name,
                dimension,
                operator: default_reduce_op(),
                annotations: Annotations::new(),
            },
        );
        self
    }

    /// Add an event send port
    pub fn with_event_send(mut self, name: impl Into<String>) -> Self {
        self.add_event_send(name);
        self
    }

    /// Add an event receive port
    pub fn with_event_receive(mut self, name: impl Into<String>) -> Self {
        self.add_event_receive(name);
        self
    }

    /// Insert a parameter
    pub fn add_parameter(&mut self, name: impl Into<String>, dimension: Dimension) -> &mut Parameter {
        let name = name.into();
        self.parameters.insert(
            name.clone(),
            Parameter {
                name: name.clone(),
                dimension,
                annotations: Annotations::new(),
            },
        );
        &mut self.parameters[&name]
    }

    /// Insert a state variable
    pub fn add_state(&mut self, name: impl Into<String>, dimension: Dimension) -> &mut StateVariable {
        let name = name.into();
        self.state_variables.insert(
            name.clone(),
            StateVariable {
                name: name.clone(),
                dimension,
                initial: None,
                annotations: Annotations::new(),
            },
        );
        &mut self.state_variables[&name]
    }

    /// Insert a constant
    pub fn add_constant(&mut self, name: impl Into<String>, value: f64, unit: Unit) -> &mut Constant {
        let name = name.into();
        self.constants.insert(
            name.clone(),
            Constant {
                name: name.clone(),
                value,
                unit,
                annotations: Annotations::new(),
            },
        );
        &mut self.constants[&name]
    }

    /// Insert a global alias
    pub fn add_alias(&mut self, name: impl Into<String>, rhs: Expr) -> &mut Alias {
        let name = name.into();
        self.aliases.insert(
            name.clone(),
            Alias {
                name: name.clone(),
                rhs,
                annotations: Annotations::new(),
            },
        );
        &mut self.aliases[&name]
    }

    /// Insert an analog send port
    pub fn add_analog_send(&mut self, name: impl Into<String>, dimension: Dimension) -> &mut AnalogSendPort {
        let name = name.into();
        self.analog_send_ports.insert(
            name.clone(),
            AnalogSendPort {
                name: name.clone(),
                dimension,
                annotations: Annotations::new(),
            },
        );
        &mut self.analog_send_ports[&name]
    }

    /// Insert an analog receive port
    pub fn add_analog_receive(
        &mut self,
        name: impl Into<String>,
        dimension: Dimension,
    ) -> &mut AnalogReceivePort {
        let name = name.into();
        self.analog_receive_ports.insert(
            name.clone(),
            AnalogReceivePort {
                name: name.clone(),
                dimension,
                annotations: Annotations::new(),
            },
        );
        &mut self.analog_receive_ports[&name]
    }

    /// Insert an event send port
    pub fn add_event_send(&mut self, name: impl Into<String>) -> &mut EventSendPort {
        let name = name.into();
        self.event_send_ports.insert(
            name.clone(),
            EventSendPort {
                name: name.clone(),
                annotations: Annotations::new(),
            },
        );
        &mut self.event_send_ports[&name]
    }

    /// Insert an event receive port
    pub fn add_event_receive(&mut self, name: impl Into<String>) -> &mut EventReceivePort {
        let name = name.into();
        self.event_receive_ports.insert(
            name.clone(),
            EventReceivePort {
                name: name.clone(),
                annotations: Annotations::new(),
            },
        );
        &mut self.event_receive_ports[&name]
    }

    /// Annotations of the class
    pub fn annotations(&self) -> &Annotations {
        &self.annotations
    }

    /// Mutable annotations of the class
    pub fn annotations_mut(&mut self) -> &mut Annotations {
        &mut self.annotations
    }

    /// Regime by name
    pub fn regime(&self, name: &str) -> Result<&Regime> {
        self.regimes
            .get(name)
            .ok_or_else(|| DynamicsError::not_found("regime", name))
    }

    /// Zero-based position of a regime
    pub fn regime_index(&self, name: &str) -> Option<usize> {
        self.regimes.get_index_of(name)
    }

    /// Kind of a named element, if it exists
    pub fn element_kind(&self, name: &str) -> Option<ElementKind> {
        if self.parameters.contains_key(name) {
            Some(ElementKind::Parameter)
        } else if self.state_variables.contains_key(name) {
            Some(ElementKind::StateVariable)
        } else if self.constants.contains_key(name) {
            Some(ElementKind::Constant)
        } else if self.aliases.contains_key(name) {
            Some(ElementKind::Alias)
        } else if self.analog_receive_ports.contains_key(name) {
            Some(ElementKind::AnalogReceivePort)
        } else if self.analog_reduce_ports.contains_key(name) {
            Some(ElementKind::AnalogReducePort)
        } else {
            None
        }
    }

    /// Declared dimension of a parameter, state, constant or port
    pub fn dimension_of(&self, name: &str) -> Option<Dimension> {
        if let Some(p) = self.parameters.get(name) {
            return Some(p.dimension);
        }
        if let Some(s) = self.state_variables.get(name) {
            return Some(s.dimension);
        }
        if let Some(c) = self.constants.get(name) {
            return Some(c.unit.dimension);
        }
        if let Some(p) = self.analog_receive_ports.get(name) {
            return Some(p.dimension);
        }
        if let Some(p) = self.analog_reduce_ports.get(name) {
            return Some(p.dimension);
        }
        if let Some(p) = self.analog_send_ports.get(name) {
            return Some(p.dimension);
        }
        None
    }

    /// Every expression of the class (global aliases first, then regimes)
    pub fn expressions(&self) -> Vec<&Expr> {
        let mut out: Vec<&Expr> = self.aliases.values().map(|a| &a.rhs).collect();
        for regime in self.regimes.values() {
            out.extend(regime.expressions());
        }
        out
    }

    /// Symbols referenced by any expression
    pub fn referenced_symbols(&self) -> BTreeSet<String> {
        self.expressions()
            .into_iter()
            .flat_map(|e| e.symbols())
            .collect()
    }

    /// Apply `f` to every expression in place
    pub fn map_expressions(&mut self, f: &mut dyn FnMut(&Expr) -> Expr) {
        for alias in self.aliases.values_mut() {
            alias.rhs = f(&alias.rhs);
        }
        for regime in self.regimes.values_mut() {
            regime.map_expressions(f);
        }
    }

    /// Substitute `replacement` for every reference to `name`
    pub fn substitute(&mut self, name: &str, replacement: &Expr) {
        self.map_expressions(&mut |e| e.substitute(name, replacement));
    }

    /// Simplify every expression in place
    pub fn simplify(&mut self) {
        self.map_expressions(&mut |e| e.simplify());
    }

    /// Rename an element and every reference to it
    pub fn rename_symbol(&mut self, old: &str, new: &str) {
        fn rekey<V: Clone>(map: &mut IndexMap<String, V>, old: &str, new: &str, set: impl Fn(&mut V)) {
            if let Some(idx) = map.get_index_of(old) {
                let entries: Vec<(String, V)> = map
                    .drain(..)
                    .enumerate()
                    .map(|(i, (k, mut v))| {
                        if i == idx {
                            set(&mut v);
                            (new.to_string(), v)
                        } else {
                            (k, v)
                        }
                    })
                    .collect();
                map.extend(entries);
            }
        }
        let n = new.to_string();
        rekey(&mut self.parameters, old, new, |p| p.name = n.clone());
        rekey(&mut self.state_variables, old, new, |s| s.name = n.clone());
        rekey(&mut self.constants, old, new, |c| c.name = n.clone());
        rekey(&mut self.aliases, old, new, |a| a.name = n.clone());
        rekey(&mut self.analog_send_ports, old, new, |p| p.name = n.clone());
        rekey(&mut self.analog_receive_ports, old, new, |p| p.name = n.clone());
        rekey(&mut self.analog_reduce_ports, old, new, |p| p.name = n.clone());
        rekey(&mut self.event_send_ports, old, new, |p| p.name = n.clone());
        rekey(&mut self.event_receive_ports, old, new, |p| p.name = n.clone());
        for regime in self.regimes.values_mut() {
            rekey(&mut regime.time_derivatives, old, new, |_| {});
            rekey(&mut regime.aliases, old, new, |a| a.name = n.clone());
            for oc in &mut regime.on_conditions {
                rekey(&mut oc.state_assignments, old, new, |_| {});
                rename_in(&mut oc.output_events, old, new);
            }
            for oe in &mut regime.on_events {
                rekey(&mut oe.state_assignments, old, new, |_| {});
                rename_in(&mut oe.output_events, old, new);
                if oe.src_port == old {
                    oe.src_port = new.to_string();
                }
            }
        }
        let replacement = Expr::sym(new);
        self.substitute(old, &replacement);
    }

    /// Rename a regime and every transition targeting it
    pub fn rename_regime(&mut self, old: &str, new: &str) {
        let Some(idx) = self.regimes.get_index_of(old) else {
            return;
        };
        let entries: Vec<(String, Regime)> = self
            .regimes
            .drain(..)
            .enumerate()
            .map(|(i, (k, mut r))| {
                if i == idx {
                    r.name = new.to_string();
                    (new.to_string(), r)
                } else {
                    (k, r)
                }
            })
            .collect();
        self.regimes.extend(entries);
        for regime in self.regimes.values_mut() {
            for oc in &mut regime.on_conditions {
                if oc.target_regime.as_deref() == Some(old) {
                    oc.target_regime = Some(new.to_string());
                }
            }
            for oe in &mut regime.on_events {
                if oe.target_regime.as_deref() == Some(old) {
                    oe.target_regime = Some(new.to_string());
                }
            }
        }
    }

    /// Drop annotations outside `namespaces` on the class and every element
    pub fn retain_annotation_namespaces(&mut self, namespaces: &[&str]) {
        let keep = |a: &mut Annotations| a.retain_namespaces(namespaces);
        keep(&mut self.annotations);
        self.parameters.values_mut().for_each(|p| keep(&mut p.annotations));
        self.state_variables.values_mut().for_each(|s| keep(&mut s.annotations));
        self.constants.values_mut().for_each(|c| keep(&mut c.annotations));
        self.aliases.values_mut().for_each(|a| keep(&mut a.annotations));
        self.analog_send_ports.values_mut().for_each(|p| keep(&mut p.annotations));
        self.analog_receive_ports.values_mut().for_each(|p| keep(&mut p.annotations));
        self.analog_reduce_ports.values_mut().for_each(|p| keep(&mut p.annotations));
        self.event_send_ports.values_mut().for_each(|p| keep(&mut p.annotations));
        self.event_receive_ports.values_mut().for_each(|p| keep(&mut p.annotations));
        for regime in self.regimes.values_mut() {
            keep(&mut regime.annotations);
            regime.aliases.values_mut().for_each(|a| keep(&mut a.annotations));
        }
    }

    /// Order-preserving JSON keeping only annotations in `namespaces`
    pub fn canonical_json(&self, namespaces: &[&str]) -> Result<String> {
        let mut stripped = self.clone();
        stripped.retain_annotation_namespaces(namespaces);
        Ok(serde_json::to_string(&stripped)?)
    }

    /// Structural equality in declaration order, comparing annotations only
    /// under `namespaces`
    pub fn equals_under(&self, other: &Dynamics, namespaces: &[&str]) -> bool {
        match (self.canonical_json(namespaces), other.canonical_json(namespaces)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }
}

fn rename_in(names: &mut [String], old: &str, new: &str) {
    for n in names.iter_mut().filter(|n| n.as_str() == old) {
        *n = new.to_string();
    }
}

/// Values bound to a class for one cell: parameters, initial state, initial regime
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties {
    /// Parameter values
    #[serde(default)]
    pub values: IndexMap<String, Quantity>,
    /// Initial state values
    #[serde(default)]
    pub initial_values: IndexMap<String, Quantity>,
    /// Initial regime
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_regime: Option<String>,
}

impl Properties {
    /// Empty properties
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter value
    pub fn with_value(mut self, name: impl Into<String>, q: Quantity) -> Self {
        self.values.insert(name.into(), q);
        self
    }

    /// Set an initial state value
    pub fn with_initial(mut self, name: impl Into<String>, q: Quantity) -> Self {
        self.initial_values.insert(name.into(), q);
        self
    }

    /// Set the initial regime
    pub fn with_initial_regime(mut self, regime: impl Into<String>) -> Self {
        self.initial_regime = Some(regime.into());
        self
    }

    /// Rename a key in both maps
    pub fn rename(&mut self, old: &str, new: &str) {
        if let Some(q) = self.values.shift_remove(old) {
            self.values.insert(new.to_string(), q);
        }
        if let Some(q) = self.initial_values.shift_remove(old) {
            self.initial_values.insert(new.to_string(), q);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::{keys, BUILD_NS};

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn leaky() -> Dynamics {
        Dynamics::new("Leaky")
            .with_parameter("C_m", Dimension::CAPACITANCE)
            .with_parameter("g_L", Dimension::CONDUCTANCE)
            .with_parameter("E_L", Dimension::VOLTAGE)
            .with_parameter("theta", Dimension::VOLTAGE)
            .with_state("V", Dimension::VOLTAGE)
            .with_analog_reduce("i_syn", Dimension::CURRENT)
            .with_analog_send("V", Dimension::VOLTAGE)
            .with_event_send("spike")
            .with_regime(
                Regime::new("sub").with_derivative("V", e("(i_syn - g_L * (V - E_L)) / C_m")).with_on_condition(
                    OnCondition::new(e("V > theta"))
                        .with_assignment("V", e("E_L"))
                        .with_output_event("spike"),
                ),
            )
    }

    #[test]
    fn rename_updates_keys_and_references() {
        let mut d = leaky();
        d.rename_symbol("V", "v");
        assert!(d.state_variables.contains_key("v"));
        assert_eq!(d.state_variables.get_index_of("v"), Some(0));
        assert!(d.analog_send_ports.contains_key("v"));
        let sub = d.regime("sub").unwrap();
        assert!(sub.time_derivatives.contains_key("v"));
        assert!(sub.time_derivatives["v"].contains("v"));
        assert!(!sub.time_derivatives["v"].contains("V"));
        assert!(sub.on_conditions[0].state_assignments.contains_key("v"));
    }

    #[test]
    fn rename_regime_updates_targets() {
        let mut d = leaky().with_regime(Regime::new("refractory"));
        d.regimes["sub"].on_conditions[0].target_regime = Some("refractory".into());
        d.rename_regime("refractory", "ref");
        assert_eq!(d.regime_index("ref"), Some(1));
        assert_eq!(d.regimes["sub"].on_conditions[0].target("sub"), "ref");
    }

    #[test]
    fn equality_ignores_foreign_namespaces() {
        let a = leaky();
        let mut b = leaky();
        b.parameters["g_L"]
            .annotations_mut()
            .set("http://example.org", "note", "leak");
        assert!(a.equals_under(&b, &[BUILD_NS]));
        b.annotations_mut().set(BUILD_NS, keys::BUILD_VERSION, "0.0.1");
        assert!(!a.equals_under(&b, &[BUILD_NS]));
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = Dynamics::new("X")
            .with_parameter("a", Dimension::TIME)
            .with_parameter("b", Dimension::TIME);
        let b = Dynamics::new("X")
            .with_parameter("b", Dimension::TIME)
            .with_parameter("a", Dimension::TIME);
        assert!(!a.equals_under(&b, &[BUILD_NS]));
    }

    #[test]
    fn json_preserves_order() {
        let d = leaky();
        let json = serde_json::to_string(&d).unwrap();
        let back: Dynamics = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        let names: Vec<_> = back.parameters.keys().cloned().collect();
        assert_eq!(names, vec!["C_m", "g_L", "E_L", "theta"]);
    }

    #[test]
    fn dimension_lookup() {
        let d = leaky();
        assert_eq!(d.dimension_of("i_syn"), Some(Dimension::CURRENT));
        assert_eq!(d.element_kind("theta"), Some(ElementKind::Parameter));
        assert_eq!(d.dimension_of("nothing"), None);
    }
}
