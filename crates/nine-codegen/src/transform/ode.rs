//! Compartment (NEURON) rewrite: the membrane voltage becomes the simulator's
//! `v`, its derivative becomes a current-balance alias through the membrane
//! capacitance, and currents injected from outside are split off.

use std::collections::BTreeMap;

use log::{debug, info};
use nine_dynamics::{keys, Alias, Annotations, Dimension, Dynamics, Expr, Unit, BUILD_NS};

use super::{annotate_src, annotated_list, evict, mechanism_type, zero, Pass, ReceptorIndices, TimeDerivativeCounts};
use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;

/// Name of the synthesized membrane current
pub const MEMBRANE_CURRENT: &str = "i___synth";
/// Name of the synthesized capacitance parameter
pub const SYNTH_CAPACITANCE: &str = "cm___synth";
/// Clamp target of regimes without a voltage derivative
pub const CLAMP_VOLTAGE: &str = "v_clamp";
/// Conductance holding a clamped membrane at `v_clamp`
pub const CLAMP_CONDUCTANCE: &str = "g_clamp";
/// Value of [`CLAMP_CONDUCTANCE`] in uS
pub const CLAMP_CONDUCTANCE_US: f64 = 1e8;
/// Suffix of aliases keeping otherwise unused parameters alive
pub const DUMMY_SUFFIX: &str = "___dummy";
/// Ion species of a current not carried by a named ion
pub const NONSPECIFIC: &str = "nonspecific";

const FULL_CELL: &str = "full_cell";
const ARTIFICIAL_CELL: &str = "artificial_cell";
const SUB_COMPONENT: &str = "sub_component";

/// Passes of the ODE variant
pub fn passes(options: &BuildOptions) -> Vec<Box<dyn Pass>> {
    vec![
        Box::new(MembraneVoltage {
            requested: options.membrane_voltage.clone(),
        }),
        Box::new(ReservedNames),
        Box::new(MembraneCapacitance {
            requested: options.membrane_capacitance.clone(),
        }),
        Box::new(DropCurrentSendPorts),
        Box::new(MembraneCurrent),
        Box::new(ElevateMembraneCurrent),
        Box::new(ExternalCurrents {
            requested: options.external_currents.clone(),
        }),
        Box::new(TimeDerivativeCounts),
        Box::new(ReceptorIndices),
        Box::new(DummyAliases),
    ]
}

fn is_full_cell(d: &Dynamics) -> bool {
    mechanism_type(d) == Some(FULL_CELL)
}

enum VoltageSource {
    State(String),
    Port(String),
    Absent,
}

/// Choose the membrane voltage and rename it to `v`
pub struct MembraneVoltage {
    requested: Option<String>,
}

impl MembraneVoltage {
    fn select(&self, d: &Dynamics) -> Result<VoltageSource> {
        if let Some(name) = &self.requested {
            if let Some(s) = d.state_variables.get(name) {
                if s.dimension != Dimension::VOLTAGE {
                    return Err(PipelineError::transform(
                        &d.name,
                        format!("membrane voltage '{}' has dimension {}", name, s.dimension),
                    ));
                }
                return Ok(VoltageSource::State(name.clone()));
            }
            if d.analog_receive_ports.contains_key(name) {
                return Ok(VoltageSource::Port(name.clone()));
            }
            return Err(PipelineError::transform(
                &d.name,
                format!("requested membrane voltage '{}' is neither a state nor a receive port", name),
            ));
        }
        let states: Vec<&str> = d
            .state_variables
            .values()
            .filter(|s| s.dimension == Dimension::VOLTAGE)
            .map(|s| s.name.as_str())
            .collect();
        let (pool, is_state) = if states.is_empty() {
            let ports: Vec<&str> = d
                .analog_receive_ports
                .values()
                .filter(|p| p.dimension == Dimension::VOLTAGE)
                .map(|p| p.name.as_str())
                .collect();
            (ports, false)
        } else {
            (states, true)
        };
        let chosen = match pool.as_slice() {
            [] => return Ok(VoltageSource::Absent),
            [only] => only.to_string(),
            several if several.contains(&"v") => "v".to_string(),
            several => {
                return Err(PipelineError::transform(
                    &d.name,
                    format!(
                        "cannot pick the membrane voltage among {}; name it explicitly",
                        several.join(", ")
                    ),
                ))
            }
        };
        Ok(if is_state {
            VoltageSource::State(chosen)
        } else {
            VoltageSource::Port(chosen)
        })
    }
}

fn rename_to_v(d: &mut Dynamics, name: &str) {
    if name == "v" {
        return;
    }
    evict(d, "v");
    d.rename_symbol(name, "v");
    annotate_src(d, "v", Some(name));
}

impl Pass for MembraneVoltage {
    fn name(&self) -> &'static str {
        "membrane_voltage"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        let kind = match self.select(d)? {
            VoltageSource::Absent => {
                info!("'{}' has no membrane voltage; building an artificial cell", d.name);
                ARTIFICIAL_CELL
            }
            VoltageSource::Port(name) => {
                rename_to_v(d, &name);
                d.annotations_mut().set(BUILD_NS, keys::MEMBRANE_VOLTAGE, "v");
                SUB_COMPONENT
            }
            VoltageSource::State(name) => {
                rename_to_v(d, &name);
                // the simulator exposes v itself
                d.analog_send_ports.shift_remove("v");
                d.annotations_mut().set(BUILD_NS, keys::MEMBRANE_VOLTAGE, "v");
                FULL_CELL
            }
        };
        debug!("'{}' is a {}", d.name, kind);
        d.annotations_mut().set(BUILD_NS, keys::MECHANISM_TYPE, kind);
        Ok(())
    }
}

/// Move user elements off names the compartment simulator owns
pub struct ReservedNames;

/// Identifiers owned by the simulator (besides `v`, handled above)
pub const RESERVED: &[&str] = &["cm"];

impl Pass for ReservedNames {
    fn name(&self) -> &'static str {
        "reserved_names"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        for name in RESERVED {
            if let Some(new) = evict(d, name) {
                info!("renamed '{}' to '{}' in '{}'", name, new, d.name);
            }
        }
        Ok(())
    }
}

/// Find or synthesize the membrane capacitance parameter
pub struct MembraneCapacitance {
    requested: Option<String>,
}

impl Pass for MembraneCapacitance {
    fn name(&self) -> &'static str {
        "membrane_capacitance"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        let name = match &self.requested {
            Some(requested) => {
                let resolved = resolve_renamed(d, requested);
                match d.parameters.get(&resolved) {
                    Some(p) if p.dimension == Dimension::CAPACITANCE => resolved,
                    Some(p) => {
                        return Err(PipelineError::transform(
                            &d.name,
                            format!("membrane capacitance '{}' has dimension {}", requested, p.dimension),
                        ))
                    }
                    None => {
                        return Err(PipelineError::transform(
                            &d.name,
                            format!("membrane capacitance '{}' is not a parameter", requested),
                        ))
                    }
                }
            }
            None => {
                let candidates: Vec<String> = d
                    .parameters
                    .values()
                    .filter(|p| p.dimension == Dimension::CAPACITANCE)
                    .map(|p| p.name.clone())
                    .collect();
                match candidates.len() {
                    0 => {
                        d.add_parameter(SYNTH_CAPACITANCE, Dimension::CAPACITANCE);
                        annotate_src(d, SYNTH_CAPACITANCE, None);
                        SYNTH_CAPACITANCE.to_string()
                    }
                    1 => candidates[0].clone(),
                    _ => {
                        return Err(PipelineError::transform(
                            &d.name,
                            format!(
                                "several capacitance parameters ({}); name the membrane capacitance explicitly",
                                candidates.join(", ")
                            ),
                        ))
                    }
                }
            }
        };
        debug!("membrane capacitance of '{}' is '{}'", d.name, name);
        d.annotations_mut().set(BUILD_NS, keys::MEMBRANE_CAPACITANCE, name);
        Ok(())
    }
}

/// Current name after any reserved-name eviction
fn resolve_renamed(d: &Dynamics, name: &str) -> String {
    if d.element_kind(name).is_some() {
        return name.to_string();
    }
    d.parameters
        .values()
        .find(|p| p.annotations().get_str(BUILD_NS, keys::TRANSFORM_SRC) == Some(name))
        .map(|p| p.name.clone())
        .unwrap_or_else(|| name.to_string())
}

/// Currents leave through the membrane current, not through send ports
pub struct DropCurrentSendPorts;

impl Pass for DropCurrentSendPorts {
    fn name(&self) -> &'static str {
        "drop_current_send_ports"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        d.analog_send_ports.retain(|name, p| {
            let keep = p.dimension != Dimension::CURRENT;
            if !keep {
                debug!("dropping current send port '{}'", name);
            }
            keep
        });
        Ok(())
    }
}

fn alias(name: &str, rhs: Expr) -> Alias {
    Alias {
        name: name.to_string(),
        rhs,
        annotations: Annotations::new(),
    }
}

/// Replace dv/dt by a per-regime membrane current; clamp regimes without one
pub struct MembraneCurrent;

impl Pass for MembraneCurrent {
    fn name(&self) -> &'static str {
        "membrane_current"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        let cm = d
            .annotations()
            .get_str(BUILD_NS, keys::MEMBRANE_CAPACITANCE)
            .map(str::to_string)
            .ok_or_else(|| PipelineError::transform(&d.name, "membrane capacitance was not recorded"))?;
        let mut clamped = Vec::new();
        for regime in d.regimes.values_mut() {
            let current = match regime.time_derivatives.shift_remove("v") {
                Some(dvdt) => Expr::neg(Expr::mul(dvdt, Expr::sym(&cm))).simplify(),
                None => {
                    clamped.push(regime.name.clone());
                    Expr::mul(
                        Expr::sym(CLAMP_CONDUCTANCE),
                        Expr::sub(Expr::sym("v"), Expr::sym(CLAMP_VOLTAGE)),
                    )
                }
            };
            regime.aliases.insert(MEMBRANE_CURRENT.to_string(), alias(MEMBRANE_CURRENT, current));
        }
        if clamped.is_empty() {
            return Ok(());
        }
        info!("'{}' clamps v in regimes {}", d.name, clamped.join(", "));
        d.add_state(CLAMP_VOLTAGE, Dimension::VOLTAGE);
        annotate_src(d, CLAMP_VOLTAGE, None);
        d.add_constant(
            CLAMP_CONDUCTANCE,
            CLAMP_CONDUCTANCE_US,
            Unit::new("uS", Dimension::CONDUCTANCE, -6),
        );
        annotate_src(d, CLAMP_CONDUCTANCE, None);
        for regime in d.regimes.values_mut() {
            let current = regime.name.clone();
            for oc in &mut regime.on_conditions {
                if clamped.iter().any(|c| c == oc.target(&current)) {
                    let value = oc.state_assignments.get("v").cloned().unwrap_or_else(|| Expr::sym("v"));
                    oc.state_assignments.insert(CLAMP_VOLTAGE.to_string(), value);
                }
            }
            for oe in &mut regime.on_events {
                if clamped.iter().any(|c| c == oe.target(&current)) {
                    let value = oe.state_assignments.get("v").cloned().unwrap_or_else(|| Expr::sym("v"));
                    oe.state_assignments.insert(CLAMP_VOLTAGE.to_string(), value);
                }
            }
        }
        Ok(())
    }
}

/// Hoist the most common membrane current into a global alias
pub struct ElevateMembraneCurrent;

impl Pass for ElevateMembraneCurrent {
    fn name(&self) -> &'static str {
        "elevate_membrane_current"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        // printed form -> (count, first position, expression)
        let mut tally: BTreeMap<String, (usize, usize, Expr)> = BTreeMap::new();
        for (pos, regime) in d.regimes.values().enumerate() {
            if let Some(a) = regime.aliases.get(MEMBRANE_CURRENT) {
                tally
                    .entry(a.rhs.to_string())
                    .or_insert_with(|| (0, pos, a.rhs.clone()))
                    .0 += 1;
            }
        }
        let Some((_, _, common)) = tally
            .into_values()
            .max_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)))
        else {
            return Ok(());
        };
        for regime in d.regimes.values_mut() {
            if regime.aliases.get(MEMBRANE_CURRENT).map_or(false, |a| a.rhs == common) {
                regime.aliases.shift_remove(MEMBRANE_CURRENT);
            }
        }
        d.aliases
            .insert(MEMBRANE_CURRENT.to_string(), alias(MEMBRANE_CURRENT, common));
        let port = d.add_analog_send(MEMBRANE_CURRENT, Dimension::CURRENT);
        port.annotations_mut().set(BUILD_NS, keys::ION_SPECIES, NONSPECIFIC);
        Ok(())
    }
}

/// Route currents injected from outside to the simulator's injection channel
pub struct ExternalCurrents {
    requested: Option<Vec<String>>,
}

fn is_current_input(d: &Dynamics, name: &str) -> bool {
    let receive = d
        .analog_receive_ports
        .get(name)
        .map_or(false, |p| p.dimension == Dimension::CURRENT);
    let reduce = d
        .analog_reduce_ports
        .get(name)
        .map_or(false, |p| p.dimension == Dimension::CURRENT);
    receive || reduce
}

/// Membrane current expressions and every other expression of the class
fn partition_expressions(d: &Dynamics) -> (Vec<&Expr>, Vec<&Expr>) {
    let mut membrane = Vec::new();
    let mut others = Vec::new();
    for a in d.aliases.values() {
        if a.name == MEMBRANE_CURRENT {
            membrane.push(&a.rhs);
        } else {
            others.push(&a.rhs);
        }
    }
    for regime in d.regimes.values() {
        for a in regime.aliases.values() {
            if a.name == MEMBRANE_CURRENT {
                membrane.push(&a.rhs);
            } else {
                others.push(&a.rhs);
            }
        }
        others.extend(regime.time_derivatives.values());
        for oc in &regime.on_conditions {
            others.push(&oc.trigger);
            others.extend(oc.state_assignments.values());
        }
        for oe in &regime.on_events {
            others.extend(oe.state_assignments.values());
        }
    }
    (membrane, others)
}

impl ExternalCurrents {
    fn guess(d: &Dynamics) -> Vec<String> {
        let (membrane, others) = partition_expressions(d);
        let candidates = d
            .analog_receive_ports
            .keys()
            .chain(d.analog_reduce_ports.keys())
            .filter(|name| is_current_input(d, name));
        let mut found = Vec::new();
        for name in candidates {
            let additive: usize = membrane
                .iter()
                .map(|e| {
                    e.additive_terms()
                        .iter()
                        .filter(|(_, term)| term.as_sym() == Some(name.as_str()))
                        .count()
                })
                .sum();
            let total: usize = membrane.iter().map(|e| e.count(name)).sum();
            let elsewhere: usize = others.iter().map(|e| e.count(name)).sum();
            if additive > 0 && additive == total && elsewhere == 0 {
                found.push(name.clone());
            }
        }
        found
    }
}

impl Pass for ExternalCurrents {
    fn name(&self) -> &'static str {
        "external_currents"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        let names = match &self.requested {
            Some(requested) => {
                for name in requested {
                    if !is_current_input(d, name) {
                        return Err(PipelineError::transform(
                            &d.name,
                            format!("external current '{}' is not a current receive or reduce port", name),
                        ));
                    }
                }
                requested.clone()
            }
            None => {
                let guessed = Self::guess(d);
                if !guessed.is_empty() {
                    info!("guessed external currents of '{}': {}", d.name, guessed.join(", "));
                }
                guessed
            }
        };
        for name in &names {
            d.analog_receive_ports.shift_remove(name);
            d.analog_reduce_ports.shift_remove(name);
            d.map_expressions(&mut |e| {
                if e.contains(name) {
                    e.substitute(name, &zero()).simplify()
                } else {
                    e.clone()
                }
            });
        }
        let mut listed = annotated_list(d, keys::EXTERNAL_CURRENTS);
        listed.extend(names);
        d.annotations_mut().set(BUILD_NS, keys::EXTERNAL_CURRENTS, listed);
        Ok(())
    }
}

/// Keep parameters the rewrite made unused settable
pub struct DummyAliases;

impl Pass for DummyAliases {
    fn name(&self) -> &'static str {
        "dummy_aliases"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if !is_full_cell(d) {
            return Ok(());
        }
        let referenced = d.referenced_symbols();
        let unused: Vec<String> = d
            .parameters
            .keys()
            .filter(|p| !referenced.contains(p.as_str()))
            .cloned()
            .collect();
        for name in unused {
            let dummy = format!("{}{}", name, DUMMY_SUFFIX);
            d.add_alias(&dummy, Expr::sym(&name))
                .annotations_mut()
                .set(BUILD_NS, keys::TRANSFORM_SRC, name.as_str());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use crate::transform::transform_for_build;
    use nine_dynamics::{OnCondition, OnEvent, Regime};

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
                Regime::new("sub")
                    .with_derivative("V", e("(i_syn - g_L * (V - E_L)) / C_m"))
                    .with_on_condition(
                        OnCondition::new(e("V > theta"))
                            .with_assignment("V", e("E_L"))
                            .with_output_event("spike"),
                    ),
            )
    }

    fn build(d: &Dynamics) -> Dynamics {
        transform_for_build(d, BackendKind::Neuron, &BuildOptions::default()).unwrap()
    }

    #[test]
    fn voltage_becomes_membrane_current() {
        let t = build(&leaky());
        assert_eq!(mechanism_type(&t), Some(FULL_CELL));
        assert!(t.state_variables.contains_key("v"));
        assert!(!t.analog_send_ports.contains_key("v"));
        assert!(t.regimes["sub"].time_derivatives.is_empty());
        assert_eq!(t.aliases[MEMBRANE_CURRENT].rhs.to_string(), "g_L * (v - E_L)");
        assert_eq!(
            t.state_variables["v"].annotations().get_str(BUILD_NS, keys::TRANSFORM_SRC),
            Some("V")
        );
        assert_eq!(t.annotations().get_str(BUILD_NS, keys::MEMBRANE_CAPACITANCE), Some("C_m"));
    }

    #[test]
    fn single_additive_reduce_port_is_external() {
        let t = build(&leaky());
        assert_eq!(annotated_list(&t, keys::EXTERNAL_CURRENTS), vec!["i_syn".to_string()]);
        assert!(!t.analog_reduce_ports.contains_key("i_syn"));
        assert!(t.aliases.contains_key("C_m___dummy"));
    }

    #[test]
    fn port_used_elsewhere_is_not_external() {
        let mut d = leaky().with_state("w", Dimension::CURRENT);
        d.regimes["sub"].time_derivatives.insert("w".into(), e("i_syn * 0.001 - w * 0.001"));
        let t = build(&d);
        assert!(annotated_list(&t, keys::EXTERNAL_CURRENTS).is_empty());
        assert!(t.analog_reduce_ports.contains_key("i_syn"));
    }

    #[test]
    fn clamped_regime_assigns_v_clamp() {
        let mut d = leaky()
            .with_parameter("t_ref", Dimension::TIME)
            .with_state("t_spike", Dimension::TIME)
            .with_regime(Regime::new("refractory").with_on_condition(
                OnCondition::new(e("t > t_spike + t_ref")).with_target("sub"),
            ));
        let sub = &mut d.regimes["sub"];
        sub.on_conditions[0].target_regime = Some("refractory".into());
        sub.on_conditions[0].state_assignments.insert("t_spike".into(), e("t"));
        sub.on_events.push(OnEvent::new("reset").with_target("refractory"));
        d.add_event_receive("reset");

        let t = build(&d);
        assert!(t.state_variables.contains_key(CLAMP_VOLTAGE));
        assert!(t.constants.contains_key(CLAMP_CONDUCTANCE));
        let sub = &t.regimes["sub"];
        assert_eq!(sub.on_conditions[0].state_assignments[CLAMP_VOLTAGE], e("E_L"));
        assert_eq!(sub.on_events[0].state_assignments[CLAMP_VOLTAGE], e("v"));
        let refractory = &t.regimes["refractory"];
        assert!(!refractory.on_conditions[0].state_assignments.contains_key(CLAMP_VOLTAGE));
        assert_eq!(
            refractory.aliases[MEMBRANE_CURRENT].rhs.to_string(),
            "g_clamp * (v - v_clamp)"
        );
        let no_derivs = annotated_list(&t, keys::NO_TIME_DERIVS);
        assert!(no_derivs.contains(&"v".to_string()));
        assert!(no_derivs.contains(&CLAMP_VOLTAGE.to_string()));
    }

    #[test]
    fn artificial_and_sub_component() {
        let d = Dynamics::new("Poisson")
            .with_parameter("rate", Dimension::PER_TIME)
            .with_state("t_next", Dimension::TIME)
            .with_event_send("spike")
            .with_regime(Regime::new("default").with_on_condition(
                OnCondition::new(e("t > t_next"))
                    .with_assignment("t_next", e("t + random.exponential(1 / rate)"))
                    .with_output_event("spike"),
            ));
        assert_eq!(mechanism_type(&build(&d)), Some(ARTIFICIAL_CELL));

        let d = Dynamics::new("Leak")
            .with_parameter("g", Dimension::CONDUCTANCE_DENSITY)
            .with_parameter("e_rev", Dimension::VOLTAGE)
            .with_analog_receive("v", Dimension::VOLTAGE)
            .with_alias("i", e("g * (v - e_rev)"))
            .with_analog_send("i", Dimension::CURRENT_DENSITY)
            .with_regime(Regime::new("default"));
        let t = build(&d);
        assert_eq!(mechanism_type(&t), Some(SUB_COMPONENT));
        assert!(t.analog_send_ports.contains_key("i"));
    }

    #[test]
    fn ambiguous_voltage_is_an_error() {
        let d = leaky().with_state("U", Dimension::VOLTAGE);
        let err = transform_for_build(&d, BackendKind::Neuron, &BuildOptions::default()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("V, U"), "unexpected error: {}", msg);

        let options = BuildOptions {
            membrane_voltage: Some("V".into()),
            ..BuildOptions::default()
        };
        let mut d = d;
        d.regimes["sub"].time_derivatives.insert("U".into(), e("0"));
        let t = transform_for_build(&d, BackendKind::Neuron, &options).unwrap();
        assert!(t.state_variables.contains_key("U"));
    }

    #[test]
    fn ambiguous_capacitance_is_an_error() {
        let mut d = leaky().with_parameter("C_soma", Dimension::CAPACITANCE);
        d.regimes["sub"]
            .time_derivatives
            .insert("V".into(), e("(i_syn - g_L * (V - E_L)) / (C_m + C_soma)"));
        let err = transform_for_build(&d, BackendKind::Neuron, &BuildOptions::default()).unwrap_err();
        assert!(matches!(err, PipelineError::BuildTransform { .. }), "unexpected error: {}", err);
        let msg = err.to_string();
        assert!(msg.contains("C_m") && msg.contains("C_soma"), "unexpected error: {}", msg);

        let options = BuildOptions {
            membrane_capacitance: Some("C_soma".into()),
            ..BuildOptions::default()
        };
        let t = transform_for_build(&d, BackendKind::Neuron, &options).unwrap();
        assert_eq!(t.annotations().get_str(BUILD_NS, keys::MEMBRANE_CAPACITANCE), Some("C_soma"));
    }

    #[test]
    fn reserved_cm_is_renamed() {
        let mut d = leaky();
        d.rename_symbol("C_m", "cm");
        let options = BuildOptions {
            membrane_capacitance: Some("cm".into()),
            ..BuildOptions::default()
        };
        let t = transform_for_build(&d, BackendKind::Neuron, &options).unwrap();
        assert!(!t.parameters.contains_key("cm"));
        assert_eq!(
            t.annotations().get_str(BUILD_NS, keys::MEMBRANE_CAPACITANCE),
            Some("cm___renamed")
        );
    }

    #[test]
    fn capacitance_is_synthesized_when_absent() {
        let d = Dynamics::new("Izhikevich")
            .with_parameter("a", Dimension::PER_TIME)
            .with_state("V", Dimension::VOLTAGE)
            .with_regime(Regime::new("sub").with_derivative("V", e("-a * V")));
        let t = build(&d);
        assert!(t.parameters.contains_key(SYNTH_CAPACITANCE));
        assert_eq!(t.aliases[MEMBRANE_CURRENT].rhs.to_string(), "a * v * cm___synth");
    }
}
