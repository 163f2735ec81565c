//! Structural validation of a [`Dynamics`].

use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::expr::{Expr, BUILTIN_CONSTANTS, BUILTIN_FUNCTIONS, TIME};
use crate::model::{Alias, Dynamics};
use crate::{DynamicsError, Result};

/// Check a dynamics for internal consistency, collecting every violation
pub fn validate(d: &Dynamics) -> Result<()> {
    let mut reasons = Vec::new();
    check_names(d, &mut reasons);
    check_references(d, &mut reasons);
    check_targets(d, &mut reasons);
    check_ports(d, &mut reasons);
    check_alias_cycles(d, &mut reasons);
    if d.regimes.is_empty() {
        reasons.push("at least one regime is required".to_string());
    }
    if reasons.is_empty() {
        debug!("dynamics '{}' validated", d.name);
        Ok(())
    } else {
        Err(DynamicsError::Invalid {
            component: d.name.clone(),
            reasons,
        })
    }
}

fn check_names(d: &Dynamics, reasons: &mut Vec<String>) {
    let mut seen: BTreeMap<&str, &'static str> = BTreeMap::new();
    let groups: [(&'static str, Vec<&str>); 6] = [
        ("parameter", d.parameters.keys().map(String::as_str).collect()),
        ("state variable", d.state_variables.keys().map(String::as_str).collect()),
        ("constant", d.constants.keys().map(String::as_str).collect()),
        ("alias", d.aliases.keys().map(String::as_str).collect()),
        ("analog receive port", d.analog_receive_ports.keys().map(String::as_str).collect()),
        ("analog reduce port", d.analog_reduce_ports.keys().map(String::as_str).collect()),
    ];
    for (kind, names) in groups {
        for name in names {
            if let Some(prev) = seen.insert(name, kind) {
                reasons.push(format!("'{}' is declared both as {} and as {}", name, prev, kind));
            }
            if !is_identifier(name) {
                reasons.push(format!("'{}' is not a valid identifier", name));
            }
        }
    }
    for regime in d.regimes.values() {
        for alias in regime.aliases.keys() {
            if let Some(kind) = seen.get(alias.as_str()) {
                if *kind != "alias" {
                    reasons.push(format!(
                        "regime alias '{}' in '{}' shadows a {}",
                        alias, regime.name, kind
                    ));
                }
            }
        }
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn check_expression(
    context: &str,
    e: &Expr,
    known: &BTreeSet<&str>,
    reasons: &mut Vec<String>,
) {
    for sym in e.symbols() {
        let builtin = sym == TIME || BUILTIN_CONSTANTS.iter().any(|(n, _)| *n == sym);
        if !builtin && !known.contains(sym.as_str()) {
            reasons.push(format!("{} references undeclared '{}'", context, sym));
        }
    }
    for f in e.functions() {
        if !BUILTIN_FUNCTIONS.contains(&f.as_str()) {
            reasons.push(format!("{} calls unknown function '{}'", context, f));
        }
    }
}

fn check_references(d: &Dynamics, reasons: &mut Vec<String>) {
    let global: BTreeSet<&str> = d
        .parameters
        .keys()
        .chain(d.state_variables.keys())
        .chain(d.constants.keys())
        .chain(d.aliases.keys())
        .chain(d.analog_receive_ports.keys())
        .chain(d.analog_reduce_ports.keys())
        .map(String::as_str)
        .collect();

    for alias in d.aliases.values() {
        check_expression(&format!("alias '{}'", alias.name), &alias.rhs, &global, reasons);
    }
    for regime in d.regimes.values() {
        let mut known = global.clone();
        known.extend(regime.aliases.keys().map(String::as_str));
        for alias in regime.aliases.values() {
            let ctx = format!("alias '{}' of regime '{}'", alias.name, regime.name);
            check_expression(&ctx, &alias.rhs, &known, reasons);
        }
        for (state, rhs) in &regime.time_derivatives {
            if !d.state_variables.contains_key(state) {
                reasons.push(format!(
                    "regime '{}' has a derivative of '{}', which is not a state variable",
                    regime.name, state
                ));
            }
            let ctx = format!("d{}/dt in regime '{}'", state, regime.name);
            check_expression(&ctx, rhs, &known, reasons);
        }
        for oc in &regime.on_conditions {
            let ctx = format!("trigger '{}' in regime '{}'", oc.trigger, regime.name);
            check_expression(&ctx, &oc.trigger, &known, reasons);
            check_assignments(d, &regime.name, &oc.state_assignments, &known, reasons);
        }
        for oe in &regime.on_events {
            check_assignments(d, &regime.name, &oe.state_assignments, &known, reasons);
        }
    }
}

fn check_assignments(
    d: &Dynamics,
    regime: &str,
    assignments: &indexmap::IndexMap<String, Expr>,
    known: &BTreeSet<&str>,
    reasons: &mut Vec<String>,
) {
    for (lhs, rhs) in assignments {
        if !d.state_variables.contains_key(lhs) {
            reasons.push(format!(
                "assignment to '{}' in regime '{}' does not target a state variable",
                lhs, regime
            ));
        }
        let ctx = format!("assignment to '{}' in regime '{}'", lhs, regime);
        check_expression(&ctx, rhs, known, reasons);
    }
}

fn check_targets(d: &Dynamics, reasons: &mut Vec<String>) {
    for regime in d.regimes.values() {
        for target in regime.targets() {
            if !d.regimes.contains_key(target) {
                reasons.push(format!(
                    "transition in regime '{}' targets unknown regime '{}'",
                    regime.name, target
                ));
            }
        }
        for oe in &regime.on_events {
            if !d.event_receive_ports.contains_key(&oe.src_port) {
                reasons.push(format!(
                    "on-event in regime '{}' listens on unknown port '{}'",
                    regime.name, oe.src_port
                ));
            }
        }
        let outputs = regime
            .on_conditions
            .iter()
            .flat_map(|oc| oc.output_events.iter())
            .chain(regime.on_events.iter().flat_map(|oe| oe.output_events.iter()));
        for port in outputs {
            if !d.event_send_ports.contains_key(port) {
                reasons.push(format!(
                    "regime '{}' emits on unknown event port '{}'",
                    regime.name, port
                ));
            }
        }
    }
}

fn check_ports(d: &Dynamics, reasons: &mut Vec<String>) {
    for port in d.analog_send_ports.keys() {
        let exposed = d.state_variables.contains_key(port)
            || d.aliases.contains_key(port)
            || d.parameters.contains_key(port)
            || d.regimes.values().any(|r| r.aliases.contains_key(port));
        if !exposed {
            reasons.push(format!("analog send port '{}' exposes no element", port));
        }
    }
    for port in d.analog_reduce_ports.values() {
        if port.operator != "+" {
            reasons.push(format!(
                "reduce port '{}' uses unsupported operator '{}'",
                port.name, port.operator
            ));
        }
    }
}

fn alias_cycle<'a>(aliases: &BTreeMap<&'a str, &'a Alias>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        aliases: &BTreeMap<&'a str, &'a Alias>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<String>,
    ) -> bool {
        match marks.get(name) {
            Some(Mark::Done) => return false,
            Some(Mark::Visiting) => {
                stack.push(name.to_string());
                return true;
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        stack.push(name.to_string());
        if let Some(alias) = aliases.get(name) {
            for dep in alias.rhs.symbols() {
                if let Some((key, _)) = aliases.get_key_value(dep.as_str()) {
                    if visit(*key, aliases, marks, stack) {
                        return true;
                    }
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        false
    }

    let mut marks = BTreeMap::new();
    for name in aliases.keys() {
        let mut stack = Vec::new();
        if visit(*name, aliases, &mut marks, &mut stack) {
            return Some(stack);
        }
    }
    None
}

fn check_alias_cycles(d: &Dynamics, reasons: &mut Vec<String>) {
    let global: BTreeMap<&str, &Alias> = d.aliases.iter().map(|(k, v)| (k.as_str(), v)).collect();
    if let Some(cycle) = alias_cycle(&global) {
        reasons.push(format!("alias cycle: {}", cycle.join(" -> ")));
        return;
    }
    for regime in d.regimes.values() {
        if regime.aliases.is_empty() {
            continue;
        }
        let mut scope = global.clone();
        scope.extend(regime.aliases.iter().map(|(k, v)| (k.as_str(), v)));
        if let Some(cycle) = alias_cycle(&scope) {
            reasons.push(format!(
                "alias cycle in regime '{}': {}",
                regime.name,
                cycle.join(" -> ")
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OnCondition, OnEvent, Regime};
    use crate::units::Dimension;

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn base() -> Dynamics {
        Dynamics::new("Cell")
            .with_parameter("tau", Dimension::TIME)
            .with_parameter("theta", Dimension::VOLTAGE)
            .with_state("v", Dimension::VOLTAGE)
            .with_event_send("spike")
            .with_event_receive("input")
            .with_regime(
                Regime::new("sub")
                    .with_derivative("v", e("-v / tau"))
                    .with_on_condition(
                        OnCondition::new(e("v > theta"))
                            .with_assignment("v", e("0"))
                            .with_output_event("spike"),
                    )
                    .with_on_event(OnEvent::new("input").with_assignment("v", e("v + 1"))),
            )
    }

    #[test]
    fn valid_model_passes() {
        validate(&base()).unwrap();
    }

    #[test]
    fn undeclared_symbol_is_reported() {
        let mut d = base();
        d.regimes["sub"].time_derivatives["v"] = e("-(v - E) / tau");
        let err = validate(&d).unwrap_err();
        assert!(err.to_string().contains("undeclared 'E'"), "{}", err);
    }

    #[test]
    fn every_violation_is_collected() {
        let mut d = base();
        d.regimes["sub"].on_conditions[0].target_regime = Some("missing".into());
        d.regimes["sub"].on_events[0].src_port = "nowhere".into();
        d.regimes["sub"].on_conditions[0].output_events.push("bogus".into());
        match validate(&d).unwrap_err() {
            DynamicsError::Invalid { reasons, .. } => assert_eq!(reasons.len(), 3, "{:?}", reasons),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn alias_cycle_detected() {
        let d = base().with_alias("a", e("b + 1")).with_alias("b", e("a * 2"));
        let err = validate(&d).unwrap_err();
        assert!(err.to_string().contains("alias cycle"));
    }

    #[test]
    fn duplicate_names_across_kinds() {
        let d = base().with_parameter("v", Dimension::VOLTAGE);
        let err = validate(&d).unwrap_err();
        assert!(err.to_string().contains("'v' is declared both"), "{}", err);
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("i___synth"));
        assert!(!is_identifier("2x"));
        assert!(!is_identifier("a.b"));
    }
}
