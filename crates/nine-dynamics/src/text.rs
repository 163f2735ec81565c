//! Human-readable textual form of a [`Dynamics`] (used by `nine inspect`).

use std::fmt::Write as _;

use indexmap::IndexMap;

use crate::annotations::Annotations;
use crate::expr::Expr;
use crate::model::{Dynamics, Regime};

fn print_indent(out: &mut String, n: usize) {
    for _ in 0..n {
        out.push_str("  ");
    }
}

fn annotation_suffix(a: &Annotations) -> String {
    let mut parts = Vec::new();
    for ns in a.namespaces() {
        let short = ns.rsplit('/').next().unwrap_or(ns);
        for (key, value) in a.entries(ns) {
            parts.push(format!("{}.{} = {}", short, key, value));
        }
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!("  @{{{}}}", parts.join(", "))
    }
}

fn print_assignments(out: &mut String, assignments: &IndexMap<String, Expr>, events: &[String]) {
    let mut items: Vec<String> = assignments
        .iter()
        .map(|(lhs, rhs)| format!("{} = {}", lhs, rhs))
        .collect();
    items.extend(events.iter().map(|e| format!("emit {}", e)));
    let _ = write!(out, "{{ {} }}", items.join("; "));
}

fn print_regime(out: &mut String, regime: &Regime, indent: usize) {
    print_indent(out, indent);
    let _ = writeln!(out, "regime {} {{{}", regime.name, annotation_suffix(&regime.annotations));
    for alias in regime.aliases.values() {
        print_indent(out, indent + 1);
        let _ = writeln!(out, "alias {} = {}{}", alias.name, alias.rhs, annotation_suffix(&alias.annotations));
    }
    for (state, rhs) in &regime.time_derivatives {
        print_indent(out, indent + 1);
        let _ = writeln!(out, "d({})/dt = {}", state, rhs);
    }
    for oc in &regime.on_conditions {
        print_indent(out, indent + 1);
        let _ = write!(out, "on ({}) -> {} ", oc.trigger, oc.target(&regime.name));
        print_assignments(out, &oc.state_assignments, &oc.output_events);
        out.push('\n');
    }
    for oe in &regime.on_events {
        print_indent(out, indent + 1);
        let _ = write!(out, "on_event {} -> {} ", oe.src_port, oe.target(&regime.name));
        print_assignments(out, &oe.state_assignments, &oe.output_events);
        out.push('\n');
    }
    print_indent(out, indent);
    out.push_str("}\n");
}

impl Dynamics {
    /// Render the textual form
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "dynamics {} {{{}", self.name, annotation_suffix(&self.annotations));
        for p in self.parameters.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "parameter {} : {}{}", p.name, p.dimension, annotation_suffix(&p.annotations));
        }
        for s in self.state_variables.values() {
            print_indent(&mut out, 1);
            let init = s
                .initial
                .as_ref()
                .map(|q| format!(" = {}", q))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "state {} : {}{}{}",
                s.name,
                s.dimension,
                init,
                annotation_suffix(&s.annotations)
            );
        }
        for c in self.constants.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "constant {} = {} {}{}", c.name, c.value, c.unit, annotation_suffix(&c.annotations));
        }
        for a in self.aliases.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "alias {} = {}{}", a.name, a.rhs, annotation_suffix(&a.annotations));
        }
        for p in self.analog_send_ports.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "analog_send {} : {}{}", p.name, p.dimension, annotation_suffix(&p.annotations));
        }
        for p in self.analog_receive_ports.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "analog_receive {} : {}{}", p.name, p.dimension, annotation_suffix(&p.annotations));
        }
        for p in self.analog_reduce_ports.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(
                out,
                "analog_reduce {} : {} ({}){}",
                p.name,
                p.dimension,
                p.operator,
                annotation_suffix(&p.annotations)
            );
        }
        for p in self.event_send_ports.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "event_send {}{}", p.name, annotation_suffix(&p.annotations));
        }
        for p in self.event_receive_ports.values() {
            print_indent(&mut out, 1);
            let _ = writeln!(out, "event_receive {}{}", p.name, annotation_suffix(&p.annotations));
        }
        for regime in self.regimes.values() {
            print_regime(&mut out, regime, 1);
        }
        out.push_str("}\n");
        out
    }
}
