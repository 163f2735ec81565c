//! Lifting imperative statements into single-assignment expressions.
//!
//! Function calls are inlined at their call site under a name derived from
//! the arguments (`rates(v + 10)` binds `rates_v__p__10`), procedures are
//! inlined into the calling scope and `if` chains become piecewise values.
//! A variable assigned twice keeps its first value under `<name>__tmp`.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use log::{debug, trace};
use nine_dynamics::expr::BUILTIN_FUNCTIONS;
use nine_dynamics::{Expr, Piece};

use crate::kinetic::{Reaction, ReactionText};
use crate::stmt::{Branch, Stmt};
use crate::{ImportError, Result};

/// Names currently standing for other expressions
pub type Subs = BTreeMap<String, Expr>;

/// A FUNCTION or PROCEDURE body
#[derive(Debug, Clone, Default)]
pub struct Routine {
    /// Parameter names
    pub params: Vec<String>,
    /// Body statements
    pub body: Vec<Stmt>,
}

/// A SOLVE statement
#[derive(Debug, Clone, PartialEq)]
pub struct Solve {
    /// Solved block
    pub block: String,
    /// Integration method
    pub method: Option<String>,
    /// Steady-state method
    pub steady_state: Option<String>,
}

/// Everything one block binds
#[derive(Debug, Clone, Default)]
pub struct Scope {
    /// Single-assignment bindings in definition order; derivatives end in `'`
    pub bindings: IndexMap<String, Expr>,
    /// Explicit state assignments (`state_discontinuity`)
    pub state_assignments: IndexMap<String, Expr>,
    /// `net_event` calls
    pub events_sent: usize,
    /// SOLVE statements
    pub solves: Vec<Solve>,
    /// Kinetic reactions
    pub reactions: Vec<Reaction>,
    /// CONSERVE and COMPARTMENT statements, kept as text
    pub constraints: Vec<String>,
}

impl Scope {
    /// Merge an inlined body, its bindings replacing any of the same name
    fn absorb(&mut self, other: Scope) {
        self.bindings.extend(other.bindings);
        self.state_assignments.extend(other.state_assignments);
        self.events_sent += other.events_sent;
        self.solves.extend(other.solves);
        self.reactions.extend(other.reactions);
        self.constraints.extend(other.constraints);
    }
}

enum Guard {
    When(Expr),
    Else(Expr),
}

impl Guard {
    fn condition(&self) -> &Expr {
        match self {
            Guard::When(c) | Guard::Else(c) => c,
        }
    }
}

/// Flatten a branch value into `pieces` under `guard`
fn push_unwrapped(pieces: &mut Vec<Piece>, guard: &Guard, value: Expr) {
    match value {
        Expr::Piecewise(inner) => {
            for piece in inner {
                match piece {
                    Piece::When { cond, value } => {
                        let nested = Guard::When(Expr::and(guard.condition().clone(), cond));
                        push_unwrapped(pieces, &nested, value);
                    }
                    Piece::Otherwise { value } => push_unwrapped(pieces, guard, value),
                }
            }
        }
        value => pieces.push(match guard {
            Guard::When(cond) => Piece::When {
                cond: cond.clone(),
                value,
            },
            Guard::Else(_) => Piece::Otherwise { value },
        }),
    }
}

/// Name suffix for a call with these arguments
pub fn call_suffix(args: &[Expr]) -> String {
    let mut out = String::new();
    for arg in args {
        out.push('_');
        for c in arg.to_string().chars() {
            match c {
                '+' => out.push_str("__p__"),
                '-' => out.push_str("__m__"),
                '*' => out.push_str("__x__"),
                '/' => out.push_str("__d__"),
                '(' => out.push_str("__o__"),
                ')' => out.push_str("__c__"),
                '.' => out.push('_'),
                ' ' => {}
                c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
                _ => out.push('_'),
            }
        }
    }
    out
}

fn local_name(lhs: &str, suffix: &str) -> String {
    if lhs.ends_with('\'') {
        return lhs.to_string();
    }
    let mut name = format!("{}{}", lhs, suffix);
    if BUILTIN_FUNCTIONS.contains(&name.as_str()) {
        name.push('_');
    }
    name
}

fn base_name<'n>(name: &'n str, suffix: &str) -> &'n str {
    let name = name.strip_suffix('_').filter(|n| BUILTIN_FUNCTIONS.contains(n)).unwrap_or(name);
    if suffix.is_empty() {
        name
    } else {
        name.strip_suffix(suffix).unwrap_or(name)
    }
}

/// Rewrite constant array subscripts `x[2]` as `x__elem2`
pub fn array_elements(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find('[') {
        let close = rest[open..]
            .find(']')
            .map(|i| i + open)
            .ok_or_else(|| ImportError::syntax(text, "unbalanced '['"))?;
        let index = rest[open + 1..close].trim();
        if index.is_empty() || !index.chars().all(|c| c.is_ascii_digit()) {
            return Err(ImportError::unsupported("array index", text));
        }
        out.push_str(rest[..open].trim_end());
        out.push_str("__elem");
        out.push_str(index);
        rest = &rest[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Remove `(unit)` annotations from expression text
fn strip_unit_annotations(text: &str, units: &[String]) -> String {
    let mut out = text.to_string();
    for unit in units {
        out = out.replace(&format!("({})", unit), " ");
    }
    // `(/ms)` can only be a unit
    while let Some(open) = out.find("(/") {
        match out[open..].find(')') {
            Some(len) => out.replace_range(open..open + len + 1, " "),
            None => break,
        }
    }
    out
}

/// Lifts the statements of one mechanism
#[derive(Debug)]
pub struct Lifter<'a> {
    functions: &'a IndexMap<String, Routine>,
    procedures: &'a IndexMap<String, Routine>,
    parameters: &'a BTreeSet<String>,
    states: &'a BTreeSet<String>,
    units: Vec<String>,
    call_stack: Vec<String>,
}

impl<'a> Lifter<'a> {
    /// Lifter over the routines and declarations of a mechanism
    pub fn new(
        functions: &'a IndexMap<String, Routine>,
        procedures: &'a IndexMap<String, Routine>,
        parameters: &'a BTreeSet<String>,
        states: &'a BTreeSet<String>,
        units: Vec<String>,
    ) -> Self {
        Self {
            functions,
            procedures,
            parameters,
            states,
            units,
            call_stack: Vec::new(),
        }
    }

    /// Lift a block body
    pub fn lift_block(&mut self, stmts: &[Stmt]) -> Result<Scope> {
        self.lift_block_with(stmts, Subs::new())
    }

    /// Lift a block body with some names already standing for expressions
    pub fn lift_block_with(&mut self, stmts: &[Stmt], mut subs: Subs) -> Result<Scope> {
        let mut scope = Scope::default();
        self.lift_into(stmts, &mut scope, &mut subs, "")?;
        Ok(scope)
    }

    /// Parse and lift expression text in the context of `scope`
    pub fn expression(&mut self, text: &str, scope: &mut Scope, subs: &Subs) -> Result<Expr> {
        let cleaned = array_elements(&strip_unit_annotations(text, &self.units))?;
        let parsed = Expr::parse(&cleaned).map_err(|e| ImportError::syntax(text.trim(), e.to_string()))?;
        self.inline_calls(parsed.substitute_all(subs), scope)
    }

    fn lift_into(&mut self, stmts: &[Stmt], scope: &mut Scope, subs: &mut Subs, suffix: &str) -> Result<()> {
        for stmt in stmts {
            match stmt {
                Stmt::Assign { lhs, rhs } => {
                    let value = self.expression(rhs, scope, subs)?;
                    self.assign(lhs, value, scope, subs, suffix)?;
                }
                Stmt::If { branches } => self.conditional(branches, scope, subs, suffix)?,
                Stmt::Call { name, args } => self.call(name, args, scope, subs, suffix)?,
                Stmt::Solve {
                    block,
                    method,
                    steady_state,
                } => scope.solves.push(Solve {
                    block: block.clone(),
                    method: method.clone(),
                    steady_state: steady_state.clone(),
                }),
                Stmt::Reaction(text) => {
                    let reaction = self.reaction(text, scope, subs)?;
                    scope.reactions.push(reaction);
                }
                Stmt::Conserve(text) => scope.constraints.push(format!("CONSERVE {}", text)),
                Stmt::Compartment(text) => scope.constraints.push(format!("COMPARTMENT {}", text)),
            }
        }
        Ok(())
    }

    fn reaction(&mut self, text: &str, scope: &mut Scope, subs: &Subs) -> Result<Reaction> {
        Ok(match ReactionText::parse(text)? {
            ReactionText::Reversible {
                lhs,
                rhs,
                forward,
                backward,
            } => Reaction::Reversible {
                lhs,
                rhs,
                forward: self.expression(&forward, scope, subs)?,
                backward: self.expression(&backward, scope, subs)?,
            },
            ReactionText::Influx { species, rate } => Reaction::Influx {
                species,
                rate: self.expression(&rate, scope, subs)?,
            },
            ReactionText::Outflux { species, rate } => Reaction::Outflux {
                species,
                rate: self.expression(&rate, scope, subs)?,
            },
        })
    }

    /// Replace `f_flux` / `b_flux` by aliases of the last reaction's fluxes
    fn resolve_fluxes(&mut self, value: Expr, scope: &mut Scope) -> Result<Expr> {
        if !value.contains("f_flux") && !value.contains("b_flux") {
            return Ok(value);
        }
        let index = scope.reactions.len().saturating_sub(1);
        let (forward, backward) = scope
            .reactions
            .last()
            .and_then(Reaction::fluxes)
            .ok_or_else(|| ImportError::syntax(value.to_string(), "flux used before a reversible reaction"))?;
        let f_name = format!("f_flux_{}", index);
        let b_name = format!("b_flux_{}", index);
        scope.bindings.insert(f_name.clone(), forward);
        scope.bindings.insert(b_name.clone(), backward);
        Ok(value
            .substitute("f_flux", &Expr::sym(f_name))
            .substitute("b_flux", &Expr::sym(b_name)))
    }

    fn assign(&mut self, lhs: &str, value: Expr, scope: &mut Scope, subs: &mut Subs, suffix: &str) -> Result<()> {
        let lhs = array_elements(lhs)?;
        let value = self.resolve_fluxes(value, scope)?;
        let target = local_name(&lhs, suffix);
        if target != lhs {
            subs.insert(lhs, Expr::sym(&target));
        }
        bind(scope, target, value);
        Ok(())
    }

    fn inline_calls(&mut self, expr: Expr, scope: &mut Scope) -> Result<Expr> {
        Ok(match expr {
            Expr::Call(name, args) => {
                let args = args
                    .into_iter()
                    .map(|a| self.inline_calls(a, scope))
                    .collect::<Result<Vec<_>>>()?;
                let functions = self.functions;
                if let Some(routine) = functions.get(&name) {
                    let suffix = call_suffix(&args);
                    let result = local_name(&name, &suffix);
                    if !scope.bindings.contains_key(&result) {
                        self.expand(&name, routine, args, &suffix, scope)?;
                    }
                    Expr::sym(result)
                } else if name == "fabs" {
                    Expr::call("abs", args)
                } else if BUILTIN_FUNCTIONS.contains(&name.as_str()) {
                    Expr::call(name, args)
                } else {
                    return Err(ImportError::syntax(name, "call of an undefined function"));
                }
            }
            Expr::Unary(op, a) => Expr::Unary(op, Box::new(self.inline_calls(*a, scope)?)),
            Expr::Binary(op, a, b) => {
                let a = self.inline_calls(*a, scope)?;
                let b = self.inline_calls(*b, scope)?;
                Expr::Binary(op, Box::new(a), Box::new(b))
            }
            Expr::Piecewise(pieces) => Expr::Piecewise(
                pieces
                    .into_iter()
                    .map(|piece| {
                        Ok(match piece {
                            Piece::When { cond, value } => Piece::When {
                                cond: self.inline_calls(cond, scope)?,
                                value: self.inline_calls(value, scope)?,
                            },
                            Piece::Otherwise { value } => Piece::Otherwise {
                                value: self.inline_calls(value, scope)?,
                            },
                        })
                    })
                    .collect::<Result<Vec<_>>>()?,
            ),
            leaf => leaf,
        })
    }

    /// Inline a routine body with its parameters bound to `args`
    fn expand(&mut self, name: &str, routine: &Routine, args: Vec<Expr>, suffix: &str, scope: &mut Scope) -> Result<()> {
        if self.call_stack.iter().any(|n| n == name) {
            return Err(ImportError::Recursion { name: name.to_string() });
        }
        if routine.params.len() != args.len() {
            return Err(ImportError::syntax(
                name,
                format!("expected {} arguments, got {}", routine.params.len(), args.len()),
            ));
        }
        trace!("inlining {}{}", name, suffix);
        let mut subs: Subs = routine.params.iter().cloned().zip(args).collect();
        let mut local = Scope::default();
        self.call_stack.push(name.to_string());
        let lifted = self.lift_into(&routine.body, &mut local, &mut subs, suffix);
        self.call_stack.pop();
        lifted?;
        scope.absorb(local);
        Ok(())
    }

    fn call(&mut self, name: &str, args: &[String], scope: &mut Scope, subs: &mut Subs, suffix: &str) -> Result<()> {
        match name {
            "state_discontinuity" => {
                let [state, value] = args else {
                    return Err(ImportError::syntax(name, "expected two arguments"));
                };
                let state = array_elements(state)?;
                let value = self.expression(value, scope, subs)?;
                scope.state_assignments.insert(state, value);
            }
            "net_event" => scope.events_sent += 1,
            "net_send" | "net_move" => {
                return Err(ImportError::unsupported(name, format!("{}({})", name, args.join(", "))))
            }
            _ => {
                let values = args
                    .iter()
                    .map(|a| self.expression(a, scope, subs))
                    .collect::<Result<Vec<_>>>()?;
                let procedures = self.procedures;
                if let Some(routine) = procedures.get(name) {
                    self.expand(name, routine, values, suffix, scope)?;
                } else if self.functions.contains_key(name) {
                    // a function called for its side effects
                    self.inline_calls(Expr::call(name, values), scope)?;
                } else {
                    return Err(ImportError::unsupported(name, format!("{}({})", name, args.join(", "))));
                }
            }
        }
        Ok(())
    }

    fn conditional(&mut self, branches: &[Branch], scope: &mut Scope, subs: &mut Subs, suffix: &str) -> Result<()> {
        let mut tests: Vec<Expr> = Vec::new();
        let mut lifted: Vec<(Guard, Scope)> = Vec::new();
        for branch in branches {
            let guard = match &branch.test {
                Some(text) => {
                    let test = self.expression(text, scope, subs)?;
                    let cond = tests
                        .iter()
                        .fold(test.clone(), |acc, prev| Expr::and(acc, Expr::not(prev.clone())));
                    tests.push(test);
                    Guard::When(cond)
                }
                None => {
                    let negated = tests.iter().cloned().map(Expr::not).reduce(Expr::and);
                    let cond = negated.ok_or_else(|| ImportError::syntax("else", "'else' without 'if'"))?;
                    Guard::Else(cond)
                }
            };
            let mut inner = Scope::default();
            let mut inner_subs = subs.clone();
            self.lift_into(&branch.body, &mut inner, &mut inner_subs, suffix)?;
            lifted.push((guard, inner));
        }
        let has_else = matches!(lifted.last(), Some((Guard::Else(_), _)));

        let common: Vec<String> = match lifted.first() {
            Some((_, first)) => first
                .bindings
                .keys()
                .filter(|k| lifted.iter().all(|(_, s)| s.bindings.contains_key(*k)))
                .cloned()
                .collect(),
            None => Vec::new(),
        };

        // names bound in only some branches keep a per-branch escape, as do
        // names bound in every branch that are read later in the same branch
        for (i, (_, inner)) in lifted.iter_mut().enumerate() {
            let entries: Vec<(String, Expr)> = inner.bindings.drain(..).collect();
            let mut renames: Vec<(String, Expr)> = Vec::new();
            for (pos, (key, value)) in entries.iter().enumerate() {
                let value = renames
                    .iter()
                    .fold(value.clone(), |acc, (old, new)| acc.substitute(old, new));
                let escaped = format!("{}__branch{}{}", base_name(key, suffix), i, suffix);
                if !common.contains(key) {
                    bind(scope, escaped.clone(), value);
                    renames.push((key.clone(), Expr::sym(escaped)));
                } else if entries[pos + 1..].iter().any(|(_, later)| later.contains(key)) {
                    bind(scope, escaped.clone(), value);
                    inner.bindings.insert(key.clone(), Expr::sym(&escaped));
                    renames.push((key.clone(), Expr::sym(escaped)));
                } else {
                    inner.bindings.insert(key.clone(), value);
                }
            }
        }

        for key in &common {
            let mut pieces = Vec::new();
            for (guard, inner) in &lifted {
                if let Some(value) = inner.bindings.get(key) {
                    push_unwrapped(&mut pieces, guard, value.clone());
                }
            }
            let base = base_name(key, suffix).to_string();
            let mut target = key.clone();
            if !has_else {
                let fallback = if scope.bindings.contains_key(key) || self.states.contains(key) {
                    Expr::sym(key)
                } else if let Some(arg) = subs.get(&base).filter(|e| e.as_sym() != Some(key.as_str())) {
                    arg.clone()
                } else if self.parameters.contains(&base) {
                    target = format!("{}_constrained", key);
                    Expr::sym(key)
                } else {
                    return Err(ImportError::unwrapping(
                        key,
                        "not assigned in every branch and no prior value exists",
                    ));
                };
                pieces.push(Piece::Otherwise { value: fallback });
            }
            debug!("unwrapped conditional assignment to '{}'", target);
            bind(scope, target.clone(), Expr::Piecewise(pieces));
            if target != base {
                subs.insert(base, Expr::sym(target));
            }
        }

        for (_, inner) in lifted {
            scope.state_assignments.extend(inner.state_assignments);
            scope.events_sent += inner.events_sent;
            scope.solves.extend(inner.solves);
            scope.reactions.extend(inner.reactions);
            scope.constraints.extend(inner.constraints);
        }
        Ok(())
    }
}

/// Bind `name`, moving an earlier binding of the same name to `<name>__tmp`
fn bind(scope: &mut Scope, name: String, mut value: Expr) {
    if let Some((index, _, prior)) = scope.bindings.shift_remove_full(&name) {
        let mut tmp = format!("{}__tmp", name);
        let mut n = 0;
        while scope.bindings.contains_key(&tmp) {
            n += 1;
            tmp = format!("{}__tmp{}", name, n);
        }
        let tmp_sym = Expr::sym(&tmp);
        for other in scope.bindings.values_mut() {
            *other = other.substitute(&name, &tmp_sym);
        }
        for other in scope.state_assignments.values_mut() {
            *other = other.substitute(&name, &tmp_sym);
        }
        value = value.substitute(&name, &tmp_sym);
        trace!("rebinding '{}', earlier value kept as '{}'", name, tmp);
        // keep the earlier value where it was bound so binding order stays sequential
        scope.bindings.shift_insert(index, tmp, prior);
    }
    scope.bindings.insert(name, value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stmt::parse_block;

    struct Fixture {
        functions: IndexMap<String, Routine>,
        procedures: IndexMap<String, Routine>,
        parameters: BTreeSet<String>,
        states: BTreeSet<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                functions: IndexMap::new(),
                procedures: IndexMap::new(),
                parameters: BTreeSet::new(),
                states: BTreeSet::new(),
            }
        }

        fn function(mut self, name: &str, params: &[&str], body: &str) -> Self {
            self.functions.insert(
                name.to_string(),
                Routine {
                    params: params.iter().map(|p| p.to_string()).collect(),
                    body: parse_block(body).unwrap(),
                },
            );
            self
        }

        fn procedure(mut self, name: &str, params: &[&str], body: &str) -> Self {
            self.procedures.insert(
                name.to_string(),
                Routine {
                    params: params.iter().map(|p| p.to_string()).collect(),
                    body: parse_block(body).unwrap(),
                },
            );
            self
        }

        fn lift(&self, body: &str) -> Result<Scope> {
            let mut lifter = Lifter::new(
                &self.functions,
                &self.procedures,
                &self.parameters,
                &self.states,
                vec!["mV".to_string()],
            );
            lifter.lift_block(&parse_block(body)?)
        }
    }

    fn eval(expr: &Expr, values: &[(&str, f64)]) -> f64 {
        expr.eval(&|name| values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v))
            .unwrap()
    }

    #[test]
    fn call_suffixes() {
        let args = vec![Expr::parse("v + 10").unwrap(), Expr::sym("celsius")];
        assert_eq!(call_suffix(&args), "_v__p__10_celsius");
    }

    #[test]
    fn functions_are_inlined_per_argument() {
        let fixture = Fixture::new().function("sq", &["x"], "sq = x*x");
        let scope = fixture.lift("a = sq(v) + sq(v)\nb = sq(2)").unwrap();
        assert_eq!(scope.bindings["sq_v"], Expr::parse("v*v").unwrap());
        assert_eq!(scope.bindings["sq_2"], Expr::parse("2*2").unwrap());
        assert_eq!(scope.bindings["a"], Expr::parse("sq_v + sq_v").unwrap());
    }

    #[test]
    fn procedures_write_into_the_caller() {
        let fixture = Fixture::new().procedure("rates", &["u"], "minf = 1/(1 + exp(-u))\nmtau = 2");
        let scope = fixture.lift("rates(v + 5 (mV))\nm' = (minf - m)/mtau").unwrap();
        assert_eq!(scope.bindings["minf"], Expr::parse("1/(1 + exp(-(v + 5)))").unwrap());
        assert!(scope.bindings.contains_key("m'"));
    }

    #[test]
    fn rebinding_keeps_the_earlier_value() {
        let scope = Fixture::new().lift("a = 1\nb = a + 1\na = 3\nc = a").unwrap();
        assert_eq!(scope.bindings["a__tmp"], Expr::num(1.0));
        assert_eq!(scope.bindings["b"], Expr::parse("a__tmp + 1").unwrap());
        assert_eq!(scope.bindings["c"], Expr::sym("a"));
    }

    #[test]
    fn if_else_becomes_piecewise() {
        let scope = Fixture::new().lift("if (v > 0) {\n a = 1\n} else {\n a = 2\n}").unwrap();
        let a = &scope.bindings["a"];
        assert!(matches!(a, Expr::Piecewise(pieces) if pieces.len() == 2));
        assert_eq!(eval(a, &[("v", 1.0)]), 1.0);
        assert_eq!(eval(a, &[("v", -1.0)]), 2.0);
    }

    #[test]
    fn else_if_conditions_exclude_earlier_tests() {
        let scope = Fixture::new()
            .lift("if (v > 0) {\n a = 1\n} else if (v > -10) {\n a = 2\n} else {\n a = 3\n}")
            .unwrap();
        let a = &scope.bindings["a"];
        assert_eq!(eval(a, &[("v", 5.0)]), 1.0);
        assert_eq!(eval(a, &[("v", -5.0)]), 2.0);
        assert_eq!(eval(a, &[("v", -50.0)]), 3.0);
    }

    #[test]
    fn missing_else_falls_back_to_prior_binding() {
        let scope = Fixture::new().lift("a = 5\nif (v > 0) {\n a = 1\n}").unwrap();
        assert_eq!(scope.bindings["a__tmp"], Expr::num(5.0));
        assert_eq!(eval(&scope.bindings["a"], &[("v", -1.0), ("a__tmp", 5.0)]), 5.0);
    }

    #[test]
    fn missing_else_without_prior_value_fails() {
        let err = Fixture::new().lift("if (v > 0) {\n a = 1\n}").unwrap_err();
        assert!(matches!(err, ImportError::Unwrapping { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn constrained_parameters() {
        let mut fixture = Fixture::new();
        fixture.parameters.insert("gmax".to_string());
        let scope = fixture.lift("if (gmax < 0) {\n gmax = 0\n}\ng = gmax * 2").unwrap();
        assert!(scope.bindings.contains_key("gmax_constrained"));
        assert_eq!(scope.bindings["g"], Expr::parse("gmax_constrained * 2").unwrap());
    }

    #[test]
    fn partial_assignments_are_escaped() {
        let scope = Fixture::new()
            .lift("if (v > 0) {\n t1 = 2\n a = t1\n} else {\n a = 3\n}")
            .unwrap();
        assert_eq!(scope.bindings["t1__branch0"], Expr::num(2.0));
        assert_eq!(eval(&scope.bindings["a"], &[("v", 1.0), ("t1__branch0", 2.0)]), 2.0);
    }

    /// Evaluate `expr`, expanding aliases bound in `scope`
    fn resolve(expr: &Expr, scope: &Scope, values: &[(&str, f64)]) -> f64 {
        expr.eval(&|name| match scope.bindings.get(name) {
            Some(alias) => Some(resolve(alias, scope, values)),
            None => values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v),
        })
        .unwrap()
    }

    #[test]
    fn branch_reads_see_the_branch_value() {
        let scope = Fixture::new()
            .lift("x = 1\nif (c > 0) {\n x = 2\n y = x\n} else {\n x = 3\n}")
            .unwrap();
        assert_eq!(resolve(&scope.bindings["y__branch0"], &scope, &[("c", 1.0)]), 2.0);
        assert_eq!(resolve(&scope.bindings["x"], &scope, &[("c", 1.0)]), 2.0);
        assert_eq!(resolve(&scope.bindings["x"], &scope, &[("c", -1.0)]), 3.0);
        assert_eq!(scope.bindings["x__tmp"], Expr::num(1.0));
    }

    #[test]
    fn branch_reads_before_assignment_see_the_outer_value() {
        let scope = Fixture::new()
            .lift("x = 1\nif (c > 0) {\n y = x\n x = 2\n} else {\n x = 3\n}")
            .unwrap();
        assert_eq!(scope.bindings["y__branch0"], Expr::sym("x__tmp"));
        assert_eq!(scope.bindings["x__tmp"], Expr::num(1.0));
    }

    #[test]
    fn recursion_is_rejected() {
        let fixture = Fixture::new().function("f", &["x"], "f = f(x - 1)");
        let err = fixture.lift("a = f(v)").unwrap_err();
        assert!(matches!(err, ImportError::Recursion { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn arrays_and_builtins() {
        let scope = Fixture::new().lift("a[2] = fabs(x[1])").unwrap();
        assert_eq!(scope.bindings["a__elem2"], Expr::parse("abs(x__elem1)").unwrap());
        let err = Fixture::new().lift("a = x[i]").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedConstruct { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn state_discontinuity_assigns_state() {
        let scope = Fixture::new().lift("state_discontinuity(g, g + w)\nnet_event(t)").unwrap();
        assert_eq!(scope.state_assignments["g"], Expr::parse("g + w").unwrap());
        assert_eq!(scope.events_sent, 1);
    }
}
