//! Assembling a whole mechanism file into dynamics and properties.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use log::{debug, info, warn};
use nine_dynamics::{
    keys, validate, Dimension, Dynamics, Expr, OnEvent, Properties, Quantity, Regime, Unit, BUILD_NS, NMODL_NS,
};
use serde::Serialize;

use crate::blocks::{self, BlockKind, SourceFile};
use crate::kinetic;
use crate::lift::{Lifter, Routine, Scope, Solve, Subs};
use crate::stmt::{self, matching_paren};
use crate::units::UnitTable;
use crate::{ImportError, Result};

/// Constants NMODL knows by name: value and unit
const INBUILT_CONSTANTS: &[(&str, f64, &str)] = &[
    ("faraday", 96485.3365, "C"),
    ("k-mole", 8.3144621, "J/K"),
    ("pi", std::f64::consts::PI, "1"),
    ("e", 1.602176565e-19, "C"),
];

/// Relative tolerance for recognising an inbuilt constant written as a parameter
const CONSTANT_TOLERANCE: f64 = 1e-4;

/// Port receiving the spike requests of `net_event`
pub const SPIKE_PORT: &str = "spike";

/// How the mechanism attaches to a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MechanismKind {
    /// `SUFFIX`: distributed over a section's membrane
    Density,
    /// `POINT_PROCESS`: located at one point of a section
    PointProcess,
    /// `ARTIFICIAL_CELL`: not attached to any membrane
    ArtificialCell,
}

/// An ion used by the mechanism
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IonUse {
    /// Species (`na`, `k`, `ca`)
    pub species: String,
    /// Ion variables read
    pub read: Vec<String>,
    /// Ion variables written
    pub write: Vec<String>,
    /// Declared valence
    pub valence: Option<f64>,
}

/// Contents of the NEURON block
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NeuronDecl {
    /// Mechanism name
    pub name: String,
    /// Mechanism kind
    pub kind: MechanismKind,
    /// USEION statements
    pub ions: Vec<IonUse>,
    /// NONSPECIFIC_CURRENT names
    pub nonspecific: Vec<String>,
    /// ELECTRODE_CURRENT names
    pub electrode: Vec<String>,
    /// RANGE names
    pub range: Vec<String>,
    /// GLOBAL names
    pub global: Vec<String>,
}

impl NeuronDecl {
    /// Parse the body of a NEURON block
    pub fn parse(body: &str) -> Result<Self> {
        let mut name = None;
        let mut kind = MechanismKind::Density;
        let mut ions: Vec<IonUse> = Vec::new();
        let mut nonspecific = Vec::new();
        let mut electrode = Vec::new();
        let mut range = Vec::new();
        let mut global = Vec::new();
        let mut statement = "";
        let mut clause = "";
        let words = body
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|w| !w.is_empty());
        for word in words {
            match word {
                "SUFFIX" | "POINT_PROCESS" | "ARTIFICIAL_CELL" | "USEION" | "NONSPECIFIC_CURRENT"
                | "ELECTRODE_CURRENT" | "RANGE" | "GLOBAL" | "EXTERNAL" | "THREADSAFE" | "POINTER"
                | "BBCOREPOINTER" => {
                    statement = word;
                    clause = "";
                    match word {
                        "POINT_PROCESS" => kind = MechanismKind::PointProcess,
                        "ARTIFICIAL_CELL" => kind = MechanismKind::ArtificialCell,
                        "USEION" => ions.push(IonUse::default()),
                        _ => {}
                    }
                }
                "READ" | "WRITE" | "VALENCE" | "REPRESENTS" if statement == "USEION" => clause = word,
                _ => match statement {
                    "SUFFIX" | "POINT_PROCESS" | "ARTIFICIAL_CELL" => name = Some(word.to_string()),
                    "USEION" => {
                        let ion = ions
                            .last_mut()
                            .ok_or_else(|| ImportError::syntax("USEION", "missing ion"))?;
                        match clause {
                            "" => ion.species = word.to_string(),
                            "READ" => ion.read.push(word.to_string()),
                            "WRITE" => ion.write.push(word.to_string()),
                            "VALENCE" => {
                                ion.valence = Some(
                                    word.parse()
                                        .map_err(|_| ImportError::syntax("VALENCE", format!("bad valence '{}'", word)))?,
                                )
                            }
                            _ => {}
                        }
                    }
                    "NONSPECIFIC_CURRENT" => nonspecific.push(word.to_string()),
                    "ELECTRODE_CURRENT" => electrode.push(word.to_string()),
                    "RANGE" => range.push(word.to_string()),
                    "GLOBAL" => global.push(word.to_string()),
                    "EXTERNAL" => {}
                    "POINTER" | "BBCOREPOINTER" => return Err(ImportError::unsupported(statement, word)),
                    _ => return Err(ImportError::syntax("NEURON", format!("unexpected '{}'", word))),
                },
            }
        }
        let name = name.ok_or_else(|| ImportError::syntax("NEURON", "no SUFFIX, POINT_PROCESS or ARTIFICIAL_CELL"))?;
        Ok(Self {
            name,
            kind,
            ions,
            nonspecific,
            electrode,
            range,
            global,
        })
    }

    /// Species of an ion variable
    pub fn ion_of(&self, var: &str) -> Option<&str> {
        self.ions
            .iter()
            .find(|ion| ion.read.iter().chain(&ion.write).any(|v| v == var))
            .map(|ion| ion.species.as_str())
    }

    /// Whether an ion variable is written
    pub fn writes(&self, var: &str) -> bool {
        self.ions.iter().any(|ion| ion.write.iter().any(|v| v == var))
    }
}

/// A name declared in PARAMETER, ASSIGNED, STATE or CONSTANT
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    /// Name (array elements expanded to `x__elemN`)
    pub name: String,
    /// Value, when given
    pub value: Option<f64>,
    /// Unit text, when given
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
enum DeclToken {
    Word(String),
    Number(f64),
    Equals,
    Group(String),
}

fn declaration_tokens(line: &str) -> Result<Vec<DeclToken>> {
    let chars: Vec<char> = line.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() || c == ',' {
            i += 1;
        } else if c == '(' {
            let start: usize = chars[..i].iter().map(|c| c.len_utf8()).sum();
            let close = matching_paren(line, start).ok_or_else(|| ImportError::syntax(line, "unbalanced '('"))?;
            out.push(DeclToken::Group(line[start + 1..close].trim().to_string()));
            i += line[start..=close].chars().count();
        } else if c == '<' {
            // <low, high> value range
            while i < chars.len() && chars[i] != '>' {
                i += 1;
            }
            i += 1;
        } else if c == '=' {
            out.push(DeclToken::Equals);
            i += 1;
        } else if c.is_ascii_digit() || c == '.' || c == '-' || c == '+' {
            let start = i;
            i += 1;
            while i < chars.len() {
                let d = chars[i];
                let exponent_sign = (d == '-' || d == '+') && matches!(chars[i - 1], 'e' | 'E');
                if d.is_ascii_digit() || d == '.' || d == 'e' || d == 'E' || exponent_sign {
                    i += 1;
                } else {
                    break;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ImportError::syntax(line, format!("bad number '{}'", text)))?;
            out.push(DeclToken::Number(value));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let mut word: String = chars[start..i].iter().collect();
            if i < chars.len() && chars[i] == '[' {
                while i < chars.len() && chars[i] != ']' {
                    word.push(chars[i]);
                    i += 1;
                }
                word.push(']');
                i += 1;
            }
            out.push(DeclToken::Word(word));
        } else {
            return Err(ImportError::syntax(line, format!("unexpected '{}'", c)));
        }
    }
    Ok(out)
}

/// Parse declaration lines such as `gbar = 0.12 (S/cm2) <0,1e9>` or `m h (1)`
pub fn declarations(body: &str) -> Result<Vec<Declaration>> {
    let mut out: Vec<Declaration> = Vec::new();
    for line in stmt::lines(body) {
        let mut tokens = declaration_tokens(&line)?.into_iter().peekable();
        let mut current: Option<Declaration> = None;
        let mut bounds = false;
        while let Some(token) = tokens.next() {
            match token {
                DeclToken::Word(word) if matches!(word.as_str(), "FROM" | "TO" | "WITH" | "START") => {
                    tokens.next();
                    bounds = true;
                }
                DeclToken::Word(word) => {
                    out.extend(current.take());
                    bounds = false;
                    current = Some(Declaration {
                        name: word,
                        value: None,
                        unit: None,
                    });
                }
                DeclToken::Equals => match (tokens.next(), current.as_mut()) {
                    (Some(DeclToken::Number(v)), Some(decl)) => decl.value = Some(v),
                    _ => return Err(ImportError::syntax(&line, "expected a number after '='")),
                },
                DeclToken::Group(unit) => {
                    if let Some(decl) = current.as_mut().filter(|d| d.unit.is_none() && !bounds) {
                        decl.unit = Some(unit);
                    }
                }
                DeclToken::Number(_) => return Err(ImportError::syntax(&line, "unexpected number")),
            }
        }
        out.extend(current);
    }
    // expand arrays
    let mut expanded = Vec::with_capacity(out.len());
    for decl in out {
        match decl.name.split_once('[') {
            Some((name, size)) => {
                let size: usize = size
                    .trim_end_matches(']')
                    .trim()
                    .parse()
                    .map_err(|_| ImportError::unsupported("array size", decl.name.clone()))?;
                for k in 0..size {
                    expanded.push(Declaration {
                        name: format!("{}__elem{}", name, k),
                        ..decl.clone()
                    });
                }
            }
            None => expanded.push(decl),
        }
    }
    Ok(expanded)
}

/// Name and parameter names of a FUNCTION or PROCEDURE header
fn routine_signature(header: &str) -> Result<(String, Vec<String>)> {
    let open = header.find('(').ok_or_else(|| ImportError::syntax(header, "missing argument list"))?;
    let close = matching_paren(header, open).ok_or_else(|| ImportError::syntax(header, "unbalanced '('"))?;
    let name = header[..open].trim().to_string();
    let params = stmt::split_args(&header[open + 1..close])
        .into_iter()
        .map(|arg| {
            arg.split(|c: char| !(c.is_alphanumeric() || c == '_'))
                .next()
                .unwrap_or("")
                .to_string()
        })
        .filter(|p| !p.is_empty())
        .collect();
    Ok((name, params))
}

/// Arguments of a NET_RECEIVE header with their unit text
fn net_receive_args(header: &str) -> Result<Vec<(String, Option<String>)>> {
    let header = header.trim();
    if header.is_empty() {
        return Ok(Vec::new());
    }
    let close = matching_paren(header, 0).ok_or_else(|| ImportError::syntax(header, "unbalanced '('"))?;
    stmt::split_args(&header[1..close])
        .into_iter()
        .map(|arg| {
            let decls = declarations(&arg)?;
            let decl = decls
                .into_iter()
                .next()
                .ok_or_else(|| ImportError::syntax(header, "empty argument"))?;
            Ok((decl.name, decl.unit))
        })
        .collect()
}

fn inbuilt(name: &str) -> Result<Option<Quantity>> {
    match INBUILT_CONSTANTS.iter().find(|(n, _, _)| *n == name) {
        Some((_, value, unit)) => Ok(Some(Quantity::new(*value, Unit::parse(unit)?))),
        None => Ok(None),
    }
}

/// Parenthesised groups of a line, in order
fn groups(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut from = 0;
    while let Some(rel) = text[from..].find('(') {
        let open = from + rel;
        match matching_paren(text, open) {
            Some(close) => {
                out.push(text[open + 1..close].trim().to_string());
                from = close + 1;
            }
            None => break,
        }
    }
    out
}

/// Result of importing a mechanism
#[derive(Debug, Clone)]
pub struct ImportedMechanism {
    /// Lifted dynamics class, named `<mechanism>Class`
    pub dynamics: Dynamics,
    /// Parameter values and initial states found in the file
    pub properties: Properties,
    /// Mechanism name
    pub component_name: String,
    /// NEURON block contents
    pub neuron: NeuronDecl,
    /// TITLE text
    pub title: Option<String>,
    /// Integration method per SOLVE'd block
    pub solve_methods: IndexMap<String, String>,
}

/// Imports one mechanism file
#[derive(Debug, Clone)]
pub struct Importer {
    file: SourceFile,
}

#[derive(Default)]
struct Assembly {
    aliases: IndexMap<String, Expr>,
    regimes: IndexMap<String, Regime>,
    initial: IndexMap<String, Expr>,
    solves: Vec<Solve>,
    linear: Vec<String>,
    spikes: bool,
}

impl Assembly {
    fn alias(&mut self, name: String, rhs: Expr) {
        match self.aliases.get(&name) {
            Some(existing) if *existing == rhs => {}
            Some(_) => {
                debug!("alias '{}' redefined; keeping the later definition", name);
                self.aliases.insert(name, rhs);
            }
            None => {
                self.aliases.insert(name, rhs);
            }
        }
    }

    fn regime(&mut self, name: &str, scope: Scope, states: &BTreeSet<String>) -> Result<()> {
        let mut regime = Regime::new(name);
        for (lhs, rhs) in scope.bindings {
            match lhs.strip_suffix('\'') {
                Some(state) if states.contains(state) => regime = regime.with_derivative(state, rhs),
                Some(state) => {
                    return Err(ImportError::syntax(
                        format!("{} {}", BlockKind::Derivative, name),
                        format!("derivative of '{}', which is not a state", state),
                    ))
                }
                None if states.contains(&lhs) => warn!("assignment to state '{}' in '{}' ignored", lhs, name),
                None => self.alias(lhs, rhs),
            }
        }
        for (species, rhs) in kinetic::derivatives(&scope.reactions) {
            if !states.contains(&species) {
                return Err(ImportError::syntax(
                    format!("{} {}", BlockKind::Kinetic, name),
                    format!("species '{}' is not a state", species),
                ));
            }
            let rhs = match regime.time_derivatives.shift_remove(&species) {
                Some(explicit) => Expr::add(explicit, rhs),
                None => rhs,
            };
            regime = regime.with_derivative(species, rhs);
        }
        if !scope.constraints.is_empty() {
            regime.annotations_mut().set(NMODL_NS, "constraints", scope.constraints);
        }
        self.solves.extend(scope.solves);
        self.regimes.insert(name.to_string(), regime);
        Ok(())
    }
}

impl Importer {
    /// Split source text into blocks
    pub fn new(source: &str) -> Result<Self> {
        Ok(Self {
            file: blocks::split(source)?,
        })
    }

    /// The block structure
    pub fn source(&self) -> &SourceFile {
        &self.file
    }

    fn declared(&self, kind: BlockKind) -> Result<IndexMap<String, Declaration>> {
        let mut out = IndexMap::new();
        for block in self.file.blocks_of(kind) {
            for decl in declarations(&block.body)? {
                out.insert(decl.name.clone(), decl);
            }
        }
        Ok(out)
    }

    fn routines(&self, kind: BlockKind) -> Result<IndexMap<String, Routine>> {
        let mut out = IndexMap::new();
        for block in self.file.blocks_of(kind) {
            let (name, params) = routine_signature(&block.header)?;
            let body = stmt::parse_block(&block.body)?;
            out.insert(name, Routine { params, body });
        }
        Ok(out)
    }

    fn unit_table(&self, constants: &mut IndexMap<String, Quantity>) -> Result<UnitTable> {
        let mut table = UnitTable::new();
        for block in self.file.blocks_of(BlockKind::Units) {
            for line in stmt::lines(&block.body) {
                let (lhs, rhs) = stmt::split_assignment(&line)
                    .ok_or_else(|| ImportError::syntax(&line, "expected '='"))?;
                if lhs.starts_with('(') {
                    let alias = groups(lhs).into_iter().next().unwrap_or_default();
                    let definition = groups(rhs).into_iter().next().unwrap_or_default();
                    table.define(&alias, &definition)?;
                    continue;
                }
                let parts = groups(rhs);
                let leading = rhs.split('(').next().unwrap_or("").trim();
                let (value, unit_text) = if !leading.is_empty() {
                    let value: f64 = leading
                        .parse()
                        .map_err(|_| ImportError::syntax(&line, format!("bad value '{}'", leading)))?;
                    (Quantity::dimensionless(value), parts.first().cloned())
                } else {
                    let name = parts.first().cloned().unwrap_or_default();
                    let q = inbuilt(&name)?.ok_or_else(|| ImportError::unsupported("unit constant", &line))?;
                    (q, parts.get(1).cloned())
                };
                let unit = table.resolve(unit_text.as_deref().unwrap_or("1"))?;
                let converted = if value.unit.dimension.is_dimensionless() && value.unit.power == 0 {
                    value.value
                } else {
                    value.value * value.unit.si_factor() / unit.si_factor()
                };
                constants.insert(lhs.to_string(), Quantity::new(converted, unit));
            }
        }
        Ok(table)
    }

    /// Lift the mechanism into dynamics and properties
    pub fn import(&self) -> Result<ImportedMechanism> {
        let neuron_block = self
            .file
            .block(BlockKind::Neuron)
            .ok_or_else(|| ImportError::syntax("mechanism", "missing NEURON block"))?;
        let neuron = NeuronDecl::parse(&neuron_block.body)?;
        info!("importing {:?} mechanism '{}'", neuron.kind, neuron.name);

        let mut constants: IndexMap<String, Quantity> = IndexMap::new();
        let units = self.unit_table(&mut constants)?;
        for decl in self.declared(BlockKind::Constant)?.into_values() {
            let value = decl
                .value
                .ok_or_else(|| ImportError::syntax(&decl.name, "constant without a value"))?;
            let unit = units.resolve(decl.unit.as_deref().unwrap_or("1"))?;
            constants.insert(decl.name, Quantity::new(value, unit));
        }
        let parameter_decls = self.declared(BlockKind::Parameter)?;
        let assigned = self.declared(BlockKind::Assigned)?;
        let state_decls = self.declared(BlockKind::State)?;
        let functions = self.routines(BlockKind::Function)?;
        let procedures = self.routines(BlockKind::Procedure)?;

        let parameter_names: BTreeSet<String> = parameter_decls.keys().cloned().collect();
        let state_names: BTreeSet<String> = state_decls.keys().cloned().collect();
        let annotation_units: Vec<String> = units.annotation_names().map(str::to_string).collect();
        let mut lifter = Lifter::new(&functions, &procedures, &parameter_names, &state_names, annotation_units);
        let mut asm = Assembly::default();

        if let Some(block) = self.file.block(BlockKind::Initial) {
            let scope = lifter.lift_block(&stmt::parse_block(&block.body)?)?;
            asm.solves.extend(scope.solves);
            for (lhs, rhs) in scope.bindings {
                if state_names.contains(&lhs) {
                    asm.initial.insert(lhs, rhs);
                } else {
                    asm.alias(lhs, rhs);
                }
            }
        }
        for kind in [BlockKind::Kinetic, BlockKind::Derivative] {
            for block in self.file.blocks_of(kind) {
                let name = block.header.trim();
                let name = if name.is_empty() { kind.keyword() } else { name };
                let scope = lifter.lift_block(&stmt::parse_block(&block.body)?)?;
                asm.regime(name, scope, &state_names)?;
            }
        }
        for block in self.file.blocks_of(BlockKind::Linear) {
            asm.linear.extend(stmt::lines(&block.body));
        }
        if let Some(block) = self.file.block(BlockKind::Breakpoint) {
            let scope = lifter.lift_block(&stmt::parse_block(&block.body)?)?;
            asm.solves.extend(scope.solves);
            for (lhs, rhs) in scope.bindings {
                if state_names.contains(&lhs) {
                    warn!("assignment to state '{}' in BREAKPOINT ignored", lhs);
                } else {
                    asm.alias(lhs, rhs);
                }
            }
        }
        if asm.regimes.is_empty() {
            asm.regimes.insert("default".to_string(), Regime::new("default"));
        }

        let mut receive_args = Vec::new();
        let mut event_port = None;
        if let Some(block) = self.file.block(BlockKind::NetReceive) {
            receive_args = net_receive_args(&block.header)?;
            let port = receive_args
                .first()
                .map(|(w, _)| format!("{}_event", w))
                .unwrap_or_else(|| "event".to_string());
            // only external events arrive without net_send, so flag is always 0
            let subs: Subs = [("flag".to_string(), Expr::num(0.0))].into_iter().collect();
            let scope = lifter.lift_block_with(&stmt::parse_block(&block.body)?, subs)?;
            let mut on_event = OnEvent::new(&port);
            for (lhs, rhs) in scope.bindings {
                if state_names.contains(&lhs) {
                    on_event = on_event.with_assignment(lhs, rhs);
                } else {
                    asm.alias(lhs, rhs);
                }
            }
            for (lhs, rhs) in scope.state_assignments {
                on_event = on_event.with_assignment(lhs, rhs);
            }
            if scope.events_sent > 0 {
                on_event = on_event.with_output_event(SPIKE_PORT);
                asm.spikes = true;
            }
            for regime in asm.regimes.values_mut() {
                regime.on_events.push(on_event.clone());
            }
            event_port = Some(port);
        }

        let mut d = Dynamics::new(format!("{}Class", neuron.name));
        let mut properties = Properties::new();

        for decl in state_decls.values() {
            let unit = units.resolve(decl.unit.as_deref().unwrap_or("1"))?;
            let state = d.add_state(&decl.name, unit.dimension);
            if let Some(rhs) = asm.initial.get(&decl.name) {
                match rhs.eval(&|_| None) {
                    Ok(value) => {
                        let q = Quantity::new(value, unit.clone());
                        state.initial = Some(q.clone());
                        properties.initial_values.insert(decl.name.clone(), q);
                    }
                    // depends on other values; kept for the reader
                    Err(_) => state.annotations.set(NMODL_NS, "initial", rhs.to_string()),
                }
            }
        }

        // parameters that are really inbuilt constants
        let mut parameter_values: IndexMap<String, Quantity> = IndexMap::new();
        for decl in parameter_decls.values() {
            if let Some(value) = decl.value {
                let unit = units.resolve(decl.unit.as_deref().unwrap_or("1"))?;
                let q = Quantity::new(value, unit);
                match recognise_constant(&q)? {
                    Some(name) => {
                        debug!("parameter '{}' is the inbuilt constant '{}'", decl.name, name);
                        constants.insert(decl.name.clone(), q);
                    }
                    None => {
                        parameter_values.insert(decl.name.clone(), q);
                    }
                }
            }
        }
        for (name, q) in &constants {
            d.add_constant(name, q.value, q.unit.clone());
        }

        for (name, rhs) in &asm.aliases {
            if !state_names.contains(name) && !constants.contains_key(name) {
                d.add_alias(name, rhs.clone());
            }
        }
        d.regimes = std::mem::take(&mut asm.regimes);

        // ion ports
        for ion in &neuron.ions {
            for var in &ion.read {
                let fixed = parameter_values.contains_key(var);
                if fixed || state_names.contains(var) || d.aliases.contains_key(var) || neuron.writes(var) {
                    continue;
                }
                let dimension = ion_dimension(var, &assigned, &parameter_decls, &units)?;
                d.add_analog_receive(var, dimension)
                    .annotations_mut()
                    .set(BUILD_NS, keys::ION_SPECIES, ion.species.as_str());
            }
            for var in &ion.write {
                let dimension = match state_decls.get(var) {
                    Some(decl) => units.dimension(decl.unit.as_deref().unwrap_or("1"))?,
                    None => ion_dimension(var, &assigned, &parameter_decls, &units)?,
                };
                d.add_analog_send(var, dimension)
                    .annotations_mut()
                    .set(BUILD_NS, keys::ION_SPECIES, ion.species.as_str());
            }
        }
        for current in neuron.nonspecific.iter().chain(&neuron.electrode) {
            let dimension = current_dimension(current, neuron.kind, &assigned, &units)?;
            let port = d.add_analog_send(current, dimension);
            if neuron.nonspecific.contains(current) {
                port.annotations_mut().set(BUILD_NS, keys::ION_SPECIES, "nonspecific");
            }
        }
        if let Some(port) = &event_port {
            d.add_event_receive(port);
        }
        for (name, unit) in &receive_args {
            let dimension = units.dimension(unit.as_deref().unwrap_or("1"))?;
            d.add_analog_receive(name, dimension);
        }
        if asm.spikes {
            d.add_event_send(SPIKE_PORT);
        }

        // parameters, after ports so ion variables keep their port form
        for decl in parameter_decls.values() {
            if decl.name == "v" || d.element_kind(&decl.name).is_some() {
                continue;
            }
            // celsius is the simulator temperature whatever the file sets it to
            if decl.name == "celsius" {
                if let Some(value) = &decl.value {
                    debug!("celsius = {} ignored; celsius is the temperature port", value);
                }
                continue;
            }
            let dimension = units.dimension(decl.unit.as_deref().unwrap_or("1"))?;
            d.add_parameter(&decl.name, dimension);
            if let Some(q) = parameter_values.get(&decl.name) {
                properties.values.insert(decl.name.clone(), q.clone());
            }
        }

        self.reserved_symbols(&mut d, &assigned, &units)?;

        let annotations = d.annotations_mut();
        if let Some(title) = &self.file.title {
            annotations.set(NMODL_NS, "title", title.as_str());
        }
        if !self.file.comments.is_empty() {
            annotations.set(NMODL_NS, "comment", self.file.comments.join("\n"));
        }
        if !neuron.range.is_empty() {
            annotations.set(NMODL_NS, "range", neuron.range.clone());
        }
        if !neuron.global.is_empty() {
            annotations.set(NMODL_NS, "global", neuron.global.clone());
        }
        if !asm.linear.is_empty() {
            annotations.set(NMODL_NS, "linear", asm.linear.clone());
        }
        let mut solve_methods = IndexMap::new();
        for solve in &asm.solves {
            let method = match (&solve.method, &solve.steady_state) {
                (Some(m), _) => m.clone(),
                (None, Some(s)) => format!("steadystate:{}", s),
                (None, None) => "default".to_string(),
            };
            solve_methods.insert(solve.block.clone(), method);
        }
        if !solve_methods.is_empty() {
            let listed: Vec<String> = solve_methods.iter().map(|(b, m)| format!("{}={}", b, m)).collect();
            annotations.set(NMODL_NS, "solve_methods", listed);
        }

        validate(&d)?;
        info!(
            "imported '{}': {} parameter(s), {} state(s), {} alias(es), {} regime(s)",
            d.name,
            d.parameters.len(),
            d.state_variables.len(),
            d.aliases.len(),
            d.regimes.len()
        );
        Ok(ImportedMechanism {
            dynamics: d,
            properties,
            component_name: neuron.name.clone(),
            neuron,
            title: self.file.title.clone(),
            solve_methods,
        })
    }

    /// Ports and parameters for names the simulator provides implicitly
    fn reserved_symbols(
        &self,
        d: &mut Dynamics,
        assigned: &IndexMap<String, Declaration>,
        units: &UnitTable,
    ) -> Result<()> {
        let referenced = d.referenced_symbols();
        let free = |d: &Dynamics, name: &str| referenced.contains(name) && d.element_kind(name).is_none();
        if free(d, "v") {
            d.add_analog_receive("v", Dimension::VOLTAGE);
        }
        if free(d, "celsius") {
            d.add_analog_receive("celsius", Dimension::TEMPERATURE);
        }
        for (name, dimension) in [("diam", Dimension::LENGTH), ("area", Dimension::AREA), ("dt", Dimension::TIME)] {
            if free(d, name) {
                d.add_parameter(name, dimension);
            }
        }
        if free(d, "PI") {
            d.add_constant("PI", std::f64::consts::PI, Unit::dimensionless());
        }
        // declared but never bound: settable from outside
        for decl in assigned.values() {
            if free(d, &decl.name) {
                warn!("'{}' is read but never assigned; importing it as a parameter", decl.name);
                let dimension = units.dimension(decl.unit.as_deref().unwrap_or("1"))?;
                d.add_parameter(&decl.name, dimension);
            }
        }
        Ok(())
    }
}

/// Name of the inbuilt constant a quantity matches, if any
fn recognise_constant(q: &Quantity) -> Result<Option<&'static str>> {
    for (name, value, unit) in INBUILT_CONSTANTS.iter().take(3) {
        let unit = Unit::parse(unit)?;
        if unit.dimension != q.unit.dimension {
            continue;
        }
        let si = q.value * q.unit.si_factor();
        let reference = value * unit.si_factor();
        if ((si - reference) / reference).abs() < CONSTANT_TOLERANCE {
            return Ok(Some(*name));
        }
    }
    Ok(None)
}

fn ion_dimension(
    var: &str,
    assigned: &IndexMap<String, Declaration>,
    parameters: &IndexMap<String, Declaration>,
    units: &UnitTable,
) -> Result<Dimension> {
    if let Some(unit) = assigned
        .get(var)
        .or_else(|| parameters.get(var))
        .and_then(|d| d.unit.as_deref())
    {
        return units.dimension(unit);
    }
    Ok(if var.starts_with('e') {
        Dimension::VOLTAGE
    } else if var.starts_with('i') {
        Dimension::CURRENT_DENSITY
    } else if var.ends_with('i') || var.ends_with('o') {
        Dimension::CONCENTRATION
    } else {
        return Err(ImportError::unknown_dimension(var, "ion variable without declared units"));
    })
}

fn current_dimension(
    var: &str,
    kind: MechanismKind,
    assigned: &IndexMap<String, Declaration>,
    units: &UnitTable,
) -> Result<Dimension> {
    match assigned.get(var).and_then(|d| d.unit.as_deref()) {
        Some(unit) => units.dimension(unit),
        None if kind == MechanismKind::Density => Ok(Dimension::CURRENT_DENSITY),
        None => Ok(Dimension::CURRENT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neuron_block() {
        let decl = NeuronDecl::parse(
            "SUFFIX hh\nUSEION na READ ena WRITE ina\nUSEION k READ ek WRITE ik VALENCE 1\nNONSPECIFIC_CURRENT il\nRANGE gnabar, gkbar\nGLOBAL minf",
        )
        .unwrap();
        assert_eq!(decl.name, "hh");
        assert_eq!(decl.kind, MechanismKind::Density);
        assert_eq!(decl.ions.len(), 2);
        assert_eq!(decl.ions[1].valence, Some(1.0));
        assert_eq!(decl.ion_of("ik"), Some("k"));
        assert!(decl.writes("ina"));
        assert_eq!(decl.nonspecific, vec!["il".to_string()]);
        assert_eq!(decl.range, vec!["gnabar".to_string(), "gkbar".to_string()]);

        let pp = NeuronDecl::parse("POINT_PROCESS ExpSyn RANGE tau").unwrap();
        assert_eq!(pp.kind, MechanismKind::PointProcess);
        assert!(NeuronDecl::parse("RANGE x").is_err());
        let err = NeuronDecl::parse("SUFFIX x POINTER p").unwrap_err();
        assert!(matches!(err, ImportError::UnsupportedConstruct { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn declaration_lines() {
        let decls = declarations("gbar = .12 (S/cm2) <0,1e9>\ne = -65 (mV)\nm h (1)\nC FROM 0 TO 1\nx[2] (mV)").unwrap();
        let names: Vec<&str> = decls.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["gbar", "e", "m", "h", "C", "x__elem0", "x__elem1"]);
        assert_eq!(decls[0].value, Some(0.12));
        assert_eq!(decls[0].unit.as_deref(), Some("S/cm2"));
        assert_eq!(decls[1].value, Some(-65.0));
        assert_eq!(decls[2].unit, None);
        assert_eq!(decls[3].unit.as_deref(), Some("1"));
        assert_eq!(decls[6].unit.as_deref(), Some("mV"));
    }

    #[test]
    fn signatures() {
        assert_eq!(
            routine_signature("rates(v (mV), celsius)").unwrap(),
            ("rates".to_string(), vec!["v".to_string(), "celsius".to_string()])
        );
        assert_eq!(routine_signature("alpha(x) (/ms)").unwrap().1, vec!["x".to_string()]);
        assert_eq!(
            net_receive_args("(weight (uS), delay)").unwrap(),
            vec![("weight".to_string(), Some("uS".to_string())), ("delay".to_string(), None)]
        );
    }

    #[test]
    fn constants_are_recognised() {
        let faraday = Quantity::new(96485.3, Unit::parse("C").unwrap());
        assert_eq!(recognise_constant(&faraday).unwrap(), Some("faraday"));
        let gas = Quantity::new(8.30, Unit::parse("J/K").unwrap());
        assert_eq!(recognise_constant(&gas).unwrap(), None);
        let gas = Quantity::new(8.31441, Unit::parse("J/K").unwrap());
        assert_eq!(recognise_constant(&gas).unwrap(), Some("k-mole"));
    }
}
