//! NEURON back-end: one NMODL mechanism per class, compiled by `nrnivmodl`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use minijinja::Value;
use nine_dynamics::{keys, Dimension, Dynamics, Expr, Quantity, Regime, BUILD_NS};
use serde::Serialize;

use super::print::{ExprPrinter, NMODL_SNIPPETS};
use super::{alias_closure, infer_dimension, ordered_aliases, output_name, template_root, Backend, BackendKind};
use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;
use crate::paths::{self, BuildLayout};
use crate::render::TemplateRenderer;
use crate::toolchain::{CommandOutput, Registrar, Registration, Toolchain};
use crate::transform::ode::CLAMP_VOLTAGE;
use crate::transform::{annotated_list, mechanism_type, receptor_index};
use crate::units::UnitHandler;

/// Variable holding the regime index in generated mechanisms
pub const REGIME_VAR: &str = "regime_";
/// Variable seeding the random helpers
pub const SEED_VAR: &str = "seed_";
/// Marker modlunit prints on unit errors
const MODLUNIT_ERROR: &str = "<<ERROR>>";
/// Suffix make prints when nrnivmodl's compile fails
const MAKE_FAILURE: &str = "Error 1";

/// The NEURON back-end
#[derive(Debug, Clone, Copy, Default)]
pub struct NeuronBackend;

#[derive(Debug, Serialize)]
struct Declared {
    name: String,
    units: String,
}

#[derive(Debug, Serialize)]
struct ConstantDecl {
    name: String,
    value: String,
    units: String,
}

#[derive(Debug, Serialize)]
struct IonUse {
    name: String,
    read: Vec<String>,
    write: Vec<String>,
}

/// Everything `main.tmpl` binds
#[derive(Debug, Serialize)]
struct MechanismContext {
    class_name: String,
    source_name: String,
    pipeline_version: String,
    mechanism_type: String,
    keyword: String,
    ions: Vec<IonUse>,
    nonspecific: Vec<String>,
    ranges: Vec<String>,
    parameters: Vec<Declared>,
    constants: Vec<ConstantDecl>,
    assigned: Vec<Declared>,
    states: Vec<Declared>,
    initial: Vec<String>,
    breakpoint: Vec<String>,
    solve_method: Option<String>,
    derivative: Vec<String>,
    net_receive: Vec<String>,
    uses_random: bool,
}

fn indent(lines: Vec<String>, by: usize) -> Vec<String> {
    let pad = " ".repeat(by);
    lines.into_iter().map(|l| format!("{}{}", pad, l)).collect()
}

/// `if (regime_ == i) { ... } else if ...` over per-regime statement blocks
fn regime_switch(blocks: Vec<(usize, Vec<String>)>) -> Vec<String> {
    let mut lines = Vec::new();
    let mut first = true;
    for (index, body) in blocks.into_iter().filter(|(_, b)| !b.is_empty()) {
        let keyword = if first { "if" } else { "} else if" };
        lines.push(format!("{} ({} == {}) {{", keyword, REGIME_VAR, index));
        lines.extend(indent(body, 4));
        first = false;
    }
    if !first {
        lines.push("}".to_string());
    }
    lines
}

struct Generator<'a> {
    class: &'a Dynamics,
    units: &'static UnitHandler,
    printer: ExprPrinter,
    multi_regime: bool,
    ode_states: BTreeSet<String>,
}

impl<'a> Generator<'a> {
    fn new(class: &'a Dynamics) -> Self {
        let ode_states = class
            .regimes
            .values()
            .flat_map(|r| r.time_derivatives.keys().cloned())
            .filter(|s| s != "v")
            .collect();
        Self {
            class,
            units: UnitHandler::neuron(),
            printer: ExprPrinter::nmodl(),
            multi_regime: class.regimes.len() > 1,
            ode_states,
        }
    }

    fn units_of(&self, dimension: Option<Dimension>) -> Result<String> {
        match dimension {
            Some(d) => self.units.unit_str(d),
            None => Ok("1".to_string()),
        }
    }

    fn value(&self, q: &Quantity) -> Result<String> {
        Ok(format!("{}", self.units.scale_value(q)?))
    }

    fn is_full_cell(&self) -> bool {
        mechanism_type(self.class) == Some("full_cell")
    }

    fn global_aliases(&self) -> BTreeMap<&str, &Expr> {
        self.class
            .aliases
            .values()
            .map(|a| (a.name.as_str(), &a.rhs))
            .collect()
    }

    /// Global alias statements needed by `roots`, in dependency order
    fn alias_statements<'e>(&self, roots: impl IntoIterator<Item = &'e Expr>) -> Result<Vec<String>> {
        let needed = alias_closure(roots, &self.global_aliases());
        let mut lines = Vec::new();
        for alias in ordered_aliases(self.class.aliases.values()) {
            if needed.contains(&alias.name) {
                lines.extend(self.printer.assignment(&alias.name, &alias.rhs)?);
            }
        }
        Ok(lines)
    }

    fn regime_alias_statements(&self, regime: &Regime) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for alias in ordered_aliases(regime.aliases.values()) {
            lines.extend(self.printer.assignment(&alias.name, &alias.rhs)?);
        }
        Ok(lines)
    }

    fn derivative_lines(&self, regime: &Regime) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for state in &self.ode_states {
            match regime.time_derivatives.get(state) {
                Some(rhs) => lines.extend(self.printer.assignment(&format!("{}'", state), rhs)?),
                None => lines.push(format!("{}' = 0", state)),
            }
        }
        Ok(lines)
    }

    fn derivative(&self) -> Result<Vec<String>> {
        if self.ode_states.is_empty() {
            return Ok(Vec::new());
        }
        let roots: Vec<&Expr> = self
            .class
            .regimes
            .values()
            .flat_map(|r| r.time_derivatives.values().chain(r.aliases.values().map(|a| &a.rhs)))
            .collect();
        let mut lines = self.alias_statements(roots)?;
        if self.multi_regime {
            let mut blocks = Vec::new();
            for (i, regime) in self.class.regimes.values().enumerate() {
                let mut body = self.regime_alias_statements(regime)?;
                body.extend(self.derivative_lines(regime)?);
                blocks.push((i, body));
            }
            lines.extend(regime_switch(blocks));
        } else if let Some(regime) = self.class.regimes.values().next() {
            lines.extend(self.regime_alias_statements(regime)?);
            lines.extend(self.derivative_lines(regime)?);
        }
        Ok(lines)
    }

    fn breakpoint(&self) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for alias in ordered_aliases(self.class.aliases.values()) {
            lines.extend(self.printer.assignment(&alias.name, &alias.rhs)?);
        }
        if self.multi_regime {
            let mut blocks = Vec::new();
            for (i, regime) in self.class.regimes.values().enumerate() {
                blocks.push((i, self.regime_alias_statements(regime)?));
            }
            lines.extend(regime_switch(blocks));
        } else if let Some(regime) = self.class.regimes.values().next() {
            lines.extend(self.regime_alias_statements(regime)?);
        }
        Ok(lines)
    }

    fn initial(&self, has_watches: bool, uses_random: bool) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        if self.multi_regime {
            let start = self
                .class
                .annotations()
                .get_str(BUILD_NS, keys::DEFAULT_REGIME)
                .and_then(|r| self.class.regime_index(r))
                .unwrap_or(0);
            lines.push(format!("{} = {}", REGIME_VAR, start));
        }
        if uses_random {
            lines.push(format!("nineml_seed({})", SEED_VAR));
        }
        for state in self.class.state_variables.values() {
            if state.name == "v" {
                continue;
            }
            if let Some(q) = &state.initial {
                lines.push(format!("{} = {}", state.name, self.value(q)?));
            } else if state.name == CLAMP_VOLTAGE {
                lines.push(format!("{} = v", CLAMP_VOLTAGE));
            }
        }
        if has_watches {
            lines.push("net_send(0, 1)".to_string());
        }
        Ok(lines)
    }

    /// Statements of one transition, guarded by its source regime
    fn transition(
        &self,
        regime_index: usize,
        assignments: &indexmap::IndexMap<String, Expr>,
        emits: bool,
        target: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut body = Vec::new();
        for (lhs, rhs) in assignments {
            if lhs == "v" && self.is_full_cell() {
                body.push(": v is reset through v_clamp".to_string());
                continue;
            }
            body.extend(self.printer.assignment(lhs, rhs)?);
        }
        if emits {
            body.push("net_event(t)".to_string());
        }
        if let Some(target) = target.filter(|t| *t != regime_index) {
            body.push(format!("{} = {}", REGIME_VAR, target));
        }
        if !self.multi_regime {
            return Ok(body);
        }
        let mut lines = vec![format!("if ({} == {}) {{", REGIME_VAR, regime_index)];
        lines.extend(indent(body, 4));
        lines.push("}".to_string());
        Ok(lines)
    }

    fn net_receive(&self, polled: bool) -> Result<Vec<String>> {
        let mut incoming: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        let mut watches = Vec::new();
        let mut handlers = Vec::new();
        let mut flag = 2usize;
        for (i, regime) in self.class.regimes.values().enumerate() {
            for oe in &regime.on_events {
                let channel = receptor_index(self.class, &oe.src_port).unwrap_or(0);
                let target = oe.target_regime.as_deref().and_then(|t| self.class.regime_index(t));
                incoming
                    .entry(channel)
                    .or_default()
                    .extend(self.transition(i, &oe.state_assignments, !oe.output_events.is_empty(), target)?);
            }
            for oc in &regime.on_conditions {
                let trigger = self.printer.print(&oc.trigger)?;
                let target = oc.target_regime.as_deref().and_then(|t| self.class.regime_index(t));
                let body =
                    self.transition(i, &oc.state_assignments, !oc.output_events.is_empty(), target)?;
                if polled {
                    let guard = if self.multi_regime {
                        format!("if ({} == {} && {}) {{", REGIME_VAR, i, trigger)
                    } else {
                        format!("if ({}) {{", trigger)
                    };
                    watches.push(guard);
                    watches.extend(indent(body, 4));
                    watches.push("}".to_string());
                } else {
                    watches.push(format!("WATCH ({}) {}", trigger, flag));
                    handlers.push((flag, body));
                    flag += 1;
                }
            }
        }
        let mut lines = Vec::new();
        let mut first = true;
        let mut open = |cond: String, lines: &mut Vec<String>| {
            let keyword = if first { "if" } else { "} else if" };
            lines.push(format!("{} ({}) {{", keyword, cond));
            first = false;
        };
        if !incoming.is_empty() {
            open("flag == 0".to_string(), &mut lines);
            let mut channel_first = true;
            for (channel, body) in incoming {
                let keyword = if channel_first { "if" } else { "} else if" };
                lines.push(format!("    {} (channel == {}) {{", keyword, channel));
                lines.extend(indent(body, 8));
                channel_first = false;
            }
            lines.push("    }".to_string());
        }
        if !watches.is_empty() {
            open("flag == 1".to_string(), &mut lines);
            lines.extend(indent(watches, 4));
            if polled {
                lines.push("    net_send(dt, 1)".to_string());
            }
        }
        for (flag, body) in handlers {
            open(format!("flag == {}", flag), &mut lines);
            lines.extend(indent(body, 4));
        }
        if !first {
            lines.push("}".to_string());
        }
        Ok(lines)
    }

    fn context(&self, pipeline_version: &str) -> Result<MechanismContext> {
        let class = self.class;
        let kind = mechanism_type(class).unwrap_or("artificial_cell");
        let has_odes = !self.ode_states.is_empty();
        let keyword = match kind {
            "sub_component" => "SUFFIX",
            "artificial_cell" if !has_odes => "ARTIFICIAL_CELL",
            _ => "POINT_PROCESS",
        };
        let uses_random = class
            .expressions()
            .iter()
            .any(|e| e.functions().iter().any(|f| f.starts_with("random.")));
        let has_transitions = class
            .regimes
            .values()
            .any(|r| !r.on_conditions.is_empty() || !r.on_events.is_empty());
        let polled = keyword == "ARTIFICIAL_CELL";

        let mut ions: BTreeMap<String, IonUse> = BTreeMap::new();
        let mut ion_vars: BTreeSet<String> = BTreeSet::new();
        let mut nonspecific = Vec::new();
        for port in class.analog_send_ports.values() {
            let current = port.dimension == Dimension::CURRENT || port.dimension == Dimension::CURRENT_DENSITY;
            match port.annotations().get_str(BUILD_NS, keys::ION_SPECIES) {
                Some("nonspecific") => nonspecific.push(port.name.clone()),
                Some(ion) => {
                    ions.entry(ion.to_string())
                        .or_insert_with(|| IonUse {
                            name: ion.to_string(),
                            read: Vec::new(),
                            write: Vec::new(),
                        })
                        .write
                        .push(port.name.clone());
                    ion_vars.insert(port.name.clone());
                }
                None if current && kind == "sub_component" => nonspecific.push(port.name.clone()),
                None => {}
            }
        }
        for port in class.analog_receive_ports.values() {
            if let Some(ion) = port.annotations().get_str(BUILD_NS, keys::ION_SPECIES) {
                ions.entry(ion.to_string())
                    .or_insert_with(|| IonUse {
                        name: ion.to_string(),
                        read: Vec::new(),
                        write: Vec::new(),
                    })
                    .read
                    .push(port.name.clone());
                ion_vars.insert(port.name.clone());
            }
        }

        let parameters = class
            .parameters
            .values()
            .map(|p| {
                Ok(Declared {
                    name: p.name.clone(),
                    units: self.units.unit_str(p.dimension)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let constants = class
            .constants
            .values()
            .map(|c| {
                let q = Quantity::new(c.value, c.unit.clone());
                Ok(ConstantDecl {
                    name: c.name.clone(),
                    value: self.value(&q)?,
                    units: self.units.unit_str(c.unit.dimension)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let mut states = Vec::new();
        let mut assigned = Vec::new();
        for s in class.state_variables.values() {
            let decl = Declared {
                name: s.name.clone(),
                units: self.units.unit_str(s.dimension)?,
            };
            if s.name == "v" {
                continue;
            }
            if self.ode_states.contains(&s.name) {
                states.push(decl);
            } else {
                assigned.push(decl);
            }
        }
        let references_v = class.referenced_symbols().contains("v") || self.is_full_cell();
        if references_v {
            assigned.insert(
                0,
                Declared {
                    name: "v".to_string(),
                    units: self.units.unit_str(Dimension::VOLTAGE)?,
                },
            );
        }
        for port in class.analog_receive_ports.values().filter(|p| p.name != "v") {
            assigned.push(Declared {
                name: port.name.clone(),
                units: self.units.unit_str(port.dimension)?,
            });
        }
        for port in class.analog_reduce_ports.values() {
            assigned.push(Declared {
                name: port.name.clone(),
                units: self.units.unit_str(port.dimension)?,
            });
        }
        let mut alias_names: Vec<(String, Option<&Regime>, &Expr)> = class
            .aliases
            .values()
            .map(|a| (a.name.clone(), None, &a.rhs))
            .collect();
        for regime in class.regimes.values() {
            for a in regime.aliases.values() {
                if !alias_names.iter().any(|(n, _, _)| *n == a.name) {
                    alias_names.push((a.name.clone(), Some(regime), &a.rhs));
                }
            }
        }
        for (name, regime, rhs) in &alias_names {
            let dimension = class
                .analog_send_ports
                .get(name)
                .map(|p| p.dimension)
                .or_else(|| infer_dimension(class, *regime, rhs));
            assigned.push(Declared {
                name: name.clone(),
                units: self.units_of(dimension)?,
            });
        }
        if self.multi_regime {
            assigned.push(Declared {
                name: REGIME_VAR.to_string(),
                units: "1".to_string(),
            });
        }
        if uses_random {
            assigned.push(Declared {
                name: SEED_VAR.to_string(),
                units: "1".to_string(),
            });
        }

        let ranges: Vec<String> = parameters
            .iter()
            .map(|p| p.name.clone())
            .chain(
                assigned
                    .iter()
                    .filter(|a| a.name != "v" && !ion_vars.contains(&a.name) && !nonspecific.contains(&a.name))
                    .map(|a| a.name.clone()),
            )
            .collect();

        Ok(MechanismContext {
            class_name: class.name.clone(),
            source_name: class
                .annotations()
                .get_str(BUILD_NS, keys::TRANSFORM_SRC)
                .unwrap_or(&class.name)
                .to_string(),
            pipeline_version: pipeline_version.to_string(),
            mechanism_type: kind.to_string(),
            keyword: keyword.to_string(),
            ions: ions.into_values().collect(),
            nonspecific,
            ranges,
            parameters,
            constants,
            assigned,
            states,
            initial: self.initial(has_transitions && class.regimes.values().any(|r| !r.on_conditions.is_empty()), uses_random)?,
            breakpoint: self.breakpoint()?,
            solve_method: None,
            derivative: self.derivative()?,
            net_receive: if has_transitions { self.net_receive(polled)? } else { Vec::new() },
            uses_random,
        })
    }
}

/// Template context of a transformed class
pub fn mechanism_context(class: &Dynamics, options: &BuildOptions) -> Result<Value> {
    let generator = Generator::new(class);
    let mut ctx = generator.context(crate::VERSION)?;
    if !generator.ode_states.is_empty() {
        ctx.solve_method = Some(options.neuron.ode_solver.clone());
    }
    Ok(Value::from_serialize(&ctx))
}

/// Render the NMODL text of a transformed class
pub fn mechanism_source(class: &Dynamics, options: &BuildOptions) -> Result<String> {
    NeuronBackend
        .renderer(options)
        .render("main.tmpl", mechanism_context(class, options)?)
}

/// modlunit writes `<<ERROR>>` on unit inconsistencies and still exits 0
pub fn modlunit_failed(out: &CommandOutput) -> bool {
    out.stderr.contains(MODLUNIT_ERROR)
}

/// nrnivmodl fails by exit code or by make's trailing `Error 1`
pub fn nrnivmodl_failed(out: &CommandOutput) -> bool {
    !out.success() || out.stderr.trim_end().ends_with(MAKE_FAILURE)
}

fn compile_error(step: &str, dir: &Path, out: CommandOutput) -> PipelineError {
    PipelineError::BuildCompile {
        step: step.to_string(),
        dir: dir.to_path_buf(),
        stdout: out.stdout,
        stderr: out.stderr,
    }
}

/// `-L` flags for GSL, from the option or from `nest-config --libs`
fn gsl_flags(options: &BuildOptions, toolchain: &dyn Toolchain, cwd: &Path) -> String {
    let mut flags: Vec<String> = Vec::new();
    match &options.neuron.gsl_path {
        Some(path) => flags.push(format!("-L{}", path.display())),
        None => match toolchain.run(&options.neuron.nest_config, &["--libs".to_string()], cwd) {
            Ok(out) if out.success() => {
                flags.extend(out.stdout.split_whitespace().filter(|f| f.starts_with("-L")).map(str::to_string));
            }
            Ok(out) => warn!("{} --libs failed: {}", options.neuron.nest_config, out.stderr.trim()),
            Err(e) => warn!("cannot locate GSL: {}", e),
        },
    }
    flags.push("-lgsl".to_string());
    flags.push("-lgslcblas".to_string());
    flags.join(" ")
}

impl Backend for NeuronBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Neuron
    }

    fn version<'a>(&self, options: &'a BuildOptions) -> &'a str {
        &options.neuron.version
    }

    fn layout(&self, build_dir: &Path) -> BuildLayout {
        let src_dir = build_dir.join("src");
        BuildLayout {
            build_dir: build_dir.to_path_buf(),
            compile_dir: src_dir.clone(),
            install_dir: src_dir.join(std::env::consts::ARCH),
            src_dir,
        }
    }

    fn renderer(&self, options: &BuildOptions) -> TemplateRenderer {
        TemplateRenderer::new(template_root(self.kind(), options)).with_snippets(NMODL_SNIPPETS)
    }

    fn generate_source(&self, class: &Dynamics, layout: &BuildLayout, options: &BuildOptions) -> Result<Vec<PathBuf>> {
        let ctx = mechanism_context(class, options)?;
        let renderer = self.renderer(options);
        let mut written = Vec::new();
        for source in self.kind().spec().sources {
            let filename = output_name(source.output, &class.name);
            written.push(renderer.render_to_file(source.template, ctx.clone(), &layout.src_dir, &filename, &[])?);
        }
        debug!("generated {} source(s) for '{}'", written.len(), class.name);
        Ok(written)
    }

    fn configure(&self, _class: &Dynamics, layout: &BuildLayout, _options: &BuildOptions, _toolchain: &dyn Toolchain) -> Result<()> {
        // nrnivmodl configures and compiles in one go
        std::fs::create_dir_all(&layout.compile_dir)?;
        Ok(())
    }

    fn compile(&self, class: &Dynamics, layout: &BuildLayout, options: &BuildOptions, toolchain: &dyn Toolchain) -> Result<()> {
        let mod_file = format!("{}.mod", class.name);
        if let Some(modlunit) = &options.neuron.modlunit {
            let out = toolchain.run(modlunit, &[mod_file.clone()], &layout.src_dir)?;
            if modlunit_failed(&out) {
                return Err(compile_error(modlunit, &layout.src_dir, out));
            }
        }
        let uses_random = class
            .expressions()
            .iter()
            .any(|e| e.functions().iter().any(|f| f.starts_with("random.")));
        let mut args = Vec::new();
        if uses_random {
            args.push("-loadflags".to_string());
            args.push(gsl_flags(options, toolchain, &layout.compile_dir));
        }
        let out = toolchain.run(&options.neuron.nrnivmodl, &args, &layout.compile_dir)?;
        if nrnivmodl_failed(&out) {
            return Err(compile_error(&options.neuron.nrnivmodl, &layout.compile_dir, out));
        }
        info!("compiled {} into {}", mod_file, layout.install_dir.display());
        Ok(())
    }

    fn load(&self, _class: &Dynamics, layout: &BuildLayout, registrar: &dyn Registrar) -> Result<Registration> {
        let libs = layout.install_dir.join(".libs");
        paths::append_library_path(&libs);
        registrar.register(&libs.join("libnrnmech.so"), None)
    }
}

/// External currents of a built class, for the binding layer
pub fn external_currents(class: &Dynamics) -> Vec<String> {
    annotated_list(class, keys::EXTERNAL_CURRENTS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform_for_build;
    use nine_dynamics::{OnCondition, Regime};

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn potassium() -> Dynamics {
        let mut d = Dynamics::new("Kdr")
            .with_parameter("gbar", Dimension::CONDUCTANCE_DENSITY)
            .with_parameter("tau_n", Dimension::TIME)
            .with_state("n", Dimension::DIMENSIONLESS)
            .with_analog_receive("v", Dimension::VOLTAGE)
            .with_analog_receive("ek", Dimension::VOLTAGE)
            .with_alias("ik", e("gbar * n^4 * (v - ek)"))
            .with_analog_send("ik", Dimension::CURRENT_DENSITY)
            .with_regime(Regime::new("states").with_derivative("n", e("(1 - n) / tau_n")));
        d.analog_send_ports["ik"].annotations_mut().set(BUILD_NS, keys::ION_SPECIES, "k");
        d.analog_receive_ports["ek"].annotations_mut().set(BUILD_NS, keys::ION_SPECIES, "k");
        d
    }

    fn render(d: &Dynamics) -> String {
        let options = BuildOptions::default();
        let t = transform_for_build(d, BackendKind::Neuron, &options).unwrap();
        mechanism_source(&t, &options).unwrap()
    }

    #[test]
    fn density_mechanism() {
        let text = render(&potassium());
        assert!(text.contains("SUFFIX Kdr9ML"), "{}", text);
        assert!(text.contains("USEION k READ ek WRITE ik"), "{}", text);
        assert!(text.contains("gbar (S/cm2)"), "{}", text);
        assert!(text.contains("SOLVE states METHOD derivimplicit"), "{}", text);
        assert!(text.contains("n' = (1 - n) / tau_n"), "{}", text);
        assert!(text.contains("ik = gbar * n^4 * (v - ek)"), "{}", text);
        assert!(!text.contains("NET_RECEIVE"), "{}", text);
    }

    #[test]
    fn point_process_with_clamp_and_watch() {
        let d = Dynamics::new("LIF")
            .with_parameter("C_m", Dimension::CAPACITANCE)
            .with_parameter("g_L", Dimension::CONDUCTANCE)
            .with_parameter("E_L", Dimension::VOLTAGE)
            .with_parameter("theta", Dimension::VOLTAGE)
            .with_parameter("t_ref", Dimension::TIME)
            .with_state("V", Dimension::VOLTAGE)
            .with_state("t_end", Dimension::TIME)
            .with_event_send("spike")
            .with_regime(
                Regime::new("sub")
                    .with_derivative("V", e("-g_L * (V - E_L) / C_m"))
                    .with_on_condition(
                        OnCondition::new(e("V > theta"))
                            .with_assignment("V", e("E_L"))
                            .with_assignment("t_end", e("t + t_ref"))
                            .with_output_event("spike")
                            .with_target("refractory"),
                    ),
            )
            .with_regime(
                Regime::new("refractory")
                    .with_on_condition(OnCondition::new(e("t > t_end")).with_target("sub")),
            );
        let text = render(&d);
        assert!(text.contains("POINT_PROCESS LIF9ML"), "{}", text);
        assert!(text.contains("NONSPECIFIC_CURRENT i___synth"), "{}", text);
        assert!(text.contains("g_clamp = 100000000 (uS)"), "{}", text);
        assert!(text.contains("WATCH (v > theta) 2"), "{}", text);
        assert!(text.contains("WATCH (t > t_end) 3"), "{}", text);
        assert!(text.contains("v_clamp = E_L"), "{}", text);
        assert!(text.contains("net_event(t)"), "{}", text);
        assert!(text.contains("regime_ = 1"), "{}", text);
        assert!(text.contains("net_send(0, 1)"), "{}", text);
    }

    #[test]
    fn artificial_cell_polls_conditions() {
        let d = Dynamics::new("Poisson")
            .with_parameter("rate", Dimension::PER_TIME)
            .with_state("t_next", Dimension::TIME)
            .with_event_send("spike")
            .with_regime(Regime::new("default").with_on_condition(
                OnCondition::new(e("t > t_next"))
                    .with_assignment("t_next", e("t + random.exponential(1 / rate)"))
                    .with_output_event("spike"),
            ));
        let text = render(&d);
        assert!(text.contains("ARTIFICIAL_CELL Poisson9ML"), "{}", text);
        assert!(text.contains("nineml_gsl_exponential(1 / rate)"), "{}", text);
        assert!(text.contains("net_send(dt, 1)"), "{}", text);
        assert!(text.contains("seed_"), "{}", text);
    }

    #[test]
    fn failure_detection() {
        let clean = CommandOutput::ok("", "");
        assert!(!modlunit_failed(&clean));
        assert!(modlunit_failed(&CommandOutput::ok("", "units: <<ERROR>> mismatch")));
        assert!(!nrnivmodl_failed(&clean));
        assert!(nrnivmodl_failed(&CommandOutput::ok("", "make: *** [mod_func.o] Error 1\n")));
        let crashed = CommandOutput {
            status: Some(2),
            ..CommandOutput::default()
        };
        assert!(nrnivmodl_failed(&crashed));
    }

    #[test]
    fn layout_compiles_in_src() {
        let layout = NeuronBackend.layout(Path::new("/b"));
        assert_eq!(layout.compile_dir, layout.src_dir);
        assert_eq!(layout.install_dir, Path::new("/b/src").join(std::env::consts::ARCH));
    }
}
