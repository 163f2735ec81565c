//! NEST back-end: a C++ model class in its own extension module, built with
//! CMake against `nest-config`.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use log::{debug, info};
use minijinja::Value;
use nine_dynamics::{Dimension, Dynamics, Expr, Quantity, Regime};
use serde::Serialize;

use super::print::{ExprPrinter, CPP_SNIPPETS};
use super::{infer_dimension, ordered_aliases, output_name, template_root, Backend, BackendKind};
use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;
use crate::paths::{self, BuildLayout};
use crate::render::TemplateRenderer;
use crate::toolchain::{CommandOutput, Registrar, Registration, Toolchain};
use crate::transform::event::{default_regime_index, REGIME_STATE};
use crate::transform::receptor_index;
use crate::units::UnitHandler;

/// Template rendered into `src/CMakeLists.txt` at configure time
pub const CMAKE_TEMPLATE: &str = "CMakeLists.txt.tmpl";
/// Line cmake prints once the build system is generated
const CMAKE_SUCCESS: &str = "-- Build files have been written to:";

const NODE: &str = "nineml_node_";
const Y_IN: &str = "nineml_y_";
const F_OUT: &str = "nineml_f_";
const TIME_ARG: &str = "nineml_time_";

/// The NEST back-end
#[derive(Debug, Clone, Copy, Default)]
pub struct NestBackend;

#[derive(Debug, Clone, Serialize)]
struct Field {
    name: String,
    units: String,
    value: String,
}

#[derive(Debug, Serialize)]
struct StateField {
    name: String,
    units: String,
    initial: String,
    ode: bool,
}

#[derive(Debug, Serialize)]
struct Receptor {
    name: String,
    index: usize,
}

#[derive(Debug, Serialize)]
struct Recordable {
    name: String,
    units: String,
    getter: String,
}

#[derive(Debug, Serialize)]
struct ModelContext {
    class_name: String,
    source_name: String,
    pipeline_version: String,
    guard: String,
    parameters: Vec<Field>,
    inputs: Vec<Field>,
    settable: Vec<Field>,
    states: Vec<StateField>,
    n_ode: usize,
    regime_var: String,
    default_regime: usize,
    spike_receptors: Vec<Receptor>,
    current_receptors: Vec<Receptor>,
    exposed_aliases: Vec<String>,
    recordables: Vec<Recordable>,
    dynamics: Vec<String>,
    bindings: Vec<String>,
    transitions: Vec<String>,
    n_conditions: usize,
    uses_random: bool,
    emits_spikes: bool,
    ode_solver: String,
    max_step_size: f64,
    abs_tolerance: f64,
    rel_tolerance: f64,
    jacobian_approx_step: f64,
    v_threshold: f64,
    max_simultaneous_transitions: u32,
}

fn indent(lines: Vec<String>, by: usize) -> Vec<String> {
    let pad = " ".repeat(by);
    lines.into_iter().map(|l| format!("{}{}", pad, l)).collect()
}

fn state_index(name: &str) -> String {
    format!("State_::idx_{}", name)
}

struct Generator<'a> {
    class: &'a Dynamics,
    units: &'static UnitHandler,
    printer: ExprPrinter,
    ode_states: Vec<String>,
    discrete_states: Vec<String>,
}

impl<'a> Generator<'a> {
    fn new(class: &'a Dynamics) -> Self {
        let with_derivative: BTreeSet<&str> = class
            .regimes
            .values()
            .flat_map(|r| r.time_derivatives.keys().map(String::as_str))
            .collect();
        let (ode_states, discrete_states): (Vec<String>, Vec<String>) = class
            .state_variables
            .keys()
            .cloned()
            .partition(|s| with_derivative.contains(s.as_str()));
        Self {
            class,
            units: UnitHandler::nest(),
            printer: ExprPrinter::cpp(),
            ode_states,
            discrete_states,
        }
    }

    /// State names in storage order: integrated states first
    fn storage_order(&self) -> impl Iterator<Item = &String> {
        self.ode_states.iter().chain(&self.discrete_states)
    }

    fn units_of(&self, dimension: Option<Dimension>) -> Result<String> {
        match dimension {
            Some(d) => self.units.unit_str(d),
            None => Ok("1".to_string()),
        }
    }

    fn number(&self, q: &Quantity) -> Result<String> {
        self.printer.print(&Expr::num(self.units.scale_value(q)?))
    }

    fn const_alias_lines(&self, aliases: Vec<&nine_dynamics::Alias>) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for alias in aliases {
            if matches!(alias.rhs, Expr::Piecewise(_)) {
                lines.push(format!("double {};", alias.name));
                lines.extend(self.printer.assignment(&alias.name, &alias.rhs)?);
            } else {
                lines.push(format!("const double {} = {};", alias.name, self.printer.print(&alias.rhs)?));
            }
        }
        Ok(lines)
    }

    fn regime_alias_lines(&self, regime: &Regime) -> Result<Vec<String>> {
        self.const_alias_lines(ordered_aliases(regime.aliases.values()))
    }

    /// Locals every generated block starts from; `source` reads a state
    fn bind(&self, source: &dyn Fn(&str, usize) -> String, owner: &str) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for (i, state) in self.storage_order().enumerate() {
            lines.push(format!("double {} = {};", state, source(state, i)));
        }
        for p in self.class.parameters.keys() {
            lines.push(format!("const double {} = {}P_.{};", p, owner, p));
        }
        for port in self.class.analog_receive_ports.keys() {
            lines.push(format!("const double {} = {}P_.{};", port, owner, port));
        }
        for port in self.class.analog_reduce_ports.keys() {
            lines.push(format!("const double {} = {}B_.{}_value_;", port, owner, port));
        }
        for c in self.class.constants.values() {
            let q = Quantity::new(c.value, c.unit.clone());
            lines.push(format!("const double {} = {};", c.name, self.number(&q)?));
        }
        Ok(lines)
    }

    /// Body of the GSL right-hand side
    fn dynamics(&self) -> Result<Vec<String>> {
        let n_ode = self.ode_states.len();
        let node = format!("{}.", NODE);
        let mut lines = vec![format!("const double t = {}B_.t_origin_ + {};", node, TIME_ARG)];
        lines.extend(self.bind(
            &|state, i| {
                if i < n_ode {
                    format!("{}[{}]", Y_IN, i)
                } else {
                    format!("{}S_.y_[{}]", node, state_index(state))
                }
            },
            &node,
        )?);
        lines.extend(self.const_alias_lines(ordered_aliases(self.class.aliases.values()))?);
        lines.push(format!("switch (static_cast<int>({})) {{", REGIME_STATE));
        for (i, regime) in self.class.regimes.values().enumerate() {
            let mut body = self.regime_alias_lines(regime)?;
            for (k, state) in self.ode_states.iter().enumerate() {
                let target = format!("{}[{}]", F_OUT, k);
                match regime.time_derivatives.get(state) {
                    Some(rhs) => body.extend(self.printer.assignment(&target, rhs)?),
                    None => body.push(format!("{} = 0.0;", target)),
                }
            }
            body.push("break;".to_string());
            lines.push(format!("case {}: {{", i));
            lines.extend(indent(body, 4));
            lines.push("}".to_string());
        }
        lines.push("}".to_string());
        Ok(lines)
    }

    /// Locals of the update loop, rebound before each transition check
    fn bindings(&self) -> Result<Vec<String>> {
        let mut lines = self.bind(&|state, _| format!("S_.y_[{}]", state_index(state)), "")?;
        lines.extend(self.const_alias_lines(ordered_aliases(self.class.aliases.values()))?);
        Ok(lines)
    }

    fn transition_body(
        &self,
        assignments: &indexmap::IndexMap<String, Expr>,
        emits: bool,
        target: Option<usize>,
    ) -> Result<Vec<String>> {
        let mut body = Vec::new();
        for (lhs, rhs) in assignments {
            body.extend(self.printer.assignment(&format!("S_.y_[{}]", state_index(lhs)), rhs)?);
        }
        if emits {
            body.push("emit_spike_(origin, lag);".to_string());
        }
        if let Some(target) = target {
            body.push(format!("S_.y_[{}] = {};", state_index(REGIME_STATE), target));
        }
        body.push("transitioned = true;".to_string());
        body.push("break;".to_string());
        Ok(body)
    }

    /// `switch` over the active regime firing at most one transition
    fn transitions(&self) -> Result<(Vec<String>, usize)> {
        let mut lines = vec![format!("switch (static_cast<int>({})) {{", REGIME_STATE)];
        let mut condition = 0usize;
        for (i, regime) in self.class.regimes.values().enumerate() {
            let mut body = self.regime_alias_lines(regime)?;
            for oe in &regime.on_events {
                let target = oe.target_regime.as_deref().and_then(|t| self.class.regime_index(t));
                let weight = format!("{}__weight", oe.src_port);
                body.push(format!("if ({} != 0.0) {{", weight));
                let mut inner = vec![format!("{} = 0.0;", weight)];
                inner.extend(self.transition_body(&oe.state_assignments, !oe.output_events.is_empty(), target)?);
                body.extend(indent(inner, 4));
                body.push("}".to_string());
            }
            for oc in &regime.on_conditions {
                let target = oc.target_regime.as_deref().and_then(|t| self.class.regime_index(t));
                body.push(format!(
                    "if (!fired_[{}] && ({})) {{",
                    condition,
                    self.printer.print(&oc.trigger)?
                ));
                let mut inner = vec![format!("fired_[{}] = true;", condition)];
                inner.extend(self.transition_body(&oc.state_assignments, !oc.output_events.is_empty(), target)?);
                body.extend(indent(inner, 4));
                body.push("}".to_string());
                condition += 1;
            }
            body.push("break;".to_string());
            lines.push(format!("case {}: {{", i));
            lines.extend(indent(body, 4));
            lines.push("}".to_string());
        }
        lines.push("}".to_string());
        Ok((lines, condition))
    }

    fn context(&self, options: &BuildOptions) -> Result<ModelContext> {
        let class = self.class;
        let parameters = class
            .parameters
            .values()
            .map(|p| {
                Ok(Field {
                    name: p.name.clone(),
                    units: self.units.unit_str(p.dimension)?,
                    value: "0.0".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let inputs = class
            .analog_receive_ports
            .values()
            .map(|p| {
                Ok(Field {
                    name: p.name.clone(),
                    units: self.units.unit_str(p.dimension)?,
                    value: "0.0".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let mut states = Vec::new();
        for name in self.storage_order() {
            let s = &class.state_variables[name];
            let initial = match &s.initial {
                Some(q) => self.number(q)?,
                None => "0.0".to_string(),
            };
            states.push(StateField {
                name: s.name.clone(),
                units: self.units.unit_str(s.dimension)?,
                initial,
                ode: self.ode_states.contains(&s.name),
            });
        }
        let receptors = |names: Vec<&String>| -> Vec<Receptor> {
            names
                .into_iter()
                .map(|n| Receptor {
                    name: n.clone(),
                    index: receptor_index(class, n).unwrap_or(0),
                })
                .collect()
        };
        let mut recordables: Vec<Recordable> = states
            .iter()
            .filter(|s| s.name != REGIME_STATE)
            .map(|s| Recordable {
                name: s.name.clone(),
                units: s.units.clone(),
                getter: format!("S_.y_[{}]", state_index(&s.name)),
            })
            .collect();
        let mut exposed_aliases = Vec::new();
        for port in class.analog_send_ports.values() {
            if class.state_variables.contains_key(&port.name) {
                continue;
            }
            let dimension = Some(port.dimension).filter(|d| !d.is_dimensionless()).or_else(|| {
                class
                    .aliases
                    .get(&port.name)
                    .and_then(|a| infer_dimension(class, None, &a.rhs))
            });
            recordables.push(Recordable {
                name: port.name.clone(),
                units: self.units_of(dimension)?,
                getter: format!("V_.{}_", port.name),
            });
            exposed_aliases.push(port.name.clone());
        }
        let (transitions, n_conditions) = self.transitions()?;
        let uses_random = class
            .expressions()
            .iter()
            .any(|e| e.functions().iter().any(|f| f.starts_with("random.")));
        Ok(ModelContext {
            class_name: class.name.clone(),
            source_name: class
                .annotations()
                .get_str(nine_dynamics::BUILD_NS, nine_dynamics::keys::TRANSFORM_SRC)
                .unwrap_or(&class.name)
                .to_string(),
            pipeline_version: crate::VERSION.to_string(),
            guard: format!("NINEML_{}_H", class.name.to_uppercase()),
            settable: parameters.iter().chain(&inputs).cloned().collect(),
            parameters,
            inputs,
            states,
            n_ode: self.ode_states.len(),
            regime_var: REGIME_STATE.to_string(),
            default_regime: default_regime_index(class),
            spike_receptors: receptors(class.event_receive_ports.keys().collect()),
            current_receptors: receptors(class.analog_reduce_ports.keys().collect()),
            exposed_aliases,
            recordables,
            dynamics: self.dynamics()?,
            bindings: self.bindings()?,
            transitions,
            n_conditions,
            uses_random,
            emits_spikes: !class.event_send_ports.is_empty(),
            ode_solver: options.nest.ode_solver.as_str().to_string(),
            max_step_size: options.nest.max_step_size,
            abs_tolerance: options.nest.abs_tolerance,
            rel_tolerance: options.nest.rel_tolerance,
            jacobian_approx_step: options.nest.jacobian_approx_step,
            v_threshold: options.nest.v_threshold,
            max_simultaneous_transitions: options.nest.max_simultaneous_transitions,
        })
    }
}

/// Template context of a transformed class
pub fn model_context(class: &Dynamics, options: &BuildOptions) -> Result<Value> {
    Ok(Value::from_serialize(&Generator::new(class).context(options)?))
}

/// cmake succeeded only if it wrote the build files and said nothing on stderr
pub fn cmake_failed(out: &CommandOutput) -> bool {
    !out.success() || !out.stdout.contains(CMAKE_SUCCESS) || !out.stderr.trim().is_empty()
}

/// make failed by exit code or by a compiler `error:` line; warnings pass
pub fn make_failed(out: &CommandOutput) -> bool {
    !out.success() || out.stderr.lines().any(|l| l.to_lowercase().contains("error:"))
}

/// make install tolerates no stderr at all
pub fn install_failed(out: &CommandOutput) -> bool {
    !out.success() || !out.stderr.trim().is_empty()
}

fn configure_error(step: &str, dir: &Path, out: CommandOutput) -> PipelineError {
    PipelineError::BuildConfigure {
        step: step.to_string(),
        dir: dir.to_path_buf(),
        stdout: out.stdout,
        stderr: out.stderr,
    }
}

fn compile_error(step: &str, dir: &Path, out: CommandOutput) -> PipelineError {
    PipelineError::BuildCompile {
        step: step.to_string(),
        dir: dir.to_path_buf(),
        stdout: out.stdout,
        stderr: out.stderr,
    }
}

/// Module name NEST installs for a class
pub fn module_name(class: &Dynamics) -> String {
    format!("{}Module", class.name)
}

impl Backend for NestBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Nest
    }

    fn version<'a>(&self, options: &'a BuildOptions) -> &'a str {
        &options.nest.version
    }

    fn renderer(&self, options: &BuildOptions) -> TemplateRenderer {
        TemplateRenderer::new(template_root(self.kind(), options))
            .with_switch("ode_solver", Some(options.nest.ode_solver.as_str()))
            .with_switch("ss_solver", options.nest.ss_solver.as_deref())
            .with_snippets(CPP_SNIPPETS)
    }

    fn generate_source(&self, class: &Dynamics, layout: &BuildLayout, options: &BuildOptions) -> Result<Vec<PathBuf>> {
        let ctx = model_context(class, options)?;
        let renderer = self.renderer(options);
        let mut written = Vec::new();
        for source in self.kind().spec().sources {
            let filename = output_name(source.output, &class.name);
            written.push(renderer.render_to_file(source.template, ctx.clone(), &layout.src_dir, &filename, &[])?);
        }
        debug!("generated {} source(s) for '{}'", written.len(), class.name);
        Ok(written)
    }

    fn configure(&self, class: &Dynamics, layout: &BuildLayout, options: &BuildOptions, toolchain: &dyn Toolchain) -> Result<()> {
        let ctx = Value::from_serialize(&serde_json::json!({
            "name": class.name,
            "module": module_name(class),
            "src_dir": layout.src_dir,
            "pipeline_version": crate::VERSION,
        }));
        self.renderer(options)
            .render_to_file(CMAKE_TEMPLATE, ctx, &layout.src_dir, "CMakeLists.txt", &[])?;
        std::fs::create_dir_all(&layout.compile_dir)?;
        let args = vec![
            format!("-Dwith-nest={}", options.nest.nest_config),
            format!("-DCMAKE_INSTALL_PREFIX={}", layout.install_dir.display()),
            layout.src_dir.display().to_string(),
        ];
        let out = toolchain.run("cmake", &args, &layout.compile_dir)?;
        if cmake_failed(&out) {
            return Err(configure_error("cmake", &layout.compile_dir, out));
        }
        info!("configured '{}' in {}", class.name, layout.compile_dir.display());
        Ok(())
    }

    fn compile(&self, class: &Dynamics, layout: &BuildLayout, options: &BuildOptions, toolchain: &dyn Toolchain) -> Result<()> {
        let jobs = format!("-j{}", options.build_cores.max(1));
        let out = toolchain.run("make", &[jobs], &layout.compile_dir)?;
        if make_failed(&out) {
            return Err(compile_error("make", &layout.compile_dir, out));
        }
        let out = toolchain.run("make", &["install".to_string()], &layout.compile_dir)?;
        if install_failed(&out) {
            return Err(compile_error("make install", &layout.compile_dir, out));
        }
        info!("installed '{}' into {}", module_name(class), layout.install_dir.display());
        Ok(())
    }

    fn load(&self, class: &Dynamics, layout: &BuildLayout, registrar: &dyn Registrar) -> Result<Registration> {
        let lib = layout.install_dir.join("lib");
        paths::append_library_path(&lib);
        paths::append_library_path(&lib.join("nest"));
        paths::append_to_path_variable("SLI_PATH", &layout.install_dir.join("share").join("sli"));
        let module = module_name(class);
        registrar.register(&lib.join("nest").join(format!("{}.so", module)), Some(&module))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::transform_for_build;
    use nine_dynamics::{OnCondition, OnEvent};

    fn e(s: &str) -> Expr {
        Expr::parse(s).unwrap()
    }

    fn izhikevich() -> Dynamics {
        Dynamics::new("Izhikevich")
            .with_parameter("a", Dimension::PER_TIME)
            .with_parameter("b", Dimension::PER_TIME)
            .with_parameter("c", Dimension::VOLTAGE)
            .with_parameter("d", Dimension::VOLTAGE / Dimension::TIME)
            .with_parameter("theta", Dimension::VOLTAGE)
            .with_state("V", Dimension::VOLTAGE)
            .with_state("U", Dimension::VOLTAGE / Dimension::TIME)
            .with_analog_reduce("Isyn", Dimension::CURRENT)
            .with_event_receive("reset")
            .with_event_send("spike")
            .with_analog_send("V", Dimension::VOLTAGE)
            .with_regime(
                Regime::new("subthreshold")
                    .with_derivative("V", e("0.04 * V * V + 5 * V + 140 - U + Isyn"))
                    .with_derivative("U", e("a * (b * V - U)"))
                    .with_on_condition(
                        OnCondition::new(e("V > theta"))
                            .with_assignment("V", e("c"))
                            .with_assignment("U", e("U + d"))
                            .with_output_event("spike"),
                    )
                    .with_on_event(OnEvent::new("reset").with_assignment("V", e("c"))),
            )
    }

    fn sources(d: &Dynamics, options: &BuildOptions) -> (tempfile::TempDir, Vec<PathBuf>) {
        let t = transform_for_build(d, BackendKind::Nest, options).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let layout = NestBackend.layout(dir.path());
        let written = NestBackend.generate_source(&t, &layout, options).unwrap();
        (dir, written)
    }

    #[test]
    fn generates_model_and_module() {
        let (dir, written) = sources(&izhikevich(), &BuildOptions::default());
        let names: Vec<String> = written
            .iter()
            .map(|p| p.strip_prefix(dir.path().join("src")).unwrap().display().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "Izhikevich9ML.h",
                "Izhikevich9ML.cpp",
                "Izhikevich9MLModule.h",
                "Izhikevich9MLModule.cpp",
                "sli/Izhikevich9MLModule-init.sli",
            ]
        );
        let cpp = std::fs::read_to_string(&written[1]).unwrap();
        assert!(cpp.contains("gsl_odeiv2"), "{}", cpp);
        assert!(cpp.contains("nineml_f_[0] = 0.04 * V * V + 5.0 * V + 140.0 - U + Isyn;"), "{}", cpp);
        assert!(cpp.contains("if (!fired_[0] && (V > theta)) {"), "{}", cpp);
        assert!(cpp.contains("emit_spike_(origin, lag);"), "{}", cpp);
        assert!(cpp.contains("if (reset__weight != 0.0) {"), "{}", cpp);
        let header = std::fs::read_to_string(&written[0]).unwrap();
        assert!(header.contains("idx___regime__"), "{}", header);
        let module = std::fs::read_to_string(&written[3]).unwrap();
        assert!(module.contains("register_node_model< nineml::Izhikevich9ML >"), "{}", module);
    }

    #[test]
    fn cvode_switch_changes_solver() {
        let mut options = BuildOptions::default();
        options.apply("nest.ode_solver=cvode").unwrap();
        let (_dir, written) = sources(&izhikevich(), &options);
        let cpp = std::fs::read_to_string(&written[1]).unwrap();
        assert!(cpp.contains("CVode("), "{}", cpp);
        assert!(!cpp.contains("gsl_odeiv2"), "{}", cpp);
    }

    #[test]
    fn unknown_steady_state_solver_fails_to_render() {
        let mut options = BuildOptions::default();
        options.apply("nest.ss_solver=newton").unwrap();
        let t = transform_for_build(&izhikevich(), BackendKind::Nest, &options).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let layout = NestBackend.layout(dir.path());
        let err = NestBackend.generate_source(&t, &layout, &options).unwrap_err();
        assert!(matches!(err, PipelineError::Render { .. }), "unexpected error: {}", err);
    }

    #[test]
    fn receptors_are_numbered() {
        let t = transform_for_build(&izhikevich(), BackendKind::Nest, &BuildOptions::default()).unwrap();
        let ctx = Generator::new(&t).context(&BuildOptions::default()).unwrap();
        assert_eq!(ctx.current_receptors[0].index, 1);
        assert_eq!(ctx.spike_receptors[0].index, 2);
        assert_eq!(ctx.n_ode, 2);
        assert_eq!(ctx.states.last().map(|s| s.name.as_str()), Some(REGIME_STATE));
    }

    #[test]
    fn failure_detection() {
        let ok = CommandOutput::ok("-- Build files have been written to: /b/cmpl\n", "");
        assert!(!cmake_failed(&ok));
        assert!(cmake_failed(&CommandOutput::ok("-- Configuring incomplete\n", "")));
        assert!(cmake_failed(&CommandOutput::ok(
            "-- Build files have been written to: /b/cmpl\n",
            "CMake Warning: unused variable\n"
        )));
        assert!(!make_failed(&CommandOutput::ok("", "foo.cpp:3: warning: unused variable\n")));
        assert!(make_failed(&CommandOutput::ok("", "foo.cpp:3:1: Error: expected ';'\n")));
        assert!(install_failed(&CommandOutput::ok("", "cannot copy\n")));
    }
}
