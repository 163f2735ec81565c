//! Build-time rewrites of a dynamics into the dialect of one back-end.
//!
//! Each rewrite is a [`Pass`] over a clone of the incoming class. The
//! [`PassManager`] runs a shared prelude (class renaming, version stamp), the
//! back-end passes and a validating postlude. Every failure surfaces as
//! [`PipelineError::BuildTransform`].

use log::debug;
use nine_dynamics::{keys, validate, AnnotationValue, Dynamics, Expr, BUILD_NS};

use crate::backend::BackendKind;
use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;

pub mod event;
pub mod ode;

/// Suffix of every generated class name
pub const CLASS_SUFFIX: &str = "9ML";

/// A rewrite over a dynamics clone
pub trait Pass {
    /// Human-readable pass name
    fn name(&self) -> &'static str;
    /// Execute the pass, mutating the dynamics in place
    fn run(&self, d: &mut Dynamics) -> Result<()>;
}

/// Runs passes in sequence
#[derive(Default)]
pub struct PassManager {
    passes: Vec<Box<dyn Pass>>,
}

impl PassManager {
    /// Create an empty pass manager
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Append a pass to the pipeline
    pub fn add(&mut self, pass: Box<dyn Pass>) {
        self.passes.push(pass);
    }

    /// Append several passes
    pub fn extend(&mut self, passes: impl IntoIterator<Item = Box<dyn Pass>>) {
        self.passes.extend(passes);
    }

    /// Names of the passes, in order
    pub fn names(&self) -> Vec<&'static str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run all passes in order
    pub fn run(&self, d: &mut Dynamics) -> Result<()> {
        for p in &self.passes {
            debug!("pass '{}' on '{}'", p.name(), d.name);
            p.run(d).map_err(|e| match e {
                PipelineError::BuildTransform { .. } => e,
                other => PipelineError::transform(&d.name, format!("pass '{}': {}", p.name(), other)),
            })?;
        }
        Ok(())
    }
}

/// Generated class name: `<name>9ML<tag>`
pub fn class_name(name: &str, options: &BuildOptions) -> String {
    let base = if name.ends_with(CLASS_SUFFIX) {
        name.to_string()
    } else {
        format!("{}{}", name, CLASS_SUFFIX)
    };
    match &options.build_version {
        Some(tag) if !base.ends_with(tag.as_str()) => format!("{}{}", base, tag),
        _ => base,
    }
}

/// Rename the class and stamp the pipeline version
pub struct Prelude {
    class_name: String,
}

impl Pass for Prelude {
    fn name(&self) -> &'static str {
        "prelude"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        if d.name != self.class_name {
            let original = std::mem::replace(&mut d.name, self.class_name.clone());
            d.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, original);
        }
        d.annotations_mut().set(BUILD_NS, keys::BUILD_VERSION, crate::VERSION);
        Ok(())
    }
}

/// Validate the rewritten class
pub struct Postlude;

impl Pass for Postlude {
    fn name(&self) -> &'static str {
        "validate"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        validate(d).map_err(|e| PipelineError::transform(&d.name, e.to_string()))
    }
}

/// Record `no_time_derivatives` and `num_time_derivatives`
pub struct TimeDerivativeCounts;

impl Pass for TimeDerivativeCounts {
    fn name(&self) -> &'static str {
        "time_derivative_counts"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        let mut lacking = Vec::new();
        let mut with_derivative = 0usize;
        for state in d.state_variables.keys() {
            let count = d
                .regimes
                .values()
                .filter(|r| r.time_derivatives.contains_key(state))
                .count();
            if count < d.regimes.len() {
                lacking.push(state.clone());
            }
            if count > 0 {
                with_derivative += 1;
            }
        }
        d.annotations_mut().set(BUILD_NS, keys::NO_TIME_DERIVS, lacking);
        d.annotations_mut().set(BUILD_NS, keys::NUM_TIME_DERIVS, with_derivative);
        Ok(())
    }
}

/// Number reduce ports from 1, then event-receive ports
pub struct ReceptorIndices;

impl Pass for ReceptorIndices {
    fn name(&self) -> &'static str {
        "receptor_indices"
    }

    fn run(&self, d: &mut Dynamics) -> Result<()> {
        let mut next = 1usize;
        for port in d.analog_reduce_ports.values_mut() {
            port.annotations_mut().set(BUILD_NS, keys::RECEPTOR_INDEX, next);
            next += 1;
        }
        for port in d.event_receive_ports.values_mut() {
            port.annotations_mut().set(BUILD_NS, keys::RECEPTOR_INDEX, next);
            next += 1;
        }
        Ok(())
    }
}

/// Full pass pipeline for a back-end
pub fn pipeline(kind: BackendKind, source_name: &str, options: &BuildOptions) -> PassManager {
    let mut pm = PassManager::new();
    pm.add(Box::new(Prelude {
        class_name: class_name(source_name, options),
    }));
    match kind {
        BackendKind::Neuron => pm.extend(ode::passes(options)),
        BackendKind::Nest => pm.extend(event::passes(options)),
    }
    pm.add(Box::new(Postlude));
    pm
}

/// Rewrite a clone of `d` for `kind`; `d` itself is untouched
pub fn transform_for_build(d: &Dynamics, kind: BackendKind, options: &BuildOptions) -> Result<Dynamics> {
    let mut clone = d.clone();
    pipeline(kind, &d.name, options).run(&mut clone)?;
    Ok(clone)
}

/// Names listed under a build annotation
pub fn annotated_list(d: &Dynamics, key: &str) -> Vec<String> {
    d.annotations()
        .get(BUILD_NS, key)
        .map(AnnotationValue::as_list)
        .unwrap_or_default()
}

/// Mechanism type recorded by the ODE rewrite
pub fn mechanism_type(d: &Dynamics) -> Option<&str> {
    d.annotations().get_str(BUILD_NS, keys::MECHANISM_TYPE)
}

/// Receptor index of a reduce or event-receive port
pub fn receptor_index(d: &Dynamics, port: &str) -> Option<usize> {
    let annotations = d
        .analog_reduce_ports
        .get(port)
        .map(|p| p.annotations())
        .or_else(|| d.event_receive_ports.get(port).map(|p| p.annotations()))?;
    annotations
        .get(BUILD_NS, keys::RECEPTOR_INDEX)
        .and_then(AnnotationValue::as_int)
        .map(|i| i as usize)
}

/// Map from original element names to their names after the rewrite
pub fn renamed_elements(d: &Dynamics) -> Vec<(String, String)> {
    let mut out = Vec::new();
    let mut note = |name: &str, a: &nine_dynamics::Annotations| {
        if let Some(src) = a.get_str(BUILD_NS, keys::TRANSFORM_SRC) {
            if src != name {
                out.push((src.to_string(), name.to_string()));
            }
        }
    };
    d.parameters.values().for_each(|p| note(&p.name, p.annotations()));
    d.state_variables.values().for_each(|s| note(&s.name, s.annotations()));
    d.analog_receive_ports.values().for_each(|p| note(&p.name, p.annotations()));
    d.analog_reduce_ports.values().for_each(|p| note(&p.name, p.annotations()));
    out
}

/// Shared helper: rename `name` out of the way of a reserved identifier
pub(crate) fn evict(d: &mut Dynamics, name: &str) -> Option<String> {
    d.element_kind(name)?;
    let mut replacement = format!("{}___renamed", name);
    while d.element_kind(&replacement).is_some() {
        replacement.push('_');
    }
    d.rename_symbol(name, &replacement);
    annotate_src(d, &replacement, Some(name));
    Some(replacement)
}

/// Set `transform_src` on whichever element is called `name`
pub(crate) fn annotate_src(d: &mut Dynamics, name: &str, src: Option<&str>) {
    let value: AnnotationValue = src.map(str::to_string).into();
    if let Some(p) = d.parameters.get_mut(name) {
        p.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value.clone());
    }
    if let Some(s) = d.state_variables.get_mut(name) {
        s.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value.clone());
    }
    if let Some(c) = d.constants.get_mut(name) {
        c.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value.clone());
    }
    if let Some(a) = d.aliases.get_mut(name) {
        a.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value.clone());
    }
    if let Some(p) = d.analog_receive_ports.get_mut(name) {
        p.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value.clone());
    }
    if let Some(p) = d.analog_reduce_ports.get_mut(name) {
        p.annotations_mut().set(BUILD_NS, keys::TRANSFORM_SRC, value);
    }
}

/// `0` as an expression
pub(crate) fn zero() -> Expr {
    Expr::num(0.0)
}
