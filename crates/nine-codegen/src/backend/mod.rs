//! Simulator back-ends.
//!
//! A [`Backend`] owns everything simulator specific about a build: the
//! directory layout, the template set and its context, the configure and
//! compile commands with their failure detection, and the load hook. The
//! [`crate::driver`] sequences these steps; it never looks inside them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nine_dynamics::expr::TIME;
use nine_dynamics::{Alias, BinOp, Dimension, Dynamics, Expr, Regime, UnOp};
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::options::BuildOptions;
use crate::paths::{self, BuildLayout};
use crate::render::TemplateRenderer;
use crate::toolchain::{Registrar, Registration, Toolchain};
use crate::units::UnitHandler;

pub mod nest;
pub mod neuron;
pub mod print;

/// Supported simulators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Compartmental ODE simulator (NMODL mechanisms)
    Neuron,
    /// Event-driven point-neuron simulator (C++ modules)
    Nest,
}

impl BackendKind {
    /// Lower-case name used in paths and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Neuron => "neuron",
            BackendKind::Nest => "nest",
        }
    }

    /// Registry entry of this back-end
    pub fn spec(&self) -> &'static BackendSpec {
        // every kind has exactly one entry
        BACKENDS
            .iter()
            .find(|b| b.kind == *self)
            .unwrap_or(&BACKENDS[0])
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        list_backends()
            .iter()
            .find(|b| b.name == wanted)
            .map(|b| b.kind)
            .ok_or_else(|| {
                let names: Vec<&str> = list_backends().iter().map(|b| b.name).collect();
                PipelineError::option(
                    "backend",
                    format!("unknown back-end '{}' (expected one of {})", s, names.join(", ")),
                )
            })
    }
}

/// Template rendered into a generated source file
#[derive(Debug, Clone, Copy)]
pub struct SourceFile {
    /// Template name
    pub template: &'static str,
    /// Output path relative to `src/`; `{name}` is replaced by the class name
    pub output: &'static str,
}

/// Registry entry describing a back-end
#[derive(Debug, Clone, Copy)]
pub struct BackendSpec {
    /// Name on the command line and in build paths
    pub name: &'static str,
    /// Kind
    pub kind: BackendKind,
    /// One-line description
    pub description: &'static str,
    /// Transform variant applied before generation
    pub transform: &'static str,
    /// Generated sources
    pub sources: &'static [SourceFile],
}

static BACKENDS: &[BackendSpec] = &[
    BackendSpec {
        name: "neuron",
        kind: BackendKind::Neuron,
        description: "NMODL mechanism compiled with nrnivmodl",
        transform: "ode",
        sources: &[SourceFile {
            template: "main.tmpl",
            output: "{name}.mod",
        }],
    },
    BackendSpec {
        name: "nest",
        kind: BackendKind::Nest,
        description: "C++ model in an extension module built with CMake",
        transform: "event",
        sources: &[
            SourceFile {
                template: "header.tmpl",
                output: "{name}.h",
            },
            SourceFile {
                template: "main.tmpl",
                output: "{name}.cpp",
            },
            SourceFile {
                template: "module-header.tmpl",
                output: "{name}Module.h",
            },
            SourceFile {
                template: "module-cpp.tmpl",
                output: "{name}Module.cpp",
            },
            SourceFile {
                template: "module_sli_init.tmpl",
                output: "sli/{name}Module-init.sli",
            },
        ],
    },
];

/// Every supported back-end
pub fn list_backends() -> &'static [BackendSpec] {
    BACKENDS
}

/// Simulator-specific build steps
pub trait Backend: Send + Sync {
    /// Kind of this back-end
    fn kind(&self) -> BackendKind;

    /// Simulator version used in the build path
    fn version<'a>(&self, options: &'a BuildOptions) -> &'a str;

    /// Unit table of the simulator
    fn units(&self) -> &'static UnitHandler {
        UnitHandler::for_backend(self.kind())
    }

    /// Directory layout under `build_dir`
    fn layout(&self, build_dir: &Path) -> BuildLayout {
        BuildLayout::standard(build_dir)
    }

    /// Template renderer with this back-end's switches and snippets
    fn renderer(&self, options: &BuildOptions) -> TemplateRenderer;

    /// Render every source file of the transformed class into `src/`
    fn generate_source(
        &self,
        class: &Dynamics,
        layout: &BuildLayout,
        options: &BuildOptions,
    ) -> Result<Vec<PathBuf>>;

    /// Prepare the compile directory
    fn configure(
        &self,
        class: &Dynamics,
        layout: &BuildLayout,
        options: &BuildOptions,
        toolchain: &dyn Toolchain,
    ) -> Result<()>;

    /// Compile and install into `install/`
    fn compile(
        &self,
        class: &Dynamics,
        layout: &BuildLayout,
        options: &BuildOptions,
        toolchain: &dyn Toolchain,
    ) -> Result<()>;

    /// Make the installed artifact available to the simulator
    fn load(&self, class: &Dynamics, layout: &BuildLayout, registrar: &dyn Registrar) -> Result<Registration>;
}

static NEURON: neuron::NeuronBackend = neuron::NeuronBackend;
static NEST: nest::NestBackend = nest::NestBackend;

/// Back-end implementation for `kind`
pub fn backend(kind: BackendKind) -> &'static dyn Backend {
    match kind {
        BackendKind::Neuron => &NEURON,
        BackendKind::Nest => &NEST,
    }
}

/// Templates shipped with the crate
pub fn bundled_templates() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("templates")
}

/// Template directory of `kind`, honouring `template_dir`
pub fn template_root(kind: BackendKind, options: &BuildOptions) -> PathBuf {
    options
        .template_dir
        .clone()
        .unwrap_or_else(bundled_templates)
        .join(kind.as_str())
}

/// `<base>/<backend><version>/<url-path>/<name>`
pub fn build_dir(d: &Dynamics, kind: BackendKind, url: Option<&str>, options: &BuildOptions) -> Result<PathBuf> {
    let base = options.base_dir.clone().unwrap_or_else(paths::default_base_dir);
    let content = serde_json::to_vec(d)?;
    let version = backend(kind).version(options);
    Ok(base
        .join(format!("{}{}", kind.as_str(), version))
        .join(paths::url_build_path(url, &content))
        .join(&d.name))
}

/// Global aliases in dependency order (definitions before uses)
pub fn ordered_aliases<'a>(aliases: impl IntoIterator<Item = &'a Alias>) -> Vec<&'a Alias> {
    let pending: Vec<&Alias> = aliases.into_iter().collect();
    let names: BTreeSet<&str> = pending.iter().map(|a| a.name.as_str()).collect();
    let mut emitted: BTreeSet<&str> = BTreeSet::new();
    let mut out = Vec::with_capacity(pending.len());
    let mut remaining = pending;
    while !remaining.is_empty() {
        let before = remaining.len();
        let mut deferred = Vec::new();
        for alias in remaining {
            let ready = alias
                .rhs
                .symbols()
                .iter()
                .all(|s| !names.contains(s.as_str()) || emitted.contains(s.as_str()) || *s == alias.name);
            if ready {
                emitted.insert(&alias.name);
                out.push(alias);
            } else {
                deferred.push(alias);
            }
        }
        if deferred.len() == before {
            // cycles are rejected by validation; keep declaration order
            out.extend(deferred);
            break;
        }
        remaining = deferred;
    }
    out
}

/// Names of the aliases in `available` that `roots` depend on, transitively
pub fn alias_closure<'a>(roots: impl IntoIterator<Item = &'a Expr>, available: &BTreeMap<&str, &Expr>) -> BTreeSet<String> {
    let mut needed = BTreeSet::new();
    let mut stack: Vec<String> = roots.into_iter().flat_map(|e| e.symbols()).collect();
    while let Some(name) = stack.pop() {
        if let Some(rhs) = available.get(name.as_str()) {
            if needed.insert(name) {
                stack.extend(rhs.symbols());
            }
        }
    }
    needed
}

/// Replace `{name}` in a source file pattern
pub fn output_name(pattern: &str, class_name: &str) -> String {
    pattern.replace("{name}", class_name)
}

/// Dimension of an expression from the declared dimensions of its symbols.
///
/// Regime aliases of `regime` shadow global aliases. Sums take the first
/// dimensioned operand, comparisons and function results are dimensionless.
pub fn infer_dimension(d: &Dynamics, regime: Option<&Regime>, e: &Expr) -> Option<Dimension> {
    infer(d, regime, e, 0)
}

const MAX_ALIAS_DEPTH: usize = 64;

fn infer(d: &Dynamics, regime: Option<&Regime>, e: &Expr, depth: usize) -> Option<Dimension> {
    if depth > MAX_ALIAS_DEPTH {
        return None;
    }
    match e {
        Expr::Num(_) => Some(Dimension::DIMENSIONLESS),
        Expr::Sym(name) if name == TIME => Some(Dimension::TIME),
        Expr::Sym(name) => {
            let alias = regime
                .and_then(|r| r.aliases.get(name))
                .or_else(|| d.aliases.get(name));
            match alias {
                Some(a) => infer(d, regime, &a.rhs, depth + 1),
                None => d.dimension_of(name).or(Some(Dimension::DIMENSIONLESS)),
            }
        }
        Expr::Unary(UnOp::Neg, inner) => infer(d, regime, inner, depth),
        Expr::Unary(UnOp::Not, _) => Some(Dimension::DIMENSIONLESS),
        Expr::Binary(op, a, b) => match op {
            BinOp::Add | BinOp::Sub => {
                let left = infer(d, regime, a, depth)?;
                if left.is_dimensionless() {
                    infer(d, regime, b, depth)
                } else {
                    Some(left)
                }
            }
            BinOp::Mul => Some(infer(d, regime, a, depth)? * infer(d, regime, b, depth)?),
            BinOp::Div => Some(infer(d, regime, a, depth)? / infer(d, regime, b, depth)?),
            BinOp::Pow => {
                let base = infer(d, regime, a, depth)?;
                match b.as_num() {
                    Some(p) if p.fract() == 0.0 && p.abs() <= i8::MAX as f64 => Some(base.powi(p as i8)),
                    _ if base.is_dimensionless() => Some(base),
                    _ => None,
                }
            }
            _ => Some(Dimension::DIMENSIONLESS),
        },
        Expr::Call(name, args) => match name.as_str() {
            "abs" | "fabs" | "min" | "max" | "floor" | "ceil" | "fmod" | "random.uniform"
            | "random.normal" | "random.exponential" => {
                args.first().and_then(|a| infer(d, regime, a, depth))
            }
            "sqrt" => {
                let inner = args.first().and_then(|a| infer(d, regime, a, depth))?;
                let halved = inner.exponents().map(|x| x / 2);
                Some(Dimension::from_exponents(halved))
            }
            _ => Some(Dimension::DIMENSIONLESS),
        },
        Expr::Piecewise(pieces) => pieces
            .iter()
            .map(|p| infer(d, regime, p.value(), depth))
            .find(|dim| dim.map_or(true, |x| !x.is_dimensionless()))
            .flatten()
            .or(Some(Dimension::DIMENSIONLESS)),
    }
}
