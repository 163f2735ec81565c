//! Build options shared by every back-end, with per-back-end sections.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Integrator used by the NEST harness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NestSolver {
    /// GSL adaptive Runge-Kutta
    Gsl,
    /// SUNDIALS CVODE
    Cvode,
}

impl NestSolver {
    /// Template switch value
    pub fn as_str(&self) -> &'static str {
        match self {
            NestSolver::Gsl => "gsl",
            NestSolver::Cvode => "cvode",
        }
    }
}

/// Options of the NEST back-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NestOptions {
    /// ODE solver
    pub ode_solver: NestSolver,
    /// Steady-state solver, if any
    pub ss_solver: Option<String>,
    /// Largest integration step (ms)
    pub max_step_size: f64,
    /// Absolute tolerance
    pub abs_tolerance: f64,
    /// Relative tolerance
    pub rel_tolerance: f64,
    /// Finite-difference step of the Jacobian approximation
    pub jacobian_approx_step: f64,
    /// Voltage threshold used when a model has no explicit one (mV)
    pub v_threshold: f64,
    /// Transition cascade limit within one step
    pub max_simultaneous_transitions: u32,
    /// Path or name of `nest-config`
    pub nest_config: String,
    /// Simulator version used in build directory names
    pub version: String,
}

impl Default for NestOptions {
    fn default() -> Self {
        Self {
            ode_solver: NestSolver::Gsl,
            ss_solver: None,
            max_step_size: 0.01,
            abs_tolerance: 1e-3,
            rel_tolerance: 0.0,
            jacobian_approx_step: 0.01,
            v_threshold: 0.0,
            max_simultaneous_transitions: 1000,
            nest_config: "nest-config".to_string(),
            version: "2.20".to_string(),
        }
    }
}

/// Options of the NEURON back-end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NeuronOptions {
    /// NMODL `SOLVE ... METHOD`
    pub ode_solver: String,
    /// Directory holding GSL libraries; discovered through `nest-config` when unset
    pub gsl_path: Option<PathBuf>,
    /// Path or name of `nrnivmodl`
    pub nrnivmodl: String,
    /// Path or name of `modlunit`; skipped when unset
    pub modlunit: Option<String>,
    /// Path or name of `nest-config`, queried for GSL link flags
    pub nest_config: String,
    /// Simulator version used in build directory names
    pub version: String,
}

impl Default for NeuronOptions {
    fn default() -> Self {
        Self {
            ode_solver: "derivimplicit".to_string(),
            gsl_path: None,
            nrnivmodl: "nrnivmodl".to_string(),
            modlunit: Some("modlunit".to_string()),
            nest_config: "nest-config".to_string(),
            version: "7.7".to_string(),
        }
    }
}

/// Every knob of a build request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Root of all build trees; `~/.nine/build/v<version>` when unset
    pub base_dir: Option<PathBuf>,
    /// Parallel compile jobs
    pub build_cores: usize,
    /// Tag appended to generated class names
    pub build_version: Option<String>,
    /// Override of the membrane voltage state
    pub membrane_voltage: Option<String>,
    /// Override of the membrane capacitance parameter
    pub membrane_capacitance: Option<String>,
    /// Override of the external current ports
    pub external_currents: Option<Vec<String>>,
    /// Override of the regime the event back-end starts in
    pub default_regime: Option<String>,
    /// Template root replacing the bundled templates
    pub template_dir: Option<PathBuf>,
    /// NEST section
    pub nest: NestOptions,
    /// NEURON section
    pub neuron: NeuronOptions,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            base_dir: None,
            build_cores: 1,
            build_version: None,
            membrane_voltage: None,
            membrane_capacitance: None,
            external_currents: None,
            default_regime: None,
            template_dir: None,
            nest: NestOptions::default(),
            neuron: NeuronOptions::default(),
        }
    }
}

impl BuildOptions {
    /// Set a (possibly dotted) option from its textual value, e.g.
    /// `nest.ode_solver=cvode` or `external_currents=i_ext,i_syn`
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut tree = serde_json::to_value(&*self)?;
        let mut slot = &mut tree;
        for part in key.split('.') {
            slot = slot
                .as_object_mut()
                .and_then(|o| o.get_mut(part))
                .ok_or_else(|| PipelineError::option(key, "no such option"))?;
        }
        let was_unset = slot.is_null();
        *slot = parse_value(slot, value);
        match serde_json::from_value::<BuildOptions>(tree.clone()) {
            Ok(parsed) => *self = parsed,
            // an unset list option has no type hint; retry as a list
            Err(_) if was_unset => {
                let mut retry = tree;
                let mut slot = &mut retry;
                for part in key.split('.') {
                    slot = &mut slot[part];
                }
                *slot = parse_value(&serde_json::Value::Array(Vec::new()), value);
                *self = serde_json::from_value(retry).map_err(|e| PipelineError::option(key, e.to_string()))?;
            }
            Err(e) => return Err(PipelineError::option(key, e.to_string())),
        }
        Ok(())
    }

    /// Parse and apply `key=value`
    pub fn apply(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| PipelineError::option(assignment, "expected key=value"))?;
        self.set(key.trim(), value.trim())
    }
}

/// Interpret `text` guided by the current JSON value at the slot
fn parse_value(current: &serde_json::Value, text: &str) -> serde_json::Value {
    use serde_json::Value;
    match current {
        Value::Array(_) => Value::Array(
            text.split(',')
                .map(|s| Value::String(s.trim().to_string()))
                .filter(|v| v.as_str().map_or(false, |s| !s.is_empty()))
                .collect(),
        ),
        Value::String(_) => Value::String(text.to_string()),
        _ => {
            if text == "none" || text.is_empty() {
                return Value::Null;
            }
            // numbers and booleans; anything else is a string
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let o = BuildOptions::default();
        assert_eq!(o.build_cores, 1);
        assert_eq!(o.nest.ode_solver, NestSolver::Gsl);
        assert_eq!(o.nest.max_simultaneous_transitions, 1000);
        assert_eq!(o.neuron.ode_solver, "derivimplicit");
    }

    #[test]
    fn dotted_assignment() {
        let mut o = BuildOptions::default();
        o.apply("nest.ode_solver=cvode").unwrap();
        o.apply("nest.abs_tolerance = 1e-6").unwrap();
        o.apply("build_cores=4").unwrap();
        o.apply("external_currents=i_ext,i_syn").unwrap();
        o.apply("membrane_voltage=V").unwrap();
        assert_eq!(o.nest.ode_solver, NestSolver::Cvode);
        assert_eq!(o.nest.abs_tolerance, 1e-6);
        assert_eq!(o.build_cores, 4);
        assert_eq!(o.external_currents, Some(vec!["i_ext".into(), "i_syn".into()]));
        assert_eq!(o.membrane_voltage.as_deref(), Some("V"));
    }

    #[test]
    fn bad_assignments() {
        let mut o = BuildOptions::default();
        assert!(o.apply("nest.nope=1").is_err());
        assert!(o.apply("nest.ode_solver=euler").is_err());
        assert!(o.apply("build_cores").is_err());
    }
}
