//! Shared fixtures: sample classes and a toolchain that records instead of compiling.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use nine_codegen::{BuildOptions, CommandOutput, Registrar, Registration, Result, Toolchain};
use nine_dynamics::{Dimension, Dynamics, Expr, OnCondition, Regime};
use parking_lot::Mutex;

pub fn e(s: &str) -> Expr {
    Expr::parse(s).unwrap()
}

/// Izhikevich point neuron with an event output and a current input
pub fn izhikevich() -> Dynamics {
    Dynamics::new("Izhikevich")
        .with_parameter("a", Dimension::PER_TIME)
        .with_parameter("b", Dimension::PER_TIME)
        .with_parameter("c", Dimension::VOLTAGE)
        .with_parameter("d", Dimension::VOLTAGE / Dimension::TIME)
        .with_parameter("theta", Dimension::VOLTAGE)
        .with_parameter("C_m", Dimension::CAPACITANCE)
        .with_state("V", Dimension::VOLTAGE)
        .with_state("U", Dimension::VOLTAGE / Dimension::TIME)
        .with_analog_reduce("Isyn", Dimension::CURRENT)
        .with_event_send("spike")
        .with_regime(
            Regime::new("subthreshold")
                .with_derivative("V", e("0.04 * V * V + 5 * V + 140 - U + Isyn / C_m"))
                .with_derivative("U", e("a * (b * V - U)"))
                .with_on_condition(
                    OnCondition::new(e("V > theta"))
                        .with_assignment("V", e("c"))
                        .with_assignment("U", e("U + d"))
                        .with_output_event("spike"),
                ),
        )
}

/// Leaky integrate-and-fire neuron with a refractory regime
pub fn leaky() -> Dynamics {
    Dynamics::new("LIF")
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
        .with_regime(Regime::new("refractory").with_on_condition(OnCondition::new(e("t > t_end")).with_target("sub")))
}

pub fn options(base: &Path) -> BuildOptions {
    BuildOptions {
        base_dir: Some(base.to_path_buf()),
        ..BuildOptions::default()
    }
}

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Toolchain that imitates nrnivmodl, cmake and make on the filesystem
#[derive(Debug, Default)]
pub struct FakeToolchain {
    calls: Mutex<Vec<Call>>,
    /// Output returned for a given program, instead of the imitation
    canned: Mutex<Vec<(String, CommandOutput)>>,
}

impl FakeToolchain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, program: &str, out: CommandOutput) -> Self {
        self.canned.lock().push((program.to_string(), out));
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn programs(&self) -> Vec<String> {
        self.calls.lock().iter().map(|c| c.program.clone()).collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl Toolchain for FakeToolchain {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        self.calls.lock().push(Call {
            program: program.to_string(),
            args: args.to_vec(),
            cwd: cwd.to_path_buf(),
        });
        if let Some((_, out)) = self.canned.lock().iter().find(|(p, _)| p == program) {
            return Ok(out.clone());
        }
        let out = match program {
            "nrnivmodl" => {
                std::fs::create_dir_all(cwd.join(std::env::consts::ARCH).join(".libs"))?;
                CommandOutput::ok("Successfully created x86_64/special\n", "")
            }
            "cmake" => {
                let prefix = args
                    .iter()
                    .find_map(|a| a.strip_prefix("-DCMAKE_INSTALL_PREFIX="))
                    .map(PathBuf::from);
                if let Some(prefix) = prefix {
                    std::fs::write(cwd.join("install_prefix"), prefix.display().to_string())?;
                }
                CommandOutput::ok("-- Build files have been written to: cmpl\n", "")
            }
            "make" if args.first().map(String::as_str) == Some("install") => {
                let prefix = std::fs::read_to_string(cwd.join("install_prefix"))?;
                std::fs::create_dir_all(PathBuf::from(prefix).join("lib").join("nest"))?;
                CommandOutput::ok("Install the project...\n", "")
            }
            _ => CommandOutput::ok("", ""),
        };
        Ok(out)
    }
}

/// Registrar that records instead of loading
#[derive(Debug, Default)]
pub struct FakeRegistrar {
    pub registered: Mutex<Vec<Registration>>,
}

impl Registrar for FakeRegistrar {
    fn register(&self, library: &Path, module: Option<&str>) -> Result<Registration> {
        let registration = Registration {
            library: library.to_path_buf(),
            module: module.map(str::to_string),
        };
        self.registered.lock().push(registration.clone());
        Ok(registration)
    }
}
