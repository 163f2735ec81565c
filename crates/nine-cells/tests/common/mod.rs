//! Shared fixtures: sample classes, quantities and a toolchain that records
//! instead of compiling.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use nine_codegen::{BuildOptions, CommandOutput, Registrar, Registration, Result, Toolchain};
use nine_dynamics::{Dimension, Dynamics, Expr, OnCondition, OnEvent, Quantity, Regime, Unit};
use parking_lot::{Mutex, MutexGuard};

/// Only one simulation may be active per process; tests take turns
static SERIAL: Mutex<()> = parking_lot::const_mutex(());

pub fn serial() -> MutexGuard<'static, ()> {
    let _ = env_logger::builder().is_test(true).try_init();
    SERIAL.lock()
}

pub fn e(s: &str) -> Expr {
    Expr::parse(s).unwrap()
}

pub fn q(value: f64, unit: &str) -> Quantity {
    Quantity::new(value, Unit::parse(unit).unwrap())
}

/// Hodgkin-Huxley squid axon scaled to a 1 nF membrane
pub fn hodgkin_huxley() -> Dynamics {
    Dynamics::new("HodgkinHuxley")
        .with_parameter("Cm", Dimension::CAPACITANCE)
        .with_parameter("gNa", Dimension::CONDUCTANCE)
        .with_parameter("gK", Dimension::CONDUCTANCE)
        .with_parameter("gL", Dimension::CONDUCTANCE)
        .with_parameter("ENa", Dimension::VOLTAGE)
        .with_parameter("EK", Dimension::VOLTAGE)
        .with_parameter("EL", Dimension::VOLTAGE)
        .with_state("V", Dimension::VOLTAGE)
        .with_state("m", Dimension::DIMENSIONLESS)
        .with_state("h", Dimension::DIMENSIONLESS)
        .with_state("n", Dimension::DIMENSIONLESS)
        .with_analog_reduce("i_ext", Dimension::CURRENT)
        .with_event_send("spike")
        .with_alias("i_Na", e("gNa * m * m * m * h * (V - ENa)"))
        .with_alias("i_K", e("gK * n * n * n * n * (V - EK)"))
        .with_alias("i_L", e("gL * (V - EL)"))
        .with_alias("alpha_m", e("0.1 * (V + 40) / (1 - exp(-(V + 40) / 10))"))
        .with_alias("beta_m", e("4 * exp(-(V + 65) / 18)"))
        .with_alias("alpha_h", e("0.07 * exp(-(V + 65) / 20)"))
        .with_alias("beta_h", e("1 / (1 + exp(-(V + 35) / 10))"))
        .with_alias("alpha_n", e("0.01 * (V + 55) / (1 - exp(-(V + 55) / 10))"))
        .with_alias("beta_n", e("0.125 * exp(-(V + 65) / 80)"))
        .with_regime(
            Regime::new("default")
                .with_derivative("V", e("-(i_Na + i_K + i_L - i_ext) / Cm"))
                .with_derivative("m", e("alpha_m * (1 - m) - beta_m * m"))
                .with_derivative("h", e("alpha_h * (1 - h) - beta_h * h"))
                .with_derivative("n", e("alpha_n * (1 - n) - beta_n * n"))
                .with_on_condition(OnCondition::new(e("V > 0")).with_output_event("spike")),
        )
}

/// Textbook parameters and resting state of [`hodgkin_huxley`]
pub fn hodgkin_huxley_properties() -> nine_dynamics::Properties {
    nine_dynamics::Properties::new()
        .with_value("Cm", q(1.0, "nF"))
        .with_value("gNa", q(120.0, "uS"))
        .with_value("gK", q(36.0, "uS"))
        .with_value("gL", q(0.3, "uS"))
        .with_value("ENa", q(50.0, "mV"))
        .with_value("EK", q(-77.0, "mV"))
        .with_value("EL", q(-54.387, "mV"))
        .with_initial("V", q(-65.0, "mV"))
        .with_initial("m", Quantity::dimensionless(0.0529))
        .with_initial("h", Quantity::dimensionless(0.5961))
        .with_initial("n", Quantity::dimensionless(0.3177))
}

pub fn hh_options(base: &Path) -> BuildOptions {
    BuildOptions {
        base_dir: Some(base.to_path_buf()),
        external_currents: Some(vec!["i_ext".to_string()]),
        ..BuildOptions::default()
    }
}

/// Leaky integrate-and-fire neuron with a refractory regime and a synaptic
/// event input
pub fn leaky() -> Dynamics {
    Dynamics::new("LIF")
        .with_parameter("C_m", Dimension::CAPACITANCE)
        .with_parameter("g_L", Dimension::CONDUCTANCE)
        .with_parameter("E_L", Dimension::VOLTAGE)
        .with_parameter("theta", Dimension::VOLTAGE)
        .with_parameter("t_ref", Dimension::TIME)
        .with_state("V", Dimension::VOLTAGE)
        .with_state("t_end", Dimension::TIME)
        .with_analog_reduce("i_syn", Dimension::CURRENT)
        .with_analog_receive("q", Dimension::VOLTAGE)
        .with_event_receive("input")
        .with_event_send("spike")
        .with_regime(
            Regime::new("sub")
                .with_derivative("V", e("(i_syn - g_L * (V - E_L)) / C_m"))
                .with_on_event(OnEvent::new("input").with_assignment("V", e("V + q")))
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

/// LIF values in user units
pub fn leaky_properties() -> nine_dynamics::Properties {
    nine_dynamics::Properties::new()
        .with_value("C_m", q(250.0, "pF"))
        .with_value("g_L", q(25.0, "nS"))
        .with_value("E_L", q(-70.0, "mV"))
        .with_value("theta", q(-55.0, "mV"))
        .with_value("t_ref", q(2.0, "ms"))
        .with_initial("V", q(-70.0, "mV"))
        .with_initial("t_end", q(0.0, "ms"))
        .with_initial_regime("sub")
}

/// One recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub program: String,
    pub cwd: PathBuf,
}

/// Toolchain that leaves behind what nrnivmodl, cmake and make would
#[derive(Debug, Default)]
pub struct FakeToolchain {
    pub calls: Mutex<Vec<Call>>,
}

impl Toolchain for FakeToolchain {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        self.calls.lock().push(Call {
            program: program.to_string(),
            cwd: cwd.to_path_buf(),
        });
        match program {
            "nrnivmodl" => {
                std::fs::create_dir_all(cwd.join(std::env::consts::ARCH).join(".libs"))?;
            }
            "cmake" => {
                if let Some(prefix) = args.iter().find_map(|a| a.strip_prefix("-DCMAKE_INSTALL_PREFIX=")) {
                    std::fs::create_dir_all(PathBuf::from(prefix).join("lib").join("nest"))?;
                }
            }
            _ => {}
        }
        Ok(CommandOutput::ok("", ""))
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
