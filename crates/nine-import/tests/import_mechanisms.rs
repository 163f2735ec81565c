use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use nine_codegen::backend::neuron::mechanism_source;
use nine_codegen::{
    transform_for_build, BackendKind, BuildOptions, BuildRequest, CommandOutput, Driver, Registrar, Registration,
    Toolchain,
};
use nine_dynamics::{keys, Dimension, Dynamics, Expr, BUILD_NS, NMODL_NS};
use nine_import::{import_file, import_str, ImportError, ImportedMechanism};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn eval(expr: &Expr, values: &[(&str, f64)]) -> f64 {
    expr.eval(&|name| values.iter().find(|(n, _)| *n == name).map(|(_, v)| *v))
        .unwrap()
}

const SODIUM: &str = r#"
TITLE simplified sodium channel

UNITS {
    (mA) = (milliamp)
    (mV) = (millivolt)
    (S) = (siemens)
}

NEURON {
    SUFFIX nax
    USEION na READ ena WRITE ina
    RANGE gbar
    GLOBAL minf, mtau
}

PARAMETER {
    gbar = 0.12 (S/cm2) <0,1e9>
    celsius = 6.3 (degC)
}

ASSIGNED {
    v (mV)
    ena (mV)
    ina (mA/cm2)
    minf (1)
    mtau (ms)
}

STATE { m }

BREAKPOINT {
    SOLVE states METHOD cnexp
    ina = gbar*m*m*m*(v - ena)
}

INITIAL {
    rates(v)
    m = minf
}

DERIVATIVE states {
    rates(v)
    m' = (minf - m)/mtau
}

PROCEDURE rates(v (mV)) {
    LOCAL a, b, q
    TABLE minf, mtau DEPEND celsius FROM -100 TO 100 WITH 200
    UNITSOFF
    q = 3^((celsius - 6.3)/10)
    a = vtrap(-(v + 40), 10)
    b = 4*exp(-(v + 65)/18)
    mtau = 1/(q*(a + b))
    minf = a/(a + b)
    UNITSON
}

FUNCTION vtrap(x, y) {
    : guard the removable singularity
    if (fabs(x/y) < 1e-6) {
        vtrap = y*(1 - x/y/2)
    } else {
        vtrap = x/(exp(x/y) - 1)
    }
}
"#;

#[test]
fn density_mechanism_with_procedures_and_functions() {
    init();
    let imported = import_str(SODIUM).unwrap();
    let d = &imported.dynamics;
    assert_eq!(d.name, "naxClass");
    assert_eq!(imported.component_name, "nax");
    assert_eq!(imported.title.as_deref(), Some("simplified sodium channel"));
    assert_eq!(imported.solve_methods.get("states").map(String::as_str), Some("cnexp"));

    assert_eq!(d.parameters.keys().collect::<Vec<_>>(), vec!["gbar"]);
    assert_eq!(d.parameters["gbar"].dimension, Dimension::CONDUCTANCE_DENSITY);
    assert_eq!(imported.properties.values["gbar"].value, 0.12);
    // a celsius value in the file does not shadow the simulator temperature
    assert_eq!(d.analog_receive_ports["celsius"].dimension, Dimension::TEMPERATURE);
    assert!(!imported.properties.values.contains_key("celsius"));

    assert_eq!(d.analog_receive_ports["ena"].dimension, Dimension::VOLTAGE);
    assert_eq!(d.analog_receive_ports["ena"].annotations().get_str(BUILD_NS, keys::ION_SPECIES), Some("na"));
    assert_eq!(d.analog_receive_ports["v"].dimension, Dimension::VOLTAGE);
    assert_eq!(d.analog_send_ports["ina"].dimension, Dimension::CURRENT_DENSITY);
    assert!(d.aliases.contains_key("ina"));

    let regime = &d.regimes["states"];
    assert!(regime.time_derivatives.contains_key("m"));
    // the function result is an alias holding a piecewise value
    let vtrap = d
        .aliases
        .iter()
        .find(|(name, _)| name.starts_with("vtrap_"))
        .map(|(_, a)| &a.rhs)
        .unwrap();
    assert!(matches!(vtrap, Expr::Piecewise(_)), "{}", vtrap);

    let m = &d.state_variables["m"];
    assert_eq!(m.annotations().get_str(NMODL_NS, "initial"), Some("minf"));
    assert_eq!(
        d.annotations().get(NMODL_NS, "global").map(|v| v.as_list()),
        Some(vec!["minf".to_string(), "mtau".to_string()])
    );
}

#[test]
fn unwrapped_function_matches_its_branches() {
    let imported = import_str(SODIUM).unwrap();
    let d = &imported.dynamics;
    let (name, vtrap) = d
        .aliases
        .iter()
        .find(|(name, _)| name.starts_with("vtrap_"))
        .map(|(n, a)| (n.clone(), a.rhs.clone()))
        .unwrap();
    assert!(name.contains("__p__40"), "{}", name);
    // away from the singularity: x / (exp(x/y) - 1)
    let far = eval(&vtrap, &[("v", -20.0)]);
    let x: f64 = -(-20.0 + 40.0);
    assert!((far - x / ((x / 10.0).exp() - 1.0)).abs() < 1e-12);
    // at the singularity: y * (1 - x/y/2)
    let near = eval(&vtrap, &[("v", -40.0)]);
    assert!((near - 10.0).abs() < 1e-12);
}

const EXPSYN: &str = r#"
NEURON {
    POINT_PROCESS ExpSyn
    RANGE tau, e, i
    NONSPECIFIC_CURRENT i
}

UNITS {
    (nA) = (nanoamp)
    (mV) = (millivolt)
    (uS) = (microsiemens)
}

PARAMETER {
    tau = 0.1 (ms) <1e-9,1e9>
    e = 0 (mV)
}

ASSIGNED {
    v (mV)
    i (nA)
}

STATE {
    g (uS)
}

INITIAL {
    g = 0
}

BREAKPOINT {
    SOLVE state METHOD cnexp
    i = g*(v - e)
}

DERIVATIVE state {
    g' = -g/tau
}

NET_RECEIVE(weight (uS)) {
    g = g + weight
}
"#;

#[test]
fn point_process_with_net_receive() {
    init();
    let imported = import_str(EXPSYN).unwrap();
    let d = &imported.dynamics;
    assert_eq!(d.name, "ExpSynClass");
    assert_eq!(d.analog_send_ports["i"].dimension, Dimension::CURRENT);
    assert_eq!(
        d.analog_send_ports["i"].annotations().get_str(BUILD_NS, keys::ION_SPECIES),
        Some("nonspecific")
    );
    assert!(d.event_receive_ports.contains_key("weight_event"));
    assert_eq!(d.analog_receive_ports["weight"].dimension, Dimension::CONDUCTANCE);

    let g = &d.state_variables["g"];
    assert_eq!(g.dimension, Dimension::CONDUCTANCE);
    assert_eq!(g.initial.as_ref().map(|q| q.value), Some(0.0));
    assert_eq!(imported.properties.initial_values["g"].value, 0.0);
    assert_eq!(imported.properties.values["tau"].value, 0.1);

    let regime = &d.regimes["state"];
    assert_eq!(regime.on_events.len(), 1);
    let on_event = &regime.on_events[0];
    assert_eq!(on_event.src_port, "weight_event");
    assert_eq!(on_event.state_assignments["g"], Expr::parse("g + weight").unwrap());
}

const KINETIC: &str = r#"
NEURON { SUFFIX twostate RANGE kf, kb }

PARAMETER {
    kf = 2 (/ms)
    kb = 5 (/ms)
}

STATE { C O }

INITIAL {
    C = 1
    O = 0
}

BREAKPOINT {
    SOLVE scheme METHOD sparse
}

KINETIC scheme {
    ~ C <-> O (kf, kb)
    CONSERVE C + O = 1
}
"#;

#[test]
fn kinetic_scheme_expands_to_mass_action() {
    init();
    let imported = import_str(KINETIC).unwrap();
    let d = &imported.dynamics;
    let regime = &d.regimes["scheme"];
    let values = [("C", 0.4), ("O", 0.6), ("kf", 2.0), ("kb", 5.0)];
    let dc = eval(&regime.time_derivatives["C"], &values);
    let d_open = eval(&regime.time_derivatives["O"], &values);
    assert!((dc - (-2.0 * 0.4 + 5.0 * 0.6)).abs() < 1e-12);
    assert!((dc + d_open).abs() < 1e-12);
    assert_eq!(d.parameters["kf"].dimension, Dimension::PER_TIME);
    assert_eq!(imported.solve_methods["scheme"], "sparse");
    assert_eq!(
        regime.annotations().get(NMODL_NS, "constraints").map(|v| v.as_list()),
        Some(vec!["CONSERVE C + O = 1".to_string()])
    );
    assert_eq!(imported.properties.initial_values["C"].value, 1.0);
}

#[test]
fn conditional_without_else_or_prior_value_fails() {
    let source = r#"
NEURON { SUFFIX cond }
ASSIGNED { v (mV) y (1) }
BREAKPOINT {
    if (v > 0) {
        y = 1
    }
}
"#;
    let err = import_str(source).unwrap_err();
    assert!(matches!(err, ImportError::Unwrapping { ref lhs, .. } if lhs == "y"), "unexpected error: {}", err);
}

#[test]
fn conditional_parameter_is_constrained() {
    let source = r#"
NEURON { SUFFIX clip NONSPECIFIC_CURRENT i }
PARAMETER { gmax = 1 (S/cm2) }
ASSIGNED { v (mV) i (mA/cm2) }
BREAKPOINT {
    if (gmax < 0) {
        gmax = 0
    }
    i = gmax*v
}
"#;
    let imported = import_str(source).unwrap();
    let d = &imported.dynamics;
    assert!(d.aliases.contains_key("gmax_constrained"));
    assert_eq!(d.aliases["i"].rhs, Expr::parse("gmax_constrained * v").unwrap());
    assert!(d.parameters.contains_key("gmax"));
}

#[test]
fn unsupported_constructs_are_reported() {
    let verbatim = "NEURON { SUFFIX x }\nVERBATIM\n#include <stdio.h>\nENDVERBATIM\n";
    assert!(matches!(import_str(verbatim), Err(ImportError::UnsupportedConstruct { .. })));

    let unknown = "NEURON { SUFFIX x }\nDEFINE NSTEP 5\n";
    assert!(matches!(import_str(unknown), Err(ImportError::UnknownBlock { .. })));

    let recursive = "NEURON { SUFFIX x RANGE y }\nASSIGNED { y }\nBREAKPOINT { y = f(1) }\nFUNCTION f(n) {\n f = n*f(n - 1)\n}\n";
    assert!(matches!(import_str(recursive), Err(ImportError::Recursion { .. })));

    let furlongs = "NEURON { SUFFIX x }\nPARAMETER { d = 1 (furlong) }\n";
    assert!(matches!(import_str(furlongs), Err(ImportError::UnknownDimension { .. })));

    let pointer = "NEURON { SUFFIX x POINTER p }\n";
    assert!(matches!(import_str(pointer), Err(ImportError::UnsupportedConstruct { .. })));
}

#[test]
fn inbuilt_constants_and_unit_aliases() {
    let source = r#"
NEURON { SUFFIX nernst RANGE erev }
UNITS {
    (mV) = (millivolt)
    FARADAY = (faraday) (coulomb)
    R = (k-mole) (joule/degC)
}
PARAMETER {
    celsius = 36 (degC)
    cai = 5e-5 (mM)
    cao = 2 (mM)
}
ASSIGNED { erev (mV) }
BREAKPOINT {
    erev = (1e3)*R*(celsius + 273.15)/(2*FARADAY)*log(cao/cai)
}
"#;
    let imported = import_str(source).unwrap();
    let d = &imported.dynamics;
    assert!((d.constants["FARADAY"].value - 96485.3365).abs() < 1e-6);
    assert!((d.constants["R"].value - 8.3144621).abs() < 1e-9);
    assert_eq!(d.parameters["cai"].dimension, Dimension::CONCENTRATION);
    assert!(d.aliases.contains_key("erev"));
}

/// What a mechanism computes, leaving out names, annotations and alias order
#[derive(Debug, PartialEq)]
struct Shape {
    parameters: BTreeMap<String, Dimension>,
    states: BTreeMap<String, Dimension>,
    derivatives: BTreeMap<String, BTreeMap<String, Expr>>,
    aliases: BTreeMap<String, Expr>,
    receives: BTreeMap<String, (Dimension, Option<String>)>,
    sends: BTreeMap<String, (Dimension, Option<String>)>,
}

fn shape(d: &Dynamics) -> Shape {
    let species = |a: &nine_dynamics::Annotations| a.get_str(BUILD_NS, keys::ION_SPECIES).map(str::to_string);
    Shape {
        parameters: d.parameters.values().map(|p| (p.name.clone(), p.dimension)).collect(),
        states: d.state_variables.values().map(|s| (s.name.clone(), s.dimension)).collect(),
        derivatives: d
            .regimes
            .values()
            .map(|r| (r.name.clone(), r.time_derivatives.clone().into_iter().collect()))
            .collect(),
        aliases: d.aliases.values().map(|a| (a.name.clone(), a.rhs.clone())).collect(),
        receives: d
            .analog_receive_ports
            .values()
            .map(|p| (p.name.clone(), (p.dimension, species(p.annotations()))))
            .collect(),
        sends: d
            .analog_send_ports
            .values()
            .map(|p| (p.name.clone(), (p.dimension, species(p.annotations()))))
            .collect(),
    }
}

/// Imports the sodium mechanism, renders it for NEURON and imports the result
fn round_trip(dir: &Path) -> (ImportedMechanism, ImportedMechanism) {
    let first = import_str(SODIUM).unwrap();
    let options = BuildOptions::default();
    let built = transform_for_build(&first.dynamics, BackendKind::Neuron, &options).unwrap();
    let text = mechanism_source(&built, &options).unwrap();
    let path = dir.join(format!("{}.mod", built.name));
    std::fs::write(&path, &text).unwrap();
    let second = import_file(&path).unwrap();
    (first, second)
}

#[test]
fn generated_mechanism_imports_back() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (first, second) = round_trip(dir.path());

    assert_eq!(second.component_name, "naxClass9ML");
    assert_eq!(shape(&second.dynamics), shape(&first.dynamics));
    // the piecewise function result survives as a piecewise alias
    assert!(second
        .dynamics
        .aliases
        .values()
        .any(|a| a.name.starts_with("vtrap_") && matches!(a.rhs, Expr::Piecewise(_))));
}

/// Records every invocation and lays out what nrnivmodl would leave behind
#[derive(Debug, Default)]
struct CountingToolchain {
    programs: Mutex<Vec<String>>,
}

impl Toolchain for CountingToolchain {
    fn run(&self, program: &str, _args: &[String], cwd: &Path) -> nine_codegen::Result<CommandOutput> {
        self.programs.lock().unwrap().push(program.to_string());
        if program == "nrnivmodl" {
            std::fs::create_dir_all(cwd.join(std::env::consts::ARCH).join(".libs"))?;
        }
        Ok(CommandOutput::ok("", ""))
    }
}

#[derive(Debug, Default)]
struct NullRegistrar;

impl Registrar for NullRegistrar {
    fn register(&self, library: &Path, module: Option<&str>) -> nine_codegen::Result<Registration> {
        Ok(Registration {
            library: library.to_path_buf(),
            module: module.map(str::to_string),
        })
    }
}

#[test]
fn imported_mechanism_rebuilds_lazily() {
    init();
    let dir = tempfile::tempdir().unwrap();
    let (_, imported) = round_trip(dir.path());
    let options = BuildOptions {
        base_dir: Some(dir.path().join("build")),
        ..BuildOptions::default()
    };
    let driver = Driver::new(CountingToolchain::default(), NullRegistrar);
    let request = BuildRequest::new(&imported.dynamics, BackendKind::Neuron, &options);

    let first = driver.build(&request).unwrap();
    assert!(first.plan.generate && first.plan.compile, "{:?}", first.plan);
    assert!(!driver.toolchain().programs.lock().unwrap().is_empty());

    driver.toolchain().programs.lock().unwrap().clear();
    let second = driver.build(&request).unwrap();
    assert!(!second.plan.generate && !second.plan.compile, "{:?}", second.plan);
    assert!(second.generated.is_empty());
    assert!(driver.toolchain().programs.lock().unwrap().is_empty());
}

#[test]
fn missing_file_is_an_io_error() {
    let err = import_file("/nonexistent/mechanism.mod").unwrap_err();
    assert!(matches!(err, ImportError::Io { .. }), "unexpected error: {}", err);
}
