//! Cell API behaviour: lifecycle, attribute access, recording, inputs and
//! connections.

mod common;

use std::sync::Arc;

use common::*;
use nine_cells::{
    AnalogSignal, Cell, CellClass, CellError, Recording, ReferenceKernel, Simulation, SimulationParams, SpikeTrain,
};
use nine_codegen::transform::event::REGIME_STATE;
use nine_codegen::{BackendKind, BuildOptions};
use nine_dynamics::Unit;

fn leaky_class(backend: BackendKind) -> Arc<CellClass> {
    let options = BuildOptions {
        external_currents: match backend {
            BackendKind::Neuron => Some(vec!["i_syn".to_string()]),
            BackendKind::Nest => None,
        },
        ..BuildOptions::default()
    };
    CellClass::new(&leaky(), backend, &options).unwrap()
}

fn nest_sim() -> Simulation {
    Simulation::new(ReferenceKernel::new(BackendKind::Nest), SimulationParams::with_dt(0.1).unwrap()).unwrap()
}

#[test]
fn only_one_simulation_is_active_at_a_time() {
    let _guard = serial();
    let first = nest_sim();
    first.activate().unwrap();
    let err = first.activate().unwrap_err();
    assert!(matches!(err, CellError::SimulationLifecycle { .. }), "unexpected error: {}", err);

    let second = nest_sim();
    let err = second.activate().unwrap_err();
    assert!(matches!(err, CellError::SimulationLifecycle { .. }), "unexpected error: {}", err);

    first.deactivate().unwrap();
    assert!(!first.is_active());
    second.activate().unwrap();
    second.deactivate().unwrap();

    let err = Cell::new(&second, &leaky_class(BackendKind::Nest), &leaky_properties()).unwrap_err();
    assert!(matches!(err, CellError::SimulationLifecycle { .. }), "unexpected error: {}", err);
    let err = second.run_ms(10.0).unwrap_err();
    assert!(matches!(err, CellError::SimulationLifecycle { .. }), "unexpected error: {}", err);
}

#[test]
fn dropping_an_active_simulation_releases_the_process() {
    let _guard = serial();
    {
        let sim = nest_sim();
        sim.activate().unwrap();
    }
    let sim = nest_sim();
    sim.activate().unwrap();
    sim.deactivate().unwrap();
}

#[test]
fn attributes_are_validated_against_the_class() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let mut cell = Cell::new(sim, &class, &leaky_properties())?;

        // user units in, native units out
        let c = cell.get("C_m")?;
        assert_eq!(c.unit.name, "pF");
        assert!((c.value - 250.0).abs() < 1e-9);
        cell.set("g_L", &q(0.05, "uS"))?;
        assert!((cell.get("g_L")?.value - 50.0).abs() < 1e-9);
        assert_eq!(cell.properties().values["g_L"], q(0.05, "uS"));

        let err = cell.get("tau").unwrap_err();
        assert!(matches!(err, CellError::AttributeAccess { ref name, .. } if name == "tau"), "unexpected error: {}", err);
        let err = cell.set("C_m", &q(1.0, "mV")).unwrap_err();
        assert!(matches!(err, CellError::Dimension { .. }), "unexpected error: {}", err);
        let err = cell.set_regime("bursting").unwrap_err();
        assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);
        let err = cell.record("nothing").unwrap_err();
        assert!(matches!(err, CellError::AttributeAccess { .. }), "unexpected error: {}", err);
        let err = cell.play_analog("V", &AnalogSignal::pulse(&q(1.0, "mV"), 0.0, 1.0, 0.1, 2.0)).unwrap_err();
        assert!(matches!(err, CellError::AttributeAccess { .. }), "unexpected error: {}", err);
        let err = cell
            .play_analog("i_syn", &AnalogSignal::pulse(&q(1.0, "mV"), 0.0, 1.0, 0.1, 2.0))
            .unwrap_err();
        assert!(matches!(err, CellError::Dimension { .. }), "unexpected error: {}", err);
        let err = cell.regime_epochs().unwrap_err();
        assert!(matches!(err, CellError::RegimeTransitionsNotRecorded { .. }), "unexpected error: {}", err);

        cell.set_regime("refractory")?;
        assert_eq!(cell.regime()?, "refractory");
        Ok(())
    })
    .unwrap();
}

#[test]
fn missing_parameters_and_foreign_classes_are_rejected() {
    let _guard = serial();
    let sim = nest_sim();
    sim.activate().unwrap();
    let mut properties = leaky_properties();
    properties.values.shift_remove("theta");
    let err = Cell::new(&sim, &leaky_class(BackendKind::Nest), &properties).unwrap_err();
    assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);

    let err = Cell::new(&sim, &leaky_class(BackendKind::Neuron), &leaky_properties()).unwrap_err();
    assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);

    let mut properties = leaky_properties();
    properties.initial_regime = None;
    let err = Cell::new(&sim, &leaky_class(BackendKind::Nest), &properties);
    // the point rewrite records a default regime
    assert!(err.is_ok());
    sim.deactivate().unwrap();
}

#[test]
fn regime_epochs_follow_spikes_and_refractory_periods() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    let (spikes, epochs) = Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let cell = Cell::new(sim, &class, &leaky_properties())?;
        cell.record_regime()?;
        cell.record("spike")?;
        let drive = AnalogSignal::new(0.0, 100.0, vec![500.0], Unit::parse("pA")?);
        cell.play_analog("i_syn", &drive)?;
        sim.run(&q(100.0, "ms"))?;
        let spikes = cell.recording("spike", None)?;
        Ok((spikes, cell.regime_epochs()?))
    })
    .unwrap();

    let train = spikes.spikes().unwrap();
    // tau = 10 ms, threshold 15 mV above rest, plateau 20 mV above rest
    let first = 10.0 * (20.0f64 / 5.0).ln();
    assert!((train.times[0] - first).abs() < 0.15, "{:?}", train.times);
    assert!(train.len() >= 5 && train.len() <= 7, "{:?}", train.times);

    assert_eq!(epochs[0].regime, "sub");
    assert_eq!(epochs[1].regime, "refractory");
    assert!((epochs[1].start - train.times[0]).abs() < 1e-9);
    assert!(epochs[1].duration >= 1.95 && epochs[1].duration <= 2.15, "{:?}", epochs[1]);
    let total: f64 = epochs.iter().map(|e| e.duration).sum();
    assert!((total - 100.0).abs() < 1e-6);
}

#[test]
fn killed_cells_answer_from_their_snapshot() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    let cell = Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let cell = Cell::new(sim, &class, &leaky_properties())?;
        cell.record("V")?;
        sim.run(&q(5.0, "ms"))?;
        Ok(cell)
    })
    .unwrap();

    assert!(!cell.is_alive());
    let err = cell.get("V").unwrap_err();
    assert!(matches!(err, CellError::SimulationLifecycle { .. }), "unexpected error: {}", err);

    let recording = cell.recording("V", None).unwrap();
    let trace = recording.analog().unwrap();
    assert_eq!(trace.values.len(), 51);
    assert!(trace.values.iter().all(|v| (v + 70.0).abs() < 1e-9));

    let trimmed = cell.recording("V", Some(2.0)).unwrap();
    assert_eq!(trimmed.analog().unwrap().values.len(), 31);
    let err = cell.recording("V", Some(2.05)).unwrap_err();
    assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);
}

#[test]
fn failed_bodies_leave_cells_alive() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    let mut kept = None;
    let result: nine_cells::Result<()> =
        Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
            kept = Some(Cell::new(sim, &class, &leaky_properties())?);
            Err(CellError::usage("stop"))
        });
    assert!(result.is_err());
    assert!(kept.unwrap().is_alive());
    // the process is free again
    let sim = nest_sim();
    sim.activate().unwrap();
    sim.deactivate().unwrap();
}

#[test]
fn played_events_carry_their_properties() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let cell = Cell::new(sim, &class, &leaky_properties())?;
        cell.record("spike")?;
        let train = SpikeTrain::new(vec![5.0, 10.0], 0.0, 20.0);
        cell.play("input", &Recording::Spikes(train), &[("q", q(20.0, "mV"))])?;
        let err = cell
            .play_events("input", &SpikeTrain::new(vec![1.0], 0.0, 2.0), &[("q", q(1.0, "nA"))])
            .unwrap_err();
        assert!(matches!(err, CellError::Dimension { .. }), "unexpected error: {}", err);
        let err = cell
            .play_events("output", &SpikeTrain::new(vec![1.0], 0.0, 2.0), &[])
            .unwrap_err();
        assert!(matches!(err, CellError::AttributeAccess { .. }), "unexpected error: {}", err);

        sim.run(&q(20.0, "ms"))?;
        let spikes = cell.recording("spike", None)?;
        let times = &spikes.spikes().unwrap().times;
        assert_eq!(times.len(), 2, "{:?}", times);
        assert!((times[0] - 5.1).abs() < 1e-6);
        assert!((times[1] - 10.1).abs() < 1e-6);
        Ok(())
    })
    .unwrap();
}

#[test]
fn device_delay_is_taken_out_of_played_inputs() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    let params = SimulationParams::default().with_device_delay(1.0).unwrap();
    Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), params, |sim| {
        let cell = Cell::new(sim, &class, &leaky_properties())?;
        cell.record("spike")?;

        let err = cell
            .play_events("input", &SpikeTrain::new(vec![0.5, 5.0], 0.0, 20.0), &[])
            .unwrap_err();
        assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);
        assert!(err.to_string().contains("0.5"), "{}", err);
        let err = cell
            .play_analog("i_syn", &AnalogSignal::new(0.5, 0.1, vec![0.0; 10], Unit::parse("pA")?))
            .unwrap_err();
        assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);

        // the device delay is added back, so inputs act at their own times
        let train = SpikeTrain::new(vec![5.0, 10.0], 0.0, 20.0);
        cell.play("input", &Recording::Spikes(train), &[("q", q(20.0, "mV"))])?;
        cell.play_analog("i_syn", &AnalogSignal::new(1.0, 19.0, vec![0.0], Unit::parse("pA")?))?;
        sim.run(&q(20.0, "ms"))?;
        let spikes = cell.recording("spike", None)?;
        let times = &spikes.spikes().unwrap().times;
        assert_eq!(times.len(), 2, "{:?}", times);
        assert!((times[0] - 5.1).abs() < 1e-6, "{:?}", times);
        assert!((times[1] - 10.1).abs() < 1e-6, "{:?}", times);
        Ok(())
    })
    .unwrap();
}

#[test]
fn negative_device_delays_are_rejected() {
    let err = SimulationParams::default().with_device_delay(-0.1).unwrap_err();
    assert!(matches!(err, CellError::Usage { .. }), "unexpected error: {}", err);
}

#[test]
fn connections_relay_spikes_after_their_delay() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let pre = Cell::new(sim, &class, &leaky_properties())?;
        let post = Cell::new(sim, &class, &leaky_properties())?;
        pre.record("spike")?;
        post.record("spike")?;
        pre.play_analog("i_syn", &AnalogSignal::new(0.0, 50.0, vec![500.0], Unit::parse("pA")?))?;
        pre.connect(&post, "spike", "input", &q(1.0, "ms"), &[("q", q(20.0, "mV"))])?;

        let err = pre
            .connect(&post, "spike", "nowhere", &q(1.0, "ms"), &[])
            .unwrap_err();
        assert!(matches!(err, CellError::AttributeAccess { .. }), "unexpected error: {}", err);
        let err = pre
            .connect(&post, "spike", "input", &q(1.0, "mV"), &[])
            .unwrap_err();
        assert!(matches!(err, CellError::Dimension { .. }), "unexpected error: {}", err);

        sim.run(&q(50.0, "ms"))?;
        let sent = pre.recording("spike", None)?;
        let received = post.recording("spike", None)?;
        let (sent, received) = (sent.spikes().unwrap(), received.spikes().unwrap());
        assert!(!sent.is_empty());
        assert_eq!(sent.len(), received.len());
        for (a, b) in sent.times.iter().zip(&received.times) {
            assert!((b - a - 1.1).abs() < 1e-6, "{} -> {}", a, b);
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn clamped_regimes_hold_the_membrane_voltage() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Neuron);
    assert!(class.is_full_cell());
    assert_eq!(class.slot("V"), class.slot("v"));
    let params = SimulationParams::with_dt(0.05).unwrap();
    Simulation::scoped(ReferenceKernel::new(BackendKind::Neuron), params, |sim| {
        let cell = Cell::new(sim, &class, &leaky_properties())?;
        assert!((cell.section().unwrap().capacitance() - 0.25).abs() < 1e-9);
        cell.record("V")?;
        cell.record("spike")?;
        cell.play_analog("i_syn", &AnalogSignal::new(0.0, 60.0, vec![0.5], Unit::parse("nA")?))?;
        sim.run(&q(60.0, "ms"))?;

        let spikes = cell.recording("spike", None)?;
        let first = spikes.spikes().unwrap().times[0];
        assert!((first - 13.86).abs() < 0.1, "{}", first);

        let trace = cell.recording("V", None)?;
        let trace = trace.analog().unwrap();
        for offset in [0.5, 1.0, 1.5] {
            let v = trace.value_at(first + offset).unwrap();
            assert!((v + 70.0).abs() < 1e-9, "v = {} at {} ms", v, first + offset);
        }
        // released after the refractory period
        assert!(trace.value_at(first + 4.0).unwrap() > -70.0);
        Ok(())
    })
    .unwrap();
}

#[test]
fn time_states_read_back_in_milliseconds() {
    let _guard = serial();
    let class = leaky_class(BackendKind::Nest);
    Simulation::scoped(ReferenceKernel::new(BackendKind::Nest), SimulationParams::default(), |sim| {
        let mut cell = Cell::new(sim, &class, &leaky_properties())?;
        cell.set("t_end", &q(3.0, "s"))?;
        let t_end = cell.get("t_end")?;
        assert_eq!(t_end.unit.name, "ms");
        assert!((t_end.value - 3000.0).abs() < 1e-9);

        // the regime state tracks regime switches
        cell.set_regime("refractory")?;
        assert_eq!(cell.get(REGIME_STATE)?.value, 1.0);
        cell.set_regime("sub")?;
        assert_eq!(cell.get(REGIME_STATE)?.value, 0.0);
        Ok(())
    })
    .unwrap();
}
