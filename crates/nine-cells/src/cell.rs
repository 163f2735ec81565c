//! Cell classes wrap a built dynamics class; cells are instances of one inside
//! an active [`Simulation`].

use std::collections::BTreeMap;
use std::f64::consts::PI;
use std::sync::Arc;

use indexmap::IndexMap;
use log::{debug, warn};
use nine_codegen::backend::infer_dimension;
use nine_codegen::transform::event::REGIME_STATE;
use nine_codegen::transform::{annotated_list, mechanism_type, receptor_index, renamed_elements};
use nine_codegen::{
    transform_for_build, BackendKind, BuildOptions, BuildOutcome, BuildRequest, Driver, Registrar, Registration,
    Toolchain, UnitHandler,
};
use nine_dynamics::{keys, AnnotationValue, BinOp, Dimension, Dynamics, Expr, Properties, Quantity, BUILD_NS};
use parking_lot::Mutex;

use crate::error::{CellError, Result};
use crate::kernel::{CellHandle, Connection, InputTarget, Kernel, Probe, Stimulus};
use crate::signal::{epochs, AnalogSignal, Epoch, Recording, SpikeTrain, TIME_EPSILON};
use crate::simulation::{to_ms, Controller, Simulation};
use crate::REGIME_RECORDING;

/// Whether a slot holds a parameter or a state variable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Parameter
    Parameter,
    /// State variable
    State,
}

/// Position of a parameter or state in a kernel instance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    /// Index into the instance's value vector
    pub index: usize,
    /// Parameter or state
    pub kind: SlotKind,
    /// Declared dimension
    pub dimension: Dimension,
}

/// A dynamics class rewritten for one back-end, with its name to slot table
#[derive(Debug, Clone)]
pub struct CellClass {
    source: Dynamics,
    class: Dynamics,
    backend: BackendKind,
    slots: IndexMap<String, Slot>,
    slot_names: Vec<String>,
    renamed: BTreeMap<String, String>,
    registration: Option<Registration>,
}

impl CellClass {
    /// Transform `source` for `backend` without building it
    pub fn new(source: &Dynamics, backend: BackendKind, options: &BuildOptions) -> Result<Arc<Self>> {
        let class = transform_for_build(source, backend, options)?;
        Ok(Arc::new(Self::assemble(source, class, backend, None)))
    }

    /// Wrap the result of a build
    pub fn from_build(source: &Dynamics, backend: BackendKind, outcome: BuildOutcome) -> Arc<Self> {
        Arc::new(Self::assemble(source, outcome.class, backend, outcome.registration))
    }

    /// Build, compile and load `request`, then wrap the result
    pub fn build<T: Toolchain, R: Registrar>(driver: &Driver<T, R>, request: &BuildRequest<'_>) -> Result<Arc<Self>> {
        let outcome = driver.build(request)?;
        Ok(Self::from_build(request.dynamics, request.backend, outcome))
    }

    fn assemble(source: &Dynamics, class: Dynamics, backend: BackendKind, registration: Option<Registration>) -> Self {
        let mut slots = IndexMap::new();
        let mut slot_names = Vec::new();
        for p in class.parameters.values() {
            slots.insert(
                p.name.clone(),
                Slot {
                    index: slot_names.len(),
                    kind: SlotKind::Parameter,
                    dimension: p.dimension,
                },
            );
            slot_names.push(p.name.clone());
        }
        for s in class.state_variables.values() {
            slots.insert(
                s.name.clone(),
                Slot {
                    index: slot_names.len(),
                    kind: SlotKind::State,
                    dimension: s.dimension,
                },
            );
            slot_names.push(s.name.clone());
        }
        let renamed: BTreeMap<String, String> = renamed_elements(&class).into_iter().collect();
        for (old, new) in &renamed {
            if let Some(slot) = slots.get(new).copied() {
                slots.entry(old.clone()).or_insert(slot);
            }
        }
        debug!("'{}' has {} slots", class.name, slot_names.len());
        Self {
            source: source.clone(),
            class,
            backend,
            slots,
            slot_names,
            renamed,
            registration,
        }
    }

    /// Built class name
    pub fn name(&self) -> &str {
        &self.class.name
    }

    /// The class as written
    pub fn source(&self) -> &Dynamics {
        &self.source
    }

    /// The class after the back-end rewrite
    pub fn class(&self) -> &Dynamics {
        &self.class
    }

    /// Back-end the class was built for
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    /// Registration of the loaded library, if built
    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    /// Unit handler of the back-end
    pub fn units(&self) -> &'static UnitHandler {
        UnitHandler::for_backend(self.backend)
    }

    /// Slot of a parameter or state, by original or built name
    pub fn slot(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).copied()
    }

    /// Built names of all slots, in slot order
    pub fn slot_names(&self) -> &[String] {
        &self.slot_names
    }

    /// Built name of an element that may have been renamed
    pub fn built_name<'a>(&'a self, name: &'a str) -> &'a str {
        self.renamed.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Index of a regime of the built class
    pub fn regime_index(&self, name: &str) -> Option<usize> {
        self.class.regime_index(name)
    }

    /// Name of the regime at `index`
    pub fn regime_name(&self, index: usize) -> Option<&str> {
        self.class.regimes.get_index(index).map(|(name, _)| name.as_str())
    }

    /// Membrane capacitance parameter chosen by the ODE rewrite
    pub fn membrane_capacitance(&self) -> Option<&str> {
        self.class.annotations().get_str(BUILD_NS, keys::MEMBRANE_CAPACITANCE)
    }

    /// Ports routed to the injection channel by the ODE rewrite
    pub fn external_currents(&self) -> Vec<String> {
        annotated_list(&self.class, keys::EXTERNAL_CURRENTS)
    }

    /// Whether the class owns the membrane voltage of a compartment
    pub fn is_full_cell(&self) -> bool {
        self.backend == BackendKind::Neuron && mechanism_type(&self.class) == Some("full_cell")
    }

    /// Regime a fresh cell starts in, if one can be chosen
    pub fn default_regime(&self) -> Option<&str> {
        if self.class.regimes.len() == 1 {
            return self.regime_name(0);
        }
        self.class.annotations().get_str(BUILD_NS, keys::DEFAULT_REGIME)
    }

    /// Dimension of anything recordable
    pub fn dimension_of(&self, name: &str) -> Option<Dimension> {
        let name = self.built_name(name);
        if let Some(d) = self.class.dimension_of(name) {
            return Some(d);
        }
        if let Some(a) = self.class.aliases.get(name) {
            return infer_dimension(&self.class, None, &a.rhs);
        }
        self.class
            .regimes
            .values()
            .find_map(|r| r.aliases.get(name).and_then(|a| infer_dimension(&self.class, Some(r), &a.rhs)))
    }

    fn is_recordable_value(&self, name: &str) -> bool {
        self.slots.contains_key(name)
            || self.class.aliases.contains_key(name)
            || self.class.analog_send_ports.contains_key(name)
            || self.class.regimes.values().any(|r| r.aliases.contains_key(name))
    }
}

/// Geometry of the single section an ODE cell is inserted into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Section {
    /// Length (um)
    pub length: f64,
    /// Diameter (um)
    pub diameter: f64,
    /// Specific membrane capacitance (uF/cm2)
    pub specific_capacitance: f64,
}

impl Default for Section {
    fn default() -> Self {
        // 100 um2 of membrane
        Self {
            length: 10.0,
            diameter: 10.0 / PI,
            specific_capacitance: 1.0,
        }
    }
}

/// nF per (uF/cm2 * um2)
const CAPACITANCE_SCALE: f64 = 1e-5;

impl Section {
    /// Lateral surface area (um2)
    pub fn area(&self) -> f64 {
        PI * self.diameter * self.length
    }

    /// Total capacitance (nF)
    pub fn capacitance(&self) -> f64 {
        self.specific_capacitance * self.area() * CAPACITANCE_SCALE
    }

    /// Set the specific capacitance from a total capacitance (nF)
    pub fn set_capacitance(&mut self, nanofarad: f64) {
        self.specific_capacitance = nanofarad / (self.area() * CAPACITANCE_SCALE);
    }
}

/// Book-keeping shared between a cell and its simulation's controller
#[derive(Debug)]
pub(crate) struct CellRecord {
    handle: CellHandle,
    name: String,
    alive: bool,
    t_stop: Option<f64>,
    recorded: Vec<String>,
    cache: IndexMap<String, Recording>,
}

impl CellRecord {
    /// Snapshot recordings before the kernel forgets the cell
    pub(crate) fn kill(&mut self, t_stop: f64, kernel: &dyn Kernel) {
        if !self.alive {
            return;
        }
        for key in &self.recorded {
            match kernel.recording(self.handle, key) {
                Ok(recording) => {
                    self.cache.insert(key.clone(), recording);
                }
                Err(e) => warn!("cannot cache recording '{}' of '{}': {}", key, self.name, e),
            }
        }
        self.alive = false;
        self.t_stop = Some(t_stop);
    }
}

/// A cell simulated by the kernel of an active simulation
pub struct Cell {
    class: Arc<CellClass>,
    controller: Arc<Mutex<Controller>>,
    record: Arc<Mutex<CellRecord>>,
    handle: CellHandle,
    properties: Properties,
    section: Option<Section>,
    t_start: f64,
}

impl Cell {
    /// Create a cell in `sim`, set its properties and initial state and
    /// register it with the simulation
    pub fn new(sim: &Simulation, class: &Arc<CellClass>, properties: &Properties) -> Result<Self> {
        if sim.backend() != class.backend() {
            return Err(CellError::usage(format!(
                "'{}' was built for {} but the simulation runs {}",
                class.name(),
                class.backend(),
                sim.backend()
            )));
        }
        let regime = match &properties.initial_regime {
            Some(name) => name.clone(),
            None => class.default_regime().map(str::to_string).ok_or_else(|| {
                CellError::usage(format!(
                    "'{}' has several regimes ({}); name the initial one",
                    class.name(),
                    class.class().regimes.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?,
        };
        let regime_index = class.regime_index(&regime).ok_or_else(|| {
            CellError::usage(format!("'{}' is not a regime of '{}'", regime, class.name()))
        })?;
        let units = class.units();
        let mut values = vec![0.0; class.slot_names().len()];
        for (name, q) in properties.values.iter().chain(properties.initial_values.iter()) {
            let slot = class
                .slot(name)
                .ok_or_else(|| CellError::attribute(class.name(), "parameter or state", name))?;
            check_dimension(name, slot.dimension, q)?;
            values[slot.index] = units.scale_value(q)?;
        }
        for (index, name) in class.slot_names().iter().enumerate() {
            let given = properties.values.contains_key(name)
                || properties.initial_values.contains_key(name)
                || class
                    .renamed
                    .iter()
                    .any(|(old, new)| new == name && (properties.values.contains_key(old) || properties.initial_values.contains_key(old)));
            if given {
                continue;
            }
            if let Some(p) = class.class().parameters.get(name) {
                let synthesized = p
                    .annotations()
                    .get(BUILD_NS, keys::TRANSFORM_SRC)
                    .map_or(false, AnnotationValue::is_none);
                if synthesized {
                    // synthesized by the rewrite; unit value in native units
                    values[index] = 1.0;
                    debug!("'{}' defaults to 1 for synthesized parameter '{}'", class.name(), name);
                } else {
                    return Err(CellError::usage(format!(
                        "no value given for parameter '{}' of '{}'",
                        name,
                        class.name()
                    )));
                }
            } else if let Some(s) = class.class().state_variables.get(name) {
                if let Some(q) = &s.initial {
                    values[index] = units.scale_value(q)?;
                }
            }
        }
        // the clamp voltage starts where v starts
        if let (Some(clamp), Some(v)) = (
            class.slot(nine_codegen::transform::ode::CLAMP_VOLTAGE),
            class.slot("v"),
        ) {
            let given = properties.initial_values.contains_key(nine_codegen::transform::ode::CLAMP_VOLTAGE);
            if !given && v.kind == SlotKind::State {
                values[clamp.index] = values[v.index];
            }
        }

        let mut controller = sim.controller().lock();
        controller.require_active()?;
        let t_start = controller.kernel.time();
        let handle = controller.kernel.create(Arc::clone(class))?;
        for (index, value) in values.iter().enumerate() {
            controller.kernel.set(handle, index, *value)?;
        }
        controller.kernel.set_regime(handle, regime_index)?;

        let mut section = None;
        if class.is_full_cell() {
            let mut s = Section::default();
            if let Some(slot) = class.membrane_capacitance().and_then(|cm| class.slot(cm)) {
                s.set_capacitance(values[slot.index]);
            }
            section = Some(s);
        }

        let record = Arc::new(Mutex::new(CellRecord {
            handle,
            name: class.name().to_string(),
            alive: true,
            t_stop: None,
            recorded: Vec::new(),
            cache: IndexMap::new(),
        }));
        controller.register(&record);
        debug!("created '{}' as cell {} in regime '{}'", class.name(), handle, regime);
        drop(controller);

        let mut properties = properties.clone();
        properties.initial_regime = Some(regime);
        Ok(Self {
            class: Arc::clone(class),
            controller: Arc::clone(sim.controller()),
            record,
            handle,
            properties,
            section,
            t_start,
        })
    }

    /// Class of the cell
    pub fn class(&self) -> &Arc<CellClass> {
        &self.class
    }

    /// Handle within the kernel
    pub fn handle(&self) -> CellHandle {
        self.handle
    }

    /// Whether the cell still lives in its simulation
    pub fn is_alive(&self) -> bool {
        self.record.lock().alive
    }

    /// Properties and initial values as last set
    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Section geometry of an ODE full cell
    pub fn section(&self) -> Option<&Section> {
        self.section.as_ref()
    }

    fn slot(&self, name: &str) -> Result<Slot> {
        self.class
            .slot(name)
            .ok_or_else(|| CellError::attribute(self.class.name(), "attribute", name))
    }

    fn live_controller(&self) -> Result<parking_lot::MutexGuard<'_, Controller>> {
        let controller = self.controller.lock();
        controller.require_active()?;
        if !self.record.lock().alive {
            return Err(CellError::lifecycle(format!(
                "cell '{}' was killed when its simulation ended",
                self.class.name()
            )));
        }
        Ok(controller)
    }

    /// Value of a parameter or state variable
    pub fn get(&self, name: &str) -> Result<Quantity> {
        let slot = self.slot(name)?;
        if Some(self.class.built_name(name)) == self.class.membrane_capacitance() {
            if let Some(section) = &self.section {
                return Ok(self.class.units().assign_units(section.capacitance(), slot.dimension)?);
            }
        }
        let value = self.live_controller()?.kernel.get(self.handle, slot.index)?;
        Ok(self.class.units().assign_units(value, slot.dimension)?)
    }

    /// Set a parameter or state variable
    pub fn set(&mut self, name: &str, value: &Quantity) -> Result<()> {
        let slot = self.slot(name)?;
        check_dimension(name, slot.dimension, value)?;
        let native = self.class.units().scale_value(value)?;
        self.live_controller()?.kernel.set(self.handle, slot.index, native)?;
        if Some(self.class.built_name(name)) == self.class.membrane_capacitance() {
            if let Some(section) = &mut self.section {
                section.set_capacitance(native);
            }
        }
        match slot.kind {
            SlotKind::Parameter => self.properties.values.insert(name.to_string(), value.clone()),
            SlotKind::State => self.properties.initial_values.insert(name.to_string(), value.clone()),
        };
        Ok(())
    }

    /// Switch to the named regime
    pub fn set_regime(&mut self, regime: &str) -> Result<()> {
        let index = self.class.regime_index(regime).ok_or_else(|| {
            CellError::usage(format!(
                "'{}' is not a regime of '{}' (regimes are {})",
                regime,
                self.class.name(),
                self.class.class().regimes.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        self.live_controller()?.kernel.set_regime(self.handle, index)?;
        self.properties.initial_regime = Some(regime.to_string());
        Ok(())
    }

    /// Name of the active regime
    pub fn regime(&self) -> Result<String> {
        let index = self.live_controller()?.kernel.regime(self.handle)?;
        self.class
            .regime_name(index)
            .map(str::to_string)
            .ok_or_else(|| CellError::simulation_step(0.0, format!("regime index {} out of range", index)))
    }

    /// Record a send port, state variable, parameter or alias
    pub fn record(&self, port: &str) -> Result<()> {
        let name = self.class.built_name(port).to_string();
        let probe = if self.class.class().event_send_ports.contains_key(&name) {
            let threshold = self.spike_threshold(&name)?;
            Probe::Events { port: name, threshold }
        } else if self.class.is_recordable_value(&name) {
            Probe::Value(name)
        } else {
            return Err(CellError::attribute(self.class.name(), "send port or state", port));
        };
        self.start_recording(probe)
    }

    /// Record the active regime at every sample
    pub fn record_regime(&self) -> Result<()> {
        self.start_recording(Probe::Regime)
    }

    fn start_recording(&self, probe: Probe) -> Result<()> {
        let key = probe.key().to_string();
        self.live_controller()?.kernel.record(self.handle, probe)?;
        let mut record = self.record.lock();
        if !record.recorded.contains(&key) {
            record.recorded.push(key);
        }
        Ok(())
    }

    /// Threshold of a compartment spike detector on `port`: the emitting
    /// trigger solved for `v`
    fn spike_threshold(&self, port: &str) -> Result<Option<f64>> {
        if !self.class.is_full_cell() {
            return Ok(None);
        }
        let trigger = self
            .class
            .class()
            .regimes
            .values()
            .flat_map(|r| r.on_conditions.iter())
            .find(|oc| oc.output_events.iter().any(|e| e == port))
            .map(|oc| oc.trigger.clone());
        let Some(bound) = trigger.as_ref().and_then(solve_for_v) else {
            warn!("cannot derive a voltage threshold for '{}' of '{}'", port, self.class.name());
            return Ok(None);
        };
        let controller = self.live_controller()?;
        let units = self.class.units();
        let mut values: BTreeMap<String, f64> = BTreeMap::new();
        for name in bound.symbols() {
            if let Some(slot) = self.class.slot(&name) {
                values.insert(name, controller.kernel.get(self.handle, slot.index)?);
            } else if let Some(c) = self.class.class().constants.get(&name) {
                values.insert(name, units.scale_value(&Quantity::new(c.value, c.unit.clone()))?);
            }
        }
        match bound.eval(&|n| values.get(n).copied()) {
            Ok(threshold) => {
                debug!("spike threshold of '{}' is {} mV", port, threshold);
                Ok(Some(threshold))
            }
            Err(e) => {
                warn!("cannot evaluate the threshold of '{}': {}", port, e);
                Ok(None)
            }
        }
    }

    /// Recording of `port`, optionally from `t_start` (ms) on. Killed cells
    /// answer from the snapshot taken when their simulation ended.
    pub fn recording(&self, port: &str, t_start: Option<f64>) -> Result<Recording> {
        let key = if port == REGIME_RECORDING {
            port.to_string()
        } else {
            self.class.built_name(port).to_string()
        };
        let raw = {
            let record = self.record.lock();
            if !record.recorded.contains(&key) {
                return Err(CellError::attribute(self.class.name(), "recording", port));
            }
            if record.alive {
                drop(record);
                self.controller.lock().kernel.recording(self.handle, &key)?
            } else {
                record
                    .cache
                    .get(&key)
                    .cloned()
                    .ok_or_else(|| CellError::attribute(self.class.name(), "recording", port))?
            }
        };
        let recording = match raw {
            Recording::Analog(mut signal) => {
                if key != REGIME_RECORDING {
                    let dimension = self.class.dimension_of(&key).unwrap_or(Dimension::DIMENSIONLESS);
                    signal.unit = self.class.units().canonical_unit(dimension)?;
                }
                Recording::Analog(signal)
            }
            spikes => spikes,
        };
        match t_start {
            Some(t) => recording.trimmed(t),
            None => Ok(recording),
        }
    }

    /// Every recording, keyed by port
    pub fn recordings(&self, t_start: Option<f64>) -> Result<IndexMap<String, Recording>> {
        let keys = self.record.lock().recorded.clone();
        keys.into_iter()
            .filter(|k| k != REGIME_RECORDING)
            .map(|k| self.recording(&k, t_start).map(|r| (k, r)))
            .collect()
    }

    /// Periods spent in each regime
    pub fn regime_epochs(&self) -> Result<Vec<Epoch>> {
        let recording = self.recording(REGIME_RECORDING, None).map_err(|_| {
            CellError::RegimeTransitionsNotRecorded {
                cell: self.class.name().to_string(),
            }
        })?;
        let Recording::Analog(signal) = recording else {
            return Err(CellError::RegimeTransitionsNotRecorded {
                cell: self.class.name().to_string(),
            });
        };
        let t_stop = {
            let record = self.record.lock();
            record.t_stop
        };
        let t_stop = match t_stop {
            Some(t) => t,
            None => self.controller.lock().kernel.time(),
        };
        Ok(epochs(&signal, t_stop, |i| {
            self.class.regime_name(i).unwrap_or("unknown").to_string()
        }))
    }

    /// Play an analog signal or an event train into a port
    pub fn play(&self, port: &str, signal: &Recording, properties: &[(&str, Quantity)]) -> Result<()> {
        match signal {
            Recording::Analog(s) => self.play_analog(port, s),
            Recording::Spikes(train) => self.play_events(port, train, properties),
        }
    }

    /// Play an analog signal into a receive/reduce port or the injection
    /// channel
    pub fn play_analog(&self, port: &str, signal: &AnalogSignal) -> Result<()> {
        let class = self.class.class();
        let (target, dimension) = if self.class.external_currents().iter().any(|c| c == port) {
            (InputTarget::Injection, Dimension::CURRENT)
        } else if let Some(p) = class.analog_receive_ports.get(port) {
            (InputTarget::Port(port.to_string()), p.dimension)
        } else if let Some(p) = class.analog_reduce_ports.get(port) {
            (InputTarget::Port(port.to_string()), p.dimension)
        } else {
            return Err(CellError::attribute(self.class.name(), "analog receive port", port));
        };
        if signal.unit.dimension != dimension {
            return Err(CellError::Dimension {
                name: port.to_string(),
                expected: dimension.to_string(),
                found: signal.unit.dimension.to_string(),
            });
        }
        let native = signal.converted(&self.class.units().canonical_unit(dimension)?)?;
        let mut controller = self.live_controller()?;
        let (delay, t_start) = (controller.params.device_delay, controller.params.t_start);
        let shifted = native.t_start - delay;
        if shifted < t_start - TIME_EPSILON {
            return Err(CellError::usage(format!(
                "signal played into '{}' starts at {} ms, before the device delay ({} ms) has elapsed",
                port, native.t_start, delay
            )));
        }
        let delayed = AnalogSignal::new(shifted, native.interval, native.values, native.unit);
        controller
            .kernel
            .play(self.handle, target, Stimulus::Analog(delayed), delay)
    }

    /// Play events into an event receive port
    pub fn play_events(&self, port: &str, train: &SpikeTrain, properties: &[(&str, Quantity)]) -> Result<()> {
        if !self.class.class().event_receive_ports.contains_key(port) {
            return Err(CellError::attribute(self.class.name(), "event receive port", port));
        }
        let properties = native_properties(&self.class, properties)?;
        let mut controller = self.live_controller()?;
        let (delay, t_start) = (controller.params.device_delay, controller.params.t_start);
        let early: Vec<String> = train
            .times
            .iter()
            .filter(|t| **t - delay < t_start - TIME_EPSILON)
            .map(|t| t.to_string())
            .collect();
        if !early.is_empty() {
            return Err(CellError::usage(format!(
                "events at {} ms fall within the device delay ({} ms) and cannot be played into '{}'",
                early.join(", "),
                delay,
                port
            )));
        }
        controller.kernel.play(
            self.handle,
            InputTarget::Events(port.to_string()),
            Stimulus::Events {
                times: train.times.iter().map(|t| t - delay).collect(),
                properties,
            },
            delay,
        )
    }

    /// Connect `send_port` of this cell to `receive_port` of `target`
    pub fn connect(
        &self,
        target: &Cell,
        send_port: &str,
        receive_port: &str,
        delay: &Quantity,
        properties: &[(&str, Quantity)],
    ) -> Result<()> {
        if !Arc::ptr_eq(&self.controller, &target.controller) {
            return Err(CellError::usage("cannot connect cells of different simulations"));
        }
        let source = self.class.class();
        if !source.event_send_ports.contains_key(send_port) && !source.analog_send_ports.contains_key(send_port) {
            return Err(CellError::attribute(self.class.name(), "send port", send_port));
        }
        let receptor = receptor_index(target.class.class(), receive_port)
            .ok_or_else(|| CellError::attribute(target.class.name(), "receptor", receive_port))?;
        let delay = to_ms("delay", delay)?;
        if delay < 0.0 {
            return Err(CellError::usage(format!("negative delay {} ms", delay)));
        }
        let properties = native_properties(&target.class, properties)?;
        self.live_controller()?.kernel.connect(Connection {
            source: self.handle,
            send_port: send_port.to_string(),
            target: target.handle,
            receptor,
            delay,
            properties,
        })
    }

    /// Time the cell was created (ms)
    pub fn t_start(&self) -> f64 {
        self.t_start
    }
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("class", &self.class.name())
            .field("handle", &self.handle)
            .finish()
    }
}

fn check_dimension(name: &str, expected: Dimension, q: &Quantity) -> Result<()> {
    if q.dimension() == expected {
        Ok(())
    } else {
        Err(CellError::Dimension {
            name: name.to_string(),
            expected: expected.to_string(),
            found: q.dimension().to_string(),
        })
    }
}

/// Event properties scaled to native units; each names an analog receive port
fn native_properties(class: &CellClass, properties: &[(&str, Quantity)]) -> Result<Vec<(String, f64)>> {
    properties
        .iter()
        .map(|(name, q)| {
            let port = class
                .class()
                .analog_receive_ports
                .get(*name)
                .ok_or_else(|| CellError::attribute(class.name(), "analog receive port", *name))?;
            check_dimension(name, port.dimension, q)?;
            Ok((name.to_string(), class.units().scale_value(q)?))
        })
        .collect()
}

/// The bound `b` of a trigger `v > b` (or `b < v`)
pub fn solve_for_v(trigger: &Expr) -> Option<Expr> {
    match trigger {
        Expr::Binary(BinOp::Gt | BinOp::Ge, lhs, rhs) if lhs.as_sym() == Some("v") && !rhs.contains("v") => {
            Some((**rhs).clone())
        }
        Expr::Binary(BinOp::Lt | BinOp::Le, lhs, rhs) if rhs.as_sym() == Some("v") && !lhs.contains("v") => {
            Some((**lhs).clone())
        }
        Expr::Binary(BinOp::And, lhs, rhs) => solve_for_v(lhs).or_else(|| solve_for_v(rhs)),
        _ => None,
    }
}

/// Whether `name` is the implicit regime state of the event back-end
pub fn is_regime_state(name: &str) -> bool {
    name == REGIME_STATE
}
