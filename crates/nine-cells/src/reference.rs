//! In-process reference kernel.
//!
//! Interprets the rewritten class directly: fixed-step RK4 in the back-end's
//! native units, events delivered at step boundaries, on-conditions checked
//! after every step. It stands in for a loaded simulator when none is
//! available and backs the behavioural tests of the cell layer.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, trace};
use nine_codegen::transform::event::REGIME_STATE;
use nine_codegen::transform::ode::{CLAMP_VOLTAGE, MEMBRANE_CURRENT};
use nine_codegen::transform::receptor_index;
use nine_codegen::BackendKind;
use nine_dynamics::{Dimension, Expr, Quantity, Regime, Unit};

use crate::cell::CellClass;
use crate::error::{CellError, Result};
use crate::kernel::{CellHandle, Connection, InputTarget, Kernel, Probe, Stimulus};
use crate::signal::{AnalogSignal, Recording, SpikeTrain};

/// Events due within this distance of a step boundary are delivered on it
const TIME_EPSILON: f64 = 1e-9;

const MAX_ALIAS_DEPTH: usize = 64;

/// Default transition cascade limit per step
pub const DEFAULT_MAX_TRANSITIONS: usize = 1000;

/// An event waiting for its delivery time
#[derive(Debug, Clone)]
struct PendingEvent {
    time: f64,
    target: CellHandle,
    port: String,
    properties: Vec<(String, f64)>,
}

/// A connection resolved against the receiving class
#[derive(Debug, Clone)]
struct Link {
    connection: Connection,
    port: String,
    analog: bool,
}

#[derive(Debug, Clone)]
struct Recorder {
    probe: Probe,
    t_start: Option<f64>,
    samples: Vec<f64>,
    events: Vec<f64>,
}

#[derive(Debug)]
struct Instance {
    class: Arc<CellClass>,
    values: Vec<f64>,
    regime: usize,
    regime_slot: Option<usize>,
    v_slot: Option<usize>,
    clamp_slot: Option<usize>,
    cm_slot: Option<usize>,
    constants: BTreeMap<String, f64>,
    inputs: BTreeMap<String, f64>,
    injection: f64,
    analog_plays: Vec<(InputTarget, AnalogSignal)>,
    recorders: Vec<Recorder>,
    previous_v: Option<f64>,
    /// Trigger values of the active regime's on-conditions at the last check
    triggers: Vec<bool>,
}

/// Symbol lookup over one instance at one point of a step
struct Env<'a> {
    instance: &'a Instance,
    values: &'a [f64],
    regime: &'a Regime,
    t: f64,
}

impl Env<'_> {
    fn value(&self, name: &str, depth: usize) -> Option<f64> {
        if name == "t" {
            return Some(self.t);
        }
        if let Some(slot) = self.instance.class.slot(name) {
            return self.values.get(slot.index).copied();
        }
        if let Some(v) = self.instance.inputs.get(name) {
            return Some(*v);
        }
        if let Some(v) = self.instance.constants.get(name) {
            return Some(*v);
        }
        if depth > MAX_ALIAS_DEPTH {
            return None;
        }
        let alias = self
            .regime
            .aliases
            .get(name)
            .or_else(|| self.instance.class.class().aliases.get(name))?;
        alias.rhs.eval(&|n| self.value(n, depth + 1)).ok()
    }

    fn eval(&self, e: &Expr) -> nine_dynamics::Result<f64> {
        e.eval(&|n| self.value(n, 0))
    }
}

impl Instance {
    fn new(class: Arc<CellClass>) -> Result<Self> {
        let units = class.units();
        let mut constants = BTreeMap::new();
        for c in class.class().constants.values() {
            constants.insert(c.name.clone(), units.scale_value(&Quantity::new(c.value, c.unit.clone()))?);
        }
        let mut inputs = BTreeMap::new();
        for name in class
            .class()
            .analog_receive_ports
            .keys()
            .chain(class.class().analog_reduce_ports.keys())
        {
            inputs.insert(name.clone(), 0.0);
        }
        let full_cell = class.is_full_cell();
        let slot_of = |name: &str| class.slot(name).map(|s| s.index);
        Ok(Self {
            values: vec![0.0; class.slot_names().len()],
            regime: 0,
            regime_slot: slot_of(REGIME_STATE),
            v_slot: if full_cell { slot_of("v") } else { None },
            clamp_slot: if full_cell { slot_of(CLAMP_VOLTAGE) } else { None },
            cm_slot: if full_cell {
                class.membrane_capacitance().and_then(slot_of)
            } else {
                None
            },
            constants,
            inputs,
            injection: 0.0,
            analog_plays: Vec::new(),
            recorders: Vec::new(),
            previous_v: None,
            triggers: Vec::new(),
            class,
        })
    }

    fn checked_class(&self) -> Result<Arc<CellClass>> {
        if self.regime >= self.class.class().regimes.len() {
            return Err(CellError::usage(format!(
                "regime index {} out of range for '{}'",
                self.regime,
                self.class.name()
            )));
        }
        Ok(Arc::clone(&self.class))
    }

    fn set_regime(&mut self, index: usize) {
        self.regime = index;
        // conditions already true on entry fire at the next check
        self.triggers.clear();
        if let Some(slot) = self.regime_slot {
            self.values[slot] = index as f64;
        }
    }

    fn env<'a>(&'a self, values: &'a [f64], regime: &'a Regime, t: f64) -> Env<'a> {
        Env {
            instance: self,
            values,
            regime,
            t,
        }
    }

    fn is_clamped(&self, regime: &Regime) -> bool {
        self.clamp_slot.is_some()
            && regime
                .aliases
                .get(MEMBRANE_CURRENT)
                .or_else(|| self.class.class().aliases.get(MEMBRANE_CURRENT))
                .map_or(false, |a| a.rhs.contains(CLAMP_VOLTAGE))
    }

    /// Slots integrated in `regime` with their derivatives at `values`
    fn derivatives(&self, regime: &Regime, values: &[f64], t: f64) -> Result<Vec<(usize, f64)>> {
        let env = self.env(values, regime, t);
        let fail = |e: nine_dynamics::DynamicsError| CellError::simulation_step(t, format!("{}: {}", self.class.name(), e));
        let mut out = Vec::with_capacity(regime.time_derivatives.len() + 1);
        for (state, rhs) in &regime.time_derivatives {
            let slot = self
                .class
                .slot(state)
                .ok_or_else(|| CellError::attribute(self.class.name(), "state", state))?;
            out.push((slot.index, env.eval(rhs).map_err(fail)?));
        }
        if let (Some(v), Some(cm)) = (self.v_slot, self.cm_slot) {
            if !self.is_clamped(regime) {
                let current = env
                    .value(MEMBRANE_CURRENT, 0)
                    .ok_or_else(|| CellError::simulation_step(t, format!("cannot evaluate {}", MEMBRANE_CURRENT)))?;
                out.push((v, (self.injection - current) / values[cm]));
            }
        }
        Ok(out)
    }

    /// One RK4 step over `[t, t + dt]`
    fn integrate(&mut self, t: f64, dt: f64) -> Result<()> {
        let class = self.checked_class()?;
        let regime = &class.class().regimes[self.regime];
        let k1 = self.derivatives(regime, &self.values, t)?;
        if k1.is_empty() {
            self.hold_clamp(regime);
            return Ok(());
        }
        let shifted = |k: &[(usize, f64)], h: f64| {
            let mut v = self.values.clone();
            for (i, d) in k {
                v[*i] += h * d;
            }
            v
        };
        let k2 = self.derivatives(regime, &shifted(&k1, dt / 2.0), t + dt / 2.0)?;
        let k3 = self.derivatives(regime, &shifted(&k2, dt / 2.0), t + dt / 2.0)?;
        let k4 = self.derivatives(regime, &shifted(&k3, dt), t + dt)?;
        for n in 0..k1.len() {
            let (i, a) = k1[n];
            let increment = dt / 6.0 * (a + 2.0 * k2[n].1 + 2.0 * k3[n].1 + k4[n].1);
            self.values[i] += increment;
        }
        self.hold_clamp(regime);
        Ok(())
    }

    fn hold_clamp(&mut self, regime: &Regime) {
        if self.is_clamped(regime) {
            if let (Some(v), Some(clamp)) = (self.v_slot, self.clamp_slot) {
                self.values[v] = self.values[clamp];
            }
        }
    }

    /// Apply assignments evaluated against the pre-transition state, switch
    /// regime and return the emitted ports
    fn fire(
        &mut self,
        assignments: &indexmap::IndexMap<String, Expr>,
        outputs: &[String],
        target: Option<&str>,
        regime: &Regime,
        t: f64,
    ) -> Result<Vec<String>> {
        let env = self.env(&self.values, regime, t);
        let mut updates = Vec::with_capacity(assignments.len());
        for (state, rhs) in assignments {
            let slot = self
                .class
                .slot(state)
                .ok_or_else(|| CellError::attribute(self.class.name(), "state", state))?;
            let value = env
                .eval(rhs)
                .map_err(|e| CellError::simulation_step(t, format!("{}: {}", self.class.name(), e)))?;
            updates.push((slot.index, value));
        }
        for (index, value) in updates {
            self.values[index] = value;
        }
        if let Some(name) = target {
            let index = self
                .class
                .regime_index(name)
                .ok_or_else(|| CellError::attribute(self.class.name(), "regime", name))?;
            trace!("'{}' enters '{}' at {} ms", self.class.name(), name, t);
            self.set_regime(index);
        }
        Ok(outputs.to_vec())
    }

    /// Handle an event arriving on `port`
    fn receive(&mut self, port: &str, properties: &[(String, f64)], t: f64) -> Result<Vec<String>> {
        for (name, value) in properties {
            self.inputs.insert(name.clone(), *value);
        }
        let class = self.checked_class()?;
        let regime = &class.class().regimes[self.regime];
        let mut emitted = Vec::new();
        for oe in regime.on_events.iter().filter(|oe| oe.src_port == port) {
            emitted.extend(self.fire(
                &oe.state_assignments,
                &oe.output_events,
                oe.target_regime.as_deref(),
                regime,
                t,
            )?);
            if oe.target_regime.is_some() {
                break;
            }
        }
        Ok(emitted)
    }

    /// Fire on-conditions whose trigger turned true, cascading through
    /// regime changes until the state settles
    fn transitions(&mut self, t: f64, limit: usize) -> Result<Vec<String>> {
        let mut emitted = Vec::new();
        let mut count = 0usize;
        loop {
            let class = self.checked_class()?;
            let regime = &class.class().regimes[self.regime];
            let mut now = Vec::with_capacity(regime.on_conditions.len());
            {
                let env = self.env(&self.values, regime, t);
                for oc in &regime.on_conditions {
                    let value = env
                        .eval(&oc.trigger)
                        .map_err(|e| CellError::simulation_step(t, format!("{}: {}", self.class.name(), e)))?;
                    now.push(value != 0.0);
                }
            }
            self.triggers.resize(now.len(), false);
            let fired = (0..now.len()).find(|i| now[*i] && !self.triggers[*i]);
            let Some(i) = fired else {
                self.triggers = now;
                return Ok(emitted);
            };
            // later conditions keep their old value so they can still fire
            self.triggers[..=i].copy_from_slice(&now[..=i]);
            count += 1;
            if count > limit {
                return Err(CellError::simulation_step(
                    t,
                    format!(
                        "more than {} simultaneous transitions in '{}'",
                        limit,
                        self.class.name()
                    ),
                ));
            }
            let oc = &regime.on_conditions[i];
            emitted.extend(self.fire(
                &oc.state_assignments,
                &oc.output_events,
                oc.target_regime.as_deref(),
                regime,
                t,
            )?);
        }
    }

    /// Sample every recorder, or with `fresh_only` just the ones that have
    /// not started yet
    fn sample(&mut self, t: f64, fresh_only: bool) -> Result<()> {
        let class = self.checked_class()?;
        let regime = &class.class().regimes[self.regime];
        let mut samples = Vec::with_capacity(self.recorders.len());
        {
            let env = self.env(&self.values, regime, t);
            for r in &self.recorders {
                if fresh_only && r.t_start.is_some() {
                    samples.push(None);
                    continue;
                }
                samples.push(match &r.probe {
                    Probe::Value(name) => Some(env.value(name, 0).ok_or_else(|| {
                        CellError::simulation_step(t, format!("cannot evaluate '{}' of '{}'", name, self.class.name()))
                    })?),
                    Probe::Regime => Some(self.regime as f64),
                    Probe::Events { .. } => None,
                });
            }
        }
        let v = self.v_slot.map(|i| self.values[i]);
        for (r, sample) in self.recorders.iter_mut().zip(samples) {
            if fresh_only && r.t_start.is_some() {
                continue;
            }
            if r.t_start.is_none() {
                r.t_start = Some(t);
            }
            if let Some(value) = sample {
                r.samples.push(value);
            }
        }
        if !fresh_only {
            self.previous_v = v;
        }
        Ok(())
    }

    /// Upward threshold crossings of `v` since the last sample, before any
    /// transition resets it
    fn detect_crossings(&mut self, t: f64) {
        let (Some(v), Some(prev)) = (self.v_slot.map(|i| self.values[i]), self.previous_v) else {
            return;
        };
        for r in &mut self.recorders {
            if let Probe::Events { threshold: Some(theta), .. } = &r.probe {
                if prev < *theta && v >= *theta {
                    r.events.push(t);
                }
            }
        }
    }

    fn note_emitted(&mut self, port: &str, t: f64) {
        for r in &mut self.recorders {
            if let Probe::Events { port: p, threshold: None } = &r.probe {
                if p == port {
                    r.events.push(t);
                }
            }
        }
    }
}

/// Fixed-step interpreter of rewritten classes
#[derive(Debug)]
pub struct ReferenceKernel {
    backend: BackendKind,
    t_start: f64,
    dt: f64,
    steps: u64,
    max_transitions: usize,
    cells: Vec<Instance>,
    links: Vec<Link>,
    queue: Vec<PendingEvent>,
}

impl ReferenceKernel {
    /// Kernel interpreting classes built for `backend`
    pub fn new(backend: BackendKind) -> Self {
        Self {
            backend,
            t_start: 0.0,
            dt: 0.1,
            steps: 0,
            max_transitions: DEFAULT_MAX_TRANSITIONS,
            cells: Vec::new(),
            links: Vec::new(),
            queue: Vec::new(),
        }
    }

    /// Set the transition cascade limit
    pub fn with_max_transitions(mut self, limit: usize) -> Self {
        self.max_transitions = limit;
        self
    }

    /// Number of cells
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    fn instance(&self, cell: CellHandle) -> Result<&Instance> {
        self.cells
            .get(cell)
            .ok_or_else(|| CellError::usage(format!("no cell with handle {}", cell)))
    }

    fn instance_mut(&mut self, cell: CellHandle) -> Result<&mut Instance> {
        self.cells
            .get_mut(cell)
            .ok_or_else(|| CellError::usage(format!("no cell with handle {}", cell)))
    }

    fn route(&mut self, source: CellHandle, ports: Vec<String>, t: f64) {
        for port in ports {
            self.cells[source].note_emitted(&port, t);
            for link in self.links.iter().filter(|l| {
                !l.analog && l.connection.source == source && l.connection.send_port == port
            }) {
                self.queue.push(PendingEvent {
                    time: t + link.connection.delay,
                    target: link.connection.target,
                    port: link.port.clone(),
                    properties: link.connection.properties.clone(),
                });
            }
        }
    }

    fn apply_analog_inputs(&mut self, t: f64) -> Result<()> {
        // values sent over analog links, read before any input changes
        let mut sent = Vec::new();
        for link in self.links.iter().filter(|l| l.analog) {
            let source = &self.cells[link.connection.source];
            let class = source.checked_class()?;
            let regime = &class.class().regimes[source.regime];
            let value = source
                .env(&source.values, regime, t)
                .value(&link.connection.send_port, 0)
                .ok_or_else(|| CellError::simulation_step(t, format!("cannot evaluate '{}'", link.connection.send_port)))?;
            sent.push((link.connection.target, link.port.clone(), value));
        }
        for cell in &mut self.cells {
            for port in cell.class.class().analog_reduce_ports.keys() {
                cell.inputs.insert(port.clone(), 0.0);
            }
            cell.injection = 0.0;
            for (target, signal) in &cell.analog_plays {
                let value = signal.value_at(t).unwrap_or(0.0);
                match target {
                    InputTarget::Injection => cell.injection += value,
                    InputTarget::Port(port) if cell.class.class().analog_reduce_ports.contains_key(port) => {
                        *cell.inputs.entry(port.clone()).or_insert(0.0) += value;
                    }
                    InputTarget::Port(port) => {
                        cell.inputs.insert(port.clone(), value);
                    }
                    InputTarget::Events(_) => {}
                }
            }
        }
        for (target, port, value) in sent {
            *self.cells[target].inputs.entry(port).or_insert(0.0) += value;
        }
        Ok(())
    }

    fn deliver_due(&mut self, t: f64) -> Result<()> {
        let mut due: Vec<PendingEvent> = Vec::new();
        self.queue.retain(|e| {
            if e.time <= t + TIME_EPSILON {
                due.push(e.clone());
                false
            } else {
                true
            }
        });
        due.sort_by(|a, b| a.time.total_cmp(&b.time));
        for event in due {
            let emitted = self.cells[event.target].receive(&event.port, &event.properties, t)?;
            self.route(event.target, emitted, t);
        }
        Ok(())
    }

    fn step(&mut self) -> Result<()> {
        let t = self.time();
        self.apply_analog_inputs(t)?;
        self.deliver_due(t)?;
        for cell in &mut self.cells {
            cell.integrate(t, self.dt)?;
        }
        self.steps += 1;
        let t = self.time();
        for cell in &mut self.cells {
            cell.detect_crossings(t);
        }
        for handle in 0..self.cells.len() {
            let emitted = self.cells[handle].transitions(t, self.max_transitions)?;
            self.route(handle, emitted, t);
        }
        for cell in &mut self.cells {
            cell.sample(t, false)?;
        }
        Ok(())
    }
}

impl Kernel for ReferenceKernel {
    fn backend(&self) -> BackendKind {
        self.backend
    }

    fn reset(&mut self, t_start: f64, dt: f64) -> Result<()> {
        self.t_start = t_start;
        self.dt = dt;
        self.steps = 0;
        self.cells.clear();
        self.links.clear();
        self.queue.clear();
        debug!("reference kernel reset to {} ms (dt = {} ms)", t_start, dt);
        Ok(())
    }

    fn create(&mut self, class: Arc<CellClass>) -> Result<CellHandle> {
        if class.backend() != self.backend {
            return Err(CellError::usage(format!(
                "'{}' targets {}, not {}",
                class.name(),
                class.backend(),
                self.backend
            )));
        }
        self.cells.push(Instance::new(class)?);
        Ok(self.cells.len() - 1)
    }

    fn get(&self, cell: CellHandle, slot: usize) -> Result<f64> {
        let instance = self.instance(cell)?;
        instance
            .values
            .get(slot)
            .copied()
            .ok_or_else(|| CellError::usage(format!("slot {} out of range", slot)))
    }

    fn set(&mut self, cell: CellHandle, slot: usize, value: f64) -> Result<()> {
        let instance = self.instance_mut(cell)?;
        let target = instance
            .values
            .get_mut(slot)
            .ok_or_else(|| CellError::usage(format!("slot {} out of range", slot)))?;
        *target = value;
        Ok(())
    }

    fn set_regime(&mut self, cell: CellHandle, index: usize) -> Result<()> {
        let instance = self.instance_mut(cell)?;
        if index >= instance.class.class().regimes.len() {
            return Err(CellError::usage(format!("regime index {} out of range", index)));
        }
        instance.set_regime(index);
        Ok(())
    }

    fn regime(&self, cell: CellHandle) -> Result<usize> {
        Ok(self.instance(cell)?.regime)
    }

    fn record(&mut self, cell: CellHandle, probe: Probe) -> Result<()> {
        let instance = self.instance_mut(cell)?;
        if instance.recorders.iter().any(|r| r.probe.key() == probe.key()) {
            return Ok(());
        }
        instance.recorders.push(Recorder {
            probe,
            t_start: None,
            samples: Vec::new(),
            events: Vec::new(),
        });
        Ok(())
    }

    fn play(&mut self, cell: CellHandle, target: InputTarget, stimulus: Stimulus, delay: f64) -> Result<()> {
        self.instance(cell)?;
        match (target, stimulus) {
            (InputTarget::Events(port), Stimulus::Events { times, properties }) => {
                for time in times {
                    self.queue.push(PendingEvent {
                        time: time + delay,
                        target: cell,
                        port: port.clone(),
                        properties: properties.clone(),
                    });
                }
                Ok(())
            }
            (target @ (InputTarget::Port(_) | InputTarget::Injection), Stimulus::Analog(signal)) => {
                let delayed = AnalogSignal::new(signal.t_start + delay, signal.interval, signal.values, signal.unit);
                self.instance_mut(cell)?.analog_plays.push((target, delayed));
                Ok(())
            }
            (target, _) => Err(CellError::usage(format!("stimulus does not fit {:?}", target))),
        }
    }

    fn connect(&mut self, connection: Connection) -> Result<()> {
        let source = self.instance(connection.source)?;
        let analog = source.class.class().analog_send_ports.contains_key(&connection.send_port);
        let target = self.instance(connection.target)?.class.class();
        let port = target
            .analog_reduce_ports
            .keys()
            .chain(target.event_receive_ports.keys())
            .find(|p| receptor_index(target, p) == Some(connection.receptor))
            .cloned()
            .ok_or_else(|| CellError::usage(format!("no receptor {} on '{}'", connection.receptor, target.name)))?;
        if analog != target.analog_reduce_ports.contains_key(&port) {
            return Err(CellError::usage(format!(
                "cannot connect '{}' to '{}'",
                connection.send_port, port
            )));
        }
        self.links.push(Link {
            connection,
            port,
            analog,
        });
        Ok(())
    }

    fn run(&mut self, t_stop: f64) -> Result<()> {
        let t = self.time();
        for cell in &mut self.cells {
            cell.sample(t, true)?;
            if cell.previous_v.is_none() {
                cell.previous_v = cell.v_slot.map(|i| cell.values[i]);
            }
        }
        let n = ((t_stop - t) / self.dt - TIME_EPSILON).ceil().max(0.0) as u64;
        for _ in 0..n {
            self.step()?;
        }
        Ok(())
    }

    fn time(&self) -> f64 {
        self.t_start + self.steps as f64 * self.dt
    }

    fn recording(&self, cell: CellHandle, key: &str) -> Result<Recording> {
        let instance = self.instance(cell)?;
        let recorder = instance
            .recorders
            .iter()
            .find(|r| r.probe.key() == key)
            .ok_or_else(|| CellError::attribute(instance.class.name(), "recording", key))?;
        let t_start = recorder.t_start.unwrap_or_else(|| self.time());
        Ok(match &recorder.probe {
            Probe::Events { .. } => Recording::Spikes(SpikeTrain::new(recorder.events.clone(), t_start, self.time())),
            Probe::Regime => Recording::Analog(AnalogSignal::new(
                t_start,
                self.dt,
                recorder.samples.clone(),
                Unit::dimensionless(),
            )),
            Probe::Value(name) => {
                let dimension = instance.class.dimension_of(name).unwrap_or(Dimension::DIMENSIONLESS);
                let unit = instance.class.units().canonical_unit(dimension)?;
                Recording::Analog(AnalogSignal::new(t_start, self.dt, recorder.samples.clone(), unit))
            }
        })
    }
}
