//! The simulator seam. A kernel owns cell instances created from loaded cell
//! classes and advances them in time. All values crossing this trait are in
//! the back-end's native units (see `nine_codegen::UnitHandler`), times in ms.

use std::sync::Arc;

use nine_codegen::BackendKind;

use crate::cell::CellClass;
use crate::error::Result;
use crate::signal::{AnalogSignal, Recording};

/// Index of a cell instance within its kernel
pub type CellHandle = usize;

/// Where a played signal goes
#[derive(Debug, Clone, PartialEq)]
pub enum InputTarget {
    /// Analog receive or reduce port
    Port(String),
    /// The membrane injection channel of an ODE cell
    Injection,
    /// Event receive port
    Events(String),
}

/// Input played into a cell
#[derive(Debug, Clone, PartialEq)]
pub enum Stimulus {
    /// Sampled values in native units
    Analog(AnalogSignal),
    /// Event times with the receive-port values each event carries
    Events {
        /// Event times (ms)
        times: Vec<f64>,
        /// Native values set on analog receive ports when an event arrives
        properties: Vec<(String, f64)>,
    },
}

/// What a recorder watches
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    /// A parameter, state, alias or analog send port
    Value(String),
    /// An event send port; `threshold` switches to upward crossings of `v`
    Events {
        /// Event send port
        port: String,
        /// Native voltage threshold
        threshold: Option<f64>,
    },
    /// Index of the active regime
    Regime,
}

impl Probe {
    /// Key the recording is stored under
    pub fn key(&self) -> &str {
        match self {
            Probe::Value(name) => name,
            Probe::Events { port, .. } => port,
            Probe::Regime => crate::REGIME_RECORDING,
        }
    }
}

/// A connection between two cells of one kernel
#[derive(Debug, Clone, PartialEq)]
pub struct Connection {
    /// Sending cell
    pub source: CellHandle,
    /// Send port on the sending cell
    pub send_port: String,
    /// Receiving cell
    pub target: CellHandle,
    /// Receptor index of the receive port
    pub receptor: usize,
    /// Transmission delay (ms)
    pub delay: f64,
    /// Native values set on the receiver's analog receive ports per event
    pub properties: Vec<(String, f64)>,
}

/// A simulator able to host cells of built classes
pub trait Kernel: Send {
    /// Back-end dialect the kernel understands
    fn backend(&self) -> BackendKind;

    /// Discard all cells and restart the clock
    fn reset(&mut self, t_start: f64, dt: f64) -> Result<()>;

    /// Allocate an instance of `class`
    fn create(&mut self, class: Arc<CellClass>) -> Result<CellHandle>;

    /// Native value of a parameter or state slot
    fn get(&self, cell: CellHandle, slot: usize) -> Result<f64>;

    /// Write a parameter or state slot
    fn set(&mut self, cell: CellHandle, slot: usize, value: f64) -> Result<()>;

    /// Switch the active regime
    fn set_regime(&mut self, cell: CellHandle, index: usize) -> Result<()>;

    /// Index of the active regime
    fn regime(&self, cell: CellHandle) -> Result<usize>;

    /// Start recording
    fn record(&mut self, cell: CellHandle, probe: Probe) -> Result<()>;

    /// Play a stimulus into a cell through a device that delays it by
    /// `delay` ms
    fn play(&mut self, cell: CellHandle, target: InputTarget, stimulus: Stimulus, delay: f64) -> Result<()>;

    /// Connect a send port of one cell to a receptor of another
    fn connect(&mut self, connection: Connection) -> Result<()>;

    /// Advance to `t_stop`
    fn run(&mut self, t_stop: f64) -> Result<()>;

    /// Current time
    fn time(&self) -> f64;

    /// Recording stored under `key`, in native units
    fn recording(&self, cell: CellHandle, key: &str) -> Result<Recording>;
}
