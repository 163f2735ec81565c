//! Cell binding layer for built 9ML classes
//!
//! A [`CellClass`] wraps a dynamics class rewritten for one back-end; a
//! [`Cell`] is an instance of it inside an active [`Simulation`]. Cells expose
//! one attribute, recording and input API whatever simulator hosts them: values
//! cross the API as dimensioned quantities and are converted to the
//! simulator's native units at the [`Kernel`] seam.

#![deny(missing_docs)]
#![warn(clippy::all)]

// Core modules
pub mod cell;
pub mod error;
pub mod kernel;
pub mod reference;
pub mod signal;
pub mod simulation;

// Re-export essential types
pub use cell::{Cell, CellClass, Section, Slot, SlotKind};
pub use error::{CellError, Result};
pub use kernel::{CellHandle, Connection, InputTarget, Kernel, Probe, Stimulus};
pub use reference::ReferenceKernel;
pub use signal::{AnalogSignal, Epoch, Recording, SpikeTrain};
pub use simulation::{Simulation, SimulationParams};

/// Key under which the active regime index is recorded
pub const REGIME_RECORDING: &str = "__regime__";
