//! Simulation context: owns the kernel, tracks the cells created in it and
//! enforces one active simulation per process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::{debug, info, warn};
use nine_codegen::BackendKind;
use nine_dynamics::{Dimension, Quantity, Unit};
use parking_lot::Mutex;

use crate::cell::CellRecord;
use crate::error::{CellError, Result};
use crate::kernel::Kernel;

/// Set while any simulation is active in this process
static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Milliseconds, the time unit of every kernel
pub(crate) fn ms() -> Unit {
    Unit::new("ms", Dimension::TIME, -3)
}

/// Value of a time quantity in ms
pub(crate) fn to_ms(name: &str, q: &Quantity) -> Result<f64> {
    if q.dimension() != Dimension::TIME {
        return Err(CellError::Dimension {
            name: name.to_string(),
            expected: Dimension::TIME.to_string(),
            found: q.dimension().to_string(),
        });
    }
    Ok(q.value_in(&ms())?)
}

/// Simulation parameters
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationParams {
    /// Time step (ms)
    pub dt: f64,
    /// Start time (ms)
    pub t_start: f64,
    /// Delay of the devices that play signals into cells (ms). Played
    /// inputs are shifted back by it so their effect lands on time.
    pub device_delay: f64,
}

impl Default for SimulationParams {
    fn default() -> Self {
        Self {
            dt: 0.1,
            t_start: 0.0,
            device_delay: 0.0,
        }
    }
}

impl SimulationParams {
    /// Create parameters from time quantities
    pub fn new(dt: &Quantity, t_start: &Quantity) -> Result<Self> {
        let params = Self {
            dt: to_ms("dt", dt)?,
            t_start: to_ms("t_start", t_start)?,
            device_delay: 0.0,
        };
        params.validate()?;
        Ok(params)
    }

    /// Parameters with time step `dt` ms starting at zero
    pub fn with_dt(dt: f64) -> Result<Self> {
        let params = Self {
            dt,
            ..Self::default()
        };
        params.validate()?;
        Ok(params)
    }

    /// Use a device delay of `delay` ms
    pub fn with_device_delay(mut self, delay: f64) -> Result<Self> {
        self.device_delay = delay;
        self.validate()?;
        Ok(self)
    }

    /// Validate parameters
    pub fn validate(&self) -> Result<()> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(CellError::usage(format!("dt must be positive (got {} ms)", self.dt)));
        }
        if !self.t_start.is_finite() {
            return Err(CellError::usage("t_start must be finite"));
        }
        if !(self.device_delay >= 0.0) || !self.device_delay.is_finite() {
            return Err(CellError::usage(format!(
                "device delay must not be negative (got {} ms)",
                self.device_delay
            )));
        }
        Ok(())
    }
}

/// State shared between a simulation and the cells created in it
pub(crate) struct Controller {
    pub(crate) kernel: Box<dyn Kernel>,
    pub(crate) params: SimulationParams,
    pub(crate) active: bool,
    cells: Vec<Weak<Mutex<CellRecord>>>,
}

impl Controller {
    pub(crate) fn register(&mut self, record: &Arc<Mutex<CellRecord>>) {
        self.cells.retain(|w| w.strong_count() > 0);
        self.cells.push(Arc::downgrade(record));
    }

    pub(crate) fn require_active(&self) -> Result<()> {
        if self.active {
            Ok(())
        } else {
            Err(CellError::lifecycle("the simulation is not active"))
        }
    }
}

/// Explicit simulation context threaded through cell construction
pub struct Simulation {
    controller: Arc<Mutex<Controller>>,
    backend: BackendKind,
}

impl Simulation {
    /// Wrap a kernel; the simulation starts inactive
    pub fn new(kernel: impl Kernel + 'static, params: SimulationParams) -> Result<Self> {
        params.validate()?;
        let backend = kernel.backend();
        Ok(Self {
            controller: Arc::new(Mutex::new(Controller {
                kernel: Box::new(kernel),
                params,
                active: false,
                cells: Vec::new(),
            })),
            backend,
        })
    }

    /// Run `body` inside an activated simulation. Cells are killed on
    /// success; after an error they are left alive for inspection.
    pub fn scoped<T>(
        kernel: impl Kernel + 'static,
        params: SimulationParams,
        body: impl FnOnce(&Simulation) -> Result<T>,
    ) -> Result<T> {
        let sim = Self::new(kernel, params)?;
        sim.activate()?;
        let result = body(&sim);
        match &result {
            Ok(_) => sim.deactivate()?,
            Err(e) => {
                warn!("not killing cells after error: {}", e);
                sim.release(false);
            }
        }
        result
    }

    /// Enter the simulation; fails while another one is active
    pub fn activate(&self) -> Result<()> {
        let mut controller = self.controller.lock();
        if controller.active {
            return Err(CellError::lifecycle("the simulation is already active"));
        }
        if ACTIVE
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CellError::lifecycle(
                "another simulation is active in this process",
            ));
        }
        let (t_start, dt) = (controller.params.t_start, controller.params.dt);
        if let Err(e) = controller.kernel.reset(t_start, dt) {
            ACTIVE.store(false, Ordering::SeqCst);
            return Err(e);
        }
        controller.cells.clear();
        controller.active = true;
        info!("activated {} simulation (dt = {} ms)", self.backend, dt);
        Ok(())
    }

    /// Leave the simulation, snapshotting every live cell's recordings
    pub fn deactivate(&self) -> Result<()> {
        {
            let controller = self.controller.lock();
            controller.require_active()?;
        }
        self.release(true);
        Ok(())
    }

    fn release(&self, kill_cells: bool) {
        let mut controller = self.controller.lock();
        if !controller.active {
            return;
        }
        let t_stop = controller.kernel.time();
        let cells = std::mem::take(&mut controller.cells);
        if kill_cells {
            for record in cells.iter().filter_map(Weak::upgrade) {
                record.lock().kill(t_stop, controller.kernel.as_ref());
            }
            debug!("killed {} cells at t = {} ms", cells.len(), t_stop);
        }
        controller.active = false;
        ACTIVE.store(false, Ordering::SeqCst);
        info!("deactivated simulation at t = {} ms", t_stop);
    }

    /// Whether the simulation is active
    pub fn is_active(&self) -> bool {
        self.controller.lock().active
    }

    /// Advance to `t_stop`
    pub fn run(&self, t_stop: &Quantity) -> Result<()> {
        self.run_ms(to_ms("t_stop", t_stop)?)
    }

    /// Advance to `t_stop` ms
    pub fn run_ms(&self, t_stop: f64) -> Result<()> {
        let mut controller = self.controller.lock();
        controller.require_active()?;
        let t = controller.kernel.time();
        if t_stop < t {
            return Err(CellError::usage(format!(
                "cannot run back to {} ms from {} ms",
                t_stop, t
            )));
        }
        info!("running from {} ms to {} ms", t, t_stop);
        controller.kernel.run(t_stop)
    }

    /// Current time (ms)
    pub fn t(&self) -> f64 {
        self.controller.lock().kernel.time()
    }

    /// Parameters
    pub fn params(&self) -> SimulationParams {
        self.controller.lock().params.clone()
    }

    /// Back-end of the kernel
    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub(crate) fn controller(&self) -> &Arc<Mutex<Controller>> {
        &self.controller
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        self.release(true);
    }
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("backend", &self.backend)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulation_params_default() {
        let params = SimulationParams::default();
        assert!(params.validate().is_ok());
        assert!(params.dt > 0.0);
    }

    #[test]
    fn test_simulation_params_validation() {
        assert!(SimulationParams::with_dt(0.0).is_err());
        assert!(SimulationParams::with_dt(-0.1).is_err());
        assert!(SimulationParams::with_dt(f64::NAN).is_err());
        assert!(SimulationParams::with_dt(0.01).is_ok());
    }

    #[test]
    fn test_simulation_params_conversions() {
        let dt = Quantity::new(10.0, Unit::parse("us").unwrap());
        let start = Quantity::new(0.5, Unit::parse("s").unwrap());
        let params = SimulationParams::new(&dt, &start).unwrap();
        assert!((params.dt - 0.01).abs() < 1e-12);
        assert!((params.t_start - 500.0).abs() < 1e-9);

        let wrong = Quantity::new(1.0, Unit::parse("mV").unwrap());
        let err = SimulationParams::new(&wrong, &start).unwrap_err();
        assert!(matches!(err, CellError::Dimension { .. }), "unexpected error: {}", err);
    }
}
