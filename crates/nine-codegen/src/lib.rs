#![doc = "Build pipeline turning abstract dynamics into loadable NEURON and NEST cell classes\n\nPublic responsibilities:\n- Unit handling (units): dimension to back-end unit strings and value scaling\n- Template rendering (render): switchable include paths and back-end snippets\n- Build-mode gate (gate): sentinel comparison deciding what to regenerate\n- Transform-for-build (transform): pass pipelines for the ODE (NEURON) and event (NEST) variants\n- Back-ends (backend): source generation, configure, compile and load per simulator\n- Driver (driver): the ordered build of one class\n\nToolchain processes and library registration sit behind the `Toolchain` and\n`Registrar` traits so every step can be exercised without a simulator.\n"]
#![deny(missing_docs)]

pub mod backend;
pub mod driver;
pub mod error;
pub mod gate;
pub mod options;
pub mod paths;
pub mod render;
pub mod toolchain;
pub mod transform;
pub mod units;

pub use backend::{list_backends, Backend, BackendKind, BackendSpec};
pub use driver::{BuildOutcome, BuildRequest, Driver};
pub use error::{PipelineError, Result};
pub use gate::{BuildMode, BuildPlan, CacheStatus};
pub use options::{BuildOptions, NestOptions, NestSolver, NeuronOptions};
pub use paths::BuildLayout;
pub use toolchain::{CommandOutput, DlopenRegistrar, Registrar, Registration, SystemToolchain, Toolchain};
pub use transform::transform_for_build;
pub use units::UnitHandler;

/// Pipeline version, stamped on every generated class
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
