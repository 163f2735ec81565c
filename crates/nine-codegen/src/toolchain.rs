//! External processes and library registration.
//!
//! Both are traits so the driver can be exercised without a simulator
//! installation: tests substitute recording fakes.

use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::process::Command;

use log::{debug, info};

use crate::error::{PipelineError, Result};

/// Captured result of one process invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal
    pub status: Option<i32>,
    /// Standard output, lossily decoded
    pub stdout: String,
    /// Standard error, lossily decoded
    pub stderr: String,
}

impl CommandOutput {
    /// Successful exit with the given output
    pub fn ok(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    /// Exit status was zero
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs build utilities
pub trait Toolchain {
    /// Run `program` with `args` in `cwd`, capturing its output
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput>;
}

/// Toolchain spawning real processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolchain;

impl Toolchain for SystemToolchain {
    fn run(&self, program: &str, args: &[String], cwd: &Path) -> Result<CommandOutput> {
        info!("running {} {} in {}", program, args.join(" "), cwd.display());
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .map_err(|e| PipelineError::Toolchain {
                program: program.to_string(),
                reason: e.to_string(),
            })?;
        let out = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!("{} exited with {:?}", program, out.status);
        Ok(out)
    }
}

/// A library made available to the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// Shared library that was registered
    pub library: PathBuf,
    /// Simulator module to install from it, if the back-end has modules
    pub module: Option<String>,
}

/// Hands a compiled library to the simulator
pub trait Registrar {
    /// Register `library`, optionally naming the module it provides
    fn register(&self, library: &Path, module: Option<&str>) -> Result<Registration>;
}

/// Registrar that `dlopen`s the library into the current process with
/// global symbol visibility, as the simulators expect of mechanism libraries
#[derive(Debug, Clone, Copy, Default)]
pub struct DlopenRegistrar;

impl Registrar for DlopenRegistrar {
    fn register(&self, library: &Path, module: Option<&str>) -> Result<Registration> {
        let fail = |reason: String| PipelineError::Registration {
            library: library.display().to_string(),
            reason,
        };
        let text = library
            .to_str()
            .ok_or_else(|| fail("path is not valid UTF-8".to_string()))?;
        let c_path = CString::new(text).map_err(|e| fail(e.to_string()))?;
        // never closed: mechanisms live as long as the process
        let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_NOW | libc::RTLD_GLOBAL) };
        if handle.is_null() {
            let reason = unsafe {
                let err = libc::dlerror();
                if err.is_null() {
                    "dlopen failed".to_string()
                } else {
                    std::ffi::CStr::from_ptr(err).to_string_lossy().into_owned()
                }
            };
            return Err(fail(reason));
        }
        info!("registered {}", library.display());
        Ok(Registration {
            library: library.to_path_buf(),
            module: module.map(str::to_string),
        })
    }
}
