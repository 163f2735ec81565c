//! The build driver: transform, gate, generate, configure, compile, load.

use std::path::{Path, PathBuf};

use log::{debug, info};
use nine_dynamics::Dynamics;

use crate::backend::{self, BackendKind};
use crate::error::Result;
use crate::gate::{self, BuildMode, BuildPlan};
use crate::options::BuildOptions;
use crate::paths::BuildLayout;
use crate::toolchain::{DlopenRegistrar, Registrar, Registration, SystemToolchain, Toolchain};
use crate::transform::transform_for_build;

/// One request to turn a dynamics class into a loadable artifact
#[derive(Debug, Clone)]
pub struct BuildRequest<'a> {
    /// Class as written by the user; never modified
    pub dynamics: &'a Dynamics,
    /// Target back-end
    pub backend: BackendKind,
    /// Reuse policy
    pub mode: BuildMode,
    /// Where the class came from; decides the build directory
    pub url: Option<&'a str>,
    /// Explicit build directory, bypassing the derived one
    pub build_dir: Option<PathBuf>,
    /// Build options
    pub options: &'a BuildOptions,
}

impl<'a> BuildRequest<'a> {
    /// Lazy request with default placement
    pub fn new(dynamics: &'a Dynamics, backend: BackendKind, options: &'a BuildOptions) -> Self {
        Self {
            dynamics,
            backend,
            mode: BuildMode::default(),
            url: None,
            build_dir: None,
            options,
        }
    }

    /// Set the build mode
    pub fn with_mode(mut self, mode: BuildMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the source URL
    pub fn with_url(mut self, url: &'a str) -> Self {
        self.url = Some(url);
        self
    }

    /// Set an explicit build directory
    pub fn with_build_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.build_dir = Some(dir.into());
        self
    }
}

/// What a build did
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    /// The class after the back-end rewrite
    pub class: Dynamics,
    /// Directories used
    pub layout: BuildLayout,
    /// Steps the gate asked for
    pub plan: BuildPlan,
    /// Files rendered, empty when sources were reused
    pub generated: Vec<PathBuf>,
    /// Registration, when the artifact was loaded
    pub registration: Option<Registration>,
}

/// Runs builds with a toolchain and a registrar
#[derive(Debug, Default)]
pub struct Driver<T = SystemToolchain, R = DlopenRegistrar> {
    toolchain: T,
    registrar: R,
}

impl Driver {
    /// Driver spawning real processes and `dlopen`ing the results
    pub fn system() -> Self {
        Self::new(SystemToolchain, DlopenRegistrar)
    }
}

impl<T: Toolchain, R: Registrar> Driver<T, R> {
    /// Driver over the given toolchain and registrar
    pub fn new(toolchain: T, registrar: R) -> Self {
        Self { toolchain, registrar }
    }

    /// Toolchain in use
    pub fn toolchain(&self) -> &T {
        &self.toolchain
    }

    /// Registrar in use
    pub fn registrar(&self) -> &R {
        &self.registrar
    }

    /// Build directory a request resolves to
    pub fn build_dir(&self, request: &BuildRequest<'_>) -> Result<PathBuf> {
        match &request.build_dir {
            Some(dir) => Ok(dir.clone()),
            None => backend::build_dir(request.dynamics, request.backend, request.url, request.options),
        }
    }

    /// Run a build request to completion
    pub fn build(&self, request: &BuildRequest<'_>) -> Result<BuildOutcome> {
        let backend = backend::backend(request.backend);
        let options = request.options;
        // the gate compares against the rewritten class, so this always runs
        let class = transform_for_build(request.dynamics, request.backend, options)?;
        let layout = backend.layout(&self.build_dir(request)?);
        let plan = gate::plan(request.mode, &layout, &class)?;
        info!(
            "{} build of '{}' in {} ({:?})",
            request.backend,
            class.name,
            layout.build_dir.display(),
            plan
        );

        if plan.purge {
            remove_dir(&layout.src_dir)?;
            remove_dir(&layout.compile_dir)?;
            remove_dir(&layout.install_dir)?;
        }

        let mut generated = Vec::new();
        if plan.generate {
            reset_dir(&layout.src_dir)?;
            generated = backend.generate_source(&class, &layout, options)?;
            std::fs::write(layout.sentinel(), gate::sentinel_json(&class)?)?;
            debug!("wrote sentinel {}", layout.sentinel().display());
        }

        if plan.compile {
            if layout.compile_dir != layout.src_dir {
                reset_dir(&layout.compile_dir)?;
            }
            backend.configure(&class, &layout, options, &self.toolchain)?;
            remove_dir(&layout.install_dir)?;
            backend.compile(&class, &layout, options, &self.toolchain)?;
        }

        let registration = if plan.load {
            Some(backend.load(&class, &layout, &self.registrar)?)
        } else {
            None
        };

        Ok(BuildOutcome {
            class,
            layout,
            plan,
            generated,
            registration,
        })
    }
}

fn remove_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => {
            debug!("removed {}", dir.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn reset_dir(dir: &Path) -> Result<()> {
    remove_dir(dir)?;
    std::fs::create_dir_all(dir)?;
    Ok(())
}

/// Build with the system toolchain and registrar
pub fn build(request: &BuildRequest<'_>) -> Result<BuildOutcome> {
    Driver::system().build(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("src");
        std::fs::create_dir_all(target.join("nested")).unwrap();
        std::fs::write(target.join("stale.mod"), "x").unwrap();
        reset_dir(&target).unwrap();
        assert!(target.is_dir());
        assert_eq!(std::fs::read_dir(&target).unwrap().count(), 0);
        remove_dir(&dir.path().join("absent")).unwrap();
    }
}
