//! Build a dynamics document for one back-end with the system toolchain

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use clap::Args;
use console::style;
use nine_codegen::{
    BackendKind, BuildMode, BuildOutcome, BuildRequest, Driver, Registrar, Registration, SystemToolchain,
};
use tracing::{info, warn};

use crate::document::ModelDocument;
use crate::error::CliResult;

use super::Context;

/// Generate, compile and install a cell class
#[derive(Args, Debug)]
pub struct BuildCommand {
    /// Dynamics document (JSON)
    pub input: PathBuf,

    /// Target simulator
    #[arg(short, long)]
    pub backend: Option<BackendKind>,

    /// Reuse policy: lazy, force, purge, require, build_only or generate_only
    #[arg(short, long)]
    pub mode: Option<BuildMode>,

    /// Source URL deciding the build directory (defaults to the input path)
    #[arg(long)]
    pub url: Option<String>,

    /// Explicit build directory
    #[arg(long)]
    pub build_dir: Option<PathBuf>,

    /// Parallel compile jobs
    #[arg(long)]
    pub cores: Option<usize>,

    /// Build option override, e.g. nest.ode_solver=cvode (repeatable)
    #[arg(short = 'O', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,
}

/// Registrar that reports the installed library instead of loading it;
/// loading only makes sense inside a simulator process
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOnly;

impl Registrar for ReportOnly {
    fn register(&self, library: &Path, module: Option<&str>) -> nine_codegen::Result<Registration> {
        if !library.exists() {
            warn!("{} was not produced", library.display());
        }
        Ok(Registration {
            library: library.to_path_buf(),
            module: module.map(str::to_string),
        })
    }
}

impl BuildCommand {
    pub async fn execute(self, context: &Context) -> CliResult<()> {
        let document = ModelDocument::read(&self.input)?;
        let backend = context.workspace.backend(&context.config, self.backend)?;
        let mode = context.workspace.mode(&context.config, self.mode);
        let mut options = context.workspace.build_options(&context.config, &self.options)?;
        if let Some(cores) = self.cores {
            options.build_cores = cores;
        }
        let url = match &self.url {
            Some(url) => url.clone(),
            None => std::fs::canonicalize(&self.input)?.to_string_lossy().into_owned(),
        };
        info!("Building '{}' for {} ({})", document.dynamics.name, backend, mode);

        let build_dir = self.build_dir.clone();
        let outcome = tokio::task::spawn_blocking(move || -> CliResult<BuildOutcome> {
            let driver = Driver::new(SystemToolchain, ReportOnly);
            let mut request = BuildRequest::new(&document.dynamics, backend, &options)
                .with_mode(mode)
                .with_url(&url);
            if let Some(dir) = build_dir {
                request = request.with_build_dir(dir);
            }
            Ok(driver.build(&request)?)
        })
        .await
        .map_err(|e| anyhow!(e))??;

        report(&outcome);
        Ok(())
    }
}

fn report(outcome: &BuildOutcome) {
    let plan = &outcome.plan;
    let steps: Vec<&str> = [
        (plan.purge, "purge"),
        (plan.generate, "generate"),
        (plan.compile, "compile"),
    ]
    .into_iter()
    .filter_map(|(on, name)| on.then_some(name))
    .collect();
    println!("{} {}", style("class").bold(), outcome.class.name);
    println!("{} {}", style("build dir").bold(), outcome.layout.build_dir.display());
    if steps.is_empty() {
        println!("{} reused cached sources and artifacts", style("steps").bold());
    } else {
        println!("{} {}", style("steps").bold(), steps.join(", "));
    }
    for file in &outcome.generated {
        println!("  {} {}", style("+").green(), file.display());
    }
    if let Some(registration) = &outcome.registration {
        match &registration.module {
            Some(module) => println!("{} {} ({})", style("library").bold(), registration.library.display(), module),
            None => println!("{} {}", style("library").bold(), registration.library.display()),
        }
    }
}
