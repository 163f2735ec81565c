//! NMODL import: one file, or every `.mod` file below a directory

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::document::ModelDocument;
use crate::error::{CliError, CliResult};

use super::Context;

/// Import NMODL mechanisms as JSON dynamics documents
#[derive(Args, Debug)]
pub struct ImportCommand {
    /// Mechanism file or directory of mechanisms
    pub input: PathBuf,

    /// Output file (single input) or directory (directory input);
    /// defaults to writing next to each mechanism
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Keep importing after a mechanism fails
    #[arg(long)]
    pub keep_going: bool,
}

/// One mechanism to import and where its document goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportJob {
    /// Mechanism file
    pub source: PathBuf,
    /// Document to write
    pub target: PathBuf,
}

impl ImportCommand {
    pub async fn execute(self, context: &Context) -> CliResult<()> {
        let jobs = self.jobs()?;
        if jobs.is_empty() {
            return Err(CliError::missing_resource(format!(
                "no .mod files below {}",
                self.input.display()
            )));
        }
        info!("Importing {} mechanism(s)", jobs.len());

        let progress = if context.show_progress() && jobs.len() > 1 {
            let bar = ProgressBar::new(jobs.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:40.cyan/blue} {pos}/{len} {msg}")
                    .map_err(|e| anyhow!(e))?,
            );
            bar
        } else {
            ProgressBar::hidden()
        };

        let mut tasks = JoinSet::new();
        for job in jobs.iter().cloned() {
            tasks.spawn_blocking(move || {
                let result = import_one(&job);
                (job, result)
            });
        }

        let mut failed = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let (job, result) = joined.map_err(|e| anyhow!(e))?;
            progress.inc(1);
            match result {
                Ok(name) => {
                    progress.set_message(name.clone());
                    info!("{} -> {} ({})", job.source.display(), job.target.display(), name);
                }
                Err(e) if self.keep_going => {
                    failed += 1;
                    warn!("{}: {}", job.source.display(), e);
                }
                Err(e) => {
                    tasks.abort_all();
                    progress.abandon();
                    return Err(CliError::Generic(anyhow!("{}: {}", job.source.display(), e)));
                }
            }
        }
        progress.finish_and_clear();

        if failed > 0 {
            return Err(CliError::Generic(anyhow!(
                "{} of {} mechanisms failed to import",
                failed,
                jobs.len()
            )));
        }
        Ok(())
    }

    /// Mechanisms to import with their output paths
    pub fn jobs(&self) -> CliResult<Vec<ImportJob>> {
        if !self.input.exists() {
            return Err(CliError::missing_resource(self.input.display().to_string()));
        }
        if self.input.is_file() {
            let target = self
                .output
                .clone()
                .unwrap_or_else(|| self.input.with_extension("json"));
            return Ok(vec![ImportJob {
                source: self.input.clone(),
                target,
            }]);
        }

        let mut jobs = Vec::new();
        for entry in WalkDir::new(&self.input).sort_by_file_name() {
            let entry = entry.map_err(|e| anyhow!(e))?;
            let path = entry.path();
            if !entry.file_type().is_file() || path.extension().map_or(true, |ext| ext != "mod") {
                continue;
            }
            let relative = path.strip_prefix(&self.input).unwrap_or(path);
            let target = match &self.output {
                Some(dir) => dir.join(relative).with_extension("json"),
                None => path.with_extension("json"),
            };
            debug!("queued {}", path.display());
            jobs.push(ImportJob {
                source: path.to_path_buf(),
                target,
            });
        }
        Ok(jobs)
    }
}

/// Import one mechanism and write its document; returns the class name
fn import_one(job: &ImportJob) -> CliResult<String> {
    let imported = nine_import::import_file(&job.source)?;
    let name = imported.dynamics.name.clone();
    let document = ModelDocument {
        dynamics: imported.dynamics,
        properties: Some(imported.properties),
        source: Some(display_path(&job.source)),
    };
    document.write(&job.target)?;
    Ok(name)
}

fn display_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(input: &Path, output: Option<PathBuf>) -> ImportCommand {
        ImportCommand {
            input: input.to_path_buf(),
            output,
            keep_going: false,
        }
    }

    #[test]
    fn directories_are_walked_for_mechanisms() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("channels")).unwrap();
        std::fs::write(dir.path().join("leak.mod"), "").unwrap();
        std::fs::write(dir.path().join("channels").join("kdr.mod"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let jobs = command(dir.path(), None).jobs().unwrap();
        let sources: Vec<_> = jobs.iter().map(|j| j.source.strip_prefix(dir.path()).unwrap().to_path_buf()).collect();
        assert_eq!(sources, vec![PathBuf::from("channels/kdr.mod"), PathBuf::from("leak.mod")]);
        assert_eq!(jobs[1].target, dir.path().join("leak.json"));

        let out = dir.path().join("out");
        let jobs = command(dir.path(), Some(out.clone())).jobs().unwrap();
        assert_eq!(jobs[0].target, out.join("channels").join("kdr.json"));
    }

    #[test]
    fn single_files_honour_the_output_path() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("leak.mod");
        std::fs::write(&file, "").unwrap();
        let target = dir.path().join("custom.json");
        let jobs = command(&file, Some(target.clone())).jobs().unwrap();
        assert_eq!(jobs, vec![ImportJob { source: file, target }]);
    }

    #[test]
    fn missing_inputs_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = command(&dir.path().join("nope"), None).jobs().unwrap_err();
        assert!(matches!(err, CliError::MissingResource(_)), "unexpected error: {}", err);
    }
}
