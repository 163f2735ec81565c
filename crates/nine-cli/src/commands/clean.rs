//! Build directory removal

use clap::Args;
use dialoguer::Confirm;
use tracing::info;

use crate::error::{CliError, CliResult};

use super::Context;

/// Remove the build base directory
#[derive(Args, Debug)]
pub struct CleanCommand {
    /// Do not ask for confirmation
    #[arg(short, long)]
    pub yes: bool,
}

impl CleanCommand {
    pub fn execute(self, context: &Context) -> CliResult<()> {
        let options = context.workspace.build_options(&context.config, &[])?;
        let base = options
            .base_dir
            .clone()
            .unwrap_or_else(nine_codegen::paths::default_base_dir);
        if !base.exists() {
            info!("Nothing to clean at {}", base.display());
            return Ok(());
        }
        if !self.yes {
            let confirmed = Confirm::new()
                .with_prompt(format!("Remove {} and everything below it?", base.display()))
                .default(false)
                .interact()
                .map_err(|e| CliError::Generic(e.into()))?;
            if !confirmed {
                return Err(CliError::Cancelled);
            }
        }
        std::fs::remove_dir_all(&base)?;
        info!("Removed {}", base.display());
        Ok(())
    }
}
