//! Dynamics inspection

use std::path::PathBuf;

use clap::Args;
use nine_codegen::{transform_for_build, BackendKind};
use tracing::info;

use crate::document::ModelDocument;
use crate::error::CliResult;

use super::Context;

/// Print a dynamics document
#[derive(Args, Debug)]
pub struct InspectCommand {
    /// Dynamics document (JSON)
    pub input: PathBuf,

    /// Show the class as rewritten for this back-end
    #[arg(short, long)]
    pub transform: Option<BackendKind>,

    /// Build option override applied to the rewrite (repeatable)
    #[arg(short = 'O', long = "option", value_name = "KEY=VALUE")]
    pub options: Vec<String>,

    /// Print JSON instead of the textual form
    #[arg(long)]
    pub json: bool,
}

impl InspectCommand {
    pub fn execute(self, context: &Context) -> CliResult<()> {
        let document = ModelDocument::read(&self.input)?;
        let dynamics = match self.transform {
            Some(backend) => {
                let options = context.workspace.build_options(&context.config, &self.options)?;
                info!("Rewriting '{}' for {}", document.dynamics.name, backend);
                transform_for_build(&document.dynamics, backend, &options)?
            }
            None => document.dynamics,
        };
        if self.json {
            println!("{}", serde_json::to_string_pretty(&dynamics)?);
        } else {
            print!("{}", dynamics.to_text());
        }
        if let (None, Some(properties)) = (self.transform, &document.properties) {
            if !self.json && !properties.values.is_empty() {
                println!();
                for (name, value) in properties.values.iter().chain(properties.initial_values.iter()) {
                    println!("{} = {} {}", name, value.value, value.unit.name);
                }
            }
        }
        Ok(())
    }
}
