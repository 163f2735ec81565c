//! CLI command implementations for nine

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::CliConfig;
use crate::error::CliResult;
use crate::workspace::Workspace;

pub mod build;
pub mod clean;
pub mod completions;
pub mod import;
pub mod inspect;

/// nine - 9ML code generation and simulator binding
#[derive(Parser, Debug)]
#[command(
    name = "nine",
    version,
    about = "Import, inspect and build 9ML spiking dynamics",
    long_about = "nine lifts NMODL mechanisms into abstract dynamics, rewrites them for the \
                  NEURON or NEST simulator and drives code generation, compilation and \
                  installation through a cached build directory."
)]
pub struct NineCli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Workspace directory (defaults to the enclosing nine.toml, else the current directory)
    #[arg(short, long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Configuration file path
    #[arg(short, long, global = true, env = "NINE_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import NMODL mechanisms as JSON dynamics documents
    Import(import::ImportCommand),

    /// Generate, compile and install a cell class
    Build(build::BuildCommand),

    /// Print the textual form of a dynamics document
    #[command(alias = "show")]
    Inspect(inspect::InspectCommand),

    /// Remove the build base directory
    Clean(clean::CleanCommand),

    /// Generate shell completions
    Completions(completions::CompletionsCommand),
}

/// Settings every command runs with
#[derive(Debug, Clone)]
pub struct Context {
    /// Enclosing workspace
    pub workspace: Workspace,
    /// User configuration
    pub config: CliConfig,
}

impl Context {
    /// Open the workspace and load the user configuration
    pub fn load(workspace: Option<PathBuf>, config: Option<PathBuf>) -> CliResult<Self> {
        Ok(Self {
            workspace: Workspace::open(workspace)?,
            config: CliConfig::load(config.as_deref())?,
        })
    }

    /// Whether progress bars are wanted
    pub fn show_progress(&self) -> bool {
        self.config.preferences.show_progress && console::Term::stderr().is_term()
    }
}

impl NineCli {
    /// Execute the CLI command
    pub async fn execute(self) -> CliResult<()> {
        let Self {
            workspace,
            config,
            command,
            ..
        } = self;
        // completions need neither workspace nor configuration
        let context = || -> CliResult<Context> {
            let context = Context::load(workspace, config)?;
            console::set_colors_enabled(context.config.preferences.use_colors);
            Ok(context)
        };

        match command {
            Commands::Import(cmd) => cmd.execute(&context()?).await,
            Commands::Build(cmd) => cmd.execute(&context()?).await,
            Commands::Inspect(cmd) => cmd.execute(&context()?),
            Commands::Clean(cmd) => cmd.execute(&context()?),
            Commands::Completions(cmd) => cmd.execute(),
        }
    }
}
