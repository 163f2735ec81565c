//! Shell completion scripts

use clap::{Args, CommandFactory};
use clap_complete::Shell;

use crate::error::CliResult;

use super::NineCli;

/// Generate shell completions
#[derive(Args, Debug)]
pub struct CompletionsCommand {
    /// Target shell
    pub shell: Shell,
}

impl CompletionsCommand {
    pub fn execute(self) -> CliResult<()> {
        let mut command = NineCli::command();
        let name = command.get_name().to_string();
        clap_complete::generate(self.shell, &mut command, name, &mut std::io::stdout());
        Ok(())
    }
}
