//! nine CLI crate
//!
//! Purpose:
//! - Provide a command-line front end to the 9ML build pipeline: NMODL import,
//!   inspection of dynamics documents (optionally after the back-end rewrite),
//!   cached builds for NEURON and NEST, and build directory cleanup.
//!
//! Major commands (see [commands]):
//! - import: NMODL file or directory → JSON dynamics documents, concurrently, with progress.
//! - build: document → generated, compiled and installed cell class (system toolchain, no load).
//! - inspect: textual or JSON form, `--transform` to show the rewritten class.
//! - clean: remove the build base directory after confirmation.
//! - completions: shell completion scripts.
//!
//! Settings are layered: user configuration (`~/.config/nine/config.toml`), then the
//! enclosing workspace's `nine.toml`, then command-line flags.

pub mod commands;
pub mod config;
pub mod document;
pub mod error;
pub mod workspace;

pub use commands::NineCli;
