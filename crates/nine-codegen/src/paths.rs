//! Deterministic build directory layout.

use std::path::{Component, Path, PathBuf};

/// File inside `src/` holding the class the sources were generated from
pub const SENTINEL: &str = "built_component_class";

/// Domain string for content hashes of unnamed dynamics
const HASH_CONTEXT: &str = "nine 2024 build directory of an unnamed dynamics";

/// Directories of one build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLayout {
    /// Root of this build
    pub build_dir: PathBuf,
    /// Generated sources
    pub src_dir: PathBuf,
    /// Configure/compile working directory
    pub compile_dir: PathBuf,
    /// Installed artifacts
    pub install_dir: PathBuf,
}

impl BuildLayout {
    /// Standard `src/`, `cmpl/`, `install/` layout
    pub fn standard(build_dir: impl Into<PathBuf>) -> Self {
        let build_dir = build_dir.into();
        Self {
            src_dir: build_dir.join("src"),
            compile_dir: build_dir.join("cmpl"),
            install_dir: build_dir.join("install"),
            build_dir,
        }
    }

    /// Sentinel file of the build
    pub fn sentinel(&self) -> PathBuf {
        self.src_dir.join(SENTINEL)
    }
}

/// Default root of all build trees: `~/.nine/build/v<version>`
pub fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".nine")
        .join("build")
        .join(format!("v{}", crate::VERSION))
}

/// Directory segment identifying the source of a dynamics.
///
/// File URLs and plain paths map to `file/<absolute path>`, web URLs to
/// `url/<host>/<path>`, both without extension. With no URL the first 16 hex
/// digits of a keyed blake3 hash of `content` are used under `generated/`.
pub fn url_build_path(url: Option<&str>, content: &[u8]) -> PathBuf {
    let Some(url) = url else {
        let mut hasher = blake3::Hasher::new_derive_key(HASH_CONTEXT);
        hasher.update(content);
        let hex = hasher.finalize().to_hex();
        return PathBuf::from("generated").join(&hex.as_str()[..16]);
    };
    if let Some(rest) = url.strip_prefix("http://").or_else(|| url.strip_prefix("https://")) {
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let mut out = PathBuf::from("url").join(host);
        out.push(relative_without_extension(Path::new(path)));
        return out;
    }
    let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    };
    PathBuf::from("file").join(relative_without_extension(&absolute))
}

fn relative_without_extension(path: &Path) -> PathBuf {
    let stripped = path.with_extension("");
    stripped
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect()
}

/// Platform variable searched for shared libraries
pub fn library_path_variable() -> &'static str {
    if cfg!(target_os = "macos") {
        "DYLD_LIBRARY_PATH"
    } else if cfg!(windows) {
        "PATH"
    } else {
        "LD_LIBRARY_PATH"
    }
}

/// Append `dir` to the library search variable unless already present
pub fn append_library_path(dir: &Path) -> bool {
    append_to_path_variable(library_path_variable(), dir)
}

/// Append `dir` to a separator-delimited path variable unless already present
pub fn append_to_path_variable(var: &str, dir: &Path) -> bool {
    let current = std::env::var_os(var).unwrap_or_default();
    let mut entries: Vec<PathBuf> = std::env::split_paths(&current)
        .filter(|p| !p.as_os_str().is_empty())
        .collect();
    if entries.iter().any(|e| e == dir) {
        return false;
    }
    entries.push(dir.to_path_buf());
    match std::env::join_paths(entries) {
        Ok(joined) => {
            std::env::set_var(var, joined);
            log::debug!("appended {} to {}", dir.display(), var);
            true
        }
        Err(e) => {
            log::warn!("cannot append {} to {}: {}", dir.display(), var, e);
            false
        }
    }
}
