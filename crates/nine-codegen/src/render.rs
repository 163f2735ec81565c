//! Template rendering with switch-dependent include search paths.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::path::{Path, PathBuf};

use log::debug;
use minijinja::value::Rest;
use minijinja::{Environment, ErrorKind, UndefinedBehavior, Value};

use crate::error::{PipelineError, Result};

/// Back-end code snippet callable from templates, e.g. a random draw
pub type Snippet = fn(&[String]) -> String;

/// Renders named templates from a base directory
#[derive(Debug, Clone)]
pub struct TemplateRenderer {
    base: PathBuf,
    switches: BTreeMap<String, Option<String>>,
    snippets: BTreeMap<&'static str, Snippet>,
}

impl TemplateRenderer {
    /// Renderer rooted at `base`
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            switches: BTreeMap::new(),
            snippets: BTreeMap::new(),
        }
    }

    /// Set a switch; `None` leaves it out of the search path
    pub fn with_switch(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.switches.insert(name.into(), value.map(str::to_string));
        self
    }

    /// Expose snippets as template functions
    pub fn with_snippets(mut self, snippets: &[(&'static str, Snippet)]) -> Self {
        self.snippets.extend(snippets.iter().copied());
        self
    }

    /// Template root
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Directories searched, in order
    pub fn search_paths(&self) -> Vec<PathBuf> {
        let includes = self.base.join("includes");
        let mut paths = vec![self.base.clone(), includes.clone()];
        for (name, value) in &self.switches {
            if let Some(value) = value {
                paths.push(includes.join(name).join(value));
            }
        }
        paths.push(includes.join("default"));
        paths
    }

    fn environment(&self) -> Environment<'static> {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.set_keep_trailing_newline(true);
        let paths = self.search_paths();
        env.set_loader(move |name| {
            for dir in &paths {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return std::fs::read_to_string(&candidate).map(Some).map_err(|e| {
                        minijinja::Error::new(
                            ErrorKind::InvalidOperation,
                            format!("cannot read {}: {}", candidate.display(), e),
                        )
                    });
                }
            }
            Ok(None)
        });
        for (name, snippet) in &self.snippets {
            let f = *snippet;
            env.add_function(*name, move |args: Rest<Value>| -> String {
                let printed: Vec<String> = args.0.iter().map(|a| a.to_string()).collect();
                f(&printed)
            });
        }
        env
    }

    /// Render `template` with `context`
    pub fn render(&self, template: &str, context: Value) -> Result<String> {
        let includes = self.base.join("includes");
        for (name, value) in &self.switches {
            if let Some(value) = value {
                if !includes.join(name).join(value).is_dir() {
                    return Err(PipelineError::render(template, format!("no templates for {} '{}'", name, value)));
                }
            }
        }
        let env = self.environment();
        let tmpl = env
            .get_template(template)
            .map_err(|e| PipelineError::render(template, describe(&e)))?;
        tmpl.render(context)
            .map_err(|e| PipelineError::render(template, describe(&e)))
    }

    /// Render `template` into `dir/filename`, then apply literal substitutions
    pub fn render_to_file(
        &self,
        template: &str,
        context: Value,
        dir: &Path,
        filename: &str,
        post_subs: &[(&str, &str)],
    ) -> Result<PathBuf> {
        let mut contents = self.render(template, context)?;
        for (old, new) in post_subs {
            contents = contents.replace(old, new);
        }
        let path = dir.join(filename);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, contents)?;
        debug!("rendered {} -> {}", template, path.display());
        Ok(path)
    }
}

fn describe(err: &minijinja::Error) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::context;

    fn write(path: &Path, text: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, text).unwrap();
    }

    #[test]
    fn switch_directories_take_precedence_over_default() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path();
        write(&base.join("main.tmpl"), "{% include 'solver.tmpl' %}");
        write(&base.join("includes/default/solver.tmpl"), "default");
        write(&base.join("includes/ode_solver/cvode/solver.tmpl"), "cvode");

        let r = TemplateRenderer::new(base).with_switch("ode_solver", Some("cvode"));
        assert_eq!(r.render("main.tmpl", context! {}).unwrap(), "cvode");

        let r = TemplateRenderer::new(base).with_switch("ode_solver", None);
        assert_eq!(r.render("main.tmpl", context! {}).unwrap(), "default");

        let r = TemplateRenderer::new(base).with_switch("ode_solver", Some("euler"));
        let msg = r.render("main.tmpl", context! {}).unwrap_err().to_string();
        assert!(msg.contains("ode_solver 'euler'"), "unexpected error: {}", msg);
    }

    #[test]
    fn undefined_variables_fail() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("t.tmpl"), "{{ missing }}");
        let err = TemplateRenderer::new(dir.path())
            .render("t.tmpl", context! {})
            .unwrap_err();
        assert!(matches!(err, PipelineError::Render { .. }));
    }

    #[test]
    fn snippets_and_substitutions() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("t.tmpl"), "x = {{ uniform('a', 'b') }}; OLD\n");
        fn uniform(args: &[String]) -> String {
            format!("draw_uniform({})", args.join(", "))
        }
        let r = TemplateRenderer::new(dir.path()).with_snippets(&[("uniform", uniform as Snippet)]);
        let out = dir.path().join("out");
        let path = r
            .render_to_file("t.tmpl", context! {}, &out, "t.c", &[("OLD", "NEW")])
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x = draw_uniform(a, b); NEW\n");
    }
}
