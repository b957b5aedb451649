//! Layered build environments
//!
//! Commands run with the parent process environment at the bottom,
//! build-file variables over it, profile or function variables over
//! those, and finally the build-injected `FABRIQ_*` variables. Later
//! layers win on key collision.
//!
//! Values and command tokens may reference `${NAME}` placeholders,
//! merged before execution, and `$((command))` subshell markers whose
//! captured stdout is substituted in place by the builder.

use regex_lite::Regex;
use std::collections::HashMap;
use std::io::{BufRead, Write};
use thiserror::Error;

/// Errors from environment composition
#[derive(Debug, Error)]
pub enum EnvError {
    #[error("environment variable '{0}' is not defined")]
    Undefined(String),

    #[error("cannot read variable '{0}' from the terminal: {1}")]
    Prompt(String, std::io::Error),
}

/// A flat environment variable map with layered composition.
#[derive(Debug, Clone, Default)]
pub struct Envar {
    vars: HashMap<String, String>,
}

impl Envar {
    /// An empty environment.
    pub fn new() -> Self {
        Self::default()
    }

    /// The parent process environment.
    pub fn from_process() -> Self {
        Self {
            vars: std::env::vars().collect(),
        }
    }

    /// Wrap an existing map.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self { vars }
    }

    /// Layer `other` on top of this environment; `other` wins on
    /// collision.
    pub fn append(mut self, other: &HashMap<String, String>) -> Self {
        for (k, v) in other {
            self.vars.insert(k.clone(), v.clone());
        }
        self
    }

    /// Merge another environment in place; `other` wins on collision.
    pub fn merge(&mut self, other: &Envar) {
        for (k, v) in &other.vars {
            self.vars.insert(k.clone(), v.clone());
        }
    }

    /// Set a single variable.
    pub fn set(&mut self, key: &str, value: &str) {
        self.vars.insert(key.to_string(), value.to_string());
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Borrow the underlying map.
    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    /// `KEY=value` pairs for handing to a child process.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }

    /// Replace `${NAME}` placeholders in `text` with values from this
    /// environment. An undefined name is an error in non-interactive
    /// mode and prompted for on the terminal in interactive mode (the
    /// answer is recorded so it is asked once). `FABRIQ_*` names are
    /// build-injected and resolve to the empty string when absent.
    pub fn merge_placeholders(&mut self, text: &str, interactive: bool) -> Result<String, EnvError> {
        let expr = Regex::new(r"\$\{(.*?)\}").expect("placeholder pattern");
        let mut result = text.to_string();
        // collect first, then substitute, so the borrow on `result`
        // does not overlap the prompt writes
        let names: Vec<String> = expr
            .captures_iter(text)
            .map(|c| c[1].to_string())
            .collect();
        for name in names {
            let value = match self.vars.get(&name) {
                Some(v) => v.clone(),
                None if name.starts_with("FABRIQ_") => String::new(),
                None if interactive => {
                    let v = prompt(&name).map_err(|e| EnvError::Prompt(name.clone(), e))?;
                    self.vars.insert(name.clone(), v.clone());
                    v
                }
                None => return Err(EnvError::Undefined(name)),
            };
            result = result.replace(&format!("${{{}}}", name), &value);
        }
        Ok(result)
    }
}

/// Detect a `$((command))` subshell marker. Returns the full marker and
/// the inner command.
pub fn has_subshell(value: &str) -> Option<(String, String)> {
    let expr = Regex::new(r"\$\(\((.*?)\)\)").expect("subshell pattern");
    expr.captures(value)
        .map(|c| (c[0].to_string(), c[1].to_string()))
}

/// Detect a `$(function-name)` call marker. Returns the function name.
/// Callers must check [`has_subshell`] first, since `$((…))` also
/// matches this looser pattern.
pub fn has_function_call(value: &str) -> Option<String> {
    let expr = Regex::new(r"\$\((.*?)\)").expect("function pattern");
    expr.captures(value).map(|c| c[1].to_string())
}

/// Ask for a variable value on the terminal.
fn prompt(name: &str) -> std::io::Result<String> {
    let mut err = std::io::stderr();
    write!(err, "{}: ", name)?;
    err.flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Envar {
        Envar::from_map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_later_layer_wins() {
        let profile: HashMap<String, String> =
            [("GOOS".to_string(), "linux".to_string())].into();
        let function: HashMap<String, String> =
            [("GOOS".to_string(), "windows".to_string())].into();
        let composed = env(&[("GOOS", "darwin")]).append(&profile).append(&function);
        assert_eq!(composed.get("GOOS"), Some("windows"));
    }

    #[test]
    fn test_merge_placeholders() {
        let mut e = env(&[("NAME", "world")]);
        let merged = e.merge_placeholders("hello ${NAME}", false).unwrap();
        assert_eq!(merged, "hello world");
    }

    #[test]
    fn test_undefined_placeholder_is_error() {
        let mut e = env(&[]);
        assert!(matches!(
            e.merge_placeholders("hello ${NAME}", false),
            Err(EnvError::Undefined(n)) if n == "NAME"
        ));
    }

    #[test]
    fn test_missing_build_vars_resolve_empty() {
        let mut e = env(&[]);
        let merged = e.merge_placeholders("ref=${FABRIQ_REF}", false).unwrap();
        assert_eq!(merged, "ref=");
    }

    #[test]
    fn test_subshell_detection() {
        let (marker, cmd) = has_subshell("rev=$((git rev-parse HEAD)) build").unwrap();
        assert_eq!(marker, "$((git rev-parse HEAD))");
        assert_eq!(cmd, "git rev-parse HEAD");
        assert!(has_subshell("$(deploy)").is_none());
    }

    #[test]
    fn test_function_call_detection() {
        assert_eq!(has_function_call("$(deploy)").as_deref(), Some("deploy"));
        assert!(has_function_call("echo plain").is_none());
    }
}
