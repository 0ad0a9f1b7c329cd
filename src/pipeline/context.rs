//! Property context shared by a running script, plus the seam for the
//! external condition-expression evaluator.

use crate::error::{BuildError, Result};
use std::{collections::BTreeMap, path::PathBuf};

/// Named string properties visible to tasks and conditions, with the
/// standard defaults every script can rely on.
#[derive(Clone, Debug)]
pub struct ScriptContext {
    pub root: PathBuf,
    properties: BTreeMap<String, String>,
}

impl ScriptContext {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let mut properties = BTreeMap::new();
        let host_platform = if cfg!(windows) {
            "Win64"
        } else if cfg!(target_os = "macos") {
            "Mac"
        } else {
            "Linux"
        };
        for (name, value) in [
            ("Branch", "Unknown".to_string()),
            ("Depot", "Unknown".to_string()),
            ("EscapedBranch", "Unknown".to_string()),
            ("Change", "0".to_string()),
            ("CodeChange", "0".to_string()),
            ("IsBuildMachine", "false".to_string()),
            ("HostPlatform", host_platform.to_string()),
            ("RootDir", root.display().to_string()),
            ("EngineMajorVersion", "5".to_string()),
            ("EngineMinorVersion", "0".to_string()),
            ("EnginePatchVersion", "0".to_string()),
        ] {
            properties.insert(name.to_string(), value);
        }
        Self { root, properties }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(name.into(), value.into());
    }

    /// Appends to an existing property, separating with `;` when it already
    /// has a value.
    pub fn append(&mut self, name: impl Into<String>, value: &str) {
        let entry = self.properties.entry(name.into()).or_default();
        if entry.is_empty() {
            entry.push_str(value);
        } else {
            entry.push(';');
            entry.push_str(value);
        }
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Expands `$(Name)` references. Unknown properties expand to the empty
    /// string, matching script semantics.
    pub fn expand(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("$(") {
            out.push_str(&rest[..start]);
            match rest[start + 2..].find(')') {
                Some(end) => {
                    let name = &rest[start + 2..start + 2 + end];
                    if let Some(value) = self.get(name) {
                        out.push_str(value);
                    }
                    rest = &rest[start + 2 + end + 1..];
                }
                None => {
                    out.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }
}

/// Evaluates boolean condition strings against the script context. The real
/// expression language lives with the schema reader; the runtime only needs
/// a yes/no answer per string.
pub trait ConditionEvaluator: Sync {
    fn evaluate(&self, expression: &str, context: &ScriptContext) -> Result<bool>;
}

/// Minimal evaluator: property expansion, boolean literals and one
/// `==`/`!=` comparison. Enough for tests and simple scripts; drivers with
/// a full evaluator plug theirs in.
pub struct LiteralConditions;

impl ConditionEvaluator for LiteralConditions {
    fn evaluate(&self, expression: &str, context: &ScriptContext) -> Result<bool> {
        let expanded = context.expand(expression);
        let trimmed = expanded.trim();
        if trimmed.is_empty() {
            return Ok(true);
        }
        if let Some((left, right)) = trimmed.split_once("!=") {
            return Ok(normalize(left) != normalize(right));
        }
        if let Some((left, right)) = trimmed.split_once("==") {
            return Ok(normalize(left) == normalize(right));
        }
        match trimmed.to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(true),
            "false" | "0" => Ok(false),
            other => Err(BuildError::msg(format!("cannot evaluate condition \"{other}\""))),
        }
    }
}

fn normalize(operand: &str) -> String {
    operand.trim().trim_matches('\'').trim_matches('"').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expansion_and_defaults() {
        let mut ctx = ScriptContext::new("/ws");
        ctx.set("Config", "Shipping");
        assert_eq!(ctx.expand("out-$(Config)-$(Change)"), "out-Shipping-0");
        assert_eq!(ctx.expand("$(Missing)x"), "x");
        assert_eq!(ctx.get("RootDir"), Some("/ws"));
    }

    #[test]
    fn append_separates_with_semicolons() {
        let mut ctx = ScriptContext::new("/ws");
        ctx.append("Extra", "one");
        ctx.append("Extra", "two");
        assert_eq!(ctx.get("Extra"), Some("one;two"));
    }

    #[test]
    fn conditions() {
        let mut ctx = ScriptContext::new("/ws");
        ctx.set("Platform", "Linux");
        let eval = LiteralConditions;
        assert!(eval.evaluate("true", &ctx).unwrap());
        assert!(!eval.evaluate("False", &ctx).unwrap());
        assert!(eval.evaluate("", &ctx).unwrap());
        assert!(eval.evaluate("'$(Platform)' == 'Linux'", &ctx).unwrap());
        assert!(eval.evaluate("'$(Platform)' != 'Win64'", &ctx).unwrap());
        assert!(eval.evaluate("bogus", &ctx).is_err());
    }
}
