// Runtime Environment
// Read-only environment snapshot and template substitution for a run

use crate::parser::models::TriggerEvent;

use std::collections::HashMap;

/// Variables always exported to steps
pub const BRANCH_VAR: &str = "CONVEYOR_BRANCH";
pub const REVISION_VAR: &str = "CONVEYOR_REVISION";

const REDACTED: &str = "<< REDACTED >>";
const SECRET_MARKERS: [&str; 5] = ["TOKEN", "PASSWORD", "PASS", "SECRET", "KEY"];

/// Process environment captured once at run start.
///
/// Jobs only ever read from it; anything they export lives in their own
/// process environment and never flows back here.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentSnapshot {
    vars: HashMap<String, String>,
    trigger: Option<TriggerEvent>,
}

impl EnvironmentSnapshot {
    /// Capture the current process environment
    pub fn capture(trigger: TriggerEvent) -> Self {
        Self::from_vars(std::env::vars().collect(), trigger)
    }

    /// Build from an explicit map (tests, embedding)
    pub fn from_vars(mut vars: HashMap<String, String>, trigger: TriggerEvent) -> Self {
        vars.insert(BRANCH_VAR.to_string(), trigger.branch.clone());
        vars.insert(REVISION_VAR.to_string(), trigger.revision.clone());
        Self {
            vars,
            trigger: Some(trigger),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    pub fn vars(&self) -> &HashMap<String, String> {
        &self.vars
    }

    pub fn branch(&self) -> &str {
        self.trigger.as_ref().map(|t| t.branch.as_str()).unwrap_or("")
    }

    pub fn revision(&self) -> &str {
        self.trigger
            .as_ref()
            .map(|t| t.revision.as_str())
            .unwrap_or("")
    }

    /// Environment for a job: snapshot, then pipeline env, then job env
    pub fn layered(&self, layers: &[&HashMap<String, String>]) -> HashMap<String, String> {
        let mut env = self.vars.clone();
        for layer in layers {
            for (key, value) in layer.iter() {
                let value = substitute(value, &env, self.branch(), self.revision());
                env.insert(key.clone(), value);
            }
        }
        env
    }

    /// Expand `${VAR}`, `{{branch}}` and `{{revision}}` against the snapshot
    pub fn expand(&self, template: &str) -> String {
        substitute(template, &self.vars, self.branch(), self.revision())
    }

    /// Sorted, display-safe view of the environment
    pub fn redacted(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<_> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), redact(k, v)))
            .collect();
        pairs.sort();
        pairs
    }
}

/// Expand `${VAR}` from `vars` plus the `{{branch}}`/`{{revision}}` tokens
/// in one left-to-right pass. Substituted values are never rescanned, and
/// unknown variables are left as written.
pub fn substitute(
    template: &str,
    vars: &HashMap<String, String>,
    branch: &str,
    revision: &str,
) -> String {
    const TOKENS: [&str; 2] = ["{{branch}}", "{{revision}}"];

    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(['$', '{']) {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];

        if let Some(after) = tail.strip_prefix("${") {
            let Some(end) = after.find('}') else {
                out.push_str(tail);
                return out;
            };
            let name = &after[..end];
            match vars.get(name) {
                Some(value) => out.push_str(value),
                None => out.push_str(&tail[..end + 3]),
            }
            rest = &after[end + 1..];
        } else if let Some(token) = TOKENS.iter().find(|t| tail.starts_with(**t)) {
            out.push_str(if *token == TOKENS[0] { branch } else { revision });
            rest = &tail[token.len()..];
        } else {
            out.push_str(&tail[..1]);
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

pub fn is_secret_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
}

/// Mask the value when the name looks like a credential
pub fn redact(name: &str, value: &str) -> String {
    if is_secret_name(name) && !value.is_empty() {
        REDACTED.to_string()
    } else {
        value.to_string()
    }
}
