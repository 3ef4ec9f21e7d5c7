//! Variable Substitution: `${VAR[:default]}` resolution over
//! connection configs, applied by CM before an adapter is constructed.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value as Json;

static REFERENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::([^}]*))?\}").unwrap());

/// Outcome of resolving every `${...}` reference in one template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub resolved: String,
    pub found: Vec<String>,
    pub unresolved: Vec<String>,
}

/// Resolve every `${NAME}` / `${NAME:default}` reference in `template`
/// against `vars`. A present variable wins; an absent one falls back to its
/// literal default; with neither, the reference is left intact and the name
/// recorded in `unresolved`.
pub fn resolve(template: &str, vars: &HashMap<String, String>) -> Resolution {
    let mut found = Vec::new();
    let mut unresolved = Vec::new();
    let resolved = REFERENCE
        .replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str());
            if let Some(value) = vars.get(name) {
                found.push(name.to_string());
                value.clone()
            } else if let Some(default) = default {
                found.push(name.to_string());
                default.to_string()
            } else {
                unresolved.push(name.to_string());
                caps.get(0).unwrap().as_str().to_string()
            }
        })
        .into_owned();
    Resolution { resolved, found, unresolved }
}

/// Recurse into the string-valued leaves of a JSON object, resolving each
/// one independently. Non-string scalars, arrays, and their nested contents
/// are left untouched — only plain string fields of a config carry
/// references.
pub fn resolve_object(value: &Json, vars: &HashMap<String, String>) -> (Json, Vec<String>, Vec<String>) {
    let mut found = Vec::new();
    let mut unresolved = Vec::new();
    let out = resolve_value(value, vars, &mut found, &mut unresolved);
    (out, found, unresolved)
}

fn resolve_value(value: &Json, vars: &HashMap<String, String>, found: &mut Vec<String>, unresolved: &mut Vec<String>) -> Json {
    match value {
        Json::String(s) => {
            let r = resolve(s, vars);
            found.extend(r.found);
            unresolved.extend(r.unresolved);
            Json::String(r.resolved)
        }
        Json::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), resolve_value(v, vars, found, unresolved));
            }
            Json::Object(out)
        }
        // Arrays are left untouched: resolve_object recurses into
        // "nested record" string values only.
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn substitutes_a_present_variable() {
        let r = resolve("host=${HOST}", &vars(&[("HOST", "10.0.0.1")]));
        assert_eq!(r.resolved, "host=10.0.0.1");
        assert_eq!(r.found, vec!["HOST".to_string()]);
        assert!(r.unresolved.is_empty());
    }

    #[test]
    fn falls_back_to_literal_default() {
        let r = resolve("port=${PORT:502}", &HashMap::new());
        assert_eq!(r.resolved, "port=502");
        assert_eq!(r.found, vec!["PORT".to_string()]);
    }

    #[test]
    fn leaves_unresolved_references_intact() {
        let r = resolve("token=${TOKEN}", &HashMap::new());
        assert_eq!(r.resolved, "token=${TOKEN}");
        assert_eq!(r.unresolved, vec!["TOKEN".to_string()]);
    }

    #[test]
    fn resolve_object_recurses_into_nested_strings_only() {
        let input = serde_json::json!({
            "host": "${HOST}",
            "port": 502,
            "tags": ["${A}", "${B}"],
        });
        let (out, found, _) = resolve_object(&input, &vars(&[("HOST", "plc1")]));
        assert_eq!(out["host"], "plc1");
        assert_eq!(out["port"], 502);
        // arrays are left untouched even though they contain strings.
        assert_eq!(out["tags"], serde_json::json!(["${A}", "${B}"]));
        assert_eq!(found, vec!["HOST".to_string()]);
    }
}
