//! Parameter interpolation: `${path.to.value}` and bare `$path.to.value`
//! references resolved against the execution context.
//!
//! A string that is exactly one token resolves to the referenced value with
//! its type preserved; embedded tokens splice in scalars verbatim and
//! non-scalars as compact JSON. Unresolvable tokens are left in place.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

// The braced form accepts numeric segments (array indices); the bare form
// matches identifier segments only.
const BRACED_PATH: &str = r"[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*";
const BARE_PATH: &str = r"[A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*";

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| {
        Regex::new(&format!(r"\$\{{({BRACED_PATH})\}}|\$({BARE_PATH})"))
            .expect("token pattern is valid")
    })
}

fn whole_token_regex() -> &'static Regex {
    static WHOLE: OnceLock<Regex> = OnceLock::new();
    WHOLE.get_or_init(|| {
        Regex::new(&format!(r"^(?:\$\{{({BRACED_PATH})\}}|\$({BARE_PATH}))$"))
            .expect("whole-token pattern is valid")
    })
}

/// Walks a dotted path over the context. Object keys and array indices are
/// both accepted as segments.
fn resolve_path<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn splice(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Interpolates one string leaf. Returns a non-string [`Value`] when the
/// whole string is a single resolvable token.
pub fn interpolate_string(input: &str, context: &Value) -> Value {
    if let Some(captures) = whole_token_regex().captures(input) {
        let path = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str());
        if let Some(path) = path {
            if let Some(resolved) = resolve_path(context, path) {
                return resolved.clone();
            }
        }
        return Value::String(input.to_string());
    }

    let replaced = token_regex().replace_all(input, |captures: &regex::Captures<'_>| {
        let path = captures
            .get(1)
            .or_else(|| captures.get(2))
            .map(|m| m.as_str());
        match path.and_then(|p| resolve_path(context, p)) {
            Some(value) => splice(value),
            None => captures[0].to_string(),
        }
    });
    Value::String(replaced.into_owned())
}

/// Interpolates every string leaf of a parameter tree. Non-string leaves
/// pass through untouched.
pub fn interpolate_value(value: &Value, context: &Value) -> Value {
    match value {
        Value::String(s) => interpolate_string(s, context),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, context))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, item) in map {
                out.insert(key.clone(), interpolate_value(item, context));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Value {
        json!({
            "workflowId": "wf-1",
            "input": {"user": "ada", "count": 3},
            "steps": {
                "create_user": {"result": {"id": "u1", "tags": ["a", "b"]}}
            },
            "variables": {"region": "eu-west-1"}
        })
    }

    #[test]
    fn token_free_string_is_identity() {
        let ctx = context();
        assert_eq!(
            interpolate_string("plain text, no tokens", &ctx),
            json!("plain text, no tokens")
        );
    }

    #[test]
    fn whole_token_preserves_type() {
        let ctx = context();
        assert_eq!(
            interpolate_string("${steps.create_user.result.id}", &ctx),
            json!("u1")
        );
        assert_eq!(interpolate_string("${input.count}", &ctx), json!(3));
        assert_eq!(
            interpolate_string("${steps.create_user.result}", &ctx),
            json!({"id": "u1", "tags": ["a", "b"]})
        );
    }

    #[test]
    fn embedded_tokens_are_spliced() {
        let ctx = context();
        assert_eq!(
            interpolate_string("user ${input.user} in $variables.region", &ctx),
            json!("user ada in eu-west-1")
        );
        assert_eq!(
            interpolate_string("count=${input.count}", &ctx),
            json!("count=3")
        );
    }

    #[test]
    fn unresolved_tokens_stay_in_place() {
        let ctx = context();
        assert_eq!(
            interpolate_string("${steps.ghost.result}", &ctx),
            json!("${steps.ghost.result}")
        );
        assert_eq!(
            interpolate_string("a ${input.missing} b $also.missing", &ctx),
            json!("a ${input.missing} b $also.missing")
        );
    }

    #[test]
    fn bare_syntax_resolves() {
        let ctx = context();
        assert_eq!(interpolate_string("$input.user", &ctx), json!("ada"));
        assert_eq!(interpolate_string("$workflowId", &ctx), json!("wf-1"));
    }

    #[test]
    fn array_indices_are_walkable() {
        let ctx = context();
        assert_eq!(
            interpolate_string("${steps.create_user.result.tags.1}", &ctx),
            json!("b")
        );
    }

    #[test]
    fn descends_into_nested_params() {
        let ctx = context();
        let params = json!({
            "id": "${steps.create_user.result.id}",
            "labels": ["${input.user}", "static"],
            "nested": {"count": "${input.count}", "keep": 42}
        });
        assert_eq!(
            interpolate_value(&params, &ctx),
            json!({
                "id": "u1",
                "labels": ["ada", "static"],
                "nested": {"count": 3, "keep": 42}
            })
        );
    }

    #[test]
    fn non_string_leaves_pass_through() {
        let ctx = context();
        let params = json!({"n": 1, "b": true, "x": null});
        assert_eq!(interpolate_value(&params, &ctx), params);
    }
}
