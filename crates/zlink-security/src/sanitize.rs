//! Command parameter sanitization.
//!
//! Every string reachable from the params value is checked for path
//! traversal segments, NUL bytes and shell metacharacters.

use serde_json::Value;

use crate::error::SecurityError;

const SHELL_METACHARACTERS: &[char] = &[';', '|', '&', '`', '$', '<', '>'];

/// Reject `params` if any string at any depth is unsafe.
pub fn sanitize_params(params: &Value) -> Result<(), SecurityError> {
    walk(params, "$")
}

fn walk(value: &Value, path: &str) -> Result<(), SecurityError> {
    match value {
        Value::String(s) => check_string(s, path),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .try_for_each(|(i, item)| walk(item, &format!("{}[{}]", path, i))),
        Value::Object(map) => map.iter().try_for_each(|(key, item)| {
            let child = format!("{}.{}", path, key);
            check_string(key, &child)?;
            walk(item, &child)
        }),
        _ => Ok(()),
    }
}

fn check_string(s: &str, path: &str) -> Result<(), SecurityError> {
    let reject = |reason: &str| {
        Err(SecurityError::UnsafeParameter {
            path: path.to_string(),
            reason: reason.to_string(),
        })
    };

    if s.contains('\0') {
        return reject("nul byte");
    }
    if has_traversal(s) {
        return reject("path traversal");
    }
    if let Some(c) = s.chars().find(|c| SHELL_METACHARACTERS.contains(c)) {
        return reject(&format!("shell metacharacter '{}'", c));
    }
    Ok(())
}

fn has_traversal(s: &str) -> bool {
    s.split(['/', '\\']).any(|segment| segment == "..")
}
