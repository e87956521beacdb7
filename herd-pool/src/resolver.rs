//! Spec resolution against observed resources.
//!
//! Templates may reference other pools' instances with `@res/<key>[/path...]`
//! strings. Resolution is fail closed: any reference that cannot be
//! satisfied right now fails the whole template, and the item waits until
//! the dependency shows up.

use std::collections::{BTreeMap, HashMap};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::plugin::InstanceDescription;
use crate::spec::{HASH_TAG, KEY_TAG, POOL_TAG};

/// Prefix marking a resource reference inside a template string.
pub const REF_PREFIX: &str = "@res/";

#[derive(Debug, Error)]
pub enum ResolveError {
    /// Referenced resource or path is not (yet) observed.
    #[error("unresolved reference: {0}")]
    Unresolved(String),

    /// Reference embedded in a larger string points at a non-scalar value.
    #[error("reference {0} is not a scalar")]
    NonScalar(String),

    #[error("malformed reference: {0}")]
    Malformed(String),

    #[error("resource encoding failed: {0}")]
    Encode(String),
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '/')
}

/// Resolves every reference in `template` against `resources`.
pub fn resolve(
    template: &Value,
    resources: &HashMap<String, InstanceDescription>,
) -> Result<Value, ResolveError> {
    match template {
        Value::Object(map) => {
            let mut out = Map::with_capacity(map.len());
            for (key, value) in map {
                out.insert(key.clone(), resolve(value, resources)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(values) => {
            let mut out = Vec::with_capacity(values.len());
            for value in values {
                out.push(resolve(value, resources)?);
            }
            Ok(Value::Array(out))
        }
        Value::String(s) => resolve_string(s, resources),
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    s: &str,
    resources: &HashMap<String, InstanceDescription>,
) -> Result<Value, ResolveError> {
    if let Some(body) = s.strip_prefix(REF_PREFIX) {
        // A string that is exactly one reference splices the value in,
        // whatever its shape.
        if !body.is_empty() && body.chars().all(is_ref_char) {
            return lookup(s, resources);
        }
    }
    if !s.contains(REF_PREFIX) {
        return Ok(Value::String(s.to_string()));
    }
    let mut out = String::new();
    let mut rest = s;
    while let Some(at) = rest.find(REF_PREFIX) {
        out.push_str(&rest[..at]);
        let after = &rest[at + REF_PREFIX.len()..];
        let len = after
            .find(|c: char| !is_ref_char(c))
            .unwrap_or(after.len());
        if len == 0 {
            return Err(ResolveError::Malformed(rest[at..].to_string()));
        }
        let reference = &rest[at..at + REF_PREFIX.len() + len];
        let value = lookup(reference, resources)?;
        match render_scalar(&value) {
            Some(rendered) => out.push_str(&rendered),
            None => return Err(ResolveError::NonScalar(reference.to_string())),
        }
        rest = &after[len..];
    }
    out.push_str(rest);
    Ok(Value::String(out))
}

fn render_scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn lookup(
    reference: &str,
    resources: &HashMap<String, InstanceDescription>,
) -> Result<Value, ResolveError> {
    let body = reference
        .strip_prefix(REF_PREFIX)
        .ok_or_else(|| ResolveError::Malformed(reference.to_string()))?;
    let mut parts = body.split('/');
    let key = match parts.next() {
        Some(key) if !key.is_empty() => key,
        _ => return Err(ResolveError::Malformed(reference.to_string())),
    };
    let description = resources
        .get(key)
        .ok_or_else(|| ResolveError::Unresolved(reference.to_string()))?;
    let root =
        serde_json::to_value(description).map_err(|e| ResolveError::Encode(e.to_string()))?;
    let mut value = &root;
    for part in parts {
        if part.is_empty() {
            return Err(ResolveError::Malformed(reference.to_string()));
        }
        value = match value {
            Value::Object(map) => map
                .get(part)
                .ok_or_else(|| ResolveError::Unresolved(reference.to_string()))?,
            Value::Array(values) => {
                let index: usize = part
                    .parse()
                    .map_err(|_| ResolveError::Unresolved(reference.to_string()))?;
                values
                    .get(index)
                    .ok_or_else(|| ResolveError::Unresolved(reference.to_string()))?
            }
            _ => return Err(ResolveError::Unresolved(reference.to_string())),
        };
    }
    Ok(value.clone())
}

/// Hash of a resolved spec, stable across items built from the same
/// template and resources.
pub fn spec_hash(spec: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(spec.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Turns a resolved template into the spec handed to the backend: wraps
/// non-objects, then stamps identity tags. Template tags lose against the
/// pool selector, which loses against the identity tags.
pub fn finalize(resolved: Value, pool: &str, key: &str, select: &BTreeMap<String, String>) -> Value {
    let hash = spec_hash(&resolved);
    let mut map = match resolved {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    let mut tags = match map.remove("tags") {
        Some(Value::Object(existing)) => existing,
        _ => Map::new(),
    };
    for (tag, value) in select {
        tags.insert(tag.clone(), Value::String(value.clone()));
    }
    tags.insert(KEY_TAG.to_string(), Value::String(key.to_string()));
    tags.insert(POOL_TAG.to_string(), Value::String(pool.to_string()));
    tags.insert(HASH_TAG.to_string(), Value::String(hash));
    map.insert("tags".to_string(), Value::Object(tags));
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::InstanceId;
    use serde_json::json;

    fn resources() -> HashMap<String, InstanceDescription> {
        HashMap::from([(
            "db_0000".to_string(),
            InstanceDescription {
                id: InstanceId::from("i-db"),
                logical_id: None,
                tags: BTreeMap::from([("ip".to_string(), "10.0.0.5".to_string())]),
                properties: Some(json!({"ports": [5432, 5433]})),
            },
        )])
    }

    #[test]
    fn test_whole_string_reference_splices_the_value() {
        let template = json!({"backend": "@res/db_0000/tags"});
        let resolved = resolve(&template, &resources()).unwrap();
        assert_eq!(resolved, json!({"backend": {"ip": "10.0.0.5"}}));
    }

    #[test]
    fn test_embedded_reference_renders_scalars() {
        let template = json!({
            "url": "postgres://@res/db_0000/tags/ip:@res/db_0000/properties/ports/0",
        });
        let resolved = resolve(&template, &resources()).unwrap();
        assert_eq!(resolved, json!({"url": "postgres://10.0.0.5:5432"}));
    }

    #[test]
    fn test_missing_resource_fails_closed() {
        let template = json!({"url": "@res/cache_0000/tags/ip"});
        assert!(matches!(
            resolve(&template, &resources()),
            Err(ResolveError::Unresolved(_))
        ));
    }

    #[test]
    fn test_missing_path_fails_closed() {
        let template = json!({"url": "@res/db_0000/tags/port"});
        assert!(matches!(
            resolve(&template, &resources()),
            Err(ResolveError::Unresolved(_))
        ));
    }

    #[test]
    fn test_embedded_non_scalar_is_rejected() {
        let template = json!({"url": "backend=@res/db_0000/tags!"});
        assert!(matches!(
            resolve(&template, &resources()),
            Err(ResolveError::NonScalar(_))
        ));
    }

    #[test]
    fn test_bare_prefix_is_malformed() {
        let template = json!({"url": "see @res/ for details"});
        assert!(matches!(
            resolve(&template, &resources()),
            Err(ResolveError::Malformed(_))
        ));
    }

    #[test]
    fn test_finalize_stamps_identity_tags() {
        let select = BTreeMap::from([(POOL_TAG.to_string(), "web".to_string())]);
        let spec = finalize(
            json!({"cpu": 2, "tags": {"team": "infra", POOL_TAG: "stale"}}),
            "web",
            "web_0003",
            &select,
        );
        assert_eq!(spec["cpu"], json!(2));
        assert_eq!(spec["tags"]["team"], json!("infra"));
        assert_eq!(spec["tags"][POOL_TAG], json!("web"));
        assert_eq!(spec["tags"][KEY_TAG], json!("web_0003"));
        assert_eq!(spec["tags"][HASH_TAG].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_spec_hash_ignores_identity_tags() {
        let select = BTreeMap::new();
        let a = finalize(json!({"cpu": 2}), "web", "web_0000", &select);
        let b = finalize(json!({"cpu": 2}), "web", "web_0001", &select);
        assert_eq!(a["tags"][HASH_TAG], b["tags"][HASH_TAG]);
        assert_ne!(a["tags"][KEY_TAG], b["tags"][KEY_TAG]);
    }

    #[test]
    fn test_non_object_template_is_wrapped() {
        let spec = finalize(json!(42), "web", "web_0000", &BTreeMap::new());
        assert_eq!(spec["value"], json!(42));
        assert_eq!(spec["tags"][KEY_TAG], json!("web_0000"));
    }
}
