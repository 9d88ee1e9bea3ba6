//! JSON merge used by `StateStore::update`.
//!
//! Patches may come from generated content, so the merge refuses
//! prototype-style reserved keys and rejects input nested deeper than
//! [`MAX_MERGE_DEPTH`] before doing any recursive work.

use serde_json::{Map, Value};

use crate::errors::StateError;

/// Deepest object/array nesting accepted in a patch.
pub const MAX_MERGE_DEPTH: usize = 32;

/// Keys that are never assigned, at any level.
pub const RESERVED_KEYS: [&str; 3] = ["__proto__", "constructor", "prototype"];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// True if any top-level value of `patch` is itself an object.
pub fn has_nested_objects(patch: &Map<String, Value>) -> bool {
    patch.values().any(Value::is_object)
}

/// Nesting depth of `value`, computed without recursion.
///
/// Scalars have depth 0; `{}` and `[]` have depth 1.
pub fn nesting_depth(value: &Value) -> usize {
    let mut max = 0;
    let mut stack = vec![(value, 0usize)];
    while let Some((current, depth)) = stack.pop() {
        let children: Box<dyn Iterator<Item = &Value>> = match current {
            Value::Object(map) => Box::new(map.values()),
            Value::Array(items) => Box::new(items.iter()),
            _ => continue,
        };
        let depth = depth + 1;
        max = max.max(depth);
        stack.extend(children.map(|child| (child, depth)));
    }
    max
}

/// Assign each top-level key of `patch` onto `target`.
pub fn shallow_merge(target: &mut Map<String, Value>, patch: Map<String, Value>) {
    for (key, value) in patch {
        if is_reserved(&key) {
            tracing::warn!(key = %key, "Dropping reserved key from state patch");
            continue;
        }
        target.insert(key, value);
    }
}

/// Recursively merge `patch` into `target`.
///
/// Objects merge key by key; arrays, scalars and explicit `null` replace the
/// target value wholesale.
pub fn deep_merge(target: &mut Value, patch: Value) -> Result<(), StateError> {
    if nesting_depth(&patch) > MAX_MERGE_DEPTH {
        return Err(StateError::MergeDepthExceeded {
            limit: MAX_MERGE_DEPTH,
        });
    }
    merge_value(target, patch, 0)
}

fn merge_value(target: &mut Value, patch: Value, depth: usize) -> Result<(), StateError> {
    if depth > MAX_MERGE_DEPTH {
        return Err(StateError::MergeDepthExceeded {
            limit: MAX_MERGE_DEPTH,
        });
    }

    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if is_reserved(&key) {
                    tracing::warn!(key = %key, "Dropping reserved key from state patch");
                    continue;
                }
                let both_objects = value.is_object()
                    && target_map.get(&key).is_some_and(Value::is_object);
                if both_objects && let Some(existing) = target_map.get_mut(&key) {
                    merge_value(existing, value, depth + 1)?;
                } else {
                    target_map.insert(key, value);
                }
            }
            Ok(())
        }
        (target, patch) => {
            *target = patch;
            Ok(())
        }
    }
}

/// Merge an object patch into an object document, choosing the shallow path
/// when the patch has no nested objects.
pub fn merge_patch(document: &mut Value, patch: Map<String, Value>) -> Result<(), StateError> {
    let depth = patch.values().map(nesting_depth).max().unwrap_or(0) + 1;
    if depth > MAX_MERGE_DEPTH {
        return Err(StateError::MergeDepthExceeded {
            limit: MAX_MERGE_DEPTH,
        });
    }
    match document {
        Value::Object(target) if !has_nested_objects(&patch) => {
            shallow_merge(target, patch);
            Ok(())
        }
        _ => deep_merge(document, Value::Object(patch)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn nested(depth: usize) -> Value {
        let mut value = json!({"leaf": true});
        for _ in 1..depth {
            value = json!({ "next": value });
        }
        value
    }

    #[test]
    fn test_nesting_depth() {
        assert_eq!(nesting_depth(&json!(1)), 0);
        assert_eq!(nesting_depth(&json!({})), 1);
        assert_eq!(nesting_depth(&json!({"a": [1, {"b": 2}]})), 3);
        assert_eq!(nesting_depth(&nested(40)), 40);
    }

    #[test]
    fn test_deep_merge_merges_objects_recursively() {
        let mut target = json!({"git": {"branch": "main", "base": "origin/main"}, "n": 1});
        deep_merge(&mut target, json!({"git": {"branch": "feat/x"}})).unwrap();
        assert_eq!(
            target,
            json!({"git": {"branch": "feat/x", "base": "origin/main"}, "n": 1})
        );
    }

    #[test]
    fn test_arrays_and_scalars_replace_wholesale() {
        let mut target = json!({"files": ["a", "b", "c"], "count": 3, "obj": {"k": 1}});
        deep_merge(&mut target, json!({"files": ["z"], "count": "three", "obj": 5})).unwrap();
        assert_eq!(target, json!({"files": ["z"], "count": "three", "obj": 5}));
    }

    #[test]
    fn test_explicit_null_overwrites() {
        let mut target = json!({"pr": {"number": 12}, "keep": {"x": 1}});
        deep_merge(&mut target, json!({"pr": null, "keep": {"y": null}})).unwrap();
        assert_eq!(target, json!({"pr": null, "keep": {"x": 1, "y": null}}));
    }

    #[test]
    fn test_reserved_keys_never_assigned() {
        let mut target = json!({});
        deep_merge(&mut target, json!({"__proto__": {"polluted": true}})).unwrap();
        assert_eq!(target, json!({}));

        let mut target = json!({"agents": {}});
        deep_merge(
            &mut target,
            json!({"agents": {"constructor": {"prototype": 1}, "planner": {"ok": true}}}),
        )
        .unwrap();
        assert_eq!(target, json!({"agents": {"planner": {"ok": true}}}));

        let mut map = Map::new();
        shallow_merge(&mut map, json!({"prototype": 1, "a": 2}).as_object().unwrap().clone());
        assert_eq!(Value::Object(map), json!({"a": 2}));
    }

    #[test]
    fn test_depth_ceiling_is_a_bounded_error() {
        let mut target = json!({});
        let err = deep_merge(&mut target, nested(MAX_MERGE_DEPTH + 50)).unwrap_err();
        assert!(matches!(err, StateError::MergeDepthExceeded { limit } if limit == MAX_MERGE_DEPTH));
        assert_eq!(target, json!({}));

        assert!(deep_merge(&mut target, nested(MAX_MERGE_DEPTH)).is_ok());
    }

    #[test]
    fn test_merge_patch_uses_shallow_path_for_flat_patch() {
        let mut doc = json!({"task": {"id": "T-1"}, "status": "x"});
        let patch = json!({"status": "y", "task": "replaced"});
        merge_patch(&mut doc, patch.as_object().unwrap().clone()).unwrap();
        assert_eq!(doc, json!({"task": "replaced", "status": "y"}));

        let patch = json!({"task": {"title": "Fix"}});
        let mut doc = json!({"task": {"id": "T-1"}});
        merge_patch(&mut doc, patch.as_object().unwrap().clone()).unwrap();
        assert_eq!(doc, json!({"task": {"id": "T-1", "title": "Fix"}}));
    }
}
