// Utility functions and helpers

use serde_json::Value;

/// Recursively merge `overlay` into `base`.
///
/// Objects are merged key by key; any other overlay value replaces the base
/// value. A `null` base is treated as an empty object so overrides can fill
/// in clients that were selected without configuration.
pub fn merge_json_objects(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if let Some(base_value) = base_map.get_mut(&key) {
                    *base_value = merge_json_objects(base_value.take(), value);
                } else {
                    base_map.insert(key, value);
                }
            }
            Value::Object(base_map)
        }
        (Value::Null, overlay @ Value::Object(_)) => overlay,
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}
