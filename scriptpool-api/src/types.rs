//! Value types exchanged between the runtime and the script engine.

use std::collections::HashMap;

/// A dynamically typed script value.
///
/// Script results, task parameters and message payloads all use the JSON
/// data model so that any engine can map them onto its own value type.
pub use serde_json::Value;

/// Named task parameters. Insertion order carries no meaning.
pub type Params = HashMap<String, Value>;

/// Build a [`Params`] map from key/value pairs.
///
/// ```rust
/// use scriptpool_api::types::params;
/// use serde_json::json;
///
/// let p = params([("value", json!(21))]);
/// assert_eq!(p["value"], json!(21));
/// ```
pub fn params<K, I>(pairs: I) -> Params
where
    K: Into<String>,
    I: IntoIterator<Item = (K, Value)>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v)).collect()
}
