//! Configuration layers and the shallow merge between them.
//!
//! Every layer is normalised into an [`OptionMap`] before merging; the
//! merge itself is a per-key replace in increasing precedence.

use std::collections::BTreeMap;

use serde_json::Value;

/// Canonical option representation: option name -> JSON value.
pub type OptionMap = BTreeMap<String, Value>;

/// Key under which role metadata carries per-context patches.
pub const CONTEXT_OVERRIDES_KEY: &str = "context_overrides";

/// The named layers, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LayerKind {
    BuiltInDefaults,
    ConfigDefaults,
    BackingStore,
    RoleMetadata,
    Overrides,
}

/// The five layers that make up a launch request.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationLayers {
    pub built_in: OptionMap,
    pub config_defaults: OptionMap,
    pub backing_store: OptionMap,
    pub role_metadata: OptionMap,
    pub overrides: OptionMap,
}

impl ConfigurationLayers {
    /// Layers in increasing precedence.
    pub fn ordered(&self) -> [(LayerKind, &OptionMap); 5] {
        [
            (LayerKind::BuiltInDefaults, &self.built_in),
            (LayerKind::ConfigDefaults, &self.config_defaults),
            (LayerKind::BackingStore, &self.backing_store),
            (LayerKind::RoleMetadata, &self.role_metadata),
            (LayerKind::Overrides, &self.overrides),
        ]
    }

    /// Merge every layer; the highest layer defining a key wins.
    pub fn merge(&self) -> OptionMap {
        merge_layers(self.ordered().into_iter().map(|(_, layer)| layer))
    }

    /// The highest-precedence layer that defines `key`.
    pub fn origin(&self, key: &str) -> Option<LayerKind> {
        self.ordered()
            .into_iter()
            .rev()
            .find(|(_, layer)| layer.contains_key(key))
            .map(|(kind, _)| kind)
    }
}

/// Shallow merge: later maps replace earlier values key by key.
pub fn merge_layers<'a, I>(layers: I) -> OptionMap
where
    I: IntoIterator<Item = &'a OptionMap>,
{
    let mut merged = OptionMap::new();
    for layer in layers {
        for (key, value) in layer {
            merged.insert(key.clone(), value.clone());
        }
    }
    merged
}

/// Apply the requested context patches on top of role metadata, in the order
/// given, then drop the `context_overrides` key.
pub fn apply_context_overrides(metadata: &mut OptionMap, contexts: &[String]) {
    let Some(overrides) = metadata.remove(CONTEXT_OVERRIDES_KEY) else {
        return;
    };
    let Value::Object(overrides) = overrides else {
        return;
    };

    for context in contexts {
        if let Some(Value::Object(patch)) = overrides.get(context) {
            for (key, value) in patch {
                metadata.insert(key.clone(), value.clone());
            }
        }
    }
}

/// A value counts as set when present and not JSON null.
pub fn is_set(options: &OptionMap, key: &str) -> bool {
    options.get(key).is_some_and(|v| !v.is_null())
}

/// Read a string option, ignoring other types.
pub fn string_option<'a>(options: &'a OptionMap, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}

/// Convert a JSON object into an [`OptionMap`].
pub fn object_to_options(value: Value) -> Option<OptionMap> {
    match value {
        Value::Object(map) => Some(map.into_iter().collect()),
        _ => None,
    }
}
