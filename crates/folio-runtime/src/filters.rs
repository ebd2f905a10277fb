//! Typed view of plugin filter definitions.
//!
//! Plugins declare filters as `{key: {type, label, value, options}}` using
//! the `FilterTypes` strings from `@libs/filterInputs`, and read the user's
//! choices back as `{key: {type, value}}`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOption {
    pub label: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterDefinition {
    Picker {
        label: String,
        options: Vec<FilterOption>,
        default: String,
    },
    TextInput {
        label: String,
        default: String,
    },
    Switch {
        label: String,
        default: bool,
    },
    CheckboxGroup {
        label: String,
        options: Vec<FilterOption>,
        defaults: Vec<String>,
    },
    ExcludableCheckboxGroup {
        label: String,
        options: Vec<FilterOption>,
        included: Vec<String>,
        excluded: Vec<String>,
    },
}

impl FilterDefinition {
    pub fn label(&self) -> &str {
        match self {
            FilterDefinition::Picker { label, .. }
            | FilterDefinition::TextInput { label, .. }
            | FilterDefinition::Switch { label, .. }
            | FilterDefinition::CheckboxGroup { label, .. }
            | FilterDefinition::ExcludableCheckboxGroup { label, .. } => label,
        }
    }

    /// The `FilterTypes` string plugins compare against.
    pub fn type_name(&self) -> &'static str {
        match self {
            FilterDefinition::Picker { .. } => "Picker",
            FilterDefinition::TextInput { .. } => "Text",
            FilterDefinition::Switch { .. } => "Switch",
            FilterDefinition::CheckboxGroup { .. } => "Checkbox",
            FilterDefinition::ExcludableCheckboxGroup { .. } => "XCheckbox",
        }
    }

    pub fn default_value(&self) -> FilterValue {
        match self {
            FilterDefinition::Picker { default, .. } | FilterDefinition::TextInput { default, .. } => {
                FilterValue::Text(default.clone())
            }
            FilterDefinition::Switch { default, .. } => FilterValue::Switch(*default),
            FilterDefinition::CheckboxGroup { defaults, .. } => FilterValue::Selection(defaults.clone()),
            FilterDefinition::ExcludableCheckboxGroup { included, excluded, .. } => FilterValue::Excludable {
                included: included.clone(),
                excluded: excluded.clone(),
            },
        }
    }

    fn accepts(&self, value: &FilterValue) -> bool {
        matches!(
            (self, value),
            (FilterDefinition::Picker { .. }, FilterValue::Text(_))
                | (FilterDefinition::TextInput { .. }, FilterValue::Text(_))
                | (FilterDefinition::Switch { .. }, FilterValue::Switch(_))
                | (FilterDefinition::CheckboxGroup { .. }, FilterValue::Selection(_))
                | (FilterDefinition::ExcludableCheckboxGroup { .. }, FilterValue::Excludable { .. })
        )
    }
}

/// A user's choice for one filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Text(String),
    Switch(bool),
    Selection(Vec<String>),
    Excludable { included: Vec<String>, excluded: Vec<String> },
}

impl FilterValue {
    fn to_json(&self) -> Value {
        match self {
            FilterValue::Text(text) => json!(text),
            FilterValue::Switch(on) => json!(on),
            FilterValue::Selection(values) => json!(values),
            FilterValue::Excludable { included, excluded } => json!({
                "include": included,
                "exclude": excluded,
            }),
        }
    }
}

pub type FilterDefinitions = BTreeMap<String, FilterDefinition>;
pub type FilterValues = BTreeMap<String, FilterValue>;

/// Convert the plugin's `filters` object. Unknown or malformed entries are
/// skipped.
pub fn convert_filters(filters: &Value) -> FilterDefinitions {
    let mut definitions = FilterDefinitions::new();
    let Some(entries) = filters.as_object() else {
        return definitions;
    };

    for (key, entry) in entries {
        let Some(entry) = entry.as_object() else {
            continue;
        };
        let Some(kind) = entry.get("type").and_then(Value::as_str) else {
            continue;
        };
        let label = entry
            .get("label")
            .and_then(Value::as_str)
            .unwrap_or(key)
            .to_string();

        let definition = match kind {
            "Picker" => picker(label, entry),
            "Text" | "TextInput" => Some(FilterDefinition::TextInput {
                label,
                default: initial(entry).and_then(Value::as_str).unwrap_or_default().to_string(),
            }),
            "Switch" => Some(switch(label, entry)),
            "Checkbox" if !entry.contains_key("options") => Some(switch(label, entry)),
            "Checkbox" | "CheckboxGroup" => checkbox_group(label, entry),
            "XCheckbox" | "ExcludableCheckbox" | "ExcludableCheckboxGroup" => excludable(label, entry),
            other => {
                tracing::debug!("[filters] Skipping {} with unsupported type {}", key, other);
                None
            }
        };

        if let Some(definition) = definition {
            definitions.insert(key.clone(), definition);
        }
    }
    definitions
}

/// Encode selections in the shape plugins read. Missing or mistyped values
/// fall back to the definition's default.
pub fn encode_values(definitions: &FilterDefinitions, values: &FilterValues) -> Value {
    let mut encoded = Map::new();
    for (key, definition) in definitions {
        let value = values
            .get(key)
            .filter(|value| definition.accepts(value))
            .cloned()
            .unwrap_or_else(|| definition.default_value());
        encoded.insert(
            key.clone(),
            json!({ "type": definition.type_name(), "value": value.to_json() }),
        );
    }
    Value::Object(encoded)
}

/// The value plugins declare as the default: `value`, else `defaultValue`.
fn initial(entry: &Map<String, Value>) -> Option<&Value> {
    entry.get("value").or_else(|| entry.get("defaultValue"))
}

fn options(entry: &Map<String, Value>) -> Vec<FilterOption> {
    entry
        .get("options")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    let label = item.get("label")?.as_str()?;
                    let value = match item.get("value")? {
                        Value::String(s) => s.clone(),
                        Value::Number(n) => n.to_string(),
                        _ => return None,
                    };
                    Some(FilterOption {
                        label: label.to_string(),
                        value,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn strings(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

fn picker(label: String, entry: &Map<String, Value>) -> Option<FilterDefinition> {
    let options = options(entry);
    let first = options.first()?.value.clone();
    let default = initial(entry)
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(first);
    Some(FilterDefinition::Picker { label, options, default })
}

fn switch(label: String, entry: &Map<String, Value>) -> FilterDefinition {
    FilterDefinition::Switch {
        label,
        default: initial(entry).and_then(Value::as_bool).unwrap_or(false),
    }
}

fn checkbox_group(label: String, entry: &Map<String, Value>) -> Option<FilterDefinition> {
    let options = options(entry);
    if options.is_empty() {
        return None;
    }
    let defaults = strings(initial(entry).or_else(|| entry.get("defaultValues")));
    Some(FilterDefinition::CheckboxGroup { label, options, defaults })
}

fn excludable(label: String, entry: &Map<String, Value>) -> Option<FilterDefinition> {
    let options = options(entry);
    if options.is_empty() {
        return None;
    }
    let value = entry.get("value");
    let included = strings(value.and_then(|v| v.get("include")).or_else(|| entry.get("included")));
    let excluded = strings(value.and_then(|v| v.get("exclude")).or_else(|| entry.get("excluded")));
    Some(FilterDefinition::ExcludableCheckboxGroup {
        label,
        options,
        included,
        excluded,
    })
}
