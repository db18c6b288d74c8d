//! Plugin configuration schema and resolution.

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drowl_core::JsonObject;

use crate::manifest::ValidationReport;

/// Type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigFieldType {
    String,
    Number,
    Boolean,
    /// A string that is never logged.
    Secret,
    Url,
    Email,
    Json,
    Array,
}

/// Extra constraints on a configuration value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FieldValidation {
    /// Minimum numeric value, or minimum length for strings and arrays.
    pub min: Option<f64>,
    /// Maximum numeric value, or maximum length for strings and arrays.
    pub max: Option<f64>,
    /// Regex a string value must match.
    pub pattern: Option<String>,
    /// Allowed values; empty means unrestricted.
    pub options: Vec<Value>,
}

/// One entry of a manifest's `configSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigField {
    pub key: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(rename = "type")]
    pub field_type: ConfigFieldType,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation: Option<FieldValidation>,
    #[serde(default)]
    pub placeholder: Option<String>,
}

impl ConfigField {
    pub fn new(key: impl Into<String>, field_type: ConfigFieldType) -> Self {
        Self {
            key: key.into(),
            label: None,
            field_type,
            description: None,
            required: false,
            default_value: None,
            validation: None,
            placeholder: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_validation(mut self, validation: FieldValidation) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Check a value against the declared type and constraints.
    pub fn check_value(&self, value: &Value) -> Result<(), String> {
        check_type(self.field_type, value)?;
        match &self.validation {
            Some(validation) => check_constraints(validation, value),
            None => Ok(()),
        }
    }
}

fn check_type(field_type: ConfigFieldType, value: &Value) -> Result<(), String> {
    let ok = match field_type {
        ConfigFieldType::String | ConfigFieldType::Secret => value.is_string(),
        ConfigFieldType::Number => value.is_number(),
        ConfigFieldType::Boolean => value.is_boolean(),
        ConfigFieldType::Json => true,
        ConfigFieldType::Array => value.is_array(),
        ConfigFieldType::Url => value.as_str().is_some_and(looks_like_url),
        ConfigFieldType::Email => value.as_str().is_some_and(looks_like_email),
    };
    if ok {
        Ok(())
    } else {
        Err(format!("expected a value of type {field_type:?}"))
    }
}

fn looks_like_url(s: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| s.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}

fn looks_like_email(s: &str) -> bool {
    let mut parts = s.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        _ => false,
    }
}

fn check_constraints(validation: &FieldValidation, value: &Value) -> Result<(), String> {
    let measure = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => Some(s.chars().count() as f64),
        Value::Array(items) => Some(items.len() as f64),
        _ => None,
    };
    if let Some(measure) = measure {
        if let Some(min) = validation.min {
            if measure < min {
                return Err(format!("value is below the minimum of {min}"));
            }
        }
        if let Some(max) = validation.max {
            if measure > max {
                return Err(format!("value is above the maximum of {max}"));
            }
        }
    }

    if let (Some(pattern), Some(s)) = (&validation.pattern, value.as_str()) {
        let re = Regex::new(pattern).map_err(|e| format!("invalid validation pattern: {e}"))?;
        if !re.is_match(s) {
            return Err(format!("value does not match pattern {pattern}"));
        }
    }

    if !validation.options.is_empty() && !validation.options.contains(value) {
        return Err("value is not one of the allowed options".to_string());
    }

    Ok(())
}

/// Operator configuration after defaults and validation were applied.
#[derive(Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    values: JsonObject,
    secret_keys: BTreeSet<String>,
}

impl ResolvedConfig {
    /// Resolve `supplied` against `schema`, recording problems in `report`.
    ///
    /// Supplied values win over defaults; `null` counts as not supplied.
    pub fn resolve(schema: &[ConfigField], supplied: &JsonObject, report: &mut ValidationReport) -> Self {
        let mut resolved = ResolvedConfig::default();

        for field in schema {
            let value = supplied
                .get(&field.key)
                .filter(|v| !v.is_null())
                .or(field.default_value.as_ref());

            match value {
                Some(value) => match field.check_value(value) {
                    Ok(()) => {
                        if field.field_type == ConfigFieldType::Secret {
                            resolved.secret_keys.insert(field.key.clone());
                        }
                        resolved.values.insert(field.key.clone(), value.clone());
                    }
                    Err(reason) => report.push_error(format!("config.{}", field.key), reason),
                },
                None if field.required => report.push_error(
                    format!("config.{}", field.key),
                    "required field has no value and no default".to_string(),
                ),
                None => {}
            }
        }

        for key in supplied.keys() {
            if !schema.iter().any(|f| &f.key == key) {
                report.push_warning(
                    format!("config.{key}"),
                    "key is not declared in the config schema and was ignored".to_string(),
                );
            }
        }

        resolved
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(Value::as_f64)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl core::fmt::Debug for ResolvedConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.values {
            if self.secret_keys.contains(key) {
                map.entry(key, &"***");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}
