//! Redaction rules applied to the hashable request object.
//!
//! A rule list deserializes from the same shapes users write in config files:
//!
//! ```yaml
//! redact:
//!   - "^story$"                 # KeyPattern: drop matching top-level keys
//!   - headers:                  # FieldMap: descend into `headers`
//!       authorization: ".*"     #   drop the key if its value matches
//!   - body:
//!       session:
//!         token: "^tok_"
//! ```

use crate::error::InterceptError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One redaction rule.
#[derive(Debug, Clone)]
pub enum RedactionRule {
    /// Remove every top-level key whose name matches.
    KeyPattern(Regex),
    /// Descend into objects by key.
    FieldMap(BTreeMap<String, FieldRule>),
}

/// The rule attached to a single key of a [`RedactionRule::FieldMap`].
#[derive(Debug, Clone)]
pub enum FieldRule {
    /// Remove the key when its primitive value, stringified, matches.
    Value(Regex),
    /// Recurse into the object held at the key.
    Nested(BTreeMap<String, FieldRule>),
}

/// An ordered list of rules. Each rule runs over the output of the previous one.
#[derive(Debug, Clone, Default)]
pub struct RedactionRules(Vec<RedactionRule>);

impl RedactionRules {
    pub fn new(rules: Vec<RedactionRule>) -> Self {
        Self(rules)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn rules(&self) -> &[RedactionRule] {
        &self.0
    }

    /// Parse a rule or list of rules. A single rule is normalized to a list.
    pub fn from_json(value: &Value) -> Result<Self, InterceptError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Array(items) => items
                .iter()
                .map(parse_rule)
                .collect::<Result<Vec<_>, _>>()
                .map(Self),
            single => parse_rule(single).map(|rule| Self(vec![rule])),
        }
    }

    /// Inverse of [`from_json`](Self::from_json); used for the relay `ignore` parameter.
    pub fn to_json(&self) -> Value {
        Value::Array(self.0.iter().map(rule_to_json).collect())
    }

    /// Apply all rules in order to `target`.
    pub fn apply(&self, target: &mut Map<String, Value>) {
        for rule in &self.0 {
            match rule {
                RedactionRule::KeyPattern(pattern) => {
                    target.retain(|key, _| !pattern.is_match(key));
                }
                RedactionRule::FieldMap(fields) => apply_field_map(fields, target),
            }
        }
    }
}

impl From<RedactionRule> for RedactionRules {
    fn from(rule: RedactionRule) -> Self {
        Self(vec![rule])
    }
}

impl From<Vec<RedactionRule>> for RedactionRules {
    fn from(rules: Vec<RedactionRule>) -> Self {
        Self(rules)
    }
}

fn apply_field_map(fields: &BTreeMap<String, FieldRule>, target: &mut Map<String, Value>) {
    for (key, subrule) in fields {
        let remove = match (subrule, target.get_mut(key)) {
            (_, None) => false,
            (FieldRule::Value(pattern), Some(value)) => match stringify_primitive(value) {
                Some(text) => pattern.is_match(&text),
                None => false,
            },
            (FieldRule::Nested(nested), Some(Value::Object(inner))) => {
                apply_field_map(nested, inner);
                false
            }
            (FieldRule::Nested(_), Some(_)) => false,
        };
        if remove {
            target.remove(key);
        }
    }
}

fn stringify_primitive(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn compile(pattern: &str) -> Result<Regex, InterceptError> {
    Regex::new(pattern).map_err(|e| {
        InterceptError::Configuration(format!("invalid redaction pattern '{pattern}': {e}"))
    })
}

fn parse_rule(value: &Value) -> Result<RedactionRule, InterceptError> {
    match value {
        Value::String(pattern) => compile(pattern).map(RedactionRule::KeyPattern),
        Value::Object(map) => parse_fields(map).map(RedactionRule::FieldMap),
        other => Err(InterceptError::Configuration(format!(
            "redaction rule must be a pattern string or an object, got {other}"
        ))),
    }
}

fn parse_fields(map: &Map<String, Value>) -> Result<BTreeMap<String, FieldRule>, InterceptError> {
    map.iter()
        .map(|(key, value)| {
            let rule = match value {
                Value::String(pattern) => FieldRule::Value(compile(pattern)?),
                Value::Object(inner) => FieldRule::Nested(parse_fields(inner)?),
                other => {
                    return Err(InterceptError::Configuration(format!(
                        "redaction rule for '{key}' must be a pattern string or an object, got {other}"
                    )))
                }
            };
            Ok((key.clone(), rule))
        })
        .collect()
}

fn rule_to_json(rule: &RedactionRule) -> Value {
    match rule {
        RedactionRule::KeyPattern(re) => Value::String(re.as_str().to_string()),
        RedactionRule::FieldMap(fields) => fields_to_json(fields),
    }
}

fn fields_to_json(fields: &BTreeMap<String, FieldRule>) -> Value {
    let mut out = Map::new();
    for (key, rule) in fields {
        let value = match rule {
            FieldRule::Value(re) => Value::String(re.as_str().to_string()),
            FieldRule::Nested(nested) => fields_to_json(nested),
        };
        out.insert(key.clone(), value);
    }
    Value::Object(out)
}

impl<'de> Deserialize<'de> for RedactionRules {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        RedactionRules::from_json(&raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for RedactionRules {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}
