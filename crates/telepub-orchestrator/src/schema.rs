// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! JSON schema validation of the published nodes file.
//!
//! Supports the keyword subset the published nodes schema uses:
//!
//! | Keyword | Applies to |
//! |---------|-----------|
//! | `type` (string or array) | any |
//! | `enum` | any |
//! | `$ref` (`#/definitions/..`, `#/$defs/..`) | any |
//! | `anyOf`, `oneOf`, `allOf` | any |
//! | `required`, `properties`, `additionalProperties` | objects |
//! | `items`, `minItems`, `maxItems` | arrays |
//! | `minLength`, `maxLength`, `pattern` | strings |
//! | `minimum`, `maximum` | numbers |
//!
//! Unknown keywords are ignored.

use crate::error::SchemaError;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;

/// Schema applied when no schema file is configured.
pub const PUBLISHED_NODES_SCHEMA: &str = r##"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "Published nodes",
  "type": "array",
  "items": { "$ref": "#/definitions/entry" },
  "definitions": {
    "interval": { "type": "integer", "minimum": 0 },
    "timespan": {
      "type": "string",
      "pattern": "^(\\d+\\.)?\\d{1,2}:\\d{2}:\\d{2}(\\.\\d{1,7})?$"
    },
    "node": {
      "type": "object",
      "anyOf": [ { "required": ["Id"] }, { "required": ["ExpandedNodeId"] } ],
      "properties": {
        "Id": { "type": "string", "minLength": 1 },
        "ExpandedNodeId": { "type": "string", "minLength": 1 },
        "DisplayName": { "type": ["string", "null"] },
        "DataSetFieldId": { "type": ["string", "null"] },
        "OpcSamplingInterval": { "$ref": "#/definitions/interval" },
        "OpcSamplingIntervalTimespan": { "$ref": "#/definitions/timespan" },
        "OpcPublishingInterval": { "$ref": "#/definitions/interval" },
        "OpcPublishingIntervalTimespan": { "$ref": "#/definitions/timespan" },
        "HeartbeatInterval": { "$ref": "#/definitions/interval" },
        "HeartbeatIntervalTimespan": { "$ref": "#/definitions/timespan" },
        "QueueSize": { "type": "integer", "minimum": 0 },
        "DiscardNew": { "type": "boolean" },
        "SkipFirst": { "type": "boolean" },
        "DataChangeTrigger": { "enum": ["Status", "StatusValue", "StatusValueTimestamp"] },
        "DeadbandType": { "enum": ["Absolute", "Percent"] },
        "DeadbandValue": { "type": "number" }
      }
    },
    "entry": {
      "type": "object",
      "required": ["EndpointUrl"],
      "properties": {
        "EndpointUrl": { "type": "string", "pattern": "^opc\\.tcp://" },
        "UseSecurity": { "type": "boolean" },
        "OpcAuthenticationMode": { "enum": ["Anonymous", "UsernamePassword"] },
        "OpcAuthenticationUsername": { "type": ["string", "null"] },
        "OpcAuthenticationPassword": { "type": ["string", "null"] },
        "DataSetWriterGroup": { "type": ["string", "null"] },
        "DataSetWriterId": { "type": ["string", "null"] },
        "DataSetName": { "type": ["string", "null"] },
        "DataSetPublishingInterval": { "$ref": "#/definitions/interval" },
        "DataSetPublishingIntervalTimespan": { "$ref": "#/definitions/timespan" },
        "DataSetKeyFrameCount": { "type": "integer", "minimum": 0 },
        "MetaDataUpdateTime": { "$ref": "#/definitions/interval" },
        "MetaDataUpdateTimeTimespan": { "$ref": "#/definitions/timespan" },
        "SendKeepAliveDataSetMessages": { "type": "boolean" },
        "MessagingMode": { "enum": ["Samples", "PubSub"] },
        "MessageEncoding": { "enum": ["Json", "Binary"] },
        "BatchSize": { "type": "integer", "minimum": 1 },
        "BatchTriggerInterval": { "$ref": "#/definitions/interval" },
        "DataSetExtensionFields": { "type": "object" },
        "OpcNodes": { "type": "array", "items": { "$ref": "#/definitions/node" } },
        "NodeId": {
          "type": "object",
          "required": ["Identifier"],
          "properties": { "Identifier": { "type": "string", "minLength": 1 } }
        }
      }
    }
  }
}"##;

/// Validates JSON documents against a schema.
#[derive(Debug)]
pub struct SchemaValidator {
    schema: Value,
    patterns: HashMap<String, Regex>,
}

impl SchemaValidator {
    /// Validator for a parsed schema. Every `pattern` is compiled up front.
    pub fn from_value(schema: Value) -> Result<Self, SchemaError> {
        let mut patterns = HashMap::new();
        collect_patterns(&schema, &mut patterns)?;
        Ok(Self { schema, patterns })
    }

    pub fn parse(schema: &str) -> Result<Self, SchemaError> {
        Self::from_value(serde_json::from_str(schema)?)
    }

    /// Load a schema file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, SchemaError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// The built-in published nodes schema.
    pub fn published_nodes() -> Result<Self, SchemaError> {
        Self::parse(PUBLISHED_NODES_SCHEMA)
    }

    /// Validate `document`, reporting every violation.
    pub fn validate(&self, document: &Value) -> Result<(), SchemaError> {
        let mut violations = Vec::new();
        self.check(&self.schema, document, "$", &mut violations);
        if violations.is_empty() {
            Ok(())
        } else {
            Err(SchemaError::Violations(violations))
        }
    }

    /// Parse `content` and validate it.
    pub fn validate_str(&self, content: &str) -> Result<(), SchemaError> {
        self.validate(&serde_json::from_str(content)?)
    }

    fn resolve<'a>(&'a self, reference: &str) -> Option<&'a Value> {
        let pointer = reference.strip_prefix('#')?;
        self.schema.pointer(pointer)
    }

    fn check(&self, schema: &Value, value: &Value, path: &str, out: &mut Vec<String>) {
        let Some(schema) = schema.as_object() else {
            if schema == &Value::Bool(false) {
                out.push(format!("{}: no value allowed", path));
            }
            return;
        };

        if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
            match self.resolve(reference) {
                Some(target) => self.check(target, value, path, out),
                None => out.push(format!("{}: unresolved reference {}", path, reference)),
            }
        }

        if let Some(expected) = schema.get("type") {
            if !type_matches(expected, value) {
                out.push(format!("{}: expected type {}, found {}", path, expected, type_name(value)));
                return;
            }
        }

        if let Some(Value::Array(allowed)) = schema.get("enum") {
            if !allowed.contains(value) {
                out.push(format!("{}: value {} is not one of {}", path, value, Value::Array(allowed.clone())));
            }
        }

        self.check_combinators(schema, value, path, out);

        match value {
            Value::Object(object) => self.check_object(schema, object, path, out),
            Value::Array(items) => self.check_array(schema, items, path, out),
            Value::String(s) => self.check_string(schema, s, path, out),
            Value::Number(n) => check_number(schema, n.as_f64().unwrap_or_default(), path, out),
            _ => {}
        }
    }

    fn check_combinators(&self, schema: &Map<String, Value>, value: &Value, path: &str, out: &mut Vec<String>) {
        if let Some(Value::Array(all)) = schema.get("allOf") {
            for sub in all {
                self.check(sub, value, path, out);
            }
        }
        if let Some(Value::Array(any)) = schema.get("anyOf") {
            if !any.iter().any(|sub| self.passes(sub, value, path)) {
                out.push(format!("{}: does not match any allowed schema", path));
            }
        }
        if let Some(Value::Array(one)) = schema.get("oneOf") {
            let matched = one.iter().filter(|sub| self.passes(sub, value, path)).count();
            if matched != 1 {
                out.push(format!("{}: matches {} schemas, expected exactly one", path, matched));
            }
        }
    }

    fn passes(&self, schema: &Value, value: &Value, path: &str) -> bool {
        let mut scratch = Vec::new();
        self.check(schema, value, path, &mut scratch);
        scratch.is_empty()
    }

    fn check_object(&self, schema: &Map<String, Value>, object: &Map<String, Value>, path: &str, out: &mut Vec<String>) {
        if let Some(Value::Array(required)) = schema.get("required") {
            for name in required.iter().filter_map(Value::as_str) {
                if !object.contains_key(name) {
                    out.push(format!("{}: missing required property {}", path, name));
                }
            }
        }

        let properties = schema.get("properties").and_then(Value::as_object);
        for (name, child) in object {
            let child_path = format!("{}.{}", path, name);
            match properties.and_then(|p| p.get(name)) {
                Some(sub) => self.check(sub, child, &child_path, out),
                None => match schema.get("additionalProperties") {
                    Some(Value::Bool(false)) => {
                        out.push(format!("{}: property not allowed", child_path))
                    }
                    Some(sub @ Value::Object(_)) => self.check(sub, child, &child_path, out),
                    _ => {}
                },
            }
        }
    }

    fn check_array(&self, schema: &Map<String, Value>, items: &[Value], path: &str, out: &mut Vec<String>) {
        if let Some(min) = schema.get("minItems").and_then(Value::as_u64) {
            if (items.len() as u64) < min {
                out.push(format!("{}: expected at least {} items, found {}", path, min, items.len()));
            }
        }
        if let Some(max) = schema.get("maxItems").and_then(Value::as_u64) {
            if (items.len() as u64) > max {
                out.push(format!("{}: expected at most {} items, found {}", path, max, items.len()));
            }
        }
        if let Some(sub) = schema.get("items") {
            for (i, item) in items.iter().enumerate() {
                self.check(sub, item, &format!("{}[{}]", path, i), out);
            }
        }
    }

    fn check_string(&self, schema: &Map<String, Value>, s: &str, path: &str, out: &mut Vec<String>) {
        let len = s.chars().count() as u64;
        if let Some(min) = schema.get("minLength").and_then(Value::as_u64) {
            if len < min {
                out.push(format!("{}: shorter than {} characters", path, min));
            }
        }
        if let Some(max) = schema.get("maxLength").and_then(Value::as_u64) {
            if len > max {
                out.push(format!("{}: longer than {} characters", path, max));
            }
        }
        if let Some(pattern) = schema.get("pattern").and_then(Value::as_str) {
            if let Some(re) = self.patterns.get(pattern) {
                if !re.is_match(s) {
                    out.push(format!("{}: '{}' does not match {}", path, s, pattern));
                }
            }
        }
    }
}

fn check_number(schema: &Map<String, Value>, n: f64, path: &str, out: &mut Vec<String>) {
    if let Some(min) = schema.get("minimum").and_then(Value::as_f64) {
        if n < min {
            out.push(format!("{}: {} is below minimum {}", path, n, min));
        }
    }
    if let Some(max) = schema.get("maximum").and_then(Value::as_f64) {
        if n > max {
            out.push(format!("{}: {} is above maximum {}", path, n, max));
        }
    }
}

fn collect_patterns(schema: &Value, patterns: &mut HashMap<String, Regex>) -> Result<(), SchemaError> {
    match schema {
        Value::Object(map) => {
            if let Some(pattern) = map.get("pattern").and_then(Value::as_str) {
                if !patterns.contains_key(pattern) {
                    let re = Regex::new(pattern)
                        .map_err(|e| SchemaError::InvalidSchema(format!("pattern {}: {}", pattern, e)))?;
                    patterns.insert(pattern.to_string(), re);
                }
            }
            for child in map.values() {
                collect_patterns(child, patterns)?;
            }
        }
        Value::Array(items) => {
            for child in items {
                collect_patterns(child, patterns)?;
            }
        }
        _ => {}
    }
    Ok(())
}

fn type_matches(expected: &Value, value: &Value) -> bool {
    match expected {
        Value::String(name) => is_type(name, value),
        Value::Array(names) => names
            .iter()
            .filter_map(Value::as_str)
            .any(|name| is_type(name, value)),
        _ => true,
    }
}

fn is_type(name: &str, value: &Value) -> bool {
    match name {
        "null" => value.is_null(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        _ => false,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Object(_) => "object",
        Value::Array(_) => "array",
        Value::String(_) => "string",
        Value::Number(n) if n.is_f64() => "number",
        Value::Number(_) => "integer",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn violations(result: Result<(), SchemaError>) -> Vec<String> {
        match result {
            Err(SchemaError::Violations(v)) => v,
            other => panic!("expected violations, got {:?}", other),
        }
    }

    #[test]
    fn test_builtin_schema_accepts_valid_file() {
        let validator = SchemaValidator::published_nodes().unwrap();
        let doc = json!([{
            "EndpointUrl": "opc.tcp://plc:4840",
            "DataSetPublishingIntervalTimespan": "00:00:01.5",
            "OpcNodes": [ { "Id": "i=2258", "OpcSamplingInterval": 1000 } ]
        }, {
            "EndpointUrl": "opc.tcp://plc:4841",
            "NodeId": { "Identifier": "i=2258" }
        }]);
        validator.validate(&doc).unwrap();
    }

    #[test]
    fn test_builtin_schema_reports_violations() {
        let validator = SchemaValidator::published_nodes().unwrap();
        let doc = json!([{
            "EndpointUrl": "http://plc",
            "DataSetPublishingInterval": -5,
            "MessagingMode": "Broadcast",
            "OpcNodes": [ { "DisplayName": "no id" } ]
        }, {
            "UseSecurity": "yes"
        }]);
        let v = violations(validator.validate(&doc));
        assert!(v.iter().any(|m| m.starts_with("$[0].EndpointUrl")));
        assert!(v.iter().any(|m| m.starts_with("$[0].DataSetPublishingInterval")));
        assert!(v.iter().any(|m| m.starts_with("$[0].MessagingMode")));
        assert!(v.iter().any(|m| m.starts_with("$[0].OpcNodes[0]")));
        assert!(v.iter().any(|m| m.contains("missing required property EndpointUrl")));
        assert!(v.iter().any(|m| m.starts_with("$[1].UseSecurity")));
    }

    #[test]
    fn test_keywords() {
        let validator = SchemaValidator::from_value(json!({
            "type": "object",
            "additionalProperties": false,
            "properties": {
                "tags": { "type": "array", "minItems": 1, "maxItems": 2, "items": { "type": "string", "maxLength": 3 } },
                "mode": { "oneOf": [ { "type": "integer" }, { "type": "number", "minimum": 10 } ] }
            }
        }))
        .unwrap();

        validator.validate(&json!({ "tags": ["a"], "mode": 1.5 })).unwrap_err();
        validator.validate(&json!({ "tags": ["abc"], "mode": 12.5 })).unwrap();

        let v = violations(validator.validate(&json!({ "tags": [], "extra": 1 })));
        assert_eq!(v.len(), 2);
        let v = violations(validator.validate(&json!({ "tags": ["a", "b", "toolong"] })));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn test_invalid_pattern_is_rejected() {
        let result = SchemaValidator::from_value(json!({ "pattern": "([" }));
        assert!(matches!(result, Err(SchemaError::InvalidSchema(_))));
    }

    #[test]
    fn test_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), r#"{ "type": "array" }"#).unwrap();
        let validator = SchemaValidator::from_file(file.path()).unwrap();
        validator.validate_str("[]").unwrap();
        assert!(validator.validate_str("{}").is_err());
    }
}
