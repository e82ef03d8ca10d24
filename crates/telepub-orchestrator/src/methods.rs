// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Named configuration methods with JSON payloads.
//!
//! Maps a method name and a JSON request onto the reconciler API, the way a
//! remote management surface would call it.

use crate::entry::PublishedNodesEntry;
use crate::error::ApiError;
use crate::reconciler::PublishedNodesReconciler;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Configuration method names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    PublishNodes,
    UnpublishNodes,
    UnpublishAllNodes,
    AddOrUpdateEndpoints,
    GetConfiguredEndpoints,
    GetConfiguredNodesOnEndpoint,
    GetDiagnosticInfo,
}

impl Method {
    pub const ALL: [Method; 7] = [
        Method::PublishNodes,
        Method::UnpublishNodes,
        Method::UnpublishAllNodes,
        Method::AddOrUpdateEndpoints,
        Method::GetConfiguredEndpoints,
        Method::GetConfiguredNodesOnEndpoint,
        Method::GetDiagnosticInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::PublishNodes => "PublishNodes",
            Method::UnpublishNodes => "UnpublishNodes",
            Method::UnpublishAllNodes => "UnpublishAllNodes",
            Method::AddOrUpdateEndpoints => "AddOrUpdateEndpoints",
            Method::GetConfiguredEndpoints => "GetConfiguredEndpoints",
            Method::GetConfiguredNodesOnEndpoint => "GetConfiguredNodesOnEndpoint",
            Method::GetDiagnosticInfo => "GetDiagnosticInfo",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = ApiError;

    /// Case-insensitive, with or without a `_V1` suffix.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s
            .strip_suffix("_V1")
            .or_else(|| s.strip_suffix("_v1"))
            .unwrap_or(s);
        Method::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ApiError::bad_request(format!("Unknown method: {}", s)))
    }
}

/// Invoke `method` with a JSON `payload` (`None` or `null` for no request).
pub fn invoke(
    reconciler: &PublishedNodesReconciler,
    method: Method,
    payload: Option<&str>,
) -> Result<Value, ApiError> {
    let payload = match payload.map(str::trim).filter(|p| !p.is_empty()) {
        Some(p) => serde_json::from_str::<Value>(p)
            .map_err(|e| ApiError::bad_request(format!("Invalid request: {}", e)))?,
        None => Value::Null,
    };

    match method {
        Method::PublishNodes => {
            reconciler.publish_nodes(required(payload)?)?;
            Ok(Value::Null)
        }
        Method::UnpublishNodes => {
            reconciler.unpublish_nodes(required(payload)?)?;
            Ok(Value::Null)
        }
        Method::UnpublishAllNodes => {
            let request: Option<PublishedNodesEntry> = optional(payload)?;
            reconciler.unpublish_all_nodes(request.as_ref())?;
            Ok(Value::Null)
        }
        Method::AddOrUpdateEndpoints => {
            reconciler.add_or_update_endpoints(required(payload)?)?;
            Ok(Value::Null)
        }
        Method::GetConfiguredEndpoints => to_value(&reconciler.get_configured_endpoints()),
        Method::GetConfiguredNodesOnEndpoint => {
            let request: PublishedNodesEntry = required(payload)?;
            to_value(&reconciler.get_configured_nodes_on_endpoint(&request)?)
        }
        Method::GetDiagnosticInfo => to_value(&reconciler.get_diagnostic_info()),
    }
}

fn required<T: DeserializeOwned>(payload: Value) -> Result<T, ApiError> {
    optional(payload)?.ok_or_else(|| ApiError::bad_request("null request is provided"))
}

fn optional<T: DeserializeOwned>(payload: Value) -> Result<Option<T>, ApiError> {
    if payload.is_null() {
        return Ok(None);
    }
    serde_json::from_value(payload)
        .map(Some)
        .map_err(|e| ApiError::bad_request(format!("Invalid request: {}", e)))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ApiError> {
    serde_json::to_value(value).map_err(|e| ApiError::bad_request(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::JobConverter;
    use telepub::EngineConfig;
    use tempfile::TempDir;

    fn reconciler(dir: &TempDir) -> PublishedNodesReconciler {
        let path = dir.path().join("pn.json");
        std::fs::write(&path, "[]").unwrap();
        PublishedNodesReconciler::new(path, JobConverter::new(EngineConfig::default()))
    }

    #[test]
    fn test_method_names() {
        assert_eq!("PublishNodes".parse::<Method>().unwrap(), Method::PublishNodes);
        assert_eq!("publishnodes_V1".parse::<Method>().unwrap(), Method::PublishNodes);
        assert_eq!(Method::GetDiagnosticInfo.to_string(), "GetDiagnosticInfo");
        assert_eq!("Nope".parse::<Method>().unwrap_err().status, 400);
    }

    #[test]
    fn test_null_request_is_rejected() {
        let dir = TempDir::new().unwrap();
        let r = reconciler(&dir);
        let err = invoke(&r, Method::PublishNodes, None).unwrap_err();
        assert_eq!(err, ApiError::bad_request("null request is provided"));
        let err = invoke(&r, Method::UnpublishNodes, Some("null")).unwrap_err();
        assert_eq!(err.message, "null request is provided");
        let err = invoke(&r, Method::PublishNodes, Some("{ oops")).unwrap_err();
        assert_eq!(err.status, 400);
    }

    #[test]
    fn test_publish_and_query() {
        let dir = TempDir::new().unwrap();
        let r = reconciler(&dir);
        let request = r#"{ "EndpointUrl": "opc.tcp://plc:4840", "OpcNodes": [ { "Id": "ns=2;s=Temp" } ] }"#;
        invoke(&r, Method::PublishNodes, Some(request)).unwrap();

        let endpoints = invoke(&r, Method::GetConfiguredEndpoints, None).unwrap();
        assert_eq!(endpoints[0]["EndpointUrl"], "opc.tcp://plc:4840");
        assert!(endpoints[0].get("OpcNodes").is_none());

        let nodes = invoke(
            &r,
            Method::GetConfiguredNodesOnEndpoint,
            Some(r#"{ "EndpointUrl": "opc.tcp://plc:4840" }"#),
        )
        .unwrap();
        assert_eq!(nodes[0]["Id"], "ns=2;s=Temp");

        let diagnostics = invoke(&r, Method::GetDiagnosticInfo, None).unwrap();
        assert_eq!(diagnostics, Value::Array(Vec::new()));

        invoke(&r, Method::UnpublishAllNodes, None).unwrap();
        assert!(r.entries().is_empty());
    }
}
