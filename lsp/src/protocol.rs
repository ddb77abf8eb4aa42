//! LSP message shapes and URI helpers for the JSON-RPC channel.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::types::Diagnostic;

pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

pub(crate) fn initialize_params(root_uri: &str, root_name: &str) -> Value {
    json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "configuration": true,
                "workspaceFolders": true
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false,
                    "versionSupport": true
                }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": root_name
        }]
    })
}

#[must_use]
pub fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

/// Full-document sync: the single content change carries the whole text.
#[must_use]
pub fn did_change_params(uri: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": [{
            "text": text
        }]
    })
}

#[must_use]
pub fn did_close_params(uri: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri
        }
    })
}

/// Payload of `textDocument/publishDiagnostics` after boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishDiagnostics {
    pub uri: String,
    pub version: Option<i32>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Deserialize)]
struct RawPublishDiagnostics {
    uri: Option<String>,
    #[serde(default)]
    version: Option<i32>,
    #[serde(default)]
    diagnostics: Vec<Value>,
}

/// Validate a `publishDiagnostics` payload.
///
/// A payload without a `uri` is rejected; individual diagnostics that fail to
/// parse are dropped without affecting their siblings.
pub(crate) fn parse_publish_diagnostics(params: Option<Value>) -> Option<PublishDiagnostics> {
    let raw: RawPublishDiagnostics = serde_json::from_value(params?).ok()?;
    let uri = raw.uri.filter(|u| !u.is_empty())?;
    let diagnostics = raw
        .diagnostics
        .into_iter()
        .filter_map(|value| match serde_json::from_value::<Diagnostic>(value) {
            Ok(diagnostic) => Some(diagnostic),
            Err(e) => {
                tracing::debug!(uri = %uri, "Dropping malformed diagnostic: {e}");
                None
            }
        })
        .collect();
    Some(PublishDiagnostics {
        uri,
        version: raw.version,
        diagnostics,
    })
}

/// Build the reply to a server-initiated request.
///
/// Servers commonly block until `workspace/configuration` and capability
/// registration are answered, so those get neutral results; anything else is
/// MethodNotFound.
pub(crate) fn reply_to_server_request(id: &Value, method: &str, params: Option<&Value>) -> Value {
    match method {
        "workspace/configuration" => {
            let count = params
                .and_then(|p| p.get("items"))
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            json!({"jsonrpc": "2.0", "id": id, "result": vec![Value::Null; count]})
        }
        "client/registerCapability"
        | "client/unregisterCapability"
        | "window/workDoneProgress/create"
        | "window/showMessageRequest" => {
            json!({"jsonrpc": "2.0", "id": id, "result": null})
        }
        "workspace/workspaceFolders" => {
            json!({"jsonrpc": "2.0", "id": id, "result": null})
        }
        other => json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {
                "code": METHOD_NOT_FOUND,
                "message": format!("Method not found: {other}")
            }
        }),
    }
}

pub fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

#[must_use]
pub fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}

/// Canonical spelling of a `file://` URI, so that servers that percent-encode
/// differently from us still land on the same store key. Non-file URIs are
/// returned unchanged.
#[must_use]
pub fn canonical_uri(uri: &str) -> String {
    file_uri_to_path(uri)
        .and_then(|path| path_to_file_uri(&path).ok())
        .map_or_else(|| uri.to_string(), |u| u.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initialize_params_has_required_fields() {
        let params = initialize_params("file:///workspace", "workspace");
        assert!(params["processId"].is_number());
        assert_eq!(params["rootUri"], "file:///workspace");
        assert_eq!(params["workspaceFolders"][0]["uri"], "file:///workspace");
        assert!(params["capabilities"]["textDocument"]["publishDiagnostics"].is_object());
    }

    #[test]
    fn test_did_open_and_change_params() {
        let open = did_open_params("file:///a.ts", "typescript", 1, "let x = 1;");
        assert_eq!(open["textDocument"]["languageId"], "typescript");
        assert_eq!(open["textDocument"]["version"], 1);
        assert_eq!(open["textDocument"]["text"], "let x = 1;");

        let change = did_change_params("file:///a.ts", 2, "let x = 2;");
        assert_eq!(change["textDocument"]["version"], 2);
        let changes = change["contentChanges"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["text"], "let x = 2;");
        assert!(changes[0].get("range").is_none());

        let close = did_close_params("file:///a.ts");
        assert_eq!(close["textDocument"]["uri"], "file:///a.ts");
    }

    #[test]
    fn test_request_omits_absent_params() {
        let json = serde_json::to_value(Request::new(1, "shutdown", None)).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 1);
        assert!(json.get("params").is_none(), "params must be omitted, not null");

        let json = serde_json::to_value(Notification::new("exit", None)).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_parse_publish_diagnostics() {
        let parsed = parse_publish_diagnostics(Some(json!({
            "uri": "file:///a.rs",
            "version": 4,
            "diagnostics": [{
                "range": {"start": {"line": 1, "character": 2}, "end": {"line": 1, "character": 3}},
                "severity": 1,
                "source": "rustc",
                "message": "mismatched types",
                "code": "E0308"
            }]
        })))
        .unwrap();
        assert_eq!(parsed.uri, "file:///a.rs");
        assert_eq!(parsed.version, Some(4));
        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.diagnostics[0].range.start.character, 2);
    }

    #[test]
    fn test_parse_publish_diagnostics_rejects_missing_uri() {
        assert!(parse_publish_diagnostics(Some(json!({"diagnostics": []}))).is_none());
        assert!(parse_publish_diagnostics(Some(json!({"uri": "", "diagnostics": []}))).is_none());
        assert!(parse_publish_diagnostics(None).is_none());
    }

    #[test]
    fn test_parse_publish_diagnostics_drops_only_malformed_items() {
        let parsed = parse_publish_diagnostics(Some(json!({
            "uri": "file:///a.rs",
            "diagnostics": [
                {"message": "no range"},
                {"range": {"start": {"line": 0, "character": 0}, "end": {"line": 0, "character": 1}}, "message": "ok"}
            ]
        })))
        .unwrap();
        assert_eq!(parsed.diagnostics.len(), 1);
        assert_eq!(parsed.diagnostics[0].message, "ok");
        assert_eq!(parsed.version, None);
    }

    #[test]
    fn test_workspace_configuration_reply_matches_item_count() {
        let reply = reply_to_server_request(
            &json!(7),
            "workspace/configuration",
            Some(&json!({"items": [{"section": "a"}, {"section": "b"}]})),
        );
        assert_eq!(reply["id"], 7);
        assert_eq!(reply["result"], json!([null, null]));
    }

    #[test]
    fn test_unknown_server_request_is_method_not_found() {
        let reply = reply_to_server_request(&json!("x"), "custom/thing", None);
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        assert!(
            reply["error"]["message"]
                .as_str()
                .unwrap()
                .contains("custom/thing")
        );
        let reply = reply_to_server_request(&json!(1), "client/registerCapability", None);
        assert!(reply["result"].is_null());
        assert!(reply.get("error").is_none());
    }

    #[cfg(not(windows))]
    #[test]
    fn test_canonical_uri_normalizes_encoding() {
        assert_eq!(
            canonical_uri("file:///tmp/a%20b.ts"),
            canonical_uri("file:///tmp/a b.ts")
        );
        assert_eq!(canonical_uri("untitled:Untitled-1"), "untitled:Untitled-1");
    }

    #[test]
    fn test_path_to_file_uri_and_back() {
        #[cfg(windows)]
        let path = PathBuf::from(r"C:\Users\test\src\main.rs");
        #[cfg(not(windows))]
        let path = PathBuf::from("/home/test/src/main.rs");

        let uri = path_to_file_uri(&path).expect("should create URI");
        assert_eq!(file_uri_to_path(uri.as_str()), Some(path));
        assert!(file_uri_to_path("https://example.com/a.rs").is_none());
        assert!(file_uri_to_path("not-a-uri").is_none());
    }
}
