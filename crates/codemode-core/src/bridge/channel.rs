//! Line protocol between a sandboxed script and the host bridge.
//!
//! The script writes one call per stdout line:
//!
//! ```text
//! __CODEMODE_CALL__ {"id":1,"namespace":"github","method":"listIssues","args":[{}]}
//! ```
//!
//! and reads exactly one JSON reply line from stdin:
//!
//! ```text
//! {"id":1,"ok":true,"result":[...]}
//! {"id":1,"ok":false,"error":"...","kind":"schema"}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::call_bridge::CallBridge;
use crate::error::{CodemodeError, ErrorKind, Result};

pub const CALL_PREFIX: &str = "__CODEMODE_CALL__ ";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: u64,
    pub namespace: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeReply {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl BridgeReply {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
            kind: None,
        }
    }

    pub fn failure(id: u64, error: &CodemodeError) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error.to_string()),
            kind: Some(error.root_cause().kind()),
        }
    }

    /// Single line including the trailing newline.
    pub fn encode(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// `None` for ordinary output; `Some` for anything carrying the call prefix,
/// even if the payload is malformed.
pub fn parse_call_line(line: &str) -> Option<Result<BridgeRequest>> {
    let payload = line.strip_prefix(CALL_PREFIX)?;
    Some(serde_json::from_str(payload.trim()).map_err(|e| {
        CodemodeError::InvalidInput(format!("malformed bridge call: {e}"))
    }))
}

/// Answer one call line. Calls are failed when no bridge is attached.
pub async fn answer(bridge: Option<&CallBridge>, line: Result<BridgeRequest>) -> BridgeReply {
    let request = match line {
        Ok(r) => r,
        Err(e) => return BridgeReply::failure(0, &e),
    };
    let Some(bridge) = bridge else {
        let err = CodemodeError::Runtime(format!(
            "no bridge attached for {}.{}",
            request.namespace, request.method
        ));
        return BridgeReply::failure(request.id, &err);
    };

    match bridge
        .intercept_call(&request.namespace, &request.method, request.args)
        .await
    {
        Ok(value) => BridgeReply::success(request.id, value),
        Err(e) => BridgeReply::failure(request.id, &e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_output_is_not_a_call() {
        assert!(parse_call_line("hello").is_none());
        assert!(parse_call_line("__CODEMODE_CALL__").is_none());
    }

    #[test]
    fn test_parse_call_line() {
        let line = r#"__CODEMODE_CALL__ {"id":3,"namespace":"gh","method":"list","args":[{"a":1}]}"#;
        let req = parse_call_line(line).unwrap().unwrap();
        assert_eq!(req.id, 3);
        assert_eq!(req.namespace, "gh");
        assert_eq!(req.args, vec![json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_malformed_call_gets_invalid_input_reply() {
        let reply = answer(None, parse_call_line("__CODEMODE_CALL__ {nope").unwrap()).await;
        assert!(!reply.ok);
        assert_eq!(reply.kind, Some(ErrorKind::InvalidInput));
    }

    #[tokio::test]
    async fn test_call_without_bridge_is_runtime_failure() {
        let req = BridgeRequest {
            id: 9,
            namespace: "gh".into(),
            method: "list".into(),
            args: vec![],
        };
        let reply = answer(None, Ok(req)).await;
        assert_eq!(reply.id, 9);
        assert_eq!(reply.kind, Some(ErrorKind::Runtime));
        let encoded = reply.encode().unwrap();
        assert!(encoded.ends_with('\n'));
        assert!(!encoded.contains("\"result\""));
    }
}
