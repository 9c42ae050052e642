//! Incoming response envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{default_version, Params};

/// Transaction status carried by every response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxnStatus {
    /// More responses follow for this transaction.
    Continue,
    /// Terminal.
    Complete,
    /// Terminal.
    Completed,
}

impl TxnStatus {
    /// Whether no further responses will arrive for the transaction.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnStatus::Complete | TxnStatus::Completed)
    }
}

/// Application-level status (HTTP-like code and message).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: u16,
    pub message: String,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            code: 200,
            message: "OK".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResponseHeader {
    #[serde(default = "default_version")]
    v: f64,
    txn: ResponseTxn,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ResponseTxn {
    id: String,
    status: TxnStatus,
}

/// A strest response.
///
/// Any top-level keys besides `strest` and `status` are kept, in order,
/// as the response's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    strest: ResponseHeader,
    #[serde(default)]
    status: Status,
    #[serde(flatten)]
    params: Params,
}

impl Response {
    pub fn new(txn_id: impl Into<String>, txn_status: TxnStatus) -> Self {
        Self {
            strest: ResponseHeader {
                v: default_version(),
                txn: ResponseTxn {
                    id: txn_id.into(),
                    status: txn_status,
                },
            },
            status: Status::default(),
            params: Params::new(),
        }
    }

    #[inline]
    pub fn txn_id(&self) -> &str {
        &self.strest.txn.id
    }

    #[inline]
    pub fn txn_status(&self) -> TxnStatus {
        self.strest.txn.status
    }

    /// Shorthand for `txn_status().is_terminal()`.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.strest.txn.status.is_terminal()
    }

    pub fn status_code(&self) -> u16 {
        self.status.code
    }

    pub fn status_message(&self) -> &str {
        &self.status.message
    }

    pub fn set_status(&mut self, code: u16, message: impl Into<String>) {
        self.status = Status {
            code,
            message: message.into(),
        };
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TxnStatus::Continue.is_terminal());
        assert!(TxnStatus::Complete.is_terminal());
        assert!(TxnStatus::Completed.is_terminal());
    }

    #[test]
    fn test_parse_response_with_extra_fields() {
        let res: Response = serde_json::from_str(
            r#"{"strest":{"v":2,"txn":{"id":"rs1","status":"complete"}},
                "status":{"code":201,"message":"Created"},
                "router_table_revision":3}"#,
        )
        .unwrap();

        assert_eq!(res.txn_id(), "rs1");
        assert_eq!(res.txn_status(), TxnStatus::Complete);
        assert!(res.is_terminal());
        assert_eq!(res.status_code(), 201);
        assert_eq!(res.status_message(), "Created");
        assert_eq!(res.get("router_table_revision"), Some(&json!(3)));
    }

    #[test]
    fn test_status_defaults_to_ok() {
        let res: Response =
            serde_json::from_str(r#"{"strest":{"txn":{"id":"x","status":"continue"}}}"#).unwrap();
        assert_eq!(res.status_code(), 200);
        assert_eq!(res.status_message(), "OK");
        assert!(!res.is_terminal());
        assert!(res.params().is_empty());
    }

    #[test]
    fn test_missing_txn_status_is_rejected() {
        let result = serde_json::from_str::<Response>(r#"{"strest":{"txn":{"id":"x"}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_txn_status_is_rejected() {
        let result =
            serde_json::from_str::<Response>(r#"{"strest":{"txn":{"id":"x","status":"done"}}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_serialize_flattens_params() {
        let mut res = Response::new("rs9", TxnStatus::Continue);
        res.put("n", 5);

        let value = serde_json::to_value(&res).unwrap();
        assert_eq!(value["strest"]["txn"]["status"], "continue");
        assert_eq!(value["n"], 5);
        assert_eq!(value["status"]["code"], 200);
    }
}
