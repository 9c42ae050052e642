//! Outgoing request envelope.
//!
//! # Example
//!
//! ```
//! use strest_client::protocol::{Request, TxnAccept};
//!
//! let mut req = Request::new("/ping", "GET").with_param("verbose", true);
//! req.set_txn_accept(TxnAccept::Single);
//!
//! assert_eq!(req.uri(), "/ping");
//! assert!(req.txn_id().is_empty());
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::response::{Response, TxnStatus};
use super::{default_version, Params, TxnAccept};

/// The `strest` header of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RequestHeader {
    #[serde(default = "default_version")]
    v: f64,
    uri: String,
    method: String,
    #[serde(default)]
    txn: RequestTxn,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct RequestTxn {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    id: String,
    #[serde(default)]
    accept: TxnAccept,
}

/// A strest request.
///
/// The transaction id starts out empty; the client stamps one on the way
/// out if the caller did not set it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    strest: RequestHeader,
    #[serde(default)]
    params: Params,
}

impl Request {
    /// Create a request for `uri` with the given method token (`GET`, `POST`, ...).
    pub fn new(uri: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            strest: RequestHeader {
                v: default_version(),
                uri: uri.into(),
                method: method.into(),
                txn: RequestTxn::default(),
            },
            params: Params::new(),
        }
    }

    /// Builder-style parameter insertion.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.put(key, value);
        self
    }

    #[inline]
    pub fn uri(&self) -> &str {
        &self.strest.uri
    }

    #[inline]
    pub fn method(&self) -> &str {
        &self.strest.method
    }

    /// Transaction id, empty if not yet assigned.
    #[inline]
    pub fn txn_id(&self) -> &str {
        &self.strest.txn.id
    }

    pub fn set_txn_id(&mut self, id: impl Into<String>) {
        self.strest.txn.id = id.into();
    }

    #[inline]
    pub fn txn_accept(&self) -> TxnAccept {
        self.strest.txn.accept
    }

    pub fn set_txn_accept(&mut self, accept: TxnAccept) {
        self.strest.txn.accept = accept;
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Insert or replace a parameter. Insertion order is kept.
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.params.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Build the terminal `200 OK` response for this request.
    pub fn new_response(&self) -> Response {
        Response::new(self.txn_id(), TxnStatus::Completed)
    }

    /// Build a terminal error response for this request.
    pub fn new_error(&self, code: u16, message: impl Into<String>) -> Response {
        let mut response = self.new_response();
        response.set_status(code, message);
        response
    }
}
