//! OpenNebula session handle.
//!
//! The [`RemoteSession`] trait is the only seam between the reconciliation
//! core and the network. [`OneClient`] implements it with XML-RPC over HTTP.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client};
use tracing::trace;

use crate::error::{RemoteError, Result};

use super::xmlrpc::{decode_response, encode_call, Value};

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// A handle that issues remote calls.
///
/// Implementations are shared read-only by every driver call; one handle is
/// built up front and passed by reference.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Issues `method` with the given positional arguments and returns the
    /// payload text (a document or a decimal ID).
    ///
    /// The session token is prepended by the implementation.
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String>;

    /// Returns the name the session authenticates as.
    fn username(&self) -> &str;
}

/// A fully-formed remote call, built before it is sent.
///
/// Update plans are lists of these, so a plan can be inspected (and tested)
/// without touching the network.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCall {
    /// Method name, e.g. `one.image.rename`.
    pub method: String,
    /// Positional arguments after the session token.
    pub args: Vec<Value>,
}

impl RemoteCall {
    /// Creates a call.
    #[must_use]
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }

    /// Sends the call through a session.
    ///
    /// # Errors
    ///
    /// Returns the session's error unchanged.
    pub async fn send(&self, session: &dyn RemoteSession) -> Result<String> {
        session.call(&self.method, self.args.clone()).await
    }
}

impl fmt::Display for RemoteCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.method)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ")")
    }
}

/// XML-RPC client for an OpenNebula front-end.
///
/// Calls are never retried here; a failed call is surfaced to the caller.
#[derive(Clone)]
pub struct OneClient {
    /// HTTP client.
    client: Client,
    /// XML-RPC endpoint, e.g. `http://frontend:2633/RPC2`.
    endpoint: String,
    /// User name.
    username: String,
    /// `user:password` token sent as the first argument of every call.
    token: String,
}

impl fmt::Debug for OneClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OneClient")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl OneClient {
    /// Creates a client for the given endpoint and credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, username: &str, password: &str) -> Result<Self> {
        Self::with_timeout(endpoint, username, password, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client with a custom request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        endpoint: &str,
        username: &str,
        password: &str,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| RemoteError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            username: username.to_string(),
            token: format!("{username}:{password}"),
        })
    }

    /// Returns the endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteSession for OneClient {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::Str(self.token.clone()));
        params.extend(args);

        trace!("Calling {method} with {} arguments", params.len() - 1);
        let body = encode_call(method, &params);

        let response = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "text/xml")
            .body(body)
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("{method} request failed: {e}")))?;

        let status = response.status();

        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(RemoteError::AuthenticationFailed {
                message: format!("endpoint rejected credentials for '{}'", self.username),
            }
            .into());
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RemoteError::api_error(status.as_u16(), body).into());
        }

        let text = response
            .text()
            .await
            .map_err(|e| RemoteError::invalid(format!("Failed to read response body: {e}")))?;

        decode_response(method, &text)
    }

    fn username(&self) -> &str {
        &self.username
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NebulaError;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ok_body(payload: &str) -> String {
        format!(
            "<?xml version=\"1.0\"?><methodResponse><params><param><value><array><data>\
             <value><boolean>1</boolean></value><value><string>{payload}</string></value>\
             <value><i4>0</i4></value></data></array></value></param></params></methodResponse>"
        )
    }

    #[tokio::test]
    async fn test_call_sends_token_first_and_returns_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/RPC2"))
            .and(header("content-type", "text/xml"))
            .and(body_string_contains(
                "<param><value><string>oneadmin:secret</string></value></param>\
                 <param><value><int>12</int></value></param>",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_string(ok_body("12")))
            .expect(1)
            .mount(&server)
            .await;

        let client = OneClient::new(&format!("{}/RPC2", server.uri()), "oneadmin", "secret")
            .expect("client");
        let payload = client
            .call("one.image.delete", vec![Value::Int(12)])
            .await
            .expect("call failed");

        assert_eq!(payload, "12");
        assert_eq!(client.username(), "oneadmin");
    }

    #[tokio::test]
    async fn test_unauthorized_maps_to_authentication_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = OneClient::new(&server.uri(), "oneadmin", "wrong").expect("client");
        let result = client.call("one.vm.info", vec![Value::Int(1)]).await;

        assert!(matches!(
            result,
            Err(NebulaError::Remote(RemoteError::AuthenticationFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_server_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("oned down"))
            .expect(1)
            .mount(&server)
            .await;

        let client = OneClient::new(&server.uri(), "oneadmin", "secret").expect("client");
        match client.call("one.vm.info", vec![Value::Int(1)]).await {
            Err(NebulaError::Remote(RemoteError::ApiRequestFailed { status, message })) => {
                assert_eq!(status, 500);
                assert_eq!(message, "oned down");
            }
            other => panic!("expected request failure, got {other:?}"),
        }
    }

    #[test]
    fn test_remote_call_display() {
        let call = RemoteCall::new(
            "one.image.rename",
            vec![Value::Int(4), Value::from("base")],
        );
        assert_eq!(call.to_string(), "one.image.rename(4, \"base\")");
    }
}
