//! XML-RPC encoding for the OpenNebula endpoint.
//!
//! Every API method answers with an array `[success, payload, code]`. On
//! success the payload is the result (a document or a numeric ID); on
//! failure it is the error text.

use std::fmt;

use quick_xml::escape::escape;

use crate::error::{RemoteError, Result};
use crate::template::Element;

/// A positional call argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Integer argument.
    Int(i64),
    /// Boolean argument.
    Bool(bool),
    /// String argument.
    Str(String),
    /// Floating point argument.
    Float(f64),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Bool(v) => write!(f, "{v}"),
            Self::Str(v) => write!(f, "{v:?}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

/// Renders a `methodCall` document.
#[must_use]
pub fn encode_call(method: &str, args: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");

    for arg in args {
        out.push_str("<param><value>");
        match arg {
            Value::Int(v) => {
                out.push_str("<int>");
                out.push_str(&v.to_string());
                out.push_str("</int>");
            }
            Value::Bool(v) => {
                out.push_str(if *v {
                    "<boolean>1</boolean>"
                } else {
                    "<boolean>0</boolean>"
                });
            }
            Value::Str(v) => {
                out.push_str("<string>");
                out.push_str(&escape(v.as_str()));
                out.push_str("</string>");
            }
            Value::Float(v) => {
                out.push_str("<double>");
                out.push_str(&v.to_string());
                out.push_str("</double>");
            }
        }
        out.push_str("</value></param>");
    }

    out.push_str("</params></methodCall>");
    out
}

/// Decodes a `methodResponse` document into the call's payload text.
///
/// # Errors
///
/// Returns [`RemoteError::Fault`] when the call failed remotely and
/// [`RemoteError::InvalidResponse`] when the document is not understood.
pub fn decode_response(method: &str, body: &str) -> Result<String> {
    let root = Element::parse(body)?;
    if root.name != "methodResponse" {
        return Err(RemoteError::invalid(format!("unexpected root element <{}>", root.name)).into());
    }

    if let Some(fault) = root.path(&["fault", "value", "struct"]) {
        return Err(decode_fault(method, fault).into());
    }

    let value = root
        .path(&["params", "param", "value"])
        .ok_or_else(|| RemoteError::invalid("response has no return value"))?;

    let items: Vec<&Element> = match value.path(&["array", "data"]) {
        Some(data) => data.children_named("value").collect(),
        None => vec![value],
    };

    let success = match items.first().map(|v| scalar_text(v)) {
        Some(flag) => flag == "1" || flag.eq_ignore_ascii_case("true"),
        None => return Err(RemoteError::invalid("empty return array").into()),
    };
    let payload = items.get(1).map(|v| scalar_text(v)).unwrap_or_default();

    if success {
        return Ok(payload);
    }

    let code = items
        .get(2)
        .and_then(|v| scalar_text(v).trim().parse().ok())
        .unwrap_or(-1);

    Err(RemoteError::Fault {
        method: method.to_string(),
        code,
        message: payload,
    }
    .into())
}

fn decode_fault(method: &str, fault: &Element) -> RemoteError {
    let mut code = -1;
    let mut message = String::from("unknown fault");

    for member in fault.children_named("member") {
        let value = member.child("value").map(scalar_text).unwrap_or_default();
        match member.child_text("name") {
            Some("faultCode") => code = value.trim().parse().unwrap_or(-1),
            Some("faultString") => message = value,
            _ => {}
        }
    }

    RemoteError::Fault {
        method: method.to_string(),
        code,
        message,
    }
}

/// Returns the text of a `<value>`, typed (`<i4>`, `<string>`...) or bare.
fn scalar_text(value: &Element) -> String {
    value
        .children
        .first()
        .map_or_else(|| value.text.clone(), |typed| typed.text.clone())
}
