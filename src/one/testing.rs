//! Scripted session for driver and sequencer tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{RemoteError, Result};

const NOT_AUTHORIZED: i64 = 0x200;

use super::client::{RemoteCall, RemoteSession};
use super::xmlrpc::Value;

#[derive(Debug, Clone)]
enum Reply {
    Ok(String),
    Fault(i64, String),
    Network(String),
}

/// Records every call and answers from per-method scripts.
///
/// Each method has a queue of replies; the last reply is repeated once the
/// queue is down to one entry. Methods without a script answer `"0"`.
#[derive(Debug, Default)]
pub struct ScriptedSession {
    calls: Mutex<Vec<RemoteCall>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
}

impl ScriptedSession {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, method: &str, reply: Reply) -> &Self {
        self.replies
            .lock()
            .expect("replies lock")
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Queues a successful payload for `method`.
    pub fn ok(&self, method: &str, payload: impl Into<String>) -> &Self {
        self.push(method, Reply::Ok(payload.into()))
    }

    /// Queues a missing-object failure for `method`.
    pub fn fault(&self, method: &str, message: impl Into<String>) -> &Self {
        self.push(method, Reply::Fault(RemoteError::NO_EXISTS, message.into()))
    }

    /// Queues an authorization failure for `method`.
    pub fn denied(&self, method: &str, message: impl Into<String>) -> &Self {
        self.push(method, Reply::Fault(NOT_AUTHORIZED, message.into()))
    }

    /// Queues a transport failure for `method`.
    pub fn network_error(&self, method: &str, message: impl Into<String>) -> &Self {
        self.push(method, Reply::Network(message.into()))
    }

    /// Returns every call issued so far.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    /// Returns the method names issued so far, in order.
    pub fn methods(&self) -> Vec<String> {
        self.calls().into_iter().map(|c| c.method).collect()
    }

    /// Returns the calls made to one method, in order.
    pub fn calls_to(&self, method: &str) -> Vec<RemoteCall> {
        self.calls()
            .into_iter()
            .filter(|c| c.method == method)
            .collect()
    }

    /// Returns the number of mutating calls (anything but reads).
    pub fn mutation_count(&self) -> usize {
        self.methods()
            .iter()
            .filter(|m| !m.ends_with(".info"))
            .count()
    }
}

#[async_trait]
impl RemoteSession for ScriptedSession {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(RemoteCall::new(method, args));

        let reply = {
            let mut replies = self.replies.lock().expect("replies lock");
            match replies.get_mut(method) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match reply {
            None => Ok(String::from("0")),
            Some(Reply::Ok(payload)) => Ok(payload),
            Some(Reply::Fault(code, message)) => Err(RemoteError::Fault {
                method: method.to_string(),
                code,
                message,
            }
            .into()),
            Some(Reply::Network(message)) => Err(RemoteError::network(message).into()),
        }
    }

    fn username(&self) -> &str {
        "oneadmin"
    }
}
