//! Request/response tracking for IQ queries and message acks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::binary::Node;
use crate::types::JID;

/// Matches responses to outstanding requests by stanza id.
pub struct RequestTracker {
    pending: Mutex<HashMap<String, oneshot::Sender<Node>>>,
    prefix: String,
    counter: AtomicU64,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            prefix: format!("{}.{}-", rand::random::<u16>(), rand::random::<u16>()),
            counter: AtomicU64::new(0),
        }
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Node>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Generate a new unique request ID.
    pub fn next_id(&self) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}{}", self.prefix, n)
    }

    /// Register a pending request and get a receiver for the response.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Node> {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.to_string(), tx);
        rx
    }

    /// Hand `response` to the waiter registered under `id`.
    ///
    /// Returns false when nobody waits for it.
    pub fn complete(&self, id: &str, response: Node) -> bool {
        match self.pending().remove(id) {
            Some(tx) => tx.send(response).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, id: &str) {
        self.pending().remove(id);
    }

    /// Drop every waiter, e.g. when the connection is lost.
    pub fn cancel_all(&self) {
        self.pending().clear();
    }

    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}

impl Default for RequestTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Message IDs look like the ones the web client generates.
pub fn generate_message_id() -> String {
    format!("3EB0{}", hex::encode_upper(rand::random::<[u8; 8]>()))
}

/// Build an IQ request without an id; the client assigns one.
pub fn build_iq(iq_type: &str, xmlns: &str, to: &JID, children: Vec<Node>) -> Node {
    let node = Node::new("iq")
        .with_attr("type", iq_type)
        .with_attr("xmlns", xmlns)
        .with_attr("to", to);
    if children.is_empty() {
        node
    } else {
        node.with_children(children)
    }
}

/// Build an IQ result answering `request`.
pub fn build_iq_result(request: &Node) -> Node {
    let mut node = Node::new("iq").with_attr("type", "result");
    if let Some(id) = request.get_attr_str("id") {
        node.set_attr("id", id);
    }
    if let Some(from) = request.get_attr_jid("from") {
        node.set_attr("to", from);
    }
    node
}

/// Build an IQ error answering `request`.
pub fn build_iq_error(request: &Node, code: u16, text: &str) -> Node {
    let mut node = build_iq_result(request).with_children(vec![Node::new("error")
        .with_attr("code", code.to_string())
        .with_attr("text", text)]);
    node.set_attr("type", "error");
    node
}

/// Code and text of an IQ of type `error`.
pub fn iq_error(node: &Node) -> Option<(i64, String)> {
    if node.tag != "iq" || node.get_attr_str("type") != Some("error") {
        return None;
    }
    let error = node.get_child_by_tag("error");
    let code = error.and_then(|e| e.get_attr_int("code")).unwrap_or(0);
    let text = error
        .and_then(|e| e.get_attr_str("text"))
        .unwrap_or("unknown error")
        .to_string();
    Some((code, text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SERVER_JID;

    #[tokio::test]
    async fn completes_registered_request() {
        let tracker = RequestTracker::new();
        let id = tracker.next_id();
        let rx = tracker.register(&id);
        assert_eq!(tracker.pending_count(), 1);

        assert!(tracker.complete(&id, Node::new("iq").with_attr("id", id.as_str())));
        assert_eq!(rx.await.unwrap().get_attr_str("id"), Some(id.as_str()));
        assert_eq!(tracker.pending_count(), 0);
        assert!(!tracker.complete(&id, Node::new("iq")));
    }

    #[tokio::test]
    async fn cancel_all_wakes_waiters_with_error() {
        let tracker = RequestTracker::new();
        let rx = tracker.register(&tracker.next_id());
        tracker.cancel_all();
        assert!(rx.await.is_err());
    }

    #[test]
    fn ids_are_unique() {
        let tracker = RequestTracker::new();
        assert_ne!(tracker.next_id(), tracker.next_id());

        let id = generate_message_id();
        assert!(id.starts_with("3EB0"));
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn iq_helpers() {
        let request = build_iq("get", "w:m", &SERVER_JID, vec![Node::new("media_conn")])
            .with_attr("id", "7");
        assert_eq!(request.get_attr_jid("to"), Some(SERVER_JID.clone()));
        assert!(iq_error(&request).is_none());

        let incoming = Node::new("iq")
            .with_attr("id", "abc")
            .with_attr("from", SERVER_JID.clone());
        let error = build_iq_error(&incoming, 401, "not-authorized");
        assert_eq!(error.get_attr_str("id"), Some("abc"));
        assert_eq!(iq_error(&error), Some((401, "not-authorized".to_string())));
    }
}
