use crate::error::ClientError;
use crate::wire::WireMessage;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};

pub type Reply = Result<WireMessage, ClientError>;

enum Pending {
    /// Resolved by the first reply, then removed.
    Once(oneshot::Sender<Reply>),
    /// Receives every reply with this id until the receiver goes away.
    Stream(mpsc::UnboundedSender<WireMessage>),
}

/// Maps in-flight request ids to whoever waits for the reply.
///
/// Ids start at 0 and only ever grow for the lifetime of the correlator;
/// clearing the table on disconnect does not rewind them.
pub struct Correlator {
    next_id: u64,
    pending: HashMap<u64, Pending>,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next id and register a one-shot waiter for it in one
    /// step, so the reply can never arrive before the waiter exists.
    pub fn prepare(
        &mut self,
        code: &str,
        data: Value,
    ) -> (WireMessage, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let id = self.register(Pending::Once(tx));
        (WireMessage::new(id, code, data), rx)
    }

    /// Like `prepare`, but the waiter receives every reply carrying the id
    /// until the receiver is dropped or `cancel(id)` is called.
    pub fn subscribe(
        &mut self,
        code: &str,
        data: Value,
    ) -> (WireMessage, mpsc::UnboundedReceiver<WireMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Pending::Stream(tx));
        (WireMessage::new(id, code, data), rx)
    }

    /// Allocate an id without registering anything (fire-and-forget send).
    pub fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    // Ids only come from the counter, so the slot is always free.
    fn register(&mut self, pending: Pending) -> u64 {
        let id = self.allocate();
        let previous = self.pending.insert(id, pending);
        debug_assert!(previous.is_none(), "id {} registered twice", id);
        id
    }

    /// Route a reply to its waiter. Returns the message back when nobody
    /// waits for its id.
    pub fn dispatch(&mut self, msg: WireMessage) -> Option<WireMessage> {
        match self.pending.remove(&msg.id) {
            Some(Pending::Once(tx)) => {
                // The caller may have timed out already; nothing to do then.
                let _ = tx.send(Ok(msg));
                None
            }
            Some(Pending::Stream(tx)) => {
                let id = msg.id;
                match tx.send(msg) {
                    Ok(()) => {
                        self.pending.insert(id, Pending::Stream(tx));
                        None
                    }
                    Err(mpsc::error::SendError(msg)) => Some(msg),
                }
            }
            None => Some(msg),
        }
    }

    /// Drop the waiter for `id`, if any.
    pub fn cancel(&mut self, id: u64) -> bool {
        self.pending.remove(&id).is_some()
    }

    /// Reject every waiter with `err` and empty the table.
    pub fn fail_all(&mut self, err: ClientError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            if let Pending::Once(tx) = pending {
                let _ = tx.send(Err(err.clone()));
            }
        }
        count
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reply(id: u64, code: &str) -> WireMessage {
        WireMessage::new(id, code, json!({"result": true}))
    }

    #[test]
    fn ids_start_at_zero_and_increase() {
        let mut c = Correlator::new();
        let ids: Vec<u64> = (0..50).map(|_| c.prepare("app_list", json!({})).0.id).collect();
        assert_eq!(ids[0], 0);
        assert!(ids.windows(2).all(|w| w[1] == w[0] + 1));
        assert_eq!(c.len(), 50);
    }

    #[test]
    fn reply_resolves_only_its_own_waiter() {
        let mut c = Correlator::new();
        let (_, mut rx0) = c.prepare("a", json!({}));
        let (_, mut rx1) = c.prepare("b", json!({}));
        let (_, mut rx2) = c.prepare("c", json!({}));

        assert!(c.dispatch(reply(1, "b")).is_none());
        assert_eq!(rx1.try_recv().unwrap().unwrap().code, "b");
        assert!(rx0.try_recv().is_err());
        assert!(rx2.try_recv().is_err());

        // Out of order relative to send order.
        assert!(c.dispatch(reply(2, "c")).is_none());
        assert!(c.dispatch(reply(0, "a")).is_none());
        assert_eq!(rx2.try_recv().unwrap().unwrap().code, "c");
        assert_eq!(rx0.try_recv().unwrap().unwrap().code, "a");
        assert!(c.is_empty());
    }

    #[test]
    fn second_reply_with_same_id_is_unmatched() {
        let mut c = Correlator::new();
        let (msg, _rx) = c.prepare("a", json!({}));
        assert!(c.dispatch(reply(msg.id, "a")).is_none());
        assert!(c.dispatch(reply(msg.id, "a")).is_some());
    }

    #[test]
    fn unknown_id_is_returned() {
        let mut c = Correlator::new();
        let back = c.dispatch(reply(42, "x")).unwrap();
        assert_eq!(back.id, 42);
    }

    #[test]
    fn fail_all_rejects_waiters_but_keeps_counter() {
        let mut c = Correlator::new();
        let (_, mut rx0) = c.prepare("a", json!({}));
        let (_, mut rx1) = c.prepare("b", json!({}));
        assert_eq!(c.fail_all(ClientError::ConnectionLost), 2);
        assert_eq!(rx0.try_recv().unwrap(), Err(ClientError::ConnectionLost));
        assert_eq!(rx1.try_recv().unwrap(), Err(ClientError::ConnectionLost));
        assert!(c.is_empty());
        assert_eq!(c.prepare("c", json!({})).0.id, 2);
    }

    #[test]
    fn cancel_removes_entry() {
        let mut c = Correlator::new();
        let (msg, _rx) = c.prepare("a", json!({}));
        assert!(c.cancel(msg.id));
        assert!(!c.is_pending(msg.id));
        assert!(!c.cancel(msg.id));
    }

    #[test]
    fn subscription_delivers_until_dropped() {
        let mut c = Correlator::new();
        let (msg, mut rx) = c.subscribe("watch", json!({}));
        assert_eq!(msg.id, 0);
        assert!(c.dispatch(reply(msg.id, "x")).is_none());
        assert!(c.dispatch(reply(msg.id, "y")).is_none());
        assert_eq!(rx.try_recv().unwrap().code, "x");
        assert_eq!(rx.try_recv().unwrap().code, "y");
        assert!(c.is_pending(msg.id));

        drop(rx);
        assert!(c.dispatch(reply(msg.id, "z")).is_some());
        assert!(!c.is_pending(msg.id));
    }

    #[test]
    fn subscriptions_and_requests_never_share_an_id() {
        let mut c = Correlator::new();
        let (sub, sub_rx) = c.subscribe("watch", json!({}));
        let (req, mut req_rx) = c.prepare("app_list", json!({}));
        assert_ne!(sub.id, req.id);

        // Ending the subscription leaves the request untouched.
        drop(sub_rx);
        assert!(c.cancel(sub.id));
        assert!(c.is_pending(req.id));
        assert!(c.dispatch(reply(req.id, "app_list")).is_none());
        assert_eq!(req_rx.try_recv().unwrap().unwrap().code, "app_list");
    }

    #[test]
    fn fail_all_ends_subscriptions() {
        let mut c = Correlator::new();
        let (_, mut rx) = c.subscribe("watch", json!({}));
        assert_eq!(c.fail_all(ClientError::ConnectionLost), 1);
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
