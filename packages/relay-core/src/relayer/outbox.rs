use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::types::{MessageStatus, RelayMessage};
use crate::{Error, Result};

#[derive(Default)]
struct OutboxInner {
    messages: HashMap<String, RelayMessage>,
    /// Ids currently owned by a submission, a confirmation poller or a
    /// pending retry.
    in_flight: HashSet<String>,
    /// Terminal ids in the order they settled, for eviction.
    terminal: VecDeque<String>,
    /// Evicted terminal records with payload and signature stripped. They
    /// still answer lookups and deduplicate replayed events.
    archive: HashMap<String, RelayMessage>,
}

impl OutboxInner {
    fn contains(&self, id: &str) -> bool {
        self.messages.contains_key(id) || self.archive.contains_key(id)
    }
}

/// Every message the relay knows about, keyed by id. All status changes go
/// through [`Outbox::transition`], which enforces the lifecycle.
///
/// Only the newest `retain_terminal` settled messages are kept in full; older
/// ones are compacted into an archive and never forgotten.
pub struct Outbox {
    retain_terminal: usize,
    inner: RwLock<OutboxInner>,
}

impl Outbox {
    pub fn new(retain_terminal: usize) -> Self {
        Self {
            retain_terminal,
            inner: RwLock::new(OutboxInner::default()),
        }
    }

    /// Adds a new message. Returns false when a message with the same id is
    /// already known.
    pub fn insert(&self, message: RelayMessage) -> bool {
        let mut inner = self.inner.write();
        if inner.contains(&message.id) {
            return false;
        }
        inner.messages.insert(message.id.clone(), message);
        true
    }

    /// Looks up a message, falling back to the archive of compacted
    /// settled records.
    pub fn get(&self, id: &str) -> Option<RelayMessage> {
        let inner = self.inner.read();
        inner.messages.get(id).or_else(|| inner.archive.get(id)).cloned()
    }

    /// Retained messages, oldest first. Archived records are not listed.
    pub fn messages(&self) -> Vec<RelayMessage> {
        let mut messages: Vec<_> = self.inner.read().messages.values().cloned().collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        messages
    }

    pub fn len(&self) -> usize {
        self.inner.read().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn archived(&self) -> usize {
        self.inner.read().archive.len()
    }

    /// Messages not yet `Confirmed` or `Failed`.
    pub fn backlog(&self) -> usize {
        let inner = self.inner.read();
        inner.messages.len() - inner.terminal.len()
    }

    /// Takes ownership of a `Pending` message for one submission attempt.
    pub fn claim(&self, id: &str) -> Option<RelayMessage> {
        let mut inner = self.inner.write();
        let status = inner.messages.get(id)?.status;
        if status != MessageStatus::Pending || !inner.in_flight.insert(id.to_string()) {
            return None;
        }
        inner.messages.get(id).cloned()
    }

    /// Gives up ownership without changing status.
    pub fn release(&self, id: &str) {
        self.inner.write().in_flight.remove(id);
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.inner.read().in_flight.contains(id)
    }

    /// Moves `id` to `next`, applying `update` to the record first. Rejects
    /// transitions the lifecycle does not allow. Returning to `Pending` or
    /// reaching a terminal state releases ownership.
    pub fn transition(
        &self,
        id: &str,
        next: MessageStatus,
        update: impl FnOnce(&mut RelayMessage),
    ) -> Result<RelayMessage> {
        let mut inner = self.inner.write();
        if let Some(archived) = inner.archive.get(id) {
            return Err(Error::Validation(format!(
                "message {} already settled as {}",
                id, archived.status
            )));
        }
        let message = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))?;
        if !message.status.can_transition_to(next) {
            return Err(Error::Validation(format!(
                "message {} cannot move from {} to {}",
                id, message.status, next
            )));
        }

        update(message);
        message.status = next;
        let updated = message.clone();

        if next == MessageStatus::Pending || next.is_terminal() {
            inner.in_flight.remove(id);
        }
        if next.is_terminal() {
            inner.terminal.push_back(id.to_string());
            while inner.terminal.len() > self.retain_terminal {
                let Some(evicted) = inner.terminal.pop_front() else {
                    break;
                };
                if let Some(mut record) = inner.messages.remove(&evicted) {
                    record.payload = Vec::new();
                    record.signature = Vec::new();
                    inner.archive.insert(evicted, record);
                }
            }
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageKind;
    use chrono::{Duration, Utc};

    fn message(id: &str, age_secs: i64) -> RelayMessage {
        RelayMessage {
            id: id.to_string(),
            kind: MessageKind::RepaymentConfirmation,
            target_chain: "base".to_string(),
            payload: vec![1, 2, 3],
            signature: vec![4; 64],
            created_at: Utc::now() - Duration::seconds(age_secs),
            retry_count: 0,
            status: MessageStatus::Pending,
            tx_hash: None,
            last_error: None,
        }
    }

    #[test]
    fn test_insert_deduplicates() {
        let outbox = Outbox::new(10);
        assert!(outbox.insert(message("a", 0)));
        assert!(!outbox.insert(message("a", 0)));
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.backlog(), 1);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let outbox = Outbox::new(10);
        outbox.insert(message("a", 0));
        assert!(outbox.claim("a").is_some());
        assert!(outbox.claim("a").is_none());
        outbox.release("a");
        assert!(outbox.claim("a").is_some());
        assert!(outbox.claim("missing").is_none());
    }

    #[test]
    fn test_transition_enforces_lifecycle() {
        let outbox = Outbox::new(10);
        outbox.insert(message("a", 0));
        outbox.claim("a");

        let sent = outbox
            .transition("a", MessageStatus::Sent, |m| m.tx_hash = Some("0x01".into()))
            .unwrap();
        assert_eq!(sent.tx_hash.as_deref(), Some("0x01"));
        assert!(outbox.is_in_flight("a"));

        let err = outbox.transition("a", MessageStatus::Pending, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(outbox.get("a").unwrap().status, MessageStatus::Sent);

        outbox
            .transition("a", MessageStatus::Retrying, |m| m.retry_count += 1)
            .unwrap();
        outbox.transition("a", MessageStatus::Pending, |_| {}).unwrap();
        assert!(!outbox.is_in_flight("a"));
        assert_eq!(outbox.get("a").unwrap().retry_count, 1);

        assert!(matches!(
            outbox.transition("b", MessageStatus::Sent, |_| {}),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_terminal_records_compacted_oldest_first() {
        let outbox = Outbox::new(2);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            outbox.insert(message(id, 10 - i as i64));
            outbox.claim(id);
            outbox
                .transition(id, MessageStatus::Failed, |m| m.last_error = Some("rejected".into()))
                .unwrap();
        }
        outbox.insert(message("d", 0));

        assert_eq!(outbox.archived(), 1);
        assert_eq!(outbox.backlog(), 1);
        let ids: Vec<_> = outbox.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["b", "c", "d"]);

        // the oldest failure is still queryable and still deduplicates
        let archived = outbox.get("a").unwrap();
        assert_eq!(archived.status, MessageStatus::Failed);
        assert_eq!(archived.last_error.as_deref(), Some("rejected"));
        assert!(archived.payload.is_empty());
        assert!(!outbox.insert(message("a", 0)));
        assert!(outbox.claim("a").is_none());
        assert!(matches!(
            outbox.transition("a", MessageStatus::Pending, |_| {}),
            Err(Error::Validation(_))
        ));
        assert_eq!(outbox.get("b").unwrap().payload, vec![1, 2, 3]);
    }
}
