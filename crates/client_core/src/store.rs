//! Ordered, duplicate-free message sequence for one open conversation.
//!
//! Records live in slots keyed by a monotonically increasing insertion
//! counter, so a confirmed record can take over the slot of the pending
//! record it replaces without shifting anything else. Two side indexes keep
//! the hot checks constant time: server id -> slot, and match key -> pending
//! local ids in insertion order.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use shared::{
    domain::{ConversationId, LocalId, MessageId, RecordId, UserId},
    protocol::MessagePayload,
};
use tracing::debug;

use crate::message::{MatchKey, MessageRecord, OutgoingMessage};

type Slot = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// A record with the same server id is already in the sequence.
    Duplicate,
    /// Took the place of the pending record with this local id.
    Superseded { local_id: LocalId },
    Appended,
    /// Kind that is never displayed.
    Hidden,
    ForeignConversation,
}

impl Reconciled {
    pub fn changed(&self) -> bool {
        matches!(self, Reconciled::Superseded { .. } | Reconciled::Appended)
    }
}

#[derive(Debug, Clone)]
struct PendingSlot {
    slot: Slot,
    key: MatchKey,
}

#[derive(Debug)]
pub struct MessageStore {
    conversation_id: ConversationId,
    local_user: UserId,
    next_slot: Slot,
    slots: BTreeMap<Slot, MessageRecord>,
    by_server_id: HashMap<MessageId, Slot>,
    pending: HashMap<LocalId, PendingSlot>,
    pending_by_match: HashMap<MatchKey, VecDeque<LocalId>>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, local_user: UserId) -> Self {
        Self {
            conversation_id,
            local_user,
            next_slot: 0,
            slots: BTreeMap::new(),
            by_server_id: HashMap::new(),
            pending: HashMap::new(),
            pending_by_match: HashMap::new(),
        }
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn local_user(&self) -> &UserId {
        &self.local_user
    }

    /// Appends a locally created record at the tail and returns its local id,
    /// which the caller keeps for rollback.
    pub fn append_pending(&mut self, outgoing: &OutgoingMessage, sender_id: &UserId) -> LocalId {
        let local_id = LocalId::generate();
        let record = MessageRecord::pending(
            local_id.clone(),
            self.conversation_id.clone(),
            sender_id.clone(),
            outgoing,
            Utc::now(),
        );
        let key = MatchKey::of(&record);
        let slot = self.push(record);

        self.pending_by_match
            .entry(key.clone())
            .or_default()
            .push_back(local_id.clone());
        self.pending.insert(local_id.clone(), PendingSlot { slot, key });
        local_id
    }

    /// Merges a confirmed record, from the send response or the real-time
    /// channel, into the sequence.
    pub fn reconcile_incoming(&mut self, payload: MessagePayload) -> Reconciled {
        if payload.conversation_id != self.conversation_id {
            return Reconciled::ForeignConversation;
        }
        if !payload.kind.is_visible() {
            return Reconciled::Hidden;
        }
        if self.by_server_id.contains_key(&payload.id) {
            debug!(message_id = %payload.id, "store: dropping duplicate delivery");
            return Reconciled::Duplicate;
        }

        let server_id = payload.id.clone();
        let record = MessageRecord::from(payload);

        if record.sender_id == self.local_user {
            if let Some(local_id) = self.take_oldest_pending(&MatchKey::of(&record)) {
                if let Some(pending) = self.pending.remove(&local_id) {
                    self.slots.insert(pending.slot, record);
                    self.by_server_id.insert(server_id, pending.slot);
                    debug!(local_id = %local_id, "store: pending record superseded");
                    return Reconciled::Superseded { local_id };
                }
            }
        }

        let slot = self.push(record);
        self.by_server_id.insert(server_id, slot);
        Reconciled::Appended
    }

    /// Removes the record if it is still present and still pending. Returns
    /// false when it was already reconciled or removed.
    pub fn remove_pending(&mut self, local_id: &LocalId) -> bool {
        let Some(pending) = self.pending.remove(local_id) else {
            return false;
        };

        if let Some(queue) = self.pending_by_match.get_mut(&pending.key) {
            queue.retain(|queued| queued != local_id);
            if queue.is_empty() {
                self.pending_by_match.remove(&pending.key);
            }
        }
        self.slots.remove(&pending.slot);
        true
    }

    /// Replaces every confirmed record with `history`, ordered by creation
    /// time. Records still awaiting confirmation stay at the tail unless the
    /// history already holds their confirmed copy; those are dropped and their
    /// local ids returned, oldest first.
    pub fn replace_history(&mut self, history: Vec<MessagePayload>) -> Vec<LocalId> {
        let mut history: Vec<MessagePayload> = history
            .into_iter()
            .filter(|payload| {
                payload.conversation_id == self.conversation_id && payload.kind.is_visible()
            })
            .collect();
        history.sort_by_key(|payload| payload.created_at);

        // Only records the store has not seen yet can confirm a pending send.
        let known: HashSet<MessageId> = self.by_server_id.keys().cloned().collect();

        let mut pending_records: Vec<(LocalId, MessageRecord)> = Vec::new();
        let mut pending_order: Vec<(Slot, LocalId)> = self
            .pending
            .iter()
            .map(|(local_id, pending)| (pending.slot, local_id.clone()))
            .collect();
        pending_order.sort_by_key(|(slot, _)| *slot);
        for (slot, local_id) in pending_order {
            if let Some(record) = self.slots.remove(&slot) {
                pending_records.push((local_id, record));
            }
        }

        self.slots.clear();
        self.by_server_id.clear();
        self.next_slot = 0;

        let mut superseded = Vec::new();
        for payload in history {
            if self.by_server_id.contains_key(&payload.id) {
                continue;
            }
            let server_id = payload.id.clone();
            let record = MessageRecord::from(payload);
            if record.sender_id == self.local_user && !known.contains(&server_id) {
                if let Some(local_id) = self.take_oldest_pending(&MatchKey::of(&record)) {
                    self.pending.remove(&local_id);
                    debug!(
                        local_id = %local_id,
                        message_id = %server_id,
                        "store: pending record confirmed by history"
                    );
                    superseded.push(local_id);
                }
            }
            let slot = self.push(record);
            self.by_server_id.insert(server_id, slot);
        }

        for (local_id, record) in pending_records {
            if !self.pending.contains_key(&local_id) {
                continue;
            }
            let slot = self.push(record);
            if let Some(pending) = self.pending.get_mut(&local_id) {
                pending.slot = slot;
            }
        }
        superseded
    }

    /// Marks the local user's confirmed records as read once another
    /// participant has read the conversation.
    pub fn apply_read_receipt(&mut self, reader_id: &UserId) -> bool {
        if reader_id == &self.local_user {
            return false;
        }

        let mut changed = false;
        for record in self.slots.values_mut() {
            if record.sender_id == self.local_user && !record.is_pending && !record.is_read {
                record.is_read = true;
                changed = true;
            }
        }
        changed
    }

    pub fn records(&self) -> impl Iterator<Item = &MessageRecord> + '_ {
        self.slots.values()
    }

    pub fn snapshot(&self) -> Vec<MessageRecord> {
        self.slots.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn position_of(&self, id: &RecordId) -> Option<usize> {
        let slot = match id {
            RecordId::Server(server_id) => *self.by_server_id.get(server_id)?,
            RecordId::Local(local_id) => self.pending.get(local_id)?.slot,
        };
        Some(self.slots.range(..slot).count())
    }

    pub fn is_pending(&self, local_id: &LocalId) -> bool {
        self.pending.contains_key(local_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn last_own_message(&self) -> Option<&MessageRecord> {
        self.slots
            .values()
            .rev()
            .find(|record| record.sender_id == self.local_user)
    }

    fn push(&mut self, record: MessageRecord) -> Slot {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.slots.insert(slot, record);
        slot
    }

    fn take_oldest_pending(&mut self, key: &MatchKey) -> Option<LocalId> {
        let queue = self.pending_by_match.get_mut(key)?;
        let local_id = queue.pop_front();
        if queue.is_empty() {
            self.pending_by_match.remove(key);
        }
        local_id
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
