//! Membership table and best-effort fan-out.
//!
//! Owned by one actor (a chat coordinator or a room host), so no locks
//! guard it. Each member has its own
//! bounded outbound queue; a full or closed queue drops the message for
//! that member only and is counted. Members that miss updates catch up
//! through pull-sync.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::room::RoomKey;
use crate::session::{DeliveryFailure, Outbound, SessionAttachment, SessionId, Transport};

/// Who receives a fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fanout {
    /// Everyone except the originating session (client-originated traffic)
    ExceptSender(SessionId),
    /// Everyone, including the subject of the event (system events)
    Everyone,
}

impl Fanout {
    fn includes(&self, session_id: &SessionId) -> bool {
        match self {
            Fanout::ExceptSender(sender) => sender != session_id,
            Fanout::Everyone => true,
        }
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: u64,
}

/// Counters readable from outside the owning task.
#[derive(Debug, Default)]
pub struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    active_sessions: AtomicU64,
}

impl AtomicBroadcastStats {
    pub fn snapshot(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

/// A registered session.
pub struct Member {
    pub attachment: SessionAttachment,
    pub transport: Transport,
    pub joined: HashSet<RoomKey>,
}

impl Member {
    pub fn new(attachment: SessionAttachment, transport: Transport) -> Self {
        let joined = attachment.joined_keys().into_iter().collect();
        Self {
            attachment,
            transport,
            joined,
        }
    }

    /// Sync the attachment's room list with `joined`.
    pub fn record_rooms(&mut self) {
        self.attachment.set_joined(self.joined.iter());
    }
}

/// Sessions of one chat route.
#[derive(Default)]
pub struct Membership {
    members: HashMap<SessionId, Member>,
    stats: Arc<AtomicBroadcastStats>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Share the counters with an existing handle.
    pub fn with_stats(stats: Arc<AtomicBroadcastStats>) -> Self {
        Self {
            members: HashMap::new(),
            stats,
        }
    }

    pub fn stats_handle(&self) -> Arc<AtomicBroadcastStats> {
        self.stats.clone()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    pub fn insert(&mut self, member: Member) {
        self.members.insert(member.attachment.session_id, member);
        self.publish_size();
    }

    /// Remove a session. Removing an absent session is a no-op.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<Member> {
        let removed = self.members.remove(session_id);
        self.publish_size();
        removed
    }

    pub fn clear(&mut self) {
        self.members.clear();
        self.publish_size();
    }

    pub fn get(&self, session_id: &SessionId) -> Option<&Member> {
        self.members.get(session_id)
    }

    pub fn get_mut(&mut self, session_id: &SessionId) -> Option<&mut Member> {
        self.members.get_mut(session_id)
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.members.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.members.keys().copied().collect()
    }

    /// Members joined to `key`, optionally not counting one session.
    pub fn joined_count(&self, key: &RoomKey, excluding: Option<&SessionId>) -> usize {
        self.members
            .iter()
            .filter(|(id, member)| Some(*id) != excluding && member.joined.contains(key))
            .count()
    }

    /// Whether any member still has `key` joined.
    pub fn room_in_use(&self, key: &RoomKey) -> bool {
        self.joined_count(key, None) > 0
    }

    /// Queue a message for one session.
    pub fn send_to(&self, session_id: &SessionId, message: Outbound) -> bool {
        match self.members.get(session_id) {
            Some(member) => self.deliver(session_id, &member.transport, message),
            None => false,
        }
    }

    /// Fan out to members joined to `key`. Returns the number of queues the
    /// message reached.
    pub fn broadcast_room(&self, key: &RoomKey, message: Outbound, fanout: Fanout) -> usize {
        self.fan_out(message, fanout, |member| member.joined.contains(key))
    }

    /// Fan out to every member of the chat.
    pub fn broadcast_all(&self, message: Outbound, fanout: Fanout) -> usize {
        self.fan_out(message, fanout, |_| true)
    }

    fn fan_out(&self, message: Outbound, fanout: Fanout, filter: impl Fn(&Member) -> bool) -> usize {
        self.members
            .iter()
            .filter(|(id, member)| fanout.includes(id) && filter(member))
            .filter(|(id, member)| self.deliver(id, &member.transport, message.clone()))
            .count()
    }

    fn deliver(&self, session_id: &SessionId, transport: &Transport, message: Outbound) -> bool {
        match transport.try_send(message) {
            Ok(()) => {
                self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(failure) => {
                self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
                match failure {
                    DeliveryFailure::Full => {
                        log::warn!("Outbound queue full for session {session_id}, dropping message")
                    }
                    DeliveryFailure::Closed => {
                        log::debug!("Session {session_id} writer gone, dropping message")
                    }
                }
                false
            }
        }
    }

    fn publish_size(&self) {
        self.stats
            .active_sessions
            .store(self.members.len() as u64, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::room::{ChatRoute, CrdtType};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn member(capacity: usize) -> (Member, mpsc::Receiver<Outbound>) {
        let route = ChatRoute::new("o", "p", "c").unwrap();
        let attachment = SessionAttachment::new(
            Uuid::new_v4(),
            &Identity::new("u", ["o"]),
            &route,
            route.path(),
            None,
        );
        let (transport, rx) = Transport::channel(capacity);
        (Member::new(attachment, transport), rx)
    }

    fn key() -> RoomKey {
        RoomKey::new("o/p".parse().unwrap(), CrdtType::Yrs)
    }

    fn frame(byte: u8) -> Outbound {
        Outbound::Binary(Arc::new(vec![byte]))
    }

    #[test]
    fn test_room_fanout_excludes_sender() {
        let mut members = Membership::new();
        let (mut a, mut rx_a) = member(8);
        let (mut b, mut rx_b) = member(8);
        let (c, mut rx_c) = member(8);
        a.joined.insert(key());
        b.joined.insert(key());
        let sender = a.attachment.session_id;
        members.insert(a);
        members.insert(b);
        members.insert(c);

        let reached = members.broadcast_room(&key(), frame(1), Fanout::ExceptSender(sender));
        assert_eq!(reached, 1);
        assert!(rx_a.try_recv().is_err());
        assert_eq!(rx_b.try_recv().unwrap(), frame(1));
        // Not joined to the room
        assert!(rx_c.try_recv().is_err());
    }

    #[test]
    fn test_everyone_includes_subject() {
        let mut members = Membership::new();
        let (a, mut rx_a) = member(8);
        let (b, mut rx_b) = member(8);
        members.insert(a);
        members.insert(b);

        let message = Outbound::Text("{\"type\":\"member-left\"}".into());
        assert_eq!(members.broadcast_all(message.clone(), Fanout::Everyone), 2);
        assert_eq!(rx_a.try_recv().unwrap(), message);
        assert_eq!(rx_b.try_recv().unwrap(), message);
    }

    #[test]
    fn test_slow_member_does_not_block_others() {
        let mut members = Membership::new();
        let (slow, _rx_slow) = member(1);
        let (fast, mut rx_fast) = member(8);
        members.insert(slow);
        members.insert(fast);

        for i in 0..4 {
            members.broadcast_all(frame(i), Fanout::Everyone);
        }
        let mut received = 0;
        while rx_fast.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 4);

        let stats = members.stats();
        assert_eq!(stats.messages_sent, 5);
        assert_eq!(stats.messages_dropped, 3);
        assert_eq!(stats.active_sessions, 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut members = Membership::new();
        let (a, _rx) = member(8);
        let id = a.attachment.session_id;
        members.insert(a);

        assert!(members.remove(&id).is_some());
        assert!(members.remove(&id).is_none());
        assert!(members.is_empty());
        assert_eq!(members.stats().active_sessions, 0);
    }

    #[test]
    fn test_joined_count_excluding() {
        let mut members = Membership::new();
        let (mut a, _ra) = member(8);
        a.joined.insert(key());
        let id = a.attachment.session_id;
        members.insert(a);

        assert_eq!(members.joined_count(&key(), None), 1);
        assert_eq!(members.joined_count(&key(), Some(&id)), 0);
        assert!(members.room_in_use(&key()));
    }

    #[test]
    fn test_member_restores_rooms_from_attachment() {
        let (mut a, _rx) = member(8);
        a.joined.insert(key());
        a.record_rooms();
        let restored = Member::new(a.attachment.clone(), a.transport.clone());
        assert!(restored.joined.contains(&key()));
    }
}
