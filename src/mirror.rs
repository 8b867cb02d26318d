//! Local copy of server-side state.
//!
//! Entities are only ever replaced by a freshly parsed instance, never
//! patched field by field. Every apply method reports whether the content
//! actually changed so that cosmetic re-sends do not produce events.

use crate::types::{Client, Group, ProtocolVersion, ServerStatus, Stream};

/// What a client notification says happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    Connected,
    Disconnected,
    Updated,
    Deleted,
}

impl ClientEventKind {
    /// Map a `Client.On*` notification method to its event kind
    pub fn from_method(method: &str) -> Option<Self> {
        match method {
            "Client.OnConnect" => Some(ClientEventKind::Connected),
            "Client.OnDisconnect" => Some(ClientEventKind::Disconnected),
            "Client.OnUpdate" => Some(ClientEventKind::Updated),
            "Client.OnDelete" => Some(ClientEventKind::Deleted),
            _ => None,
        }
    }
}

/// Mirror of the server's streams, groups and clients
#[derive(Debug, Clone)]
pub struct StateMirror {
    status: ServerStatus,
}

impl StateMirror {
    /// Create an empty mirror; it stays stale until the first full status
    pub fn new() -> Self {
        Self {
            status: ServerStatus {
                stale: true,
                ..ServerStatus::default()
            },
        }
    }

    /// Replace the whole mirror
    ///
    /// Returns true if the new state differs from the old one (including a
    /// stale mirror becoming fresh).
    pub fn apply_full_status(&mut self, mut status: ServerStatus) -> bool {
        status.stale = false;
        status.sort();
        if status == self.status {
            return false;
        }
        self.status = status;
        true
    }

    /// Apply a client notification
    ///
    /// Unknown clients are inserted, known ones replaced. Returns the stored
    /// client when something changed, `None` for a no-op.
    pub fn apply_client_event(&mut self, mut client: Client, kind: ClientEventKind) -> Option<Client> {
        match kind {
            ClientEventKind::Connected => client.connected = true,
            ClientEventKind::Disconnected => client.connected = false,
            ClientEventKind::Deleted => client.deleted = true,
            ClientEventKind::Updated => {}
        }

        match self.locate_client(&client.id) {
            Some((group_idx, client_idx)) => {
                let group = &mut self.status.groups[group_idx];
                if group.clients[client_idx] == client {
                    return None;
                }
                group.clients[client_idx] = client.clone();
                self.status.sort();
                Some(client)
            }
            None if kind == ClientEventKind::Deleted => {
                tracing::debug!("Ignoring delete for unknown client {}", client.id);
                None
            }
            None => {
                tracing::debug!("Adding new client {}", client.id);
                self.status.groups.push(Group::for_legacy_client(client.clone()));
                self.status.sort();
                Some(client)
            }
        }
    }

    /// Insert or replace a stream; returns true if something changed
    pub fn apply_stream_update(&mut self, stream: Stream) -> bool {
        match self.status.streams.iter_mut().find(|s| s.id == stream.id) {
            Some(existing) if *existing == stream => false,
            Some(existing) => {
                *existing = stream;
                true
            }
            None => {
                self.status.streams.push(stream);
                true
            }
        }
    }

    /// Replace a known client with a modified copy
    ///
    /// Returns the stored client when something changed, `None` if the
    /// client is unknown or `update` left it as it was.
    pub fn update_client<F>(&mut self, id: &str, update: F) -> Option<Client>
    where
        F: FnOnce(&mut Client),
    {
        let mut client = self.status.client(id)?.clone();
        update(&mut client);
        self.apply_client_event(client, ClientEventKind::Updated)
    }

    /// Replace a known group with a modified copy
    pub fn update_group<F>(&mut self, id: &str, update: F) -> Option<Group>
    where
        F: FnOnce(&mut Group),
    {
        let idx = self.status.groups.iter().position(|g| g.id == id)?;
        let mut group = self.status.groups[idx].clone();
        update(&mut group);
        group.sort_clients();
        if group == self.status.groups[idx] {
            return None;
        }
        self.status.groups[idx] = group.clone();
        self.status.sort();
        Some(group)
    }

    /// Remove a client for good; returns true if it was present
    ///
    /// A group that only existed to hold this client goes with it.
    pub fn purge_client(&mut self, id: &str) -> bool {
        let Some((group_idx, client_idx)) = self.locate_client(id) else {
            return false;
        };

        let group = &mut self.status.groups[group_idx];
        group.clients.remove(client_idx);
        if group.clients.is_empty() && group.id == id {
            self.status.groups.remove(group_idx);
        }
        self.status.sort();
        true
    }

    /// Record the schema generation the server speaks
    pub fn set_protocol(&mut self, protocol: ProtocolVersion) {
        self.status.protocol = protocol;
    }

    /// Flag the content as last-known-good from a lost connection
    pub fn mark_stale(&mut self) {
        self.status.stale = true;
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.status.protocol
    }

    pub fn is_stale(&self) -> bool {
        self.status.stale
    }

    /// Borrow the current state
    pub fn status(&self) -> &ServerStatus {
        &self.status
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> ServerStatus {
        self.status.clone()
    }

    fn locate_client(&self, id: &str) -> Option<(usize, usize)> {
        self.status
            .groups
            .iter()
            .enumerate()
            .find_map(|(group_idx, group)| {
                group
                    .clients
                    .iter()
                    .position(|c| c.id == id)
                    .map(|client_idx| (group_idx, client_idx))
            })
    }
}

impl Default for StateMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{StreamStatus, Volume};
    use serde_json::json;

    fn client(mac: &str, percent: u8) -> Client {
        serde_json::from_value(json!({
            "MAC": mac,
            "IP": "10.0.0.2",
            "host": "kitchen",
            "version": "0.5.0",
            "name": "",
            "volume": {"percent": percent, "muted": false},
            "latency": 0,
            "stream": "s1",
            "lastSeen": {"sec": 100, "usec": 5},
            "connected": true
        }))
        .unwrap()
    }

    fn stream(id: &str, status: &str) -> Stream {
        serde_json::from_value(json!({"id": id, "status": status, "uri": {"raw": "pipe:///tmp/x"}})).unwrap()
    }

    fn mirror_with(clients: Vec<Client>) -> StateMirror {
        let mut mirror = StateMirror::new();
        mirror.apply_full_status(ServerStatus {
            groups: clients.into_iter().map(Group::for_legacy_client).collect(),
            ..ServerStatus::default()
        });
        mirror
    }

    #[test]
    fn test_new_mirror_is_empty_and_stale() {
        let mirror = StateMirror::new();
        assert!(mirror.is_stale());
        assert_eq!(mirror.snapshot().clients().count(), 0);
    }

    #[test]
    fn test_update_for_unknown_client_inserts() {
        let mut mirror = StateMirror::new();
        let changed = mirror.apply_client_event(client("AA:BB", 30), ClientEventKind::Updated);

        assert_eq!(changed.unwrap().id, "AA:BB");
        assert_eq!(mirror.snapshot().client("AA:BB").unwrap().volume().percent, 30);
    }

    #[test]
    fn test_same_payload_twice_changes_once() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);

        assert!(mirror
            .apply_client_event(client("AA:BB", 80), ClientEventKind::Updated)
            .is_some());
        assert!(mirror
            .apply_client_event(client("AA:BB", 80), ClientEventKind::Updated)
            .is_none());
    }

    #[test]
    fn test_identical_resend_of_known_client_is_noop() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);
        assert!(mirror
            .apply_client_event(client("AA:BB", 50), ClientEventKind::Updated)
            .is_none());
    }

    #[test]
    fn test_update_replaces_whole_client() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);

        let mut update = client("AA:BB", 80);
        update.config.latency = 40;
        update.host.ip = "10.0.0.9".to_string();
        mirror.apply_client_event(update.clone(), ClientEventKind::Updated);

        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.client("AA:BB"), Some(&update));
        assert_eq!(snapshot.clients().count(), 1);
    }

    #[test]
    fn test_last_writer_wins() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);
        mirror.apply_client_event(client("AA:BB", 10), ClientEventKind::Updated);
        mirror.apply_client_event(client("AA:BB", 90), ClientEventKind::Updated);

        assert_eq!(
            mirror.snapshot().client("AA:BB").unwrap().volume(),
            Volume::new(90, false)
        );
    }

    #[test]
    fn test_disconnect_keeps_record() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);
        let changed = mirror.apply_client_event(client("AA:BB", 50), ClientEventKind::Disconnected);

        assert!(!changed.unwrap().connected);
        let snapshot = mirror.snapshot();
        assert!(!snapshot.client("AA:BB").unwrap().connected);
        assert_eq!(snapshot.clients().count(), 1);
    }

    #[test]
    fn test_delete_marks_then_purge_removes() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50), client("CC:DD", 60)]);

        assert!(mirror
            .apply_client_event(client("AA:BB", 50), ClientEventKind::Deleted)
            .is_some());
        let snapshot = mirror.snapshot();
        assert!(snapshot.client("AA:BB").unwrap().deleted);
        assert_eq!(snapshot.clients().count(), 1);

        assert!(mirror.purge_client("AA:BB"));
        assert!(!mirror.purge_client("AA:BB"));
        let snapshot = mirror.snapshot();
        assert!(snapshot.client("AA:BB").is_none());
        assert_eq!(snapshot.groups.len(), 1);
    }

    #[test]
    fn test_delete_of_unknown_client_is_noop() {
        let mut mirror = StateMirror::new();
        assert!(mirror
            .apply_client_event(client("AA:BB", 50), ClientEventKind::Deleted)
            .is_none());
        assert!(mirror.snapshot().groups.is_empty());
    }

    #[test]
    fn test_stream_updates() {
        let mut mirror = StateMirror::new();

        assert!(mirror.apply_stream_update(stream("s1", "idle")));
        assert!(!mirror.apply_stream_update(stream("s1", "idle")));
        assert!(mirror.apply_stream_update(stream("s1", "playing")));
        assert!(mirror.apply_stream_update(stream("s2", "idle")));

        let snapshot = mirror.snapshot();
        assert_eq!(snapshot.streams.len(), 2);
        assert_eq!(snapshot.stream("s1").unwrap().status, StreamStatus::Playing);
    }

    #[test]
    fn test_full_status_replaces_and_clears_stale() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);
        assert!(!mirror.is_stale());

        mirror.mark_stale();
        assert!(mirror.is_stale());

        // same content, but the mirror becomes fresh again
        let fresh = ServerStatus {
            groups: vec![Group::for_legacy_client(client("AA:BB", 50))],
            ..ServerStatus::default()
        };
        assert!(mirror.apply_full_status(fresh.clone()));
        assert!(!mirror.apply_full_status(fresh));

        let replaced = ServerStatus {
            groups: vec![Group::for_legacy_client(client("EE:FF", 5))],
            ..ServerStatus::default()
        };
        assert!(mirror.apply_full_status(replaced));
        let snapshot = mirror.snapshot();
        assert!(snapshot.client("AA:BB").is_none());
        assert!(snapshot.client("EE:FF").is_some());
    }

    #[test]
    fn test_update_client_and_group() {
        let mut mirror = mirror_with(vec![client("AA:BB", 50)]);

        let changed = mirror.update_client("AA:BB", |c| c.config.name = "Kitchen".to_string());
        assert_eq!(changed.unwrap().visible_name(), "Kitchen");
        assert!(mirror
            .update_client("AA:BB", |c| c.config.name = "Kitchen".to_string())
            .is_none());
        assert!(mirror.update_client("EE:FF", |c| c.config.latency = 5).is_none());

        let group = mirror.update_group("AA:BB", |g| g.muted = true).unwrap();
        assert!(group.muted);
        assert!(mirror.update_group("AA:BB", |g| g.muted = true).is_none());
        assert!(mirror.snapshot().group("AA:BB").unwrap().muted);
    }

    #[test]
    fn test_client_event_kind_from_method() {
        assert_eq!(
            ClientEventKind::from_method("Client.OnConnect"),
            Some(ClientEventKind::Connected)
        );
        assert_eq!(
            ClientEventKind::from_method("Client.OnDelete"),
            Some(ClientEventKind::Deleted)
        );
        assert_eq!(ClientEventKind::from_method("Client.OnVolumeChanged"), None);
    }
}
