use std::collections::HashMap;

use peerlink_core::PeerId;
use tracing::debug;

// MARK: - PeerEntry

/// One `name,id,connected` line from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEntry {
    pub name: String,
    pub id: PeerId,
    pub connected: bool,
}

impl PeerEntry {
    /// Parse a single entry. Returns `None` for an empty name or a
    /// non-numeric id; a missing or non-numeric flag reads as disconnected.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut fields = line.splitn(3, ',');
        let name = fields.next().filter(|n| !n.is_empty())?;
        let id = fields.next()?.parse().ok()?;
        let connected = fields
            .next()
            .and_then(|flag| flag.trim().parse::<u32>().ok())
            .is_some_and(|flag| flag != 0);
        Some(Self { name: name.to_owned(), id, connected })
    }
}

// MARK: - DirectoryChange

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryChange {
    Joined { id: PeerId, name: String },
    Left { id: PeerId },
    /// The entry named this client; nothing changed.
    Ignored,
}

// MARK: - PeerDirectory

/// Peers currently signed in to the server, keyed by server-assigned id.
///
/// The owning client's own id is never a member.
#[derive(Debug, Clone, Default)]
pub struct PeerDirectory {
    owner: Option<PeerId>,
    peers: HashMap<PeerId, String>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with the sign-in listing for `owner`.
    ///
    /// Only newline-terminated lines are read. Returns the inserted peers in
    /// listing order.
    pub fn rebuild(&mut self, owner: PeerId, listing: &str) -> Vec<(PeerId, String)> {
        self.owner = Some(owner);
        self.peers.clear();

        let mut joined = Vec::new();
        for line in listing.split_inclusive('\n').filter(|l| l.ends_with('\n')) {
            match PeerEntry::parse(line) {
                Some(entry) if entry.id != owner => {
                    self.peers.insert(entry.id, entry.name.clone());
                    joined.push((entry.id, entry.name));
                }
                Some(_) => {}
                None => debug!("Skipping malformed peer entry {:?}", line),
            }
        }
        joined
    }

    /// Apply an incremental connected/disconnected notification.
    pub fn apply(&mut self, entry: PeerEntry) -> DirectoryChange {
        if Some(entry.id) == self.owner {
            return DirectoryChange::Ignored;
        }
        if entry.connected {
            self.peers.insert(entry.id, entry.name.clone());
            DirectoryChange::Joined { id: entry.id, name: entry.name }
        } else {
            self.peers.remove(&entry.id);
            DirectoryChange::Left { id: entry.id }
        }
    }

    /// Returns `false` (and leaves the directory unchanged) for the owner id.
    pub fn insert(&mut self, id: PeerId, name: impl Into<String>) -> bool {
        if Some(id) == self.owner {
            return false;
        }
        self.peers.insert(id, name.into());
        true
    }

    pub fn remove(&mut self, id: PeerId) -> Option<String> {
        self.peers.remove(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&str> {
        self.peers.get(&id).map(String::as_str)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PeerId, &str)> {
        self.peers.iter().map(|(id, name)| (*id, name.as_str()))
    }

    /// Owned copy for handing across task boundaries.
    pub fn snapshot(&self) -> HashMap<PeerId, String> {
        self.peers.clone()
    }

    /// Forget every peer and the owner.
    pub fn clear(&mut self) {
        self.owner = None;
        self.peers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rebuild_excludes_owner() {
        let mut dir = PeerDirectory::new();
        let joined = dir.rebuild(PeerId(3), "alice,7,1\ncarol,3,1\nbob,8,1\n");
        assert_eq!(
            joined,
            vec![(PeerId(7), "alice".to_owned()), (PeerId(8), "bob".to_owned())]
        );
        assert_eq!(dir.len(), 2);
        assert!(!dir.contains(PeerId(3)));
        assert_eq!(dir.get(PeerId(8)), Some("bob"));
    }

    #[test]
    fn rebuild_ignores_unterminated_and_malformed_lines() {
        let mut dir = PeerDirectory::new();
        dir.rebuild(PeerId(1), ",5,1\ndave,x,1\nerin,6,1\nfrank,9,1");
        assert_eq!(dir.snapshot(), HashMap::from([(PeerId(6), "erin".to_owned())]));
    }

    #[test]
    fn deltas_add_and_remove() {
        let mut dir = PeerDirectory::new();
        dir.rebuild(PeerId(1), "");

        let change = dir.apply(PeerEntry::parse("gina,4,1").unwrap());
        assert_eq!(change, DirectoryChange::Joined { id: PeerId(4), name: "gina".into() });
        assert!(dir.contains(PeerId(4)));

        let change = dir.apply(PeerEntry::parse("gina,4,0\n").unwrap());
        assert_eq!(change, DirectoryChange::Left { id: PeerId(4) });
        assert!(dir.is_empty());

        assert_eq!(dir.apply(PeerEntry::parse("me,1,1").unwrap()), DirectoryChange::Ignored);
        assert!(!dir.insert(PeerId(1), "me"));
    }

    #[test]
    fn entry_without_flag_reads_disconnected() {
        let entry = PeerEntry::parse("hank,12").unwrap();
        assert_eq!(entry.id, PeerId(12));
        assert!(!entry.connected);
        assert!(PeerEntry::parse("").is_none());
    }
}
