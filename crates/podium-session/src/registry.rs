//! Connection registries.
//!
//! Host side: an ordered collection of live follower links, pruned on
//! disconnect without disturbing the others. Follower side: at most one
//! upstream link, where replacement tears down the previous link first.
//! Arrival order is kept for diagnostics only; state ordering never
//! depends on it.

use crate::transport::LinkId;
use tracing::debug;

/// One registered link with its arrival position.
#[derive(Debug)]
pub struct Registered<T> {
    pub id: LinkId,
    pub arrival: u64,
    pub link: T,
}

/// Ordered set of live follower links (host side).
#[derive(Debug)]
pub struct ConnectionRegistry<T> {
    entries: Vec<Registered<T>>,
    next_arrival: u64,
}

impl<T> Default for ConnectionRegistry<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            next_arrival: 1,
        }
    }
}

impl<T> ConnectionRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a link. A re-registered id replaces the old entry but keeps
    /// a fresh arrival position.
    pub fn insert(&mut self, id: LinkId, link: T) -> Option<T> {
        let replaced = self.remove(id);
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.push(Registered { id, arrival, link });
        debug!("Registered {} (arrival {})", id, arrival);
        replaced
    }

    /// Remove a link, returning it for teardown. Other entries keep their
    /// positions.
    pub fn remove(&mut self, id: LinkId) -> Option<T> {
        let pos = self.entries.iter().position(|e| e.id == id)?;
        Some(self.entries.remove(pos).link)
    }

    pub fn get(&self, id: LinkId) -> Option<&T> {
        self.entries.iter().find(|e| e.id == id).map(|e| &e.link)
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.entries.iter().any(|e| e.id == id)
    }

    /// Links in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &Registered<T>> {
        self.entries.iter()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&mut self) -> Vec<T> {
        self.entries.drain(..).map(|e| e.link).collect()
    }

    /// Remove the oldest entry. Used where departures cannot be attributed
    /// to a specific link.
    pub fn remove_oldest(&mut self) -> Option<(LinkId, T)> {
        if self.entries.is_empty() {
            return None;
        }
        let entry = self.entries.remove(0);
        Some((entry.id, entry.link))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The single upstream link (follower side).
#[derive(Debug, Default)]
pub struct Upstream<T> {
    current: Option<(LinkId, T)>,
}

impl<T> Upstream<T> {
    pub fn new() -> Self {
        Self { current: None }
    }

    /// Install a new upstream link, returning the previous one so the
    /// caller can tear it down first.
    pub fn replace(&mut self, id: LinkId, link: T) -> Option<T> {
        let old = self.current.take().map(|(_, link)| link);
        self.current = Some((id, link));
        old
    }

    /// Clear the upstream if it matches the given id.
    pub fn clear(&mut self, id: LinkId) -> Option<T> {
        match self.current.take() {
            Some((current_id, link)) if current_id == id => Some(link),
            other => {
                self.current = other;
                None
            }
        }
    }

    pub fn take(&mut self) -> Option<T> {
        self.current.take().map(|(_, link)| link)
    }

    pub fn get(&self) -> Option<&T> {
        self.current.as_ref().map(|(_, link)| link)
    }

    pub fn id(&self) -> Option<LinkId> {
        self.current.as_ref().map(|(id, _)| *id)
    }

    pub fn is_connected(&self) -> bool {
        self.current.is_some()
    }
}
