//! # Forward Cache
//!
//! Duplicate suppression for the relay path. Each message digest maps to a
//! small record tracking the neighbor we last exchanged it with and, once a
//! fan-out completes, an expiry deadline.
//!
//! The two facts gate forwarding differently:
//!
//! - An unexpired deadline suppresses the message for everyone: it was
//!   already fanned out and a second copy arriving from elsewhere is a
//!   flood echo.
//! - Before the deadline exists, only the recorded neighbor is suppressed:
//!   a message must never bounce straight back to the peer that supplied
//!   it, but the rest of the fan-out is still in flight.
//!
//! The cache is bounded; the oldest digest is evicted when full.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::address::{Digest, OverlayAddr};

#[derive(Clone, Debug, Default)]
struct CacheEntry {
    last_sender: Option<OverlayAddr>,
    expires_at: Option<Instant>,
}

/// Bounded map of message digests to forwarding state.
pub(crate) struct ForwardCache {
    entries: LruCache<Digest, CacheEntry>,
    ttl: Duration,
}

impl ForwardCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            ttl,
        }
    }

    /// Record the peer we most recently exchanged this digest with. The
    /// expiry deadline, if any, is untouched.
    pub fn mark_sender(&mut self, digest: Digest, sender: OverlayAddr) {
        let entry = self.entries.get_or_insert_mut(digest, CacheEntry::default);
        entry.last_sender = Some(sender);
    }

    /// Start the hard dedup window: the digest is suppressed for all
    /// candidates until the ttl elapses. Called when a fan-out completes.
    pub fn mark_expire(&mut self, digest: Digest) {
        let deadline = Instant::now() + self.ttl;
        let entry = self.entries.get_or_insert_mut(digest, CacheEntry::default);
        entry.expires_at = Some(deadline);
    }

    /// Whether a send of `digest` toward `candidate` must be skipped.
    ///
    /// True iff the digest is inside its dedup window, or no window has
    /// been opened yet and `candidate` is the recorded last sender. With no
    /// candidate only the window applies. An entry with neither fact set
    /// behaves like no entry at all.
    pub fn should_skip(&mut self, candidate: Option<&OverlayAddr>, digest: &Digest) -> bool {
        let Some(entry) = self.entries.get(digest) else {
            return false;
        };
        match entry.expires_at {
            Some(deadline) if deadline > Instant::now() => true,
            Some(_) => false,
            None => match (candidate, entry.last_sender.as_ref()) {
                (Some(candidate), Some(last)) => candidate == last,
                _ => false,
            },
        }
    }
}
