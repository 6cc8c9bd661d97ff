//! A concurrent unordered map that grows by online, cooperative resizing.
//!
//! Readers and writers never block on a resize: writers passing through an
//! in-progress migration each forward a small batch of entries from the old
//! table into its doubled-capacity successor, and the map's head swings
//! forward once the old table has fully drained.
//!
//! Memory reclamation is deferred through [`seize`]; see [`HashMap::guard`]
//! and [`HashMap::pin`] for how operations are protected.

mod map;
mod raw;

pub use map::{HashMap, HashMapBuilder, HashMapRef, NotFound};
pub use seize::{Collector, Guard, LocalGuard, OwnedGuard};
