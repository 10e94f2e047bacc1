//! Change events delivered to watchers.
use mantle_core::DynamicResource;

/// An ordered change notification for one (namespace, kind) selection.
///
/// Selector-scoped watches translate label transitions into the event the
/// watcher can act on: a resource entering the selection arrives as
/// [`Event::Created`], one leaving it as [`Event::Destroyed`], even when the
/// underlying mutation was an update.
#[derive(Clone, Debug)]
pub enum Event {
    Created(DynamicResource),
    Updated(DynamicResource),
    Destroyed(DynamicResource),
    /// Marks the end of the catch-up snapshot; carries the list version at
    /// which the snapshot was taken.
    Bookmark(u64),
}

impl Event {
    /// The resource carried by the event, unless it is a bookmark.
    #[must_use]
    pub fn resource(&self) -> Option<&DynamicResource> {
        match self {
            Event::Created(r) | Event::Updated(r) | Event::Destroyed(r) => Some(r),
            Event::Bookmark(_) => None,
        }
    }

    /// The store version the event was committed at.
    #[must_use]
    pub fn version(&self) -> u64 {
        match self {
            Event::Created(r) | Event::Updated(r) | Event::Destroyed(r) => r.metadata.version,
            Event::Bookmark(v) => *v,
        }
    }
}
