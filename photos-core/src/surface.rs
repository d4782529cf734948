//! Host-side renderable surfaces.
//!
//! The host world owns surfaces: it hands out ids, knows which still exist
//! and delivers frames to viewers. The index only talks to it through
//! [`SurfaceHost`].

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::bitmap::Bitmap;
use crate::model::SurfaceId;

/// Surface allocation and presentation, implemented by the embedding host.
pub trait SurfaceHost: Send {
    /// Allocate a new surface. Ids are scarce and handed out sequentially.
    fn allocate(&mut self) -> SurfaceId;

    /// Whether the surface still exists in the host.
    fn exists(&self, surface: SurfaceId) -> bool;

    /// Push a frame to every current viewer of the surface.
    fn present(&mut self, surface: SurfaceId, bitmap: &Arc<Bitmap>);
}

/// In-process surface table.
///
/// Used by the command-line front end and by tests. Keeps the last frame
/// presented on each surface.
#[derive(Debug, Default)]
pub struct LocalSurfaces {
    next: i64,
    live: BTreeSet<SurfaceId>,
    frames: HashMap<SurfaceId, Arc<Bitmap>>,
    presented: u64,
}

impl LocalSurfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from surfaces that already exist, e.g. restored at boot.
    pub fn with_existing(existing: impl IntoIterator<Item = SurfaceId>) -> Self {
        let live: BTreeSet<SurfaceId> = existing.into_iter().collect();
        let next = live.iter().next_back().map_or(0, |id| id.0 + 1);
        Self {
            next,
            live,
            ..Self::default()
        }
    }

    /// Drop a surface, as if the host lost it.
    pub fn remove(&mut self, surface: SurfaceId) -> bool {
        self.frames.remove(&surface);
        self.live.remove(&surface)
    }

    /// Last frame presented on a surface.
    pub fn frame(&self, surface: SurfaceId) -> Option<&Arc<Bitmap>> {
        self.frames.get(&surface)
    }

    /// Total number of frames presented across all surfaces.
    pub fn presented(&self) -> u64 {
        self.presented
    }
}

impl SurfaceHost for LocalSurfaces {
    fn allocate(&mut self) -> SurfaceId {
        let id = SurfaceId(self.next);
        self.next += 1;
        self.live.insert(id);
        debug!(surface_id = %id, "Allocated surface");
        id
    }

    fn exists(&self, surface: SurfaceId) -> bool {
        self.live.contains(&surface)
    }

    fn present(&mut self, surface: SurfaceId, bitmap: &Arc<Bitmap>) {
        if self.live.contains(&surface) {
            self.frames.insert(surface, Arc::clone(bitmap));
            self.presented += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut surfaces = LocalSurfaces::new();
        assert_eq!(surfaces.allocate(), SurfaceId(0));
        assert_eq!(surfaces.allocate(), SurfaceId(1));
        assert!(surfaces.exists(SurfaceId(1)));
        assert!(!surfaces.exists(SurfaceId(2)));
    }

    #[test]
    fn test_allocation_continues_after_existing() {
        let mut surfaces = LocalSurfaces::with_existing([SurfaceId(4), SurfaceId(9)]);
        assert!(surfaces.exists(SurfaceId(4)));
        assert_eq!(surfaces.allocate(), SurfaceId(10));
    }

    #[test]
    fn test_present_records_frame() {
        let mut surfaces = LocalSurfaces::new();
        let id = surfaces.allocate();
        let frame = Arc::new(Bitmap::new(2, 2));
        surfaces.present(id, &frame);
        surfaces.present(SurfaceId(99), &frame);
        assert_eq!(surfaces.presented(), 1);
        assert!(surfaces.frame(id).is_some());
    }
}
