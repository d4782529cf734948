//! Per-surface render synchronization.
//!
//! Each bound photo owns a [`Renderer`] that walks
//! `Idle → Loading → Ready → Drawn`. Renderers never do I/O themselves: a
//! render opportunity either yields nothing, asks the caller to start a
//! storage read, or hands back a bitmap to present.
//!
//! Two process-wide budgets live in [`RenderGates`], owned by the scheduler:
//!
//! - a single-permit semaphore, so at most one storage read is in flight
//!   across all renderers;
//! - a per-cycle draw allowance, reset by [`RenderGates::begin_cycle`].

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::bitmap::Bitmap;
use crate::model::PhotoId;

/// Renderer lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderState {
    /// No bitmap cached.
    Idle,
    /// Storage read in flight.
    Loading,
    /// Bitmap cached, not yet presented.
    Ready,
    /// Presented. Terminal until `refresh`.
    Drawn,
}

/// Process-wide render budgets.
#[derive(Debug)]
pub struct RenderGates {
    loads: Arc<Semaphore>,
    max_loads: usize,
    draws_per_cycle: usize,
    draws_remaining: usize,
    cycle: u64,
}

impl Default for RenderGates {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

impl RenderGates {
    pub fn new(max_loads: usize, draws_per_cycle: usize) -> Self {
        Self {
            loads: Arc::new(Semaphore::new(max_loads)),
            max_loads,
            draws_per_cycle,
            draws_remaining: draws_per_cycle,
            cycle: 0,
        }
    }

    /// Cycle boundary: restore the draw allowance.
    pub fn begin_cycle(&mut self) {
        self.cycle += 1;
        self.draws_remaining = self.draws_per_cycle;
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Reserve the load slot if it is free.
    pub fn try_begin_load(&self) -> Option<LoadPermit> {
        Arc::clone(&self.loads)
            .try_acquire_owned()
            .ok()
            .map(|permit| LoadPermit { _permit: permit })
    }

    /// Number of storage reads currently holding a permit.
    pub fn loads_in_flight(&self) -> usize {
        self.max_loads.saturating_sub(self.loads.available_permits())
    }

    fn try_draw(&mut self) -> bool {
        if self.draws_remaining == 0 {
            return false;
        }
        self.draws_remaining -= 1;
        true
    }
}

/// Held for the duration of one storage read. Dropping it frees the slot.
#[derive(Debug)]
pub struct LoadPermit {
    _permit: OwnedSemaphorePermit,
}

/// Issued when a renderer enters `Loading`; returned with the result.
#[derive(Debug)]
pub struct LoadTicket {
    pub photo_id: PhotoId,
    pub generation: u64,
    pub permit: LoadPermit,
}

/// What the caller must do after a render opportunity.
#[derive(Debug)]
pub enum RenderStep {
    /// Nothing this time.
    Skip,
    /// Start a storage read and hand the ticket back with the result.
    Load(LoadTicket),
    /// Present this bitmap to the surface's viewers.
    Draw(Arc<Bitmap>),
}

#[derive(Debug)]
pub struct Renderer {
    photo_id: PhotoId,
    state: RenderState,
    bitmap: Option<Arc<Bitmap>>,
    generation: u64,
}

impl Renderer {
    pub fn new(photo_id: PhotoId) -> Self {
        Self {
            photo_id,
            state: RenderState::Idle,
            bitmap: None,
            generation: 0,
        }
    }

    pub fn state(&self) -> RenderState {
        self.state
    }

    pub fn bitmap(&self) -> Option<&Arc<Bitmap>> {
        self.bitmap.as_ref()
    }

    /// Handle one render opportunity. Called very often; must stay cheap.
    pub fn render(&mut self, gates: &mut RenderGates) -> RenderStep {
        match self.state {
            RenderState::Loading | RenderState::Drawn => RenderStep::Skip,
            RenderState::Idle => match gates.try_begin_load() {
                Some(permit) => {
                    self.state = RenderState::Loading;
                    debug!(photo_id = %self.photo_id, "Renderer loading");
                    RenderStep::Load(LoadTicket {
                        photo_id: self.photo_id,
                        generation: self.generation,
                        permit,
                    })
                }
                None => RenderStep::Skip,
            },
            RenderState::Ready => {
                let Some(bitmap) = self.bitmap.clone() else {
                    self.state = RenderState::Idle;
                    return RenderStep::Skip;
                };
                if !gates.try_draw() {
                    return RenderStep::Skip;
                }
                self.state = RenderState::Drawn;
                debug!(photo_id = %self.photo_id, cycle = gates.cycle(), "Renderer drawn");
                RenderStep::Draw(bitmap)
            }
        }
    }

    /// Completion of a storage read. Returns false if the result is stale
    /// (a refresh happened since the ticket was issued) and was discarded.
    pub fn accept(&mut self, generation: u64, bitmap: Arc<Bitmap>) -> bool {
        if generation != self.generation || self.state != RenderState::Loading {
            debug!(photo_id = %self.photo_id, "Discarding stale bitmap");
            return false;
        }
        self.bitmap = Some(bitmap);
        self.state = RenderState::Ready;
        true
    }

    /// Drop the cached bitmap and start over from `Idle`.
    pub fn refresh(&mut self) {
        self.generation += 1;
        self.bitmap = None;
        self.state = RenderState::Idle;
    }
}
