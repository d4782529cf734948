//! The photo index.
//!
//! [`PhotoIndex`] is the in-memory view of every known photo: its record,
//! bound surface and renderer. It is owned by exactly one task (the
//! coordinator) and none of its methods await. Store and network work is
//! handed to [`Workers`], and each result comes back as a [`Completion`]
//! that the owner feeds to [`PhotoIndex::apply`].
//!
//! # Sync
//!
//! The Authoritative Store is polled with a watermark cursor. A pass captures
//! `now()` before querying `updated >= watermark` and advances the cursor as
//! soon as the query is issued, so changes made mid-poll are delivered again
//! on the next pass. Merging is idempotent:
//!
//! - unknown record: adopt it (reuse its mapping or bind a new surface)
//! - same record, or an older copy: skip
//! - different record: replace it and refresh the renderer

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::bitmap::{default_placeholder, Bitmap, BitmapStore};
use crate::config::PhotosConfig;
use crate::download::{DownloadOutcome, Downloader};
use crate::error::{PhotoError, Result, StoreError};
use crate::identity::{IdentityMap, IdentityMapping, IdentityStore};
use crate::model::{now, NewPhoto, OwnerId, PhotoId, PhotoRecord, Rgb, SurfaceId};
use crate::records::PhotoStore;
use crate::renderer::{LoadTicket, RenderGates, RenderState, RenderStep, Renderer};
use crate::surface::SurfaceHost;

/// Reply channel for a request handled by the index.
pub type Reply<T> = oneshot::Sender<Result<T>>;

type StoreResult<T> = std::result::Result<T, StoreError>;

fn send<T>(reply: Reply<T>, value: Result<T>) {
    // The caller may have given up; nothing to do then.
    let _ = reply.send(value);
}

/// Usability of a runtime handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Ready,
    /// Surface allocated, identity write in flight.
    Binding,
    /// A write failed; the next sync pass reloads the record.
    Stale,
    /// Integrity problem. Needs an administrator.
    Broken(String),
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::Binding => write!(f, "binding"),
            Self::Stale => write!(f, "stale"),
            Self::Broken(reason) => write!(f, "broken: {reason}"),
        }
    }
}

/// Snapshot of one photo as seen by the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    pub record: PhotoRecord,
    pub surface_id: Option<SurfaceId>,
    pub status: RuntimeStatus,
    pub render_state: RenderState,
}

impl RuntimeHandle {
    pub fn id(&self) -> PhotoId {
        self.record.id
    }

    pub fn is_ready(&self) -> bool {
        self.status == RuntimeStatus::Ready && self.surface_id.is_some()
    }
}

impl fmt::Display for RuntimeHandle {
    /// One-line summary: id, surface, owner, created date, name and color.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let surface = self
            .surface_id
            .map_or_else(|| "-".to_string(), |s| s.to_string());
        let owner = self
            .record
            .owner
            .map_or_else(|| "nobody".to_string(), |o| o.to_string());
        write!(
            f,
            "#{} surface {} owner {} {} \"{}\" {}",
            self.record.id,
            surface,
            owner,
            self.record.created_date(),
            self.record.name,
            self.record.color
        )?;
        if !self.is_ready() {
            write!(f, " ({})", self.status)?;
        }
        Ok(())
    }
}

struct PhotoRuntime {
    record: PhotoRecord,
    surface: Option<SurfaceId>,
    status: RuntimeStatus,
    renderer: Renderer,
}

impl PhotoRuntime {
    fn new(record: PhotoRecord, surface: Option<SurfaceId>, status: RuntimeStatus) -> Self {
        let renderer = Renderer::new(record.id);
        Self {
            record,
            surface,
            status,
            renderer,
        }
    }

    fn is_ready(&self) -> bool {
        self.status == RuntimeStatus::Ready && self.surface.is_some()
    }

    fn handle(&self) -> RuntimeHandle {
        RuntimeHandle {
            record: self.record.clone(),
            surface_id: self.surface,
            status: self.status.clone(),
            render_state: self.renderer.state(),
        }
    }
}

/// Result of a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub adopted: usize,
    pub changed: usize,
    pub unchanged: usize,
    /// Records that disappeared from the Authoritative Store.
    pub dropped: usize,
}

/// Result of a prune scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub confirmed: bool,
    /// Records scanned.
    pub total: usize,
    /// Records without a bitmap artifact. Deleted when confirmed.
    pub blank: Vec<PhotoId>,
    /// Mappings whose photo no longer exists (after blank deletion).
    pub orphaned: Vec<IdentityMapping>,
    removed: u64,
}

impl PruneReport {
    /// Identity mappings actually removed. Zero for a dry run.
    pub fn removed(&self) -> u64 {
        self.removed
    }

    pub fn is_clean(&self) -> bool {
        self.blank.is_empty() && self.orphaned.is_empty()
    }
}

/// Records loaded before the index starts serving.
#[derive(Debug, Clone)]
pub struct BootState {
    /// Captured before `records` was read.
    pub watermark: DateTime<Utc>,
    pub records: Vec<PhotoRecord>,
    pub mappings: Vec<IdentityMapping>,
}

/// Handle for running store and network work off the coordinator.
#[derive(Clone)]
pub struct Workers {
    records: Arc<dyn PhotoStore>,
    identity: Arc<dyn IdentityStore>,
    bitmaps: BitmapStore,
    downloader: Arc<Downloader>,
    completions: mpsc::UnboundedSender<Completion>,
}

impl Workers {
    pub fn new(
        records: Arc<dyn PhotoStore>,
        identity: Arc<dyn IdentityStore>,
        bitmaps: BitmapStore,
        downloader: Arc<Downloader>,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let workers = Self {
            records,
            identity,
            bitmaps,
            downloader,
            completions: tx,
        };
        (workers, rx)
    }

    fn spawn<F>(&self, task: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let _ = completions.send(task.await);
        });
    }
}

/// A finished unit of background work, to be applied by the index owner.
pub struct Completion(Done);

enum Done {
    Inserted {
        reply: Reply<RuntimeHandle>,
        result: StoreResult<PhotoRecord>,
    },
    Created {
        reply: Reply<RuntimeHandle>,
        record: PhotoRecord,
        surface: SurfaceId,
        result: Result<()>,
    },
    RolledBack {
        photo_id: PhotoId,
        result: StoreResult<bool>,
    },
    Adopted {
        photo_id: PhotoId,
        surface: SurfaceId,
        result: Result<()>,
    },
    Persisted {
        photo_id: PhotoId,
        reply: PersistReply,
        result: StoreResult<bool>,
    },
    Deleted {
        photo_id: PhotoId,
        reply: Reply<()>,
        result: StoreResult<bool>,
    },
    Downloaded {
        photo_id: PhotoId,
        url: Url,
        reply: Reply<DownloadOutcome>,
        outcome: DownloadOutcome,
    },
    BitmapLoaded {
        ticket: LoadTicket,
        result: StoreResult<Option<Bitmap>>,
    },
    Synced {
        since: DateTime<Utc>,
        refetch: Vec<PhotoId>,
        result: StoreResult<SyncBatch>,
    },
    TransferredAll {
        from: OwnerId,
        reply: Reply<u64>,
        result: StoreResult<Vec<PhotoId>>,
    },
    Pruned {
        reply: Reply<PruneReport>,
        result: StoreResult<PruneReport>,
    },
}

/// Who hears about a record write once it lands.
enum PersistReply {
    Handle(Reply<RuntimeHandle>),
    Download(Reply<DownloadOutcome>, DownloadOutcome),
}

impl PersistReply {
    fn succeed(self, handle: Option<RuntimeHandle>, photo_id: PhotoId) {
        match self {
            Self::Handle(reply) => send(reply, handle.ok_or(PhotoError::NotFound(photo_id))),
            Self::Download(reply, outcome) => send(reply, Ok(outcome)),
        }
    }

    fn fail(self, error: StoreError) {
        match self {
            Self::Handle(reply) => send(reply, Err(error.into())),
            Self::Download(reply, _) => send(reply, Err(error.into())),
        }
    }
}

struct SyncBatch {
    changed: Vec<PhotoRecord>,
    refetched: Vec<PhotoRecord>,
}

/// Someone waiting for a sync pass to finish.
pub enum SyncWaiter {
    Report(Reply<SyncReport>),
    /// Bulk transfer reply, sent once the follow-up sync has merged.
    Transfer(Reply<u64>, u64),
}

impl SyncWaiter {
    fn finish(self, result: &StoreResult<SyncReport>) {
        match self {
            Self::Report(reply) => send(reply, result.clone().map_err(PhotoError::from)),
            Self::Transfer(reply, count) => send(reply, Ok(count)),
        }
    }
}

struct SyncState {
    watermark: DateTime<Utc>,
    in_flight: bool,
    waiters: Vec<SyncWaiter>,
    /// Waiters for a pass that starts after the current one.
    queued: Option<Vec<SyncWaiter>>,
    /// Ids to reload by id on the next pass.
    refetch: BTreeSet<PhotoId>,
}

pub struct PhotoIndex {
    runtimes: BTreeMap<PhotoId, PhotoRuntime>,
    by_surface: HashMap<SurfaceId, PhotoId>,
    identity: IdentityMap,
    host: Box<dyn SurfaceHost>,
    gates: RenderGates,
    placeholder: Arc<Bitmap>,
    workers: Workers,
    max_file_size: usize,
    creating: HashSet<PhotoId>,
    deleting: HashMap<PhotoId, PhotoRuntime>,
    tombstones: HashSet<PhotoId>,
    sync: SyncState,
}

impl PhotoIndex {
    /// Rebuild the index from boot data.
    ///
    /// Integrity gaps are logged, never fatal: a mapping whose surface is gone
    /// leaves the photo broken, a record without a mapping gets a new surface,
    /// and a mapping without a record is left for prune.
    pub fn restore(
        config: &PhotosConfig,
        workers: Workers,
        host: Box<dyn SurfaceHost>,
        boot: BootState,
    ) -> Self {
        let mut index = Self {
            runtimes: BTreeMap::new(),
            by_surface: HashMap::new(),
            identity: IdentityMap::new(boot.mappings),
            host,
            gates: RenderGates::default(),
            placeholder: Arc::new(default_placeholder(config.resolution)),
            workers,
            max_file_size: config.max_file_size,
            creating: HashSet::new(),
            deleting: HashMap::new(),
            tombstones: HashSet::new(),
            sync: SyncState {
                watermark: boot.watermark,
                in_flight: false,
                waiters: Vec::new(),
                queued: None,
                refetch: BTreeSet::new(),
            },
        };

        let present: HashSet<PhotoId> = boot.records.iter().map(|r| r.id).collect();
        for mapping in index.identity.iter() {
            if !present.contains(&mapping.photo_id) {
                warn!(
                    photo_id = %mapping.photo_id,
                    surface_id = %mapping.surface_id,
                    "Identity mapping has no record"
                );
            }
        }

        for record in boot.records {
            if index.identity.surface_of(record.id).is_none() {
                warn!(photo_id = %record.id, "Record has no identity mapping, binding a new surface");
            }
            index.adopt(record);
        }

        info!(
            photos = index.runtimes.len(),
            mappings = index.identity.len(),
            "Photo index restored"
        );
        index
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn find_by_id(&self, id: PhotoId) -> Option<RuntimeHandle> {
        self.runtimes.get(&id).map(PhotoRuntime::handle)
    }

    pub fn find_by_surface(&self, surface: SurfaceId) -> Option<RuntimeHandle> {
        self.by_surface
            .get(&surface)
            .and_then(|id| self.find_by_id(*id))
    }

    /// Ready photos owned by `owner`.
    pub fn list_by_owner(&self, owner: OwnerId) -> Vec<RuntimeHandle> {
        self.runtimes
            .values()
            .filter(|rt| rt.record.owner == Some(owner) && rt.is_ready())
            .map(PhotoRuntime::handle)
            .collect()
    }

    /// Render cycle boundary.
    pub fn begin_cycle(&mut self) {
        self.gates.begin_cycle();
    }

    /// Feed back a finished background task.
    pub fn apply(&mut self, completion: Completion) {
        match completion.0 {
            Done::Inserted { reply, result } => self.on_inserted(reply, result),
            Done::Created {
                reply,
                record,
                surface,
                result,
            } => self.on_created(reply, record, surface, result),
            Done::RolledBack { photo_id, result } => self.on_rolled_back(photo_id, result),
            Done::Adopted {
                photo_id,
                surface,
                result,
            } => self.on_adopted(photo_id, surface, result),
            Done::Persisted {
                photo_id,
                reply,
                result,
            } => self.on_persisted(photo_id, reply, result),
            Done::Deleted {
                photo_id,
                reply,
                result,
            } => self.on_deleted(photo_id, reply, result),
            Done::Downloaded {
                photo_id,
                url,
                reply,
                outcome,
            } => self.on_downloaded(photo_id, url, reply, outcome),
            Done::BitmapLoaded { ticket, result } => self.on_bitmap_loaded(ticket, result),
            Done::Synced {
                since,
                refetch,
                result,
            } => self.on_synced(since, refetch, result),
            Done::TransferredAll {
                from,
                reply,
                result,
            } => self.on_transferred_all(from, reply, result),
            Done::Pruned { reply, result } => self.on_pruned(reply, result),
        }
    }

    // Registration

    fn register(&mut self, record: PhotoRecord, surface: SurfaceId, status: RuntimeStatus) {
        self.by_surface.insert(surface, record.id);
        self.runtimes
            .insert(record.id, PhotoRuntime::new(record, Some(surface), status));
    }

    fn unregister(&mut self, id: PhotoId) -> Option<PhotoRuntime> {
        let runtime = self.runtimes.remove(&id)?;
        if let Some(surface) = runtime.surface {
            if self.by_surface.get(&surface) == Some(&id) {
                self.by_surface.remove(&surface);
            }
        }
        Some(runtime)
    }

    fn allocate_surface(&mut self) -> SurfaceId {
        let surface = self.host.allocate();
        if let Some(bound) = self.identity.photo_on(surface) {
            warn!(surface_id = %surface, photo_id = %bound, "Host allocated a surface that is already bound");
        }
        surface
    }

    /// Register a record the index has not seen, binding a surface if needed.
    fn adopt(&mut self, record: PhotoRecord) {
        let id = record.id;
        match self.identity.surface_of(id) {
            Some(surface) if self.host.exists(surface) => {
                self.register(record, surface, RuntimeStatus::Ready);
            }
            Some(surface) => {
                warn!(photo_id = %id, surface_id = %surface, "Bound surface no longer exists");
                let reason = format!("surface {surface} no longer exists");
                self.runtimes.insert(
                    id,
                    PhotoRuntime::new(record, Some(surface), RuntimeStatus::Broken(reason)),
                );
            }
            None => {
                let surface = self.allocate_surface();
                self.register(record, surface, RuntimeStatus::Binding);
                let identity = Arc::clone(&self.workers.identity);
                self.workers.spawn(async move {
                    let result = identity.bind(id, surface).await;
                    Completion(Done::Adopted {
                        photo_id: id,
                        surface,
                        result,
                    })
                });
            }
        }
    }

    fn on_adopted(&mut self, photo_id: PhotoId, surface: SurfaceId, result: Result<()>) {
        let Some(runtime) = self.runtimes.get_mut(&photo_id) else {
            return;
        };
        match result {
            Ok(()) => {
                self.identity.insert(photo_id, surface);
                if runtime.status == RuntimeStatus::Binding {
                    runtime.status = RuntimeStatus::Ready;
                }
                debug!(photo_id = %photo_id, surface_id = %surface, "Adopted photo bound");
            }
            Err(e) => {
                error!(photo_id = %photo_id, surface_id = %surface, error = %e, "Identity bind failed");
                runtime.status = RuntimeStatus::Broken(e.to_string());
            }
        }
    }

    // Creation

    /// Insert a record, allocate a surface, bind it, then register.
    ///
    /// If the bind fails the inserted record is deleted again and the caller
    /// gets the error; nothing is registered.
    pub fn create(
        &mut self,
        owner: Option<OwnerId>,
        name: String,
        color: Rgb,
        reply: Reply<RuntimeHandle>,
    ) {
        let input = match NewPhoto::new(owner, name, color) {
            Ok(input) => input,
            Err(e) => return send(reply, Err(e)),
        };
        let records = Arc::clone(&self.workers.records);
        self.workers.spawn(async move {
            let result = records.insert(input).await;
            Completion(Done::Inserted { reply, result })
        });
    }

    fn on_inserted(&mut self, reply: Reply<RuntimeHandle>, result: StoreResult<PhotoRecord>) {
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "Failed to insert photo");
                return send(reply, Err(e.into()));
            }
        };
        let id = record.id;
        let surface = self.allocate_surface();
        self.creating.insert(id);
        let identity = Arc::clone(&self.workers.identity);
        self.workers.spawn(async move {
            let result = identity.bind(id, surface).await;
            Completion(Done::Created {
                reply,
                record,
                surface,
                result,
            })
        });
    }

    fn on_created(
        &mut self,
        reply: Reply<RuntimeHandle>,
        record: PhotoRecord,
        surface: SurfaceId,
        result: Result<()>,
    ) {
        let id = record.id;
        self.creating.remove(&id);
        match result {
            Ok(()) => {
                self.identity.insert(id, surface);
                self.register(record, surface, RuntimeStatus::Ready);
                info!(photo_id = %id, surface_id = %surface, "Photo created");
                let handle = self.find_by_id(id).ok_or(PhotoError::NotFound(id));
                send(reply, handle);
            }
            Err(e) => {
                error!(photo_id = %id, surface_id = %surface, error = %e, "Identity bind failed, rolling back");
                self.tombstones.insert(id);
                let records = Arc::clone(&self.workers.records);
                self.workers.spawn(async move {
                    let result = records.delete(id).await;
                    Completion(Done::RolledBack {
                        photo_id: id,
                        result,
                    })
                });
                send(reply, Err(e));
            }
        }
    }

    fn on_rolled_back(&mut self, photo_id: PhotoId, result: StoreResult<bool>) {
        match result {
            Ok(_) => {
                debug!(photo_id = %photo_id, "Rolled back photo record");
                self.sync.refetch.insert(photo_id);
            }
            Err(e) => error!(
                photo_id = %photo_id,
                error = %e,
                "Rollback failed, record left in authoritative store"
            ),
        }
    }

    // Mutations

    pub fn rename(&mut self, id: PhotoId, name: String, reply: Reply<RuntimeHandle>) {
        self.mutate(id, reply, |record| record.rename(name));
    }

    pub fn recolor(&mut self, id: PhotoId, color: Rgb, reply: Reply<RuntimeHandle>) {
        self.mutate(id, reply, |record| {
            record.recolor(color);
            Ok(())
        });
    }

    pub fn transfer_ownership(
        &mut self,
        id: PhotoId,
        owner: Option<OwnerId>,
        reply: Reply<RuntimeHandle>,
    ) {
        self.mutate(id, reply, |record| {
            record.set_owner(owner);
            Ok(())
        });
    }

    /// Clear the owner. Fails if the photo is already unowned.
    pub fn confiscate(&mut self, id: PhotoId, reply: Reply<RuntimeHandle>) {
        self.mutate(id, reply, |record| {
            if record.owner.is_none() {
                return Err(PhotoError::validation(format!("Photo {id} has no owner")));
            }
            record.set_owner(None);
            Ok(())
        });
    }

    /// Apply a change locally right away, then persist it.
    fn mutate<F>(&mut self, id: PhotoId, reply: Reply<RuntimeHandle>, change: F)
    where
        F: FnOnce(&mut PhotoRecord) -> Result<()>,
    {
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return send(reply, Err(PhotoError::NotFound(id)));
        };
        if !runtime.is_ready() {
            return send(reply, Err(PhotoError::NotReady(id)));
        }
        let mut record = runtime.record.clone();
        if let Err(e) = change(&mut record) {
            return send(reply, Err(e));
        }
        runtime.record = record.clone();
        runtime.renderer.refresh();
        self.persist(record, PersistReply::Handle(reply));
    }

    fn persist(&self, record: PhotoRecord, reply: PersistReply) {
        let records = Arc::clone(&self.workers.records);
        self.workers.spawn(async move {
            let result = records.update(&record).await;
            Completion(Done::Persisted {
                photo_id: record.id,
                reply,
                result,
            })
        });
    }

    fn on_persisted(&mut self, photo_id: PhotoId, reply: PersistReply, result: StoreResult<bool>) {
        match result {
            Ok(written) => {
                if !written {
                    debug!(photo_id = %photo_id, "Write superseded, reloading record");
                    self.mark_stale(photo_id);
                }
                reply.succeed(self.find_by_id(photo_id), photo_id);
            }
            Err(e) => {
                warn!(photo_id = %photo_id, error = %e, "Failed to persist photo");
                self.mark_stale(photo_id);
                reply.fail(e);
            }
        }
    }

    fn mark_stale(&mut self, id: PhotoId) {
        if let Some(runtime) = self.runtimes.get_mut(&id) {
            if matches!(runtime.status, RuntimeStatus::Ready | RuntimeStatus::Binding) {
                runtime.status = RuntimeStatus::Stale;
            }
        }
        self.sync.refetch.insert(id);
    }

    /// Hard delete. The identity mapping stays until prune.
    pub fn delete_photo(&mut self, id: PhotoId, reply: Reply<()>) {
        let Some(runtime) = self.unregister(id) else {
            return send(reply, Err(PhotoError::NotFound(id)));
        };
        self.tombstones.insert(id);
        self.deleting.insert(id, runtime);
        let records = Arc::clone(&self.workers.records);
        self.workers.spawn(async move {
            let result = records.delete(id).await;
            Completion(Done::Deleted {
                photo_id: id,
                reply,
                result,
            })
        });
    }

    fn on_deleted(&mut self, photo_id: PhotoId, reply: Reply<()>, result: StoreResult<bool>) {
        let runtime = self.deleting.remove(&photo_id);
        match result {
            Ok(existed) => {
                info!(photo_id = %photo_id, existed, "Photo deleted");
                // The next pass confirms the absence and lifts the tombstone
                self.sync.refetch.insert(photo_id);
                send(reply, Ok(()));
            }
            Err(e) => {
                warn!(photo_id = %photo_id, error = %e, "Failed to delete photo");
                self.tombstones.remove(&photo_id);
                if let Some(mut runtime) = runtime {
                    if !matches!(runtime.status, RuntimeStatus::Broken(_)) {
                        if let Some(surface) = runtime.surface {
                            self.by_surface.insert(surface, photo_id);
                        }
                    }
                    if runtime.status == RuntimeStatus::Ready {
                        runtime.status = RuntimeStatus::Stale;
                    }
                    self.runtimes.insert(photo_id, runtime);
                }
                self.sync.refetch.insert(photo_id);
                send(reply, Err(e.into()));
            }
        }
    }

    // Downloads and rendering

    /// Download, normalize and store a new bitmap for a photo.
    pub fn load_from_url(
        &mut self,
        id: PhotoId,
        url: Url,
        override_limit: bool,
        reply: Reply<DownloadOutcome>,
    ) {
        match self.runtimes.get(&id) {
            None => return send(reply, Err(PhotoError::NotFound(id))),
            Some(runtime) if !runtime.is_ready() => {
                return send(reply, Err(PhotoError::NotReady(id)))
            }
            Some(_) => {}
        }
        let downloader = Arc::clone(&self.workers.downloader);
        let bitmaps = self.workers.bitmaps.clone();
        let size_limit = self.max_file_size;
        self.workers.spawn(async move {
            let outcome = match downloader.fetch(&url, size_limit, override_limit).await {
                DownloadOutcome::Success(bitmap) => {
                    match bitmaps.save(id, Arc::clone(&bitmap)).await {
                        Ok(()) => DownloadOutcome::Success(bitmap),
                        Err(e) => DownloadOutcome::SaveFailure(e.to_string()),
                    }
                }
                other => other,
            };
            Completion(Done::Downloaded {
                photo_id: id,
                url,
                reply,
                outcome,
            })
        });
    }

    fn on_downloaded(
        &mut self,
        photo_id: PhotoId,
        url: Url,
        reply: Reply<DownloadOutcome>,
        outcome: DownloadOutcome,
    ) {
        info!(photo_id = %photo_id, url = %url, status = outcome.status(), "Download finished");
        let mut touched = None;
        if outcome.is_success() {
            if let Some(runtime) = self.runtimes.get_mut(&photo_id) {
                runtime.renderer.refresh();
                if runtime.is_ready() {
                    runtime.record.touch();
                    touched = Some(runtime.record.clone());
                }
            }
        }
        match touched {
            Some(record) => self.persist(record, PersistReply::Download(reply, outcome)),
            None => send(reply, Ok(outcome)),
        }
    }

    /// One render opportunity for the photo bound to `surface`.
    pub fn render(&mut self, surface: SurfaceId) -> Result<RenderState> {
        let Some(&id) = self.by_surface.get(&surface) else {
            return Err(PhotoError::validation(format!(
                "No photo is bound to surface {surface}"
            )));
        };
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            return Err(PhotoError::NotFound(id));
        };
        if matches!(runtime.status, RuntimeStatus::Broken(_)) {
            return Err(PhotoError::NotReady(id));
        }
        match runtime.renderer.render(&mut self.gates) {
            RenderStep::Skip => {}
            RenderStep::Load(ticket) => {
                debug!(photo_id = %id, in_flight = self.gates.loads_in_flight(), "Loading bitmap");
                let bitmaps = self.workers.bitmaps.clone();
                self.workers.spawn(async move {
                    let result = bitmaps.load(ticket.photo_id).await;
                    Completion(Done::BitmapLoaded { ticket, result })
                });
            }
            RenderStep::Draw(bitmap) => self.host.present(surface, &bitmap),
        }
        Ok(runtime.renderer.state())
    }

    fn on_bitmap_loaded(&mut self, ticket: LoadTicket, result: StoreResult<Option<Bitmap>>) {
        let bitmap = match result {
            Ok(Some(bitmap)) => Arc::new(bitmap),
            Ok(None) => Arc::clone(&self.placeholder),
            Err(e) => {
                warn!(photo_id = %ticket.photo_id, error = %e, "Failed to read bitmap, using placeholder");
                Arc::clone(&self.placeholder)
            }
        };
        if let Some(runtime) = self.runtimes.get_mut(&ticket.photo_id) {
            runtime.renderer.accept(ticket.generation, bitmap);
        }
        // Frees the load slot
        drop(ticket);
    }

    // Sync

    /// Start a sync pass. While one is in flight, waiters are queued for a
    /// follow-up pass and a bare periodic tick is dropped.
    pub fn start_sync(&mut self, waiter: Option<SyncWaiter>) {
        if self.sync.in_flight {
            if let Some(waiter) = waiter {
                self.sync.queued.get_or_insert_with(Vec::new).push(waiter);
            }
            return;
        }
        self.begin_sync(waiter.into_iter().collect());
    }

    fn begin_sync(&mut self, waiters: Vec<SyncWaiter>) {
        let since = self.sync.watermark;
        let watermark = now();
        let refetch: Vec<PhotoId> = std::mem::take(&mut self.sync.refetch)
            .into_iter()
            .collect();
        let records = Arc::clone(&self.workers.records);
        let ids = refetch.clone();
        self.workers.spawn(async move {
            let result: StoreResult<SyncBatch> = async {
                let changed = records.changed_since(since).await?;
                let refetched = records.find_many(&ids).await?;
                Ok(SyncBatch { changed, refetched })
            }
            .await;
            Completion(Done::Synced {
                since,
                refetch: ids,
                result,
            })
        });
        self.sync.watermark = watermark;
        self.sync.in_flight = true;
        self.sync.waiters = waiters;
        debug!(since = %since, refetch = refetch.len(), "Sync started");
    }

    fn on_synced(
        &mut self,
        since: DateTime<Utc>,
        refetch: Vec<PhotoId>,
        result: StoreResult<SyncBatch>,
    ) {
        self.sync.in_flight = false;
        let outcome = match result {
            Ok(batch) => Ok(self.merge_batch(batch, &refetch)),
            Err(e) => {
                warn!(error = %e, "Sync failed");
                self.sync.watermark = self.sync.watermark.min(since);
                self.sync.refetch.extend(refetch);
                Err(e)
            }
        };
        for waiter in std::mem::take(&mut self.sync.waiters) {
            waiter.finish(&outcome);
        }
        if let Some(queued) = self.sync.queued.take() {
            self.begin_sync(queued);
        }
    }

    fn merge_batch(&mut self, batch: SyncBatch, refetch: &[PhotoId]) -> SyncReport {
        let mut report = SyncReport::default();
        let found: HashSet<PhotoId> = batch.refetched.iter().map(|r| r.id).collect();
        for record in batch.changed.into_iter().chain(batch.refetched) {
            self.merge(record, &mut report);
        }
        for id in refetch {
            if found.contains(id) || self.creating.contains(id) {
                continue;
            }
            if self.tombstones.remove(id) {
                debug!(photo_id = %id, "Deletion confirmed");
            }
            if self.unregister(*id).is_some() {
                info!(photo_id = %id, "Photo no longer exists, dropped");
                report.dropped += 1;
            }
        }
        if report.adopted + report.changed + report.dropped > 0 {
            info!(
                adopted = report.adopted,
                changed = report.changed,
                dropped = report.dropped,
                "Sync merged"
            );
        } else {
            debug!(unchanged = report.unchanged, "Sync found no changes");
        }
        report
    }

    fn merge(&mut self, record: PhotoRecord, report: &mut SyncReport) {
        let id = record.id;
        if self.tombstones.contains(&id) || self.creating.contains(&id) {
            return;
        }
        let Some(runtime) = self.runtimes.get_mut(&id) else {
            info!(photo_id = %id, "Adopting photo");
            self.adopt(record);
            report.adopted += 1;
            return;
        };
        let stale = runtime.status == RuntimeStatus::Stale;
        if stale {
            runtime.status = RuntimeStatus::Ready;
        }
        if runtime.record == record || (!stale && record.updated_at < runtime.record.updated_at) {
            report.unchanged += 1;
            return;
        }
        debug!(photo_id = %id, "Photo changed");
        runtime.record = record;
        runtime.renderer.refresh();
        report.changed += 1;
    }

    // Administration

    /// Reassign every photo owned by `from`, then sync before replying.
    pub fn transfer_all(&mut self, from: OwnerId, to: Option<OwnerId>, reply: Reply<u64>) {
        if to == Some(from) {
            return send(
                reply,
                Err(PhotoError::validation("Source and target owner are the same")),
            );
        }
        let records = Arc::clone(&self.workers.records);
        let at = now();
        self.workers.spawn(async move {
            let result = records.transfer_all(from, to, at).await;
            Completion(Done::TransferredAll {
                from,
                reply,
                result,
            })
        });
    }

    fn on_transferred_all(
        &mut self,
        from: OwnerId,
        reply: Reply<u64>,
        result: StoreResult<Vec<PhotoId>>,
    ) {
        match result {
            Ok(ids) if ids.is_empty() => send(
                reply,
                Err(PhotoError::validation(format!("{from} does not have any photos"))),
            ),
            Ok(ids) => {
                let count = ids.len() as u64;
                info!(from = %from, count, "Transferred photos");
                // Reloaded by id: the watermark may already be past `at`
                self.sync.refetch.extend(ids);
                self.start_sync(Some(SyncWaiter::Transfer(reply, count)));
            }
            Err(e) => {
                warn!(from = %from, error = %e, "Bulk transfer failed");
                send(reply, Err(e.into()));
            }
        }
    }

    /// Scan for blank photos and orphaned mappings; remove them if confirmed.
    pub fn prune(&mut self, confirmed: bool, reply: Reply<PruneReport>) {
        let records = Arc::clone(&self.workers.records);
        let identity = Arc::clone(&self.workers.identity);
        let bitmaps = self.workers.bitmaps.clone();
        self.workers.spawn(async move {
            let result = prune_stores(records.as_ref(), identity.as_ref(), &bitmaps, confirmed).await;
            Completion(Done::Pruned { reply, result })
        });
    }

    fn on_pruned(&mut self, reply: Reply<PruneReport>, result: StoreResult<PruneReport>) {
        match result {
            Ok(report) => {
                if report.confirmed {
                    for id in &report.blank {
                        self.tombstones.insert(*id);
                        self.sync.refetch.insert(*id);
                        self.unregister(*id);
                    }
                    for mapping in &report.orphaned {
                        self.identity.remove(mapping.photo_id);
                    }
                    warn!(
                        blank = report.blank.len(),
                        total = report.total,
                        removed = report.removed(),
                        "Pruned blank photos and orphaned mappings"
                    );
                }
                send(reply, Ok(report));
            }
            Err(e) => {
                warn!(error = %e, "Prune failed");
                send(reply, Err(e.into()));
            }
        }
    }
}

async fn prune_stores(
    records: &dyn PhotoStore,
    identity: &dyn IdentityStore,
    bitmaps: &BitmapStore,
    confirmed: bool,
) -> StoreResult<PruneReport> {
    let all = records.all().await?;
    let mut blank = Vec::new();
    for record in &all {
        if !bitmaps.exists(record.id).await? {
            blank.push(record.id);
        }
    }

    if confirmed {
        for id in &blank {
            records.delete(*id).await?;
        }
    }

    let deleted: HashSet<PhotoId> = if confirmed {
        blank.iter().copied().collect()
    } else {
        HashSet::new()
    };
    let existing: HashSet<PhotoId> = all
        .iter()
        .map(|r| r.id)
        .filter(|id| !deleted.contains(id))
        .collect();
    let orphaned: Vec<IdentityMapping> = identity
        .load_all()
        .await?
        .into_iter()
        .filter(|m| !existing.contains(&m.photo_id))
        .collect();

    let removed = if confirmed {
        let ids: Vec<PhotoId> = orphaned.iter().map(|m| m.photo_id).collect();
        identity.remove(&ids).await?
    } else {
        0
    };

    Ok(PruneReport {
        confirmed,
        total: all.len(),
        blank,
        orphaned,
        removed,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::identity::MemoryIdentityStore;
    use crate::records::MemoryPhotoStore;
    use crate::surface::LocalSurfaces;

    /// Memory store whose updates can be made to fail and whose bulk
    /// transfers can be made to lag.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryPhotoStore,
        fail_updates: AtomicBool,
        slow_transfers: AtomicBool,
    }

    #[async_trait]
    impl PhotoStore for FlakyStore {
        async fn insert(&self, input: NewPhoto) -> StoreResult<PhotoRecord> {
            self.inner.insert(input).await
        }
        async fn update(&self, record: &PhotoRecord) -> StoreResult<bool> {
            if self.fail_updates.load(Ordering::SeqCst) {
                return Err(StoreError::Connection("connection reset".into()));
            }
            self.inner.update(record).await
        }
        async fn delete(&self, id: PhotoId) -> StoreResult<bool> {
            self.inner.delete(id).await
        }
        async fn find(&self, id: PhotoId) -> StoreResult<Option<PhotoRecord>> {
            self.inner.find(id).await
        }
        async fn find_many(&self, ids: &[PhotoId]) -> StoreResult<Vec<PhotoRecord>> {
            self.inner.find_many(ids).await
        }
        async fn changed_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<PhotoRecord>> {
            self.inner.changed_since(since).await
        }
        async fn all(&self) -> StoreResult<Vec<PhotoRecord>> {
            self.inner.all().await
        }
        async fn transfer_all(
            &self,
            from: OwnerId,
            to: Option<OwnerId>,
            at: DateTime<Utc>,
        ) -> StoreResult<Vec<PhotoId>> {
            if self.slow_transfers.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.transfer_all(from, to, at).await
        }
    }

    struct Harness {
        index: PhotoIndex,
        completions: mpsc::UnboundedReceiver<Completion>,
        records: Arc<FlakyStore>,
        identity: Arc<MemoryIdentityStore>,
        _dir: tempfile::TempDir,
    }

    impl Harness {
        async fn boot(
            records: Arc<FlakyStore>,
            identity: Arc<MemoryIdentityStore>,
            host: LocalSurfaces,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = PhotosConfig {
                image_root: dir.path().to_path_buf(),
                resolution: 16,
                ..PhotosConfig::default()
            };
            let boot = BootState {
                watermark: now(),
                records: records.all().await.unwrap(),
                mappings: identity.load_all().await.unwrap(),
            };
            let downloader = Arc::new(Downloader::new(16, Duration::from_secs(1)).unwrap());
            let (workers, completions) = Workers::new(
                records.clone(),
                identity.clone(),
                BitmapStore::new(dir.path(), 16),
                downloader,
            );
            let index = PhotoIndex::restore(&config, workers, Box::new(host), boot);
            Self {
                index,
                completions,
                records,
                identity,
                _dir: dir,
            }
        }

        async fn new() -> Self {
            Self::boot(
                Arc::new(FlakyStore::default()),
                Arc::new(MemoryIdentityStore::new()),
                LocalSurfaces::new(),
            )
            .await
        }

        /// Apply completions until the reply arrives.
        async fn wait<T>(&mut self, mut rx: oneshot::Receiver<T>) -> T {
            loop {
                tokio::select! {
                    biased;
                    value = &mut rx => return value.unwrap(),
                    Some(completion) = self.completions.recv() => self.index.apply(completion),
                }
            }
        }

        /// Apply completions until the queue stays quiet.
        async fn settle(&mut self) {
            while let Ok(Some(completion)) =
                tokio::time::timeout(Duration::from_millis(100), self.completions.recv()).await
            {
                self.index.apply(completion);
            }
        }

        async fn create(&mut self, owner: Option<OwnerId>, name: &str) -> Result<RuntimeHandle> {
            let (tx, rx) = oneshot::channel();
            self.index.create(owner, name.to_string(), Rgb::new(0xFF00FF), tx);
            self.wait(rx).await
        }

        async fn sync(&mut self) -> SyncReport {
            let (tx, rx) = oneshot::channel();
            self.index.start_sync(Some(SyncWaiter::Report(tx)));
            self.wait(rx).await.unwrap()
        }

        fn snapshot(&self) -> Vec<RuntimeHandle> {
            self.index.runtimes.values().map(PhotoRuntime::handle).collect()
        }
    }

    #[tokio::test]
    async fn test_create_registers_ready_handle() {
        let mut h = Harness::new().await;
        let owner = Uuid::new_v4();
        let handle = h.create(Some(owner), "Test").await.unwrap();

        assert!(handle.is_ready());
        assert_eq!(handle.record.name, "Test");
        assert_eq!(handle.record.color, Rgb::new(0xFF00FF));
        assert_eq!(handle.render_state, RenderState::Idle);

        let surface = handle.surface_id.unwrap();
        assert_eq!(h.index.find_by_surface(surface), Some(handle.clone()));
        assert_eq!(h.index.find_by_id(handle.id()), Some(handle.clone()));
        assert_eq!(
            h.identity.load_all().await.unwrap(),
            vec![IdentityMapping { photo_id: handle.id(), surface_id: surface }]
        );
    }

    #[tokio::test]
    async fn test_create_rejects_long_name_without_store_write() {
        let mut h = Harness::new().await;
        let err = h.create(None, &"x".repeat(200)).await.unwrap_err();
        assert!(matches!(err, PhotoError::Validation(_)));
        assert!(h.records.inner.is_empty());
    }

    #[tokio::test]
    async fn test_create_rolls_back_on_bind_collision() {
        // Surface 0 is already taken by a photo the host does not know about.
        let identity = Arc::new(MemoryIdentityStore::with_mappings([IdentityMapping {
            photo_id: PhotoId(999),
            surface_id: SurfaceId(0),
        }]));
        let mut h = Harness::boot(Arc::new(FlakyStore::default()), identity, LocalSurfaces::new()).await;

        let err = h.create(None, "Test").await.unwrap_err();
        assert!(matches!(err, PhotoError::Integrity(_)));
        h.settle().await;

        assert!(h.index.is_empty());
        assert!(h.records.inner.is_empty());
        // The rolled back record is never adopted
        assert_eq!(h.sync().await, SyncReport::default());
        assert!(h.index.is_empty());
        assert!(h.index.tombstones.is_empty());
    }

    #[tokio::test]
    async fn test_tombstone_outlives_sync_that_started_before_delete() {
        let mut h = Harness::new().await;
        let photo = h.create(None, "Doomed").await.unwrap();

        // Pass in flight while the delete is issued
        let (sync_tx, sync_rx) = oneshot::channel();
        h.index.start_sync(Some(SyncWaiter::Report(sync_tx)));
        let (tx, rx) = oneshot::channel();
        h.index.delete_photo(photo.id(), tx);
        h.wait(rx).await.unwrap();
        h.wait(sync_rx).await.unwrap();
        assert!(h.index.find_by_id(photo.id()).is_none());

        h.sync().await;
        assert!(h.index.tombstones.is_empty());
        assert!(h.index.find_by_id(photo.id()).is_none());
        assert!(h.index.is_empty());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let mut h = Harness::new().await;
        h.create(None, "Local").await.unwrap();
        // Written by another node
        h.records
            .inner
            .insert(NewPhoto::new(None, "Remote", Rgb::new(0x00FF00)).unwrap())
            .await
            .unwrap();

        let first = h.sync().await;
        assert_eq!(first.adopted, 1);
        h.settle().await;
        let before = h.snapshot();
        assert!(before.iter().all(RuntimeHandle::is_ready));

        let second = h.sync().await;
        assert_eq!(second.adopted + second.changed + second.dropped, 0);
        let third = h.sync().await;
        assert_eq!(third.adopted + third.changed + third.dropped, 0);
        assert_eq!(h.snapshot(), before);
    }

    #[tokio::test]
    async fn test_sync_refreshes_changed_record() {
        let mut h = Harness::new().await;
        let handle = h.create(None, "Before").await.unwrap();

        let mut remote = h.records.inner.find(handle.id()).await.unwrap().unwrap();
        remote.rename("After").unwrap();
        remote.updated_at = remote.updated_at + chrono::Duration::seconds(1);
        h.records.inner.update(&remote).await.unwrap();

        let report = h.sync().await;
        assert_eq!(report.changed, 1);
        let after = h.index.find_by_id(handle.id()).unwrap();
        assert_eq!(after.record.name, "After");
        assert_eq!(after.render_state, RenderState::Idle);
    }

    #[tokio::test]
    async fn test_transfer_then_list_by_owner() {
        let mut h = Harness::new().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let photo = h.create(Some(alice), "Test").await.unwrap();

        let (tx, rx) = oneshot::channel();
        h.index.transfer_ownership(photo.id(), Some(bob), tx);
        h.wait(rx).await.unwrap();
        h.sync().await;

        assert!(h.index.list_by_owner(alice).is_empty());
        let bobs = h.index.list_by_owner(bob);
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id(), photo.id());
    }

    #[tokio::test]
    async fn test_failed_write_is_stale_until_sync() {
        let mut h = Harness::new().await;
        let photo = h.create(None, "Original").await.unwrap();

        h.records.fail_updates.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        h.index.rename(photo.id(), "Renamed".into(), tx);
        let err = h.wait(rx).await.unwrap_err();
        assert!(matches!(err, PhotoError::Persistence(_)));

        let stale = h.index.find_by_id(photo.id()).unwrap();
        assert_eq!(stale.status, RuntimeStatus::Stale);
        assert!(!stale.is_ready());

        h.records.fail_updates.store(false, Ordering::SeqCst);
        h.sync().await;
        let resolved = h.index.find_by_id(photo.id()).unwrap();
        assert!(resolved.is_ready());
        assert_eq!(resolved.record.name, "Original");
    }

    #[tokio::test]
    async fn test_list_by_owner_skips_unusable_photos() {
        let mut h = Harness::new().await;
        let owner = Uuid::new_v4();
        let kept = h.create(Some(owner), "Kept").await.unwrap();
        let flaky = h.create(Some(owner), "Flaky").await.unwrap();

        h.records.fail_updates.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        h.index.recolor(flaky.id(), Rgb::new(0x123456), tx);
        assert!(h.wait(rx).await.is_err());

        let listed = h.index.list_by_owner(owner);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id(), kept.id());
        assert!(listed.iter().all(RuntimeHandle::is_ready));

        h.records.fail_updates.store(false, Ordering::SeqCst);
        h.sync().await;
        assert_eq!(h.index.list_by_owner(owner).len(), 2);
    }

    #[tokio::test]
    async fn test_transfer_all_visible_after_reply_despite_racing_sync() {
        let mut h = Harness::new().await;
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let photo = h.create(Some(alice), "Test").await.unwrap();

        h.records.slow_transfers.store(true, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        h.index.transfer_all(alice, Some(bob), tx);
        // Moves the watermark past the bulk write's timestamp before it lands
        let report = h.sync().await;
        assert_eq!(report.changed, 0);
        assert!(h.index.list_by_owner(bob).is_empty());

        assert_eq!(h.wait(rx).await.unwrap(), 1);
        let bobs = h.index.list_by_owner(bob);
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].id(), photo.id());
        assert!(h.index.list_by_owner(alice).is_empty());
    }

    #[tokio::test]
    async fn test_transfer_all_without_photos_is_rejected() {
        let mut h = Harness::new().await;
        let (tx, rx) = oneshot::channel();
        h.index.transfer_all(Uuid::new_v4(), None, tx);
        assert!(matches!(h.wait(rx).await, Err(PhotoError::Validation(_))));
    }

    #[tokio::test]
    async fn test_confiscate_requires_owner() {
        let mut h = Harness::new().await;
        let photo = h.create(None, "Unowned").await.unwrap();
        let (tx, rx) = oneshot::channel();
        h.index.confiscate(photo.id(), tx);
        assert!(matches!(h.wait(rx).await, Err(PhotoError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_keeps_mapping_until_prune() {
        let mut h = Harness::new().await;
        let photo = h.create(None, "Doomed").await.unwrap();
        let (tx, rx) = oneshot::channel();
        h.index.delete_photo(photo.id(), tx);
        h.wait(rx).await.unwrap();

        assert!(h.index.find_by_id(photo.id()).is_none());
        assert!(h.records.inner.is_empty());
        assert_eq!(h.identity.len(), 1);
        assert!(h.index.tombstones.contains(&photo.id()));

        // A pass that confirms the absence lifts the tombstone
        assert_eq!(h.sync().await, SyncReport::default());
        assert!(h.index.tombstones.is_empty());
        assert!(h.index.sync.refetch.is_empty());

        let (tx, rx) = oneshot::channel();
        h.index.prune(false, tx);
        let dry = h.wait(rx).await.unwrap();
        assert_eq!(dry.orphaned.len(), 1);
        assert_eq!(dry.removed(), 0);
        assert_eq!(h.identity.len(), 1);

        let (tx, rx) = oneshot::channel();
        h.index.prune(true, tx);
        let report = h.wait(rx).await.unwrap();
        assert_eq!(report.removed(), 1);
        assert!(h.identity.is_empty());
    }

    #[tokio::test]
    async fn test_restore_reports_integrity_gaps() {
        let records = Arc::new(FlakyStore::default());
        let bound = records
            .inner
            .insert(NewPhoto::new(None, "Bound", Rgb::new(1)).unwrap())
            .await
            .unwrap();
        let lost = records
            .inner
            .insert(NewPhoto::new(None, "Lost surface", Rgb::new(2)).unwrap())
            .await
            .unwrap();
        let unmapped = records
            .inner
            .insert(NewPhoto::new(None, "Unmapped", Rgb::new(3)).unwrap())
            .await
            .unwrap();
        let identity = Arc::new(MemoryIdentityStore::with_mappings([
            IdentityMapping { photo_id: bound.id, surface_id: SurfaceId(0) },
            IdentityMapping { photo_id: lost.id, surface_id: SurfaceId(1) },
            IdentityMapping { photo_id: PhotoId(77), surface_id: SurfaceId(2) },
        ]));
        let host = LocalSurfaces::with_existing([SurfaceId(0), SurfaceId(2)]);

        let mut h = Harness::boot(records, identity, host).await;
        h.settle().await;

        assert!(h.index.find_by_id(bound.id).unwrap().is_ready());
        assert_eq!(h.index.find_by_surface(SurfaceId(0)).unwrap().id(), bound.id);

        let broken = h.index.find_by_id(lost.id).unwrap();
        assert!(matches!(broken.status, RuntimeStatus::Broken(_)));
        assert!(h.index.render(SurfaceId(1)).is_err());

        let adopted = h.index.find_by_id(unmapped.id).unwrap();
        assert!(adopted.is_ready());
        assert_eq!(adopted.surface_id, Some(SurfaceId(3)));
        assert_eq!(h.identity.len(), 4);
    }

    #[tokio::test]
    async fn test_render_single_flight_then_draw() {
        let mut h = Harness::new().await;
        let a = h.create(None, "A").await.unwrap();
        let b = h.create(None, "B").await.unwrap();
        let (sa, sb) = (a.surface_id.unwrap(), b.surface_id.unwrap());

        assert_eq!(h.index.render(sa).unwrap(), RenderState::Loading);
        for _ in 0..5 {
            assert_eq!(h.index.render(sa).unwrap(), RenderState::Loading);
            assert_eq!(h.index.render(sb).unwrap(), RenderState::Idle);
        }

        h.settle().await;
        assert_eq!(h.index.find_by_id(a.id()).unwrap().render_state, RenderState::Ready);
        assert_eq!(h.index.render(sa).unwrap(), RenderState::Drawn);
        assert_eq!(h.index.render(sb).unwrap(), RenderState::Loading);
    }
}
