//! Photo service: the operation surface used by commands and hosts.
//!
//! [`PhotoService`] is a cheap cloneable handle. Every call becomes a
//! [`Request`] on a bounded queue consumed by the [`Coordinator`], the only
//! task that touches the [`PhotoIndex`]. The coordinator also drives the
//! render cycle boundary and the periodic sync pass.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::bitmap::BitmapStore;
use crate::config::PhotosConfig;
use crate::download::{parse_url, DownloadOutcome, Downloader};
use crate::error::{PhotoError, Result, StoreError};
use crate::identity::{IdentityMapping, IdentityStore, MemoryIdentityStore, SqliteIdentityStore};
use crate::index::{
    BootState, Completion, PhotoIndex, PruneReport, Reply, RuntimeHandle, SyncReport, SyncWaiter,
    Workers,
};
use crate::model::{now, OwnerId, PhotoId, Rgb, SurfaceId};
use crate::records::{MemoryPhotoStore, PhotoStore, PostgresPhotoStore};
use crate::renderer::RenderState;
use crate::surface::{LocalSurfaces, SurfaceHost};

/// Pending requests before callers start waiting on the queue.
const REQUEST_QUEUE: usize = 256;

fn bootstrap(e: StoreError) -> PhotoError {
    PhotoError::Bootstrap(e.to_string())
}

/// Store backends the index runs against.
#[derive(Clone)]
pub struct Stores {
    pub records: Arc<dyn PhotoStore>,
    pub identity: Arc<dyn IdentityStore>,
}

impl Stores {
    /// Open the configured backends.
    ///
    /// Without `DATABASE_URL` the Authoritative Store is kept in memory.
    pub async fn connect(config: &PhotosConfig) -> Result<Self> {
        let records: Arc<dyn PhotoStore> = match &config.database_url {
            Some(url) => Arc::new(
                PostgresPhotoStore::new(url, config.database_max_connections)
                    .await
                    .map_err(bootstrap)?,
            ),
            None => {
                warn!("DATABASE_URL not set, using in-memory authoritative store (records are lost on exit)");
                Arc::new(MemoryPhotoStore::new())
            }
        };
        let identity = Arc::new(
            SqliteIdentityStore::new(&config.identity_db_path)
                .await
                .map_err(bootstrap)?,
        );
        Ok(Self { records, identity })
    }

    /// Fresh in-memory backends.
    pub fn in_memory() -> Self {
        Self {
            records: Arc::new(MemoryPhotoStore::new()),
            identity: Arc::new(MemoryIdentityStore::new()),
        }
    }
}

enum Request {
    Create {
        owner: Option<OwnerId>,
        name: String,
        color: Rgb,
        reply: Reply<RuntimeHandle>,
    },
    FindById {
        id: PhotoId,
        reply: Reply<Option<RuntimeHandle>>,
    },
    FindBySurface {
        surface: SurfaceId,
        reply: Reply<Option<RuntimeHandle>>,
    },
    ListByOwner {
        owner: OwnerId,
        reply: Reply<Vec<RuntimeHandle>>,
    },
    Rename {
        id: PhotoId,
        name: String,
        reply: Reply<RuntimeHandle>,
    },
    Recolor {
        id: PhotoId,
        color: Rgb,
        reply: Reply<RuntimeHandle>,
    },
    Transfer {
        id: PhotoId,
        owner: Option<OwnerId>,
        reply: Reply<RuntimeHandle>,
    },
    Confiscate {
        id: PhotoId,
        reply: Reply<RuntimeHandle>,
    },
    Delete {
        id: PhotoId,
        reply: Reply<()>,
    },
    Load {
        id: PhotoId,
        url: url::Url,
        override_limit: bool,
        reply: Reply<DownloadOutcome>,
    },
    Render {
        surface: SurfaceId,
        reply: Reply<RenderState>,
    },
    TransferAll {
        from: OwnerId,
        to: Option<OwnerId>,
        reply: Reply<u64>,
    },
    Prune {
        confirmed: bool,
        reply: Reply<PruneReport>,
    },
    Sync {
        reply: Reply<SyncReport>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running photo index.
#[derive(Clone)]
pub struct PhotoService {
    requests: mpsc::Sender<Request>,
}

impl PhotoService {
    /// Boot from configuration with a [`LocalSurfaces`] host.
    pub async fn start(config: PhotosConfig) -> Result<Self> {
        let stores = Stores::connect(&config).await?;
        Self::boot(config, stores, |mappings| {
            LocalSurfaces::with_existing(mappings.iter().map(|m| m.surface_id))
        })
        .await
    }

    /// Load stores, restore the index and spawn the coordinator.
    ///
    /// `host` receives the persisted mappings so it can restore the surfaces
    /// that already exist.
    pub async fn boot<H, F>(config: PhotosConfig, stores: Stores, host: F) -> Result<Self>
    where
        H: SurfaceHost + 'static,
        F: FnOnce(&[IdentityMapping]) -> H,
    {
        let bitmaps = BitmapStore::new(&config.image_root, config.resolution);
        bitmaps.ensure_root().await.map_err(bootstrap)?;

        let mappings = stores.identity.load_all().await.map_err(bootstrap)?;
        let watermark = now();
        let records = stores.records.all().await.map_err(bootstrap)?;
        let host = host(&mappings);

        let downloader = Arc::new(Downloader::new(config.resolution, config.download_timeout)?);
        let (workers, completions) =
            Workers::new(stores.records, stores.identity, bitmaps, downloader);
        let index = PhotoIndex::restore(
            &config,
            workers,
            Box::new(host),
            BootState {
                watermark,
                records,
                mappings,
            },
        );

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let coordinator = Coordinator {
            index,
            requests: rx,
            completions,
            cycle_interval: config.cycle_interval,
            sync_interval: config.sync_interval,
        };
        tokio::spawn(coordinator.run());

        Ok(Self { requests: tx })
    }

    async fn call<T>(&self, request: impl FnOnce(Reply<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .await
            .map_err(|_| PhotoError::Shutdown)?;
        rx.await.map_err(|_| PhotoError::Shutdown)?
    }

    pub async fn create(
        &self,
        owner: Option<OwnerId>,
        name: impl Into<String>,
        color: Rgb,
    ) -> Result<RuntimeHandle> {
        let name = name.into();
        self.call(|reply| Request::Create {
            owner,
            name,
            color,
            reply,
        })
        .await
    }

    pub async fn find_by_id(&self, id: PhotoId) -> Result<Option<RuntimeHandle>> {
        self.call(|reply| Request::FindById { id, reply }).await
    }

    pub async fn find_by_surface(&self, surface: SurfaceId) -> Result<Option<RuntimeHandle>> {
        self.call(|reply| Request::FindBySurface { surface, reply })
            .await
    }

    pub async fn list_by_owner(&self, owner: OwnerId) -> Result<Vec<RuntimeHandle>> {
        self.call(|reply| Request::ListByOwner { owner, reply }).await
    }

    pub async fn rename(&self, id: PhotoId, name: impl Into<String>) -> Result<RuntimeHandle> {
        let name = name.into();
        self.call(|reply| Request::Rename { id, name, reply }).await
    }

    pub async fn recolor(&self, id: PhotoId, color: Rgb) -> Result<RuntimeHandle> {
        self.call(|reply| Request::Recolor { id, color, reply }).await
    }

    pub async fn transfer_ownership(
        &self,
        id: PhotoId,
        owner: Option<OwnerId>,
    ) -> Result<RuntimeHandle> {
        self.call(|reply| Request::Transfer { id, owner, reply })
            .await
    }

    pub async fn confiscate(&self, id: PhotoId) -> Result<RuntimeHandle> {
        self.call(|reply| Request::Confiscate { id, reply }).await
    }

    pub async fn delete_photo(&self, id: PhotoId) -> Result<()> {
        self.call(|reply| Request::Delete { id, reply }).await
    }

    /// Download `url` into the photo's bitmap.
    ///
    /// Bad URLs are rejected before anything is queued. Download failures
    /// come back as `Ok` with a non-success outcome.
    pub async fn load_from_url(
        &self,
        id: PhotoId,
        url: &str,
        override_limit: bool,
    ) -> Result<DownloadOutcome> {
        let url = parse_url(url)?;
        self.call(|reply| Request::Load {
            id,
            url,
            override_limit,
            reply,
        })
        .await
    }

    /// A render opportunity on `surface`, as when a viewer looks at it.
    pub async fn render(&self, surface: SurfaceId) -> Result<RenderState> {
        self.call(|reply| Request::Render { surface, reply }).await
    }

    pub async fn transfer_all(&self, from: OwnerId, to: Option<OwnerId>) -> Result<u64> {
        self.call(|reply| Request::TransferAll { from, to, reply })
            .await
    }

    pub async fn prune(&self, confirmed: bool) -> Result<PruneReport> {
        self.call(|reply| Request::Prune { confirmed, reply }).await
    }

    /// Run a sync pass now and wait for it to merge.
    pub async fn sync(&self) -> Result<SyncReport> {
        self.call(|reply| Request::Sync { reply }).await
    }

    /// Stop the coordinator. Later calls fail with `Shutdown`.
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Shutdown { reply: tx })
            .await
            .map_err(|_| PhotoError::Shutdown)?;
        rx.await.map_err(|_| PhotoError::Shutdown)
    }
}

/// Single writer over the index.
pub struct Coordinator {
    index: PhotoIndex,
    requests: mpsc::Receiver<Request>,
    completions: mpsc::UnboundedReceiver<Completion>,
    cycle_interval: Duration,
    sync_interval: Duration,
}

impl Coordinator {
    pub async fn run(mut self) {
        let mut cycle = time::interval(self.cycle_interval);
        cycle.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sync = time::interval_at(Instant::now() + self.sync_interval, self.sync_interval);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(photos = self.index.len(), "Coordinator running");

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Shutdown { reply }) => {
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.dispatch(request),
                    None => break,
                },
                Some(completion) = self.completions.recv() => self.index.apply(completion),
                _ = cycle.tick() => self.index.begin_cycle(),
                _ = sync.tick() => self.index.start_sync(None),
            }
        }

        info!("Coordinator stopped");
    }

    fn dispatch(&mut self, request: Request) {
        let index = &mut self.index;
        match request {
            Request::Create {
                owner,
                name,
                color,
                reply,
            } => index.create(owner, name, color, reply),
            Request::FindById { id, reply } => {
                let _ = reply.send(Ok(index.find_by_id(id)));
            }
            Request::FindBySurface { surface, reply } => {
                let _ = reply.send(Ok(index.find_by_surface(surface)));
            }
            Request::ListByOwner { owner, reply } => {
                let _ = reply.send(Ok(index.list_by_owner(owner)));
            }
            Request::Rename { id, name, reply } => index.rename(id, name, reply),
            Request::Recolor { id, color, reply } => index.recolor(id, color, reply),
            Request::Transfer { id, owner, reply } => index.transfer_ownership(id, owner, reply),
            Request::Confiscate { id, reply } => index.confiscate(id, reply),
            Request::Delete { id, reply } => index.delete_photo(id, reply),
            Request::Load {
                id,
                url,
                override_limit,
                reply,
            } => index.load_from_url(id, url, override_limit, reply),
            Request::Render { surface, reply } => {
                let _ = reply.send(index.render(surface));
            }
            Request::TransferAll { from, to, reply } => index.transfer_all(from, to, reply),
            Request::Prune { confirmed, reply } => index.prune(confirmed, reply),
            Request::Sync { reply } => index.start_sync(Some(SyncWaiter::Report(reply))),
            Request::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}
