use crate::chunking::{ChunkingOptions, DatasetChunkingClient};
use crate::error::{SeriesError, SeriesResult};
use crate::source::{ArraySource, cancelable, join_path};
use crate::timestamps::TimestampResolver;
use shared::{DatasetDescriptor, EngineConfig};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;

pub type SeriesId = u64;

type OpenSeries = Mutex<HashMap<SeriesId, CancellationToken>>;

/// Owns the open series of one array source.
///
/// Each open series gets a child of the registry's token; closing a series
/// cancels everything still in flight for it, and closing or dropping the
/// registry cancels everything. Dropping a [`SeriesHandle`] closes its series.
pub struct SeriesRegistry {
    source: Arc<dyn ArraySource>,
    config: EngineConfig,
    root: CancellationToken,
    open: Arc<OpenSeries>,
    next_id: AtomicU64,
}

impl SeriesRegistry {
    pub fn new(source: Arc<dyn ArraySource>, config: EngineConfig) -> Self {
        Self {
            source,
            config,
            root: CancellationToken::new(),
            open: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validates the series group and its `data` dataset, then resolves its timestamps.
    pub async fn open_series(&self, object_path: &str) -> SeriesResult<SeriesHandle> {
        if self.root.is_cancelled() {
            return Err(SeriesError::Canceled);
        }

        self.source
            .get_group(object_path)
            .await?
            .ok_or_else(|| SeriesError::MissingGroup {
                path: object_path.to_string(),
            })?;

        let data_path = join_path(object_path, "data");
        let data = self
            .source
            .get_dataset(&data_path)
            .await?
            .ok_or_else(|| SeriesError::MissingDataset {
                path: data_path.clone(),
            })?;
        if data.rank() == 0 || data.rank() > 2 {
            return Err(SeriesError::UnsupportedRank {
                path: data_path,
                rank: data.rank(),
            });
        }

        let token = self.root.child_token();
        let resolver = cancelable(
            &token,
            TimestampResolver::open(
                Arc::clone(&self.source),
                object_path,
                &self.config.timestamps,
                token.clone(),
            ),
        )
        .await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.open).insert(id, token.clone());
        log::info!(
            "Opened series #{} {} ({} samples, {:.3}s..{:.3}s, {})",
            id,
            object_path,
            resolver.sample_count(),
            resolver.start_time(),
            resolver.end_time(),
            if resolver.is_regular() { "regular" } else { "irregular" }
        );

        Ok(SeriesHandle {
            id,
            object_path: object_path.to_string(),
            data,
            resolver: Arc::new(resolver),
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            token,
            registry: Arc::downgrade(&self.open),
        })
    }

    /// Cancels outstanding work of one series. Returns `false` if it was not open.
    pub fn close_series(&self, id: SeriesId) -> bool {
        match lock(&self.open).remove(&id) {
            Some(token) => {
                token.cancel();
                log::info!("Closed series #{}", id);
                true
            }
            None => false,
        }
    }

    pub fn open_count(&self) -> usize {
        lock(&self.open).len()
    }

    pub fn close(&self) {
        self.root.cancel();
        let closed = std::mem::take(&mut *lock(&self.open));
        if !closed.is_empty() {
            log::info!("Closed {} open series", closed.len());
        }
    }
}

impl Drop for SeriesRegistry {
    fn drop(&mut self) {
        self.root.cancel();
    }
}

/// One opened series: its data descriptor and timestamp resolver.
///
/// Dropping the handle cancels the series' work and removes it from its registry.
pub struct SeriesHandle {
    id: SeriesId,
    object_path: String,
    data: DatasetDescriptor,
    resolver: Arc<TimestampResolver>,
    source: Arc<dyn ArraySource>,
    config: EngineConfig,
    token: CancellationToken,
    registry: Weak<OpenSeries>,
}

impl SeriesHandle {
    pub fn id(&self) -> SeriesId {
        self.id
    }

    pub fn data_descriptor(&self) -> &DatasetDescriptor {
        &self.data
    }

    pub fn resolver(&self) -> &Arc<TimestampResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Fires when the series or its registry is closed.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn chunking_options(&self) -> ChunkingOptions {
        ChunkingOptions::from_config(&self.config.chunking)
    }

    /// A new client with its own chunk cache, canceled together with the series.
    pub fn chunking_client(
        &self,
        options: ChunkingOptions,
    ) -> SeriesResult<DatasetChunkingClient> {
        self.chunking_client_with_token(options, self.token.child_token())
    }

    /// Like [`Self::chunking_client`], but the client's fetches are bound to `shutdown`,
    /// which must be a descendant of [`Self::cancel_token`].
    pub fn chunking_client_with_token(
        &self,
        options: ChunkingOptions,
        shutdown: CancellationToken,
    ) -> SeriesResult<DatasetChunkingClient> {
        if self.is_closed() || shutdown.is_cancelled() {
            return Err(SeriesError::Canceled);
        }
        DatasetChunkingClient::new(Arc::clone(&self.source), self.data.clone(), options, shutdown)
    }
}

impl Drop for SeriesHandle {
    fn drop(&mut self) {
        self.token.cancel();
        let Some(open) = self.registry.upgrade() else {
            return;
        };
        let removed = lock(&open).remove(&self.id);
        if removed.is_some() {
            log::info!("Released series #{} {}", self.id, self.object_path);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
