use crate::controller::TimeWindowController;
use backend::{
    ChunkingOptions, DatasetChunkingClient, SeriesError, SeriesHandle, SeriesResult,
    TimestampResolver,
};
use shared::{TimeRange, ViewSection};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;

/// Samples of the currently visible window.
#[derive(Debug, Clone, PartialEq)]
pub struct VisibleWindow {
    pub start_index: u64,
    pub end_index: u64,
    pub timestamps: Vec<f64>,
    /// One row per selected channel, aligned with `timestamps`.
    pub channels: Vec<Vec<f64>>,
    /// `false` when part of the window is still NaN; load again to fill it in.
    pub completed: bool,
}

/// Outcome of [`SeriesView::load_visible`].
#[derive(Debug, Clone, PartialEq)]
pub enum VisibleLoad {
    /// The time range is not initialized yet.
    Empty,
    /// The visible window is longer than the view loads at once; nothing was fetched.
    ZoomInRequired { duration: f64, max_duration: f64 },
    Loaded(VisibleWindow),
}

/// One open view of a series: its navigation plus the data behind the visible window.
pub struct SeriesView {
    controller: TimeWindowController,
    resolver: Arc<TimestampResolver>,
    client: DatasetChunkingClient,
    max_visible_duration: f64,
    token: CancellationToken,
    current_load: Mutex<Option<CancellationToken>>,
}

impl SeriesView {
    /// Opens a view on the first `initial_window_chunks` chunks of the series,
    /// or on all of it when the view settings start zoomed out.
    pub fn open(handle: &SeriesHandle, options: ChunkingOptions) -> SeriesResult<Self> {
        let token = handle.cancel_token().child_token();
        let client = handle.chunking_client_with_token(options, token.child_token())?;
        let resolver = Arc::clone(handle.resolver());
        let settings = &handle.config().view;
        let rate = usable_rate(resolver.estimated_sampling_frequency());

        let controller = TimeWindowController::new(handle.config().navigation.clone());
        let (start, end) = (resolver.start_time(), resolver.end_time());
        controller.initialize(start, end);
        if !settings.start_zoomed_out {
            let chunk_duration = client.chunk_size() as f64 / rate;
            let initial = chunk_duration * settings.initial_window_chunks as f64;
            controller.set_visible_range(start, (start + initial).min(end));
        }

        Ok(Self {
            controller,
            resolver,
            max_visible_duration: max_visible_duration(settings, client.channel_count(), rate),
            client,
            token,
            current_load: Mutex::new(None),
        })
    }

    pub fn controller(&self) -> &TimeWindowController {
        &self.controller
    }

    pub fn resolver(&self) -> &TimestampResolver {
        &self.resolver
    }

    pub fn client(&self) -> &DatasetChunkingClient {
        &self.client
    }

    /// Longest visible window, in seconds, that [`Self::load_visible`] will fetch.
    pub fn max_visible_duration(&self) -> f64 {
        self.max_visible_duration
    }

    /// Sample range `[start, end)` covering the visible time window.
    pub async fn visible_index_range(
        &self,
        cancel: &CancellationToken,
    ) -> SeriesResult<Option<(u64, u64)>> {
        match self.controller.state().visible_range() {
            Some(range) => self.index_range(range, cancel).await.map(Some),
            None => Ok(None),
        }
    }

    async fn index_range(
        &self,
        range: TimeRange,
        cancel: &CancellationToken,
    ) -> SeriesResult<(u64, u64)> {
        let start = self.resolver.index_for_time(range.start, cancel).await?;
        let end = (self.resolver.index_for_time(range.end, cancel).await? + 1)
            .min(self.resolver.sample_count());
        Ok((start, end.max(start)))
    }

    /// Loads the visible window, canceling whatever load was still running for this view.
    pub async fn load_visible(&self) -> SeriesResult<VisibleLoad> {
        let request = self.token.child_token();
        if let Some(previous) = lock(&self.current_load).replace(request.clone()) {
            previous.cancel();
        }
        if request.is_cancelled() {
            return Err(SeriesError::Canceled);
        }

        let Some(range) = self.controller.state().visible_range() else {
            return Ok(VisibleLoad::Empty);
        };
        if range.duration() > self.max_visible_duration {
            log::debug!(
                "Visible window of {:.3}s exceeds {:.3}s, zoom in to load it",
                range.duration(),
                self.max_visible_duration
            );
            return Ok(VisibleLoad::ZoomInRequired {
                duration: range.duration(),
                max_duration: self.max_visible_duration,
            });
        }

        let (start_index, end_index) = self.index_range(range, &request).await?;
        let chunk_size = self.client.chunk_size();
        let chunk = self
            .client
            .get_concatenated_chunk(
                start_index / chunk_size,
                end_index.div_ceil(chunk_size),
                &request,
            )
            .await?;
        let timestamps = self
            .resolver
            .timestamps_for_index_range(start_index, end_index, &request)
            .await?;

        let from = (start_index - chunk.start_index) as usize;
        let to = ((end_index - chunk.start_index) as usize).min(chunk.sample_count());
        let channels = chunk
            .data
            .iter()
            .map(|row| row[from.min(to)..to].to_vec())
            .collect();

        log::debug!(
            "Visible samples [{}, {}) loaded, completed: {}",
            start_index,
            end_index,
            chunk.completed
        );
        Ok(VisibleLoad::Loaded(VisibleWindow {
            start_index,
            end_index,
            timestamps,
            channels,
            completed: chunk.completed,
        }))
    }

    /// Cancels all outstanding work of this view, including fetches already sent to the source.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for SeriesView {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

fn usable_rate(rate: f64) -> f64 {
    if rate.is_finite() && rate > 0.0 { rate } else { 1.0 }
}

/// `max_visible_values / channels / rate` seconds, never below `min_visible_duration`.
fn max_visible_duration(settings: &ViewSection, channels: usize, rate: f64) -> f64 {
    let channels = channels.max(1) as f64;
    (settings.max_visible_values / channels / rate).max(settings.min_visible_duration)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
