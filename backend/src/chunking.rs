use crate::cache::FetchCache;
use crate::error::{SeriesError, SeriesResult};
use crate::source::{ArraySource, fetch_slice};
use rayon::prelude::*;
use shared::{ChunkingSection, DatasetDescriptor, NumericArray};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const NOISE_WINDOW: usize = 100;
const NOISE_MAX_SAMPLES: usize = NOISE_WINDOW * 50;
const NOISE_MULTIPLIER: f64 = 3.0;

// ===== OPTIONS =====

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingOptions {
    pub chunk_size: u64,
    /// `[start, end)` channel range; defaults to the first `default_channel_limit` channels.
    pub channel_window: Option<(u64, u64)>,
    /// Vertical separation multiplier, in units of the estimated noise level.
    pub auto_channel_separation: Option<f64>,
    pub ignore_conversion: bool,
    pub time_budget: Duration,
    pub cache_capacity: Option<usize>,
    pub default_channel_limit: u64,
}

impl ChunkingOptions {
    pub fn from_config(config: &ChunkingSection) -> Self {
        Self {
            chunk_size: config.chunk_size.max(1),
            channel_window: None,
            auto_channel_separation: None,
            ignore_conversion: false,
            time_budget: Duration::from_millis(config.time_budget_ms),
            cache_capacity: config.cache_capacity,
            default_channel_limit: config.default_channel_limit,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_channel_window(mut self, start: u64, end: u64) -> Self {
        self.channel_window = Some((start, end));
        self
    }

    pub fn with_auto_channel_separation(mut self, multiplier: f64) -> Self {
        self.auto_channel_separation = Some(multiplier);
        self
    }

    pub fn with_ignore_conversion(mut self, ignore: bool) -> Self {
        self.ignore_conversion = ignore;
        self
    }
}

impl Default for ChunkingOptions {
    fn default() -> Self {
        Self::from_config(&ChunkingSection::default())
    }
}

// ===== CHUNKS =====

/// Converted samples of one chunk, one row per selected channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    rows: Vec<Vec<f64>>,
}

impl Chunk {
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    pub fn sample_count(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConcatenatedChunk {
    /// Channel-major samples; sub-ranges that were not loaded in time are NaN.
    pub data: Vec<Vec<f64>>,
    pub completed: bool,
    pub start_index: u64,
}

impl ConcatenatedChunk {
    pub fn sample_count(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    pub fn end_index(&self) -> u64 {
        self.start_index + self.sample_count() as u64
    }
}

// ===== CLIENT =====

/// Serves windows of a remote `[samples]` or `[samples, channels]` dataset,
/// loading and converting it chunk by chunk.
///
/// Every client owns its chunk cache; caches are never shared between clients.
pub struct DatasetChunkingClient {
    source: Arc<dyn ArraySource>,
    descriptor: DatasetDescriptor,
    options: ChunkingOptions,
    channel_window: (u64, u64),
    conversion: f64,
    offset: f64,
    chunks: FetchCache<u64, Chunk>,
    noise_level: OnceCell<f64>,
    shutdown: CancellationToken,
}

impl DatasetChunkingClient {
    pub fn new(
        source: Arc<dyn ArraySource>,
        descriptor: DatasetDescriptor,
        options: ChunkingOptions,
        shutdown: CancellationToken,
    ) -> SeriesResult<Self> {
        let rank = descriptor.rank();
        if rank == 0 || rank > 2 {
            return Err(SeriesError::UnsupportedRank {
                path: descriptor.path.clone(),
                rank,
            });
        }

        let available = if rank == 1 { 1 } else { descriptor.shape[1] };
        let (start, end) = options
            .channel_window
            .unwrap_or((0, available.min(options.default_channel_limit)));
        if start >= end || end > available {
            return Err(SeriesError::InvalidChannelWindow {
                path: descriptor.path.clone(),
                start,
                end,
                available,
            });
        }

        let (conversion, offset) = if options.ignore_conversion {
            (1.0, 0.0)
        } else {
            (
                usable_attr(&descriptor, "conversion").unwrap_or(1.0),
                usable_attr(&descriptor, "offset").unwrap_or(0.0),
            )
        };

        log::debug!(
            "Chunking client for {} ({:?}, {}), channels [{}, {}), chunk size {}",
            descriptor.path,
            descriptor.shape,
            descriptor.dtype,
            start,
            end,
            options.chunk_size
        );

        let options = ChunkingOptions {
            chunk_size: options.chunk_size.max(1),
            ..options
        };
        Ok(Self {
            source,
            descriptor,
            chunks: FetchCache::new("chunk", options.cache_capacity),
            options,
            channel_window: (start, end),
            conversion,
            offset,
            noise_level: OnceCell::new(),
            shutdown,
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.options.chunk_size
    }

    pub fn sample_count(&self) -> u64 {
        self.descriptor.sample_count()
    }

    pub fn chunk_count(&self) -> u64 {
        self.sample_count().div_ceil(self.options.chunk_size)
    }

    pub fn channel_window(&self) -> (u64, u64) {
        self.channel_window
    }

    pub fn channel_count(&self) -> usize {
        (self.channel_window.1 - self.channel_window.0) as usize
    }

    pub fn conversion(&self) -> (f64, f64) {
        (self.conversion, self.offset)
    }

    /// `None` until a separated window has been requested.
    pub fn noise_level(&self) -> Option<f64> {
        self.noise_level.get().copied()
    }

    pub fn resident_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Concatenates chunks `[start_chunk, end_chunk)` into one channel-major window.
    ///
    /// Uncached chunks are fetched until the time budget runs out; whatever could
    /// not be fetched stays NaN and the result is marked incomplete.
    pub async fn get_concatenated_chunk(
        &self,
        start_chunk: u64,
        end_chunk: u64,
        cancel: &CancellationToken,
    ) -> SeriesResult<ConcatenatedChunk> {
        // a zero multiplier turns separation off
        let separation = match self.options.auto_channel_separation.filter(|m| *m != 0.0) {
            Some(multiplier) => Some(multiplier * self.ensure_noise_level(cancel).await?),
            None => None,
        };

        let started = Instant::now();
        let chunk_size = self.options.chunk_size;
        let end_chunk = end_chunk.min(self.chunk_count());
        let start_chunk = start_chunk.min(end_chunk);
        let end_index = (end_chunk * chunk_size).min(self.sample_count());
        let start_index = (start_chunk * chunk_size).min(end_index);
        let width = (end_index - start_index) as usize;

        let mut data = vec![vec![f64::NAN; width]; self.channel_count()];
        let mut completed = true;

        for chunk_index in start_chunk..end_chunk {
            let chunk = match self.chunks.get_resident(&chunk_index) {
                Some(chunk) => chunk,
                None if completed && started.elapsed() <= self.options.time_budget => {
                    self.load_chunk(chunk_index, cancel).await?
                }
                None => {
                    if completed {
                        log::debug!(
                            "Time budget of {:?} spent, leaving chunks from {} of {} for later",
                            self.options.time_budget,
                            chunk_index,
                            self.descriptor.path
                        );
                    }
                    completed = false;
                    continue;
                }
            };

            let offset = (chunk_index * chunk_size - start_index) as usize;
            for (channel, (target, source)) in data.iter_mut().zip(chunk.rows()).enumerate() {
                let shift = separation.map_or(0.0, |step| channel as f64 * step);
                for (slot, value) in target[offset..].iter_mut().zip(source) {
                    *slot = value + shift;
                }
            }
        }

        Ok(ConcatenatedChunk {
            data,
            completed,
            start_index,
        })
    }

    async fn load_chunk(
        &self,
        chunk_index: u64,
        cancel: &CancellationToken,
    ) -> SeriesResult<Arc<Chunk>> {
        self.chunks
            .get_or_fetch(chunk_index, cancel, || {
                let source = Arc::clone(&self.source);
                let path = self.descriptor.path.clone();
                let shutdown = self.shutdown.clone();
                let channels = self.channel_count();
                let (conversion, offset) = (self.conversion, self.offset);
                let start = chunk_index * self.options.chunk_size;
                let end = (start + self.options.chunk_size).min(self.sample_count());
                let slice = if self.descriptor.rank() == 1 {
                    vec![(start, end)]
                } else {
                    vec![(start, end), self.channel_window]
                };

                async move {
                    log::debug!("Loading chunk {} [{}, {}) of {}", chunk_index, start, end, path);
                    let raw = fetch_slice(source.as_ref(), &path, slice, &shutdown).await?;
                    convert_chunk(&path, &raw, channels, (end - start) as usize, conversion, offset)
                }
            })
            .await
    }

    async fn ensure_noise_level(&self, cancel: &CancellationToken) -> SeriesResult<f64> {
        self.noise_level
            .get_or_try_init(|| self.compute_noise_level(cancel))
            .await
            .copied()
    }

    async fn compute_noise_level(&self, cancel: &CancellationToken) -> SeriesResult<f64> {
        if self.chunk_count() == 0 {
            return Ok(0.0);
        }
        let chunk = self.load_chunk(0, cancel).await?;
        let noise = estimate_noise_level(&chunk);
        log::debug!("Noise level of {}: {}", self.descriptor.path, noise);
        Ok(noise)
    }
}

fn usable_attr(descriptor: &DatasetDescriptor, name: &str) -> Option<f64> {
    descriptor.attr_f64(name).filter(|value| value.is_finite())
}

/// Applies `value * conversion + offset` and turns row-major samples into channel rows.
fn convert_chunk(
    path: &str,
    raw: &NumericArray,
    channels: usize,
    samples: usize,
    conversion: f64,
    offset: f64,
) -> SeriesResult<Chunk> {
    let expected = channels * samples;
    if raw.len() < expected {
        return Err(SeriesError::ShapeMismatch {
            path: path.to_string(),
            expected,
            actual: raw.len(),
        });
    }
    if raw.is_wide_integer() {
        log::debug!("Downcasting {} samples of {} to f64", raw.dtype(), path);
    }

    let values = raw.to_f64_vec();
    let rows = (0..channels)
        .into_par_iter()
        .map(|channel| {
            (0..samples)
                .map(|sample| values[channel + sample * channels] * conversion + offset)
                .collect::<Vec<f64>>()
        })
        .collect();
    Ok(Chunk { rows })
}

/// Three times the median RMS of consecutive 100-sample windows over the start of each channel.
fn estimate_noise_level(chunk: &Chunk) -> f64 {
    let mut levels: Vec<f64> = chunk
        .rows()
        .iter()
        .flat_map(|row| {
            let limit = row.len().min(NOISE_MAX_SAMPLES);
            row[..limit].chunks(NOISE_WINDOW).map(|window| {
                (window.iter().map(|value| value * value).sum::<f64>() / window.len() as f64).sqrt()
            })
        })
        .filter(|level| level.is_finite())
        .collect();
    median(&mut levels) * NOISE_MULTIPLIER
}

fn median(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let middle = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[middle - 1] + values[middle]) / 2.0
    } else {
        values[middle]
    }
}
