use crate::cache::FetchCache;
use crate::error::{SeriesError, SeriesResult};
use crate::source::{ArraySource, fetch_slice};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Random access to a timestamps dataset through fixed-size cached blocks.
pub struct TimestampBlockCache {
    source: Arc<dyn ArraySource>,
    path: String,
    block_size: u64,
    sample_count: u64,
    blocks: FetchCache<u64, Vec<f64>>,
    shutdown: CancellationToken,
}

impl TimestampBlockCache {
    pub fn new(
        source: Arc<dyn ArraySource>,
        path: impl Into<String>,
        sample_count: u64,
        block_size: u64,
        capacity: Option<usize>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            source,
            path: path.into(),
            block_size: block_size.max(1),
            sample_count,
            blocks: FetchCache::new("timestamp block", capacity),
            shutdown,
        }
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Timestamp at `index`, loading its whole block on first reference.
    pub async fn get(&self, index: u64, cancel: &CancellationToken) -> SeriesResult<f64> {
        let block_index = index / self.block_size;
        let block_start = block_index * self.block_size;
        let block_end = (block_start + self.block_size).min(self.sample_count);

        let block = self
            .blocks
            .get_or_fetch(block_index, cancel, || {
                let source = Arc::clone(&self.source);
                let path = self.path.clone();
                let shutdown = self.shutdown.clone();
                async move {
                    log::debug!("Loading timestamps [{}, {}) of {}", block_start, block_end, path);
                    fetch_slice(source.as_ref(), &path, vec![(block_start, block_end)], &shutdown)
                        .await
                        .map(|values| values.to_f64_vec())
                }
            })
            .await?;

        let offset = (index - block_start) as usize;
        block.get(offset).copied().ok_or_else(|| SeriesError::ShapeMismatch {
            path: self.path.clone(),
            expected: offset + 1,
            actual: block.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryArraySource;
    use shared::{Attributes, NumericArray};

    fn timestamps_source(count: usize) -> Arc<MemoryArraySource> {
        let source = MemoryArraySource::new();
        let values: Vec<f64> = (0..count).map(|i| i as f64 * 0.01).collect();
        source.insert_dataset(
            "/units/ts/timestamps",
            vec![count as u64],
            NumericArray::F64(values),
            Attributes::new(),
        );
        source
    }

    #[tokio::test]
    async fn test_block_is_fetched_once_for_many_indices() {
        let source = timestamps_source(250);
        let cache = TimestampBlockCache::new(
            source.clone(),
            "/units/ts/timestamps",
            250,
            100,
            None,
            CancellationToken::new(),
        );
        let cancel = CancellationToken::new();

        for index in [101, 150, 199, 120] {
            let value = cache.get(index, &cancel).await.unwrap();
            assert!((value - index as f64 * 0.01).abs() < 1e-12);
        }
        assert_eq!(source.requests_for("/units/ts/timestamps"), vec![vec![(100, 200)]]);
    }

    #[tokio::test]
    async fn test_last_block_is_short() {
        let source = timestamps_source(250);
        let cache = TimestampBlockCache::new(
            source.clone(),
            "/units/ts/timestamps",
            250,
            100,
            None,
            CancellationToken::new(),
        );

        let value = cache.get(249, &CancellationToken::new()).await.unwrap();
        assert!((value - 2.49).abs() < 1e-12);
        assert_eq!(source.requests_for("/units/ts/timestamps"), vec![vec![(200, 250)]]);
    }

    #[tokio::test]
    async fn test_missing_block_data_is_an_error() {
        let source = MemoryArraySource::new();
        let cache = TimestampBlockCache::new(
            source,
            "/units/ts/timestamps",
            10,
            100,
            None,
            CancellationToken::new(),
        );
        let result = cache.get(3, &CancellationToken::new()).await;
        assert!(matches!(result, Err(SeriesError::MissingData { .. })));
    }
}
