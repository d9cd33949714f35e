use super::block_cache::TimestampBlockCache;
use crate::error::{SeriesError, SeriesResult};
use crate::source::{ArraySource, fetch_slice, join_path};
use shared::TimestampsSection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Timestamps of a series sampled at arbitrary instants, read from
/// `{object}/timestamps` on demand.
pub struct IrregularTimestampResolver {
    source: Arc<dyn ArraySource>,
    path: String,
    sample_count: u64,
    // Last index with a usable timestamp; a trailing non-finite sample is skipped.
    last_index: u64,
    start_time: f64,
    end_time: f64,
    estimated_sampling_frequency: f64,
    blocks: TimestampBlockCache,
}

impl IrregularTimestampResolver {
    /// Reads a prefix to estimate the sampling rate and a short suffix to find the end time.
    pub async fn open(
        source: Arc<dyn ArraySource>,
        object_path: &str,
        config: &TimestampsSection,
        shutdown: CancellationToken,
    ) -> SeriesResult<Self> {
        let path = join_path(object_path, "timestamps");
        let descriptor = source
            .get_dataset(&path)
            .await?
            .ok_or_else(|| SeriesError::MissingDataset { path: path.clone() })?;
        let sample_count = descriptor.sample_count();
        if descriptor.shape.first().copied().unwrap_or(0) == 0 {
            return Err(SeriesError::EmptySeries { path });
        }

        let prefix_len = config.initial_probe_count.max(1).min(sample_count);
        // two trailing samples at least, so a non-finite final one can be skipped
        let suffix_start = sample_count.saturating_sub(config.final_probe_count.max(2));
        let prefix = fetch_slice(source.as_ref(), &path, vec![(0, prefix_len)], &shutdown)
            .await?
            .to_f64_vec();
        let suffix = fetch_slice(
            source.as_ref(),
            &path,
            vec![(suffix_start, sample_count)],
            &shutdown,
        )
        .await?
        .to_f64_vec();

        let start_time = *prefix.first().ok_or_else(|| SeriesError::ShapeMismatch {
            path: path.clone(),
            expected: prefix_len as usize,
            actual: 0,
        })?;
        let (end_time, last_index) = match suffix.as_slice() {
            [.., before_last, last] if !last.is_finite() => {
                log::warn!(
                    "Final timestamp of {} is {}, using the second-to-last one",
                    path,
                    last
                );
                (*before_last, sample_count - 2)
            }
            [.., last] => (*last, sample_count - 1),
            [] => {
                return Err(SeriesError::ShapeMismatch {
                    path,
                    expected: (sample_count - suffix_start) as usize,
                    actual: 0,
                });
            }
        };

        let estimated_sampling_frequency = estimate_sampling_frequency(&prefix);
        log::debug!(
            "Irregular timestamps {}: {} samples, {}..{}, ~{} Hz",
            path,
            sample_count,
            start_time,
            end_time,
            estimated_sampling_frequency
        );

        let blocks = TimestampBlockCache::new(
            Arc::clone(&source),
            path.clone(),
            sample_count,
            config.block_size,
            config.block_cache_capacity,
            shutdown,
        );

        Ok(Self {
            source,
            path,
            sample_count,
            last_index,
            start_time,
            end_time,
            estimated_sampling_frequency,
            blocks,
        })
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.end_time
    }

    pub fn estimated_sampling_frequency(&self) -> f64 {
        self.estimated_sampling_frequency
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    /// Index of the sample nearest to `time`; ties go to the lower index.
    ///
    /// Interpolation search over the cached blocks, falling back to bisection
    /// whenever the interpolated probe does not land strictly inside the bracket.
    pub async fn index_for_time(&self, time: f64, cancel: &CancellationToken) -> SeriesResult<u64> {
        let mut lower = 0;
        let mut upper = self.last_index;
        if upper == 0 {
            return Ok(0);
        }
        let mut lower_time = self.blocks.get(lower, cancel).await?;
        let mut upper_time = self.blocks.get(upper, cancel).await?;

        while upper - lower > 1 {
            if time <= lower_time {
                return Ok(lower);
            }
            if time >= upper_time {
                return Ok(upper);
            }

            let fraction = (time - lower_time) / (upper_time - lower_time);
            let mut probe = lower + ((upper - lower) as f64 * fraction).floor() as u64;
            if probe <= lower || probe >= upper {
                probe = lower + (upper - lower) / 2;
            }

            let probe_time = self.blocks.get(probe, cancel).await?;
            if probe_time == time {
                return Ok(probe);
            }
            if probe_time < time {
                lower = probe;
                lower_time = probe_time;
            } else {
                upper = probe;
                upper_time = probe_time;
            }
        }

        if (time - lower_time).abs() <= (upper_time - time).abs() {
            Ok(lower)
        } else {
            Ok(upper)
        }
    }

    /// Raw timestamps for `[start_index, end_index)`, read in a single uncached request.
    pub async fn timestamps_for_index_range(
        &self,
        start_index: u64,
        end_index: u64,
        cancel: &CancellationToken,
    ) -> SeriesResult<Vec<f64>> {
        let end_index = end_index.min(self.sample_count);
        if start_index >= end_index {
            return Ok(Vec::new());
        }
        let values = fetch_slice(
            self.source.as_ref(),
            &self.path,
            vec![(start_index, end_index)],
            cancel,
        )
        .await?;
        Ok(values.to_f64_vec())
    }
}

/// `1 / median(consecutive deltas)`, or 1 when the rate cannot be estimated.
pub(crate) fn estimate_sampling_frequency(timestamps: &[f64]) -> f64 {
    let mut deltas: Vec<f64> = timestamps
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|delta| delta.is_finite())
        .collect();
    if deltas.is_empty() {
        return 1.0;
    }
    deltas.sort_by(f64::total_cmp);
    let median = deltas[deltas.len() / 2];
    if median > 0.0 { 1.0 / median } else { 1.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryArraySource;
    use shared::{Attributes, NumericArray};

    const OBJECT: &str = "/processing/behavior/position";

    async fn resolver_for(
        values: Vec<f64>,
        config: &TimestampsSection,
    ) -> (Arc<MemoryArraySource>, IrregularTimestampResolver) {
        let source = MemoryArraySource::new();
        source.insert_dataset(
            &format!("{}/timestamps", OBJECT),
            vec![values.len() as u64],
            NumericArray::F64(values),
            Attributes::new(),
        );
        let resolver = IrregularTimestampResolver::open(
            source.clone(),
            OBJECT,
            config,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        (source, resolver)
    }

    #[tokio::test]
    async fn test_trailing_nan_uses_second_to_last_timestamp() {
        let mut values: Vec<f64> = (0..99).map(|i| i as f64 * 0.1).collect();
        values.push(f64::NAN);

        let (_, resolver) = resolver_for(values, &TimestampsSection::default()).await;
        assert_eq!(resolver.sample_count(), 100);
        assert_eq!(resolver.start_time(), 0.0);
        assert!((resolver.end_time() - 9.8).abs() < 1e-9);
        assert!((resolver.estimated_sampling_frequency() - 10.0).abs() < 1e-6);

        let cancel = CancellationToken::new();
        assert_eq!(resolver.index_for_time(1e6, &cancel).await.unwrap(), 98);

        for index in 0..98u64 {
            let time = index as f64 * 0.1;
            assert_eq!(resolver.index_for_time(time + 0.03, &cancel).await.unwrap(), index);
            assert_eq!(resolver.index_for_time(time + 0.07, &cancel).await.unwrap(), index + 1);
        }
        assert_eq!(resolver.index_for_time(9.79, &cancel).await.unwrap(), 98);
        assert_eq!(resolver.index_for_time(9.9, &cancel).await.unwrap(), 98);
    }

    #[tokio::test]
    async fn test_trailing_nan_skipped_when_one_final_sample_is_configured() {
        let config = TimestampsSection {
            final_probe_count: 1,
            ..TimestampsSection::default()
        };
        let (source, resolver) = resolver_for(vec![0.0, 0.5, 1.0, f64::NAN], &config).await;
        assert_eq!(resolver.end_time(), 1.0);
        assert_eq!(
            source.requests_for(&format!("{}/timestamps", OBJECT))[1],
            vec![(2, 4)]
        );
        let cancel = CancellationToken::new();
        assert_eq!(resolver.index_for_time(7.0, &cancel).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_nearest_neighbor_with_lower_index_on_ties() {
        let values: Vec<f64> = (0..10).map(|i| i as f64 * 0.5).collect();
        let (_, resolver) = resolver_for(values, &TimestampsSection::default()).await;
        let cancel = CancellationToken::new();

        assert_eq!(resolver.index_for_time(0.25, &cancel).await.unwrap(), 0);
        assert_eq!(resolver.index_for_time(0.7, &cancel).await.unwrap(), 1);
        assert_eq!(resolver.index_for_time(0.8, &cancel).await.unwrap(), 2);
        assert_eq!(resolver.index_for_time(3.0, &cancel).await.unwrap(), 6);
        assert_eq!(resolver.index_for_time(-1.0, &cancel).await.unwrap(), 0);
        assert_eq!(resolver.index_for_time(99.0, &cancel).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_search_over_uneven_spacing_matches_linear_scan() {
        // quadratic spacing defeats pure interpolation
        let values: Vec<f64> = (0..2_000).map(|i| (i as f64).powi(2) * 1e-4).collect();
        let config = TimestampsSection {
            block_size: 256,
            ..TimestampsSection::default()
        };
        let (_, resolver) = resolver_for(values.clone(), &config).await;
        let cancel = CancellationToken::new();

        for query in [0.0005, 3.3, 17.77, 123.4, 399.0] {
            let expected = values
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| (*a - query).abs().total_cmp(&(*b - query).abs()))
                .map(|(index, _)| index as u64)
                .unwrap();
            assert_eq!(
                resolver.index_for_time(query, &cancel).await.unwrap(),
                expected,
                "query {}",
                query
            );
        }
    }

    #[tokio::test]
    async fn test_initialization_reads_prefix_and_suffix_only() {
        let values: Vec<f64> = (0..50_000).map(|i| i as f64 / 1_000.0).collect();
        let (source, resolver) = resolver_for(values, &TimestampsSection::default()).await;
        assert_eq!(
            source.requests_for(&format!("{}/timestamps", OBJECT)),
            vec![vec![(0, 10_000)], vec![(49_990, 50_000)]]
        );
        assert!((resolver.end_time() - 49.999).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_range_read_is_clamped() {
        let values: Vec<f64> = (0..20).map(|i| i as f64).collect();
        let (_, resolver) = resolver_for(values, &TimestampsSection::default()).await;
        let cancel = CancellationToken::new();
        assert_eq!(
            resolver.timestamps_for_index_range(17, 30, &cancel).await.unwrap(),
            vec![17.0, 18.0, 19.0]
        );
        let empty = resolver.timestamps_for_index_range(5, 5, &cancel).await.unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn test_single_sample_series() {
        let (_, resolver) = resolver_for(vec![4.0], &TimestampsSection::default()).await;
        assert_eq!(resolver.start_time(), 4.0);
        assert_eq!(resolver.end_time(), 4.0);
        assert_eq!(resolver.estimated_sampling_frequency(), 1.0);
        let cancel = CancellationToken::new();
        assert_eq!(resolver.index_for_time(100.0, &cancel).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_timestamps_are_an_integrity_error() {
        let source = MemoryArraySource::new();
        source.insert_dataset(
            &format!("{}/timestamps", OBJECT),
            vec![0],
            NumericArray::F64(vec![]),
            Attributes::new(),
        );
        let result = IrregularTimestampResolver::open(
            source,
            OBJECT,
            &TimestampsSection::default(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(SeriesError::EmptySeries { .. })));
    }

    #[test]
    fn test_frequency_uses_numeric_median() {
        // deltas 0.5, 0.5, 2.0, 0.5, 10.0 -> sorted median 0.5
        let timestamps = [0.0, 0.5, 1.0, 3.0, 3.5, 13.5];
        assert_eq!(estimate_sampling_frequency(&timestamps), 2.0);
        assert_eq!(estimate_sampling_frequency(&[1.0]), 1.0);
    }
}
