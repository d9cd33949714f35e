use crate::error::{SeriesError, SeriesResult};
use crate::source::{ArraySource, DataRequest, join_path};
use tokio_util::sync::CancellationToken;

/// Timestamps of a uniformly sampled series: `start_time + index / rate`.
#[derive(Debug, Clone, PartialEq)]
pub struct RegularTimestampResolver {
    start_time: f64,
    rate: f64,
    sample_count: u64,
}

impl RegularTimestampResolver {
    /// A missing, zero or non-finite rate falls back to 1 Hz.
    pub fn new(start_time: f64, rate: Option<f64>, sample_count: u64) -> Self {
        let rate = match rate {
            Some(rate) if rate.is_finite() && rate != 0.0 => rate,
            other => {
                log::warn!("Sampling rate {:?} is unusable, assuming 1 Hz", other);
                1.0
            }
        };
        Self {
            start_time,
            rate,
            sample_count,
        }
    }

    /// Reads `{object}/starting_time` (value plus `rate` attribute) and the sample
    /// count of `{object}/data`.
    pub async fn open(
        source: &dyn ArraySource,
        object_path: &str,
        cancel: &CancellationToken,
    ) -> SeriesResult<Self> {
        let starting_time_path = join_path(object_path, "starting_time");
        let data_path = join_path(object_path, "data");

        let starting_time = source
            .get_dataset(&starting_time_path)
            .await?
            .ok_or_else(|| SeriesError::MissingDataset {
                path: starting_time_path.clone(),
            })?;
        let data = source
            .get_dataset(&data_path)
            .await?
            .ok_or_else(|| SeriesError::MissingDataset {
                path: data_path.clone(),
            })?;

        let request = DataRequest::default().with_cancel(cancel.clone());
        let start_time = crate::source::cancelable(cancel, async {
            source
                .get_dataset_data(&starting_time_path, request)
                .await?
                .and_then(|value| value.get_f64(0))
                .ok_or_else(|| SeriesError::MissingData {
                    path: starting_time_path.clone(),
                })
        })
        .await?;

        Ok(Self::new(
            start_time,
            starting_time.attr_f64("rate"),
            data.sample_count(),
        ))
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.sample_count as f64 / self.rate
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn index_for_time(&self, time: f64) -> u64 {
        let last = self.sample_count.saturating_sub(1);
        if time < self.start_time {
            0
        } else if time >= self.end_time() {
            last
        } else {
            (((time - self.start_time) * self.rate).round() as u64).min(last)
        }
    }

    pub fn timestamps_for_index_range(&self, start_index: u64, end_index: u64) -> Vec<f64> {
        (start_index..end_index)
            .map(|index| self.start_time + index as f64 / self.rate)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryArraySource;
    use shared::{Attributes, NumericArray};

    #[test]
    fn test_known_rate_lookup() {
        let resolver = RegularTimestampResolver::new(0.0, Some(30_000.0), 900_000);
        assert_eq!(resolver.end_time(), 30.0);
        assert_eq!(resolver.index_for_time(15.0), 450_000);
        assert_eq!(
            resolver.timestamps_for_index_range(0, 3),
            vec![0.0, 1.0 / 30_000.0, 2.0 / 30_000.0]
        );
    }

    #[test]
    fn test_every_sample_time_maps_back_to_its_index() {
        let resolver = RegularTimestampResolver::new(12.5, Some(1_000.0), 5_000);
        for k in 0..5_000u64 {
            let time = resolver.start_time() + k as f64 / resolver.rate();
            assert_eq!(resolver.index_for_time(time), k, "time {}", time);
        }
    }

    #[test]
    fn test_out_of_range_times_clamp() {
        let resolver = RegularTimestampResolver::new(10.0, Some(100.0), 50);
        assert_eq!(resolver.index_for_time(-3.0), 0);
        assert_eq!(resolver.index_for_time(9.999), 0);
        assert_eq!(resolver.index_for_time(resolver.end_time()), 49);
        assert_eq!(resolver.index_for_time(1e9), 49);
    }

    #[test]
    fn test_unusable_rate_falls_back_to_one_hz() {
        for rate in [None, Some(0.0), Some(f64::NAN)] {
            let resolver = RegularTimestampResolver::new(0.0, rate, 10);
            assert_eq!(resolver.rate(), 1.0);
            assert_eq!(resolver.end_time(), 10.0);
        }
    }

    #[tokio::test]
    async fn test_open_reads_starting_time_and_rate() {
        let source = MemoryArraySource::new();
        let mut attrs = Attributes::new();
        attrs.insert("rate".to_string(), serde_json::json!(250.0));
        source.insert_dataset(
            "/acquisition/ecg/starting_time",
            vec![],
            NumericArray::F64(vec![3.0]),
            attrs,
        );
        source.insert_dataset(
            "/acquisition/ecg/data",
            vec![1_000],
            NumericArray::F32(vec![0.0; 1_000]),
            Attributes::new(),
        );

        let cancel = CancellationToken::new();
        let resolver = RegularTimestampResolver::open(source.as_ref(), "/acquisition/ecg", &cancel)
            .await
            .unwrap();
        assert_eq!(resolver.start_time(), 3.0);
        assert_eq!(resolver.rate(), 250.0);
        assert_eq!(resolver.end_time(), 7.0);
    }

    #[tokio::test]
    async fn test_open_without_starting_time_fails() {
        let source = MemoryArraySource::new();
        source.insert_dataset(
            "/acquisition/ecg/data",
            vec![3],
            NumericArray::F64(vec![0.0; 3]),
            Attributes::new(),
        );
        let cancel = CancellationToken::new();
        let result =
            RegularTimestampResolver::open(source.as_ref(), "/acquisition/ecg", &cancel).await;
        assert!(matches!(
            result,
            Err(SeriesError::MissingDataset { path }) if path == "/acquisition/ecg/starting_time"
        ));
    }
}
