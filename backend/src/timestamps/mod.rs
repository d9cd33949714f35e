//! Time <-> sample index conversion for the two sampling regimes.

mod block_cache;
mod irregular;
mod regular;

pub use block_cache::TimestampBlockCache;
pub use irregular::IrregularTimestampResolver;
pub use regular::RegularTimestampResolver;

use crate::error::{SeriesError, SeriesResult};
use crate::source::ArraySource;
use shared::TimestampsSection;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub enum TimestampResolver {
    Regular(RegularTimestampResolver),
    Irregular(IrregularTimestampResolver),
}

impl TimestampResolver {
    /// Picks the regime from the series group: a `timestamps` dataset means the
    /// series is irregular, otherwise it is described by `starting_time` and a rate.
    pub async fn open(
        source: Arc<dyn ArraySource>,
        object_path: &str,
        config: &TimestampsSection,
        shutdown: CancellationToken,
    ) -> SeriesResult<Self> {
        let group = source
            .get_group(object_path)
            .await?
            .ok_or_else(|| SeriesError::MissingGroup {
                path: object_path.to_string(),
            })?;

        if group.has_dataset("timestamps") {
            IrregularTimestampResolver::open(source, object_path, config, shutdown)
                .await
                .map(TimestampResolver::Irregular)
        } else {
            RegularTimestampResolver::open(source.as_ref(), object_path, &shutdown)
                .await
                .map(TimestampResolver::Regular)
        }
    }

    pub fn is_regular(&self) -> bool {
        matches!(self, TimestampResolver::Regular(_))
    }

    pub fn start_time(&self) -> f64 {
        match self {
            TimestampResolver::Regular(resolver) => resolver.start_time(),
            TimestampResolver::Irregular(resolver) => resolver.start_time(),
        }
    }

    pub fn end_time(&self) -> f64 {
        match self {
            TimestampResolver::Regular(resolver) => resolver.end_time(),
            TimestampResolver::Irregular(resolver) => resolver.end_time(),
        }
    }

    pub fn estimated_sampling_frequency(&self) -> f64 {
        match self {
            TimestampResolver::Regular(resolver) => resolver.rate(),
            TimestampResolver::Irregular(resolver) => resolver.estimated_sampling_frequency(),
        }
    }

    pub fn sample_count(&self) -> u64 {
        match self {
            TimestampResolver::Regular(resolver) => resolver.sample_count(),
            TimestampResolver::Irregular(resolver) => resolver.sample_count(),
        }
    }

    pub async fn index_for_time(&self, time: f64, cancel: &CancellationToken) -> SeriesResult<u64> {
        match self {
            TimestampResolver::Regular(resolver) => Ok(resolver.index_for_time(time)),
            TimestampResolver::Irregular(resolver) => resolver.index_for_time(time, cancel).await,
        }
    }

    pub async fn timestamps_for_index_range(
        &self,
        start_index: u64,
        end_index: u64,
        cancel: &CancellationToken,
    ) -> SeriesResult<Vec<f64>> {
        match self {
            TimestampResolver::Regular(resolver) => {
                Ok(resolver.timestamps_for_index_range(start_index, end_index))
            }
            TimestampResolver::Irregular(resolver) => {
                resolver
                    .timestamps_for_index_range(start_index, end_index, cancel)
                    .await
            }
        }
    }
}
