use std::sync::Arc;

/// Failure reported by an [`crate::ArraySource`].
///
/// Clonable so a single shared fetch can hand the same failure to every waiter.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("{0}")]
    Message(String),
    #[error("request canceled")]
    Canceled,
    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

impl From<anyhow::Error> for SourceError {
    fn from(error: anyhow::Error) -> Self {
        SourceError::Other(Arc::new(error))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SeriesError {
    #[error("group not found: {path}")]
    MissingGroup { path: String },
    #[error("dataset not found: {path}")]
    MissingDataset { path: String },
    #[error("unable to get dataset data: {path}")]
    MissingData { path: String },
    #[error("dataset {path} has rank {rank}, only rank 1 and 2 are supported")]
    UnsupportedRank { path: String, rank: usize },
    #[error("channel window [{start}, {end}) is outside the {available} channels of {path}")]
    InvalidChannelWindow {
        path: String,
        start: u64,
        end: u64,
        available: u64,
    },
    #[error("dataset {path} returned {actual} values, expected {expected}")]
    ShapeMismatch {
        path: String,
        expected: usize,
        actual: usize,
    },
    #[error("series {path} has no samples")]
    EmptySeries { path: String },
    #[error("canceled")]
    Canceled,
    #[error(transparent)]
    Source(SourceError),
}

impl SeriesError {
    /// Canceled work is expected during navigation and must not be reported as a failure.
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            SeriesError::Canceled | SeriesError::Source(SourceError::Canceled)
        )
    }
}

impl From<SourceError> for SeriesError {
    fn from(error: SourceError) -> Self {
        match error {
            SourceError::Canceled => SeriesError::Canceled,
            other => SeriesError::Source(other),
        }
    }
}

pub type SeriesResult<T> = Result<T, SeriesError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_cancel_maps_to_series_cancel() {
        let error: SeriesError = SourceError::Canceled.into();
        assert!(matches!(error, SeriesError::Canceled));
        assert!(error.is_canceled());
    }

    #[test]
    fn test_network_failure_is_not_cancellation() {
        let error: SeriesError = SourceError::from(anyhow::anyhow!("connection reset")).into();
        assert!(!error.is_canceled());
        assert_eq!(error.to_string(), "connection reset");
    }

    #[test]
    fn test_integrity_messages_name_the_path() {
        let error = SeriesError::UnsupportedRank {
            path: "/acquisition/ImageSeries/data".to_string(),
            rank: 3,
        };
        assert!(error.to_string().contains("/acquisition/ImageSeries/data"));
        assert!(error.to_string().contains("rank 3"));
    }
}
