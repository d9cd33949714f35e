use crate::error::{SeriesError, SourceError};
use async_trait::async_trait;
use shared::{DatasetDescriptor, GroupDescriptor, NumericArray, SliceRange};
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Options for a [`ArraySource::get_dataset_data`] call.
#[derive(Debug, Clone, Default)]
pub struct DataRequest {
    /// One `[lo, hi)` range per leading dimension; `None` reads the whole dataset.
    pub slice: Option<Vec<SliceRange>>,
    pub cancel: Option<CancellationToken>,
}

impl DataRequest {
    pub fn slice(slice: Vec<SliceRange>) -> Self {
        DataRequest {
            slice: Some(slice),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Random-access remote array/group store.
///
/// `Ok(None)` means the path genuinely does not exist. Transport failures are
/// errors and must never be reported as a missing path.
#[async_trait]
pub trait ArraySource: Send + Sync + 'static {
    async fn get_group(&self, path: &str) -> Result<Option<GroupDescriptor>, SourceError>;

    async fn get_dataset(&self, path: &str) -> Result<Option<DatasetDescriptor>, SourceError>;

    async fn get_dataset_data(
        &self,
        path: &str,
        request: DataRequest,
    ) -> Result<Option<NumericArray>, SourceError>;
}

/// Awaits `future` unless `cancel` fires first.
pub async fn cancelable<T, F>(cancel: &CancellationToken, future: F) -> Result<T, SeriesError>
where
    F: Future<Output = Result<T, SeriesError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(SeriesError::Canceled),
        result = future => result,
    }
}

/// Reads a slice and fails with [`SeriesError::MissingData`] when the source has nothing for it.
pub async fn fetch_slice(
    source: &dyn ArraySource,
    path: &str,
    slice: Vec<SliceRange>,
    cancel: &CancellationToken,
) -> Result<NumericArray, SeriesError> {
    let request = DataRequest::slice(slice).with_cancel(cancel.clone());
    cancelable(cancel, async {
        source
            .get_dataset_data(path, request)
            .await?
            .ok_or_else(|| SeriesError::MissingData {
                path: path.to_string(),
            })
    })
    .await
}

/// Parent group path and leaf name of a store path.
pub fn split_path(path: &str) -> (&str, &str) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => ("/", &trimmed[1..]),
        Some(index) => (&trimmed[..index], &trimmed[index + 1..]),
        None => ("/", trimmed),
    }
}

pub fn join_path(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_and_join_paths() {
        assert_eq!(split_path("/acquisition/ts/data"), ("/acquisition/ts", "data"));
        assert_eq!(split_path("/acquisition"), ("/", "acquisition"));
        assert_eq!(split_path("timestamps"), ("/", "timestamps"));
        assert_eq!(join_path("/acquisition/ts", "data"), "/acquisition/ts/data");
        assert_eq!(join_path("/", "acquisition"), "/acquisition");
    }

    #[tokio::test]
    async fn test_cancelable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<u32, SeriesError> = cancelable(&cancel, async { Ok(7) }).await;
        assert!(matches!(result, Err(SeriesError::Canceled)));
    }

    #[tokio::test]
    async fn test_cancelable_passes_through_result() {
        let cancel = CancellationToken::new();
        let result = cancelable(&cancel, async { Ok::<_, SeriesError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
