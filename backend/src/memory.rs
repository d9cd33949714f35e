//! In-memory [`ArraySource`] used by tests and the demo recording.
//!
//! Datasets are stored flat in row-major order. Slicing supports rank 0, 1 and 2,
//! which covers everything the engine reads. Latency and failures can be injected
//! per dataset path, and every data request is recorded so callers can assert on
//! how often the store was hit.

use crate::error::SourceError;
use crate::source::{ArraySource, DataRequest, split_path};
use async_trait::async_trait;
use shared::{Attributes, DatasetDescriptor, GroupDescriptor, NumericArray, SliceRange};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

type LatencyFn = Arc<dyn Fn(&[SliceRange]) -> Duration + Send + Sync>;

#[derive(Clone)]
struct DatasetEntry {
    descriptor: DatasetDescriptor,
    data: Option<NumericArray>,
}

#[derive(Default)]
struct StoreState {
    groups: BTreeMap<String, GroupDescriptor>,
    datasets: HashMap<String, DatasetEntry>,
    latency: HashMap<String, LatencyFn>,
    failures: HashMap<String, String>,
}

struct RecordedRequest {
    path: String,
    slice: Vec<SliceRange>,
    cancel: Option<CancellationToken>,
}

#[derive(Default)]
pub struct MemoryArraySource {
    state: RwLock<StoreState>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryArraySource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Registers a dataset and creates its parent groups on the way.
    pub fn insert_dataset(
        &self,
        path: &str,
        shape: Vec<u64>,
        data: NumericArray,
        attrs: Attributes,
    ) {
        let descriptor = DatasetDescriptor {
            path: path.to_string(),
            shape,
            dtype: data.dtype().to_string(),
            attrs,
        };
        self.insert_entry(DatasetEntry {
            descriptor,
            data: Some(data),
        });
    }

    /// Registers a descriptor whose data cannot be read back.
    pub fn insert_descriptor(&self, descriptor: DatasetDescriptor) {
        self.insert_entry(DatasetEntry {
            descriptor,
            data: None,
        });
    }

    fn insert_entry(&self, entry: DatasetEntry) {
        let mut state = write_state(&self.state);
        let path = entry.descriptor.path.clone();
        let (parent, name) = split_path(&path);
        let group = ensure_group(&mut state.groups, parent);
        if !group.has_dataset(name) {
            group.datasets.push(name.to_string());
        }
        state.datasets.insert(path, entry);
    }

    pub fn set_group_attrs(&self, path: &str, attrs: Attributes) {
        let mut state = write_state(&self.state);
        ensure_group(&mut state.groups, path).attrs = attrs;
    }

    /// Delays every data request on `path` by whatever `latency` returns for its slice.
    pub fn set_latency(
        &self,
        path: &str,
        latency: impl Fn(&[SliceRange]) -> Duration + Send + Sync + 'static,
    ) {
        write_state(&self.state)
            .latency
            .insert(path.to_string(), Arc::new(latency));
    }

    /// Makes every data request on `path` fail until cleared with `None`.
    pub fn set_failure(&self, path: &str, message: Option<&str>) {
        let mut state = write_state(&self.state);
        match message {
            Some(message) => {
                state.failures.insert(path.to_string(), message.to_string());
            }
            None => {
                state.failures.remove(path);
            }
        }
    }

    /// Slices requested for `path`, in request order.
    pub fn requests_for(&self, path: &str) -> Vec<Vec<SliceRange>> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.slice.clone())
            .collect()
    }

    /// Cancellation tokens the callers attached to their requests for `path`.
    pub fn request_tokens(&self, path: &str) -> Vec<Option<CancellationToken>> {
        lock(&self.requests)
            .iter()
            .filter(|request| request.path == path)
            .map(|request| request.cancel.clone())
            .collect()
    }

    pub fn request_count(&self, path: &str) -> usize {
        lock(&self.requests)
            .iter()
            .filter(|request| request.path == path)
            .count()
    }
}

#[async_trait]
impl ArraySource for MemoryArraySource {
    async fn get_group(&self, path: &str) -> Result<Option<GroupDescriptor>, SourceError> {
        Ok(read_state(&self.state).groups.get(normalize(path)).cloned())
    }

    async fn get_dataset(&self, path: &str) -> Result<Option<DatasetDescriptor>, SourceError> {
        Ok(read_state(&self.state)
            .datasets
            .get(path)
            .map(|entry| entry.descriptor.clone()))
    }

    async fn get_dataset_data(
        &self,
        path: &str,
        request: DataRequest,
    ) -> Result<Option<NumericArray>, SourceError> {
        let slice = request.slice.clone().unwrap_or_default();
        lock(&self.requests).push(RecordedRequest {
            path: path.to_string(),
            slice: slice.clone(),
            cancel: request.cancel.clone(),
        });

        let (entry, latency, failure) = {
            let state = read_state(&self.state);
            (
                state.datasets.get(path).cloned(),
                state.latency.get(path).map(|latency| latency(&slice)),
                state.failures.get(path).cloned(),
            )
        };

        if let Some(delay) = latency.filter(|delay| !delay.is_zero()) {
            match &request.cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SourceError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
        }

        if let Some(message) = failure {
            return Err(SourceError::Message(message));
        }

        let Some(DatasetEntry {
            descriptor,
            data: Some(data),
        }) = entry
        else {
            return Ok(None);
        };

        match request.slice {
            None => Ok(Some(data)),
            Some(slice) => slice_row_major(&descriptor, &data, &slice).map(Some),
        }
    }
}

fn slice_row_major(
    descriptor: &DatasetDescriptor,
    data: &NumericArray,
    slice: &[SliceRange],
) -> Result<NumericArray, SourceError> {
    let shape = &descriptor.shape;
    if slice.len() > shape.len() {
        return Err(SourceError::Message(format!(
            "slice of rank {} does not fit {} with shape {:?}",
            slice.len(),
            descriptor.path,
            shape
        )));
    }

    let clamp = |range: Option<&SliceRange>, extent: u64| -> (usize, usize) {
        let (lo, hi) = range.copied().unwrap_or((0, extent));
        let hi = hi.min(extent);
        (lo.min(hi) as usize, hi as usize)
    };

    match shape.len() {
        0 => Ok(data.clone()),
        1 => {
            let (lo, hi) = clamp(slice.first(), shape[0]);
            Ok(data.gather(lo..hi))
        }
        2 => {
            let columns = shape[1] as usize;
            let (row_lo, row_hi) = clamp(slice.first(), shape[0]);
            let (col_lo, col_hi) = clamp(slice.get(1), shape[1]);
            Ok(data.gather(
                (row_lo..row_hi)
                    .flat_map(move |row| (col_lo..col_hi).map(move |col| row * columns + col)),
            ))
        }
        rank => Err(SourceError::Message(format!(
            "rank {} slicing is not supported for {}",
            rank, descriptor.path
        ))),
    }
}

fn ensure_group<'a>(
    groups: &'a mut BTreeMap<String, GroupDescriptor>,
    path: &str,
) -> &'a mut GroupDescriptor {
    let path = normalize(path);
    if !groups.contains_key(path) && path != "/" {
        let (parent, name) = split_path(path);
        let parent_group = ensure_group(groups, parent);
        if !parent_group.subgroups.iter().any(|existing| existing == name) {
            parent_group.subgroups.push(name.to_string());
        }
    }
    groups
        .entry(path.to_string())
        .or_insert_with(|| GroupDescriptor {
            path: path.to_string(),
            ..GroupDescriptor::default()
        })
}

fn normalize(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() { "/" } else { trimmed }
}

fn read_state(state: &RwLock<StoreState>) -> std::sync::RwLockReadGuard<'_, StoreState> {
    state.read().unwrap_or_else(PoisonError::into_inner)
}

fn write_state(state: &RwLock<StoreState>) -> std::sync::RwLockWriteGuard<'_, StoreState> {
    state.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matrix_source() -> Arc<MemoryArraySource> {
        let source = MemoryArraySource::new();
        // 4 samples x 3 channels, value = 10 * row + col
        let values: Vec<f64> = (0..4)
            .flat_map(|row| (0..3).map(move |col| (10 * row + col) as f64))
            .collect();
        source.insert_dataset(
            "/acquisition/ts/data",
            vec![4, 3],
            NumericArray::F64(values),
            Attributes::new(),
        );
        source
    }

    #[tokio::test]
    async fn test_groups_are_created_for_parents() {
        let source = matrix_source();
        let root = source.get_group("/").await.unwrap().unwrap();
        assert_eq!(root.subgroups, vec!["acquisition".to_string()]);
        let series = source.get_group("/acquisition/ts").await.unwrap().unwrap();
        assert!(series.has_dataset("data"));
        assert!(source.get_group("/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_two_dimensional_slice_is_row_major() {
        let source = matrix_source();
        let data = source
            .get_dataset_data(
                "/acquisition/ts/data",
                DataRequest::slice(vec![(1, 3), (1, 3)]),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, NumericArray::F64(vec![11.0, 12.0, 21.0, 22.0]));
        assert_eq!(source.request_count("/acquisition/ts/data"), 1);
    }

    #[tokio::test]
    async fn test_slice_past_the_end_is_clamped() {
        let source = matrix_source();
        let data = source
            .get_dataset_data("/acquisition/ts/data", DataRequest::slice(vec![(3, 10), (0, 1)]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data, NumericArray::F64(vec![30.0]));
    }

    #[tokio::test]
    async fn test_missing_path_and_failure_are_distinct() {
        let source = matrix_source();
        let missing = source
            .get_dataset_data("/nope", DataRequest::default())
            .await
            .unwrap();
        assert!(missing.is_none());

        source.set_failure("/acquisition/ts/data", Some("connection reset"));
        let failed = source
            .get_dataset_data("/acquisition/ts/data", DataRequest::default())
            .await;
        assert!(matches!(
            failed,
            Err(SourceError::Message(message)) if message == "connection reset"
        ));
    }
}
