//! Remote access side of the engine: array sources, fetch-once caches,
//! timestamp resolvers and the chunked dataset client.

pub mod cache;
pub mod chunking;
pub mod error;
pub mod memory;
pub mod registry;
pub mod source;
pub mod timestamps;

pub use cache::{BoundedCache, FetchCache};
pub use chunking::{Chunk, ChunkingOptions, ConcatenatedChunk, DatasetChunkingClient};
pub use error::{SeriesError, SeriesResult, SourceError};
pub use memory::MemoryArraySource;
pub use registry::{SeriesHandle, SeriesId, SeriesRegistry};
pub use source::{ArraySource, DataRequest};
pub use timestamps::{
    IrregularTimestampResolver, RegularTimestampResolver, TimestampBlockCache, TimestampResolver,
};

pub use tokio_util::sync::CancellationToken;
