//! Linework engine: concurrent line processing with ordered or retrying
//! worker pools and segmented output.
mod config;
mod decode;
mod extract;
mod group;
mod page;
mod persist;
mod pipeline;
mod pool;
mod queue;
mod reorder;
mod retry;
mod segment;
mod sink;
mod source;
mod transform;
mod types;

pub use config::{PipelineConfig, RetryPoolConfig};
pub use decode::{decode_body, DecodeError, DecodedBody};
pub use extract::{PageSummary, PageSummaryTransform};
pub use group::{CompletionGroup, Ticket};
pub use page::{FetchSettings, HttpSession, PageFetchOperation, PageRecord};
pub use persist::{ensure_output_dir, PersistError, SegmentFile};
pub use pipeline::OrderedPipeline;
pub use reorder::{ReorderBuffer, Ready};
pub use retry::{ExternalOperation, RetryPool};
pub use segment::{SegmentStats, SegmentWriter};
pub use sink::{SegmentFileOptions, SegmentFileSink, Sink};
pub use source::{enumerate_sources, LineReader};
pub use tokio_util::sync::CancellationToken;
pub use transform::{IdentityTransform, JsonFieldTransform, Transform};
pub use types::{
    EngineError, FailureKind, OperationError, Record, RunReport, SinkError, SourceId,
    SourceReport, TransformError, STREAM_MARKER,
};
