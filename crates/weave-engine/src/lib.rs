pub mod accumulate;
pub mod compress;
pub mod error;
pub mod filter;
pub mod orchestrate;
pub mod pack;
pub mod registry;
pub mod schedule;

pub use accumulate::{Completion, ToolCallAccumulator};
pub use compress::{CompressorConfig, ContextCompressor};
pub use error::EngineError;
pub use filter::{CompatibilityFilter, DropReason, FilterReport};
pub use orchestrate::{OrchestratorConfig, RunState, RunSummary, StreamOrchestrator};
pub use pack::{CacheBlockPacker, PackerConfig};
pub use registry::ToolRegistry;
pub use schedule::ToolScheduler;
