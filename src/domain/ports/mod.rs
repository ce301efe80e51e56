//! Domain ports (interfaces) for the arbiter runtime.

pub mod llm;
pub mod persistor;
pub mod storage;
pub mod tool;

pub use llm::{
    LlmAdapter, Planner, PlannerContext, PlanningTechnique, ProviderInfo, ResolvedArgs, ToolSpec,
};
pub use persistor::{AppendOptions, Persistor};
pub use storage::{BaseStorage, StorageItemMetadata, StorageStats, StoredItem};
pub use tool::ToolAdapter;
