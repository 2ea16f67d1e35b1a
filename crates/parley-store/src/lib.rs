// ABOUTME: Persistence layer for parley: week-partitioned JSONL logs as the source of truth.
// ABOUTME: Provides the SQLite index, rebuild from logs, file-placement healing, and the StorageEngine facade.

pub mod config;
pub mod engine;
pub mod error;
pub mod healing;
pub mod index;
pub mod jsonl;
pub mod paths;
pub mod rebuild;
pub mod rows;
pub mod schema;
pub mod search;

pub use config::{ConfigError, StoreConfig};
pub use engine::{EngineError, EngineStats, EngineStatus, InitReport, StorageEngine};
pub use error::StoreError;
pub use healing::{HealingService, HealingStats};
pub use index::{IndexError, RelationalIndex};
pub use jsonl::{AppendLog, LogError};
pub use paths::{Area, PathResolver};
pub use rebuild::{RebuildService, RebuildStats};
pub use search::{InMemorySearch, TextSearch};
