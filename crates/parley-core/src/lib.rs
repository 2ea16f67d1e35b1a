// ABOUTME: Core library for parley, containing the exchange data model and ingest-time analysis.
// ABOUTME: Shared by the storage engine, the rebuild path, and any caller producing exchanges.

pub mod analysis;
pub mod exchange;
pub mod metadata;
pub mod project;
pub mod record;
pub mod response;

pub use analysis::analyze;
pub use exchange::{Exchange, ExchangeRequest, Purpose, RawResponse, TokenUsage};
pub use metadata::{DerivedMetadata, ExchangeMetadata, IdeContext, MetadataFilter};
pub use project::Project;
pub use record::{LineOrigin, LogRecord, RecordError, RecordRef};
pub use response::{extract_response_text, extract_token_usage};
