pub mod adapters;
pub mod attachments;
pub mod blob_store;
pub mod cache;
pub mod config;
pub mod dual_store;
pub mod embedding_index;
pub mod ingestor;
pub mod normalize;
pub mod notify;
pub mod pipeline;
pub mod record;
pub mod reply;
pub mod retrieval;
pub mod warehouse;

#[cfg(test)]
mod test_support;

pub use config::{ConfigError, PipelineConfig};
pub use ingestor::{IngestError, IngestReport, IngestStage};
pub use pipeline::{EmailPipeline, PipelineDeps, ReplyContext};
pub use record::{EmailRecord, InboundAttachment, InboundEmail, ReplyRecord};
pub use reply::{GeneratedReply, KnowledgeSnippet};
pub use retrieval::RetrievedEmail;
