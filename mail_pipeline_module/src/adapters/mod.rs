//! Provider payload adapters. Each one turns a provider-specific webhook body
//! into an [`InboundEmail`](crate::record::InboundEmail).

pub mod postmark;

pub use postmark::{PostmarkAdapterError, PostmarkInbound};
