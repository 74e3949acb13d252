//! Expert Dispatch — knowledge-augmented multi-expert question routing.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod experts;
pub mod knowledge;
pub mod llm;
pub mod metrics;
