//! Veridex compliance orchestration core.
//!
//! The crate hosts the five cooperating subsystems of the platform plus the
//! shared infrastructure they lean on:
//!
//! - [`router`] - policy-driven routing of validation requests to rule packs
//!   with confidence-gated fallback between static, hybrid and agentic modes.
//! - [`workflow`] - workflow execution with a human-in-the-loop approval gate
//!   for legal/financial work.
//! - [`ledger`] - append-only, tenant-partitioned, hash-chained audit log.
//! - [`rag`] - hierarchical knowledge base with cascading context-boosted
//!   retrieval and a semantic query cache.
//! - [`ocr`] - confidence-tiered text extraction with caching and a human
//!   review queue.
//!
//! Shared infrastructure: [`canonical`] (canonical JSON, hashing, HMAC),
//! [`redaction`] (PII scrubbing), [`http`] (downstream client with retries
//! and trace headers), [`registry`] (rule pack registrations), [`errors`],
//! [`config`], and the [`server`] HTTP surface consumed by the gateway
//! binary.

pub mod canonical;
pub mod config;
pub mod errors;
pub mod http;
pub mod ledger;
pub mod ocr;
pub mod rag;
pub mod redaction;
pub mod registry;
pub mod router;
pub mod rulepack;
pub mod server;
pub mod workflow;

pub use errors::{ServiceError, ServiceResult};
