//! Comms pipeline: an event-driven decision pipeline for inbound customer
//! communications.
//!
//! Messages enter through [`ingest`], travel over the in-process topic bus
//! in [`events`], and are handled by four independent engines: grouping,
//! classification, spam scoring and auto-response.

pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod grouping;
pub mod ingest;
pub mod llm;
pub mod models;
pub mod responder;
pub mod spam;
pub mod store;
