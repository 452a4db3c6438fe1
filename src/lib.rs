//! Video face redaction pipeline
//!
//! This library provides the core of the face-redact-pipeline system: a
//! durable job queue, the processing pipeline that detects and redacts faces
//! in a representative video frame, the persisted video status state machine
//! and signed webhook delivery with its own retry policy.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
