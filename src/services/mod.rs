pub mod detector;
pub mod media;
pub mod pipeline;
pub mod queue;
pub mod redaction;
pub mod storage;
pub mod videos;
pub mod webhook;
pub mod worker;
