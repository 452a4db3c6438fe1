pub mod face;
pub mod job;
pub mod video;
