// Core types and functionality for the tcgflow workflow runner

pub mod types;
pub mod storage;
pub mod events;
pub mod workflow;
pub mod scheduler;
pub mod pipelines;

pub use types::*;
