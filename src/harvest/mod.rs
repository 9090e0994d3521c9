//! Harvest module - the fetch, transform and persist cycle shared by connectors.

pub mod pipeline;

pub use pipeline::HarvestPipeline;
