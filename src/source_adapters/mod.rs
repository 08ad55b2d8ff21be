//! Source adapters (spec §4.3): one module per ingest pathway, each
//! normalizing its upstream's wire format into [`crate::state::NormalizedState`]
//! before handing off to the durable queue.

pub mod feeder;
pub mod global_public;
pub mod normalize;
pub mod regional_commercial;
