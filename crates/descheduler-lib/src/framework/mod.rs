//! Plugin framework
//!
//! A profile is turned into a [`ProfileExecutor`] by instantiating its
//! plugins through the [`Registry`] and checking every stage assignment
//! against the capabilities the plugin implements. Running the executor
//! drives the six extension points:
//!
//! - PreSort and Sort order the nodes once per cycle
//! - Deschedule and Balance nominate pods node by node
//! - Filter admits nominated pods
//! - PreEvictionFilter runs inside the eviction budget right before removal

mod cancel;
mod filter;
mod handle;
mod pipeline;
mod profile;
mod registry;
mod types;

#[cfg(test)]
mod tests;

pub use cancel::Cancellation;
pub use filter::FilterChain;
pub use handle::Handle;
pub use pipeline::{EvictionStage, NodeBatch, Nominated, NominationStage, OrderingStage};
pub use profile::{ExecutionOptions, ProfileExecutor, ProfileReport};
pub use registry::{decode_args, PluginFactory, Registry, RegistryEntry};
pub use types::{
    BalancePlugin, BalanceRound, Candidate, CandidateResult, CycleContext, DeschedulePlugin,
    FilterPlugin, Nomination, Nominations, Plugin, PluginInstance, PreEvictionFilterPlugin,
    PreSortPlugin, SortKeys, SortPlugin, Verdict,
};
