//! Job client, image codec and node execution for the FLUX.2 plugin.

pub mod client;
pub mod codec;
pub mod nodes;

#[cfg(test)]
mod testing;

pub use client::{HttpTransport, JobClient, JobTransport, PollSettings, RunResult};
pub use nodes::{Flux2Node, NodeContext, NodeInputs, NodeOutput};
