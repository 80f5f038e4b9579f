pub mod config;
pub mod error;
pub mod events;
pub mod nodes;
pub mod receipts;
pub mod request;
pub mod variants;

pub use error::{Flux2Error, Result};
