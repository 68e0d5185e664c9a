mod adapter;
mod error;

pub mod checkpoint;
pub mod config;
pub mod params;
pub mod placement;
pub mod request;
pub mod runtime;

pub use adapter::*;
pub use error::*;
