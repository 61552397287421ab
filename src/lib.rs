pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod driver;
pub mod error;
pub mod git;
pub mod hosts;
pub mod isolation;
pub mod log;
pub mod orchestration;
pub mod report;
pub mod util;
pub mod workflow;

pub use error::{Error, ErrorKind, Result};
