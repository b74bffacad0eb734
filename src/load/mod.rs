pub mod harness;
pub mod stats;
