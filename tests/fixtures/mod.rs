//! Test fixtures

pub mod two_node;

pub use two_node::{Carrier, TwoNodeFixture};
