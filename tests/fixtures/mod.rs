//! Reusable test fixtures.

mod relay;

pub use relay::RelayFixture;
