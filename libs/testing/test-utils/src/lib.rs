//! Shared test utilities for work queue testing
//!
//! - `TestNats`: NATS container with JetStream and automatic cleanup (feature: "nats")
//! - `TestDataBuilder`: Deterministic, per-test resource names (always available)
//!
//! # Usage
//!
//! ```rust,ignore
//! use test_utils::{TestDataBuilder, TestNats};
//!
//! #[tokio::test]
//! #[ignore = "requires Docker"]
//! async fn my_nats_test() {
//!     let nats = TestNats::new().await;
//!     let names = TestDataBuilder::from_test_name("my_nats_test");
//!
//!     let stream = names.stream("ORDERS");
//!     let subjects = names.subject("ORDERS", "*");
//! }
//! ```

#[cfg(feature = "nats")]
mod nats;

#[cfg(feature = "nats")]
pub use nats::TestNats;

/// Builder for per-test broker resource names.
///
/// Tests sharing one broker must not collide on stream or consumer names, so
/// every name carries a suffix derived from the test name.
pub struct TestDataBuilder {
    seed: u64,
}

impl TestDataBuilder {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Create from test name (seed is the hash of the name).
    ///
    /// ```
    /// use test_utils::TestDataBuilder;
    ///
    /// let names = TestDataBuilder::from_test_name("test_round_trip");
    /// assert!(names.stream("ORDERS").starts_with("ORDERS_"));
    /// ```
    pub fn from_test_name(name: &str) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let mut hasher = DefaultHasher::new();
        name.hash(&mut hasher);
        Self::new(hasher.finish())
    }

    fn suffix(&self) -> String {
        format!("{:08x}", self.seed as u32)
    }

    /// Stream name, e.g. `ORDERS_1a2b3c4d`.
    pub fn stream(&self, base: &str) -> String {
        format!("{}_{}", base, self.suffix())
    }

    /// Durable consumer name, e.g. `consume_created_1a2b3c4d`.
    pub fn consumer(&self, base: &str) -> String {
        format!("{}_{}", base, self.suffix())
    }

    /// Subject under the per-test stream prefix, e.g. `ORDERS_1a2b3c4d.created`.
    pub fn subject(&self, base: &str, token: &str) -> String {
        format!("{}.{}", self.stream(base), token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_deterministic() {
        let a = TestDataBuilder::from_test_name("my_test");
        let b = TestDataBuilder::from_test_name("my_test");

        assert_eq!(a.stream("ORDERS"), b.stream("ORDERS"));
        assert_eq!(a.consumer("consume_created"), b.consumer("consume_created"));
    }

    #[test]
    fn test_names_differ_between_tests() {
        let a = TestDataBuilder::from_test_name("test1");
        let b = TestDataBuilder::from_test_name("test2");

        assert_ne!(a.stream("ORDERS"), b.stream("ORDERS"));
    }

    #[test]
    fn test_subject_shares_stream_prefix() {
        let names = TestDataBuilder::new(0xdead_beef);
        assert_eq!(names.stream("ORDERS"), "ORDERS_deadbeef");
        assert_eq!(names.subject("ORDERS", "created"), "ORDERS_deadbeef.created");
        assert_eq!(names.subject("ORDERS", "*"), "ORDERS_deadbeef.*");
    }
}
