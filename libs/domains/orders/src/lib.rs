//! Orders Domain
//!
//! Declarations shared by the orders sender and receiver: the `ORDERS`
//! work-queue stream, the `consume_created` durable consumer, the message
//! format and the receiver's processor.
//!
//! # Usage
//!
//! ```rust,ignore
//! use domain_orders::{consume_created, orders_stream, ORDERS_STREAM};
//! use work_queue::{ensure_consumer, ensure_stream};
//!
//! ensure_stream(&admin, &orders_stream(3)).await?;
//! ensure_consumer(&admin, ORDERS_STREAM, &consume_created()).await?;
//! ```

pub mod message;
pub mod processor;
pub mod streams;

pub use message::{created_payload, created_payloads, parse_created_payload};
pub use processor::OrderCreatedProcessor;
pub use streams::{
    consume_created, orders_stream, CONSUME_CREATED, ORDERS_CREATED, ORDERS_STREAM,
    ORDERS_SUBJECTS,
};
