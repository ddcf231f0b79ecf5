//! Orders receiver - Entry Point
//!
//! Drains created orders from the ORDERS stream until shut down.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    orders_jsm_recv::run().await
}
