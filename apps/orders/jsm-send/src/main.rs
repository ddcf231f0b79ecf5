//! Orders sender - Entry Point
//!
//! Provisions the ORDERS stream and publishes a batch of created orders.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    orders_jsm_send::run().await
}
