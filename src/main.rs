//! MRO ledger HTTP server

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    mro_ledger::server::run().await
}
