#[tokio::main]
async fn main() -> eyre::Result<()> {
    sluice::run().start().await
}
