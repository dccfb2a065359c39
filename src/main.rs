#[tokio::main]
async fn main() -> anyhow::Result<()> {
    agentwatch::run().await
}
