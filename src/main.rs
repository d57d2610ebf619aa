#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ips_analyzer_lib::run().await
}
