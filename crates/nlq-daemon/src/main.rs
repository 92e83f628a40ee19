use anyhow::Result;

use nlq_daemon::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("nlq-daemon")?;
    nlq_daemon::server::run().await
}
