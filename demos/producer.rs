mod cli;

use anyhow::Result;
use log::info;
use std::time::Instant;

#[tokio::main]
async fn main() -> Result<()> {
    omniq::setup_logger();

    let cli = cli::cli("omniq producer", "Sends numbered messages to a topic")?;
    let queue = cli::open(&cli).await?;

    let start = Instant::now();

    for i in 0..cli.count {
        queue.enqueue(format!("message #{i}")).await?;
    }

    info!(
        "Sent {} messages to {} in {:?}",
        cli.count,
        cli.topic,
        Instant::elapsed(&start)
    );

    queue.close().await?;

    Ok(())
}
