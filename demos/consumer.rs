mod cli;

use anyhow::Result;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    omniq::setup_logger();

    let cli = cli::cli("omniq consumer", "Prints the messages of a topic until Ctrl-C")?;
    let queue = cli::open(&cli).await?;

    queue
        .dequeue(&cli.group, |message| {
            println!(
                "{} {:?} {}",
                message.topic(),
                message.metadata(),
                String::from_utf8_lossy(message.value())
            );

            true
        })
        .await?;

    info!("Consuming {} as {}, press Ctrl-C to stop", cli.topic, cli.group);

    tokio::signal::ctrl_c().await?;

    queue.close().await?;

    Ok(())
}
