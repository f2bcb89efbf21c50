use anyhow::{anyhow, Result};
use clap::{value_parser, Arg, ArgMatches, Command};
use omniq::memory::MemoryBroker;
use omniq::{config, Config, Queue};
use std::sync::Arc;

pub(crate) struct CliConfig {
    pub(crate) backend: String,
    pub(crate) config: Config,
    pub(crate) topic: String,
    pub(crate) group: String,
    pub(crate) count: u32,
}

pub(crate) fn cli(name: &'static str, about: &'static str) -> Result<CliConfig> {
    let matches = Command::new(name)
        .about(about)
        .arg(
            Arg::new("backend")
                .short('b')
                .long("backend")
                .value_parser(["memory", "nats"])
                .default_value("nats")
                .help("Broker backend"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Path to the config file"),
        )
        .arg(Arg::new("topic").short('t').long("topic").default_value("omniq-demo"))
        .arg(Arg::new("group").short('g').long("group").default_value("demo"))
        .arg(
            Arg::new("count")
                .short('n')
                .long("count")
                .value_parser(value_parser!(u32))
                .default_value("10")
                .help("Number of messages to send"),
        )
        .get_matches();

    from_matches(&matches)
}

fn from_matches(matches: &ArgMatches) -> Result<CliConfig> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => config::parse_config(path)?,
        None => Config::builder().brokers(["nats://127.0.0.1:4222"]).build(),
    };

    let arg = |name: &str| -> Result<String> {
        matches
            .get_one::<String>(name)
            .cloned()
            .ok_or_else(|| anyhow!("Missing argument {name}"))
    };

    Ok(CliConfig {
        backend: arg("backend")?,
        config,
        topic: arg("topic")?,
        group: arg("group")?,
        count: matches.get_one::<u32>("count").copied().unwrap_or(10),
    })
}

/// Opens the queue on the chosen backend. The memory broker lives as long as the process.
pub(crate) async fn open(cli: &CliConfig) -> Result<Queue> {
    match cli.backend.as_str() {
        "memory" => {
            let broker = MemoryBroker::start(&cli.config);
            let conn = broker.connect(&cli.config).await?;

            Queue::open(Arc::new(conn), &cli.topic, &cli.config).await
        }
        _ => {
            let conn = omniq_nats::connect(&cli.config).await?;

            Queue::open(Arc::new(conn), &cli.topic, &cli.config).await
        }
    }
}
