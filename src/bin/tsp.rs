//! Euclidean TSP demo: run a space, a compute node, or a whole cluster in one
//! process.
//!
//! ```text
//! tsp space [port]             serve a coordinator
//! tsp node [host] [workers]    attach a compute node to a running space
//! tsp submit [host]            submit the built-in instance to a running space
//! tsp run [nodes] [cities]     space + nodes in-process; random instance if
//!                              a city count is given, the built-in one if not
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use taskspace::apps::euclidean_tsp::{MinCost, Tour, TspTask};
use taskspace::wire::{read_frame, write_frame, Frame};
use taskspace::{ComputeNode, NodeConfig, Space, SpaceConfig};

lazy_static! {
    /// Three nested squares: small enough to finish quickly, big enough for
    /// the root to decompose.
    static ref CITIES: Vec<(f64, f64)> = vec![
        (1.0, 1.0),
        (8.0, 1.0),
        (8.0, 8.0),
        (1.0, 8.0),
        (2.0, 2.0),
        (7.0, 2.0),
        (7.0, 7.0),
        (2.0, 7.0),
        (3.0, 3.0),
        (6.0, 3.0),
        (6.0, 6.0),
        (3.0, 6.0),
    ];
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("space") => space_mode(args.get(1)).await,
        Some("node") => node_mode(args.get(1), args.get(2)).await,
        Some("submit") => submit_mode(args.get(1)).await,
        Some("run") | None => run_mode(args.get(1), args.get(2)).await,
        Some(other) => bail!("unknown mode `{other}`; expected space|node|submit|run"),
    }
}

async fn space_mode(port: Option<&String>) -> Result<()> {
    let mut config = SpaceConfig::default();
    if let Some(port) = port {
        config.port = port.parse().context("port must be a number")?;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let space = Space::<TspTask>::new();
    space.serve(listener).await?;
    Ok(())
}

async fn node_mode(host: Option<&String>, workers: Option<&String>) -> Result<()> {
    let mut config = NodeConfig::default();
    if let Some(host) = host {
        config.space_host = host.clone();
    }
    if let Some(workers) = workers {
        config.workers = workers.parse().context("worker count must be a number")?;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    Arc::new(ComputeNode::<TspTask>::new()).run(&config).await?;
    Ok(())
}

async fn submit_mode(host: Option<&String>) -> Result<()> {
    let host = host.map(String::as_str).unwrap_or("localhost");
    let stream = TcpStream::connect((host, taskspace::DEFAULT_PORT)).await?;
    let (mut reader, mut writer) = stream.into_split();

    write_frame(
        &mut writer,
        &Frame::Submit {
            task: TspTask::root(CITIES.clone()),
            shared: Some(MinCost::unbounded()),
        },
    )
    .await?;

    match read_frame::<TspTask, _>(&mut reader).await? {
        Frame::Final { value } => report(value),
        _ => bail!("space answered with something other than a final value"),
    }
    Ok(())
}

async fn run_mode(nodes: Option<&String>, cities: Option<&String>) -> Result<()> {
    let node_count: usize = match nodes {
        Some(raw) => raw.parse().context("node count must be a number")?,
        None => 2,
    };
    let cities = match cities {
        Some(raw) => random_instance(raw.parse().context("city count must be a number")?),
        None => CITIES.clone(),
    };

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let space = Space::<TspTask>::new();
    {
        let space = Arc::clone(&space);
        tokio::spawn(async move { space.serve(listener).await });
    }
    for _ in 0..node_count {
        let config = NodeConfig {
            space_host: "127.0.0.1".to_string(),
            space_port: port,
            ..NodeConfig::default()
        };
        tokio::spawn(async move { Arc::new(ComputeNode::<TspTask>::new()).run(&config).await });
    }

    let best = space
        .submit_with_shared(TspTask::root(cities), MinCost::unbounded())
        .await?;
    report(best);
    space.shutdown();
    Ok(())
}

fn random_instance(city_count: usize) -> Vec<(f64, f64)> {
    (0..city_count)
        .map(|_| (fastrand::f64() * 100.0, fastrand::f64() * 100.0))
        .collect()
}

fn report(best: Option<Tour>) {
    match best {
        Some(tour) => println!(
            "{}",
            serde_json::json!({ "cost": tour.cost, "tour": tour.cities })
        ),
        None => println!("{}", serde_json::json!({ "tour": null })),
    }
}
