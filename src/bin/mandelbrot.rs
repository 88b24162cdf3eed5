//! Mandelbrot demo: render escape counts for the classic seahorse-valley
//! region across a cluster.
//!
//! ```text
//! mandelbrot space [port]             serve a coordinator
//! mandelbrot node [host] [workers]    attach a compute node
//! mandelbrot run [nodes] [pixels]     space + nodes in-process
//! ```

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use taskspace::apps::mandelbrot::MandelbrotTask;
use taskspace::{ComputeNode, NodeConfig, Space, SpaceConfig};

const LOWER_LEFT_X: f64 = -0.7510975859375;
const LOWER_LEFT_Y: f64 = 0.1315680625;
const EDGE_LENGTH: f64 = 0.01611;
const N_PIXELS: usize = 1024;
const ITERATION_LIMIT: u32 = 512;

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
        Some("run") | None => run_mode(args.get(1), args.get(2)).await,
        Some(other) => bail!("unknown mode `{other}`; expected space|node|run"),
    }
}

async fn space_mode(port: Option<&String>) -> Result<()> {
    let mut config = SpaceConfig::default();
    if let Some(port) = port {
        config.port = port.parse().context("port must be a number")?;
    }
    config.validate().map_err(anyhow::Error::msg)?;

    let listener = TcpListener::bind(config.listen_addr()).await?;
    let space = Space::<MandelbrotTask>::new();
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

    Arc::new(ComputeNode::<MandelbrotTask>::new())
        .run(&config)
        .await?;
    Ok(())
}

async fn run_mode(nodes: Option<&String>, pixels: Option<&String>) -> Result<()> {
    let node_count: usize = match nodes {
        Some(raw) => raw.parse().context("node count must be a number")?,
        None => 2,
    };
    let pixels: usize = match pixels {
        Some(raw) => raw.parse().context("pixel count must be a number")?,
        None => N_PIXELS,
    };
    if !pixels.is_power_of_two() {
        bail!("pixel count must be a power of two");
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let space = Space::<MandelbrotTask>::new();
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
        tokio::spawn(async move {
            Arc::new(ComputeNode::<MandelbrotTask>::new())
                .run(&config)
                .await
        });
    }

    let counts = space
        .submit(MandelbrotTask::root(
            LOWER_LEFT_X,
            LOWER_LEFT_Y,
            EDGE_LENGTH,
            pixels,
            ITERATION_LIMIT,
        ))
        .await?;

    let in_set = counts
        .counts
        .iter()
        .filter(|&&count| count == ITERATION_LIMIT)
        .count();
    println!(
        "{}",
        serde_json::json!({
            "pixels": counts.pixels,
            "in_set": in_set,
            "escaped": counts.counts.len() - in_set,
        })
    );
    space.shutdown();
    Ok(())
}
