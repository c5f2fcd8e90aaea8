use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use env_logger::Env;

use quicmesh::config::MeshConfig;
use quicmesh::{MeshOptions, QuicMesh};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path of the JSON config file.
    /// example: --config /etc/quicmesh/node.json
    #[arg(short, long, default_value = "quicmesh.json")]
    config: PathBuf,
    /// Do not dial the configured peers.
    #[arg(long)]
    disable_client: bool,
    /// Do not accept inbound sessions.
    #[arg(long)]
    disable_server: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let Args {
        config,
        disable_client,
        disable_server,
    } = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mesh_config = MeshConfig::load(&config)
        .with_context(|| format!("loading {}", config.display()))?;
    let options = MeshOptions::default()
        .set_disable_client(disable_client)
        .set_disable_server(disable_server);
    let mesh = QuicMesh::new(mesh_config)?.set_options(options);

    let (tx, mut quit) = tokio::sync::mpsc::channel::<()>(1);
    ctrlc2::set_async_handler(async move {
        _ = tx.send(()).await;
    })
    .await;

    mesh.start().await.context("starting mesh")?;
    tokio::select! {
        _ = quit.recv() => log::info!("interrupted, stopping"),
        _ = mesh.wait() => log::warn!("mesh shut down on its own"),
    }
    mesh.stop().await;
    Ok(())
}
