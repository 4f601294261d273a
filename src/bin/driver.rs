//! Scripted multi-client driver.
//!
//! Connects one client to each replica and replays a fixed per-client
//! operation script in parallel, with a random think time between
//! operations. The scripts are deterministic so the consistency
//! guarantees can be checked against the replicas' output; GET results
//! are printed as they arrive.

use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use rand::Rng;
use tokio::task::JoinSet;
use tracing::info;

use replikv::{
    config::{Config, ConsistencyMode},
    message::Operation,
    service::DatastoreClient,
};

/// The scripts assume this cluster size.
const EXPECTED_REPLICAS: usize = 4;

const THINK_MIN_MS: u64 = 2000;
const THINK_MAX_MS: u64 = 6000;

/// How long to wait after the last request so every replica finishes
/// propagating before the driver exits.
const SETTLE: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy)]
struct Step {
    op: Operation,
    key: &'static str,
    value: &'static str,
}

const fn get(key: &'static str) -> Step {
    Step {
        op: Operation::Get,
        key,
        value: "",
    }
}

const fn put(key: &'static str, value: &'static str) -> Step {
    Step {
        op: Operation::Put,
        key,
        value,
    }
}

const fn delete(key: &'static str) -> Step {
    Step {
        op: Operation::Delete,
        key,
        value: "",
    }
}

fn sequential_simple() -> Vec<Vec<Step>> {
    vec![
        vec![put("x", "a"), get("x"), get("x")],
        vec![put("x", "b"), delete("x"), get("x")],
        vec![put("x", "c"), delete("x"), get("x")],
        vec![put("x", "d"), get("x"), get("x")],
    ]
}

fn sequential_complex() -> Vec<Vec<Step>> {
    vec![
        vec![put("x", "a"), delete("x"), get("z"), get("y")],
        vec![put("x", "b"), get("x"), put("z", "e"), get("z")],
        vec![put("z", "c"), get("z"), put("y", "d"), get("y")],
        vec![put("y", "a"), put("z", "b"), delete("y"), get("z")],
    ]
}

fn causal_simple() -> Vec<Vec<Step>> {
    vec![
        vec![put("x", "a"), put("x", "c"), get("x")],
        vec![get("x"), put("x", "b"), get("x")],
        vec![put("y", "b"), get("x"), get("x")],
        vec![put("z", "c"), get("x"), get("x")],
    ]
}

fn causal_complex() -> Vec<Vec<Step>> {
    vec![
        vec![get("x"), put("y", "b"), put("w", "a"), get("w")],
        vec![put("x", "a"), get("x"), put("w", "c"), get("w")],
        vec![get("y"), put("y", "c"), get("z"), delete("x")],
        vec![put("z", "a"), get("z"), put("w", "b"), get("w")],
    ]
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    ensure!(
        config.num_replicas == EXPECTED_REPLICAS,
        "driver scripts assume NUM_REPLICAS={EXPECTED_REPLICAS}, got {}",
        config.num_replicas
    );

    let test = config.test.clone().context("missing environment variable TEST")?;
    let scripts = match (config.consistency, test.as_str()) {
        (ConsistencyMode::Sequential, "SIMPLE") => sequential_simple(),
        (ConsistencyMode::Sequential, "COMPLEX") => sequential_complex(),
        (ConsistencyMode::Causal, "SIMPLE") => causal_simple(),
        (ConsistencyMode::Causal, "COMPLEX") => causal_complex(),
        (_, other) => bail!("TEST must be SIMPLE or COMPLEX, got {other:?}"),
    };
    info!(consistency = ?config.consistency, %test, "running driver");

    let mut clients = JoinSet::new();
    for (index, script) in scripts.into_iter().enumerate() {
        let addr = config.client_addr(index);
        clients.spawn(run_client(index, addr, script));
    }
    while let Some(joined) = clients.join_next().await {
        joined.context("client task panicked")??;
    }

    // Let the replicas finish propagating before declaring the run
    // complete; their idle timers take over from here.
    tokio::time::sleep(SETTLE).await;
    println!("all clients completed");
    Ok(())
}

async fn run_client(index: usize, addr: String, script: Vec<Step>) -> Result<()> {
    let mut client = DatastoreClient::connect(&addr)
        .await
        .with_context(|| format!("client {index} failed to connect"))?;
    println!("client {index} connected to {addr}");

    for step in script {
        think().await;
        match step.op {
            Operation::Get => {
                let value = client.get(step.key).await?;
                println!("[client {index}] GET {} -> {value}", step.key);
            }
            Operation::Put => {
                client.put(step.key, step.value).await?;
                println!("[client {index}] PUT {} = {}", step.key, step.value);
            }
            Operation::Delete => {
                client.delete(step.key).await?;
                println!("[client {index}] DELETE {}", step.key);
            }
        }
    }
    Ok(())
}

async fn think() {
    let pause = rand::thread_rng().gen_range(THINK_MIN_MS..=THINK_MAX_MS);
    tokio::time::sleep(Duration::from_millis(pause)).await;
}
