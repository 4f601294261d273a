//! Replica assembly: wires the store, the ordering engine, the peer
//! link layer, and the client service, then runs until shutdown.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{info, warn};

use crate::config::{Config, ConsistencyMode};
use crate::engine::{CausalEngine, Engine, SequentialEngine};
use crate::link::PeerLink;
use crate::service;
use crate::store::KvStore;

/// One started replica, listeners bound but not yet serving. Splitting
/// construction from [`Replica::run`] lets callers learn the bound
/// addresses (and the tests reach the engine) before traffic starts.
pub struct Replica {
    index: usize,
    config: Config,
    engine: Arc<Engine>,
    store: Arc<KvStore>,
    peer_listener: TcpListener,
    client_listener: TcpListener,
    fatal_rx: mpsc::UnboundedReceiver<anyhow::Error>,
}

impl Replica {
    pub async fn start(config: Config, index: usize) -> Result<Self> {
        ensure!(
            index < config.num_replicas,
            "replica index {index} out of range for {} replicas",
            config.num_replicas
        );

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        let store = Arc::new(KvStore::new());
        let peers: Vec<String> = (0..config.num_replicas)
            .filter(|&peer| peer != index)
            .map(|peer| config.peer_addr(peer))
            .collect();
        let link = PeerLink::new(peers, config.delay_ms, fatal_tx);

        let engine = Arc::new(match config.consistency {
            ConsistencyMode::Sequential => Engine::Sequential(SequentialEngine::new(
                index,
                config.num_replicas,
                store.clone(),
                link,
            )),
            ConsistencyMode::Causal => Engine::Causal(CausalEngine::new(
                index,
                config.num_replicas,
                store.clone(),
                link,
            )),
        });

        let peer_addr = config.peer_addr(index);
        let peer_listener = TcpListener::bind(&peer_addr)
            .await
            .with_context(|| format!("failed to bind peer listener on {peer_addr}"))?;
        let client_addr = config.client_addr(index);
        let client_listener = TcpListener::bind(&client_addr)
            .await
            .with_context(|| format!("failed to bind client listener on {client_addr}"))?;

        info!(replica = index, %peer_addr, %client_addr, "replica listening");

        Ok(Self {
            index,
            config,
            engine,
            store,
            peer_listener,
            client_listener,
            fatal_rx,
        })
    }

    pub fn engine(&self) -> Arc<Engine> {
        self.engine.clone()
    }

    pub fn store(&self) -> Arc<KvStore> {
        self.store.clone()
    }

    pub fn client_addr(&self) -> String {
        self.config.client_addr(self.index)
    }

    /// Serves peers and clients until the idle timer fires, then
    /// returns the final store contents. Inbound peer-link activity
    /// resets the timer; a fatal transport error ends the run early.
    pub async fn run(self) -> Result<BTreeMap<String, String>> {
        let Replica {
            index,
            config,
            engine,
            store,
            peer_listener,
            client_listener,
            mut fatal_rx,
        } = self;

        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();

        let peer_engine = engine.clone();
        let peer_task = tokio::spawn(async move {
            loop {
                match peer_listener.accept().await {
                    Ok((stream, _)) => {
                        let _ = activity_tx.send(());
                        let engine = peer_engine.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_peer_connection(stream, engine).await {
                                warn!(error = %format!("{err:#}"), "peer connection failed");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept peer connection"),
                }
            }
        });

        let client_engine = engine.clone();
        let client_task = tokio::spawn(async move {
            loop {
                match client_listener.accept().await {
                    Ok((stream, peer)) => {
                        let engine = client_engine.clone();
                        tokio::spawn(async move {
                            if let Err(err) = service::serve_client(stream, engine).await {
                                warn!(%peer, error = %format!("{err:#}"), "client connection closed with error");
                            }
                        });
                    }
                    Err(err) => warn!(error = %err, "failed to accept client connection"),
                }
            }
        });

        let idle = sleep(config.timeout);
        tokio::pin!(idle);
        let outcome = loop {
            tokio::select! {
                () = &mut idle => {
                    info!(replica = index, "idle timeout reached, shutting down");
                    break Ok(store.dump());
                }
                Some(err) = fatal_rx.recv() => {
                    break Err(err);
                }
                Some(()) = activity_rx.recv() => {
                    idle.as_mut().reset(Instant::now() + config.timeout);
                }
            }
        };

        peer_task.abort();
        client_task.abort();
        outcome
    }
}

/// Reads the single frame a peer connection carries and hands it to
/// the engine. Malformed frames are logged and dropped; they never
/// take the replica down.
async fn handle_peer_connection(stream: TcpStream, engine: Arc<Engine>) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let bytes = reader
        .read_line(&mut line)
        .await
        .context("failed to read peer frame")?;
    if bytes == 0 {
        return Ok(());
    }
    let payload = line.trim_end_matches(['\r', '\n']);
    if payload.is_empty() {
        return Ok(());
    }
    engine.handle_incoming(payload)
}
