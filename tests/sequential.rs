//! Integration tests for sequential consistency: four real replicas on
//! localhost ports with shortened simulated delays, driven through the
//! client RPC surface.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, sleep};

use replikv::config::{Config, ConsistencyMode};
use replikv::engine::{Engine, JournalEntry};
use replikv::message::Operation;
use replikv::replica::Replica;
use replikv::service::{DatastoreClient, NOT_FOUND};
use replikv::store::KvStore;

const IDLE_TIMEOUT: Duration = Duration::from_secs(2);
const QUIESCENCE_DEADLINE: Duration = Duration::from_secs(15);

/// Harness managing a cluster of in-process replicas with real TCP
/// networking between them.
struct TestCluster {
    replicas: Vec<ClusterReplica>,
}

struct ClusterReplica {
    client_addr: String,
    engine: Arc<Engine>,
    store: Arc<KvStore>,
    run: JoinHandle<Result<BTreeMap<String, String>>>,
}

impl TestCluster {
    /// Spawns `n` replicas with peer ports starting at `base_port` and
    /// client ports offset by 50.
    async fn spawn(n: usize, base_port: u16) -> Result<Self> {
        let config = Config {
            num_replicas: n,
            base_port,
            base_port_to_client: base_port + 50,
            base_name: String::new(),
            container: false,
            consistency: ConsistencyMode::Sequential,
            timeout: IDLE_TIMEOUT,
            delay_ms: (20, 80),
            test: None,
        };

        let mut replicas = Vec::new();
        for index in 0..n {
            let replica = Replica::start(config.clone(), index).await?;
            replicas.push(ClusterReplica {
                client_addr: replica.client_addr(),
                engine: replica.engine(),
                store: replica.store(),
                run: tokio::spawn(replica.run()),
            });
        }
        Ok(Self { replicas })
    }

    async fn client(&self, index: usize) -> Result<DatastoreClient> {
        DatastoreClient::connect(&self.replicas[index].client_addr).await
    }

    fn journals(&self) -> Vec<Vec<JournalEntry>> {
        self.replicas
            .iter()
            .map(|replica| replica.engine.journal())
            .collect()
    }

    fn dumps(&self) -> Vec<BTreeMap<String, String>> {
        self.replicas
            .iter()
            .map(|replica| replica.store.dump())
            .collect()
    }

    /// Waits until every replica has applied `writes` write operations
    /// and every hold-back queue has drained.
    async fn await_quiescence(&self, writes: usize) -> Result<()> {
        let start = Instant::now();
        loop {
            let applied: Vec<usize> = self
                .replicas
                .iter()
                .map(|replica| replica.engine.journal().len())
                .collect();
            let pending: Vec<usize> = self
                .replicas
                .iter()
                .map(|replica| replica.engine.holdback_len())
                .collect();
            if applied.iter().all(|&count| count == writes)
                && pending.iter().all(|&count| count == 0)
            {
                return Ok(());
            }
            if start.elapsed() > QUIESCENCE_DEADLINE {
                bail!("cluster failed to quiesce: applied {applied:?}, pending {pending:?}");
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Awaits every replica's idle shutdown and returns the dumps they
    /// produced on the way out.
    async fn shutdown(self) -> Result<Vec<BTreeMap<String, String>>> {
        let mut dumps = Vec::new();
        for replica in self.replicas {
            dumps.push(replica.run.await??);
        }
        Ok(dumps)
    }
}

/// Applies a journal to an empty map, yielding the store it produces.
fn replay(journal: &[JournalEntry]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for entry in journal {
        match entry.op {
            Operation::Put => {
                map.insert(entry.key.clone(), entry.value.clone());
            }
            Operation::Delete => {
                map.remove(&entry.key);
            }
            Operation::Get => {}
        }
    }
    map
}

fn assert_all_equal<T: PartialEq + std::fmt::Debug>(items: &[T], what: &str) {
    for pair in items.windows(2) {
        assert_eq!(pair[0], pair[1], "{what} diverged between replicas");
    }
}

#[tokio::test]
async fn contended_single_key_writes_agree_on_one_total_order() -> Result<()> {
    let cluster = TestCluster::spawn(4, 21100).await?;

    let mut c0 = cluster.client(0).await?;
    let mut c1 = cluster.client(1).await?;
    let mut c2 = cluster.client(2).await?;
    let mut c3 = cluster.client(3).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        c0.put("x", "a").await?;
        Ok::<_, anyhow::Error>(vec![c0.get("x").await?, c0.get("x").await?])
    });
    tasks.spawn(async move {
        c1.put("x", "b").await?;
        c1.delete("x").await?;
        Ok(vec![c1.get("x").await?])
    });
    tasks.spawn(async move {
        c2.put("x", "c").await?;
        c2.delete("x").await?;
        Ok(vec![c2.get("x").await?])
    });
    tasks.spawn(async move {
        c3.put("x", "d").await?;
        Ok(vec![c3.get("x").await?, c3.get("x").await?])
    });

    let mut reads = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        reads.extend(joined??);
    }

    // 6 writes across the cluster: 4 puts and 2 deletes.
    cluster.await_quiescence(6).await?;

    // Every read observed a value some prefix of the total order
    // produces.
    for read in &reads {
        assert!(
            ["a", "b", "c", "d", NOT_FOUND].contains(&read.as_str()),
            "unexpected read {read:?}"
        );
    }

    // All replicas delivered the same writes in the same order, and
    // their stores are exactly what that order produces.
    let journals = cluster.journals();
    assert_eq!(journals[0].len(), 6);
    assert_all_equal(&journals, "write delivery order");
    let dumps = cluster.dumps();
    assert_all_equal(&dumps, "store contents");
    assert_eq!(dumps[0], replay(&journals[0]));

    let final_dumps = cluster.shutdown().await?;
    assert_all_equal(&final_dumps, "shutdown dumps");
    Ok(())
}

#[tokio::test]
async fn multi_key_writes_agree_on_one_total_order() -> Result<()> {
    let cluster = TestCluster::spawn(4, 21300).await?;

    let mut c0 = cluster.client(0).await?;
    let mut c1 = cluster.client(1).await?;
    let mut c2 = cluster.client(2).await?;
    let mut c3 = cluster.client(3).await?;

    let mut tasks = JoinSet::new();
    tasks.spawn(async move {
        c0.put("x", "a").await?;
        c0.delete("x").await?;
        c0.get("z").await?;
        c0.get("y").await?;
        Ok::<_, anyhow::Error>(())
    });
    tasks.spawn(async move {
        c1.put("x", "b").await?;
        c1.get("x").await?;
        c1.put("z", "e").await?;
        c1.get("z").await?;
        Ok(())
    });
    tasks.spawn(async move {
        c2.put("z", "c").await?;
        c2.get("z").await?;
        c2.put("y", "d").await?;
        c2.get("y").await?;
        Ok(())
    });
    tasks.spawn(async move {
        c3.put("y", "a").await?;
        c3.put("z", "b").await?;
        c3.delete("y").await?;
        c3.get("z").await?;
        Ok(())
    });
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    // 9 writes: 7 puts and 2 deletes.
    cluster.await_quiescence(9).await?;

    let journals = cluster.journals();
    assert_all_equal(&journals, "write delivery order");
    let dumps = cluster.dumps();
    assert_all_equal(&dumps, "store contents");
    assert_eq!(dumps[0], replay(&journals[0]));

    // Quiescence left no ACK behind on any replica.
    for replica in &cluster.replicas {
        assert_eq!(replica.engine.holdback_len(), 0);
    }

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn reads_observe_the_writes_that_precede_them() -> Result<()> {
    let cluster = TestCluster::spawn(4, 21500).await?;

    // A read issued after a write on the same replica is sequenced
    // after it, so the round-trip laws hold without any settling time.
    let mut client = cluster.client(0).await?;
    client.put("k", "v1").await?;
    assert_eq!(client.get("k").await?, "v1");

    client.put("k", "v1").await?;
    assert_eq!(client.get("k").await?, "v1");

    client.put("k", "v2").await?;
    assert_eq!(client.get("k").await?, "v2");

    client.delete("k").await?;
    assert_eq!(client.get("k").await?, NOT_FOUND);

    cluster.await_quiescence(4).await?;
    let dumps = cluster.dumps();
    assert_all_equal(&dumps, "store contents");
    assert!(dumps[0].is_empty());

    cluster.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn transport_failure_to_a_peer_ends_the_run_with_an_error() -> Result<()> {
    // Replica 1 of this two-replica cluster is never started. The
    // first multicast exhausts its connection retries, and the write
    // accepted for transmission must surface as a fatal run error
    // rather than being dropped.
    let config = Config {
        num_replicas: 2,
        base_port: 21900,
        base_port_to_client: 21950,
        base_name: String::new(),
        container: false,
        consistency: ConsistencyMode::Sequential,
        timeout: Duration::from_secs(30),
        delay_ms: (0, 0),
        test: None,
    };
    let replica = Replica::start(config, 0).await?;
    let client_addr = replica.client_addr();
    let run = tokio::spawn(replica.run());

    let mut client = DatastoreClient::connect(&client_addr).await?;
    client.put("x", "a").await?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("run should end once the connection retries are exhausted")?;
    let err = outcome.expect_err("an unreachable peer is fatal, not an idle shutdown");
    assert!(
        format!("{err:#}").contains("failed to connect to peer"),
        "unexpected error: {err:#}"
    );
    Ok(())
}

#[tokio::test]
async fn remote_reads_converge_after_quiescence() -> Result<()> {
    let cluster = TestCluster::spawn(4, 21700).await?;

    let mut writer = cluster.client(1).await?;
    writer.put("shared", "value").await?;
    cluster.await_quiescence(1).await?;

    // Every replica serves the write once it has been delivered.
    for index in 0..4 {
        let mut reader = cluster.client(index).await?;
        assert_eq!(reader.get("shared").await?, "value");
    }

    cluster.shutdown().await?;
    Ok(())
}
