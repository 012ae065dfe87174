//! Consensus liveness monitoring.
//!
//! A monitor subscribes to a node's new heads and keeps an inactivity deadline. Until the first
//! head past the warm-up height arrives the deadline is [Config::first_block_grace]; every later
//! head pushes it [Config::steady_grace] into the future. When the deadline fires the monitor
//! reports whether the node never produced a block or stalled after making progress.
//!
//! Only HTTP endpoints are supported, so "subscribing" to new heads means polling the latest
//! header. The subscription closing (and [Error::SubscriptionClosed]) therefore reports a failed
//! poll, typically because the node stopped answering, not a dropped websocket.

use crate::{client::Client, Error};
use commonware_macros::select;
use commonware_runtime::{Clock, Handle, Metrics, Spawner};
use futures::{
    channel::{mpsc, oneshot},
    future::join_all,
    SinkExt, StreamExt,
};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for a liveness monitor.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Time allowed before the first head past `warmup`.
    pub first_block_grace: Duration,

    /// Time allowed between consecutive heads once progress was observed.
    pub steady_grace: Duration,

    /// Heads below this height do not extend the deadline.
    pub warmup: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            first_block_grace: Duration::from_secs(10),
            steady_grace: Duration::from_secs(3),
            warmup: 3,
        }
    }
}

/// Watch the heads of `client` until `quit` fires or the node stops making progress.
///
/// Dropping the sender of `quit` is treated as a quit signal.
pub async fn monitor<E: Clock, C: Client>(
    context: E,
    node: &str,
    client: C,
    cfg: Config,
    mut quit: oneshot::Receiver<()>,
) -> Result<(), Error> {
    let mut heads = client
        .subscribe_new_heads()
        .await
        .map_err(|source| Error::Rpc {
            node: node.to_string(),
            operation: "subscribe",
            source,
        })?;
    let mut last: Option<u64> = None;
    let mut deadline = context.current() + cfg.first_block_grace;
    loop {
        select! {
            _ = &mut quit => {
                debug!(node, ?last, "monitor quit");
                return Ok(());
            },
            _ = context.sleep_until(deadline) => {
                return Err(match last {
                    None => Error::NoBlockEverProduced {
                        node: node.to_string(),
                    },
                    Some(last) => Error::StalledAfterProgress {
                        node: node.to_string(),
                        last,
                    },
                });
            },
            head = heads.next() => {
                match head {
                    Some(Ok(header)) => {
                        last = Some(header.number);
                        if header.number >= cfg.warmup {
                            deadline = context.current() + cfg.steady_grace;
                        }
                    }
                    Some(Err(source)) => {
                        return Err(Error::Rpc {
                            node: node.to_string(),
                            operation: "new heads",
                            source,
                        });
                    }
                    None => {
                        return Err(Error::SubscriptionClosed {
                            node: node.to_string(),
                        });
                    }
                }
            },
        }
    }
}

/// Monitor every target concurrently for `duration`.
///
/// Returns the first monitor error, or `Ok` once `duration` elapses with every node still making
/// progress. Every monitor is asked to quit and joined before returning.
pub async fn ensure_progress<E, C>(
    context: E,
    targets: Vec<(String, C)>,
    cfg: Config,
    duration: Duration,
) -> Result<(), Error>
where
    E: Clock + Spawner + Metrics,
    C: Client,
{
    let (reporter, mut reports) = mpsc::channel(targets.len().max(1));
    let mut quits = Vec::with_capacity(targets.len());
    let mut handles: Vec<Handle<()>> = Vec::with_capacity(targets.len());
    for (node, client) in targets {
        let (quit, receiver) = oneshot::channel();
        let mut reporter = reporter.clone();
        let handle = context
            .with_label("monitor")
            .spawn(move |context| async move {
                if let Err(err) = monitor(context, &node, client, cfg, receiver).await {
                    warn!(node = node.as_str(), ?err, "monitor failed");
                    let _ = reporter.send(err).await;
                }
            });
        quits.push(quit);
        handles.push(handle);
    }
    drop(reporter);

    let mut outcome = Ok(());
    let deadline = context.current() + duration;
    select! {
        _ = context.sleep_until(deadline) => {
            info!(?duration, "consensus working");
        },
        report = reports.next() => {
            if let Some(err) = report {
                outcome = Err(err);
            }
        },
    }

    for quit in quits {
        let _ = quit.send(());
    }
    join_all(handles).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{Client as _, Dialer as _},
        container::{Runtime as _, Spec, ADDRESS_LABEL},
        genesis,
        mocks::Cluster,
    };
    use alloy_primitives::Address;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, Runner};
    use std::{collections::BTreeMap, net::Ipv4Addr, path::Path};

    /// Start a single validator container on the mock cluster and dial it.
    async fn validator(cluster: &Cluster, dir: &Path) -> crate::mocks::Client {
        let address = Address::repeat_byte(1);
        let path = genesis::create(dir, &genesis::Config::default(), &[address], &[]).unwrap();
        cluster.seed(&path).unwrap();
        let ip = Ipv4Addr::new(172, 18, 0, 2);
        let runtime = cluster.runtime();
        let id = runtime
            .create(&Spec {
                image: "node".into(),
                cmd: vec!["--mine".into()],
                network: Some("testnet".into()),
                ip: Some(ip),
                labels: BTreeMap::from([(ADDRESS_LABEL.to_string(), format!("{address:#x}"))]),
                ..Spec::default()
            })
            .await
            .unwrap();
        runtime.start(&id).await.unwrap();
        cluster
            .dialer()
            .dial(&crate::client::Endpoint {
                scheme: crate::client::Scheme::Http,
                host: ip.to_string(),
                port: 8545,
            })
            .await
            .unwrap()
    }

    #[test_traced]
    fn test_no_block_ever_produced() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            let (_quit, receiver) = oneshot::channel();
            let started = context.current();
            let result = monitor(context.clone(), "node-0", client, Config::default(), receiver).await;
            assert!(matches!(result, Err(Error::NoBlockEverProduced { .. })));
            let elapsed = context.current().duration_since(started).unwrap();
            assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        });
    }

    #[test_traced]
    fn test_stalled_after_progress() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            let (_quit, receiver) = oneshot::channel();
            let monitored = context.with_label("monitor").spawn({
                let client = client.clone();
                move |context| async move {
                    monitor(context, "node-0", client, Config::default(), receiver).await
                }
            });

            // Five heads, one per second, then silence
            for _ in 0..5 {
                context.sleep(Duration::from_secs(1)).await;
                cluster.produce();
            }
            let stalled = context.current();
            let result = monitored.await.unwrap();
            assert!(matches!(
                result,
                Err(Error::StalledAfterProgress { last: 5, .. })
            ));

            // Fired after the steady grace, well before the first-block grace
            let elapsed = context.current().duration_since(stalled).unwrap();
            assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_secs(10));
        });
    }

    #[test_traced]
    fn test_warmup_heads_do_not_extend() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            let (_quit, receiver) = oneshot::channel();
            let started = context.current();
            let monitored = context.with_label("monitor").spawn(move |context| async move {
                monitor(context, "node-0", client, Config::default(), receiver).await
            });

            // Blocks 1 and 2 arrive, then nothing
            context.sleep(Duration::from_secs(1)).await;
            cluster.produce();
            cluster.produce();
            let result = monitored.await.unwrap();
            assert!(matches!(
                result,
                Err(Error::StalledAfterProgress { last: 2, .. })
            ));
            let elapsed = context.current().duration_since(started).unwrap();
            assert!(elapsed >= Duration::from_secs(10) && elapsed < Duration::from_secs(11));
        });
    }

    #[test_traced]
    fn test_quit() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            let (quit, receiver) = oneshot::channel();
            let monitored = context.with_label("monitor").spawn(move |context| async move {
                monitor(context, "node-0", client, Config::default(), receiver).await
            });
            context.sleep(Duration::from_secs(1)).await;
            quit.send(()).unwrap();
            monitored.await.unwrap().unwrap();
        });
    }

    #[test_traced]
    fn test_subscription_closed() {
        let executor = deterministic::Runner::timed(Duration::from_secs(60));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            let (_quit, receiver) = oneshot::channel();
            let monitored = context.with_label("monitor").spawn(move |context| async move {
                monitor(context, "node-0", client, Config::default(), receiver).await
            });
            context.sleep(Duration::from_secs(1)).await;
            cluster.stop_all();
            let result = monitored.await.unwrap();
            assert!(matches!(result, Err(Error::SubscriptionClosed { .. })));
        });
    }

    #[test_traced]
    fn test_ensure_progress() {
        let executor = deterministic::Runner::timed(Duration::from_secs(120));
        executor.start(|context| async move {
            let dir = tempfile::tempdir().unwrap();
            let cluster = Cluster::new();
            let client = validator(&cluster, dir.path()).await;
            cluster.spawn_producer(context.with_label("producer"), Duration::from_secs(1));

            let started = context.current();
            ensure_progress(
                context.clone(),
                vec![("node-0".to_string(), client.clone())],
                Config::default(),
                Duration::from_secs(20),
            )
            .await
            .unwrap();
            let elapsed = context.current().duration_since(started).unwrap();
            assert!(elapsed >= Duration::from_secs(20) && elapsed < Duration::from_secs(21));

            // A fresh monitor over a halted chain never sees a head
            client.stop_mining().await.unwrap();
            let result = ensure_progress(
                context.clone(),
                vec![("node-0".to_string(), client)],
                Config::default(),
                Duration::from_secs(30),
            )
            .await;
            assert!(matches!(result, Err(Error::NoBlockEverProduced { .. })));
        });
    }
}
