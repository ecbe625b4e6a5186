use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::hetzner::{HetznerClient, HetznerError, ServerFilter};
use crate::metrics::{self, exponential_buckets};
use crate::store::SnapshotStore;

/// Periodically resynchronizes the inventory into the snapshot store.
///
/// The schedule is fixed-delay: the interval is measured from the completion
/// of one publish to the start of the next fetch, so at most one sync is in
/// flight at any time. A failed sync is terminal; the loop returns the error
/// and no further cycle runs.
pub struct DiscoveryWorker {
    client: HetznerClient,
    store: SnapshotStore,
    filter: ServerFilter,
    interval: Duration,
}

impl DiscoveryWorker {
    pub fn new(
        client: HetznerClient,
        store: SnapshotStore,
        filter: ServerFilter,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            store,
            filter,
            interval,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), HetznerError> {
        let durations = metrics::register_histogram(
            "sync_duration_seconds",
            "Time spent synchronizing the server inventory.",
            exponential_buckets(0.05, 2.0, 10),
        )
        .recorder(&[]);
        let discovered = metrics::register_gauge(
            "discovered_servers",
            "Number of servers in the latest inventory snapshot.",
        )
        .recorder(&[]);

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let start = Instant::now();
            let servers = match self.client.list_servers(&self.filter).await {
                Ok(servers) => servers,
                Err(err) => {
                    error!(message = "inventory synchronization failed", %err);
                    return Err(err);
                }
            };
            let elapsed = start.elapsed();

            durations.record(elapsed.as_secs_f64());
            discovered.set(servers.len() as u64);
            debug!(
                message = "inventory synchronized",
                servers = servers.len(),
                elapsed = ?elapsed
            );

            self.store.publish(servers);

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!(message = "discovery worker stopped");

        Ok(())
    }
}
