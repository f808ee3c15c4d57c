//! Cluster snapshot aggregation
//!
//! Builds a coherent snapshot of cluster -> nodes -> guests -> storage from
//! multiple endpoints in five ordered phases: basic status, per-node
//! enrichment (parallel), resource sweep, guest enrichment, totals. The
//! aggregator owns the snapshot until the last phase; the UI only ever sees
//! a finished tree behind an `Arc`.

use crate::client::Client;
use crate::enrich::Enricher;
use crate::storage::StorageDedup;
use crate::value::{get_f64, get_flag, get_opt_string, get_str, get_u64};
use parking_lot::Mutex;
use pvedash_common::{
    Cluster, CpuInfo, Error, Guest, GuestType, Node, Result, Storage,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Invoked once when background enrichment (including the retry pass) has
/// finished. Receives the enriched snapshot and any composite error.
pub type SnapshotCallback = Box<dyn FnOnce(Arc<Cluster>, Option<Arc<Error>>) + Send + 'static>;

/// A finished snapshot plus the partial-failure error, if any
pub struct BuildOutcome {
    pub cluster: Arc<Cluster>,
    /// `PartialFailure` when some nodes or guests failed; the snapshot is
    /// still valid.
    pub error: Option<Error>,
}

type CallbackQueue = Arc<Mutex<Vec<SnapshotCallback>>>;

/// Snapshot builder with refresh coalescing
pub struct Aggregator {
    client: Arc<Client>,
    enricher: Arc<Enricher>,
    /// Callback queue of the running build, if one is in flight
    in_flight: Arc<Mutex<Option<CallbackQueue>>>,
    /// Last published snapshot, used to retain stale metrics for nodes
    /// that fail a refresh
    last_snapshot: Arc<Mutex<Option<Arc<Cluster>>>>,
}

impl Aggregator {
    pub fn new(client: Arc<Client>) -> Self {
        Aggregator {
            enricher: Arc::new(Enricher::new(Arc::clone(&client))),
            client,
            in_flight: Arc::new(Mutex::new(None)),
            last_snapshot: Arc::new(Mutex::new(None)),
        }
    }

    /// Shorten the enricher's agent retry delay (tests).
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.enricher = Arc::new(
            Enricher::new(Arc::clone(&self.client)).with_retry_delay(delay),
        );
        self
    }

    /// Most recently published snapshot.
    pub fn last_snapshot(&self) -> Option<Arc<Cluster>> {
        self.last_snapshot.lock().clone()
    }

    /// Build a snapshot.
    ///
    /// `fast` returns as soon as phases 1-3 and the totals are done, with
    /// guest enrichment completing on a background task; the enriched
    /// snapshot is delivered through `on_enrichment_complete`. Slow mode
    /// blocks until enrichment (retry pass included) has finished.
    ///
    /// `bypass` skips the response cache, for user-initiated refresh.
    ///
    /// Returns `None` when a build is already in flight: the callback is
    /// attached to the running build and this call does no work.
    pub async fn build_snapshot(
        &self,
        fast: bool,
        bypass: bool,
        on_enrichment_complete: Option<SnapshotCallback>,
    ) -> Result<Option<BuildOutcome>> {
        let callbacks: CallbackQueue;
        {
            let mut guard = self.in_flight.lock();
            if let Some(pending) = guard.as_ref() {
                if let Some(cb) = on_enrichment_complete {
                    pending.lock().push(cb);
                }
                debug!("refresh coalesced into running build");
                return Ok(None);
            }
            callbacks = Arc::new(Mutex::new(
                on_enrichment_complete.into_iter().collect(),
            ));
            *guard = Some(Arc::clone(&callbacks));
        }

        match self.build_inner(fast, bypass, Arc::clone(&callbacks)).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                *self.in_flight.lock() = None;
                Err(e)
            }
        }
    }

    async fn build_inner(
        &self,
        fast: bool,
        bypass: bool,
        callbacks: CallbackQueue,
    ) -> Result<BuildOutcome> {
        // Phase 1: basic cluster status and node stubs.
        let mut cluster = self.basic_cluster_status(bypass).await?;

        // Phase 2: per-node status, one task per node.
        let failed_nodes = self.enrich_node_statuses(&mut cluster, bypass).await?;

        // Phase 3: one sweep over cluster resources.
        let mut dedup = StorageDedup::new();
        self.process_cluster_resources(&mut cluster, &mut dedup, bypass)
            .await?;

        let total_nodes = cluster.nodes.len();
        let node_error = if failed_nodes > 0 {
            Some(Error::PartialFailure {
                failed: failed_nodes,
                total: total_nodes,
            })
        } else {
            None
        };

        // Phase 4 + 5. Enrichment never changes node-level metrics, so the
        // totals of the un-enriched and enriched snapshots agree.
        if fast {
            calculate_totals(&mut cluster, &dedup);
            let published = Arc::new(cluster.clone());
            *self.last_snapshot.lock() = Some(Arc::clone(&published));

            let enricher = Arc::clone(&self.enricher);
            let last_snapshot = Arc::clone(&self.last_snapshot);
            let in_flight = Arc::clone(&self.in_flight);
            tokio::spawn(async move {
                let mut owned = cluster;
                let result = enricher.enrich_cluster(&mut owned, false).await;
                let enriched = Arc::new(owned);
                *last_snapshot.lock() = Some(Arc::clone(&enriched));
                *in_flight.lock() = None;
                fire_callbacks(&callbacks, &enriched, result.err());
            });

            Ok(BuildOutcome {
                cluster: published,
                error: node_error,
            })
        } else {
            let enrich_result = self.enricher.enrich_cluster(&mut cluster, bypass).await;
            calculate_totals(&mut cluster, &dedup);
            let published = Arc::new(cluster);
            *self.last_snapshot.lock() = Some(Arc::clone(&published));
            *self.in_flight.lock() = None;

            let error = merge_partial(node_error, enrich_result.err());
            let cb_error = match &error {
                Some(Error::PartialFailure { failed, total }) => Some(Error::PartialFailure {
                    failed: *failed,
                    total: *total,
                }),
                _ => None,
            };
            fire_callbacks(&callbacks, &published, cb_error);
            Ok(BuildOutcome {
                cluster: published,
                error,
            })
        }
    }

    /// `GET /cluster/status`: the lone cluster record plus one stub per
    /// node, in response order.
    async fn basic_cluster_status(&self, bypass: bool) -> Result<Cluster> {
        let path = "/cluster/status";
        let res = if bypass {
            self.client.get_fresh(path).await?
        } else {
            self.client.get(path).await?
        };
        let data = res
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::format(path, "data is not an array"))?;

        let mut cluster = Cluster::default();
        for item in data {
            match get_str(item, "type") {
                Some("cluster") => {
                    cluster.name = get_str(item, "name").unwrap_or_default().to_string();
                    cluster.quorate = get_flag(item, "quorate");
                    cluster.total_nodes = get_u64(item, "nodes") as usize;
                }
                Some("node") => {
                    let name = get_str(item, "name").unwrap_or_default().to_string();
                    cluster.nodes.push(Node {
                        ip: get_str(item, "ip").unwrap_or_default().to_string(),
                        online: get_flag(item, "online"),
                        name,
                        ..Default::default()
                    });
                }
                _ => {}
            }
        }

        // Single-node installs have no cluster record.
        if cluster.total_nodes < cluster.nodes.len() {
            cluster.total_nodes = cluster.nodes.len();
        }
        Ok(cluster)
    }

    /// Phase 2. A failing node is flipped offline with the fields of the
    /// previous snapshot retained (timestamp included, marking them stale).
    /// Only when every node fails is a hard error raised.
    async fn enrich_node_statuses(&self, cluster: &mut Cluster, bypass: bool) -> Result<usize> {
        if cluster.nodes.is_empty() {
            return Ok(0);
        }

        let handles: Vec<_> = cluster
            .nodes
            .iter()
            .map(|node| {
                let client = Arc::clone(&self.client);
                let name = node.name.clone();
                let path = format!("/nodes/{}/status", name);
                tokio::spawn(async move {
                    let res = if bypass {
                        client.get_fresh(&path).await
                    } else {
                        client.get(&path).await
                    };
                    (name, res)
                })
            })
            .collect();

        let previous = self.last_snapshot.lock().clone();
        let mut failed = 0;
        for handle in handles {
            let (name, res) = match handle.await {
                Ok(r) => r,
                Err(e) => {
                    warn!("node status task panicked: {}", e);
                    failed += 1;
                    continue;
                }
            };
            let Some(node) = cluster.find_node_mut(&name) else {
                continue;
            };
            let data = match &res {
                Ok(r) => r.get("data").cloned(),
                Err(e) => {
                    debug!("node {} status failed: {}", name, e);
                    None
                }
            };
            match data {
                Some(data) => apply_node_status(node, &data),
                None => {
                    failed += 1;
                    node.online = false;
                    if let Some(prev) = previous.as_ref().and_then(|p| p.find_node(&name)) {
                        retain_stale_metrics(node, prev);
                    }
                }
            }
        }

        if failed == cluster.nodes.len() {
            return Err(Error::Network("all nodes failed status fetch".to_string()));
        }
        Ok(failed)
    }

    /// Phase 3. Classify each resource record by type: node overrides,
    /// storage registration, guest creation.
    async fn process_cluster_resources(
        &self,
        cluster: &mut Cluster,
        dedup: &mut StorageDedup,
        bypass: bool,
    ) -> Result<()> {
        let path = "/cluster/resources";
        let res = if bypass {
            self.client.get_fresh(path).await?
        } else {
            self.client.get(path).await?
        };
        let data = res
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::format(path, "data is not an array"))?;

        for item in data {
            let node_name = get_str(item, "node").unwrap_or_default().to_string();
            match get_str(item, "type") {
                Some("node") => {
                    // This endpoint's node numbers are more reliable than
                    // per-node status.
                    if let Some(node) = cluster.find_node_mut(&node_name) {
                        node.cpu_usage = get_f64(item, "cpu");
                        let mem = get_u64(item, "mem");
                        let max_mem = get_u64(item, "maxmem");
                        if mem > 0 {
                            node.memory_used = mem;
                        }
                        if max_mem > 0 {
                            node.memory_total = max_mem;
                        }
                    }
                }
                Some("storage") => {
                    let storage = Storage {
                        id: get_str(item, "storage")
                            .or(get_str(item, "id"))
                            .unwrap_or_default()
                            .to_string(),
                        node: node_name.clone(),
                        content: get_str(item, "content").unwrap_or_default().to_string(),
                        disk: get_u64(item, "disk"),
                        max_disk: get_u64(item, "maxdisk"),
                        plugin_type: get_str(item, "plugintype").unwrap_or_default().to_string(),
                        status: get_str(item, "status").unwrap_or_default().to_string(),
                        shared: get_flag(item, "shared"),
                    };
                    dedup.register(&storage);
                    if let Some(node) = cluster.find_node_mut(&node_name) {
                        node.storage = Some(storage);
                    }
                }
                Some(kind @ ("qemu" | "lxc")) => {
                    let Some(kind) = GuestType::parse(kind) else {
                        continue;
                    };
                    let Some(node) = cluster.find_node_mut(&node_name) else {
                        continue;
                    };
                    let mut guest = Guest::new(get_u64(item, "vmid") as u32, &node_name, kind);
                    guest.name = get_str(item, "name").unwrap_or_default().to_string();
                    guest.status = get_str(item, "status").unwrap_or_default().to_string().into();
                    guest.cpu = get_f64(item, "cpu");
                    guest.mem = get_u64(item, "mem");
                    guest.max_mem = get_u64(item, "maxmem");
                    guest.disk = get_u64(item, "disk");
                    guest.max_disk = get_u64(item, "maxdisk");
                    guest.uptime = get_u64(item, "uptime");
                    guest.ha_state = get_opt_string(item, "hastate");
                    guest.lock = get_opt_string(item, "lock");
                    guest.tags = get_opt_string(item, "tags");
                    guest.template = get_flag(item, "template");
                    guest.pool = get_opt_string(item, "pool");
                    node.guests.push(guest);
                }
                _ => {}
            }
        }
        Ok(())
    }
}

fn fire_callbacks(callbacks: &CallbackQueue, cluster: &Arc<Cluster>, error: Option<Error>) {
    let drained: Vec<SnapshotCallback> = std::mem::take(&mut *callbacks.lock());
    let error = error.map(Arc::new);
    for cb in drained {
        cb(Arc::clone(cluster), error.clone());
    }
}

fn merge_partial(a: Option<Error>, b: Option<Error>) -> Option<Error> {
    match (a, b) {
        (
            Some(Error::PartialFailure { failed: f1, total: t1 }),
            Some(Error::PartialFailure { failed: f2, total: t2 }),
        ) => Some(Error::PartialFailure {
            failed: f1 + f2,
            total: t1 + t2,
        }),
        (Some(e), _) | (None, Some(e)) => Some(e),
        (None, None) => None,
    }
}

/// Merge a `/nodes/{n}/status` payload into a node stub.
fn apply_node_status(node: &mut Node, data: &Value) {
    node.version = get_str(data, "pveversion").unwrap_or_default().to_string();
    node.kernel_version = get_str(data, "kversion").unwrap_or_default().to_string();
    node.cpu_usage = get_f64(data, "cpu");
    node.uptime = get_u64(data, "uptime");

    if let Some(cpuinfo) = data.get("cpuinfo") {
        node.cpu_count = get_f64(cpuinfo, "cpus");
        node.cpu_info = Some(CpuInfo {
            model: get_str(cpuinfo, "model").unwrap_or_default().to_string(),
            cores: get_u64(cpuinfo, "cores") as u32,
            sockets: get_u64(cpuinfo, "sockets") as u32,
        });
    }

    node.load_avg = data
        .get("loadavg")
        .and_then(Value::as_array)
        .map(|vals| {
            vals.iter()
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect()
        })
        .unwrap_or_default();

    if let Some(memory) = data.get("memory") {
        node.memory_total = get_u64(memory, "total");
        node.memory_used = get_u64(memory, "used");
    }
    if let Some(rootfs) = data.get("rootfs") {
        node.storage_total = get_u64(rootfs, "total");
        node.storage_used = get_u64(rootfs, "used");
    }

    node.last_metrics_update = Some(chrono::Utc::now().timestamp());
}

/// Copy the previous snapshot's metrics into a node that failed its
/// refresh. The old timestamp is kept, which is what marks them stale.
fn retain_stale_metrics(node: &mut Node, prev: &Node) {
    node.version = prev.version.clone();
    node.kernel_version = prev.kernel_version.clone();
    node.cpu_count = prev.cpu_count;
    node.cpu_usage = prev.cpu_usage;
    node.cpu_info = prev.cpu_info.clone();
    node.load_avg = prev.load_avg.clone();
    node.memory_total = prev.memory_total;
    node.memory_used = prev.memory_used;
    node.storage_total = prev.storage_total;
    node.storage_used = prev.storage_used;
    node.uptime = prev.uptime;
    node.last_metrics_update = prev.last_metrics_update;
}

/// Phase 5: cluster-wide totals. Cores and the CPU mean aggregate over
/// online nodes that reported a non-zero core count; storage totals come
/// exclusively from the deduplicator.
fn calculate_totals(cluster: &mut Cluster, dedup: &StorageDedup) {
    let mut online = 0usize;
    let mut total_cores = 0.0;
    let mut cpu_sum = 0.0;
    let mut contributing = 0usize;
    let mut memory_total = 0u64;
    let mut memory_used = 0u64;

    for node in &cluster.nodes {
        if !node.online {
            continue;
        }
        online += 1;
        memory_total += node.memory_total;
        memory_used += node.memory_used;
        if node.cpu_count > 0.0 {
            total_cores += node.cpu_count;
            cpu_sum += node.cpu_usage;
            contributing += 1;
        }
    }

    cluster.online_nodes = online;
    cluster.total_cores = total_cores;
    cluster.cpu_usage = if contributing > 0 {
        cpu_sum / contributing as f64
    } else {
        0.0
    };
    cluster.memory_total = memory_total;
    cluster.memory_used = memory_used;
    cluster.storage_total = dedup.total_capacity();
    cluster.storage_used = dedup.total_usage();

    if let Some(version) = cluster
        .nodes
        .iter()
        .map(|n| n.version.as_str())
        .find(|v| !v.is_empty())
    {
        // "pve-manager/8.3.5/hash" reads better as "Proxmox VE 8.3.5".
        let short = version.split('/').nth(1).unwrap_or(version);
        cluster.version = format!("Proxmox VE {}", short);
    }

    cluster.last_update = chrono::Utc::now().timestamp();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn node_status_merges_into_stub() {
        let mut node = Node {
            name: "pve1".to_string(),
            online: true,
            ..Default::default()
        };
        let data = json!({
            "pveversion": "pve-manager/8.3.5/dac3aa88bac3f300",
            "kversion": "Linux 6.8.12-8-pve",
            "cpu": 0.12,
            "uptime": 86400,
            "cpuinfo": {"cpus": 16, "model": "AMD EPYC 7302P", "cores": 16, "sockets": 1},
            "loadavg": ["0.50", "0.40", "0.30"],
            "memory": {"total": 68719476736u64, "used": 17179869184u64},
            "rootfs": {"total": 100000000000u64, "used": 40000000000u64}
        });
        apply_node_status(&mut node, &data);
        assert_eq!(node.version, "pve-manager/8.3.5/dac3aa88bac3f300");
        assert_eq!(node.cpu_count, 16.0);
        assert_eq!(node.cpu_info.as_ref().unwrap().sockets, 1);
        assert_eq!(node.load_avg, vec!["0.50", "0.40", "0.30"]);
        assert_eq!(node.memory_total, 68719476736);
        assert_eq!(node.storage_used, 40000000000);
        assert!(node.last_metrics_update.is_some());
    }

    #[test]
    fn totals_average_only_contributing_nodes() {
        let mut cluster = Cluster {
            nodes: vec![
                Node {
                    name: "a".to_string(),
                    online: true,
                    cpu_count: 8.0,
                    cpu_usage: 0.2,
                    memory_total: 100,
                    memory_used: 50,
                    ..Default::default()
                },
                Node {
                    name: "b".to_string(),
                    online: true,
                    cpu_count: 8.0,
                    cpu_usage: 0.6,
                    memory_total: 100,
                    memory_used: 10,
                    ..Default::default()
                },
                // Online but never reported cores: counted online, not in
                // the CPU mean.
                Node {
                    name: "c".to_string(),
                    online: true,
                    cpu_count: 0.0,
                    cpu_usage: 0.0,
                    ..Default::default()
                },
                Node {
                    name: "d".to_string(),
                    online: false,
                    cpu_count: 8.0,
                    cpu_usage: 1.0,
                    memory_total: 100,
                    memory_used: 100,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        calculate_totals(&mut cluster, &StorageDedup::new());
        assert_eq!(cluster.online_nodes, 3);
        assert_eq!(cluster.total_cores, 16.0);
        assert!((cluster.cpu_usage - 0.4).abs() < 1e-9);
        assert_eq!(cluster.memory_total, 200);
        assert_eq!(cluster.memory_used, 60);
    }

    #[test]
    fn version_taken_from_first_node_with_one() {
        let mut cluster = Cluster {
            nodes: vec![
                Node {
                    name: "a".to_string(),
                    online: true,
                    ..Default::default()
                },
                Node {
                    name: "b".to_string(),
                    online: true,
                    version: "pve-manager/8.3.5/abc".to_string(),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        calculate_totals(&mut cluster, &StorageDedup::new());
        assert_eq!(cluster.version, "Proxmox VE 8.3.5");
    }

    #[test]
    fn stale_metrics_keep_old_timestamp() {
        let prev = Node {
            name: "b".to_string(),
            online: true,
            cpu_count: 4.0,
            memory_total: 1000,
            last_metrics_update: Some(1_700_000_000),
            ..Default::default()
        };
        let mut node = Node {
            name: "b".to_string(),
            online: false,
            ..Default::default()
        };
        retain_stale_metrics(&mut node, &prev);
        assert_eq!(node.cpu_count, 4.0);
        assert_eq!(node.memory_total, 1000);
        assert_eq!(node.last_metrics_update, Some(1_700_000_000));
        assert!(!node.online);
    }
}
