//! End-to-end aggregator tests against a stub Proxmox API server.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use pvedash_api::{Aggregator, Client, ConnectionOptions};
use pvedash_common::{Error, GuestStatus, ResponseCache};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Canned-response server. Each path holds a sequence of responses; the
/// hit counter indexes into it and the last entry repeats.
#[derive(Clone, Default)]
struct StubPve {
    routes: Arc<Mutex<HashMap<String, Vec<(u16, Value)>>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl StubPve {
    fn set(&self, path: &str, status: u16, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push((status, body));
    }

    fn ok(&self, path: &str, data: Value) {
        self.set(path, 200, json!({ "data": data }));
    }

    fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    async fn spawn(self) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(self);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

async fn handle(State(stub): State<StubPve>, req: Request) -> Response {
    let path = req
        .uri()
        .path()
        .trim_start_matches("/api2/json")
        .to_string();
    let hit = {
        let mut hits = stub.hits.lock().unwrap();
        let counter = hits.entry(path.clone()).or_insert(0);
        *counter += 1;
        *counter - 1
    };
    let routes = stub.routes.lock().unwrap();
    match routes.get(&path) {
        Some(responses) => {
            let (status, body) = &responses[hit.min(responses.len() - 1)];
            (
                StatusCode::from_u16(*status).unwrap(),
                Json(body.clone()),
            )
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"data": null})),
        )
            .into_response(),
    }
}

fn client_for(addr: &str) -> Arc<Client> {
    let opts = ConnectionOptions {
        addr: addr.to_string(),
        user: "root".to_string(),
        realm: "pam".to_string(),
        token_id: Some("dash".to_string()),
        token_secret: Some("secret".to_string()),
        ..Default::default()
    };
    Arc::new(Client::new(&opts, ResponseCache::new()).unwrap())
}

fn cluster_status(nodes: &[(&str, bool)]) -> Value {
    let mut items = vec![json!({
        "type": "cluster", "name": "testlab", "quorate": 1, "nodes": nodes.len()
    })];
    for (name, online) in nodes {
        items.push(json!({
            "type": "node", "name": name, "ip": "10.0.0.1",
            "online": if *online { 1 } else { 0 }
        }));
    }
    Value::Array(items)
}

fn node_status() -> Value {
    json!({
        "pveversion": "pve-manager/8.3.5/abc123",
        "kversion": "Linux 6.8.12-8-pve",
        "cpu": 0.25,
        "uptime": 3600,
        "cpuinfo": {"cpus": 8, "model": "test", "cores": 8, "sockets": 1},
        "loadavg": ["0.10", "0.20", "0.30"],
        "memory": {"total": 1000u64, "used": 400u64},
        "rootfs": {"total": 5000u64, "used": 2000u64}
    })
}

#[tokio::test]
async fn partial_node_outage_downgrades_not_aborts() {
    let stub = StubPve::default();
    stub.ok(
        "/cluster/status",
        cluster_status(&[("a", true), ("b", true), ("c", true)]),
    );
    stub.ok("/nodes/a/status", node_status());
    stub.set("/nodes/b/status", 500, json!({"data": null}));
    stub.ok("/nodes/c/status", node_status());
    stub.ok("/cluster/resources", json!([]));

    let addr = stub.spawn().await;
    let agg = Arc::new(Aggregator::new(client_for(&addr)));
    let outcome = agg
        .build_snapshot(false, false, None)
        .await
        .unwrap()
        .unwrap();

    let cluster = &outcome.cluster;
    assert_eq!(cluster.nodes.len(), 3);
    assert!(!cluster.find_node("b").unwrap().online);
    assert!(cluster.find_node("a").unwrap().online);
    assert_eq!(cluster.online_nodes, 2);
    match outcome.error {
        Some(Error::PartialFailure { failed, total }) => {
            assert_eq!(failed, 1);
            assert_eq!(total, 3);
        }
        other => panic!("expected PartialFailure, got {:?}", other),
    }
}

#[tokio::test]
async fn all_nodes_failing_is_a_hard_error() {
    let stub = StubPve::default();
    stub.ok("/cluster/status", cluster_status(&[("a", true), ("b", true)]));
    stub.set("/nodes/a/status", 500, json!({"data": null}));
    stub.set("/nodes/b/status", 500, json!({"data": null}));

    let addr = stub.spawn().await;
    let agg = Arc::new(Aggregator::new(client_for(&addr)));
    let result = agg.build_snapshot(false, false, None).await;
    assert!(matches!(result, Err(Error::Network(_))));
}

#[tokio::test]
async fn shared_storage_counted_once_in_totals() {
    let stub = StubPve::default();
    stub.ok("/cluster/status", cluster_status(&[("a", true), ("b", true)]));
    stub.ok("/nodes/a/status", node_status());
    stub.ok("/nodes/b/status", node_status());
    stub.ok(
        "/cluster/resources",
        json!([
            {"type": "storage", "node": "a", "storage": "nas",
             "shared": 1, "maxdisk": 1_000_000_000_000u64, "disk": 100},
            {"type": "storage", "node": "b", "storage": "nas",
             "shared": 1, "maxdisk": 1_000_000_000_000u64, "disk": 100},
            {"type": "storage", "node": "a", "storage": "local",
             "shared": 0, "maxdisk": 500_000_000_000u64, "disk": 50},
            {"type": "storage", "node": "b", "storage": "local",
             "shared": 0, "maxdisk": 500_000_000_000u64, "disk": 50}
        ]),
    );

    let addr = stub.spawn().await;
    let agg = Arc::new(Aggregator::new(client_for(&addr)));
    let outcome = agg
        .build_snapshot(false, false, None)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.cluster.storage_total, 2_000_000_000_000);
    assert_eq!(outcome.cluster.storage_used, 200);
    assert!(outcome.error.is_none());
}

/// Fixture with one node and two running QEMU guests whose agent answers
/// only from the second query on.
fn flaky_agent_stub() -> StubPve {
    let stub = StubPve::default();
    stub.ok("/cluster/status", cluster_status(&[("a", true)]));
    stub.ok("/nodes/a/status", node_status());
    stub.ok(
        "/cluster/resources",
        json!([
            {"type": "qemu", "node": "a", "vmid": 100, "name": "web",
             "status": "running", "cpu": 0.1, "mem": 100, "maxmem": 200,
             "disk": 10, "maxdisk": 20, "uptime": 60},
            {"type": "qemu", "node": "a", "vmid": 101, "name": "db",
             "status": "running", "cpu": 0.2, "mem": 100, "maxmem": 200,
             "disk": 10, "maxdisk": 20, "uptime": 60}
        ]),
    );
    let interfaces = json!({"result": [
        {"name": "eth0", "hardware-address": "aa:bb:cc:dd:ee:ff",
         "ip-addresses": [{"ip-address": "10.0.0.5", "ip-address-type": "ipv4", "prefix": 24}]}
    ]});
    for vmid in [100, 101] {
        stub.ok(
            &format!("/nodes/a/qemu/{vmid}/status/current"),
            json!({"cpu": 0.1, "mem": 100, "maxmem": 200, "disk": 0, "maxdisk": 0, "uptime": 61}),
        );
        stub.ok(
            &format!("/nodes/a/qemu/{vmid}/config"),
            json!({"agent": "1", "net0": "virtio=AA:BB:CC:DD:EE:FF,bridge=vmbr0"}),
        );
        // First agent query: agent still starting, empty result.
        stub.ok(
            &format!("/nodes/a/qemu/{vmid}/agent/network-get-interfaces"),
            json!({"result": []}),
        );
        stub.ok(
            &format!("/nodes/a/qemu/{vmid}/agent/network-get-interfaces"),
            interfaces.clone(),
        );
        stub.ok(
            &format!("/nodes/a/qemu/{vmid}/agent/get-fsinfo"),
            json!({"result": []}),
        );
    }
    stub
}

#[tokio::test]
async fn retry_pass_enriches_and_callback_fires_once() {
    let stub = flaky_agent_stub();
    let addr = stub.clone().spawn().await;
    let agg = Arc::new(
        Aggregator::new(client_for(&addr)).with_retry_delay(Duration::from_millis(50)),
    );

    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let calls_cb = Arc::clone(&calls);
    let tx = Mutex::new(Some(tx));
    let outcome = agg
        .build_snapshot(
            true,
            false,
            Some(Box::new(move |cluster, _err| {
                calls_cb.fetch_add(1, Ordering::SeqCst);
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(cluster);
                }
            })),
        )
        .await
        .unwrap()
        .unwrap();

    // Fast mode returns an un-enriched snapshot immediately.
    assert!(!outcome.cluster.find_guest("a", 100).unwrap().enriched);

    let enriched = tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("enrichment did not complete")
        .unwrap();

    for vmid in [100, 101] {
        let guest = enriched.find_guest("a", vmid).unwrap();
        assert!(guest.enriched);
        assert!(guest.agent_enabled);
        assert!(guest.agent_running, "retry pass should reach the agent");
        assert_eq!(guest.ip.as_deref(), Some("10.0.0.5"));
        // Status reported zero disks; the summary values survive.
        assert_eq!(guest.disk, 10);
        assert_eq!(guest.max_disk, 20);
    }

    // Exactly one callback invocation, exactly two agent queries per guest.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(stub.hits("/nodes/a/qemu/100/agent/network-get-interfaces"), 2);
}

#[tokio::test]
async fn refresh_during_build_is_coalesced() {
    let stub = flaky_agent_stub();
    let addr = stub.spawn().await;
    let agg = Arc::new(
        Aggregator::new(client_for(&addr)).with_retry_delay(Duration::from_millis(300)),
    );

    let first_calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&first_calls);
    let first = agg
        .build_snapshot(true, false, Some(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })))
        .await
        .unwrap();
    assert!(first.is_some());

    // The retry pass is sleeping; a second refresh must attach, not rebuild.
    let second_calls = Arc::new(AtomicUsize::new(0));
    let c = Arc::clone(&second_calls);
    let second = agg
        .build_snapshot(true, true, Some(Box::new(move |_, _| {
            c.fetch_add(1, Ordering::SeqCst);
        })))
        .await
        .unwrap();
    assert!(second.is_none(), "in-flight build should coalesce");

    tokio::time::timeout(Duration::from_secs(5), async {
        while second_calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("coalesced callback never fired");
    assert_eq!(first_calls.load(Ordering::SeqCst), 1);
    assert_eq!(second_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn repeated_builds_with_warm_cache_are_identical() {
    let stub = StubPve::default();
    stub.ok("/cluster/status", cluster_status(&[("a", true)]));
    stub.ok("/nodes/a/status", node_status());
    stub.ok(
        "/cluster/resources",
        json!([
            {"type": "lxc", "node": "a", "vmid": 200, "name": "ct0",
             "status": "stopped", "maxmem": 100, "maxdisk": 50},
            {"type": "storage", "node": "a", "storage": "local",
             "shared": 0, "maxdisk": 1000u64, "disk": 10}
        ]),
    );

    let addr = stub.spawn().await;
    let agg = Arc::new(Aggregator::new(client_for(&addr)));
    let first = agg.build_snapshot(false, false, None).await.unwrap().unwrap();
    let second = agg.build_snapshot(false, false, None).await.unwrap().unwrap();

    let mut a = (*first.cluster).clone();
    let mut b = (*second.cluster).clone();
    a.last_update = 0;
    b.last_update = 0;
    for n in a.nodes.iter_mut().chain(b.nodes.iter_mut()) {
        n.last_metrics_update = None;
    }
    assert_eq!(a, b);

    // Round-trip: the snapshot survives serde unchanged.
    let encoded = serde_json::to_string(&b).unwrap();
    let decoded: pvedash_common::Cluster = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded, b);

    let guest = b.find_guest("a", 200).unwrap();
    assert_eq!(guest.status, GuestStatus::Stopped);
    assert!(!guest.template);
}
