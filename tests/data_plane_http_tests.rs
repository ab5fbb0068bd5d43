//! Integration tests against a mock Data Plane API
//!
//! A small warp server emulates the transactional configuration API:
//! versioned transactions, staged peer section and peer entry changes,
//! commit with version check, and HTTP basic authentication.

use peersync::api::{ApiCredentials, CommitStatus, ConfigApi, DataPlaneClient, PeerEntry};
use peersync::config::{SourceKind, SyncConfig};
use peersync::shutdown::{self, Shutdown};
use peersync::source::{poll_slices, FileLister, MembershipFeed};
use peersync::{new_reconciler, ApiStep, CallGuard, LocalPeer, RawPeer, SyncError, Worker};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warp::http::{Method, Response, StatusCode};
use warp::hyper::body::Bytes;
use warp::path::FullPath;
use warp::Filter;

const BASE: &str = "/v2/services/haproxy";
const AUTH: &str = "Basic YWRtaW46c2VjcmV0"; // admin:secret

#[derive(Debug, Clone)]
enum Op {
    CreateSection(String),
    Add(String, PeerEntry),
    Delete(String, String),
}

#[derive(Debug, Default)]
struct MockState {
    version: u64,
    next_tx: u64,
    transactions: HashMap<String, (u64, Vec<Op>)>,
    sections: BTreeMap<String, BTreeMap<String, PeerEntry>>,
    requests: Vec<String>,
    malformed_transactions: bool,
    commit_status: Option<u16>,
    commit_answer_id: Option<String>,
}

type Shared = Arc<Mutex<MockState>>;

fn reply(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert("content-type", "application/json".parse().unwrap());
    response
}

fn message(status: StatusCode, text: &str) -> Response<String> {
    reply(status, serde_json::json!({ "code": status.as_u16(), "message": text }).to_string())
}

fn handle(
    state: &Shared,
    method: Method,
    path: &str,
    query: HashMap<String, String>,
    auth: Option<String>,
    body: Bytes,
) -> Response<String> {
    let mut state = state.lock().unwrap();
    state.requests.push(format!("{} {}", method, path));

    if auth.as_deref() != Some(AUTH) {
        return message(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let path = match path.strip_prefix(BASE) {
        Some(rest) => rest.to_string(),
        None => return message(StatusCode::NOT_FOUND, "not found"),
    };
    let transaction = query.get("transaction_id").cloned().unwrap_or_default();
    let section = query.get("peer_section").cloned().unwrap_or_default();

    match (method, path.as_str()) {
        (Method::GET, "/configuration/version") => reply(StatusCode::OK, state.version.to_string()),
        (Method::POST, "/transactions") => {
            let requested: u64 = query.get("version").and_then(|v| v.parse().ok()).unwrap_or(0);
            if requested != state.version {
                return message(StatusCode::CONFLICT, "version mismatch");
            }
            if state.malformed_transactions {
                return reply(StatusCode::CREATED, r#"{"status":"in_progress"}"#.to_string());
            }
            state.next_tx += 1;
            let id = format!("tx-{}", state.next_tx);
            state.transactions.insert(id.clone(), (requested, Vec::new()));
            reply(
                StatusCode::CREATED,
                serde_json::json!({ "id": id, "_version": requested, "status": "in_progress" })
                    .to_string(),
            )
        }
        (Method::POST, "/configuration/peer_section") => {
            let name = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["name"].as_str().map(str::to_string))
                .unwrap_or_default();
            if state.sections.contains_key(&name) {
                return message(StatusCode::CONFLICT, "section exists");
            }
            match state.transactions.get_mut(&transaction) {
                Some((_, ops)) => {
                    ops.push(Op::CreateSection(name.clone()));
                    reply(StatusCode::CREATED, serde_json::json!({ "name": name }).to_string())
                }
                None => message(StatusCode::NOT_FOUND, "unknown transaction"),
            }
        }
        (Method::POST, "/configuration/peer_entries") => {
            let entry: PeerEntry = match serde_json::from_slice(&body) {
                Ok(entry) => entry,
                Err(_) => return message(StatusCode::BAD_REQUEST, "bad entry"),
            };
            let exists = state
                .sections
                .get(&section)
                .map_or(false, |entries| entries.contains_key(&entry.name));
            if exists {
                return message(StatusCode::CONFLICT, "entry exists");
            }
            match state.transactions.get_mut(&transaction) {
                Some((_, ops)) => {
                    ops.push(Op::Add(section, entry.clone()));
                    reply(StatusCode::CREATED, serde_json::to_string(&entry).unwrap())
                }
                None => message(StatusCode::NOT_FOUND, "unknown transaction"),
            }
        }
        (Method::DELETE, p) if p.starts_with("/configuration/peer_entries/") => {
            let name = p.trim_start_matches("/configuration/peer_entries/").to_string();
            let exists = state
                .sections
                .get(&section)
                .map_or(false, |entries| entries.contains_key(&name));
            if !exists {
                return message(StatusCode::NOT_FOUND, "no such entry");
            }
            match state.transactions.get_mut(&transaction) {
                Some((_, ops)) => {
                    ops.push(Op::Delete(section, name));
                    reply(StatusCode::NO_CONTENT, String::new())
                }
                None => message(StatusCode::NOT_FOUND, "unknown transaction"),
            }
        }
        (Method::PUT, p) if p.starts_with("/transactions/") => {
            let id = p.trim_start_matches("/transactions/").to_string();
            let (opened_at, ops) = match state.transactions.remove(&id) {
                Some(tx) => tx,
                None => return message(StatusCode::NOT_FOUND, "unknown transaction"),
            };
            if opened_at != state.version {
                return message(StatusCode::NOT_ACCEPTABLE, "version changed");
            }
            for op in ops {
                match op {
                    Op::CreateSection(name) => {
                        state.sections.entry(name).or_default();
                    }
                    Op::Add(section, entry) => {
                        state
                            .sections
                            .entry(section)
                            .or_default()
                            .insert(entry.name.clone(), entry);
                    }
                    Op::Delete(section, name) => {
                        if let Some(entries) = state.sections.get_mut(&section) {
                            entries.remove(&name);
                        }
                    }
                }
            }
            state.version += 1;
            let status = state
                .commit_status
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let answered = state.commit_answer_id.clone().unwrap_or(id);
            reply(
                status,
                serde_json::json!({ "id": answered, "_version": opened_at, "status": "success" })
                    .to_string(),
            )
        }
        _ => message(StatusCode::NOT_FOUND, "not found"),
    }
}

async fn start_mock(initial: MockState) -> (String, Shared) {
    let state: Shared = Arc::new(Mutex::new(initial));
    let shared = state.clone();
    let routes = warp::method()
        .and(warp::path::full())
        .and(warp::query::<HashMap<String, String>>())
        .and(warp::header::optional::<String>("authorization"))
        .and(warp::body::bytes())
        .map(move |method: Method, path: FullPath, query, auth, body: Bytes| {
            handle(&shared, method, path.as_str(), query, auth, body)
        });
    let (addr, server): (SocketAddr, _) =
        warp::serve(routes).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    (format!("http://{}{}", addr, BASE), state)
}

fn client(url: &str, password: &str) -> DataPlaneClient {
    DataPlaneClient::new(
        url,
        ApiCredentials {
            user: "admin".to_string(),
            password: password.to_string(),
        },
        Duration::from_secs(5),
    )
    .unwrap()
}

fn config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.api.user = "admin".to_string();
    config.api.password = "secret".to_string();
    config
}

fn guard() -> CallGuard {
    CallGuard::with_timeout(Duration::from_secs(10), Shutdown::never())
}

fn raw(identity: &str, address: &str) -> RawPeer {
    RawPeer::new(identity, vec![address.to_string()])
}

fn entry_names(state: &Shared, section: &str) -> Vec<String> {
    state
        .lock()
        .unwrap()
        .sections
        .get(section)
        .map(|entries| entries.keys().cloned().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_basic_auth_and_version() {
    let (url, _state) = start_mock(MockState {
        version: 7,
        ..MockState::default()
    })
    .await;

    assert_eq!(client(&url, "secret").configuration_version().await.unwrap(), 7);

    let err = client(&url, "wrong").configuration_version().await.unwrap_err();
    assert_eq!(err.step(), ApiStep::Version);
    assert_eq!(err.status(), Some(401));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_stale_version_is_retryable_conflict() {
    let (url, _state) = start_mock(MockState {
        version: 5,
        ..MockState::default()
    })
    .await;

    let err = client(&url, "secret").open_transaction(4).await.unwrap_err();
    assert_eq!(err.status(), Some(409));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_end_to_end_reconcile_over_http() {
    let (url, state) = start_mock(MockState::default()).await;
    let api = client(&url, "secret");
    let mut reconciler = new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), api);

    let outcome = reconciler
        .reconcile(
            &[raw("a", "10.0.0.1"), raw("b", "10.0.0.2"), raw("c", "10.0.0.3")],
            &guard(),
        )
        .await
        .unwrap();
    assert!(outcome.committed());
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["b", "c"]);
    {
        let state = state.lock().unwrap();
        assert_eq!(state.version, 1);
        let b = &state.sections["haproxy-peers"]["b"];
        assert_eq!((b.address.as_str(), b.port), ("10.0.0.2", 3000));
        assert!(state.transactions.is_empty());
    }

    let outcome = reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("c", "10.0.0.3")], &guard())
        .await
        .unwrap();
    assert!(outcome.committed());
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["c"]);
    assert!(state
        .lock()
        .unwrap()
        .requests
        .iter()
        .all(|r| !r.ends_with("/peer_entries/a")));
}

#[tokio::test]
async fn test_existing_section_is_reused() {
    let mut initial = MockState::default();
    initial.sections.insert("haproxy-peers".to_string(), BTreeMap::new());
    let (url, state) = start_mock(initial).await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    let outcome = reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("b", "10.0.0.2")], &guard())
        .await
        .unwrap();

    assert!(outcome.committed());
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["b"]);
}

#[tokio::test]
async fn test_malformed_transaction_leaves_state_unadopted() {
    let (url, state) = start_mock(MockState {
        malformed_transactions: true,
        ..MockState::default()
    })
    .await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    let err = reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("b", "10.0.0.2")], &guard())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::MalformedResponse(_)));
    assert_eq!(err.step(), Some(ApiStep::OpenTransaction));
    assert!(reconciler.last_applied().is_empty());
    assert!(entry_names(&state, "haproxy-peers").is_empty());
}

#[tokio::test]
async fn test_reload_pending_commit_counts_as_committed() {
    let (url, state) = start_mock(MockState {
        commit_status: Some(202),
        ..MockState::default()
    })
    .await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    let outcome = reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("b", "10.0.0.2")], &guard())
        .await
        .unwrap();

    let report = outcome.report.expect("committed");
    assert_eq!(report.commit, CommitStatus::ReloadPending);
    assert!(reconciler.last_applied().contains("b"));
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["b"]);
}

fn seeded(section: &str, entries: &[(&str, &str)]) -> MockState {
    let mut state = MockState::default();
    let section = state.sections.entry(section.to_string()).or_default();
    for (name, address) in entries {
        section.insert(
            name.to_string(),
            PeerEntry {
                name: name.to_string(),
                address: address.to_string(),
                port: 3000,
            },
        );
    }
    state
}

#[tokio::test]
async fn test_existing_entry_is_already_present() {
    let (url, state) = start_mock(seeded("haproxy-peers", &[("b", "10.0.0.2")])).await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    let outcome = reconciler
        .reconcile(
            &[raw("a", "10.0.0.1"), raw("b", "10.0.0.2"), raw("c", "10.0.0.3")],
            &guard(),
        )
        .await
        .unwrap();

    let report = outcome.report.expect("committed");
    assert_eq!(report.unchanged, vec!["b"]);
    assert_eq!(report.added, vec!["c"]);
    assert!(report.is_complete());
    assert!(reconciler.last_applied().contains("b"));
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["b", "c"]);
}

#[tokio::test]
async fn test_missing_entry_is_already_absent() {
    let (url, state) = start_mock(MockState::default()).await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("b", "10.0.0.2")], &guard())
        .await
        .unwrap();
    assert_eq!(entry_names(&state, "haproxy-peers"), vec!["b"]);

    // Someone else removed the entry behind our back.
    state
        .lock()
        .unwrap()
        .sections
        .get_mut("haproxy-peers")
        .unwrap()
        .remove("b");

    let outcome = reconciler
        .reconcile(&[raw("a", "10.0.0.1")], &guard())
        .await
        .unwrap();

    let report = outcome.report.expect("committed");
    assert_eq!(report.unchanged, vec!["b"]);
    assert!(report.removed.is_empty());
    assert!(report.is_complete());
    assert!(!reconciler.last_applied().contains("b"));
    assert!(state
        .lock()
        .unwrap()
        .requests
        .iter()
        .any(|r| r == "DELETE /v2/services/haproxy/configuration/peer_entries/b"));
}

#[tokio::test]
async fn test_commit_for_other_transaction_is_malformed() {
    let (url, _state) = start_mock(MockState {
        commit_answer_id: Some("tx-999".to_string()),
        ..MockState::default()
    })
    .await;

    let mut reconciler =
        new_reconciler(&config(), LocalPeer::new("a", "10.0.0.1"), client(&url, "secret"));
    let err = reconciler
        .reconcile(&[raw("a", "10.0.0.1"), raw("b", "10.0.0.2")], &guard())
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::MalformedResponse(_)));
    assert_eq!(err.step(), Some(ApiStep::Commit));
    assert!(!err.is_retryable());
    assert!(reconciler.last_applied().is_empty());
}

#[tokio::test]
async fn test_file_source_drives_worker_over_http() {
    let (url, state) = start_mock(MockState::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let slices = dir.path().join("slices.json");
    std::fs::write(
        &slices,
        r#"{"items": [{"metadata": {"name": "haproxy-abc"}, "endpoints": [
            {"addresses": ["10.0.0.1"], "targetRef": {"kind": "Pod", "name": "haproxy-0"}},
            {"addresses": ["10.0.0.2"], "targetRef": {"kind": "Pod", "name": "haproxy-1"}},
            {"addresses": ["10.0.0.3"], "hostname": "haproxy-2"}
        ]}]}"#,
    )
    .unwrap();

    let mut config = config();
    config.api.url = url.clone();
    config.source.kind = SourceKind::File;
    config.source.path = Some(slices.clone());
    config.validate().unwrap();

    let api = client(&url, "secret");
    let reconciler = new_reconciler(&config, LocalPeer::new("haproxy-0", "10.0.0.1"), api);
    let (trigger, shutdown) = shutdown::channel();
    let (feed, events) = MembershipFeed::channel();

    let lister = FileLister::new(slices);
    let source_shutdown = shutdown.clone();
    let source = tokio::spawn(async move {
        poll_slices(&lister, feed, Duration::from_millis(20), source_shutdown).await;
    });
    let mut worker = Worker::new(reconciler, config.worker_settings(), shutdown);
    let worker = tokio::spawn(async move { worker.run(events).await });

    let converged = tokio::time::timeout(Duration::from_secs(5), async {
        while entry_names(&state, "haproxy-peers") != vec!["haproxy-1", "haproxy-2"] {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(converged.is_ok(), "peer section never converged");

    trigger.trigger();
    let stats = worker.await.unwrap();
    source.await.unwrap();
    assert!(stats.committed >= 1);
    assert_eq!(stats.failed, 0);
}
