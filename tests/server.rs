//! End-to-end tests driving a real server over loopback TCP.

use kvd::protocol::{self, MAX_KEY_LENGTH};
use kvd::thread_pool::{SharedQueueThreadPool, ThreadPool};
use kvd::{
    ErrorCode, KvdClient, KvdError, KvdServer, MappedStore, Operation, Request, Response, Stats,
};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

struct TestServer {
    addr: SocketAddr,
    stats: Arc<Stats>,
    storage: std::path::PathBuf,
    // keeps the storage directory alive for the duration of the test
    _dir: TempDir,
}

/// starts a server with a fresh store on an ephemeral port
fn start_server() -> TestServer {
    let dir = TempDir::new().unwrap();
    let storage = dir.path().join("storage.bin");
    let engine = MappedStore::open(&storage).unwrap();
    let pool = SharedQueueThreadPool::new(8).unwrap();
    let server = KvdServer::new(engine, pool).unwrap();
    let stats = server.stats();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let _ = server.serve(listener);
    });

    TestServer {
        addr,
        stats,
        storage,
        _dir: dir,
    }
}

fn request(operation: Operation, key: &str, value: &str) -> Request {
    Request {
        operation,
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn response(operation: Operation, error: ErrorCode, value: &str) -> Response {
    Response {
        operation,
        error,
        value: value.to_string(),
    }
}

#[test]
fn insert_then_get_returns_the_inserted_value() {
    let server = start_server();
    let mut client = KvdClient::new();

    let resp = client
        .send(server.addr, &request(Operation::Insert, "a", "1"))
        .unwrap();
    assert_eq!(resp, response(Operation::Insert, ErrorCode::None, ""));

    let resp = client
        .send(server.addr, &request(Operation::Get, "a", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "1"));
}

#[test]
fn duplicate_insert_is_refused() {
    let server = start_server();
    let mut client = KvdClient::new();

    client
        .send(server.addr, &request(Operation::Insert, "a", "1"))
        .unwrap();
    let resp = client
        .send(server.addr, &request(Operation::Insert, "a", "2"))
        .unwrap();
    assert_eq!(
        resp,
        response(Operation::Insert, ErrorCode::InsertKeyAlreadyExists, "")
    );

    // the store kept the original value
    let resp = client
        .send(server.addr, &request(Operation::Get, "a", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "1"));
}

#[test]
fn update_of_a_missing_key_is_refused() {
    let server = start_server();
    let mut client = KvdClient::new();

    let resp = client
        .send(server.addr, &request(Operation::Update, "x", "v"))
        .unwrap();
    assert_eq!(
        resp,
        response(Operation::Update, ErrorCode::UpdateKeyNotFound, "")
    );
}

#[test]
fn update_semantics_end_to_end() {
    let server = start_server();
    let mut client = KvdClient::new();

    client
        .send(server.addr, &request(Operation::Insert, "k", "v"))
        .unwrap();

    let resp = client
        .send(server.addr, &request(Operation::Update, "k", "v"))
        .unwrap();
    assert_eq!(
        resp,
        response(Operation::Update, ErrorCode::UpdateValueAlreadyExists, "")
    );

    let resp = client
        .send(server.addr, &request(Operation::Update, "k", "w"))
        .unwrap();
    assert_eq!(resp, response(Operation::Update, ErrorCode::None, ""));

    let resp = client
        .send(server.addr, &request(Operation::Get, "k", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "w"));

    // the same-value update counted as failed
    assert_eq!(server.stats.operation_counts(Operation::Update), (1, 1));
}

#[test]
fn delete_of_a_missing_key_is_refused() {
    let server = start_server();
    let mut client = KvdClient::new();

    let resp = client
        .send(server.addr, &request(Operation::Delete, "m", ""))
        .unwrap();
    assert_eq!(
        resp,
        response(Operation::Delete, ErrorCode::DeleteKeyNotFound, "")
    );
}

#[test]
fn delete_then_get_reports_not_found() {
    let server = start_server();
    let mut client = KvdClient::new();

    client
        .send(server.addr, &request(Operation::Insert, "a", "1"))
        .unwrap();
    let resp = client
        .send(server.addr, &request(Operation::Delete, "a", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Delete, ErrorCode::None, ""));

    let resp = client
        .send(server.addr, &request(Operation::Get, "a", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::GetKeyNotFound, ""));
}

#[test]
fn oversize_key_never_reaches_the_server() {
    let server = start_server();
    let mut client = KvdClient::new();

    let req = request(Operation::Insert, &"k".repeat(MAX_KEY_LENGTH + 1), "v");
    assert!(matches!(
        client.send(server.addr, &req),
        Err(KvdError::InvalidKeyLength(_))
    ));

    // no request was processed server-side
    assert_eq!(server.stats.operation_counts(Operation::Insert), (0, 0));
}

#[test]
fn frames_survive_the_loopback_byte_exact() {
    let server = start_server();

    // drive the wire by hand instead of through KvdClient
    let mut stream = TcpStream::connect(server.addr).unwrap();
    let payload = request(Operation::Insert, "raw", "frame").encode().unwrap();
    protocol::write_frame(&mut stream, &payload).unwrap();

    let answer = protocol::read_frame(&mut stream).unwrap().unwrap();
    let resp = Response::decode(&answer).unwrap();
    assert_eq!(resp, response(Operation::Insert, ErrorCode::None, ""));

    let mut client = KvdClient::new();
    let resp = client
        .send(server.addr, &request(Operation::Get, "raw", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "frame"));
}

#[test]
fn an_unknown_operation_tag_closes_the_connection() {
    let server = start_server();

    let mut stream = TcpStream::connect(server.addr).unwrap();
    let mut payload = request(Operation::Insert, "k", "v").encode().unwrap();
    payload[0] = 0x7f;
    protocol::write_frame(&mut stream, &payload).unwrap();

    // the server abandons the session without answering
    assert_eq!(protocol::read_frame(&mut stream).unwrap(), None);

    // and keeps serving new connections
    let mut client = KvdClient::new();
    let resp = client
        .send(server.addr, &request(Operation::Insert, "k", "v"))
        .unwrap();
    assert_eq!(resp, response(Operation::Insert, ErrorCode::None, ""));
}

#[test]
fn concurrent_readers_see_a_current_value_during_updates() {
    let server = start_server();

    let mut seed = KvdClient::new();
    seed.send(server.addr, &request(Operation::Insert, "hot", "v0"))
        .unwrap();
    // free the seeding connection's worker before fanning out
    drop(seed);

    let writer = {
        let addr = server.addr;
        thread::spawn(move || {
            let mut client = KvdClient::new();
            for i in 1..=50 {
                client
                    .send(addr, &request(Operation::Update, "hot", &format!("v{}", i)))
                    .unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let addr = server.addr;
            thread::spawn(move || {
                let mut client = KvdClient::new();
                for _ in 0..25 {
                    let resp = client
                        .send(addr, &request(Operation::Get, "hot", ""))
                        .unwrap();
                    assert_eq!(resp.error, ErrorCode::None);
                    assert!(resp.value.starts_with('v'), "got {:?}", resp.value);
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let mut client = KvdClient::new();
    let resp = client
        .send(server.addr, &request(Operation::Get, "hot", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "v50"));
}

#[test]
fn stats_totals_converge_to_the_store_size() {
    let server = start_server();
    let mut client = KvdClient::new();

    for i in 0..8 {
        client
            .send(
                server.addr,
                &request(Operation::Insert, &format!("key-{}", i), "v"),
            )
            .unwrap();
    }
    for i in 0..3 {
        client
            .send(server.addr, &request(Operation::Delete, &format!("key-{}", i), ""))
            .unwrap();
    }
    // a few failures, which must not move the item total
    client
        .send(server.addr, &request(Operation::Insert, "key-7", "v"))
        .unwrap();
    client
        .send(server.addr, &request(Operation::Delete, "gone", ""))
        .unwrap();

    assert_eq!(server.stats.total_items(), 5);
    assert_eq!(server.stats.operation_counts(Operation::Insert), (8, 1));
    assert_eq!(server.stats.operation_counts(Operation::Delete), (3, 1));

    // the counter bank agrees with the store itself
    use kvd::StorageEngine;
    let store = MappedStore::open(&server.storage).unwrap();
    assert_eq!(store.size().unwrap(), 5);
}

#[test]
fn one_connection_serves_many_requests_in_order() {
    let server = start_server();
    let mut client = KvdClient::new();

    for i in 0..20 {
        let key = format!("seq-{}", i);
        let resp = client
            .send(server.addr, &request(Operation::Insert, &key, &i.to_string()))
            .unwrap();
        assert_eq!(resp.error, ErrorCode::None);
    }
    for i in 0..20 {
        let key = format!("seq-{}", i);
        let resp = client
            .send(server.addr, &request(Operation::Get, &key, ""))
            .unwrap();
        assert_eq!(resp, response(Operation::Get, ErrorCode::None, &i.to_string()));
    }
}

#[test]
fn a_value_survives_a_client_reconnect() {
    let server = start_server();

    {
        let mut client = KvdClient::new();
        client
            .send(server.addr, &request(Operation::Insert, "persist", "me"))
            .unwrap();
    }

    // brief pause so the first session can wind down
    thread::sleep(Duration::from_millis(50));

    let mut client = KvdClient::new();
    let resp = client
        .send(server.addr, &request(Operation::Get, "persist", ""))
        .unwrap();
    assert_eq!(resp, response(Operation::Get, ErrorCode::None, "me"));
}
