use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use chrono::{TimeZone, Utc};
use moto_counter::api::{ApiConfig, ApiServer};
use moto_counter::storage::{ResultStore, SqliteResultStore};
use moto_counter::{FrameResult, InferenceRun, RunId, RunKind};

fn get(addr: SocketAddr, path: &str) -> (u16, serde_json::Value) {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(stream, "GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();
    let (head, body) = raw.split_once("\r\n\r\n").unwrap();
    let status = head
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    (status, serde_json::from_str(body).unwrap())
}

fn seeded_store(dir: &std::path::Path) -> Arc<SqliteResultStore> {
    let store = SqliteResultStore::open(&dir.join("results.db").to_string_lossy()).unwrap();
    let at = |month, day, hour| Utc.with_ymd_and_hms(2024, month, day, hour, 5, 0).unwrap();
    let frames = vec![
        FrameResult { timestamp: at(6, 10, 9), count: 2 },
        FrameResult { timestamp: at(6, 2, 9), count: 1 },
        FrameResult { timestamp: at(6, 2, 17), count: 3 },
        FrameResult { timestamp: at(7, 1, 0), count: 0 },
    ];
    store
        .save_run(&InferenceRun::from_frames(RunId::generate(), RunKind::Video, frames, None))
        .unwrap();
    store
        .save_run(&InferenceRun::from_frames(
            RunId::generate(),
            RunKind::Image,
            vec![FrameResult { timestamp: at(8, 15, 12), count: 4 }],
            None,
        ))
        .unwrap();
    Arc::new(store)
}

#[test]
fn stats_are_served_over_http() {
    let dir = tempfile::tempdir().unwrap();
    let store = seeded_store(dir.path());
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        store,
    )
    .spawn()
    .unwrap();
    let addr = handle.addr;

    let (status, body) = get(addr, "/health");
    assert_eq!(status, 200);
    assert_eq!(body["status"], "ok");

    let (status, body) = get(addr, "/stats?granularity=day&month=2024-06");
    assert_eq!(status, 200);
    let buckets = body["buckets"].as_array().unwrap();
    assert_eq!(buckets.len(), 2);
    assert_eq!(buckets[0]["label"], "2024-06-02");
    assert_eq!(buckets[0]["total_count"], 4);
    assert_eq!(buckets[1]["label"], "2024-06-10");
    assert_eq!(body["summary"]["max"]["label"], "2024-06-02");

    // July only holds a zero count, so it has no bucket.
    let (_, body) = get(addr, "/stats?granularity=month&year=2024");
    let labels: Vec<_> = body["buckets"]
        .as_array()
        .unwrap()
        .iter()
        .map(|b| b["label"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(labels, vec!["2024-06", "2024-08"]);
    assert_eq!(body["summary"]["total"], 10);

    let (status, _) = get(addr, "/stats?granularity=fortnight");
    assert_eq!(status, 400);

    let (status, body) = get(addr, "/runs/recent?limit=1");
    assert_eq!(status, 200);
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);

    handle.stop().unwrap();
    assert!(TcpStream::connect(addr).is_err());
}
