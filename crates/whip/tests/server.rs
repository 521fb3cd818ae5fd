//! Black-box tests of one node speaking the client protocol over TCP.

mod support;

use support::*;

const ASSET_ID: &str = "0123456789abcdef0123456789abcdef";

#[tokio::test]
async fn auth_success_then_test_misses() {
    let node = TestNode::start().await;

    // The handshake is exercised inside Client::connect: 8-byte challenge,
    // 41-byte response, 2-byte success status.
    let mut client = Client::connect(node.client_addr).await;

    let response = client.request(RT_TEST, NULL_UUID, b"").await;
    assert_eq!(response.code, RC_NOT_FOUND);
    assert_eq!(response.uuid, NULL_UUID);
    assert!(response.payload.is_empty());

    node.stop().await;
}

#[tokio::test]
async fn auth_failure_disconnects() {
    let node = TestNode::start().await;

    let mut client = Client::connect_with(node.client_addr, "wrong-password", 0).await;
    assert_eq!(client.read_auth_status().await, [1, 1]);
    assert!(client.is_disconnected().await);

    node.stop().await;
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let asset = asset_bytes(ASSET_ID, 1, false, &[0xAA; 66]);
    assert_eq!(asset.len(), 100);

    let response = client.request(RT_PUT, ASSET_ID, &asset).await;
    assert_eq!(response.code, RC_OK);
    assert_eq!(response.uuid, ASSET_ID);
    assert!(response.payload.is_empty());

    let response = client.request(RT_GET, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_FOUND);
    assert_eq!(response.uuid, ASSET_ID);
    assert_eq!(response.payload, asset);

    // TEST now sees the asset as well.
    let response = client.request(RT_TEST, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_FOUND);

    // And GET_NOCACHE returns the same bytes.
    let response = client.request(RT_GET_NOCACHE, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_FOUND);
    assert_eq!(response.payload, asset);

    node.stop().await;
}

#[tokio::test]
async fn stored_asset_lands_in_shard_files() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let asset = asset_bytes(ASSET_ID, 1, false, &[0xAA; 66]);
    let response = client.request(RT_PUT, ASSET_ID, &asset).await;
    assert_eq!(response.code, RC_OK);

    let data_path = node.shard_path("012").join("globals.data");
    let raw = std::fs::read(&data_path).expect("shard data file");
    assert_eq!(&raw[..8], b"IWZDDB01");
    assert_eq!(&raw[8..12], &[0x00, 0x00, 0x00, 0x64]);
    assert_eq!(&raw[12..], &asset[..]);

    let index = rusqlite::Connection::open(node.shard_path("012").join("globals.idx")).unwrap();
    let (position, kind, deleted): (i64, i64, i64) = index
        .query_row(
            "SELECT position, type, deleted FROM VFSDataIndex WHERE asset_id = ?1",
            [ASSET_ID],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .expect("index row");
    assert_eq!(position, 8);
    assert_eq!(kind, 1);
    assert_eq!(deleted, 0);

    node.stop().await;
}

#[tokio::test]
async fn duplicate_put_reports_error_and_leaves_disk_alone() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let asset = asset_bytes(ASSET_ID, 1, false, &[0xAA; 66]);
    assert_eq!(client.request(RT_PUT, ASSET_ID, &asset).await.code, RC_OK);

    let data_path = node.shard_path("012").join("globals.data");
    let len_before = std::fs::metadata(&data_path).unwrap().len();

    let response = client.request(RT_PUT, ASSET_ID, &asset).await;
    assert_eq!(response.code, RC_ERROR);
    assert!(!response.payload.is_empty(), "error carries a message");

    assert_eq!(std::fs::metadata(&data_path).unwrap().len(), len_before);

    // The connection survives a duplicate store.
    let response = client.request(RT_GET, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_FOUND);

    node.stop().await;
}

#[tokio::test]
async fn put_with_mismatched_embedded_id_reports_error() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let other = "ffffffffffffffffffffffffffffffff";
    let asset = asset_bytes(other, 1, false, b"payload");
    let response = client.request(RT_PUT, ASSET_ID, &asset).await;
    assert_eq!(response.code, RC_ERROR);

    // Neither id is now stored.
    assert_eq!(client.request(RT_TEST, ASSET_ID, b"").await.code, RC_NOT_FOUND);
    assert_eq!(client.request(RT_TEST, other, b"").await.code, RC_NOT_FOUND);

    node.stop().await;
}

#[tokio::test]
async fn purge_acknowledges_and_keeps_the_asset() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let asset = asset_bytes(ASSET_ID, 1, false, b"sticky");
    assert_eq!(client.request(RT_PUT, ASSET_ID, &asset).await.code, RC_OK);

    let response = client.request(RT_PURGE, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_OK);

    assert_eq!(client.request(RT_GET, ASSET_ID, b"").await.code, RC_FOUND);

    node.stop().await;
}

#[tokio::test]
async fn purge_locals_drops_locals_and_keeps_globals() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    // Prefix 000 is the first shard the purge sweep visits.
    let local_id = "000aaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    let global_id = "000bbbbbbbbbbbbbbbbbbbbbbbbbbbbb";
    let local = asset_bytes(local_id, 1, true, b"node private");
    let global = asset_bytes(global_id, 1, false, b"replicated");
    assert_eq!(client.request(RT_PUT, local_id, &local).await.code, RC_OK);
    assert_eq!(client.request(RT_PUT, global_id, &global).await.code, RC_OK);

    let response = client.request(RT_PURGE_LOCALS, NULL_UUID, b"").await;
    assert_eq!(response.code, RC_OK);

    // The purge runs in the background, one shard per second; shard 000 is
    // processed almost immediately.
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
    loop {
        let test = client.request(RT_TEST, local_id, b"").await;
        if test.code == RC_NOT_FOUND {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "local asset not purged in time"
        );
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    }

    assert_eq!(client.request(RT_TEST, global_id, b"").await.code, RC_FOUND);
    assert!(!node.shard_path("000").join("locals.idx").exists());
    assert!(!node.shard_path("000").join("locals.data").exists());
    assert!(node.shard_path("000").join("globals.data").exists());

    node.stop().await;
}

#[tokio::test]
async fn status_report_covers_all_sections() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let response = client.request(RT_STATUS_GET, NULL_UUID, b"").await;
    assert_eq!(response.code, RC_OK);
    assert_eq!(response.uuid, NULL_UUID);

    let report = String::from_utf8(response.payload).expect("status is text");
    for section in [
        "WHIP Server Status",
        "-General",
        "Clients Connected: 1",
        "-Asset Cache",
        "-VFS Backend",
        "-Mesh Backend",
        "-Intramesh Service",
    ] {
        assert!(report.contains(section), "missing section {section:?}:\n{report}");
    }

    node.stop().await;
}

#[tokio::test]
async fn stored_ids_lists_the_requested_shard() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    let id_a = "abc00000000000000000000000000001";
    let id_b = "abc00000000000000000000000000002";
    let elsewhere = "def00000000000000000000000000003";
    for id in [id_a, id_b, elsewhere] {
        let asset = asset_bytes(id, 1, false, b"x");
        assert_eq!(client.request(RT_PUT, id, &asset).await.code, RC_OK);
    }

    // The shard is addressed by the first three characters of the id field.
    let response = client
        .request(RT_STORED_IDS_GET, "abc00000000000000000000000000000", b"")
        .await;
    assert_eq!(response.code, RC_OK);
    let listing = String::from_utf8(response.payload).unwrap();
    let ids: Vec<&str> = listing.split(',').filter(|s| !s.is_empty()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&id_a));
    assert!(ids.contains(&id_b));
    assert!(!ids.contains(&elsewhere));

    node.stop().await;
}

#[tokio::test]
async fn invalid_uuid_disconnects() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    client
        .send_request(RT_GET, "0123456789ABCDEF0123456789ABCDEF", b"")
        .await;
    assert!(client.is_disconnected().await);

    node.stop().await;
}

#[tokio::test]
async fn unknown_request_type_disconnects() {
    let node = TestNode::start().await;
    let mut client = Client::connect(node.client_addr).await;

    client.send_request(99, NULL_UUID, b"").await;
    assert!(client.is_disconnected().await);

    node.stop().await;
}

#[tokio::test]
async fn assets_survive_restart() {
    let root = {
        let node = TestNode::start().await;
        let mut client = Client::connect(node.client_addr).await;
        let asset = asset_bytes(ASSET_ID, 1, false, b"durable");
        assert_eq!(client.request(RT_PUT, ASSET_ID, &asset).await.code, RC_OK);
        node.stop().await
    };

    // A fresh node over the same storage root rebuilds its existence index
    // from the shard indexes.
    let config = whip::Config::parse(&format!(
        "port = 0\nintramesh_port = 0\npassword = {PASSWORD}\n\
         disk_storage_backend = vfs\ndisk_storage_root = {}\n",
        root.path().display()
    ))
    .unwrap();
    let cancel = tokio_util::sync::CancellationToken::new();
    let server = whip::AssetServer::bind(config, None, cancel.clone())
        .await
        .unwrap();
    let addr = server.client_addr();
    let task = tokio::spawn(server.serve());

    let mut client = Client::connect(addr).await;
    let response = client.request(RT_GET, ASSET_ID, b"").await;
    assert_eq!(response.code, RC_FOUND);
    assert_eq!(&response.payload[34..], b"durable");

    cancel.cancel();
    let _ = task.await;
}
