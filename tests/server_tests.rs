//! End-to-end tests over a real TCP server and framed JSON clients.

use std::net::SocketAddr;
use std::time::Duration;

use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use basalt::ccm::ProtocolKind;
use basalt::{Config, Server};

async fn start_server(protocol: ProtocolKind) -> (SocketAddr, TempDir) {
    let dir = tempdir().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        protocol,
        ..Config::default()
    };
    let server = Server::new(config).unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = server.serve_on(listener).await;
    });
    (addr, dir)
}

struct Client {
    stream: TcpStream,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        stream.set_nodelay(true).unwrap();
        Self { stream }
    }

    async fn send(&mut self, request: Value) {
        let body = serde_json::to_vec(&request).unwrap();
        self.stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .unwrap();
        self.stream.write_all(&body).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut header = [0u8; 4];
        self.stream.read_exact(&mut header).await.unwrap();
        let len = u32::from_be_bytes(header) as usize;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn request(&mut self, request: Value) -> Value {
        self.send(request).await;
        self.recv().await
    }

    async fn begin(&mut self) -> u64 {
        let response = self.request(json!({"type": "begin"})).await;
        assert_eq!(response["success"], json!(true));
        response["transaction_id"].as_u64().unwrap()
    }

    async fn execute(&mut self, sql: &str) -> Value {
        self.request(json!({"type": "execute", "query": sql})).await
    }

    async fn execute_in(&mut self, sql: &str, txid: u64) -> Value {
        self.request(json!({"type": "execute", "query": sql, "transaction_id": txid}))
            .await
    }

    async fn commit(&mut self, txid: u64) -> Value {
        self.request(json!({"type": "commit", "transaction_id": txid}))
            .await
    }

    async fn rollback(&mut self, txid: u64) -> Value {
        self.request(json!({"type": "rollback", "transaction_id": txid}))
            .await
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_basic_commit_round_trip() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut client = Client::connect(addr).await;

    let txid = client.begin().await;
    let response = client
        .execute_in("CREATE TABLE users (id INT, name VARCHAR(50))", txid)
        .await;
    assert_eq!(response["success"], json!(true));
    let response = client
        .execute_in("INSERT INTO users VALUES (1, 'Alice')", txid)
        .await;
    assert_eq!(response["success"], json!(true));
    assert_eq!(response["affected_rows"], json!(1));

    assert_eq!(client.commit(txid).await["success"], json!(true));

    // A fresh transaction on a fresh connection sees the committed row.
    let mut other = Client::connect(addr).await;
    let response = other.execute("SELECT * FROM users").await;
    assert_eq!(response["success"], json!(true));
    assert_eq!(
        response["rows"],
        json!({"columns": ["id", "name"], "data": [[1, "Alice"]]})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_die_older_waits_and_gets_follow_up() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut setup = Client::connect(addr).await;
    setup
        .execute("CREATE TABLE products (id INT, price INT)")
        .await;
    setup.execute("INSERT INTO products VALUES (1, 1000)").await;

    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;
    let ta = a.begin().await; // older
    let tb = b.begin().await; // younger
    assert!(ta < tb);

    // Younger takes the write lock first.
    let response = b
        .execute_in("UPDATE products SET price = 1200 WHERE id = 1", tb)
        .await;
    assert_eq!(response["success"], json!(true));

    // Older conflicts and is queued immediately.
    let response = a
        .execute_in("UPDATE products SET price = 1500 WHERE id = 1", ta)
        .await;
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["queued_for_retry"], json!(true));

    // The commit releases the lock and the follow-up response arrives.
    assert_eq!(b.commit(tb).await["success"], json!(true));
    let follow_up = timeout(Duration::from_secs(5), a.recv()).await.unwrap();
    assert_eq!(follow_up["success"], json!(true));
    assert_eq!(follow_up["retried"], json!(true));
    assert_eq!(follow_up["affected_rows"], json!(1));
    assert_eq!(follow_up["original_transaction_id"], json!(ta));

    assert_eq!(a.commit(ta).await["success"], json!(true));
    let rows = a.execute("SELECT price FROM products").await;
    assert_eq!(rows["rows"]["data"], json!([[1500]]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_die_younger_dies() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut setup = Client::connect(addr).await;
    setup.execute("CREATE TABLE t (id INT, x INT)").await;
    setup.execute("INSERT INTO t VALUES (1, 0)").await;

    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;
    let ta = a.begin().await; // older
    let tb = b.begin().await; // younger

    let response = a.execute_in("UPDATE t SET x = 1 WHERE id = 1", ta).await;
    assert_eq!(response["success"], json!(true));

    // Younger requester dies immediately.
    let response = b.execute_in("UPDATE t SET x = 2 WHERE id = 1", tb).await;
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error"], json!("wait-die: die"));

    // The victim's id rejects further statements until rollback.
    let response = b.execute_in("UPDATE t SET x = 3 WHERE id = 1", tb).await;
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error"], json!("not active"));

    assert_eq!(b.rollback(tb).await["success"], json!(true));
    assert_eq!(a.commit(ta).await["success"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_double_commit_is_rejected() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut client = Client::connect(addr).await;

    let txid = client.begin().await;
    client.execute_in("CREATE TABLE t (v INT)", txid).await;

    assert_eq!(client.commit(txid).await["success"], json!(true));
    let second = client.commit(txid).await;
    assert_eq!(second["success"], json!(false));
    assert_eq!(second["error"], json!("transaction not found or not active"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rollback_drains_pending_retry() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut setup = Client::connect(addr).await;
    setup.execute("CREATE TABLE t (v INT)").await;
    setup.execute("INSERT INTO t VALUES (1)").await;

    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;
    let ta = a.begin().await;
    let tb = b.begin().await;

    assert_eq!(
        b.execute_in("UPDATE t SET v = 2", tb).await["success"],
        json!(true)
    );
    let queued = a.execute_in("UPDATE t SET v = 3", ta).await;
    assert_eq!(queued["queued_for_retry"], json!(true));

    // Rolling back the waiting transaction wakes its parked retry, which
    // resolves against the now-dead transaction. The rollback reply and the
    // retry follow-up may arrive in either order.
    a.send(json!({"type": "rollback", "transaction_id": ta})).await;
    let first = timeout(Duration::from_secs(5), a.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(5), a.recv()).await.unwrap();
    let (rollback_reply, follow_up) = if first["retried"] == json!(true) {
        (second, first)
    } else {
        (first, second)
    };
    assert_eq!(rollback_reply["success"], json!(true));
    assert_eq!(follow_up["retried"], json!(true));
    assert_eq!(follow_up["success"], json!(false));

    assert_eq!(b.commit(tb).await["success"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timestamp_read_of_newer_write_fails() {
    let (addr, _dir) = start_server(ProtocolKind::Timestamp).await;
    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;

    let ta = a.begin().await; // older timestamp
    let tb = b.begin().await;

    assert_eq!(
        b.execute_in("CREATE TABLE x (id INT)", tb).await["success"],
        json!(true)
    );
    assert_eq!(
        b.execute_in("INSERT INTO x VALUES (1)", tb).await["success"],
        json!(true)
    );

    // B is still active; A's read is already doomed by the newer write.
    let response = a.execute_in("SELECT * FROM x", ta).await;
    assert_eq!(response["success"], json!(false));
    assert_eq!(response["error"], json!("timestamp too old"));

    // A is FAILED and must roll back.
    let response = a.execute_in("SELECT * FROM x", ta).await;
    assert_eq!(response["error"], json!("not active"));
    assert_eq!(a.rollback(ta).await["success"], json!(true));
    assert_eq!(b.commit(tb).await["success"], json!(true));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_occ_validation_loss() {
    let (addr, _dir) = start_server(ProtocolKind::Validation).await;
    let mut setup = Client::connect(addr).await;
    setup.execute("CREATE TABLE t (v INT)").await;

    let mut a = Client::connect(addr).await;
    let mut b = Client::connect(addr).await;
    let ta = a.begin().await;
    let tb = b.begin().await;

    assert_eq!(
        a.execute_in("INSERT INTO t VALUES (1)", ta).await["success"],
        json!(true)
    );
    assert_eq!(
        b.execute_in("INSERT INTO t VALUES (2)", tb).await["success"],
        json!(true)
    );

    assert_eq!(b.commit(tb).await["success"], json!(true));
    let lost = a.commit(ta).await;
    assert_eq!(lost["success"], json!(false));
    assert_eq!(lost["error"], json!("validation failure"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_analyze_and_defragment_requests() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut client = Client::connect(addr).await;
    client.execute("CREATE TABLE t (v INT)").await;
    client.execute("INSERT INTO t VALUES (1)").await;
    client.execute("INSERT INTO t VALUES (2)").await;
    client.execute("DELETE FROM t WHERE v = 1").await;

    let response = client
        .request(json!({"type": "analyze", "table_name": "t"}))
        .await;
    assert_eq!(response["success"], json!(true));

    let response = client
        .request(json!({"type": "defragment", "table_name": "t"}))
        .await;
    assert_eq!(response["success"], json!(true));

    let rows = client.execute("SELECT * FROM t").await;
    assert_eq!(rows["rows"]["data"], json!([[2]]));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_request_type_closes_connection() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut client = Client::connect(addr).await;

    let response = client.request(json!({"type": "mystery"})).await;
    assert_eq!(response["success"], json!(false));

    // The server closed the connection after the protocol error.
    let mut header = [0u8; 4];
    let read = client.stream.read(&mut header).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_select_with_order_join_and_aliases() {
    let (addr, _dir) = start_server(ProtocolKind::LockBased).await;
    let mut client = Client::connect(addr).await;
    client
        .execute("CREATE TABLE users (id INT, name VARCHAR(20))")
        .await;
    client
        .execute("CREATE TABLE orders (user_id INT, total INT)")
        .await;
    client.execute("INSERT INTO users VALUES (1, 'Alice')").await;
    client.execute("INSERT INTO users VALUES (2, 'Bob')").await;
    client.execute("INSERT INTO orders VALUES (2, 70)").await;
    client.execute("INSERT INTO orders VALUES (1, 50)").await;
    client.execute("INSERT INTO orders VALUES (2, 30)").await;

    let response = client
        .execute(
            "SELECT users.name AS who, orders.total FROM users \
             JOIN orders ON users.id = orders.user_id \
             ORDER BY orders.total DESC LIMIT 2",
        )
        .await;
    assert_eq!(response["success"], json!(true));
    assert_eq!(
        response["rows"],
        json!({
            "columns": ["who", "orders.total"],
            "data": [["Bob", 70], ["Alice", 50]]
        })
    );
}
