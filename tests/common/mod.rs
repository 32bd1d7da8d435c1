#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Config, NoTls, Notification};
use ulid::Ulid;

use lineup::tenant::TenantManager;
use lineup::wire;

pub const PASSWORD: &str = "lineup";

pub async fn start_test_server() -> (SocketAddr, Arc<TenantManager>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("lineup_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    let tm2 = tm.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, PASSWORD.to_string()).await;
            });
        }
    });

    (addr, tm)
}

pub async fn connect(
    addr: SocketAddr,
) -> (
    tokio_postgres::Client,
    mpsc::UnboundedReceiver<Notification>,
) {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("lineup")
        .password(PASSWORD);

    let (client, mut connection) = config.connect(NoTls).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let stream = stream::poll_fn(move |cx| connection.poll_message(cx));
        futures::pin_mut!(stream);
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(AsyncMessage::Notification(n)) => {
                    let _ = tx.send(n);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    });

    (client, rx)
}

/// Wait for a notification with timeout.
pub async fn recv_notification(
    rx: &mut mpsc::UnboundedReceiver<Notification>,
    timeout: Duration,
) -> Option<Notification> {
    tokio::time::timeout(timeout, rx.recv()).await.ok().flatten()
}

/// Register a fresh stage in the directory and return its id.
pub async fn add_stage(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO stages (id, name) VALUES ('{id}', '{name}')"))
        .await
        .unwrap();
    id
}

/// Register a fresh talent in the directory and return its id.
pub async fn add_talent(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO talents (id, name) VALUES ('{id}', '{name}')"))
        .await
        .unwrap();
    id
}

/// Book `name` on `stage` for `[start, end)` given as RFC 3339 strings.
pub async fn book(
    client: &tokio_postgres::Client,
    name: &str,
    stage: Ulid,
    start: &str,
    end: &str,
) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            r#"INSERT INTO events (name, stage_id, start, "end") VALUES ('{name}', '{stage}', '{start}', '{end}')"#
        ))
        .await
}
