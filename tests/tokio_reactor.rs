//! The client driven by tokio over real Unix socket pairs.

pub mod common;

use common::harness::init_tracing;
use pq_reactor::{
    fanout::fetch_in_slices,
    reactor::{tokio_loop::run_local, TokioReactor},
    testing::{MockServer, Response},
    Client, Command, ConnectParams, Error, EventLoop,
};
use std::{rc::Rc, time::Duration};

async fn connect(server: &Rc<MockServer>, params: ConnectParams) -> Client {
    Client::builder(TokioReactor::new(), server.connector())
        .params(params)
        .connect()
        .await
        .expect("connect over socket pair")
}

fn socket_server() -> Rc<MockServer> {
    init_tracing();
    let server = MockServer::new();
    server.use_socket_pairs(true);
    server
}

#[tokio::test]
async fn test_blocking_fallback_without_local_set() {
    init_tracing();
    let server = MockServer::new();
    let reactor = TokioReactor::new();
    assert!(!reactor.is_running());

    let connected = Client::builder(reactor, server.connector()).connect();
    let client = connected.result().expect("settled synchronously").unwrap();

    server.push_response(Response::rows("n", &["1"]));
    let result = client.exec("SELECT 1", vec![]).result().expect("settled synchronously");
    assert_eq!(result.unwrap().text(0, 0), Some("1"));
    assert!(!client.is_watching());

    assert!(client.reset().result().expect("settled synchronously").is_ok());
    assert_eq!(server.resets(), 1);
}

#[tokio::test]
async fn test_connect_and_query() {
    run_local(async {
        let server = socket_server();
        server.set_busy_rounds(4);
        server.push_response(Response::rows("greeting", &["hello"]));

        let client = connect(&server, ConnectParams::new()).await;
        assert!(client.reactor().is_running());

        let result = tokio::time::timeout(Duration::from_secs(5), client.exec("SELECT 'hello'", vec![]))
            .await
            .expect("query should complete")
            .unwrap();
        assert_eq!(result.text(0, 0), Some("hello"));
        assert!(!client.is_watching());
    })
    .await;
}

#[tokio::test]
async fn test_query_timeout_and_recovery() {
    run_local(async {
        let server = socket_server();
        let client = connect(&server, ConnectParams::new().with(":query_timeout", 0.05)).await;

        server.push_response(Response::Hang);
        let err = client.exec("SELECT pg_sleep(10)", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::QueryTimeout));
        assert!(client.is_command_aborted());
        assert_eq!(server.closed_sockets(), 1);

        server.push_response(Response::rows("n", &["1"]));
        let result = client.exec("SELECT 1", vec![]).await.unwrap();
        assert_eq!(result.text(0, 0), Some("1"));
        assert!(!client.is_command_aborted());
        assert_eq!(server.resets(), 1);
    })
    .await;
}

#[tokio::test]
async fn test_lost_connection_is_retried() {
    run_local(async {
        let server = socket_server();
        let client = connect(&server, ConnectParams::new()).await;

        server.push_response(Response::DropConnection);
        server.push_response(Response::rows("n", &["2"]));
        let result = client.exec("SELECT 2", vec![]).await.unwrap();
        assert_eq!(result.text(0, 0), Some("2"));
        assert_eq!(server.sent_count(), 2);
    })
    .await;
}

#[tokio::test]
async fn test_fanout_over_tokio() {
    run_local(async {
        let server = socket_server();
        server.set_busy_rounds(2);
        server.set_handler(|command| match command {
            Command::Exec { params, .. } => {
                let offset = params
                    .get(1)
                    .and_then(|p| p.as_ref())
                    .and_then(|p| std::str::from_utf8(p).ok())
                    .and_then(|p| p.parse::<usize>().ok())
                    .unwrap_or_default();
                Response::rows("offset", &[offset.to_string()])
            }
            _ => Response::tag("OK"),
        });

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(connect(&server, ConnectParams::new()).await);
        }
        let rows = fetch_in_slices(&clients, 50, |offset, limit| {
            Command::exec(
                "SELECT $2::int AS offset LIMIT $1",
                vec![
                    pq_reactor::driver::text_param(limit.to_string()),
                    pq_reactor::driver::text_param(offset.to_string()),
                ],
            )
        })
        .await
        .unwrap();

        let offsets: Vec<&[u8]> = rows.iter().filter_map(|r| r[0].as_deref()).collect();
        assert_eq!(offsets, vec![&b"0"[..], &b"10"[..], &b"20"[..], &b"30"[..], &b"40"[..]]);
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_clients_share_one_local_set() {
    run_local(async {
        let server = socket_server();
        server.set_busy_rounds(3);
        server.set_handler(|command| match command {
            Command::Exec { sql, .. } => Response::rows("sql", &[sql.as_str()]),
            _ => Response::tag("OK"),
        });

        let clients = futures::future::join_all((0..4).map(|_| connect(&server, ConnectParams::new()))).await;
        let results = futures::future::join_all(
            clients
                .iter()
                .enumerate()
                .map(|(index, client)| client.exec(format!("SELECT {index}"), vec![])),
        )
        .await;

        let answers: Vec<String> = results
            .into_iter()
            .map(|result| result.unwrap().text(0, 0).unwrap_or_default().to_string())
            .collect();
        assert_eq!(answers, vec!["SELECT 0", "SELECT 1", "SELECT 2", "SELECT 3"]);
        assert_eq!(server.connects(), 4);
    })
    .await;
}
