//! Operator API tests over a real TCP listener.
//!
//! The router is served with [`api::serve`] on an ephemeral port and driven
//! with a plain HTTP/1 client, the way an operator script would use it.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use clubhouse_core::engine::ResetConfirmation;
use clubhouse_core::session::Ticket;
use clubhouse_daemon::api::{self, ApiState, ResetResponse, StatusResponse, TicketState};
use clubhouse_daemon::ledger::memory::MemoryLedger;
use common::{CONTRACT, Fixture, RefusingStore};
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio::task::JoinHandle;

struct Server {
    fx: Fixture,
    addr: SocketAddr,
    client: Client<HttpConnector, Full<Bytes>>,
    task: JoinHandle<std::io::Result<()>>,
}

impl Server {
    async fn start(fx: Fixture) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = api::router(ApiState {
            engine: Arc::clone(&fx.engine),
            daemon: Arc::clone(&fx.state),
            metrics: Arc::clone(&fx.metrics),
            contract_address: Arc::from(CONTRACT),
        });
        let task = tokio::spawn(api::serve(listener, router, Arc::clone(&fx.state)));
        let client = Client::builder(TokioExecutor::new()).build_http();
        Self {
            fx,
            addr,
            client,
            task,
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<String>) -> (StatusCode, Bytes) {
        let mut builder = Request::builder()
            .method(method)
            .uri(format!("http://{}{path}", self.addr));
        if body.is_some() {
            builder = builder.header("content-type", "application/json");
        }
        let request = builder
            .body(Full::new(Bytes::from(body.unwrap_or_default())))
            .unwrap();
        let response = self.client.request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, body)
    }

    async fn status(&self) -> StatusResponse {
        let (code, body) = self.request(Method::GET, "/status", None).await;
        assert_eq!(code, StatusCode::OK);
        serde_json::from_slice(&body).unwrap()
    }

    async fn allocate(&self) -> Ticket {
        let (code, body) = self.request(Method::POST, "/tickets", None).await;
        assert_eq!(code, StatusCode::CREATED);
        serde_json::from_slice(&body).unwrap()
    }

    async fn stop(mut self) {
        self.fx.stop().await;
        tokio::time::timeout(Duration::from_secs(2), self.task)
            .await
            .expect("server stops")
            .unwrap()
            .unwrap();
    }
}

#[tokio::test]
async fn index_lists_routes() {
    let server = Server::start(Fixture::new(MemoryLedger::new())).await;
    let (code, body) = server.request(Method::GET, "/", None).await;
    assert_eq!(code, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("/tickets"));
    assert!(text.contains("/session/reset"));
    server.stop().await;
}

#[tokio::test]
async fn allocation_is_sequential_and_listed() {
    let server = Server::start(Fixture::new(MemoryLedger::new())).await;
    let first = server.allocate().await;
    let second = server.allocate().await;
    assert_eq!((first.number, second.number), (1, 2));

    let status = server.status().await;
    assert_eq!(status.allocation_count, 2);
    assert_eq!(status.latest_ticket, Some(second.clone()));
    assert_eq!(status.contract_address, CONTRACT);
    assert_eq!(
        second.challenge,
        format!("Admit ticket 2 to event {}.", status.session_id)
    );
    assert!(
        status
            .tickets
            .iter()
            .all(|row| row.state == TicketState::Waiting)
    );
    server.stop().await;
}

#[tokio::test]
async fn ledger_approval_shows_in_status() {
    let mut fx = Fixture::new(MemoryLedger::at_height(4));
    fx.start(0);
    let server = Server::start(fx).await;

    server.fx.wait_for_subscription().await;
    let ticket = server.allocate().await;
    server.allocate().await;
    server.fx.grant(&ticket.challenge);
    server.fx.wait_for_approval(ticket.number).await;

    let status = server.status().await;
    assert!(status.connected);
    assert_eq!(status.approved, vec![1]);
    assert_eq!(status.tickets[0].state, TicketState::Approved);
    assert_eq!(status.tickets[1].state, TicketState::Waiting);
    assert!(status.head.is_some());
    server.stop().await;
}

#[tokio::test]
async fn allocation_failure_is_server_error() {
    let store = Arc::new(RefusingStore::default());
    let server = Server::start(Fixture::with_store(MemoryLedger::new(), store.clone())).await;
    server.allocate().await;

    store.refuse_writes(true);
    let (code, _) = server.request(Method::POST, "/tickets", None).await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);
    let status = server.status().await;
    assert_eq!(status.allocation_count, 1);
    assert_eq!(status.tickets.len(), 1);

    store.refuse_writes(false);
    assert_eq!(server.allocate().await.number, 2);
    server.stop().await;
}

#[tokio::test]
async fn reset_failure_keeps_current_session() {
    let store = Arc::new(RefusingStore::default());
    let server = Server::start(Fixture::with_store(MemoryLedger::new(), store.clone())).await;
    server.allocate().await;
    let before = server.status().await;

    store.refuse_writes(true);
    let confirm = serde_json::to_string(&ResetConfirmation {
        confirm_session_id: before.session_id.clone(),
    })
    .unwrap();
    let (code, _) = server
        .request(Method::POST, "/session/reset", Some(confirm))
        .await;
    assert_eq!(code, StatusCode::INTERNAL_SERVER_ERROR);

    let after = server.status().await;
    assert_eq!(after.session_id, before.session_id);
    assert_eq!(after.allocation_count, 1);
    server.stop().await;
}

#[tokio::test]
async fn reset_requires_current_session() {
    let server = Server::start(Fixture::new(MemoryLedger::new())).await;
    server.allocate().await;
    let before = server.status().await;

    let stale = serde_json::to_string(&ResetConfirmation {
        confirm_session_id: "0000".to_string(),
    })
    .unwrap();
    let (code, _) = server
        .request(Method::POST, "/session/reset", Some(stale))
        .await;
    assert_eq!(code, StatusCode::CONFLICT);
    assert_eq!(server.status().await.session_id, before.session_id);

    let confirm = serde_json::to_string(&ResetConfirmation {
        confirm_session_id: before.session_id.clone(),
    })
    .unwrap();
    let (code, body) = server
        .request(Method::POST, "/session/reset", Some(confirm))
        .await;
    assert_eq!(code, StatusCode::OK);
    let reset: ResetResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(reset.previous_session_id, before.session_id);

    let after = server.status().await;
    assert_eq!(after.session_id, reset.session_id);
    assert_eq!(after.allocation_count, 0);
    assert!(after.tickets.is_empty());
    assert_eq!(server.allocate().await.number, 1);
    server.stop().await;
}

#[tokio::test]
async fn metrics_endpoint_reports_counters() {
    let server = Server::start(Fixture::new(MemoryLedger::new())).await;
    server.allocate().await;

    let (code, body) = server.request(Method::GET, "/metrics", None).await;
    assert_eq!(code, StatusCode::OK);
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("clubhouse_tickets_allocated_total 1"));
    server.stop().await;
}
