//! Scenario D: the per-connection session cap is reached. A third
//! concurrent BEGIN_REQUEST on a connection already holding two open
//! (never-finished) sessions must be rejected with
//! END_REQUEST(OVERLOADED) without disturbing the two still in flight.

mod common;

use common::*;
use fastcgi_server::{Application, EngineBuilder, Outcome, Request};
use futures_util::future::BoxFuture;
use tokio::io::duplex;

struct NeverCalled;

impl Application for NeverCalled {
    fn serve<'a>(&'a self, _request: &'a mut Request) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { panic!("capped-out session must never dispatch") })
    }
}

#[tokio::test]
async fn third_concurrent_session_is_overloaded() {
    let (client, server) = duplex(8192);

    let engine = EngineBuilder::new()
        .responder(NeverCalled)
        .max_sessions_per_connection(2)
        .build()
        .unwrap();
    let serve = tokio::spawn(async move {
        engine.serve(OnceTransport::new(server)).await.unwrap();
    });

    let mut client = client;

    // Two sessions opened and left with PARAMS unfinished, each holding
    // a reserved slot.
    let mut out = Vec::new();
    begin_request(&mut out, 1, ROLE_RESPONDER, true);
    begin_request(&mut out, 2, ROLE_RESPONDER, true);
    send(&mut client, &out).await;

    // A third BEGIN_REQUEST must be rejected immediately.
    let mut out = Vec::new();
    begin_request(&mut out, 3, ROLE_RESPONDER, false);
    send(&mut client, &out).await;

    let (stdout, stderr, app_status, proto_status) = read_until_end_request(&mut client, 3).await;
    assert!(stdout.is_empty());
    assert!(stderr.is_empty());
    assert_eq!(app_status, -1);
    assert_eq!(proto_status, PROTO_OVERLOADED);

    drop(client);
    serve.await.unwrap();
}
