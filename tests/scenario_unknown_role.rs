//! Scenario C: BEGIN_REQUEST names a role with no registered
//! application (here, a role value the protocol does not even define).
//! The engine must answer with END_REQUEST(UNKNOWN_ROLE) and never
//! dispatch an application task.

mod common;

use common::*;
use fastcgi_server::{Application, EngineBuilder, Outcome, Request};
use futures_util::future::BoxFuture;
use tokio::io::duplex;

struct NeverCalled;

impl Application for NeverCalled {
    fn serve<'a>(&'a self, _request: &'a mut Request) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { panic!("unknown-role session must never dispatch") })
    }
}

#[tokio::test]
async fn unknown_role_short_circuits_before_dispatch() {
    let (client, server) = duplex(8192);

    let engine = EngineBuilder::new().responder(NeverCalled).build().unwrap();
    let serve = tokio::spawn(async move {
        engine.serve(OnceTransport::new(server)).await.unwrap();
    });

    let mut client = client;
    let mut out = Vec::new();
    begin_request(&mut out, 1, 99, false);
    send(&mut client, &out).await;

    let (stdout, stderr, app_status, proto_status) = read_until_end_request(&mut client, 1).await;
    assert!(stdout.is_empty());
    assert!(stderr.is_empty());
    assert_eq!(app_status, 0);
    assert_eq!(proto_status, PROTO_UNKNOWN_ROLE);

    drop(client);
    serve.await.unwrap();
}
