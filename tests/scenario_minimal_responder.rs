//! Scenario A: a single RESPONDER session, PARAMS then STDIN, a
//! preamble-plus-body STDOUT, and a clean END_REQUEST.

mod common;

use common::*;
use fastcgi_server::{Application, EngineBuilder, Outcome, Request};
use futures_util::future::BoxFuture;
use tokio::io::duplex;

struct Hello;

impl Application for Hello {
    fn serve<'a>(&'a self, request: &'a mut Request) -> BoxFuture<'a, Outcome> {
        Box::pin(async move {
            request.set_header("Content-Type", "text/plain").unwrap();
            if request.write_stdout(b"hi").await.is_err() {
                return Outcome::Failed("write failed".to_string());
            }
            Outcome::Completed(0)
        })
    }
}

#[tokio::test]
async fn minimal_responder_round_trip() {
    let (client, server) = duplex(8192);

    let engine = EngineBuilder::new().responder(Hello).build().unwrap();
    let serve = tokio::spawn(async move {
        engine.serve(OnceTransport::new(server)).await.unwrap();
    });

    let mut client = client;
    let mut out = Vec::new();
    begin_request(&mut out, 1, ROLE_RESPONDER, false);
    params_record(&mut out, 1, &[(b"REQUEST_METHOD", b"GET"), (b"SCRIPT_NAME", b"/index.php")]);
    params_record(&mut out, 1, &[]);
    write_record(&mut out, STDIN, 1, b"");
    send(&mut client, &out).await;

    let (stdout, _stderr, app_status, proto_status) = read_until_end_request(&mut client, 1).await;
    assert_eq!(app_status, 0);
    assert_eq!(proto_status, PROTO_REQUEST_COMPLETE);

    let text = String::from_utf8(stdout).unwrap();
    assert!(text.starts_with("Status: 200 OK\r\n"), "preamble: {text:?}");
    assert!(text.contains("Content-Type: text/plain\r\n"));
    assert!(text.ends_with("\r\n\r\nhi"));

    drop(client);
    serve.await.unwrap();
}
