//! Scenario E: a management-record GET_VALUES query (request id 0) is
//! answered with GET_VALUES_RESULT carrying only the variables the
//! engine recognizes, without touching any session machinery.

mod common;

use common::*;
use fastcgi_server::{Application, EngineBuilder, Outcome, Request};
use futures_util::future::BoxFuture;
use tokio::io::duplex;

struct NeverCalled;

impl Application for NeverCalled {
    fn serve<'a>(&'a self, _request: &'a mut Request) -> BoxFuture<'a, Outcome> {
        Box::pin(async move { panic!("GET_VALUES must never dispatch a session") })
    }
}

#[tokio::test]
async fn get_values_reports_advertised_limits() {
    let (client, server) = duplex(8192);

    let engine = EngineBuilder::new()
        .responder(NeverCalled)
        .max_connections(16)
        .max_sessions(64)
        .max_sessions_per_connection(1)
        .build()
        .unwrap();
    let serve = tokio::spawn(async move {
        engine.serve(OnceTransport::new(server)).await.unwrap();
    });

    let mut client = client;
    let mut out = Vec::new();
    get_values_record(&mut out, &[b"FCGI_MAX_CONNS", b"FCGI_MAX_REQS", b"FCGI_MPXS_CONNS", b"FCGI_UNKNOWN_VAR"]);
    send(&mut client, &out).await;

    let record = read_record(&mut client).await.expect("peer closed before GET_VALUES_RESULT");
    assert_eq!(record.r#type, GET_VALUES_RESULT);
    assert_eq!(record.id, 0);

    let mut found = std::collections::HashMap::new();
    let mut offset = 0;
    while offset < record.content.len() {
        let (name_len, name_prefix) = decode_length(&record.content[offset..]);
        let after_name_len = offset + name_prefix;
        let (value_len, value_prefix) = decode_length(&record.content[after_name_len..]);
        let name_start = after_name_len + value_prefix;
        let name_end = name_start + name_len;
        let value_end = name_end + value_len;
        let name = &record.content[name_start..name_end];
        let value = &record.content[name_end..value_end];
        found.insert(String::from_utf8(name.to_vec()).unwrap(), String::from_utf8(value.to_vec()).unwrap());
        offset = value_end;
    }

    assert_eq!(found.get("FCGI_MAX_CONNS").map(String::as_str), Some("16"));
    assert_eq!(found.get("FCGI_MAX_REQS").map(String::as_str), Some("64"));
    assert_eq!(found.get("FCGI_MPXS_CONNS").map(String::as_str), Some("0"));
    assert!(!found.contains_key("FCGI_UNKNOWN_VAR"));

    drop(client);
    serve.await.unwrap();
}

fn decode_length(buf: &[u8]) -> (usize, usize) {
    let first = buf[0];
    if first & 0x80 == 0 {
        (first as usize, 1)
    } else {
        let raw = u32::from_be_bytes([buf[0] & 0x7f, buf[1], buf[2], buf[3]]);
        (raw as usize, 4)
    }
}
