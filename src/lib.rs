#![warn(rust_2018_idioms)]
#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![doc = include_str!("../README.md")]

pub mod app;
mod conn;
pub mod engine;
mod error;
mod executor;
mod ids;
pub mod params;
mod pool;
mod protocol;
pub mod request;
mod session;
mod stream;

pub use crate::{
    app::{Application, Outcome, Role},
    engine::{Engine, EngineBuilder, StopHandle, TcpTransport, Transport, UnixTransport},
    error::{EngineError, ProtocolError, SessionError},
    params::ParamMap,
    request::{Request, RequestInfo},
};
