#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(clippy::cast_possible_truncation)]
#![warn(clippy::cast_possible_wrap)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

mod context;
pub mod error;
pub mod options;
mod pool;
pub mod response;
pub(crate) mod runtime;

pub use crate::{
    context::Context,
    error::{Error, ErrorKind, Result},
    options::{PoolOptions, TargetAddress},
    pool::{
        AsyncIo, BoxedIo, ConnectRequest, Connection, ConnectionLifecycle, ConnectionManager,
        Connector, TcpConnector,
    },
    response::{HttpResponse, ResponseBuilder},
};
