//! Response body type shared by every route

use bytes::Bytes;
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body of every response the gateway produces
pub type GatewayBody = UnsyncBoxBody<Bytes, BoxError>;

pub fn full(chunk: impl Into<Bytes>) -> GatewayBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

pub fn empty() -> GatewayBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}
