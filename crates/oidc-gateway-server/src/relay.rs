//! Fixed-upstream API relay

use std::time::Duration;

use futures_util::TryStreamExt;
use http::Response;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use tracing::debug;

use crate::body::{BoxError, GatewayBody};
use crate::error::GatewayError;

/// Fetches one upstream URL and streams its body back to the caller
#[derive(Debug, Clone)]
pub struct ApiRelay {
    client: reqwest::Client,
    upstream: String,
}

impl ApiRelay {
    /// `timeout` bounds the whole outbound exchange, body included
    pub fn new(upstream: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            upstream: upstream.into(),
        })
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub async fn forward(&self) -> Result<Response<GatewayBody>, GatewayError> {
        let response = self
            .client
            .get(&self.upstream)
            .send()
            .await
            .map_err(GatewayError::Relay)?;

        debug!(
            upstream = %self.upstream,
            status = response.status().as_u16(),
            "Relaying upstream response"
        );

        let frames = response
            .bytes_stream()
            .map_ok(Frame::data)
            .map_err(|e| Box::new(e) as BoxError);

        Ok(Response::new(StreamBody::new(frames).boxed_unsync()))
    }
}
