//! Message channels to a single MCP server.
//!
//! Every channel is an rmcp [`Transport`]: streamable HTTP comes straight from
//! rmcp, the legacy HTTP+SSE channel lives in [`sse`]. Request correlation and
//! the MCP handshake belong to the rmcp service the session runs on top.
//!
//! Connection loss surfaces as `receive` returning `None`, which [`Monitored`]
//! turns into a cancelled token. The SSE channel reports it as soon as the
//! event stream ends. A streamable channel only holds a connection open while
//! rmcp's standing GET stream is up, so against a server that does not offer
//! one a vanished server is noticed on the next request instead.

pub mod sse;

use crate::mcp::{config::Credentials, error::TransportError};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use rmcp::{
    service::{RoleClient, RxJsonRpcMessage, TxJsonRpcMessage},
    transport::{
        StreamableHttpClientTransport, Transport,
        streamable_http_client::StreamableHttpClientTransportConfig,
    },
};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use url::Url;

pub use sse::SseClientTransport;

/// Streamable HTTP channel for `url`, POSTing through `http`.
pub fn streamable(
    url: &str,
    http: reqwest::Client,
) -> Result<StreamableHttpClientTransport<reqwest::Client>, TransportError> {
    let url = parse_http_url(url)?;
    Ok(StreamableHttpClientTransport::with_client(
        http,
        StreamableHttpClientTransportConfig::with_uri(url.to_string()),
    ))
}

/// The HTTP client a candidate talks through.
///
/// Credentials are pinned as a default `Authorization` header, so every
/// request on the channel carries them without the transport knowing.
pub fn authorized_client(
    shared: &reqwest::Client,
    credentials: Option<&Credentials>,
) -> Result<reqwest::Client, TransportError> {
    let Some(credentials) = credentials else {
        return Ok(shared.clone());
    };
    let mut value = HeaderValue::from_str(&format!("Bearer {}", credentials.token()))
        .map_err(|_invalid| TransportError::InvalidCredentials)?;
    value.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, value);
    Ok(reqwest::Client::builder().default_headers(headers).build()?)
}

/// Wraps a transport and cancels `lost` once its inbound side ends.
#[derive(Debug)]
pub struct Monitored<T> {
    inner: T,
    lost: CancellationToken,
}

impl<T> Monitored<T> {
    pub fn new(inner: T, lost: CancellationToken) -> Self {
        Self { inner, lost }
    }
}

impl<T> Transport<RoleClient> for Monitored<T>
where
    T: Transport<RoleClient>,
{
    type Error = T::Error;

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        self.inner.send(item)
    }

    async fn receive(&mut self) -> Option<RxJsonRpcMessage<RoleClient>> {
        let message = self.inner.receive().await;
        if message.is_none() {
            self.lost.cancel();
        }
        message
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.inner.close().await
    }
}

pub(crate) fn parse_http_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw)?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(TransportError::UnsupportedScheme(other.to_string())),
    }
}

pub(crate) fn content_type(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase())
}

/// Turn a non-success answer into `Rejected`, keeping a short body excerpt.
pub(crate) async fn rejection(response: reqwest::Response) -> TransportError {
    const MAX_BODY: usize = 512;
    let status = response.status().as_u16();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_BODY {
        let mut cut = MAX_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    TransportError::Rejected { status, body }
}
