use super::{content_type, parse_http_url, rejection};
use crate::mcp::error::TransportError;
use futures::{Future, StreamExt, stream::BoxStream};
use reqwest::header::ACCEPT;
use rmcp::{
    model::ServerJsonRpcMessage,
    service::{RoleClient, TxJsonRpcMessage},
    transport::{Transport, common::http_header::EVENT_STREAM_MIME_TYPE},
};
use sse_stream::{Error as SseError, Sse, SseStream};
use std::fmt;
use tracing::{debug, warn};
use url::Url;

type EventStream = BoxStream<'static, Result<Sse, SseError>>;

/// Legacy HTTP+SSE channel.
///
/// A long-lived GET stream carries every server-to-client message; the
/// client POSTs to the endpoint announced by the stream's first `endpoint`
/// event. The endpoint must share the stream's origin, since the channel's
/// credentials go with every POST.
pub struct SseClientTransport {
    http: reqwest::Client,
    stream_url: Url,
    endpoint: Url,
    stream: Option<EventStream>,
}

impl fmt::Debug for SseClientTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SseClientTransport")
            .field("stream_url", &self.stream_url.as_str())
            .field("endpoint", &self.endpoint.as_str())
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SseClientTransport {
    /// Opens the event stream and waits for the message endpoint.
    pub async fn connect(url: &str, http: reqwest::Client) -> Result<Self, TransportError> {
        let stream_url = parse_http_url(url)?;
        let response = http
            .get(stream_url.clone())
            .header(ACCEPT, EVENT_STREAM_MIME_TYPE)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(rejection(response).await);
        }
        match content_type(&response) {
            Some(ct) if ct.starts_with(EVENT_STREAM_MIME_TYPE) => {}
            other => return Err(TransportError::UnexpectedContentType(other)),
        }

        let mut stream = SseStream::from_byte_stream(response.bytes_stream()).boxed();
        let endpoint = loop {
            let event = stream.next().await.ok_or(TransportError::MissingEndpoint)??;
            if event.event.as_deref() == Some("endpoint") {
                break message_endpoint(&stream_url, event.data.as_deref().unwrap_or_default())?;
            }
            debug!(event = ?event.event, "event before endpoint ignored");
        };
        debug!(stream = %stream_url, endpoint = %endpoint, "SSE message endpoint announced");

        Ok(Self {
            http,
            stream_url,
            endpoint,
            stream: Some(stream),
        })
    }

    pub fn stream_url(&self) -> &Url {
        &self.stream_url
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Resolve an announced endpoint against the stream URL.
pub(crate) fn message_endpoint(stream_url: &Url, announced: &str) -> Result<Url, TransportError> {
    let endpoint = stream_url.join(announced.trim())?;
    if endpoint.origin() != stream_url.origin() {
        return Err(TransportError::CrossOriginEndpoint {
            endpoint: endpoint.to_string(),
            stream: stream_url.to_string(),
        });
    }
    Ok(endpoint)
}

impl Transport<RoleClient> for SseClientTransport {
    type Error = TransportError;

    async fn receive(&mut self) -> Option<ServerJsonRpcMessage> {
        let stream = self.stream.as_mut()?;
        loop {
            match stream.next().await {
                Some(Ok(event)) => {
                    if !matches!(event.event.as_deref(), None | Some("message")) {
                        debug!(event = ?event.event, "ignoring SSE event");
                        continue;
                    }
                    let Some(data) = event.data else { continue };
                    match serde_json::from_str::<ServerJsonRpcMessage>(&data) {
                        Ok(message) => return Some(message),
                        Err(err) => warn!(error = %err, "dropping malformed SSE message"),
                    }
                }
                Some(Err(err)) => {
                    warn!(error = %err, "SSE stream failed");
                    return None;
                }
                None => {
                    debug!("SSE stream ended");
                    return None;
                }
            }
        }
    }

    fn send(
        &mut self,
        item: TxJsonRpcMessage<RoleClient>,
    ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'static {
        let http = self.http.clone();
        let endpoint = self.endpoint.clone();
        async move {
            let response = http.post(endpoint).json(&item).send().await?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(rejection(response).await)
            }
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.stream.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_url() -> Url {
        Url::parse("http://127.0.0.1:8001/sse").unwrap()
    }

    #[test]
    fn relative_endpoints_resolve_against_the_stream() {
        let endpoint = message_endpoint(&stream_url(), " /messages?session_id=7 ").unwrap();
        assert_eq!(endpoint.as_str(), "http://127.0.0.1:8001/messages?session_id=7");

        let sibling = message_endpoint(&stream_url(), "messages").unwrap();
        assert_eq!(sibling.as_str(), "http://127.0.0.1:8001/messages");
    }

    #[test]
    fn same_origin_absolute_endpoint_is_accepted() {
        let endpoint = message_endpoint(&stream_url(), "http://127.0.0.1:8001/rpc").unwrap();
        assert_eq!(endpoint.path(), "/rpc");
    }

    #[test]
    fn foreign_endpoints_are_refused() {
        for announced in [
            "http://attacker.test/messages",
            "http://127.0.0.1:9999/messages",
            "https://127.0.0.1:8001/messages",
            "//other.host/messages",
        ] {
            assert!(
                matches!(
                    message_endpoint(&stream_url(), announced),
                    Err(TransportError::CrossOriginEndpoint { .. })
                ),
                "{announced} should be refused"
            );
        }
    }
}
