//! # Request Executor
//!
//! Performs the real outbound HTTP call for one relayed request.
//!
//! [`HttpExecutor`] is built on hyper's pooled client with a rustls HTTPS
//! connector (webpki roots, HTTP/1.1 and HTTP/2). Each call is an
//! independent future: a failing call only fails itself, and dropping the
//! future abandons the call.
//!
//! GET requests are always sent without a body, even when the descriptor
//! carries one. Every other method forwards the body as given.
//!
//! Response headers keep every value, but come out grouped by name in order
//! of first appearance: `x-a: 1`, `x-b: 2`, `x-a: 3` is reported as
//! `x-a: 1`, `x-a: 3`, `x-b: 2`. hyper only records the raw line order for
//! its C API.

use crate::error::{error_chain, AgentError, ExecutionError};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, Uri};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::TokioExecutor;
use relay_protocol::{HttpHeader, HttpMethod, HttpRequest, HttpResponse};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Anything that can turn a request descriptor into a response descriptor.
///
/// The relay loop only depends on this trait, which keeps it testable
/// without a network.
pub trait Executor: Send + Sync + 'static {
    fn execute(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<HttpResponse, ExecutionError>> + Send;
}

type HttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

pub struct HttpExecutor {
    client: HttpsClient,
}

impl HttpExecutor {
    pub fn new() -> Result<Self, AgentError> {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?
        .with_root_certificates(roots)
        .with_no_client_auth();

        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .enable_http2()
            .build();

        Ok(Self {
            client: Client::builder(TokioExecutor::new()).build(https),
        })
    }

    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ExecutionError> {
        let url = request.url.clone();
        let outbound = build_request(request)?;

        let response = self
            .client
            .request(outbound)
            .await
            .map_err(|e| ExecutionError::Network {
                url: url.clone(),
                reason: error_chain(&e),
            })?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| ExecutionError::Body {
                url,
                reason: error_chain(&e),
            })?
            .to_bytes();

        let headers = parts
            .headers
            .iter()
            .map(|(name, value)| {
                HttpHeader::new(
                    name.as_str(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        Ok(HttpResponse {
            status: u64::from(parts.status.as_u16()),
            headers,
            body: body.to_vec(),
        })
    }
}

impl Executor for HttpExecutor {
    async fn execute(
        &self,
        request: HttpRequest,
        timeout: Option<Duration>,
    ) -> Result<HttpResponse, ExecutionError> {
        match timeout {
            Some(timeout) => {
                let url = request.url.clone();
                tokio::time::timeout(timeout, self.send(request))
                    .await
                    .map_err(|_| ExecutionError::Timeout { url, timeout })?
            }
            None => self.send(request).await,
        }
    }
}

/// Maps a relay descriptor onto a hyper request.
fn build_request(request: HttpRequest) -> Result<Request<Full<Bytes>>, ExecutionError> {
    let uri: Uri = request
        .url
        .parse()
        .map_err(|e: hyper::http::uri::InvalidUri| ExecutionError::InvalidUrl {
            url: request.url.clone(),
            reason: e.to_string(),
        })?;
    if uri.scheme().is_none() || uri.host().is_none() {
        return Err(ExecutionError::InvalidUrl {
            url: request.url,
            reason: "expected an absolute http or https url".to_string(),
        });
    }

    let method = match request.method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Head => Method::HEAD,
    };

    let body = match (request.method, request.body) {
        (HttpMethod::Get, _) | (_, None) => Bytes::new(),
        (_, Some(body)) => Bytes::from(body),
    };

    let mut builder = Request::builder().method(method).uri(uri);
    for header in &request.headers {
        builder = builder.header(header.name.as_str(), header.value.as_str());
    }
    builder
        .body(Full::new(body))
        .map_err(|e| ExecutionError::InvalidRequest(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn body_of(request: Request<Full<Bytes>>) -> Vec<u8> {
        request.into_body().collect().await.unwrap().to_bytes().to_vec()
    }

    #[tokio::test]
    async fn get_body_is_stripped() {
        let request = HttpRequest::new(
            "http://example.test/a",
            HttpMethod::Get,
            vec![],
            Some(b"ignored".to_vec()),
        );
        let built = build_request(request).unwrap();
        assert_eq!(built.method(), Method::GET);
        assert!(body_of(built).await.is_empty());
    }

    #[tokio::test]
    async fn other_methods_keep_their_body() {
        for method in [HttpMethod::Post, HttpMethod::Put, HttpMethod::Delete] {
            let request = HttpRequest::new(
                "https://example.test/upload",
                method,
                vec![HttpHeader::new("content-type", "application/octet-stream")],
                Some(vec![1, 2, 3]),
            );
            let built = build_request(request).unwrap();
            assert_eq!(built.method().as_str(), method.as_str());
            assert_eq!(body_of(built).await, vec![1, 2, 3]);
        }
    }

    #[test]
    fn duplicate_headers_are_all_forwarded() {
        let request = HttpRequest::new(
            "http://example.test/",
            HttpMethod::Post,
            vec![
                HttpHeader::new("x-trace", "a"),
                HttpHeader::new("X-Trace", "b"),
                HttpHeader::new("accept", "*/*"),
            ],
            None,
        );
        let built = build_request(request).unwrap();
        let traces: Vec<_> = built
            .headers()
            .get_all("x-trace")
            .iter()
            .map(|v| v.to_str().unwrap())
            .collect();
        assert_eq!(traces, vec!["a", "b"]);
    }

    #[test]
    fn rejects_relative_and_malformed_urls() {
        for url in ["/just/a/path", "http://exa mple.test/", ""] {
            let request = HttpRequest::new(url, HttpMethod::Get, vec![], None);
            assert!(
                matches!(build_request(request), Err(ExecutionError::InvalidUrl { .. })),
                "{url:?}"
            );
        }
    }

    #[test]
    fn rejects_invalid_header_names() {
        let request = HttpRequest::new(
            "http://example.test/",
            HttpMethod::Get,
            vec![HttpHeader::new("bad header", "x")],
            None,
        );
        assert!(matches!(
            build_request(request),
            Err(ExecutionError::InvalidRequest(_))
        ));
    }

    /// Serves one connection with a fixed raw response.
    async fn raw_responder(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            let mut buf = [0u8; 1024];
            while !received.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                received.extend_from_slice(&buf[..n]);
            }
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn response_keeps_duplicate_headers_grouped_by_name() {
        let url = raw_responder(
            "HTTP/1.1 203 Non-Authoritative Information\r\n\
             x-a: 1\r\n\
             x-b: 2\r\n\
             x-a: 3\r\n\
             content-length: 2\r\n\
             connection: close\r\n\
             \r\n\
             ok",
        )
        .await;

        let response = HttpExecutor::new()
            .unwrap()
            .execute(
                HttpRequest::new(url, HttpMethod::Get, vec![], None),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();

        assert_eq!(response.status, 203);
        assert_eq!(response.body, b"ok");
        assert_eq!(
            response.headers,
            vec![
                HttpHeader::new("x-a", "1"),
                HttpHeader::new("x-a", "3"),
                HttpHeader::new("x-b", "2"),
                HttpHeader::new("content-length", "2"),
                HttpHeader::new("connection", "close"),
            ]
        );
    }

    #[tokio::test]
    async fn unreachable_host_is_a_network_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = HttpExecutor::new()
            .unwrap()
            .execute(
                HttpRequest::new(format!("http://127.0.0.1:{port}/"), HttpMethod::Get, vec![], None),
                Some(Duration::from_secs(5)),
            )
            .await;
        assert!(matches!(result, Err(ExecutionError::Network { .. })), "{result:?}");
    }
}
