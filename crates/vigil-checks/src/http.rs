//! HTTP checks.
//!
//! Every probe opens a fresh connection and asks the server to close it,
//! so a wedged keep-alive socket can never mask a dead endpoint.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{ACCEPT, CONNECTION, HOST, HeaderName, HeaderValue, USER_AGENT as USER_AGENT_HEADER};
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use vigil_core::HealthStatus;
use vigil_core::duration::format_duration;

use crate::error::{CheckError, CheckResult};
use crate::output::OutputBuffer;
use crate::runner::CheckProbe;
use crate::{DEFAULT_BUF_SIZE, DEFAULT_PROBE_TIMEOUT, USER_AGENT};

/// Map an HTTP status code to a check status: 2xx passing, 429 warning,
/// anything else critical.
pub fn status_for_code(code: u16) -> HealthStatus {
    match code {
        200..=299 => HealthStatus::Passing,
        429 => HealthStatus::Warning,
        _ => HealthStatus::Critical,
    }
}

#[derive(Debug, Clone)]
pub struct HttpProbe {
    url: String,
    uri: Uri,
    method: Method,
    headers: HashMap<String, Vec<String>>,
    body: Bytes,
    timeout: Duration,
    output_max_size: usize,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl HttpProbe {
    pub fn new(
        url: &str,
        method: &str,
        headers: HashMap<String, Vec<String>>,
        body: &str,
        tls_skip_verify: bool,
    ) -> CheckResult<Self> {
        let uri: Uri = url.parse().map_err(|e: http::uri::InvalidUri| CheckError::InvalidUrl {
            url: url.to_string(),
            msg: e.to_string(),
        })?;
        if uri.host().is_none() {
            return Err(CheckError::InvalidUrl {
                url: url.to_string(),
                msg: "missing host".to_string(),
            });
        }

        let method = if method.is_empty() {
            Method::GET
        } else {
            Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| CheckError::InvalidMethod(method.to_string()))?
        };

        let tls = match uri.scheme_str() {
            Some("https") => Some(tls::client_config(tls_skip_verify)?),
            Some("http") => None,
            _ => {
                return Err(CheckError::InvalidUrl {
                    url: url.to_string(),
                    msg: "scheme must be http or https".to_string(),
                });
            }
        };

        Ok(Self {
            url: url.to_string(),
            uri,
            method,
            headers,
            body: Bytes::from(body.to_string()),
            timeout: DEFAULT_PROBE_TIMEOUT,
            output_max_size: DEFAULT_BUF_SIZE,
            tls,
        })
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        if let Some(t) = timeout.filter(|t| !t.is_zero()) {
            self.timeout = t;
        }
        self
    }

    pub fn with_output_max_size(mut self, size: usize) -> Self {
        if size > 0 {
            self.output_max_size = size;
        }
        self
    }

    fn authority(&self) -> String {
        let host = self.uri.host().unwrap_or_default();
        let default_port = if self.tls.is_some() { 443 } else { 80 };
        format!("{host}:{}", self.uri.port_u16().unwrap_or(default_port))
    }

    fn build_request(&self) -> Result<Request<Full<Bytes>>, String> {
        let path = self
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let mut req = Request::builder()
            .method(self.method.clone())
            .uri(path)
            .body(Full::new(self.body.clone()))
            .map_err(|e| e.to_string())?;

        let headers = req.headers_mut();
        headers.insert(USER_AGENT_HEADER, HeaderValue::from_static(USER_AGENT));
        headers.insert(ACCEPT, HeaderValue::from_static("text/plain, text/*, */*"));
        let host = self.uri.authority().map(|a| a.as_str()).unwrap_or_default();
        headers.insert(
            HOST,
            HeaderValue::from_str(host).map_err(|e| e.to_string())?,
        );

        // User headers replace the defaults, Host included.
        for (name, values) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| e.to_string())?;
            headers.remove(&name);
            for value in values {
                headers.append(
                    name.clone(),
                    HeaderValue::from_str(value).map_err(|e| e.to_string())?,
                );
            }
        }
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        Ok(req)
    }

    async fn exchange(&self) -> Result<(String, String), String> {
        let req = self.build_request()?;
        let stream = TcpStream::connect(self.authority())
            .await
            .map_err(|e| e.to_string())?;

        match &self.tls {
            None => send(stream, req, self.output_max_size).await,
            Some(config) => {
                let host = self.uri.host().unwrap_or_default().to_string();
                let server_name = rustls::pki_types::ServerName::try_from(host)
                    .map_err(|e| e.to_string())?;
                let stream = tokio_rustls::TlsConnector::from(Arc::clone(config))
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| e.to_string())?;
                send(stream, req, self.output_max_size).await
            }
        }
    }
}

async fn send<IO>(
    io: IO,
    req: Request<Full<Bytes>>,
    output_max_size: usize,
) -> Result<(String, String), String>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(|e| e.to_string())?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await.map_err(|e| e.to_string())?;
    let status = resp.status();

    let mut output = OutputBuffer::new(output_max_size);
    let mut body = resp.into_body();
    while let Some(frame) = body.frame().await {
        let frame = frame.map_err(|e| e.to_string())?;
        if let Some(data) = frame.data_ref() {
            output.write(data);
        }
    }

    let code = status.as_u16().to_string();
    let status_line = match status.canonical_reason() {
        Some(reason) => format!("{code} {reason}"),
        None => code,
    };
    Ok((status_line, output.render()))
}

#[async_trait]
impl CheckProbe for HttpProbe {
    async fn evaluate(&self) -> (HealthStatus, String) {
        match tokio::time::timeout(self.timeout, self.exchange()).await {
            Ok(Ok((status_line, body))) => {
                let code = status_line
                    .split(' ')
                    .next()
                    .and_then(|c| c.parse::<u16>().ok())
                    .unwrap_or(0);
                let status = status_for_code(code);
                (
                    status,
                    format!(
                        "HTTP {} {}: {} Output: {}",
                        self.method, self.url, status_line, body
                    ),
                )
            }
            Ok(Err(e)) => {
                debug!(url = %self.url, error = %e, "http check failed");
                (HealthStatus::Critical, format!("HTTP {} {}: {e}", self.method, self.url))
            }
            Err(_) => (
                HealthStatus::Critical,
                format!(
                    "HTTP {} {}: timed out after {}",
                    self.method,
                    self.url,
                    format_duration(self.timeout)
                ),
            ),
        }
    }
}

mod tls {
    use std::sync::Arc;

    use crate::error::{CheckError, CheckResult};

    pub(super) fn client_config(skip_verify: bool) -> CheckResult<Arc<rustls::ClientConfig>> {
        let builder = rustls::ClientConfig::builder_with_provider(
            rustls::crypto::ring::default_provider().into(),
        )
        .with_safe_default_protocol_versions()
        .map_err(|e| CheckError::Tls(e.to_string()))?;

        let config = if skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(danger::NoVerifier))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(Arc::new(config))
    }

    mod danger {
        use rustls::client::danger::{
            HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
        };
        use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
        use rustls::{DigitallySignedStruct, Error, SignatureScheme};

        /// Accepts any server certificate (`tls_skip_verify`).
        #[derive(Debug)]
        pub struct NoVerifier;

        impl ServerCertVerifier for NoVerifier {
            fn verify_server_cert(
                &self,
                _end_entity: &CertificateDer<'_>,
                _intermediates: &[CertificateDer<'_>],
                _server_name: &ServerName<'_>,
                _ocsp_response: &[u8],
                _now: UnixTime,
            ) -> Result<ServerCertVerified, Error> {
                Ok(ServerCertVerified::assertion())
            }

            fn verify_tls12_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn verify_tls13_signature(
                &self,
                _message: &[u8],
                _cert: &CertificateDer<'_>,
                _dss: &DigitallySignedStruct,
            ) -> Result<HandshakeSignatureValid, Error> {
                Ok(HandshakeSignatureValid::assertion())
            }

            fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
                rustls::crypto::ring::default_provider()
                    .signature_verification_algorithms
                    .supported_schemes()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned response per connection and hand back the request head.
    async fn serve(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut head = Vec::new();
            let mut buf = [0u8; 1024];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = sock.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&buf[..n]);
            }
            sock.write_all(response.as_bytes()).await.unwrap();
            sock.shutdown().await.unwrap();
            String::from_utf8_lossy(&head).into_owned()
        });
        (format!("http://{addr}/health"), handle)
    }

    fn probe(url: &str) -> HttpProbe {
        HttpProbe::new(url, "", HashMap::new(), "", false).unwrap()
    }

    #[test]
    fn status_code_mapping() {
        assert_eq!(status_for_code(200), HealthStatus::Passing);
        assert_eq!(status_for_code(299), HealthStatus::Passing);
        assert_eq!(status_for_code(429), HealthStatus::Warning);
        assert_eq!(status_for_code(150), HealthStatus::Critical);
        assert_eq!(status_for_code(300), HealthStatus::Critical);
        assert_eq!(status_for_code(500), HealthStatus::Critical);
    }

    #[test]
    fn rejects_bad_urls() {
        assert!(HttpProbe::new("ftp://host/x", "", HashMap::new(), "", false).is_err());
        assert!(HttpProbe::new("/just/a/path", "", HashMap::new(), "", false).is_err());
        assert!(HttpProbe::new("http://h/", "BAD METHOD", HashMap::new(), "", false).is_err());
    }

    #[test]
    fn https_builds_tls_config() {
        let p = HttpProbe::new("https://example.com/", "", HashMap::new(), "", true).unwrap();
        assert!(p.tls.is_some());
        assert_eq!(p.authority(), "example.com:443");
    }

    #[tokio::test]
    async fn ok_response_is_passing_with_body() {
        let (url, server) =
            serve("HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok").await;
        let (status, output) = probe(&url).evaluate().await;

        assert_eq!(status, HealthStatus::Passing);
        assert_eq!(output, format!("HTTP GET {url}: 200 OK Output: ok"));

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("get /health http/1.1"));
        assert!(head.contains("user-agent: vigil health check"));
        assert!(head.contains("accept: text/plain, text/*, */*"));
    }

    #[tokio::test]
    async fn too_many_requests_is_warning() {
        let (url, _server) = serve(
            "HTTP/1.1 429 Too Many Requests\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (status, output) = probe(&url).evaluate().await;
        assert_eq!(status, HealthStatus::Warning);
        assert!(output.contains("429 Too Many Requests"));
    }

    #[tokio::test]
    async fn server_error_is_critical() {
        let (url, _server) =
            serve("HTTP/1.1 503 Service Unavailable\r\nContent-Length: 4\r\nConnection: close\r\n\r\ndown")
                .await;
        let (status, output) = probe(&url).evaluate().await;
        assert_eq!(status, HealthStatus::Critical);
        assert!(output.ends_with("Output: down"));
    }

    #[tokio::test]
    async fn custom_method_and_headers_are_sent() {
        let (url, server) =
            serve("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let mut headers = HashMap::new();
        headers.insert("X-Probe".to_string(), vec!["1".to_string()]);
        headers.insert("User-Agent".to_string(), vec!["custom".to_string()]);
        let p = HttpProbe::new(&url, "post", headers, "ping", false).unwrap();

        let (status, output) = p.evaluate().await;
        assert_eq!(status, HealthStatus::Passing);
        assert!(output.starts_with("HTTP POST "));

        let head = server.await.unwrap().to_ascii_lowercase();
        assert!(head.starts_with("post /health"));
        assert!(head.contains("x-probe: 1"));
        assert!(head.contains("user-agent: custom"));
        assert!(!head.contains("vigil health check"));
    }

    #[tokio::test]
    async fn connection_refused_is_critical() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (status, output) = probe(&format!("http://{addr}/")).evaluate().await;
        assert_eq!(status, HealthStatus::Critical);
        assert!(output.starts_with(&format!("HTTP GET http://{addr}/: ")));
    }

    #[tokio::test]
    async fn slow_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let _server = tokio::spawn(async move {
            let (_sock, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let p = probe(&format!("http://{addr}/")).with_timeout(Some(Duration::from_millis(200)));
        let (status, output) = p.evaluate().await;
        assert_eq!(status, HealthStatus::Critical);
        assert!(output.ends_with("timed out after 200ms"), "{output}");
    }
}
