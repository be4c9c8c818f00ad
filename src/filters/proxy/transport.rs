//! Shared upstream HTTP transport: a pooled client for plain upstreams and a
//! per-request TLS dial path for https upstreams.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::{StatusCode, Uri};
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use super::balance::Server;
use crate::context::Request;
use crate::error::{Error, Result};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const KEEP_ALIVE: Duration = Duration::from_secs(60);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hop-by-hop headers that must not be forwarded (RFC 7230 §6.1).
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP_HEADERS.contains(&name.as_str())
}

/// Client-side mTLS material, base64-encoded PEM.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct MtlsSpec {
    pub cert_base64: String,
    pub key_base64: String,
    pub root_cert_base64: String,
}

/// Upstream call failure categories.
#[derive(Debug)]
pub(crate) enum UpstreamError {
    /// The attempt deadline elapsed.
    Timeout,
    /// Connect, DNS, TLS or transport-level failure.
    Network(String),
}

/// A fully buffered upstream response.
pub(crate) struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// One transport per proxy filter generation.
pub(crate) struct Transport {
    client: Client<HttpConnector, Full<Bytes>>,
    tls: TlsConnector,
}

impl Transport {
    pub(crate) fn new(max_idle_conns_per_host: usize, mtls: Option<&MtlsSpec>) -> Result<Self> {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(DIAL_TIMEOUT));
        connector.set_keepalive(Some(KEEP_ALIVE));

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(max_idle_conns_per_host)
            .build(connector);

        let tls_config = build_client_tls(mtls)?;
        Ok(Self {
            client,
            tls: TlsConnector::from(Arc::new(tls_config)),
        })
    }

    /// Send the request to `server`, buffering the response.
    pub(crate) async fn send(
        &self,
        server: &Server,
        req: &Request,
        deadline: Option<Duration>,
    ) -> std::result::Result<UpstreamResponse, UpstreamError> {
        let fut = async {
            if server.use_tls {
                self.send_tls(server, req).await
            } else {
                self.send_plain(server, req).await
            }
        };
        match deadline {
            Some(d) => tokio::time::timeout(d, fut)
                .await
                .map_err(|_| UpstreamError::Timeout)?,
            None => fut.await,
        }
    }

    async fn send_plain(
        &self,
        server: &Server,
        req: &Request,
    ) -> std::result::Result<UpstreamResponse, UpstreamError> {
        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://{}{}", server.authority(), path_and_query)
            .parse()
            .map_err(|e| UpstreamError::Network(format!("bad upstream uri: {}", e)))?;

        let upstream_req = build_request(req, uri, &server.authority())?;
        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        buffer_response(response).await
    }

    async fn send_tls(
        &self,
        server: &Server,
        req: &Request,
    ) -> std::result::Result<UpstreamResponse, UpstreamError> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(server.authority()))
            .await
            .map_err(|_| UpstreamError::Network("connect timed out".to_string()))?
            .map_err(|e| UpstreamError::Network(format!("connect: {}", e)))?;

        let domain = ServerName::try_from(server.host.clone())
            .map_err(|_| UpstreamError::Network(format!("invalid SNI host {:?}", server.host)))?;
        let tls = tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, self.tls.connect(domain, tcp))
            .await
            .map_err(|_| UpstreamError::Network("TLS handshake timed out".to_string()))?
            .map_err(|e| UpstreamError::Network(format!("TLS handshake: {}", e)))?;

        let io = TokioIo::new(tls);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| UpstreamError::Network(format!("handshake: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "upstream TLS connection closed");
            }
        });

        let path_and_query = req
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = path_and_query
            .parse()
            .map_err(|e| UpstreamError::Network(format!("bad upstream uri: {}", e)))?;

        let upstream_req = build_request(req, uri, &server.authority())?;
        let response = sender
            .send_request(upstream_req)
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;
        buffer_response(response).await
    }

    /// Plain TCP connect probe.
    pub(crate) async fn probe_connect(&self, server: &Server, timeout: Duration) -> bool {
        matches!(
            tokio::time::timeout(timeout, TcpStream::connect(server.authority())).await,
            Ok(Ok(_))
        )
    }

    /// HTTP GET probe against `path`; anything below 500 counts as healthy.
    pub(crate) async fn probe_http(&self, server: &Server, path: &str, timeout: Duration) -> bool {
        let mut req = Request::new(hyper::Method::GET, match path.parse() {
            Ok(uri) => uri,
            Err(_) => return false,
        });
        req.set_header(
            hyper::header::HOST,
            match HeaderValue::from_str(&server.authority()) {
                Ok(v) => v,
                Err(_) => return false,
            },
        );
        match self.send(server, &req, Some(timeout)).await {
            Ok(resp) => resp.status.as_u16() < 500,
            Err(_) => false,
        }
    }
}

fn build_request(
    req: &Request,
    uri: Uri,
    authority: &str,
) -> std::result::Result<hyper::Request<Full<Bytes>>, UpstreamError> {
    let mut builder = hyper::Request::builder().method(req.method.clone()).uri(uri);
    for (name, value) in &req.headers {
        if !is_hop_by_hop(name) {
            builder = builder.header(name, value);
        }
    }
    if !req.headers.contains_key(hyper::header::HOST) {
        builder = builder.header(hyper::header::HOST, authority);
    }
    builder
        .body(Full::new(req.body().clone()))
        .map_err(|e| UpstreamError::Network(format!("build request: {}", e)))
}

async fn buffer_response(
    response: hyper::Response<hyper::body::Incoming>,
) -> std::result::Result<UpstreamResponse, UpstreamError> {
    let (parts, body) = response.into_parts();
    let collected = body
        .collect()
        .await
        .map_err(|e| UpstreamError::Network(format!("read response: {}", e)))?;
    Ok(UpstreamResponse {
        status: parts.status,
        headers: parts.headers,
        body: collected.to_bytes(),
    })
}

/// Client TLS config: provided mTLS material, or verification disabled when
/// none is configured.
fn build_client_tls(mtls: Option<&MtlsSpec>) -> Result<rustls::ClientConfig> {
    let mut config = match mtls {
        None => rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier::default()))
            .with_no_client_auth(),
        Some(mtls) => {
            let cert_pem = decode_b64(&mtls.cert_base64, "certBase64")?;
            let key_pem = decode_b64(&mtls.key_base64, "keyBase64")?;
            let root_pem = decode_b64(&mtls.root_cert_base64, "rootCertBase64")?;

            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut &root_pem[..]) {
                let cert =
                    cert.map_err(|e| Error::tls(format!("invalid root certificate: {}", e)))?;
                roots
                    .add(cert)
                    .map_err(|e| Error::tls(format!("invalid root certificate: {}", e)))?;
            }

            let certs = rustls_pemfile::certs(&mut &cert_pem[..])
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| Error::tls(format!("invalid client certificate: {}", e)))?;
            let key = rustls_pemfile::private_key(&mut &key_pem[..])
                .map_err(|e| Error::tls(format!("invalid client key: {}", e)))?
                .ok_or_else(|| Error::tls("client key PEM holds no private key"))?;

            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_client_auth_cert(certs, key)
                .map_err(|e| Error::tls(format!("client auth setup: {}", e)))?
        }
    };
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

fn decode_b64(value: &str, field: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .map_err(|_| Error::spec(format!("{} is not valid base64", field)))
}

/// Certificate verifier that accepts any peer. Used when no mTLS material is
/// configured; strict verification is not a default of this proxy.
#[derive(Debug, Default)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop(&HeaderName::from_static("connection")));
        assert!(is_hop_by_hop(&HeaderName::from_static("transfer-encoding")));
        assert!(!is_hop_by_hop(&HeaderName::from_static("content-type")));
    }

    #[test]
    fn test_insecure_tls_config_builds() {
        let config = build_client_tls(None).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_mtls_rejects_bad_base64() {
        let err = build_client_tls(Some(&MtlsSpec {
            cert_base64: "!!!".to_string(),
            key_base64: String::new(),
            root_cert_base64: String::new(),
        }))
        .unwrap_err();
        assert!(err.to_string().contains("certBase64"));
    }

    #[test]
    fn test_build_request_strips_hop_by_hop() {
        let mut req = Request::new(hyper::Method::POST, "/x".parse().unwrap());
        req.set_header(
            HeaderName::from_static("connection"),
            HeaderValue::from_static("keep-alive"),
        );
        req.set_header(
            HeaderName::from_static("x-keep"),
            HeaderValue::from_static("1"),
        );
        let out = build_request(&req, "/x".parse().unwrap(), "127.0.0.1:9095").unwrap();
        assert!(out.headers().get("connection").is_none());
        assert_eq!(out.headers().get("x-keep").unwrap(), "1");
        assert_eq!(out.headers().get("host").unwrap(), "127.0.0.1:9095");
    }
}
