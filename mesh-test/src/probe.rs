//! An HTTP(S) client for probing mesh endpoints from outside the mesh.
//!
//! Every probe opens a fresh HTTP/1.1 connection, so TLS and authorization
//! behaviour is observed on each request rather than masked by a pooled
//! connection. The response body is read in full and the connection
//! released before [`Probe::send`] returns.
//!
//! A transport failure (DNS, refused connection, TLS handshake, timeout) is
//! an ordinary [`Outcome`], since negative security tests assert on it. A
//! non-2xx status is not an error.

use crate::{check::Failure, BoxError, Error, Result};
use bytes::Bytes;
use http::{
    header::{self, HeaderMap, HeaderValue},
    Method, Request, StatusCode, Uri,
};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustls::pki_types::{pem::PemObject, CertificateDer, PrivateKeyDer, ServerName};
use std::{
    collections::{BTreeMap, HashMap},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{net::TcpStream, time::Instant};

/// The result of a probe.
pub type Outcome = Result<ProbeResponse>;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Options of an HTTP request.
#[derive(Clone, Debug)]
#[must_use]
pub struct Probe {
    method: Option<Method>,
    headers: Vec<(String, String)>,
    host: Option<String>,
    bearer: Option<String>,
    cookies: Option<CookieJar>,
    tls: TlsOptions,
    dial: HashMap<(String, u16), SocketAddr>,
    body: Option<(Bytes, &'static str)>,
    connect_timeout: Duration,
    timeout: Option<Duration>,
}

/// Trust roots and client identity for `https` probes.
#[derive(Clone, Debug, Default)]
pub struct TlsOptions {
    ca: Option<PathBuf>,
    client_cert: Option<(PathBuf, PathBuf)>,
}

/// A fully-read HTTP response.
#[derive(Clone, Debug)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Time spent connecting, sending the request and reading the body.
    pub elapsed: Duration,
}

/// Session cookies shared by the probes that carry it, keyed by host.
///
/// Clones share the same store, so a jar filled by a login is seen by every
/// probe the test hands it to.
#[derive(Clone, Debug, Default)]
pub struct CookieJar {
    hosts: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
}

// === impl Probe ===

impl Default for Probe {
    fn default() -> Self {
        Self {
            method: None,
            headers: Vec::new(),
            host: None,
            bearer: None,
            cookies: None,
            tls: TlsOptions::default(),
            dial: HashMap::new(),
            body: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            timeout: None,
        }
    }
}

impl Probe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults to `GET`, or `POST` when a body is set.
    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Overrides the `Host` header (and the TLS server name) for name-based
    /// routing through an ingress addressed by IP.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    /// Sends `Authorization: Bearer <token>`.
    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn cookies(mut self, jar: CookieJar) -> Self {
        self.cookies = Some(jar);
        self
    }

    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = tls;
        self
    }

    /// Connects to `addr` whenever a URL names `host:port`, leaving the
    /// request's `Host` header and TLS server name untouched.
    pub fn dial_override(mut self, host: impl Into<String>, port: u16, addr: SocketAddr) -> Self {
        self.dial.insert((host.into(), port), addr);
        self
    }

    /// Sends `pairs` as an `application/x-www-form-urlencoded` body.
    pub fn form<K, V>(mut self, pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = form_urlencoded::Serializer::new(String::new())
            .extend_pairs(pairs)
            .finish();
        self.body = Some((body.into(), "application/x-www-form-urlencoded"));
        self
    }

    pub fn json(mut self, body: &serde_json::Value) -> Self {
        self.body = Some((body.to_string().into(), "application/json"));
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds the whole exchange, including the body read.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Performs one request against `url`.
    pub async fn send(&self, url: &str) -> Outcome {
        let start = Instant::now();
        let res = match self.timeout {
            None => self.exchange(url, start).await,
            Some(timeout) => match tokio::time::timeout(timeout, self.exchange(url, start)).await {
                Ok(res) => res,
                Err(_) => Err(transport(
                    url,
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("request timed out after {timeout:?}"),
                    ),
                )),
            },
        };
        match &res {
            Ok(rsp) => tracing::debug!(%url, status = %rsp.status, elapsed = ?rsp.elapsed, "response"),
            Err(error) => tracing::debug!(%url, error = %error.chain_to_string(), "request failed"),
        }
        res
    }

    /// Sends `n` sequential requests, e.g. to sample a weighted traffic split.
    pub async fn send_many(&self, url: &str, n: usize) -> Vec<Outcome> {
        let mut outcomes = Vec::with_capacity(n);
        for _ in 0..n {
            outcomes.push(self.send(url).await);
        }
        outcomes
    }

    async fn exchange(&self, url: &str, start: Instant) -> Outcome {
        let uri = url
            .parse::<Uri>()
            .map_err(|e| Error::InvalidRequest(format!("{url}: {e}")))?;
        let https = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "{url}: scheme must be http or https"
                )))
            }
        };
        let host = uri
            .host()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| Error::InvalidRequest(format!("{url}: missing host")))?;
        let port = uri.port_u16().unwrap_or(if https { 443 } else { 80 });

        let authority = match &self.host {
            Some(host) => host.clone(),
            None => uri
                .authority()
                .map(|a| a.as_str().to_string())
                .unwrap_or_else(|| host.clone()),
        };
        let server_name = origin_host(&authority);

        // Configuration errors are reported before anything is dialed.
        let tls = if https {
            Some(self.tls.connector()?)
        } else {
            None
        };
        let req = self.request(&uri, &authority, &server_name)?;

        let tcp = self.connect(url, &host, port).await?;
        let rsp = match tls {
            None => roundtrip(url, TokioIo::new(tcp), req).await?,
            Some(connector) => {
                let name = ServerName::try_from(server_name.clone()).map_err(|e| {
                    Error::InvalidRequest(format!("{server_name}: invalid server name: {e}"))
                })?;
                let stream = connector
                    .connect(name, tcp)
                    .await
                    .map_err(|e| transport(url, e))?;
                roundtrip(url, TokioIo::new(stream), req).await?
            }
        };

        let (parts, body) = rsp;
        if let Some(jar) = &self.cookies {
            jar.store(&server_name, &parts.headers);
        }
        Ok(ProbeResponse {
            status: parts.status,
            headers: parts.headers,
            body,
            elapsed: start.elapsed(),
        })
    }

    fn request(&self, uri: &Uri, authority: &str, cookie_host: &str) -> Result<Request<Full<Bytes>>> {
        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let method = self.method.clone().unwrap_or(if self.body.is_some() {
            Method::POST
        } else {
            Method::GET
        });

        let mut req = Request::builder()
            .method(method)
            .uri(path)
            .header(header::HOST, authority)
            .header(header::USER_AGENT, "mesh-test");
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &self.bearer {
            req = req.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(cookie) = self.cookies.as_ref().and_then(|jar| jar.header(cookie_host)) {
            req = req.header(header::COOKIE, cookie);
        }
        let body = match &self.body {
            Some((body, content_type)) => {
                req = req.header(header::CONTENT_TYPE, *content_type);
                body.clone()
            }
            None => Bytes::new(),
        };
        req.body(Full::new(body))
            .map_err(|e| Error::InvalidRequest(e.to_string()))
    }

    async fn connect(&self, url: &str, host: &str, port: u16) -> Result<TcpStream> {
        let connect = async {
            match self.dial.get(&(host.to_string(), port)) {
                Some(addr) => {
                    tracing::debug!(%host, port, %addr, "dialing override address");
                    TcpStream::connect(*addr).await
                }
                None => TcpStream::connect((host, port)).await,
            }
        };
        let timeout = self.connect_timeout;
        let tcp = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| {
                transport(
                    url,
                    std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("connect timed out after {timeout:?}"),
                    ),
                )
            })?
            .map_err(|e| transport(url, e))?;
        let _ = tcp.set_nodelay(true);
        Ok(tcp)
    }
}

async fn roundtrip<I>(
    url: &str,
    io: I,
    req: Request<Full<Bytes>>,
) -> Result<(http::response::Parts, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| transport(url, e))?;
    tokio::spawn(async move {
        if let Err(error) = conn.await {
            tracing::trace!(%error, "connection closed");
        }
    });

    let rsp = sender
        .send_request(req)
        .await
        .map_err(|e| transport(url, e))?;
    let (parts, body) = rsp.into_parts();
    let body = body
        .collect()
        .await
        .map_err(|e| transport(url, e))?
        .to_bytes();
    Ok((parts, body))
}

fn transport(url: &str, source: impl Into<BoxError>) -> Error {
    Error::Transport {
        url: url.to_string(),
        source: source.into(),
    }
}

/// The host cookies and TLS server names are keyed by: `authority` without
/// port or IPv6 brackets, lowercased.
fn origin_host(authority: &str) -> String {
    strip_port(authority).to_ascii_lowercase()
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

// === impl TlsOptions ===

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trusts only the certificates of this PEM bundle. Without one, the
    /// public web roots are trusted.
    pub fn ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca = Some(path.into());
        self
    }

    /// Presents this PEM certificate chain and private key when the server
    /// requests a client certificate.
    pub fn client_cert(mut self, cert: impl Into<PathBuf>, key: impl Into<PathBuf>) -> Self {
        self.client_cert = Some((cert.into(), key.into()));
        self
    }

    fn connector(&self) -> Result<tokio_rustls::TlsConnector> {
        let mut roots = rustls::RootCertStore::empty();
        match &self.ca {
            Some(path) => {
                for cert in read_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        let builder = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| Error::Tls(e.to_string()))?
            .with_root_certificates(roots);
        let config = match &self.client_cert {
            None => builder.with_no_client_auth(),
            Some((cert, key)) => {
                let chain = read_certs(cert)?;
                let pem = std::fs::read(key).map_err(|e| Error::io(key.display(), e))?;
                let key = PrivateKeyDer::from_pem_slice(&pem)
                    .map_err(|e| Error::Tls(format!("{}: {e}", key.display())))?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| Error::Tls(e.to_string()))?
            }
        };
        Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
    }
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).map_err(|e| Error::io(path.display(), e))?;
    let certs = CertificateDer::pem_slice_iter(&pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| Error::Tls(format!("{}: {e}", path.display())))?;
    if certs.is_empty() {
        return Err(Error::Tls(format!(
            "{}: no certificates found",
            path.display()
        )));
    }
    Ok(certs)
}

// === impl ProbeResponse ===

impl ProbeResponse {
    /// The body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// === impl CookieJar ===

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str, name: &str) -> Option<String> {
        self.hosts
            .lock()
            .get(&host.to_ascii_lowercase())
            .and_then(|cookies| cookies.get(name).cloned())
    }

    pub fn insert(&self, host: &str, name: impl Into<String>, value: impl Into<String>) {
        self.hosts
            .lock()
            .entry(host.to_ascii_lowercase())
            .or_default()
            .insert(name.into(), value.into());
    }

    pub fn clear(&self) {
        self.hosts.lock().clear();
    }

    /// Logs in to the sample application behind `gateway` by posting the
    /// credentials to `<gateway>/login`. The server must answer with a
    /// `session` cookie, which is kept in this jar for later probes.
    pub async fn login(&self, gateway: &str, user: &str, password: &str) -> Result<()> {
        let gateway = gateway.trim_end_matches('/');
        let url = format!("{gateway}/login");
        tracing::debug!(%url, %user, "logging in");
        Probe::new()
            .cookies(self.clone())
            .form([("username", user), ("password", password)])
            .send(&url)
            .await?;

        let host = url
            .parse::<Uri>()
            .ok()
            .and_then(|uri| uri.authority().map(|a| origin_host(a.as_str())))
            .unwrap_or_default();
        if self.get(&host, "session").is_none() {
            return Err(Failure::new(format!(
                "login as {user} at {url} did not set a session cookie"
            ))
            .into());
        }
        Ok(())
    }

    fn header(&self, host: &str) -> Option<HeaderValue> {
        let hosts = self.hosts.lock();
        let cookies = hosts.get(&host.to_ascii_lowercase())?;
        if cookies.is_empty() {
            return None;
        }
        let value = cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&value).ok()
    }

    fn store(&self, host: &str, headers: &HeaderMap) {
        for value in headers.get_all(header::SET_COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            let mut attrs = value.split(';').map(str::trim);
            let Some((name, value)) = attrs.next().and_then(|pair| pair.split_once('=')) else {
                continue;
            };
            let (name, value) = (name.trim(), value.trim().trim_matches('"'));
            let expired = attrs.any(|attr| {
                attr.split_once('=').is_some_and(|(k, v)| {
                    k.trim().eq_ignore_ascii_case("max-age") && v.trim().starts_with(['0', '-'])
                })
            });

            let mut hosts = self.hosts.lock();
            let cookies = hosts.entry(host.to_ascii_lowercase()).or_default();
            if expired {
                tracing::trace!(%host, %name, "cookie expired");
                cookies.remove(name);
            } else {
                tracing::trace!(%host, %name, "cookie set");
                cookies.insert(name.to_string(), value.to_string());
            }
        }
    }
}
