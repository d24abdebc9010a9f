//! Client connection establishment.
//!
//! Addresses look like `[ws|wss]://[user[:password]@]host[:port]/path`; the
//! scheme defaults to `ws`. Userinfo is moved out of the URL into an
//! `Authorization: Basic` header. An optional `http://` proxy is tunnelled
//! with `CONNECT` before the WebSocket (and TLS, for `wss`) handshake.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::MaybeTlsStream;
use tracing::{debug, info};
use url::Url;

use super::{decode_userinfo, ConnectError, WebSocketTransport};

/// Transport returned by [`connect`].
pub type ClientTransport = WebSocketTransport<MaybeTlsStream<TcpStream>>;

/// Upper bound on the proxy's response header block.
const MAX_PROXY_RESPONSE: usize = 8 * 1024;

/// Parses a destination address, defaulting the scheme to `ws`.
pub fn normalize_url(address: &str) -> Result<Url, ConnectError> {
    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };

    let url = Url::parse(&candidate).map_err(|e| ConnectError::InvalidUrl {
        address: address.to_string(),
        reason: e.to_string(),
    })?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => return Err(ConnectError::UnsupportedScheme(other.to_string())),
    }
    if url.host_str().is_none() {
        return Err(ConnectError::InvalidUrl {
            address: address.to_string(),
            reason: "missing host".to_string(),
        });
    }

    Ok(url)
}

/// Removes userinfo from `url`, returning it as a decoded `user:password`.
pub fn take_credentials(url: &mut Url) -> Result<Option<String>, ConnectError> {
    if url.username().is_empty() && url.password().is_none() {
        return Ok(None);
    }

    let user = decode_userinfo(url.username())?;
    let password = url.password().map(decode_userinfo).transpose()?;
    let credentials = match password {
        Some(password) => format!("{}:{}", user, password),
        None => user,
    };

    url.set_username("")
        .and_then(|()| url.set_password(None))
        .map_err(|()| ConnectError::InvalidCredentials("cannot strip userinfo".to_string()))?;

    Ok(Some(credentials))
}

/// `Basic` authorization value for `user:password` credentials.
pub fn basic_auth(credentials: &str) -> String {
    format!("Basic {}", BASE64.encode(credentials))
}

/// `scheme://host[:port]/path` with userinfo removed, for display.
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    let _ = shown.set_username("");
    let _ = shown.set_password(None);
    shown.to_string()
}

/// Connects to a WScp server, optionally through an HTTP proxy.
pub async fn connect(address: &str, proxy: Option<&str>) -> Result<ClientTransport, ConnectError> {
    let mut url = normalize_url(address)?;
    let credentials = take_credentials(&mut url)?;

    let host = url
        .host_str()
        .ok_or_else(|| ConnectError::InvalidUrl {
            address: address.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let port = url.port_or_known_default().unwrap_or(80);

    let mut request = url.as_str().into_client_request()?;
    if let Some(credentials) = credentials {
        let value = HeaderValue::from_str(&basic_auth(&credentials))
            .map_err(|e| ConnectError::InvalidCredentials(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let tcp = match proxy.filter(|p| !p.is_empty()) {
        Some(proxy) => tunnel(proxy, &host, port).await?,
        None => {
            debug!(host = %host, port, "Opening TCP connection");
            TcpStream::connect((strip_brackets(&host), port)).await?
        }
    };

    let (stream, response) = tokio_tungstenite::client_async_tls(request, tcp).await?;
    info!(
        url = %url,
        status = %response.status(),
        "WebSocket connection established"
    );

    Ok(WebSocketTransport::new(stream))
}

/// Opens a TCP tunnel to `host:port` through an HTTP proxy.
async fn tunnel(proxy: &str, host: &str, port: u16) -> Result<TcpStream, ConnectError> {
    let candidate = if proxy.contains("://") {
        proxy.to_string()
    } else {
        format!("http://{}", proxy)
    };
    let mut proxy_url = Url::parse(&candidate).map_err(|e| ConnectError::InvalidUrl {
        address: proxy.to_string(),
        reason: e.to_string(),
    })?;
    if proxy_url.scheme() != "http" {
        return Err(ConnectError::UnsupportedProxy(proxy_url.scheme().to_string()));
    }

    let proxy_credentials = take_credentials(&mut proxy_url)?;
    let proxy_host = proxy_url
        .host_str()
        .ok_or_else(|| ConnectError::InvalidUrl {
            address: proxy.to_string(),
            reason: "missing host".to_string(),
        })?
        .to_string();
    let proxy_port = proxy_url.port_or_known_default().unwrap_or(80);

    info!(proxy = %redact(&proxy_url), "Connecting through proxy");
    let mut stream = TcpStream::connect((strip_brackets(&proxy_host), proxy_port)).await?;

    let request = connect_request(host, port, proxy_credentials.as_deref());
    stream.write_all(request.as_bytes()).await?;

    let header = read_response_header(&mut stream).await?;
    let status = header.lines().next().unwrap_or_default().to_string();
    if !tunnel_accepted(&status) {
        return Err(ConnectError::ProxyRefused(status));
    }

    debug!(target_host = %host, port, "Proxy tunnel established");
    Ok(stream)
}

fn connect_request(host: &str, port: u16, credentials: Option<&str>) -> String {
    let target = format!("{}:{}", host, port);
    let mut request = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    if let Some(credentials) = credentials {
        request.push_str(&format!(
            "Proxy-Authorization: {}\r\n",
            basic_auth(credentials)
        ));
    }
    request.push_str("\r\n");
    request
}

/// Reads the proxy's response up to the blank line, never past it.
async fn read_response_header(stream: &mut TcpStream) -> Result<String, ConnectError> {
    let mut header = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !header.ends_with(b"\r\n\r\n") {
        if header.len() >= MAX_PROXY_RESPONSE {
            return Err(ConnectError::ProxyRefused(
                "response header too large".to_string(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(ConnectError::ProxyRefused(
                "proxy closed the connection".to_string(),
            ));
        }
        header.push(byte[0]);
    }

    Ok(String::from_utf8_lossy(&header).into_owned())
}

/// A `2xx` status line opens the tunnel.
fn tunnel_accepted(status_line: &str) -> bool {
    let mut parts = status_line.split_whitespace();
    let version_ok = parts
        .next()
        .map(|v| v.starts_with("HTTP/1."))
        .unwrap_or(false);
    let code_ok = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .map(|code| (200..300).contains(&code))
        .unwrap_or(false);
    version_ok && code_ok
}

fn strip_brackets(host: &str) -> &str {
    host.trim_start_matches('[').trim_end_matches(']')
}
