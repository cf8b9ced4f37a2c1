use crate::config::WsOptions;
use crate::error::Error;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use bytes::BytesMut;
use httparse::Status;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const PERMESSAGE_DEFLATE: &str = "permessage-deflate";

// Limit the maximum amount of data read to prevent a denial of service attack.
const MAX_REQUEST_SIZE: usize = 1024 * 16;
const MAX_HEADERS: usize = 32;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error("request method must be GET")]
    InvalidMethod,

    #[error("missing Host header in the request")]
    MissingHost,

    #[error("invalid value for header 'Upgrade'")]
    InvalidUpgradeHeader,

    #[error("invalid value for header 'Connection'")]
    InvalidConnectionHeader,

    #[error("missing or empty Sec-WebSocket-Key header")]
    MissingSecWebsocketKey,

    #[error("unsupported Sec-WebSocket-Version, need 13")]
    InvalidVersion,

    #[error("origin not allowed")]
    OriginNotAllowed,

    #[error("client sent data before handshake is complete")]
    DataBeforeHandshake,

    #[error("request bigger than maximum allowed")]
    RequestTooLarge,

    #[error("incomplete HTTP request")]
    IncompleteRequest,

    #[error("{source}")]
    ParseError {
        #[from]
        source: httparse::Error,
    },
}

impl HandshakeError {
    fn http_status(&self) -> (u16, &'static str) {
        match self {
            HandshakeError::InvalidMethod => (405, "Method Not Allowed"),
            HandshakeError::OriginNotAllowed => (403, "Forbidden"),
            _ => (400, "Bad Request"),
        }
    }
}

/// Outcome of a completed upgrade: the stream handed back to the caller and
/// whether permessage-deflate was negotiated. Ownership of the stream moves
/// to the broker's client factory from here.
pub struct HandshakeResult<S> {
    pub stream: S,
    pub compression: bool,
}

/// Validates and completes the opening HTTP exchange on `stream`, per
/// RFC 6455 section 4.2. On success the 101 response has been written and
/// the raw stream is returned with the negotiated compression flag; any
/// failure before that point answers with a plain HTTP error response and
/// closes the stream.
pub async fn upgrade_connection<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    opts: &WsOptions,
) -> Result<HandshakeResult<S>, Error> {
    let mut request_buf = BytesMut::with_capacity(1024);

    let (accept_value, compression, residual) = loop {
        let mut tmp_buf = vec![0; 1024];
        let n = stream.read(&mut tmp_buf).await?;
        if n == 0 {
            return reject(stream, HandshakeError::IncompleteRequest).await;
        }
        request_buf.extend_from_slice(&tmp_buf[..n]);
        if request_buf.len() > MAX_REQUEST_SIZE {
            return reject(stream, HandshakeError::RequestTooLarge).await;
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&request_buf) {
            Ok(Status::Complete(parsed_len)) => {
                match validate_request(&request, opts) {
                    Ok((accept_value, compression)) => {
                        break (accept_value, compression, request_buf.len() - parsed_len)
                    }
                    Err(err) => return reject(stream, err).await,
                }
            }
            Ok(Status::Partial) => continue,
            Err(source) => return reject(stream, HandshakeError::ParseError { source }).await,
        }
    };

    // At this point we own the raw byte stream. A client that pipelined
    // frames behind the request would desynchronize the frame decoder, so
    // any residual bytes fail the handshake.
    if residual != 0 {
        return reject(stream, HandshakeError::DataBeforeHandshake).await;
    }

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        accept_value
    );
    if compression {
        response.push_str(
            "Sec-WebSocket-Extensions: permessage-deflate; \
             server_no_context_takeover; client_no_context_takeover\r\n",
        );
    }
    response.push_str("\r\n");

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;

    Ok(HandshakeResult {
        stream,
        compression,
    })
}

fn validate_request(
    request: &httparse::Request<'_, '_>,
    opts: &WsOptions,
) -> Result<(String, bool), HandshakeError> {
    if request.method != Some("GET") {
        return Err(HandshakeError::InvalidMethod);
    }

    let host = header_value(request, "Host").unwrap_or_default();
    if host.is_empty() {
        return Err(HandshakeError::MissingHost);
    }

    if !any_header_contains_token(request, "Upgrade", "websocket") {
        return Err(HandshakeError::InvalidUpgradeHeader);
    }

    if !any_header_contains_token(request, "Connection", "Upgrade") {
        return Err(HandshakeError::InvalidConnectionHeader);
    }

    let key = header_value(request, "Sec-WebSocket-Key").unwrap_or_default();
    if key.is_empty() {
        return Err(HandshakeError::MissingSecWebsocketKey);
    }

    if !any_header_contains_token(request, "Sec-WebSocket-Version", "13") {
        return Err(HandshakeError::InvalidVersion);
    }

    if opts.check_origin {
        check_origin(request, opts, host)?;
    }

    // The server offers no extension parameters of its own; it only needs
    // the client to have listed permessage-deflate among its offers.
    let compression = opts.compression && offers_permessage_deflate(request);

    Ok((generate_websocket_accept_value(key), compression))
}

// A browser that sends no Origin at all is allowed; anything else must
// match the configured origin, or the request's own Host when none was
// configured.
fn check_origin(
    request: &httparse::Request<'_, '_>,
    opts: &WsOptions,
    host: &str,
) -> Result<(), HandshakeError> {
    let origin = match header_value(request, "Origin") {
        Some(origin) if !origin.is_empty() => origin,
        _ => return Ok(()),
    };

    let origin_url = Url::parse(origin).map_err(|_| HandshakeError::OriginNotAllowed)?;
    let origin_host = origin_url.host_str().unwrap_or_default();

    let expected = if !opts.origin.is_empty() {
        opts.origin.as_str()
    } else {
        host_without_port(host)
    };

    if !origin_host.eq_ignore_ascii_case(expected) {
        return Err(HandshakeError::OriginNotAllowed);
    }
    Ok(())
}

fn host_without_port(host: &str) -> &str {
    // Bracketed IPv6 literals keep their colons.
    if let Some(stripped) = host.strip_prefix('[') {
        return stripped.split(']').next().unwrap_or(stripped);
    }
    host.split(':').next().unwrap_or(host)
}

fn header_value<'b>(request: &httparse::Request<'_, 'b>, name: &str) -> Option<&'b str> {
    request
        .headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .and_then(|header| std::str::from_utf8(header.value).ok())
        .map(str::trim)
}

// Comma-separated token matching across every instance of the header, the
// way proxies are allowed to split and merge them.
fn any_header_contains_token(
    request: &httparse::Request<'_, '_>,
    name: &str,
    token: &str,
) -> bool {
    request
        .headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .filter_map(|header| std::str::from_utf8(header.value).ok())
        .any(|value| contains_token(value, token))
}

fn contains_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

// Each comma-separated extension offer is an extension name followed by
// ';'-separated parameters; only the name matters here.
fn offers_permessage_deflate(request: &httparse::Request<'_, '_>) -> bool {
    request
        .headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case("Sec-WebSocket-Extensions"))
        .filter_map(|header| std::str::from_utf8(header.value).ok())
        .flat_map(|value| value.split(','))
        .any(|offer| {
            offer
                .split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .eq_ignore_ascii_case(PERMESSAGE_DEFLATE)
        })
}

pub(crate) fn generate_websocket_accept_value(key: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(key.as_bytes());
    sha1.update(WS_GUID.as_bytes());
    BASE64_STANDARD.encode(sha1.finalize())
}

// Answers a failed handshake with a plain HTTP error and surfaces the
// failure. The response write is best effort, the connection is going away
// either way.
async fn reject<S: AsyncRead + AsyncWrite + Unpin, T>(
    mut stream: S,
    err: HandshakeError,
) -> Result<T, Error> {
    let (status, text) = err.http_status();
    let body = format!("{} {}\n", status, text);
    let response = format!(
        "HTTP/1.1 {} {}\r\n\
         Content-Type: text/plain; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {}",
        status,
        text,
        body.len(),
        body
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    Err(Error::Handshake { source: err })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsOptions;
    use tokio::io::duplex;

    const REQUEST: &str = "GET /ws HTTP/1.1\r\n\
        Host: broker.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    async fn run_upgrade(
        request: &str,
        opts: WsOptions,
    ) -> (Result<bool, Error>, Vec<u8>) {
        let (mut client, server) = duplex(4096);
        client.write_all(request.as_bytes()).await.unwrap();

        let result = upgrade_connection(server, &opts).await;

        let mut response = vec![0u8; 4096];
        let n = client.read(&mut response).await.unwrap_or(0);
        response.truncate(n);
        (result.map(|handshake| handshake.compression), response)
    }

    #[test]
    fn test_accept_value() {
        // Known pair from RFC 6455 section 1.3.
        assert_eq!(
            generate_websocket_accept_value("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_contains_token() {
        assert!(contains_token("keep-alive, Upgrade", "upgrade"));
        assert!(contains_token("Upgrade", "upgrade"));
        assert!(!contains_token("keep-alive", "upgrade"));
        assert!(!contains_token("upgraded", "upgrade"));
    }

    #[tokio::test]
    async fn test_successful_upgrade() {
        let (result, response) = run_upgrade(REQUEST, WsOptions::default()).await;
        assert!(!result.unwrap());

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Upgrade: websocket\r\n"));
        assert!(response.contains("Connection: Upgrade\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(!response.contains("Sec-WebSocket-Extensions"));
    }

    #[tokio::test]
    async fn test_compression_negotiation() {
        let request = REQUEST.replace(
            "\r\n\r\n",
            "\r\nSec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\r\n",
        );
        let opts = WsOptions {
            compression: true,
            ..Default::default()
        };
        let (result, response) = run_upgrade(&request, opts).await;
        assert!(result.unwrap());

        let response = String::from_utf8(response).unwrap();
        assert!(response.contains(
            "Sec-WebSocket-Extensions: permessage-deflate; \
             server_no_context_takeover; client_no_context_takeover\r\n"
        ));
    }

    #[tokio::test]
    async fn test_compression_needs_client_offer() {
        let opts = WsOptions {
            compression: true,
            ..Default::default()
        };
        let (result, _) = run_upgrade(REQUEST, opts).await;
        // Server-side compression enabled but the client never offered it.
        assert!(!result.unwrap());
    }

    #[tokio::test]
    async fn test_non_get_method_rejected() {
        let request = REQUEST.replace("GET ", "POST ");
        let (result, response) = run_upgrade(&request, WsOptions::default()).await;
        assert!(result.is_err());

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(response.ends_with("405 Method Not Allowed\n"));
    }

    #[tokio::test]
    async fn test_missing_key_rejected() {
        let request = REQUEST.replace("Sec-WebSocket-Key", "X-Not-The-Key");
        let (result, response) = run_upgrade(&request, WsOptions::default()).await;
        match result.unwrap_err() {
            Error::Handshake { source } => {
                assert!(matches!(source, HandshakeError::MissingSecWebsocketKey))
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(String::from_utf8(response)
            .unwrap()
            .starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_data_before_handshake_rejected() {
        let mut request = REQUEST.to_string();
        request.push_str("EARLY FRAME BYTES");
        let (result, response) = run_upgrade(&request, WsOptions::default()).await;
        match result.unwrap_err() {
            Error::Handshake { source } => {
                assert!(matches!(source, HandshakeError::DataBeforeHandshake))
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(String::from_utf8(response)
            .unwrap()
            .starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn test_origin_checking() {
        let allowed = REQUEST.replace(
            "\r\n\r\n",
            "\r\nOrigin: https://broker.example.com\r\n\r\n",
        );
        let opts = WsOptions {
            check_origin: true,
            ..Default::default()
        };
        let (result, _) = run_upgrade(&allowed, opts.clone()).await;
        assert!(result.is_ok());

        let denied = REQUEST.replace("\r\n\r\n", "\r\nOrigin: https://evil.example\r\n\r\n");
        let (result, response) = run_upgrade(&denied, opts.clone()).await;
        assert!(result.is_err());
        assert!(String::from_utf8(response)
            .unwrap()
            .starts_with("HTTP/1.1 403 Forbidden\r\n"));

        // Explicitly configured origin wins over the Host fallback.
        let configured = WsOptions {
            check_origin: true,
            origin: "evil.example".to_string(),
            ..Default::default()
        };
        let (result, _) = run_upgrade(&denied, configured).await;
        assert!(result.is_ok());

        // No Origin header at all is always acceptable.
        let (result, _) = run_upgrade(REQUEST, opts).await;
        assert!(result.is_ok());
    }
}
