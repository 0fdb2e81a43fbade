//! Upgrade-handshake requests.
//!
//! A connection setup that rides on an HTTP-style upgrade encodes the
//! request's method, path, headers, and body length into wire form, and
//! the acceptor parses the same form back. Users may install a transform
//! that edits the request before it is sent (to add signing headers and
//! the like); a failing transform aborts the setup attempt with
//! [`ERROR_CALLBACK_EXCEPTION`](crate::error::ERROR_CALLBACK_EXCEPTION).

use crate::error::{Error, Result, translate_to_native};
use crate::headers::{Headers, Request};
use crate::lock::HostRuntime;

const VERSION: &str = "HTTP/1.1";
const BODY_LENGTH: &str = "Content-Length";

/// A user-supplied hook that edits a handshake request in place.
pub type HandshakeTransform = Box<dyn FnMut(&mut Request) -> Result<()> + Send>;

/// Encode `request` into its upgrade-request wire form.
///
/// The body contributes only its length: an explicit `Content-Length`
/// header derived from the body's length hint (streaming bodies of
/// unknown length get none).
///
/// # Errors
/// [`Error::InvalidArgument`] if the method, path, or a header contains
/// line-break characters.
pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    fn clean(field: &str, value: &str) -> Result<()> {
        if value.contains(['\r', '\n']) {
            return Err(Error::InvalidArgument(format!(
                "{field} contains line break"
            )));
        }
        Ok(())
    }

    clean("method", &request.method)?;
    clean("path", &request.path)?;
    if request.method.is_empty() || request.path.is_empty() {
        return Err(Error::InvalidArgument(
            "handshake request needs method and path".into(),
        ));
    }

    let mut out = Vec::new();
    out.extend_from_slice(request.method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(request.path.as_bytes());
    out.push(b' ');
    out.extend_from_slice(VERSION.as_bytes());
    out.extend_from_slice(b"\r\n");
    for (name, value) in &request.headers {
        clean("header name", name)?;
        clean("header value", value)?;
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    if let Some(len) = request.body.as_ref().and_then(crate::headers::Body::len_hint) {
        out.extend_from_slice(BODY_LENGTH.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(len.to_string().as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    Ok(out)
}

/// Parse an encoded handshake request back into its fields.
///
/// The `Content-Length` derived from the body at encode time comes back
/// as an ordinary header; `body` on the result is always `None`.
///
/// # Errors
/// [`Error::InvalidArgument`] on malformed input.
pub fn parse_request(wire: &[u8]) -> Result<Request> {
    let text = std::str::from_utf8(wire)
        .map_err(|_| Error::InvalidArgument("handshake is not UTF-8".into()))?;
    let mut lines = text.split("\r\n");
    let start = lines
        .next()
        .ok_or_else(|| Error::InvalidArgument("empty handshake".into()))?;
    let mut parts = start.splitn(3, ' ');
    let method = parts
        .next()
        .filter(|m| !m.is_empty())
        .ok_or_else(|| Error::InvalidArgument("missing method".into()))?;
    let path = parts
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::InvalidArgument("missing path".into()))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::InvalidArgument("missing version".into()))?;
    if version != VERSION {
        return Err(Error::InvalidArgument(format!(
            "unsupported version {version:?}"
        )));
    }

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidArgument(format!("malformed header line {line:?}")))?;
        headers.append(name.trim(), value.trim());
    }

    Ok(Request {
        method: method.to_owned(),
        path: path.to_owned(),
        headers,
        body: None,
    })
}

/// Run a user transform over `request` before the handshake is sent.
///
/// On failure the error goes to the unraisable sink and the native
/// callback-exception code is returned; the caller must abort the setup
/// attempt (no further callbacks for it may be delivered).
pub fn apply_transform(
    host: &HostRuntime,
    request: &mut Request,
    transform: &mut HandshakeTransform,
) -> i32 {
    match transform(request) {
        Ok(()) => tether_core::OK,
        Err(err) => {
            let code = translate_to_native(&Error::Callback(err.to_string()));
            host.unraisable(&err);
            code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR_CALLBACK_EXCEPTION;
    use crate::headers::Body;

    #[test]
    fn round_trip_preserves_fields() {
        let mut request = Request::new("GET", "/mqtt?session=1");
        request.headers.append("Host", "broker.example");
        request.headers.append("Upgrade", "websocket");
        request.headers.append("X-Multi", "a");
        request.headers.append("X-Multi", "b");
        request.body = Some(Body::Buffer(vec![0; 42]));

        let wire = encode_request(&request).expect("encode");
        let parsed = parse_request(&wire).expect("parse");

        assert_eq!(parsed.method, "GET");
        assert_eq!(parsed.path, "/mqtt?session=1");
        assert_eq!(parsed.headers.get("host"), Some("broker.example"));
        assert_eq!(parsed.headers.count_with_name("x-multi"), 2);
        assert_eq!(parsed.headers.get("content-length"), Some("42"));
    }

    #[test]
    fn line_breaks_are_rejected() {
        let mut request = Request::new("GET", "/ok");
        request.headers.append("X-Bad", "a\r\nX-Smuggled: b");
        assert!(matches!(
            encode_request(&request),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn malformed_wire_is_rejected() {
        assert!(parse_request(b"").is_err());
        assert!(parse_request(b"GET /x HTTP/0.9\r\n\r\n").is_err());
        assert!(parse_request(b"GET /x HTTP/1.1\r\nbroken line\r\n\r\n").is_err());
    }

    #[test]
    fn failing_transform_reports_callback_exception() {
        let host = HostRuntime::new();
        let seen = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let seen2 = std::sync::Arc::clone(&seen);
        host.set_unraisable_sink(Some(Box::new(move |_| {
            seen2.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        })));

        let mut request = Request::new("GET", "/mqtt");
        let mut transform: HandshakeTransform =
            Box::new(|_| Err(Error::InvalidArgument("signing failed".into())));
        let code = apply_transform(&host, &mut request, &mut transform);
        assert_eq!(code, ERROR_CALLBACK_EXCEPTION);
        assert_eq!(seen.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn successful_transform_edits_in_place() {
        let host = HostRuntime::new();
        let mut request = Request::new("GET", "/mqtt");
        let mut transform: HandshakeTransform = Box::new(|r| {
            r.headers.set("Authorization", "Signature abc");
            Ok(())
        });
        assert_eq!(apply_transform(&host, &mut request, &mut transform), 0);
        assert_eq!(request.headers.get("authorization"), Some("Signature abc"));
    }
}
