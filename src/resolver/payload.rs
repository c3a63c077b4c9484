use bytes::{Bytes, BytesMut};
use futures::StreamExt as _;

use crate::{error::StoreError, utils::BoxStream};

/// An HTTP-shaped response produced by the resolver.
///
/// Both installations speak this type: the service worker converts it into
/// a real `Response`, the in-process hook hands it to the caller directly.
pub struct Payload {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Body,
}

pub enum Body {
    Empty,
    Full(Bytes),
    /// A finite, non-restartable sequence of shard-sized buffers, delivered
    /// in offset order.
    Stream(BoxStream<'static, Result<Bytes, StoreError>>),
}

impl Payload {
    pub fn full(bytes: Bytes) -> Self {
        let len = bytes.len();
        Payload {
            status: 200,
            headers: vec![
                ("Content-Type".into(), "application/octet-stream".into()),
                ("Content-Length".into(), len.to_string()),
            ],
            body: Body::Full(bytes),
        }
    }

    /// A 200 whose body arrives as a stream of shard-sized buffers.
    /// `size` is the logical file size, not the shard total.
    pub fn stream(
        size: u64,
        accept_ranges: bool,
        stream: BoxStream<'static, Result<Bytes, StoreError>>,
    ) -> Self {
        let mut headers = vec![
            ("Content-Type".into(), "application/octet-stream".into()),
            ("Content-Length".into(), size.to_string()),
        ];
        if accept_ranges {
            headers.push(("Accept-Ranges".into(), "bytes".into()));
        }
        Payload {
            status: 200,
            headers,
            body: Body::Stream(stream),
        }
    }

    pub fn partial(start: u64, end: u64, size: u64, bytes: Bytes) -> Self {
        Payload {
            status: 206,
            headers: vec![
                ("Content-Type".into(), "application/octet-stream".into()),
                ("Content-Length".into(), (end - start + 1).to_string()),
                (
                    "Content-Range".into(),
                    format!("bytes {start}-{end}/{size}"),
                ),
            ],
            body: Body::Full(bytes),
        }
    }

    pub fn not_satisfiable(size: u64) -> Self {
        Payload {
            status: 416,
            headers: vec![("Content-Range".into(), format!("bytes */{size}"))],
            body: Body::Empty,
        }
    }

    pub fn not_found() -> Self {
        Payload {
            status: 404,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Internal failure with literally no bytes to produce. The browser
    /// installation never throws; it answers with this instead.
    pub fn internal_error(reason: impl std::fmt::Display) -> Self {
        crate::warn!("resolver error: {reason}");
        Payload {
            status: 502,
            headers: Vec::new(),
            body: Body::Empty,
        }
    }

    /// Re-emit an upstream response as a fresh payload the resolver owns.
    /// The body is copied out so no upstream policy travels with it.
    pub fn proxied(status: u16, bytes: Bytes) -> Self {
        let len = bytes.len();
        Payload {
            status,
            headers: vec![
                ("Content-Type".into(), "application/octet-stream".into()),
                ("Content-Length".into(), len.to_string()),
            ],
            body: Body::Full(bytes),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Drain the body into one buffer. Streaming bodies are consumed.
    pub async fn collect(self) -> Result<Bytes, StoreError> {
        match self.body {
            Body::Empty => Ok(Bytes::new()),
            Body::Full(bytes) => Ok(bytes),
            Body::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }
}

/// Outcome of parsing a `Range` request header against a known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSpec {
    /// No header, or one too malformed to honor: serve the full body.
    Full,
    /// Inclusive byte window, already clamped to `size - 1`.
    Window(u64, u64),
    /// Syntactically valid but outside the file.
    Unsatisfiable,
}

/// Parse a `Range: bytes=...` header. Only single ranges are honored;
/// multipart ranges fall back to a full response, which is always a valid
/// answer.
pub fn parse_range(header: Option<&str>, size: u64) -> RangeSpec {
    let Some(header) = header else {
        return RangeSpec::Full;
    };
    let Some(spec) = header.trim().strip_prefix("bytes=") else {
        return RangeSpec::Full;
    };
    if spec.contains(',') {
        return RangeSpec::Full;
    }
    let Some((start_s, end_s)) = spec.split_once('-') else {
        return RangeSpec::Full;
    };
    let start_s = start_s.trim();
    let end_s = end_s.trim();

    if start_s.is_empty() {
        // Suffix form: the final N bytes.
        let Ok(n) = end_s.parse::<u64>() else {
            return RangeSpec::Full;
        };
        if n == 0 || size == 0 {
            return RangeSpec::Unsatisfiable;
        }
        return RangeSpec::Window(size.saturating_sub(n), size - 1);
    }

    let Ok(start) = start_s.parse::<u64>() else {
        return RangeSpec::Full;
    };
    if start >= size {
        return RangeSpec::Unsatisfiable;
    }
    let end = if end_s.is_empty() {
        size - 1
    } else {
        match end_s.parse::<u64>() {
            Ok(end) if end >= start => end.min(size - 1),
            _ => return RangeSpec::Full,
        }
    };
    RangeSpec::Window(start, end)
}
