//! HTTP/1.1-style heads carried in text frames.
//!
//! A head is a start line and one `Name: value` line per header value, each
//! ending in `\n`, followed by a blank line. Heads travel as text frames;
//! bodies travel as binary frames and end at the next text frame.

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{Method, Request, Response, StatusCode, Uri, Version};
use tokio::sync::mpsc;

use crate::channel::Frame;
use crate::error::{FramingError, TransportError};
use crate::flow::MTU;

pub const MAX_HEAD_BYTES: usize = 64 * MTU;

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub uri: Uri,
    pub version: Version,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub fn into_request<B>(self, body: B) -> Request<B> {
        let mut request = Request::new(body);
        *request.method_mut() = self.method;
        *request.uri_mut() = self.uri;
        *request.version_mut() = self.version;
        *request.headers_mut() = self.headers;
        request
    }
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ResponseHead {
    pub fn into_response<B>(self, body: B) -> Response<B> {
        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

pub fn encode_request_head(
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
) -> Result<String, FramingError> {
    let target = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let mut head = format!("{method} {target} HTTP/1.1\n");
    encode_headers(&mut head, headers)?;
    head.push('\n');
    Ok(head)
}

pub fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
) -> Result<String, FramingError> {
    let mut head = format!(
        "HTTP/1.1 {} {}\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    encode_headers(&mut head, headers)?;
    head.push('\n');
    Ok(head)
}

fn encode_headers(out: &mut String, headers: &HeaderMap) -> Result<(), FramingError> {
    for (name, value) in headers {
        let value = value
            .to_str()
            .map_err(|_| FramingError::InvalidHeaderValue(name.to_string()))?;
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(value);
        out.push('\n');
    }
    Ok(())
}

pub fn parse_request_head(head: &str) -> Result<RequestHead, FramingError> {
    let mut lines = head_lines(head);
    let start = lines.next().unwrap_or_default();
    let mut parts = start.split(' ');
    let (Some(method), Some(target), Some(proto), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(FramingError::MalformedStartLine(start.to_string()));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| FramingError::MalformedStartLine(start.to_string()))?;
    let uri: Uri = target
        .parse()
        .map_err(|_| FramingError::MalformedStartLine(start.to_string()))?;
    let version = parse_version(proto)?;
    let headers = parse_headers(lines)?;
    Ok(RequestHead {
        method,
        uri,
        version,
        headers,
    })
}

pub fn parse_response_head(head: &str) -> Result<ResponseHead, FramingError> {
    let mut lines = head_lines(head);
    let start = lines.next().unwrap_or_default();
    let (proto, rest) = start
        .split_once(' ')
        .ok_or_else(|| FramingError::MalformedStartLine(start.to_string()))?;
    parse_version(proto)?;
    let code = rest.split(' ').next().unwrap_or_default();
    let status = code
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| FramingError::MalformedStartLine(start.to_string()))?;
    let headers = parse_headers(lines)?;
    Ok(ResponseHead { status, headers })
}

fn head_lines(head: &str) -> impl Iterator<Item = &str> {
    head.split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .take_while(|line| !line.is_empty())
}

fn parse_version(proto: &str) -> Result<Version, FramingError> {
    match proto {
        "HTTP/1.1" => Ok(Version::HTTP_11),
        "HTTP/1.0" => Ok(Version::HTTP_10),
        other => Err(FramingError::UnsupportedVersion(other.to_string())),
    }
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Result<HeaderMap, FramingError> {
    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| FramingError::MalformedHeader(line.to_string()))?;
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FramingError::InvalidHeaderName(name.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| FramingError::InvalidHeaderValue(name.to_string()))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Collects text frames until a complete head has arrived.
#[derive(Debug, Default)]
pub struct HeadAccumulator {
    buf: String,
}

impl HeadAccumulator {
    pub fn push(&mut self, frame: Frame) -> Result<Option<String>, FramingError> {
        let text = match frame {
            Frame::Text(text) => text,
            Frame::Binary(_) => return Err(FramingError::BinaryInHead),
        };
        // a stray end-of-body marker between messages
        if text.is_empty() && self.buf.is_empty() {
            return Ok(None);
        }
        let mut search_from = self.buf.len().saturating_sub(1);
        while !self.buf.is_char_boundary(search_from) {
            search_from -= 1;
        }
        self.buf.push_str(&text);
        if self.buf.len() > MAX_HEAD_BYTES {
            return Err(FramingError::HeadTooLarge(MAX_HEAD_BYTES));
        }
        let Some(offset) = self.buf[search_from..].find("\n\n") else {
            return Ok(None);
        };
        let end = search_from + offset + 2;
        if end != self.buf.len() {
            return Err(FramingError::TrailingData);
        }
        Ok(Some(std::mem::take(&mut self.buf)))
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// Reads one head from `frames`. `Ok(None)` means the channel closed cleanly
/// between messages.
pub(crate) async fn read_head(
    frames: &mut mpsc::UnboundedReceiver<Frame>,
) -> Result<Option<String>, TransportError> {
    let mut accumulator = HeadAccumulator::default();
    loop {
        let Some(frame) = frames.recv().await else {
            if accumulator.is_empty() {
                return Ok(None);
            }
            return Err(FramingError::Truncated.into());
        };
        if let Some(head) = accumulator.push(frame)? {
            return Ok(Some(head));
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::header::{ACCEPT, CONTENT_TYPE};

    use super::*;
    use crate::channel::memory;
    use crate::flow::FlowControlledWriter;

    #[test_timeout::tokio_timeout_test(10)]
    async fn request_round_trip_over_frames() {
        let (a, mut b) = memory::pair();
        let writer = FlowControlledWriter::new(a.link.sink.clone(), a.link.low_water.clone());

        let mut headers = HeaderMap::new();
        headers.append(ACCEPT, HeaderValue::from_static("text/plain"));
        headers.append("x-multi", HeaderValue::from_static("one"));
        headers.append("x-multi", HeaderValue::from_static("two"));
        let uri: Uri = "/upload/file.txt?overwrite=1".parse().expect("uri");
        let body = vec![42u8; MTU + 100];

        let head = encode_request_head(&Method::PUT, &uri, &headers).expect("encode");
        writer.write_text(&head).await.expect("head");
        writer.write_binary(&body).await.expect("body");
        writer.write_eof().await.expect("eof");

        let head = read_head(&mut b.link.frames).await.expect("read").expect("head");
        let parsed = parse_request_head(&head).expect("parse");
        assert_eq!(parsed.method, Method::PUT);
        assert_eq!(parsed.uri, uri);
        assert_eq!(parsed.version, Version::HTTP_11);
        let multi: Vec<_> = parsed.headers.get_all("x-multi").iter().collect();
        assert_eq!(multi, vec!["one", "two"]);
        assert_eq!(parsed.headers[ACCEPT], "text/plain");

        let mut received = Vec::new();
        loop {
            match b.link.frames.recv().await.expect("frame") {
                Frame::Binary(chunk) => {
                    assert!(chunk.len() <= MTU);
                    received.extend_from_slice(&chunk);
                }
                Frame::Text(text) => {
                    assert!(text.is_empty());
                    break;
                }
            }
        }
        assert_eq!(received, body);
    }

    #[test_timeout::timeout]
    fn response_head_round_trip() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let head = encode_response_head(StatusCode::NOT_FOUND, &headers).expect("encode");
        assert_eq!(head, "HTTP/1.1 404 Not Found\ncontent-type: application/json\n\n");
        let parsed = parse_response_head(&head).expect("parse");
        assert_eq!(parsed.status, StatusCode::NOT_FOUND);
        assert_eq!(parsed.headers[CONTENT_TYPE], "application/json");
    }

    #[test_timeout::timeout]
    fn head_split_across_frames_is_reassembled() {
        let mut acc = HeadAccumulator::default();
        assert_eq!(acc.push(Frame::Text("GET / HTTP/1.1\n".into())), Ok(None));
        assert_eq!(acc.push(Frame::Text("host: x\n".into())), Ok(None));
        assert_eq!(
            acc.push(Frame::Text("\n".into())),
            Ok(Some("GET / HTTP/1.1\nhost: x\n\n".to_string()))
        );
        assert!(acc.is_empty());
    }

    #[test_timeout::timeout]
    fn binary_frame_inside_head_is_rejected() {
        let mut acc = HeadAccumulator::default();
        acc.push(Frame::Text("GET / HTTP/1.1\n".into())).expect("text");
        assert_eq!(
            acc.push(Frame::Binary(Bytes::from_static(b"oops"))),
            Err(FramingError::BinaryInHead)
        );
    }

    #[test_timeout::timeout]
    fn oversized_head_is_rejected() {
        let mut acc = HeadAccumulator::default();
        let chunk = "a".repeat(MTU);
        let mut result = Ok(None);
        for _ in 0..=64 {
            result = acc.push(Frame::Text(chunk.clone()));
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result, Err(FramingError::HeadTooLarge(MAX_HEAD_BYTES)));
    }

    #[test_timeout::timeout]
    fn malformed_heads_are_rejected() {
        assert!(matches!(
            parse_request_head("GET /\n\n"),
            Err(FramingError::MalformedStartLine(_))
        ));
        assert!(matches!(
            parse_request_head("GET / HTTP/2\n\n"),
            Err(FramingError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            parse_request_head("GET / HTTP/1.1\nno-colon\n\n"),
            Err(FramingError::MalformedHeader(_))
        ));
        assert!(matches!(
            parse_request_head("GET / HTTP/1.1\nbad name: v\n\n"),
            Err(FramingError::InvalidHeaderName(_))
        ));
        assert!(matches!(
            parse_response_head("HTTP/1.1 abc Nope\n\n"),
            Err(FramingError::MalformedStartLine(_))
        ));
    }
}
