use std::rc::Rc;

use crate::common::ParseResult;
use crate::http::{ReasonTable, StatusCode};
use crate::response::{ResponseError, ResponseState, ResponseWriter, chunked};
use crate::transport::{MemoryTransport, TransportStatus};

fn writer() -> (ResponseWriter, MemoryTransport) {
    let transport = MemoryTransport::new();
    let writer = ResponseWriter::new(Box::new(transport.clone()), Rc::new(ReasonTable::default()));
    (writer, transport)
}

/// Split written bytes into head and body.
fn split(written: &[u8]) -> (&[u8], &[u8]) {
    let pos = written
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    (&written[..pos + 4], &written[pos + 4..])
}

#[test]
fn test_chunked_encode() {
    use bytes::BytesMut;

    macro_rules! test {
        ($input:expr, $expected:literal) => {
            let mut buf = BytesMut::new();
            chunked::encode_chunk($input, &mut buf);
            assert_eq!(&buf[..], $expected);
        };
    }

    test!(b"", b"");
    test!(b"x=1", b"3\r\nx=1\r\n");
    test!(b"hello world!", b"c\r\nhello world!\r\n");
    let long = vec![b'a'; 255];
    let mut buf = BytesMut::new();
    chunked::encode_chunk(&long, &mut buf);
    assert!(buf.starts_with(b"ff\r\naaa"));
    assert!(buf.ends_with(b"a\r\n"));
    assert_eq!(buf.len(), 255 + 6);

    let mut buf = BytesMut::new();
    chunked::encode_last(&mut buf);
    assert_eq!(&buf[..], b"0\r\n\r\n");
}

#[test]
fn test_chunked_decode() {
    macro_rules! test {
        (#[pending] $input:literal) => {
            assert!(chunked::decode($input).is_pending());
        };
        (#[error $err:ident] $input:literal) => {
            match chunked::decode($input) {
                ParseResult::Err(err) => assert_eq!(err, chunked::ChunkError::$err),
                other => panic!("expected `Err`, found {other:?}"),
            }
        };
        ($input:literal, $payload:literal, $consumed:expr) => {
            match chunked::decode($input) {
                ParseResult::Ok((payload, consumed)) => {
                    assert_eq!(&payload[..], $payload);
                    assert_eq!(consumed, $consumed);
                }
                other => panic!("expected `Ok`, found {other:?}"),
            }
        };
    }

    test!(b"0\r\n\r\n", b"", 5);
    test!(b"3\r\nx=1\r\n0\r\n\r\n", b"x=1", 13);
    test!(b"3\r\nabc\r\n2\r\nde\r\n0\r\n\r\nnext", b"abcde", 20);
    test!(b"3;name=value\r\nabc\r\n0\r\n\r\n", b"abc", 24);
    test!(b"3\nabc\n0\n\n", b"abc", 9);
    test!(b"A\r\n0123456789\r\n0\r\nTrailer: x\r\n\r\n", b"0123456789", 32);

    test!(#[pending] b"");
    test!(#[pending] b"3\r\nab");
    test!(#[pending] b"3\r\nabc\r");
    test!(#[pending] b"3\r\nabc\r\n0\r\n");
    test!(#[pending] b"0\r\nTrailer: x\r\n");

    test!(#[error InvalidSize] b"xyz\r\n");
    test!(#[error InvalidSize] b"\r\n");
    test!(#[error MissingDelimiter] b"3\r\nabcd\r\n");

    let mut long = b"3;".to_vec();
    long.resize(chunked::MAX_LINE + 1, b'x');
    assert_eq!(chunked::decode(&long), ParseResult::Err(chunked::ChunkError::LineTooLong));
    long.truncate(chunked::MAX_LINE);
    assert!(chunked::decode(&long).is_pending());
}

#[test]
fn test_chunked_frame() {
    const BODY: &[u8] = b"3\r\nabc\r\n0\r\nTrailer: x\r\n\r\n";

    let ParseResult::Ok(chunked::Frame::Data { data, consumed }) = chunked::frame(BODY) else {
        panic!("expected data frame");
    };
    assert_eq!(&BODY[data], b"abc");
    assert_eq!(consumed, 8);

    assert_eq!(chunked::frame(&BODY[8..]), ParseResult::Ok(chunked::Frame::Last { consumed: 17 }));
    assert!(chunked::frame(&BODY[8..20]).is_pending());
}

#[test]
fn test_response_wire() {
    let (mut res, transport) = writer();

    res.start(StatusCode::OK, [("Content-Type", "text/plain")]).unwrap();
    res.send(b"x=1").unwrap();
    res.end(None).unwrap();

    assert_eq!(
        transport.written_str(),
        "HTTP/1.1 200 Ok\r\n\
        Transfer-Encoding: chunked\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        3\r\nx=1\r\n\
        0\r\n\r\n"
    );
    assert_eq!(res.state(), ResponseState::Ended);
    assert_eq!(res.status(), Some(StatusCode::OK));
    assert_eq!(res.bytes_written(), 3);
    assert_eq!(transport.close_count(), 1);
}

#[test]
fn test_response_body_round_trip() {
    let (mut res, transport) = writer();
    let chunks: [&[u8]; 4] = [b"hello", b"", b" ", b"world"];

    res.start(StatusCode::OK, None::<(&str, &str)>).unwrap();
    for chunk in chunks {
        res.send(chunk).unwrap();
    }
    res.end(Some(&b"!"[..])).unwrap();

    let written = transport.written();
    let (head, body) = split(&written);
    assert!(head.starts_with(b"HTTP/1.1 200 Ok\r\nTransfer-Encoding: chunked\r\n"));

    let ParseResult::Ok((payload, consumed)) = chunked::decode(body) else {
        panic!("incomplete chunked body")
    };
    assert_eq!(&payload[..], b"hello world!");
    assert_eq!(consumed, body.len());
    assert_eq!(res.bytes_written(), 12);
}

#[test]
fn test_response_headers_merge() {
    let (mut res, transport) = writer();

    res.set_header("X-Custom", "preset").unwrap();
    res.set_header("Cache-Control", "no-store").unwrap();
    res.start(
        StatusCode::NOT_FOUND,
        [("x-custom", "ignored"), ("Content-Type", "text/html"), ("Set-Cookie", "a=1"), ("Set-Cookie", "b=2")],
    )
    .unwrap();

    let written = transport.written();
    let (head, _) = split(&written);
    assert_eq!(
        std::str::from_utf8(head).unwrap(),
        "HTTP/1.1 404 Not Found\r\n\
        Transfer-Encoding: chunked\r\n\
        X-Custom: preset\r\n\
        Cache-Control: no-store\r\n\
        Content-Type: text/html\r\n\
        Set-Cookie: a=1\r\n\
        Set-Cookie: b=2\r\n\
        \r\n"
    );

    let headers = res.headers();
    assert_eq!(headers.len(), 5);
    assert_eq!(headers.get("x-custom"), Some("preset"));
    assert_eq!(headers.get("content-type"), Some("text/html"));
}

#[test]
fn test_response_reason_phrase() {
    let mut reasons = ReasonTable::default();
    reasons.set(StatusCode::OK, "Fine");

    let transport = MemoryTransport::new();
    let mut res = ResponseWriter::new(Box::new(transport.clone()), Rc::new(reasons));
    res.start(StatusCode::OK, None::<(&str, &str)>).unwrap();
    assert!(transport.written_str().starts_with("HTTP/1.1 200 Fine\r\n"));

    let (mut res, transport) = writer();
    res.start(StatusCode::from_u16(418).unwrap(), None::<(&str, &str)>).unwrap();
    assert!(transport.written_str().starts_with("HTTP/1.1 418 Unknown\r\n"));
}

#[test]
fn test_response_misuse() {
    let (mut res, transport) = writer();

    assert!(matches!(res.send(b"early"), Err(ResponseError::NotStarted)));
    assert!(matches!(res.end(None), Err(ResponseError::NotStarted)));
    assert_eq!(res.state(), ResponseState::NotStarted);
    assert!(transport.written().is_empty());

    res.start(StatusCode::OK, None::<(&str, &str)>).unwrap();
    let head_len = transport.written().len();

    assert!(matches!(res.start(StatusCode::OK, None::<(&str, &str)>), Err(ResponseError::AlreadyStarted)));
    assert!(matches!(res.set_header("X-Late", "1"), Err(ResponseError::AlreadyStarted)));
    assert_eq!(transport.written().len(), head_len);

    res.end(Some(&b"done"[..])).unwrap();
    let total = transport.written().len();

    assert!(matches!(res.send(b"late"), Err(ResponseError::AlreadyEnded)));
    assert!(matches!(res.end(None), Err(ResponseError::AlreadyEnded)));
    assert_eq!(transport.written().len(), total);
    assert_eq!(transport.close_count(), 1);
    assert_eq!(res.bytes_written(), 4);
}

#[test]
fn test_response_abort() {
    let (mut res, transport) = writer();

    res.start(StatusCode::OK, None::<(&str, &str)>).unwrap();
    res.send(b"partial").unwrap();
    res.abort();
    res.abort();

    assert_eq!(res.state(), ResponseState::Ended);
    assert_eq!(transport.close_count(), 1);
    assert!(!transport.written_str().ends_with("0\r\n\r\n"));
    assert!(matches!(res.end(None), Err(ResponseError::AlreadyEnded)));
}

#[test]
fn test_response_transport_failure() {
    let (mut res, transport) = writer();

    res.start(StatusCode::OK, None::<(&str, &str)>).unwrap();
    transport.set_status(TransportStatus::Failed);
    assert_eq!(res.transport_status(), TransportStatus::Failed);

    assert!(matches!(res.send(b"lost"), Err(ResponseError::Transport(_))));
    assert_eq!(res.bytes_written(), 0);

    assert!(matches!(res.end(None), Err(ResponseError::Transport(_))));
    assert_eq!(res.state(), ResponseState::Ended);
    assert_eq!(transport.close_count(), 1);
}
