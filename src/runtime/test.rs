use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::common::ParseResult;
use crate::config::Config;
use crate::connection::ConnId;
use crate::defer::{DeferMode, FailureReason, wait};
use crate::handler::{Flow, Handler};
use crate::http::StatusCode;
use crate::response::chunked;
use crate::routing::{RouteTable, Router};
use crate::runtime::{Event, Inbox, Runtime};
use crate::transport::{MemoryTransport, TransportStatus};

fn runtime(table: RouteTable) -> (Runtime, Inbox) {
    Runtime::new(Router::new(table), Config::default())
}

fn connect(rt: &mut Runtime) -> (ConnId, MemoryTransport) {
    let transport = MemoryTransport::new();
    let id = rt.connect(Box::new(transport.clone()));
    (id, transport)
}

fn text(body: &'static str) -> Handler {
    Handler::new(move |cx| {
        cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
        cx.send(body)?;
        cx.end(None)?;
        Ok(Flow::Done)
    })
}

/// Returns the de-chunked body of a complete response.
fn body_of(written: &[u8]) -> Vec<u8> {
    let pos = written.windows(4).position(|w| w == b"\r\n\r\n").expect("header terminator");
    match chunked::decode(&written[pos + 4..]) {
        ParseResult::Ok((payload, _)) => payload.to_vec(),
        other => panic!("incomplete chunked body: {other:?}"),
    }
}

fn echo() -> Handler {
    Handler::new(|cx| {
        let x = cx.param("x").unwrap_or_default().to_owned();
        cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
        cx.send(format!("x={x}"))?;
        cx.end(None)?;
        Ok(Flow::Done)
    })
}

#[test]
fn test_echo() {
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/echo", echo()).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET /echo?x=1 HTTP/1.1\r\nHost: h\r\n\r\n");

    assert_eq!(
        transport.written_str(),
        "HTTP/1.1 200 Ok\r\n\
        Transfer-Encoding: chunked\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        3\r\nx=1\r\n\
        0\r\n\r\n"
    );
    assert_eq!(transport.close_count(), 1);
    assert!(rt.connection(id).is_none());
    assert!(rt.is_empty());
}

#[test]
fn test_echo_fragmented() {
    const INPUT: &[u8] = b"GET /echo?x=1 HTTP/1.1\r\nHost: h\r\n\r\n";

    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/echo", echo()).unwrap());
    let (id, transport) = connect(&mut rt);

    for byte in INPUT.chunks(1) {
        assert!(transport.written().is_empty());
        rt.feed(id, byte);
    }

    assert_eq!(body_of(&transport.written()), b"x=1");
    assert!(rt.is_empty());
}

#[test]
fn test_post_merge() {
    let handler = Handler::new(|cx| {
        let params = cx.params();
        let a = params.get("a").map(|v| v.as_slice().join(",")).unwrap_or_default();
        let b = params.get("b").map(|v| v.as_slice().join(",")).unwrap_or_default();
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        cx.end(Some(format!("a={a} b=[{b}]").as_bytes()))?;
        Ok(Flow::Done)
    });
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/p$", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"POST /p?b=3 HTTP/1.1\r\nHost: h\r\nContent-Length: 7\r\n\r\na=1");
    assert!(transport.written().is_empty(), "dispatched before the body is complete");

    rt.feed(id, b"&b=2");
    assert_eq!(body_of(&transport.written()), b"a=1 b=[3,2]");
}

#[test]
fn test_chunked_request_body() {
    let handler = Handler::new(|cx| {
        let body = cx.body().to_vec();
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        cx.end(Some(&body[..]))?;
        Ok(Flow::Done)
    });
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nx=1\r\n");
    assert!(transport.written().is_empty());

    rt.feed(id, b"0\r\n\r\n");
    assert_eq!(body_of(&transport.written()), b"x=1");
}

#[test]
fn test_large_body_small_reads() {
    const LEN: usize = 8 << 20;

    let handler = Handler::new(|cx| {
        let len = cx.body().len();
        let intact = cx.body().iter().enumerate().all(|(i, &b)| b == (i % 251) as u8);
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        cx.end(Some(format!("{len} {intact}").as_bytes()))?;
        Ok(Flow::Done)
    });
    let config = Config { max_body: 16 << 20, ..Config::default() };
    let (mut rt, _inbox) = Runtime::new(Router::new(RouteTable::new().route("^/", handler).unwrap()), config);
    let (id, transport) = connect(&mut rt);

    rt.feed(id, format!("POST / HTTP/1.1\r\nContent-Length: {LEN}\r\n\r\n").as_bytes());

    let body: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
    for read in body.chunks(4096) {
        assert!(transport.written().is_empty());
        rt.feed(id, read);
    }

    assert_eq!(body_of(&transport.written()), format!("{LEN} true").as_bytes());
    assert!(rt.is_empty());
}

#[test]
fn test_body_too_large() {
    let config = Config { max_body: 16, ..Config::default() };
    let (mut rt, _inbox) = Runtime::new(Router::new(RouteTable::new().route("^/", text("a")).unwrap()), config);

    // rejected from the head alone
    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n");
    assert!(transport.written_str().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert_eq!(transport.close_count(), 1);
    assert!(rt.connection(id).is_none());

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n10\r\n0123456789abcdef\r\n");
    assert!(transport.written().is_empty());
    rt.feed(id, b"1\r\nx\r\n");
    assert!(transport.written_str().starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(rt.is_empty());
}

#[test]
fn test_bad_request() {
    let (mut rt, _inbox) = runtime(RouteTable::new());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"NOPE\r\n\r\n");

    assert_eq!(
        transport.written_str(),
        "HTTP/1.1 400 Bad Request\r\n\
        Transfer-Encoding: chunked\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        b\r\nBad Request\r\n\
        0\r\n\r\n"
    );
    assert_eq!(transport.close_count(), 1);
    assert!(rt.is_empty());
}

#[test]
fn test_not_found() {
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/a$", text("a")).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET /b HTTP/1.1\r\n\r\n");

    assert!(transport.written_str().starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert_eq!(body_of(&transport.written()), b"Not Found");
}

#[test]
fn test_route_order() {
    macro_rules! test {
        ($table:expr, $expected:literal) => {
            let (mut rt, _inbox) = runtime($table);
            let (id, transport) = connect(&mut rt);
            rt.feed(id, b"GET /x HTTP/1.1\r\n\r\n");
            assert_eq!(body_of(&transport.written()), $expected);
        };
    }

    test!(RouteTable::new().route("^/.*", text("A")).unwrap().route("^/x$", text("B")).unwrap(), b"A");
    test!(RouteTable::new().route("^/x$", text("B")).unwrap().route("^/.*", text("A")).unwrap(), b"B");
}

#[test]
fn test_handler_fault() {
    let failing = Handler::new(|_| Err("boom".into()));
    let panicking = Handler::new(|_| panic!("boom"));
    let started = Handler::new(|cx| {
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        cx.send("partial")?;
        Err("boom".into())
    });
    let table = RouteTable::new()
        .route("^/fail$", failing)
        .unwrap()
        .route("^/panic$", panicking)
        .unwrap()
        .route("^/started$", started)
        .unwrap();
    let (mut rt, _inbox) = runtime(table);

    for path in ["/fail", "/panic"] {
        let (id, transport) = connect(&mut rt);
        rt.feed(id, format!("GET {path} HTTP/1.1\r\n\r\n").as_bytes());
        assert!(transport.written_str().starts_with("HTTP/1.1 500 Server Error\r\n"), "{path}");
        assert_eq!(body_of(&transport.written()), b"Server Error");
        assert_eq!(transport.close_count(), 1);
    }

    // partial response cannot be replaced
    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /started HTTP/1.1\r\n\r\n");
    let written = transport.written_str();
    assert!(written.starts_with("HTTP/1.1 200 Ok\r\n"));
    assert!(written.ends_with("7\r\npartial\r\n"));
    assert_eq!(transport.close_count(), 1);

    assert!(rt.is_empty());
}

#[test]
fn test_unfinished_response() {
    let silent = Handler::new(|_| Ok(Flow::Done));
    let open = Handler::new(|cx| {
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        cx.send("body")?;
        Ok(Flow::Done)
    });
    let table = RouteTable::new()
        .route("^/silent$", silent)
        .unwrap()
        .route("^/open$", open)
        .unwrap();
    let (mut rt, _inbox) = runtime(table);

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /silent HTTP/1.1\r\n\r\n");
    assert!(transport.written_str().starts_with("HTTP/1.1 500 Server Error\r\n"));

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /open HTTP/1.1\r\n\r\n");
    assert_eq!(body_of(&transport.written()), b"body");
    assert!(transport.written_str().ends_with("0\r\n\r\n"));

    assert!(rt.is_empty());
}

#[test]
fn test_defer_guard_liveness() {
    let ticks = Rc::new(Cell::new(0u32));
    let runs = Rc::new(RefCell::new(Vec::new()));

    let handler = {
        let ticks = ticks.clone();
        let runs = runs.clone();
        Handler::new(move |cx| {
            let guard_ticks = ticks.clone();
            let body_ticks = ticks.clone();
            let runs = runs.clone();
            wait(
                cx,
                move |_| guard_ticks.get() >= 3,
                move |cx| {
                    runs.borrow_mut().push(body_ticks.get());
                    cx.start(StatusCode::OK, None::<(&str, &str)>)?;
                    cx.end(Some(b"ready".as_slice()))?;
                    Ok(Flow::Done)
                },
            )
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/wait$", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET /wait HTTP/1.1\r\n\r\n");
    assert_eq!(rt.deferred(), 1);
    assert!(rt.connection(id).is_some_and(|conn| conn.is_deferred()));
    assert!(transport.written().is_empty());

    for tick in 1..=5 {
        ticks.set(tick);
        rt.tick();
        if tick < 3 {
            assert!(runs.borrow().is_empty(), "body ran on tick {tick}");
            assert_eq!(rt.deferred(), 1);
        }
    }

    assert_eq!(*runs.borrow(), [3]);
    assert_eq!(rt.deferred(), 0);
    assert_eq!(body_of(&transport.written()), b"ready");
    assert!(rt.is_empty());
}

#[test]
fn test_defer_rerun_handler() {
    let calls = Rc::new(Cell::new(0));
    let handler = {
        let calls = calls.clone();
        Handler::new(move |cx| {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                return Ok(Flow::Defer(None));
            }
            cx.respond(StatusCode::OK)?;
            Ok(Flow::Done)
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(calls.get(), 1);

    rt.tick();
    assert_eq!(calls.get(), 2);
    assert_eq!(rt.deferred(), 1);

    rt.tick();
    assert_eq!(calls.get(), 3);
    assert_eq!(rt.deferred(), 0);
    assert_eq!(body_of(&transport.written()), b"Ok");

    rt.tick();
    assert_eq!(calls.get(), 3);
}

#[test]
fn test_wait_body_defers() {
    let calls = Rc::new(Cell::new(0));
    let runs = Rc::new(Cell::new(0));
    let handler = {
        let calls = calls.clone();
        let runs = runs.clone();
        Handler::new(move |cx| {
            calls.set(calls.get() + 1);
            let runs = runs.clone();
            wait(cx, |_| true, move |cx| {
                runs.set(runs.get() + 1);
                if runs.get() < 2 {
                    return Ok(Flow::Defer(None));
                }
                cx.respond(StatusCode::OK)?;
                Ok(Flow::Done)
            })
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!((calls.get(), runs.get()), (1, 1));
    assert_eq!(rt.deferred(), 1);

    rt.tick();
    assert_eq!((calls.get(), runs.get()), (1, 2));
    assert_eq!(rt.deferred(), 0);
    assert!(transport.written_str().starts_with("HTTP/1.1 200 Ok\r\n"));
    assert_eq!(body_of(&transport.written()), b"Ok");
}

#[test]
fn test_defer_chain() {
    let steps = Rc::new(RefCell::new(Vec::new()));
    let handler = {
        let steps = steps.clone();
        Handler::new(move |_| {
            let steps = steps.clone();
            steps.borrow_mut().push("handler");
            Ok(Flow::defer(move |_| {
                let steps = steps.clone();
                steps.borrow_mut().push("first");
                Ok(Flow::defer(move |cx| {
                    steps.borrow_mut().push("second");
                    cx.respond(StatusCode::OK)?;
                    Ok(Flow::Done)
                }))
            }))
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    assert_eq!(*steps.borrow(), ["handler"]);

    // a continuation deferred during a tick waits for the next one
    rt.tick();
    assert_eq!(*steps.borrow(), ["handler", "first"]);
    assert!(transport.written().is_empty());

    rt.tick();
    assert_eq!(*steps.borrow(), ["handler", "first", "second"]);
    assert_eq!(body_of(&transport.written()), b"Ok");
    assert!(rt.is_empty());
}

#[test]
fn test_defer_immediate_mode() {
    let handler = Handler::new(|_| {
        Ok(Flow::defer(|cx| {
            cx.respond(StatusCode::OK)?;
            Ok(Flow::Done)
        }))
    });
    let config = Config { defer_mode: DeferMode::Immediate, ..Config::default() };
    let (mut rt, _inbox) = Runtime::new(Router::new(RouteTable::new().route("^/", handler).unwrap()), config);
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");

    assert_eq!(rt.deferred(), 0);
    assert_eq!(body_of(&transport.written()), b"Ok");
    assert!(rt.is_empty());
}

#[test]
fn test_defer_failure_hooks() {
    let resumed = Rc::new(Cell::new(0));
    let handler = {
        let resumed = resumed.clone();
        Handler::new(move |_| {
            let resumed = resumed.clone();
            Ok(Flow::defer(move |_| {
                resumed.set(resumed.get() + 1);
                Ok(Flow::Defer(None))
            }))
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());

    let failures = Rc::new(RefCell::new(Vec::new()));
    {
        let failures = failures.clone();
        rt.on_failure(move |conn, reason| failures.borrow_mut().push((conn.id(), reason)));
    }

    let (closed, closed_transport) = connect(&mut rt);
    let (failed, failed_transport) = connect(&mut rt);
    let (alive, _alive_transport) = connect(&mut rt);
    for id in [closed, failed, alive] {
        rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    }
    assert_eq!(rt.deferred(), 3);

    rt.tick();
    assert_eq!(resumed.get(), 3);

    closed_transport.set_status(TransportStatus::Closed);
    rt.handle(Event::Closed(closed));
    failed_transport.set_status(TransportStatus::Failed);
    rt.handle(Event::Failed(failed));

    // release is left to the scheduler
    assert!(rt.connection(closed).is_some());
    assert!(failures.borrow().is_empty());

    rt.tick();
    assert_eq!(resumed.get(), 4);
    assert_eq!(*failures.borrow(), [(closed, FailureReason::Closed), (failed, FailureReason::Failed)]);
    assert!(rt.connection(closed).is_none());
    assert!(rt.connection(failed).is_none());
    assert!(rt.connection(alive).is_some());
    assert_eq!(rt.deferred(), 1);
}

#[test]
fn test_defer_connecting() {
    let resumed = Rc::new(Cell::new(0));
    let handler = {
        let resumed = resumed.clone();
        Handler::new(move |_| {
            let resumed = resumed.clone();
            Ok(Flow::defer(move |cx| {
                resumed.set(resumed.get() + 1);
                cx.respond(StatusCode::OK)?;
                Ok(Flow::Done)
            }))
        })
    };
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    transport.set_status(TransportStatus::Connecting);

    rt.tick();
    rt.tick();
    assert_eq!(resumed.get(), 0);
    assert_eq!(rt.deferred(), 1);

    transport.set_status(TransportStatus::Open);
    rt.tick();
    assert_eq!(resumed.get(), 1);
    assert_eq!(rt.deferred(), 0);
}

#[test]
fn test_defer_fault() {
    let handler = Handler::new(|cx| {
        cx.start(StatusCode::OK, None::<(&str, &str)>)?;
        Ok(Flow::defer(|_| Err("lost".into())))
    });
    let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
    rt.tick();

    assert!(transport.written_str().starts_with("HTTP/1.1 200 Ok\r\n"));
    assert!(!transport.written_str().ends_with("0\r\n\r\n"));
    assert_eq!(transport.close_count(), 1);
    assert_eq!(rt.deferred(), 0);
    assert!(rt.is_empty());
}

#[test]
fn test_closed_before_complete() {
    let (mut rt, _inbox) = runtime(RouteTable::new());
    let (id, transport) = connect(&mut rt);

    rt.feed(id, b"GET / HTTP/1.1\r\n");
    rt.handle(Event::Closed(id));

    assert!(rt.is_empty());
    assert!(transport.written().is_empty());
    assert_eq!(transport.close_count(), 1);
}

#[test]
fn test_directory_redirect() {
    let config = Config { redirect_directories: true, ..Config::default() };
    let router = Router::new(RouteTable::new().route("^/", text("ok")).unwrap());
    let (mut rt, _inbox) = Runtime::new(router, config);

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /docs?page=2 HTTP/1.1\r\n\r\n");
    assert_eq!(
        transport.written_str(),
        "HTTP/1.1 302 Redirect\r\n\
        Transfer-Encoding: chunked\r\n\
        Location: /docs/?page=2\r\n\
        \r\n\
        0\r\n\r\n"
    );

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /docs/ HTTP/1.1\r\n\r\n");
    assert_eq!(body_of(&transport.written()), b"ok");

    let (id, transport) = connect(&mut rt);
    rt.feed(id, b"GET /app.js HTTP/1.1\r\n\r\n");
    assert_eq!(body_of(&transport.written()), b"ok");
}

#[cfg(unix)]
mod workers {
    use std::time::Duration;

    use super::*;

    async fn drive(rt: &mut Runtime, inbox: &mut Inbox, id: ConnId) {
        while rt.connection(id).is_some() {
            let event = tokio::time::timeout(Duration::from_secs(10), inbox.recv())
                .await
                .expect("worker did not finish")
                .expect("inbox closed");
            rt.handle(event);
        }
    }

    fn worker(script: &'static str) -> Handler {
        Handler::new(move |cx| {
            cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
            cx.start_worker("sh", ["-c", script])?;
            Ok(Flow::Done)
        })
    }

    #[tokio::test]
    async fn test_worker_stream() {
        let (mut rt, mut inbox) = runtime(RouteTable::new().route("^/", worker("printf hello; printf ' world'")).unwrap());
        let (id, transport) = connect(&mut rt);

        rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
        assert!(rt.connection(id).is_some_and(|conn| conn.has_worker()));

        drive(&mut rt, &mut inbox, id).await;

        assert_eq!(body_of(&transport.written()), b"hello world");
        assert_eq!(transport.close_count(), 1);
    }

    #[tokio::test]
    async fn test_worker_nonzero_exit() {
        let (mut rt, mut inbox) = runtime(RouteTable::new().route("^/", worker("printf partial; exit 3")).unwrap());
        let (id, transport) = connect(&mut rt);

        rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
        drive(&mut rt, &mut inbox, id).await;

        assert!(transport.written_str().starts_with("HTTP/1.1 200 Ok\r\n"));
        assert_eq!(body_of(&transport.written()), b"partial");
    }

    #[tokio::test]
    async fn test_worker_not_started() {
        let handler = Handler::new(|cx| {
            cx.start_worker("sh", ["-c", "exit 0"])?;
            Ok(Flow::Done)
        });
        let (mut rt, mut inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
        let (id, transport) = connect(&mut rt);

        rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");
        drive(&mut rt, &mut inbox, id).await;

        assert!(transport.written_str().starts_with("HTTP/1.1 500 Server Error\r\n"));
    }

    #[tokio::test]
    async fn test_worker_spawn_failure() {
        let handler = Handler::new(|cx| {
            cx.start_worker("/nonexistent/worker/binary", None::<&str>)?;
            Ok(Flow::Done)
        });
        let (mut rt, _inbox) = runtime(RouteTable::new().route("^/", handler).unwrap());
        let (id, transport) = connect(&mut rt);

        rt.feed(id, b"GET / HTTP/1.1\r\n\r\n");

        assert!(transport.written_str().starts_with("HTTP/1.1 500 Server Error\r\n"));
        assert!(rt.connection(id).is_none());
    }
}
