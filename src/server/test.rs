use std::cell::Cell;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use crate::config::Config;
use crate::defer::wait;
use crate::error::Error;
use crate::handler::{Flow, Handler};
use crate::http::StatusCode;
use crate::routing::{RouteTable, Router};
use crate::server::Registry;

fn loopback() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 0))
}

fn router() -> Router {
    let echo = Handler::new(|cx| {
        let x = cx.param("x").unwrap_or_default().to_owned();
        cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
        cx.send(format!("x={x}"))?;
        cx.end(None)?;
        Ok(Flow::Done)
    });

    let polls = Rc::new(Cell::new(0));
    let wait_handler = Handler::new(move |cx| {
        let polls = polls.clone();
        wait(
            cx,
            move |_| {
                polls.set(polls.get() + 1);
                polls.get() > 2
            },
            |cx| {
                cx.start(StatusCode::OK, None::<(&str, &str)>)?;
                cx.end(Some(b"waited".as_slice()))?;
                Ok(Flow::Done)
            },
        )
    });

    let table = RouteTable::new()
        .route("^/echo$", echo)
        .unwrap()
        .route("^/wait$", wait_handler)
        .unwrap()
        .route("^/worker$", Handler::new(|cx| {
            cx.start(StatusCode::OK, None::<(&str, &str)>)?;
            cx.start_worker("sh", ["-c", "printf streamed"])?;
            Ok(Flow::Done)
        }))
        .unwrap();
    Router::new(table)
}

fn request(addr: SocketAddr, input: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(input.as_bytes()).unwrap();

    let mut output = String::new();
    stream.read_to_string(&mut output).unwrap();
    output
}

#[test]
fn test_loopback() {
    let config = Config { tick: Duration::from_millis(10), ..Config::default() };
    let mut registry = Registry::new();
    let addr = registry.start(loopback(), router, config).unwrap();
    assert_ne!(addr.port(), 0);
    assert_eq!(registry.addrs().collect::<Vec<_>>(), [addr]);

    assert_eq!(
        request(addr, "GET /echo?x=1 HTTP/1.1\r\nHost: h\r\n\r\n"),
        "HTTP/1.1 200 Ok\r\n\
        Transfer-Encoding: chunked\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        3\r\nx=1\r\n\
        0\r\n\r\n"
    );

    let output = request(addr, "GET /wait HTTP/1.1\r\n\r\n");
    assert!(output.ends_with("6\r\nwaited\r\n0\r\n\r\n"), "{output}");

    let output = request(addr, "GET /missing HTTP/1.1\r\n\r\n");
    assert!(output.starts_with("HTTP/1.1 404 Not Found\r\n"), "{output}");

    let output = request(addr, "BAD\r\n\r\n");
    assert!(output.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{output}");

    #[cfg(unix)]
    {
        let output = request(addr, "GET /worker HTTP/1.1\r\n\r\n");
        assert!(output.ends_with("8\r\nstreamed\r\n0\r\n\r\n"), "{output}");
    }

    assert!(registry.stop(addr));
    assert!(!registry.stop(addr));
    assert_eq!(registry.addrs().count(), 0);
    assert!(TcpStream::connect(addr).is_err());
}

#[test]
fn test_registry_errors() {
    let mut registry = Registry::new();
    let addr = registry.start(loopback(), router, Config::default()).unwrap();

    assert!(matches!(
        registry.start(addr, router, Config::default()),
        Err(Error::AlreadyRunning(running)) if running == addr
    ));

    let taken = std::net::TcpListener::bind(loopback()).unwrap();
    assert!(matches!(
        registry.start(taken.local_addr().unwrap(), router, Config::default()),
        Err(Error::Bind(_))
    ));

    assert!(registry.is_running(addr));
    registry.stop_all();
    assert!(!registry.is_running(addr));
}
