use bytes::BytesMut;
use comet::defer::wait;
use comet::worker::{Job, OutputTarget};
use comet::{Config, Flow, Handler, RouteTable, Router, StatusCode};
use serde::Serialize;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const WORKER_SCRIPT: &str = "for i in 1 2 3; do echo \"tick $i\"; sleep 1; done";

fn main() -> io::Result<()> {
    env_logger::init();

    let addr = std::env::var("COMET_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".into());

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let io = TcpListener::bind(&addr).await?;
            println!("listening on {addr}");

            let (shutdown, stop) = oneshot::channel();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                let _ = shutdown.send(());
            });

            comet::serve(io, router(), Config::from_env(), stop).await;
            Ok(())
        })
}

fn router() -> Router {
    let table = RouteTable::new()
        .route("^/echo$", Handler::new(echo))
        .unwrap()
        .route(r"^/wait/(\d+)$", Handler::new(wait_seconds))
        .unwrap()
        .route("^/worker/$", Handler::new(worker))
        .unwrap()
        .route("^/job$", Handler::new(job))
        .unwrap();
    Router::new(table)
}

/// Write every request parameter as `key=value` lines.
fn echo(cx: &mut comet::Context) -> comet::HandlerResult {
    let mut body = String::new();
    for (key, value) in cx.params().iter() {
        body.push_str(&format!("{key}={}\n", value.as_slice().join(",")));
    }
    cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
    cx.end(Some(body.as_bytes()))?;
    Ok(Flow::Done)
}

/// Respond after the number of seconds in the path.
fn wait_seconds(cx: &mut comet::Context) -> comet::HandlerResult {
    let seconds = cx.arg(1).and_then(|n| n.parse().ok()).unwrap_or(0);
    let deadline = Instant::now() + Duration::from_secs(seconds);

    wait(cx, move |_| Instant::now() >= deadline, move |cx| {
        cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
        cx.end(Some(format!("waited {seconds}s\n").as_bytes()))?;
        Ok(Flow::Done)
    })
}

/// Stream the output of a shell script.
fn worker(cx: &mut comet::Context) -> comet::HandlerResult {
    cx.start(StatusCode::OK, [("Content-Type", "text/plain")])?;
    cx.start_worker("sh", ["-c", WORKER_SCRIPT])?;
    Ok(Flow::Done)
}

#[derive(Serialize)]
struct Greeting<'a> {
    name: &'a str,
}

/// Send a job to `cat` and respond with what it echoed back.
fn job(cx: &mut comet::Context) -> comet::HandlerResult {
    let name = cx.param("name").unwrap_or("world").to_owned();
    let job = Job::new("greet").bind("greeting", Greeting { name: &name })?;

    let output = Rc::new(RefCell::new(BytesMut::new()));
    cx.start_job("cat", None::<&str>, &job, OutputTarget::Buffer(output.clone()))?;

    wait(cx, |cx| cx.worker_exit().is_some(), move |cx| {
        let output = output.borrow();
        cx.start(StatusCode::OK, [("Content-Type", "application/json")])?;
        cx.end(Some(&output[..]))?;
        Ok(Flow::Done)
    })
}
