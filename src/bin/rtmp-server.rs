//! RTMP ingest/relay server entry point: binds a TCP listener and hands
//! each accepted connection to its own `Session`, all sharing one process-
//! wide `Registry`.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use failure::Error;
use log::{error, info};
use structopt::StructOpt;
use tokio::net::TcpListener;

use rtmp_relay::constants::DEFAULT_PORT;
use rtmp_relay::Registry;

#[derive(StructOpt)]
#[structopt(name = "rtmp-server", about = "RTMP live-streaming ingest/relay server")]
struct Opt {
    /// Address to listen on.
    #[structopt(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on; defaults to the standard RTMP port.
    #[structopt(long)]
    port: Option<u16>,
}

/// Returns a pretty-and-informative version of `e`.
fn prettify_failure(e: &Error) -> String {
    let mut msg = e.to_string();
    for cause in e.iter_causes() {
        write!(&mut msg, "\ncaused by: {}", cause).unwrap();
    }
    if e.backtrace().is_empty() {
        write!(
            &mut msg,
            "\n\n(set environment variable RUST_LOG=debug for more detail, RUST_BACKTRACE=1 for a backtrace)"
        )
        .unwrap();
    } else {
        write!(&mut msg, "\n\nBacktrace:\n{}", e.backtrace()).unwrap();
    }
    msg
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = main_inner().await {
        error!("Fatal: {}", prettify_failure(&e));
        std::process::exit(1);
    }
}

async fn main_inner() -> Result<(), Error> {
    let opt = Opt::from_args();
    let port = opt.port.unwrap_or(DEFAULT_PORT);
    let addr: SocketAddr = format!("{}:{}", opt.host, port)
        .parse()
        .map_err(|e| failure::format_err!("invalid --host/--port: {}", e))?;

    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!("listening on {}", local_addr);

    let registry = Arc::new(Registry::new());

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                error!("accept failed: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            error!("{}: failed to set TCP_NODELAY: {}", peer_addr, e);
        }
        let local_addr = stream.local_addr().unwrap_or(local_addr);
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            rtmp_relay::Session::run(stream, local_addr, peer_addr, registry).await;
        });
    }
}
