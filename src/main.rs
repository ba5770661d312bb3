use std::io;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tcpx::net::Endpoint;
use tcpx::{
    BindFlags, CmEvent, CompletionQueue, Config, EndpointInfo, EventQueue, Fabric, progress,
};

/// Maximum time to wait for any single connection event.
const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(err) = run() {
        error!("{err}");
        process::exit(1);
    }
}

/// Connects two endpoints over loopback and exchanges a message each way.
fn run() -> tcpx::Result<()> {
    let fabric = Fabric::open(Config::default())?;
    let domain = fabric.domain()?;

    let eq = Arc::new(EventQueue::new());
    let cq = Arc::new(CompletionQueue::new());

    let mut pep = fabric.passive_ep(None)?;
    pep.bind_eq(&eq);
    pep.listen()?;
    info!("listening on {}", pep.local_addr());

    let mut client = domain.endpoint(EndpointInfo::default())?;
    client.bind_eq(&eq);
    client.bind_cq(&cq, BindFlags::TRANSMIT | BindFlags::RECV)?;
    client.enable()?;
    client.connect(pep.local_addr(), b"hello from client")?;

    let mut server = None;
    let mut connected = 0;

    while connected < 2 {
        let Some(event) = eq.sread(EVENT_TIMEOUT) else {
            return Err(io::Error::from(io::ErrorKind::TimedOut).into());
        };

        match event {
            CmEvent::ConnReq { handle, data, .. } => {
                info!(
                    "connection request from {:?}: {:?}",
                    handle.peer_addr(),
                    String::from_utf8_lossy(&data)
                );

                let mut ep = domain.endpoint(EndpointInfo::with_handle(handle))?;
                ep.bind_eq(&eq);
                ep.bind_cq(&cq, BindFlags::TRANSMIT | BindFlags::RECV)?;
                ep.enable()?;
                ep.accept(b"hello from server")?;
                server = Some(ep);
            }
            CmEvent::Connected { fid, data } => {
                info!("[{fid}] connected: {:?}", String::from_utf8_lossy(&data));
                connected += 1;
            }
            CmEvent::Error { fid, error } => {
                error!("[{fid}] connection failed: {error}");
                return Err(error.into());
            }
        }
    }

    let Some(server) = server else {
        return Err(tcpx::Error::InvalidArgument("no connection request received"));
    };

    exchange(&client, &server, Bytes::from_static(b"ping"))?;
    exchange(&server, &client, Bytes::from_static(b"pong"))?;

    while let Some(completion) = cq.read() {
        info!(
            "[{}] {:?} completion (context: {}, len: {})",
            completion.ep, completion.kind, completion.context, completion.len
        );
    }

    client.close();
    server.close();
    pep.close();

    Ok(())
}

/// Sends `msg` from `from` and receives it on `to`, driving progress on both
/// sides with blocking socket I/O.
fn exchange(from: &Endpoint, to: &Endpoint, msg: Bytes) -> tcpx::Result<()> {
    to.recv(BytesMut::zeroed(64), 2)?;
    from.send(msg, 1)?;

    from.socket().set_nonblocking(false)?;
    to.socket().set_nonblocking(false)?;

    progress::transmit(from, &mut from.socket())?;
    progress::receive(to, &mut to.socket())?;

    Ok(())
}
