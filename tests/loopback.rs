use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tcpx::net::Endpoint;
use tcpx::{
    BindFlags, CmEvent, CompletionKind, CompletionQueue, Config, Domain, EndpointInfo, EventQueue,
    Fabric, Fid, progress,
};

const TIMEOUT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

struct Pair {
    _fabric: Fabric,
    domain: Domain,
    client: Endpoint,
    server: Endpoint,
    cq: Arc<CompletionQueue>,
    client_data: Vec<u8>,
    server_data: Vec<u8>,
}

fn endpoint(
    domain: &Domain,
    info: EndpointInfo,
    eq: &Arc<EventQueue>,
    cq: &Arc<CompletionQueue>,
) -> Endpoint {
    let mut ep = domain.endpoint(info).unwrap();
    ep.bind_eq(eq);
    ep.bind_cq(cq, BindFlags::TRANSMIT | BindFlags::RECV).unwrap();
    ep.enable().unwrap();
    ep
}

fn connect(config: Config, req: &[u8], resp: &[u8]) -> Pair {
    init_tracing();

    let fabric = Fabric::open(config).unwrap();
    let domain = fabric.domain().unwrap();
    let eq = Arc::new(EventQueue::new());
    let cq = Arc::new(CompletionQueue::new());

    let mut pep = fabric.passive_ep(None).unwrap();
    pep.bind_eq(&eq);
    pep.listen().unwrap();

    let client = endpoint(&domain, EndpointInfo::default(), &eq, &cq);
    client.connect(pep.local_addr(), req).unwrap();

    let mut server = None;
    let mut connected: HashMap<Fid, Vec<u8>> = HashMap::new();

    while connected.len() < 2 {
        match eq.sread(TIMEOUT).expect("timed out waiting for connection event") {
            CmEvent::ConnReq { fid, handle, data } => {
                assert_eq!(fid, pep.fid());
                assert_eq!(data, req);

                let ep = endpoint(&domain, EndpointInfo::with_handle(handle), &eq, &cq);
                ep.accept(resp).unwrap();
                server = Some(ep);
            }
            CmEvent::Connected { fid, data } => {
                connected.insert(fid, data);
            }
            CmEvent::Error { fid, error } => panic!("[{fid}] connection failed: {error}"),
        }
    }

    let server = server.unwrap();
    let client_data = connected.remove(&client.fid()).unwrap();
    let server_data = connected.remove(&server.fid()).unwrap();

    pep.close();

    for ep in [&client, &server] {
        ep.socket().set_nonblocking(false).unwrap();
        ep.socket().set_read_timeout(Some(TIMEOUT)).unwrap();
    }

    Pair {
        _fabric: fabric,
        domain,
        client,
        server,
        cq,
        client_data,
        server_data,
    }
}

#[test]
fn loopback_connect_exchanges_cm_data() {
    let pair = connect(Config::default(), b"request payload", b"response payload");

    // The active side sees the accept payload; the passive side already got
    // the request payload with the connection request.
    assert_eq!(pair.client_data, b"response payload");
    assert!(pair.server_data.is_empty());
}

#[test]
fn loopback_messages_arrive_in_order() {
    let pair = connect(Config::default(), b"", b"");

    for context in 0..4 {
        pair.server.recv(BytesMut::zeroed(64), context).unwrap();
    }

    pair.client.send(Bytes::from_static(b"one"), 10).unwrap();
    pair.client.inject(b"two").unwrap();
    pair.client
        .sendv(&[Bytes::from_static(b"th"), Bytes::from_static(b"ree")], 11)
        .unwrap();
    pair.client
        .senddata(Bytes::from_static(b"four"), 0xFEED, 12)
        .unwrap();

    let sent = progress::transmit(&pair.client, &mut pair.client.socket()).unwrap();
    assert_eq!(sent, 4);

    for _ in 0..4 {
        progress::receive(&pair.server, &mut pair.server.socket()).unwrap();
    }

    let mut received = Vec::new();
    let mut send_contexts = Vec::new();
    while let Some(c) = pair.cq.read() {
        match c.kind {
            CompletionKind::Send => send_contexts.push(c.context),
            CompletionKind::Recv => {
                assert_eq!(c.ep, pair.server.fid());
                received.push((c.context, c.buffers[0].to_vec(), c.data));
            }
        }
    }

    assert_eq!(send_contexts, [10, 11, 12]);
    assert_eq!(
        received,
        [
            (0, b"one".to_vec(), None),
            (1, b"two".to_vec(), None),
            (2, b"three".to_vec(), None),
            (3, b"four".to_vec(), Some(0xFEED)),
        ]
    );
    assert_eq!(pair.domain.rx_pool().in_use(), 0);
}

#[test]
fn loopback_concurrent_senders_never_interleave() {
    const THREADS: usize = 4;
    const PER_THREAD: usize = 200;

    let config = Config::default().with_ring_size(1 << 12).with_max_inject_size(128);
    let pair = Arc::new(connect(config, b"", b""));

    for context in 0..(THREADS * PER_THREAD) as u64 {
        pair.server.recv(BytesMut::zeroed(128), context).unwrap();
    }

    let senders: Vec<_> = (0..THREADS)
        .map(|t| {
            let pair = Arc::clone(&pair);
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    let msg = vec![t as u8; 16 + i % 100];
                    // Retry on a full ring until the drainer catches up.
                    while let Err(err) = pair.client.inject(&msg) {
                        assert_eq!(err.kind(), tcpx::ErrorKind::Again);
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    let drainer = {
        let pair = Arc::clone(&pair);
        thread::spawn(move || {
            let mut sent = 0;
            while sent < THREADS * PER_THREAD {
                sent += progress::transmit(&pair.client, &mut pair.client.socket()).unwrap();
                if sent < THREADS * PER_THREAD {
                    pair.domain.progress_signal().wait(Some(Duration::from_millis(10))).unwrap();
                    pair.domain.progress_signal().reset();
                }
            }
        })
    };

    for _ in 0..THREADS * PER_THREAD {
        progress::receive(&pair.server, &mut pair.server.socket()).unwrap();
    }

    for sender in senders {
        sender.join().unwrap();
    }
    drainer.join().unwrap();

    let mut next = [0usize; THREADS];
    while let Some(c) = pair.cq.read() {
        let buf = &c.buffers[0];
        let t = buf[0] as usize;
        assert!(buf.iter().all(|&b| b as usize == t), "frame interleaved");
        assert_eq!(buf.len(), 16 + next[t] % 100, "frame order broken");
        next[t] += 1;
    }
    assert_eq!(next, [PER_THREAD; THREADS]);
}

#[test]
fn loopback_rejected_request_reports_error() {
    init_tracing();

    let fabric = Fabric::open(Config::default()).unwrap();
    let domain = fabric.domain().unwrap();
    let eq = Arc::new(EventQueue::new());
    let cq = Arc::new(CompletionQueue::new());

    let mut pep = fabric.passive_ep(None).unwrap();
    pep.bind_eq(&eq);
    pep.listen().unwrap();

    let client = endpoint(&domain, EndpointInfo::default(), &eq, &cq);
    client.connect(pep.local_addr(), b"knock").unwrap();

    // Dropping the handle closes the connection without a response.
    match eq.sread(TIMEOUT).unwrap() {
        CmEvent::ConnReq { handle, .. } => drop(handle),
        event => panic!("unexpected event {event:?}"),
    }

    match eq.sread(TIMEOUT).unwrap() {
        CmEvent::Error { fid, .. } => assert_eq!(fid, client.fid()),
        event => panic!("unexpected event {event:?}"),
    }
}

#[test]
fn passive_close_concurrent_stress() {
    init_tracing();

    let config = Config::default().with_poll_timeout(Duration::from_millis(5));
    let fabric = Fabric::open(config).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let fabric = fabric.clone();
            thread::spawn(move || {
                let eq = Arc::new(EventQueue::new());
                for _ in 0..50 {
                    let mut pep = fabric.passive_ep(None).unwrap();
                    pep.bind_eq(&eq);
                    pep.listen().unwrap();

                    let addr = pep.local_addr();
                    pep.close();

                    assert!(std::net::TcpListener::bind(addr).is_ok());
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(fabric.poll_manager().pending(), 0);
}
