use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rankmsg::{
    AddrRequest, AppError, Connection, ControlMessage, Dispatcher, EntityAddr, EntityMessenger,
    EntityState, EntityType, Frame, Hello, Message, Messenger, MessengerConfig, Rank,
    MSG_TYPE_USER_BASE, RANK_UNASSIGNED,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time;

const WAIT: Duration = Duration::from_secs(10);

struct Recorder {
    tx: mpsc::UnboundedSender<Message>,
    kicks: AtomicUsize,
}

impl Dispatcher for Recorder {
    fn dispatch(&self, msg: Message) {
        let _ = self.tx.send(msg);
    }

    fn kick(&self) {
        self.kicks.fetch_add(1, Ordering::SeqCst);
    }
}

struct Endpoint {
    messenger: Arc<EntityMessenger>,
    recorder: Arc<Recorder>,
    inbox: mpsc::UnboundedReceiver<Message>,
}

impl Endpoint {
    fn addr(&self) -> EntityAddr {
        self.messenger.addr()
    }

    fn send(&self, dest: EntityAddr, n: u32) {
        self.messenger
            .send_message(payload(n), dest, 1, 2)
            .unwrap();
    }

    async fn recv(&mut self) -> Message {
        time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("dispatcher dropped")
    }

    async fn recv_numbers(&mut self, count: usize) -> Vec<u32> {
        let mut got = Vec::with_capacity(count);
        for _ in 0..count {
            got.push(number(&self.recv().await));
        }
        got
    }

    async fn assert_quiet(&mut self) {
        time::sleep(Duration::from_millis(200)).await;
        assert!(self.inbox.try_recv().is_err(), "unexpected extra message");
    }
}

fn payload(n: u32) -> Message {
    Message::new(MSG_TYPE_USER_BASE + 1, Bytes::from(n.to_be_bytes().to_vec()))
}

fn number(msg: &Message) -> u32 {
    u32::from_be_bytes(msg.payload[..4].try_into().unwrap())
}

fn config(namer: Option<SocketAddr>) -> MessengerConfig {
    let mut config = MessengerConfig::default();
    config.namer.addr = namer.map(|addr| addr.to_string());
    config.sender.backoff_min_ms = 10;
    config.sender.backoff_max_ms = 50;
    config.sender.max_connect_attempts = 3;
    config.reaper.interval_ms = 50;
    config.timeouts.connect_ms = 2_000;
    config
}

async fn cluster(size: usize) -> Vec<Arc<Rank>> {
    let namer = Rank::start(config(None)).await.unwrap();
    let namer_addr = namer.listen_addr();
    let mut ranks = vec![namer];
    for _ in 1..size {
        ranks.push(Rank::start(config(Some(namer_addr))).await.unwrap());
    }
    ranks
}

fn recorder() -> (Arc<Recorder>, mpsc::UnboundedReceiver<Message>) {
    let (tx, inbox) = mpsc::unbounded_channel();
    let recorder = Arc::new(Recorder {
        tx,
        kicks: AtomicUsize::new(0),
    });
    (recorder, inbox)
}

/// Registers, installs a recorder, but leaves the entity unready.
async fn registered(rank: &Rank, request: impl Into<AddrRequest>) -> Endpoint {
    let messenger = rank.register_entity(request).await.unwrap();
    let (recorder, inbox) = recorder();
    messenger.set_dispatcher(recorder.clone());
    Endpoint {
        messenger,
        recorder,
        inbox,
    }
}

async fn ready(rank: &Rank, request: impl Into<AddrRequest>) -> Endpoint {
    let endpoint = registered(rank, request).await;
    endpoint.messenger.ready().unwrap();
    endpoint
}

/// Registers `addr` exactly, retrying while the namer still holds it for a
/// previous owner.
async fn register_when_free(rank: &Rank, addr: EntityAddr) -> Arc<EntityMessenger> {
    for _ in 0..50 {
        match rank.register_entity(addr).await {
            Ok(messenger) => return messenger,
            Err(AppError::AlreadyRegistered(_)) => time::sleep(Duration::from_millis(20)).await,
            Err(e) => panic!("register failed: {}", e),
        }
    }
    panic!("{} never released", addr);
}

/// Polls `check` until it yields a value.
async fn eventually<T>(mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = time::Instant::now() + WAIT;
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(time::Instant::now() < deadline, "condition never held");
        time::sleep(Duration::from_millis(10)).await;
    }
}

async fn shutdown_all(ranks: Vec<Arc<Rank>>) {
    for rank in ranks.iter().rev() {
        rank.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ranks_are_numbered_in_join_order() {
    let ranks = cluster(3).await;
    let numbers: Vec<_> = ranks.iter().map(|rank| rank.assigned_rank()).collect();
    assert_eq!(numbers, vec![Some(0), Some(1), Some(2)]);
    assert!(ranks[0].namer().is_some());
    assert!(ranks[1].namer().is_none());
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_between_ranks_arrive_in_order_across_reset() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut osd = ready(&ranks[2], AddrRequest::Any(EntityType::Osd)).await;
    assert_eq!(osd.addr(), EntityAddr::new(EntityType::Osd, 0));

    for n in 0..50 {
        client.send(osd.addr(), n);
    }
    let first = osd.recv().await;
    assert_eq!(number(&first), 0);
    assert_eq!(first.source, client.addr());
    assert_eq!((first.source_port, first.dest_port), (1, 2));

    ranks[1].reset_connection(2).unwrap();
    for n in 50..100 {
        client.send(osd.addr(), n);
    }

    let rest = osd.recv_numbers(99).await;
    assert_eq!(rest, (1..100).collect::<Vec<_>>());
    osd.assert_quiet().await;
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_send_before_registration_is_delivered_once_started() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let osd5 = EntityAddr::new(EntityType::Osd, 5);

    for n in 0..10 {
        client.send(osd5, n);
    }
    time::sleep(Duration::from_millis(200)).await;
    let lookups_before = ranks[0].stats().namer_lookups.unwrap();
    assert_eq!(lookups_before, 1);

    let mut osd = ready(&ranks[2], osd5).await;
    assert_eq!(osd.addr(), osd5);
    assert_eq!(osd.recv_numbers(10).await, (0..10).collect::<Vec<_>>());

    // placement is cached now
    client.send(osd5, 10);
    assert_eq!(number(&osd.recv().await), 10);
    assert_eq!(ranks[0].stats().namer_lookups, Some(1));
    assert_eq!(ranks[1].resolve(osd5).await.unwrap(), 2);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unready_entity_holds_messages_until_ready() {
    let ranks = cluster(2).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut mds = registered(&ranks[1], AddrRequest::Any(EntityType::Mds)).await;
    assert_eq!(mds.messenger.state(), EntityState::RegisteredNotReady);

    for n in 0..3 {
        client.send(mds.addr(), n);
    }
    mds.assert_quiet().await;

    mds.messenger.ready().unwrap();
    assert_eq!(mds.messenger.state(), EntityState::Ready);
    assert_eq!(mds.recv_numbers(3).await, vec![0, 1, 2]);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unready_remote_entity_is_deferred_by_namer() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut mon = registered(&ranks[2], AddrRequest::Any(EntityType::Mon)).await;

    for n in 0..3 {
        client.send(mon.addr(), n);
    }
    mon.assert_quiet().await;

    mon.messenger.ready().unwrap();
    assert_eq!(mon.recv_numbers(3).await, vec![0, 1, 2]);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_share_one_lookup() {
    let ranks = cluster(3).await;
    let osd9 = EntityAddr::new(EntityType::Osd, 9);

    let first = tokio::spawn({
        let rank = ranks[1].clone();
        async move { rank.resolve(osd9).await }
    });
    let second = tokio::spawn({
        let rank = ranks[1].clone();
        async move { rank.resolve(osd9).await }
    });
    time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ranks[1].stats().pending_lookups, 1);

    let _osd = ready(&ranks[2], osd9).await;
    assert_eq!(first.await.unwrap().unwrap(), 2);
    assert_eq!(second.await.unwrap().unwrap(), 2);
    assert_eq!(ranks[0].stats().namer_lookups, Some(1));
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_share_one_sender() {
    let ranks = cluster(3).await;
    // rank 2 joined last, so its table already holds rank 1
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let rank = ranks[2].clone();
            tokio::spawn(async move { rank.connect_rank(1).unwrap() })
        })
        .collect();
    let mut senders = Vec::new();
    for handle in handles {
        senders.push(handle.await.unwrap());
    }
    assert!(senders.iter().all(|s| Arc::ptr_eq(s, &senders[0])));
    assert_eq!(senders[0].dest_rank(), 1);
    assert!(ranks[2].connect_rank(42).is_err());
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registrations_get_distinct_numbers() {
    let ranks = cluster(3).await;
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let rank = ranks[1 + i % 2].clone();
            tokio::spawn(async move {
                rank.register_entity(AddrRequest::Any(EntityType::Osd))
                    .await
                    .unwrap()
                    .addr()
            })
        })
        .collect();
    let mut numbers = Vec::new();
    for handle in handles {
        numbers.push(handle.await.unwrap().num());
    }
    numbers.sort();
    assert_eq!(numbers, (0..8).collect::<Vec<_>>());
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_entities_on_the_namer_rank() {
    let ranks = cluster(2).await;
    let mut local = ready(&ranks[0], AddrRequest::Any(EntityType::Osd)).await;
    let mut remote = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;

    local.send(local.addr(), 1);
    assert_eq!(number(&local.recv().await), 1);

    remote.send(local.addr(), 2);
    assert_eq!(number(&local.recv().await), 2);
    local.send(remote.addr(), 3);
    assert_eq!(number(&remote.recv().await), 3);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_exact_registration_conflict() {
    let ranks = cluster(3).await;
    let osd7 = EntityAddr::new(EntityType::Osd, 7);
    let _first = ready(&ranks[1], osd7).await;

    let second = ranks[2].register_entity(osd7).await;
    assert!(matches!(second, Err(AppError::AlreadyRegistered(addr)) if addr == osd7));

    let reserved = ranks[2].register_entity(AddrRequest::Any(EntityType::Namer)).await;
    assert!(matches!(reserved, Err(AppError::InvalidValue(_))));
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wait_returns_when_last_entity_unregisters() {
    let ranks = cluster(2).await;
    let a = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let b = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    assert_eq!(ranks[1].stats().local_entities, 2);

    let rank = ranks[1].clone();
    let mut waiting = tokio::spawn(async move { rank.wait().await });
    assert!(time::timeout(Duration::from_millis(100), &mut waiting).await.is_err());

    a.messenger.shutdown().unwrap();
    assert!(time::timeout(Duration::from_millis(100), &mut waiting).await.is_err());
    b.messenger.shutdown().unwrap();
    time::timeout(WAIT, waiting).await.unwrap().unwrap();

    b.messenger.join().await;
    assert_eq!(b.messenger.state(), EntityState::Stopped);
    assert!(matches!(
        b.messenger.send_message(payload(0), a.addr(), 0, 0),
        Err(AppError::ShuttingDown)
    ));
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unregistered_entity_is_not_found() {
    let ranks = cluster(3).await;
    let mds = ready(&ranks[2], AddrRequest::Any(EntityType::Mds)).await;
    let addr = mds.addr();
    assert_eq!(ranks[2].resolve(addr).await.unwrap(), 2);

    mds.messenger.shutdown().unwrap();
    // unregister and lookup travel to the namer on the same connection
    let resolved = ranks[2].resolve(addr).await;
    assert!(matches!(resolved, Err(AppError::NotFound(a)) if a == addr));
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lookup_times_out() {
    let namer = Rank::start(config(None)).await.unwrap();
    let mut slow = config(Some(namer.listen_addr()));
    slow.timeouts.lookup_ms = 300;
    let rank = Rank::start(slow).await.unwrap();

    let nobody = EntityAddr::new(EntityType::Osd, 99);
    let resolved = rank.resolve(nobody).await;
    assert!(matches!(resolved, Err(AppError::Timeout(_))));
    assert_eq!(rank.stats().pending_lookups, 0);

    shutdown_all(vec![namer, rank]).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_rank_messages_are_rerouted() {
    let ranks = cluster(4).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let osd3 = EntityAddr::new(EntityType::Osd, 3);
    let mut old = ready(&ranks[2], osd3).await;

    client.send(osd3, 0);
    assert_eq!(number(&old.recv().await), 0);

    old.messenger.shutdown().unwrap();
    let messenger = register_when_free(&ranks[3], osd3).await;
    let (recorder, mut inbox) = recorder();
    messenger.set_dispatcher(recorder);
    messenger.ready().unwrap();

    ranks[2].shutdown().await;
    time::sleep(Duration::from_millis(300)).await;

    // rank 1 still places osd3 on rank 2
    client.send(osd3, 1);
    client.send(osd3, 2);
    let mut got = Vec::new();
    for _ in 0..2 {
        let msg = time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        got.push(number(&msg));
    }
    assert_eq!(got, vec![1, 2]);
    assert!(client.recorder.kicks.load(Ordering::SeqCst) >= 1);
    assert_eq!(ranks[1].resolve(osd3).await.unwrap(), 3);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rank_that_stays_dead_is_given_up() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut osd = ready(&ranks[2], AddrRequest::Any(EntityType::Osd)).await;
    client.send(osd.addr(), 0);
    assert_eq!(number(&osd.recv().await), 0);

    // the namer keeps placing the osd on rank 2
    ranks[2].shutdown().await;
    time::sleep(Duration::from_millis(300)).await;
    client.send(osd.addr(), 1);

    let rounds = config(None).sender.max_reroutes as usize + 1;
    let kicks = &client.recorder.kicks;
    eventually(|| (kicks.load(Ordering::SeqCst) == rounds).then_some(())).await;
    time::sleep(Duration::from_millis(500)).await;
    assert_eq!(kicks.load(Ordering::SeqCst), rounds);
    assert_eq!(ranks[1].stats().pending_lookups, 0);
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_abandoned_registration_releases_its_address() {
    let ranks = cluster(3).await;
    let osd5 = EntityAddr::new(EntityType::Osd, 5);
    let osd6 = EntityAddr::new(EntityType::Osd, 6);

    // the caller goes away before the namer answers
    tokio::select! {
        biased;
        res = ranks[1].register_entity(osd5) => {
            panic!("registration answered on first poll: {:?}", res.map(|m| m.addr()))
        }
        _ = std::future::ready(()) => {}
    }

    // the caller gives up before the namer answers
    let mut impatient = config(Some(ranks[0].listen_addr()));
    impatient.timeouts.register_ms = 0;
    let hasty = Rank::start(impatient).await.unwrap();
    match hasty.register_entity(osd6).await {
        Err(AppError::Timeout(_)) => {}
        Ok(messenger) => messenger.shutdown().unwrap(),
        Err(e) => panic!("register failed: {}", e),
    }

    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    for addr in [osd5, osd6] {
        let messenger = register_when_free(&ranks[2], addr).await;
        let (recorder, mut inbox) = recorder();
        messenger.set_dispatcher(recorder);
        messenger.ready().unwrap();

        client.send(addr, addr.num());
        let msg = time::timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
        assert_eq!(number(&msg), addr.num());
    }
    hasty.shutdown().await;
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_garbage_on_the_wire_only_kills_its_receiver() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut osd = ready(&ranks[2], AddrRequest::Any(EntityType::Osd)).await;
    client.send(osd.addr(), 0);
    assert_eq!(number(&osd.recv().await), 0);

    let reaped = ranks[2].stats().reaped;
    let mut garbage = TcpStream::connect(ranks[2].listen_addr()).await.unwrap();
    // eight byte body under a bogus checksum
    garbage
        .write_all(&[0, 0, 0, 8, 0xde, 0xad, 0xbe, 0xef, 1, 2, 3, 4, 5, 6, 7, 8])
        .await
        .unwrap();
    let mut buf = [0u8; 16];
    let closed = time::timeout(WAIT, garbage.read(&mut buf)).await.unwrap();
    assert!(matches!(closed, Ok(0) | Err(_)));
    eventually(|| (ranks[2].stats().reaped > reaped).then_some(())).await;

    for n in 1..=10 {
        client.send(osd.addr(), n);
    }
    assert_eq!(osd.recv_numbers(10).await, (1..=10).collect::<Vec<_>>());
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_session_state_dropped_with_its_receiver() {
    let ranks = cluster(2).await;
    time::sleep(Duration::from_millis(100)).await;
    let before = ranks[1].stats().sessions;

    let socket = TcpStream::connect(ranks[1].listen_addr()).await.unwrap();
    let local = socket.local_addr().unwrap();
    let mut conn = Connection::new(socket, local, 1024, 1 << 20);
    // a peer that has no rank number yet
    conn.write_hello(&Hello {
        from_rank: None,
        session: 0xabc,
    })
    .await
    .unwrap();
    let msg = payload(1).with_route(
        EntityAddr::rank(RANK_UNASSIGNED),
        EntityAddr::new(EntityType::Osd, 40),
    );
    conn.write_message(1, &msg).await.unwrap();
    eventually(|| (ranks[1].stats().sessions == before + 1).then_some(())).await;

    conn.close().await;
    eventually(|| (ranks[1].stats().sessions == before).then_some(())).await;
    shutdown_all(ranks).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_messages_kept_while_rank_unreachable() {
    let mut patient = config(None);
    patient.sender.max_connect_attempts = 1_000;
    let namer = Rank::start(patient).await.unwrap();

    // a rank joins, then its listener goes away
    let reserved = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let away = reserved.local_addr().unwrap();
    drop(reserved);
    let socket = TcpStream::connect(namer.listen_addr()).await.unwrap();
    let local = socket.local_addr().unwrap();
    let mut joining = Connection::new(socket, local, 1024, 1 << 20);
    joining
        .write_hello(&Hello {
            from_rank: None,
            session: 42,
        })
        .await
        .unwrap();
    let join = ControlMessage::ConnectRequest {
        tid: 1,
        listen_addr: away,
    }
    .into_message(EntityAddr::rank(RANK_UNASSIGNED), EntityAddr::NAMER);
    joining.write_message(1, &join).await.unwrap();

    let sender = eventually(|| namer.connect_rank(1).ok()).await;
    let osd1 = EntityAddr::new(EntityType::Osd, 1);
    for n in 0..20 {
        sender
            .send(payload(n).with_route(EntityAddr::rank(0), osd1))
            .unwrap();
    }
    // a handful of refused connects, far from the limit
    time::sleep(Duration::from_millis(200)).await;
    assert!(!sender.is_done());

    let listener = TcpListener::bind(away).await.unwrap();
    let (socket, peer) = time::timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    let mut back = Connection::new(socket, peer, 1024, 1 << 20);
    match time::timeout(WAIT, back.read_frame()).await.unwrap().unwrap() {
        Some(Frame::Hello(hello)) => {
            assert_eq!(hello.from_rank, Some(0));
            assert_eq!(hello.session, sender.session());
        }
        other => panic!("expected a hello, got {:?}", other),
    }

    let mut last_seq = 0;
    let mut got = Vec::new();
    while got.len() < 20 {
        match time::timeout(WAIT, back.read_frame()).await.unwrap().unwrap() {
            Some(Frame::Message { seq, message }) => {
                assert!(seq > last_seq);
                last_seq = seq;
                // the namer's own connect ack travels on the same link
                if message.msg_type >= MSG_TYPE_USER_BASE {
                    got.push(number(&message));
                }
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }
    assert_eq!(got, (0..20).collect::<Vec<_>>());
    namer.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_shutdown_reaps_connections() {
    let ranks = cluster(3).await;
    let client = ready(&ranks[1], AddrRequest::Any(EntityType::Client)).await;
    let mut osd = ready(&ranks[2], AddrRequest::Any(EntityType::Osd)).await;
    client.send(osd.addr(), 1);
    osd.recv().await;
    assert!(ranks[1].stats().senders >= 1);

    ranks[1].shutdown().await;
    let stats = ranks[1].stats();
    assert_eq!(stats.connections, 0);
    assert_eq!(stats.senders, 0);
    assert!(stats.reaped >= 1);
    assert!(matches!(
        ranks[1].register_entity(AddrRequest::Any(EntityType::Client)).await,
        Err(AppError::ShuttingDown)
    ));
    // shutdown is idempotent
    ranks[1].shutdown().await;
    shutdown_all(ranks).await;
}

#[tokio::test]
async fn test_bind_failure_is_fatal() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let mut config = config(None);
    config.network.port = taken.local_addr().unwrap().port();
    assert!(matches!(
        Rank::start(config).await,
        Err(AppError::Bind { .. })
    ));
}

#[tokio::test]
async fn test_join_times_out_without_namer() {
    let unused = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let mut config = config(Some(addr));
    config.timeouts.connect_ms = 300;
    assert!(matches!(
        Rank::start(config).await,
        Err(AppError::Timeout(_))
    ));
}
