//! End-to-end scenarios over a loopback-capable HCA.
//!
//! These tests need an RDMA device (physical or soft-RoCE) and are ignored
//! by default:
//!
//! ```text
//! cargo test --test loopback -- --ignored --test-threads=1
//! ```

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ibfabric::barrier;
use ibfabric::{
    Client, Config, ConnId, MemoryKind, MemoryRegion, NodeIdSequencer, ReliableEngine, Server,
    Transport, UnreliableEngine,
};

fn test_config(sequencer_addr: &str) -> Config {
    let (ip, port) = sequencer_addr.rsplit_once(':').unwrap();
    let mut config = Config::default();
    config.sequencer_ip = ip.to_owned();
    config.sequencer_port = port.parse().unwrap();
    config.interface = "lo".to_owned();
    config.memsize = 1 << 20;
    config
}

struct Cluster {
    _sequencer: NodeIdSequencer,
    server: Server<ReliableEngine>,
    server_engine: Arc<ReliableEngine>,
    server_memory: Arc<MemoryRegion>,
    config: Config,
}

fn start_cluster(server_memsize: usize) -> Cluster {
    let sequencer = NodeIdSequencer::start_on("127.0.0.1:0").unwrap();
    let config = test_config(sequencer.local_addr());

    let server_memory =
        Arc::new(MemoryRegion::new(MemoryKind::Host, server_memsize, &config).unwrap());
    let server_engine = Arc::new(ReliableEngine::new(server_memory.clone(), &config).unwrap());
    let server = Server::with_bind_addr(
        server_engine.clone(),
        config.clone(),
        "loopback-server",
        "127.0.0.1:0".to_owned(),
    );
    server.start().unwrap();

    Cluster {
        _sequencer: sequencer,
        server,
        server_engine,
        server_memory,
        config,
    }
}

fn start_client(cluster: &Cluster) -> (Arc<Client<ReliableEngine>>, Arc<ReliableEngine>, u64) {
    let memory =
        Arc::new(MemoryRegion::new(MemoryKind::Host, 1 << 20, &cluster.config).unwrap());
    let engine = Arc::new(ReliableEngine::new(memory, &cluster.config).unwrap());
    let client = Arc::new(
        Client::new(engine.clone(), cluster.config.clone(), "loopback-client").unwrap(),
    );
    let server_id = client.connect(&cluster.server.local_addr().unwrap()).unwrap();
    (client, engine, server_id)
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn connect_learns_the_server_node_id() {
    let cluster = start_cluster(1 << 20);
    // The server registered first, so it owns id 0.
    assert_eq!(cluster.server.own_node_id(), Some(0));

    let (client, _engine, server_id) = start_client(&cluster);
    assert_eq!(server_id, 0);
    // The client got the next id.
    assert_eq!(client.own_node_id(), Some(1));
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn write_lands_in_the_remote_region() -> anyhow::Result<()> {
    let cluster = start_cluster(1 << 20);
    let (client, engine, server_id) = start_client(&cluster);
    let conn = server_id as ConnId;

    let offset = client.remote_alloc(server_id, 4096)?;
    let payload = b"hello\0";
    engine.memory().write_bytes(0, payload)?;
    engine.write(conn, offset, 0, payload.len(), true)?;

    let mut landed = [0u8; 6];
    cluster.server_memory.read_bytes(offset, &mut landed)?;
    assert_eq!(&landed, payload);

    client.remote_free(server_id, offset)?;
    Ok(())
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn read_pulls_from_the_remote_region() {
    let cluster = start_cluster(1 << 20);
    let (client, engine, server_id) = start_client(&cluster);
    let conn = server_id as ConnId;

    let offset = client.remote_alloc(server_id, 4096).unwrap();
    cluster
        .server_memory
        .write_bytes(offset, b"remote-content")
        .unwrap();

    engine.read(conn, offset, 512, 14, true).unwrap();
    let mut pulled = [0u8; 14];
    engine.memory().read_bytes(512, &mut pulled).unwrap();
    assert_eq!(&pulled, b"remote-content");
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn remote_alloc_exhaustion_is_reported() {
    let cluster = start_cluster(1024);
    let (client, _engine, server_id) = start_client(&cluster);

    let first = client.remote_alloc(server_id, 600).unwrap();
    let second = client.remote_alloc(server_id, 600);
    assert!(second.is_err(), "second allocation must exhaust the region");
    client.remote_free(server_id, first).unwrap();
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn sends_arrive_in_order() {
    let cluster = start_cluster(1 << 20);
    let (_client, engine, server_id) = start_client(&cluster);
    let conn = server_id as ConnId;

    const COUNT: usize = 8;
    const LEN: usize = 128;

    // Client posts all receives up front.
    for i in 0..COUNT {
        engine.receive(conn, i * LEN, LEN).unwrap();
    }

    // Server sends COUNT random buffers back over the same connection.
    let server_engine = cluster.server_engine.clone();
    let server_conn = cluster.server.connected_ids()[0];
    cluster.server_memory.fill_random();
    let mut sent = vec![[0u8; LEN]; COUNT];
    for (i, buf) in sent.iter_mut().enumerate() {
        cluster.server_memory.read_bytes(i * LEN, buf).unwrap();
        server_engine.send(server_conn, i * LEN, LEN, true).unwrap();
    }

    for (i, expect) in sent.iter().enumerate() {
        let (n, _) = engine.poll_receive(conn, true).unwrap();
        assert_eq!(n, 1);
        let mut got = [0u8; LEN];
        engine.memory().read_bytes(i * LEN, &mut got).unwrap();
        assert_eq!(&got, expect, "buffer {} out of order", i);
    }
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn concurrent_fetch_add_sums_exactly() {
    const CLIENTS: usize = 2;
    const ITERATIONS: usize = 1_000_000;

    let cluster = start_cluster(1 << 20);
    cluster.server_memory.write_scalar::<u64>(0, 0).unwrap();

    let mut workers = Vec::new();
    for _ in 0..CLIENTS {
        let (_client, engine, server_id) = start_client(&cluster);
        workers.push(thread::spawn(move || {
            let conn = server_id as ConnId;
            for i in 0..ITERATIONS {
                let signaled = i + 1 == ITERATIONS;
                engine.fetch_and_add(conn, 0, 64, 1, 8, signaled).unwrap();
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(
        cluster.server_memory.read_scalar::<u64>(0).unwrap(),
        (CLIENTS * ITERATIONS) as u64
    );
}

#[test]
#[ignore = "requires an RDMA-capable NIC"]
fn barrier_aligns_both_sides() {
    let cluster = start_cluster(1 << 20);
    let (_client, engine, server_id) = start_client(&cluster);
    let conns = [server_id as ConnId];

    let server_engine = cluster.server_engine.clone();
    let server_conns = cluster.server.connected_ids();
    let server_side = thread::spawn(move || {
        barrier::global_barrier_server(&server_engine, &server_conns).unwrap();
    });

    barrier::global_barrier_client(&engine, &conns).unwrap();
    server_side.join().unwrap();
}

#[test]
#[ignore = "requires an RDMA-capable NIC and multicast-capable fabric"]
fn multicast_datagrams_are_delivered() -> anyhow::Result<()> {
    const GROUP: &str = "239.1.2.3";
    const COUNT: usize = 10;
    const LEN: usize = 256;

    let sequencer = NodeIdSequencer::start_on("127.0.0.1:0")?;
    let config = test_config(sequencer.local_addr());

    let recv_memory = Arc::new(MemoryRegion::new(MemoryKind::Host, 1 << 20, &config)?);
    let receiver = UnreliableEngine::new(recv_memory.clone(), &config)?;
    let recv_group = receiver.join_multicast(GROUP)?;

    let send_memory = Arc::new(MemoryRegion::new(MemoryKind::Host, 1 << 20, &config)?);
    let sender = UnreliableEngine::new(send_memory.clone(), &config)?;
    let send_group = sender.join_multicast(GROUP)?;

    for i in 0..COUNT {
        receiver.receive_multicast(recv_group, 64 + i * (LEN + 64), LEN)?;
    }
    // Joins propagate asynchronously through the fabric.
    thread::sleep(Duration::from_millis(200));

    send_memory.fill_random();
    for i in 0..COUNT {
        sender.send_multicast(send_group, i * LEN, LEN, true)?;
    }

    for _ in 0..COUNT {
        let (n, imm) = receiver.poll_receive_multicast(recv_group, true)?;
        assert_eq!(n, 1);
        assert!(imm.is_some(), "multicast sends carry the sender QPN");
    }

    sender.leave_multicast(send_group)?;
    receiver.leave_multicast(recv_group)?;
    Ok(())
}
