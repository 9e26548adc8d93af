//! Benchmark driver for the RDMA transport engines.
//!
//! Runs bandwidth, latency, and atomics tests over RC connections, with
//! client/server coordination through data-plane barriers. Both sides must
//! be started with the same test selection and geometry.
//!
//! ```text
//! perf sequencer [--config=FILE]
//! perf server  [--bind=IP:PORT] [options]
//! perf client  --addr=IP:PORT[,IP:PORT...] [options]
//!
//! options:
//!   --test=LIST        comma list of bandwidth,latency,atomics (default all)
//!   --size=N           packet size in bytes (default 4096)
//!   --threads=N        worker threads (default 1)
//!   --slots=N          buffer slots per thread (default 16)
//!   --iterations=N     operations per thread (default 100000)
//!   --mode=MODE        write mode: normal, immediate, auto (default auto)
//!   --memory=KIND      host, huge, numa:<node>, device:<index> (default host)
//!   --memsize=N        memory region size (default from configuration)
//!   --clients=N        connections the server waits for (default 1)
//!   --csv=FILE         append results to FILE
//!   --config=FILE      TOML configuration file
//!   --ignoreerrors     keep going after a failed test
//! ```
//!
//! The immediate write mode drives one connection per process and is
//! limited to a single thread.

use std::collections::VecDeque;
use std::io::Write as _;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ibfabric::barrier::{self, ReceiveBudget};
use ibfabric::{
    Client, Config, ConnId, MemoryKind, MemoryRegion, ReliableEngine, Result, Server,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TestKind {
    Bandwidth,
    Latency,
    Atomics,
}

impl TestKind {
    fn name(self) -> &'static str {
        match self {
            TestKind::Bandwidth => "bandwidth",
            TestKind::Latency => "latency",
            TestKind::Atomics => "atomics",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    Normal,
    Immediate,
    Auto,
}

#[derive(Debug, Clone)]
struct Options {
    role: String,
    tests: Vec<TestKind>,
    size: usize,
    threads: usize,
    slots: usize,
    iterations: usize,
    mode: WriteMode,
    memory: MemoryKind,
    memsize: Option<usize>,
    csv: Option<String>,
    config_file: Option<String>,
    ignore_errors: bool,
    bind: Option<String>,
    addrs: Vec<String>,
    clients: usize,
}

fn usage() -> ! {
    eprintln!("usage: perf <sequencer|server|client> [--key=value ...]");
    eprintln!("run with the same --test/--size/--threads/--iterations on both sides");
    std::process::exit(2);
}

fn parse_options() -> Options {
    let mut args: VecDeque<String> = std::env::args().skip(1).collect();
    let role = args.pop_front().unwrap_or_else(|| usage());
    if !matches!(role.as_str(), "sequencer" | "server" | "client") {
        usage();
    }

    let mut opts = Options {
        role,
        tests: vec![TestKind::Bandwidth, TestKind::Latency, TestKind::Atomics],
        size: 4096,
        threads: 1,
        slots: 16,
        iterations: 100_000,
        mode: WriteMode::Auto,
        memory: MemoryKind::Host,
        memsize: None,
        csv: None,
        config_file: None,
        ignore_errors: false,
        bind: None,
        addrs: Vec::new(),
        clients: 1,
    };

    for arg in args {
        let (key, value) = match arg.split_once('=') {
            Some((k, v)) => (k, v),
            None => (arg.as_str(), ""),
        };
        match key {
            "--test" => {
                opts.tests = value
                    .split(',')
                    .map(|t| match t.trim() {
                        "bandwidth" => TestKind::Bandwidth,
                        "latency" => TestKind::Latency,
                        "atomics" => TestKind::Atomics,
                        other => {
                            eprintln!("unknown test '{}'", other);
                            usage();
                        }
                    })
                    .collect();
            }
            "--size" => opts.size = value.parse().unwrap_or_else(|_| usage()),
            "--threads" => opts.threads = value.parse().unwrap_or_else(|_| usage()),
            "--slots" => opts.slots = value.parse().unwrap_or_else(|_| usage()),
            "--iterations" => opts.iterations = value.parse().unwrap_or_else(|_| usage()),
            "--mode" => {
                opts.mode = match value {
                    "normal" => WriteMode::Normal,
                    "immediate" => WriteMode::Immediate,
                    "auto" => WriteMode::Auto,
                    other => {
                        eprintln!("unknown write mode '{}'", other);
                        usage();
                    }
                }
            }
            "--memory" => {
                opts.memory = match value.split_once(':') {
                    None if value == "host" => MemoryKind::Host,
                    None if value == "huge" => MemoryKind::HostHuge,
                    Some(("numa", node)) => {
                        MemoryKind::HostNuma(node.parse().unwrap_or_else(|_| usage()))
                    }
                    Some(("device", index)) => {
                        MemoryKind::Device(index.parse().unwrap_or_else(|_| usage()))
                    }
                    _ => {
                        eprintln!("unknown memory kind '{}'", value);
                        usage();
                    }
                }
            }
            "--memsize" => opts.memsize = Some(value.parse().unwrap_or_else(|_| usage())),
            "--csv" => opts.csv = Some(value.to_owned()),
            "--config" => opts.config_file = Some(value.to_owned()),
            "--ignoreerrors" => opts.ignore_errors = true,
            "--clients" => opts.clients = value.parse().unwrap_or_else(|_| usage()),
            "--bind" => opts.bind = Some(value.to_owned()),
            "--addr" => {
                opts.addrs = value.split(',').map(|a| a.trim().to_owned()).collect();
            }
            other => {
                eprintln!("unknown option '{}'", other);
                usage();
            }
        }
    }
    if opts.mode == WriteMode::Immediate && opts.threads > 1 {
        eprintln!("perf: the immediate write mode supports a single thread only");
        usage();
    }
    opts
}

/// The effective per-thread work-request window both sides agree on.
fn thread_window(config: &Config, threads: usize) -> u32 {
    (config.max_wr / threads.max(1) as u32).max(2)
}

fn append_csv(path: &str, row: &str) -> std::io::Result<()> {
    let new = !std::path::Path::new(path).exists();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    if new {
        writeln!(file, "test,mode,size,threads,slots,iterations,seconds,mib_per_sec,ops_per_sec")?;
    }
    writeln!(file, "{}", row)
}

fn main() {
    let opts = parse_options();
    let mut config = match Config::load(opts.config_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("perf: cannot load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if opts.addrs.is_empty() {
        // Fall back to the configured default targets.
        let addrs = config.server_addresses.clone();
        if opts.role == "client" && addrs.is_empty() {
            eprintln!("perf: client mode needs --addr or configured server addresses");
            std::process::exit(2);
        }
        config.server_addresses = addrs;
    }

    let status = match opts.role.as_str() {
        "sequencer" => run_sequencer(&config),
        "server" => run_server(&opts, &config),
        "client" => run_client(&opts, &config),
        _ => unreachable!(),
    };
    if let Err(e) = status {
        eprintln!("perf: {}", e);
        std::process::exit(1);
    }
}

fn run_sequencer(config: &Config) -> Result<()> {
    let sequencer = ibfabric::NodeIdSequencer::start(config)?;
    println!("sequencer running on {}", sequencer.local_addr());
    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}

fn build_engine(
    opts: &Options,
    config: &Config,
) -> Result<(Arc<MemoryRegion>, Arc<ReliableEngine>)> {
    let memsize = opts.memsize.unwrap_or(config.memsize);
    let memory = Arc::new(MemoryRegion::new(opts.memory, memsize, config)?);
    if opts.memory.is_device() {
        // Device buffers must not be compressible on the link.
        memory.fill_random();
    }
    let engine = Arc::new(ReliableEngine::new(memory.clone(), config)?);
    Ok((memory, engine))
}

fn run_server(opts: &Options, config: &Config) -> Result<()> {
    let (_memory, engine) = build_engine(opts, config)?;
    let server = match &opts.bind {
        Some(bind) => Server::with_bind_addr(engine.clone(), config.clone(), "perf-server", bind.clone()),
        None => Server::new(engine.clone(), config.clone(), "perf-server")?,
    };
    server.start()?;
    println!(
        "perf server {} on {}",
        server.own_node_id().unwrap_or(0),
        server.local_addr().unwrap_or_default()
    );

    // Wait for every client process to connect before each test round.
    let expected = opts.clients.max(1);
    let window = thread_window(config, opts.threads);
    for &test in &opts.tests {
        let conns = loop {
            let conns = server.connected_ids();
            if conns.len() >= expected {
                break conns;
            }
            thread::sleep(Duration::from_millis(100));
        };

        barrier::global_barrier_server(&engine, &conns)?;
        if test == TestKind::Bandwidth && opts.mode == WriteMode::Immediate {
            serve_immediate_bandwidth(&engine, &conns, opts, window)?;
        }
        barrier::global_barrier_server(&engine, &conns)?;
        println!("server completed {} round", test.name());
    }
    server.stop();
    Ok(())
}

/// Server side of the IMMEDIATE-mode bandwidth flow: consume block after
/// block of WRITE_WITH_IMM messages and acknowledge each block with one
/// WRITE_WITH_IMM carrying the block size.
fn serve_immediate_bandwidth(
    engine: &Arc<ReliableEngine>,
    conns: &[ConnId],
    opts: &Options,
    window: u32,
) -> Result<()> {
    let block = ReceiveBudget::ack_block(window) as usize;
    let per_conn = opts.iterations;

    let mut workers = Vec::new();
    for &conn in conns {
        let engine = engine.clone();
        workers.push(thread::spawn(move || -> Result<()> {
            let mut received = 0usize;
            while received < per_conn {
                let burst = block.min(per_conn - received);
                for _ in 0..burst {
                    engine.receive_write_imm(conn)?;
                }
                for _ in 0..burst {
                    engine.poll_receive(conn, true)?;
                }
                received += burst;
                engine.write_imm(conn, 0, 0, 0, burst as u32, true)?;
            }
            Ok(())
        }));
    }
    for worker in workers {
        worker.join().expect("bandwidth worker panicked")?;
    }
    Ok(())
}

fn run_client(opts: &Options, config: &Config) -> Result<()> {
    let addrs = if opts.addrs.is_empty() {
        config.server_addresses.clone()
    } else {
        opts.addrs.clone()
    };
    let (_memory, engine) = build_engine(opts, config)?;
    let client = Arc::new(Client::new(engine.clone(), config.clone(), "perf-client")?);

    let mut conns: Vec<ConnId> = Vec::new();
    for addr in &addrs {
        let node = client.connect(addr)?;
        conns.push(node as ConnId);
    }

    // One remote slot strip per thread, on every peer.
    let strip = opts.size * opts.slots;
    let mut remote_offsets = Vec::new();
    for &conn in &conns {
        let mut per_thread = Vec::new();
        for _ in 0..opts.threads {
            per_thread.push(client.remote_alloc(conn as u64, strip)?);
        }
        remote_offsets.push(per_thread);
    }

    let window = thread_window(config, opts.threads);
    let clock = quanta::Clock::new();
    let mut failed = false;

    for &test in &opts.tests {
        barrier::global_barrier_client(&engine, &conns)?;
        let start = clock.now();
        let result = run_client_test(test, opts, &engine, &conns, &remote_offsets, window);
        let seconds = clock.now().duration_since(start).as_secs_f64();
        barrier::global_barrier_client(&engine, &conns)?;

        match result {
            Ok(()) => {
                let total_ops = opts.iterations * opts.threads;
                let mib = (total_ops * opts.size) as f64 / (1024.0 * 1024.0) / seconds;
                let ops = total_ops as f64 / seconds;
                println!(
                    "{:<10} size={:<8} threads={} iterations={} {:>10.3} s {:>12.2} MiB/s {:>14.0} op/s",
                    test.name(),
                    opts.size,
                    opts.threads,
                    opts.iterations,
                    seconds,
                    mib,
                    ops
                );
                if let Some(csv) = &opts.csv {
                    let mode = match opts.mode {
                        WriteMode::Normal => "normal",
                        WriteMode::Immediate => "immediate",
                        WriteMode::Auto => "auto",
                    };
                    let row = format!(
                        "{},{},{},{},{},{},{:.6},{:.2},{:.0}",
                        test.name(),
                        mode,
                        opts.size,
                        opts.threads,
                        opts.slots,
                        opts.iterations,
                        seconds,
                        mib,
                        ops
                    );
                    if let Err(e) = append_csv(csv, &row) {
                        eprintln!("perf: cannot write CSV '{}': {}", csv, e);
                    }
                }
            }
            Err(e) => {
                eprintln!("perf: {} failed: {}", test.name(), e);
                failed = true;
                if !opts.ignore_errors {
                    break;
                }
            }
        }
    }

    for &conn in &conns {
        let _ = client.disconnect(conn as u64);
    }
    if failed && !opts.ignore_errors {
        std::process::exit(1);
    }
    Ok(())
}

fn run_client_test(
    test: TestKind,
    opts: &Options,
    engine: &Arc<ReliableEngine>,
    conns: &[ConnId],
    remote_offsets: &[Vec<usize>],
    window: u32,
) -> Result<()> {
    let mut workers = Vec::new();
    let data_area = opts.size * opts.slots * opts.threads.max(1);
    for t in 0..opts.threads.max(1) {
        let engine = engine.clone();
        let conns = conns.to_vec();
        let remote: Vec<usize> = remote_offsets.iter().map(|per| per[t]).collect();
        let opts = opts.clone();
        let local_base = t * opts.size * opts.slots;
        // Fetched atomic values land past the data slots, one word per
        // thread.
        let atomics_local = data_area + t * 8;

        workers.push(thread::spawn(move || -> Result<()> {
            match test {
                TestKind::Bandwidth => match effective_mode(&opts) {
                    WriteMode::Immediate => {
                        bandwidth_immediate(&engine, &conns, &remote, &opts, local_base, window)
                    }
                    _ => bandwidth_normal(&engine, &conns, &remote, &opts, local_base),
                },
                TestKind::Latency => {
                    for i in 0..opts.iterations {
                        let slot = i % opts.slots;
                        let conn = conns[i % conns.len()];
                        let roff = remote[i % remote.len()] + slot * opts.size;
                        engine.write(conn, roff, local_base + slot * opts.size, opts.size, true)?;
                    }
                    Ok(())
                }
                TestKind::Atomics => {
                    for i in 0..opts.iterations {
                        let conn = conns[i % conns.len()];
                        let signaled = i + 1 == opts.iterations;
                        engine.fetch_and_add(conn, remote[i % remote.len()], atomics_local, 1, 8, signaled)?;
                    }
                    Ok(())
                }
            }
        }));
    }

    let mut result = Ok(());
    for worker in workers {
        if let Err(e) = worker.join().expect("client worker panicked") {
            result = Err(e);
        }
    }
    result
}

fn effective_mode(opts: &Options) -> WriteMode {
    match opts.mode {
        WriteMode::Auto => WriteMode::Normal,
        other => other,
    }
}

fn bandwidth_normal(
    engine: &Arc<ReliableEngine>,
    conns: &[ConnId],
    remote: &[usize],
    opts: &Options,
    local_base: usize,
) -> Result<()> {
    for i in 0..opts.iterations {
        let slot = i % opts.slots;
        let conn = conns[i % conns.len()];
        let roff = remote[i % remote.len()] + slot * opts.size;
        let signaled = i + 1 == opts.iterations;
        engine.write(conn, roff, local_base + slot * opts.size, opts.size, signaled)?;
    }
    Ok(())
}

fn bandwidth_immediate(
    engine: &Arc<ReliableEngine>,
    conns: &[ConnId],
    remote: &[usize],
    opts: &Options,
    local_base: usize,
    window: u32,
) -> Result<()> {
    let conn = conns[0];
    let roff_base = remote[0];
    let mut budget = ReceiveBudget::new(window);
    let block = ReceiveBudget::ack_block(window) as usize;

    let mut sent = 0usize;
    while sent < opts.iterations {
        let burst = block
            .min(opts.iterations - sent)
            .min(budget.available() as usize);
        if burst == 0 {
            // The window is full: wait for the server's block ack.
            let (_, imm) = engine.poll_receive(conn, true)?;
            budget.on_ack(imm.unwrap_or(0));
            continue;
        }

        // One ack receive per burst, posted before the burst goes out.
        engine.receive_write_imm(conn)?;
        budget.reserve(burst as u32)?;
        for j in 0..burst {
            let slot = (sent + j) % opts.slots;
            engine.write_imm(
                conn,
                roff_base + slot * opts.size,
                local_base + slot * opts.size,
                opts.size,
                (sent + j) as u32,
                j + 1 == burst,
            )?;
        }
        sent += burst;

        let (n, imm) = engine.poll_receive(conn, false)?;
        if n > 0 {
            budget.on_ack(imm.unwrap_or(0));
        }
    }

    // Drain the remaining acks so pending returns to zero.
    while budget.pending() > 0 {
        let (_, imm) = engine.poll_receive(conn, true)?;
        budget.on_ack(imm.unwrap_or(0));
    }
    Ok(())
}
