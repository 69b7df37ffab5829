//! ICL load generator
//!
//! Opens N connections to an ICL server, sends CREDENTIALS on each and
//! then M echo requests, checking every response.
//!
//! Usage: `icl-stress [addr] [connections] [requests]`

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use icl_core::frame::{PacketPrefix, HEADER_LEN, PREFIX_LEN};
use icl_core::{logging, Connection, RequestBuilder, TaskCode};
use icl_runtime::transport::TcpConnection;
use tracing::warn;

const TASK_ECHO: TaskCode = TaskCode(0x0010);
const TASK_FINISH: TaskCode = TaskCode(0x00FF);
const TIMEOUT: Duration = Duration::from_secs(10);

fn read_packet(conn: &mut TcpConnection) -> anyhow::Result<Vec<u8>> {
    let mut prefix = [0u8; PREFIX_LEN];
    conn.receive_exact(&mut prefix, TIMEOUT)?;
    let p = PacketPrefix::parse(&prefix)?;
    p.check_tag()?;
    let len = p.check_length(usize::MAX)?;
    let mut packet = vec![0u8; len];
    packet[..PREFIX_LEN].copy_from_slice(&prefix);
    conn.receive_exact(&mut packet[PREFIX_LEN..], TIMEOUT)?;
    Ok(packet)
}

fn run_client(addr: &str, id: usize, requests: usize, server_id: u32) -> anyhow::Result<u64> {
    let mut conn = TcpConnection::connect(addr).with_context(|| format!("client {} connect", id))?;

    let hello = RequestBuilder::new(TaskCode::CREDENTIALS)
        .string(&format!("user{}", id))
        .bytes(b"stress")
        .string("L1")
        .unicode("en_US")
        .build();
    conn.send(&hello)?;
    read_packet(&mut conn)?;

    let mut done = 1;
    for i in 0..requests {
        let last = i + 1 == requests;
        let body = format!("client {} request {}", id, i);
        let task = if last { TASK_FINISH } else { TASK_ECHO };
        let req = RequestBuilder::new(task).server_id(server_id).raw(body.as_bytes()).build();
        conn.send(&req)?;
        let resp = read_packet(&mut conn)?;
        if resp.get(HEADER_LEN..) != Some(body.as_bytes()) {
            bail!("client {}: response {} does not echo the request", id, i);
        }
        done += 1;
    }
    Ok(done)
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:4460".to_string());
    let connections: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(16);
    let requests: usize = args.next().and_then(|s| s.parse().ok()).unwrap_or(1000);
    let server_id: u32 = icl_core::env_get("ICL_SERVER_ID", 1);

    println!("=== ICL Stress Test ===\n");
    println!("Target:      {}", addr);
    println!("Connections: {}", connections);
    println!("Requests:    {} per connection\n", requests);

    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..connections)
        .map(|id| {
            let addr = addr.clone();
            let completed = Arc::clone(&completed);
            let failed = Arc::clone(&failed);
            thread::Builder::new()
                .name(format!("icl-stress-{}", id))
                .spawn(move || match run_client(&addr, id, requests, server_id) {
                    Ok(n) => {
                        completed.fetch_add(n, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(client = id, error = %e, "client failed");
                        failed.fetch_add(1, Ordering::Relaxed);
                    }
                })
                .context("spawning client thread")
        })
        .collect::<anyhow::Result<_>>()?;

    for h in handles {
        let _ = h.join();
    }
    let elapsed = start.elapsed();
    let done = completed.load(Ordering::Relaxed);
    let failed = failed.load(Ordering::Relaxed);

    println!("=== Results ===");
    println!("Requests:    {}", done);
    println!("Failed:      {} connections", failed);
    println!("Time:        {:?}", elapsed);
    println!("Throughput:  {:.0} requests/sec", done as f64 / elapsed.as_secs_f64());

    if failed > 0 {
        bail!("{} of {} connections failed", failed, connections);
    }
    Ok(())
}
