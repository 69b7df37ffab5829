//! ICL server
//!
//! Serves every configured network path over TCP with an echo dispatcher:
//! each request's body comes back under a response header, and task 0x00FF
//! ends the client after its response.
//!
//! Usage: `icl-server [name=addr,...]` (default from `ICL_LISTEN`)
//!
//! SIGTERM / SIGINT shut down gracefully; SIGQUIT immediately.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use icl_core::frame::{self, HEADER_LEN};
use icl_core::{logging, DispatchContext, DispatchError, Dispatcher, Disposition, TaskCode};
use icl_runtime::{signal, EventLog, NetworkPath, Server, ServerConfig, ServerEvent};
use tracing::{info, warn};

const TASK_FINISH: TaskCode = TaskCode(0x00FF);

struct EchoDispatcher {
    server_id: u32,
}

impl Dispatcher for EchoDispatcher {
    fn process(
        &self,
        ctx: &DispatchContext<'_>,
        request: &[u8],
        response: &mut Vec<u8>,
    ) -> Result<Disposition, DispatchError> {
        let body = request
            .get(HEADER_LEN..)
            .ok_or_else(|| DispatchError::Rejected(format!("{} byte request", request.len())))?;
        frame::encode_header(response, ctx.task, self.server_id, (HEADER_LEN + body.len()) as u32);
        response.extend_from_slice(body);
        if ctx.task == TASK_FINISH {
            Ok(Disposition::Finished)
        } else {
            Ok(Disposition::Continue)
        }
    }
}

fn main() -> anyhow::Result<()> {
    logging::init();

    let mut config = ServerConfig::from_env();
    if let Some(spec) = std::env::args().nth(1) {
        config = config.paths(NetworkPath::parse_list(&spec).context("parsing listen spec")?);
    }

    signal::install().context("installing signal handlers")?;

    let events = Arc::new(EventLog::new());
    let dispatcher = Arc::new(EchoDispatcher { server_id: config.server_id });
    let server = Server::start_tcp(config, dispatcher, events.clone()).context("starting server")?;
    for (name, addr) in server.local_addrs() {
        println!("icl-server: {} listening on {}", name, addr);
    }

    loop {
        if let Some(mode) = signal::take_pending() {
            info!(mode = %mode, "shutdown requested");
            server.shutdown(mode);
        }
        for event in events.drain() {
            match event {
                ServerEvent::InternalFault(e) => warn!(error = %e, "internal fault"),
                ServerEvent::ServerDrained => info!("server drained"),
                ServerEvent::ListenerTerminated(..) => {}
            }
        }
        if server.is_stopped() {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    let report = server.wait();
    println!("\n=== ICL Server Report ===");
    println!("{}", report);
    if report.panicked > 0 {
        anyhow::bail!("{} threads panicked", report.panicked);
    }
    report.consistency.context("registry check at exit")?;
    Ok(())
}
