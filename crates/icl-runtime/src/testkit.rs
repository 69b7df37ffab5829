//! Shared helpers for listener and server tests

use std::thread;
use std::time::{Duration, Instant};

use icl_core::frame::{self, HEADER_LEN};
use icl_core::{DispatchContext, DispatchError, Dispatcher, Disposition, RequestBuilder, TaskCode};

use crate::config::ServerConfig;

pub(crate) const T: Duration = Duration::from_secs(3);

/// Task that ends the client after its response
pub(crate) const TASK_FINISH: TaskCode = TaskCode(0x00FF);

/// Echoes the request body back under a response header
pub(crate) struct Echo;

impl Dispatcher for Echo {
    fn process(
        &self,
        ctx: &DispatchContext<'_>,
        request: &[u8],
        response: &mut Vec<u8>,
    ) -> Result<Disposition, DispatchError> {
        let body = request.get(HEADER_LEN..).unwrap_or_default();
        frame::encode_header(response, ctx.task, 0, (HEADER_LEN + body.len()) as u32);
        response.extend_from_slice(body);
        Ok(if ctx.task == TASK_FINISH { Disposition::Finished } else { Disposition::Continue })
    }
}

pub(crate) fn config() -> ServerConfig {
    ServerConfig::new()
        .max_workers(10)
        .max_descriptors(16)
        .standing_buffer_size(256)
        .recv_poll_interval(Duration::from_millis(10))
        .accept_poll_interval(Duration::from_millis(10))
        .park_poll_interval(Duration::from_millis(10))
        .accept_backoff(Duration::from_millis(1))
}

pub(crate) fn request(task: TaskCode, server_id: u32, body: &[u8]) -> Vec<u8> {
    RequestBuilder::new(task).server_id(server_id).raw(body).build()
}

pub(crate) fn wait_until(what: &str, f: impl Fn() -> bool) {
    let deadline = Instant::now() + T;
    while !f() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(2));
    }
}
