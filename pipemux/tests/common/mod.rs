//! In-process controller/worker pair connected by duplex pipes.

#![allow(dead_code)]

use std::time::Duration;

use tokio::task::JoinHandle;

use pipemux::{Controller, ControllerConfig, WorkerConfig, WorkerError, run_worker};

pub struct Pair {
    pub controller: Controller,
    pub worker: JoinHandle<Result<(), WorkerError>>,
    link: JoinHandle<()>,
}

impl Pair {
    /// Cut the physical connection between the two ends.
    pub fn sever(&self) {
        self.link.abort();
    }
}

pub async fn connect(config: WorkerConfig) -> Pair {
    let (controller_end, link_a) = tokio::io::duplex(256 * 1024);
    let (link_b, worker_end) = tokio::io::duplex(256 * 1024);

    let (wr, ww) = tokio::io::split(worker_end);
    let worker = tokio::spawn(run_worker(wr, ww, config));

    // Relay between the two pipes so tests can drop the connection.
    let link = tokio::spawn(async move {
        let (mut a, mut b) = (link_a, link_b);
        let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
    });

    let (cr, cw) = tokio::io::split(controller_end);
    let controller = Controller::connect(
        cr,
        cw,
        ControllerConfig::new("test-controller").with_handshake_timeout(Duration::from_secs(5)),
    )
    .await
    .expect("handshake");

    Pair {
        controller,
        worker,
        link,
    }
}

pub async fn connect_default() -> Pair {
    connect(WorkerConfig::default().with_label("test-worker")).await
}

/// Poll `check` until it holds or a few seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
