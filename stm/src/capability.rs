// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use crate::{errors::RuntimeError, message::Message, stats::StmStats};
use futures::{
    channel::mpsc::{self, UnboundedReceiver, UnboundedSender},
    executor::block_on,
    StreamExt,
};
use log::*;
use std::{sync::Arc, thread::JoinHandle};

/// A worker of the runtime. Every thread belongs to one capability, and messages
/// addressed to a thread are delivered through the inbox of its capability.
pub struct Capability {
    no: usize,
    inbox: UnboundedSender<Arc<dyn Message>>,
    worker: Option<JoinHandle<()>>,
}

impl Capability {
    pub(crate) fn spawn(no: usize, stats: Arc<StmStats>) -> Result<Self, RuntimeError> {
        let (inbox, receiver) = mpsc::unbounded();
        let worker = std::thread::Builder::new()
            .name(format!("stm-capability-{}", no))
            .spawn(move || run(no, receiver, stats))
            .map_err(|error| RuntimeError::Capability(no, error))?;

        Ok(Self {
            no,
            inbox,
            worker: Some(worker),
        })
    }

    pub fn no(&self) -> usize {
        self.no
    }

    /// Posts a message to this capability. If the worker has already shut down, the
    /// message is executed on the calling thread.
    pub fn post(&self, message: Arc<dyn Message>) {
        if let Err(error) = self.inbox.unbounded_send(message) {
            warn!("CAP({}): inbox closed, executing message in place", self.no);
            let message = error.into_inner();
            if message.is_valid() {
                message.execute(self.no);
            }
        }
    }
}

impl Drop for Capability {
    fn drop(&mut self) {
        self.inbox.close_channel();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("CAP({}): worker panicked", self.no);
            }
        }
    }
}

fn run(no: usize, mut inbox: UnboundedReceiver<Arc<dyn Message>>, stats: Arc<StmStats>) {
    info!("CAP({}): worker started", no);

    while let Some(message) = block_on(inbox.next()) {
        if !message.is_valid() {
            trace!("CAP({}): dropping stale message", no);
            StmStats::bump(&stats.stale_messages);
            continue;
        }
        message.execute(no);
    }

    info!("CAP({}): worker stopped", no);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize, Ordering},
        time::{Duration, Instant},
    };

    #[derive(Default)]
    struct Counting {
        valid: AtomicBool,
        executed: AtomicUsize,
    }

    impl Message for Counting {
        fn is_valid(&self) -> bool {
            self.valid.load(Ordering::SeqCst)
        }

        fn invalidate(&self) {
            self.valid.store(false, Ordering::SeqCst);
        }

        fn execute(&self, _: usize) {
            self.executed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wait_for(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "condition not met in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_messages_are_checked_at_dequeue() {
        let stats = Arc::new(StmStats::default());
        let capability = Capability::spawn(0, stats.clone()).expect("Failed to spawn capability");

        let valid = Arc::new(Counting {
            valid: AtomicBool::new(true),
            ..Default::default()
        });
        let stale = Arc::new(Counting::default());

        capability.post(stale.clone());
        capability.post(valid.clone());

        wait_for(|| valid.executed.load(Ordering::SeqCst) == 1);
        wait_for(|| stats.stale_messages.load(Ordering::Relaxed) == 1);
        assert_eq!(stale.executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_stops_worker() {
        let capability = Capability::spawn(3, Arc::new(StmStats::default())).expect("Failed to spawn capability");
        assert_eq!(capability.no(), 3);
        drop(capability);
    }
}
