//! The worker pool.
//!
//! A fixed array of slots sized at start to the general-worker count plus
//! every category's reservation, so the scheduler can always honour a
//! reservation. Threads are created lazily the first time a slot is used
//! and each one processes a single job at a time, signalling the proxy when
//! it is ready for the next.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc as std_mpsc;
use std::thread;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::category::CommandHandler;
use crate::control::Client;
use crate::keys::PubKey;
use crate::message::Message;

/// A unit of work: one resolved incoming command bound for a handler.
pub(crate) struct Job {
    pub category: String,
    pub command: String,
    pub pubkey: PubKey,
    pub service_node: bool,
    pub callback: CommandHandler,
    pub parts: Vec<Bytes>,
}

/// Instructions delivered to a worker thread.
enum WorkerCmd {
    Run(Job),
    Quit,
}

/// Signals from worker threads back to the proxy.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// The slot finished its job and is ready for another.
    Ready(usize),
    /// The slot's thread has exited.
    Stopped(usize),
}

/// Bookkeeping for a dispatched job, read back on completion.
pub(crate) struct ActiveJob {
    pub category: String,
    /// Whether this dispatch counted against the general pool rather than
    /// the category's reservation.
    pub counts_general: bool,
}

struct WorkerSlot {
    thread: Option<thread::JoinHandle<()>>,
    jobs: Option<std_mpsc::SyncSender<WorkerCmd>>,
    busy: Option<ActiveJob>,
}

pub(crate) struct WorkerPool {
    slots: Vec<WorkerSlot>,
    idle: Vec<usize>,
    spawned: usize,
    stopped: usize,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    client: Client,
}

impl WorkerPool {
    pub fn new(size: usize, events_tx: mpsc::UnboundedSender<WorkerEvent>, client: Client) -> Self {
        let mut slots = Vec::with_capacity(size);
        for _ in 0..size {
            slots.push(WorkerSlot {
                thread: None,
                jobs: None,
                busy: None,
            });
        }
        Self {
            slots,
            idle: (0..size).collect(),
            spawned: 0,
            stopped: 0,
            events_tx,
            client,
        }
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn has_idle(&self) -> bool {
        !self.idle.is_empty()
    }

    /// Hand a job to an idle slot, starting its thread if necessary.
    ///
    /// Returns the job back if no slot could take it.
    pub fn run(&mut self, job: Job, counts_general: bool) -> Result<(), Job> {
        let Some(index) = self.idle.pop() else {
            return Err(job);
        };

        if self.slots[index].thread.is_none() {
            if let Err(e) = self.start_slot(index) {
                warn!("failed to start worker thread {}: {}", index, e);
                self.idle.push(index);
                return Err(job);
            }
        }

        let slot = &mut self.slots[index];
        slot.busy = Some(ActiveJob {
            category: job.category.clone(),
            counts_general,
        });
        if let Some(jobs) = &slot.jobs {
            // Never blocks: a slot only ever holds one job at a time.
            if jobs.send(WorkerCmd::Run(job)).is_err() {
                warn!("worker {} is gone; dropping job", index);
                slot.busy = None;
                return Ok(());
            }
        }
        Ok(())
    }

    fn start_slot(&mut self, index: usize) -> std::io::Result<()> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        let events = self.events_tx.clone();
        let client = self.client.clone();
        let handle = thread::Builder::new()
            .name(format!("peerbus-worker-{index}"))
            .spawn(move || worker_loop(index, rx, events, client))?;

        let slot = &mut self.slots[index];
        slot.thread = Some(handle);
        slot.jobs = Some(tx);
        self.spawned += 1;
        debug!("started worker thread {}", index);
        Ok(())
    }

    /// Take the completion bookkeeping for a slot that signalled `Ready`.
    pub fn complete(&mut self, index: usize) -> Option<ActiveJob> {
        self.slots.get_mut(index).and_then(|s| s.busy.take())
    }

    pub fn mark_idle(&mut self, index: usize) {
        self.idle.push(index);
    }

    /// Tell one started slot to exit.
    pub fn quit_slot(&mut self, index: usize) {
        if let Some(jobs) = &self.slots[index].jobs {
            let _ = jobs.send(WorkerCmd::Quit);
        }
    }

    /// Tell every started idle slot to exit; busy slots are told as they
    /// finish.
    pub fn begin_quit(&mut self) {
        let idle = std::mem::take(&mut self.idle);
        for index in idle {
            if self.slots[index].thread.is_some() {
                self.quit_slot(index);
            }
        }
    }

    pub fn note_stopped(&mut self, _index: usize) {
        self.stopped += 1;
    }

    /// True once every thread that was ever started has exited.
    pub fn all_stopped(&self) -> bool {
        self.stopped >= self.spawned
    }

    /// Join every worker thread; call only after `all_stopped()`.
    pub fn join_all(&mut self) {
        for slot in &mut self.slots {
            slot.jobs = None;
            if let Some(handle) = slot.thread.take() {
                let _ = handle.join();
            }
        }
    }
}

/// Body of a worker thread: wait for a job, run the handler, signal back.
///
/// A panicking handler is caught and logged; the slot stays usable.
fn worker_loop(
    index: usize,
    jobs: std_mpsc::Receiver<WorkerCmd>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    client: Client,
) {
    while let Ok(cmd) = jobs.recv() {
        match cmd {
            WorkerCmd::Run(job) => {
                let callback = job.callback.clone();
                let message = Message::new(&job.pubkey, job.service_node, &job.parts, &client);
                if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
                    warn!("handler for `{}` panicked; worker {} recovering", job.command, index);
                }
                if events.send(WorkerEvent::Ready(index)).is_err() {
                    break;
                }
            }
            WorkerCmd::Quit => break,
        }
    }
    debug!("worker {} exiting", index);
    let _ = events.send(WorkerEvent::Stopped(index));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn test_client() -> (Client, mpsc::UnboundedReceiver<crate::control::ControlFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Client::new(tx, Arc::new(AtomicBool::new(false))), rx)
    }

    fn job_with(callback: CommandHandler) -> Job {
        Job {
            category: "x".into(),
            command: "x.cmd".into(),
            pubkey: PubKey::from_bytes([0u8; 32]),
            service_node: false,
            callback,
            parts: vec![Bytes::from_static(b"payload")],
        }
    }

    #[tokio::test]
    async fn test_job_runs_and_slot_returns() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, _control_rx) = test_client();
        let mut pool = WorkerPool::new(2, events_tx, client);

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let callback: CommandHandler = Arc::new(move |msg: Message<'_>| {
            assert_eq!(msg.data(), &[Bytes::from_static(b"payload")]);
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        assert!(pool.run(job_with(callback), true).is_ok());

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let WorkerEvent::Ready(index) = event else {
            panic!("expected Ready, got {event:?}");
        };
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        let active = pool.complete(index).unwrap();
        assert!(active.counts_general);
        pool.mark_idle(index);
        assert!(pool.has_idle());
    }

    #[tokio::test]
    async fn test_panicking_handler_keeps_worker_alive() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, _control_rx) = test_client();
        let mut pool = WorkerPool::new(1, events_tx, client);

        let callback: CommandHandler = Arc::new(|_msg: Message<'_>| panic!("boom"));
        assert!(pool.run(job_with(callback), false).is_ok());

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let WorkerEvent::Ready(index) = event else {
            panic!("expected Ready after panic, got {event:?}");
        };
        pool.complete(index);
        pool.mark_idle(index);

        // The same slot still runs jobs.
        let ok = Arc::new(AtomicBool::new(false));
        let ok2 = ok.clone();
        let callback: CommandHandler =
            Arc::new(move |_msg: Message<'_>| ok2.store(true, Ordering::SeqCst));
        assert!(pool.run(job_with(callback), false).is_ok());

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WorkerEvent::Ready(_)));
        assert!(ok.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_quit_drains_threads() {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (client, _control_rx) = test_client();
        let mut pool = WorkerPool::new(2, events_tx, client);

        let callback: CommandHandler = Arc::new(|_msg: Message<'_>| {});
        assert!(pool.run(job_with(callback), false).is_ok());

        // Wait for the job to finish, then quit the pool.
        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let WorkerEvent::Ready(index) = event else {
            panic!("expected Ready");
        };
        pool.complete(index);
        pool.mark_idle(index);
        pool.begin_quit();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, WorkerEvent::Stopped(_)));
        pool.note_stopped(0);
        assert!(pool.all_stopped());
        pool.join_all();
    }
}
