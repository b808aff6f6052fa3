//! Per-core workers and the core-to-core mailbox.
//!
//! Every core has one bounded inbox. Steering hops, GRO poll requests and
//! cross-core reinjection all travel as a [`CoreMessage`]; the worker that
//! owns the inbox handles them one at a time, so nothing a core does needs a
//! lock. A full inbox drops the frame with `BacklogFull`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, RecvError, Sender, TryRecvError, TrySendError, bounded};
use nix::sched::{CpuSet, sched_setaffinity};
use nix::unistd::Pid;
use tracing::{debug, error, info, trace, warn};

use crate::error::{DatapathError, DropReason, Result};
use crate::frame::Frame;
use crate::gro::TcpCoalescer;
use crate::interface::Interface;
use crate::receive::Datapath;
use crate::rps::SteerMeta;

/// Work handed to a core.
pub enum CoreMessage {
    /// Frame steered at ingress from a physical interface.
    Ingress { frame: Frame, meta: SteerMeta },
    /// Frame steered after forwarding, before GRO enqueue.
    PostForward { frame: Frame, meta: SteerMeta },
    /// Poll the interface's GRO queue.
    Poll(Arc<Interface>),
    /// Coalesced frame to reinject on the core its receive queue maps to.
    Reinject { frame: Frame, rid: u16 },
    Shutdown,
}

impl CoreMessage {
    fn kind(&self) -> &'static str {
        match self {
            CoreMessage::Ingress { .. } => "ingress",
            CoreMessage::PostForward { .. } => "post_forward",
            CoreMessage::Poll(_) => "poll",
            CoreMessage::Reinject { .. } => "reinject",
            CoreMessage::Shutdown => "shutdown",
        }
    }
}

/// Senders for every core's inbox.
pub struct Mailboxes {
    senders: Vec<Sender<CoreMessage>>,
}

impl Mailboxes {
    /// One bounded inbox per core, `depth` messages deep.
    pub fn new(cores: usize, depth: usize) -> (Self, Vec<Receiver<CoreMessage>>) {
        let (senders, receivers) = (0..cores).map(|_| bounded(depth.max(1))).unzip();
        (Self { senders }, receivers)
    }

    pub fn cores(&self) -> usize {
        self.senders.len()
    }

    /// Queue a message for `core` without blocking.
    pub fn send(&self, core: usize, msg: CoreMessage) -> std::result::Result<(), DropReason> {
        let Some(sender) = self.senders.get(core) else {
            warn!(core, cores = self.senders.len(), "Message for unknown core");
            return Err(DropReason::Misc);
        };
        match sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                trace!(core, kind = msg.kind(), "Core backlog full");
                Err(DropReason::BacklogFull)
            }
            Err(TrySendError::Disconnected(msg)) => {
                debug!(core, kind = msg.kind(), "Core inbox closed");
                Err(DropReason::BacklogFull)
            }
        }
    }

    /// Ask every worker to stop. Blocks while an inbox is full.
    pub fn shutdown(&self) {
        for sender in &self.senders {
            let _ = sender.send(CoreMessage::Shutdown);
        }
    }
}

/// The receive context of one core.
pub struct CoreWorker {
    core: usize,
    inbox: Receiver<CoreMessage>,
    datapath: Arc<Datapath>,
    merger: TcpCoalescer,
}

impl CoreWorker {
    pub fn new(core: usize, inbox: Receiver<CoreMessage>, datapath: Arc<Datapath>) -> Self {
        Self {
            core,
            inbox,
            datapath,
            merger: TcpCoalescer::new(),
        }
    }

    pub fn core(&self) -> usize {
        self.core
    }

    /// Handle one message. Returns false when the worker should stop.
    pub fn handle(&mut self, msg: CoreMessage) -> bool {
        let core = self.core;
        match msg {
            CoreMessage::Ingress { frame, meta } => self.datapath.handle_ingress(core, frame, meta),
            CoreMessage::PostForward { frame, meta } => {
                self.datapath.handle_post_forward(core, frame, meta)
            }
            CoreMessage::Poll(vif) => {
                self.datapath.poll_gro(core, &vif, &mut self.merger);
            }
            CoreMessage::Reinject { frame, rid } => self.datapath.reinject_local(core, frame, rid),
            CoreMessage::Shutdown => return false,
        }
        true
    }

    /// Handle everything already queued, including messages queued while
    /// doing so. Returns the number handled.
    pub fn run_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            match self.inbox.try_recv() {
                Ok(msg) => {
                    handled += 1;
                    if !self.handle(msg) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        handled
    }

    /// Block on the inbox until shutdown.
    pub fn run(&mut self) {
        info!(core = self.core, "Core worker started");
        loop {
            match self.inbox.recv() {
                Ok(msg) => {
                    if !self.handle(msg) {
                        break;
                    }
                }
                Err(RecvError) => {
                    debug!(core = self.core, "Inbox disconnected");
                    break;
                }
            }
        }
        info!(core = self.core, "Core worker stopped");
    }
}

/// Bind the calling thread to `core`.
pub fn pin_to_core(core: usize) -> Result<()> {
    let mut set = CpuSet::new();
    set.set(core)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}

/// Handle to a running core worker
pub struct WorkerHandle {
    core: usize,
    thread: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
}

impl WorkerHandle {
    pub fn core(&self) -> usize {
        self.core
    }

    /// Check if the worker is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Wait for the worker to finish
    pub fn join(mut self) -> std::result::Result<(), String> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| format!("Core {} worker panicked", self.core)),
            None => Ok(()),
        }
    }
}

/// Spawn one worker thread per inbox, optionally pinned to its core.
pub fn spawn_workers(
    datapath: &Arc<Datapath>,
    inboxes: Vec<Receiver<CoreMessage>>,
    pin: bool,
) -> Result<Vec<WorkerHandle>> {
    let mut handles = Vec::with_capacity(inboxes.len());
    for (core, inbox) in inboxes.into_iter().enumerate() {
        let mut worker = CoreWorker::new(core, inbox, Arc::clone(datapath));
        let running = Arc::new(AtomicBool::new(true));
        let running_clone = Arc::clone(&running);

        let thread = thread::Builder::new()
            .name(format!("vr-core-{core}"))
            .spawn(move || {
                if pin && let Err(e) = pin_to_core(core) {
                    error!(core, error = %e, "Failed to pin worker");
                }
                worker.run();
                running_clone.store(false, Ordering::Release);
            })
            .map_err(DatapathError::Io)?;

        handles.push(WorkerHandle {
            core,
            thread: Some(thread),
            running,
        });
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mailbox_backlog_full() {
        let (mailboxes, inboxes) = Mailboxes::new(2, 1);
        assert_eq!(mailboxes.cores(), 2);
        let frame = || Frame::with_headroom(0, &[0u8; 4]);

        assert!(mailboxes.send(1, CoreMessage::Reinject { frame: frame(), rid: 0 }).is_ok());
        assert_eq!(
            mailboxes.send(1, CoreMessage::Reinject { frame: frame(), rid: 0 }),
            Err(DropReason::BacklogFull)
        );
        assert_eq!(
            mailboxes.send(5, CoreMessage::Shutdown),
            Err(DropReason::Misc)
        );
        assert_eq!(inboxes[1].len(), 1);
        assert!(inboxes[0].is_empty());
    }

    #[test]
    fn test_mailbox_closed_inbox() {
        let (mailboxes, inboxes) = Mailboxes::new(1, 4);
        drop(inboxes);
        assert_eq!(
            mailboxes.send(0, CoreMessage::Shutdown),
            Err(DropReason::BacklogFull)
        );
    }
}
