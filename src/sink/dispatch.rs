//! Single-consumer hand-off queue between the producer thread and a worker

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use flume::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::capture::{ConnectionInfo, FrameBuffer};
use crate::error::{Error, Result};
use crate::sink::accountant::DropRecord;
use crate::sink::Shared;
use crate::TeardownMode;

pub(crate) enum Event {
    Frame(FrameBuffer),
    Drop(DropRecord),
    Shutdown,
}

/// Frames and drops share one FIFO, so the worker sees them in arrival
/// order. Only frames count against `capacity`; drop notifications are
/// small and always accepted.
pub(crate) struct HandOff {
    tx: Sender<Event>,
    in_flight: Arc<AtomicUsize>,
    discard: Arc<AtomicBool>,
    capacity: usize,
    worker: Option<JoinHandle<()>>,
}

impl HandOff {
    pub(crate) fn spawn(
        shared: Arc<Shared>,
        capacity: usize,
        worker_core: Option<usize>,
        connection: &ConnectionInfo,
    ) -> Result<Self> {
        let (tx, rx) = flume::unbounded();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let discard = Arc::new(AtomicBool::new(false));

        let worker = {
            let in_flight = in_flight.clone();
            let discard = discard.clone();
            thread::Builder::new()
                .name(format!("framesink-{}", connection.session()))
                .spawn(move || {
                    if let Some(id) = worker_core {
                        if !core_affinity::set_for_current(core_affinity::CoreId { id }) {
                            warn!(core = id, "failed to pin hand-off worker");
                        }
                    }
                    run(&shared, rx, &in_flight, &discard);
                })
                .map_err(Error::WorkerSpawn)?
        };

        info!(%connection, capacity, "hand-off worker started");

        Ok(Self {
            tx,
            in_flight,
            discard,
            capacity: capacity.max(1),
            worker: Some(worker),
        })
    }

    /// Queue a frame, handing it back if `capacity` frames are already in
    /// flight or the worker has exited.
    pub(crate) fn try_enqueue_frame(&self, frame: FrameBuffer) -> std::result::Result<(), FrameBuffer> {
        if self.in_flight.fetch_add(1, Ordering::AcqRel) >= self.capacity {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            return Err(frame);
        }

        match self.tx.send(Event::Frame(frame)) {
            Ok(()) => Ok(()),
            Err(flume::SendError(event)) => {
                self.in_flight.fetch_sub(1, Ordering::AcqRel);
                warn!("hand-off worker gone, frame refused");
                match event {
                    Event::Frame(frame) => Err(frame),
                    Event::Drop(_) | Event::Shutdown => Ok(()),
                }
            }
        }
    }

    pub(crate) fn enqueue_drop(&self, record: DropRecord) {
        if self.tx.send(Event::Drop(record)).is_err() {
            warn!("hand-off worker gone, drop notification lost");
        }
    }

    /// Stop the worker and wait for it. Every queued frame is either
    /// delivered (`Drain`) or released without delivery (`Discard`) before
    /// this returns.
    pub(crate) fn shutdown(&mut self, mode: TeardownMode) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        if mode == TeardownMode::Discard {
            self.discard.store(true, Ordering::Release);
        }
        let _ = self.tx.send(Event::Shutdown);

        if worker.join().is_err() {
            warn!("hand-off worker panicked");
        }
        debug!(?mode, "hand-off worker stopped");
    }
}

impl Drop for HandOff {
    fn drop(&mut self) {
        self.shutdown(TeardownMode::Discard);
    }
}

fn run(shared: &Shared, rx: Receiver<Event>, in_flight: &AtomicUsize, discard: &AtomicBool) {
    for event in rx.iter() {
        match event {
            Event::Frame(frame) => {
                if discard.load(Ordering::Acquire) {
                    shared.discard_frame(frame);
                } else {
                    shared.deliver_frame(frame);
                }
                in_flight.fetch_sub(1, Ordering::AcqRel);
            }
            Event::Drop(record) => {
                if !discard.load(Ordering::Acquire) {
                    shared.deliver_drop(record);
                }
            }
            Event::Shutdown => break,
        }
    }

    // Nothing is sent after Shutdown, but never leave a frame behind.
    for event in rx.try_iter() {
        if let Event::Frame(frame) = event {
            shared.discard_frame(frame);
            in_flight.fetch_sub(1, Ordering::AcqRel);
        }
    }
}
