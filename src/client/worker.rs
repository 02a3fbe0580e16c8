//! Background threads driving the lanes and the correlator.
//!
//! One worker per lane pulls groups from its buffer into a [`Batcher`] and
//! hands ready batches to the shared [`Dispatcher`]. The worker waits on the
//! lane with the batch deadline as timeout, so a partial batch is emitted on
//! time even when the lane goes quiet. A lane worker exits once its buffer
//! has been closed and drained, reporting on `done_tx`.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, tick};

use crate::batcher::Batcher;
use crate::classifier::Lane;
use crate::config::ClientConfig;
use crate::correlator::Correlator;
use crate::dispatcher::Dispatcher;
use crate::lanes::LaneBuffers;
use crate::log_record::LogGroup;

pub(crate) fn spawn_lane_worker(
    lane: Lane,
    rx: Receiver<LogGroup>,
    dispatcher: Arc<Dispatcher>,
    config: &ClientConfig,
    done_tx: Sender<Lane>,
) -> JoinHandle<()> {
    let batcher = Batcher::new(
        lane,
        config.target_message_batch_size,
        config.send_batch_logs_interval,
    );
    thread::spawn(move || {
        lane_loop(batcher, &rx, &dispatcher);
        let _ = done_tx.send(lane);
    })
}

fn lane_loop(mut batcher: Batcher, rx: &Receiver<LogGroup>, dispatcher: &Dispatcher) {
    loop {
        if dispatcher.is_abandoned() {
            let pending = batcher.flush().map(|batch| batch.groups).unwrap_or_default();
            dispatcher.discard(pending.into_iter().chain(rx.try_iter()));
            return;
        }
        let received = match batcher.deadline() {
            Some(deadline) => rx.recv_deadline(deadline),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let ready = match received {
            Ok(group) => batcher.push(group, Instant::now()),
            Err(RecvTimeoutError::Timeout) => batcher.poll(Instant::now()),
            Err(RecvTimeoutError::Disconnected) => {
                if let Some(batch) = batcher.flush() {
                    dispatcher.dispatch(batch);
                }
                return;
            }
        };
        if let Some(batch) = ready {
            dispatcher.dispatch(batch);
        }
    }
}

/// Periodically flush correlation groups that went idle.
pub(crate) fn spawn_sweeper(
    correlator: Arc<Correlator>,
    lanes: Arc<LaneBuffers>,
    interval: Duration,
    shutdown_rx: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let ticker = tick(interval);
        loop {
            select! {
                recv(ticker) -> at => {
                    let now = at.unwrap_or_else(|_| Instant::now());
                    for group in correlator.sweep(now) {
                        // Rejections are counted by the lane buffers.
                        let _ = lanes.submit(group);
                    }
                }
                recv(shutdown_rx) -> _ => break,
            }
        }
    })
}
