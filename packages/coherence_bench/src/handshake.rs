//! The two-phase busy-wait handshake between the orchestrating thread and the workers.
//!
//! For each worker there is one command cell:
//!
//! 1. The orchestrator clears the acknowledgment, then publishes a command (release).
//! 2. The worker observes the command (acquire), executes it, clears the command and then
//!    publishes its acknowledgment (release).
//! 3. The orchestrator observes the acknowledgment (acquire). Only then may it publish the next
//!    command for that worker.
//!
//! Everything the worker wrote while executing is visible to the orchestrator once it has seen
//! the acknowledgment, and everything the orchestrator wrote before publishing a command is
//! visible to the worker executing it.
//!
//! Nothing here blocks in the operating system. Waking a sleeping thread takes far longer than
//! the operations being measured.

use std::hint;
use std::ops::Range;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

/// No command pending.
pub(crate) const NO_COMMAND: u8 = 0;

const ACK_PENDING: u8 = 0;
const ACK_DONE: u8 = 1;
const ACK_FAILED: u8 = 2;

/// How many spins pass between two looks at the clock when a wait is bounded.
const SPINS_PER_CLOCK_CHECK: u32 = 1024;

/// How a worker finished a command.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Ack {
    Done,
    Failed,
}

// Each cell sits on its own pair of cache lines, so polling one worker never disturbs the lines
// of another (adjacent line prefetchers fetch lines in pairs).
#[derive(Debug, Default)]
#[repr(align(128))]
struct CommandCell {
    command: AtomicU8,
    ack: AtomicU8,
}

#[derive(Debug)]
pub(crate) struct PhaseBarrier {
    cells: Box<[CommandCell]>,
}

impl PhaseBarrier {
    pub(crate) fn new(worker_count: usize) -> Self {
        Self {
            cells: (0..worker_count).map(|_| CommandCell::default()).collect(),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.cells.len()
    }

    fn cell(&self, worker: usize) -> &CommandCell {
        self.cells
            .get(worker)
            .expect("worker indexes are always below the worker count")
    }

    /// Publishes a command for one worker.
    ///
    /// The previous command of that worker must have been acknowledged.
    pub(crate) fn issue(&self, worker: usize, command: u8) {
        debug_assert_ne!(command, NO_COMMAND);

        let cell = self.cell(worker);

        debug_assert_eq!(
            cell.command.load(Ordering::Relaxed),
            NO_COMMAND,
            "worker {worker} has not consumed its previous command"
        );

        cell.ack.store(ACK_PENDING, Ordering::Relaxed);
        cell.command.store(command, Ordering::Release);
    }

    /// Publishes the same command for a range of workers.
    pub(crate) fn issue_all(&self, workers: Range<usize>, command: u8) {
        for worker in workers {
            self.issue(worker, command);
        }
    }

    /// Waits for one worker to acknowledge its command.
    ///
    /// Returns `None` if `timeout` passes first.
    #[cfg_attr(test, mutants::skip)] // Mutations can turn this into an endless spin.
    pub(crate) fn wait(&self, worker: usize, timeout: Option<Duration>) -> Option<Ack> {
        let cell = self.cell(worker);
        let started = timeout.map(|timeout| (Instant::now(), timeout));
        let mut spins = 0_u32;

        loop {
            match cell.ack.load(Ordering::Acquire) {
                ACK_DONE => return Some(Ack::Done),
                ACK_FAILED => return Some(Ack::Failed),
                _ => {}
            }

            spins = spins.wrapping_add(1);

            if spins % SPINS_PER_CLOCK_CHECK == 0
                && let Some((started, timeout)) = started
                && started.elapsed() >= timeout
            {
                return None;
            }

            hint::spin_loop();
        }
    }

    /// Waits until every worker in the range has acknowledged its command.
    ///
    /// Returns the workers that reported failure.
    pub(crate) fn wait_all(&self, workers: Range<usize>) -> Vec<usize> {
        workers
            .filter(|&worker| self.wait(worker, None) == Some(Ack::Failed))
            .collect()
    }

    /// Issues a command to one worker and waits for its acknowledgment.
    pub(crate) fn issue_and_wait(
        &self,
        worker: usize,
        command: u8,
        timeout: Option<Duration>,
    ) -> Option<Ack> {
        self.issue(worker, command);
        self.wait(worker, timeout)
    }

    /// Waits for the next command addressed to `worker`. Called on the worker's own thread.
    #[cfg_attr(test, mutants::skip)] // Mutations can turn this into an endless spin.
    pub(crate) fn next_command(&self, worker: usize) -> u8 {
        let cell = self.cell(worker);

        loop {
            let command = cell.command.load(Ordering::Acquire);

            if command != NO_COMMAND {
                return command;
            }

            hint::spin_loop();
        }
    }

    /// Marks the current command of `worker` as finished. Called on the worker's own thread.
    pub(crate) fn complete(&self, worker: usize, ack: Ack) {
        let cell = self.cell(worker);

        cell.command.store(NO_COMMAND, Ordering::Relaxed);
        cell.ack.store(
            match ack {
                Ack::Done => ACK_DONE,
                Ack::Failed => ACK_FAILED,
            },
            Ordering::Release,
        );
    }

    /// Whether the worker's acknowledgment is currently cleared. For use by the worker while it
    /// executes a command, where the answer is always yes.
    #[cfg(test)]
    fn ack_is_cleared(&self, worker: usize) -> bool {
        self.cell(worker).ack.load(Ordering::Acquire) == ACK_PENDING
    }
}
