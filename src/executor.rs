//! Concurrent request executor
//!
//! Multiplexes up to `max_concurrent_jobs` in-flight requests over one TCP
//! stream. Each job slot owns a stable `pdu_reference` (its 1-based index);
//! a caller acquires a free slot (FIFO), the executor patches the reference
//! into the outbound frame, serializes the send through a write lock, and a
//! single dedicated reader task routes each incoming frame to the slot it
//! correlates with.
//!
//! Timeouts and user cancellation abandon the slot: it stays out of
//! rotation until its late response arrives (and is silently discarded) or
//! the session is torn down. A fatal read error (socket closed, framing
//! violation, unknown reference) completes every outstanding job with
//! [`S7Error::SessionClosed`] and marks the executor unusable.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::constants::PDU_REFERENCE_OFFSET;
use crate::error::{S7Error, S7Result};
use crate::pool::{BufferPool, PooledBuffer};

/// A response frame checked out of the pool; derefs to the frame bytes.
pub struct Response {
    buffer: PooledBuffer,
    len: usize,
}

impl std::ops::Deref for Response {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buffer[..self.len]
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response").field("len", &self.len).finish()
    }
}

/// Counters accumulated over the lifetime of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Frames successfully written to the PLC.
    pub requests_sent: u64,
    /// Frames routed to a waiting job.
    pub responses_received: u64,
    /// Jobs that hit their deadline.
    pub timeouts: u64,
    /// Fatal protocol violations observed by the reader.
    pub protocol_errors: u64,
}

enum SlotState {
    Idle,
    AwaitingResponse(oneshot::Sender<Response>),
    /// The waiter gave up (timeout or cancel) while the request was on the
    /// wire; the late response is discarded and only then is the slot
    /// recycled.
    Abandoned,
}

struct Slot {
    state: SlotState,
    /// Bumped whenever the slot is recycled, so a stale waiter cannot
    /// abandon a slot that has already moved on to another job.
    generation: u64,
}

struct SlotTable {
    slots: Vec<Slot>,
    free: Vec<usize>,
}

struct Shared {
    table: Mutex<SlotTable>,
    /// FIFO gate over free slots; closed on teardown.
    free_slots: Semaphore,
    closed: AtomicBool,
    requests_sent: AtomicU64,
    responses_received: AtomicU64,
    timeouts: AtomicU64,
    protocol_errors: AtomicU64,
}

impl Shared {
    /// Recycle a slot back into rotation. Caller must not hold the table
    /// lock.
    fn release_slot(&self, index: usize) {
        let mut table = self.table.lock().expect("slot table lock poisoned");
        let slot = &mut table.slots[index];
        slot.state = SlotState::Idle;
        slot.generation = slot.generation.wrapping_add(1);
        table.free.push(index);
        drop(table);
        self.free_slots.add_permits(1);
    }

    /// Mark a slot abandoned if it still belongs to the given job
    /// generation. A slot the reader already recycled is left untouched.
    fn abandon_slot(&self, index: usize, generation: u64) {
        let mut table = self.table.lock().expect("slot table lock poisoned");
        let slot = &mut table.slots[index];
        if slot.generation == generation
            && matches!(slot.state, SlotState::AwaitingResponse(_))
        {
            slot.state = SlotState::Abandoned;
        }
    }

    /// Tear the executor down: fail every outstanding job with
    /// `SessionClosed` (their oneshot senders are dropped) and wake all
    /// waiters on the slot gate and the pool.
    fn teardown(&self, pool: &BufferPool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.free_slots.close();
        pool.close();
        let mut table = self.table.lock().expect("slot table lock poisoned");
        for slot in &mut table.slots {
            slot.generation = slot.generation.wrapping_add(1);
            // Dropping the sender completes the waiter with SessionClosed.
            let _ = mem::replace(&mut slot.state, SlotState::Idle);
        }
    }
}

/// Executor multiplexing concurrent jobs over one TCP stream.
pub struct RequestExecutor {
    shared: Arc<Shared>,
    writer: AsyncMutex<OwnedWriteHalf>,
    pool: BufferPool,
    shutdown: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    max_concurrent_jobs: usize,
}

impl RequestExecutor {
    /// Spawn the reader task and return an executor with
    /// `max_concurrent_jobs` slots over the given stream halves.
    pub fn start(
        read_half: OwnedReadHalf,
        write_half: OwnedWriteHalf,
        pool: BufferPool,
        max_concurrent_jobs: usize,
    ) -> Self {
        let shared = Arc::new(Shared {
            table: Mutex::new(SlotTable {
                slots: (0..max_concurrent_jobs)
                    .map(|_| Slot {
                        state: SlotState::Idle,
                        generation: 0,
                    })
                    .collect(),
                free: (0..max_concurrent_jobs).rev().collect(),
            }),
            free_slots: Semaphore::new(max_concurrent_jobs),
            closed: AtomicBool::new(false),
            requests_sent: AtomicU64::new(0),
            responses_received: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        });
        let shutdown = CancellationToken::new();
        let reader = tokio::spawn(reader_loop(
            read_half,
            Arc::clone(&shared),
            pool.clone(),
            shutdown.clone(),
        ));
        Self {
            shared,
            writer: AsyncMutex::new(write_half),
            pool,
            shutdown,
            reader: Mutex::new(Some(reader)),
            max_concurrent_jobs,
        }
    }

    /// Number of job slots.
    pub fn max_concurrent_jobs(&self) -> usize {
        self.max_concurrent_jobs
    }

    /// Lifetime counters.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            requests_sent: self.shared.requests_sent.load(Ordering::Relaxed),
            responses_received: self.shared.responses_received.load(Ordering::Relaxed),
            timeouts: self.shared.timeouts.load(Ordering::Relaxed),
            protocol_errors: self.shared.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Whether the executor has been torn down.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Send one framed request and await its matching response.
    ///
    /// `request[..len]` must be a complete framed PDU with the
    /// `pdu_reference` slot zeroed; the executor fills the reference in.
    /// The deadline spans the whole call, including slot acquisition.
    /// Cancelling `cancel` wins over a simultaneously elapsed deadline.
    pub async fn perform(
        &self,
        mut request: PooledBuffer,
        len: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> S7Result<Response> {
        if len < PDU_REFERENCE_OFFSET + 2 {
            return Err(S7Error::spec_violation(format!(
                "request of {len} bytes has no pdu_reference slot"
            )));
        }
        if self.is_closed() {
            return Err(S7Error::SessionClosed);
        }
        let timeout_ms = timeout.as_millis() as u64;
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        // Free slots are granted first-come-first-served.
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(S7Error::Canceled),
            _ = &mut deadline => {
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(S7Error::Timeout { timeout_ms });
            }
            permit = self.shared.free_slots.acquire() => {
                permit.map_err(|_| S7Error::SessionClosed)?.forget();
            }
        }

        let (index, generation, rx) = {
            let mut table = self.shared.table.lock().expect("slot table lock poisoned");
            let index = table.free.pop().expect("slot permit held but free list empty");
            let (tx, rx) = oneshot::channel();
            let slot = &mut table.slots[index];
            slot.state = SlotState::AwaitingResponse(tx);
            (index, slot.generation, rx)
        };
        // Teardown may have raced between the permit grant and the slot
        // registration; a registered sender would never be completed then.
        if self.is_closed() {
            self.shared.release_slot(index);
            return Err(S7Error::SessionClosed);
        }
        let reference = (index + 1) as u16;
        codec::patch_pdu_reference(&mut request, reference);
        trace!(reference, len, "job slot acquired");

        // One writer at a time keeps frame boundaries intact. Cancellation
        // before the write starts releases the slot immediately; once the
        // frame goes out it can only be abandoned.
        {
            let mut writer = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.shared.release_slot(index);
                    return Err(S7Error::Canceled);
                }
                _ = &mut deadline => {
                    self.shared.release_slot(index);
                    self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                    return Err(S7Error::Timeout { timeout_ms });
                }
                writer = self.writer.lock() => writer,
            };
            if let Err(e) = writer.write_all(&request[..len]).await {
                drop(writer);
                warn!(error = %e, "write failed, tearing down session");
                self.shared.teardown(&self.pool);
                return Err(e.into());
            }
        }
        // The request buffer is free for reuse as soon as the write is done.
        drop(request);
        self.shared.requests_sent.fetch_add(1, Ordering::Relaxed);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.shared.abandon_slot(index, generation);
                Err(S7Error::Canceled)
            }
            _ = &mut deadline => {
                self.shared.abandon_slot(index, generation);
                self.shared.timeouts.fetch_add(1, Ordering::Relaxed);
                Err(S7Error::Timeout { timeout_ms })
            }
            response = rx => response.map_err(|_| S7Error::SessionClosed),
        }
    }

    /// Tear down the executor: fail outstanding jobs, stop the reader and
    /// shut the write half down.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.shared.teardown(&self.pool);
        let handle = self.reader.lock().expect("reader handle lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
        debug!("executor closed");
    }
}

impl Drop for RequestExecutor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.shared.teardown(&self.pool);
    }
}

impl std::fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("max_concurrent_jobs", &self.max_concurrent_jobs)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Dedicated reader: one TPKT frame at a time, routed by `pdu_reference`.
async fn reader_loop(
    mut read_half: OwnedReadHalf,
    shared: Arc<Shared>,
    pool: BufferPool,
    shutdown: CancellationToken,
) {
    let slot_count = shared
        .table
        .lock()
        .expect("slot table lock poisoned")
        .slots
        .len();
    loop {
        let mut buffer = tokio::select! {
            _ = shutdown.cancelled() => break,
            acquired = pool.acquire() => match acquired {
                Ok(buffer) => buffer,
                Err(_) => break,
            },
        };
        let len = tokio::select! {
            _ = shutdown.cancelled() => break,
            read = codec::read_frame(&mut read_half, &mut buffer) => match read {
                Ok(len) => len,
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        warn!(error = %e, "fatal read error, tearing down session");
                        if e.is_fatal() {
                            shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    shared.teardown(&pool);
                    break;
                }
            },
        };
        if len < PDU_REFERENCE_OFFSET + 2 {
            warn!(len, "frame too short for an S7 header, tearing down session");
            shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
            shared.teardown(&pool);
            break;
        }
        let reference = codec::pdu_reference(&buffer[..len]);
        trace!(reference, len, "frame received");

        let index = match (reference as usize).checked_sub(1) {
            Some(index) if index < slot_count => index,
            _ => {
                warn!(reference, "response with unknown pdu_reference, tearing down session");
                shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
                shared.teardown(&pool);
                break;
            }
        };

        let taken = {
            let mut table = shared.table.lock().expect("slot table lock poisoned");
            let slot = &mut table.slots[index];
            mem::replace(&mut slot.state, SlotState::Idle)
        };
        match taken {
            SlotState::AwaitingResponse(tx) => {
                shared.release_slot(index);
                shared.responses_received.fetch_add(1, Ordering::Relaxed);
                // A waiter that raced into cancellation just drops the
                // buffer back into the pool.
                let _ = tx.send(Response { buffer, len });
            }
            SlotState::Abandoned => {
                shared.release_slot(index);
                warn!(reference, "discarding late response for abandoned job");
            }
            SlotState::Idle => {
                warn!(reference, "response for idle slot, tearing down session");
                shared.protocol_errors.fetch_add(1, Ordering::Relaxed);
                shared.teardown(&pool);
                break;
            }
        }
    }
    debug!("reader task stopped");
}
