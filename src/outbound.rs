use crate::frame::{create_close_message, frame_header, OpCode};
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

#[derive(Default)]
struct Pending {
    chunks: VecDeque<Vec<u8>>,
    bytes: usize,
    close_sent: bool,
}

/// Outbound side of one session: the read task, the decoder's control-frame
/// replies and the broker-facing writer all enqueue here, and a single write
/// task drains it to the socket. The mutex is only ever held for queue
/// manipulation, never across a socket write.
#[derive(Default)]
pub struct OutboundQueue {
    pending: Mutex<Pending>,
    wakeup: Notify,
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues raw bytes. Dropped once a Close frame was enqueued, nothing
    /// may follow it on the wire.
    pub fn enqueue(&self, bytes: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap();
        if pending.close_sent {
            return;
        }
        push_chunk(&mut pending, bytes);
        drop(pending);
        self.wakeup.notify_one();
    }

    /// Enqueues a frame header together with its payload so no concurrent
    /// enqueue can interleave between the two.
    pub fn enqueue_frame(&self, header: Vec<u8>, payload: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap();
        if pending.close_sent {
            return;
        }
        push_chunk(&mut pending, header);
        if !payload.is_empty() {
            push_chunk(&mut pending, payload);
        }
        drop(pending);
        self.wakeup.notify_one();
    }

    /// Enqueues a control frame, taking the lock internally. Control frames
    /// are never compressed.
    pub fn enqueue_control(&self, opcode: OpCode, payload: Vec<u8>) {
        let mut pending = self.pending.lock().unwrap();
        enqueue_control_locked(&mut pending, opcode, payload);
        drop(pending);
        self.wakeup.notify_one();
    }

    /// Enqueues a Close frame built from a status and body. Once a Close has
    /// been enqueued any further Close is ignored, so the generic teardown
    /// path cannot duplicate one already sent by the protocol layer.
    pub fn enqueue_close(&self, status: u16, body: &[u8]) {
        self.enqueue_control(OpCode::Close, create_close_message(status, body));
    }

    /// Whether a Close frame has been handed to the write side.
    pub fn close_sent(&self) -> bool {
        self.pending.lock().unwrap().close_sent
    }

    /// Drains the queue into a single buffer, or `None` when it is empty.
    pub fn collapse(&self) -> Option<Vec<u8>> {
        let mut pending = self.pending.lock().unwrap();
        if pending.chunks.is_empty() {
            return None;
        }
        let mut collapsed = Vec::with_capacity(pending.bytes);
        for chunk in pending.chunks.drain(..) {
            collapsed.extend_from_slice(&chunk);
        }
        pending.bytes = 0;
        Some(collapsed)
    }

    /// Marks the session as closing without emitting a frame, used by the
    /// read task on transport failure so the write task drains and exits.
    pub(crate) fn mark_closed(&self) {
        self.pending.lock().unwrap().close_sent = true;
        self.wakeup.notify_one();
    }

    pub(crate) async fn wait_for_data(&self) {
        self.wakeup.notified().await;
    }
}

fn push_chunk(pending: &mut Pending, bytes: Vec<u8>) {
    pending.bytes += bytes.len();
    pending.chunks.push_back(bytes);
}

// Precondition: the caller holds the queue lock.
fn enqueue_control_locked(pending: &mut Pending, opcode: OpCode, payload: Vec<u8>) {
    if pending.close_sent {
        return;
    }
    push_chunk(pending, frame_header(false, opcode, payload.len()));
    if !payload.is_empty() {
        push_chunk(pending, payload);
    }
    if opcode == OpCode::Close {
        pending.close_sent = true;
    }
}
