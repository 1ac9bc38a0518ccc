//! Single-flight FIFO queue of requests awaiting a gateway's replies.

use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// A request waiting to go on the wire, together with everything needed to
/// settle it once the matching reply arrives.
#[derive(Debug)]
pub(crate) struct PendingRequest<O, C> {
    pub opcode: O,
    pub bytes: Vec<u8>,
    /// Budget once the request is on the wire.
    pub timeout: Duration,
    /// Request-specific state, including the reply channel.
    pub ctx: C,
}

/// FIFO queue with at most one request in flight.
///
/// The head is sent and then the queue waits: replies are correlated to the
/// head by opcode, anything else arriving on the socket is ignored. The next
/// entry is sent only once the head settled (reply, timeout or caller gone).
#[derive(Debug)]
pub(crate) struct RequestQueue<O, C> {
    pending: VecDeque<PendingRequest<O, C>>,
    /// Deadline of the in-flight head.
    in_flight: Option<Instant>,
}

impl<O: Copy + PartialEq, C> RequestQueue<O, C> {
    pub(crate) fn new() -> Self {
        RequestQueue {
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn push(&mut self, request: PendingRequest<O, C>) {
        self.pending.push_back(request);
    }

    /// The bytes of the head if it still needs to go on the wire.
    ///
    /// Marks the head in flight and starts its budget; while a request is in
    /// flight this returns `None`.
    pub(crate) fn start_send(&mut self) -> Option<&[u8]> {
        if self.in_flight.is_some() || self.pending.is_empty() {
            return None;
        }
        self.in_flight = Some(Instant::now() + self.pending[0].timeout);
        Some(&self.pending[0].bytes)
    }

    pub(crate) fn head_opcode(&self) -> Option<O> {
        self.pending.front().map(|r| r.opcode)
    }

    /// Deadline of the in-flight request, if any.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.in_flight
    }

    /// The head settled: hand it to the caller and free the flight slot.
    pub(crate) fn pop_head(&mut self) -> Option<PendingRequest<O, C>> {
        self.in_flight = None;
        self.pending.pop_front()
    }

    /// Remove every entry whose context the caller no longer waits on.
    ///
    /// If the head is removed while in flight the slot is freed, so the next
    /// entry goes out immediately.
    pub(crate) fn remove_where(
        &mut self,
        mut dead: impl FnMut(&C) -> bool,
    ) -> Vec<PendingRequest<O, C>> {
        let mut removed = Vec::new();
        let mut idx = 0;
        while idx < self.pending.len() {
            if dead(&self.pending[idx].ctx) {
                if idx == 0 {
                    self.in_flight = None;
                }
                removed.push(self.pending.remove(idx).expect("index is in bounds"));
            } else {
                idx += 1;
            }
        }
        removed
    }

    /// Empty the queue, returning every entry for rejection.
    pub(crate) fn drain_all(&mut self) -> Vec<PendingRequest<O, C>> {
        self.in_flight = None;
        self.pending.drain(..).collect()
    }

    pub(crate) fn iter_ctx(&self) -> impl Iterator<Item = &C> {
        self.pending.iter().map(|r| &r.ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(opcode: u8, ctx: u32) -> PendingRequest<u8, u32> {
        PendingRequest {
            opcode,
            bytes: vec![opcode],
            timeout: Duration::from_secs(1),
            ctx,
        }
    }

    #[test]
    fn sends_in_fifo_order_one_at_a_time() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, 1));
        queue.push(request(2, 2));

        assert_eq!(queue.start_send(), Some(&[1u8][..]));
        // single flight: nothing else goes out until the head settles
        assert_eq!(queue.start_send(), None);
        assert_eq!(queue.head_opcode(), Some(1));

        let head = queue.pop_head().unwrap();
        assert_eq!(head.ctx, 1);
        assert_eq!(queue.start_send(), Some(&[2u8][..]));
    }

    #[test]
    fn deadline_follows_the_in_flight_head() {
        let mut queue = RequestQueue::new();
        assert!(queue.deadline().is_none());
        queue.push(request(1, 1));
        assert!(queue.deadline().is_none());
        queue.start_send();
        assert!(queue.deadline().is_some());
        queue.pop_head();
        assert!(queue.deadline().is_none());
    }

    #[test]
    fn remove_where_frees_the_flight_slot() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, 1));
        queue.push(request(2, 2));
        queue.push(request(3, 1));
        queue.start_send();

        let removed = queue.remove_where(|ctx| *ctx == 1);
        assert_eq!(removed.len(), 2);
        assert!(queue.deadline().is_none());
        // entry 2 is the new head and can be sent
        assert_eq!(queue.start_send(), Some(&[2u8][..]));
    }

    #[test]
    fn drain_all_empties_the_queue() {
        let mut queue = RequestQueue::new();
        queue.push(request(1, 1));
        queue.push(request(2, 2));
        queue.start_send();
        assert_eq!(queue.drain_all().len(), 2);
        assert!(queue.is_empty());
        assert!(queue.deadline().is_none());
    }
}
