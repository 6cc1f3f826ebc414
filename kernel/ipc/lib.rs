// Copyright 2026 The Ember Authors.
//
// Use of this source code is governed by a BSD 3-clause
// license that can be found in the LICENSE file.

//! Implements inter-process communication over first-class
//! endpoints.
//!
//! An endpoint is a kernel object with a bounded ring of
//! fixed-size [`Message`]s and two wait queues, one for senders
//! and one for receivers. Within one endpoint, messages are
//! received in the order they were sent; across endpoints there
//! is no ordering. The [`PRIORITY`](MessageFlags::PRIORITY) flag
//! is preserved for schedulers downstream but does not reorder
//! delivery here.
//!
//! The [`EndpointRegistry`] is a pure state machine: it queues
//! and dequeues messages and records which threads are waiting,
//! but never blocks. Each operation that changes a queue reports
//! the single waiter (if any) that the caller should wake: the
//! kernel context owns thread states and deadlines, and parks
//! callers on the wait queues when their timeout allows it. A
//! destroyed endpoint hands every parked waiter back so they can
//! be woken with [`Denied`](Error::Denied).
//!
//! The wait queues only ever contain live waiters: when a
//! blocked thread's deadline expires, the kernel context removes
//! it with [`cancel_wait`](EndpointRegistry::cancel_wait) before
//! making it runnable again.

#![no_std]
#![deny(clippy::float_arithmetic)]
#![deny(clippy::return_self_not_must_use)]
#![deny(clippy::single_char_lifetime_names)]
#![deny(clippy::wildcard_imports)]
#![deny(unused_crate_dependencies)]
#![forbid(unsafe_code)]

extern crate alloc;

use alloc::collections::btree_map::BTreeMap;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use syscalls::{EndpointId, Error, ProcessId, ThreadId};

/// The number of payload bytes a message carries.
///
pub const MAX_PAYLOAD: usize = 120;

/// The number of message slots in an endpoint's ring.
///
pub const QUEUE_SLOTS: usize = 256;

bitflags! {
    /// The delivery flags of a message.
    ///
    pub struct MessageFlags: u32 {
        /// The sender wants confirmation of delivery and is
        /// willing to wait for queue space.
        const SYNC = 1 << 0;

        /// The message is fire-and-forget: when the queue
        /// is full it is dropped rather than waited for.
        const ASYNC = 1 << 1;

        /// The payload describes shared memory rather than
        /// carrying the data itself.
        const ZERO_COPY = 1 << 2;

        /// The message asks for priority treatment from
        /// whatever consumes it. Delivery order within the
        /// endpoint is unaffected.
        const PRIORITY = 1 << 3;
    }
}

/// A fixed-size message passed through an endpoint.
///
#[derive(Clone, Copy)]
pub struct Message {
    /// The sender's correlation id for this message.
    pub msg_id: u64,

    /// The sending process. Stamped by the endpoint on
    /// delivery; senders cannot forge it.
    pub sender: ProcessId,

    /// The number of payload bytes in use.
    pub size: u32,

    /// The delivery flags.
    pub flags: MessageFlags,

    /// The payload bytes. Only the first `size` bytes are
    /// meaningful.
    pub payload: [u8; MAX_PAYLOAD],
}

impl Message {
    /// Returns a message carrying the given payload.
    ///
    /// Fails with [`Error::Invalid`] if the payload exceeds
    /// [`MAX_PAYLOAD`] bytes.
    ///
    pub fn new(msg_id: u64, flags: MessageFlags, payload: &[u8]) -> Result<Self, Error> {
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::Invalid);
        }

        let mut buf = [0u8; MAX_PAYLOAD];
        buf[..payload.len()].copy_from_slice(payload);

        Ok(Message {
            msg_id,
            sender: ProcessId::new(0),
            size: payload.len() as u32,
            flags,
            payload: buf,
        })
    }

    /// Returns the in-use portion of the payload.
    ///
    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.size as usize]
    }

    const fn empty() -> Self {
        Message {
            msg_id: 0,
            sender: ProcessId::new(0),
            size: 0,
            flags: MessageFlags::empty(),
            payload: [0u8; MAX_PAYLOAD],
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Message")
            .field("msg_id", &self.msg_id)
            .field("sender", &self.sender)
            .field("size", &self.size)
            .field("flags", &self.flags)
            .finish()
    }
}

/// Which side of an endpoint a thread was waiting on.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WaitRole {
    /// The thread was waiting for queue space to send.
    Sender,

    /// The thread was waiting for a message to arrive.
    Receiver,
}

/// A snapshot of one endpoint's counters.
///
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EndpointStats {
    /// The number of messages currently queued.
    pub queued: usize,

    /// The number of messages accepted into the queue.
    pub sent: u64,

    /// The number of messages dequeued by receivers.
    pub received: u64,

    /// The number of async messages dropped because the
    /// queue was full. Monotonic.
    pub dropped: u64,
}

// A single endpoint: the message ring and its wait queues.
//
struct Endpoint {
    owner: ProcessId,
    ring: Vec<Message>,
    head: usize,
    tail: usize,
    count: usize,
    send_waiters: VecDeque<ThreadId>,
    recv_waiters: VecDeque<ThreadId>,
    sent: u64,
    received: u64,
    dropped: u64,
}

impl Endpoint {
    fn new(owner: ProcessId) -> Self {
        Endpoint {
            owner,
            ring: vec![Message::empty(); QUEUE_SLOTS],
            head: 0,
            tail: 0,
            count: 0,
            send_waiters: VecDeque::new(),
            recv_waiters: VecDeque::new(),
            sent: 0,
            received: 0,
            dropped: 0,
        }
    }

    fn is_full(&self) -> bool {
        self.count == QUEUE_SLOTS
    }

    fn is_empty(&self) -> bool {
        self.count == 0
    }

    // Slot lifecycle: a free slot at the tail becomes
    // written and the tail advances; reading at the head
    // advances the head and frees the slot again.

    fn push(&mut self, msg: Message) {
        debug_assert!(!self.is_full());
        self.ring[self.tail] = msg;
        self.tail = (self.tail + 1) % QUEUE_SLOTS;
        self.count += 1;
        self.sent += 1;
    }

    fn pop(&mut self) -> Message {
        debug_assert!(!self.is_empty());
        let msg = self.ring[self.head];
        self.head = (self.head + 1) % QUEUE_SLOTS;
        self.count -= 1;
        self.received += 1;

        msg
    }
}

/// The registry of live endpoints.
///
pub struct EndpointRegistry {
    endpoints: BTreeMap<EndpointId, Endpoint>,
    next_id: u64,
}

impl EndpointRegistry {
    /// Returns an empty registry.
    ///
    pub fn new() -> Self {
        EndpointRegistry {
            endpoints: BTreeMap::new(),
            next_id: 1,
        }
    }

    /// Creates a new endpoint owned by `owner`, returning
    /// its id. Ids are assigned monotonically and never
    /// reused.
    ///
    pub fn create(&mut self, owner: ProcessId) -> EndpointId {
        let id = EndpointId::new(self.next_id);
        self.next_id += 1;
        self.endpoints.insert(id, Endpoint::new(owner));

        id
    }

    /// Returns the owner of the given endpoint.
    ///
    pub fn owner(&self, id: EndpointId) -> Result<ProcessId, Error> {
        Ok(self.endpoints.get(&id).ok_or(Error::NotFound)?.owner)
    }

    /// Destroys an endpoint, freeing its ring.
    ///
    /// Every thread parked on either wait queue is returned
    /// so the caller can wake it with
    /// [`Denied`](Error::Denied). The endpoint's id is never
    /// reused; subsequent operations on it fail with
    /// [`NotFound`](Error::NotFound).
    ///
    pub fn destroy(&mut self, id: EndpointId) -> Result<Vec<ThreadId>, Error> {
        let mut endpoint = self.endpoints.remove(&id).ok_or(Error::NotFound)?;

        let mut waiters = Vec::new();
        waiters.extend(endpoint.send_waiters.drain(..));
        waiters.extend(endpoint.recv_waiters.drain(..));

        Ok(waiters)
    }

    /// Enqueues a message, stamping `sender` into it.
    ///
    /// On success, returns the receiver that should be woken
    /// (at most one). When the queue is full the message is
    /// not enqueued and `Busy` is returned; an
    /// [`ASYNC`](MessageFlags::ASYNC) message is counted as
    /// dropped, while a synchronous sender may park itself
    /// with [`wait_to_send`](Self::wait_to_send) and retry.
    ///
    pub fn send(
        &mut self,
        id: EndpointId,
        sender: ProcessId,
        msg: Message,
    ) -> Result<Option<ThreadId>, Error> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(Error::NotFound)?;

        if endpoint.is_full() {
            if msg.flags.contains(MessageFlags::ASYNC) {
                endpoint.dropped += 1;
            }

            return Err(Error::Busy);
        }

        let mut msg = msg;
        msg.sender = sender;
        endpoint.push(msg);

        Ok(endpoint.recv_waiters.pop_front())
    }

    /// Dequeues the oldest message.
    ///
    /// On success, returns the message and the sender that
    /// should be woken (at most one, and only when the queue
    /// just transitioned from full to non-full). When the
    /// queue is empty, `Timeout` is returned; a receiver with
    /// a nonzero timeout may park itself with
    /// [`wait_to_receive`](Self::wait_to_receive) and retry.
    ///
    pub fn receive(&mut self, id: EndpointId) -> Result<(Message, Option<ThreadId>), Error> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(Error::NotFound)?;

        if endpoint.is_empty() {
            return Err(Error::Timeout);
        }

        let was_full = endpoint.is_full();
        let msg = endpoint.pop();
        let waiter = if was_full {
            endpoint.send_waiters.pop_front()
        } else {
            None
        };

        Ok((msg, waiter))
    }

    /// Sends a reply correlated with a received message: an
    /// asynchronous send whose `msg_id` is the original
    /// message's id.
    ///
    pub fn reply(
        &mut self,
        id: EndpointId,
        sender: ProcessId,
        msg_id: u64,
        payload: &[u8],
    ) -> Result<Option<ThreadId>, Error> {
        let msg = Message::new(msg_id, MessageFlags::ASYNC, payload)?;
        self.send(id, sender, msg)
    }

    /// Parks a sending thread on the endpoint's sender wait
    /// queue.
    ///
    pub fn wait_to_send(&mut self, id: EndpointId, thread: ThreadId) -> Result<(), Error> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(Error::NotFound)?;
        endpoint.send_waiters.push_back(thread);

        Ok(())
    }

    /// Parks a receiving thread on the endpoint's receiver
    /// wait queue.
    ///
    pub fn wait_to_receive(&mut self, id: EndpointId, thread: ThreadId) -> Result<(), Error> {
        let endpoint = self.endpoints.get_mut(&id).ok_or(Error::NotFound)?;
        endpoint.recv_waiters.push_back(thread);

        Ok(())
    }

    /// Removes a thread from the endpoint's wait queues, for
    /// when its wait times out. Returns which side the
    /// thread was waiting on, if it was waiting at all.
    ///
    pub fn cancel_wait(&mut self, id: EndpointId, thread: ThreadId) -> Option<WaitRole> {
        let endpoint = self.endpoints.get_mut(&id)?;

        let was_sender = endpoint.send_waiters.contains(&thread);
        let was_receiver = endpoint.recv_waiters.contains(&thread);
        endpoint.send_waiters.retain(|tid| *tid != thread);
        endpoint.recv_waiters.retain(|tid| *tid != thread);

        if was_sender {
            Some(WaitRole::Sender)
        } else if was_receiver {
            Some(WaitRole::Receiver)
        } else {
            None
        }
    }

    /// Returns the endpoints owned by the given process.
    ///
    pub fn owned_by(&self, owner: ProcessId) -> Vec<EndpointId> {
        self.endpoints
            .iter()
            .filter(|(_, endpoint)| endpoint.owner == owner)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Returns a snapshot of the endpoint's counters.
    ///
    pub fn stats(&self, id: EndpointId) -> Result<EndpointStats, Error> {
        let endpoint = self.endpoints.get(&id).ok_or(Error::NotFound)?;

        Ok(EndpointStats {
            queued: endpoint.count,
            sent: endpoint.sent,
            received: endpoint.received,
            dropped: endpoint.dropped,
        })
    }

    /// Returns the number of live endpoints.
    ///
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Returns whether no endpoints are live.
    ///
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENDER: ProcessId = ProcessId::new(1);
    const RECEIVER: ProcessId = ProcessId::new(2);

    #[test]
    fn test_ping() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        let msg = Message::new(1, MessageFlags::SYNC, b"hi").unwrap();
        registry.send(id, SENDER, msg).unwrap();

        let (received, woken) = registry.receive(id).unwrap();
        assert_eq!(received.payload(), b"hi");
        assert_eq!(received.msg_id, 1);
        assert_eq!(received.sender, SENDER);
        assert_eq!(woken, None);
    }

    #[test]
    fn test_fifo_order() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        for n in 0..100u64 {
            let msg = Message::new(n, MessageFlags::ASYNC, &n.to_le_bytes()).unwrap();
            registry.send(id, SENDER, msg).unwrap();
        }

        for n in 0..100u64 {
            let (msg, _) = registry.receive(id).unwrap();
            assert_eq!(msg.msg_id, n);
            assert_eq!(msg.payload(), &n.to_le_bytes());
        }

        assert_eq!(registry.receive(id).unwrap_err(), Error::Timeout);
    }

    #[test]
    fn test_bounded_queue_drops_async() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        for n in 0..QUEUE_SLOTS as u64 {
            let msg = Message::new(n, MessageFlags::ASYNC, b"x").unwrap();
            registry.send(id, SENDER, msg).unwrap();
        }

        // The ring holds exactly QUEUE_SLOTS messages;
        // overflowing async sends are dropped and counted.
        for n in 0..3u64 {
            let msg = Message::new(1000 + n, MessageFlags::ASYNC, b"y").unwrap();
            assert_eq!(registry.send(id, SENDER, msg).unwrap_err(), Error::Busy);
        }

        let stats = registry.stats(id).unwrap();
        assert_eq!(stats.queued, QUEUE_SLOTS);
        assert_eq!(stats.dropped, 3);

        // Synchronous sends to a full queue are refused but
        // not counted as dropped.
        let msg = Message::new(2000, MessageFlags::SYNC, b"z").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap_err(), Error::Busy);
        assert_eq!(registry.stats(id).unwrap().dropped, 3);

        // Every queued message is still delivered in order.
        for n in 0..QUEUE_SLOTS as u64 {
            let (msg, _) = registry.receive(id).unwrap();
            assert_eq!(msg.msg_id, n);
        }
    }

    #[test]
    fn test_wake_one_receiver_per_send() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        let t1 = ThreadId::new(11);
        let t2 = ThreadId::new(12);
        registry.wait_to_receive(id, t1).unwrap();
        registry.wait_to_receive(id, t2).unwrap();

        let msg = Message::new(1, MessageFlags::SYNC, b"a").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap(), Some(t1));

        let msg = Message::new(2, MessageFlags::SYNC, b"b").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap(), Some(t2));

        let msg = Message::new(3, MessageFlags::SYNC, b"c").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap(), None);
    }

    #[test]
    fn test_wake_one_sender_on_full_transition() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        for n in 0..QUEUE_SLOTS as u64 {
            let msg = Message::new(n, MessageFlags::ASYNC, b"x").unwrap();
            registry.send(id, SENDER, msg).unwrap();
        }

        let blocked = ThreadId::new(21);
        registry.wait_to_send(id, blocked).unwrap();

        // Only the dequeue that opens space wakes a sender.
        let (_, woken) = registry.receive(id).unwrap();
        assert_eq!(woken, Some(blocked));
        let (_, woken) = registry.receive(id).unwrap();
        assert_eq!(woken, None);
    }

    #[test]
    fn test_cancelled_waiter_is_not_woken() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        let t1 = ThreadId::new(31);
        let t2 = ThreadId::new(32);
        registry.wait_to_receive(id, t1).unwrap();
        registry.wait_to_receive(id, t2).unwrap();

        // t1's wait times out before a message arrives.
        assert_eq!(registry.cancel_wait(id, t1), Some(WaitRole::Receiver));
        assert_eq!(registry.cancel_wait(id, t1), None);

        let msg = Message::new(1, MessageFlags::SYNC, b"a").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap(), Some(t2));
    }

    #[test]
    fn test_destroy_invalidates_and_returns_waiters() {
        let mut registry = EndpointRegistry::new();
        let id = registry.create(RECEIVER);

        let t1 = ThreadId::new(41);
        let t2 = ThreadId::new(42);
        registry.wait_to_receive(id, t1).unwrap();
        registry.wait_to_send(id, t2).unwrap();

        let mut waiters = registry.destroy(id).unwrap();
        waiters.sort();
        assert_eq!(waiters, [t1, t2]);

        // The id is dead.
        let msg = Message::new(1, MessageFlags::SYNC, b"a").unwrap();
        assert_eq!(registry.send(id, SENDER, msg).unwrap_err(), Error::NotFound);
        assert_eq!(registry.receive(id).unwrap_err(), Error::NotFound);
        assert_eq!(registry.stats(id).unwrap_err(), Error::NotFound);
        assert_eq!(registry.destroy(id).unwrap_err(), Error::NotFound);

        // And is never reused.
        let next = registry.create(RECEIVER);
        assert!(next.as_u64() > id.as_u64());
    }

    #[test]
    fn test_reply_correlates() {
        let mut registry = EndpointRegistry::new();
        let request_ep = registry.create(RECEIVER);
        let reply_ep = registry.create(SENDER);

        let msg = Message::new(77, MessageFlags::SYNC, b"req").unwrap();
        registry.send(request_ep, SENDER, msg).unwrap();
        let (request, _) = registry.receive(request_ep).unwrap();

        registry
            .reply(reply_ep, RECEIVER, request.msg_id, b"resp")
            .unwrap();
        let (reply, _) = registry.receive(reply_ep).unwrap();
        assert_eq!(reply.msg_id, 77);
        assert_eq!(reply.payload(), b"resp");
        assert_eq!(reply.sender, RECEIVER);
        assert!(reply.flags.contains(MessageFlags::ASYNC));
    }

    #[test]
    fn test_oversized_payload() {
        let payload = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            Message::new(1, MessageFlags::SYNC, &payload).unwrap_err(),
            Error::Invalid
        );
        assert!(Message::new(1, MessageFlags::SYNC, &[0u8; MAX_PAYLOAD]).is_ok());
    }
}
