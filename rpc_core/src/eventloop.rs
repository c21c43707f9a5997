// SPDX-License-Identifier: BSD-3-Clause

//! The cooperative scheduler that multiplexes nodes, their descriptors and their timers.
//!
//! An [`EventLoop`] holds only weak references to the nodes bound to it - the node's own
//! `Rc<RefCell<Node>>` (wrapped in a [`NodeHandle`]) is what actually keeps it alive, kept either
//! by the caller or by the loop's own [`NodeHandle::ensure_loop`] auto-create path. This mirrors
//! the crate's general cyclic-ownership fix (see the crate root docs): the node already holds a
//! weak handle back to its loop, so making the loop→node edge weak too means nothing here forms a
//! reference cycle that would need an explicit teardown pass.

use std::cell::RefCell;
use std::os::fd::{BorrowedFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::bug;
use crate::node::{Node, NodeHandle};
use crate::timer::Timer;
use crate::transport::{NodeEvent, PollFdEntry, PollInterest};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(5000);

/// The cooperative event loop. Create one with [`EventLoop::create_empty`] and bind nodes to it
/// with [`EventLoop::add`], or just call [`NodeHandle::ensure_loop`] and let a node get an
/// auto-created one lazily.
pub struct EventLoop {
    nodes: Vec<Weak<RefCell<Node>>>,
    poll_timeout: Duration,
    exit_at: Option<Instant>,
}

impl EventLoop {
    /// Create an empty loop with no bound nodes.
    pub fn create_empty() -> Rc<RefCell<EventLoop>> {
        Rc::new(RefCell::new(EventLoop { nodes: Vec::new(), poll_timeout: DEFAULT_POLL_TIMEOUT, exit_at: None }))
    }

    /// Create a loop and bind every node in `nodes` to it.
    pub fn create(nodes: &[NodeHandle]) -> Rc<RefCell<EventLoop>> {
        let l = Self::create_empty();
        for node in nodes {
            Self::add(&l, node);
        }
        l
    }

    /// Bind `node` to `loop_rc`. Panics if the node is already bound to a different,
    /// explicitly-created loop; silently destroys and replaces an auto-created one.
    pub fn add(loop_rc: &Rc<RefCell<EventLoop>>, node: &NodeHandle) {
        let current = node.loop_ref().and_then(|w| w.upgrade());
        if let Some(current_loop) = &current {
            if Rc::ptr_eq(current_loop, loop_rc) {
                return;
            }
            if !node.is_auto_created_loop_member() {
                bug!("eventloop", "node is already bound to an event loop");
            }
            Self::destroy(current_loop);
        }

        let timers = node.with_node(|n| n.timers().to_vec());
        for t in &timers {
            t.resume_after_attach();
        }

        loop_rc.borrow_mut().nodes.push(node.downgrade());
        node.set_loop(Some(Rc::downgrade(loop_rc)), false);
    }

    /// Unbind `node` from whatever loop it is currently bound to. Panics if it isn't bound to
    /// any. Timers are stopped but remembered as armed, so re-adding the node restores them; the
    /// loop itself is never closed by this call.
    pub fn del(node: &NodeHandle) {
        let loop_rc = match node.loop_ref().and_then(|w| w.upgrade()) {
            Some(l) => l,
            None => bug!("eventloop", "node is not bound to any event loop"),
        };

        let timers = node.with_node(|n| n.timers().to_vec());
        for t in &timers {
            t.suspend_for_removal();
        }

        Node::detach_from_loop(node.rc());
        loop_rc.borrow_mut().nodes.retain(|w| !node.weak_ptr_eq(w));
        node.set_loop(None, false);
    }

    /// Unbind every node still attached and drop the loop's own state. Does not close any node.
    pub fn destroy(loop_rc: &Rc<RefCell<EventLoop>>) {
        let handles: Vec<NodeHandle> =
            loop_rc.borrow().nodes.iter().filter_map(|w| w.upgrade()).map(NodeHandle::from_rc).collect();
        for node in &handles {
            Self::del(node);
        }
        loop_rc.borrow_mut().nodes.clear();
    }

    /// Arm (or disarm, with `after = None`) the exit deadline: [`Self::dispatch_forever`] returns
    /// once `Instant::now()` passes it.
    pub fn loopexit(&mut self, after: Option<Duration>) {
        self.exit_at = after.map(|d| Instant::now() + d);
    }

    fn live_nodes(&mut self) -> Vec<Rc<RefCell<Node>>> {
        self.nodes.retain(|w| w.strong_count() > 0);
        self.nodes.iter().filter_map(Weak::upgrade).collect()
    }

    /// Run one iteration: fire `STARTED` for any not-yet-started node, poll descriptors, fire due
    /// timers and timeouts, notify transports with pending outbound work, then drain inbound
    /// buffers. Returns early (without polling) if a node is in the middle of
    /// [`NodeHandle::wait_status`], matching the source's "the node may go online handling the
    /// started event" short-circuit.
    pub fn dispatch(&mut self) {
        let nodes = self.live_nodes();

        for node_rc in &nodes {
            if Node::mark_started(node_rc) {
                Node::dispatch_event(node_rc, NodeEvent::Started);
            }
        }
        if nodes.iter().any(|n| n.borrow().waiting_for_status().is_some()) {
            return;
        }

        let (descriptors, timers) = Self::snapshot(&nodes);
        let timeout = self.poll_timeout(&timers);
        let ready = poll_descriptors(&descriptors, timeout);
        for (node_weak, token) in ready {
            if let Some(node_rc) = node_weak.upgrade() {
                Node::dispatch_event(&node_rc, NodeEvent::Descriptor(token));
            }
        }

        let now = Instant::now();
        for timer in &timers {
            timer.fire_if_due(now);
        }
        for node_rc in &nodes {
            Node::expire_timeouts(node_rc, now);
        }

        for node_rc in &nodes {
            if Node::take_outbound_dirty(node_rc) {
                Node::dispatch_event(node_rc, NodeEvent::HaveOutbound);
            }
        }
        for node_rc in &nodes {
            Node::drain_inbound(node_rc);
        }
    }

    /// Dispatch until [`Self::loopexit`] fires, looping [`Self::dispatch`] forever otherwise.
    pub fn dispatch_forever(loop_rc: &Rc<RefCell<EventLoop>>) {
        loop {
            loop_rc.borrow_mut().dispatch();
            let done = loop_rc.borrow().exit_at.is_some_and(|t| Instant::now() >= t);
            if done {
                loop_rc.borrow_mut().exit_at = None;
                return;
            }
        }
    }

    fn snapshot(nodes: &[Rc<RefCell<Node>>]) -> (Vec<(Weak<RefCell<Node>>, PollFdEntry)>, Vec<Timer>) {
        let mut descriptors = Vec::new();
        let mut timers = Vec::new();
        for node_rc in nodes {
            let n = node_rc.borrow();
            for entry in n.pollfds() {
                descriptors.push((Rc::downgrade(node_rc), *entry));
            }
            timers.extend(n.timers().iter().cloned());
        }
        (descriptors, timers)
    }

    fn poll_timeout(&self, timers: &[Timer]) -> Duration {
        let now = Instant::now();
        match timers.iter().filter_map(|t| t.due_at()).min() {
            Some(due) => due.saturating_duration_since(now).min(self.poll_timeout),
            None => self.poll_timeout,
        }
    }
}

fn interest_to_flags(interest: PollInterest) -> PollFlags {
    match interest {
        PollInterest::Read => PollFlags::POLLIN,
        PollInterest::Write => PollFlags::POLLOUT,
        PollInterest::ReadWrite => PollFlags::POLLIN | PollFlags::POLLOUT,
    }
}

/// One `poll(2)` call covering the union of every bound node's registered descriptors: coarse,
/// per-iteration polling rather than an edge-triggered reactor.
fn poll_descriptors(
    entries: &[(Weak<RefCell<Node>>, PollFdEntry)],
    timeout: Duration,
) -> Vec<(Weak<RefCell<Node>>, u64)> {
    let mut pollfds: Vec<PollFd> = entries
        .iter()
        .map(|(_, entry)| {
            let fd: RawFd = entry.fd;
            // Safety: the fd stays open for at least the lifetime of this call - it is owned by
            // the transport that registered it, which only ever runs on this same loop thread.
            let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
            PollFd::new(borrowed, interest_to_flags(entry.interest))
        })
        .collect();

    let timeout_ms = u16::try_from(timeout.as_millis()).unwrap_or(u16::MAX);
    if poll(&mut pollfds, PollTimeout::from(timeout_ms)).is_err() {
        return Vec::new();
    }

    pollfds
        .iter()
        .zip(entries.iter())
        .filter(|(pfd, _)| pfd.revents().is_some_and(|r| !r.is_empty()))
        .map(|(_, (node_weak, entry))| (node_weak.clone(), entry.token))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::node::NodeContext;
    use crate::transport::{self, Transport};
    use std::cell::Cell;
    use std::rc::Rc;

    thread_local! {
        static STARTED_COUNT: Cell<u32> = const { Cell::new(0) };
    }

    struct Immediate;
    impl Transport for Immediate {
        fn name(&self) -> &str {
            "eventloop-test-immediate"
        }
        fn open(&mut self, ctx: &mut NodeContext, _opts: &str) -> Result<(), Error> {
            ctx.set_status(crate::node::NodeStatus::Online);
            Ok(())
        }
        fn close(&mut self, _ctx: &mut NodeContext) {}
        fn handle_event(&mut self, _ctx: &mut NodeContext, event: NodeEvent) {
            if matches!(event, NodeEvent::Started) {
                STARTED_COUNT.with(|c| c.set(c.get() + 1));
            }
        }
    }

    fn make_immediate() -> Box<dyn Transport> {
        Box::new(Immediate)
    }

    #[test]
    fn dispatch_fires_started_exactly_once() {
        STARTED_COUNT.with(|c| c.set(0));
        transport::register("eventloop-test-immediate", make_immediate);
        let node = NodeHandle::open("eventloop-test-immediate", "", crate::endian::Endian::host()).unwrap();
        assert_eq!(node.status(), crate::node::NodeStatus::Online);

        let l = node.ensure_loop();
        l.borrow_mut().dispatch();
        l.borrow_mut().dispatch();
        l.borrow_mut().dispatch();
        assert_eq!(STARTED_COUNT.with(|c| c.get()), 1);
    }

    #[test]
    fn auto_created_loop_is_replaced_by_explicit_add() {
        transport::register("eventloop-test-immediate", make_immediate);
        let node = NodeHandle::open("eventloop-test-immediate", "", crate::endian::Endian::host()).unwrap();
        let auto = node.ensure_loop();
        let explicit = EventLoop::create_empty();
        EventLoop::add(&explicit, &node);
        assert!(!Rc::ptr_eq(&auto, &explicit));
        assert!(node.loop_ref().and_then(|w| w.upgrade()).is_some_and(|l| Rc::ptr_eq(&l, &explicit)));
    }
}
