// SPDX-License-Identifier: BSD-3-Clause

//! The transport contract, and the process-wide registry transports publish themselves into.
//!
//! This mirrors the source's `aura_transport`/`AURA_TRANSPORT()` pair: a transport is a named
//! plugin with a handful of lifecycle hooks, and `open()` resolves a transport purely by name
//! looked up in this registry. The registry is the one piece of genuinely global, shared mutable
//! state in the crate (see the crate root for why that's acceptable in a single-threaded model).

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::RawFd;

use crate::bug;
use crate::buffer::Buffer;
use crate::node::NodeContext;

/// What a transport should watch a descriptor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterest {
    Read,
    Write,
    ReadWrite,
}

/// A descriptor a transport has asked the event loop to multiplex, together with the token the
/// loop handed back when it was registered.
#[derive(Debug, Clone, Copy)]
pub struct PollFdEntry {
    pub token: u64,
    pub fd: RawFd,
    pub interest: PollInterest,
}

/// Whether a descriptor was just added or is about to be removed, passed to a node's
/// `fd_changed` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdAction {
    Added,
    Removed,
}

/// The event kinds a transport's `handle_event` is dispatched with.
#[derive(Debug, Clone, Copy)]
pub enum NodeEvent {
    /// Fired exactly once, the first time a node is dispatched.
    Started,
    /// A descriptor the transport registered became ready.
    Descriptor(u64),
    /// The node's outbound queue gained buffers since the transport was last notified.
    HaveOutbound,
}

/// The plugin contract a transport implements.
///
/// Every method is handed a [`NodeContext`] rather than the node itself: a node's transport lives
/// inside the node as a boxed trait object, so the node temporarily detaches it before dispatching
/// (see `Node::dispatch_event`), and the context is the sliver of the node a transport is allowed
/// to touch while detached.
pub trait Transport {
    fn name(&self) -> &str;

    /// Bytes a transport needs to reserve ahead of (`buffer_offset`) and around
    /// (`buffer_overhead`) the payload it hands the format engine, e.g. for its own framing.
    /// Transports with no framing needs (the common case) can leave both at zero.
    fn buffer_overhead(&self) -> usize {
        0
    }

    fn buffer_offset(&self) -> usize {
        0
    }

    fn open(&mut self, ctx: &mut NodeContext, opts: &str) -> Result<(), crate::error::Error>;

    fn close(&mut self, ctx: &mut NodeContext);

    fn handle_event(&mut self, ctx: &mut NodeContext, event: NodeEvent);

    /// Called when an object's format references a nested buffer handle (`b` token) on the way
    /// out. Transports that don't support nested buffers can leave this unimplemented; the
    /// default attaches the nested buffer to `dst` out-of-band via [`Buffer::put_nested`].
    fn buffer_put(&mut self, _ctx: &mut NodeContext, dst: &mut Buffer, nested: Buffer) {
        dst.put_nested(nested);
    }

    /// The inbound counterpart of `buffer_put`. The default reads the buffer back out of `src`
    /// with [`Buffer::get_nested`].
    fn buffer_get(&mut self, _ctx: &mut NodeContext, src: &mut Buffer) -> Buffer {
        src.get_nested()
    }
}

/// A constructor registered under a transport name. Transports register themselves with
/// [`register`] (conventionally from a `ctor`-style initializer or an explicit call early in
/// `main`); `open()` looks the name up here.
pub type TransportFactory = fn() -> Box<dyn Transport>;

thread_local! {
    static REGISTRY: RefCell<HashMap<&'static str, TransportFactory>> = RefCell::new(HashMap::new());
}

/// Publish a transport under `name`. Calling this twice for the same name replaces the previous
/// registration, mirroring a plain `HashMap` rather than erroring, since re-registration usually
/// means a test harness swapping in a fake.
///
/// Instantiates one throwaway probe to check that `buffer_overhead >= buffer_offset` before
/// publishing the factory; a transport that violates it is a caller bug, not a recoverable
/// registration error.
pub fn register(name: &'static str, factory: TransportFactory) {
    let probe = factory();
    if probe.buffer_overhead() < probe.buffer_offset() {
        bug!(
            "transport",
            "transport {:?} declares buffer_overhead ({}) < buffer_offset ({})",
            name,
            probe.buffer_overhead(),
            probe.buffer_offset()
        );
    }
    REGISTRY.with(|r| {
        r.borrow_mut().insert(name, factory);
    });
}

pub(crate) fn instantiate(name: &str) -> Option<Box<dyn Transport>> {
    REGISTRY.with(|r| r.borrow().get(name).map(|f| f()))
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;
    impl Transport for Noop {
        fn name(&self) -> &str {
            "noop-test"
        }
        fn open(&mut self, _ctx: &mut NodeContext, _opts: &str) -> Result<(), crate::error::Error> {
            Ok(())
        }
        fn close(&mut self, _ctx: &mut NodeContext) {}
        fn handle_event(&mut self, _ctx: &mut NodeContext, _event: NodeEvent) {}
    }

    #[test]
    fn register_then_instantiate() {
        register("noop-test", || Box::new(Noop));
        let t = instantiate("noop-test").expect("registered");
        assert_eq!(t.name(), "noop-test");
        assert!(instantiate("never-registered").is_none());
    }
}
