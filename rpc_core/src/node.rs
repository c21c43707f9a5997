// SPDX-License-Identifier: BSD-3-Clause

//! Nodes: one endpoint of a connection to a peer, bound to a transport and (once opened) an
//! export table.
//!
//! A node is always reached through a [`NodeHandle`], a cheap `Rc<RefCell<Node>>` clone. Nothing
//! in this module ever invokes user-supplied code (a completion callback, a status callback, a
//! transport hook) while holding a live borrow of the `RefCell` - every public entry point
//! collects what it needs to call first, drops the borrow, then calls out. Skipping that
//! discipline is the single easiest way to make a legitimate re-entrant call (starting a new call
//! from inside a completion callback, which this crate explicitly allows) panic with a
//! `BorrowMutError`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::buffer::{Buffer, BufferPool};
use crate::bug;
use crate::endian::Endian;
use crate::error::{CallStatus, Error};
use crate::etable::{formats_compatible, ExportTable, ExportTableBuilder, Object};
use crate::eventloop::EventLoop;
use crate::timer::Timer;
use crate::transport::{self, FdAction, NodeEvent, PollFdEntry, PollInterest, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Offline,
    Online,
}

/// A call awaiting a reply, queued per-object so replies can be matched back to their caller in
/// submission order even when several calls against the same object are in flight at once.
struct PendingCall {
    object: Rc<Object>,
    done_cb: Box<dyn FnOnce(CallStatus, Option<Buffer>)>,
    /// `None` means the call never expires on its own (it still fails on OFFLINE/close).
    deadline: Option<Instant>,
}

/// Writer for the typed call-builder API: fills in an outbound buffer field by field, in the
/// order the target object's argument format declares them.
pub struct ArgWriter<'a> {
    buf: &'a mut Buffer,
}

impl<'a> ArgWriter<'a> {
    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.put_u8(v);
        self
    }
    pub fn i8(&mut self, v: i8) -> &mut Self {
        self.buf.put_i8(v);
        self
    }
    pub fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.put_u16(v);
        self
    }
    pub fn i16(&mut self, v: i16) -> &mut Self {
        self.buf.put_i16(v);
        self
    }
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }
    pub fn i64(&mut self, v: i64) -> &mut Self {
        self.buf.put_i64(v);
        self
    }
    pub fn bin(&mut self, n: usize, data: &[u8]) -> &mut Self {
        self.buf.put_bin(n, data);
        self
    }
    pub fn nested(&mut self, nested: Buffer) -> &mut Self {
        self.buf.put_nested(nested);
        self
    }
}

/// The view of a node a [`Transport`] implementation is allowed to touch while its `open`,
/// `close` or `handle_event` hook is running.
///
/// The transport itself lives inside `Node::transport` as a boxed trait object; dispatching into
/// it therefore has to temporarily move it out (see [`Node::dispatch_event`]), which is why this
/// context wraps the node rather than a method taking `&mut Node` being handed straight to the
/// transport - the transport's own field would alias the `&mut Node` borrow.
pub struct NodeContext<'a> {
    node: &'a mut Node,
}

impl<'a> NodeContext<'a> {
    /// Transition the node's status. Deferred: any resulting completions/status callback are
    /// staged and only actually invoked once the node is no longer borrowed (see
    /// `Node::drain_deferred`), since this runs while a transport hook still holds the node.
    pub fn set_status(&mut self, status: NodeStatus) {
        self.node.apply_status_locked(status);
    }

    pub fn status(&self) -> NodeStatus {
        self.node.status
    }

    /// Pop the next outbound buffer queued by a call, if any.
    pub fn pop_outbound(&mut self) -> Option<Buffer> {
        self.node.outbound.pop_front()
    }

    /// Hand a decoded inbound buffer to the call engine. The buffer must already be bound to the
    /// object it answers (see [`Self::bind_object`]) so the engine doesn't need to guess.
    pub fn push_inbound(&mut self, buf: Buffer) {
        self.node.inbound.push_back(buf);
    }

    pub fn request_buffer(&mut self, size: usize) -> Buffer {
        self.node.pool.request(size, self.node.needs_swap)
    }

    pub fn release_buffer(&mut self, buf: Buffer) {
        self.node.pool.release(buf);
    }

    /// Resolve a name against the currently active export table, for transports that need to
    /// bind an inbound event buffer to its object.
    pub fn find_object(&self, name: &str) -> Option<Rc<Object>> {
        self.node.etable.as_ref().and_then(|t| t.find_by_name(name))
    }

    pub fn bind_object(&self, buf: &mut Buffer, object: Rc<Object>) {
        buf.bind_object(object);
    }

    pub fn needs_swap(&self) -> bool {
        self.node.needs_swap
    }

    /// Register a descriptor with the loop this node is bound to. Returns a token to use with
    /// [`Self::del_pollfd`] and to match against `NodeEvent::Descriptor`.
    pub fn add_pollfd(&mut self, fd: RawFd, interest: PollInterest) -> u64 {
        let token = self.node.next_pollfd_token;
        self.node.next_pollfd_token += 1;
        let entry = PollFdEntry { token, fd, interest };
        self.node.pollfds.push(entry);
        if let Some(cb) = &mut self.node.fd_changed_cb {
            cb(&entry, FdAction::Added);
        }
        token
    }

    pub fn del_pollfd(&mut self, token: u64) {
        if let Some(idx) = self.node.pollfds.iter().position(|e| e.token == token) {
            let entry = self.node.pollfds.remove(idx);
            if let Some(cb) = &mut self.node.fd_changed_cb {
                cb(&entry, FdAction::Removed);
            }
        }
    }
}

/// The shared state of one RPC endpoint.
pub struct Node {
    name: String,
    transport: Option<Box<dyn Transport>>,
    buffer_overhead: usize,
    buffer_offset: usize,
    status: NodeStatus,
    peer_endian: Endian,
    needs_swap: bool,
    etable: Option<Rc<ExportTable>>,
    outbound: VecDeque<Buffer>,
    outbound_dirty: bool,
    inbound: VecDeque<Buffer>,
    pool: BufferPool,
    pending_calls: HashMap<usize, VecDeque<PendingCall>>,
    event_callbacks: HashMap<String, Box<dyn FnMut(Buffer)>>,
    sync_events: VecDeque<(Rc<Object>, Buffer)>,
    sync_event_max: usize,
    sync_call_running: bool,
    current_object: Option<Rc<Object>>,
    /// Completions produced by an online-to-offline transition applied while the node's
    /// `RefCell` borrow was already held (i.e. from inside a transport's `handle_event`), waiting
    /// for that borrow to drop before they can be safely invoked. See `Node::drain_deferred`.
    deferred_completions: Vec<Box<dyn FnOnce(CallStatus, Option<Buffer>)>>,
    deferred_status_fire: Option<NodeStatus>,
    status_changed_cb: Option<Box<dyn FnMut(NodeStatus)>>,
    etable_changed_cb: Option<Box<dyn FnMut(Option<&ExportTable>, &ExportTable)>>,
    unhandled_evt_cb: Option<Box<dyn FnMut(Buffer)>>,
    object_migration_failed_cb: Option<Box<dyn FnMut(&Object)>>,
    fd_changed_cb: Option<Box<dyn FnMut(&PollFdEntry, FdAction)>>,
    pollfds: Vec<PollFdEntry>,
    next_pollfd_token: u64,
    timers: Vec<Timer>,
    start_event_sent: bool,
    waiting_for_status: Option<NodeStatus>,
    loop_ref: Option<Weak<RefCell<EventLoop>>>,
    loop_auto_created: bool,
}

fn object_key(object: &Rc<Object>) -> usize {
    Rc::as_ptr(object) as usize
}

impl Node {
    pub(crate) fn pollfds(&self) -> &[PollFdEntry] {
        &self.pollfds
    }

    pub(crate) fn timers(&self) -> &[Timer] {
        &self.timers
    }

    pub(crate) fn loop_ref(&self) -> Option<Weak<RefCell<EventLoop>>> {
        self.loop_ref.clone()
    }

    pub(crate) fn waiting_for_status(&self) -> Option<NodeStatus> {
        self.waiting_for_status
    }

    /// Apply a status transition in place. Only ever called while `self` is already borrowed
    /// (either by `NodeContext`, mid-dispatch, or by `NodeHandle::set_status` itself), so instead
    /// of invoking any user callback directly, it stages them in `deferred_completions` /
    /// `deferred_status_fire` for the caller to flush once it no longer holds the borrow.
    fn apply_status_locked(&mut self, status: NodeStatus) {
        if self.status == status {
            return;
        }
        let old = self.status;
        self.status = status;
        if old == NodeStatus::Online && status == NodeStatus::Offline {
            for buf in self.outbound.drain(..) {
                self.pool.release(buf);
            }
            let keys: Vec<usize> = self.pending_calls.keys().copied().collect();
            for key in keys {
                if let Some(mut queue) = self.pending_calls.remove(&key) {
                    while let Some(pending) = queue.pop_front() {
                        pending.object.dec_pending();
                        self.deferred_completions.push(pending.done_cb);
                    }
                }
            }
        }
        if old == NodeStatus::Offline && status == NodeStatus::Online {
            self.waiting_for_status = None;
        }
        self.deferred_status_fire = Some(status);
    }
}

/// A reference-counted handle to a [`Node`]. Clone is cheap (an `Rc` bump) and both clones refer
/// to the same node.
#[derive(Clone)]
pub struct NodeHandle(pub(crate) Rc<RefCell<Node>>);

impl NodeHandle {
    pub(crate) fn from_rc(rc: Rc<RefCell<Node>>) -> Self {
        NodeHandle(rc)
    }

    pub(crate) fn rc(&self) -> &Rc<RefCell<Node>> {
        &self.0
    }

    pub(crate) fn downgrade(&self) -> Weak<RefCell<Node>> {
        Rc::downgrade(&self.0)
    }

    pub(crate) fn weak_ptr_eq(&self, other: &Weak<RefCell<Node>>) -> bool {
        other.upgrade().is_some_and(|rc| Rc::ptr_eq(&rc, &self.0))
    }

    pub(crate) fn with_node<R>(&self, f: impl FnOnce(&Node) -> R) -> R {
        f(&self.0.borrow())
    }

    /// Open a node against the transport registered under `transport_name`, with endianness
    /// policy against a known peer order.
    pub fn open(transport_name: &str, opts: &str, peer_endian: Endian) -> Result<Self, Error> {
        let transport = transport::instantiate(transport_name)
            .ok_or_else(|| Error::UnknownTransport(transport_name.to_string()))?;
        let needs_swap = peer_endian.needs_swap();
        let node = Node {
            name: transport_name.to_string(),
            buffer_overhead: transport.buffer_overhead(),
            buffer_offset: transport.buffer_offset(),
            transport: Some(transport),
            status: NodeStatus::Offline,
            peer_endian,
            needs_swap,
            etable: None,
            outbound: VecDeque::new(),
            outbound_dirty: false,
            inbound: VecDeque::new(),
            pool: BufferPool::new(16),
            pending_calls: HashMap::new(),
            event_callbacks: HashMap::new(),
            sync_events: VecDeque::new(),
            sync_event_max: 0,
            sync_call_running: false,
            current_object: None,
            deferred_completions: Vec::new(),
            deferred_status_fire: None,
            status_changed_cb: None,
            etable_changed_cb: None,
            unhandled_evt_cb: None,
            object_migration_failed_cb: None,
            fd_changed_cb: None,
            pollfds: Vec::new(),
            next_pollfd_token: 0,
            timers: Vec::new(),
            start_event_sent: false,
            waiting_for_status: None,
            loop_ref: None,
            loop_auto_created: false,
        };
        let handle = NodeHandle(Rc::new(RefCell::new(node)));
        handle.ensure_loop();
        let open_result = {
            let mut n = handle.0.borrow_mut();
            let mut tr = n.transport.take().expect("transport present right after construction");
            let mut ctx = NodeContext { node: &mut n };
            let res = tr.open(&mut ctx, opts);
            n.transport = Some(tr);
            res
        };
        Self::drain_deferred(&handle.0);
        open_result?;
        Ok(handle)
    }

    pub fn status(&self) -> NodeStatus {
        self.0.borrow().status
    }

    /// Return the loop this node is bound to, auto-creating and binding a fresh one if it has
    /// none (either because it was never added to one, or it was removed from its last one).
    pub fn ensure_loop(&self) -> Rc<RefCell<EventLoop>> {
        let existing = self.0.borrow().loop_ref.as_ref().and_then(Weak::upgrade);
        if let Some(l) = existing {
            return l;
        }
        let l = EventLoop::create_empty();
        EventLoop::add(&l, self);
        self.0.borrow_mut().loop_auto_created = true;
        l
    }

    pub(crate) fn set_loop(&self, l: Option<Weak<RefCell<EventLoop>>>, auto_created: bool) {
        let mut n = self.0.borrow_mut();
        n.loop_ref = l;
        n.loop_auto_created = auto_created;
    }

    pub(crate) fn is_auto_created_loop_member(&self) -> bool {
        self.0.borrow().loop_auto_created
    }

    /// Install a new export table, migrating in-flight bookkeeping for any object that survives
    /// under the same name with a compatible shape. Objects that don't survive are reported
    /// through the migration-failed callback; pending calls already holding a strong reference to
    /// the stranded object are left to complete or fail on their own.
    pub fn install_etable(&self, builder: ExportTableBuilder) {
        let new_table = Rc::new(builder.activate());
        let (old_table, stranded, etable_cb) = {
            let mut n = self.0.borrow_mut();
            let old = n.etable.take();
            let mut stranded = Vec::new();
            if let Some(old_tbl) = &old {
                for obj in old_tbl.objects() {
                    match new_table.find_by_name(&obj.name) {
                        Some(new_obj) if formats_compatible(obj, &new_obj) => {}
                        _ => stranded.push(obj.clone()),
                    }
                }
            }
            n.etable = Some(new_table.clone());
            (old, stranded, n.etable_changed_cb.take())
        };
        for obj in &stranded {
            let cb = self.0.borrow_mut().object_migration_failed_cb.take();
            if let Some(mut cb) = cb {
                cb(obj);
                self.0.borrow_mut().object_migration_failed_cb = Some(cb);
            }
        }
        if let Some(mut cb) = etable_cb {
            cb(old_table.as_deref(), &new_table);
            self.0.borrow_mut().etable_changed_cb = Some(cb);
        }
    }

    pub fn etable(&self) -> Option<Rc<ExportTable>> {
        self.0.borrow().etable.clone()
    }

    pub fn set_status_changed_callback(&self, cb: impl FnMut(NodeStatus) + 'static) {
        self.0.borrow_mut().status_changed_cb = Some(Box::new(cb));
    }

    pub fn set_etable_changed_callback(&self, cb: impl FnMut(Option<&ExportTable>, &ExportTable) + 'static) {
        self.0.borrow_mut().etable_changed_cb = Some(Box::new(cb));
    }

    pub fn set_unhandled_event_callback(&self, cb: impl FnMut(Buffer) + 'static) {
        self.0.borrow_mut().unhandled_evt_cb = Some(Box::new(cb));
    }

    pub fn set_object_migration_failed_callback(&self, cb: impl FnMut(&Object) + 'static) {
        self.0.borrow_mut().object_migration_failed_cb = Some(Box::new(cb));
    }

    pub fn set_fd_changed_callback(&self, cb: impl FnMut(&PollFdEntry, FdAction) + 'static) {
        self.0.borrow_mut().fd_changed_cb = Some(Box::new(cb));
    }

    /// Bind a callback to an event object by name. Fails with [`Error::InvalidName`] if the
    /// active table has no such object, and with [`Error::InvalidId`] if it names a method
    /// instead of an event.
    pub fn set_event_callback(&self, name: &str, cb: impl FnMut(Buffer) + 'static) -> Result<(), Error> {
        let mut n = self.0.borrow_mut();
        let obj = n.etable.as_ref().and_then(|t| t.find_by_name(name)).ok_or(Error::InvalidName)?;
        if !obj.is_event() {
            return Err(Error::InvalidId);
        }
        n.event_callbacks.insert(name.to_string(), Box::new(cb));
        Ok(())
    }

    /// Bind a callback to an event object by id, the counterpart to [`Self::set_event_callback`]
    /// for callers that already hold the object's numeric id (e.g. resolved once via
    /// [`ExportTable::find_by_id`]) rather than its name. Fails with [`Error::InvalidId`] if the
    /// active table has no such id, or if it names a method instead of an event.
    pub fn set_event_callback_by_id(&self, id: u32, cb: impl FnMut(Buffer) + 'static) -> Result<(), Error> {
        let mut n = self.0.borrow_mut();
        let obj = n.etable.as_ref().and_then(|t| t.find_by_id(id)).ok_or(Error::InvalidId)?;
        if !obj.is_event() {
            return Err(Error::InvalidId);
        }
        n.event_callbacks.insert(obj.name.clone(), Box::new(cb));
        Ok(())
    }

    /// Enable the synchronous event queue: inbound events with no dedicated callback are buffered
    /// here (up to `capacity`; once full, the oldest `capacity` events are kept and any further
    /// arrival is dropped) instead of reaching `unhandled_evt_cb`, for polling consumers built on
    /// [`Self::get_next_event`].
    pub fn enable_sync_events(&self, capacity: usize) {
        let mut n = self.0.borrow_mut();
        n.sync_event_max = capacity;
    }

    /// Number of events currently buffered in the synchronous event ring, for polling consumers
    /// that want to check before draining with [`Self::get_next_event`].
    pub fn get_pending_events(&self) -> usize {
        self.0.borrow().sync_events.len()
    }

    pub fn get_next_event(&self) -> Option<(Rc<Object>, Buffer)> {
        self.0.borrow_mut().sync_events.pop_front()
    }

    /// Create an inactive timer; call [`Timer::start`] to arm it.
    pub fn create_timer(&self, cb: impl FnMut() + 'static) -> Timer {
        let timer = Timer::new(Box::new(cb));
        self.0.borrow_mut().timers.push(timer.clone());
        timer
    }

    fn resolve_method(&self, name: &str) -> Result<Rc<Object>, Error> {
        let n = self.0.borrow();
        let obj = n.etable.as_ref().and_then(|t| t.find_by_name(name)).ok_or(Error::InvalidName)?;
        if obj.is_event() {
            return Err(Error::InvalidName);
        }
        if !obj.valid {
            return Err(Error::FormatInvalid);
        }
        Ok(obj)
    }

    /// Build an outbound call against a method resolved by name and queue it. The call never
    /// times out on its own; see [`Self::start_call_timeout`] for a deadline-bound variant.
    pub fn start_call(
        &self,
        name: &str,
        build: impl FnOnce(&mut ArgWriter),
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.start_call_inner(name, build, None, done_cb)
    }

    /// Like [`Self::start_call`], but the completion fires with [`CallStatus::Timeout`] if no
    /// reply arrives within `timeout` of submission.
    pub fn start_call_timeout(
        &self,
        name: &str,
        build: impl FnOnce(&mut ArgWriter),
        timeout: Duration,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.start_call_inner(name, build, Some(timeout), done_cb)
    }

    fn start_call_inner(
        &self,
        name: &str,
        build: impl FnOnce(&mut ArgWriter),
        timeout: Option<Duration>,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        let obj = self.resolve_method(name)?;
        let mut buf = {
            let mut n = self.0.borrow_mut();
            n.pool.request(obj.arg_len() + n.buffer_overhead, n.needs_swap)
        };
        build(&mut ArgWriter { buf: &mut buf });
        self.queue_call_inner(obj, buf, timeout, done_cb)
    }

    /// Build an outbound call against a method resolved by name, from pre-serialized argument
    /// bytes matched against the object's parsed format rather than the typed [`ArgWriter`]
    /// builder - the format-driven counterpart to [`Self::start_call`] for dynamic/bridge callers
    /// (e.g. a language binding) that already encode against a format string themselves. Both
    /// paths share the same [`crate::format::Format`] for length computation; `arg_bytes` must be
    /// exactly `arg_len()` bytes or this returns [`Error::FormatInvalid`]. The call never times
    /// out on its own; see [`Self::start_call_raw_timeout`] for a deadline-bound variant.
    pub fn start_call_raw(
        &self,
        name: &str,
        arg_bytes: &[u8],
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.start_call_raw_inner(name, arg_bytes, None, done_cb)
    }

    /// Like [`Self::start_call_raw`], but the completion fires with [`CallStatus::Timeout`] if no
    /// reply arrives within `timeout` of submission.
    pub fn start_call_raw_timeout(
        &self,
        name: &str,
        arg_bytes: &[u8],
        timeout: Duration,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.start_call_raw_inner(name, arg_bytes, Some(timeout), done_cb)
    }

    fn start_call_raw_inner(
        &self,
        name: &str,
        arg_bytes: &[u8],
        timeout: Option<Duration>,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        let obj = self.resolve_method(name)?;
        if arg_bytes.len() != obj.arg_len() {
            return Err(Error::FormatInvalid);
        }
        let mut buf = {
            let mut n = self.0.borrow_mut();
            n.pool.request(obj.arg_len() + n.buffer_overhead, n.needs_swap)
        };
        buf.put_raw(arg_bytes);
        self.queue_call_inner(obj, buf, timeout, done_cb)
    }

    /// Queue an already-serialized call against `obj`. The typed path above is the common case;
    /// this is the escape hatch for callers building buffers dynamically from a format string
    /// rather than a compiled-in object name. The call never times out on its own; see
    /// [`Self::queue_call_timeout`] for a deadline-bound variant.
    pub fn queue_call(
        &self,
        obj: Rc<Object>,
        buf: Buffer,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.queue_call_inner(obj, buf, None, done_cb)
    }

    /// Like [`Self::queue_call`], but the completion fires with [`CallStatus::Timeout`] if no
    /// reply arrives within `timeout` of submission.
    pub fn queue_call_timeout(
        &self,
        obj: Rc<Object>,
        buf: Buffer,
        timeout: Duration,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        self.queue_call_inner(obj, buf, Some(timeout), done_cb)
    }

    fn queue_call_inner(
        &self,
        obj: Rc<Object>,
        mut buf: Buffer,
        timeout: Option<Duration>,
        done_cb: impl FnOnce(CallStatus, Option<Buffer>) + 'static,
    ) -> Result<(), Error> {
        let mut n = self.0.borrow_mut();
        if n.status != NodeStatus::Online {
            n.pool.release(buf);
            return Err(Error::NotOnline);
        }
        buf.bind_object(obj.clone());
        n.outbound.push_back(buf);
        n.outbound_dirty = true;
        obj.inc_pending();
        let deadline = timeout.map(|d| Instant::now() + d);
        n.pending_calls
            .entry(object_key(&obj))
            .or_default()
            .push_back(PendingCall { object: obj, done_cb: Box::new(done_cb), deadline });
        Ok(())
    }

    /// Run a call to completion synchronously, driving this node's event loop until the reply (or
    /// a transport failure) arrives. Returns [`Error::SyncInProgress`] if another synchronous
    /// call on this node is already running - reentering the sync facade itself is not allowed,
    /// unlike queuing further async calls from a completion callback.
    pub fn call(&self, name: &str, build: impl FnOnce(&mut ArgWriter)) -> Result<(CallStatus, Option<Buffer>), Error> {
        self.call_sync(move |done| self.start_call(name, build, done))
    }

    /// The format-driven counterpart to [`Self::call`]: same synchronous, reentrancy-checked
    /// machinery, but submits pre-serialized `arg_bytes` via [`Self::start_call_raw`] instead of
    /// driving a typed [`ArgWriter`].
    pub fn call_raw(&self, name: &str, arg_bytes: &[u8]) -> Result<(CallStatus, Option<Buffer>), Error> {
        self.call_sync(move |done| self.start_call_raw(name, arg_bytes, done))
    }

    /// Shared machinery behind [`Self::call`] and [`Self::call_raw`]: reject a reentrant
    /// synchronous call on this node, submit via `submit`, then drive this node's loop until the
    /// completion lands in the result slot. `submit` is handed a boxed completion closure that
    /// stashes the result and clears `sync_call_running` - it must forward it, unmodified, to
    /// whichever `start_call*` variant it calls.
    fn call_sync(
        &self,
        submit: impl FnOnce(Box<dyn FnOnce(CallStatus, Option<Buffer>)>) -> Result<(), Error>,
    ) -> Result<(CallStatus, Option<Buffer>), Error> {
        if self.0.borrow().sync_call_running {
            return Err(Error::SyncInProgress);
        }
        self.0.borrow_mut().sync_call_running = true;

        let result: Rc<RefCell<Option<(CallStatus, Option<Buffer>)>>> = Rc::new(RefCell::new(None));
        let result_for_cb = result.clone();
        let self_for_cb = self.clone();
        let submitted = submit(Box::new(move |status, buf| {
            *result_for_cb.borrow_mut() = Some((status, buf));
            self_for_cb.0.borrow_mut().sync_call_running = false;
        }));
        if let Err(e) = submitted {
            self.0.borrow_mut().sync_call_running = false;
            return Err(e);
        }

        let event_loop = self.ensure_loop();
        while result.borrow().is_none() {
            event_loop.borrow_mut().dispatch();
        }
        Ok(result.borrow_mut().take().expect("loop only exits once the slot is filled"))
    }

    /// Block until the node reaches `desired`, driving its event loop.
    pub fn wait_status(&self, desired: NodeStatus) {
        {
            let mut n = self.0.borrow_mut();
            if n.status == desired {
                return;
            }
            n.waiting_for_status = Some(desired);
        }
        let event_loop = self.ensure_loop();
        loop {
            if self.0.borrow().status == desired {
                self.0.borrow_mut().waiting_for_status = None;
                return;
            }
            event_loop.borrow_mut().dispatch();
        }
    }

    /// Transition the node's status, firing the status-changed callback and, on an
    /// online-to-offline transition, failing every outbound and pending call with
    /// [`CallStatus::TransportFail`]. A no-op if `status` already matches.
    pub fn set_status(&self, status: NodeStatus) {
        self.0.borrow_mut().apply_status_locked(status);
        Self::drain_deferred(&self.0);
    }

    /// Invoke every completion and status-changed callback staged by `apply_status_locked` while
    /// some other borrow of the node was live, now that it no longer is. Called after every
    /// operation that might have run a transport hook or `NodeContext` method capable of changing
    /// status - see the module doc for why this collect-then-invoke split matters.
    fn drain_deferred(node_rc: &Rc<RefCell<Node>>) {
        loop {
            let (completions, status_fire, status_cb) = {
                let mut n = node_rc.borrow_mut();
                if n.deferred_completions.is_empty() && n.deferred_status_fire.is_none() {
                    return;
                }
                let completions = std::mem::take(&mut n.deferred_completions);
                let status_fire = n.deferred_status_fire.take();
                let status_cb = if status_fire.is_some() { n.status_changed_cb.take() } else { None };
                (completions, status_fire, status_cb)
            };
            for done_cb in completions {
                done_cb(CallStatus::TransportFail, None);
            }
            if let Some(status) = status_fire {
                if let Some(mut cb) = status_cb {
                    cb(status);
                    node_rc.borrow_mut().status_changed_cb = Some(cb);
                }
            }
        }
    }

    /// Dispatch one event into the node's transport, temporarily detaching it from the node so
    /// the context handed to the transport can borrow everything else mutably.
    pub(crate) fn dispatch_event(node_rc: &Rc<RefCell<Node>>, event: NodeEvent) {
        {
            let mut n = node_rc.borrow_mut();
            let mut tr = n.transport.take().expect("transport present while node is attached to a loop");
            {
                let mut ctx = NodeContext { node: &mut n };
                tr.handle_event(&mut ctx, event);
            }
            n.transport = Some(tr);
        }
        Self::drain_deferred(node_rc);
    }

    /// Detach this node from whatever event loop it was bound to: fire `Removed` for every
    /// descriptor it still carries (they stay registered on the node itself, only the loop's
    /// poll set forgets them) and drop the fd-changed callback. Called by
    /// [`crate::eventloop::EventLoop::del`].
    pub(crate) fn detach_from_loop(node_rc: &Rc<RefCell<Node>>) {
        let (entries, cb) = {
            let mut n = node_rc.borrow_mut();
            (n.pollfds.clone(), n.fd_changed_cb.take())
        };
        if let Some(mut cb) = cb {
            for entry in &entries {
                cb(entry, FdAction::Removed);
            }
        }
    }

    pub(crate) fn mark_started(node_rc: &Rc<RefCell<Node>>) -> bool {
        let mut n = node_rc.borrow_mut();
        if n.start_event_sent {
            return false;
        }
        n.start_event_sent = true;
        true
    }

    pub(crate) fn take_outbound_dirty(node_rc: &Rc<RefCell<Node>>) -> bool {
        let mut n = node_rc.borrow_mut();
        if !n.outbound.is_empty() && n.outbound_dirty {
            n.outbound_dirty = false;
            true
        } else {
            false
        }
    }

    /// Fail every pending call whose deadline has passed with [`CallStatus::Timeout`]. Scans each
    /// object's queue front-to-back so a still-live call never gets skipped ahead of an expired
    /// one it was submitted after - per-object submission order is preserved even under timeouts.
    pub(crate) fn expire_timeouts(node_rc: &Rc<RefCell<Node>>, now: Instant) {
        let expired = {
            let mut n = node_rc.borrow_mut();
            let mut out = Vec::new();
            for queue in n.pending_calls.values_mut() {
                while matches!(queue.front(), Some(p) if p.deadline.is_some_and(|d| d <= now)) {
                    let pending = queue.pop_front().expect("front matched above");
                    pending.object.dec_pending();
                    out.push(pending.done_cb);
                }
            }
            out
        };
        for done_cb in expired {
            done_cb(CallStatus::Timeout, None);
        }
    }

    /// Drain every buffer the transport has pushed inbound since the last dispatch, matching
    /// each to a pending call (for methods) or to an event sink (for events).
    pub(crate) fn drain_inbound(node_rc: &Rc<RefCell<Node>>) {
        loop {
            let buf = {
                let mut n = node_rc.borrow_mut();
                n.inbound.pop_front()
            };
            let Some(buf) = buf else { break };
            Self::complete_inbound(node_rc, buf);
        }
    }

    fn complete_inbound(node_rc: &Rc<RefCell<Node>>, buf: Buffer) {
        let Some(obj) = buf.object().cloned() else {
            log::warn!("dropping inbound buffer with no bound object");
            node_rc.borrow_mut().pool.release(buf);
            return;
        };
        node_rc.borrow_mut().current_object = Some(obj.clone());
        if obj.is_event() {
            Self::dispatch_event_payload(node_rc, &obj, buf);
        } else {
            let pending = {
                let mut n = node_rc.borrow_mut();
                n.pending_calls.get_mut(&object_key(&obj)).and_then(|q| q.pop_front())
            };
            obj.dec_pending();
            match pending {
                Some(p) => {
                    debug_assert!(Rc::ptr_eq(&p.object, &obj));
                    (p.done_cb)(CallStatus::Completed, Some(buf));
                }
                None => {
                    log::warn!("dropping reply for {} with no matching pending call", obj.name);
                    node_rc.borrow_mut().pool.release(buf);
                }
            }
        }
        node_rc.borrow_mut().current_object = None;
    }

    fn dispatch_event_payload(node_rc: &Rc<RefCell<Node>>, obj: &Rc<Object>, buf: Buffer) {
        let dedicated = node_rc.borrow_mut().event_callbacks.remove(&obj.name);
        if let Some(mut cb) = dedicated {
            cb(buf);
            node_rc.borrow_mut().event_callbacks.insert(obj.name.clone(), cb);
            return;
        }
        let mut n = node_rc.borrow_mut();
        if n.sync_event_max > 0 {
            if n.sync_events.len() >= n.sync_event_max {
                log::warn!("sync event ring full, dropping event for {}", obj.name);
                n.pool.release(buf);
            } else {
                n.sync_events.push_back((obj.clone(), buf));
            }
            return;
        }
        let cb = n.unhandled_evt_cb.take();
        drop(n);
        match cb {
            Some(mut cb) => {
                cb(buf);
                node_rc.borrow_mut().unhandled_evt_cb = Some(cb);
            }
            None => {
                log::warn!("dropping unhandled event for {}", obj.name);
                node_rc.borrow_mut().pool.release(buf);
            }
        }
    }

    /// Close the node: take it offline (failing any in-flight calls), detach it from its loop,
    /// and call the transport's `close` hook.
    pub fn close(&self) {
        self.set_status(NodeStatus::Offline);
        if self.0.borrow().loop_ref.is_some() {
            EventLoop::del(self);
        }
        {
            let mut n = self.0.borrow_mut();
            let mut tr = n.transport.take().expect("transport present up to close");
            let mut ctx = NodeContext { node: &mut n };
            tr.close(&mut ctx);
        }
        Self::drain_deferred(&self.0);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if self.transport.is_some() && self.loop_ref.is_some() {
            // Best-effort: a node dropped without an explicit close() still detaches cleanly from
            // its loop; the transport itself is simply dropped in place since there is no node
            // left to hand a NodeContext over.
            self.loop_ref = None;
        }
    }
}
