// SPDX-License-Identifier: BSD-3-Clause

//! Export tables: the name-indexed catalogue of remote objects (methods and events) a node can
//! call into or receive from.

use std::cell::Cell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::bug;
use crate::format::Format;

/// A single exported method or event.
///
/// `id` is the object's position within the table that created it. Ids are *not* durable across
/// table activations (a node may install a new table at runtime); callers that need to survive a
/// migration should resolve by name, or hold onto the `Rc<Object>` itself, as the call engine
/// does for in-flight calls.
pub struct Object {
    pub id: u32,
    pub name: String,
    pub arg_fmt_src: Option<String>,
    pub ret_fmt_src: Option<String>,
    pub arg_fmt: Option<Format>,
    pub ret_fmt: Option<Format>,
    pub valid: bool,
    pending: Cell<u32>,
}

impl Object {
    /// Events carry no argument format at all (as opposed to a zero-arity one); they can never be
    /// targets of `queue_call`/`start_call`, only of `handle_event`'s inbound dispatch.
    pub fn is_event(&self) -> bool {
        self.arg_fmt_src.is_none()
    }

    pub fn is_method(&self) -> bool {
        !self.is_event()
    }

    pub fn arg_len(&self) -> usize {
        self.arg_fmt.as_ref().map_or(0, |f| f.byte_len)
    }

    pub fn ret_len(&self) -> usize {
        self.ret_fmt.as_ref().map_or(0, |f| f.byte_len)
    }

    pub fn num_args(&self) -> usize {
        self.arg_fmt.as_ref().map_or(0, |f| f.arity())
    }

    pub fn num_rets(&self) -> usize {
        self.ret_fmt.as_ref().map_or(0, |f| f.arity())
    }

    /// Number of calls against this object currently awaiting completion.
    pub fn pending(&self) -> u32 {
        self.pending.get()
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.set(self.pending.get() + 1);
    }

    pub(crate) fn dec_pending(&self) {
        self.pending.set(self.pending.get().saturating_sub(1));
    }
}

struct RawObject {
    name: String,
    arg_fmt_src: Option<String>,
    ret_fmt_src: Option<String>,
}

/// Accumulates objects before a table is made active. Modeled separately from [`ExportTable`]
/// because names must be finalized (and checked for uniqueness) before format strings are parsed
/// and ids are handed out.
pub struct ExportTableBuilder {
    objects: Vec<RawObject>,
    names: HashMap<String, ()>,
}

impl ExportTableBuilder {
    pub fn new(capacity: usize) -> Self {
        ExportTableBuilder { objects: Vec::with_capacity(capacity), names: HashMap::with_capacity(capacity) }
    }

    /// Register an object. `arg_fmt`/`ret_fmt` of `None` marks an event; `Some("")` marks a
    /// zero-argument method. Returns the id the object will be assigned once activated.
    ///
    /// Duplicate names within the same table are a caller bug, not a recoverable condition: two
    /// objects answering to the same name can never be resolved unambiguously.
    pub fn add(&mut self, name: &str, arg_fmt: Option<&str>, ret_fmt: Option<&str>) -> u32 {
        if self.names.insert(name.to_string(), ()).is_some() {
            bug!("etable", "duplicate object name {name:?}");
        }
        self.objects.push(RawObject {
            name: name.to_string(),
            arg_fmt_src: arg_fmt.map(str::to_string),
            ret_fmt_src: ret_fmt.map(str::to_string),
        });
        (self.objects.len() - 1) as u32
    }

    /// Parse every object's format strings and freeze the table.
    pub fn activate(self) -> ExportTable {
        let mut objects = Vec::with_capacity(self.objects.len());
        let mut by_name = HashMap::with_capacity(self.objects.len());
        for (idx, raw) in self.objects.into_iter().enumerate() {
            let arg_fmt = raw.arg_fmt_src.as_deref().map(Format::parse);
            let ret_fmt = raw.ret_fmt_src.as_deref().map(Format::parse);
            let valid = arg_fmt.as_ref().map_or(true, Result::is_ok) && ret_fmt.as_ref().map_or(true, Result::is_ok);
            let object = Rc::new(Object {
                id: idx as u32,
                name: raw.name.clone(),
                arg_fmt_src: raw.arg_fmt_src,
                ret_fmt_src: raw.ret_fmt_src,
                arg_fmt: arg_fmt.and_then(Result::ok),
                ret_fmt: ret_fmt.and_then(Result::ok),
                valid,
                pending: Cell::new(0),
            });
            by_name.insert(raw.name, idx as u32);
            objects.push(object);
        }
        ExportTable { objects, by_name }
    }
}

/// An activated, immutable export table.
pub struct ExportTable {
    objects: Vec<Rc<Object>>,
    by_name: HashMap<String, u32>,
}

impl ExportTable {
    pub fn find_by_name(&self, name: &str) -> Option<Rc<Object>> {
        self.by_name.get(name).map(|&id| self.objects[id as usize].clone())
    }

    pub fn find_by_id(&self, id: u32) -> Option<Rc<Object>> {
        self.objects.get(id as usize).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn objects(&self) -> impl Iterator<Item = &Rc<Object>> {
        self.objects.iter()
    }
}

/// Whether an object surviving a table migration is compatible enough with its predecessor that
/// in-flight bookkeeping keyed on it can keep working: same arity and wire length on both sides.
/// The exact token sequence is allowed to differ (e.g. swapping `1` for `6` changes signedness
/// but not shape), matching the migration note carried over from the source.
pub fn formats_compatible(old: &Object, new: &Object) -> bool {
    old.is_event() == new.is_event()
        && old.arg_len() == new.arg_len()
        && old.ret_len() == new.ret_len()
        && old.num_args() == new.num_args()
        && old.num_rets() == new.num_rets()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_ids_in_insertion_order() {
        let mut b = ExportTableBuilder::new(4);
        let ping = b.add("ping", None, Some("1"));
        let echo = b.add("echo_u32", Some("3"), Some("3"));
        assert_eq!(ping, 0);
        assert_eq!(echo, 1);
    }

    #[test]
    fn activation_parses_formats_and_flags_events() {
        let mut b = ExportTableBuilder::new(4);
        b.add("ping", None, Some("1"));
        b.add("noargs_func", Some(""), Some(""));
        let table = b.activate();
        let ping = table.find_by_name("ping").unwrap();
        assert!(ping.is_event());
        assert_eq!(ping.ret_len(), 1);
        let noargs = table.find_by_name("noargs_func").unwrap();
        assert!(noargs.is_method());
        assert_eq!(noargs.num_args(), 0);
    }

    #[test]
    #[should_panic(expected = "BUG")]
    fn duplicate_names_are_fatal() {
        let mut b = ExportTableBuilder::new(4);
        b.add("echo_u32", Some("3"), Some("3"));
        b.add("echo_u32", Some("3"), Some("3"));
    }

    #[test]
    fn malformed_format_marks_object_invalid_without_panicking() {
        let mut b = ExportTableBuilder::new(1);
        b.add("broken", Some("s32"), Some("1"));
        let table = b.activate();
        assert!(!table.find_by_name("broken").unwrap().valid);
    }

    #[test]
    fn compatible_requires_matching_shape() {
        let mut b1 = ExportTableBuilder::new(1);
        b1.add("echo_u32", Some("3"), Some("3"));
        let t1 = b1.activate();
        let mut b2 = ExportTableBuilder::new(1);
        b2.add("echo_u32", Some("8"), Some("3"));
        let t2 = b2.activate();
        let old = t1.find_by_name("echo_u32").unwrap();
        let new = t2.find_by_name("echo_u32").unwrap();
        assert!(formats_compatible(&old, &new));

        let mut b3 = ExportTableBuilder::new(1);
        b3.add("echo_u32", Some("33"), Some("3"));
        let t3 = b3.activate();
        let mismatched = t3.find_by_name("echo_u32").unwrap();
        assert!(!formats_compatible(&old, &mismatched));
    }
}
