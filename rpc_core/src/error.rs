// SPDX-License-Identifier: BSD-3-Clause

use std::fmt;

/// Recoverable errors returned directly to the caller of the API that raised them.
///
/// Structural invariant breaches (buffer overrun, an unknown format token reaching code that
/// assumed it had already been validated, core/transport contract violations) are not part of
/// this enum: they go through [`crate::bug`] instead, because they indicate a programming
/// mistake rather than a condition a caller can recover from.
#[derive(Debug)]
pub enum Error {
    /// The buffer pool could not satisfy a `request()`.
    Oom,
    /// `queue_call`/`start_call` referenced an object id that doesn't exist in the active table.
    InvalidId,
    /// `start_call`/`call`/`set_event_callback` referenced a name absent from the active table.
    InvalidName,
    /// The target object's argument or return format failed to parse.
    FormatInvalid,
    /// A call was submitted while the node was neither online nor in its opening window.
    NotOnline,
    /// A synchronous call was attempted while another one is already running on this node.
    SyncInProgress,
    /// `open()` named a transport that was never registered.
    UnknownTransport(String),
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oom => write!(f, "out of memory allocating a buffer"),
            Self::InvalidId => write!(f, "no such object id in the active export table"),
            Self::InvalidName => write!(f, "no such object name in the active export table"),
            Self::FormatInvalid => write!(f, "object's argument/return format is invalid"),
            Self::NotOnline => write!(f, "node is not online"),
            Self::SyncInProgress => write!(f, "a synchronous call is already in progress on this node"),
            Self::UnknownTransport(name) => write!(f, "no transport registered under name {name:?}"),
        }
    }
}

/// The outcome of a completed (or failed) remote call, delivered to the call's completion
/// callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The peer replied and the return buffer was decoded successfully.
    Completed,
    /// The call's deadline elapsed before a reply arrived.
    Timeout,
    /// The node went offline (or was closed) before the call could complete.
    TransportFail,
}

/// Log a stack dump and abort the process.
///
/// This mirrors the source's `BUG()` discipline: a fired `bug!` always indicates a broken
/// invariant between the core and either a transport or the caller, never a condition a caller
/// could have avoided by checking a return value first.
#[macro_export]
macro_rules! bug {
    ($ctx:expr, $($arg:tt)*) => {{
        let msg = ::std::format!($($arg)*);
        ::log::error!("BUG ({}): {}", $ctx, msg);
        ::log::error!("{:#?}", ::std::backtrace::Backtrace::force_capture());
        ::std::panic!("BUG ({}): {}", $ctx, msg);
    }};
}
