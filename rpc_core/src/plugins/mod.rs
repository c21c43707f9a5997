// SPDX-License-Identifier: BSD-3-Clause

//! The plugin index: where production binaries register every transport they ship with.
//!
//! The source relies on constructor-style static initializers (`AURA_TRANSPORT()`) to populate
//! the transport registry before `main` runs. This crate does the registering explicitly instead
//! - call [`register_builtin`] once, early in `main`, rather than depending on initializer
//! ordering across translation units.

pub mod loopback;

use crate::transport;

/// Register every transport this crate ships in tree. Currently just the loopback/echo
/// reference transport; real deployments additionally call `transport::register` for whatever
/// USB/UART/DSP transport crate they link against, which this crate never does for them.
pub fn register_builtin() {
    transport::register(loopback::NAME, loopback::factory);
}
