// SPDX-License-Identifier: BSD-3-Clause

//! A minimal loopback transport: every outbound call buffer is echoed straight back onto the
//! same node's inbound queue, unexamined.
//!
//! This is the fixture the end-to-end test scenarios are written against, and a worked example of
//! the transport contract - not a template for a production transport. It needs no background
//! thread and no framing
//! (`buffer_overhead`/`buffer_offset` are both zero), and goes `ONLINE` synchronously inside
//! `open`, so a node opened against it is immediately usable without a loop dispatch.

use crate::error::Error;
use crate::node::{NodeContext, NodeStatus};
use crate::transport::{NodeEvent, Transport};

pub const NAME: &str = "loopback";

pub fn factory() -> Box<dyn Transport> {
    Box::new(Loopback)
}

pub struct Loopback;

impl Transport for Loopback {
    fn name(&self) -> &str {
        NAME
    }

    fn open(&mut self, ctx: &mut NodeContext, _opts: &str) -> Result<(), Error> {
        ctx.set_status(NodeStatus::Online);
        Ok(())
    }

    fn close(&mut self, _ctx: &mut NodeContext) {}

    fn handle_event(&mut self, ctx: &mut NodeContext, event: NodeEvent) {
        match event {
            NodeEvent::Started => {}
            NodeEvent::HaveOutbound | NodeEvent::Descriptor(_) => {
                while let Some(buf) = ctx.pop_outbound() {
                    ctx.push_inbound(buf);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endian::Endian;
    use crate::error::CallStatus;
    use crate::etable::ExportTableBuilder;
    use crate::node::NodeHandle;
    use crate::transport;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn register() {
        transport::register(NAME, factory);
    }

    #[test]
    fn echoes_a_u32_call() {
        register();
        let node = NodeHandle::open(NAME, "", Endian::host()).unwrap();
        let mut b = ExportTableBuilder::new(1);
        b.add("echo_u32", Some("3"), Some("3"));
        node.install_etable(b);

        let result = Rc::new(RefCell::new(None));
        let r = result.clone();
        node.start_call(
            "echo_u32",
            |w| {
                w.u32(0xDEAD_BEEF);
            },
            move |status, buf| *r.borrow_mut() = Some((status, buf)),
        )
        .unwrap();

        node.ensure_loop().borrow_mut().dispatch();

        let (status, buf) = result.borrow_mut().take().expect("completion ran");
        assert_eq!(status, CallStatus::Completed);
        let mut buf = buf.expect("reply buffer present on success");
        buf.rewind();
        assert_eq!(buf.get_u32(), 0xDEAD_BEEF);
    }
}
