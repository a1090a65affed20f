//! Ioctl dispatch: session lookup, request validation, handler hand-off.
//!
//! Requests arrive on one of two device nodes and take one of three shapes:
//! the argument-only fast path, a kernel-copied inline buffer, or a raw user
//! buffer the engine must copy itself. Validation happens entirely here;
//! the [`RequestHandler`] behind the engine sees only well-formed requests
//! and an already-authenticated session. Errors are translated to the
//! platform errno space exactly once, at this boundary, by the caller.

use std::sync::Arc;

use supdrv_ioc::{
    fast_index, ioctl_dir, ioctl_param_len, ReqHdr, IOC_INOUT, IOC_VOID, REQ_HDR_SIZE,
    REQ_MAX_SIZE,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::{Session, SessionTable};

/// The two device nodes a client can open. The node class is captured at
/// open and checked again on every request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceNode {
    /// Full-privilege node; the only one allowed to use the fast path.
    Unrestricted,
    /// Limited node for unprivileged clients.
    Restricted,
}

impl DeviceNode {
    pub fn unrestricted(self) -> bool {
        matches!(self, DeviceNode::Unrestricted)
    }

    /// Maps a device minor number onto a node. Only minors 0 and 1 exist.
    pub fn from_minor(minor: u32) -> Result<Self> {
        match minor {
            0 => Ok(DeviceNode::Unrestricted),
            1 => Ok(DeviceNode::Restricted),
            other => Err(Error::InvalidParameter(format!("no device node with minor {other}"))),
        }
    }
}

/// Access to a raw user-space buffer on the unbuffered slow path.
///
/// `copy_in` reads from the start of the user buffer; `copy_out` writes
/// back from the start. Either may fail if the user mapping went away.
pub trait UserBuffer {
    fn copy_in(&self, dst: &mut [u8]) -> Result<()>;
    fn copy_out(&mut self, src: &[u8]) -> Result<()>;
}

/// The request payload, by dispatch shape.
pub enum IoctlData<'a> {
    /// Fast-path argument word.
    Fast(u32),
    /// Kernel-copied inline buffer, exactly the command word's inline size.
    Buffered(&'a mut [u8]),
    /// Raw user buffer; the engine does the copying.
    User(&'a mut dyn UserBuffer),
}

/// Where validated requests go. The handler owns request semantics; its
/// status propagates unchanged back to the dispatch boundary.
pub trait RequestHandler: Send + Sync {
    /// A fast-path request; `index` is the position within the reserved
    /// range.
    fn handle_fast(&self, session: &Session, index: u32, arg: u32) -> Result<()>;

    /// A validated slow-path request. `buf` starts with the request header
    /// and is writable; the handler fills in the status slot and any output.
    fn handle(&self, session: &Session, cmd: u32, buf: &mut [u8]) -> Result<()>;
}

/// The dispatch engine, shared by both device nodes.
pub struct Dispatcher {
    sessions: Arc<SessionTable>,
    handler: Arc<dyn RequestHandler>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionTable>, handler: Arc<dyn RequestHandler>) -> Self {
        Self { sessions, handler }
    }

    /// Entry point for every ioctl. Looks up and retains the session for
    /// `pid` on the given node, dispatches, and releases the session on all
    /// exits.
    pub fn ioctl(&self, pid: u32, node: DeviceNode, cmd: u32, data: IoctlData<'_>) -> Result<()> {
        let session = self
            .sessions
            .lookup_and_retain(pid, node.unrestricted())
            .ok_or(Error::InvalidHandle)?;
        let result = self.dispatch(&session, node, cmd, data);
        session.release();
        result
    }

    fn dispatch(
        &self,
        session: &Arc<Session>,
        node: DeviceNode,
        cmd: u32,
        data: IoctlData<'_>,
    ) -> Result<()> {
        if let Some(index) = fast_index(cmd) {
            if node.unrestricted() {
                let IoctlData::Fast(arg) = data else {
                    return Err(Error::InvalidParameter(
                        "fast-path command without an argument word".into(),
                    ));
                };
                return self.handler.handle_fast(session, index, arg);
            }
            debug!(pid = session.pid(), cmd = format_args!("{cmd:#010x}"), "fast path on restricted node");
            // Falls through to slow validation below, which refuses it.
        }

        match data {
            IoctlData::Buffered(buf) => self.slow_buffered(session, cmd, buf),
            IoctlData::User(user) => self.slow_unbuffered(session, cmd, user),
            IoctlData::Fast(_) => {
                Err(Error::InvalidParameter("argument-only data on a slow command".into()))
            }
        }
    }

    /// Slow path, inline buffer: the kernel already copied `buf` in and will
    /// copy it back out; only validation and hand-off happen here.
    fn slow_buffered(&self, session: &Arc<Session>, cmd: u32, buf: &mut [u8]) -> Result<()> {
        if ioctl_dir(cmd) != IOC_INOUT {
            return Err(Error::InvalidParameter(format!(
                "buffered command {cmd:#010x} is not bidirectional"
            )));
        }
        let inline = ioctl_param_len(cmd) as usize;
        if buf.len() != inline {
            return Err(Error::InvalidParameter(format!(
                "buffer is {} bytes, command declares {inline}",
                buf.len()
            )));
        }
        let hdr = ReqHdr::read_from(buf)?;
        hdr.validate()?;
        if hdr.transfer_size() as usize != inline {
            warn!(
                pid = session.pid(),
                cb_in = hdr.cb_in,
                cb_out = hdr.cb_out,
                inline,
                "header sizes disagree with the command word"
            );
            return Err(Error::InvalidParameter(
                "header transfer size disagrees with the command word".into(),
            ));
        }
        self.handler.handle(session, cmd, buf)
    }

    /// Slow path, raw user buffer: header copy-in, full validation with the
    /// transfer bound, scratch allocation with a zeroed tail, execution, and
    /// a clamped copy-out on success only.
    fn slow_unbuffered(
        &self,
        session: &Arc<Session>,
        cmd: u32,
        user: &mut dyn UserBuffer,
    ) -> Result<()> {
        if ioctl_dir(cmd) != IOC_VOID || ioctl_param_len(cmd) != 0 {
            return Err(Error::InvalidParameter(format!(
                "command {cmd:#010x} cannot carry an indirect buffer"
            )));
        }

        let mut hdr_bytes = [0u8; REQ_HDR_SIZE];
        user.copy_in(&mut hdr_bytes)?;
        let hdr = ReqHdr::read_from(&hdr_bytes)?;
        hdr.validate()?;
        let transfer = hdr.transfer_size();
        if transfer > REQ_MAX_SIZE {
            warn!(pid = session.pid(), transfer, "request above the transfer bound");
            return Err(Error::InvalidParameter(format!(
                "transfer of {transfer} bytes exceeds the {REQ_MAX_SIZE} byte bound"
            )));
        }

        // cb_in bytes from the user, zero tail up to the transfer size.
        let mut scratch = vec![0u8; transfer as usize];
        user.copy_in(&mut scratch[..hdr.cb_in as usize])?;
        // The full copy re-read user memory; the handler gets the header
        // that was validated, not whatever it may have changed to since.
        scratch[..REQ_HDR_SIZE].copy_from_slice(&hdr_bytes);

        self.handler.handle(session, cmd, &mut scratch)?;

        // cb_out never exceeds the transfer size, but the copy-out is
        // clamped to the allocation rather than trusting that arithmetic.
        let out = (hdr.cb_out as usize).min(scratch.len());
        user.copy_out(&scratch[..out])
    }
}
