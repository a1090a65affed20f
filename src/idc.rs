//! The kernel-to-kernel (IDC) entry point.
//!
//! Other kernel components attach to the driver without going through a
//! device node. A connect carries a magic cookie and a version range; on
//! success the caller gets a handle wrapping an unrestricted kernel session
//! that never enters the session hash table. Every later call must present
//! a handle minted by this driver instance.

use std::sync::Arc;

use supdrv_ioc::{IDC_CONNECT_COOKIE, IDC_VERSION};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::exports::ExportTable;
use crate::loader::ImageLoader;
use crate::session::Session;

/// An established IDC connection. Holds the kernel session alive until
/// disconnect.
pub struct IdcHandle {
    instance: u64,
    session: Arc<Session>,
}

impl IdcHandle {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

/// One IDC request. Connect is the only call that carries no handle.
pub enum IdcCall<'a> {
    Connect { cookie: u32, min_version: u32, requested_version: u32 },
    Disconnect(IdcHandle),
    GetSymbol { handle: &'a IdcHandle, module: Option<&'a str>, symbol: &'a str },
}

/// Reply to an [`IdcCall`].
pub enum IdcReply {
    Connected { handle: IdcHandle, version: u32 },
    Disconnected,
    Symbol(u64),
}

/// The IDC service half of the driver.
pub struct IdcService {
    instance: u64,
    exports: Arc<ExportTable>,
    loader: Arc<ImageLoader>,
}

impl IdcService {
    pub fn new(instance: u64, exports: Arc<ExportTable>, loader: Arc<ImageLoader>) -> Self {
        Self { instance, exports, loader }
    }

    pub fn call(&self, call: IdcCall<'_>) -> Result<IdcReply> {
        match call {
            IdcCall::Connect { cookie, min_version, requested_version } => {
                self.connect(cookie, min_version, requested_version)
            }
            IdcCall::Disconnect(handle) => {
                self.check_handle(&handle)?;
                handle.session.release();
                debug!("IDC client disconnected");
                Ok(IdcReply::Disconnected)
            }
            IdcCall::GetSymbol { handle, module, symbol } => {
                self.check_handle(handle)?;
                let address = match module {
                    Some(module) => self.loader.query_symbol(module, symbol)?,
                    None => self
                        .exports
                        .resolve(symbol)
                        .ok_or_else(|| Error::SymbolNotFound(symbol.to_string()))?,
                };
                Ok(IdcReply::Symbol(address))
            }
        }
    }

    fn connect(&self, cookie: u32, min_version: u32, requested_version: u32) -> Result<IdcReply> {
        if cookie != IDC_CONNECT_COOKIE {
            warn!(cookie = format_args!("{cookie:#010x}"), "IDC connect with bad cookie");
            return Err(Error::InvalidParameter("bad IDC connect cookie".into()));
        }
        if min_version > requested_version {
            return Err(Error::InvalidParameter("inverted IDC version range".into()));
        }
        // Same-major rule: the requested range must admit our version.
        if min_version >> 16 != IDC_VERSION >> 16 || min_version > IDC_VERSION {
            warn!(
                min = format_args!("{min_version:#010x}"),
                requested = format_args!("{requested_version:#010x}"),
                driver = format_args!("{IDC_VERSION:#010x}"),
                "IDC version mismatch"
            );
            return Err(Error::InvalidParameter(format!(
                "incompatible IDC version; driver speaks {IDC_VERSION:#010x}"
            )));
        }

        let session = Session::new_kernel(self.instance);
        debug!("IDC client connected");
        Ok(IdcReply::Connected {
            handle: IdcHandle { instance: self.instance, session },
            version: IDC_VERSION,
        })
    }

    /// Every call past connect must carry a handle from this instance.
    fn check_handle(&self, handle: &IdcHandle) -> Result<()> {
        if handle.instance != self.instance {
            warn!("IDC handle from another driver instance");
            return Err(Error::InvalidParameter("IDC handle does not belong here".into()));
        }
        Ok(())
    }
}
