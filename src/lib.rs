//! Host support driver core.
//!
//! The portable heart of a hypervisor's ring-0 support driver: per-process
//! session accounting, the two-node ioctl dispatch protocol, a signed
//! loadable-module pipeline with certificate-chain verification, hardware
//! virtualization (VT-x) enablement bookkeeping, and the kernel-to-kernel
//! IDC attach surface. Platform glue (device nodes, memory copies, the VMX
//! kernel interface) stays behind the [`dispatch::UserBuffer`],
//! [`dispatch::RequestHandler`] and [`vtx::VmxKernel`] traits so the whole
//! core runs and tests in user space.
//!
//! The wire formats shared with ring-3 clients live in the
//! [`supdrv_ioc`] crate.
//!
//! ```no_run
//! use std::sync::Arc;
//! use supdrv::{Driver, DriverConfig, ExportTable, TrustStore};
//! # use supdrv::dispatch::RequestHandler;
//! # use supdrv::vtx::VmxKernel;
//! # fn wire(kernel: Arc<dyn VmxKernel>, handler: Arc<dyn RequestHandler>) {
//! let driver = Driver::new(
//!     DriverConfig::default(),
//!     Arc::new(TrustStore::empty()),
//!     kernel,
//!     handler,
//!     ExportTable::new(),
//! );
//! driver.connect(std::process::id()).unwrap();
//! # }
//! ```

pub mod dispatch;
pub mod driver;
pub mod error;
pub mod exports;
pub mod idc;
pub mod loader;
pub mod session;
pub mod truststore;
pub mod vtx;

pub use dispatch::{DeviceNode, IoctlData};
pub use driver::{Driver, DriverConfig};
pub use error::{Error, Result};
pub use exports::ExportTable;
pub use idc::{IdcCall, IdcReply};
pub use loader::{ImageLoader, ImageVerifier};
pub use session::{Session, SessionTable};
pub use truststore::TrustStore;
pub use vtx::{VmxOutcome, VtxState};
