//! The assembled support driver instance.
//!
//! [`Driver`] wires the session table, dispatch engine, image loader, trust
//! store, VT-x state and IDC service together behind the lifecycle the
//! platform glue calls into: connect on client attach, open on the first
//! device open, ioctl for requests, close on detach.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use crate::dispatch::{DeviceNode, Dispatcher, IoctlData, RequestHandler};
use crate::error::{Error, Result};
use crate::exports::ExportTable;
use crate::idc::{IdcCall, IdcReply, IdcService};
use crate::loader::{ImageLoader, ImageVerifier};
use crate::session::{Session, SessionTable};
use crate::truststore::TrustStore;
use crate::vtx::{VmxKernel, VtxState};

/// Construction-time knobs; the driver takes no configuration after this.
pub struct DriverConfig {
    /// Host platform major version, gating VT-x and the wake erratum fix.
    pub platform_major: u32,
    /// How many module images may be loaded at once.
    pub max_images: usize,
    /// Extra trust anchors consulted after the main store.
    pub supplemental_trust: Option<Arc<TrustStore>>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self { platform_major: 12, max_images: 32, supplemental_trust: None }
    }
}

/// One driver instance.
pub struct Driver {
    cookie: u64,
    sessions: Arc<SessionTable>,
    exports: Arc<ExportTable>,
    loader: Arc<ImageLoader>,
    vtx: VtxState,
    dispatcher: Dispatcher,
    idc: IdcService,
}

impl Driver {
    pub fn new(
        config: DriverConfig,
        trust: Arc<TrustStore>,
        kernel: Arc<dyn VmxKernel>,
        handler: Arc<dyn RequestHandler>,
        exports: ExportTable,
    ) -> Self {
        let cookie = instance_cookie();
        let sessions = Arc::new(SessionTable::new());
        let exports = Arc::new(exports);
        let verifier = ImageVerifier::new(trust, config.supplemental_trust.clone());
        let loader = Arc::new(ImageLoader::new(verifier, Arc::clone(&exports), config.max_images));
        let vtx = VtxState::new(kernel, config.platform_major);
        let dispatcher = Dispatcher::new(Arc::clone(&sessions), handler);
        let idc = IdcService::new(cookie, Arc::clone(&exports), Arc::clone(&loader));
        info!(
            cookie = format_args!("{cookie:#018x}"),
            platform_major = config.platform_major,
            exports = exports.len(),
            "driver instance up"
        );
        Self { cookie, sessions, exports, loader, vtx, dispatcher, idc }
    }

    /// Instance cookie carried by every session this driver mints.
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    // ---- client lifecycle -------------------------------------------------

    /// Client attach: creates the session for `pid` and hands ownership to
    /// the table. The session stays invisible to dispatch until `open`.
    pub fn connect(&self, pid: u32) -> Result<()> {
        let session = Session::new(pid, self.cookie);
        self.sessions.insert(&session)?;
        session.release();
        debug!(pid, "client connected");
        Ok(())
    }

    /// First device open for `pid`. `requestor` is the pid actually calling;
    /// opening someone else's session is refused. The node class and
    /// credentials are captured once, for the life of the session.
    pub fn open(&self, pid: u32, requestor: u32, node: DeviceNode, uid: u32, gid: u32) -> Result<()> {
        if pid != requestor {
            return Err(Error::InvalidParameter(format!(
                "pid {requestor} cannot open the session of pid {pid}"
            )));
        }
        self.sessions.mark_opened(pid, uid, gid, node.unrestricted())?;
        debug!(pid, uid, gid, unrestricted = node.unrestricted(), "session opened");
        Ok(())
    }

    /// Client detach: unlinks the session; the table's reference going away
    /// tears it down once in-flight requests have drained.
    pub fn close(&self, pid: u32) -> Result<()> {
        self.sessions.remove(pid)?;
        debug!(pid, "client disconnected");
        Ok(())
    }

    // ---- request entry points ---------------------------------------------

    /// Dispatches one ioctl. See [`Dispatcher::ioctl`].
    pub fn ioctl(&self, pid: u32, node: DeviceNode, cmd: u32, data: IoctlData<'_>) -> Result<()> {
        self.dispatcher.ioctl(pid, node, cmd, data)
    }

    /// The native boundary: same dispatch, status folded onto the platform
    /// errno space. This is the only place errors are translated.
    pub fn ioctl_native(&self, pid: u32, node: DeviceNode, cmd: u32, data: IoctlData<'_>) -> i32 {
        match self.ioctl(pid, node, cmd, data) {
            Ok(()) => 0,
            Err(err) => err.to_errno(),
        }
    }

    /// The kernel-to-kernel entry point.
    pub fn idc(&self, call: IdcCall<'_>) -> Result<IdcReply> {
        self.idc.call(call)
    }

    // ---- component access -------------------------------------------------

    pub fn loader(&self) -> &Arc<ImageLoader> {
        &self.loader
    }

    pub fn vtx(&self) -> &VtxState {
        &self.vtx
    }

    pub fn exports(&self) -> &Arc<ExportTable> {
        &self.exports
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn instance_cookie() -> u64 {
    // Uniqueness per instance is what matters here, not unpredictability.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    nanos ^ ((std::process::id() as u64) << 32)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullKernel;
    impl VmxKernel for NullKernel {
        fn vmxon(&self) -> crate::vtx::VmxOutcome {
            crate::vtx::VmxOutcome::Ok
        }
        fn vmxoff(&self) {}
        fn use_count(&self) -> i32 {
            0
        }
        fn force_enable_all_cpus(&self) {}
    }

    struct Accept;
    impl RequestHandler for Accept {
        fn handle_fast(&self, _s: &Session, _i: u32, _a: u32) -> Result<()> {
            Ok(())
        }
        fn handle(&self, _s: &Session, _c: u32, _b: &mut [u8]) -> Result<()> {
            Ok(())
        }
    }

    fn driver() -> Driver {
        Driver::new(
            DriverConfig::default(),
            Arc::new(TrustStore::empty()),
            Arc::new(NullKernel),
            Arc::new(Accept),
            ExportTable::new(),
        )
    }

    #[test]
    fn lifecycle_connect_open_close() {
        let d = driver();
        d.connect(10).unwrap();
        assert_eq!(d.session_count(), 1);

        // Connecting the same pid again is a duplicate.
        assert!(matches!(d.connect(10), Err(Error::AlreadyExists(10))));

        d.open(10, 10, DeviceNode::Unrestricted, 0, 0).unwrap();
        assert!(matches!(
            d.open(10, 10, DeviceNode::Unrestricted, 0, 0),
            Err(Error::AlreadyOpened(10))
        ));

        d.close(10).unwrap();
        assert_eq!(d.session_count(), 0);
        assert!(matches!(d.close(10), Err(Error::InvalidHandle)));
    }

    #[test]
    fn open_requires_the_owning_pid() {
        let d = driver();
        d.connect(10).unwrap();
        let err = d.open(10, 11, DeviceNode::Unrestricted, 0, 0);
        assert!(matches!(err, Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn minor_numbers_map_to_nodes() {
        assert!(DeviceNode::from_minor(0).unwrap().unrestricted());
        assert!(!DeviceNode::from_minor(1).unwrap().unrestricted());
        assert!(DeviceNode::from_minor(2).is_err());
    }

    #[test]
    fn native_boundary_translates_to_errno() {
        let d = driver();
        // No session: InvalidHandle, EINVAL at the native boundary.
        let rc = d.ioctl_native(99, DeviceNode::Unrestricted, supdrv_ioc::fast_cmd(0), IoctlData::Fast(0));
        assert_eq!(rc, libc::EINVAL);

        d.connect(99).unwrap();
        d.open(99, 99, DeviceNode::Unrestricted, 0, 0).unwrap();
        let rc = d.ioctl_native(99, DeviceNode::Unrestricted, supdrv_ioc::fast_cmd(0), IoctlData::Fast(0));
        assert_eq!(rc, 0);
    }
}
