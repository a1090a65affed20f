//! Hardware virtualization (VT-x) enablement state.
//!
//! The driver does not run VMX transitions itself; it arbitrates the
//! hardware enable/disable handshake with the kernel through the
//! [`VmxKernel`] facade and keeps the bookkeeping honest across host sleep
//! and wake. The kernel side carries a signed use counter shared with other
//! virtualization clients on the host.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Lowest platform major version with a usable VMX kernel interface.
pub const MIN_PLATFORM_MAJOR: u32 = 10;

/// Platform major version whose kernel leaves CR4.VMXE clear on some CPUs
/// after wake; needs a one-shot force-enable before the first real enable.
pub const ERRATUM_PLATFORM_MAJOR: u32 = 14;

/// Result of the kernel's hardware enable call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmxOutcome {
    Ok,
    /// The CPU or firmware does not support VMX.
    Unsupported,
    /// Another client holds the hardware.
    InUse,
    /// Any other kernel status.
    Error(i32),
}

/// What the driver needs from the kernel's VMX arbitration.
pub trait VmxKernel: Send + Sync {
    fn vmxon(&self) -> VmxOutcome;
    fn vmxoff(&self);
    /// The kernel's signed VMX use counter, shared with other clients.
    fn use_count(&self) -> i32;
    /// Erratum workaround: set the hardware enable bit on every CPU.
    fn force_enable_all_cpus(&self);
}

/// Per-driver VT-x enablement state over a [`VmxKernel`].
pub struct VtxState {
    kernel: Arc<dyn VmxKernel>,
    platform_major: u32,
    erratum_applied: AtomicBool,
}

impl VtxState {
    pub fn new(kernel: Arc<dyn VmxKernel>, platform_major: u32) -> Self {
        Self { kernel, platform_major, erratum_applied: AtomicBool::new(false) }
    }

    /// Enables VMX on the host.
    ///
    /// Gated on the platform version; on the affected major version the
    /// erratum fix-up runs exactly once, before the first enable attempt.
    pub fn enable(&self) -> Result<()> {
        if self.platform_major < MIN_PLATFORM_MAJOR {
            return Err(Error::NotSupported);
        }
        if self.platform_major == ERRATUM_PLATFORM_MAJOR
            && !self.erratum_applied.swap(true, Ordering::AcqRel)
        {
            debug!("applying one-shot CR4.VMXE wake erratum fix");
            self.kernel.force_enable_all_cpus();
        }

        let count = self.kernel.use_count();
        if count < 0 {
            warn!(count, "VMX use counter is negative before enable");
        }

        match self.kernel.vmxon() {
            VmxOutcome::Ok => {
                debug!(count = count + 1, "VMX enabled");
                Ok(())
            }
            VmxOutcome::Unsupported => Err(Error::NotSupported),
            VmxOutcome::InUse => Err(Error::VmxInUse),
            VmxOutcome::Error(rc) => Err(Error::Internal(format!("kernel vmxon failed: {rc}"))),
        }
    }

    /// Disables VMX. The use counter must show at least this client; a
    /// counter below one means enable/disable got out of step, and the
    /// hardware is left untouched.
    pub fn disable(&self) -> Result<()> {
        let count = self.kernel.use_count();
        if count < 1 {
            warn!(count, "VMX disable with no enable outstanding");
            return Err(Error::WrongOrder(format!("VMX use counter is {count} on disable")));
        }
        self.kernel.vmxoff();
        debug!(count = count - 1, "VMX disabled");
        Ok(())
    }

    /// Host-sleep hook for one CPU. Consults the use counter; returns
    /// whether VMX was live and got suspended.
    pub fn suspend_on_cpu(&self) -> bool {
        if self.kernel.use_count() >= 1 {
            self.kernel.vmxoff();
            true
        } else {
            false
        }
    }

    /// Host-wake hook for one CPU. Trusts the flag captured at suspend and
    /// never re-reads the counter, which other clients may have moved while
    /// the host slept.
    pub fn resume_on_cpu(&self, was_suspended: bool) {
        if !was_suspended {
            return;
        }
        if let VmxOutcome::Error(rc) = self.kernel.vmxon() {
            warn!(rc, "VMX resume failed");
        }
    }
}
