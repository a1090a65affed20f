//! Per-process sessions and the global session table.
//!
//! A session is created when a client connection is established, inserted
//! into a fixed-size hash table keyed by pid, and becomes visible for ioctl
//! dispatch only once the first device open for that pid flips `opened`.
//! The table owns one reference; every in-flight ioctl holds another.
//!
//! Locking discipline: the table lock covers hash-chain manipulation only.
//! No call that can block is made while it is held. Reference counting is
//! atomic so `release` can run anywhere; teardown happens outside the lock.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Number of hash buckets. Sessions are few (one per connected process), so
/// a small fixed prime keeps chains short without any allocation under the
/// table lock beyond chain bookkeeping.
pub const SESSION_BUCKETS: usize = 19;

/// Per-client-process state granting ioctl access once opened.
#[derive(Debug)]
pub struct Session {
    pid: u32,
    /// Cookie of the owning driver instance, checked by the IDC entry point.
    cookie: u64,
    /// Kernel (IDC) sessions never enter the hash table.
    kernel: bool,
    refs: AtomicU32,
    opened: AtomicBool,
    unrestricted: AtomicBool,
    uid: AtomicU32,
    gid: AtomicU32,
    destroys: AtomicU32,
}

impl Session {
    /// Creates a user session for `pid`, not yet opened. The creator holds
    /// the initial reference.
    pub fn new(pid: u32, cookie: u64) -> Arc<Self> {
        Arc::new(Self {
            pid,
            cookie,
            kernel: false,
            refs: AtomicU32::new(1),
            opened: AtomicBool::new(false),
            unrestricted: AtomicBool::new(false),
            uid: AtomicU32::new(0),
            gid: AtomicU32::new(0),
            destroys: AtomicU32::new(0),
        })
    }

    /// Creates a kernel (IDC) session: unrestricted, opened, never hashed.
    pub fn new_kernel(cookie: u64) -> Arc<Self> {
        Arc::new(Self {
            pid: 0,
            cookie,
            kernel: true,
            refs: AtomicU32::new(1),
            opened: AtomicBool::new(true),
            unrestricted: AtomicBool::new(true),
            uid: AtomicU32::new(0),
            gid: AtomicU32::new(0),
            destroys: AtomicU32::new(0),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn is_kernel(&self) -> bool {
        self.kernel
    }

    /// Whether the first device open for this pid has completed.
    ///
    /// Readers that observe `true` may rely on uid/gid/unrestricted being
    /// stable for the rest of the session's life.
    pub fn opened(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    pub fn unrestricted(&self) -> bool {
        self.unrestricted.load(Ordering::Relaxed)
    }

    pub fn uid(&self) -> u32 {
        self.uid.load(Ordering::Relaxed)
    }

    pub fn gid(&self) -> u32 {
        self.gid.load(Ordering::Relaxed)
    }

    /// Current protocol reference count (diagnostics).
    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::Relaxed)
    }

    /// How many times teardown ran; must never exceed one.
    pub fn destroy_count(&self) -> u32 {
        self.destroys.load(Ordering::Relaxed)
    }

    /// Adds a reference. Returns the new count.
    pub fn retain(self: &Arc<Self>) -> u32 {
        let refs = self.refs.fetch_add(1, Ordering::Relaxed) + 1;
        debug_assert!(refs > 1, "retain on a dead session");
        refs
    }

    /// Drops a reference; the count reaching zero tears the session down.
    /// Returns the remaining count.
    pub fn release(self: &Arc<Self>) -> u32 {
        let refs = self.refs.fetch_sub(1, Ordering::AcqRel) - 1;
        if refs == 0 {
            self.destroy();
        }
        refs
    }

    fn destroy(&self) {
        let times = self.destroys.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert_eq!(times, 1, "session torn down more than once");
        debug!(pid = self.pid, kernel = self.kernel, "session destroyed");
    }
}

/// Fixed-size chained hash table of user sessions, keyed by pid.
///
/// At most one session per pid can be in the table at any time.
pub struct SessionTable {
    buckets: Mutex<[Vec<Arc<Session>>; SESSION_BUCKETS]>,
    sessions: AtomicUsize,
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(std::array::from_fn(|_| Vec::new())),
            sessions: AtomicUsize::new(0),
        }
    }

    fn bucket_of(pid: u32) -> usize {
        pid as usize % SESSION_BUCKETS
    }

    /// Number of sessions currently in the table.
    pub fn len(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Links a session into its hash chain and takes the table's reference.
    ///
    /// Fails with `AlreadyExists` if a session for the pid is already
    /// chained; there can only be one open session per process.
    pub fn insert(&self, session: &Arc<Session>) -> Result<()> {
        if session.is_kernel() {
            return Err(Error::InvalidParameter("kernel sessions are not hashed".into()));
        }
        let mut buckets = self.buckets.lock().unwrap();
        let chain = &mut buckets[Self::bucket_of(session.pid())];
        if chain.iter().any(|s| s.pid() == session.pid()) {
            warn!(pid = session.pid(), "duplicate session insert");
            return Err(Error::AlreadyExists(session.pid()));
        }
        session.retain();
        chain.insert(0, Arc::clone(session));
        self.sessions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Unlinks the session for `pid` and drops the table's reference.
    ///
    /// Used on connection close; the last reference going away triggers
    /// teardown outside the lock.
    pub fn remove(&self, pid: u32) -> Result<()> {
        let session = {
            let mut buckets = self.buckets.lock().unwrap();
            let chain = &mut buckets[Self::bucket_of(pid)];
            let pos = chain.iter().position(|s| s.pid() == pid).ok_or(Error::InvalidHandle)?;
            self.sessions.fetch_sub(1, Ordering::Relaxed);
            chain.remove(pos)
        };
        session.release();
        Ok(())
    }

    /// Marks the session for `pid` as opened, capturing the credentials and
    /// the device-node class for the life of the session.
    ///
    /// Only one caller can ever see the `opened` transition: the check and
    /// the set happen under the table lock.
    pub fn mark_opened(&self, pid: u32, uid: u32, gid: u32, unrestricted: bool) -> Result<()> {
        let buckets = self.buckets.lock().unwrap();
        let chain = &buckets[Self::bucket_of(pid)];
        let session = chain.iter().find(|s| s.pid() == pid).ok_or(Error::InvalidHandle)?;
        if session.opened() {
            return Err(Error::AlreadyOpened(pid));
        }
        session.uid.store(uid, Ordering::Relaxed);
        session.gid.store(gid, Ordering::Relaxed);
        session.unrestricted.store(unrestricted, Ordering::Relaxed);
        session.opened.store(true, Ordering::Release);
        Ok(())
    }

    /// Finds the opened session matching `pid` and the device-node class and
    /// retains it for the caller. Sessions that have not completed their
    /// first device open are invisible here.
    pub fn lookup_and_retain(&self, pid: u32, unrestricted: bool) -> Option<Arc<Session>> {
        let buckets = self.buckets.lock().unwrap();
        let chain = &buckets[Self::bucket_of(pid)];
        let session = chain
            .iter()
            .find(|s| s.pid() == pid && s.unrestricted() == unrestricted && s.opened())?;
        session.retain();
        Some(Arc::clone(session))
    }
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}
