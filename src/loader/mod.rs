//! The signed module image loader.
//!
//! Loading a module is a staged pipeline: read the candidate file with a
//! bounded double read, verify its embedded signature against the trust
//! store, lay it out and resolve its imports, then cross-check the bytes a
//! ring-3 loader computed for the same module. Only after the parity check
//! passes is the image queryable; any failure along the way releases
//! everything acquired so far.

pub mod elf;
pub mod verify;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::exports::ExportTable;

pub use elf::{SymbolResolver, SIGNATURE_SECTION};
pub use verify::{ImageVerifier, SignatureBlock};

/// Upper bound on the on-disk size of a candidate module file.
pub const MAX_FILE_SIZE: u64 = 32 * 1024 * 1024;

/// Base address handed to the first loaded image; later images follow,
/// page-aligned.
const IMAGE_BASE_START: u64 = 0x8000_0000;

const PAGE: u64 = 0x1000;

/// How many bytes of context the parity failure report shows around the
/// first divergence.
const PARITY_DUMP_BYTES: usize = 64;

// ---------------------------------------------------------------------------
// Loaded images
// ---------------------------------------------------------------------------

/// Lifecycle of a module image. Failures collapse back to `Unloaded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageState {
    Unloaded,
    Opened,
    Verified,
    Allocated,
    Loaded,
}

/// One module image tracked by the loader.
#[derive(Debug)]
pub struct LoadedImage {
    name: String,
    base: u64,
    state: ImageState,
    image: Vec<u8>,
    symbols: HashMap<String, u64>,
}

impl LoadedImage {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn state(&self) -> ImageState {
        self.state
    }

    pub fn size(&self) -> usize {
        self.image.len()
    }
}

// ---------------------------------------------------------------------------
// Import resolution
// ---------------------------------------------------------------------------

impl SymbolResolver for ExportTable {
    fn resolve(&self, name: &str) -> Option<u64> {
        ExportTable::resolve(self, name)
    }
}

/// Two-tier import resolution: the privileged companion module's symbols
/// first, so it may shadow driver entry points such as the logging and
/// assertion hooks, then the driver export table.
struct TieredResolver {
    shadow: HashMap<String, u64>,
    exports: Arc<ExportTable>,
}

impl SymbolResolver for TieredResolver {
    fn resolve(&self, name: &str) -> Option<u64> {
        self.shadow.get(name).copied().or_else(|| self.exports.resolve(name))
    }
}

// ---------------------------------------------------------------------------
// The loader
// ---------------------------------------------------------------------------

/// Registry of module images plus the machinery to admit new ones.
pub struct ImageLoader {
    verifier: ImageVerifier,
    exports: Arc<ExportTable>,
    inner: Mutex<LoaderInner>,
    max_images: usize,
}

struct LoaderInner {
    images: Vec<LoadedImage>,
    companion: Option<String>,
    next_base: u64,
}

impl ImageLoader {
    pub fn new(verifier: ImageVerifier, exports: Arc<ExportTable>, max_images: usize) -> Self {
        Self {
            verifier,
            exports,
            inner: Mutex::new(LoaderInner {
                images: Vec::new(),
                companion: None,
                next_base: IMAGE_BASE_START,
            }),
            max_images,
        }
    }

    /// Reads a candidate file with the size bound enforced before and after,
    /// then reads it a second time and insists both passes saw the same
    /// bytes. A file changing underneath the load is refused.
    pub fn read_module_file(path: &Path) -> Result<Vec<u8>> {
        let meta = fs::metadata(path)?;
        if meta.len() > MAX_FILE_SIZE {
            return Err(Error::InvalidParameter(format!(
                "module file is {} bytes, above the {} byte cap",
                meta.len(),
                MAX_FILE_SIZE
            )));
        }
        let first = fs::read(path)?;
        if first.len() as u64 > MAX_FILE_SIZE {
            return Err(Error::InvalidParameter("module file grew past the size cap".into()));
        }
        let second = fs::read(path)?;
        if first != second {
            warn!(path = %path.display(), "module file changed between reads");
            return Err(Error::AccessDenied("module file changed while being read".into()));
        }
        Ok(first)
    }

    /// Opens a module from a file on disk. See [`ImageLoader::open`].
    pub fn open_file(&self, name: &str, path: &Path, expected_size: u64) -> Result<u64> {
        let data = Self::read_module_file(path)?;
        self.open(name, &data, expected_size)
    }

    /// Admits a module image: verifies its signature, checks the computed
    /// image size against what the ring-3 loader expects, resolves imports
    /// and materializes the bytes. Returns the image base address.
    ///
    /// The image still awaits its parity check; symbols are not queryable
    /// until [`ImageLoader::load_parity_check`] has passed.
    pub fn open(&self, name: &str, data: &[u8], expected_size: u64) -> Result<u64> {
        check_module_name(name)?;
        if data.len() as u64 > MAX_FILE_SIZE {
            return Err(Error::InvalidParameter("module data exceeds the size cap".into()));
        }
        debug!(image = name, bytes = data.len(), "module open");

        // Nothing in the file is trusted until the signature checks out.
        let signature = elf::signature_der(data)?;
        let payload = elf::signed_payload(data)?;
        self.verifier.verify(name, &payload, &signature)?;

        let size = elf::image_size(data)?;
        if size != expected_size {
            warn!(image = name, computed = size, expected = expected_size, "image size mismatch");
            return Err(Error::LoaderMismatch(format!(
                "'{name}': computed image size {size} differs from expected {expected_size}"
            )));
        }

        let mut inner = self.inner.lock().unwrap();
        if inner.images.iter().any(|i| i.name == name) {
            return Err(Error::AlreadyLoaded(name.to_string()));
        }
        if inner.images.len() >= self.max_images {
            return Err(Error::OutOfResources(format!(
                "image table is full ({} images)",
                self.max_images
            )));
        }

        let resolver = TieredResolver {
            shadow: inner
                .companion
                .as_deref()
                .and_then(|c| inner.images.iter().find(|i| i.name == c))
                .map(|i| i.symbols.clone())
                .unwrap_or_default(),
            exports: Arc::clone(&self.exports),
        };
        let base = inner.next_base;
        let (image, symbols) = elf::materialize(data, base, &resolver)?;

        inner.next_base = base + (image.len() as u64).div_ceil(PAGE).max(1) * PAGE;
        inner.images.push(LoadedImage {
            name: name.to_string(),
            base,
            state: ImageState::Allocated,
            image,
            symbols,
        });
        info!(image = name, base = format_args!("{base:#x}"), size, "module image admitted");
        Ok(base)
    }

    /// Compares the bytes the ring-3 loader produced against the image
    /// materialized here. On the first divergent byte the load fails with a
    /// report quoting up to [`PARITY_DUMP_BYTES`] bytes around the
    /// divergence, and the image is released. On success the image becomes
    /// queryable.
    pub fn load_parity_check(&self, name: &str, ring3: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .images
            .iter()
            .position(|i| i.name == name)
            .ok_or_else(|| Error::SymbolNotFound(format!("module '{name}' is not open")))?;
        let image = &mut inner.images[pos];
        if image.state != ImageState::Allocated {
            return Err(Error::WrongOrder(format!(
                "parity check on '{name}' in state {:?}",
                image.state
            )));
        }

        let failure = if ring3.len() != image.image.len() {
            Some(format!(
                "'{name}': ring-3 image is {} bytes, kernel image is {} bytes",
                ring3.len(),
                image.image.len()
            ))
        } else {
            first_mismatch(&image.image, ring3).map(|at| {
                format!(
                    "'{name}': images diverge at offset {at:#x}; kernel bytes: {}",
                    hex_window(&image.image, at)
                )
            })
        };

        if let Some(report) = failure {
            warn!(image = name, "load parity check failed");
            inner.images.remove(pos);
            return Err(Error::LoaderMismatch(report));
        }

        image.state = ImageState::Loaded;
        info!(image = name, "module loaded");
        Ok(image.base)
    }

    /// Resolves a symbol defined by a loaded module image.
    pub fn query_symbol(&self, name: &str, symbol: &str) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let image = inner
            .images
            .iter()
            .find(|i| i.name == name && i.state == ImageState::Loaded)
            .ok_or_else(|| Error::SymbolNotFound(format!("module '{name}' is not loaded")))?;
        image
            .symbols
            .get(symbol)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound(format!("{name}!{symbol}")))
    }

    /// Releases a module image and its resources.
    pub fn unload(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let pos = inner
            .images
            .iter()
            .position(|i| i.name == name)
            .ok_or(Error::InvalidHandle)?;
        inner.images.remove(pos);
        if inner.companion.as_deref() == Some(name) {
            inner.companion = None;
        }
        info!(image = name, "module unloaded");
        Ok(())
    }

    /// Designates a loaded image as the privileged companion module whose
    /// symbols shadow the export table for subsequent loads.
    pub fn set_companion(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.images.iter().any(|i| i.name == name && i.state == ImageState::Loaded) {
            return Err(Error::InvalidHandle);
        }
        inner.companion = Some(name.to_string());
        Ok(())
    }

    /// Number of images currently tracked.
    pub fn image_count(&self) -> usize {
        self.inner.lock().unwrap().images.len()
    }

    /// The state of a tracked image, `Unloaded` if unknown.
    pub fn image_state(&self, name: &str) -> ImageState {
        self.inner
            .lock()
            .unwrap()
            .images
            .iter()
            .find(|i| i.name == name)
            .map(|i| i.state)
            .unwrap_or(ImageState::Unloaded)
    }
}

fn check_module_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > supdrv_ioc::LDR_NAME_MAX {
        return Err(Error::InvalidParameter(format!("bad module name length {}", name.len())));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
        return Err(Error::InvalidParameter(format!("bad module name '{name}'")));
    }
    Ok(())
}

fn first_mismatch(a: &[u8], b: &[u8]) -> Option<usize> {
    a.iter().zip(b).position(|(x, y)| x != y)
}

/// A hex dump of up to [`PARITY_DUMP_BYTES`] bytes centered on `at`.
fn hex_window(data: &[u8], at: usize) -> String {
    let start = at.saturating_sub(PARITY_DUMP_BYTES / 2);
    let end = (start + PARITY_DUMP_BYTES).min(data.len());
    let mut out = String::with_capacity((end - start) * 3);
    for (i, byte) in data[start..end].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        // Cannot fail when writing into a String.
        let _ = write!(out, "{byte:02x}");
    }
    out
}
