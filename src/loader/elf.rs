//! Materialization of relocatable ELF module images.
//!
//! Modules ship as ELF relocatable objects. Loading lays the allocatable
//! sections out in index order, resolves undefined symbols through the
//! caller-supplied [`SymbolResolver`], and applies the absolute and
//! PC-relative fixups the compiler emitted. The result is the final byte
//! image plus the module's own defined-symbol table.

use std::collections::HashMap;

use object::{
    Object, ObjectKind, ObjectSection, ObjectSymbol, RelocationKind, RelocationTarget, SectionKind,
    SymbolSection,
};
use tracing::debug;

use crate::error::{Error, Result};

/// Section carrying the embedded DER signature block of a signed module.
pub const SIGNATURE_SECTION: &str = ".vbsig";

/// Import resolution strategy; tried in priority order by the loader.
pub trait SymbolResolver {
    /// Resolves `name` to an address, or `None` if this tier has no answer.
    fn resolve(&self, name: &str) -> Option<u64>;
}

/// Placement of one allocatable section within the image.
struct Placement {
    section: usize,
    offset: u64,
    uninitialized: bool,
}

fn is_alloc(kind: SectionKind) -> bool {
    matches!(
        kind,
        SectionKind::Text
            | SectionKind::Data
            | SectionKind::ReadOnlyData
            | SectionKind::ReadOnlyString
            | SectionKind::UninitializedData
    )
}

fn align_up(value: u64, align: u64) -> u64 {
    let align = align.max(1);
    value.div_ceil(align) * align
}

fn layout(file: &object::File<'_>) -> Result<(Vec<Placement>, u64)> {
    let mut placements = Vec::new();
    let mut cursor = 0u64;
    for section in file.sections() {
        if !is_alloc(section.kind()) {
            continue;
        }
        let offset = align_up(cursor, section.align());
        placements.push(Placement {
            section: section.index().0,
            offset,
            uninitialized: section.kind() == SectionKind::UninitializedData,
        });
        cursor = offset + section.size();
    }
    Ok((placements, cursor))
}

/// Parses `data` as a relocatable module and returns its computed in-memory
/// size, before any trust is placed in the bytes.
pub fn image_size(data: &[u8]) -> Result<u64> {
    let file = object::File::parse(data)?;
    if file.kind() != ObjectKind::Relocatable {
        return Err(Error::InvalidParameter("module is not a relocatable object".into()));
    }
    let (_, size) = layout(&file)?;
    Ok(size)
}

/// Extracts the embedded signature block from the [`SIGNATURE_SECTION`]
/// section. Unsigned modules are refused outright.
pub fn signature_der(data: &[u8]) -> Result<Vec<u8>> {
    let file = object::File::parse(data)?;
    let section = file
        .section_by_name(SIGNATURE_SECTION)
        .ok_or_else(|| Error::AccessDenied("module carries no signature section".into()))?;
    Ok(section.data()?.to_vec())
}

/// The byte string covered by the module signature: the contents of every
/// allocatable section, concatenated in section-index order. Uninitialized
/// data carries no bytes and contributes nothing.
pub fn signed_payload(data: &[u8]) -> Result<Vec<u8>> {
    let file = object::File::parse(data)?;
    let mut payload = Vec::new();
    for section in file.sections() {
        if !is_alloc(section.kind()) || section.kind() == SectionKind::UninitializedData {
            continue;
        }
        payload.extend_from_slice(section.data()?);
    }
    Ok(payload)
}

/// Materializes the final image bytes at `base`.
///
/// Returns the image and the module's defined-symbol table (absolute
/// addresses). Any import the resolver cannot answer fails the whole load
/// with `SymbolNotFound`.
pub fn materialize(
    data: &[u8],
    base: u64,
    resolver: &dyn SymbolResolver,
) -> Result<(Vec<u8>, HashMap<String, u64>)> {
    let file = object::File::parse(data)?;
    if file.kind() != ObjectKind::Relocatable {
        return Err(Error::InvalidParameter("module is not a relocatable object".into()));
    }
    let (placements, total) = layout(&file)?;
    let by_section: HashMap<usize, u64> =
        placements.iter().map(|p| (p.section, p.offset)).collect();

    // Resolve every symbol up front; imports go through the resolver tiers,
    // defined symbols get their placed address.
    let mut values: HashMap<usize, u64> = HashMap::new();
    let mut defined: HashMap<String, u64> = HashMap::new();
    for symbol in file.symbols() {
        let name = symbol.name().unwrap_or_default();
        if symbol.is_undefined() {
            if name.is_empty() {
                continue;
            }
            let value = resolver
                .resolve(name)
                .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;
            values.insert(symbol.index().0, value);
            debug!(symbol = name, value = format_args!("{value:#x}"), "import resolved");
        } else if let SymbolSection::Section(section) = symbol.section() {
            if let Some(&offset) = by_section.get(&section.0) {
                let value = base + offset + symbol.address();
                values.insert(symbol.index().0, value);
                if !name.is_empty() {
                    defined.insert(name.to_string(), value);
                }
            }
        }
    }

    // Copy section contents; uninitialized data stays zero.
    let mut image = vec![0u8; total as usize];
    for placement in &placements {
        if placement.uninitialized {
            continue;
        }
        let section = file.section_by_index(object::SectionIndex(placement.section))?;
        let data = section.data()?;
        let start = placement.offset as usize;
        image[start..start + data.len()].copy_from_slice(data);
    }

    // Apply fixups. Relocation records are not covered by the image
    // signature, so their offsets stay hostile even in a verified module
    // and every write is bounds-checked against the image.
    for placement in &placements {
        let section = file.section_by_index(object::SectionIndex(placement.section))?;
        for (offset, relocation) in section.relocations() {
            let target = match relocation.target() {
                RelocationTarget::Symbol(index) => {
                    *values.get(&index.0).ok_or_else(|| {
                        let name = file
                            .symbol_by_index(index)
                            .and_then(|s| s.name().map(str::to_string))
                            .unwrap_or_else(|_| format!("#{}", index.0));
                        Error::SymbolNotFound(name)
                    })?
                }
                RelocationTarget::Section(index) => {
                    base + by_section.get(&index.0).copied().unwrap_or_default()
                }
                _ => 0,
            };
            let addend = relocation.addend();
            let place = placement
                .offset
                .checked_add(offset)
                .ok_or_else(|| bad_reloc_offset(offset))?;
            let at = usize::try_from(place).map_err(|_| bad_reloc_offset(offset))?;
            match (relocation.kind(), relocation.size()) {
                (RelocationKind::Absolute, 64) => {
                    let value = (target as i64).wrapping_add(addend) as u64;
                    write_fixup(&mut image, at, &value.to_le_bytes(), offset)?;
                }
                (RelocationKind::Absolute, 32) => {
                    let value = (target as i64).wrapping_add(addend) as u32;
                    write_fixup(&mut image, at, &value.to_le_bytes(), offset)?;
                }
                (RelocationKind::Relative, 32) => {
                    let from = base.wrapping_add(place);
                    let value = (target as i64).wrapping_add(addend).wrapping_sub(from as i64) as i32;
                    write_fixup(&mut image, at, &value.to_le_bytes(), offset)?;
                }
                (kind, size) => {
                    return Err(Error::InvalidParameter(format!(
                        "unsupported relocation {kind:?}/{size} at {offset:#x}"
                    )));
                }
            }
        }
    }

    Ok((image, defined))
}

fn bad_reloc_offset(offset: u64) -> Error {
    Error::InvalidParameter(format!("relocation at {offset:#x} falls outside the image"))
}

fn write_fixup(image: &mut [u8], at: usize, bytes: &[u8], offset: u64) -> Result<()> {
    let end = at
        .checked_add(bytes.len())
        .filter(|&end| end <= image.len())
        .ok_or_else(|| bad_reloc_offset(offset))?;
    image[at..end].copy_from_slice(bytes);
    Ok(())
}
