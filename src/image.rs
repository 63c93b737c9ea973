//! read access to the image that holds the code being rewritten, and the section handed back.
use crate::addr::{AddrRange, NewAddr, OrigAddr};
use crate::error::InitError;
use goblin::pe::{section_table::IMAGE_SCN_MEM_EXECUTE, PE};
use log::debug;
use std::fmt;
use std::path::Path;

/// section alignment assumed when the image does not state one.
pub const DEFAULT_ALIGNMENT: u32 = 0x1000;

/// the parts of a source image the session needs.
pub trait ImageView {
    /// bytes of `range`, only if it lies entirely inside one executable region.
    fn code_bytes(&self, range: AddrRange) -> Option<&[u8]>;

    /// first aligned address past every mapped section, where a new section would go.
    fn next_section_address(&self) -> NewAddr;
}

/// an executable region, mapped bytes included.
#[derive(Debug, Clone)]
struct Region {
    begin: OrigAddr,
    bytes: Vec<u8>,
}

impl Region {
    fn slice(&self, range: AddrRange) -> Option<&[u8]> {
        let start = range.begin.offset_from(self.begin)? as usize;
        let end = start.checked_add(range.len() as usize)?;
        self.bytes.get(start..end)
    }
}

fn align_up(value: u64, alignment: u32) -> u64 {
    let alignment = alignment.max(1) as u64;
    value.div_ceil(alignment) * alignment
}

/// a PE32 image read fully into memory. only executable sections are kept.
#[derive(Debug, Clone)]
pub struct PeImage {
    image_base: u32,
    regions: Vec<Region>,
    next_section: NewAddr,
}

impl PeImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let data = std::fs::read(path.as_ref())?;
        Self::parse(&data)
    }

    pub fn parse(data: &[u8]) -> Result<Self, InitError> {
        let pe = PE::parse(data)?;
        if pe.is_64 {
            return Err(InitError::Unsupported("64-bit images are not supported"));
        }
        let image_base = u32::try_from(pe.image_base as u64)
            .map_err(|_| InitError::Malformed("image base above 4 GiB".into()))?;
        let alignment = pe
            .header
            .optional_header
            .map(|h| h.windows_fields.section_alignment)
            .filter(|a| *a != 0)
            .unwrap_or(DEFAULT_ALIGNMENT);

        let mut regions = Vec::new();
        let mut mapped_end = image_base as u64;
        for section in &pe.sections {
            let name = section.name().unwrap_or("").to_string();
            let size = section.virtual_size.max(section.size_of_raw_data);
            let begin = image_base as u64 + section.virtual_address as u64;
            mapped_end = mapped_end.max(begin + size as u64);

            if section.characteristics & IMAGE_SCN_MEM_EXECUTE == 0 {
                continue;
            }
            let begin = u32::try_from(begin)
                .map_err(|_| InitError::Malformed(format!("section {} above 4 GiB", name)))?;
            let raw_start = section.pointer_to_raw_data as usize;
            let raw_len = section.size_of_raw_data.min(size) as usize;
            let raw = raw_start
                .checked_add(raw_len)
                .and_then(|end| data.get(raw_start..end))
                .ok_or_else(|| {
                    InitError::Malformed(format!("section {} runs past the end of the file", name))
                })?;
            // virtual tail beyond the raw data reads as zeros
            let mut bytes = raw.to_vec();
            let virtual_len = if section.virtual_size == 0 {
                section.size_of_raw_data
            } else {
                section.virtual_size
            };
            bytes.resize(virtual_len as usize, 0);

            debug!(
                "executable section {} at {:#010x}, {} bytes",
                name,
                begin,
                bytes.len()
            );
            regions.push(Region {
                begin: OrigAddr::new(begin),
                bytes,
            });
        }
        if regions.is_empty() {
            return Err(InitError::Malformed("no executable section".into()));
        }

        let next = u32::try_from(align_up(mapped_end, alignment))
            .map_err(|_| InitError::Malformed("no address space left for a new section".into()))?;
        Ok(PeImage {
            image_base,
            regions,
            next_section: NewAddr::new(next),
        })
    }

    pub fn image_base(&self) -> u32 {
        self.image_base
    }
}

impl ImageView for PeImage {
    fn code_bytes(&self, range: AddrRange) -> Option<&[u8]> {
        self.regions.iter().find_map(|r| r.slice(range))
    }

    fn next_section_address(&self) -> NewAddr {
        self.next_section
    }
}

/// raw machine code mapped at a fixed base; the whole buffer counts as code.
#[derive(Debug, Clone)]
pub struct FlatImage {
    region: Region,
}

impl FlatImage {
    pub fn new(base: OrigAddr, code: Vec<u8>) -> Self {
        FlatImage {
            region: Region {
                begin: base,
                bytes: code,
            },
        }
    }

    pub fn load(path: impl AsRef<Path>, base: OrigAddr) -> Result<Self, InitError> {
        Ok(Self::new(base, std::fs::read(path.as_ref())?))
    }
}

impl ImageView for FlatImage {
    fn code_bytes(&self, range: AddrRange) -> Option<&[u8]> {
        self.region.slice(range)
    }

    fn next_section_address(&self) -> NewAddr {
        let end = self.region.begin.get() as u64 + self.region.bytes.len() as u64;
        let next = align_up(end, DEFAULT_ALIGNMENT).min(u32::MAX as u64 & !0xfff);
        NewAddr::new(next as u32)
    }
}

/// the emitted code packaged for an image writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageSection {
    /// at most 8 bytes, the limit of a PE section header.
    pub name: String,
    pub bytes: Vec<u8>,
    pub virtual_address: NewAddr,
}

impl fmt::Display for ImageSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at {}, {} bytes",
            self.name,
            self.virtual_address,
            self.bytes.len()
        )
    }
}
