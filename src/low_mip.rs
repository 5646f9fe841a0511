//! The low-mip cache container: a flat concatenation of records bundling
//! only the smallest mip levels of streamed replacement textures, used as
//! stand-ins while the full assets load.

use crate::dds;

pub const LOW_MIP_MAGIC: u32 = 0x434D_4F4C;
pub const LOW_MIP_VERSION: u32 = 1;

const HEADER_BYTES: usize = 28;
const DATA_ALIGNMENT: usize = 16;

/// Largest pixel count a record's top mip may have; extraction starts at
/// the first level at or below it.
const MIN_PIXEL_COUNT: u32 = 96 * 96;

#[inline(always)]
fn padding_for(position: usize, alignment: usize) -> usize {
    match position % alignment {
        0 => 0,
        rem => alignment - rem,
    }
}

#[derive(Clone, Debug)]
pub struct LowMipRecord {
    pub width: u32,
    pub height: u32,
    pub dxgi_format: u32,
    pub mip_count: u32,
    pub path: String,
    /// Absolute byte offset of each mip inside the container.
    pub mip_offsets: Vec<usize>,
    /// Stored mip sizes, trailing alignment padding included.
    pub mip_sizes: Vec<u32>,
}

impl LowMipRecord {
    #[inline(always)]
    pub fn mip_dimensions(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }
}

/// Sequential record walker over a whole-file buffer. A record with an
/// unknown magic or a future version stops the walk; `failed()` reports
/// whether the walk ended on such a record rather than at the end of the
/// buffer.
pub struct LowMipReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
    failed: bool,
}

impl<'a> LowMipReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            cursor: 0,
            failed: false,
        }
    }

    #[inline(always)]
    pub fn failed(&self) -> bool {
        self.failed
    }

    #[inline(always)]
    fn read_u32(&mut self) -> u32 {
        let value = u32::from_le_bytes(self.bytes[self.cursor..self.cursor + 4].try_into().unwrap());
        self.cursor += 4;
        value
    }
}

impl Iterator for LowMipReader<'_> {
    type Item = LowMipRecord;

    fn next(&mut self) -> Option<LowMipRecord> {
        if self.failed || self.cursor >= self.bytes.len() {
            return None;
        }
        if self.bytes.len() - self.cursor < HEADER_BYTES {
            self.failed = true;
            return None;
        }

        let magic = self.read_u32();
        let version = self.read_u32();
        if magic != LOW_MIP_MAGIC || version > LOW_MIP_VERSION {
            self.failed = true;
            return None;
        }

        let width = self.read_u32();
        let height = self.read_u32();
        let dxgi_format = self.read_u32();
        let mip_count = self.read_u32();
        let path_length = self.read_u32() as usize;
        if mip_count == 0
            || self.bytes.len() - self.cursor < mip_count as usize * 4 + path_length
        {
            self.failed = true;
            return None;
        }

        let mut mip_sizes = Vec::with_capacity(mip_count as usize);
        for _ in 0..mip_count {
            mip_sizes.push(self.read_u32());
        }

        let Ok(path) = std::str::from_utf8(&self.bytes[self.cursor..self.cursor + path_length])
        else {
            self.failed = true;
            return None;
        };
        let path = path.to_string();
        self.cursor += path_length;
        self.cursor += padding_for(self.cursor, DATA_ALIGNMENT);

        let mut mip_offsets = Vec::with_capacity(mip_count as usize);
        for &size in &mip_sizes {
            if self.bytes.len() - self.cursor < size as usize {
                self.failed = true;
                return None;
            }
            mip_offsets.push(self.cursor);
            self.cursor += size as usize;
        }

        Some(LowMipRecord {
            width,
            height,
            dxgi_format,
            mip_count,
            path,
            mip_offsets,
            mip_sizes,
        })
    }
}

/// Appends one record to a container under construction, extracting the
/// mip levels of `dds_bytes` starting at the first level whose pixel count
/// fits the stand-in budget.
pub fn extract_low_mips(
    dds_bytes: &[u8],
    relative_path: &str,
    out: &mut Vec<u8>,
) -> Result<(), String> {
    let descriptor = dds::decode_header(dds_bytes)
        .ok_or_else(|| format!("'{relative_path}' is not a valid DDS file"))?;

    let mut mip_start = 0u32;
    while mip_start < descriptor.mip_count - 1 {
        let pixel_count =
            (descriptor.width >> mip_start) * (descriptor.height >> mip_start);
        if pixel_count <= MIN_PIXEL_COUNT {
            break;
        }

        mip_start += 1;
    }

    let mip_count = descriptor.mip_count - mip_start;
    out.extend_from_slice(&LOW_MIP_MAGIC.to_le_bytes());
    out.extend_from_slice(&LOW_MIP_VERSION.to_le_bytes());
    out.extend_from_slice(&(descriptor.width >> mip_start).max(1).to_le_bytes());
    out.extend_from_slice(&(descriptor.height >> mip_start).max(1).to_le_bytes());
    out.extend_from_slice(&descriptor.dxgi_format.to_le_bytes());
    out.extend_from_slice(&mip_count.to_le_bytes());
    out.extend_from_slice(&(relative_path.len() as u32).to_le_bytes());

    let data_size = dds_bytes.len() - descriptor.header_size;
    let mut mip_offsets = Vec::with_capacity(mip_count as usize);
    let mut mip_sizes = Vec::with_capacity(mip_count as usize);
    for i in 0..mip_count {
        let last = i == mip_count - 1;
        let offset = descriptor.mip_offset(mip_start + i);
        let size = if last {
            data_size - offset
        } else {
            descriptor.mip_offset(mip_start + i + 1) - offset
        };
        let padding = padding_for(size, DATA_ALIGNMENT);
        mip_offsets.push(offset);
        mip_sizes.push(size);
        out.extend_from_slice(&((size + padding) as u32).to_le_bytes());
    }

    out.extend_from_slice(relative_path.as_bytes());
    out.resize(out.len() + padding_for(out.len(), DATA_ALIGNMENT), 0);

    for i in 0..mip_count as usize {
        let start = descriptor.header_size + mip_offsets[i];
        out.extend_from_slice(&dds_bytes[start..start + mip_sizes[i]]);
        out.resize(out.len() + padding_for(mip_sizes[i], DATA_ALIGNMENT), 0);
    }

    Ok(())
}
