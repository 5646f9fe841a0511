//! Minimal DDS container codec: enough header handling to size and place
//! every mip level of the replacement assets, plus a DX10 header writer for
//! the packer. Pixel data is never touched on the CPU.

use crate::gfx::{RenderFormat, mip_byte_size};

pub const DDS_MAGIC: u32 = 0x2053_4444;

const HEADER_BYTES: usize = 4 + 124;
const DX10_HEADER_BYTES: usize = 20;

const DDSD_CAPS: u32 = 0x1;
const DDSD_HEIGHT: u32 = 0x2;
const DDSD_WIDTH: u32 = 0x4;
const DDSD_PIXELFORMAT: u32 = 0x1000;
const DDSD_MIPMAPCOUNT: u32 = 0x2_0000;
const DDSD_DEPTH: u32 = 0x80_0000;

const DDPF_ALPHAPIXELS: u32 = 0x1;
const DDPF_FOURCC: u32 = 0x4;
const DDPF_RGB: u32 = 0x40;

const FOURCC_DX10: u32 = 0x3031_5844;
const FOURCC_DXT1: u32 = 0x3154_5844;
const FOURCC_DXT2: u32 = 0x3254_5844;
const FOURCC_DXT3: u32 = 0x3354_5844;
const FOURCC_DXT4: u32 = 0x3454_5844;
const FOURCC_DXT5: u32 = 0x3554_5844;
const FOURCC_ATI1: u32 = 0x3149_5441;
const FOURCC_ATI2: u32 = 0x3249_5441;
const FOURCC_BC4U: u32 = 0x5534_4342;
const FOURCC_BC5U: u32 = 0x5535_4342;

// DXGI_FORMAT values appearing in DX10 headers and the low-mip container.
pub const DXGI_R32G32B32A32_FLOAT: u32 = 2;
pub const DXGI_R16G16B16A16_FLOAT: u32 = 10;
pub const DXGI_R8G8B8A8_UNORM: u32 = 28;
pub const DXGI_R8G8_UNORM: u32 = 49;
pub const DXGI_R8_UNORM: u32 = 61;
pub const DXGI_BC1_UNORM: u32 = 71;
pub const DXGI_BC1_UNORM_SRGB: u32 = 72;
pub const DXGI_BC2_UNORM: u32 = 74;
pub const DXGI_BC2_UNORM_SRGB: u32 = 75;
pub const DXGI_BC3_UNORM: u32 = 77;
pub const DXGI_BC3_UNORM_SRGB: u32 = 78;
pub const DXGI_BC4_UNORM: u32 = 80;
pub const DXGI_BC4_SNORM: u32 = 81;
pub const DXGI_BC5_UNORM: u32 = 83;
pub const DXGI_BC5_SNORM: u32 = 84;
pub const DXGI_B8G8R8A8_UNORM: u32 = 87;
pub const DXGI_BC6H_UF16: u32 = 95;
pub const DXGI_BC6H_SF16: u32 = 96;
pub const DXGI_BC7_UNORM: u32 = 98;
pub const DXGI_BC7_UNORM_SRGB: u32 = 99;

pub fn dxgi_to_render_format(dxgi: u32) -> RenderFormat {
    match dxgi {
        DXGI_R32G32B32A32_FLOAT => RenderFormat::R32G32B32A32Float,
        DXGI_R16G16B16A16_FLOAT => RenderFormat::R16G16B16A16Float,
        DXGI_R8G8B8A8_UNORM => RenderFormat::R8G8B8A8Unorm,
        DXGI_R8G8_UNORM => RenderFormat::R8G8Unorm,
        DXGI_R8_UNORM => RenderFormat::R8Unorm,
        DXGI_BC1_UNORM => RenderFormat::BC1Unorm,
        DXGI_BC1_UNORM_SRGB => RenderFormat::BC1UnormSrgb,
        DXGI_BC2_UNORM => RenderFormat::BC2Unorm,
        DXGI_BC2_UNORM_SRGB => RenderFormat::BC2UnormSrgb,
        DXGI_BC3_UNORM => RenderFormat::BC3Unorm,
        DXGI_BC3_UNORM_SRGB => RenderFormat::BC3UnormSrgb,
        DXGI_BC4_UNORM => RenderFormat::BC4Unorm,
        DXGI_BC4_SNORM => RenderFormat::BC4Snorm,
        DXGI_BC5_UNORM => RenderFormat::BC5Unorm,
        DXGI_BC5_SNORM => RenderFormat::BC5Snorm,
        DXGI_B8G8R8A8_UNORM => RenderFormat::B8G8R8A8Unorm,
        DXGI_BC6H_UF16 => RenderFormat::BC6HUf16,
        DXGI_BC6H_SF16 => RenderFormat::BC6HSf16,
        DXGI_BC7_UNORM => RenderFormat::BC7Unorm,
        DXGI_BC7_UNORM_SRGB => RenderFormat::BC7UnormSrgb,
        _ => RenderFormat::Unknown,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdsTextureType {
    Texture1D,
    Texture2D,
    Texture3D,
}

#[derive(Clone, Debug)]
pub struct DdsDescriptor {
    pub texture_type: DdsTextureType,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_count: u32,
    pub dxgi_format: u32,
    /// Bytes from the start of the file to the first pixel.
    pub header_size: usize,
}

impl DdsDescriptor {
    #[inline(always)]
    pub fn render_format(&self) -> RenderFormat {
        dxgi_to_render_format(self.dxgi_format)
    }

    #[inline(always)]
    pub fn mip_dimensions(&self, mip: u32) -> (u32, u32) {
        ((self.width >> mip).max(1), (self.height >> mip).max(1))
    }

    pub fn mip_byte_size(&self, mip: u32) -> usize {
        let (w, h) = self.mip_dimensions(mip);
        mip_byte_size(self.render_format(), w, h) * self.depth.max(1) as usize
    }

    /// Offset of a mip level relative to the start of the pixel data.
    pub fn mip_offset(&self, mip: u32) -> usize {
        (0..mip).map(|m| self.mip_byte_size(m)).sum()
    }
}

#[inline(always)]
fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(bytes[offset..offset + 4].try_into().unwrap())
}

fn fourcc_format(fourcc: u32) -> u32 {
    match fourcc {
        FOURCC_DXT1 => DXGI_BC1_UNORM,
        FOURCC_DXT2 | FOURCC_DXT3 => DXGI_BC2_UNORM,
        FOURCC_DXT4 | FOURCC_DXT5 => DXGI_BC3_UNORM,
        FOURCC_ATI1 | FOURCC_BC4U => DXGI_BC4_UNORM,
        FOURCC_ATI2 | FOURCC_BC5U => DXGI_BC5_UNORM,
        _ => 0,
    }
}

/// Parses a DDS header. Returns `None` when the bytes do not describe a
/// DDS file the cache can upload.
pub fn decode_header(bytes: &[u8]) -> Option<DdsDescriptor> {
    if bytes.len() < HEADER_BYTES || read_u32(bytes, 0) != DDS_MAGIC || read_u32(bytes, 4) != 124 {
        return None;
    }

    let flags = read_u32(bytes, 8);
    let height = read_u32(bytes, 12);
    let width = read_u32(bytes, 16);
    let depth = if (flags & DDSD_DEPTH) != 0 {
        read_u32(bytes, 24).max(1)
    } else {
        1
    };
    let mip_count = read_u32(bytes, 28).max(1);
    let pf_flags = read_u32(bytes, 80);
    let fourcc = read_u32(bytes, 84);

    let mut texture_type = if depth > 1 {
        DdsTextureType::Texture3D
    } else if height > 1 {
        DdsTextureType::Texture2D
    } else {
        DdsTextureType::Texture1D
    };

    let mut header_size = HEADER_BYTES;
    let dxgi_format;
    if (pf_flags & DDPF_FOURCC) != 0 && fourcc == FOURCC_DX10 {
        if bytes.len() < HEADER_BYTES + DX10_HEADER_BYTES {
            return None;
        }

        dxgi_format = read_u32(bytes, 128);
        texture_type = match read_u32(bytes, 132) {
            2 => DdsTextureType::Texture1D,
            3 => DdsTextureType::Texture2D,
            4 => DdsTextureType::Texture3D,
            _ => return None,
        };
        header_size += DX10_HEADER_BYTES;
    } else if (pf_flags & DDPF_FOURCC) != 0 {
        dxgi_format = fourcc_format(fourcc);
        if dxgi_format == 0 {
            return None;
        }
    } else if (pf_flags & DDPF_RGB) != 0 && read_u32(bytes, 88) == 32 {
        // Uncompressed 32-bit RGBA, channel order from the red mask.
        dxgi_format = match read_u32(bytes, 92) {
            0x0000_00FF => DXGI_R8G8B8A8_UNORM,
            0x00FF_0000 => DXGI_B8G8R8A8_UNORM,
            _ => return None,
        };
    } else {
        return None;
    }

    if width == 0 || height == 0 {
        return None;
    }

    Some(DdsDescriptor {
        texture_type,
        width,
        height,
        depth,
        mip_count,
        dxgi_format,
        header_size,
    })
}

#[inline(always)]
fn push_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Writes a DX10-style DDS header. The caller appends the tightly packed
/// mip chain afterwards.
pub fn write_header(out: &mut Vec<u8>, width: u32, height: u32, mip_count: u32, dxgi_format: u32) {
    push_u32(out, DDS_MAGIC);
    push_u32(out, 124);
    let mut flags = DDSD_CAPS | DDSD_HEIGHT | DDSD_WIDTH | DDSD_PIXELFORMAT;
    if mip_count > 1 {
        flags |= DDSD_MIPMAPCOUNT;
    }
    push_u32(out, flags);
    push_u32(out, height);
    push_u32(out, width);
    push_u32(out, 0); // pitch
    push_u32(out, 0); // depth
    push_u32(out, mip_count);
    for _ in 0..11 {
        push_u32(out, 0); // reserved
    }
    push_u32(out, 32); // pixel format size
    push_u32(out, DDPF_FOURCC | DDPF_ALPHAPIXELS);
    push_u32(out, FOURCC_DX10);
    for _ in 0..5 {
        push_u32(out, 0); // bit count and masks
    }
    push_u32(out, 0x1000); // caps: texture
    for _ in 0..4 {
        push_u32(out, 0); // caps2..4, reserved
    }
    push_u32(out, dxgi_format);
    push_u32(out, 3); // resource dimension: 2-D
    push_u32(out, 0); // misc
    push_u32(out, 1); // array size
    push_u32(out, 0); // misc2
}

#[cfg(test)]
mod tests {
    use super::*;

    fn synthetic_dds(width: u32, height: u32, mip_count: u32, dxgi_format: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_header(&mut bytes, width, height, mip_count, dxgi_format);
        let descriptor = decode_header(&bytes).unwrap();
        for mip in 0..mip_count {
            let size = descriptor.mip_byte_size(mip);
            bytes.extend(std::iter::repeat_n(mip as u8 + 1, size));
        }
        bytes
    }

    #[test]
    fn rejects_unknown_magic() {
        assert!(decode_header(&[0u8; 256]).is_none());
        assert!(decode_header(&[0x89, 0x50, 0x4E, 0x47]).is_none());
    }

    #[test]
    fn dx10_round_trip() {
        let bytes = synthetic_dds(64, 32, 3, DXGI_BC1_UNORM);
        let descriptor = decode_header(&bytes).unwrap();
        assert_eq!(descriptor.width, 64);
        assert_eq!(descriptor.height, 32);
        assert_eq!(descriptor.mip_count, 3);
        assert_eq!(descriptor.render_format(), RenderFormat::BC1Unorm);
        assert_eq!(descriptor.header_size, 148);
        assert_eq!(descriptor.texture_type, DdsTextureType::Texture2D);
    }

    #[test]
    fn bc1_mip_math() {
        let bytes = synthetic_dds(64, 64, 4, DXGI_BC1_UNORM);
        let descriptor = decode_header(&bytes).unwrap();
        // 16x16 blocks of 8 bytes.
        assert_eq!(descriptor.mip_byte_size(0), 16 * 16 * 8);
        assert_eq!(descriptor.mip_byte_size(1), 8 * 8 * 8);
        // 8x8 still rounds up to 2x2 blocks.
        assert_eq!(descriptor.mip_byte_size(3), 2 * 2 * 8);
        assert_eq!(descriptor.mip_offset(0), 0);
        assert_eq!(descriptor.mip_offset(2), 16 * 16 * 8 + 8 * 8 * 8);
    }

    #[test]
    fn rgba_mip_math() {
        let bytes = synthetic_dds(16, 8, 1, DXGI_R8G8B8A8_UNORM);
        let descriptor = decode_header(&bytes).unwrap();
        assert_eq!(descriptor.mip_byte_size(0), 16 * 8 * 4);
        assert_eq!(bytes.len(), descriptor.header_size + 16 * 8 * 4);
    }

    #[test]
    fn classic_dxt5_fourcc() {
        let mut bytes = synthetic_dds(16, 16, 1, DXGI_BC1_UNORM);
        // Rewrite the pixel format to a pre-DX10 DXT5 header.
        bytes[84..88].copy_from_slice(&FOURCC_DXT5.to_le_bytes());
        bytes.truncate(HEADER_BYTES);
        let descriptor = decode_header(&bytes).unwrap();
        assert_eq!(descriptor.render_format(), RenderFormat::BC3Unorm);
        assert_eq!(descriptor.header_size, HEADER_BYTES);
    }
}
