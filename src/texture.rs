use crate::gfx::{RenderFormat, RenderTexture};

/// A GPU-owned texture asset tracked by the cache. Exactly one owner holds
/// it at any time: a map slot, the evicted list, or an in-flight pair.
#[derive(Default)]
pub struct Texture {
    pub format: RenderFormat,
    pub width: u32,
    pub height: u32,
    pub mipmaps: u32,
    /// The sampleable texture (decoded RGBA32 or a replacement asset).
    pub texture: Option<Box<dyn RenderTexture>>,
    /// The 1-D TMEM copy uploaded alongside emulator textures.
    pub tmem: Option<Box<dyn RenderTexture>>,
    pub creation_frame: u64,
    /// TMEM byte copy retained in developer mode for inspection.
    pub bytes_tmem: Vec<u8>,
}

impl Texture {
    pub fn new() -> Self {
        Self::default()
    }
}
