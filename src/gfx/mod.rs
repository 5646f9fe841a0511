pub mod headless;

use std::any::Any;
use std::sync::Arc;

// --- Formats ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum RenderFormat {
    #[default]
    Unknown,
    R8Uint,
    R8Unorm,
    R8G8Unorm,
    R8G8B8A8Unorm,
    B8G8R8A8Unorm,
    R16G16B16A16Float,
    R32G32B32A32Float,
    BC1Unorm,
    BC1UnormSrgb,
    BC2Unorm,
    BC2UnormSrgb,
    BC3Unorm,
    BC3UnormSrgb,
    BC4Unorm,
    BC4Snorm,
    BC5Unorm,
    BC5Snorm,
    BC6HUf16,
    BC6HSf16,
    BC7Unorm,
    BC7UnormSrgb,
}

impl RenderFormat {
    /// Bytes per pixel for linear formats, bytes per 4x4 block for
    /// block-compressed ones.
    #[inline(always)]
    pub fn element_size(self) -> u32 {
        match self {
            RenderFormat::Unknown => 0,
            RenderFormat::R8Uint | RenderFormat::R8Unorm => 1,
            RenderFormat::R8G8Unorm => 2,
            RenderFormat::R8G8B8A8Unorm | RenderFormat::B8G8R8A8Unorm => 4,
            RenderFormat::R16G16B16A16Float => 8,
            RenderFormat::R32G32B32A32Float => 16,
            RenderFormat::BC1Unorm | RenderFormat::BC1UnormSrgb => 8,
            RenderFormat::BC4Unorm | RenderFormat::BC4Snorm => 8,
            RenderFormat::BC2Unorm | RenderFormat::BC2UnormSrgb => 16,
            RenderFormat::BC3Unorm | RenderFormat::BC3UnormSrgb => 16,
            RenderFormat::BC5Unorm | RenderFormat::BC5Snorm => 16,
            RenderFormat::BC6HUf16 | RenderFormat::BC6HSf16 => 16,
            RenderFormat::BC7Unorm | RenderFormat::BC7UnormSrgb => 16,
        }
    }

    #[inline(always)]
    pub fn is_block_compressed(self) -> bool {
        matches!(
            self,
            RenderFormat::BC1Unorm
                | RenderFormat::BC1UnormSrgb
                | RenderFormat::BC2Unorm
                | RenderFormat::BC2UnormSrgb
                | RenderFormat::BC3Unorm
                | RenderFormat::BC3UnormSrgb
                | RenderFormat::BC4Unorm
                | RenderFormat::BC4Snorm
                | RenderFormat::BC5Unorm
                | RenderFormat::BC5Snorm
                | RenderFormat::BC6HUf16
                | RenderFormat::BC6HSf16
                | RenderFormat::BC7Unorm
                | RenderFormat::BC7UnormSrgb
        )
    }

    /// Pixel edge length covered by one element (4 for BC blocks, 1 otherwise).
    #[inline(always)]
    pub fn block_width(self) -> u32 {
        if self.is_block_compressed() { 4 } else { 1 }
    }
}

/// Byte size of a single mip level in the given format.
pub fn mip_byte_size(format: RenderFormat, width: u32, height: u32) -> usize {
    let block = format.block_width();
    let blocks_x = width.div_ceil(block).max(1) as usize;
    let blocks_y = height.div_ceil(block).max(1) as usize;
    blocks_x * blocks_y * format.element_size() as usize
}

// --- Resource descriptors ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderTextureDimension {
    Texture1D,
    Texture2D,
    Texture3D,
}

#[derive(Clone, Debug)]
pub struct RenderTextureDesc {
    pub dimension: RenderTextureDimension,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub format: RenderFormat,
    pub storage: bool,
}

impl RenderTextureDesc {
    #[inline(always)]
    pub fn texture_1d(width: u32, mip_levels: u32, format: RenderFormat) -> Self {
        Self {
            dimension: RenderTextureDimension::Texture1D,
            width,
            height: 1,
            depth: 1,
            mip_levels,
            format,
            storage: false,
        }
    }

    #[inline(always)]
    pub fn texture_2d(width: u32, height: u32, mip_levels: u32, format: RenderFormat) -> Self {
        Self {
            dimension: RenderTextureDimension::Texture2D,
            width,
            height,
            depth: 1,
            mip_levels,
            format,
            storage: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RenderBufferDesc {
    pub size: u64,
}

impl RenderBufferDesc {
    #[inline(always)]
    pub fn upload(size: u64) -> Self {
        Self { size }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RenderPoolDesc {
    pub use_linear_algorithm: bool,
    pub allow_only_buffers: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct RenderDeviceCapabilities {
    /// Required alignment of a texture row inside an upload buffer.
    pub row_alignment: u32,
    pub max_texture_size: u32,
}

// --- Barriers and copies ---

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderBarrierStage {
    Copy,
    Compute,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderTextureLayout {
    CopyDest,
    ShaderRead,
    General,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderBufferAccess {
    Read,
    Write,
}

pub struct RenderTextureBarrier<'a> {
    pub texture: &'a dyn RenderTexture,
    pub layout: RenderTextureLayout,
}

impl<'a> RenderTextureBarrier<'a> {
    #[inline(always)]
    pub fn new(texture: &'a dyn RenderTexture, layout: RenderTextureLayout) -> Self {
        Self { texture, layout }
    }
}

pub struct RenderBufferBarrier<'a> {
    pub buffer: &'a dyn RenderBuffer,
    pub access: RenderBufferAccess,
}

impl<'a> RenderBufferBarrier<'a> {
    #[inline(always)]
    pub fn new(buffer: &'a dyn RenderBuffer, access: RenderBufferAccess) -> Self {
        Self { buffer, access }
    }
}

/// Destination of a buffer-to-texture copy: one subresource of a texture.
pub struct RenderTextureSubresource<'a> {
    pub texture: &'a dyn RenderTexture,
    pub mip_level: u32,
}

impl<'a> RenderTextureSubresource<'a> {
    #[inline(always)]
    pub fn new(texture: &'a dyn RenderTexture, mip_level: u32) -> Self {
        Self { texture, mip_level }
    }
}

/// Source of a buffer-to-texture copy: a placed footprint inside a buffer.
/// `row_width` is in pixels; the byte pitch follows from the format.
pub struct RenderBufferFootprint<'a> {
    pub buffer: &'a dyn RenderBuffer,
    pub format: RenderFormat,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub row_width: u32,
    pub offset: u64,
}

impl<'a> RenderBufferFootprint<'a> {
    #[inline(always)]
    pub fn new(
        buffer: &'a dyn RenderBuffer,
        format: RenderFormat,
        width: u32,
        height: u32,
        depth: u32,
        row_width: u32,
        offset: u64,
    ) -> Self {
        Self {
            buffer,
            format,
            width,
            height,
            depth,
            row_width,
            offset,
        }
    }
}

/// Pads a tightly packed row pitch up to the device row alignment.
/// Returns (padded row byte width, padding bytes added).
#[inline(always)]
pub fn calculate_texture_row_width_padding(row_pitch: u32, alignment: u32) -> (u32, u32) {
    let rem = row_pitch % alignment;
    if rem == 0 {
        (row_pitch, 0)
    } else {
        (row_pitch + alignment - rem, alignment - rem)
    }
}

// --- Backend traits ---

pub trait RenderTexture: Send + Sync {
    fn set_name(&self, _name: &str) {}
    fn as_any(&self) -> &dyn Any;
}

pub trait RenderBuffer: Send + Sync {
    fn size(&self) -> u64;
    /// Maps the buffer for writing for the duration of the closure.
    fn map(&self, write: &mut dyn FnMut(&mut [u8]));
    fn as_any(&self) -> &dyn Any;
}

pub trait RenderPool: Send {
    fn create_buffer(&mut self, desc: &RenderBufferDesc) -> Box<dyn RenderBuffer>;
}

pub trait RenderPipeline: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

pub trait RenderPipelineLayout: Send + Sync {
    fn as_any(&self) -> &dyn Any;
}

pub trait RenderDescriptorSet: Send {
    fn set_texture(&mut self, slot: u32, texture: &dyn RenderTexture, layout: RenderTextureLayout);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RenderCommandListType {
    Direct,
    Compute,
    Copy,
}

pub trait RenderCommandList: Send {
    fn begin(&mut self);
    fn end(&mut self);
    fn texture_barriers(&mut self, stage: RenderBarrierStage, barriers: &[RenderTextureBarrier]);
    fn buffer_barriers(&mut self, stage: RenderBarrierStage, barriers: &[RenderBufferBarrier]);
    fn copy_texture_region(&mut self, dst: &RenderTextureSubresource, src: &RenderBufferFootprint);
    fn set_pipeline(&mut self, pipeline: &dyn RenderPipeline);
    fn set_compute_pipeline_layout(&mut self, layout: &dyn RenderPipelineLayout);
    fn set_compute_push_constants(&mut self, index: u32, data: &[u8]);
    fn set_compute_descriptor_set(&mut self, set: &dyn RenderDescriptorSet, index: u32);
    fn dispatch(&mut self, x: u32, y: u32, z: u32);
}

pub trait RenderDevice: Send + Sync {
    fn create_texture(&self, desc: &RenderTextureDesc) -> Box<dyn RenderTexture>;
    fn create_buffer(&self, desc: &RenderBufferDesc) -> Box<dyn RenderBuffer>;
    fn create_pool(&self, desc: &RenderPoolDesc) -> Box<dyn RenderPool>;
    fn create_command_list(&self, list_type: RenderCommandListType) -> Box<dyn RenderCommandList>;
    fn create_descriptor_set(&self, texture_slot_count: u32) -> Box<dyn RenderDescriptorSet>;
    /// Submits a recorded command list and blocks until it has executed.
    fn submit_and_wait(&self, command_list: &mut dyn RenderCommandList);
    fn capabilities(&self) -> RenderDeviceCapabilities;
    /// Bitmask of supported MSAA sample counts for the format.
    fn sample_counts_supported(&self, format: RenderFormat) -> u32;
}

// --- Shader library ---

/// Compute pipeline handed in by the host renderer.
pub struct ShaderRecord {
    pub pipeline: Arc<dyn RenderPipeline>,
    pub pipeline_layout: Arc<dyn RenderPipelineLayout>,
}

/// The set of host-provided shaders consumed by the cache.
pub struct ShaderLibrary {
    pub texture_decode: ShaderRecord,
}

// --- Worker ---

/// A thread-owned pairing of a device handle and a command list. Command
/// lists are never shared across threads; every thread that records GPU
/// work owns one of these.
pub struct RenderWorker {
    pub device: Arc<dyn RenderDevice>,
    pub command_list: Box<dyn RenderCommandList>,
}

impl RenderWorker {
    pub fn new(device: Arc<dyn RenderDevice>, list_type: RenderCommandListType) -> Self {
        let command_list = device.create_command_list(list_type);
        Self {
            device,
            command_list,
        }
    }

    /// Opens an execution scope: records the closure's commands, then
    /// submits and waits for completion.
    pub fn execute<R>(&mut self, record: impl FnOnce(&mut RenderWorker) -> R) -> R {
        self.command_list.begin();
        let result = record(self);
        self.command_list.end();
        self.device.submit_and_wait(self.command_list.as_mut());
        result
    }
}
