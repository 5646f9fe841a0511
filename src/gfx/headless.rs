//! CPU reference backend. Copies execute eagerly into byte vectors and
//! compute work is recorded rather than run, which is enough for the test
//! suite and offline tools to observe what the cache asked the GPU to do.

use crate::gfx::{
    RenderBarrierStage, RenderBuffer, RenderBufferBarrier, RenderBufferDesc, RenderBufferFootprint,
    RenderCommandList, RenderCommandListType, RenderDescriptorSet, RenderDevice,
    RenderDeviceCapabilities, RenderFormat, RenderPipeline, RenderPipelineLayout, RenderPool,
    RenderPoolDesc, RenderTexture, RenderTextureBarrier, RenderTextureDesc, RenderTextureLayout,
    RenderTextureSubresource, ShaderLibrary, ShaderRecord, mip_byte_size,
};
use std::any::Any;
use std::sync::{Arc, Mutex};

const ROW_ALIGNMENT: u32 = 256;

#[derive(Clone, Copy, Debug, Default)]
pub struct HeadlessStats {
    pub textures_created: usize,
    pub buffers_created: usize,
    pub texture_barriers: usize,
    pub buffer_barriers: usize,
    pub copies: usize,
    pub dispatches: usize,
    pub last_dispatch: [u32; 3],
    pub submissions: usize,
}

pub struct HeadlessTexture {
    pub desc: RenderTextureDesc,
    name: Mutex<String>,
    mips: Mutex<Vec<Vec<u8>>>,
}

impl HeadlessTexture {
    fn new(desc: &RenderTextureDesc) -> Self {
        let mut mips = Vec::with_capacity(desc.mip_levels as usize);
        for mip in 0..desc.mip_levels {
            let (w, h) = mip_dimensions(desc, mip);
            mips.push(vec![0u8; mip_byte_size(desc.format, w, h)]);
        }
        Self {
            desc: desc.clone(),
            name: Mutex::new(String::new()),
            mips: Mutex::new(mips),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().unwrap().clone()
    }

    pub fn mip_bytes(&self, mip: u32) -> Vec<u8> {
        self.mips.lock().unwrap()[mip as usize].clone()
    }
}

impl RenderTexture for HeadlessTexture {
    fn set_name(&self, name: &str) {
        *self.name.lock().unwrap() = name.to_string();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[inline(always)]
fn mip_dimensions(desc: &RenderTextureDesc, mip: u32) -> (u32, u32) {
    ((desc.width >> mip).max(1), (desc.height >> mip).max(1))
}

/// Downcast helper for tests inspecting cache-produced textures.
pub fn as_headless(texture: &dyn RenderTexture) -> &HeadlessTexture {
    texture
        .as_any()
        .downcast_ref::<HeadlessTexture>()
        .expect("texture was not created by the headless device")
}

pub struct HeadlessBuffer {
    bytes: Mutex<Vec<u8>>,
}

impl RenderBuffer for HeadlessBuffer {
    fn size(&self) -> u64 {
        self.bytes.lock().unwrap().len() as u64
    }

    fn map(&self, write: &mut dyn FnMut(&mut [u8])) {
        write(self.bytes.lock().unwrap().as_mut_slice());
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HeadlessPool {
    stats: Arc<Mutex<HeadlessStats>>,
}

impl RenderPool for HeadlessPool {
    fn create_buffer(&mut self, desc: &RenderBufferDesc) -> Box<dyn RenderBuffer> {
        self.stats.lock().unwrap().buffers_created += 1;
        Box::new(HeadlessBuffer {
            bytes: Mutex::new(vec![0u8; desc.size as usize]),
        })
    }
}

pub struct HeadlessPipeline;

impl RenderPipeline for HeadlessPipeline {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct HeadlessPipelineLayout;

impl RenderPipelineLayout for HeadlessPipelineLayout {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct HeadlessDescriptorSet;

impl RenderDescriptorSet for HeadlessDescriptorSet {
    fn set_texture(
        &mut self,
        _slot: u32,
        _texture: &dyn RenderTexture,
        _layout: RenderTextureLayout,
    ) {
    }
}

struct HeadlessCommandList {
    stats: Arc<Mutex<HeadlessStats>>,
}

impl RenderCommandList for HeadlessCommandList {
    fn begin(&mut self) {}

    fn end(&mut self) {}

    fn texture_barriers(&mut self, _stage: RenderBarrierStage, barriers: &[RenderTextureBarrier]) {
        self.stats.lock().unwrap().texture_barriers += barriers.len();
    }

    fn buffer_barriers(&mut self, _stage: RenderBarrierStage, barriers: &[RenderBufferBarrier]) {
        self.stats.lock().unwrap().buffer_barriers += barriers.len();
    }

    fn copy_texture_region(&mut self, dst: &RenderTextureSubresource, src: &RenderBufferFootprint) {
        self.stats.lock().unwrap().copies += 1;

        let texture = as_headless(dst.texture);
        let buffer = src
            .buffer
            .as_any()
            .downcast_ref::<HeadlessBuffer>()
            .expect("buffer was not created by the headless device");

        let format = src.format;
        let block = format.block_width();
        let element = format.element_size() as usize;
        let src_pitch = src.row_width.div_ceil(block).max(1) as usize * element;
        let dst_row_bytes = src.width.div_ceil(block).max(1) as usize * element;
        let rows = src.height.div_ceil(block).max(1) as usize;

        let source = buffer.bytes.lock().unwrap();
        let mut mips = texture.mips.lock().unwrap();
        let dst_bytes = &mut mips[dst.mip_level as usize];
        let mut src_offset = src.offset as usize;
        let mut dst_offset = 0usize;
        for _ in 0..rows {
            if src_offset + dst_row_bytes > source.len() || dst_offset + dst_row_bytes > dst_bytes.len() {
                break;
            }
            dst_bytes[dst_offset..dst_offset + dst_row_bytes]
                .copy_from_slice(&source[src_offset..src_offset + dst_row_bytes]);
            src_offset += src_pitch;
            dst_offset += dst_row_bytes;
        }
    }

    fn set_pipeline(&mut self, _pipeline: &dyn RenderPipeline) {}

    fn set_compute_pipeline_layout(&mut self, _layout: &dyn RenderPipelineLayout) {}

    fn set_compute_push_constants(&mut self, _index: u32, _data: &[u8]) {}

    fn set_compute_descriptor_set(&mut self, _set: &dyn RenderDescriptorSet, _index: u32) {}

    fn dispatch(&mut self, x: u32, y: u32, z: u32) {
        let mut stats = self.stats.lock().unwrap();
        stats.dispatches += 1;
        stats.last_dispatch = [x, y, z];
    }
}

#[derive(Default)]
pub struct HeadlessDevice {
    stats: Arc<Mutex<HeadlessStats>>,
}

impl HeadlessDevice {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn stats(&self) -> HeadlessStats {
        *self.stats.lock().unwrap()
    }
}

impl RenderDevice for HeadlessDevice {
    fn create_texture(&self, desc: &RenderTextureDesc) -> Box<dyn RenderTexture> {
        self.stats.lock().unwrap().textures_created += 1;
        Box::new(HeadlessTexture::new(desc))
    }

    fn create_buffer(&self, desc: &RenderBufferDesc) -> Box<dyn RenderBuffer> {
        self.stats.lock().unwrap().buffers_created += 1;
        Box::new(HeadlessBuffer {
            bytes: Mutex::new(vec![0u8; desc.size as usize]),
        })
    }

    fn create_pool(&self, _desc: &RenderPoolDesc) -> Box<dyn RenderPool> {
        Box::new(HeadlessPool {
            stats: Arc::clone(&self.stats),
        })
    }

    fn create_command_list(&self, _list_type: RenderCommandListType) -> Box<dyn RenderCommandList> {
        Box::new(HeadlessCommandList {
            stats: Arc::clone(&self.stats),
        })
    }

    fn create_descriptor_set(&self, _texture_slot_count: u32) -> Box<dyn RenderDescriptorSet> {
        Box::new(HeadlessDescriptorSet)
    }

    fn submit_and_wait(&self, _command_list: &mut dyn RenderCommandList) {
        self.stats.lock().unwrap().submissions += 1;
    }

    fn capabilities(&self) -> RenderDeviceCapabilities {
        RenderDeviceCapabilities {
            row_alignment: ROW_ALIGNMENT,
            max_texture_size: 16384,
        }
    }

    fn sample_counts_supported(&self, _format: RenderFormat) -> u32 {
        1
    }
}

/// A shader library stub for tests and tools that never execute compute.
pub fn shader_library() -> Arc<ShaderLibrary> {
    Arc::new(ShaderLibrary {
        texture_decode: ShaderRecord {
            pipeline: Arc::new(HeadlessPipeline),
            pipeline_layout: Arc::new(HeadlessPipelineLayout),
        },
    })
}
