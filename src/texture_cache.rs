use crate::dds;
use crate::gfx::{
    RenderBarrierStage, RenderBuffer, RenderBufferAccess, RenderBufferBarrier, RenderBufferDesc,
    RenderBufferFootprint, RenderCommandListType, RenderDescriptorSet, RenderDevice, RenderFormat,
    RenderPool, RenderPoolDesc, RenderTextureBarrier, RenderTextureDesc, RenderTextureDimension,
    RenderTextureLayout, RenderTextureSubresource, RenderWorker, ShaderLibrary,
    calculate_texture_row_width_padding,
};
use crate::low_mip::LowMipReader;
use crate::replacement::{
    LOW_MIP_CACHE_FILENAME, REPLACEMENT_DATABASE_FILENAME, ReplacementDatabase, ReplacementHashes,
    ReplacementLoad, ReplacementTexture,
};
use crate::replacement_map::{LowMipCacheTexture, ReplacementMap};
use crate::texture::Texture;
use crate::texture_map::{TextureMap, UseResult};
use crate::tmem::{self, LoadTile};
use bytemuck::{Pod, Zeroable};
use log::{error, warn};
use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

const PNG_MAGIC: u32 = 0x474E_5089;
const DECODE_THREAD_GROUP_SIZE: u32 = 8;

// --- Submission types ---

/// One TMEM upload from the render submission thread.
#[derive(Clone)]
pub struct TextureUpload {
    pub hash: u64,
    pub creation_frame: u64,
    pub width: u32,
    pub height: u32,
    pub tlut: u32,
    pub load_tile: LoadTile,
    pub bytes_tmem: Vec<u8>,
    pub decode_tmem: bool,
}

#[derive(Clone, Copy, Debug)]
struct ReplacementCheck {
    texture_hash: u64,
    database_hash: u64,
    min_mip_width: u32,
    min_mip_height: u32,
}

#[derive(Clone)]
struct StreamDescription {
    hash: u64,
    file_path: PathBuf,
    relative_path: String,
    min_mip_width: u32,
    min_mip_height: u32,
}

struct HashTexturePair {
    hash: u64,
    texture: Arc<Texture>,
    low_priority: bool,
}

/// Constant block consumed by the TMEM decode compute shader.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct TextureDecodeCB {
    resolution: [u32; 2],
    fmt: u32,
    siz: u32,
    address: u32,
    stride: u32,
    tlut: u32,
    palette: u32,
}

struct TextureDecodeDescriptorSet {
    set: Box<dyn RenderDescriptorSet>,
}

impl TextureDecodeDescriptorSet {
    const TMEM_SLOT: u32 = 0;
    const RGBA32_SLOT: u32 = 1;

    fn new(device: &dyn RenderDevice) -> Self {
        Self {
            set: device.create_descriptor_set(2),
        }
    }
}

// --- Shared state ---

#[derive(Default)]
struct UploadQueues {
    uploads: Vec<TextureUpload>,
    replacement_checks: Vec<ReplacementCheck>,
}

struct StreamQueue {
    descriptions: VecDeque<StreamDescription>,
    active_count: i32,
}

struct MapState {
    map: TextureMap,
    lock_counter: u32,
}

struct Shared {
    device: Arc<dyn RenderDevice>,
    shader_library: Arc<ShaderLibrary>,
    developer_mode: bool,
    running: AtomicBool,
    upload_queue: Mutex<UploadQueues>,
    upload_queue_changed: Condvar,
    upload_queue_finished: Condvar,
    stream_queue: Mutex<StreamQueue>,
    stream_queue_changed: Condvar,
    streamed_textures: Mutex<Vec<HashTexturePair>>,
    map_state: Mutex<MapState>,
    replacement_map: Mutex<ReplacementMap>,
    upload_pool: Mutex<Box<dyn RenderPool>>,
    tmem_name_counter: AtomicU32,
    rgba_name_counter: AtomicU32,
}

/// Owner of the whole texture pipeline: the content-addressed map, the
/// replacement index, the upload thread and the stream thread pool.
pub struct TextureCache {
    shared: Arc<Shared>,
    loader_worker: Mutex<RenderWorker>,
    upload_thread: Option<JoinHandle<()>>,
    stream_threads: Vec<JoinHandle<()>>,
}

impl TextureCache {
    pub fn new(
        device: Arc<dyn RenderDevice>,
        shader_library: Arc<ShaderLibrary>,
        stream_thread_count: u32,
        developer_mode: bool,
    ) -> Self {
        let upload_pool = device.create_pool(&RenderPoolDesc {
            use_linear_algorithm: true,
            allow_only_buffers: true,
        });

        let shared = Arc::new(Shared {
            device: Arc::clone(&device),
            shader_library,
            developer_mode,
            running: AtomicBool::new(true),
            upload_queue: Mutex::new(UploadQueues::default()),
            upload_queue_changed: Condvar::new(),
            upload_queue_finished: Condvar::new(),
            stream_queue: Mutex::new(StreamQueue {
                descriptions: VecDeque::new(),
                active_count: stream_thread_count as i32,
            }),
            stream_queue_changed: Condvar::new(),
            streamed_textures: Mutex::new(Vec::new()),
            map_state: Mutex::new(MapState {
                map: TextureMap::new(),
                lock_counter: 0,
            }),
            replacement_map: Mutex::new(ReplacementMap::new()),
            upload_pool: Mutex::new(upload_pool),
            tmem_name_counter: AtomicU32::new(0),
            rgba_name_counter: AtomicU32::new(0),
        });

        let upload_shared = Arc::clone(&shared);
        let upload_thread = std::thread::Builder::new()
            .name("retex64-upload".to_string())
            .spawn(move || upload_thread_loop(&upload_shared))
            .expect("failed to spawn the upload thread");

        let mut stream_threads = Vec::with_capacity(stream_thread_count as usize);
        for i in 0..stream_thread_count {
            let stream_shared = Arc::clone(&shared);
            stream_threads.push(
                std::thread::Builder::new()
                    .name(format!("retex64-stream-{i}"))
                    .spawn(move || stream_thread_loop(&stream_shared))
                    .expect("failed to spawn a stream thread"),
            );
        }

        Self {
            shared,
            loader_worker: Mutex::new(RenderWorker::new(device, RenderCommandListType::Direct)),
            upload_thread: Some(upload_thread),
            stream_threads,
        }
    }

    // --- Submission interface (render thread) ---

    /// Queues a TMEM upload and returns immediately.
    pub fn queue_upload(&self, upload: TextureUpload) {
        assert!(!upload.bytes_tmem.is_empty());
        if upload.decode_tmem {
            debug_assert!(upload.width > 0 && upload.height > 0);
        }

        self.shared.upload_queue.lock().unwrap().uploads.push(upload);
        self.shared.upload_queue_changed.notify_all();
    }

    /// Blocks until the upload queue has fully drained.
    pub fn wait_for_gpu_uploads(&self) {
        let mut queues = self.shared.upload_queue.lock().unwrap();
        while !queues.uploads.is_empty() {
            queues = self.shared.upload_queue_finished.wait(queues).unwrap();
        }
    }

    pub fn use_texture(&self, hash: u64, submission_frame: u64) -> Option<UseResult> {
        self.shared
            .map_state
            .lock()
            .unwrap()
            .map
            .use_texture(hash, submission_frame)
    }

    pub fn evict(&self, submission_frame: u64, evicted_hashes: &mut Vec<u64>) -> bool {
        self.shared
            .map_state
            .lock()
            .unwrap()
            .map
            .evict(submission_frame, evicted_hashes)
    }

    pub fn get_texture(&self, handle: u32) -> Option<Arc<Texture>> {
        self.shared.map_state.lock().unwrap().map.get(handle).cloned()
    }

    /// Currently installed replacement for a resident hash.
    pub fn replacement_texture(&self, hash: u64) -> Option<Arc<Texture>> {
        let state = self.shared.map_state.lock().unwrap();
        let handle = state.map.handle(hash)?;
        state.map.replacement(handle).cloned()
    }

    pub fn set_replacements_enabled(&self, enabled: bool) {
        self.shared.map_state.lock().unwrap().map.replacement_map_enabled = enabled;
    }

    // --- Lock protocol ---

    /// Brackets a period during which the caller holds texture references.
    pub fn increment_lock(&self) {
        self.shared.map_state.lock().unwrap().lock_counter += 1;
    }

    /// On the transition to zero, deferred releases run and streamed
    /// replacements are published to the map.
    pub fn decrement_lock(&self) {
        let mut state = self.shared.map_state.lock().unwrap();
        debug_assert!(state.lock_counter > 0);
        state.lock_counter -= 1;
        if state.lock_counter != 0 {
            return;
        }

        drop(state.map.take_evicted());
        {
            let mut replacement_map = self.shared.replacement_map.lock().unwrap();
            drop(std::mem::take(&mut replacement_map.evicted_textures));
        }

        let pairs = std::mem::take(&mut *self.shared.streamed_textures.lock().unwrap());
        for pair in pairs {
            state.map.replace(pair.hash, pair.texture, false);
        }
    }

    // --- Replacement management ---

    /// Loads the file at `relative_path` right away, records it in the
    /// database under `hash`, and installs it in the map.
    pub fn add_replacement(&self, hash: u64, relative_path: &str) -> bool {
        let mut state = self.shared.map_state.lock().unwrap();

        let file_path = {
            let replacement_map = self.shared.replacement_map.lock().unwrap();
            if replacement_map.directory_path.as_os_str().is_empty() {
                return false;
            }
            replacement_map.directory_path.join(relative_path)
        };

        let Some(bytes) = load_bytes_from_path(&file_path) else {
            return false;
        };

        // Several hashes may point at the same file; reuse its texture.
        let existing = {
            self.shared
                .replacement_map
                .lock()
                .unwrap()
                .get_from_relative_path(relative_path)
        };
        let texture = match existing {
            Some(texture) => texture,
            None => {
                let mut worker = self.loader_worker.lock().unwrap();
                let mut upload_resource = None;
                let loaded = worker.execute(|worker| {
                    load_texture_from_bytes(worker, &bytes, &mut upload_resource, None, 0, 0)
                });
                let Some(texture) = loaded else {
                    return false;
                };

                let texture = Arc::new(texture);
                self.shared
                    .replacement_map
                    .lock()
                    .unwrap()
                    .add_loaded_texture(Arc::clone(&texture), relative_path);
                texture
            }
        };

        {
            let mut replacement_map = self.shared.replacement_map.lock().unwrap();
            replacement_map.db.add_replacement(ReplacementTexture {
                path: relative_path.to_string(),
                hashes: ReplacementHashes {
                    rt64: ReplacementDatabase::hash_to_string(hash),
                    rice: String::new(),
                },
                ..ReplacementTexture::default()
            });
        }

        state.map.replace(hash, texture, false);
        true
    }

    /// Switches the active replacement directory: quiesces streaming,
    /// clears the previous pack, loads the database and the low-mip cache,
    /// and re-checks every resident texture against the new directory.
    pub fn load_replacement_directory(&self, directory_path: &Path) -> bool {
        {
            let mut queue = self.shared.stream_queue.lock().unwrap();
            queue.descriptions.clear();
        }
        self.wait_for_all_stream_threads();

        let resident = {
            let mut state = self.shared.map_state.lock().unwrap();
            let mut replacement_map = self.shared.replacement_map.lock().unwrap();
            state.map.clear_replacements();

            let mut evicted = std::mem::take(&mut replacement_map.evicted_textures);
            replacement_map.clear(&mut evicted);
            replacement_map.evicted_textures = evicted;
            replacement_map.directory_path = directory_path.to_path_buf();

            match fs::File::open(directory_path.join(REPLACEMENT_DATABASE_FILENAME)) {
                Ok(file) => {
                    replacement_map.read_database(BufReader::new(file));
                }
                Err(_) => {
                    replacement_map.db = ReplacementDatabase::default();
                }
            }

            replacement_map.resolved_path_map =
                replacement_map.db.resolve_paths(directory_path, false);

            // The low-mip cache is optional; a broken one only costs the
            // stand-ins.
            if let Some(bytes) = load_bytes_from_path(&directory_path.join(LOW_MIP_CACHE_FILENAME))
            {
                let mut worker = self.loader_worker.lock().unwrap();
                let mut upload_resource = None;
                let mut textures = HashMap::new();
                let complete = worker.execute(|worker| {
                    set_low_mip_cache(worker, &bytes, &mut upload_resource, &mut textures)
                });
                if !complete {
                    warn!(
                        "Malformed record in '{}'; later stand-ins were skipped",
                        LOW_MIP_CACHE_FILENAME
                    );
                }
                replacement_map.low_mip_cache_textures = textures;
            }

            state.map.resident_textures()
        };

        {
            let mut queues = self.shared.upload_queue.lock().unwrap();
            queues.replacement_checks.clear();
            for (hash, width, height) in resident {
                queues.replacement_checks.push(ReplacementCheck {
                    texture_hash: hash,
                    database_hash: hash,
                    min_mip_width: width,
                    min_mip_height: height,
                });
            }
        }
        self.shared.upload_queue_changed.notify_all();

        true
    }

    /// Writes the database next to its directory through the
    /// `.new`/`.old` rename chain so a crash never corrupts the current
    /// file.
    pub fn save_replacement_database(&self) -> bool {
        let replacement_map = self.shared.replacement_map.lock().unwrap();
        if replacement_map.directory_path.as_os_str().is_empty() {
            return false;
        }

        let database_path = replacement_map
            .directory_path
            .join(REPLACEMENT_DATABASE_FILENAME);
        let new_path = replacement_map
            .directory_path
            .join(format!("{REPLACEMENT_DATABASE_FILENAME}.new"));
        let old_path = replacement_map
            .directory_path
            .join(format!("{REPLACEMENT_DATABASE_FILENAME}.old"));

        let file = match fs::File::create(&new_path) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open '{}' for writing: {e}", new_path.display());
                return false;
            }
        };
        let mut writer = BufWriter::new(file);
        if !replacement_map.save_database(&mut writer) {
            return false;
        }
        if let Err(e) = writer.flush() {
            error!("Failed to write '{}': {e}", new_path.display());
            return false;
        }
        drop(writer);

        if database_path.exists() {
            if old_path.exists()
                && let Err(e) = fs::remove_file(&old_path)
            {
                error!("{e}");
                return false;
            }

            if let Err(e) = fs::rename(&database_path, &old_path) {
                error!("{e}");
                return false;
            }
        }

        if let Err(e) = fs::rename(&new_path, &database_path) {
            error!("{e}");
            return false;
        }

        true
    }

    pub fn remove_unused_entries_from_database(&self) {
        let mut replacement_map = self.shared.replacement_map.lock().unwrap();
        if replacement_map.directory_path.as_os_str().is_empty() {
            return;
        }

        replacement_map.remove_unused_entries_from_database();
    }

    /// Blocks until every stream thread is idle and the queue is empty.
    pub fn wait_for_all_stream_threads(&self) {
        let mut queue = self.shared.stream_queue.lock().unwrap();
        while !queue.descriptions.is_empty() || queue.active_count > 0 {
            queue = self.shared.stream_queue_changed.wait(queue).unwrap();
        }
    }
}

impl Drop for TextureCache {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);

        // Touch each queue mutex so no worker can check the running flag
        // and miss the wakeup that follows.
        drop(self.shared.upload_queue.lock().unwrap());
        self.shared.upload_queue_changed.notify_all();
        self.shared.upload_queue_finished.notify_all();
        drop(self.shared.stream_queue.lock().unwrap());
        self.shared.stream_queue_changed.notify_all();

        if let Some(thread) = self.upload_thread.take() {
            let _ = thread.join();
        }
        for thread in self.stream_threads.drain(..) {
            let _ = thread.join();
        }
    }
}

// --- Upload thread ---

fn upload_thread_loop(shared: &Shared) {
    let mut worker = RenderWorker::new(Arc::clone(&shared.device), RenderCommandListType::Direct);
    let mut tmem_upload_resources: Vec<Box<dyn RenderBuffer>> = Vec::new();
    let mut descriptor_sets: Vec<TextureDecodeDescriptorSet> = Vec::new();
    let mut replacement_upload_resources: Vec<Box<dyn RenderBuffer>> = Vec::new();

    loop {
        // Snapshot the current upload batch and drain the check queue.
        let (queue_copy, mut checks) = {
            let mut queues = shared.upload_queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if !queues.uploads.is_empty() || !queues.replacement_checks.is_empty() {
                    break;
                }
                queues = shared.upload_queue_changed.wait(queues).unwrap();
            }
            (
                queues.uploads.clone(),
                std::mem::take(&mut queues.replacement_checks),
            )
        };

        let batch_size = queue_copy.len();

        // Grow the per-slot staging buffers and descriptor sets on demand.
        {
            let mut pool = shared.upload_pool.lock().unwrap();
            for _ in tmem_upload_resources.len()..batch_size {
                tmem_upload_resources
                    .push(pool.create_buffer(&RenderBufferDesc::upload(tmem::TMEM_BYTES as u64)));
            }
        }
        for _ in descriptor_sets.len()..batch_size {
            descriptor_sets.push(TextureDecodeDescriptorSet::new(shared.device.as_ref()));
        }

        let mut uploaded: Vec<(u64, Texture)> = Vec::with_capacity(batch_size);
        let mut replaced: Vec<HashTexturePair> = Vec::new();

        worker.execute(|worker| {
            // Create every GPU object for the batch and stage the TMEM
            // bytes into the per-slot buffers.
            for (i, upload) in queue_copy.iter().enumerate() {
                let mut texture = Texture::new();
                texture.creation_frame = upload.creation_frame;
                texture.format = RenderFormat::R8Uint;
                texture.width = upload.width;
                texture.height = upload.height;
                if shared.developer_mode {
                    texture.bytes_tmem = upload.bytes_tmem.clone();
                }

                let tmem_texture = worker.device.create_texture(&RenderTextureDesc::texture_1d(
                    upload.bytes_tmem.len() as u32,
                    1,
                    RenderFormat::R8Uint,
                ));
                tmem_texture.set_name(&format!(
                    "Texture Cache TMEM #{}",
                    shared.tmem_name_counter.fetch_add(1, Ordering::Relaxed)
                ));
                texture.tmem = Some(tmem_texture);

                tmem_upload_resources[i].map(&mut |data| {
                    data[..upload.bytes_tmem.len()].copy_from_slice(&upload.bytes_tmem);
                });

                if upload.decode_tmem {
                    let mut desc = RenderTextureDesc::texture_2d(
                        upload.width,
                        upload.height,
                        1,
                        RenderFormat::R8G8B8A8Unorm,
                    );
                    desc.storage = true;
                    texture.format = RenderFormat::R8G8B8A8Unorm;
                    let decoded = worker.device.create_texture(&desc);
                    decoded.set_name(&format!(
                        "Texture Cache RGBA32 #{}",
                        shared.rgba_name_counter.fetch_add(1, Ordering::Relaxed)
                    ));
                    texture.texture = Some(decoded);

                    let set = &mut descriptor_sets[i];
                    set.set.set_texture(
                        TextureDecodeDescriptorSet::TMEM_SLOT,
                        texture.tmem.as_deref().unwrap(),
                        RenderTextureLayout::ShaderRead,
                    );
                    set.set.set_texture(
                        TextureDecodeDescriptorSet::RGBA32_SLOT,
                        texture.texture.as_deref().unwrap(),
                        RenderTextureLayout::General,
                    );
                }

                uploaded.push((upload.hash, texture));
            }

            // All TMEM textures transition to copy destinations at once.
            let before_copy: Vec<RenderTextureBarrier> = uploaded
                .iter()
                .map(|(_, texture)| {
                    RenderTextureBarrier::new(
                        texture.tmem.as_deref().unwrap(),
                        RenderTextureLayout::CopyDest,
                    )
                })
                .collect();
            worker
                .command_list
                .texture_barriers(RenderBarrierStage::Copy, &before_copy);
            drop(before_copy);

            for (i, upload) in queue_copy.iter().enumerate() {
                let byte_count = upload.bytes_tmem.len() as u32;
                worker.command_list.copy_texture_region(
                    &RenderTextureSubresource::new(uploaded[i].1.tmem.as_deref().unwrap(), 0),
                    &RenderBufferFootprint::new(
                        tmem_upload_resources[i].as_ref(),
                        RenderFormat::R8Uint,
                        byte_count,
                        1,
                        1,
                        byte_count,
                        0,
                    ),
                );
            }

            // TMEM becomes readable; decode targets become writable.
            let mut before_decode: Vec<RenderTextureBarrier> =
                Vec::with_capacity(uploaded.len() * 2);
            for (i, upload) in queue_copy.iter().enumerate() {
                before_decode.push(RenderTextureBarrier::new(
                    uploaded[i].1.tmem.as_deref().unwrap(),
                    RenderTextureLayout::ShaderRead,
                ));
                if upload.decode_tmem {
                    before_decode.push(RenderTextureBarrier::new(
                        uploaded[i].1.texture.as_deref().unwrap(),
                        RenderTextureLayout::General,
                    ));
                }
            }
            worker
                .command_list
                .texture_barriers(RenderBarrierStage::Compute, &before_decode);
            drop(before_decode);

            let mut pipeline_set = false;
            for (i, upload) in queue_copy.iter().enumerate() {
                if !upload.decode_tmem {
                    continue;
                }

                if !pipeline_set {
                    worker
                        .command_list
                        .set_pipeline(shared.shader_library.texture_decode.pipeline.as_ref());
                    worker.command_list.set_compute_pipeline_layout(
                        shared.shader_library.texture_decode.pipeline_layout.as_ref(),
                    );
                    pipeline_set = true;
                }

                let decode_cb = TextureDecodeCB {
                    resolution: [upload.width, upload.height],
                    fmt: u32::from(upload.load_tile.fmt),
                    siz: u32::from(upload.load_tile.siz),
                    address: u32::from(upload.load_tile.tmem) << 3,
                    stride: u32::from(upload.load_tile.line) << 3,
                    tlut: upload.tlut,
                    palette: u32::from(upload.load_tile.palette),
                };
                worker
                    .command_list
                    .set_compute_push_constants(0, bytemuck::bytes_of(&decode_cb));
                worker
                    .command_list
                    .set_compute_descriptor_set(descriptor_sets[i].set.as_ref(), 0);
                worker.command_list.dispatch(
                    upload.width.div_ceil(DECODE_THREAD_GROUP_SIZE),
                    upload.height.div_ceil(DECODE_THREAD_GROUP_SIZE),
                    1,
                );
            }

            let after_decode: Vec<RenderTextureBarrier> = queue_copy
                .iter()
                .enumerate()
                .filter(|(_, upload)| upload.decode_tmem)
                .map(|(i, _)| {
                    RenderTextureBarrier::new(
                        uploaded[i].1.texture.as_deref().unwrap(),
                        RenderTextureLayout::ShaderRead,
                    )
                })
                .collect();
            if !after_decode.is_empty() {
                worker
                    .command_list
                    .texture_barriers(RenderBarrierStage::Compute, &after_decode);
            }
            drop(after_decode);

            // Databases recorded with an older hasher need TMEM rehashed
            // with that revision before the lookup.
            let hash_version = shared.replacement_map.lock().unwrap().db.config.hash_version;
            for upload in &queue_copy {
                if upload.width > 0 && upload.height > 0 {
                    let database_hash = if hash_version < tmem::CURRENT_HASH_VERSION {
                        tmem::hash_tmem(
                            &upload.bytes_tmem,
                            &upload.load_tile,
                            upload.width,
                            upload.height,
                            upload.tlut,
                            hash_version,
                        )
                    } else {
                        upload.hash
                    };
                    checks.push(ReplacementCheck {
                        texture_hash: upload.hash,
                        database_hash,
                        min_mip_width: upload.width,
                        min_mip_height: upload.height,
                    });
                }
            }

            for check in &checks {
                process_replacement_check(
                    shared,
                    worker,
                    check,
                    &mut replacement_upload_resources,
                    &mut replaced,
                );
            }
        });

        replacement_upload_resources.clear();

        // Publish the batch to the map.
        {
            let mut state = shared.map_state.lock().unwrap();
            for (hash, texture) in uploaded {
                let creation_frame = texture.creation_frame;
                state.map.add(hash, creation_frame, Arc::new(texture));
            }
            for pair in replaced {
                state.map.replace(pair.hash, pair.texture, pair.low_priority);
            }
        }

        // Keep whatever was submitted while this batch was in flight.
        {
            let mut queues = shared.upload_queue.lock().unwrap();
            queues.uploads.drain(..batch_size);
        }
        shared.upload_queue_finished.notify_all();
    }
}

/// Resolves one replacement check: reuse an already loaded file, schedule
/// a stream (with an optional low-mip stand-in), or load directly on the
/// calling thread for the blocking policies.
fn process_replacement_check(
    shared: &Shared,
    worker: &mut RenderWorker,
    check: &ReplacementCheck,
    upload_resources: &mut Vec<Box<dyn RenderBuffer>>,
    replaced: &mut Vec<HashTexturePair>,
) {
    let (relative_path, load, file_path, already_loaded) = {
        let replacement_map = shared.replacement_map.lock().unwrap();
        let Some(resolved) = replacement_map.get_information_from_hash(check.database_hash) else {
            return;
        };

        let relative_path = resolved.relative_path.clone();
        let load = replacement_map
            .db
            .textures
            .get(resolved.record_index as usize)
            .map(|texture| texture.load)
            .unwrap_or_default();
        let file_path = replacement_map.directory_path.join(&relative_path);
        let already_loaded = replacement_map.get_from_relative_path(&relative_path);
        (relative_path, load, file_path, already_loaded)
    };

    if let Some(texture) = already_loaded {
        replaced.push(HashTexturePair {
            hash: check.texture_hash,
            texture,
            low_priority: false,
        });
        return;
    }

    if !file_path.exists() {
        // The database references a file the pack no longer ships.
        return;
    }

    match load {
        ReplacementLoad::Stream | ReplacementLoad::Async => {
            {
                let mut queue = shared.stream_queue.lock().unwrap();
                queue.descriptions.push_back(StreamDescription {
                    hash: check.texture_hash,
                    file_path,
                    relative_path: relative_path.clone(),
                    min_mip_width: check.min_mip_width,
                    min_mip_height: check.min_mip_height,
                });
            }
            shared.stream_queue_changed.notify_all();

            // Streamed entries show their low-mip stand-in immediately.
            if load == ReplacementLoad::Stream {
                let stand_in = {
                    let mut replacement_map = shared.replacement_map.lock().unwrap();
                    replacement_map
                        .low_mip_cache_textures
                        .get_mut(&relative_path)
                        .map(|low_mip| {
                            let needs_transition = !low_mip.transitioned;
                            low_mip.transitioned = true;
                            (Arc::clone(&low_mip.texture), needs_transition)
                        })
                };

                if let Some((texture, needs_transition)) = stand_in {
                    if needs_transition {
                        worker.command_list.texture_barriers(
                            RenderBarrierStage::Compute,
                            &[RenderTextureBarrier::new(
                                texture.texture.as_deref().unwrap(),
                                RenderTextureLayout::ShaderRead,
                            )],
                        );
                    }

                    replaced.push(HashTexturePair {
                        hash: check.texture_hash,
                        texture,
                        low_priority: true,
                    });
                }
            }
        }
        ReplacementLoad::Preload | ReplacementLoad::Stall => {
            let Some(bytes) = load_bytes_from_path(&file_path) else {
                return;
            };

            let mut upload_resource = None;
            let loaded = load_texture_from_bytes(
                worker,
                &bytes,
                &mut upload_resource,
                Some(&shared.upload_pool),
                check.min_mip_width,
                check.min_mip_height,
            );
            if let Some(resource) = upload_resource {
                upload_resources.push(resource);
            }
            let Some(texture) = loaded else {
                return;
            };

            let texture = Arc::new(texture);
            {
                let mut replacement_map = shared.replacement_map.lock().unwrap();
                if replacement_map
                    .get_from_relative_path(&relative_path)
                    .is_none()
                {
                    replacement_map.add_loaded_texture(Arc::clone(&texture), &relative_path);
                }
            }

            replaced.push(HashTexturePair {
                hash: check.texture_hash,
                texture,
                low_priority: false,
            });
        }
    }
}

// --- Stream threads ---

fn stream_thread_loop(shared: &Shared) {
    let mut worker = RenderWorker::new(Arc::clone(&shared.device), RenderCommandListType::Compute);
    let mut upload_resource: Option<Box<dyn RenderBuffer>> = None;

    loop {
        let description = {
            let mut queue = shared.stream_queue.lock().unwrap();
            loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                if let Some(description) = queue.descriptions.pop_front() {
                    break description;
                }

                queue.active_count -= 1;
                shared.stream_queue_changed.notify_all();
                queue = shared.stream_queue_changed.wait(queue).unwrap();
                queue.active_count += 1;
            }
        };

        // Another stream thread may have already loaded this file.
        let existing = {
            shared
                .replacement_map
                .lock()
                .unwrap()
                .get_from_relative_path(&description.relative_path)
        };

        let texture = match existing {
            Some(texture) => Some(texture),
            None => load_bytes_from_path(&description.file_path).and_then(|bytes| {
                let loaded = worker.execute(|worker| {
                    load_texture_from_bytes(
                        worker,
                        &bytes,
                        &mut upload_resource,
                        None,
                        description.min_mip_width,
                        description.min_mip_height,
                    )
                });
                loaded.map(|texture| {
                    let texture = Arc::new(texture);
                    let mut replacement_map = shared.replacement_map.lock().unwrap();
                    match replacement_map.get_from_relative_path(&description.relative_path) {
                        Some(existing) => existing,
                        None => {
                            replacement_map
                                .add_loaded_texture(Arc::clone(&texture), &description.relative_path);
                            texture
                        }
                    }
                })
            }),
        };

        // Delivered pairs are applied the next time the cache unlocks.
        if let Some(texture) = texture {
            shared.streamed_textures.lock().unwrap().push(HashTexturePair {
                hash: description.hash,
                texture,
                low_priority: false,
            });
        }
    }
}

// --- Image decoders ---

fn load_bytes_from_path(path: &Path) -> Option<Vec<u8>> {
    fs::read(path).ok()
}

/// Uploads tightly packed RGBA8 pixels, re-striding rows to the device's
/// row alignment inside the staging buffer.
fn set_rgba32(
    dst: &mut Texture,
    worker: &mut RenderWorker,
    bytes: &[u8],
    width: u32,
    height: u32,
    row_pitch: u32,
    dst_upload: &mut Option<Box<dyn RenderBuffer>>,
    pool: Option<&Mutex<Box<dyn RenderPool>>>,
) {
    debug_assert!(width > 0 && height > 0);

    dst.format = RenderFormat::R8G8B8A8Unorm;
    dst.width = width;
    dst.height = height;
    dst.mipmaps = 1;

    let alignment = worker.device.capabilities().row_alignment;
    let (row_byte_width, row_byte_padding) = calculate_texture_row_width_padding(row_pitch, alignment);

    let texture = worker
        .device
        .create_texture(&RenderTextureDesc::texture_2d(width, height, 1, dst.format));

    let buffer_size = u64::from(row_byte_width) * u64::from(height);
    let buffer = match pool {
        Some(pool) => pool
            .lock()
            .unwrap()
            .create_buffer(&RenderBufferDesc::upload(buffer_size)),
        None => worker.device.create_buffer(&RenderBufferDesc::upload(buffer_size)),
    };

    buffer.map(&mut |data| {
        if row_byte_padding == 0 {
            data[..bytes.len()].copy_from_slice(bytes);
        } else {
            let row_pitch = row_pitch as usize;
            let mut src_offset = 0usize;
            let mut dst_offset = 0usize;
            while src_offset + row_pitch <= bytes.len() {
                data[dst_offset..dst_offset + row_pitch]
                    .copy_from_slice(&bytes[src_offset..src_offset + row_pitch]);
                src_offset += row_pitch;
                dst_offset += row_byte_width as usize;
            }
        }
    });

    let row_width = row_byte_width / dst.format.element_size();
    worker.command_list.texture_barriers(
        RenderBarrierStage::Copy,
        &[RenderTextureBarrier::new(
            texture.as_ref(),
            RenderTextureLayout::CopyDest,
        )],
    );
    worker.command_list.copy_texture_region(
        &RenderTextureSubresource::new(texture.as_ref(), 0),
        &RenderBufferFootprint::new(buffer.as_ref(), dst.format, width, height, 1, row_width, 0),
    );
    worker.command_list.texture_barriers(
        RenderBarrierStage::Compute,
        &[RenderTextureBarrier::new(
            texture.as_ref(),
            RenderTextureLayout::ShaderRead,
        )],
    );

    dst.texture = Some(texture);
    *dst_upload = Some(buffer);
}

/// Uploads a DDS file: the mip chain is truncated to levels that are at
/// least the replaced texture's size, packed into one staging buffer with
/// 16-byte aligned mip offsets, and copied level by level.
fn set_dds(
    dst: &mut Texture,
    worker: &mut RenderWorker,
    bytes: &[u8],
    dst_upload: &mut Option<Box<dyn RenderBuffer>>,
    pool: Option<&Mutex<Box<dyn RenderPool>>>,
    min_mip_width: u32,
    min_mip_height: u32,
) -> bool {
    let Some(descriptor) = dds::decode_header(bytes) else {
        return false;
    };

    let format = descriptor.render_format();
    if format == RenderFormat::Unknown {
        warn!("Unsupported DDS format {}", descriptor.dxgi_format);
        return false;
    }

    let mut mip_levels = 1u32;
    while mip_levels < descriptor.mip_count {
        let (mip_width, mip_height) = descriptor.mip_dimensions(mip_levels);
        if mip_width < min_mip_width || mip_height < min_mip_height {
            break;
        }

        mip_levels += 1;
    }

    let dimension = match descriptor.texture_type {
        dds::DdsTextureType::Texture1D => RenderTextureDimension::Texture1D,
        dds::DdsTextureType::Texture2D => RenderTextureDimension::Texture2D,
        dds::DdsTextureType::Texture3D => RenderTextureDimension::Texture3D,
    };
    let texture = worker.device.create_texture(&RenderTextureDesc {
        dimension,
        width: descriptor.width,
        height: descriptor.height,
        depth: descriptor.depth,
        mip_levels,
        format,
        storage: false,
    });

    dst.width = descriptor.width;
    dst.height = descriptor.height;
    dst.mipmaps = mip_levels;
    dst.format = format;

    let image_data = &bytes[descriptor.header_size..];

    // Mip blobs need 16-byte alignment inside the staging buffer.
    const DATA_ALIGNMENT: usize = 16;
    let mut padding = 0usize;
    let mut mip_offsets = Vec::with_capacity(mip_levels as usize);
    for mip in 0..mip_levels {
        let aligned = descriptor.mip_offset(mip) + padding;
        if aligned % DATA_ALIGNMENT != 0 {
            padding += DATA_ALIGNMENT - (aligned % DATA_ALIGNMENT);
        }

        mip_offsets.push(descriptor.mip_offset(mip) + padding);
    }

    let buffer_size = (image_data.len() + padding) as u64;
    let buffer = match pool {
        Some(pool) => pool
            .lock()
            .unwrap()
            .create_buffer(&RenderBufferDesc::upload(buffer_size)),
        None => worker.device.create_buffer(&RenderBufferDesc::upload(buffer_size)),
    };

    buffer.map(&mut |data| {
        data.fill(0);
        for mip in 0..mip_levels {
            let source_offset = descriptor.mip_offset(mip);
            let source_size = if mip + 1 < descriptor.mip_count {
                descriptor.mip_offset(mip + 1) - source_offset
            } else {
                image_data.len() - source_offset
            };
            let target_offset = mip_offsets[mip as usize];
            data[target_offset..target_offset + source_size]
                .copy_from_slice(&image_data[source_offset..source_offset + source_size]);
        }
    });

    worker.command_list.buffer_barriers(
        RenderBarrierStage::Copy,
        &[RenderBufferBarrier::new(buffer.as_ref(), RenderBufferAccess::Read)],
    );
    worker.command_list.texture_barriers(
        RenderBarrierStage::Copy,
        &[RenderTextureBarrier::new(
            texture.as_ref(),
            RenderTextureLayout::CopyDest,
        )],
    );

    for mip in 0..mip_levels {
        let (mip_width, mip_height) = descriptor.mip_dimensions(mip);
        worker.command_list.copy_texture_region(
            &RenderTextureSubresource::new(texture.as_ref(), mip),
            &RenderBufferFootprint::new(
                buffer.as_ref(),
                format,
                mip_width,
                mip_height,
                1,
                mip_width,
                mip_offsets[mip as usize] as u64,
            ),
        );
    }

    worker.command_list.texture_barriers(
        RenderBarrierStage::Compute,
        &[RenderTextureBarrier::new(
            texture.as_ref(),
            RenderTextureLayout::ShaderRead,
        )],
    );

    dst.texture = Some(texture);
    *dst_upload = Some(buffer);
    true
}

/// Decodes file bytes by magic number. Unknown containers yield `None`.
fn load_texture_from_bytes(
    worker: &mut RenderWorker,
    file_bytes: &[u8],
    dst_upload: &mut Option<Box<dyn RenderBuffer>>,
    pool: Option<&Mutex<Box<dyn RenderPool>>>,
    min_mip_width: u32,
    min_mip_height: u32,
) -> Option<Texture> {
    if file_bytes.len() < 4 {
        return None;
    }

    let magic = u32::from_le_bytes(file_bytes[..4].try_into().unwrap());
    let mut texture = Texture::new();
    let loaded = match magic {
        dds::DDS_MAGIC => set_dds(
            &mut texture,
            worker,
            file_bytes,
            dst_upload,
            pool,
            min_mip_width,
            min_mip_height,
        ),
        PNG_MAGIC => match image::load_from_memory_with_format(file_bytes, image::ImageFormat::Png)
        {
            Ok(decoded) => {
                let rgba = decoded.to_rgba8();
                let (width, height) = rgba.dimensions();
                set_rgba32(
                    &mut texture,
                    worker,
                    rgba.as_raw(),
                    width,
                    height,
                    width * 4,
                    dst_upload,
                    pool,
                );
                true
            }
            Err(e) => {
                error!("PNG decoding error: {e}");
                false
            }
        },
        _ => false,
    };

    loaded.then_some(texture)
}

/// Walks a whole low-mip container buffer, creating a stand-in texture per
/// record and enqueueing its mip copies. Returns false when the walk ended
/// on a malformed record; textures parsed before it are kept.
fn set_low_mip_cache(
    worker: &mut RenderWorker,
    bytes: &[u8],
    dst_upload: &mut Option<Box<dyn RenderBuffer>>,
    dst_map: &mut HashMap<String, LowMipCacheTexture>,
) -> bool {
    let buffer = worker
        .device
        .create_buffer(&RenderBufferDesc::upload(bytes.len() as u64));
    buffer.map(&mut |data| data[..bytes.len()].copy_from_slice(bytes));

    let mut reader = LowMipReader::new(bytes);
    for record in reader.by_ref() {
        let format = dds::dxgi_to_render_format(record.dxgi_format);
        if format == RenderFormat::Unknown {
            warn!(
                "Unsupported format {} for stand-in '{}'",
                record.dxgi_format, record.path
            );
            continue;
        }

        let gpu_texture = worker.device.create_texture(&RenderTextureDesc::texture_2d(
            record.width,
            record.height,
            record.mip_count,
            format,
        ));

        worker.command_list.texture_barriers(
            RenderBarrierStage::Copy,
            &[RenderTextureBarrier::new(
                gpu_texture.as_ref(),
                RenderTextureLayout::CopyDest,
            )],
        );
        for mip in 0..record.mip_count {
            let (mip_width, mip_height) = record.mip_dimensions(mip);
            worker.command_list.copy_texture_region(
                &RenderTextureSubresource::new(gpu_texture.as_ref(), mip),
                &RenderBufferFootprint::new(
                    buffer.as_ref(),
                    format,
                    mip_width,
                    mip_height,
                    1,
                    mip_width,
                    record.mip_offsets[mip as usize] as u64,
                ),
            );
        }

        let mut texture = Texture::new();
        texture.format = format;
        texture.width = record.width;
        texture.height = record.height;
        texture.mipmaps = record.mip_count;
        texture.texture = Some(gpu_texture);
        dst_map.insert(
            record.path.clone(),
            LowMipCacheTexture {
                texture: Arc::new(texture),
                transitioned: false,
            },
        );
    }

    *dst_upload = Some(buffer);
    !reader.failed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gfx::headless::{self, HeadlessDevice, as_headless};
    use crate::low_mip;
    use crate::texture_map::RENDER_QUEUE_DEPTH;
    use serde_json::json;

    fn new_cache(device: &Arc<HeadlessDevice>) -> TextureCache {
        TextureCache::new(
            Arc::clone(device) as Arc<dyn RenderDevice>,
            headless::shader_library(),
            1,
            false,
        )
    }

    fn upload(hash: u64, frame: u64, width: u32, height: u32, decode: bool) -> TextureUpload {
        TextureUpload {
            hash,
            creation_frame: frame,
            width,
            height,
            tlut: 0,
            load_tile: LoadTile {
                fmt: 0,
                siz: 2,
                line: (width / 4).max(1) as u16,
                tmem: 0,
                palette: 0,
            },
            bytes_tmem: vec![0xAB; (width * height * 2).max(8) as usize],
            decode_tmem: decode,
        }
    }

    fn write_database(dir: &Path, textures: serde_json::Value) {
        let document = json!({
            "configuration": {
                "autoPath": "rt64",
                "configurationVersion": 2,
                "hashVersion": 2,
            },
            "textures": textures,
        });
        fs::write(
            dir.join(REPLACEMENT_DATABASE_FILENAME),
            serde_json::to_string_pretty(&document).unwrap(),
        )
        .unwrap();
    }

    fn record_json(hash: u64, path: &str, load: &str) -> serde_json::Value {
        json!({
            "path": path,
            "load": load,
            "life": "pool",
            "hashes": { "rt64": ReplacementDatabase::hash_to_string(hash), "rice": "" },
        })
    }

    fn synthetic_dds(width: u32, height: u32, mip_count: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        dds::write_header(&mut bytes, width, height, mip_count, dds::DXGI_BC1_UNORM);
        let descriptor = dds::decode_header(&bytes).unwrap();
        for mip in 0..mip_count {
            bytes.extend(std::iter::repeat_n(0x30 + mip as u8, descriptor.mip_byte_size(mip)));
        }
        bytes
    }

    #[test]
    fn upload_then_use_then_evict() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);

        cache.queue_upload(upload(0xABCD, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        let result = cache.use_texture(0xABCD, 0).unwrap();
        assert!(!result.replaced);
        assert!(!result.has_mipmaps);
        assert_eq!(result.scale, [1.0, 1.0]);
        assert!(cache.get_texture(result.handle).is_some());

        let mut evicted = Vec::new();
        assert!(cache.evict(2 * RENDER_QUEUE_DEPTH, &mut evicted));
        assert_eq!(evicted, vec![0xABCD]);
        assert!(cache.use_texture(0xABCD, 2 * RENDER_QUEUE_DEPTH + 1).is_none());
    }

    #[test]
    fn decode_dispatches_one_tile_group_per_8x8() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);

        cache.queue_upload(upload(0x11, 0, 20, 9, true));
        cache.wait_for_gpu_uploads();

        let stats = device.stats();
        assert_eq!(stats.dispatches, 1);
        assert_eq!(stats.last_dispatch, [3, 2, 1]);

        let result = cache.use_texture(0x11, 0).unwrap();
        let texture = cache.get_texture(result.handle).unwrap();
        assert_eq!(texture.format, RenderFormat::R8G8B8A8Unorm);
        let gpu = as_headless(texture.texture.as_deref().unwrap());
        assert_eq!((gpu.desc.width, gpu.desc.height), (20, 9));
        assert!(gpu.desc.storage);
        assert!(gpu.name().starts_with("Texture Cache RGBA32 #"));
        let tmem = as_headless(texture.tmem.as_deref().unwrap());
        assert_eq!(tmem.desc.width, upload(0x11, 0, 20, 9, true).bytes_tmem.len() as u32);
    }

    #[test]
    fn developer_mode_retains_tmem_bytes() {
        let device = HeadlessDevice::new();
        let cache = TextureCache::new(
            Arc::clone(&device) as Arc<dyn RenderDevice>,
            headless::shader_library(),
            1,
            true,
        );

        let submitted = upload(0x77, 0, 8, 8, false);
        cache.queue_upload(submitted.clone());
        cache.wait_for_gpu_uploads();

        let handle = cache.use_texture(0x77, 0).unwrap().handle;
        let texture = cache.get_texture(handle).unwrap();
        assert_eq!(texture.bytes_tmem, submitted.bytes_tmem);
    }

    #[test]
    fn preload_replacement_is_applied_with_the_batch() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();
        let hash = 0xABCD;

        image::RgbaImage::new(16, 8)
            .save(dir.path().join("wall.png"))
            .unwrap();
        write_database(dir.path(), json!([record_json(hash, "wall.png", "preload")]));

        assert!(cache.load_replacement_directory(dir.path()));
        cache.queue_upload(upload(hash, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        let result = cache.use_texture(hash, 0).unwrap();
        assert!(result.replaced);
        assert!(!result.has_mipmaps);
        assert_eq!(result.scale, [2.0, 1.0]);

        let replacement = cache.replacement_texture(hash).unwrap();
        assert_eq!((replacement.width, replacement.height), (16, 8));
        assert_eq!(replacement.format, RenderFormat::R8G8B8A8Unorm);
    }

    #[test]
    fn streamed_replacement_uses_the_stand_in_until_delivery() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();
        let hash = 0xF00D;

        let dds_bytes = synthetic_dds(256, 256, 4);
        fs::write(dir.path().join("big.dds"), &dds_bytes).unwrap();

        let mut container = Vec::new();
        low_mip::extract_low_mips(&dds_bytes, "big.dds", &mut container).unwrap();
        fs::write(dir.path().join(LOW_MIP_CACHE_FILENAME), &container).unwrap();

        write_database(dir.path(), json!([record_json(hash, "big.dds", "stream")]));

        assert!(cache.load_replacement_directory(dir.path()));
        cache.queue_upload(upload(hash, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        // The low-mip stand-in is installed with the upload batch.
        let stand_in = cache.replacement_texture(hash).unwrap();
        assert_eq!((stand_in.width, stand_in.height), (64, 64));
        let result = cache.use_texture(hash, 0).unwrap();
        assert!(result.replaced);
        assert!(result.has_mipmaps);
        assert_eq!(result.scale, [8.0, 8.0]);

        // The full texture arrives once streaming finishes and the cache
        // unlocks.
        cache.wait_for_all_stream_threads();
        cache.increment_lock();
        cache.decrement_lock();

        let full = cache.replacement_texture(hash).unwrap();
        assert_eq!((full.width, full.height), (256, 256));
        assert_eq!(full.mipmaps, 4);
        assert_eq!(cache.use_texture(hash, 1).unwrap().scale, [32.0, 32.0]);
    }

    #[test]
    fn stream_delivery_reuses_an_already_loaded_file() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();

        image::RgbaImage::new(32, 32)
            .save(dir.path().join("shared.png"))
            .unwrap();
        write_database(
            dir.path(),
            json!([
                record_json(0x1111, "shared.png", "preload"),
                record_json(0x2222, "shared.png", "stream"),
            ]),
        );

        assert!(cache.load_replacement_directory(dir.path()));
        cache.queue_upload(upload(0x1111, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();
        cache.queue_upload(upload(0x2222, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        // The second hash reuses the texture loaded for the first; the
        // file is never decoded twice.
        let first = cache.replacement_texture(0x1111).unwrap();
        let second = cache.replacement_texture(0x2222).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn switching_directories_rechecks_resident_textures() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let hash = 0xBEEF;

        cache.queue_upload(upload(hash, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();
        assert!(cache.replacement_texture(hash).is_none());

        let dir = tempfile::tempdir().unwrap();
        image::RgbaImage::new(8, 8)
            .save(dir.path().join("late.png"))
            .unwrap();
        write_database(dir.path(), json!([record_json(hash, "late.png", "preload")]));

        assert!(cache.load_replacement_directory(dir.path()));
        // The re-queued checks ride the next upload batch.
        cache.queue_upload(upload(0x5555, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();
        assert!(cache.replacement_texture(hash).is_some());

        // An empty directory drops the replacement again.
        let empty = tempfile::tempdir().unwrap();
        assert!(cache.load_replacement_directory(empty.path()));
        assert!(cache.replacement_texture(hash).is_none());
        assert!(!cache.use_texture(hash, 1).unwrap().replaced);
    }

    #[test]
    fn unknown_container_magic_degrades_to_no_replacement() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();
        let hash = 0x9999;

        fs::write(dir.path().join("junk.png"), [0u8; 64]).unwrap();
        write_database(dir.path(), json!([record_json(hash, "junk.png", "preload")]));

        assert!(cache.load_replacement_directory(dir.path()));
        cache.queue_upload(upload(hash, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        assert!(cache.replacement_texture(hash).is_none());
        assert!(!cache.use_texture(hash, 0).unwrap().replaced);
    }

    #[test]
    fn low_mip_container_round_trips_through_the_loader() {
        let device = HeadlessDevice::new();
        let mut worker = RenderWorker::new(
            Arc::clone(&device) as Arc<dyn RenderDevice>,
            RenderCommandListType::Direct,
        );

        let big = synthetic_dds(256, 128, 5);
        let small = synthetic_dds(32, 32, 2);
        let mut container = Vec::new();
        low_mip::extract_low_mips(&big, "big.dds", &mut container).unwrap();
        low_mip::extract_low_mips(&small, "s/small.dds", &mut container).unwrap();

        let mut upload_resource = None;
        let mut textures = HashMap::new();
        let complete = worker.execute(|worker| {
            set_low_mip_cache(worker, &container, &mut upload_resource, &mut textures)
        });
        assert!(complete);
        assert_eq!(textures.len(), 2);

        // 256x128 is over the stand-in budget; extraction starts at 128x64.
        let big_texture = &textures["big.dds"].texture;
        assert_eq!(
            (big_texture.width, big_texture.height, big_texture.mipmaps),
            (128, 64, 4)
        );
        assert_eq!(big_texture.format, RenderFormat::BC1Unorm);

        let small_texture = &textures["s/small.dds"].texture;
        assert_eq!(
            (small_texture.width, small_texture.height, small_texture.mipmaps),
            (32, 32, 2)
        );

        // The mip payloads arrive in the GPU texture intact.
        let gpu = as_headless(small_texture.texture.as_deref().unwrap());
        assert!(gpu.mip_bytes(0).iter().all(|&b| b == 0x30));
        assert!(gpu.mip_bytes(1).iter().all(|&b| b == 0x31));
    }

    #[test]
    fn database_save_is_atomic_via_the_rename_chain() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();

        write_database(dir.path(), json!([record_json(0xAA, "a.png", "preload")]));
        let original = fs::read_to_string(dir.path().join(REPLACEMENT_DATABASE_FILENAME)).unwrap();

        assert!(cache.load_replacement_directory(dir.path()));
        assert!(cache.save_replacement_database());

        let database_path = dir.path().join(REPLACEMENT_DATABASE_FILENAME);
        let old_path = dir.path().join(format!("{REPLACEMENT_DATABASE_FILENAME}.old"));
        assert_eq!(fs::read_to_string(&old_path).unwrap(), original);
        assert!(!dir
            .path()
            .join(format!("{REPLACEMENT_DATABASE_FILENAME}.new"))
            .exists());

        let saved =
            ReplacementDatabase::from_reader(fs::File::open(&database_path).unwrap()).unwrap();
        assert_eq!(saved.textures.len(), 1);
        assert_eq!(saved.textures[0].path, "a.png");

        // A second save rotates the previous file into `.old`.
        let current = fs::read_to_string(&database_path).unwrap();
        assert!(cache.save_replacement_database());
        assert_eq!(fs::read_to_string(&old_path).unwrap(), current);
    }

    #[test]
    fn save_requires_a_loaded_directory() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        assert!(!cache.save_replacement_database());
    }

    #[test]
    fn add_replacement_loads_and_installs_immediately() {
        let device = HeadlessDevice::new();
        let cache = new_cache(&device);
        let dir = tempfile::tempdir().unwrap();
        let hash = 0x4242;

        write_database(dir.path(), json!([]));
        image::RgbaImage::new(24, 24)
            .save(dir.path().join("painted.png"))
            .unwrap();

        assert!(cache.load_replacement_directory(dir.path()));
        cache.queue_upload(upload(hash, 0, 8, 8, false));
        cache.wait_for_gpu_uploads();

        assert!(cache.add_replacement(hash, "painted.png"));
        assert_eq!(cache.replacement_texture(hash).unwrap().width, 24);

        // The database now carries the record.
        assert!(cache.save_replacement_database());
        let saved = ReplacementDatabase::from_reader(
            fs::File::open(dir.path().join(REPLACEMENT_DATABASE_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(saved.textures[0].path, "painted.png");
        assert_eq!(
            saved.textures[0].hashes.rt64,
            ReplacementDatabase::hash_to_string(hash)
        );

        assert!(!cache.add_replacement(hash, "does-not-exist.png"));
    }
}
