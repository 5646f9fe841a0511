use crate::texture::Texture;
use std::collections::HashMap;
use std::sync::Arc;

/// Frames that may still be in flight on the GPU when eviction runs.
pub const RENDER_QUEUE_DEPTH: u64 = 2;

/// Entries always survive at least this many frames past their last use so
/// in-flight frames never lose their textures.
const MINIMUM_MAX_AGE: u64 = RENDER_QUEUE_DEPTH * 2;

const NO_NODE: u32 = u32::MAX;
const IDENTITY_SCALE: [f32; 2] = [1.0, 1.0];

#[derive(Clone, Copy, Debug)]
pub struct UseResult {
    pub handle: u32,
    pub scale: [f32; 2],
    pub replaced: bool,
    pub has_mipmaps: bool,
}

#[derive(Clone, Copy, Debug)]
struct AccessNode {
    newer: u32,
    older: u32,
    last_use_frame: u64,
    linked: bool,
}

impl AccessNode {
    #[inline(always)]
    fn unlinked() -> Self {
        Self {
            newer: NO_NODE,
            older: NO_NODE,
            last_use_frame: 0,
            linked: false,
        }
    }
}

/// Content-addressed slot table for emulator textures: parallel arrays
/// indexed by handle, a hash index, a LIFO free list, and an intrusive
/// access list ordered by recency (head = newest).
pub struct TextureMap {
    hash_map: HashMap<u64, u32>,
    textures: Vec<Option<Arc<Texture>>>,
    replacements: Vec<Option<Arc<Texture>>>,
    scales: Vec<[f32; 2]>,
    hashes: Vec<u64>,
    versions: Vec<u32>,
    creation_frames: Vec<u64>,
    nodes: Vec<AccessNode>,
    head: u32,
    tail: u32,
    free_spaces: Vec<u32>,
    global_version: u32,
    pub replacement_map_enabled: bool,
    pub(crate) evicted_textures: Vec<Arc<Texture>>,
}

impl Default for TextureMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TextureMap {
    pub fn new() -> Self {
        Self {
            hash_map: HashMap::new(),
            textures: Vec::new(),
            replacements: Vec::new(),
            scales: Vec::new(),
            hashes: Vec::new(),
            versions: Vec::new(),
            creation_frames: Vec::new(),
            nodes: Vec::new(),
            head: NO_NODE,
            tail: NO_NODE,
            free_spaces: Vec::new(),
            global_version: 0,
            replacement_map_enabled: true,
            evicted_textures: Vec::new(),
        }
    }

    fn detach(&mut self, index: u32) {
        let node = self.nodes[index as usize];
        if !node.linked {
            return;
        }

        if node.newer != NO_NODE {
            self.nodes[node.newer as usize].older = node.older;
        } else {
            self.head = node.older;
        }

        if node.older != NO_NODE {
            self.nodes[node.older as usize].newer = node.newer;
        } else {
            self.tail = node.newer;
        }

        self.nodes[index as usize].linked = false;
    }

    fn push_front(&mut self, index: u32, frame: u64) {
        self.nodes[index as usize] = AccessNode {
            newer: NO_NODE,
            older: self.head,
            last_use_frame: frame,
            linked: true,
        };
        if self.head != NO_NODE {
            self.nodes[self.head as usize].newer = index;
        }
        self.head = index;
        if self.tail == NO_NODE {
            self.tail = index;
        }
    }

    /// Stores a freshly uploaded texture under an unknown hash.
    pub fn add(&mut self, hash: u64, creation_frame: u64, texture: Arc<Texture>) {
        debug_assert!(
            !self.hash_map.contains_key(&hash),
            "hash {hash:016x} is already mapped"
        );

        let index = match self.free_spaces.pop() {
            Some(index) => index,
            None => {
                let index = self.textures.len() as u32;
                self.textures.push(None);
                self.replacements.push(None);
                self.scales.push(IDENTITY_SCALE);
                self.hashes.push(0);
                self.versions.push(0);
                self.creation_frames.push(0);
                self.nodes.push(AccessNode::unlinked());
                index
            }
        };

        let slot = index as usize;
        self.hash_map.insert(hash, index);
        self.textures[slot] = Some(texture);
        self.replacements[slot] = None;
        self.scales[slot] = IDENTITY_SCALE;
        self.hashes[slot] = hash;
        self.versions[slot] += 1;
        self.creation_frames[slot] = creation_frame;
        self.global_version += 1;
        self.push_front(index, creation_frame);
    }

    /// Installs a replacement for a resident hash. A no-op when the hash is
    /// absent, or when `ignore_if_occupied` is set and a replacement is
    /// already installed (low-priority stand-ins must never displace a real
    /// replacement that arrived first).
    pub fn replace(&mut self, hash: u64, texture: Arc<Texture>, ignore_if_occupied: bool) {
        let Some(&index) = self.hash_map.get(&hash) else {
            return;
        };

        let slot = index as usize;
        if ignore_if_occupied && self.replacements[slot].is_some() {
            return;
        }

        let Some(original) = self.textures[slot].as_ref() else {
            debug_assert!(false, "mapped slot without a texture");
            return;
        };

        self.scales[slot] = [
            texture.width as f32 / original.width as f32,
            texture.height as f32 / original.height as f32,
        ];
        self.replacements[slot] = Some(texture);
        self.versions[slot] += 1;
        self.global_version += 1;
    }

    /// Marks a hash as used by `submission_frame` and reports how to draw
    /// it. A miss returns `None`.
    pub fn use_texture(&mut self, hash: u64, submission_frame: u64) -> Option<UseResult> {
        let &index = self.hash_map.get(&hash)?;
        let slot = index as usize;

        let replaced = self.replacement_map_enabled && self.replacements[slot].is_some();
        let (scale, has_mipmaps) = if replaced {
            let replacement = self.replacements[slot].as_ref().unwrap();
            (self.scales[slot], replacement.mipmaps > 1)
        } else {
            (IDENTITY_SCALE, false)
        };

        self.detach(index);
        self.push_front(index, submission_frame);

        Some(UseResult {
            handle: index,
            scale,
            replaced,
            has_mipmaps,
        })
    }

    /// Detaches every installed replacement and bumps versions so derived
    /// state downstream is rebuilt.
    pub fn clear_replacements(&mut self) {
        for slot in 0..self.replacements.len() {
            if self.replacements[slot].is_some() {
                self.replacements[slot] = None;
                self.versions[slot] += 1;
            }
        }

        self.global_version += 1;
    }

    /// Ages out entries whose last use is far enough in the past, scanning
    /// from the oldest. Returns true when anything was evicted.
    pub fn evict(&mut self, current_frame: u64, evicted_hashes: &mut Vec<u64>) -> bool {
        evicted_hashes.clear();

        let mut cursor = self.tail;
        while cursor != NO_NODE {
            let node = self.nodes[cursor as usize];
            debug_assert!(current_frame >= node.last_use_frame);

            // The allowed age grows with how long the entry stayed in use,
            // and never dips below what the in-flight frame queue needs.
            let slot = cursor as usize;
            let age = current_frame.saturating_sub(node.last_use_frame);
            let max_age = node
                .last_use_frame
                .saturating_sub(self.creation_frames[slot])
                .max(MINIMUM_MAX_AGE);

            if age >= max_age {
                let newer = node.newer;
                let hash = self.hashes[slot];
                if let Some(texture) = self.textures[slot].take() {
                    self.evicted_textures.push(texture);
                }
                self.replacements[slot] = None;
                self.scales[slot] = IDENTITY_SCALE;
                self.hashes[slot] = 0;
                self.creation_frames[slot] = 0;
                self.detach(cursor);
                self.free_spaces.push(cursor);
                self.hash_map.remove(&hash);
                evicted_hashes.push(hash);
                cursor = newer;
            } else if age == 0 {
                // Everything newer was used in the present.
                break;
            } else {
                cursor = node.newer;
            }
        }

        !evicted_hashes.is_empty()
    }

    /// Handle for a resident hash without touching the access list.
    #[inline(always)]
    pub fn handle(&self, hash: u64) -> Option<u32> {
        self.hash_map.get(&hash).copied()
    }

    #[inline(always)]
    pub fn get(&self, handle: u32) -> Option<&Arc<Texture>> {
        self.textures.get(handle as usize)?.as_ref()
    }

    #[inline(always)]
    pub fn replacement(&self, handle: u32) -> Option<&Arc<Texture>> {
        self.replacements.get(handle as usize)?.as_ref()
    }

    #[inline(always)]
    pub fn max_index(&self) -> usize {
        self.textures.len()
    }

    #[inline(always)]
    pub fn slot_version(&self, handle: u32) -> u32 {
        self.versions[handle as usize]
    }

    #[inline(always)]
    pub fn global_version(&self) -> u32 {
        self.global_version
    }

    /// Hash and original dimensions of every resident slot, for re-running
    /// replacement checks after a directory switch.
    pub fn resident_textures(&self) -> Vec<(u64, u32, u32)> {
        let mut resident = Vec::new();
        for slot in 0..self.hashes.len() {
            if self.hashes[slot] != 0 {
                let (width, height) = match self.textures[slot].as_ref() {
                    Some(texture) => (texture.width, texture.height),
                    None => (0, 0),
                };
                resident.push((self.hashes[slot], width, height));
            }
        }
        resident
    }

    pub(crate) fn take_evicted(&mut self) -> Vec<Arc<Texture>> {
        std::mem::take(&mut self.evicted_textures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(width: u32, height: u32, mipmaps: u32) -> Arc<Texture> {
        Arc::new(Texture {
            width,
            height,
            mipmaps,
            ..Texture::new()
        })
    }

    /// Structural invariants that must hold at every stable point.
    fn check_invariants(map: &TextureMap) {
        // Every mapped hash points at a live slot storing that hash.
        for (&hash, &index) in &map.hash_map {
            let slot = index as usize;
            assert!(map.textures[slot].is_some());
            assert_eq!(map.hashes[slot], hash);
            assert!(map.nodes[slot].linked);
        }

        // Free slots are empty, unmapped, and unlinked.
        for &index in &map.free_spaces {
            let slot = index as usize;
            assert!(map.textures[slot].is_none());
            assert_eq!(map.hashes[slot], 0);
            assert!(!map.nodes[slot].linked);
        }

        // Every slot is either free or mapped, exactly once.
        let free: std::collections::HashSet<u32> = map.free_spaces.iter().copied().collect();
        assert_eq!(free.len(), map.free_spaces.len());
        assert_eq!(free.len() + map.hash_map.len(), map.textures.len());

        // The access list is a permutation of the mapped slots.
        let mut walked = Vec::new();
        let mut cursor = map.head;
        while cursor != NO_NODE {
            walked.push(cursor);
            cursor = map.nodes[cursor as usize].older;
        }
        assert_eq!(walked.len(), map.hash_map.len());
        for index in &walked {
            assert!(map.hash_map.values().any(|v| v == index));
        }
    }

    #[test]
    fn add_use_evict_lifecycle() {
        let mut map = TextureMap::new();
        map.add(0xABCD, 0, texture(8, 8, 1));
        check_invariants(&map);

        let result = map.use_texture(0xABCD, 0).unwrap();
        assert!(!result.replaced);
        assert_eq!(result.scale, [1.0, 1.0]);
        let handle = result.handle;

        // Not old enough yet.
        let mut evicted = Vec::new();
        assert!(!map.evict(MINIMUM_MAX_AGE - 1, &mut evicted));
        assert!(evicted.is_empty());

        assert!(map.evict(MINIMUM_MAX_AGE, &mut evicted));
        assert_eq!(evicted, vec![0xABCD]);
        assert!(map.use_texture(0xABCD, MINIMUM_MAX_AGE + 1).is_none());
        assert_eq!(map.evicted_textures.len(), 1);
        assert_eq!(map.free_spaces, vec![handle]);
        check_invariants(&map);
    }

    #[test]
    fn eviction_never_touches_entries_used_this_frame() {
        let mut map = TextureMap::new();
        map.add(1, 0, texture(4, 4, 1));
        map.add(2, 0, texture(4, 4, 1));
        map.use_texture(2, 100).unwrap();

        let mut evicted = Vec::new();
        map.evict(100, &mut evicted);
        assert_eq!(evicted, vec![1]);
        assert!(map.use_texture(2, 100).is_some());
        check_invariants(&map);
    }

    #[test]
    fn long_lived_entries_earn_longer_max_age() {
        let mut map = TextureMap::new();
        map.add(7, 0, texture(4, 4, 1));
        // Used for 100 frames; its max age becomes 100.
        map.use_texture(7, 100).unwrap();

        let mut evicted = Vec::new();
        assert!(!map.evict(199, &mut evicted));
        assert!(map.evict(200, &mut evicted));
        assert_eq!(evicted, vec![7]);
    }

    #[test]
    fn replace_updates_scale_and_versions() {
        let mut map = TextureMap::new();
        map.add(5, 0, texture(8, 16, 1));
        let handle = map.use_texture(5, 0).unwrap().handle;
        let version = map.slot_version(handle);
        let global = map.global_version();

        map.replace(5, texture(32, 32, 4), false);
        assert!(map.slot_version(handle) > version);
        assert!(map.global_version() > global);

        let result = map.use_texture(5, 1).unwrap();
        assert!(result.replaced);
        assert!(result.has_mipmaps);
        assert_eq!(result.scale, [4.0, 2.0]);
        check_invariants(&map);
    }

    #[test]
    fn replace_ignores_unknown_hashes() {
        let mut map = TextureMap::new();
        let global = map.global_version();
        map.replace(0xDEAD, texture(8, 8, 1), false);
        assert_eq!(map.global_version(), global);
    }

    #[test]
    fn low_priority_replacement_never_displaces_a_real_one() {
        let mut map = TextureMap::new();
        map.add(9, 0, texture(8, 8, 1));
        map.replace(9, texture(64, 64, 3), false);

        // The stand-in arrives late and must be ignored.
        map.replace(9, texture(16, 16, 1), true);
        let result = map.use_texture(9, 1).unwrap();
        assert_eq!(result.scale, [8.0, 8.0]);
        assert!(result.has_mipmaps);

        // A stand-in may fill an empty slot.
        map.add(10, 0, texture(8, 8, 1));
        map.replace(10, texture(16, 16, 1), true);
        assert!(map.use_texture(10, 1).unwrap().replaced);
    }

    #[test]
    fn clear_replacements_bumps_versions() {
        let mut map = TextureMap::new();
        map.add(3, 0, texture(8, 8, 1));
        map.replace(3, texture(16, 16, 1), false);
        let handle = map.use_texture(3, 0).unwrap().handle;
        let version = map.slot_version(handle);

        map.clear_replacements();
        assert!(!map.use_texture(3, 1).unwrap().replaced);
        assert!(map.slot_version(handle) > version);
        check_invariants(&map);
    }

    #[test]
    fn freed_handles_are_reused_lifo() {
        let mut map = TextureMap::new();
        map.add(1, 0, texture(4, 4, 1));
        map.add(2, 0, texture(4, 4, 1));
        let first = map.use_texture(1, 0).unwrap().handle;

        let mut evicted = Vec::new();
        map.evict(1000, &mut evicted);
        assert_eq!(evicted.len(), 2);

        map.add(3, 1000, texture(4, 4, 1));
        let reused = map.use_texture(3, 1000).unwrap().handle;
        // The most recently freed slot comes back first.
        assert_eq!(reused, first);
        assert_eq!(map.max_index(), 2);
        check_invariants(&map);
    }

    #[test]
    fn resident_textures_reports_dimensions() {
        let mut map = TextureMap::new();
        map.add(0x11, 0, texture(16, 32, 1));
        map.add(0x22, 0, texture(8, 8, 1));

        let mut resident = map.resident_textures();
        resident.sort();
        assert_eq!(resident, vec![(0x11, 16, 32), (0x22, 8, 8)]);
    }
}
