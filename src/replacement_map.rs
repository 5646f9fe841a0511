use crate::replacement::{ReplacementDatabase, ResolvedPath};
use crate::texture::Texture;
use log::error;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use twox_hash::XxHash3_64;

/// A stand-in texture from the low-mip container. `transitioned` tracks
/// whether its one-time transition to a sampleable layout was recorded.
pub struct LowMipCacheTexture {
    pub texture: Arc<Texture>,
    pub transitioned: bool,
}

/// Runtime replacement index: the database, its resolved paths, the loaded
/// full-resolution textures keyed by path hash, and the low-mip stand-ins.
#[derive(Default)]
pub struct ReplacementMap {
    pub db: ReplacementDatabase,
    pub directory_path: PathBuf,
    pub resolved_path_map: HashMap<u64, ResolvedPath>,
    pub low_mip_cache_textures: HashMap<String, LowMipCacheTexture>,
    loaded_textures: Vec<Arc<Texture>>,
    path_hash_to_load: HashMap<u64, u32>,
    pub(crate) evicted_textures: Vec<Arc<Texture>>,
}

impl ReplacementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Moves every loaded and low-mip texture into `evicted` and empties
    /// all tables. The caller releases the evicted textures under the
    /// cache lock protocol.
    pub fn clear(&mut self, evicted: &mut Vec<Arc<Texture>>) {
        evicted.append(&mut self.loaded_textures);
        evicted.extend(self.low_mip_cache_textures.drain().map(|(_, low_mip)| low_mip.texture));
        self.path_hash_to_load.clear();
        self.resolved_path_map.clear();
    }

    /// Reads the database from JSON. A parse failure logs, resets the
    /// database to its default, and returns false.
    pub fn read_database(&mut self, reader: impl Read) -> bool {
        match ReplacementDatabase::from_reader(reader) {
            Ok(db) => {
                self.db = db;
                true
            }
            Err(e) => {
                error!("JSON parsing error: {e}");
                self.db = ReplacementDatabase::default();
                false
            }
        }
    }

    pub fn save_database(&self, writer: impl Write) -> bool {
        match self.db.to_writer(writer) {
            Ok(()) => true,
            Err(e) => {
                error!("JSON writing error: {e}");
                false
            }
        }
    }

    /// Resolved location for a database hash. Path resolution must already
    /// have run; there is no fallback to the raw database records.
    #[inline(always)]
    pub fn get_information_from_hash(&self, tmem_hash: u64) -> Option<&ResolvedPath> {
        self.resolved_path_map.get(&tmem_hash)
    }

    /// Registers a loaded texture under its relative path. The caller must
    /// have checked `get_from_relative_path` first; duplicates are a
    /// programming error.
    pub fn add_loaded_texture(&mut self, texture: Arc<Texture>, relative_path: &str) {
        let path_hash = Self::hash_from_relative_path(relative_path);
        debug_assert!(
            !self.path_hash_to_load.contains_key(&path_hash),
            "'{relative_path}' was loaded twice"
        );
        self.path_hash_to_load
            .insert(path_hash, self.loaded_textures.len() as u32);
        self.loaded_textures.push(texture);
    }

    pub fn get_from_relative_path(&self, relative_path: &str) -> Option<Arc<Texture>> {
        let path_hash = Self::hash_from_relative_path(relative_path);
        let &index = self.path_hash_to_load.get(&path_hash)?;
        Some(Arc::clone(&self.loaded_textures[index as usize]))
    }

    #[inline(always)]
    pub fn hash_from_relative_path(relative_path: &str) -> u64 {
        XxHash3_64::oneshot(relative_path.as_bytes())
    }

    /// Drops records that have neither an explicit path nor a resolved
    /// auto path, renumbering the resolved map to the compacted sequence.
    pub fn remove_unused_entries_from_database(&mut self) {
        let mut remap: HashMap<u32, u32> = HashMap::new();
        let mut kept = Vec::with_capacity(self.db.textures.len());
        for (index, texture) in self.db.textures.iter().enumerate() {
            if texture.path.is_empty() {
                let rt64 = ReplacementDatabase::string_to_hash(&texture.hashes.rt64);
                if !self.resolved_path_map.contains_key(&rt64) {
                    continue;
                }
            }

            remap.insert(index as u32, kept.len() as u32);
            kept.push(texture.clone());
        }

        self.db.textures = kept;
        self.db.build_hash_maps();
        self.resolved_path_map
            .retain(|_, resolved| match remap.get(&resolved.record_index) {
                Some(&new_index) => {
                    resolved.record_index = new_index;
                    true
                }
                None => false,
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replacement::{ReplacementHashes, ReplacementTexture};

    fn texture(width: u32, height: u32) -> Arc<Texture> {
        Arc::new(Texture {
            width,
            height,
            ..Texture::new()
        })
    }

    fn record(rt64: &str, rice: &str, path: &str) -> ReplacementTexture {
        ReplacementTexture {
            path: path.to_string(),
            hashes: ReplacementHashes {
                rt64: rt64.to_string(),
                rice: rice.to_string(),
            },
            ..ReplacementTexture::default()
        }
    }

    #[test]
    fn loaded_textures_are_found_by_path() {
        let mut map = ReplacementMap::new();
        assert!(map.get_from_relative_path("a/b.dds").is_none());

        map.add_loaded_texture(texture(64, 64), "a/b.dds");
        let loaded = map.get_from_relative_path("a/b.dds").unwrap();
        assert_eq!(loaded.width, 64);
        assert!(map.get_from_relative_path("a/B.dds").is_none());
    }

    #[test]
    fn clear_moves_everything_to_the_evicted_list() {
        let mut map = ReplacementMap::new();
        map.add_loaded_texture(texture(8, 8), "x.png");
        map.low_mip_cache_textures.insert(
            "y.dds".to_string(),
            LowMipCacheTexture {
                texture: texture(4, 4),
                transitioned: false,
            },
        );

        let mut evicted = Vec::new();
        map.clear(&mut evicted);
        assert_eq!(evicted.len(), 2);
        assert!(map.get_from_relative_path("x.png").is_none());
        assert!(map.low_mip_cache_textures.is_empty());
    }

    #[test]
    fn read_database_resets_on_parse_failure() {
        let mut map = ReplacementMap::new();
        map.db.add_replacement(record("aa", "", "a.png"));

        assert!(!map.read_database(b"{ not json".as_slice()));
        assert!(map.db.textures.is_empty());

        assert!(map.read_database(
            br#"{ "configuration": {}, "textures": [ { "hashes": { "rt64": "bb" } } ] }"#
                .as_slice()
        ));
        assert_eq!(map.db.textures.len(), 1);
    }

    #[test]
    fn unused_entries_are_compacted_and_renumbered() {
        let mut map = ReplacementMap::new();
        map.db.add_replacement(record("11", "r1", "")); // unresolved: dropped
        map.db.add_replacement(record("22", "r2", "")); // resolved below
        map.db.add_replacement(record("33", "", "keep.png")); // explicit path: kept

        map.resolved_path_map.insert(
            0x22,
            ResolvedPath {
                relative_path: "some/file.png".to_string(),
                record_index: 1,
            },
        );

        map.remove_unused_entries_from_database();
        assert_eq!(map.db.textures.len(), 2);
        assert_eq!(map.db.textures[0].hashes.rt64, "22");
        assert_eq!(map.db.textures[1].hashes.rt64, "33");
        assert_eq!(map.resolved_path_map[&0x22].record_index, 0);
        assert_eq!(map.db.record_index(0x33), Some(1));
    }
}
