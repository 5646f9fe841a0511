use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

pub const REPLACEMENT_DATABASE_FILENAME: &str = "rt64.json";
pub const LOW_MIP_CACHE_FILENAME: &str = "rt64-low-mip-cache.bin";
pub const KNOWN_EXTENSIONS: [&str; 2] = [".dds", ".png"];
pub const CURRENT_CONFIGURATION_VERSION: u32 = 2;

// --- Schema enums ---

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementLoad {
    Preload,
    #[default]
    Stream,
    Async,
    Stall,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementLife {
    Permanent,
    #[default]
    Pool,
    Age,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplacementAutoPath {
    #[default]
    Rt64,
    Rice,
}

// --- Configuration ---

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementConfiguration {
    #[serde(rename = "autoPath", default)]
    pub auto_path: ReplacementAutoPath,
    // Re-serialized as the latest version regardless of what was read.
    #[serde(
        rename = "configurationVersion",
        default = "version_one",
        serialize_with = "serialize_current_version"
    )]
    pub configuration_version: u32,
    #[serde(rename = "hashVersion", default = "version_one")]
    pub hash_version: u32,
}

impl Default for ReplacementConfiguration {
    fn default() -> Self {
        Self {
            auto_path: ReplacementAutoPath::Rt64,
            configuration_version: CURRENT_CONFIGURATION_VERSION,
            hash_version: crate::tmem::CURRENT_HASH_VERSION,
        }
    }
}

fn version_one() -> u32 {
    1
}

fn serialize_current_version<S: Serializer>(_: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u32(CURRENT_CONFIGURATION_VERSION)
}

// --- Records ---

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplacementHashes {
    pub rt64: String,
    pub rice: String,
}

impl<'de> Deserialize<'de> for ReplacementHashes {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // The first database revision versioned the key name itself; the
        // current key wins whenever both are present.
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            rt64v1: Option<String>,
            #[serde(default)]
            rt64: Option<String>,
            #[serde(default)]
            rice: Option<String>,
        }

        let raw = Raw::deserialize(deserializer)?;
        Ok(Self {
            rt64: raw.rt64.or(raw.rt64v1).unwrap_or_default(),
            rice: raw.rice.unwrap_or_default(),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementTexture {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub load: ReplacementLoad,
    #[serde(default)]
    pub life: ReplacementLife,
    #[serde(default)]
    pub hashes: ReplacementHashes,
}

impl ReplacementTexture {
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.hashes.rt64.is_empty()
    }
}

/// A record's on-disk location discovered by `resolve_paths`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedPath {
    pub relative_path: String,
    pub record_index: u32,
}

// --- Database ---

#[derive(Clone, Debug, Default)]
pub struct ReplacementDatabase {
    pub config: ReplacementConfiguration,
    pub textures: Vec<ReplacementTexture>,
    rt64_hash_to_index: HashMap<u64, u32>,
}

#[derive(Serialize)]
struct DatabaseDocumentRef<'a> {
    configuration: &'a ReplacementConfiguration,
    textures: &'a [ReplacementTexture],
}

#[derive(Deserialize)]
struct DatabaseDocument {
    #[serde(default)]
    configuration: ReplacementConfiguration,
    #[serde(default)]
    textures: Vec<ReplacementTexture>,
}

impl ReplacementDatabase {
    /// Adds a record, overwriting in place when its rt64 hash is already
    /// known. Returns the record index, stable for this load session.
    pub fn add_replacement(&mut self, texture: ReplacementTexture) -> u32 {
        let rt64 = Self::string_to_hash(&texture.hashes.rt64);
        if let Some(&index) = self.rt64_hash_to_index.get(&rt64) {
            self.textures[index as usize] = texture;
            index
        } else {
            let index = self.textures.len() as u32;
            self.rt64_hash_to_index.insert(rt64, index);
            self.textures.push(texture);
            index
        }
    }

    /// Rekeys the record stored under `old_hash` to the record's current
    /// rt64 hash, preserving its slot.
    pub fn fix_replacement(&mut self, old_hash: &str, texture: ReplacementTexture) {
        let rt64_old = Self::string_to_hash(old_hash);
        let rt64_new = Self::string_to_hash(&texture.hashes.rt64);
        if let Some(index) = self.rt64_hash_to_index.remove(&rt64_old) {
            self.textures[index as usize] = texture;
            self.rt64_hash_to_index.insert(rt64_new, index);
        }
    }

    pub fn get_replacement(&self, hash: &str) -> ReplacementTexture {
        let rt64 = Self::string_to_hash(hash);
        match self.rt64_hash_to_index.get(&rt64) {
            Some(&index) => self.textures[index as usize].clone(),
            None => ReplacementTexture::default(),
        }
    }

    #[inline(always)]
    pub fn record_index(&self, rt64: u64) -> Option<u32> {
        self.rt64_hash_to_index.get(&rt64).copied()
    }

    /// Rebuilds the rt64 hash index from the record sequence. Must run
    /// after deserialization or bulk record edits.
    pub fn build_hash_maps(&mut self) {
        self.rt64_hash_to_index.clear();
        for (index, texture) in self.textures.iter().enumerate() {
            if !texture.hashes.rt64.is_empty() {
                let rt64 = Self::string_to_hash(&texture.hashes.rt64);
                self.rt64_hash_to_index.insert(rt64, index as u32);
            }
        }
    }

    pub fn from_reader(reader: impl Read) -> Result<Self, serde_json::Error> {
        let document: DatabaseDocument = serde_json::from_reader(reader)?;
        let mut db = Self {
            config: document.configuration,
            textures: document.textures,
            rt64_hash_to_index: HashMap::new(),
        };
        db.build_hash_maps();
        Ok(db)
    }

    pub fn to_writer(&self, writer: impl Write) -> Result<(), serde_json::Error> {
        serde_json::to_writer_pretty(
            writer,
            &DatabaseDocumentRef {
                configuration: &self.config,
                textures: &self.textures,
            },
        )
    }

    /// Resolves every record to a relative path under `directory`:
    /// explicit paths probe the known extensions in declared order, records
    /// without a path go through the auto-path filename convention.
    pub fn resolve_paths(&self, directory: &Path, only_dds: bool) -> HashMap<u64, ResolvedPath> {
        // Scan the candidate files on the filesystem first. Entries are
        // sorted per directory so duplicate auto keys resolve the same way
        // on every platform.
        let mut auto_path_map: HashMap<String, String> = HashMap::new();
        let mut pending = vec![directory.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            let mut entries: Vec<_> = entries.flatten().collect();
            entries.sort_by_key(|entry| entry.file_name());
            for entry in entries {
                let path = entry.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
                    continue;
                };
                let extension = format!(".{}", extension.to_ascii_lowercase());
                if !Self::is_extension_known(&extension, only_dds) {
                    continue;
                }

                match self.config.auto_path {
                    ReplacementAutoPath::Rice => {
                        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                            continue;
                        };
                        let Some(first_hash) = file_name.find('#') else {
                            continue;
                        };
                        let Some(last_underscore) = file_name.rfind('_') else {
                            continue;
                        };
                        if last_underscore <= first_hash {
                            continue;
                        }

                        let key =
                            file_name[first_hash + 1..last_underscore].to_ascii_lowercase();
                        if let Some(relative) = relative_path_string(directory, &path) {
                            auto_path_map.insert(key, relative);
                        }
                    }
                    // The rt64 filename convention has not been established
                    // yet, so there is nothing to collect.
                    ReplacementAutoPath::Rt64 => {}
                }
            }
        }

        let mut resolved = HashMap::new();
        for (index, texture) in self.textures.iter().enumerate() {
            if !texture.path.is_empty() {
                let rt64 = Self::string_to_hash(&texture.hashes.rt64);
                let base = Self::remove_known_extension(&texture.path);
                let extension_count = if only_dds { 1 } else { KNOWN_EXTENSIONS.len() };
                for extension in &KNOWN_EXTENSIONS[..extension_count] {
                    let candidate = format!("{base}{extension}");
                    if directory.join(&candidate).exists() {
                        resolved.insert(
                            rt64,
                            ResolvedPath {
                                relative_path: candidate,
                                record_index: index as u32,
                            },
                        );
                        break;
                    }
                }
            } else {
                let search = match self.config.auto_path {
                    ReplacementAutoPath::Rice => &texture.hashes.rice,
                    ReplacementAutoPath::Rt64 => &texture.hashes.rt64,
                };
                if let Some(relative) = auto_path_map.get(search.as_str()) {
                    resolved.insert(
                        Self::string_to_hash(&texture.hashes.rt64),
                        ResolvedPath {
                            relative_path: relative.clone(),
                            record_index: index as u32,
                        },
                    );
                }
            }
        }

        resolved
    }

    /// Parses a leading hexadecimal run; anything else yields zero.
    pub fn string_to_hash(text: &str) -> u64 {
        let trimmed = text.trim_start();
        let digits = trimmed
            .find(|c: char| !c.is_ascii_hexdigit())
            .map_or(trimmed, |end| &trimmed[..end]);
        u64::from_str_radix(digits, 16).unwrap_or(0)
    }

    #[inline(always)]
    pub fn hash_to_string(hash: u64) -> String {
        format!("{hash:016x}")
    }

    #[inline(always)]
    pub fn hash_to_string32(hash: u32) -> String {
        format!("{hash:08x}")
    }

    pub fn is_extension_known(extension: &str, only_dds: bool) -> bool {
        let count = if only_dds { 1 } else { KNOWN_EXTENSIONS.len() };
        KNOWN_EXTENSIONS[..count]
            .iter()
            .any(|known| extension.eq_ignore_ascii_case(known))
    }

    /// Strips a known extension, comparing case-insensitively, preserving
    /// the base's original case.
    pub fn remove_known_extension(path: &str) -> &str {
        for extension in &KNOWN_EXTENSIONS {
            if path.len() >= extension.len()
                && path[path.len() - extension.len()..].eq_ignore_ascii_case(extension)
            {
                return &path[..path.len() - extension.len()];
            }
        }

        path
    }
}

/// Relative path with forward-slash separators regardless of platform, so
/// path hashes and the packed container agree everywhere.
pub fn relative_path_string(base: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    Some(relative.to_string_lossy().replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(rt64: &str, rice: &str, path: &str) -> ReplacementTexture {
        ReplacementTexture {
            path: path.to_string(),
            load: ReplacementLoad::Stream,
            life: ReplacementLife::Pool,
            hashes: ReplacementHashes {
                rt64: rt64.to_string(),
                rice: rice.to_string(),
            },
        }
    }

    #[test]
    fn add_overwrites_known_hash_in_place() {
        let mut db = ReplacementDatabase::default();
        let first = db.add_replacement(record("abcd", "", "a.png"));
        let second = db.add_replacement(record("1234", "", "b.png"));
        assert_eq!((first, second), (0, 1));

        let overwritten = db.add_replacement(record("abcd", "", "c.png"));
        assert_eq!(overwritten, 0);
        assert_eq!(db.textures.len(), 2);
        assert_eq!(db.textures[0].path, "c.png");
    }

    #[test]
    fn fix_replacement_rekeys_preserving_slot() {
        let mut db = ReplacementDatabase::default();
        db.add_replacement(record("abcd", "", "a.png"));
        db.fix_replacement("abcd", record("ef01", "", "a.png"));
        assert!(db.get_replacement("abcd").is_empty());
        assert_eq!(db.get_replacement("ef01").path, "a.png");
        assert_eq!(db.record_index(0xef01), Some(0));
    }

    #[test]
    fn string_to_hash_tolerates_garbage() {
        assert_eq!(ReplacementDatabase::string_to_hash("a1b2c3d4"), 0xa1b2c3d4);
        assert_eq!(ReplacementDatabase::string_to_hash("A1B2"), 0xa1b2);
        assert_eq!(ReplacementDatabase::string_to_hash("12zz"), 0x12);
        assert_eq!(ReplacementDatabase::string_to_hash(""), 0);
        assert_eq!(ReplacementDatabase::string_to_hash("xyz"), 0);
    }

    #[test]
    fn hash_strings_round_trip() {
        let text = ReplacementDatabase::hash_to_string(0xabcd_0123_4567_89ef);
        assert_eq!(text, "abcd0123456789ef");
        assert_eq!(
            ReplacementDatabase::string_to_hash(&text),
            0xabcd_0123_4567_89ef
        );
        assert_eq!(ReplacementDatabase::hash_to_string32(0xab), "000000ab");
    }

    #[test]
    fn remove_known_extension_is_case_insensitive() {
        assert_eq!(
            ReplacementDatabase::remove_known_extension("sub/Mario.DDS"),
            "sub/Mario"
        );
        assert_eq!(
            ReplacementDatabase::remove_known_extension("tex.png"),
            "tex"
        );
        assert_eq!(
            ReplacementDatabase::remove_known_extension("tex.bmp"),
            "tex.bmp"
        );
    }

    #[test]
    fn legacy_rt64v1_key_is_accepted() {
        let json = r#"{ "rt64v1": "dead", "rice": "beef" }"#;
        let hashes: ReplacementHashes = serde_json::from_str(json).unwrap();
        assert_eq!(hashes.rt64, "dead");
        assert_eq!(hashes.rice, "beef");

        // The current key wins when both are present.
        let json = r#"{ "rt64v1": "dead", "rt64": "f00d" }"#;
        let hashes: ReplacementHashes = serde_json::from_str(json).unwrap();
        assert_eq!(hashes.rt64, "f00d");
    }

    #[test]
    fn document_round_trip_preserves_order_and_bumps_version() {
        let mut db = ReplacementDatabase::default();
        db.config.configuration_version = 1;
        db.config.hash_version = 1;
        db.add_replacement(record("22", "", "b.png"));
        db.add_replacement(record("11", "", "a.png"));

        let mut buffer = Vec::new();
        db.to_writer(&mut buffer).unwrap();
        let reloaded = ReplacementDatabase::from_reader(buffer.as_slice()).unwrap();

        assert_eq!(reloaded.textures, db.textures);
        assert_eq!(
            reloaded.config.configuration_version,
            CURRENT_CONFIGURATION_VERSION
        );
        // The hash version reflects the recorded databases, not the writer.
        assert_eq!(reloaded.config.hash_version, 1);
        assert_eq!(reloaded.record_index(0x22), Some(0));
        assert_eq!(reloaded.record_index(0x11), Some(1));
    }

    #[test]
    fn missing_fields_use_defaults() {
        let json = r#"{ "textures": [ { "hashes": { "rt64": "aa" } } ] }"#;
        let db = ReplacementDatabase::from_reader(json.as_bytes()).unwrap();
        assert_eq!(db.config.configuration_version, 1);
        assert_eq!(db.config.hash_version, 1);
        assert_eq!(db.textures[0].load, ReplacementLoad::Stream);
        assert_eq!(db.textures[0].life, ReplacementLife::Pool);
    }

    #[test]
    fn rice_auto_path_resolution() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("subdir")).unwrap();
        fs::write(dir.path().join("subdir/mario#A1B2C3D4_ciByRGBA.png"), b"x").unwrap();

        let mut db = ReplacementDatabase::default();
        db.config.auto_path = ReplacementAutoPath::Rice;
        db.add_replacement(record("00ff00ff", "a1b2c3d4", ""));

        let resolved = db.resolve_paths(dir.path(), false);
        let entry = &resolved[&0x00ff00ff];
        assert_eq!(entry.relative_path, "subdir/mario#A1B2C3D4_ciByRGBA.png");
        assert_eq!(entry.record_index, 0);
    }

    #[test]
    fn rice_markers_must_be_ordered() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("under_then#hash.png"), b"x").unwrap();
        fs::write(dir.path().join("nomarkers.png"), b"x").unwrap();

        let mut db = ReplacementDatabase::default();
        db.config.auto_path = ReplacementAutoPath::Rice;
        db.add_replacement(record("11", "hash", ""));

        assert!(db.resolve_paths(dir.path(), false).is_empty());
    }

    #[test]
    fn explicit_path_probes_dds_before_png() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("wall.dds"), b"x").unwrap();
        fs::write(dir.path().join("wall.png"), b"x").unwrap();
        fs::write(dir.path().join("floor.png"), b"x").unwrap();

        let mut db = ReplacementDatabase::default();
        db.add_replacement(record("aa", "", "wall.PNG"));
        db.add_replacement(record("bb", "", "floor.dds"));
        db.add_replacement(record("cc", "", "missing.dds"));

        let resolved = db.resolve_paths(dir.path(), false);
        assert_eq!(resolved[&0xaa].relative_path, "wall.dds");
        assert_eq!(resolved[&0xbb].relative_path, "floor.png");
        assert!(!resolved.contains_key(&0xcc));

        // DDS-only resolution skips the PNG fallback entirely.
        let resolved = db.resolve_paths(dir.path(), true);
        assert_eq!(resolved[&0xaa].relative_path, "wall.dds");
        assert!(!resolved.contains_key(&0xbb));
    }
}
