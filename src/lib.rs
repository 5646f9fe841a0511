//! Texture replacement cache for an N64 graphics reimplementation layer.
//!
//! Emulated rendering uploads small TMEM-resident textures; this crate
//! memoizes those uploads into a content-addressed map, resolves their
//! hashes against a user-supplied pack of high-resolution assets, and
//! streams those assets in from disk without stalling the render
//! submission thread.

pub mod dds;
pub mod gfx;
pub mod low_mip;
pub mod replacement;
pub mod replacement_map;
pub mod texture;
pub mod texture_cache;
pub mod texture_map;
pub mod tmem;

pub use replacement::{
    ReplacementAutoPath, ReplacementDatabase, ReplacementLife, ReplacementLoad, ReplacementTexture,
};
pub use texture_cache::{TextureCache, TextureUpload};
pub use texture_map::{TextureMap, UseResult};
