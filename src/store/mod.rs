//! Persistent metadata: the asset catalog, cache entries, and the stream session log.

mod catalog;
pub mod model;

pub use catalog::MetadataStore;
pub use model::{
    AssetId, AssetRecord, CacheEntry, CacheEntryId, NewSession, PlaybackStats, ScannedAsset,
    SessionId, StreamSession, UpsertOutcome,
};
