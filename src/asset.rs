pub mod feeds;
pub mod flags;
pub mod records;

pub use records::{AssetDynamicData, AssetOptions, AssetRecord, BitassetData, GlobalSettlement};
