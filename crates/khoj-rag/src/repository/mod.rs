pub mod assets;
pub mod chunk;
pub mod document;

pub use assets::{AssetHit, AssetInput, AssetRepository};
pub use chunk::ChunkRepository;
pub use document::DocumentRepository;
