//! Indexing pipeline: chunking, encoding, vector index, knowledge graph

pub mod chunker;
pub mod embedding;
pub mod entities;
pub mod graph;
pub mod indexer;
pub mod sparse;
pub mod vector;

pub use chunker::{chunk_pages, Chunk, ChunkerConfig};
pub use embedding::{cosine_similarity, normalize_l2, EmbeddingService};
pub use entities::{EntityExtractor, ExtractedEntity, ExtractedRelation};
pub use graph::{EntityType, GraphStore, RelatedEntity, RelationType};
pub use indexer::{IndexSummary, Indexer};
pub use sparse::{SparseEncoder, SparseVector};
pub use vector::{
    IndexStats, MetadataFilter, ScoredChunk, SqliteVectorIndex, VectorIndex, VectorMetadata,
    VectorRecord,
};
