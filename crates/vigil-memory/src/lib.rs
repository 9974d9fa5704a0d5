//! Similarity memory for Vigil: embeddings, a SQLite vector store and the
//! recall service steps use to find prior runs resembling the current one.

pub mod embeddings;
pub mod recall;
pub mod store;

pub use embeddings::{cosine_similarity, HttpEmbeddingProvider};
pub use recall::RecallService;
pub use store::SqliteSimilarityStore;
