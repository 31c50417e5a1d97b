//! 数据访问层

pub mod blob_store;
pub mod record_store;

pub use blob_store::{BlobStore, MemoryBlobStore, S3BlobStore};
pub use record_store::{MemoryRecordStore, PgRecordStore, RecordStore};
