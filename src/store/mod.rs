//! The analytics store boundary: an insert/query interface only. Schema DDL,
//! storage tiering, replication and compression are the store's own concern
//! and are never reasoned about here beyond what [`sqlite_store`] needs to
//! stand up a concrete backing for tests and the binary.

pub mod cursor;
pub mod sink;
pub mod sqlite_store;

pub use cursor::CursorStore;
pub use sink::Sink;
pub use sqlite_store::SqliteStore;
