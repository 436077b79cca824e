mod index_store;
mod memory_index;
mod schema;
mod sqlite_index;

pub use index_store::{
    EntryCursor, EntryFilter, EntryLookup, IndexStore, PutMode, RestoreBegin, RestoreChange,
    Transition,
};
pub use memory_index::MemoryIndexStore;
pub use sqlite_index::SqliteIndexStore;
