pub mod error;
pub mod types;

pub use error::{ConflictKind, Result, StoreError};
pub use types::{Id, Lease, Pointer, Tag, Version};
