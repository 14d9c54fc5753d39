pub mod error;
pub mod memory;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::{MemoryMediaStore, MemoryStore, StaticAuth};
pub use traits::{AuthProvider, MediaStore, SessionStore};
