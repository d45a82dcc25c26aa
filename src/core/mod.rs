pub mod error;
pub mod symbol;
pub mod version;

pub use error::{Result, RuntimeError};
pub use symbol::{GLOBAL_NAMESPACE, SymbolIdentity, SymbolKey, SymbolPayload};
pub use version::{Version, is_compatible, runtime_version};
