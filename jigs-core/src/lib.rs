pub mod checkpoint;
pub mod codec;
pub mod error;
pub mod id;
pub mod objects;

// Re-export the main types for convenience
pub use checkpoint::Checkpoint;
pub use codec::{clone_value, decode, encode, DecodeOptions, EncodeOptions, TokenLoader, TokenSaver};
pub use error::{JigError, Result};
pub use id::{Location, ObjRef, TxId};
pub use objects::{Heap, HeapObject, Kind, Token, TokenKind, Value, MAX_ARRAY_LENGTH};
