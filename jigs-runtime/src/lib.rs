pub mod action;
pub mod class;
pub mod config;
pub mod control;
pub mod evaluator;
pub mod ledger;
pub mod membrane;
pub mod queue;
pub mod runtime;

// Re-export the main types for convenience
pub use action::{Action, Published, TransactionBuilder, DEPLOY, NEW};
pub use class::{ClassDef, MethodFn, CONSTRUCTOR, INIT};
pub use config::RuntimeConfig;
pub use control::{Control, Frame};
pub use evaluator::{Cx, Evaluator, NativeEvaluator};
pub use ledger::{LedgerRecord, MemoryLedger};
pub use membrane::Membrane;
pub use queue::SharedRuntime;
pub use runtime::{Runtime, MAX_SATOSHIS, OWNER, SATOSHIS};
