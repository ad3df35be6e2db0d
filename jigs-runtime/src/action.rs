use std::collections::{BTreeMap, BTreeSet};

use jigs_core::{Checkpoint, Heap, ObjRef, TxId};

/// Name of the action emitted when a class is deployed
pub const DEPLOY: &str = "deploy";

/// Name of the action emitted when a jig is constructed outside any method
pub const NEW: &str = "new";

/// One recorded state transition
#[derive(Debug, Clone)]
pub struct Action {
    /// The object whose method opened the invocation tree
    pub target: ObjRef,

    /// The method that opened the invocation tree
    pub method: String,

    /// The arguments as passed in, snapshotted before the body ran
    pub args: Checkpoint,

    /// Prior states consumed: objects that existed before the tree began
    pub inputs: BTreeSet<ObjRef>,

    /// New states produced: every changed or created object and its callers
    pub outputs: BTreeSet<ObjRef>,

    /// Objects whose state was observed
    pub reads: BTreeSet<ObjRef>,

    /// State of every touched object before the tree began
    pub before: BTreeMap<ObjRef, Checkpoint>,

    /// State of every touched or read object at settlement
    pub after: BTreeMap<ObjRef, Checkpoint>,

    /// Internal objects handed out during the tree, mapped to the token that owns them
    pub proxies: BTreeMap<ObjRef, ObjRef>,
}

impl Action {
    /// Objects created by this action
    pub fn creates(&self) -> impl Iterator<Item = &ObjRef> {
        self.outputs.difference(&self.inputs)
    }
}

/// A published ledger record, as reported back to the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Published {
    /// Identifier of the record
    pub txid: TxId,

    /// Output objects in output order; output `i` is located at `<txid>_o<i+1>`
    pub outputs: Vec<ObjRef>,
}

/// Turns recorded actions into persisted ledger records
pub trait TransactionBuilder: Send {
    /// Accept one action
    ///
    /// # Parameters
    /// * `heap` - The object arena the action's handles point into
    /// * `action` - The action to store
    ///
    /// # Returns
    /// Ok(()) if accepted; errors are passed to the caller unchanged
    fn store_action(&mut self, heap: &Heap, action: Action) -> anyhow::Result<()>;

    /// Publish every stored action as one record
    ///
    /// # Parameters
    /// * `heap` - The object arena the stored actions' handles point into
    ///
    /// # Returns
    /// The published record, or None if nothing was pending
    fn publish(&mut self, heap: &Heap) -> anyhow::Result<Option<Published>>;

    /// Network label the builder stamps into its records, if it has one
    fn network(&self) -> Option<String> {
        None
    }
}
