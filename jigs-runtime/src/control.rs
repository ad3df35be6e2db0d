//! Shared call context of one invocation tree

use std::collections::{BTreeMap, BTreeSet};

use jigs_core::{Checkpoint, Heap, JigError, ObjRef, Result};
use serde::Serialize;

/// One executing method
#[derive(Debug, Clone, Serialize)]
pub struct Frame {
    pub target: ObjRef,
    pub method: String,
    /// Jig methods are recordable; static helpers and berry methods are not
    pub recordable: bool,
}

/// The call that opened the tree
#[derive(Debug, Clone)]
pub struct RootCall {
    pub target: ObjRef,
    pub method: String,
    pub args: Checkpoint,
    pub recordable: bool,
}

/// Mutable bookkeeping for one invocation tree
///
/// Owned by the runtime for the lifetime of the tree and reset once the tree settles or fails.
#[derive(Debug, Clone, Serialize)]
pub struct Control {
    /// Objects currently executing a method; the last frame is the active one
    pub stack: Vec<Frame>,

    /// Objects instantiated in this tree
    pub creates: BTreeSet<ObjRef>,

    /// Objects whose state was observed
    pub reads: BTreeSet<ObjRef>,

    /// Pre-call snapshot of every object that ran a method in this tree
    pub before: BTreeMap<ObjRef, Checkpoint>,

    /// For each object, the objects that invoked one of its methods
    pub callers: BTreeMap<ObjRef, BTreeSet<ObjRef>>,

    /// Internal objects handed out through the membrane, mapped to their owner
    pub proxies: BTreeMap<ObjRef, ObjRef>,

    /// Capability checks are suspended while false
    pub enforce: bool,

    /// The jig that was running when this child context was opened
    pub parent_caller: Option<ObjRef>,

    /// First error raised in this tree
    #[serde(skip)]
    pub error: Option<JigError>,

    #[serde(skip)]
    pub root_call: Option<RootCall>,
}

impl Default for Control {
    fn default() -> Self {
        Self::new()
    }
}

impl Control {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            creates: BTreeSet::new(),
            reads: BTreeSet::new(),
            before: BTreeMap::new(),
            callers: BTreeMap::new(),
            proxies: BTreeMap::new(),
            enforce: true,
            parent_caller: None,
            error: None,
            root_call: None,
        }
    }

    /// A disposable context for a helper invoked while `parent_caller` was running
    pub fn child(parent_caller: Option<ObjRef>) -> Self {
        Self {
            parent_caller,
            ..Self::new()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.stack.is_empty()
    }

    pub fn top(&self) -> Option<&Frame> {
        self.stack.last()
    }

    /// The innermost running jig, falling back to the jig that opened this context
    pub fn active_jig(&self) -> Option<ObjRef> {
        self.stack
            .iter()
            .rev()
            .find(|f| f.recordable)
            .map(|f| f.target)
            .or(self.parent_caller)
    }

    pub fn register_caller(&mut self, target: ObjRef, caller: ObjRef) {
        if caller != target {
            self.callers.entry(target).or_default().insert(caller);
        }
    }

    /// Snapshot `target` unless this tree already holds its pre-call state
    pub fn snapshot_before(&mut self, heap: &Heap, target: ObjRef) -> Result<()> {
        if !self.before.contains_key(&target) {
            let checkpoint = Checkpoint::of_token(heap, target)?;
            self.before.insert(target, checkpoint);
        }
        Ok(())
    }

    /// Keep the first error of the tree
    pub fn record_error(&mut self, error: &JigError) {
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
    }

    /// Fold a settled child context into this one
    ///
    /// Snapshots already held here win, since they predate the child's.
    pub fn absorb(&mut self, child: Control) {
        self.creates.extend(child.creates);
        self.reads.extend(child.reads);
        for (target, checkpoint) in child.before {
            self.before.entry(target).or_insert(checkpoint);
        }
        self.proxies.extend(child.proxies);
        for (target, callers) in child.callers {
            self.callers.entry(target).or_default().extend(callers);
        }
        if let Some(error) = child.error {
            self.record_error(&error);
        }
    }

    /// Every object transitively responsible for a change to `target`, itself included
    pub fn blame_chain(&self, target: ObjRef) -> BTreeSet<ObjRef> {
        let mut chain = BTreeSet::new();
        let mut pending = vec![target];
        while let Some(next) = pending.pop() {
            if chain.insert(next) {
                if let Some(callers) = self.callers.get(&next) {
                    pending.extend(callers.iter().copied());
                }
            }
        }
        chain
    }

    /// JSON dump for debugging
    pub fn dump(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jigs_core::{Kind, Token, TokenKind, Value};

    fn token(heap: &mut Heap) -> ObjRef {
        heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)))
    }

    #[test]
    fn test_active_jig_skips_helper_frames() {
        let mut ctx = Control::child(Some(ObjRef::new(9)));
        assert_eq!(ctx.active_jig(), Some(ObjRef::new(9)));

        ctx.stack.push(Frame {
            target: ObjRef::new(1),
            method: "m".to_string(),
            recordable: true,
        });
        ctx.stack.push(Frame {
            target: ObjRef::new(2),
            method: "helper".to_string(),
            recordable: false,
        });
        assert_eq!(ctx.active_jig(), Some(ObjRef::new(1)));
    }

    #[test]
    fn test_blame_chain_is_transitive() {
        let mut ctx = Control::new();
        let (x, y, z) = (ObjRef::new(1), ObjRef::new(2), ObjRef::new(3));
        ctx.register_caller(y, x);
        ctx.register_caller(z, y);
        ctx.register_caller(z, z);
        assert_eq!(ctx.blame_chain(z), BTreeSet::from([x, y, z]));
        assert_eq!(ctx.blame_chain(x), BTreeSet::from([x]));
    }

    #[test]
    fn test_absorb_keeps_earlier_snapshots() {
        let mut heap = Heap::new();
        let j = token(&mut heap);
        heap.set_property(j, "n", Value::from(1.0)).unwrap();

        let mut outer = Control::new();
        outer.snapshot_before(&heap, j).unwrap();

        heap.set_property(j, "n", Value::from(2.0)).unwrap();
        let mut child = Control::child(None);
        child.snapshot_before(&heap, j).unwrap();
        child.reads.insert(j);
        child.register_caller(j, ObjRef::new(7));
        child.record_error(&JigError::user("first"));

        outer.absorb(child);
        assert_eq!(outer.before[&j].state(), &serde_json::json!({"n": 1}));
        assert!(outer.reads.contains(&j));
        assert!(outer.callers[&j].contains(&ObjRef::new(7)));
        assert!(matches!(outer.error, Some(JigError::User(ref m)) if m == "first"));
    }

    #[test]
    fn test_dump_is_json() {
        let mut ctx = Control::new();
        ctx.reads.insert(ObjRef::new(4));
        let dump = ctx.dump();
        assert_eq!(dump["enforce"], serde_json::json!(true));
        assert_eq!(dump["reads"], serde_json::json!([4]));
    }
}
