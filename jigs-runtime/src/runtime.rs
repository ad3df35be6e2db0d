//! Property object lifecycle and the call-stack recorder

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use jigs_core::codec;
use jigs_core::{
    Checkpoint, Heap, HeapObject, JigError, Kind, Location, ObjRef, Result, Token, TokenKind, Value,
};
use log::{debug, info, warn};

use crate::action::{Action, TransactionBuilder, DEPLOY, NEW};
use crate::class::{ClassDef, MethodFn, CONSTRUCTOR, INIT};
use crate::config::{is_owner_string, RuntimeConfig};
use crate::control::{Control, Frame, RootCall};
use crate::evaluator::{Cx, Evaluator, NativeEvaluator};

/// Binding holding the owner address of a jig
pub const OWNER: &str = "owner";

/// Binding holding the value attached to a jig
pub const SATOSHIS: &str = "satoshis";

/// Upper bound of the satoshis binding
pub const MAX_SATOSHIS: f64 = 100_000_000.0;

const NONDETERMINISTIC_HINT: &str =
    "Method bodies are replayed by every verifier. Pass times and random values in as arguments instead.";

/// Executes jig methods and records their effects
///
/// The runtime owns the object arena, the deployed classes and the call context. Every read, write
/// and call on a jig goes through its [`Membrane`](crate::membrane::Membrane) implementation.
pub struct Runtime {
    pub(crate) heap: Heap,

    /// Context of the outermost invocation tree
    pub(crate) root: Control,

    /// Disposable contexts opened by non-recordable calls, innermost last
    pub(crate) children: Vec<Control>,

    /// Deployed classes keyed by code token
    pub(crate) classes: HashMap<ObjRef, Arc<ClassDef>>,

    builder: Box<dyn TransactionBuilder>,
    evaluator: Arc<dyn Evaluator>,
    config: RuntimeConfig,

    /// Outputs stored with the builder but not yet published
    unpublished: BTreeSet<ObjRef>,
}

impl Runtime {
    /// Create a runtime that hands its actions to `builder`
    ///
    /// # Parameters
    /// * `config` - Owner and network settings
    /// * `builder` - The transaction builder receiving every recorded action; a builder that
    ///   reports a network must match `config.network`
    ///
    /// # Returns
    /// The runtime, or a configuration error
    pub fn new(config: RuntimeConfig, builder: impl TransactionBuilder + 'static) -> Result<Self> {
        config.validate()?;
        if let Some(network) = builder.network() {
            if network != config.network {
                return Err(JigError::Config(format!(
                    "builder records to {} but the runtime is configured for {}",
                    network, config.network
                )));
            }
        }
        Ok(Self {
            heap: Heap::new(),
            root: Control::new(),
            children: Vec::new(),
            classes: HashMap::new(),
            builder: Box::new(builder),
            evaluator: Arc::new(NativeEvaluator),
            config,
            unpublished: BTreeSet::new(),
        })
    }

    /// Replace the evaluator that runs method bodies
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// The innermost active call context
    pub(crate) fn ctx(&self) -> &Control {
        self.children.last().unwrap_or(&self.root)
    }

    pub(crate) fn ctx_mut(&mut self) -> &mut Control {
        match self.children.last_mut() {
            Some(ctx) => ctx,
            None => &mut self.root,
        }
    }

    /// The arena and the innermost context, borrowed together
    fn parts(&mut self) -> (&Heap, &mut Control) {
        let ctx = match self.children.last_mut() {
            Some(ctx) => ctx,
            None => &mut self.root,
        };
        (&self.heap, ctx)
    }

    /// Whether any method body is executing
    pub fn in_method(&self) -> bool {
        !self.root.is_idle() || self.children.iter().any(|c| !c.is_idle())
    }

    /// Run `task` with capability checks switched off in the current call context
    ///
    /// For trusted host operations such as inspecting private fields or repairing state. The
    /// previous setting is restored when `task` returns.
    pub fn unenforced<R>(&mut self, task: impl FnOnce(&mut Self) -> R) -> R {
        let previous = std::mem::replace(&mut self.ctx_mut().enforce, false);
        let result = task(self);
        self.ctx_mut().enforce = previous;
        result
    }

    /// JSON dump of the innermost call context
    pub fn control_dump(&self) -> serde_json::Value {
        self.ctx().dump()
    }

    pub fn record<K: Into<String>>(&mut self, fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        self.heap.record(fields)
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        self.heap.array(items)
    }

    pub fn set_of(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        self.heap.set(items)
    }

    pub fn map_of(&mut self, entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        self.heap.map(entries)
    }

    pub fn bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Value {
        self.heap.bytes(bytes)
    }

    /// Raw origin of a token, without the membrane's sync check
    pub fn origin(&self, token: ObjRef) -> Result<Location> {
        Ok(self.token(token)?.origin.clone())
    }

    /// Raw location of a token, without the membrane's sync check
    pub fn location(&self, token: ObjRef) -> Result<Location> {
        Ok(self.token(token)?.location.clone())
    }

    pub(crate) fn token(&self, r: ObjRef) -> Result<&Token> {
        self.heap
            .token(r)
            .ok_or_else(|| JigError::InvalidObject(format!("{} is not a jig, berry or class", r)))
    }

    /// The class whose methods serve `token`; code tokens serve their own statics
    pub(crate) fn class_of(&self, token: ObjRef) -> Option<ObjRef> {
        let t = self.heap.token(token)?;
        match t.kind {
            TokenKind::Code => Some(token),
            _ => t.class,
        }
    }

    pub(crate) fn class_def(&self, code: ObjRef) -> Result<&Arc<ClassDef>> {
        self.classes
            .get(&code)
            .ok_or_else(|| JigError::InvalidClass(format!("{} is not a deployed class", code)))
    }

    /// `code` followed by each of its ancestors
    pub(crate) fn lineage(&self, code: ObjRef) -> Vec<ObjRef> {
        let mut chain = Vec::new();
        let mut next = Some(code);
        while let Some(class) = next {
            if chain.contains(&class) {
                break;
            }
            chain.push(class);
            next = self.classes.get(&class).and_then(|def| def.parent());
        }
        chain
    }

    pub(crate) fn find_method(&self, code: ObjRef, name: &str) -> Option<MethodFn> {
        self.lineage(code)
            .into_iter()
            .find_map(|c| self.classes.get(&c).and_then(|def| def.own_method(name)).cloned())
    }

    pub(crate) fn find_static(&self, code: ObjRef, name: &str) -> Option<MethodFn> {
        self.lineage(code)
            .into_iter()
            .find_map(|c| self.classes.get(&c).and_then(|def| def.own_static(name)).cloned())
    }

    /// Whether any class in the lineage of `code` declares `name`
    pub(crate) fn declares(&self, code: ObjRef, name: &str) -> bool {
        self.lineage(code)
            .into_iter()
            .any(|c| self.classes.get(&c).is_some_and(|def| def.declares(name)))
    }

    /// Two class tokens denote the same logical class: same token, or same committed origin
    pub(crate) fn same_class(&self, a: ObjRef, b: ObjRef) -> bool {
        if a == b {
            return true;
        }
        match (self.heap.token(a), self.heap.token(b)) {
            (Some(x), Some(y)) => {
                !x.origin.is_pending() && !x.origin.is_error() && x.origin == y.origin
            }
            _ => false,
        }
    }

    /// Whether one class is the other or descends from it
    pub(crate) fn related_classes(&self, a: ObjRef, b: ObjRef) -> bool {
        self.lineage(a).into_iter().any(|c| self.same_class(c, b))
            || self.lineage(b).into_iter().any(|c| self.same_class(c, a))
    }

    /// Whether `value` is an instance of `class` or one of its subclasses
    ///
    /// Classes are compared by origin, so separately installed copies of one deployed class are
    /// interchangeable.
    pub fn is_instance(&self, value: &Value, class: ObjRef) -> bool {
        let Some(token) = value.as_object().and_then(|r| self.heap.token(r)) else {
            return false;
        };
        match (token.kind, token.class) {
            (TokenKind::Jig | TokenKind::Berry, Some(own)) => {
                self.lineage(own).into_iter().any(|c| self.same_class(c, class))
            }
            _ => false,
        }
    }

    /// Deploy a class and record a deploy action for it
    ///
    /// # Parameters
    /// * `def` - The class definition
    ///
    /// # Returns
    /// The code token standing for the class
    pub fn deploy(&mut self, def: ClassDef) -> Result<ObjRef> {
        if self.in_method() {
            return Err(JigError::InvalidClass(format!(
                "{} cannot be deployed inside a method",
                def.name()
            )));
        }
        self.validate_class(&def)?;
        let code = self.register_class(def)?;

        let after = Checkpoint::of_token(&self.heap, code)?;
        let reads: BTreeSet<ObjRef> = self
            .classes
            .get(&code)
            .and_then(|def| def.parent())
            .into_iter()
            .collect();
        let action = Action {
            target: code,
            method: DEPLOY.to_string(),
            args: Checkpoint::of_value(&self.heap, &Value::Undefined)?,
            inputs: BTreeSet::new(),
            outputs: BTreeSet::from([code]),
            reads,
            before: BTreeMap::new(),
            after: BTreeMap::from([(code, after)]),
            proxies: BTreeMap::new(),
        };

        if let Err(e) = self.builder.store_action(&self.heap, action) {
            let error = JigError::from(e);
            self.invalidate(code, &error);
            return Err(error);
        }
        self.unpublished.insert(code);
        info!("Deployed class {} as {}", self.describe_class(code), code);
        Ok(code)
    }

    /// Register a copy of a class that was already deployed at `origin`
    pub fn install(&mut self, def: ClassDef, origin: Location) -> Result<ObjRef> {
        if origin.is_pending() || origin.is_error() {
            return Err(JigError::InvalidClass(format!(
                "{} cannot be installed at {}",
                def.name(),
                origin
            )));
        }
        self.validate_class(&def)?;
        let code = self.register_class(def)?;
        if let Some(token) = self.heap.token_mut(code) {
            token.origin = origin.clone();
            token.location = origin;
        }
        debug!("Installed class {} as {}", self.describe_class(code), code);
        Ok(code)
    }

    fn validate_class(&self, def: &ClassDef) -> Result<()> {
        if def.name().is_empty() {
            return Err(JigError::InvalidClass("classes must be named".to_string()));
        }
        if def.own_method(CONSTRUCTOR).is_some() {
            return Err(JigError::InvalidClass(format!(
                "{} must use init instead of a constructor",
                def.name()
            )));
        }
        if let Some(parent) = def.parent() {
            self.class_def(parent)?;
            self.check_valid(parent)?;
        }
        let has_init = def.own_method(INIT).is_some()
            || def.parent().is_some_and(|p| self.find_method(p, INIT).is_some());
        if !has_init {
            return Err(JigError::InvalidClass(format!("{} has no init method", def.name())));
        }
        Ok(())
    }

    fn register_class(&mut self, def: ClassDef) -> Result<ObjRef> {
        let code = self.heap.alloc(Kind::Token(Token::new(TokenKind::Code, None)));
        for (key, value) in &def.props {
            let copy = codec::clone_value(&mut self.heap, value)?;
            self.heap.stamp_owner(&copy, code);
            self.heap.set_property(code, key, copy)?;
        }
        self.heap
            .set_property(code, OWNER, Value::from(self.config.owner.clone()))?;
        if let Some(token) = self.heap.token_mut(code) {
            token.initialized = true;
        }
        self.classes.insert(code, Arc::new(def));
        Ok(code)
    }

    fn describe_class(&self, code: ObjRef) -> String {
        self.classes
            .get(&code)
            .map(|def| def.name().to_string())
            .unwrap_or_else(|| code.to_string())
    }

    /// Instantiate a jig of `class`, running its `init` exactly once
    ///
    /// Called outside any method this opens its own invocation tree and records a `new` action;
    /// inside a method the new jig joins the running tree and its creator becomes an output.
    pub fn construct(&mut self, class: ObjRef, args: &[Value]) -> Result<ObjRef> {
        self.class_def(class)?;
        self.check_valid(class)?;
        let init = self
            .find_method(class, INIT)
            .ok_or_else(|| JigError::InvalidClass(format!("{} has no init method", self.describe_class(class))))?;

        let jig = self.heap.alloc(Kind::Token(Token::new(TokenKind::Jig, Some(class))));
        let owner = self.inherited_owner()?;
        self.heap.stamp_owner(&owner, jig);
        self.heap.set_property(jig, OWNER, owner)?;
        self.heap.set_property(jig, SATOSHIS, Value::from(0.0))?;

        let ctx = self.ctx_mut();
        ctx.creates.insert(jig);
        ctx.reads.insert(class);

        self.invoke(jig, INIT, init, args, true)?;
        Ok(jig)
    }

    /// Owner of the jig running the current method, or the configured default
    fn inherited_owner(&mut self) -> Result<Value> {
        let creator = self.ctx().active_jig();
        let owner = match creator {
            Some(jig) => self.heap.get_property(jig, OWNER)?,
            None => Value::Undefined,
        };
        match owner {
            Value::Undefined => Ok(Value::from(self.config.owner.clone())),
            Value::Object(_) => codec::clone_value(&mut self.heap, &owner),
            other => Ok(other),
        }
    }

    /// Instantiate an immutable berry of `class` plucked from `path`
    pub fn pluck(&mut self, class: ObjRef, path: &str, args: &[Value]) -> Result<ObjRef> {
        self.class_def(class)?;
        self.check_valid(class)?;
        let init = self
            .find_method(class, INIT)
            .ok_or_else(|| JigError::InvalidClass(format!("{} has no init method", self.describe_class(class))))?;

        let class_location = self.location(class)?;
        let mut token = Token::new(TokenKind::Berry, Some(class));
        token.location = Location::berry(&class_location, path);
        token.origin = token.location.clone();
        let berry = self.heap.alloc(Kind::Token(token));

        self.invoke(berry, INIT, init, args, false)?;
        debug!("Plucked berry {} at {}", berry, path);
        Ok(berry)
    }

    /// Publish every pending action and resolve the locations of their outputs
    ///
    /// Must be called outside any method body.
    pub fn sync(&mut self, target: ObjRef) -> Result<()> {
        if self.in_method() {
            return Err(JigError::SyncInsideMethod);
        }
        self.check_valid(target)?;

        match self.builder.publish(&self.heap) {
            Ok(Some(published)) => {
                for (vout, output) in published.outputs.iter().enumerate() {
                    if let Some(token) = self.heap.token_mut(*output) {
                        token.location = Location::committed(&published.txid, vout + 1);
                        if token.origin.is_pending() {
                            token.origin = token.location.clone();
                        }
                    }
                    self.unpublished.remove(output);
                }
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                let error = JigError::from(e);
                warn!(
                    "Publish failed, invalidating {} pending outputs: {}",
                    self.unpublished.len(),
                    error
                );
                for output in std::mem::take(&mut self.unpublished) {
                    self.invalidate(output, &error);
                }
                Err(error)
            }
        }
    }

    /// Roll back an invocation tree that was abandoned before it settled
    ///
    /// A method body that panics leaves its frames and snapshots behind. This restores every
    /// touched object, invalidates every object the tree created and resets all call contexts.
    ///
    /// # Returns
    /// Whether there was anything to recover
    pub fn recover(&mut self) -> bool {
        let mut contexts: Vec<Control> = self.children.drain(..).rev().collect();
        contexts.push(std::mem::take(&mut self.root));
        let dirty = contexts
            .iter()
            .any(|c| !c.is_idle() || !c.before.is_empty() || !c.creates.is_empty());
        if !dirty {
            return false;
        }

        let error = JigError::IllegalStateMutation("invocation aborted before it settled".to_string());
        // Innermost first so the oldest snapshots are restored last
        for ctx in contexts {
            self.rollback(ctx, error.clone());
        }
        true
    }

    /// Mark `token` permanently unusable
    fn invalidate(&mut self, token: ObjRef, error: &JigError) {
        if let Some(t) = self.heap.token_mut(token) {
            let location = Location::error(error);
            if !t.origin.is_error() && (t.origin.is_pending() || t.origin == t.location) {
                t.origin = location.clone();
            }
            t.location = location;
        }
    }

    /// Run `method` on `target`
    ///
    /// Non-recordable calls run inside a fresh child context. A call made while the current
    /// context is idle opens an invocation tree, which settles or rolls back when it returns.
    pub(crate) fn invoke(
        &mut self,
        target: ObjRef,
        method: &str,
        body: MethodFn,
        args: &[Value],
        recordable: bool,
    ) -> Result<Value> {
        if !recordable {
            let parent_caller = self.ctx().active_jig();
            self.children.push(Control::child(parent_caller));
        }
        let opens_tree = self.ctx().is_idle();
        let caller = self.ctx().active_jig();

        self.ctx_mut().stack.push(Frame {
            target,
            method: method.to_string(),
            recordable,
        });
        let outcome = self.run_frame(target, method, &body, args, recordable, caller, opens_tree);
        let ctx = self.ctx_mut();
        ctx.stack.pop();
        if let Err(e) = &outcome {
            ctx.record_error(e);
        }

        if opens_tree {
            self.finish_tree(outcome)
        } else {
            outcome
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_frame(
        &mut self,
        target: ObjRef,
        method: &str,
        body: &MethodFn,
        args: &[Value],
        recordable: bool,
        caller: Option<ObjRef>,
        opens_tree: bool,
    ) -> Result<Value> {
        debug!("Calling {} on {}", method, target);
        if recordable {
            if let Some(caller) = caller {
                self.ctx_mut().register_caller(target, caller);
            }
            let (heap, ctx) = self.parts();
            ctx.snapshot_before(heap, target)?;
        }

        let (checkpoint, args) = self.copy_args(args)?;
        if opens_tree {
            let name = if method == INIT && recordable { NEW } else { method };
            self.ctx_mut().root_call = Some(RootCall {
                target,
                method: name.to_string(),
                args: checkpoint,
                recordable,
            });
        }

        let evaluator = self.evaluator.clone();
        let value = {
            let mut cx = Cx::new(self, target);
            evaluator.evaluate(body, &mut cx, &args)?
        };

        if method == INIT {
            if !value.is_undefined() {
                return Err(JigError::InitReturnedValue);
            }
            if let Some(token) = self.heap.token_mut(target) {
                token.initialized = true;
            }
        }
        if self.heap.token(target).is_some_and(|t| t.is_jig()) {
            self.validate_bindings(target)?;
        }
        if let Some(error) = self.ctx().error.clone() {
            return Err(JigError::Unswallowed(Box::new(error)));
        }
        Ok(value)
    }

    /// Copy call arguments through a checkpoint so the callee cannot alter what was passed in
    fn copy_args(&mut self, args: &[Value]) -> Result<(Checkpoint, Vec<Value>)> {
        let list = self.heap.array(args.to_vec());
        let mut checkpoint = Checkpoint::of_value(&self.heap, &list)?;
        if let Some(r) = list.as_object() {
            self.heap.discard(r);
        }
        let copy = checkpoint.restore(&mut self.heap)?;
        match copy.as_object().and_then(|r| self.heap.get(r)) {
            Some(HeapObject {
                kind: Kind::Array(items),
                ..
            }) => Ok((checkpoint, items.clone())),
            _ => Err(JigError::Decode("arguments did not decode to a list".to_string())),
        }
    }

    fn validate_bindings(&self, jig: ObjRef) -> Result<()> {
        match self.heap.get_property(jig, OWNER)? {
            Value::String(owner) if is_owner_string(&owner) => {}
            Value::Object(r) if self.is_script_owner(r) => {}
            other => return Err(JigError::InvalidOwner(self.heap.describe(&other))),
        }
        match self.heap.get_property(jig, SATOSHIS)? {
            Value::Number(n) if n.fract() == 0.0 && (0.0..=MAX_SATOSHIS).contains(&n) => Ok(()),
            other => Err(JigError::InvalidSatoshis(self.heap.describe(&other))),
        }
    }

    /// A record carrying a locking script in its `script` field
    fn is_script_owner(&self, r: ObjRef) -> bool {
        let Ok(obj) = self.heap.object(r) else {
            return false;
        };
        let Kind::Record(fields) = &obj.kind else {
            return false;
        };
        matches!(
            fields.get("script").and_then(|s| s.as_object()).and_then(|s| self.heap.get(s)),
            Some(HeapObject { kind: Kind::Bytes(_), .. })
        )
    }

    /// Settle or roll back the tree whose context is innermost
    fn finish_tree(&mut self, outcome: Result<Value>) -> Result<Value> {
        let is_child = !self.children.is_empty();
        let mut ctx = match self.children.pop() {
            Some(ctx) => ctx,
            None => std::mem::take(&mut self.root),
        };
        let parent_active = is_child && !self.ctx().is_idle();

        // Nested helpers hand everything they touched to the enclosing tree
        if parent_active {
            if let Err(e) = &outcome {
                ctx.record_error(e);
            }
            self.ctx_mut().absorb(ctx);
            return outcome;
        }

        let settled = outcome.and_then(|value| self.settle(&mut ctx).map(|_| value));
        match settled {
            Ok(value) => Ok(value),
            Err(error) => Err(self.rollback(ctx, error)),
        }
    }

    /// Turn the accumulated reads and writes of a finished tree into zero or one action
    fn settle(&mut self, ctx: &mut Control) -> Result<()> {
        let mut after = BTreeMap::new();
        for target in ctx.reads.iter().chain(ctx.before.keys()) {
            if !after.contains_key(target) {
                after.insert(*target, Checkpoint::of_token(&self.heap, *target)?);
            }
        }
        let changed: Vec<ObjRef> = ctx
            .before
            .iter()
            .filter(|(target, before)| after.get(*target).is_some_and(|a| !before.equals(a)))
            .map(|(target, _)| *target)
            .collect();

        if ctx.creates.is_empty() && changed.is_empty() {
            debug!("Invocation changed nothing; no action recorded");
            return Ok(());
        }

        let root = ctx
            .root_call
            .take()
            .ok_or_else(|| JigError::IllegalStateMutation("no call opened this tree".to_string()))?;
        if !root.recordable {
            return Err(JigError::IllegalStateMutation(format!(
                "{} is a helper and may not change jig state",
                root.method
            )));
        }

        let mut inputs = BTreeSet::new();
        let mut outputs = BTreeSet::new();
        for target in changed.iter().chain(ctx.creates.iter()) {
            for spent in ctx.blame_chain(*target) {
                if self.heap.token(spent).is_some_and(|t| t.is_berry()) {
                    continue;
                }
                outputs.insert(spent);
                if !ctx.creates.contains(&spent) {
                    inputs.insert(spent);
                }
            }
        }
        for output in &outputs {
            if !after.contains_key(output) {
                after.insert(*output, Checkpoint::of_token(&self.heap, *output)?);
            }
        }

        let action = Action {
            target: root.target,
            method: root.method,
            args: root.args,
            inputs,
            outputs: outputs.clone(),
            reads: ctx.reads.clone(),
            before: std::mem::take(&mut ctx.before),
            after,
            proxies: std::mem::take(&mut ctx.proxies),
        };
        info!(
            "Recorded action {} on {} ({} inputs, {} outputs)",
            action.method,
            action.target,
            action.inputs.len(),
            action.outputs.len()
        );
        let before = action.before.clone();
        if let Err(e) = self.builder.store_action(&self.heap, action) {
            // Keep the snapshots so the failure path can restore them
            ctx.before = before;
            return Err(JigError::from(e));
        }

        for output in outputs {
            if let Some(token) = self.heap.token_mut(output) {
                token.location = Location::pending();
            }
            self.unpublished.insert(output);
        }
        Ok(())
    }

    /// Restore every touched object and invalidate every created one
    ///
    /// Returns the error the caller should see: the first error of the tree, unless the tree
    /// failed because that error was swallowed.
    fn rollback(&mut self, ctx: Control, error: JigError) -> JigError {
        let error = match error {
            JigError::Unswallowed(_) => error,
            other => ctx.error.clone().unwrap_or(other),
        };
        let error = match error {
            JigError::Nondeterministic { primitive, hint: None } => JigError::Nondeterministic {
                primitive,
                hint: Some(NONDETERMINISTIC_HINT.to_string()),
            },
            other => other,
        };

        warn!(
            "Rolling back {} objects after error: {}",
            ctx.before.len(),
            error
        );
        for (target, checkpoint) in &ctx.before {
            if let Err(e) = checkpoint.restore_in_place(&mut self.heap, *target) {
                warn!("Failed to restore {}: {}", target, e);
                self.invalidate(*target, &e);
            }
        }
        for created in &ctx.creates {
            self.invalidate(*created, &error);
        }
        error
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("objects", &self.heap.len())
            .field("classes", &self.classes.len())
            .field("contexts", &(self.children.len() + 1))
            .field("config", &self.config)
            .finish()
    }
}
