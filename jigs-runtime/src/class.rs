//! Class definitions for deployable code

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use jigs_core::{ObjRef, Result, Value};

use crate::evaluator::Cx;

/// Body of an instance method or static helper
pub type MethodFn = Arc<dyn Fn(&mut Cx<'_>, &[Value]) -> Result<Value> + Send + Sync>;

/// Name of the method run exactly once at construction
pub const INIT: &str = "init";

/// Reserved name that classes must not declare
pub const CONSTRUCTOR: &str = "constructor";

/// A user-defined class before deployment
#[derive(Clone)]
pub struct ClassDef {
    pub(crate) name: String,
    pub(crate) extends: Option<ObjRef>,
    pub(crate) methods: BTreeMap<String, MethodFn>,
    pub(crate) statics: BTreeMap<String, MethodFn>,
    pub(crate) props: BTreeMap<String, Value>,
}

impl fmt::Debug for ClassDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassDef")
            .field("name", &self.name)
            .field("extends", &self.extends)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("statics", &self.statics.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            extends: None,
            methods: BTreeMap::new(),
            statics: BTreeMap::new(),
            props: BTreeMap::new(),
        }
    }

    /// Inherit methods from an already deployed class
    pub fn extends(mut self, parent: ObjRef) -> Self {
        self.extends = Some(parent);
        self
    }

    /// Declare an instance method
    pub fn method<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Cx<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.methods.insert(name.into(), Arc::new(body));
        self
    }

    /// Declare a static helper; helpers are not recorded as actions
    pub fn static_fn<F>(mut self, name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut Cx<'_>, &[Value]) -> Result<Value> + Send + Sync + 'static,
    {
        self.statics.insert(name.into(), Arc::new(body));
        self
    }

    /// Attach a static property to the class
    pub fn prop(mut self, name: impl Into<String>, value: Value) -> Self {
        self.props.insert(name.into(), value);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<ObjRef> {
        self.extends
    }

    pub fn own_method(&self, name: &str) -> Option<&MethodFn> {
        self.methods.get(name)
    }

    pub fn own_static(&self, name: &str) -> Option<&MethodFn> {
        self.statics.get(name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.methods.contains_key(name) || self.statics.contains_key(name)
    }
}
