//! Interception of every structural operation on jigs and the objects they own

use jigs_core::{JigError, Kind, ObjRef, Result, TokenKind, Value};

use crate::class::INIT;
use crate::runtime::Runtime;

const ORIGIN: &str = "origin";
const LOCATION: &str = "location";

/// Trap methods run for every operation on a membrane-wrapped object
///
/// Targets are either tokens (jigs, berries, classes) or internal objects owned by one. Objects
/// owned by no token are passed through unchecked.
pub trait Membrane {
    /// Read a property
    fn on_get(&mut self, target: ObjRef, key: &str) -> Result<Value>;

    /// Assign a property; only the owning token's own methods may do this
    fn on_set(&mut self, target: ObjRef, key: &str, value: Value) -> Result<()>;

    /// Check whether a property exists
    fn on_has(&mut self, target: ObjRef, key: &str) -> Result<bool>;

    /// Delete a property; returns whether it existed
    fn on_delete(&mut self, target: ObjRef, key: &str) -> Result<bool>;

    /// List the visible own property names
    fn on_enumerate(&mut self, target: ObjRef) -> Result<Vec<String>>;

    /// Invoke a method of a token, or an intrinsic method of a container
    fn on_call(&mut self, target: ObjRef, method: &str, args: &[Value]) -> Result<Value>;
}

impl Membrane for Runtime {
    fn on_get(&mut self, target: ObjRef, key: &str) -> Result<Value> {
        self.check_valid(target)?;
        let Some(root) = self.heap.root_of(target) else {
            return self.heap.get_property(target, key);
        };

        if target == root {
            if let Some(binding) = self.read_binding(root, key)? {
                return Ok(binding);
            }
            self.check_private(root, key)?;
            if self.is_method_name(root, key) {
                // Methods are not values
                return Ok(Value::Undefined);
            }
        }

        let value = self.heap.get_property(target, key)?;
        self.track_read(root);
        self.track_proxy(&value, root);
        Ok(value)
    }

    fn on_set(&mut self, target: ObjRef, key: &str, value: Value) -> Result<()> {
        self.check_valid(target)?;
        let Some(root) = self.heap.root_of(target) else {
            return self.heap.set_property(target, key, value);
        };

        if target == root {
            self.check_binding(root, key)?;
        }
        self.check_write(root)?;
        self.heap.stamp_owner(&value, root);
        self.heap.set_property(target, key, value)
    }

    fn on_has(&mut self, target: ObjRef, key: &str) -> Result<bool> {
        self.check_valid(target)?;
        let Some(root) = self.heap.root_of(target) else {
            return self.heap.has_property(target, key);
        };

        if target == root {
            if key == ORIGIN || key == LOCATION {
                return Ok(true);
            }
            self.check_private(root, key)?;
            if self.is_method_name(root, key) {
                return Ok(true);
            }
        }
        self.track_read(root);
        self.heap.has_property(target, key)
    }

    fn on_delete(&mut self, target: ObjRef, key: &str) -> Result<bool> {
        self.check_valid(target)?;
        let Some(root) = self.heap.root_of(target) else {
            return self.heap.delete_property(target, key);
        };

        if target == root {
            self.check_binding(root, key)?;
        }
        self.check_write(root)?;
        self.heap.delete_property(target, key)
    }

    fn on_enumerate(&mut self, target: ObjRef) -> Result<Vec<String>> {
        self.check_valid(target)?;
        let keys = self.heap.own_keys(target)?;
        let Some(root) = self.heap.root_of(target) else {
            return Ok(keys);
        };

        self.track_read(root);
        if target != root || self.can_see_private(root) {
            return Ok(keys);
        }
        Ok(keys.into_iter().filter(|k| !k.starts_with('_')).collect())
    }

    fn on_call(&mut self, target: ObjRef, method: &str, args: &[Value]) -> Result<Value> {
        self.check_valid(target)?;
        let Some(token) = self.heap.token(target) else {
            let root = self.heap.root_of(target);
            return self.call_intrinsic(target, root, method, args);
        };
        let (kind, class) = (token.kind, token.class);

        self.check_private(target, method)?;
        match kind {
            TokenKind::Code => {
                let body = self
                    .find_static(target, method)
                    .ok_or_else(|| JigError::UnknownMethod(self.method_label(target, method)))?;
                self.invoke(target, method, body, args, false)
            }
            TokenKind::Jig | TokenKind::Berry => {
                if method == INIT {
                    return Err(JigError::InitCalledTwice(self.heap.describe(&Value::Object(target))));
                }
                let class = class.ok_or_else(|| {
                    JigError::InvalidObject(format!("{} has no class", target))
                })?;
                let body = self
                    .find_method(class, method)
                    .ok_or_else(|| JigError::UnknownMethod(self.method_label(class, method)))?;
                self.invoke(target, method, body, args, kind == TokenKind::Jig)
            }
        }
    }
}

impl Runtime {
    /// Fail fast on objects whose root token carries an error location
    pub(crate) fn check_valid(&self, target: ObjRef) -> Result<()> {
        self.heap.object(target)?;
        let Some(token) = self.heap.root_of(target).and_then(|root| self.heap.token(root)) else {
            return Ok(());
        };
        for binding in [&token.location, &token.origin] {
            if let Some(message) = binding.error_message() {
                return Err(JigError::InvalidObject(message.to_string()));
            }
        }
        Ok(())
    }

    /// `origin` and `location` of a token; pending values cannot be read
    fn read_binding(&self, token: ObjRef, key: &str) -> Result<Option<Value>> {
        let t = self.token(token)?;
        let location = match key {
            ORIGIN => &t.origin,
            LOCATION => &t.location,
            _ => return Ok(None),
        };
        if location.is_pending() {
            return Err(JigError::SyncRequired(key.to_string()));
        }
        Ok(Some(Value::from(location.as_str())))
    }

    fn is_method_name(&self, token: ObjRef, key: &str) -> bool {
        self.class_of(token)
            .is_some_and(|class| self.declares(class, key))
    }

    fn method_label(&self, class: ObjRef, method: &str) -> String {
        match self.classes.get(&class) {
            Some(def) => format!("{}.{}", def.name(), method),
            None => method.to_string(),
        }
    }

    /// Whether the running method may see underscore-prefixed names of `token`
    fn can_see_private(&self, token: ObjRef) -> bool {
        let ctx = self.ctx();
        if !ctx.enforce {
            return true;
        }
        let Some(frame) = ctx.top() else {
            return true;
        };
        match (self.class_of(frame.target), self.class_of(token)) {
            (Some(accessor), Some(owner)) => self.related_classes(accessor, owner),
            _ => false,
        }
    }

    fn check_private(&self, token: ObjRef, key: &str) -> Result<()> {
        if key.starts_with('_') && !self.can_see_private(token) {
            return Err(JigError::PrivacyViolation(key.to_string()));
        }
        Ok(())
    }

    /// `origin`, `location` and method names are never assigned or deleted
    fn check_binding(&self, token: ObjRef, key: &str) -> Result<()> {
        if key == ORIGIN || key == LOCATION || self.is_method_name(token, key) {
            return Err(JigError::ImmutableBinding(key.to_string()));
        }
        Ok(())
    }

    /// Only the owning token's own methods may change it or anything it owns
    fn check_write(&self, root: ObjRef) -> Result<()> {
        let ctx = self.ctx();
        if !ctx.enforce {
            return Ok(());
        }
        let token = self.token(root)?;
        if token.is_berry() && token.initialized {
            return Err(JigError::IllegalMutation(format!(
                "{} is a berry and cannot change after init",
                root
            )));
        }
        match ctx.top() {
            Some(frame) if frame.target == root && (frame.recordable || token.is_berry()) => Ok(()),
            Some(frame) if frame.target == root => Err(JigError::IllegalMutation(format!(
                "{} is a helper and cannot change {}",
                frame.method, root
            ))),
            Some(frame) => Err(JigError::IllegalMutation(format!(
                "{} cannot be changed from a method of {}",
                root, frame.target
            ))),
            None => Err(JigError::IllegalMutation(format!(
                "{} can only be changed inside its own methods",
                root
            ))),
        }
    }

    fn track_read(&mut self, root: ObjRef) {
        let ctx = self.ctx_mut();
        if !ctx.is_idle() {
            ctx.reads.insert(root);
        }
    }

    fn track_proxy(&mut self, value: &Value, root: ObjRef) {
        let Some(r) = value.as_object() else { return };
        if self.heap.is_token(r) {
            return;
        }
        let ctx = self.ctx_mut();
        if !ctx.is_idle() {
            ctx.proxies.insert(r, root);
        }
    }

    /// Built-in methods of arrays, sets and maps
    fn call_intrinsic(
        &mut self,
        target: ObjRef,
        root: Option<ObjRef>,
        method: &str,
        args: &[Value],
    ) -> Result<Value> {
        let mutating = matches!(method, "push" | "pop" | "add" | "delete" | "clear" | "set");
        if let Some(root) = root {
            if mutating {
                self.check_write(root)?;
                for arg in args {
                    self.heap.stamp_owner(arg, root);
                }
            } else {
                self.track_read(root);
            }
        }

        let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Undefined);
        let obj = self.heap.object_mut(target)?;
        let result = match (&mut obj.kind, method) {
            (Kind::Array(items), "push") => {
                items.extend(args.iter().cloned());
                Value::Number(items.len() as f64)
            }
            (Kind::Array(items), "pop") => items.pop().unwrap_or(Value::Undefined),
            (Kind::Set { items, .. }, "add") => {
                let item = arg(0);
                if !items.iter().any(|i| i.same_value_zero(&item)) {
                    items.push(item);
                }
                Value::Object(target)
            }
            (Kind::Set { items, .. }, "delete") => {
                let item = arg(0);
                let found = items.iter().position(|i| i.same_value_zero(&item));
                Value::Bool(found.map(|index| items.remove(index)).is_some())
            }
            (Kind::Set { items, .. }, "has") => {
                let item = arg(0);
                Value::Bool(items.iter().any(|i| i.same_value_zero(&item)))
            }
            (Kind::Set { items, .. }, "clear") => {
                items.clear();
                Value::Undefined
            }
            (Kind::Map { entries, .. }, "set") => {
                let (key, value) = (arg(0), arg(1));
                match entries.iter_mut().find(|(k, _)| k.same_value_zero(&key)) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key, value)),
                }
                Value::Object(target)
            }
            (Kind::Map { entries, .. }, "get") => {
                let key = arg(0);
                entries
                    .iter()
                    .find(|(k, _)| k.same_value_zero(&key))
                    .map(|(_, v)| v.clone())
                    .unwrap_or(Value::Undefined)
            }
            (Kind::Map { entries, .. }, "delete") => {
                let key = arg(0);
                let found = entries.iter().position(|(k, _)| k.same_value_zero(&key));
                Value::Bool(found.map(|index| entries.remove(index)).is_some())
            }
            (Kind::Map { entries, .. }, "has") => {
                let key = arg(0);
                Value::Bool(entries.iter().any(|(k, _)| k.same_value_zero(&key)))
            }
            (Kind::Map { entries, .. }, "clear") => {
                entries.clear();
                Value::Undefined
            }
            (kind, _) => {
                return Err(JigError::UnknownMethod(format!("{}.{}", kind.name(), method)));
            }
        };

        if let Some(root) = root {
            self.track_proxy(&result, root);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassDef;
    use crate::config::RuntimeConfig;
    use crate::ledger::MemoryLedger;

    fn runtime() -> Runtime {
        Runtime::new(RuntimeConfig::default(), MemoryLedger::from_config(&RuntimeConfig::default())).unwrap()
    }

    fn bag() -> ClassDef {
        ClassDef::new("Bag")
            .method(INIT, |cx, _| {
                let items = cx.array(vec![]);
                cx.set_own("items", items)?;
                let tags = cx.set_of(vec![]);
                cx.set_own("tags", tags)?;
                cx.set_own("_secret", 7.0)?;
                Ok(Value::Undefined)
            })
            .method("put", |cx, args| {
                let items = cx.get_own("items")?.as_object().ok_or("items missing")?;
                cx.call(items, "push", args)?;
                let tags = cx.get_own("tags")?.as_object().ok_or("tags missing")?;
                cx.call(tags, "add", args)
            })
    }

    #[test]
    fn test_outside_writes_are_rejected() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        let err = rt.on_set(b, "x", Value::from(1.0)).unwrap_err();
        assert!(matches!(err, JigError::IllegalMutation(_)));
        let err = rt.on_delete(b, "items").unwrap_err();
        assert!(matches!(err, JigError::IllegalMutation(_)));

        // Internal objects are guarded like their owner
        let items = rt.on_get(b, "items").unwrap().as_object().unwrap();
        let err = rt.on_call(items, "push", &[Value::from(1.0)]).unwrap_err();
        assert!(matches!(err, JigError::IllegalMutation(_)));
        let err = rt.on_set(items, "0", Value::from(1.0)).unwrap_err();
        assert!(matches!(err, JigError::IllegalMutation(_)));
    }

    #[test]
    fn test_unenforced_writes_are_scoped() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        rt.unenforced(|rt| rt.on_set(b, "x", Value::from(1.0))).unwrap();
        assert_eq!(rt.on_get(b, "x").unwrap(), Value::from(1.0));
        assert!(rt.ctx().enforce);

        let err = rt.on_set(b, "x", Value::from(2.0)).unwrap_err();
        assert!(matches!(err, JigError::IllegalMutation(_)));
    }

    #[test]
    fn test_bindings_are_immutable() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        for key in ["origin", "location", "put"] {
            let err = rt.on_set(b, key, Value::Null).unwrap_err();
            assert!(matches!(err, JigError::ImmutableBinding(_)), "{}", key);
            let err = rt.on_delete(b, key).unwrap_err();
            assert!(matches!(err, JigError::ImmutableBinding(_)), "{}", key);
        }
        assert_eq!(rt.on_get(b, "put").unwrap(), Value::Undefined);
        assert!(rt.on_has(b, "put").unwrap());
    }

    #[test]
    fn test_pending_bindings_require_sync() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        let err = rt.on_get(b, "location").unwrap_err();
        assert!(matches!(err, JigError::SyncRequired(_)));
        assert!(rt.on_has(b, "origin").unwrap());

        rt.sync(b).unwrap();
        let location = rt.on_get(b, "location").unwrap();
        assert_eq!(location, Value::from(rt.location(b).unwrap().as_str()));
        assert_eq!(rt.on_get(b, "origin").unwrap(), location);
    }

    #[test]
    fn test_intrinsics_inside_methods() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        rt.on_call(b, "put", &[Value::from("a")]).unwrap();
        rt.on_call(b, "put", &[Value::from("a")]).unwrap();

        let items = rt.on_get(b, "items").unwrap().as_object().unwrap();
        assert_eq!(rt.on_get(items, "length").unwrap(), Value::from(2.0));
        let tags = rt.on_get(b, "tags").unwrap().as_object().unwrap();
        assert_eq!(rt.on_get(tags, "size").unwrap(), Value::from(1.0));
        assert_eq!(rt.on_call(tags, "has", &[Value::from("a")]).unwrap(), Value::Bool(true));
        assert!(matches!(
            rt.on_call(tags, "sort", &[]),
            Err(JigError::UnknownMethod(ref m)) if m == "Set.sort"
        ));
    }

    #[test]
    fn test_map_intrinsics_on_free_objects() {
        let mut rt = runtime();
        let map = rt.map_of(vec![]).as_object().unwrap();
        rt.on_call(map, "set", &[Value::from("k"), Value::from(1.0)]).unwrap();
        rt.on_call(map, "set", &[Value::from("k"), Value::from(2.0)]).unwrap();
        assert_eq!(rt.on_call(map, "get", &[Value::from("k")]).unwrap(), Value::from(2.0));
        assert_eq!(rt.on_call(map, "delete", &[Value::from("k")]).unwrap(), Value::Bool(true));
        assert_eq!(rt.on_call(map, "has", &[Value::from("k")]).unwrap(), Value::Bool(false));
    }

    #[test]
    fn test_enumeration_hides_private_keys_from_strangers() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();

        // Outside any method nothing is hidden
        let keys = rt.on_enumerate(b).unwrap();
        assert!(keys.contains(&"_secret".to_string()));

        let peek = rt
            .deploy(
                ClassDef::new("Peek")
                    .method(INIT, |_, _| Ok(Value::Undefined))
                    .method("keys", |cx, args| {
                        let other = args[0].as_object().ok_or("not an object")?;
                        let keys = cx.keys(other)?;
                        let values = keys.into_iter().map(Value::from).collect::<Vec<_>>();
                        Ok(cx.array(values))
                    }),
            )
            .unwrap();
        let p = rt.construct(peek, &[]).unwrap();
        let seen = rt.on_call(p, "keys", &[Value::Object(b)]).unwrap();
        let seen = rt.heap().get(seen.as_object().unwrap()).unwrap().kind.clone();
        assert_eq!(
            seen,
            Kind::Array(vec![
                Value::from("items"),
                Value::from("owner"),
                Value::from("satoshis"),
                Value::from("tags"),
            ])
        );
    }

    #[test]
    fn test_invalid_objects_fail_fast() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();
        let items = rt.on_get(b, "items").unwrap().as_object().unwrap();

        rt.heap.token_mut(b).unwrap().location = jigs_core::Location::error("boom");
        assert!(matches!(rt.on_get(b, "items"), Err(JigError::InvalidObject(ref m)) if m == "boom"));
        assert!(matches!(rt.on_get(items, "length"), Err(JigError::InvalidObject(_))));
        assert!(matches!(rt.on_call(b, "put", &[]), Err(JigError::InvalidObject(_))));
    }

    #[test]
    fn test_init_cannot_be_called_again() {
        let mut rt = runtime();
        let class = rt.deploy(bag()).unwrap();
        let b = rt.construct(class, &[]).unwrap();
        assert!(matches!(rt.on_call(b, INIT, &[]), Err(JigError::InitCalledTwice(_))));
        assert!(matches!(rt.on_call(b, "nope", &[]), Err(JigError::UnknownMethod(ref m)) if m == "Bag.nope"));
    }
}
