use crate::error::{JigError, Result};
use crate::id::{Location, ObjRef};
use std::collections::{BTreeMap, HashSet};

/// A value reachable from a jig's state
///
/// Scalars are held inline; every non-scalar value lives in the [`Heap`] and is referenced
/// through its arena handle.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// The absent value
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    /// Unique symbolic value; never encodable
    Symbol(String),
    Object(ObjRef),
}

impl Value {
    pub fn as_object(&self) -> Option<ObjRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Equality used for set membership and map keys: objects by identity, NaN equals
    /// itself and both zeros are the same key.
    pub fn same_value_zero(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Number(a), Value::Number(b)) => (a.is_nan() && b.is_nan()) || a == b,
            _ => self == other,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Value::Object(r)
    }
}

/// Defines which lifecycle a token follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    /// Mutable, ledger-tracked instance
    Jig,
    /// Immutable instance plucked from an external path
    Berry,
    /// Deployable class
    Code,
}

/// Property-owning object: a jig, a berry, or a deployed class
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// The code token of the instance's class (`None` for code tokens)
    pub class: Option<ObjRef>,
    pub origin: Location,
    pub location: Location,
    /// User fields, including the `owner` and `satoshis` bindings
    pub fields: BTreeMap<String, Value>,
    /// Whether `init` has completed
    pub initialized: bool,
}

impl Token {
    pub fn new(kind: TokenKind, class: Option<ObjRef>) -> Self {
        Self {
            kind,
            class,
            origin: Location::pending(),
            location: Location::pending(),
            fields: BTreeMap::new(),
            initialized: false,
        }
    }

    pub fn is_jig(&self) -> bool {
        self.kind == TokenKind::Jig
    }

    pub fn is_berry(&self) -> bool {
        self.kind == TokenKind::Berry
    }

    pub fn is_code(&self) -> bool {
        self.kind == TokenKind::Code
    }
}

/// Shape of one heap object
#[derive(Debug, Clone, PartialEq)]
pub enum Kind {
    /// Plain record with string keys
    Record(BTreeMap<String, Value>),
    /// Ordered sequence
    Array(Vec<Value>),
    /// Byte buffer
    Bytes(Vec<u8>),
    /// Unique-key set with caller-attached metadata fields
    Set {
        items: Vec<Value>,
        props: BTreeMap<String, Value>,
    },
    /// Key-value map with caller-attached metadata fields
    Map {
        entries: Vec<(Value, Value)>,
        props: BTreeMap<String, Value>,
    },
    Token(Token),
}

impl Kind {
    /// Short name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Kind::Record(_) => "Object",
            Kind::Array(_) => "Array",
            Kind::Bytes(_) => "Uint8Array",
            Kind::Set { .. } => "Set",
            Kind::Map { .. } => "Map",
            Kind::Token(t) => match t.kind {
                TokenKind::Jig => "Jig",
                TokenKind::Berry => "Berry",
                TokenKind::Code => "Code",
            },
        }
    }

    /// An empty object of the same shape
    pub fn empty_like(&self) -> Kind {
        match self {
            Kind::Record(_) => Kind::Record(BTreeMap::new()),
            Kind::Array(_) => Kind::Array(Vec::new()),
            Kind::Bytes(_) => Kind::Bytes(Vec::new()),
            Kind::Set { .. } => Kind::Set {
                items: Vec::new(),
                props: BTreeMap::new(),
            },
            Kind::Map { .. } => Kind::Map {
                entries: Vec::new(),
                props: BTreeMap::new(),
            },
            Kind::Token(t) => Kind::Token(Token::new(t.kind, t.class)),
        }
    }
}

/// One arena slot
#[derive(Debug, Clone, PartialEq)]
pub struct HeapObject {
    pub kind: Kind,
    /// The jig this internal object belongs to, stamped when it is stored into jig state
    pub owner: Option<ObjRef>,
    /// Name of a user subclass of a built-in container, if any
    pub extends: Option<String>,
}

/// Longest array a jig may hold; arrays are stored densely
pub const MAX_ARRAY_LENGTH: usize = 1 << 24;

/// Arena holding every non-scalar value
///
/// Objects live as long as the heap. Nothing is collected: rollbacks and restores allocate fresh
/// copies, so a long-lived runtime grows with the number of objects it has ever decoded.
#[derive(Debug, Default, Clone)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Allocate a new object and return its handle
    pub fn alloc(&mut self, kind: Kind) -> ObjRef {
        self.objects.push(HeapObject {
            kind,
            owner: None,
            extends: None,
        });
        ObjRef::new((self.objects.len() - 1) as u32)
    }

    /// Release `r` if it is the most recently allocated object; returns whether it was released
    ///
    /// Only for scratch objects no other value can reference yet.
    pub fn discard(&mut self, r: ObjRef) -> bool {
        if r.index() + 1 != self.objects.len() {
            return false;
        }
        self.objects.pop();
        true
    }

    /// Allocate an instance of a user subclass of a built-in container
    pub fn alloc_extended(&mut self, kind: Kind, class_name: impl Into<String>) -> ObjRef {
        let r = self.alloc(kind);
        self.objects[r.index()].extends = Some(class_name.into());
        r
    }

    pub fn record<K: Into<String>>(&mut self, fields: impl IntoIterator<Item = (K, Value)>) -> Value {
        let map = fields.into_iter().map(|(k, v)| (k.into(), v)).collect();
        Value::Object(self.alloc(Kind::Record(map)))
    }

    pub fn array(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        Value::Object(self.alloc(Kind::Array(items.into_iter().collect())))
    }

    pub fn bytes(&mut self, bytes: impl Into<Vec<u8>>) -> Value {
        Value::Object(self.alloc(Kind::Bytes(bytes.into())))
    }

    /// Allocate a set, dropping duplicate members
    pub fn set(&mut self, items: impl IntoIterator<Item = Value>) -> Value {
        let mut unique: Vec<Value> = Vec::new();
        for item in items {
            if !unique.iter().any(|u| u.same_value_zero(&item)) {
                unique.push(item);
            }
        }
        Value::Object(self.alloc(Kind::Set {
            items: unique,
            props: BTreeMap::new(),
        }))
    }

    /// Allocate a map; later entries replace earlier ones with the same key
    pub fn map(&mut self, entries: impl IntoIterator<Item = (Value, Value)>) -> Value {
        let mut unique: Vec<(Value, Value)> = Vec::new();
        for (k, v) in entries {
            match unique.iter_mut().find(|(uk, _)| uk.same_value_zero(&k)) {
                Some(slot) => slot.1 = v,
                None => unique.push((k, v)),
            }
        }
        Value::Object(self.alloc(Kind::Map {
            entries: unique,
            props: BTreeMap::new(),
        }))
    }

    pub fn get(&self, r: ObjRef) -> Option<&HeapObject> {
        self.objects.get(r.index())
    }

    pub fn get_mut(&mut self, r: ObjRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(r.index())
    }

    /// Look up an object that must exist
    pub fn object(&self, r: ObjRef) -> Result<&HeapObject> {
        self.get(r)
            .ok_or_else(|| JigError::InvalidObject(format!("dangling reference {}", r)))
    }

    pub fn object_mut(&mut self, r: ObjRef) -> Result<&mut HeapObject> {
        self.get_mut(r)
            .ok_or_else(|| JigError::InvalidObject(format!("dangling reference {}", r)))
    }

    pub fn token(&self, r: ObjRef) -> Option<&Token> {
        match self.get(r).map(|o| &o.kind) {
            Some(Kind::Token(t)) => Some(t),
            _ => None,
        }
    }

    pub fn token_mut(&mut self, r: ObjRef) -> Option<&mut Token> {
        match self.get_mut(r).map(|o| &mut o.kind) {
            Some(Kind::Token(t)) => Some(t),
            _ => None,
        }
    }

    pub fn is_token(&self, r: ObjRef) -> bool {
        self.token(r).is_some()
    }

    /// The token whose state an object belongs to: itself for tokens, its owner otherwise
    pub fn root_of(&self, r: ObjRef) -> Option<ObjRef> {
        match self.get(r) {
            Some(HeapObject {
                kind: Kind::Token(_),
                ..
            }) => Some(r),
            Some(obj) => obj.owner,
            None => None,
        }
    }

    /// Read an own property without any capability checks
    pub fn get_property(&self, r: ObjRef, key: &str) -> Result<Value> {
        let obj = self.object(r)?;
        let value = match &obj.kind {
            Kind::Record(fields) => fields.get(key).cloned(),
            Kind::Token(t) => t.fields.get(key).cloned(),
            Kind::Set { items, props } => match key {
                "size" => Some(Value::Number(items.len() as f64)),
                _ => props.get(key).cloned(),
            },
            Kind::Map { entries, props } => match key {
                "size" => Some(Value::Number(entries.len() as f64)),
                _ => props.get(key).cloned(),
            },
            Kind::Array(items) => match key {
                "length" => Some(Value::Number(items.len() as f64)),
                _ => key.parse::<usize>().ok().and_then(|i| items.get(i).cloned()),
            },
            Kind::Bytes(bytes) => match key {
                "length" => Some(Value::Number(bytes.len() as f64)),
                _ => key
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| bytes.get(i))
                    .map(|b| Value::Number(*b as f64)),
            },
        };
        Ok(value.unwrap_or(Value::Undefined))
    }

    /// Whether an own property exists, without capability checks
    pub fn has_property(&self, r: ObjRef, key: &str) -> Result<bool> {
        let obj = self.object(r)?;
        Ok(match &obj.kind {
            Kind::Record(fields) => fields.contains_key(key),
            Kind::Token(t) => t.fields.contains_key(key),
            Kind::Set { props, .. } | Kind::Map { props, .. } => props.contains_key(key),
            Kind::Array(items) => {
                key == "length" || key.parse::<usize>().map(|i| i < items.len()).unwrap_or(false)
            }
            Kind::Bytes(bytes) => {
                key == "length" || key.parse::<usize>().map(|i| i < bytes.len()).unwrap_or(false)
            }
        })
    }

    /// Write an own property without capability checks
    pub fn set_property(&mut self, r: ObjRef, key: &str, value: Value) -> Result<()> {
        let obj = self.object_mut(r)?;
        match &mut obj.kind {
            Kind::Record(fields) => {
                fields.insert(key.to_string(), value);
            }
            Kind::Token(t) => {
                t.fields.insert(key.to_string(), value);
            }
            Kind::Set { props, .. } | Kind::Map { props, .. } => {
                props.insert(key.to_string(), value);
            }
            Kind::Array(items) => {
                if key == "length" {
                    let len = array_length(&value)?;
                    items.resize(len, Value::Undefined);
                } else {
                    let len = key
                        .parse::<usize>()
                        .ok()
                        .and_then(|index| index.checked_add(1))
                        .filter(|len| *len <= MAX_ARRAY_LENGTH)
                        .ok_or_else(|| JigError::user(format!("Invalid array index {}", key)))?;
                    if len > items.len() {
                        items.resize(len, Value::Undefined);
                    }
                    items[len - 1] = value;
                }
            }
            Kind::Bytes(bytes) => {
                let index = key
                    .parse::<usize>()
                    .ok()
                    .filter(|i| *i < bytes.len())
                    .ok_or_else(|| JigError::user(format!("Invalid byte index {}", key)))?;
                let byte = value
                    .as_number()
                    .filter(|n| n.fract() == 0.0 && (0.0..=255.0).contains(n))
                    .ok_or_else(|| JigError::user("Bytes must be integers between 0 and 255"))?;
                bytes[index] = byte as u8;
            }
        }
        Ok(())
    }

    /// Delete an own property without capability checks; returns whether it existed
    pub fn delete_property(&mut self, r: ObjRef, key: &str) -> Result<bool> {
        let obj = self.object_mut(r)?;
        Ok(match &mut obj.kind {
            Kind::Record(fields) => fields.remove(key).is_some(),
            Kind::Token(t) => t.fields.remove(key).is_some(),
            Kind::Set { props, .. } | Kind::Map { props, .. } => props.remove(key).is_some(),
            Kind::Array(items) => match key.parse::<usize>() {
                Ok(i) if i < items.len() => {
                    items[i] = Value::Undefined;
                    true
                }
                _ => false,
            },
            Kind::Bytes(_) => {
                return Err(JigError::user("Cannot delete from a byte buffer"));
            }
        })
    }

    /// Own enumerable property names in canonical order
    pub fn own_keys(&self, r: ObjRef) -> Result<Vec<String>> {
        let obj = self.object(r)?;
        Ok(match &obj.kind {
            Kind::Record(fields) => fields.keys().cloned().collect(),
            Kind::Token(t) => t.fields.keys().cloned().collect(),
            Kind::Set { props, .. } | Kind::Map { props, .. } => props.keys().cloned().collect(),
            Kind::Array(items) => (0..items.len()).map(|i| i.to_string()).collect(),
            Kind::Bytes(bytes) => (0..bytes.len()).map(|i| i.to_string()).collect(),
        })
    }

    /// Stamp every unowned internal object reachable from `value` as owned by `owner`
    ///
    /// Tokens are never stamped and never traversed. Objects owned by someone else are left
    /// alone; serialization rejects them later.
    pub fn stamp_owner(&mut self, value: &Value, owner: ObjRef) {
        let mut pending = vec![value.clone()];
        let mut seen = HashSet::new();
        while let Some(next) = pending.pop() {
            let Value::Object(r) = next else { continue };
            if !seen.insert(r) {
                continue;
            }
            let Some(obj) = self.get_mut(r) else { continue };
            if matches!(obj.kind, Kind::Token(_)) || obj.owner.is_some_and(|o| o != owner) {
                continue;
            }
            obj.owner = Some(owner);
            pending.extend(children(&obj.kind));
        }
    }

    /// Structural equality: tokens by identity, everything else by shape and contents
    ///
    /// NaN equals NaN and negative zero differs from zero, so a value compares equal to its
    /// own encode/decode round trip.
    pub fn deep_equal(&self, a: &Value, b: &Value) -> bool {
        let mut assumed = HashSet::new();
        self.deep_equal_inner(a, b, &mut assumed)
    }

    fn deep_equal_inner(&self, a: &Value, b: &Value, assumed: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                (x.is_nan() && y.is_nan()) || (x == y && x.is_sign_negative() == y.is_sign_negative())
            }
            (Value::Object(x), Value::Object(y)) => {
                if x == y {
                    return true;
                }
                if !assumed.insert((*x, *y)) {
                    return true;
                }
                let (Some(ox), Some(oy)) = (self.get(*x), self.get(*y)) else {
                    return false;
                };
                if ox.extends != oy.extends {
                    return false;
                }
                match (&ox.kind, &oy.kind) {
                    (Kind::Record(fx), Kind::Record(fy)) => self.fields_equal(fx, fy, assumed),
                    (Kind::Array(ix), Kind::Array(iy)) => self.items_equal(ix, iy, assumed),
                    (Kind::Bytes(bx), Kind::Bytes(by)) => bx == by,
                    (
                        Kind::Set { items: ix, props: px },
                        Kind::Set { items: iy, props: py },
                    ) => self.items_equal(ix, iy, assumed) && self.fields_equal(px, py, assumed),
                    (
                        Kind::Map { entries: ex, props: px },
                        Kind::Map { entries: ey, props: py },
                    ) => {
                        ex.len() == ey.len()
                            && ex.iter().zip(ey).all(|((kx, vx), (ky, vy))| {
                                self.deep_equal_inner(kx, ky, assumed)
                                    && self.deep_equal_inner(vx, vy, assumed)
                            })
                            && self.fields_equal(px, py, assumed)
                    }
                    // Tokens compare by identity only
                    _ => false,
                }
            }
            _ => a == b,
        }
    }

    fn items_equal(&self, x: &[Value], y: &[Value], assumed: &mut HashSet<(ObjRef, ObjRef)>) -> bool {
        x.len() == y.len() && x.iter().zip(y).all(|(a, b)| self.deep_equal_inner(a, b, assumed))
    }

    fn fields_equal(
        &self,
        x: &BTreeMap<String, Value>,
        y: &BTreeMap<String, Value>,
        assumed: &mut HashSet<(ObjRef, ObjRef)>,
    ) -> bool {
        x.len() == y.len()
            && x.iter()
                .zip(y)
                .all(|((kx, vx), (ky, vy))| kx == ky && self.deep_equal_inner(vx, vy, assumed))
    }

    /// Human-readable name of a value for error messages
    pub fn describe(&self, value: &Value) -> String {
        match value {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => format!("{:?}", s),
            Value::Symbol(s) => format!("Symbol({})", s),
            Value::Object(r) => match self.get(*r) {
                Some(obj) => match &obj.extends {
                    Some(class) => format!("{} (extends {})", class, obj.kind.name()),
                    None => format!("[{} {}]", obj.kind.name(), r),
                },
                None => format!("[dangling {}]", r),
            },
        }
    }
}

/// The values directly referenced by one object, tokens included
pub fn children(kind: &Kind) -> Vec<Value> {
    match kind {
        Kind::Record(fields) => fields.values().cloned().collect(),
        Kind::Array(items) => items.clone(),
        Kind::Bytes(_) => Vec::new(),
        Kind::Set { items, props } => items.iter().chain(props.values()).cloned().collect(),
        Kind::Map { entries, props } => entries
            .iter()
            .flat_map(|(k, v)| [k.clone(), v.clone()])
            .chain(props.values().cloned())
            .collect(),
        Kind::Token(t) => t.fields.values().cloned().collect(),
    }
}

fn array_length(value: &Value) -> Result<usize> {
    value
        .as_number()
        .filter(|n| n.fract() == 0.0 && *n >= 0.0 && *n <= MAX_ARRAY_LENGTH as f64)
        .map(|n| n as usize)
        .ok_or_else(|| JigError::user("Invalid array length"))
}
