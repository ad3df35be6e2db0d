//! Serialization engine
//!
//! Converts an object graph held in the [`Heap`] into a canonical JSON wire node and back.
//!
//! Wire format:
//! - `null`, booleans, strings and finite numbers are native JSON
//! - `{"$und":1}` for undefined, `{"$n":"-0" | "NaN" | "Infinity" | "-Infinity"}` for the
//!   numbers JSON cannot carry
//! - records are JSON objects with sorted keys; a record holding a `$`-prefixed key is wrapped
//!   as `{"$obj":{...}}`
//! - `{"$ub8":"<hex>"}` for byte buffers
//! - `{"$set":[...],"props":{...}}` and `{"$map":[[k,v],...],"props":{...}}`, `props` omitted
//!   when empty
//! - `{"$jig":"<ref>"}` for every token, the reference coming from the injected saver
//! - objects reachable more than once are hoisted: `{"$top":<node>,"dups":[...]}` with every
//!   occurrence replaced by `{"$dup":<index>}`

use crate::error::{JigError, Result};
use crate::id::ObjRef;
use crate::objects::{children, Heap, Kind, Value};
use serde_json::{json, Map, Number, Value as Node};
use std::collections::{BTreeMap, HashMap, HashSet};

const TAG_UNDEFINED: &str = "$und";
const TAG_NUMBER: &str = "$n";
const TAG_OBJECT: &str = "$obj";
const TAG_BYTES: &str = "$ub8";
const TAG_SET: &str = "$set";
const TAG_MAP: &str = "$map";
const TAG_TOKEN: &str = "$jig";
const TAG_DUP: &str = "$dup";
const TAG_TOP: &str = "$top";
const KEY_DUPS: &str = "dups";
const KEY_PROPS: &str = "props";

/// Largest integer carried as a JSON integer
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Produces the opaque reference written in place of a token
pub trait TokenSaver {
    fn save(&mut self, heap: &Heap, token: ObjRef) -> Result<String>;
}

impl<F> TokenSaver for F
where
    F: FnMut(&Heap, ObjRef) -> Result<String>,
{
    fn save(&mut self, heap: &Heap, token: ObjRef) -> Result<String> {
        self(heap, token)
    }
}

/// Resolves a token reference read from the wire
pub trait TokenLoader {
    fn load(&mut self, heap: &mut Heap, reference: &str) -> Result<ObjRef>;
}

impl<F> TokenLoader for F
where
    F: FnMut(&mut Heap, &str) -> Result<ObjRef>,
{
    fn load(&mut self, heap: &mut Heap, reference: &str) -> Result<ObjRef> {
        self(heap, reference)
    }
}

/// Options for one encoding session
#[derive(Default)]
pub struct EncodeOptions<'a> {
    /// Token saver, required as soon as a token is reached
    pub saver: Option<&'a mut dyn TokenSaver>,
    /// Only internal objects owned by this jig (or unowned) may be encoded
    pub owner: Option<ObjRef>,
}

/// Options for one decoding session
#[derive(Default)]
pub struct DecodeOptions<'a> {
    /// Token loader, required as soon as a token reference is read
    pub loader: Option<&'a mut dyn TokenLoader>,
    /// Stamp every decoded internal object as owned by this jig
    pub owner: Option<ObjRef>,
}

/// Encode `value` into its canonical wire node
pub fn encode(heap: &Heap, value: &Value, options: EncodeOptions<'_>) -> Result<Node> {
    let mut encoder = Encoder {
        heap,
        saver: options.saver,
        owner: options.owner,
        shared: find_shared(heap, [value.clone()]),
        dup_index: HashMap::new(),
        dups: Vec::new(),
    };
    let top = encoder.encode_value(value)?;
    Ok(encoder.finish(top))
}

/// Encode a field set as a record node without it living in the heap
///
/// Used to snapshot a token's own fields: the token itself is never inlined, so its fields are
/// encoded as if they were a fresh record.
pub fn encode_fields(
    heap: &Heap,
    fields: &BTreeMap<String, Value>,
    options: EncodeOptions<'_>,
) -> Result<Node> {
    let mut encoder = Encoder {
        heap,
        saver: options.saver,
        owner: options.owner,
        shared: find_shared(heap, fields.values().cloned()),
        dup_index: HashMap::new(),
        dups: Vec::new(),
    };
    let top = encoder.encode_record(fields)?;
    Ok(encoder.finish(top))
}

/// Decode a wire node back into the heap
pub fn decode(heap: &mut Heap, node: &Node, options: DecodeOptions<'_>) -> Result<Value> {
    let stamp = options.owner;
    let mut decoder = Decoder {
        heap,
        loader: options.loader,
        dups: Vec::new(),
    };
    let value = decoder.decode_root(node)?;
    if let Some(owner) = stamp {
        decoder.heap.stamp_owner(&value, owner);
    }
    Ok(value)
}

/// Deep-copy a value graph; tokens are kept by identity
pub fn clone_value(heap: &mut Heap, value: &Value) -> Result<Value> {
    let mut refs: Vec<ObjRef> = Vec::new();
    let node = {
        let mut saver = |_: &Heap, token: ObjRef| -> Result<String> {
            refs.push(token);
            Ok((refs.len() - 1).to_string())
        };
        encode(
            heap,
            value,
            EncodeOptions {
                saver: Some(&mut saver),
                owner: None,
            },
        )?
    };
    let mut loader = |_: &mut Heap, reference: &str| -> Result<ObjRef> { index_ref(&refs, reference) };
    decode(
        heap,
        &node,
        DecodeOptions {
            loader: Some(&mut loader),
            owner: None,
        },
    )
}

/// Resolve an index-style token reference against a captured list
pub fn index_ref(refs: &[ObjRef], reference: &str) -> Result<ObjRef> {
    reference
        .parse::<usize>()
        .ok()
        .and_then(|i| refs.get(i).copied())
        .ok_or_else(|| JigError::Decode(format!("unknown token reference {}", reference)))
}

/// Rewrite every token reference of an encoded node in place
pub fn rewrite_tokens(node: &mut Node, rewrite: &mut dyn FnMut(&str) -> Result<String>) -> Result<()> {
    match node {
        Node::Array(items) => {
            for item in items {
                rewrite_tokens(item, rewrite)?;
            }
        }
        Node::Object(map) => {
            if map.len() == 1 {
                if let Some(Node::String(reference)) = map.get_mut(TAG_TOKEN) {
                    *reference = rewrite(reference)?;
                    return Ok(());
                }
                // Keys inside an escaped record are user keys, not tags
                if let Some(Node::Object(fields)) = map.get_mut(TAG_OBJECT) {
                    for value in fields.values_mut() {
                        rewrite_tokens(value, rewrite)?;
                    }
                    return Ok(());
                }
            }
            for value in map.values_mut() {
                rewrite_tokens(value, rewrite)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Objects reachable more than once from the roots, tokens excluded
fn find_shared(heap: &Heap, roots: impl IntoIterator<Item = Value>) -> HashSet<ObjRef> {
    let mut seen = HashSet::new();
    let mut shared = HashSet::new();
    let mut pending: Vec<Value> = roots.into_iter().collect();
    while let Some(next) = pending.pop() {
        let Value::Object(r) = next else { continue };
        let Some(obj) = heap.get(r) else { continue };
        if matches!(obj.kind, Kind::Token(_)) {
            continue;
        }
        if !seen.insert(r) {
            shared.insert(r);
            continue;
        }
        pending.extend(children(&obj.kind));
    }
    shared
}

struct Encoder<'h, 'a> {
    heap: &'h Heap,
    saver: Option<&'a mut dyn TokenSaver>,
    owner: Option<ObjRef>,
    shared: HashSet<ObjRef>,
    dup_index: HashMap<ObjRef, usize>,
    dups: Vec<Node>,
}

impl Encoder<'_, '_> {
    fn finish(self, top: Node) -> Node {
        if self.dups.is_empty() {
            return top;
        }
        let mut wrapper = Map::new();
        wrapper.insert(TAG_TOP.to_string(), top);
        wrapper.insert(KEY_DUPS.to_string(), Node::Array(self.dups));
        Node::Object(wrapper)
    }

    fn encode_value(&mut self, value: &Value) -> Result<Node> {
        match value {
            Value::Undefined => Ok(json!({ TAG_UNDEFINED: 1 })),
            Value::Null => Ok(Node::Null),
            Value::Bool(b) => Ok(Node::Bool(*b)),
            Value::String(s) => Ok(Node::String(s.clone())),
            Value::Number(n) => Ok(encode_number(*n)),
            Value::Symbol(_) => Err(JigError::Encode(self.heap.describe(value))),
            Value::Object(r) => self.encode_object(*r),
        }
    }

    fn encode_object(&mut self, r: ObjRef) -> Result<Node> {
        let heap = self.heap;
        let obj = heap.object(r)?;

        if let Kind::Token(_) = obj.kind {
            let saver = self.saver.as_deref_mut().ok_or_else(|| {
                JigError::Encode(format!("{} without a token saver", heap.describe(&Value::Object(r))))
            })?;
            let reference = saver.save(heap, r)?;
            return Ok(json!({ TAG_TOKEN: reference }));
        }

        if obj.extends.is_some() {
            return Err(JigError::Encode(self.heap.describe(&Value::Object(r))));
        }

        if let (Some(restrict), Some(owner)) = (self.owner, obj.owner) {
            if restrict != owner {
                return Err(JigError::CrossOwnership(format!(
                    "{} belongs to {}, not {}",
                    self.heap.describe(&Value::Object(r)),
                    owner,
                    restrict
                )));
            }
        }

        if !self.shared.contains(&r) {
            return self.encode_body(&obj.kind);
        }

        if let Some(index) = self.dup_index.get(&r) {
            return Ok(json!({ TAG_DUP: index }));
        }
        // Reserve the slot before descending so cycles resolve to it
        let index = self.dups.len();
        self.dup_index.insert(r, index);
        self.dups.push(Node::Null);
        let body = self.encode_body(&obj.kind)?;
        self.dups[index] = body;
        Ok(json!({ TAG_DUP: index }))
    }

    fn encode_body(&mut self, kind: &Kind) -> Result<Node> {
        match kind {
            Kind::Record(fields) => self.encode_record(fields),
            Kind::Array(items) => Ok(Node::Array(
                items.iter().map(|v| self.encode_value(v)).collect::<Result<_>>()?,
            )),
            Kind::Bytes(bytes) => Ok(json!({ TAG_BYTES: hex::encode(bytes) })),
            Kind::Set { items, props } => {
                let items: Vec<Node> = items.iter().map(|v| self.encode_value(v)).collect::<Result<_>>()?;
                let mut node = Map::new();
                node.insert(TAG_SET.to_string(), Node::Array(items));
                if !props.is_empty() {
                    node.insert(KEY_PROPS.to_string(), self.encode_record(props)?);
                }
                Ok(Node::Object(node))
            }
            Kind::Map { entries, props } => {
                let mut pairs = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    pairs.push(Node::Array(vec![self.encode_value(k)?, self.encode_value(v)?]));
                }
                let mut node = Map::new();
                node.insert(TAG_MAP.to_string(), Node::Array(pairs));
                if !props.is_empty() {
                    node.insert(KEY_PROPS.to_string(), self.encode_record(props)?);
                }
                Ok(Node::Object(node))
            }
            Kind::Token(_) => Err(JigError::Encode("token body".to_string())),
        }
    }

    fn encode_record(&mut self, fields: &BTreeMap<String, Value>) -> Result<Node> {
        let mut map = Map::new();
        for (key, value) in fields {
            map.insert(key.clone(), self.encode_value(value)?);
        }
        if fields.keys().any(|k| k.starts_with('$')) {
            Ok(json!({ TAG_OBJECT: Node::Object(map) }))
        } else {
            Ok(Node::Object(map))
        }
    }
}

fn encode_number(n: f64) -> Node {
    if n.is_nan() {
        json!({ TAG_NUMBER: "NaN" })
    } else if n.is_infinite() {
        let text = if n > 0.0 { "Infinity" } else { "-Infinity" };
        json!({ TAG_NUMBER: text })
    } else if n == 0.0 && n.is_sign_negative() {
        json!({ TAG_NUMBER: "-0" })
    } else if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
        Node::Number(Number::from(n as i64))
    } else {
        // Finite, so from_f64 cannot fail
        Number::from_f64(n).map(Node::Number).unwrap_or(Node::Null)
    }
}

struct Decoder<'h, 'a> {
    heap: &'h mut Heap,
    loader: Option<&'a mut dyn TokenLoader>,
    dups: Vec<ObjRef>,
}

impl Decoder<'_, '_> {
    fn decode_root(&mut self, node: &Node) -> Result<Value> {
        let Some(map) = node.as_object() else {
            return self.decode_value(node);
        };
        let Some(top) = map.get(TAG_TOP) else {
            return self.decode_value(node);
        };
        if map.len() != 2 {
            return Err(JigError::Decode("unexpected keys next to $top".to_string()));
        }
        let dups = map
            .get(KEY_DUPS)
            .and_then(Node::as_array)
            .ok_or_else(|| JigError::Decode("$top without a dups list".to_string()))?;

        // Allocate every shared object first so back-references resolve in any order
        for dup in dups {
            let shape = shape_of(dup)?;
            let r = self.heap.alloc(shape);
            self.dups.push(r);
        }
        for (index, dup) in dups.iter().enumerate() {
            let kind = self.decode_body(dup)?;
            self.heap.object_mut(self.dups[index])?.kind = kind;
        }
        self.decode_value(top)
    }

    fn decode_value(&mut self, node: &Node) -> Result<Value> {
        match node {
            Node::Null => Ok(Value::Null),
            Node::Bool(b) => Ok(Value::Bool(*b)),
            Node::String(s) => Ok(Value::String(s.clone())),
            Node::Number(n) => n
                .as_f64()
                .map(Value::Number)
                .ok_or_else(|| JigError::Decode(format!("number {}", n))),
            Node::Array(_) => {
                let kind = self.decode_body(node)?;
                Ok(Value::Object(self.heap.alloc(kind)))
            }
            Node::Object(map) => {
                if let Some(value) = self.decode_scalar_tag(map)? {
                    return Ok(value);
                }
                let kind = self.decode_body(node)?;
                Ok(Value::Object(self.heap.alloc(kind)))
            }
        }
    }

    /// Tags that decode to something other than a fresh heap object
    fn decode_scalar_tag(&mut self, map: &Map<String, Node>) -> Result<Option<Value>> {
        if map.len() != 1 {
            return Ok(None);
        }
        let Some((tag, inner)) = map.iter().next() else {
            return Ok(None);
        };
        match tag.as_str() {
            TAG_UNDEFINED => Ok(Some(Value::Undefined)),
            TAG_NUMBER => {
                let n = match inner.as_str() {
                    Some("-0") => -0.0,
                    Some("NaN") => f64::NAN,
                    Some("Infinity") => f64::INFINITY,
                    Some("-Infinity") => f64::NEG_INFINITY,
                    _ => return Err(JigError::Decode(format!("bad number tag {}", inner))),
                };
                Ok(Some(Value::Number(n)))
            }
            TAG_TOKEN => {
                let reference = inner
                    .as_str()
                    .ok_or_else(|| JigError::Decode(format!("bad token reference {}", inner)))?;
                let loader = self.loader.as_deref_mut().ok_or_else(|| {
                    JigError::Decode(format!("token {} without a token loader", reference))
                })?;
                Ok(Some(Value::Object(loader.load(self.heap, reference)?)))
            }
            TAG_DUP => {
                let r = inner
                    .as_u64()
                    .and_then(|i| self.dups.get(i as usize).copied())
                    .ok_or_else(|| JigError::Decode(format!("bad back-reference {}", inner)))?;
                Ok(Some(Value::Object(r)))
            }
            _ => Ok(None),
        }
    }

    fn decode_body(&mut self, node: &Node) -> Result<Kind> {
        match node {
            Node::Array(items) => Ok(Kind::Array(
                items.iter().map(|n| self.decode_value(n)).collect::<Result<_>>()?,
            )),
            Node::Object(map) => {
                if let Some(inner) = map.get(TAG_OBJECT) {
                    if map.len() != 1 {
                        return Err(JigError::Decode("unexpected keys next to $obj".to_string()));
                    }
                    let fields = inner
                        .as_object()
                        .ok_or_else(|| JigError::Decode("$obj must wrap an object".to_string()))?;
                    return Ok(Kind::Record(self.decode_fields(fields)?));
                }
                if let Some(hex_str) = map.get(TAG_BYTES) {
                    let bytes = hex_str
                        .as_str()
                        .and_then(|s| hex::decode(s).ok())
                        .ok_or_else(|| JigError::Decode(format!("bad byte buffer {}", hex_str)))?;
                    return Ok(Kind::Bytes(bytes));
                }
                if let Some(items) = map.get(TAG_SET) {
                    let items = items
                        .as_array()
                        .ok_or_else(|| JigError::Decode("$set must be an array".to_string()))?;
                    let items = items.iter().map(|n| self.decode_value(n)).collect::<Result<_>>()?;
                    let props = self.decode_props(map, TAG_SET)?;
                    return Ok(Kind::Set { items, props });
                }
                if let Some(pairs) = map.get(TAG_MAP) {
                    let pairs = pairs
                        .as_array()
                        .ok_or_else(|| JigError::Decode("$map must be an array".to_string()))?;
                    let mut entries = Vec::with_capacity(pairs.len());
                    for pair in pairs {
                        match pair.as_array().map(Vec::as_slice) {
                            Some([k, v]) => entries.push((self.decode_value(k)?, self.decode_value(v)?)),
                            _ => return Err(JigError::Decode(format!("bad map entry {}", pair))),
                        }
                    }
                    let props = self.decode_props(map, TAG_MAP)?;
                    return Ok(Kind::Map { entries, props });
                }
                if let Some(key) = map.keys().find(|k| k.starts_with('$')) {
                    return Err(JigError::Decode(format!("unknown tag {}", key)));
                }
                Ok(Kind::Record(self.decode_fields(map)?))
            }
            other => Err(JigError::Decode(format!("expected an object, found {}", other))),
        }
    }

    fn decode_fields(&mut self, map: &Map<String, Node>) -> Result<BTreeMap<String, Value>> {
        let mut fields = BTreeMap::new();
        for (key, node) in map {
            fields.insert(key.clone(), self.decode_value(node)?);
        }
        Ok(fields)
    }

    fn decode_props(&mut self, map: &Map<String, Node>, tag: &str) -> Result<BTreeMap<String, Value>> {
        if map.keys().any(|k| k != tag && k != KEY_PROPS) {
            return Err(JigError::Decode(format!("unexpected keys next to {}", tag)));
        }
        match map.get(KEY_PROPS) {
            None => Ok(BTreeMap::new()),
            Some(props) => match self.decode_body(props)? {
                Kind::Record(fields) => Ok(fields),
                _ => Err(JigError::Decode(format!("{} props must be a record", tag))),
            },
        }
    }
}

/// Empty object of the shape a shared node decodes to
fn shape_of(node: &Node) -> Result<Kind> {
    let shape = match node {
        Node::Array(_) => Kind::Array(Vec::new()),
        Node::Object(map) if map.contains_key(TAG_BYTES) => Kind::Bytes(Vec::new()),
        Node::Object(map) if map.contains_key(TAG_SET) => Kind::Set {
            items: Vec::new(),
            props: BTreeMap::new(),
        },
        Node::Object(map) if map.contains_key(TAG_MAP) => Kind::Map {
            entries: Vec::new(),
            props: BTreeMap::new(),
        },
        Node::Object(map)
            if map.contains_key(TAG_UNDEFINED)
                || map.contains_key(TAG_NUMBER)
                || map.contains_key(TAG_TOKEN)
                || map.contains_key(TAG_DUP) =>
        {
            return Err(JigError::Decode(format!("shared entry cannot be {}", node)));
        }
        Node::Object(_) => Kind::Record(BTreeMap::new()),
        other => return Err(JigError::Decode(format!("shared entry cannot be {}", other))),
    };
    Ok(shape)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Token, TokenKind};

    fn plain(heap: &Heap, value: &Value) -> Result<Node> {
        encode(heap, value, EncodeOptions::default())
    }

    fn round_trip(heap: &mut Heap, value: &Value) -> Value {
        let node = plain(heap, value).unwrap();
        let decoded = decode(heap, &node, DecodeOptions::default()).unwrap();
        assert!(heap.deep_equal(value, &decoded), "{} did not round trip", node);
        let again = plain(heap, &decoded).unwrap();
        assert_eq!(
            serde_json::to_string(&node).unwrap(),
            serde_json::to_string(&again).unwrap()
        );
        decoded
    }

    #[test]
    fn test_special_numbers() {
        let heap = Heap::new();
        assert_eq!(plain(&heap, &Value::Number(-0.0)).unwrap(), json!({"$n": "-0"}));
        assert_eq!(plain(&heap, &Value::Number(f64::NAN)).unwrap(), json!({"$n": "NaN"}));
        assert_eq!(plain(&heap, &Value::Number(f64::INFINITY)).unwrap(), json!({"$n": "Infinity"}));
        assert_eq!(
            plain(&heap, &Value::Number(f64::NEG_INFINITY)).unwrap(),
            json!({"$n": "-Infinity"})
        );
        assert_eq!(plain(&heap, &Value::Undefined).unwrap(), json!({"$und": 1}));
        assert_eq!(plain(&heap, &Value::Number(3.0)).unwrap(), json!(3));
        assert_eq!(plain(&heap, &Value::Number(1.5)).unwrap(), json!(1.5));
    }

    #[test]
    fn test_round_trip_mixed_graph() {
        let mut heap = Heap::new();
        let bytes = heap.bytes(vec![0u8, 1, 255]);
        let set = heap.set(vec![Value::from(1.0), Value::from("a")]);
        heap.set_property(set.as_object().unwrap(), "label", Value::from("tagged")).unwrap();
        let key = heap.record(vec![("k", Value::Bool(true))]);
        let map = heap.map(vec![(key, Value::Number(f64::NAN)), (Value::from("x"), Value::Undefined)]);
        let arr = heap.array(vec![Value::Null, Value::Number(-0.0), bytes]);
        let root = heap.record(vec![
            ("arr", arr),
            ("set", set),
            ("map", map),
            ("$weird", Value::from("escaped")),
        ]);
        round_trip(&mut heap, &root);
    }

    #[test]
    fn test_record_keys_sorted_and_escaped() {
        let mut heap = Heap::new();
        let root = heap.record(vec![("b", Value::from(1.0)), ("a", Value::from(2.0))]);
        assert_eq!(serde_json::to_string(&plain(&heap, &root).unwrap()).unwrap(), r#"{"a":2,"b":1}"#);

        let escaped = heap.record(vec![("$und", Value::from(1.0))]);
        assert_eq!(plain(&heap, &escaped).unwrap(), json!({"$obj": {"$und": 1}}));
        let decoded = round_trip(&mut heap, &escaped);
        assert_eq!(heap.get_property(decoded.as_object().unwrap(), "$und").unwrap(), Value::from(1.0));
    }

    #[test]
    fn test_acyclic_graph_has_no_dups() {
        let mut heap = Heap::new();
        let a = heap.array(vec![Value::from(1.0)]);
        let b = heap.array(vec![Value::from(1.0)]);
        let root = heap.record(vec![("a", a), ("b", b)]);
        let node = plain(&heap, &root).unwrap();
        assert!(node.get(TAG_TOP).is_none());
    }

    #[test]
    fn test_self_reference_preserves_identity() {
        let mut heap = Heap::new();
        let r = heap.record(Vec::<(String, Value)>::new());
        heap.set_property(r.as_object().unwrap(), "self", r.clone()).unwrap();

        let node = plain(&heap, &r).unwrap();
        assert_eq!(node, json!({"$top": {"$dup": 0}, "dups": [{"self": {"$dup": 0}}]}));

        let decoded = round_trip(&mut heap, &r);
        let d = decoded.as_object().unwrap();
        assert_eq!(heap.get_property(d, "self").unwrap(), Value::Object(d));
    }

    #[test]
    fn test_shared_reference_hoisted_once() {
        let mut heap = Heap::new();
        let shared = heap.array(vec![Value::from("s")]);
        let root = heap.record(vec![("x", shared.clone()), ("y", shared)]);
        let node = plain(&heap, &root).unwrap();
        assert_eq!(
            node,
            json!({"$top": {"x": {"$dup": 0}, "y": {"$dup": 0}}, "dups": [["s"]]})
        );
        let decoded = round_trip(&mut heap, &root).as_object().unwrap();
        assert_eq!(heap.get_property(decoded, "x").unwrap(), heap.get_property(decoded, "y").unwrap());
    }

    #[test]
    fn test_symbol_rejected() {
        let heap = Heap::new();
        let err = plain(&heap, &Value::Symbol("tag".to_string())).unwrap_err();
        assert!(matches!(err, JigError::Encode(ref m) if m.contains("Symbol(tag)")));
    }

    #[test]
    fn test_extended_container_rejected() {
        let mut heap = Heap::new();
        let r = heap.alloc_extended(Kind::Array(vec![]), "MyArray");
        let err = plain(&heap, &Value::Object(r)).unwrap_err();
        assert!(matches!(err, JigError::Encode(ref m) if m.contains("MyArray")));
    }

    #[test]
    fn test_tokens_need_callbacks() {
        let mut heap = Heap::new();
        let jig = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        let root = heap.array(vec![Value::Object(jig)]);
        assert!(matches!(plain(&heap, &root), Err(JigError::Encode(_))));

        let mut saver = |_: &Heap, r: ObjRef| -> Result<String> { Ok(format!("loc-{}", r.index())) };
        let node = encode(
            &heap,
            &root,
            EncodeOptions {
                saver: Some(&mut saver),
                owner: None,
            },
        )
        .unwrap();
        assert_eq!(node, json!([{"$jig": format!("loc-{}", jig.index())}]));

        assert!(matches!(
            decode(&mut heap, &node, DecodeOptions::default()),
            Err(JigError::Decode(_))
        ));

        let mut loader = |_: &mut Heap, reference: &str| -> Result<ObjRef> {
            assert_eq!(reference, format!("loc-{}", jig.index()));
            Ok(jig)
        };
        let decoded = decode(
            &mut heap,
            &node,
            DecodeOptions {
                loader: Some(&mut loader),
                owner: None,
            },
        )
        .unwrap();
        assert_eq!(heap.get_property(decoded.as_object().unwrap(), "0").unwrap(), Value::Object(jig));
    }

    #[test]
    fn test_cross_ownership_rejected() {
        let mut heap = Heap::new();
        let a = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        let b = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        let private = heap.array(vec![]);
        heap.stamp_owner(&private, b);
        let root = heap.record(vec![("leak", private)]);

        let err = encode(
            &heap,
            &root,
            EncodeOptions {
                saver: None,
                owner: Some(a),
            },
        )
        .unwrap_err();
        assert!(matches!(err, JigError::CrossOwnership(_)));

        assert!(encode(
            &heap,
            &root,
            EncodeOptions {
                saver: None,
                owner: Some(b),
            },
        )
        .is_ok());
    }

    #[test]
    fn test_decode_stamps_owner() {
        let mut heap = Heap::new();
        let jig = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        let value = decode(
            &mut heap,
            &json!({"list": [1, 2]}),
            DecodeOptions {
                loader: None,
                owner: Some(jig),
            },
        )
        .unwrap();
        let list = heap.get_property(value.as_object().unwrap(), "list").unwrap();
        assert_eq!(heap.get(list.as_object().unwrap()).unwrap().owner, Some(jig));
    }

    #[test]
    fn test_decode_rejects_unknown_tags() {
        let mut heap = Heap::new();
        let err = decode(&mut heap, &json!({"$nope": 1}), DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, JigError::Decode(_)));
        let err = decode(&mut heap, &json!({"$dup": 0}), DecodeOptions::default()).unwrap_err();
        assert!(matches!(err, JigError::Decode(_)));
    }

    #[test]
    fn test_clone_keeps_tokens_and_copies_objects() {
        let mut heap = Heap::new();
        let jig = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        let inner = heap.array(vec![Value::from(1.0)]);
        let root = heap.record(vec![("jig", Value::Object(jig)), ("inner", inner.clone())]);

        let copy = clone_value(&mut heap, &root).unwrap();
        let c = copy.as_object().unwrap();
        assert_ne!(copy, root);
        assert_eq!(heap.get_property(c, "jig").unwrap(), Value::Object(jig));
        assert_ne!(heap.get_property(c, "inner").unwrap(), inner);
        assert!(heap.deep_equal(&copy, &root));
    }
}
