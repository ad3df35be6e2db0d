use crate::codec::{self, DecodeOptions, EncodeOptions};
use crate::error::{JigError, Result};
use crate::id::ObjRef;
use crate::objects::{Heap, Kind, Value};
use log::debug;
use serde::Serialize;
use serde_json::Value as Node;

/// Point-in-time snapshot of a token's state, or of a plain value graph
///
/// Tokens reached from the state are captured by identity in `refs`; the encoded payload refers
/// to them by index.
#[derive(Debug, Clone, Serialize)]
pub struct Checkpoint {
    /// Encoded state with index token references
    state: Node,

    /// Captured tokens, in first-encounter order
    refs: Vec<ObjRef>,

    #[serde(skip)]
    restored: Option<Value>,
}

impl PartialEq for Checkpoint {
    fn eq(&self, other: &Self) -> bool {
        self.equals(other)
    }
}

impl Checkpoint {
    /// Snapshot the own fields of `token`
    ///
    /// `origin` and `location` are not fields and are never part of the snapshot. Internal
    /// objects owned by another token abort the snapshot with `CrossOwnership`.
    pub fn of_token(heap: &Heap, token: ObjRef) -> Result<Self> {
        let fields = match &heap.object(token)?.kind {
            Kind::Token(t) => &t.fields,
            other => {
                return Err(JigError::Encode(format!("{} is not a token", other.name())));
            }
        };
        let mut refs = Vec::new();
        let state = {
            let mut saver = capture(&mut refs);
            codec::encode_fields(
                heap,
                fields,
                EncodeOptions {
                    saver: Some(&mut saver),
                    owner: Some(token),
                },
            )?
        };
        Ok(Self {
            state,
            refs,
            restored: None,
        })
    }

    /// Snapshot an arbitrary value, such as the arguments of a call
    pub fn of_value(heap: &Heap, value: &Value) -> Result<Self> {
        let mut refs = Vec::new();
        let state = {
            let mut saver = capture(&mut refs);
            codec::encode(
                heap,
                value,
                EncodeOptions {
                    saver: Some(&mut saver),
                    owner: None,
                },
            )?
        };
        Ok(Self {
            state,
            refs,
            restored: None,
        })
    }

    /// Encoded state, token references given as indices into [`Checkpoint::refs`]
    pub fn state(&self) -> &Node {
        &self.state
    }

    pub fn refs(&self) -> &[ObjRef] {
        &self.refs
    }

    /// Equal payloads and identical captured tokens in the same order
    pub fn equals(&self, other: &Checkpoint) -> bool {
        self.state == other.state && self.refs == other.refs
    }

    /// Decode the snapshot into a fresh value; decoded once and memoized
    pub fn restore(&mut self, heap: &mut Heap) -> Result<Value> {
        if let Some(value) = &self.restored {
            return Ok(value.clone());
        }
        let value = self.decode(heap, None)?;
        self.restored = Some(value.clone());
        Ok(value)
    }

    /// Replace every own field of the live `token` with the snapshot's fields
    ///
    /// Internal objects are freshly decoded and stamped as owned by `token`. Callers disable
    /// capability enforcement around this.
    pub fn restore_in_place(&self, heap: &mut Heap, token: ObjRef) -> Result<()> {
        debug!("Restoring {} from checkpoint", token);
        let decoded = self.decode(heap, Some(token))?;
        let record = decoded
            .as_object()
            .ok_or_else(|| JigError::Decode("token snapshot is not a record".to_string()))?;
        let fields = match &heap.object(record)?.kind {
            Kind::Record(fields) => fields.clone(),
            other => {
                return Err(JigError::Decode(format!("token snapshot is a {}", other.name())));
            }
        };
        let target = heap
            .token_mut(token)
            .ok_or_else(|| JigError::Decode(format!("{} is not a token", token)))?;
        target.fields = fields;
        Ok(())
    }

    /// The payload persisted off-chain: token indices replaced by `resolve(token)`
    pub fn to_wire(&self, resolve: &mut dyn FnMut(ObjRef) -> Result<String>) -> Result<Node> {
        let mut node = self.state.clone();
        codec::rewrite_tokens(&mut node, &mut |reference: &str| {
            let token = codec::index_ref(&self.refs, reference)?;
            resolve(token)
        })?;
        Ok(node)
    }

    fn decode(&self, heap: &mut Heap, owner: Option<ObjRef>) -> Result<Value> {
        let refs = &self.refs;
        let mut loader = |_: &mut Heap, reference: &str| -> Result<ObjRef> { codec::index_ref(refs, reference) };
        codec::decode(
            heap,
            &self.state,
            DecodeOptions {
                loader: Some(&mut loader),
                owner,
            },
        )
    }
}

/// Saver recording each token once and writing its index
fn capture(refs: &mut Vec<ObjRef>) -> impl FnMut(&Heap, ObjRef) -> Result<String> + '_ {
    move |_: &Heap, token: ObjRef| {
        let index = match refs.iter().position(|r| *r == token) {
            Some(index) => index,
            None => {
                refs.push(token);
                refs.len() - 1
            }
        };
        Ok(index.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{Token, TokenKind};
    use serde_json::json;

    fn jig(heap: &mut Heap) -> ObjRef {
        heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)))
    }

    #[test]
    fn test_snapshot_excludes_bindings() {
        let mut heap = Heap::new();
        let j = jig(&mut heap);
        heap.set_property(j, "n", Value::from(1.0)).unwrap();
        let cp = Checkpoint::of_token(&heap, j).unwrap();
        assert_eq!(cp.state(), &json!({"n": 1}));
        assert!(cp.refs().is_empty());
    }

    #[test]
    fn test_equality_compares_refs() {
        let mut heap = Heap::new();
        let j = jig(&mut heap);
        let a = jig(&mut heap);
        let b = jig(&mut heap);

        heap.set_property(j, "friend", Value::Object(a)).unwrap();
        let first = Checkpoint::of_token(&heap, j).unwrap();
        heap.set_property(j, "friend", Value::Object(b)).unwrap();
        let second = Checkpoint::of_token(&heap, j).unwrap();

        // Same payload shape, different captured token
        assert_eq!(first.state(), second.state());
        assert!(!first.equals(&second));

        heap.set_property(j, "friend", Value::Object(a)).unwrap();
        let third = Checkpoint::of_token(&heap, j).unwrap();
        assert_eq!(first, third);
    }

    #[test]
    fn test_restore_in_place_rolls_back() {
        let mut heap = Heap::new();
        let j = jig(&mut heap);
        let list = heap.array(vec![Value::from(1.0)]);
        heap.stamp_owner(&list, j);
        heap.set_property(j, "list", list.clone()).unwrap();
        let before = Checkpoint::of_token(&heap, j).unwrap();

        heap.set_property(list.as_object().unwrap(), "1", Value::from(2.0)).unwrap();
        heap.set_property(j, "extra", Value::Bool(true)).unwrap();
        assert!(!before.equals(&Checkpoint::of_token(&heap, j).unwrap()));

        before.restore_in_place(&mut heap, j).unwrap();
        assert!(before.equals(&Checkpoint::of_token(&heap, j).unwrap()));
        assert_eq!(heap.get_property(j, "extra").unwrap(), Value::Undefined);
        let restored = heap.get_property(j, "list").unwrap().as_object().unwrap();
        assert_eq!(heap.get(restored).unwrap().owner, Some(j));
    }

    #[test]
    fn test_restore_is_memoized() {
        let mut heap = Heap::new();
        let arr = heap.array(vec![Value::from("x")]);
        let mut cp = Checkpoint::of_value(&heap, &arr).unwrap();
        let first = cp.restore(&mut heap).unwrap();
        let second = cp.restore(&mut heap).unwrap();
        assert_eq!(first, second);
        assert_ne!(first, arr);
        assert!(heap.deep_equal(&first, &arr));
    }

    #[test]
    fn test_to_wire_resolves_tokens() {
        let mut heap = Heap::new();
        let j = jig(&mut heap);
        let other = jig(&mut heap);
        let escaped = heap.record(vec![("$jig", Value::from("0"))]);
        heap.set_property(j, "friend", Value::Object(other)).unwrap();
        heap.set_property(j, "weird", escaped).unwrap();
        let cp = Checkpoint::of_token(&heap, j).unwrap();

        let wire = cp
            .to_wire(&mut |r: ObjRef| {
                assert_eq!(r, other);
                Ok("abc_o1".to_string())
            })
            .unwrap();
        assert_eq!(
            wire,
            json!({"friend": {"$jig": "abc_o1"}, "weird": {"$obj": {"$jig": "0"}}})
        );
    }
}
