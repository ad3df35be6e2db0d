//! In-memory ledger used as the default transaction builder

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use jigs_core::codec;
use jigs_core::{Checkpoint, Heap, Location, ObjRef, TxId};
use log::{debug, info};
use serde_json::{json, Value as Node};

use crate::action::{Action, Published, TransactionBuilder};
use crate::config::RuntimeConfig;

/// Prefix of a reference to an output of the record being built
const LOCAL_OUTPUT: &str = "_o";

/// One published record
#[derive(Debug, Clone)]
pub struct LedgerRecord {
    pub txid: TxId,

    /// Methods batched into this record, in call order
    pub methods: Vec<String>,

    /// Objects whose prior state the record consumes
    pub inputs: Vec<ObjRef>,

    /// Locations of the consumed states
    pub input_locations: Vec<Location>,

    /// Objects whose new state the record produces, in output order
    pub outputs: Vec<ObjRef>,

    /// Objects observed but not consumed
    pub reads: Vec<ObjRef>,

    /// Canonical payload the txid commits to
    pub payload: Node,

    pub published_at: DateTime<Utc>,
}

#[derive(Default)]
struct LedgerInner {
    network: String,

    /// Actions stored since the last publish
    pending: Vec<Action>,

    /// Every accepted action, published or not
    history: Vec<Action>,

    records: Vec<LedgerRecord>,

    /// Output states in wire form, keyed by committed location
    states: BTreeMap<Location, Node>,

    /// Location of every pending input at the time it was first consumed
    input_locations: BTreeMap<ObjRef, Location>,

    fail_next_publish: Option<String>,
    reject_next_action: Option<String>,
}

/// Transaction builder keeping every record in memory
///
/// Cloning yields another handle to the same ledger, so a test can keep one handle while the
/// runtime owns the other.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    inner: Arc<Mutex<LedgerInner>>,
}

impl MemoryLedger {
    /// Create an empty ledger for `network`
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LedgerInner {
                network: network.into(),
                ..LedgerInner::default()
            })),
        }
    }

    /// Create an empty ledger for the network of `config`
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.network.clone())
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every accepted action, in order
    pub fn actions(&self) -> Vec<Action> {
        self.lock().history.clone()
    }

    /// Actions not yet published
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn records(&self) -> Vec<LedgerRecord> {
        self.lock().records.clone()
    }

    /// Published state at `location`
    pub fn state(&self, location: &Location) -> Option<Node> {
        self.lock().states.get(location).cloned()
    }

    /// Make the next publish fail with `message`
    pub fn fail_next_publish(&self, message: impl Into<String>) {
        self.lock().fail_next_publish = Some(message.into());
    }

    /// Make the next stored action be rejected with `message`
    pub fn reject_next_action(&self, message: impl Into<String>) {
        self.lock().reject_next_action = Some(message.into());
    }
}

impl TransactionBuilder for MemoryLedger {
    fn store_action(&mut self, heap: &Heap, action: Action) -> anyhow::Result<()> {
        let mut inner = self.lock();
        if let Some(message) = inner.reject_next_action.take() {
            return Err(anyhow!(message));
        }

        for input in &action.inputs {
            if inner.input_locations.contains_key(input) {
                continue;
            }
            let token = heap
                .token(*input)
                .ok_or_else(|| anyhow!("input {} is not a token", input))?;
            inner.input_locations.insert(*input, token.location.clone());
        }

        debug!(
            "Stored action {} on {} ({} inputs, {} outputs)",
            action.method,
            action.target,
            action.inputs.len(),
            action.outputs.len()
        );
        inner.history.push(action.clone());
        inner.pending.push(action);
        Ok(())
    }

    fn network(&self) -> Option<String> {
        Some(self.lock().network.clone())
    }

    fn publish(&mut self, heap: &Heap) -> anyhow::Result<Option<Published>> {
        let mut inner = self.lock();
        if inner.pending.is_empty() {
            return Ok(None);
        }
        let actions = std::mem::take(&mut inner.pending);
        let input_locations = std::mem::take(&mut inner.input_locations);
        if let Some(message) = inner.fail_next_publish.take() {
            return Err(anyhow!(message));
        }

        let batch = Batch::collect(&actions);
        let payload = batch.payload(heap, &inner.network, &actions, &input_locations)?;
        let bytes = serde_json::to_vec(&payload).context("failed to serialize record payload")?;
        let txid = TxId::for_payload(&inner.network, &bytes);

        for (vout, output) in batch.outputs.iter().enumerate() {
            let checkpoint = batch
                .latest
                .get(output)
                .ok_or_else(|| anyhow!("output {} has no recorded state", output))?;
            let mut state = checkpoint.to_wire(&mut |token| Ok(batch.resolve(heap, token)))?;
            let prefix = txid.to_string();
            codec::rewrite_tokens(&mut state, &mut |reference: &str| {
                Ok(if reference.starts_with(LOCAL_OUTPUT) {
                    format!("{}{}", prefix, reference)
                } else {
                    reference.to_string()
                })
            })?;
            inner.states.insert(Location::committed(&txid, vout + 1), state);
        }

        let record = LedgerRecord {
            txid,
            methods: actions.iter().map(|a| a.method.clone()).collect(),
            input_locations: batch
                .inputs
                .iter()
                .filter_map(|input| input_locations.get(input).cloned())
                .collect(),
            inputs: batch.inputs,
            outputs: batch.outputs.clone(),
            reads: batch.reads,
            payload,
            published_at: Utc::now(),
        };
        info!(
            "Published record {} ({} actions, {} inputs, {} outputs)",
            record.txid,
            record.methods.len(),
            record.inputs.len(),
            record.outputs.len()
        );
        inner.records.push(record);

        Ok(Some(Published {
            txid,
            outputs: batch.outputs,
        }))
    }
}

/// Input, output and read sets of a group of actions
struct Batch<'a> {
    inputs: Vec<ObjRef>,
    outputs: Vec<ObjRef>,
    reads: Vec<ObjRef>,

    /// Last after-state of every output
    latest: BTreeMap<ObjRef, &'a Checkpoint>,
}

impl<'a> Batch<'a> {
    fn collect(actions: &'a [Action]) -> Self {
        let mut created = BTreeSet::new();
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut latest = BTreeMap::new();

        for action in actions {
            for input in &action.inputs {
                if !created.contains(input) && !inputs.contains(input) {
                    inputs.push(*input);
                }
            }
            created.extend(action.creates().copied());
            for output in &action.outputs {
                if !outputs.contains(output) {
                    outputs.push(*output);
                }
                if let Some(after) = action.after.get(output) {
                    latest.insert(*output, after);
                }
            }
        }

        let mut reads = Vec::new();
        for action in actions {
            for read in &action.reads {
                if !inputs.contains(read) && !outputs.contains(read) && !reads.contains(read) {
                    reads.push(*read);
                }
            }
        }

        Self {
            inputs,
            outputs,
            reads,
            latest,
        }
    }

    /// Reference to `token` as seen from inside the record
    fn resolve(&self, heap: &Heap, token: ObjRef) -> String {
        match self.outputs.iter().position(|o| *o == token) {
            Some(index) => format!("{}{}", LOCAL_OUTPUT, index + 1),
            None => heap
                .token(token)
                .map(|t| t.location.to_string())
                .unwrap_or_else(|| token.to_string()),
        }
    }

    fn payload(
        &self,
        heap: &Heap,
        network: &str,
        actions: &[Action],
        input_locations: &BTreeMap<ObjRef, Location>,
    ) -> anyhow::Result<Node> {
        let mut exec = Vec::with_capacity(actions.len());
        for action in actions {
            let args = action.args.to_wire(&mut |token| Ok(self.resolve(heap, token)))?;
            exec.push(json!({
                "target": self.resolve(heap, action.target),
                "method": action.method,
                "args": args,
            }));
        }

        let mut states = Vec::with_capacity(self.outputs.len());
        for output in &self.outputs {
            let state = match self.latest.get(output) {
                Some(checkpoint) => checkpoint.to_wire(&mut |token| Ok(self.resolve(heap, token)))?,
                None => return Err(anyhow!("output {} has no recorded state", output)),
            };
            states.push(state);
        }

        let inputs: Vec<String> = self
            .inputs
            .iter()
            .map(|input| match input_locations.get(input) {
                Some(location) => location.to_string(),
                None => self.resolve(heap, *input),
            })
            .collect();
        let reads: Vec<String> = self.reads.iter().map(|r| self.resolve(heap, *r)).collect();

        Ok(json!({
            "network": network,
            "in": inputs,
            "ref": reads,
            "exec": exec,
            "out": states,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jigs_core::{Kind, Token, TokenKind, Value};

    fn jig(heap: &mut Heap, n: f64) -> ObjRef {
        let r = heap.alloc(Kind::Token(Token::new(TokenKind::Jig, None)));
        heap.set_property(r, "n", Value::from(n)).unwrap();
        r
    }

    fn action(heap: &Heap, target: ObjRef, inputs: &[ObjRef], outputs: &[ObjRef]) -> Action {
        let after = outputs
            .iter()
            .map(|o| (*o, Checkpoint::of_token(heap, *o).unwrap()))
            .collect();
        Action {
            target,
            method: "inc".to_string(),
            args: Checkpoint::of_value(heap, &Value::Undefined).unwrap(),
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.iter().copied().collect(),
            reads: BTreeSet::new(),
            before: BTreeMap::new(),
            after,
            proxies: BTreeMap::new(),
        }
    }

    #[test]
    fn test_publish_batches_created_objects() {
        let mut heap = Heap::new();
        let c = jig(&mut heap, 0.0);
        let mut ledger = MemoryLedger::new("test");

        // Created by the first action, consumed by the second
        ledger.store_action(&heap, action(&heap, c, &[], &[c])).unwrap();
        heap.set_property(c, "n", Value::from(1.0)).unwrap();
        ledger.store_action(&heap, action(&heap, c, &[c], &[c])).unwrap();

        let published = ledger.publish(&heap).unwrap().unwrap();
        assert_eq!(published.outputs, vec![c]);

        let records = ledger.records();
        assert_eq!(records.len(), 1);
        assert!(records[0].inputs.is_empty());
        assert_eq!(records[0].methods, vec!["inc", "inc"]);

        let location = Location::committed(&published.txid, 1);
        assert_eq!(ledger.state(&location), Some(json!({"n": 1})));
        assert_eq!(ledger.pending(), 0);
        assert!(ledger.publish(&heap).unwrap().is_none());
    }

    #[test]
    fn test_inputs_keep_first_location() {
        let mut heap = Heap::new();
        let c = jig(&mut heap, 0.0);
        heap.token_mut(c).unwrap().location = Location::from_raw("aa_o1");
        let mut ledger = MemoryLedger::new("test");

        ledger.store_action(&heap, action(&heap, c, &[c], &[c])).unwrap();
        heap.token_mut(c).unwrap().location = Location::pending();
        ledger.store_action(&heap, action(&heap, c, &[c], &[c])).unwrap();

        ledger.publish(&heap).unwrap();
        let record = &ledger.records()[0];
        assert_eq!(record.inputs, vec![c]);
        assert_eq!(record.input_locations, vec![Location::from_raw("aa_o1")]);
        assert_eq!(record.payload["in"], json!(["aa_o1"]));
    }

    #[test]
    fn test_state_references_resolve_to_outputs() {
        let mut heap = Heap::new();
        let a = jig(&mut heap, 0.0);
        let b = jig(&mut heap, 0.0);
        heap.set_property(a, "peer", Value::Object(b)).unwrap();
        let mut ledger = MemoryLedger::new("test");

        ledger.store_action(&heap, action(&heap, a, &[], &[a, b])).unwrap();
        let published = ledger.publish(&heap).unwrap().unwrap();

        let state = ledger.state(&Location::committed(&published.txid, 1)).unwrap();
        let expected = Location::committed(&published.txid, 2).to_string();
        assert_eq!(state["peer"], json!({"$jig": expected}));
        assert_eq!(ledger.records()[0].payload["out"][0]["peer"], json!({"$jig": "_o2"}));
    }

    #[test]
    fn test_txid_depends_on_network() {
        let mut heap = Heap::new();
        let c = jig(&mut heap, 0.0);
        let mut main = MemoryLedger::new("main");
        let mut test = MemoryLedger::new("test");
        main.store_action(&heap, action(&heap, c, &[], &[c])).unwrap();
        test.store_action(&heap, action(&heap, c, &[], &[c])).unwrap();
        let a = main.publish(&heap).unwrap().unwrap();
        let b = test.publish(&heap).unwrap().unwrap();
        assert_ne!(a.txid, b.txid);
    }

    #[test]
    fn test_failure_hooks() {
        let mut heap = Heap::new();
        let c = jig(&mut heap, 0.0);
        let mut ledger = MemoryLedger::new("test");

        ledger.reject_next_action("no room");
        let err = ledger.store_action(&heap, action(&heap, c, &[], &[c])).unwrap_err();
        assert_eq!(err.to_string(), "no room");
        assert!(ledger.actions().is_empty());

        ledger.store_action(&heap, action(&heap, c, &[], &[c])).unwrap();
        ledger.fail_next_publish("network down");
        let err = ledger.publish(&heap).unwrap_err();
        assert_eq!(err.to_string(), "network down");
        assert_eq!(ledger.pending(), 0);
        assert!(ledger.records().is_empty());
        assert_eq!(ledger.actions().len(), 1);
    }
}
