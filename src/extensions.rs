//! Operation-recognizer registry (§9): models the reference implementation's
//! runtime-registered protocol extensions (OPI plugins such as `no_return` or
//! wrap-token cryptography) as a registry keyed by `op` string, so a plugin
//! could be added without touching the base `{deploy,mint,transfer}` dispatch
//! in `processor.rs`. No concrete extension ships with the core; extension
//! plugins themselves are out of scope (§1).

use bitcoin::Transaction;

use crate::error::ValidationResult;
use crate::model::{Brc20Payload, IntermediateState};

/// A recognizer parses an already-JSON-decoded payload whose `op` it owns,
/// validates it against in-block state, and applies its effect. The core
/// dispatches to base recognizers for `deploy`/`mint`/`transfer` first; an
/// extension's `op` name must not collide with those.
pub trait OperationRecognizer: Send + Sync {
    fn op_name(&self) -> &'static str;

    fn parse(&self, json: &serde_json::Value) -> Result<Brc20Payload, ValidationResult>;

    fn validate(&self, payload: &Brc20Payload, intermediate: &IntermediateState) -> Result<(), ValidationResult>;

    fn apply(&self, tx: &Transaction, payload: &Brc20Payload, intermediate: &mut IntermediateState);
}

/// Holds zero or more registered extension recognizers. Empty by default —
/// the base dispatch in `processor.rs` handles `deploy`/`mint`/`transfer`
/// without consulting this registry at all.
#[derive(Default)]
pub struct ExtensionRegistry {
    recognizers: Vec<Box<dyn OperationRecognizer>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a recognizer. Panics on an attempt to shadow a base op name —
    /// a configuration mistake, not a runtime condition.
    pub fn register(&mut self, recognizer: Box<dyn OperationRecognizer>) {
        assert!(
            !matches!(recognizer.op_name(), "deploy" | "mint" | "transfer"),
            "extension recognizer cannot shadow a base operation name",
        );
        self.recognizers.push(recognizer);
    }

    pub fn find(&self, op: &str) -> Option<&dyn OperationRecognizer> {
        self.recognizers
            .iter()
            .find(|r| r.op_name() == op)
            .map(|b| b.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.recognizers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoReturnRecognizer;

    impl OperationRecognizer for NoReturnRecognizer {
        fn op_name(&self) -> &'static str {
            "no_return"
        }

        fn parse(&self, _json: &serde_json::Value) -> Result<Brc20Payload, ValidationResult> {
            unimplemented!("example recognizer for registry tests only")
        }

        fn validate(&self, _payload: &Brc20Payload, _intermediate: &IntermediateState) -> Result<(), ValidationResult> {
            Ok(())
        }

        fn apply(&self, _tx: &Transaction, _payload: &Brc20Payload, _intermediate: &mut IntermediateState) {}
    }

    #[test]
    fn empty_registry_finds_nothing() {
        let registry = ExtensionRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.find("no_return").is_none());
    }

    #[test]
    fn registered_recognizer_is_found_by_op_name() {
        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(NoReturnRecognizer));
        assert!(registry.find("no_return").is_some());
        assert!(registry.find("mint").is_none());
    }

    #[test]
    #[should_panic(expected = "cannot shadow")]
    fn registering_a_base_op_name_panics() {
        struct FakeMint;
        impl OperationRecognizer for FakeMint {
            fn op_name(&self) -> &'static str {
                "mint"
            }
            fn parse(&self, _json: &serde_json::Value) -> Result<Brc20Payload, ValidationResult> {
                unimplemented!()
            }
            fn validate(&self, _payload: &Brc20Payload, _intermediate: &IntermediateState) -> Result<(), ValidationResult> {
                Ok(())
            }
            fn apply(&self, _tx: &Transaction, _payload: &Brc20Payload, _intermediate: &mut IntermediateState) {}
        }

        let mut registry = ExtensionRegistry::new();
        registry.register(Box::new(FakeMint));
    }
}
