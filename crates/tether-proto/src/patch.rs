#![forbid(unsafe_code)]

//! Patch operations emitted by the reconciler.
//!
//! The reconciler (an external collaborator) diffs the previous view tree
//! against the next one and produces an ordered list of these operations.
//! The runtime never inspects them beyond counting and checksumming; they
//! are applied verbatim by the client.
//!
//! Element addressing uses the stable string ids the reconciler assigns to
//! view nodes. Order matters: a client must apply the ops of one frame in
//! the order given, and frames in sequence order.

use serde::{Deserialize, Serialize};

/// One mutation of the client-side view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PatchOp {
    /// Replace the text content of an element.
    SetText {
        /// Target element id.
        el: String,
        /// New text content.
        text: String,
    },
    /// Set (or overwrite) an attribute.
    SetAttr {
        el: String,
        name: String,
        value: String,
    },
    /// Remove an attribute if present.
    RemoveAttr { el: String, name: String },
    /// Insert a new child subtree at `index` under `parent`.
    InsertChild {
        parent: String,
        index: u32,
        /// Serialized subtree markup, opaque to the runtime.
        markup: String,
    },
    /// Remove an element and its subtree.
    RemoveChild { el: String },
    /// Move an existing element to a new position.
    MoveChild {
        el: String,
        parent: String,
        index: u32,
    },
}

impl PatchOp {
    /// Id of the element this op primarily targets.
    pub fn target(&self) -> &str {
        match self {
            PatchOp::SetText { el, .. }
            | PatchOp::SetAttr { el, .. }
            | PatchOp::RemoveAttr { el, .. }
            | PatchOp::RemoveChild { el }
            | PatchOp::MoveChild { el, .. } => el,
            PatchOp::InsertChild { parent, .. } => parent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn patch_ops_round_trip_through_json() {
        let ops = vec![
            PatchOp::SetText {
                el: "e1".into(),
                text: "hello".into(),
            },
            PatchOp::MoveChild {
                el: "e2".into(),
                parent: "root".into(),
                index: 3,
            },
        ];
        let json = serde_json::to_string(&ops).unwrap();
        let back: Vec<PatchOp> = serde_json::from_str(&json).unwrap();
        assert_eq!(ops, back);
    }

    #[test]
    fn target_reports_the_mutated_element() {
        let op = PatchOp::InsertChild {
            parent: "root".into(),
            index: 0,
            markup: "<li/>".into(),
        };
        assert_eq!(op.target(), "root");
    }
}
