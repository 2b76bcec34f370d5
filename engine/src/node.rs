//! Immutable snapshot trees.
//!
//! A [`Node`] is either empty (null), a scalar leaf, or an ordered map of
//! children. Children live behind an [`Arc`], so producing a modified tree
//! copies one map per level on the modified path and shares every other
//! subtree with the original.

use crate::{error::Result, ChildKey, Error, Path};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Children of a tree node, in key order.
pub type Children = BTreeMap<ChildKey, Node>;

/// An immutable snapshot of the data at some location.
///
/// Invariants: a `Leaf` holds a bool, a finite number or a string; a `Tree`
/// is never empty and never holds an `Empty` child.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Node {
    #[default]
    Empty,
    Leaf(Value),
    Tree(Arc<Children>),
}

impl Node {
    /// Build a node from a JSON value.
    ///
    /// `null` and empty containers become [`Node::Empty`]; arrays become
    /// trees keyed by index.
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Node::Empty),
            Value::Bool(_) | Value::String(_) => Ok(Node::Leaf(value.clone())),
            Value::Number(n) => match n.as_f64() {
                Some(f) if f.is_finite() => Ok(Node::Leaf(value.clone())),
                _ => Err(Error::InvalidPayload(format!("unsupported number {n}"))),
            },
            Value::Array(items) => {
                let mut children = Children::new();
                for (index, item) in items.iter().enumerate() {
                    let child = Node::from_json(item)?;
                    if !child.is_empty() {
                        children.insert(ChildKey::new(index.to_string())?, child);
                    }
                }
                Ok(Node::from_children(children))
            }
            Value::Object(map) => {
                let mut children = Children::new();
                for (key, item) in map {
                    let key = ChildKey::new(key.as_str())
                        .map_err(|e| Error::InvalidPayload(e.to_string()))?;
                    let child = Node::from_json(item)?;
                    if !child.is_empty() {
                        children.insert(key, child);
                    }
                }
                Ok(Node::from_children(children))
            }
        }
    }

    /// Build a node from children, dropping empty ones.
    pub fn from_children(mut children: Children) -> Self {
        children.retain(|_, child| !child.is_empty());
        if children.is_empty() {
            Node::Empty
        } else {
            Node::Tree(Arc::new(children))
        }
    }

    /// Convert back to JSON. Trees always become objects.
    pub fn to_json(&self) -> Value {
        match self {
            Node::Empty => Value::Null,
            Node::Leaf(value) => value.clone(),
            Node::Tree(children) => Value::Object(
                children
                    .iter()
                    .map(|(key, child)| (key.to_string(), child.to_json()))
                    .collect(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Node::Empty)
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    /// Direct child, or `Empty` when absent.
    pub fn child(&self, key: &ChildKey) -> Node {
        match self {
            Node::Tree(children) => children.get(key).cloned().unwrap_or_default(),
            _ => Node::Empty,
        }
    }

    /// Descendant at `path`, or `Empty` when absent.
    pub fn child_at(&self, path: &Path) -> Node {
        let mut current = self.clone();
        for key in path.keys() {
            current = current.child(key);
            if current.is_empty() {
                break;
            }
        }
        current
    }

    /// Children in key order. Leaves and empty nodes have none.
    pub fn children(&self) -> impl Iterator<Item = (&ChildKey, &Node)> {
        let map = match self {
            Node::Tree(children) => Some(children.as_ref()),
            _ => None,
        };
        map.into_iter().flat_map(|children| children.iter())
    }

    pub fn child_count(&self) -> usize {
        match self {
            Node::Tree(children) => children.len(),
            _ => 0,
        }
    }

    /// Number of leaves in the tree.
    pub fn leaf_count(&self) -> usize {
        match self {
            Node::Empty => 0,
            Node::Leaf(_) => 1,
            Node::Tree(children) => children.values().map(Node::leaf_count).sum(),
        }
    }

    /// Replace (or remove, when `child` is empty) one direct child.
    ///
    /// Updating a leaf discards the scalar and starts a fresh tree.
    pub fn update_child(&self, key: &ChildKey, child: Node) -> Node {
        let mut children = match self {
            Node::Tree(children) => children.as_ref().clone(),
            _ => Children::new(),
        };
        if child.is_empty() {
            children.remove(key);
        } else {
            children.insert(key.clone(), child);
        }
        Node::from_children(children)
    }

    /// Replace the subtree at `path` with `value`.
    ///
    /// Missing intermediate nodes are created; writing `Empty` removes the
    /// path together with every ancestor it leaves empty.
    pub fn update_at(&self, path: &Path, value: Node) -> Node {
        match path.front() {
            None => value,
            Some(front) => {
                let child = self.child(front).update_at(&path.pop_front(), value);
                self.update_child(front, child)
            }
        }
    }

    /// Shallow merge of named children at `path`, leaving siblings intact.
    pub fn update_children_at(&self, path: &Path, children: &Children) -> Node {
        let target = children
            .iter()
            .fold(self.child_at(path), |node, (key, child)| {
                node.update_child(key, child.clone())
            });
        self.update_at(path, target)
    }

    /// Approximate in-memory footprint, used for cache budgets.
    pub fn estimated_bytes(&self) -> usize {
        match self {
            Node::Empty => 0,
            Node::Leaf(Value::String(s)) => s.len(),
            Node::Leaf(_) => 8,
            Node::Tree(children) => children
                .iter()
                .map(|(key, child)| key.as_str().len() + child.estimated_bytes())
                .sum(),
        }
    }

    /// Ordering used when children are sorted by value.
    ///
    /// null < false < true < numbers < strings < trees; trees compare equal
    /// so callers fall back to the key.
    pub fn cmp_by_value(&self, other: &Node) -> Ordering {
        self.value_rank()
            .cmp(&other.value_rank())
            .then_with(|| match (self, other) {
                (Node::Leaf(Value::Number(a)), Node::Leaf(Value::Number(b))) => {
                    let a = a.as_f64().unwrap_or_default();
                    let b = b.as_f64().unwrap_or_default();
                    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
                }
                (Node::Leaf(Value::String(a)), Node::Leaf(Value::String(b))) => a.cmp(b),
                _ => Ordering::Equal,
            })
    }

    fn value_rank(&self) -> u8 {
        match self {
            Node::Empty => 0,
            Node::Leaf(Value::Bool(false)) => 1,
            Node::Leaf(Value::Bool(true)) => 2,
            Node::Leaf(Value::Number(_)) => 3,
            Node::Leaf(_) => 4,
            Node::Tree(_) => 5,
        }
    }
}

impl TryFrom<Value> for Node {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Node::from_json(&value)
    }
}

impl From<Node> for Value {
    fn from(node: Node) -> Self {
        node.to_json()
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(value: Value) -> Node {
        Node::from_json(&value).unwrap()
    }

    fn path(raw: &str) -> Path {
        Path::parse(raw).unwrap()
    }

    #[test]
    fn json_conversion_normalises_empties() {
        assert!(node(json!(null)).is_empty());
        assert!(node(json!({})).is_empty());
        assert!(node(json!({"a": null, "b": {}})).is_empty());
        assert_eq!(node(json!({"a": 1, "b": null})).to_json(), json!({"a": 1}));
        assert_eq!(
            node(json!(["x", null, "z"])).to_json(),
            json!({"0": "x", "2": "z"})
        );
    }

    #[test]
    fn json_conversion_rejects_bad_keys() {
        let result = Node::from_json(&json!({"bad.key": 1}));
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn update_at_creates_intermediates() {
        let base = Node::Empty;
        let updated = base.update_at(&path("a/b/c"), node(json!("leaf")));
        assert_eq!(updated.to_json(), json!({"a": {"b": {"c": "leaf"}}}));
        assert!(base.is_empty());
    }

    #[test]
    fn update_at_with_empty_prunes_ancestors() {
        let base = node(json!({"a": {"b": {"c": 1}}, "d": 2}));
        let updated = base.update_at(&path("a/b/c"), Node::Empty);
        assert_eq!(updated.to_json(), json!({"d": 2}));
    }

    #[test]
    fn update_at_replaces_leaf_with_tree() {
        let base = node(json!({"a": 5}));
        let updated = base.update_at(&path("a/b"), node(json!(true)));
        assert_eq!(updated.to_json(), json!({"a": {"b": true}}));
    }

    #[test]
    fn update_children_leaves_siblings() {
        let base = node(json!({"bar": {"qux": "qux-value", "baz": 1}}));
        let mut children = Children::new();
        children.insert(ChildKey::new("quu").unwrap(), node(json!("quu-value")));
        children.insert(ChildKey::new("baz").unwrap(), Node::Empty);

        let updated = base.update_children_at(&path("bar"), &children);
        assert_eq!(
            updated.to_json(),
            json!({"bar": {"qux": "qux-value", "quu": "quu-value"}})
        );
    }

    #[test]
    fn untouched_subtrees_are_shared() {
        let base = node(json!({"left": {"x": 1}, "right": {"y": 2}}));
        let updated = base.update_at(&path("right/y"), node(json!(3)));

        let (Node::Tree(before), Node::Tree(after)) = (&base, &updated) else {
            panic!("expected trees");
        };
        let key = ChildKey::new("left").unwrap();
        match (&before[&key], &after[&key]) {
            (Node::Tree(a), Node::Tree(b)) => assert!(Arc::ptr_eq(a, b)),
            _ => panic!("expected trees"),
        }
    }

    #[test]
    fn child_at_missing_is_empty() {
        let base = node(json!({"a": "leaf"}));
        assert!(base.child_at(&path("a/b")).is_empty());
        assert!(base.child_at(&path("z")).is_empty());
        assert_eq!(base.child_at(&Path::root()), base);
    }

    #[test]
    fn value_ordering() {
        let ordered = [
            json!(false),
            json!(true),
            json!(-3),
            json!(2.5),
            json!("a"),
            json!("b"),
            json!({"k": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                node(pair[0].clone()).cmp_by_value(&node(pair[1].clone())),
                Ordering::Less,
                "{} < {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn counts() {
        let tree = node(json!({"a": {"b": 1, "c": 2}, "d": "x"}));
        assert_eq!(tree.child_count(), 2);
        assert_eq!(tree.leaf_count(), 3);
        assert_eq!(tree.children().count(), 2);
        assert_eq!(node(json!(1)).children().count(), 0);
    }

    #[test]
    fn serde_goes_through_json() {
        let tree = node(json!({"a": [1, 2]}));
        let text = serde_json::to_string(&tree).unwrap();
        assert_eq!(text, r#"{"a":{"0":1,"1":2}}"#);
        let parsed: Node = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, tree);
    }

    // Property-based tests using proptest
    mod property_tests {
        use super::*;
        use proptest::prelude::*;

        fn arb_key() -> impl Strategy<Value = ChildKey> {
            prop_oneof![
                "[a-z]{1,4}".prop_map(|k| ChildKey::new(k).unwrap()),
                (0u32..20).prop_map(|n| ChildKey::new(n.to_string()).unwrap()),
            ]
        }

        fn arb_path() -> impl Strategy<Value = Path> {
            prop::collection::vec(arb_key(), 0..4).prop_map(Path::from_keys)
        }

        fn arb_leaf() -> impl Strategy<Value = Value> {
            prop_oneof![
                any::<bool>().prop_map(Value::from),
                (-1000i64..1000).prop_map(Value::from),
                "[a-z]{0,6}".prop_map(Value::from),
            ]
        }

        fn arb_tree() -> impl Strategy<Value = Node> {
            let leaf = arb_leaf().prop_map(|v| Node::from_json(&v).unwrap());
            leaf.prop_recursive(3, 24, 4, |inner| {
                prop::collection::btree_map(arb_key(), inner, 0..4).prop_map(Node::from_children)
            })
        }

        proptest! {
            #[test]
            fn prop_update_then_read(tree in arb_tree(), at in arb_path(), value in arb_tree()) {
                let updated = tree.update_at(&at, value.clone());
                prop_assert_eq!(updated.child_at(&at), value);
            }

            #[test]
            fn prop_update_leaves_other_branches(
                tree in arb_tree(),
                key in arb_key(),
                other in arb_key(),
                value in arb_tree(),
            ) {
                prop_assume!(key != other);
                let updated = tree.update_child(&key, value);
                prop_assert_eq!(updated.child(&other), tree.child(&other));
            }

            #[test]
            fn prop_json_roundtrip(tree in arb_tree()) {
                prop_assert_eq!(Node::from_json(&tree.to_json()).unwrap(), tree);
            }

            #[test]
            fn prop_value_order_is_total(a in arb_tree(), b in arb_tree()) {
                prop_assert_eq!(a.cmp_by_value(&b), b.cmp_by_value(&a).reverse());
            }
        }
    }
}
