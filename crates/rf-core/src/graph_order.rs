//! Graph order
//!
//! Position of a node in the session tree, expressed as the path of child
//! indices from the root. Lexicographic comparison of two paths gives
//! pre-order position. The engine executes its node tree in that same order
//! once per cycle, so graph order decides whether a send can be read by its
//! target within the current cycle.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::cmp::Ordering;
use std::fmt;

/// Path of child indices from the tree root
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct GraphOrder(pub SmallVec<[usize; 8]>);

impl GraphOrder {
    pub fn root() -> Self {
        Self(SmallVec::new())
    }

    pub fn from_path(path: &[usize]) -> Self {
        Self(SmallVec::from_slice(path))
    }

    /// Depth below the root
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    /// Order of the child at `index` below this node
    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// True if `self` is a strict ancestor of `other`
    pub fn contains(&self, other: &GraphOrder) -> bool {
        self.depth() < other.depth() && other.0.starts_with(&self.0)
    }

    /// Decide whether a signal written by `source` must be treated as
    /// feedback when read by `target`.
    ///
    /// A target that encloses the source runs its output stage after the
    /// source, so that edge is forward. A source that encloses the target
    /// only writes after the target has finished, so that edge is feedback.
    /// Otherwise plain pre-order decides; a self-send is feedback.
    pub fn feeds_back(source: &GraphOrder, target: &GraphOrder) -> bool {
        let s = source.as_slice();
        let t = target.as_slice();
        let len = s.len().min(t.len());
        match s.len().cmp(&t.len()) {
            Ordering::Less => t[..len] <= *s,
            Ordering::Greater => *t < s[..len],
            Ordering::Equal => t <= s,
        }
    }
}

impl PartialOrd for GraphOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for GraphOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl fmt::Display for GraphOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, index) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{index}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(path: &[usize]) -> GraphOrder {
        GraphOrder::from_path(path)
    }

    #[test]
    fn test_preorder_comparison() {
        assert!(order(&[0, 0]) < order(&[0, 1]));
        assert!(order(&[0]) < order(&[0, 0]));
        assert!(order(&[0, 5, 2]) < order(&[1]));
    }

    #[test]
    fn test_contains() {
        assert!(order(&[0, 1]).contains(&order(&[0, 1, 0, 3])));
        assert!(!order(&[0, 1]).contains(&order(&[0, 1])));
        assert!(!order(&[0, 1]).contains(&order(&[0, 2, 0])));
    }

    #[test]
    fn test_sibling_sends() {
        // earlier -> later sibling is forward
        assert!(!GraphOrder::feeds_back(&order(&[0, 0]), &order(&[0, 1])));
        // later -> earlier sibling is feedback
        assert!(GraphOrder::feeds_back(&order(&[0, 1]), &order(&[0, 0])));
    }

    #[test]
    fn test_enclosing_target_is_forward() {
        // child track sending into its group track
        assert!(!GraphOrder::feeds_back(
            &order(&[0, 0, 0, 1]),
            &order(&[0, 0])
        ));
    }

    #[test]
    fn test_enclosed_target_is_feedback() {
        // group track sending into one of its children
        assert!(GraphOrder::feeds_back(
            &order(&[0, 0]),
            &order(&[0, 0, 0, 1])
        ));
    }

    #[test]
    fn test_mixed_depths() {
        assert!(!GraphOrder::feeds_back(&order(&[0, 0, 5]), &order(&[0, 1])));
        assert!(GraphOrder::feeds_back(&order(&[0, 2, 0]), &order(&[0, 1])));
        assert!(GraphOrder::feeds_back(&order(&[0, 1]), &order(&[0, 0, 3])));
        assert!(!GraphOrder::feeds_back(&order(&[0, 0]), &order(&[0, 1, 3])));
    }

    #[test]
    fn test_self_send_is_feedback() {
        assert!(GraphOrder::feeds_back(&order(&[0, 2]), &order(&[0, 2])));
    }

    #[test]
    fn test_display() {
        assert_eq!(order(&[1, 0]).to_string(), "(1,0)");
        assert_eq!(GraphOrder::root().to_string(), "()");
    }
}
