//! A packed, read-only R-tree.
//!
//! Built with sort-tile-recursive bulk loading; nodes live in an arena
//! vector and reference children by index. The tree is rebuilt from the
//! rects table after a change rather than updated in place.

use crate::error::DbResult;
use stratadb_store::{Rowid, StoreError};

/// Maximum entries per node.
const NODE_CAPACITY: usize = 16;

/// An axis-aligned bounding rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    /// Minimum x coordinate.
    pub min_x: f64,
    /// Minimum y coordinate.
    pub min_y: f64,
    /// Maximum x coordinate.
    pub max_x: f64,
    /// Maximum y coordinate.
    pub max_y: f64,
}

impl Rect {
    /// Creates a rectangle from its corner coordinates.
    #[must_use]
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Returns true if the rectangles overlap (edges included).
    #[must_use]
    pub fn intersects(&self, other: &Rect) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    /// Returns true if `other` lies fully within this rectangle.
    #[must_use]
    pub fn contains(&self, other: &Rect) -> bool {
        self.min_x <= other.min_x
            && self.min_y <= other.min_y
            && self.max_x >= other.max_x
            && self.max_y >= other.max_y
    }

    fn union(&self, other: &Rect) -> Rect {
        Rect {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    fn center_x(&self) -> f64 {
        (self.min_x + self.max_x) / 2.0
    }

    fn center_y(&self) -> f64 {
        (self.min_y + self.max_y) / 2.0
    }

    pub(crate) fn encode(&self) -> [u8; 32] {
        let mut buf = [0u8; 32];
        buf[0..8].copy_from_slice(&self.min_x.to_le_bytes());
        buf[8..16].copy_from_slice(&self.min_y.to_le_bytes());
        buf[16..24].copy_from_slice(&self.max_x.to_le_bytes());
        buf[24..32].copy_from_slice(&self.max_y.to_le_bytes());
        buf
    }

    pub(crate) fn decode(bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() != 32 {
            return Err(StoreError::corruption("rect must be 32 bytes").into());
        }
        let field = |range: std::ops::Range<usize>| {
            f64::from_le_bytes(bytes[range].try_into().unwrap_or([0; 8]))
        };
        Ok(Self {
            min_x: field(0..8),
            min_y: field(8..16),
            max_x: field(16..24),
            max_y: field(24..32),
        })
    }
}

enum NodeContent {
    Leaf(Vec<(Rect, Rowid)>),
    Inner(Vec<usize>),
}

struct Node {
    bounds: Rect,
    content: NodeContent,
}

/// A packed R-tree over `(Rect, Rowid)` entries.
pub struct RTree {
    nodes: Vec<Node>,
    root: Option<usize>,
    len: usize,
}

impl RTree {
    /// Builds a tree from entries using sort-tile-recursive packing.
    #[must_use]
    pub fn bulk_load(mut entries: Vec<(Rect, Rowid)>) -> Self {
        let len = entries.len();
        if entries.is_empty() {
            return Self {
                nodes: Vec::new(),
                root: None,
                len,
            };
        }

        let mut nodes: Vec<Node> = Vec::new();

        // Tile the entries: sort by center x, slice, sort slices by center
        // y, pack runs of NODE_CAPACITY into leaves.
        entries.sort_by(|a, b| a.0.center_x().total_cmp(&b.0.center_x()));
        let leaf_count = entries.len().div_ceil(NODE_CAPACITY);
        let slice_count = (leaf_count as f64).sqrt().ceil() as usize;
        let slice_size = entries.len().div_ceil(slice_count.max(1));

        let mut level: Vec<usize> = Vec::new();
        for slice in entries.chunks_mut(slice_size.max(1)) {
            slice.sort_by(|a, b| a.0.center_y().total_cmp(&b.0.center_y()));
            for run in slice.chunks(NODE_CAPACITY) {
                let bounds = run
                    .iter()
                    .map(|(rect, _)| *rect)
                    .reduce(|a, b| a.union(&b))
                    .unwrap_or(Rect::new(0.0, 0.0, 0.0, 0.0));
                nodes.push(Node {
                    bounds,
                    content: NodeContent::Leaf(run.to_vec()),
                });
                level.push(nodes.len() - 1);
            }
        }

        // Pack upwards until one root remains.
        while level.len() > 1 {
            let mut parents: Vec<usize> = Vec::new();
            for children in level.chunks(NODE_CAPACITY) {
                let bounds = children
                    .iter()
                    .map(|&child| nodes[child].bounds)
                    .reduce(|a, b| a.union(&b))
                    .unwrap_or(Rect::new(0.0, 0.0, 0.0, 0.0));
                nodes.push(Node {
                    bounds,
                    content: NodeContent::Inner(children.to_vec()),
                });
                parents.push(nodes.len() - 1);
            }
            level = parents;
        }

        let root = level.first().copied();
        Self { nodes, root, len }
    }

    /// Returns the number of indexed entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the tree has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the rowids whose rectangle intersects `query`.
    #[must_use]
    pub fn intersecting(&self, query: &Rect) -> Vec<Rowid> {
        self.search(query, |rect| rect.intersects(query))
    }

    /// Returns the rowids whose rectangle lies fully within `query`.
    #[must_use]
    pub fn within(&self, query: &Rect) -> Vec<Rowid> {
        self.search(query, |rect| query.contains(rect))
    }

    fn search(&self, query: &Rect, accept: impl Fn(&Rect) -> bool) -> Vec<Rowid> {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut stack = vec![root];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            if !node.bounds.intersects(query) {
                continue;
            }
            match &node.content {
                NodeContent::Leaf(entries) => {
                    for (rect, rowid) in entries {
                        if accept(rect) {
                            out.push(*rowid);
                        }
                    }
                }
                NodeContent::Inner(children) => stack.extend(children.iter().copied()),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f64, y: f64) -> Rect {
        Rect::new(x, y, x + 1.0, y + 1.0)
    }

    #[test]
    fn rect_encode_roundtrip() {
        let rect = Rect::new(-1.5, 2.25, 3.0, 4.75);
        assert_eq!(Rect::decode(&rect.encode()).unwrap(), rect);
        assert!(Rect::decode(&[0u8; 31]).is_err());
    }

    #[test]
    fn rect_relations() {
        let a = Rect::new(0.0, 0.0, 10.0, 10.0);
        let b = Rect::new(5.0, 5.0, 15.0, 15.0);
        let c = Rect::new(11.0, 11.0, 12.0, 12.0);
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
        assert!(a.contains(&Rect::new(1.0, 1.0, 2.0, 2.0)));
        assert!(!a.contains(&b));
    }

    #[test]
    fn empty_tree() {
        let tree = RTree::bulk_load(Vec::new());
        assert!(tree.is_empty());
        assert!(tree.intersecting(&unit(0.0, 0.0)).is_empty());
    }

    #[test]
    fn search_matches_linear_scan() {
        // A 20x20 grid of unit squares.
        let mut entries = Vec::new();
        let mut id = 1i64;
        for x in 0..20 {
            for y in 0..20 {
                entries.push((unit(f64::from(x) * 2.0, f64::from(y) * 2.0), Rowid::new(id)));
                id += 1;
            }
        }
        let tree = RTree::bulk_load(entries.clone());
        assert_eq!(tree.len(), 400);

        let query = Rect::new(3.0, 3.0, 12.0, 9.0);
        let mut from_tree = tree.intersecting(&query);
        from_tree.sort();
        let mut from_scan: Vec<Rowid> = entries
            .iter()
            .filter(|(rect, _)| rect.intersects(&query))
            .map(|&(_, rowid)| rowid)
            .collect();
        from_scan.sort();
        assert_eq!(from_tree, from_scan);

        let mut contained = tree.within(&query);
        contained.sort();
        let mut contained_scan: Vec<Rowid> = entries
            .iter()
            .filter(|(rect, _)| query.contains(rect))
            .map(|&(_, rowid)| rowid)
            .collect();
        contained_scan.sort();
        assert_eq!(contained, contained_scan);
    }
}
