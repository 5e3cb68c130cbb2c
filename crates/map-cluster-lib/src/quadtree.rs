//! Quadtree over entry bounds for fast viewport queries
//!
//! Each zoom level of a snapshot owns one of these. Items are stored at the deepest
//! node whose box fully contains their bounds; leaves split once they hold more than
//! [`NODE_CAPACITY`] items.

use crate::utils;
use geo::{Coord, Rect};

/// Maximum depth of the quadtree to prevent infinite recursion
const MAX_DEPTH: u32 = 20;

/// Number of items a leaf holds before it subdivides
const NODE_CAPACITY: usize = 16;

/// Root container for the per-level spatial index
#[derive(Debug, Clone)]
pub(crate) struct Quadtree {
    /// Root node covering the whole world in geographic degrees
    root: QuadtreeNode,
    len: usize,
}

/// A single node in the quadtree
#[derive(Debug, Clone)]
struct QuadtreeNode {
    /// Bounding box in degrees (`x = lng`, `y = lat`)
    bounding_box: Rect<f64>,
    /// Depth level in the tree (0 = root)
    level: u32,
    /// Items whose bounds do not fit in a single child
    items: Vec<(u32, Rect<f64>)>,
    /// Child nodes (NW, NE, SW, SE) if subdivided
    children: Option<Box<[QuadtreeNode; 4]>>,
}

impl Default for Quadtree {
    fn default() -> Self {
        Self::new()
    }
}

impl Quadtree {
    /// Create a new empty quadtree with world bounds
    pub(crate) fn new() -> Self {
        Self {
            root: QuadtreeNode::new(utils::world_bounds(), 0),
            len: 0,
        }
    }

    /// Build a quadtree from `(item, bounds)` pairs
    pub(crate) fn from_items(items: impl IntoIterator<Item = (u32, Rect<f64>)>) -> Self {
        let mut tree = Self::new();
        for (item, bounds) in items {
            tree.insert(item, bounds);
        }
        tree
    }

    pub(crate) fn insert(&mut self, item: u32, bounds: Rect<f64>) {
        self.root.insert(item, bounds);
        self.len += 1;
    }

    /// Items whose bounds intersect `viewport`, appended to `results`
    pub(crate) fn query(&self, viewport: Rect<f64>, results: &mut Vec<u32>) {
        self.root.query(viewport, results);
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl QuadtreeNode {
    fn new(bounding_box: Rect<f64>, level: u32) -> Self {
        Self {
            bounding_box,
            level,
            items: Vec::new(),
            children: None,
        }
    }

    /// Subdivide this node into 4 children
    fn subdivide(&mut self) {
        if self.children.is_some() {
            return; // Already subdivided
        }

        let min = self.bounding_box.min();
        let max = self.bounding_box.max();
        let mid_x = (min.x + max.x) / 2.0;
        let mid_y = (min.y + max.y) / 2.0;

        let child_level = self.level + 1;

        // Create 4 children: NW, NE, SW, SE
        let nw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: mid_y }, Coord { x: mid_x, y: max.y }),
            child_level,
        );
        let ne = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: mid_y }, Coord { x: max.x, y: max.y }),
            child_level,
        );
        let sw = QuadtreeNode::new(
            Rect::new(Coord { x: min.x, y: min.y }, Coord { x: mid_x, y: mid_y }),
            child_level,
        );
        let se = QuadtreeNode::new(
            Rect::new(Coord { x: mid_x, y: min.y }, Coord { x: max.x, y: mid_y }),
            child_level,
        );

        self.children = Some(Box::new([nw, ne, sw, se]));

        // Push down every item that now fits a child
        let items = std::mem::take(&mut self.items);
        for (item, bounds) in items {
            self.place(item, bounds);
        }
    }

    /// Store an item in the child that fully contains it, or here
    fn place(&mut self, item: u32, bounds: Rect<f64>) {
        if let Some(children) = &mut self.children {
            if let Some(child) = children
                .iter_mut()
                .find(|child| utils::rect_contains(child.bounding_box, bounds))
            {
                child.insert(item, bounds);
                return;
            }
        }
        self.items.push((item, bounds));
    }

    fn insert(&mut self, item: u32, bounds: Rect<f64>) {
        if self.children.is_some() {
            self.place(item, bounds);
            return;
        }

        self.items.push((item, bounds));
        if self.items.len() > NODE_CAPACITY && self.level < MAX_DEPTH {
            self.subdivide();
        }
    }

    /// Query this node and its children for items intersecting the viewport
    fn query(&self, viewport: Rect<f64>, results: &mut Vec<u32>) {
        // Frustum culling - check if this node intersects the viewport
        if !utils::rect_intersects(self.bounding_box, viewport) {
            return;
        }

        results.extend(
            self.items
                .iter()
                .filter(|(_, bounds)| utils::rect_intersects(*bounds, viewport))
                .map(|(item, _)| *item),
        );

        // Recurse into children
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query(viewport, results);
            }
        }
    }
}
