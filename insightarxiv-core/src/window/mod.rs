//! Windowed rendering of a long paper list.
//!
//! [`visible_range`] is the pure index math; [`VirtualList`] keeps nodes
//! materialized for exactly that range through a [`NodeRenderer`]. Scroll
//! updates are coalesced until the next animation frame; resizes apply
//! immediately.

pub mod renderer;

pub use renderer::{CardSummary, DetailSection, NodeRenderer, PaperDetail};

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::ops::Range;

use crate::paper::Paper;

/// Geometry of the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Fixed height of one card, in pixels.
    pub item_height: f64,
    /// Extra cards kept on each side of the viewport.
    pub buffer_size: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            item_height: 280.0,
            buffer_size: 5,
        }
    }
}

/// Index range to materialize for a scroll position.
///
/// Always satisfies `start <= end <= total`. Negative or non-finite scroll
/// offsets and viewport heights count as zero; a non-positive item height
/// yields an empty range.
pub fn visible_range(
    scroll_top: f64,
    viewport_height: f64,
    item_height: f64,
    buffer: usize,
    total: usize,
) -> Range<usize> {
    if total == 0 || !(item_height.is_finite() && item_height > 0.0) {
        return 0..0;
    }
    let non_negative = |v: f64| if v.is_finite() && v > 0.0 { v } else { 0.0 };
    // Float to int casts saturate.
    let first = (non_negative(scroll_top) / item_height).floor() as usize;
    let count = (non_negative(viewport_height) / item_height).ceil() as usize;

    let end = first
        .saturating_add(count)
        .saturating_add(buffer)
        .min(total);
    let start = first.saturating_sub(buffer).min(end);
    start..end
}

/// Outcome of one window update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowUpdate {
    pub range: Range<usize>,
    pub created: usize,
    pub destroyed: usize,
}

/// A list that keeps nodes only for the visible window.
pub struct VirtualList<R: NodeRenderer> {
    renderer: R,
    config: WindowConfig,
    papers: Vec<Paper>,
    scroll_top: f64,
    viewport_height: f64,
    pending_scroll: Option<f64>,
    range: Range<usize>,
    nodes: BTreeMap<usize, R::Node>,
    expanded: HashSet<String>,
}

impl<R: NodeRenderer> VirtualList<R> {
    pub fn new(renderer: R, config: WindowConfig, viewport_height: f64) -> Self {
        Self {
            renderer,
            config,
            papers: Vec::new(),
            scroll_top: 0.0,
            viewport_height,
            pending_scroll: None,
            range: 0..0,
            nodes: BTreeMap::new(),
            expanded: HashSet::new(),
        }
    }

    /// Replace the dataset. Existing nodes are disposed since their
    /// indices now refer to different papers.
    pub fn set_papers(&mut self, papers: Vec<Paper>) -> WindowUpdate {
        let destroyed = self.dispose_all();
        self.papers = papers;
        let ids: HashSet<&str> = self.papers.iter().map(|p| p.id.as_str()).collect();
        self.expanded.retain(|id| ids.contains(id.as_str()));
        let mut update = self.render();
        update.destroyed += destroyed;
        update
    }

    /// Record a scroll offset. Returns true when a frame must be scheduled,
    /// i.e. for the first scroll since the last frame.
    pub fn on_scroll(&mut self, scroll_top: f64) -> bool {
        self.pending_scroll.replace(scroll_top).is_none()
    }

    /// Apply the latest pending scroll, if any.
    pub fn on_animation_frame(&mut self) -> Option<WindowUpdate> {
        let scroll_top = self.pending_scroll.take()?;
        self.scroll_top = scroll_top;
        Some(self.render())
    }

    pub fn on_resize(&mut self, viewport_height: f64) -> WindowUpdate {
        self.viewport_height = viewport_height;
        self.render()
    }

    /// Jump so that `index` is the first visible card; returns the new offset.
    pub fn scroll_to_index(&mut self, index: usize) -> f64 {
        let index = index.min(self.papers.len().saturating_sub(1));
        self.pending_scroll = None;
        self.scroll_top = index as f64 * self.config.item_height;
        self.render();
        self.scroll_top
    }

    /// Height of the full list; the scroll container is sized to this.
    pub fn total_height(&self) -> f64 {
        self.papers.len() as f64 * self.config.item_height
    }

    /// Dispose and rebuild every node in the window.
    pub fn refresh(&mut self) -> WindowUpdate {
        let destroyed = self.dispose_all();
        let mut update = self.render();
        update.destroyed += destroyed;
        update
    }

    /// Dispose every node and forget the dataset.
    pub fn destroy(&mut self) {
        self.dispose_all();
        self.papers.clear();
        self.expanded.clear();
        self.pending_scroll = None;
        self.range = 0..0;
    }

    /// Toggle the expanded form of the card at `index`. Returns the new
    /// state, or `None` if the index is out of bounds.
    pub fn toggle_expanded(&mut self, index: usize) -> Option<bool> {
        let paper = self.papers.get(index)?;
        let expanded = if self.expanded.remove(&paper.id) {
            false
        } else {
            self.expanded.insert(paper.id.clone());
            true
        };
        if let Some(node) = self.nodes.get_mut(&index) {
            self.renderer.set_expanded(node, paper, expanded);
        }
        Some(expanded)
    }

    pub fn is_expanded(&self, index: usize) -> bool {
        self.papers
            .get(index)
            .is_some_and(|p| self.expanded.contains(&p.id))
    }

    pub fn visible_range(&self) -> Range<usize> {
        self.range.clone()
    }

    pub fn materialized_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn materialized_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.nodes.keys().copied()
    }

    pub fn node(&self, index: usize) -> Option<&R::Node> {
        self.nodes.get(&index)
    }

    pub fn papers(&self) -> &[Paper] {
        &self.papers
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn renderer_mut(&mut self) -> &mut R {
        &mut self.renderer
    }

    fn render(&mut self) -> WindowUpdate {
        let range = visible_range(
            self.scroll_top,
            self.viewport_height,
            self.config.item_height,
            self.config.buffer_size,
            self.papers.len(),
        );

        // Split the node map into [.. start), [start .. end), [end ..).
        let mut inside = self.nodes.split_off(&range.start);
        let after = inside.split_off(&range.end);
        let before = std::mem::replace(&mut self.nodes, inside);
        let mut destroyed = 0;
        for (_, node) in before.into_iter().chain(after) {
            self.renderer.destroy(node);
            destroyed += 1;
        }

        let mut created = 0;
        for index in range.clone() {
            if self.nodes.contains_key(&index) {
                continue;
            }
            let paper = &self.papers[index];
            let top = index as f64 * self.config.item_height;
            let mut node = self.renderer.create(paper, index, top);
            if self.expanded.contains(&paper.id) {
                self.renderer.set_expanded(&mut node, paper, true);
            }
            self.nodes.insert(index, node);
            created += 1;
        }

        self.range = range.clone();
        WindowUpdate {
            range,
            created,
            destroyed,
        }
    }

    fn dispose_all(&mut self) -> usize {
        let nodes = std::mem::take(&mut self.nodes);
        let count = nodes.len();
        for (_, node) in nodes {
            self.renderer.destroy(node);
        }
        count
    }
}

impl<R: NodeRenderer> Drop for VirtualList<R> {
    fn drop(&mut self) {
        self.dispose_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Card {
        index: usize,
        top: f64,
        expanded: bool,
    }

    #[derive(Default)]
    struct Recorder {
        live: usize,
        created: usize,
        destroyed: usize,
    }

    impl NodeRenderer for Recorder {
        type Node = Card;

        fn create(&mut self, _paper: &Paper, index: usize, top: f64) -> Card {
            self.live += 1;
            self.created += 1;
            Card {
                index,
                top,
                expanded: false,
            }
        }

        fn destroy(&mut self, _node: Card) {
            self.live -= 1;
            self.destroyed += 1;
        }

        fn set_expanded(&mut self, node: &mut Card, _paper: &Paper, expanded: bool) {
            node.expanded = expanded;
        }
    }

    fn papers(n: usize) -> Vec<Paper> {
        (0..n)
            .map(|i| Paper::new(format!("2507.{i:05}"), format!("Paper {i}")))
            .collect()
    }

    fn list(n: usize, viewport: f64) -> VirtualList<Recorder> {
        let mut list = VirtualList::new(Recorder::default(), WindowConfig::default(), viewport);
        list.set_papers(papers(n));
        list
    }

    #[test]
    fn test_visible_range_formula() {
        // start = 10, count = 3 -> [5, 18)
        assert_eq!(visible_range(2800.0, 800.0, 280.0, 5, 1000), 5..18);
        assert_eq!(visible_range(0.0, 800.0, 280.0, 5, 1000), 0..8);
        assert_eq!(visible_range(0.0, 800.0, 280.0, 5, 4), 0..4);
    }

    #[test]
    fn test_visible_range_edge_cases() {
        assert_eq!(visible_range(100.0, 800.0, 280.0, 5, 0), 0..0);
        assert_eq!(visible_range(-500.0, 560.0, 280.0, 0, 10), 0..2);
        assert_eq!(visible_range(f64::NAN, 560.0, 280.0, 0, 10), 0..2);
        assert_eq!(visible_range(0.0, 560.0, 0.0, 5, 10), 0..0);
        // Scrolled past the end: empty, start clamped to end.
        let r = visible_range(1.0e9, 800.0, 280.0, 5, 10);
        assert!(r.start <= r.end && r.end <= 10);
        assert_eq!(r, 10..10);
        assert_eq!(visible_range(f64::MAX, 800.0, 280.0, 5, 10), 10..10);
    }

    #[test]
    fn test_nodes_follow_scroll() {
        let mut list = list(1000, 800.0);
        assert_eq!(list.visible_range(), 0..8);
        assert_eq!(list.materialized_count(), 8);
        assert_eq!(list.node(3).unwrap().top, 840.0);

        assert!(list.on_scroll(2800.0));
        // Further scrolls in the same frame are coalesced.
        assert!(!list.on_scroll(5600.0));
        let update = list.on_animation_frame().unwrap();
        assert_eq!(update.range, 15..28);
        assert_eq!(update.destroyed, 8);
        assert_eq!(update.created, 13);
        assert_eq!(list.materialized_count(), 13);
        assert!(list.materialized_indices().all(|i| (15..28).contains(&i)));
        assert!(list.on_animation_frame().is_none());
        assert_eq!(list.renderer().live, 13);
    }

    #[test]
    fn test_overlapping_scroll_keeps_existing_nodes() {
        let mut list = list(1000, 800.0);
        list.on_scroll(560.0);
        let update = list.on_animation_frame().unwrap();
        // start = 2 -> [0, 10): nodes 0..8 survive.
        assert_eq!(update.range, 0..10);
        assert_eq!(update.created, 2);
        assert_eq!(update.destroyed, 0);
    }

    #[test]
    fn test_resize_is_immediate() {
        let mut list = list(100, 800.0);
        let update = list.on_resize(1400.0);
        assert_eq!(update.range, 0..10);
        assert_eq!(list.materialized_count(), 10);
    }

    #[test]
    fn test_set_papers_replaces_nodes() {
        let mut list = list(100, 800.0);
        let update = list.set_papers(papers(3));
        assert_eq!(update.destroyed, 8);
        assert_eq!(update.range, 0..3);
        assert_eq!(list.materialized_count(), 3);
        assert_eq!(list.total_height(), 840.0);
    }

    #[test]
    fn test_scroll_to_index_and_refresh() {
        let mut list = list(100, 800.0);
        assert_eq!(list.scroll_to_index(50), 14_000.0);
        assert_eq!(list.visible_range(), 45..58);
        assert_eq!(list.scroll_to_index(10_000), 99.0 * 280.0);

        let before = list.renderer().created;
        let update = list.refresh();
        assert_eq!(update.destroyed, update.created);
        assert_eq!(list.renderer().created, before + update.created);
    }

    #[test]
    fn test_expanded_state_survives_rewindowing() {
        let mut list = list(100, 800.0);
        assert_eq!(list.toggle_expanded(2), Some(true));
        assert!(list.node(2).unwrap().expanded);

        list.scroll_to_index(60);
        assert!(list.node(2).is_none());
        list.scroll_to_index(0);
        assert!(list.node(2).unwrap().expanded);

        assert_eq!(list.toggle_expanded(2), Some(false));
        assert!(!list.is_expanded(2));
        assert_eq!(list.toggle_expanded(500), None);
    }

    #[test]
    fn test_destroy_disposes_everything() {
        let mut list = list(100, 800.0);
        list.destroy();
        assert_eq!(list.materialized_count(), 0);
        assert_eq!(list.renderer().live, 0);
        assert!(list.papers().is_empty());
    }
}
