//! Property-based tests for core components using proptest.

use proptest::prelude::*;

use insightarxiv_core::lru_cache::BoundedCache;
use insightarxiv_core::ndjson::{StreamDecoder, decode_all};
use insightarxiv_core::paper::{MonthKey, Paper};
use insightarxiv_core::window::{NodeRenderer, VirtualList, WindowConfig, visible_range};
use insightarxiv_core::worker::{BatchBounds, calculate_batch_size};

// --- Render window properties ---

proptest! {
    #[test]
    fn window_range_stays_in_bounds(
        scroll_top in -1_000.0f64..1_000_000.0,
        viewport in 0.0f64..5_000.0,
        item_height in 1.0f64..1_000.0,
        buffer in 0usize..20,
        total in 0usize..10_000,
    ) {
        let range = visible_range(scroll_top, viewport, item_height, buffer, total);
        prop_assert!(range.start <= range.end);
        prop_assert!(range.end <= total);
    }

    #[test]
    fn window_materializes_exactly_the_range(
        total in 0usize..300,
        scrolls in prop::collection::vec(0.0f64..100_000.0, 1..10),
    ) {
        let papers: Vec<Paper> = (0..total)
            .map(|i| Paper::new(format!("2507.{i:05}"), format!("Paper {i}")))
            .collect();
        let mut list = VirtualList::new(Counting::default(), WindowConfig::default(), 800.0);
        list.set_papers(papers);
        for scroll in scrolls {
            list.on_scroll(scroll);
            list.on_animation_frame();
            let range = list.visible_range();
            prop_assert!(range.end <= total);
            prop_assert_eq!(list.materialized_count(), range.end - range.start);
            prop_assert_eq!(list.renderer().live, list.materialized_count());
        }
    }
}

#[derive(Default)]
struct Counting {
    live: usize,
}

impl NodeRenderer for Counting {
    type Node = usize;

    fn create(&mut self, _paper: &Paper, index: usize, _top: f64) -> usize {
        self.live += 1;
        index
    }

    fn destroy(&mut self, _node: usize) {
        self.live -= 1;
    }
}

// --- Batch sizing properties ---

proptest! {
    #[test]
    fn batch_size_within_bounds(
        total in 0usize..200_000,
        min in 1usize..500,
        span in 0usize..5_000,
        base in 1usize..5_000,
        async_images in any::<bool>(),
    ) {
        let bounds = BatchBounds { base, min, max: min + span };
        let size = calculate_batch_size(total, bounds, async_images);
        prop_assert!(size >= bounds.min);
        prop_assert!(size <= bounds.max);
    }

    #[test]
    fn small_jobs_never_get_bigger_batches(
        small in 0usize..1_000,
        large in 20_000usize..200_000,
    ) {
        let bounds = BatchBounds { base: 1000, min: 100, max: 2000 };
        prop_assert!(
            calculate_batch_size(small, bounds, false) <= calculate_batch_size(large, bounds, false)
        );
    }
}

// --- Streamed parsing properties ---

fn arb_papers() -> impl Strategy<Value = Vec<Paper>> {
    prop::collection::vec(("[0-9]{5}", "[a-zA-Z ]{0,30}"), 0..30).prop_map(|rows| {
        rows.into_iter()
            .map(|(n, title)| Paper::new(format!("2507.{n}"), title))
            .collect()
    })
}

fn stream_in_chunks(bytes: &[u8], chunk: usize) -> Vec<Paper> {
    let mut decoder = StreamDecoder::<Paper>::new();
    let mut out = Vec::new();
    for piece in bytes.chunks(chunk) {
        out.extend(decoder.push(piece));
    }
    out.extend(decoder.finish().unwrap().records);
    out
}

proptest! {
    #[test]
    fn streamed_lines_match_whole_file(papers in arb_papers(), chunk in 1usize..64) {
        let body: String = papers
            .iter()
            .map(|p| serde_json::to_string(p).unwrap() + "\n")
            .collect();
        let whole: Vec<Paper> = decode_all(body.as_bytes()).unwrap().records;
        prop_assert_eq!(&whole, &papers);
        prop_assert_eq!(stream_in_chunks(body.as_bytes(), chunk), whole);
    }

    #[test]
    fn streamed_array_matches_whole_file(papers in arb_papers(), chunk in 1usize..64) {
        let body = serde_json::to_string(&papers).unwrap();
        let whole: Vec<Paper> = decode_all(body.as_bytes()).unwrap().records;
        prop_assert_eq!(stream_in_chunks(body.as_bytes(), chunk), whole);
    }
}

// --- LRU properties ---

proptest! {
    #[test]
    fn lru_never_exceeds_capacity(
        capacity in 1usize..50,
        ops in prop::collection::vec((0u16..100, any::<bool>()), 0..500),
    ) {
        let mut cache = BoundedCache::new(capacity);
        for (key, is_get) in ops {
            if is_get {
                cache.get(&key);
            } else {
                cache.put(key, u32::from(key));
            }
            prop_assert!(cache.len() <= capacity);
        }
    }

    #[test]
    fn lru_get_protects_from_next_eviction(capacity in 2usize..30) {
        let mut cache = BoundedCache::new(capacity);
        for key in 0..capacity {
            cache.put(key, key);
        }
        prop_assert!(cache.get(&0).is_some());
        let evicted = cache.put(capacity, capacity);
        prop_assert_eq!(evicted, Some((1, 1)));
        prop_assert!(cache.contains(&0));
    }
}

// --- Month key properties ---

proptest! {
    #[test]
    fn month_key_from_id_prefix(year in 0u32..100, month in 1u32..=12, n in 0u32..100_000) {
        let id = format!("{year:02}{month:02}.{n:05}");
        let key = MonthKey::from_paper_id(&id).unwrap();
        prop_assert_eq!(key.as_str(), format!("20{year:02}-{month:02}"));
        prop_assert_eq!(key.id_prefix(), format!("{year:02}{month:02}"));
    }
}
