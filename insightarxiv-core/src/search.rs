//! Token search index over paper text.
//!
//! Indexed text is the lowercased title, abstract, Chinese title,
//! translation, keywords and TL;DR. Tokens are ASCII words of three or more
//! letters that are not stop words; each keyword is also indexed whole.
//! A query matches the papers containing every one of its tokens.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::paper::Paper;

/// Words too common in abstracts to be useful search terms.
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
    "this", "that", "these", "those", "is", "are", "was", "were", "be", "been", "being", "have",
    "has", "had", "do", "does", "did", "will", "would", "could", "should", "may", "might",
    "must", "can", "shall", "we", "they", "you", "it", "he", "she", "his", "her", "its",
    "their", "our", "your", "my", "me", "him", "them", "us", "from", "up", "out", "down",
    "off", "over", "under", "again", "further", "then", "once", "here", "there", "when",
    "where", "why", "how", "all", "any", "both", "each", "few", "more", "most", "other",
    "some", "such", "no", "nor", "not", "only", "own", "same", "so", "than", "too", "very",
    "just", "now", "also", "however", "although", "though", "paper", "method", "approach",
    "model", "result", "results", "show", "shows", "using", "used", "use", "based", "propose",
    "proposed", "algorithm", "algorithms",
];

/// Splits text into index tokens.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    word: Regex,
    stop_words: HashSet<&'static str>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            word: Regex::new(r"\b[a-z]{3,}\b").expect("word pattern is valid"),
            stop_words: STOP_WORDS.iter().copied().collect(),
        }
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }

    /// Distinct tokens of `text`, in first-seen order.
    pub fn tokens(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut seen = HashSet::new();
        self.word
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|w| !self.is_stop_word(w))
            .filter(|w| seen.insert(*w))
            .map(str::to_string)
            .collect()
    }

    /// Every index term for `paper`: text tokens plus whole keywords.
    pub fn paper_terms(&self, paper: &Paper) -> BTreeSet<String> {
        let keywords = paper.keywords.join(" ");
        let sources = [
            Some(paper.title.as_str()),
            Some(paper.abstract_text.as_str()),
            paper.zh_title.as_deref(),
            paper.translation.as_deref(),
            Some(keywords.as_str()),
            paper.tldr.as_deref(),
        ];
        let text = sources
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        let mut terms: BTreeSet<String> = self.tokens(&text).into_iter().collect();
        for keyword in &paper.keywords {
            let keyword = keyword.trim().to_lowercase();
            if !keyword.is_empty() && !self.is_stop_word(&keyword) {
                terms.insert(keyword);
            }
        }
        terms
    }
}

/// Inverted index from term to paper ids.
#[derive(Debug, Clone, Default)]
pub struct SearchIndex {
    tokenizer: Tokenizer,
    postings: HashMap<String, BTreeSet<String>>,
}

impl SearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index from its serialized `term -> ids` form.
    pub fn from_postings(postings: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            tokenizer: Tokenizer::new(),
            postings: postings
                .into_iter()
                .map(|(term, ids)| (term, ids.into_iter().collect()))
                .collect(),
        }
    }

    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    pub fn insert(&mut self, paper: &Paper) {
        for term in self.tokenizer.paper_terms(paper) {
            self.postings
                .entry(term)
                .or_default()
                .insert(paper.id.clone());
        }
    }

    pub fn remove(&mut self, paper: &Paper) {
        for term in self.tokenizer.paper_terms(paper) {
            if let Some(ids) = self.postings.get_mut(&term) {
                ids.remove(&paper.id);
                if ids.is_empty() {
                    self.postings.remove(&term);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.postings.clear();
    }

    /// Number of distinct terms.
    pub fn term_count(&self) -> usize {
        self.postings.len()
    }

    pub fn postings(&self, term: &str) -> Option<&BTreeSet<String>> {
        self.postings.get(term)
    }

    /// Ids of papers matching every token of `query`, plus papers carrying
    /// the whole query as a keyword. Sorted by id.
    pub fn search(&self, query: &str) -> Vec<String> {
        let mut hits: BTreeSet<String> = BTreeSet::new();

        let tokens = self.tokenizer.tokens(query);
        if !tokens.is_empty() {
            let mut lists: Vec<&BTreeSet<String>> = Vec::with_capacity(tokens.len());
            for token in &tokens {
                match self.postings.get(token) {
                    Some(ids) => lists.push(ids),
                    None => {
                        lists.clear();
                        break;
                    }
                }
            }
            // Intersect starting from the shortest list.
            lists.sort_by_key(|ids| ids.len());
            if let Some((first, rest)) = lists.split_first() {
                hits.extend(
                    first
                        .iter()
                        .filter(|id| rest.iter().all(|ids| ids.contains(*id)))
                        .cloned(),
                );
            }
        }

        let phrase = query.trim().to_lowercase();
        if let Some(ids) = self.postings.get(&phrase) {
            hits.extend(ids.iter().cloned());
        }
        hits.into_iter().collect()
    }

    /// Serialized form keeping only terms found in at least `min_frequency` papers.
    pub fn to_filtered(&self, min_frequency: usize) -> BTreeMap<String, Vec<String>> {
        self.postings
            .iter()
            .filter(|(_, ids)| ids.len() >= min_frequency)
            .map(|(term, ids)| (term.clone(), ids.iter().cloned().collect()))
            .collect()
    }
}
