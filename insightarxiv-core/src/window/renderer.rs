//! Node materialization seam and the content a card shows.

use serde::Serialize;

use crate::paper::Paper;

/// Creates and disposes the node for one list entry.
///
/// Implementations own all side effects; [`VirtualList`](super::VirtualList)
/// only decides which indices have a node.
pub trait NodeRenderer {
    type Node;

    /// Build the node for `paper` at list `index`, positioned at `top`.
    fn create(&mut self, paper: &Paper, index: usize, top: f64) -> Self::Node;

    /// Dispose a node that left the window.
    fn destroy(&mut self, node: Self::Node);

    /// Flip a node between its card and expanded form.
    fn set_expanded(&mut self, node: &mut Self::Node, paper: &Paper, expanded: bool) {
        let _ = (node, paper, expanded);
    }
}

/// Compact card content: the fields a collapsed card shows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CardSummary<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub zh_title: Option<&'a str>,
    pub date: Option<&'a str>,
    /// At most three.
    pub categories: &'a [String],
    /// At most five.
    pub keywords: &'a [String],
    pub tldr: Option<&'a str>,
}

impl<'a> CardSummary<'a> {
    pub fn of(paper: &'a Paper) -> Self {
        Self {
            id: &paper.id,
            title: &paper.title,
            zh_title: paper.zh_title.as_deref(),
            date: paper.date.as_deref(),
            categories: &paper.categories[..paper.categories.len().min(3)],
            keywords: &paper.keywords[..paper.keywords.len().min(5)],
            tldr: paper.tldr.as_deref(),
        }
    }
}

/// Section of an expanded card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetailSection {
    Abstract,
    Translation,
    Tldr,
    Motivation,
    Method,
    Results,
    Conclusion,
}

impl DetailSection {
    pub fn label(self) -> &'static str {
        match self {
            Self::Abstract => "Abstract",
            Self::Translation => "摘要翻译",
            Self::Tldr => "TL;DR",
            Self::Motivation => "研究动机",
            Self::Method => "研究方法",
            Self::Results => "研究结果",
            Self::Conclusion => "研究结论",
        }
    }
}

/// Content of an expanded card: every non-empty section, in display order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaperDetail {
    pub id: String,
    pub title: String,
    pub authors: String,
    pub url: Option<String>,
    pub pdf_url: Option<String>,
    pub sections: Vec<(DetailSection, String)>,
}

impl PaperDetail {
    pub fn of(paper: &Paper) -> Self {
        let candidates = [
            (DetailSection::Abstract, Some(&paper.abstract_text)),
            (DetailSection::Translation, paper.translation.as_ref()),
            (DetailSection::Tldr, paper.tldr.as_ref()),
            (DetailSection::Motivation, paper.motivation.as_ref()),
            (DetailSection::Method, paper.method.as_ref()),
            (DetailSection::Results, paper.results.as_ref()),
            (DetailSection::Conclusion, paper.conclusion.as_ref()),
        ];
        let sections = candidates
            .into_iter()
            .filter_map(|(section, text)| {
                text.map(|t| t.trim())
                    .filter(|t| !t.is_empty())
                    .map(|t| (section, t.to_string()))
            })
            .collect();

        Self {
            id: paper.id.clone(),
            title: paper.title.clone(),
            authors: paper.authors.clone(),
            url: paper.url.clone(),
            pdf_url: paper.pdf_url.clone(),
            sections,
        }
    }

    pub fn section(&self, section: DetailSection) -> Option<&str> {
        self.sections
            .iter()
            .find(|(s, _)| *s == section)
            .map(|(_, text)| text.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_summary_truncates_lists() {
        let mut paper = Paper::new("2507.00001", "Title");
        paper.categories = vec!["cs.LG".into(), "cs.CL".into(), "cs.AI".into(), "stat.ML".into()];
        paper.keywords = (0..8).map(|i| format!("k{i}")).collect();
        let card = CardSummary::of(&paper);
        assert_eq!(card.categories.len(), 3);
        assert_eq!(card.keywords.len(), 5);
        assert_eq!(card.date, None);
    }

    #[test]
    fn test_detail_skips_empty_sections() {
        let mut paper = Paper::new("2507.00001", "Title");
        paper.abstract_text = "We study things.".into();
        paper.method = Some("  ".into());
        paper.results = Some("It works.".into());
        let detail = PaperDetail::of(&paper);
        let order: Vec<_> = detail.sections.iter().map(|(s, _)| *s).collect();
        assert_eq!(order, vec![DetailSection::Abstract, DetailSection::Results]);
        assert_eq!(detail.section(DetailSection::Results), Some("It works."));
        assert_eq!(detail.section(DetailSection::Method), None);
    }
}
