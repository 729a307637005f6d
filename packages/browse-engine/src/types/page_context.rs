//! `PageContext` (§3). Computed at most once per page visit.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageType {
    Login,
    Search,
    Form,
    List,
    Detail,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageContext {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub language: Option<String>,
    pub page_type: PageType,
    pub available_selectors: Vec<String>,
    pub content_length: usize,
    pub has_form: bool,
    pub has_pagination: bool,
    pub has_table: bool,
}

impl PageContext {
    /// Cheap heuristic classification of `page_type` from structural
    /// signals gathered during extraction — login forms, search inputs,
    /// and list/detail page shape are distinguished by selector presence
    /// and content density rather than any ML signal.
    pub fn classify(
        url: String,
        domain: String,
        title: Option<String>,
        available_selectors: Vec<String>,
        content_length: usize,
        has_form: bool,
        has_pagination: bool,
        has_table: bool,
    ) -> Self {
        let page_type = if available_selectors
            .iter()
            .any(|s| s.contains("password") || s.contains("login"))
        {
            PageType::Login
        } else if available_selectors.iter().any(|s| s.contains("search")) {
            PageType::Search
        } else if has_form {
            PageType::Form
        } else if has_pagination || content_length > 5_000 {
            PageType::List
        } else if content_length > 500 {
            PageType::Detail
        } else {
            PageType::Unknown
        };

        Self {
            url,
            domain,
            title,
            language: None,
            page_type,
            available_selectors,
            content_length,
            has_form,
            has_pagination,
            has_table,
        }
    }

    /// Jaccard-style overlap used by Procedural Memory's skill-similarity
    /// scoring (§4.10, weight 0.3 of the composite similarity).
    pub fn selector_overlap(&self, required: &[String]) -> f32 {
        if required.is_empty() {
            return 1.0;
        }
        let matched = required
            .iter()
            .filter(|r| self.available_selectors.contains(r))
            .count();
        matched as f32 / required.len() as f32
    }
}
