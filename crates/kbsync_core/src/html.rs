use std::collections::HashMap;
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::diagnostics::{DiagnosticsLog, steps};
use crate::mirror::ImageMirror;

static HEADING_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<(/?)h([1-6])([^>]*)>").unwrap());
static ANCHOR_WITH_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<a\s+([^>]*)name=['"]([^'"]*)['"]([^>]*)>"#).unwrap());
static MONOSPACE_SPAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<span[^>]*style="[^"]*\bfont-family\s*:\s*(Courier|Courier New)[^"]*"[^>]*>(.*?)</span>"#)
        .unwrap()
});
static STYLED_OL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)<ol[^>]*style=['"]([^'"]+)['"][^>]*>"#).unwrap());
static LIST_STYLE_TYPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"list-style-type:\s*([^;]*)").unwrap());
static HIDDEN_OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<([a-z][a-z0-9]*)\b[^>]*style="[^"]*display:\s*none[^"]*"[^>]*>"#).unwrap()
});
static STYLE_ATTRIBUTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#" style="[^"]*""#).unwrap());
static EMPTY_SPAN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<span[^>]*></span>").unwrap());
static EMPTY_BLOCKQUOTE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<blockquote[^>]*></blockquote>").unwrap());
static EMPTY_UL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<ul[^>]*></ul>").unwrap());
static IMG_PRESENTATION_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)<img([^>]*)\s(?:border|align)\s*=\s*"[^"]*""#).unwrap()
});
static TABLE_OPEN_TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<table[^>]*>").unwrap());
static FONT_PAIR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<font[^>]*>(.*?)</font>").unwrap());

/// Per-fragment context for the normalization pipeline.
pub struct NormalizeContext<'a> {
    pub title: &'a str,
    pub external_id: &'a str,
    pub diagnostics: &'a mut DiagnosticsLog,
    /// Present only when the request runs in development mode.
    pub mirror: Option<&'a mut ImageMirror>,
}

/// Run every transform in its fixed order. Each step is idempotent and
/// tolerates malformed markup; a step that cannot apply returns its input
/// unchanged (recording a diagnostic where something actually failed), so
/// the pipeline never aborts.
pub fn normalize(html: &str, ctx: &mut NormalizeContext<'_>) -> String {
    let mut content = strip_duplicate_title(html, ctx.title, ctx.external_id, ctx.diagnostics);
    content = demote_headings(&content);
    content = backfill_anchor_ids(&content);
    content = monospace_spans_to_code(&content);
    content = classify_ordered_lists(&content);
    content = remove_hidden_content(&content);
    content = strip_style_attributes(&content);
    content = bold_to_strong(&content);
    content = remove_empty_tags(&content);
    content = strip_image_attributes(&content);
    content = strip_table_attributes(&content);
    content = unwrap_font_tags(&content);
    if let Some(mirror) = ctx.mirror.as_deref_mut() {
        content = mirror.mirror_images(&content, ctx.external_id, ctx.diagnostics);
    }
    content
}

/// Remove any tag pair whose inner text equals the article title, so the
/// rendered page does not repeat its own heading.
pub fn strip_duplicate_title(
    content: &str,
    title: &str,
    external_id: &str,
    diagnostics: &mut DiagnosticsLog,
) -> String {
    let title = title.trim();
    if title.is_empty() || !content.contains(title) {
        return content.to_string();
    }
    match Regex::new(&format!(
        r"(?i)<[^>]+>\s*{}\s*</[^>]+>",
        regex::escape(title)
    )) {
        Ok(pattern) => pattern.replace_all(content, "").into_owned(),
        Err(error) => {
            diagnostics.record_failure(
                external_id,
                steps::STRIP_DUPLICATE_TITLE,
                format!("title match failed: {error}"),
            );
            content.to_string()
        }
    }
}

/// Shift every heading level up by one, but only when the fragment carries
/// a top-level heading of its own.
pub fn demote_headings(content: &str) -> String {
    if !content.contains("<h1") {
        return content.to_string();
    }
    HEADING_TAG
        .replace_all(content, |caps: &Captures| {
            let level: u32 = caps[2].parse().unwrap_or(6);
            format!("<{}h{}{}>", &caps[1], level + 1, &caps[3])
        })
        .into_owned()
}

/// Anchors addressed by `name` get an `id` instead, suffixed `name1`,
/// `name2`, ... so repeated names never collide.
pub fn backfill_anchor_ids(content: &str) -> String {
    let mut counters: HashMap<String, u32> = HashMap::new();
    ANCHOR_WITH_NAME
        .replace_all(content, |caps: &Captures| {
            let attrs = &caps[1];
            let name = &caps[2];
            let rest = &caps[3];
            if attrs.contains("id=") || rest.contains("id=") {
                return caps[0].to_string();
            }
            let counter = counters.entry(name.to_string()).or_insert(0);
            *counter += 1;
            format!("<a {attrs}id=\"{name}{counter}\"{rest}>")
        })
        .into_owned()
}

/// Spans styled with a Courier-family font become `<code>` elements.
pub fn monospace_spans_to_code(content: &str) -> String {
    MONOSPACE_SPAN
        .replace_all(content, |caps: &Captures| {
            format!("<code>{}</code>", &caps[2])
        })
        .into_owned()
}

/// `<ol>` tags with an inline `list-style-type` gain a matching CSS class
/// (`ol_<type>`, hyphens as underscores). The style attribute is left for
/// the later stripping step.
pub fn classify_ordered_lists(content: &str) -> String {
    STYLED_OL
        .replace_all(content, |caps: &Captures| {
            let tag = &caps[0];
            if tag.contains("class=\"ol_") {
                return tag.to_string();
            }
            let style = decode_basic_entities(&caps[1]);
            let Some(type_match) = LIST_STYLE_TYPE.captures(&style) else {
                return tag.to_string();
            };
            let class = format!("ol_{}", type_match[1].trim().replace('-', "_"));
            tag.replacen(
                &format!("style=\"{}\"", &caps[1]),
                &format!("style=\"{}\" class=\"{}\"", &caps[1], class),
                1,
            )
        })
        .into_owned()
}

/// Delete elements hidden with `display: none`, contents included. Nested
/// occurrences of the same tag are tracked by depth; an element whose close
/// tag never appears is left alone.
pub fn remove_hidden_content(content: &str) -> String {
    let mut result = content.to_string();
    let mut search_from = 0;
    loop {
        let Some((open_start, open_end, tag_name)) = HIDDEN_OPEN_TAG
            .captures_at(&result, search_from)
            .map(|caps| {
                let open = caps.get(0).map_or(0..0, |m| m.range());
                (open.start, open.end, caps[1].to_ascii_lowercase())
            })
        else {
            break;
        };
        if open_start == open_end {
            break;
        }
        match find_matching_close(&result, open_end, &tag_name) {
            Some(close_end) => {
                result.replace_range(open_start..close_end, "");
                search_from = open_start;
            }
            None => {
                search_from = open_end;
            }
        }
    }
    result
}

fn find_matching_close(content: &str, from: usize, tag_name: &str) -> Option<usize> {
    let tag_pattern = Regex::new(&format!(r"(?i)<(/?){}[\s/>]", regex::escape(tag_name))).ok()?;
    let mut depth = 1usize;
    for caps in tag_pattern.captures_iter(&content[from..]) {
        let tag = caps.get(0)?;
        if caps[1].is_empty() {
            depth += 1;
        } else {
            depth -= 1;
            if depth == 0 {
                let close_start = from + tag.start();
                return content[close_start..]
                    .find('>')
                    .map(|offset| close_start + offset + 1);
            }
        }
    }
    None
}

/// Remove every remaining inline `style="..."` attribute.
pub fn strip_style_attributes(content: &str) -> String {
    STYLE_ATTRIBUTE.replace_all(content, "").into_owned()
}

pub fn bold_to_strong(content: &str) -> String {
    content
        .replace("<b>", "<strong>")
        .replace("</b>", "</strong>")
}

/// Delete empty `<span>`, `<blockquote>`, and `<ul>` elements, iterating so
/// nested empties collapse completely.
pub fn remove_empty_tags(content: &str) -> String {
    let mut current = content.to_string();
    loop {
        let pass = EMPTY_SPAN.replace_all(&current, "");
        let pass = EMPTY_BLOCKQUOTE.replace_all(&pass, "");
        let next = EMPTY_UL.replace_all(&pass, "").into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Remove `border` and `align` attributes from `<img>` tags.
pub fn strip_image_attributes(content: &str) -> String {
    let mut current = content.to_string();
    loop {
        let next = IMG_PRESENTATION_ATTR
            .replace_all(&current, |caps: &Captures| format!("<img{}", &caps[1]))
            .into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Collapse every `<table ...>` open tag to a bare `<table>`, dropping
/// `border`/`cellpadding`/`cellspacing` and anything else on the tag.
pub fn strip_table_attributes(content: &str) -> String {
    TABLE_OPEN_TAG.replace_all(content, "<table>").into_owned()
}

/// Replace `<font>` elements with their children, iterating so nested font
/// tags unwrap completely.
pub fn unwrap_font_tags(content: &str) -> String {
    let mut current = content.to_string();
    loop {
        let next = FONT_PAIR
            .replace_all(&current, |caps: &Captures| caps[1].to_string())
            .into_owned();
        if next == current {
            return next;
        }
        current = next;
    }
}

/// Style attributes arrive entity-encoded from the feed XML.
fn decode_basic_entities(value: &str) -> String {
    value
        .replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&apos;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}
