// Minimal HTML scanning over byte offsets. ASCII lowercasing keeps offsets
// identical between the source and the lowercased copy.

use crate::error::ParseError;

/// A located element: its attributes and inner markup.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Element<'a> {
    pub attrs: &'a str,
    pub inner: &'a str,
    /// Byte offset just past the closing tag.
    pub end: usize,
}

/// Source text plus a lowercased copy used for case-insensitive search.
pub(crate) struct Doc<'a> {
    src: &'a str,
    lc: String,
}

impl<'a> Doc<'a> {
    pub fn new(src: &'a str) -> Self {
        Self { src, lc: src.to_ascii_lowercase() }
    }

    /// Offset of the next `<tag` (whole tag name) at or after `from`.
    fn find_open(&self, tag: &str, from: usize) -> Option<usize> {
        let needle = format!("<{tag}");
        let mut pos = from;
        while let Some(rel) = self.lc.get(pos..)?.find(&needle) {
            let at = pos + rel;
            let after = self.lc.as_bytes().get(at + needle.len()).copied();
            if matches!(after, Some(b' ' | b'\t' | b'\n' | b'\r' | b'>' | b'/')) {
                return Some(at);
            }
            pos = at + needle.len();
        }
        None
    }

    /// Parse the element whose `<` sits at `start`, honouring nesting of the same tag.
    fn element_at(&self, tag: &str, start: usize) -> Result<Element<'a>, ParseError> {
        let unbalanced = || ParseError::Unbalanced { tag: tag.to_string() };
        let open_end = self.lc[start..].find('>').ok_or_else(unbalanced)? + start;
        let attrs = &self.src[start + 1 + tag.len()..open_end];
        if attrs.trim_end().ends_with('/') {
            return Ok(Element { attrs, inner: "", end: open_end + 1 });
        }

        let close_pat = format!("</{tag}");
        let mut depth = 1usize;
        let mut pos = open_end + 1;
        loop {
            let close = self.lc[pos..].find(&close_pat).map(|r| r + pos).ok_or_else(unbalanced)?;
            match self.find_open(tag, pos) {
                Some(open) if open < close => {
                    depth += 1;
                    pos = open + 1;
                }
                _ => {
                    depth -= 1;
                    if depth == 0 {
                        let end = self.lc[close..].find('>').ok_or_else(unbalanced)? + close + 1;
                        return Ok(Element { attrs, inner: &self.src[open_end + 1..close], end });
                    }
                    pos = close + close_pat.len();
                }
            }
        }
    }

    /// Next `tag` element at or after `from`.
    pub fn next(&self, tag: &str, from: usize) -> Result<Option<Element<'a>>, ParseError> {
        match self.find_open(tag, from) {
            Some(start) => self.element_at(tag, start).map(Some),
            None => Ok(None),
        }
    }

    /// All top-level `tag` elements in document order.
    pub fn all(&self, tag: &str) -> Result<Vec<Element<'a>>, ParseError> {
        let mut out = Vec::new();
        let mut pos = 0;
        while let Some(el) = self.next(tag, pos)? {
            pos = el.end;
            out.push(el);
        }
        Ok(out)
    }

    /// First element of any tag carrying `class` among its class tokens.
    pub fn by_class(&self, class: &str) -> Result<Option<Element<'a>>, ParseError> {
        let mut pos = 0;
        while let Some(rel) = self.lc[pos..].find("class=") {
            let at = pos + rel;
            pos = at + 6;
            let Some(value) = quoted_value(&self.lc[pos..]) else { continue };
            if !value.split_whitespace().any(|c| c == class) {
                continue;
            }
            let Some(lt) = self.lc[..at].rfind('<') else { continue };
            let tag: String = self.lc[lt + 1..]
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric())
                .collect();
            if tag.is_empty() {
                continue;
            }
            return self.element_at(&tag, lt).map(Some);
        }
        Ok(None)
    }

    /// Plain text of the first element with `class`, if non-empty.
    pub fn text_of_class(&self, class: &str) -> Result<Option<String>, ParseError> {
        Ok(self.by_class(class)?.map(|el| text(el.inner)).filter(|t| !t.is_empty()))
    }
}

fn quoted_value(s: &str) -> Option<&str> {
    let quote = s.chars().next().filter(|c| *c == '"' || *c == '\'')?;
    let rest = &s[1..];
    rest.find(quote).map(|end| &rest[..end])
}

/// Whether `attrs` contains `class` among its class tokens.
pub(crate) fn has_class(attrs: &str, class: &str) -> bool {
    let lc = attrs.to_ascii_lowercase();
    let Some(at) = lc.find("class=") else { return false };
    quoted_value(&lc[at + 6..])
        .map(|v| v.split_whitespace().any(|c| c == class))
        .unwrap_or(false)
}

/// Tag-stripped, entity-decoded, whitespace-normalized text.
pub(crate) fn text(s: &str) -> String {
    normalize_ws(&decode_entities(&strip_tags(s)))
}

pub(crate) fn strip_tags(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_tag = false;
    for ch in s.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }
    out
}

pub(crate) fn decode_entities(s: &str) -> String {
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub(crate) fn normalize_ws(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut prev_space = false;
    for ch in s.chars() {
        if ch.is_whitespace() {
            if !prev_space { out.push(' '); prev_space = true; }
        } else { out.push(ch); prev_space = false; }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_elements_are_matched() {
        let d = Doc::new("<div class=\"a\"><div>x</div><DIV>y</DIV></div><div>z</div>");
        let el = d.by_class("a").unwrap().unwrap();
        assert_eq!(el.inner, "<div>x</div><DIV>y</DIV>");
        let all = d.all("div").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(text(all[1].inner), "z");
    }

    #[test]
    fn tag_prefixes_do_not_match() {
        let d = Doc::new("<thead><tr><th>Pos</th></tr></thead>");
        let rows = d.all("tr").unwrap();
        assert_eq!(rows.len(), 1);
        assert!(Doc::new(rows[0].inner).all("td").unwrap().is_empty());
        assert_eq!(Doc::new(rows[0].inner).all("th").unwrap().len(), 1);
    }

    #[test]
    fn unclosed_element_is_an_error() {
        let d = Doc::new("<table class=\"results\"><tr><td>1</td></tr>");
        assert_eq!(d.by_class("results").unwrap_err(), ParseError::Unbalanced { tag: "table".into() });
    }

    #[test]
    fn text_decodes_and_collapses() {
        assert_eq!(text("<a href='/r'>Van&nbsp;der  <b>Poel</b></a>"), "Van der Poel");
        assert_eq!(text("Ineos &amp; Grenadiers"), "Ineos & Grenadiers");
    }

    #[test]
    fn class_tokens_are_whole_words() {
        assert!(has_class(" class=\"flag fr\"", "flag"));
        assert!(!has_class(" class=\"flagged\"", "flag"));
    }
}
