//! Polyfill bundle injection
//!
//! The polyfill contents themselves aren't this module's concern; its job is only to
//! ship whatever bundle it's given as a compiled-in byte asset and splice it into `<head>`.

const POLYFILL_BUNDLE: &str = include_str!("../assets/polyfill_bundle.js");

/// The embedded polyfill bundle, wrapped in a `<script>` tag ready for injection.
pub fn polyfill_script_tag() -> String {
    format!("<script>{POLYFILL_BUNDLE}</script>")
}

/// Inject the polyfill bundle into `html`'s `<head>`, before the first `<script>` tag; if no
/// `<head>` is found, prepend the bundle to the document.
pub fn inject_polyfills(html: &[u8]) -> Vec<u8> {
    let source = String::from_utf8_lossy(html);
    let script_tag = polyfill_script_tag();

    if let Some(head_pos) = find_tag_case_insensitive(&source, "<head") {
        let head_open_end = match source[head_pos..].find('>') {
            Some(offset) => head_pos + offset + 1,
            None => return html.to_vec(),
        };

        // Bound the search to the head element itself; a `<script>` inside `<body>` must never
        // be mistaken for one inside `<head>`.
        let head_close_pos = find_tag_case_insensitive(&source[head_open_end..], "</head")
            .map(|offset| head_open_end + offset);
        let head_region_end = head_close_pos.unwrap_or(source.len());

        let insertion_point =
            match find_tag_case_insensitive(&source[head_open_end..head_region_end], "<script") {
                Some(offset) => head_open_end + offset,
                // No script in head: splice immediately before `</head>` (or at the end of the
                // document if `<head>` is never closed), not at the end of body.
                None => head_region_end,
            };

        let mut out = String::with_capacity(source.len() + script_tag.len());
        out.push_str(&source[..insertion_point]);
        out.push_str(&script_tag);
        out.push_str(&source[insertion_point..]);
        return out.into_bytes();
    }

    let mut out = String::with_capacity(source.len() + script_tag.len());
    out.push_str(&script_tag);
    out.push_str(&source);
    out.into_bytes()
}

fn find_tag_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let haystack_lower = haystack.to_ascii_lowercase();
    haystack_lower.find(needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_carries_the_revamp_marker() {
        assert!(POLYFILL_BUNDLE.contains("[Revamp]"));
    }

    #[test]
    fn injects_before_first_script_in_head() {
        let html = b"<html><head><title>x</title><script>1</script></head><body></body></html>";
        let out = String::from_utf8(inject_polyfills(html)).unwrap();
        let head_pos = out.find("<head").unwrap();
        let script_pos = out.find("<script>").unwrap();
        let title_pos = out.find("<title>").unwrap();
        assert!(head_pos < title_pos);
        assert!(title_pos < script_pos);
        assert!(out.contains("[Revamp]"));
    }

    #[test]
    fn appends_to_end_of_head_when_no_script_present() {
        let html = b"<html><head><title>x</title></head><body></body></html>";
        let out = String::from_utf8(inject_polyfills(html)).unwrap();
        let title_pos = out.find("<title>").unwrap();
        let script_pos = out.find("<script>").unwrap();
        assert!(title_pos < script_pos);
        assert!(script_pos < out.find("</head>").unwrap());
    }

    #[test]
    fn does_not_mistake_a_body_script_for_a_head_script() {
        let html =
            b"<html><head><title>x</title></head><body><script>1</script></body></html>";
        let out = String::from_utf8(inject_polyfills(html)).unwrap();
        let head_close_pos = out.find("</head>").unwrap();
        let revamp_pos = out.find("[Revamp]").unwrap();
        let body_script_pos = out.rfind("<script>1</script>").unwrap();
        assert!(revamp_pos < head_close_pos, "polyfill must land inside <head>");
        assert!(head_close_pos < body_script_pos);
    }

    #[test]
    fn prepends_when_no_head_tag_exists() {
        let html = b"<body>hello</body>";
        let out = String::from_utf8(inject_polyfills(html)).unwrap();
        assert!(out.starts_with("<script>"));
    }

    #[test]
    fn matches_head_tag_case_insensitively() {
        let html = b"<HTML><HEAD></HEAD><body></body></HTML>";
        let out = String::from_utf8(inject_polyfills(html)).unwrap();
        assert!(out.contains("[Revamp]"));
        assert!(out.find("[Revamp]").unwrap() < out.find("</HEAD>").unwrap());
    }
}
