//! Response content classification
//!
//! Decides which transform path (if any) a response travels down.

/// Classification of a response body used to pick a transform path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    Js,
    Css,
    Html,
    Image,
    Other,
}

impl ContentKind {
    /// Stable lowercase token used as a `CacheKey` component; must never change once shipped,
    /// since existing on-disk cache entries embed it implicitly via the key hash.
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Js => "js",
            ContentKind::Css => "css",
            ContentKind::Html => "html",
            ContentKind::Image => "image",
            ContentKind::Other => "other",
        }
    }

    /// Whether this kind is ever routed through the Transformer Pool. `image` and `other`
    /// always pass through untouched.
    pub fn is_transformable(self) -> bool {
        matches!(self, ContentKind::Js | ContentKind::Css | ContentKind::Html)
    }

    /// Classify by `content-type` first, falling back to the URL's extension only when the
    /// header is absent.
    pub fn classify(content_type: Option<&str>, url: &str) -> Self {
        if let Some(ct) = content_type {
            let ct = ct.to_ascii_lowercase();
            let essence = ct.split(';').next().unwrap_or(&ct).trim();
            if essence.starts_with("text/html") {
                return ContentKind::Html;
            }
            if essence.contains("javascript") || essence.contains("ecmascript") {
                return ContentKind::Js;
            }
            if essence == "text/css" {
                return ContentKind::Css;
            }
            if essence.starts_with("image/") {
                return ContentKind::Image;
            }
            return ContentKind::Other;
        }

        Self::classify_by_extension(url)
    }

    fn classify_by_extension(url: &str) -> Self {
        let path = url.split(['?', '#']).next().unwrap_or(url);
        let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
        match ext.as_str() {
            "html" | "htm" => ContentKind::Html,
            "js" | "mjs" | "cjs" => ContentKind::Js,
            "css" => ContentKind::Css,
            "png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "bmp" => ContentKind::Image,
            _ => ContentKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_html_by_content_type() {
        assert_eq!(
            ContentKind::classify(Some("text/html; charset=utf-8"), "http://x/y"),
            ContentKind::Html
        );
    }

    #[test]
    fn classifies_js_variants() {
        assert_eq!(
            ContentKind::classify(Some("application/javascript"), "http://x/y"),
            ContentKind::Js
        );
        assert_eq!(
            ContentKind::classify(Some("text/ecmascript"), "http://x/y"),
            ContentKind::Js
        );
    }

    #[test]
    fn classifies_css_and_image() {
        assert_eq!(
            ContentKind::classify(Some("text/css"), "http://x/y"),
            ContentKind::Css
        );
        assert_eq!(
            ContentKind::classify(Some("image/png"), "http://x/y"),
            ContentKind::Image
        );
    }

    #[test]
    fn falls_back_to_url_extension_when_content_type_absent() {
        assert_eq!(
            ContentKind::classify(None, "http://x/app.js"),
            ContentKind::Js
        );
        assert_eq!(
            ContentKind::classify(None, "http://x/style.css?v=2"),
            ContentKind::Css
        );
        assert_eq!(
            ContentKind::classify(None, "http://x/index.html#frag"),
            ContentKind::Html
        );
        assert_eq!(
            ContentKind::classify(None, "http://x/data.bin"),
            ContentKind::Other
        );
    }

    #[test]
    fn unknown_content_type_is_other_even_with_recognizable_extension() {
        // content-type present takes precedence over the URL.
        assert_eq!(
            ContentKind::classify(Some("application/octet-stream"), "http://x/app.js"),
            ContentKind::Other
        );
    }
}
