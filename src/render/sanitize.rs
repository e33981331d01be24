use ammonia::Builder;

/// Inline SVG elements emitted by diagram engines.
const SVG_TAGS: &[&str] = &[
    "svg", "g", "path", "rect", "circle", "ellipse", "line", "polyline", "polygon", "text",
    "tspan", "defs", "marker", "title", "desc",
];

const SVG_ATTRIBUTES: &[&str] = &[
    "viewBox", "viewbox", "width", "height", "xmlns", "d", "x", "y", "x1", "y1", "x2", "y2", "cx",
    "cy", "r", "rx", "ry", "points", "fill", "stroke", "stroke-width", "stroke-dasharray",
    "transform", "text-anchor", "dominant-baseline", "font-size", "font-family", "font-weight",
    "marker-end", "marker-start", "markerWidth", "markerHeight", "refX", "refY", "orient",
    "opacity",
];

/// HTML sanitizer with the allow-list the renderer needs on top of ammonia's
/// defaults: task-list checkboxes, classes and `data-*` hooks, the diagram
/// zoom button and inline SVG.
pub struct Sanitizer {
    builder: Builder<'static>,
}

impl Sanitizer {
    pub fn new() -> Self {
        let mut builder = Builder::default();
        builder
            .add_tags(&["input", "button"])
            .add_tags(SVG_TAGS)
            .add_tag_attributes("input", &["type", "checked", "disabled"])
            .add_tag_attributes("button", &["type"])
            .add_generic_attributes(&["class"])
            .add_generic_attribute_prefixes(&["data-"]);
        for tag in SVG_TAGS {
            builder.add_tag_attributes(tag, SVG_ATTRIBUTES);
        }
        Self { builder }
    }

    pub fn clean(&self, html: &str) -> String {
        self.builder.clean(html).to_string()
    }
}

impl Default for Sanitizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_scripts_and_handlers() {
        let clean = Sanitizer::new().clean(r#"<p onclick="x()">hi</p><script>alert(1)</script>"#);
        assert_eq!(clean, "<p>hi</p>");
    }

    #[test]
    fn keeps_disabled_checkboxes() {
        let clean = Sanitizer::new().clean(r#"<ul><li><input disabled="" type="checkbox"> done</li></ul>"#);
        assert!(clean.contains("<input"));
        assert!(clean.contains("disabled"));
        assert!(clean.contains(r#"type="checkbox""#));
    }

    #[test]
    fn keeps_note_link_hooks() {
        let clean = Sanitizer::new()
            .clean(r##"<a href="#/note/3" class="note-link" data-note-id="3">Three</a>"##);
        assert!(clean.contains(r#"class="note-link""#));
        assert!(clean.contains(r#"data-note-id="3""#));
        assert!(clean.contains(r##"href="#/note/3""##));
    }

    #[test]
    fn drops_javascript_urls() {
        let clean = Sanitizer::new().clean(r#"<a href="javascript:alert(1)">x</a>"#);
        assert!(!clean.contains("javascript"));
    }
}
