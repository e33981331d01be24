//! Second rendering pass for fenced diagram blocks.
//!
//! The Markdown pass only emits placeholders. This pass runs over the
//! already-sanitized markup, loads the diagram engine on first need, and swaps
//! each placeholder for the rendered SVG.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::{Captures, Regex};
use tokio::sync::OnceCell;

use super::sanitize::Sanitizer;
use super::{escape_html, unescape_html};

/// Fence languages rendered as diagrams rather than highlighted code.
pub const DIAGRAM_LANGUAGES: &[&str] = &["mermaid"];

/// Renders diagram source (e.g. Mermaid) to SVG markup.
pub trait DiagramEngine: Send + Sync {
    fn render(&self, kind: &str, source: &str) -> Result<String, String>;
}

/// Loads a diagram engine. Called at most once per [`DiagramPass`].
#[async_trait]
pub trait DiagramLoader: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn DiagramEngine>, String>;
}

/// Placeholder markup emitted by the Markdown pass.
pub fn placeholder(kind: &str, source: &str) -> String {
    format!(
        "<div class=\"diagram-placeholder\" data-diagram=\"{}\">{}</div>\n",
        escape_html(kind),
        escape_html(source)
    )
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?s)<div class="diagram-placeholder" data-diagram="([A-Za-z0-9_-]+)">(.*?)</div>"#)
            .expect("placeholder pattern is valid")
    })
}

pub struct DiagramPass {
    loader: Box<dyn DiagramLoader>,
    engine: OnceCell<Arc<dyn DiagramEngine>>,
    zoom: bool,
    sanitizer: Sanitizer,
}

impl DiagramPass {
    pub fn new(loader: Box<dyn DiagramLoader>, zoom: bool) -> Self {
        Self { loader, engine: OnceCell::new(), zoom, sanitizer: Sanitizer::new() }
    }

    pub fn has_placeholders(html: &str) -> bool {
        placeholder_regex().is_match(html)
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.initialized()
    }

    /// Replace every placeholder in `html` with its rendered diagram.
    pub async fn enhance(&self, html: &str) -> String {
        if !Self::has_placeholders(html) {
            return html.to_string();
        }

        let engine = match self.engine.get_or_try_init(|| self.loader.load()).await {
            Ok(engine) => Some(engine.clone()),
            Err(e) => {
                tracing::warn!("Diagram engine failed to load: {e}");
                None
            }
        };

        let replaced = placeholder_regex().replace_all(html, |caps: &Captures<'_>| {
            let kind = &caps[1];
            let source = unescape_html(&caps[2]);
            let rendered = match &engine {
                Some(engine) => engine.render(kind, &source),
                None => Err("diagram engine unavailable".to_string()),
            };
            match rendered {
                Ok(svg) => self.diagram_html(kind, &svg),
                Err(e) => format!(
                    "<div class=\"diagram-error\" title=\"{}\"><pre>{}</pre></div>",
                    escape_html(&e),
                    escape_html(&source)
                ),
            }
        });

        self.sanitizer.clean(&replaced)
    }

    fn diagram_html(&self, kind: &str, svg: &str) -> String {
        let zoom = if self.zoom {
            "<button class=\"diagram-zoom\" type=\"button\" data-action=\"zoom\">Zoom</button>"
        } else {
            ""
        };
        format!("<div class=\"diagram\" data-diagram=\"{}\">{zoom}{svg}</div>", escape_html(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoEngine;

    impl DiagramEngine for EchoEngine {
        fn render(&self, _kind: &str, source: &str) -> Result<String, String> {
            if source.contains("broken") {
                return Err("parse error".into());
            }
            Ok(format!("<svg><text>{}</text></svg>", escape_html(source.trim())))
        }
    }

    struct CountingLoader(Arc<AtomicUsize>);

    #[async_trait]
    impl DiagramLoader for CountingLoader {
        async fn load(&self) -> Result<Arc<dyn DiagramEngine>, String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(EchoEngine))
        }
    }

    struct FailingLoader;

    #[async_trait]
    impl DiagramLoader for FailingLoader {
        async fn load(&self) -> Result<Arc<dyn DiagramEngine>, String> {
            Err("offline".into())
        }
    }

    fn pass(zoom: bool) -> (DiagramPass, Arc<AtomicUsize>) {
        let loads = Arc::new(AtomicUsize::new(0));
        (DiagramPass::new(Box::new(CountingLoader(loads.clone())), zoom), loads)
    }

    #[tokio::test]
    async fn engine_not_loaded_without_placeholders() {
        let (pass, loads) = pass(true);
        let html = "<p>plain</p>";
        assert_eq!(pass.enhance(html).await, html);
        assert_eq!(loads.load(Ordering::SeqCst), 0);
        assert!(!pass.is_loaded());
    }

    #[tokio::test]
    async fn placeholders_are_replaced_and_engine_loaded_once() {
        let (pass, loads) = pass(true);
        let html = format!("{}{}", placeholder("mermaid", "graph A-->B"), placeholder("mermaid", "graph C"));

        let out = pass.enhance(&html).await;
        assert!(!out.contains("diagram-placeholder"));
        assert!(out.contains(r#"class="diagram""#));
        // The source arrow survives escaping and unescaping.
        assert!(out.contains("graph A--&gt;B"));
        assert!(out.contains("diagram-zoom"));

        pass.enhance(&html).await;
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn zoom_button_is_optional() {
        let (pass, _) = pass(false);
        let out = pass.enhance(&placeholder("mermaid", "graph A")).await;
        assert!(!out.contains("diagram-zoom"));
    }

    #[tokio::test]
    async fn engine_errors_render_inline() {
        let (pass, _) = pass(true);
        let html = format!("{}<p>after</p>", placeholder("mermaid", "broken <graph>"));
        let out = pass.enhance(&html).await;
        assert!(out.contains(r#"class="diagram-error""#));
        assert!(out.contains("broken &lt;graph&gt;"));
        assert!(out.contains("<p>after</p>"));
    }

    #[tokio::test]
    async fn load_failure_marks_every_diagram() {
        let pass = DiagramPass::new(Box::new(FailingLoader), true);
        let out = pass.enhance(&placeholder("mermaid", "graph A")).await;
        assert!(out.contains("diagram-error"));
        assert!(out.contains("diagram engine unavailable"));
    }
}
