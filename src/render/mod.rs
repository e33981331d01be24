//! Markdown → sanitized HTML, with cross-note links, highlighting, math and
//! diagram placeholders.

pub mod cache;
pub mod diagram;
pub mod highlight;
pub mod links;
pub mod math;
pub mod sanitize;

use std::sync::Arc;

use pulldown_cmark::{html, CodeBlockKind, CowStr, Event, Options, Parser, Tag, TagEnd, TextMergeStream};

use crate::clock::Clock;
use crate::config::RenderConfig;
use cache::BoundedCache;
use highlight::CodeHighlighter;
use links::NoteLinkTable;
use math::{DelimitedTexEngine, MathEngine, MathMode, MathRenderer};
use sanitize::Sanitizer;

pub use links::extract_note_links;

/// Escape text for use in HTML content or a double-quoted attribute.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Reverse of [`escape_html`], also accepting the entities the sanitizer emits.
pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", "\u{a0}")
        .replace("&amp;", "&")
}

fn markdown_options() -> Options {
    Options::ENABLE_TABLES
        | Options::ENABLE_STRIKETHROUGH
        | Options::ENABLE_TASKLISTS
        | Options::ENABLE_FOOTNOTES
        | Options::ENABLE_MATH
}

/// How the last `render` call was served.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RenderStats {
    /// Served by the immediate-repeat shortcut, without touching the cache map.
    pub shortcut_hits: u64,
    pub cache_hits: u64,
    pub misses: u64,
}

struct LastRender {
    source: String,
    links: blake3::Hash,
    html: String,
}

type RenderKey = (blake3::Hash, blake3::Hash);

pub struct MarkdownRenderer {
    cache: BoundedCache<RenderKey, String>,
    last: Option<LastRender>,
    highlighter: CodeHighlighter,
    math: MathRenderer,
    sanitizer: Sanitizer,
    stats: RenderStats,
}

impl MarkdownRenderer {
    pub fn new(config: &RenderConfig, clock: Arc<dyn Clock>) -> Self {
        Self::with_math_engine(config, clock, Box::new(DelimitedTexEngine))
    }

    pub fn with_math_engine(config: &RenderConfig, clock: Arc<dyn Clock>, engine: Box<dyn MathEngine>) -> Self {
        Self {
            cache: BoundedCache::new(config.render_cache_size, Some(config.render_cache_ttl_ms), clock.clone()),
            last: None,
            highlighter: CodeHighlighter::new(config.highlight_cache_size, clock.clone()),
            math: MathRenderer::new(engine, config.math_cache_size, config.trust_math, clock),
            sanitizer: Sanitizer::new(),
            stats: RenderStats::default(),
        }
    }

    pub fn stats(&self) -> RenderStats {
        self.stats
    }

    /// Render Markdown to sanitized HTML, resolving `[[...]]` against `links`.
    pub fn render(&mut self, source: &str, links: &NoteLinkTable) -> String {
        let fingerprint = links.fingerprint();
        if let Some(last) = &self.last {
            if last.source == source && last.links == fingerprint {
                self.stats.shortcut_hits += 1;
                return last.html.clone();
            }
        }

        let key = (blake3::hash(source.as_bytes()), fingerprint);
        let html = match self.cache.get(&key) {
            Some(hit) => {
                self.stats.cache_hits += 1;
                hit.clone()
            }
            None => {
                self.stats.misses += 1;
                let html = self.render_uncached(source, links);
                self.cache.insert(key, html.clone());
                html
            }
        };

        self.last = Some(LastRender { source: source.to_string(), links: fingerprint, html: html.clone() });
        html
    }

    /// Drop every cached render (the sub-caches are content-keyed and stay valid).
    pub fn clear_cache(&mut self) {
        self.cache.clear();
        self.last = None;
    }

    fn render_uncached(&mut self, source: &str, links: &NoteLinkTable) -> String {
        let prepared = math::normalize_block_math(source);
        let parser = TextMergeStream::new(Parser::new_ext(&prepared, markdown_options()));

        let mut events: Vec<Event<'_>> = Vec::new();
        let mut code: Option<(String, String)> = None;

        for event in parser {
            match event {
                Event::Start(Tag::CodeBlock(kind)) => {
                    let lang = match kind {
                        CodeBlockKind::Fenced(info) => info.split_whitespace().next().unwrap_or("").to_string(),
                        CodeBlockKind::Indented => String::new(),
                    };
                    code = Some((lang, String::new()));
                }
                Event::End(TagEnd::CodeBlock) => {
                    if let Some((lang, body)) = code.take() {
                        let block = if diagram::DIAGRAM_LANGUAGES.contains(&lang.as_str()) {
                            diagram::placeholder(&lang, &body)
                        } else {
                            self.highlighter.code_block(&lang, &body)
                        };
                        events.push(Event::Html(CowStr::from(block)));
                    }
                }
                Event::Text(text) => match code.as_mut() {
                    Some((_, body)) => body.push_str(&text),
                    None => match links::link_text(&text, links) {
                        Some(linked) => events.push(Event::InlineHtml(CowStr::from(linked))),
                        None => events.push(Event::Text(text)),
                    },
                },
                Event::InlineMath(expr) => {
                    events.push(Event::InlineHtml(CowStr::from(self.math.render(&expr, MathMode::Inline))));
                }
                Event::DisplayMath(expr) => {
                    events.push(Event::InlineHtml(CowStr::from(self.math.render(&expr, MathMode::Display))));
                }
                // Single newlines inside a paragraph are kept as line breaks.
                Event::SoftBreak => events.push(Event::HardBreak),
                other => events.push(other),
            }
        }

        let mut out = String::with_capacity(prepared.len() * 3 / 2);
        html::push_html(&mut out, events.into_iter());
        self.sanitizer.clean(&out)
    }
}
