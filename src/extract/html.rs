use scraper::node::Node;
use scraper::{ElementRef, Html};

use super::{BlockKind, ExtractedText, TextBuilder};

/// Non-content elements stripped entirely, including their subtrees.
const SKIP_TAGS: &[&str] = &[
    "script", "style", "noscript", "iframe", "nav", "header", "footer", "aside", "button", "form",
    "svg", "template",
];

/// Extract headings, paragraphs, and table rows from an HTML document,
/// dropping navigation chrome and collapsing whitespace within each block.
pub(super) fn extract_html(html: &str) -> ExtractedText {
    let document = Html::parse_document(html);
    let mut walker = HtmlWalker {
        builder: TextBuilder::new(),
        pending: String::new(),
    };

    for child in document.tree.root().children() {
        walker.visit(child);
    }
    walker.flush_pending();

    walker.builder.finish()
}

struct HtmlWalker {
    builder: TextBuilder,
    // Loose text between block elements accumulates here until a block
    // boundary forces a paragraph.
    pending: String,
}

impl HtmlWalker {
    fn visit(&mut self, node: ego_tree::NodeRef<'_, Node>) {
        match node.value() {
            Node::Text(text) => {
                push_collapsed(&mut self.pending, text);
            }
            Node::Element(element) => {
                let name = element.name();
                if SKIP_TAGS.contains(&name) {
                    return;
                }

                match name {
                    "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                        self.flush_pending();
                        let level = name.as_bytes()[1] - b'0';
                        let text = subtree_text(node);
                        self.builder.push_block(BlockKind::Heading(level), &text);
                    }
                    "p" | "li" | "pre" | "blockquote" | "dt" | "dd" => {
                        self.flush_pending();
                        let text = subtree_text(node);
                        self.builder.push_block(BlockKind::Paragraph, &text);
                    }
                    "tr" => {
                        self.flush_pending();
                        let row = table_row_text(node);
                        self.builder.push_block(BlockKind::TableRow, &row);
                    }
                    "br" => {
                        self.pending.push(' ');
                    }
                    _ => {
                        // Transparent container; structural elements force a
                        // boundary for any loose text collected so far.
                        if is_block_container(name) {
                            self.flush_pending();
                        }
                        for child in node.children() {
                            self.visit(child);
                        }
                        if is_block_container(name) {
                            self.flush_pending();
                        }
                    }
                }
            }
            _ => {}
        }
    }

    fn flush_pending(&mut self) {
        if !self.pending.trim().is_empty() {
            let text = std::mem::take(&mut self.pending);
            self.builder.push_block(BlockKind::Paragraph, &text);
        } else {
            self.pending.clear();
        }
    }
}

fn is_block_container(name: &str) -> bool {
    matches!(
        name,
        "div" | "section" | "article" | "main" | "body" | "table" | "ul" | "ol" | "dl"
    )
}

/// Collapsed text of a whole subtree, skipping non-content elements.
fn subtree_text(node: ego_tree::NodeRef<'_, Node>) -> String {
    let mut out = String::new();
    collect_text(node, &mut out);
    out.trim().to_string()
}

fn collect_text(node: ego_tree::NodeRef<'_, Node>, out: &mut String) {
    for child in node.children() {
        match child.value() {
            Node::Text(text) => push_collapsed(out, text),
            Node::Element(element) => {
                if SKIP_TAGS.contains(&element.name()) {
                    continue;
                }
                if element.name() == "br" {
                    out.push(' ');
                }
                collect_text(child, out);
            }
            _ => {}
        }
    }
}

/// Serialize a table row as tab-separated cell texts in document order so
/// downstream chunking sees a deterministic line-oriented rendering.
fn table_row_text(row: ego_tree::NodeRef<'_, Node>) -> String {
    let mut cells = Vec::new();
    for child in row.children() {
        if let Some(element) = ElementRef::wrap(child) {
            let name = element.value().name();
            if name == "td" || name == "th" {
                cells.push(subtree_text(child));
            }
        }
    }
    cells.join("\t")
}

fn push_collapsed(out: &mut String, text: &str) {
    for word in text.split_whitespace() {
        if !out.is_empty() && !out.ends_with(char::is_whitespace) {
            out.push(' ');
        }
        out.push_str(word);
    }
}
