//! PDF transcript rendering with the standard Times fonts.

use std::io::Write;

use anyhow::{Context, Result};
use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};

use super::{ReportRenderer, display_timestamp};
use crate::store::{Chat, Message, MessageRole};

// A4 in points.
const PAGE_WIDTH: f32 = 595.28;
const PAGE_HEIGHT: f32 = 841.89;
const MARGIN: f32 = 48.0;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;
const LINE_FACTOR: f32 = 1.15;

const TITLE_SIZE: f32 = 16.0;
const SUBTITLE_SIZE: f32 = 11.0;
const BODY_SIZE: f32 = 12.0;
const FOOTER_SIZE: f32 = 10.0;

const RULE_GREY: f32 = 0.867;
const FOOTER_GREY: f32 = 0.467;

/// Glyph widths (1/1000 em) for ASCII 32..=126.
const TIMES_ROMAN_WIDTHS: [u16; 95] = [
    250, 333, 408, 500, 500, 833, 778, 180, 333, 333, 500, 564, 250, 333, 250, 278, 500, 500, 500,
    500, 500, 500, 500, 500, 500, 500, 278, 278, 564, 564, 564, 444, 921, 722, 667, 667, 722, 611,
    556, 722, 722, 333, 389, 722, 611, 889, 722, 722, 556, 722, 667, 556, 611, 722, 722, 944, 722,
    722, 611, 333, 278, 333, 469, 500, 333, 444, 500, 444, 500, 444, 333, 500, 500, 278, 278, 500,
    278, 778, 500, 500, 500, 500, 333, 389, 278, 500, 500, 722, 500, 500, 444, 480, 200, 480, 541,
];

const TIMES_BOLD_WIDTHS: [u16; 95] = [
    250, 333, 555, 500, 500, 1000, 833, 278, 333, 333, 500, 570, 250, 333, 250, 278, 500, 500, 500,
    500, 500, 500, 500, 500, 500, 500, 333, 333, 570, 570, 570, 500, 930, 722, 667, 722, 722, 667,
    611, 778, 778, 389, 500, 778, 667, 944, 722, 778, 611, 778, 722, 556, 667, 722, 722, 1000, 722,
    722, 667, 333, 278, 333, 581, 500, 333, 500, 556, 444, 556, 444, 333, 500, 556, 278, 333, 556,
    278, 833, 556, 500, 556, 556, 444, 389, 333, 556, 500, 722, 500, 500, 444, 394, 220, 394, 520,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Face {
    Regular,
    Bold,
}

impl Face {
    fn resource(self) -> &'static str {
        match self {
            Face::Regular => "F1",
            Face::Bold => "F2",
        }
    }

    fn glyph_width(self, c: char) -> u16 {
        let table = match self {
            Face::Regular => &TIMES_ROMAN_WIDTHS,
            Face::Bold => &TIMES_BOLD_WIDTHS,
        };
        match c as u32 {
            code @ 32..=126 => table[(code - 32) as usize],
            _ => 500,
        }
    }

    fn text_width(self, text: &str, size: f32) -> f32 {
        let units: u32 = text.chars().map(|c| u32::from(self.glyph_width(c))).sum();
        units as f32 * size / 1000.0
    }
}

/// Encode text for a WinAnsi-encoded standard font.
fn encode_win_ansi(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| match c {
            '\t' => b' ',
            '\u{20AC}' => 0x80,
            '\u{2026}' => 0x85,
            '\u{2018}' => 0x91,
            '\u{2019}' => 0x92,
            '\u{201C}' => 0x93,
            '\u{201D}' => 0x94,
            '\u{2022}' => 0x95,
            '\u{2013}' => 0x96,
            '\u{2014}' => 0x97,
            c if c.is_control() => b'?',
            c if (c as u32) <= 0xFF => c as u32 as u8,
            _ => b'?',
        })
        .collect()
}

/// Break `text` into lines no wider than `max_width`.
///
/// Hard line breaks are kept; words wider than a line are split.
fn wrap_text(text: &str, face: Face, size: f32, max_width: f32) -> Vec<String> {
    let normalized = text.replace("\r\n", "\n").replace('\r', "\n");
    let space = face.text_width(" ", size);
    let mut lines = Vec::new();

    for paragraph in normalized.split('\n') {
        let mut line = String::new();
        let mut width = 0.0_f32;

        for word in paragraph.split_whitespace() {
            let word_width = face.text_width(word, size);

            if !line.is_empty() && width + space + word_width <= max_width {
                line.push(' ');
                line.push_str(word);
                width += space + word_width;
                continue;
            }
            if !line.is_empty() {
                lines.push(std::mem::take(&mut line));
                width = 0.0;
            }

            if word_width <= max_width {
                line.push_str(word);
                width = word_width;
                continue;
            }

            for c in word.chars() {
                let w = face.text_width(c.encode_utf8(&mut [0; 4]), size);
                if !line.is_empty() && width + w > max_width {
                    lines.push(std::mem::take(&mut line));
                    width = 0.0;
                }
                line.push(c);
                width += w;
            }
        }

        lines.push(line);
    }

    lines
}

/// Accumulates content-stream operations page by page.
struct PageBuilder {
    finished: Vec<Vec<Operation>>,
    current: Vec<Operation>,
    y: f32,
}

impl PageBuilder {
    fn new() -> Self {
        Self {
            finished: Vec::new(),
            current: Vec::new(),
            y: PAGE_HEIGHT - MARGIN,
        }
    }

    fn new_page(&mut self) {
        self.finished.push(std::mem::take(&mut self.current));
        self.y = PAGE_HEIGHT - MARGIN;
    }

    fn text_at(&mut self, face: Face, size: f32, x: f32, baseline: f32, text: &str) {
        self.current.extend([
            Operation::new("BT", vec![]),
            Operation::new("Tf", vec![face.resource().into(), size.into()]),
            Operation::new("Td", vec![x.into(), baseline.into()]),
            Operation::new("Tj", vec![Object::string_literal(encode_win_ansi(text))]),
            Operation::new("ET", vec![]),
        ]);
    }

    fn line(&mut self, face: Face, size: f32, text: &str) {
        let height = size * LINE_FACTOR;
        if self.y - height < MARGIN {
            self.new_page();
        }
        if !text.is_empty() {
            self.text_at(face, size, MARGIN, self.y - size, text);
        }
        self.y -= height;
    }

    fn paragraph(&mut self, face: Face, size: f32, text: &str) {
        for line in wrap_text(text, face, size, CONTENT_WIDTH) {
            self.line(face, size, &line);
        }
    }

    fn move_down(&mut self, lines: f32, size: f32) {
        self.y -= lines * size * LINE_FACTOR;
    }

    fn rule(&mut self) {
        self.current.extend([
            Operation::new("q", vec![]),
            Operation::new("RG", vec![RULE_GREY.into(), RULE_GREY.into(), RULE_GREY.into()]),
            Operation::new("w", vec![1.0_f32.into()]),
            Operation::new("m", vec![MARGIN.into(), self.y.into()]),
            Operation::new("l", vec![(PAGE_WIDTH - MARGIN).into(), self.y.into()]),
            Operation::new("S", vec![]),
            Operation::new("Q", vec![]),
        ]);
    }

    /// Close the last page and stamp the footer on every page.
    fn finish(mut self, footer: &str) -> Vec<Vec<Operation>> {
        self.finished.push(self.current);
        let baseline = MARGIN - FOOTER_SIZE - 2.0;

        for page in &mut self.finished {
            page.extend([
                Operation::new("q", vec![]),
                Operation::new(
                    "rg",
                    vec![FOOTER_GREY.into(), FOOTER_GREY.into(), FOOTER_GREY.into()],
                ),
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec![Face::Regular.resource().into(), FOOTER_SIZE.into()]),
                Operation::new("Td", vec![MARGIN.into(), baseline.into()]),
                Operation::new("Tj", vec![Object::string_literal(encode_win_ansi(footer))]),
                Operation::new("ET", vec![]),
                Operation::new("Q", vec![]),
            ]);
        }
        self.finished
    }
}

/// Renders transcripts as A4 PDFs.
#[derive(Debug, Clone)]
pub struct PdfReportRenderer {
    footer: String,
}

impl PdfReportRenderer {
    /// `product` appears in the footer as "Generated by {product}".
    pub fn new(product: impl AsRef<str>) -> Self {
        Self {
            footer: format!("Generated by {}", product.as_ref()),
        }
    }

    fn layout(&self, chat: &Chat, assistant_name: &str, messages: &[Message]) -> Vec<Vec<Operation>> {
        let mut pages = PageBuilder::new();
        let name = if assistant_name.trim().is_empty() {
            "Assistant"
        } else {
            assistant_name
        };

        pages.paragraph(Face::Bold, TITLE_SIZE, &format!("Chat with {name}"));
        pages.move_down(0.6, TITLE_SIZE);
        pages.line(
            Face::Regular,
            SUBTITLE_SIZE,
            &format!("Started: {}", display_timestamp(chat.created())),
        );
        pages.move_down(0.4, SUBTITLE_SIZE);
        pages.rule();
        pages.move_down(0.6, SUBTITLE_SIZE);

        for message in messages {
            let speaker = match message.role {
                MessageRole::User => "User:",
                MessageRole::Assistant => "Assistant:",
            };
            pages.paragraph(
                Face::Bold,
                BODY_SIZE,
                &format!("({}) - {speaker}", display_timestamp(message.created())),
            );
            pages.move_down(0.2, BODY_SIZE);
            pages.paragraph(Face::Regular, BODY_SIZE, &message.content);
            pages.move_down(0.7, BODY_SIZE);
        }

        pages.finish(&self.footer)
    }
}

impl ReportRenderer for PdfReportRenderer {
    fn render(
        &self,
        mut sink: &mut dyn Write,
        chat: &Chat,
        assistant_name: &str,
        messages: &[Message],
    ) -> Result<()> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();

        let regular_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Times-Roman",
            "Encoding" => "WinAnsiEncoding",
        });
        let bold_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Times-Bold",
            "Encoding" => "WinAnsiEncoding",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! {
                Face::Regular.resource() => regular_id,
                Face::Bold.resource() => bold_id,
            },
        });

        let mut kids: Vec<Object> = Vec::new();
        for operations in self.layout(chat, assistant_name, messages) {
            let content = Content { operations };
            let encoded = content.encode().context("encoding page content")?;
            let content_id = doc.add_object(Stream::new(dictionary! {}, encoded));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), PAGE_WIDTH.into(), PAGE_HEIGHT.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);
        doc.compress();

        doc.save_to(&mut sink).context("writing PDF")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> Chat {
        Chat {
            id: "c1".to_string(),
            user_id: "u1".to_string(),
            assistant_id: "a1".to_string(),
            session_id: "s1".to_string(),
            title: None,
            created_at: "2025-03-07T10:00:00.000Z".to_string(),
            updated_at: "2025-03-07T10:05:00.000Z".to_string(),
        }
    }

    fn message(role: MessageRole, content: &str) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            chat_id: "c1".to_string(),
            seq: 1,
            role,
            content: content.to_string(),
            is_ocr: false,
            created_at: "2025-03-07T10:01:00.000Z".to_string(),
        }
    }

    /// Every string shown with `Tj`, page by page.
    fn shown_text(bytes: &[u8]) -> Vec<Vec<String>> {
        let doc = Document::load_mem(bytes).unwrap();
        doc.get_pages()
            .values()
            .map(|page_id| {
                let content = Content::decode(&doc.get_page_content(*page_id).unwrap()).unwrap();
                content
                    .operations
                    .iter()
                    .filter(|op| op.operator == "Tj")
                    .filter_map(|op| op.operands.first())
                    .filter_map(|operand| operand.as_str().ok())
                    .map(|s| String::from_utf8_lossy(s).into_owned())
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_wrap_text() {
        let lines = wrap_text("one two three", Face::Regular, 12.0, 1000.0);
        assert_eq!(lines, vec!["one two three"]);

        let narrow = Face::Regular.text_width("one two", 12.0) + 1.0;
        let lines = wrap_text("one two three", Face::Regular, 12.0, narrow);
        assert_eq!(lines, vec!["one two", "three"]);

        let lines = wrap_text("a\r\n\r\nb", Face::Regular, 12.0, 1000.0);
        assert_eq!(lines, vec!["a", "", "b"]);

        let long = "x".repeat(200);
        let lines = wrap_text(&long, Face::Regular, 12.0, 100.0);
        assert!(lines.len() > 1);
        assert_eq!(lines.concat(), long);
    }

    #[test]
    fn test_encode_win_ansi() {
        assert_eq!(encode_win_ansi("café"), b"caf\xe9".to_vec());
        assert_eq!(encode_win_ansi("it\u{2019}s"), b"it\x92s".to_vec());
        assert_eq!(encode_win_ansi("日本"), b"??".to_vec());
    }

    #[test]
    fn test_render_single_page() {
        let renderer = PdfReportRenderer::new("Assist");
        let messages = vec![
            message(MessageRole::User, "What is the leave policy?"),
            message(MessageRole::Assistant, "Twenty days per year."),
        ];

        let mut bytes = Vec::new();
        renderer.render(&mut bytes, &chat(), "HR Helper", &messages).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.5"));

        let pages = shown_text(&bytes);
        assert_eq!(pages.len(), 1);
        let text = &pages[0];
        assert_eq!(text[0], "Chat with HR Helper");
        assert!(text[1].starts_with("Started: "));
        assert!(text.iter().any(|t| t.ends_with(" - User:")));
        assert!(text.iter().any(|t| t.ends_with(" - Assistant:")));
        assert!(text.contains(&"Twenty days per year.".to_string()));
        assert_eq!(text.last().map(String::as_str), Some("Generated by Assist"));
    }

    #[test]
    fn test_long_transcript_paginates() {
        let renderer = PdfReportRenderer::new("Assist");
        let paragraph = "lorem ipsum dolor sit amet ".repeat(40);
        let messages: Vec<_> = (0..30)
            .map(|i| {
                let role = if i % 2 == 0 {
                    MessageRole::User
                } else {
                    MessageRole::Assistant
                };
                message(role, &paragraph)
            })
            .collect();

        let mut bytes = Vec::new();
        renderer.render(&mut bytes, &chat(), "Helper", &messages).unwrap();

        let pages = shown_text(&bytes);
        assert!(pages.len() > 1);
        for page in &pages {
            assert_eq!(page.last().map(String::as_str), Some("Generated by Assist"));
        }
    }
}
