//! Inline side-effect directives embedded in streaming model output (spec
//! §4.13). New to the corpus: grounded stylistically on `llm-core`'s
//! `StreamChunk`/`ToolCallDelta` accumulate-by-index shape, built fresh
//! since the corpus has no equivalent of a mid-stream tag scanner.

use crate::context::PipelineContext;
use crate::events::EventKind;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A tag handler's per-invocation state, opaque to the parser.
pub type TagContext = Box<dyn std::any::Any + Send>;

#[async_trait]
pub trait StreamingTagHandler: Send + Sync {
    fn tag_name(&self) -> &str;

    /// Folded into the LLM step's system prompt describing how to invoke
    /// this tag.
    fn get_instructions(&self) -> String;

    async fn on_tag_start(
        &self,
        attributes: &HashMap<String, String>,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> TagContext;

    async fn on_content(&self, tag_context: &mut TagContext, content_fragment: &str, cancel: &CancellationToken);

    async fn on_tag_end(&self, tag_context: TagContext, cancel: &CancellationToken) -> Option<String>;

    /// Non-streaming fallback: the whole tag body arrived at once.
    async fn on_complete_tag(
        &self,
        attributes: &HashMap<String, String>,
        full_content: &str,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Option<String>;
}

struct OpenTag {
    handler: Arc<dyn StreamingTagHandler>,
    tag_context: TagContext,
    raw_content: String,
}

/// Scans a stream of text deltas for `<tagname attr="value">...</tagname>`
/// directives, routing handled tags through their handler and replacing the
/// whole span with the handler's placeholder. Unhandled tags pass through
/// unchanged. One parser instance belongs to exactly one LLM step
/// invocation (it holds in-flight scan state).
pub struct StreamingTagParser {
    handlers: HashMap<String, Arc<dyn StreamingTagHandler>>,
    buffer: String,
    open: Option<OpenTag>,
}

impl StreamingTagParser {
    pub fn new(handlers: Vec<Arc<dyn StreamingTagHandler>>) -> Self {
        StreamingTagParser {
            handlers: handlers.into_iter().map(|h| (h.tag_name().to_string(), h)).collect(),
            buffer: String::new(),
            open: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn instructions(&self) -> Option<String> {
        if self.handlers.is_empty() {
            return None;
        }
        let mut names: Vec<&String> = self.handlers.keys().collect();
        names.sort();
        let lines: Vec<String> = names
            .into_iter()
            .map(|name| self.handlers[name].get_instructions())
            .collect();
        Some(lines.join("\n"))
    }

    /// Feeds one text delta through the parser, returning the (possibly
    /// substituted) delta to surface to the caller.
    pub async fn feed(
        &mut self,
        delta: &str,
        ctx: &PipelineContext,
        step_name: &str,
        cancel: &CancellationToken,
    ) -> String {
        if self.handlers.is_empty() {
            return delta.to_string();
        }

        self.buffer.push_str(delta);
        let mut output = String::new();

        loop {
            if let Some(open) = self.open.as_mut() {
                let tag_name = open.handler.tag_name().to_string();
                let close_marker = format!("</{tag_name}>");
                match self.buffer.find(&close_marker) {
                    None => {
                        open.handler.on_content(&mut open.tag_context, &self.buffer, cancel).await;
                        open.raw_content.push_str(&self.buffer);
                        self.buffer.clear();
                        break;
                    }
                    Some(end) => {
                        let body = &self.buffer[..end];
                        open.handler.on_content(&mut open.tag_context, body, cancel).await;
                        open.raw_content.push_str(body);
                        let remainder = self.buffer[end + close_marker.len()..].to_string();

                        let open = self.open.take().unwrap();
                        ctx.emit(
                            Some(step_name),
                            EventKind::TagCompleted {
                                tag_name: tag_name.clone(),
                            },
                        );
                        let placeholder = open.handler.on_tag_end(open.tag_context, cancel).await;
                        output.push_str(&placeholder.unwrap_or_default());

                        self.buffer = remainder;
                    }
                }
                continue;
            }

            match find_tag_open(&self.buffer) {
                None => {
                    // No open tag in the buffer: flush everything except a
                    // trailing partial `<` that might be the start of one.
                    let safe_len = trailing_safe_len(&self.buffer);
                    output.push_str(&self.buffer[..safe_len]);
                    self.buffer.drain(..safe_len);
                    break;
                }
                Some((start, tag_end, tag_name, attributes)) => {
                    output.push_str(&self.buffer[..start]);
                    match self.handlers.get(&tag_name).cloned() {
                        None => {
                            // Unhandled tag: pass the opening tag through
                            // unchanged and keep scanning past it.
                            output.push_str(&self.buffer[start..tag_end]);
                            self.buffer.drain(..tag_end);
                        }
                        Some(handler) => {
                            ctx.emit(
                                Some(step_name),
                                EventKind::TagStarted {
                                    tag_name: tag_name.clone(),
                                },
                            );
                            let tag_context = handler.on_tag_start(&attributes, ctx, cancel).await;
                            self.open = Some(OpenTag {
                                handler,
                                tag_context,
                                raw_content: String::new(),
                            });
                            self.buffer.drain(..tag_end);
                        }
                    }
                }
            }
        }

        output
    }

    /// Non-streaming fallback: runs `on_complete_tag` for every fully
    /// formed `<tagname>...</tagname>` span found in `text`, substituting
    /// the handler's placeholder.
    pub async fn process_complete(
        &self,
        text: &str,
        ctx: &PipelineContext,
        step_name: &str,
        cancel: &CancellationToken,
    ) -> String {
        if self.handlers.is_empty() {
            return text.to_string();
        }

        let mut output = String::new();
        let mut remaining = text;

        while let Some((start, tag_end, tag_name, attributes)) = find_tag_open(remaining) {
            let Some(handler) = self.handlers.get(&tag_name) else {
                output.push_str(&remaining[..tag_end]);
                remaining = &remaining[tag_end..];
                continue;
            };

            let close_marker = format!("</{tag_name}>");
            let Some(close_start) = remaining[tag_end..].find(&close_marker) else {
                output.push_str(&remaining[..tag_end]);
                remaining = &remaining[tag_end..];
                continue;
            };

            output.push_str(&remaining[..start]);
            let body_start = tag_end;
            let body_end = tag_end + close_start;
            let body = &remaining[body_start..body_end];

            ctx.emit(
                Some(step_name),
                EventKind::TagStarted {
                    tag_name: tag_name.clone(),
                },
            );
            let placeholder = handler.on_complete_tag(&attributes, body, ctx, cancel).await;
            ctx.emit(
                Some(step_name),
                EventKind::TagCompleted {
                    tag_name: tag_name.clone(),
                },
            );
            output.push_str(&placeholder.unwrap_or_default());

            remaining = &remaining[body_end + close_marker.len()..];
        }
        output.push_str(remaining);
        output
    }
}

/// Finds the next `<tagname attr="value" ...>` and returns its start index,
/// the index immediately after `>`, the tag name, and its attribute map.
fn find_tag_open(text: &str) -> Option<(usize, usize, String, HashMap<String, String>)> {
    let start = text.find('<')?;
    let end_rel = text[start..].find('>')?;
    let end = start + end_rel + 1;
    let inner = &text[start + 1..end - 1];
    if inner.starts_with('/') || inner.is_empty() {
        return None;
    }
    let mut parts = inner.split_whitespace();
    let tag_name = parts.next()?.to_string();
    if !tag_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return None;
    }
    let attrs_text = &inner[tag_name.len()..];
    let attributes = parse_attributes(attrs_text);
    Some((start, end, tag_name, attributes))
}

fn parse_attributes(text: &str) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let mut rest = text;
    while let Some(eq) = rest.find('=') {
        let key = rest[..eq].trim();
        if key.is_empty() {
            break;
        }
        let after_eq = &rest[eq + 1..];
        let after_eq = after_eq.trim_start();
        if !after_eq.starts_with('"') {
            break;
        }
        let value_start = 1;
        let Some(value_end) = after_eq[value_start..].find('"') else {
            break;
        };
        let value = &after_eq[value_start..value_start + value_end];
        attributes.insert(key.to_string(), value.to_string());
        rest = &after_eq[value_start + value_end + 1..];
    }
    attributes
}

/// How much of `buffer` is safe to flush without risking splitting a `<`
/// that might turn out to start a tag once more bytes arrive.
fn trailing_safe_len(buffer: &str) -> usize {
    match buffer.rfind('<') {
        Some(idx) => idx,
        None => buffer.len(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationContext;
    use parking_lot::Mutex;

    struct RecordingHandler {
        name: String,
        received: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl StreamingTagHandler for RecordingHandler {
        fn tag_name(&self) -> &str {
            &self.name
        }

        fn get_instructions(&self) -> String {
            format!("use <{}> to trigger a side effect", self.name)
        }

        async fn on_tag_start(
            &self,
            _attributes: &HashMap<String, String>,
            _ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> TagContext {
            Box::new(String::new())
        }

        async fn on_content(&self, tag_context: &mut TagContext, content_fragment: &str, _cancel: &CancellationToken) {
            if let Some(buf) = tag_context.downcast_mut::<String>() {
                buf.push_str(content_fragment);
            }
        }

        async fn on_tag_end(&self, tag_context: TagContext, _cancel: &CancellationToken) -> Option<String> {
            if let Ok(buf) = tag_context.downcast::<String>() {
                self.received.lock().push(*buf);
            }
            Some(format!("[{}-done]", self.name))
        }

        async fn on_complete_tag(
            &self,
            _attributes: &HashMap<String, String>,
            full_content: &str,
            _ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> Option<String> {
            self.received.lock().push(full_content.to_string());
            Some(format!("[{}-done]", self.name))
        }
    }

    fn make_context() -> PipelineContext {
        PipelineContext::new(ConversationContext::new("conv-1", 1000))
    }

    #[tokio::test]
    async fn unhandled_tag_passes_through_unchanged() {
        let mut parser = StreamingTagParser::new(vec![]);
        let ctx = make_context();
        let cancel = CancellationToken::new();
        let out = parser.feed("hello <b>world</b>", &ctx, "step", &cancel).await;
        assert_eq!(out, "hello <b>world</b>");
    }

    #[tokio::test]
    async fn handled_tag_is_replaced_with_placeholder() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            name: "write_file".to_string(),
            received: received.clone(),
        });
        let mut parser = StreamingTagParser::new(vec![handler]);
        let ctx = make_context();
        let cancel = CancellationToken::new();

        let out = parser
            .feed("before <write_file path=\"a.txt\">contents</write_file> after", &ctx, "step", &cancel)
            .await;

        assert_eq!(out, "before [write_file-done] after");
        assert_eq!(received.lock()[0], "contents");
    }

    #[tokio::test]
    async fn tag_split_across_chunks_is_still_detected() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            name: "note".to_string(),
            received: received.clone(),
        });
        let mut parser = StreamingTagParser::new(vec![handler]);
        let ctx = make_context();
        let cancel = CancellationToken::new();

        let mut out = String::new();
        out += &parser.feed("before <no", &ctx, "step", &cancel).await;
        out += &parser.feed("te>hel", &ctx, "step", &cancel).await;
        out += &parser.feed("lo</note> after", &ctx, "step", &cancel).await;

        assert_eq!(out, "before [note-done] after");
        assert_eq!(received.lock()[0], "hello");
    }

    #[tokio::test]
    async fn process_complete_handles_non_streaming_fallback() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(RecordingHandler {
            name: "note".to_string(),
            received: received.clone(),
        });
        let parser = StreamingTagParser::new(vec![handler]);
        let ctx = make_context();
        let cancel = CancellationToken::new();

        let out = parser
            .process_complete("intro <note>body</note> outro", &ctx, "step", &cancel)
            .await;
        assert_eq!(out, "intro [note-done] outro");
    }

    #[test]
    fn instructions_join_all_handlers() {
        let handler_a = Arc::new(RecordingHandler {
            name: "a".to_string(),
            received: Arc::new(Mutex::new(Vec::new())),
        });
        let parser = StreamingTagParser::new(vec![handler_a]);
        assert!(parser.instructions().unwrap().contains("<a>"));
    }
}
