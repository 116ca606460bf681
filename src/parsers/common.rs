use std::fmt::Write;

use once_cell::sync::Lazy;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use regex::Regex;

/// Deepest fenced quote nesting that gets converted to quote lines.
pub const MAX_QUOTE_DEPTH: usize = 8;
pub const REPLY_PREVIEW_CHARS: usize = 200;
pub const ZERO_WIDTH_SPACE: char = '\u{200b}';

static CUSTOM_EMOJI_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<a?:(\w+):\d+>").expect("custom emoji regex must compile"));
static URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<https?://[^>\s]+>|https?://[^\s<>()\[\]]+").expect("url regex must compile")
});

fn backtick_run(text: &str, at: usize) -> usize {
    text[at..].bytes().take_while(|b| *b == b'`').count()
}

/// Longest run of consecutive backticks anywhere in `text`.
pub fn longest_backtick_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for b in text.bytes() {
        if b == b'`' {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Wraps `body` in a ```` ```quote ```` block wider than any fence inside it.
pub fn fenced_quote(body: &str, min_width: usize) -> String {
    let width = min_width.max(3).max(longest_backtick_run(body) + 1);
    let fence = "`".repeat(width);
    format!("{fence}quote\n{body}\n{fence}")
}

pub fn nest_quote(text: &str, depth: usize) -> String {
    (0..depth).fold(text.to_string(), |acc, _| fenced_quote(&acc, 3))
}

/// Strips one quote fence when `text` is exactly one fenced quote block.
pub fn unnest_quote(text: &str) -> Option<String> {
    let width = backtick_run(text, 0);
    if width < 3 {
        return None;
    }
    let body = text[width..].strip_prefix("quote\n")?;
    let fence = "`".repeat(width);
    let inner = body.strip_suffix(&fence)?.strip_suffix('\n')?;
    Some(inner.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FencedBlock<'a> {
    pub start: usize,
    pub end: usize,
    pub argument: &'a str,
    pub body: &'a str,
    pub trailing_newline: bool,
}

/// Finds the next ```` ```<info> ```` block at or after `from`.
///
/// The closing fence is the first line break followed by exactly as many
/// backticks as the opener.
pub fn find_fenced_block<'a>(text: &'a str, from: usize, info: &str) -> Option<FencedBlock<'a>> {
    let mut search = from;
    while let Some(offset) = text[search..].find("```") {
        let start = search + offset;
        let width = backtick_run(text, start);
        let after_fence = start + width;
        search = after_fence;

        let Some(header) = text[after_fence..].strip_prefix(info) else {
            continue;
        };
        let Some(line_end) = header.find('\n') else {
            continue;
        };
        let argument = &header[..line_end];
        let body_start = after_fence + info.len() + line_end + 1;

        let fence = format!("\n{}", "`".repeat(width));
        let mut scan = body_start;
        while let Some(found) = text[scan..].find(&fence) {
            let close = scan + found;
            let close_end = close + fence.len();
            if text[close_end..].starts_with('`') {
                scan = close + 1;
                continue;
            }
            let trailing_newline = text[close_end..].starts_with('\n');
            return Some(FencedBlock {
                start,
                end: close_end + usize::from(trailing_newline),
                argument,
                body: &text[body_start..close],
                trailing_newline,
            });
        }
    }
    None
}

/// Replaces every fenced block with the given info string.
pub fn replace_fenced_blocks(
    text: &str,
    info: &str,
    mut render: impl FnMut(&FencedBlock<'_>) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    let mut search = 0;
    while let Some(block) = find_fenced_block(text, search, info) {
        search = block.end;
        let Some(rendered) = render(&block) else {
            continue;
        };
        out.push_str(&text[pos..block.start]);
        out.push_str(&rendered);
        if block.trailing_newline && block.end < text.len() {
            out.push('\n');
        }
        pos = block.end;
        search = block.end;
    }
    out.push_str(&text[pos..]);
    out
}

/// Converts fenced quote blocks into `> ` quote lines, innermost levels first.
pub fn quote_blocks_to_lines(text: &str) -> String {
    quote_blocks_at_depth(text, 1)
}

fn quote_blocks_at_depth(text: &str, depth: usize) -> String {
    replace_fenced_blocks(text, "quote", |block| {
        if !block.argument.trim().is_empty() {
            return None;
        }
        let body = if depth < MAX_QUOTE_DEPTH && block.body.contains("quote\n") {
            quote_blocks_at_depth(block.body, depth + 1)
        } else {
            block.body.to_string()
        };
        Some(format!("> {}", body.replace('\n', "\n> ")))
    })
}

/// First `max_chars` characters of `content` on one line, without quoted lines.
pub fn preview(content: &str, max_chars: usize) -> String {
    let folded = content
        .lines()
        .filter(|line| !line.trim_start().starts_with('>'))
        .collect::<Vec<_>>()
        .join(" ");
    let mut chars = folded.chars();
    let mut out: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        out.push('…');
    }
    out
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn joined_len(lines: &[&str]) -> usize {
    lines.iter().map(|line| char_len(line)).sum::<usize>() + lines.len().saturating_sub(1)
}

/// Backtick fences still open after `lines`, outermost first.
///
/// A bare fence of the same width closes the innermost block. Only quote and
/// spoiler blocks can contain further fences.
fn open_fences(lines: &[&str]) -> Vec<usize> {
    let mut stack: Vec<(usize, bool)> = Vec::new();
    for line in lines {
        let line = line.trim_end();
        let width = backtick_run(line, 0);
        if width < 3 {
            continue;
        }
        let info = line[width..].trim();
        if info.contains('`') {
            continue;
        }
        if info.is_empty() && stack.last().is_some_and(|&(open, _)| open == width) {
            stack.pop();
        } else if !stack.last().is_some_and(|&(_, code)| code) {
            let code = !matches!(info.split_whitespace().next(), Some("quote" | "spoiler"));
            stack.push((width, code));
        }
    }
    stack.into_iter().map(|(width, _)| width).collect()
}

fn fence_closers(lines: &[&str]) -> String {
    open_fences(lines)
        .iter()
        .rev()
        .map(|width| format!("\n{}", "`".repeat(*width)))
        .collect()
}

fn closed_len(lines: &[&str]) -> usize {
    joined_len(lines) + char_len(&fence_closers(lines))
}

/// Keeps `text` within `limit` characters by dropping trailing content and
/// appending `suffix`.
///
/// Quoted lines are dropped from the end first, then any line. A single
/// remaining line that is still too long is cut at the last whitespace.
/// Fences left open by the cut are closed before the suffix.
pub fn enforce_length(text: &str, limit: usize, suffix: &str) -> String {
    if char_len(text) <= limit {
        return text.to_string();
    }
    let suffix_len = char_len(suffix);
    if suffix_len >= limit {
        return suffix.chars().take(limit).collect();
    }
    let budget = limit - suffix_len;

    let mut lines: Vec<&str> = text.lines().collect();
    while closed_len(&lines) > budget {
        match lines.iter().rposition(|l| l.starts_with('>')) {
            Some(index) if lines.len() > 1 => {
                lines.remove(index);
            }
            _ => break,
        }
    }
    while closed_len(&lines) > budget && lines.len() > 1 {
        lines.pop();
    }

    let closers = fence_closers(&lines);
    let room = budget.saturating_sub(char_len(&closers));
    let mut kept = lines.join("\n");
    if char_len(&kept) > room {
        let cut: String = kept.chars().take(room).collect();
        kept = match cut.rfind(char::is_whitespace) {
            Some(index) if index > 0 => cut[..index].trim_end().to_string(),
            _ => cut,
        };
    }
    format!("{kept}{closers}{suffix}")
}

/// Text with code spans and URLs swapped for placeholders.
#[derive(Debug)]
pub struct MaskedText {
    pub text: String,
    spans: Vec<String>,
}

const PLACEHOLDER_MARK: char = '\u{E000}';
const MAX_PLACEHOLDERS: usize = 6000;

fn placeholder(index: usize) -> Option<String> {
    let id = char::from_u32(0xE001 + u32::try_from(index).ok()?)?;
    Some(format!("{PLACEHOLDER_MARK}{id}{PLACEHOLDER_MARK}"))
}

impl MaskedText {
    fn push(&mut self, out: &mut String, span: &str) {
        match (self.spans.len() < MAX_PLACEHOLDERS)
            .then(|| placeholder(self.spans.len()))
            .flatten()
        {
            Some(marker) => {
                out.push_str(&marker);
                self.spans.push(span.to_string());
            }
            None => out.push_str(span),
        }
    }

    pub fn restore(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (index, span) in self.spans.iter().enumerate() {
            if let Some(marker) = placeholder(index) {
                out = out.replacen(&marker, span, 1);
            }
        }
        out
    }
}

/// Fenced blocks whose body is still markdown rather than code.
const MARKDOWN_FENCES: [&str; 2] = ["quote", "spoiler"];

fn markdown_fence_at(text: &str, start: usize) -> Option<FencedBlock<'_>> {
    if start > 0 && !text[..start].ends_with('\n') {
        return None;
    }
    MARKDOWN_FENCES.iter().find_map(|info| {
        find_fenced_block(text, start, info).filter(|block| block.start == start)
    })
}

fn mask_code_into(text: &str, masked: &mut MaskedText, out: &mut String) {
    let mut pos = 0;
    let mut search = 0;
    while let Some(offset) = text[search..].find('`') {
        let start = search + offset;

        if let Some(block) = markdown_fence_at(text, start)
            && let Some(opener_len) = text[start..].find('\n')
        {
            let body_start = start + opener_len + 1;
            let body_end = body_start + block.body.len();
            out.push_str(&text[pos..body_start]);
            mask_code_into(block.body, masked, out);
            out.push_str(&text[body_end..block.end]);
            pos = block.end;
            search = block.end;
            continue;
        }

        let width = backtick_run(text, start);
        let fence = "`".repeat(width);
        let body_start = start + width;

        let mut scan = body_start;
        let mut close = None;
        while let Some(found) = text[scan..].find(&fence) {
            let at = scan + found;
            let run = backtick_run(text, at);
            if run == width {
                close = Some(at + width);
                break;
            }
            scan = at + run;
        }

        match close {
            Some(end) => {
                out.push_str(&text[pos..start]);
                masked.push(out, &text[start..end]);
                pos = end;
                search = end;
            }
            None => search = body_start,
        }
    }
    out.push_str(&text[pos..]);
}

/// Masks inline code and fenced code. Quote and spoiler bodies stay visible.
pub fn mask_code(text: &str) -> MaskedText {
    let mut masked = MaskedText {
        text: String::new(),
        spans: Vec::new(),
    };
    let mut out = String::with_capacity(text.len());
    mask_code_into(text, &mut masked, &mut out);
    masked.text = out;
    masked
}

/// Masks code and URLs so pattern matching skips them.
pub fn mask_code_spans(text: &str) -> MaskedText {
    let mut masked = mask_code(text);
    let code_masked = std::mem::take(&mut masked.text);

    let mut out = String::with_capacity(code_masked.len());
    let mut last = 0;
    for url in URL_RE.find_iter(&code_masked) {
        out.push_str(&code_masked[last..url.start()]);
        masked.push(&mut out, url.as_str());
        last = url.end();
    }
    out.push_str(&code_masked[last..]);

    masked.text = out;
    masked
}

pub fn custom_emoji_to_text(text: &str) -> String {
    CUSTOM_EMOJI_RE.replace_all(text, ":$1:").into_owned()
}

/// Applies `(from, to)` replacements in order.
pub fn apply_replacements<'a>(text: &str, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    pairs
        .into_iter()
        .filter(|(from, _)| !from.is_empty())
        .fold(text.to_string(), |acc, (from, to)| acc.replace(from, to))
}

/// Bytes `encodeURIComponent` escapes, plus `.()` which Zulip escapes too.
const HASH_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'');

/// Zulip's narrow hash encoding: percent-encode, then `%` becomes `.`.
pub fn encode_hash_component(value: &str) -> String {
    utf8_percent_encode(value, HASH_COMPONENT)
        .to_string()
        .replace('%', ".")
}

pub fn narrow_link(
    realm: &str,
    stream_id: i64,
    stream_name: Option<&str>,
    topic: &str,
    message_id: Option<i64>,
) -> String {
    let stream = match stream_name {
        Some(name) => format!("{stream_id}-{}", encode_hash_component(name)),
        None => stream_id.to_string(),
    };
    let mut link = format!(
        "{}/#narrow/channel/{stream}/topic/{}",
        realm.trim_end_matches('/'),
        encode_hash_component(topic)
    );
    if let Some(id) = message_id {
        let _ = write!(link, "/near/{id}");
    }
    link
}

pub fn discord_message_link(guild_id: Option<&str>, channel_id: &str, message_id: &str) -> String {
    format!(
        "https://discord.com/channels/{}/{channel_id}/{message_id}",
        guild_id.unwrap_or("@me")
    )
}

/// A regex match detached from its haystack, so lookups can run between matches.
#[derive(Debug, Clone)]
pub struct OwnedMatch {
    pub start: usize,
    pub end: usize,
    groups: Vec<Option<String>>,
}

impl OwnedMatch {
    pub fn group(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(|g| g.as_deref())
    }
}

pub fn owned_matches(re: &Regex, text: &str) -> Vec<OwnedMatch> {
    re.captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some(OwnedMatch {
                start: whole.start(),
                end: whole.end(),
                groups: caps
                    .iter()
                    .map(|g| g.map(|m| m.as_str().to_string()))
                    .collect(),
            })
        })
        .collect()
}

/// Rebuilds `text` with ordered, non-overlapping `(start, end, replacement)` edits.
pub fn splice(text: &str, edits: Vec<(usize, usize, String)>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    for (start, end, replacement) in edits {
        out.push_str(&text[last..start]);
        out.push_str(&replacement);
        last = end;
    }
    out.push_str(&text[last..]);
    out
}
