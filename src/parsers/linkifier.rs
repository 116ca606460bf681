//! Zulip realm linkifiers compiled into native match rules.
//!
//! Zulip writes patterns in Python syntax with `(?P<name>...)` groups and
//! leading inline flags. [`translate_pattern`] rewrites one pattern into an
//! unnamed-group pattern plus the group index to name table, and
//! [`LinkifierSet`] holds an ordered, immutable rule set built from those.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use regex::{Captures, Regex, RegexBuilder};
use tracing::{debug, warn};

use super::url_template::UrlTemplate;
use crate::config::LimitsConfig;
use crate::error::BridgeError;
use crate::zulip::LinkifierSource;

const REGEX_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslatedPattern {
    pub pattern: String,
    /// 1-based capture group index and the name it had in the source pattern.
    pub group_names: Vec<(usize, String)>,
    pub case_insensitive: bool,
    pub multi_line: bool,
}

/// Rewrites named groups to plain groups and lifts inline flags out of the pattern.
pub fn translate_pattern(source: &str) -> Result<TranslatedPattern, BridgeError> {
    let mut out = String::with_capacity(source.len());
    let mut group_names = Vec::new();
    let mut group_index = 0;
    let mut case_insensitive = false;
    let mut multi_line = false;
    let mut in_class = false;

    let mut rest = source;
    while let Some(c) = rest.chars().next() {
        match c {
            '\\' => {
                let mut escaped = rest.chars();
                escaped.next();
                let len = 1 + escaped.next().map_or(0, char::len_utf8);
                out.push_str(&rest[..len]);
                rest = &rest[len..];
                continue;
            }
            '[' if !in_class => {
                in_class = true;
                let mut len = 1;
                if rest[len..].starts_with('^') {
                    len += 1;
                }
                // A `]` right after the opening bracket is a literal.
                if rest[len..].starts_with(']') {
                    len += 1;
                }
                out.push_str(&rest[..len]);
                rest = &rest[len..];
                continue;
            }
            ']' if in_class => in_class = false,
            '(' if !in_class => {
                if let Some(after) = rest.strip_prefix("(?P<") {
                    let end = after.find('>').ok_or_else(|| {
                        BridgeError::PatternCompilation(format!("unterminated group name in {source:?}"))
                    })?;
                    let name = &after[..end];
                    if name.is_empty() {
                        return Err(BridgeError::PatternCompilation(format!(
                            "empty group name in {source:?}"
                        )));
                    }
                    group_index += 1;
                    group_names.push((group_index, name.to_string()));
                    out.push('(');
                    rest = &after[end + 1..];
                    continue;
                }
                if let Some(flags) = inline_flags(rest) {
                    case_insensitive |= flags.contains('i');
                    multi_line |= flags.contains('m');
                    rest = &rest[flags.len() + 3..];
                    continue;
                }
                if !rest.starts_with("(?") {
                    group_index += 1;
                }
            }
            _ => {}
        }
        out.push(c);
        rest = &rest[c.len_utf8()..];
    }

    Ok(TranslatedPattern {
        pattern: out,
        group_names,
        case_insensitive,
        multi_line,
    })
}

/// Letters of a standalone `(?flags)` group at the start of `text`.
fn inline_flags(text: &str) -> Option<&str> {
    let body = text.strip_prefix("(?")?;
    let end = body.find(')')?;
    let flags = &body[..end];
    (!flags.is_empty() && flags.chars().all(|c| "aiLmsux".contains(c))).then_some(flags)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkifierLimits {
    pub max_rules: usize,
    pub max_pattern_length: usize,
}

impl From<&LimitsConfig> for LinkifierLimits {
    fn from(config: &LimitsConfig) -> Self {
        Self {
            max_rules: config.max_linkifiers,
            max_pattern_length: config.max_linkifier_pattern_length,
        }
    }
}

impl Default for LinkifierLimits {
    fn default() -> Self {
        Self {
            max_rules: 256,
            max_pattern_length: 1000,
        }
    }
}

#[derive(Debug)]
pub struct LinkifierRule {
    regex: Regex,
    template: UrlTemplate,
    group_names: Vec<(usize, String)>,
}

struct LinkMatch {
    start: usize,
    end: usize,
    href: String,
}

impl LinkifierRule {
    pub fn compile(source: &LinkifierSource, limits: &LinkifierLimits) -> Result<Self, BridgeError> {
        if source.pattern.len() > limits.max_pattern_length {
            return Err(BridgeError::PatternCompilation(format!(
                "pattern is {} bytes, limit is {}",
                source.pattern.len(),
                limits.max_pattern_length
            )));
        }

        let translated = translate_pattern(&source.pattern)?;
        let regex = RegexBuilder::new(&translated.pattern)
            .case_insensitive(translated.case_insensitive)
            .multi_line(translated.multi_line)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| BridgeError::PatternCompilation(e.to_string()))?;
        let template = UrlTemplate::parse(&source.url_template)
            .map_err(|e| BridgeError::PatternCompilation(e.to_string()))?;

        Ok(Self {
            regex,
            template,
            group_names: translated.group_names,
        })
    }

    fn expand(&self, captures: &Captures<'_>) -> String {
        let values: HashMap<&str, &str> = self
            .group_names
            .iter()
            .filter_map(|(index, name)| {
                captures
                    .get(*index)
                    .map(|m| (name.as_str(), m.as_str()))
            })
            .collect();
        self.template.expand(&values)
    }

    /// Next non-empty match at or after `from` that is not followed by a word character.
    fn find_at(&self, text: &str, from: usize) -> Option<LinkMatch> {
        let mut at = from;
        while at <= text.len() {
            let captures = self.regex.captures_at(text, at)?;
            let whole = captures.get(0)?;
            let bounded = text[whole.end()..].chars().next().is_none_or(|c| !is_word_char(c));
            if bounded && !whole.is_empty() {
                return Some(LinkMatch {
                    start: whole.start(),
                    end: whole.end(),
                    href: self.expand(&captures),
                });
            }
            at = whole.start() + text[whole.start()..].chars().next().map_or(1, char::len_utf8);
        }
        None
    }
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// An ordered rule set. Never mutated after construction.
#[derive(Debug, Default)]
pub struct LinkifierSet {
    rules: Vec<LinkifierRule>,
}

impl LinkifierSet {
    pub fn compile(sources: &[LinkifierSource], limits: &LinkifierLimits) -> Self {
        if sources.len() > limits.max_rules {
            warn!(
                received = sources.len(),
                limit = limits.max_rules,
                "too many linkifiers, ignoring the excess"
            );
        }

        let rules = sources
            .iter()
            .take(limits.max_rules)
            .filter_map(|source| match LinkifierRule::compile(source, limits) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    warn!(id = ?source.id, pattern = %source.pattern, error = %e, "skipping linkifier");
                    None
                }
            })
            .collect();

        Self { rules }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Turns every match into `[match](<url>)` in a single left-to-right pass.
    ///
    /// When several rules match at the same position the earlier rule wins.
    pub fn linkify(&self, text: &str) -> String {
        if self.rules.is_empty() {
            return text.to_string();
        }

        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        while pos < text.len() {
            let Some(found) = self
                .rules
                .iter()
                .filter_map(|rule| rule.find_at(text, pos))
                .min_by_key(|m| m.start)
            else {
                break;
            };
            out.push_str(&text[pos..found.start]);
            out.push_str(&format!("[{}](<{}>)", &text[found.start..found.end], found.href));
            pos = found.end;
        }
        out.push_str(&text[pos..]);
        out
    }
}

/// Current linkifier snapshot, swapped whole when the realm configuration changes.
pub struct LinkifierStore {
    current: RwLock<Arc<LinkifierSet>>,
    limits: LinkifierLimits,
}

impl LinkifierStore {
    pub fn new(limits: LinkifierLimits) -> Self {
        Self {
            current: RwLock::new(Arc::new(LinkifierSet::default())),
            limits,
        }
    }

    pub fn snapshot(&self) -> Arc<LinkifierSet> {
        self.current.read().clone()
    }

    /// Compiles `sources` and installs them; returns the number of usable rules.
    pub fn replace(&self, sources: &[LinkifierSource]) -> usize {
        let set = Arc::new(LinkifierSet::compile(sources, &self.limits));
        let count = set.len();
        *self.current.write() = set;
        debug!(received = sources.len(), compiled = count, "installed linkifiers");
        count
    }
}
