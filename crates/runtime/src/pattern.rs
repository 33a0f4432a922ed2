//! Lua-style pattern matching
//!
//! A pattern compiles to a small node list, then a backtracking matcher
//! walks it against the text. Supported constructs: `.`; the `%a %c %d %l
//! %p %s %u %w %x %z` classes with uppercase-negated variants; sets
//! `[...]` with `^` negation and `a-z` ranges; the quantifiers `* + ?`
//! (greedy) and `-` (lazy); the `^`/`$` anchors; and captures `(...)`.
//!
//! This is the engine behind the string natives (`stringFind`,
//! `stringGsub`, `stringMatch`); positions here are 0-based character
//! indices, and the natives translate to the 1-based surface convention.

use ghostlang_core::PatternError;

/// Capture count ceiling, matching the replacement syntax `%1..%9` with
/// headroom for match-only captures.
const MAX_CAPTURES: usize = 16;

/// Pattern length ceiling. The matcher recurses once per node, so this
/// also bounds its stack depth against hostile guest patterns.
const MAX_PATTERN_LEN: usize = 512;

#[derive(Debug, Clone)]
enum ClassSpec {
    /// `.`
    Any,
    Lit(char),
    /// One of the `%x` class letters; uppercase negates.
    Class(char),
    Set {
        negated: bool,
        items: Vec<SetItem>,
    },
}

#[derive(Debug, Clone)]
enum SetItem {
    Char(char),
    Range(char, char),
    Class(char),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quant {
    One,
    Star,
    Plus,
    Lazy,
    Opt,
}

#[derive(Debug, Clone)]
enum Node {
    Item { class: ClassSpec, quant: Quant },
    OpenCapture,
    CloseCapture,
    /// `$` at the end of the pattern.
    End,
}

/// A compiled pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    nodes: Vec<Node>,
    anchored: bool,
}

/// A successful match: 0-based char range plus captured substrings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchResult {
    pub start: usize,
    /// Exclusive.
    pub end: usize,
    pub captures: Vec<String>,
}

impl Pattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let chars: Vec<char> = pattern.chars().collect();
        if chars.len() > MAX_PATTERN_LEN {
            return Err(PatternError::TooLong);
        }
        let mut i = 0;
        let anchored = chars.first() == Some(&'^');
        if anchored {
            i = 1;
        }

        let mut nodes = Vec::new();
        let mut open = 0usize;
        let mut total = 0usize;
        while i < chars.len() {
            match chars[i] {
                '(' => {
                    total += 1;
                    if total > MAX_CAPTURES {
                        return Err(PatternError::TooManyCaptures);
                    }
                    open += 1;
                    nodes.push(Node::OpenCapture);
                    i += 1;
                }
                ')' => {
                    if open == 0 {
                        return Err(PatternError::UnbalancedCapture);
                    }
                    open -= 1;
                    nodes.push(Node::CloseCapture);
                    i += 1;
                }
                '$' if i + 1 == chars.len() => {
                    nodes.push(Node::End);
                    i += 1;
                }
                _ => {
                    let (class, next) = parse_single(&chars, i)?;
                    let (quant, next) = parse_quant(&chars, next);
                    nodes.push(Node::Item { class, quant });
                    i = next;
                }
            }
        }
        if open != 0 {
            return Err(PatternError::UnbalancedCapture);
        }
        Ok(Pattern { nodes, anchored })
    }

    /// First match at or after char offset `init`.
    pub fn search(&self, chars: &[char], init: usize) -> Option<MatchResult> {
        let mut start = init.min(chars.len());
        loop {
            let mut caps: Vec<Capture> = Vec::new();
            let matcher = Matcher {
                nodes: &self.nodes,
                text: chars,
            };
            if let Some(end) = matcher.match_nodes(0, start, &mut caps) {
                let captures = caps
                    .iter()
                    .map(|c| chars[c.start..c.end.unwrap_or(c.start)].iter().collect())
                    .collect();
                return Some(MatchResult {
                    start,
                    end,
                    captures,
                });
            }
            if self.anchored || start >= chars.len() {
                return None;
            }
            start += 1;
        }
    }

    pub fn is_anchored(&self) -> bool {
        self.anchored
    }
}

/// `find`: first match in `text` starting at 0-based char offset `init`.
pub fn find(text: &str, pattern: &str, init: usize) -> Result<Option<MatchResult>, PatternError> {
    let compiled = Pattern::compile(pattern)?;
    let chars: Vec<char> = text.chars().collect();
    Ok(compiled.search(&chars, init))
}

/// `match`: the first capture of the first match, or the whole match when
/// the pattern captures nothing.
pub fn match_str(
    text: &str,
    pattern: &str,
    init: usize,
) -> Result<Option<String>, PatternError> {
    let result = find(text, pattern, init)?;
    Ok(result.map(|m| {
        if let Some(first) = m.captures.first() {
            first.clone()
        } else {
            text.chars().skip(m.start).take(m.end - m.start).collect()
        }
    }))
}

/// `gsub`: replace every match, `%1..%9` referencing captures, `%0` the
/// whole match, and `%%` a literal percent. Returns the new string and the
/// replacement count.
pub fn gsub(text: &str, pattern: &str, replacement: &str) -> Result<(String, usize), PatternError> {
    let compiled = Pattern::compile(pattern)?;
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::new();
    let mut pos = 0usize;
    let mut count = 0usize;

    while pos <= chars.len() {
        let Some(m) = compiled.search(&chars, pos) else {
            break;
        };
        out.extend(&chars[pos..m.start]);
        expand_replacement(&mut out, replacement, &m, &chars)?;
        count += 1;
        if m.end > m.start {
            pos = m.end;
        } else {
            // Empty match: emit one char and step, or the loop never ends.
            if m.start < chars.len() {
                out.push(chars[m.start]);
            }
            pos = m.start + 1;
        }
        if compiled.anchored {
            break;
        }
    }
    out.extend(&chars[pos.min(chars.len())..]);
    Ok((out, count))
}

fn expand_replacement(
    out: &mut String,
    replacement: &str,
    m: &MatchResult,
    chars: &[char],
) -> Result<(), PatternError> {
    let mut it = replacement.chars();
    while let Some(ch) = it.next() {
        if ch != '%' {
            out.push(ch);
            continue;
        }
        match it.next() {
            None => return Err(PatternError::DanglingEscape),
            Some('%') => out.push('%'),
            Some(d) if d.is_ascii_digit() => {
                let index = (d as u8 - b'0') as usize;
                if index == 0 {
                    out.extend(&chars[m.start..m.end]);
                } else if let Some(capture) = m.captures.get(index - 1) {
                    out.push_str(capture);
                } else if index == 1 && m.captures.is_empty() {
                    // %1 with no captures refers to the whole match.
                    out.extend(&chars[m.start..m.end]);
                } else {
                    return Err(PatternError::InvalidCaptureIndex);
                }
            }
            Some(_) => return Err(PatternError::InvalidCaptureIndex),
        }
    }
    Ok(())
}

fn parse_single(chars: &[char], i: usize) -> Result<(ClassSpec, usize), PatternError> {
    match chars[i] {
        '.' => Ok((ClassSpec::Any, i + 1)),
        '%' => match chars.get(i + 1) {
            None => Err(PatternError::DanglingEscape),
            Some(&next) if next.is_ascii_alphabetic() => Ok((ClassSpec::Class(next), i + 2)),
            Some(&next) => Ok((ClassSpec::Lit(next), i + 2)),
        },
        '[' => parse_set(chars, i),
        other => Ok((ClassSpec::Lit(other), i + 1)),
    }
}

fn parse_set(chars: &[char], i: usize) -> Result<(ClassSpec, usize), PatternError> {
    let mut j = i + 1;
    let negated = chars.get(j) == Some(&'^');
    if negated {
        j += 1;
    }
    let mut items = Vec::new();
    let mut first = true;
    loop {
        let Some(&ch) = chars.get(j) else {
            return Err(PatternError::UnclosedSet);
        };
        // A ']' directly after the opening (or '^') is a literal.
        if ch == ']' && !first {
            return Ok((ClassSpec::Set { negated, items }, j + 1));
        }
        first = false;
        if ch == '%' {
            match chars.get(j + 1) {
                None => return Err(PatternError::DanglingEscape),
                Some(&c) if c.is_ascii_alphabetic() => items.push(SetItem::Class(c)),
                Some(&c) => items.push(SetItem::Char(c)),
            }
            j += 2;
        } else if chars.get(j + 1) == Some(&'-') && chars.get(j + 2).is_some_and(|c| *c != ']') {
            items.push(SetItem::Range(ch, chars[j + 2]));
            j += 3;
        } else {
            items.push(SetItem::Char(ch));
            j += 1;
        }
    }
}

fn parse_quant(chars: &[char], i: usize) -> (Quant, usize) {
    match chars.get(i) {
        Some('*') => (Quant::Star, i + 1),
        Some('+') => (Quant::Plus, i + 1),
        Some('-') => (Quant::Lazy, i + 1),
        Some('?') => (Quant::Opt, i + 1),
        _ => (Quant::One, i),
    }
}

fn class_match(letter: char, ch: char) -> bool {
    let result = match letter.to_ascii_lowercase() {
        'a' => ch.is_alphabetic(),
        'c' => ch.is_control(),
        'd' => ch.is_ascii_digit(),
        'l' => ch.is_lowercase(),
        'p' => ch.is_ascii_punctuation(),
        's' => ch.is_whitespace(),
        'u' => ch.is_uppercase(),
        'w' => ch.is_alphanumeric(),
        'x' => ch.is_ascii_hexdigit(),
        'z' => ch == '\0',
        // Escaped letters without a class meaning match themselves.
        _ => return ch == letter,
    };
    if letter.is_ascii_uppercase() {
        !result
    } else {
        result
    }
}

fn single_match(class: &ClassSpec, ch: char) -> bool {
    match class {
        ClassSpec::Any => true,
        ClassSpec::Lit(c) => ch == *c,
        ClassSpec::Class(letter) => class_match(*letter, ch),
        ClassSpec::Set { negated, items } => {
            let hit = items.iter().any(|item| match item {
                SetItem::Char(c) => ch == *c,
                SetItem::Range(lo, hi) => ch >= *lo && ch <= *hi,
                SetItem::Class(letter) => class_match(*letter, ch),
            });
            hit != *negated
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Capture {
    start: usize,
    end: Option<usize>,
}

struct Matcher<'p> {
    nodes: &'p [Node],
    text: &'p [char],
}

impl Matcher<'_> {
    /// Match nodes from `ni` at text position `ti`; returns the end of the
    /// whole match on success.
    fn match_nodes(&self, ni: usize, ti: usize, caps: &mut Vec<Capture>) -> Option<usize> {
        let Some(node) = self.nodes.get(ni) else {
            return Some(ti);
        };
        match node {
            Node::OpenCapture => {
                caps.push(Capture {
                    start: ti,
                    end: None,
                });
                let result = self.match_nodes(ni + 1, ti, caps);
                if result.is_none() {
                    caps.pop();
                }
                result
            }
            Node::CloseCapture => {
                let index = caps.iter().rposition(|c| c.end.is_none())?;
                caps[index].end = Some(ti);
                let result = self.match_nodes(ni + 1, ti, caps);
                if result.is_none() {
                    caps[index].end = None;
                }
                result
            }
            Node::End => {
                if ti == self.text.len() {
                    self.match_nodes(ni + 1, ti, caps)
                } else {
                    None
                }
            }
            Node::Item { class, quant } => match quant {
                Quant::One => {
                    if ti < self.text.len() && single_match(class, self.text[ti]) {
                        self.match_nodes(ni + 1, ti + 1, caps)
                    } else {
                        None
                    }
                }
                Quant::Opt => {
                    if ti < self.text.len() && single_match(class, self.text[ti]) {
                        if let Some(end) = self.match_nodes(ni + 1, ti + 1, caps) {
                            return Some(end);
                        }
                    }
                    self.match_nodes(ni + 1, ti, caps)
                }
                Quant::Star | Quant::Plus => {
                    let mut run = 0;
                    while ti + run < self.text.len() && single_match(class, self.text[ti + run]) {
                        run += 1;
                    }
                    let min = if *quant == Quant::Plus { 1 } else { 0 };
                    let mut take = run;
                    loop {
                        if take < min {
                            return None;
                        }
                        if let Some(end) = self.match_nodes(ni + 1, ti + take, caps) {
                            return Some(end);
                        }
                        if take == 0 {
                            return None;
                        }
                        take -= 1;
                    }
                }
                Quant::Lazy => {
                    let mut take = 0;
                    loop {
                        if let Some(end) = self.match_nodes(ni + 1, ti + take, caps) {
                            return Some(end);
                        }
                        if ti + take < self.text.len()
                            && single_match(class, self.text[ti + take])
                        {
                            take += 1;
                        } else {
                            return None;
                        }
                    }
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_literal_find() {
        let m = find("hello world", "world", 0).unwrap().unwrap();
        assert_eq!((m.start, m.end), (6, 11));
    }

    #[test]
    fn test_classes_and_quantifiers() {
        let m = find("abc 123 def", "%d+", 0).unwrap().unwrap();
        assert_eq!((m.start, m.end), (4, 7));

        // Negated class skips digits.
        let m = find("123abc", "%D+", 0).unwrap().unwrap();
        assert_eq!((m.start, m.end), (3, 6));
    }

    #[test]
    fn test_sets_ranges_and_negation() {
        let m = find("x42y", "[0-9]+", 0).unwrap().unwrap();
        assert_eq!((m.start, m.end), (1, 3));

        let m = find("abc!", "[^%a]", 0).unwrap().unwrap();
        assert_eq!(m.start, 3);
    }

    #[test]
    fn test_anchors() {
        assert!(find("hello", "^hell", 0).unwrap().is_some());
        assert!(find("shell", "^hell", 0).unwrap().is_none());
        let m = find("hold hat", "h%a+$", 0).unwrap().unwrap();
        assert_eq!(m.start, 5);
    }

    #[test]
    fn test_lazy_vs_greedy() {
        // Greedy eats to the last 'b'; lazy stops at the first.
        let greedy = find("aXbXb", "a.*b", 0).unwrap().unwrap();
        assert_eq!(greedy.end, 5);
        let lazy = find("aXbXb", "a.-b", 0).unwrap().unwrap();
        assert_eq!(lazy.end, 3);
    }

    #[test]
    fn test_captures() {
        let m = find("key=value", "(%w+)=(%w+)", 0).unwrap().unwrap();
        assert_eq!(m.captures, vec!["key".to_string(), "value".to_string()]);
    }

    #[test]
    fn test_match_str_returns_capture_or_whole() {
        assert_eq!(
            match_str("born in 1988", "%d+", 0).unwrap(),
            Some("1988".to_string())
        );
        assert_eq!(
            match_str("born in 1988", "in (%d+)", 0).unwrap(),
            Some("1988".to_string())
        );
        assert_eq!(match_str("abc", "%d", 0).unwrap(), None);
    }

    #[test]
    fn test_gsub_swaps_captures() {
        let (out, n) = gsub("hello world", "(%w+) (%w+)", "%2 %1").unwrap();
        assert_eq!(out, "world hello");
        assert_eq!(n, 1);
    }

    #[test]
    fn test_gsub_replaces_all_occurrences() {
        let (out, n) = gsub("one two three", "%w+", "x").unwrap();
        assert_eq!(out, "x x x");
        assert_eq!(n, 3);
    }

    #[test]
    fn test_gsub_literal_percent_and_whole_match() {
        let (out, _) = gsub("5", "%d", "%0%%").unwrap();
        assert_eq!(out, "5%");
    }

    #[test]
    fn test_gsub_empty_match_terminates() {
        let (out, _) = gsub("ab", "x*", "-").unwrap();
        // One replacement per position, never an infinite loop.
        assert_eq!(out, "-a-b-");
    }

    #[test]
    fn test_malformed_patterns_error() {
        assert_eq!(
            Pattern::compile("[abc").unwrap_err(),
            PatternError::UnclosedSet
        );
        assert_eq!(
            Pattern::compile("(a").unwrap_err(),
            PatternError::UnbalancedCapture
        );
        assert_eq!(
            Pattern::compile("a)").unwrap_err(),
            PatternError::UnbalancedCapture
        );
        assert_eq!(
            Pattern::compile("abc%").unwrap_err(),
            PatternError::DanglingEscape
        );
    }

    #[test]
    fn test_oversized_pattern_is_rejected() {
        let big = "a".repeat(MAX_PATTERN_LEN + 1);
        assert_eq!(Pattern::compile(&big).unwrap_err(), PatternError::TooLong);
    }

    #[test]
    fn test_invalid_replacement_index() {
        assert_eq!(
            gsub("abc", "(a)", "%3").unwrap_err(),
            PatternError::InvalidCaptureIndex
        );
    }

    #[test]
    fn test_dollar_mid_pattern_is_literal() {
        let m = find("a$b", "a$b", 0).unwrap().unwrap();
        assert_eq!((m.start, m.end), (0, 3));
    }
}
