//! Rule-based grammars: recursive alternatives with repeat bounds.
//!
//! Syntax (parsed once at construction):
//!
//! ```text
//! rule   := alt
//! alt    := seq ( '|' seq )*
//! seq    := item*
//! item   := atom repeat?
//! atom   := token | '"' words '"' | '(' alt ')' | '[' alt ']'
//! repeat := '<' n '>' | '<' m '-' '>' | '<' m '-' n '>'
//! ```
//!
//! A token is a DTMF symbol or a word; matching is case-insensitive. The rule
//! compiles to a small NFA and [`RuleCursor`] walks it one token at a time.

use std::collections::BTreeSet;

use crate::error::{Result, VxiError};

/// Bounded repeats are expanded inline; keep that expansion sane.
const MAX_REPEAT: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Token(String),
    Seq(Vec<Rule>),
    Alt(Vec<Rule>),
    Repeat {
        rule: Box<Rule>,
        min: u32,
        max: Option<u32>,
    },
}

#[derive(Debug, Clone, Default)]
struct State {
    /// `None` label = epsilon edge.
    edges: Vec<(Option<String>, usize)>,
}

/// A compiled rule grammar.
#[derive(Debug, Clone)]
pub struct RuleGrammar {
    source: String,
    states: Vec<State>,
    start: usize,
    accept: usize,
}

impl RuleGrammar {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = lex(source)?;
        let mut parser = RuleParser { tokens, pos: 0 };
        let rule = parser.alt()?;
        if parser.pos != parser.tokens.len() {
            return Err(VxiError::Grammar(format!(
                "unexpected {:?} in rule '{source}'",
                parser.tokens[parser.pos]
            )));
        }
        let mut nfa = Nfa::default();
        let (start, accept) = nfa.build(&rule)?;
        Ok(Self {
            source: source.to_string(),
            states: nfa.states,
            start,
            accept,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Every token the grammar can consume, for recognizer vocabulary hints.
    pub fn vocabulary(&self) -> Vec<String> {
        let mut words: Vec<String> = self
            .states
            .iter()
            .flat_map(|s| s.edges.iter().filter_map(|(l, _)| l.clone()))
            .collect();
        words.sort();
        words.dedup();
        words
    }

    pub fn cursor(&self) -> RuleCursor {
        let mut active = BTreeSet::new();
        active.insert(self.start);
        RuleCursor {
            active: self.closure(active),
        }
    }

    fn closure(&self, mut set: BTreeSet<usize>) -> BTreeSet<usize> {
        let mut stack: Vec<usize> = set.iter().copied().collect();
        while let Some(s) = stack.pop() {
            for (label, to) in &self.states[s].edges {
                if label.is_none() && set.insert(*to) {
                    stack.push(*to);
                }
            }
        }
        set
    }

    /// Advance `cursor` by one token. Returns `false` (cursor unchanged)
    /// when no candidate accepts the token.
    pub fn feed(&self, cursor: &mut RuleCursor, token: &str) -> bool {
        let token = token.to_lowercase();
        let next: BTreeSet<usize> = cursor
            .active
            .iter()
            .flat_map(|&s| self.states[s].edges.iter())
            .filter(|(label, _)| label.as_deref() == Some(token.as_str()))
            .map(|(_, to)| *to)
            .collect();
        if next.is_empty() {
            return false;
        }
        cursor.active = self.closure(next);
        true
    }

    /// The tokens fed so far form a complete match.
    pub fn is_complete(&self, cursor: &RuleCursor) -> bool {
        cursor.active.contains(&self.accept)
    }

    /// More tokens could still extend the match.
    pub fn can_continue(&self, cursor: &RuleCursor) -> bool {
        cursor
            .active
            .iter()
            .any(|&s| self.states[s].edges.iter().any(|(l, _)| l.is_some()))
    }
}

impl PartialEq for RuleGrammar {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

/// Position inside a [`RuleGrammar`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleCursor {
    active: BTreeSet<usize>,
}

// ── NFA construction ─────────────────────────────────────────────────────────

#[derive(Default)]
struct Nfa {
    states: Vec<State>,
}

impl Nfa {
    fn state(&mut self) -> usize {
        self.states.push(State::default());
        self.states.len() - 1
    }

    fn edge(&mut self, from: usize, label: Option<String>, to: usize) {
        self.states[from].edges.push((label, to));
    }

    /// Returns (entry, exit) states of the fragment.
    fn build(&mut self, rule: &Rule) -> Result<(usize, usize)> {
        match rule {
            Rule::Token(t) => {
                let (a, b) = (self.state(), self.state());
                self.edge(a, Some(t.to_lowercase()), b);
                Ok((a, b))
            }
            Rule::Seq(items) => {
                let entry = self.state();
                let mut tail = entry;
                for item in items {
                    let (a, b) = self.build(item)?;
                    self.edge(tail, None, a);
                    tail = b;
                }
                Ok((entry, tail))
            }
            Rule::Alt(options) => {
                let (entry, exit) = (self.state(), self.state());
                for option in options {
                    let (a, b) = self.build(option)?;
                    self.edge(entry, None, a);
                    self.edge(b, None, exit);
                }
                Ok((entry, exit))
            }
            Rule::Repeat { rule, min, max } => {
                if *min > MAX_REPEAT || max.map_or(false, |m| m > MAX_REPEAT) {
                    return Err(VxiError::Grammar(format!(
                        "repeat bound exceeds {MAX_REPEAT}"
                    )));
                }
                let entry = self.state();
                let mut tail = entry;
                for _ in 0..*min {
                    let (a, b) = self.build(rule)?;
                    self.edge(tail, None, a);
                    tail = b;
                }
                let exit = self.state();
                self.edge(tail, None, exit);
                match max {
                    Some(max) => {
                        for _ in *min..*max {
                            let (a, b) = self.build(rule)?;
                            self.edge(tail, None, a);
                            self.edge(b, None, exit);
                            tail = b;
                        }
                    }
                    None => {
                        let (a, b) = self.build(rule)?;
                        self.edge(tail, None, a);
                        self.edge(b, None, a);
                        self.edge(b, None, exit);
                    }
                }
                Ok((entry, exit))
            }
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Lexeme {
    Word(String),
    Quoted(Vec<String>),
    Bar,
    Open(char),
    Close(char),
    Repeat(u32, Option<u32>),
}

fn lex(source: &str) -> Result<Vec<Lexeme>> {
    let mut out = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                out.push(Lexeme::Bar);
            }
            '(' | '[' => {
                chars.next();
                out.push(Lexeme::Open(c));
            }
            ')' | ']' => {
                chars.next();
                out.push(Lexeme::Close(c));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(ch) => text.push(ch),
                        None => return Err(VxiError::Grammar("unterminated quote".into())),
                    }
                }
                out.push(Lexeme::Quoted(
                    text.split_whitespace().map(str::to_string).collect(),
                ));
            }
            '<' => {
                chars.next();
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some('>') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(VxiError::Grammar("unterminated repeat".into())),
                    }
                }
                out.push(parse_repeat(&body)?);
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || "|()[]<>\"".contains(ch) {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                out.push(Lexeme::Word(word));
            }
        }
    }
    Ok(out)
}

fn parse_repeat(body: &str) -> Result<Lexeme> {
    let bad = || VxiError::Grammar(format!("bad repeat <{body}>"));
    let num = |s: &str| s.trim().parse::<u32>().map_err(|_| bad());
    match body.split_once('-') {
        None => {
            let n = num(body)?;
            Ok(Lexeme::Repeat(n, Some(n)))
        }
        Some((min, max)) if max.trim().is_empty() => Ok(Lexeme::Repeat(num(min)?, None)),
        Some((min, max)) => {
            let (min, max) = (num(min)?, num(max)?);
            if max < min {
                return Err(bad());
            }
            Ok(Lexeme::Repeat(min, Some(max)))
        }
    }
}

struct RuleParser {
    tokens: Vec<Lexeme>,
    pos: usize,
}

impl RuleParser {
    fn alt(&mut self) -> Result<Rule> {
        let mut options = vec![self.seq()?];
        while self.tokens.get(self.pos) == Some(&Lexeme::Bar) {
            self.pos += 1;
            options.push(self.seq()?);
        }
        Ok(if options.len() == 1 {
            options.remove(0)
        } else {
            Rule::Alt(options)
        })
    }

    fn seq(&mut self) -> Result<Rule> {
        let mut items = Vec::new();
        while let Some(tok) = self.tokens.get(self.pos) {
            if matches!(tok, Lexeme::Bar | Lexeme::Close(_)) {
                break;
            }
            let mut item = self.atom()?;
            if let Some(Lexeme::Repeat(min, max)) = self.tokens.get(self.pos) {
                item = Rule::Repeat {
                    rule: Box::new(item),
                    min: *min,
                    max: *max,
                };
                self.pos += 1;
            }
            items.push(item);
        }
        if items.is_empty() {
            return Err(VxiError::Grammar("empty alternative".into()));
        }
        Ok(if items.len() == 1 {
            items.remove(0)
        } else {
            Rule::Seq(items)
        })
    }

    fn atom(&mut self) -> Result<Rule> {
        let tok = self.tokens[self.pos].clone();
        self.pos += 1;
        match tok {
            Lexeme::Word(w) => Ok(Rule::Token(w)),
            Lexeme::Quoted(words) if !words.is_empty() => {
                Ok(Rule::Seq(words.into_iter().map(Rule::Token).collect()))
            }
            Lexeme::Open(open) => {
                let inner = self.alt()?;
                let close = if open == '(' { ')' } else { ']' };
                if self.tokens.get(self.pos) != Some(&Lexeme::Close(close)) {
                    return Err(VxiError::Grammar(format!("missing '{close}'")));
                }
                self.pos += 1;
                Ok(if open == '[' {
                    Rule::Repeat {
                        rule: Box::new(inner),
                        min: 0,
                        max: Some(1),
                    }
                } else {
                    inner
                })
            }
            other => Err(VxiError::Grammar(format!("unexpected {other:?}"))),
        }
    }
}
