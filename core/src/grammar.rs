//! Context-free grammars: parsing, bounded-depth enumeration and random
//! derivation.
//!
//! Text format, one production group per line:
//!
//! ```text
//! S -> S S [0.2]
//! S -> '(' S ')' [0.2] | '(' ')' [0.2]
//!    | '[' S ']' | '[' ']'
//! ```
//!
//! Terminals are quoted with `'` or `"`, nonterminals are bare words, an
//! optional trailing `[p]` weights an alternative (default 1). A line that
//! starts with `|` continues the previous left-hand side. The first
//! production's left-hand side is the start symbol. `#` starts a comment line.
//!
//! Depth follows the usual generator convention: expanding a nonterminal at
//! depth d expands its right-hand side at depth d - 1, and every symbol
//! (terminal or not) needs depth > 0 to yield anything.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use rand::Rng;

use crate::error::{Error, Result};

/// A right-hand-side symbol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Symbol {
    Terminal(String),
    Nonterminal(String),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Production {
    pub lhs: String,
    pub rhs: Vec<Symbol>,
    pub weight: f64,
}

impl fmt::Display for Production {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ->", self.lhs)?;
        for sym in &self.rhs {
            match sym {
                Symbol::Terminal(t) => write!(f, " '{t}'")?,
                Symbol::Nonterminal(n) => write!(f, " {n}")?,
            }
        }
        write!(f, " [{}]", self.weight)
    }
}

/// A parsed grammar with an index from left-hand side to productions.
#[derive(Clone, Debug)]
pub struct Grammar {
    start: String,
    productions: Vec<Production>,
    by_lhs: HashMap<String, Vec<usize>>,
    terminals: Vec<String>,
}

// ── Parsing ──────────────────────────────────────────────────────────

enum Token {
    Terminal(String),
    Word(String),
    Weight(f64),
    Bar,
}

fn tokenize(text: &str, line_no: usize) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '|' => {
                chars.next();
                tokens.push(Token::Bar);
            }
            '\'' | '"' => {
                chars.next();
                let mut lit = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == c => break,
                        Some(ch) => lit.push(ch),
                        None => return Err(Error::data(format!("line {line_no}: unterminated terminal {c}{lit}"))),
                    }
                }
                tokens.push(Token::Terminal(lit));
            }
            '[' => {
                chars.next();
                let mut num = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => num.push(ch),
                        None => return Err(Error::data(format!("line {line_no}: unterminated weight [{num}"))),
                    }
                }
                let w: f64 = num
                    .trim()
                    .parse()
                    .map_err(|_| Error::data(format!("line {line_no}: bad weight [{num}]")))?;
                if !(w.is_finite() && w > 0.0) {
                    return Err(Error::data(format!("line {line_no}: weight must be positive, got {w}")));
                }
                tokens.push(Token::Weight(w));
            }
            _ => {
                let mut word = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '|' | '\'' | '"' | '[') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                tokens.push(Token::Word(word));
            }
        }
    }
    Ok(tokens)
}

/// Split a right-hand side into alternatives and build productions.
fn parse_alternatives(lhs: &str, rhs: &str, line_no: usize, out: &mut Vec<Production>) -> Result<()> {
    let mut current = Vec::new();
    let mut weight: Option<f64> = None;
    let mut finish = |rhs: &mut Vec<Symbol>, weight: &mut Option<f64>| {
        out.push(Production {
            lhs: lhs.to_string(),
            rhs: std::mem::take(rhs),
            weight: weight.take().unwrap_or(1.0),
        });
    };
    for token in tokenize(rhs, line_no)? {
        match token {
            Token::Bar => finish(&mut current, &mut weight),
            Token::Weight(w) => {
                if weight.is_some() {
                    return Err(Error::data(format!("line {line_no}: two weights on one alternative")));
                }
                weight = Some(w);
            }
            _ if weight.is_some() => {
                return Err(Error::data(format!("line {line_no}: weight must end its alternative")));
            }
            Token::Terminal(t) => current.push(Symbol::Terminal(t)),
            Token::Word(w) => current.push(Symbol::Nonterminal(w)),
        }
    }
    finish(&mut current, &mut weight);
    Ok(())
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '$')
}

impl Grammar {
    /// Parse grammar text. Every referenced nonterminal must have at least
    /// one production.
    pub fn parse(text: &str) -> Result<Self> {
        let mut productions = Vec::new();
        let mut last_lhs: Option<String> = None;

        for (i, raw) in text.lines().enumerate() {
            let line_no = i + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('|') {
                let lhs = last_lhs
                    .clone()
                    .ok_or_else(|| Error::data(format!("line {line_no}: continuation without a production")))?;
                parse_alternatives(&lhs, rest, line_no, &mut productions)?;
                continue;
            }
            let (lhs, rhs) = line
                .split_once("->")
                .ok_or_else(|| Error::data(format!("line {line_no}: expected `LHS -> RHS`")))?;
            let lhs = lhs.trim();
            if !is_identifier(lhs) {
                return Err(Error::data(format!("line {line_no}: bad left-hand side {lhs:?}")));
            }
            parse_alternatives(lhs, rhs, line_no, &mut productions)?;
            last_lhs = Some(lhs.to_string());
        }

        Self::from_productions(productions)
    }

    /// Build from explicit productions; the first one's lhs is the start symbol.
    pub fn from_productions(productions: Vec<Production>) -> Result<Self> {
        let start = productions
            .first()
            .map(|p| p.lhs.clone())
            .ok_or_else(|| Error::data("grammar has no productions"))?;

        let mut by_lhs: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, p) in productions.iter().enumerate() {
            by_lhs.entry(p.lhs.clone()).or_default().push(i);
        }

        let mut terminals = BTreeSet::new();
        for p in &productions {
            for sym in &p.rhs {
                match sym {
                    Symbol::Terminal(t) => {
                        terminals.insert(t.clone());
                    }
                    Symbol::Nonterminal(n) if !by_lhs.contains_key(n) => {
                        return Err(Error::data(format!("nonterminal {n} has no productions (used in `{p}`)")));
                    }
                    Symbol::Nonterminal(_) => {}
                }
            }
        }

        Ok(Grammar {
            start,
            productions,
            by_lhs,
            terminals: terminals.into_iter().collect(),
        })
    }

    pub fn start(&self) -> &str {
        &self.start
    }

    pub fn productions(&self) -> &[Production] {
        &self.productions
    }

    /// Terminal symbols, sorted.
    pub fn terminals(&self) -> &[String] {
        &self.terminals
    }

    fn alternatives(&self, lhs: &str) -> &[usize] {
        self.by_lhs.get(lhs).map(Vec::as_slice).unwrap_or(&[])
    }

    // ── Enumeration ──────────────────────────────────────────────────

    /// All derivations of the start symbol up to `depth`, in production
    /// order, duplicates included. At most `limit` sentences are produced.
    pub fn generate(&self, depth: usize, limit: usize) -> Vec<Vec<String>> {
        let start = Symbol::Nonterminal(self.start.clone());
        self.generate_one(&start, depth, limit)
    }

    /// Like `generate`, with duplicate sentences removed (first occurrence
    /// kept). The flag is set when enumeration stopped at `limit`.
    pub fn generate_unique(&self, depth: usize, limit: usize) -> (Vec<Vec<String>>, bool) {
        let all = self.generate(depth, limit);
        let truncated = all.len() == limit;
        let mut seen = HashSet::new();
        let unique = all.into_iter().filter(|s| seen.insert(s.clone())).collect();
        (unique, truncated)
    }

    fn generate_one(&self, sym: &Symbol, depth: usize, limit: usize) -> Vec<Vec<String>> {
        if depth == 0 || limit == 0 {
            return Vec::new();
        }
        match sym {
            Symbol::Terminal(t) => vec![vec![t.clone()]],
            Symbol::Nonterminal(n) => {
                let mut out = Vec::new();
                for &pi in self.alternatives(n) {
                    let remaining = limit - out.len();
                    if remaining == 0 {
                        break;
                    }
                    out.extend(self.generate_all(&self.productions[pi].rhs, depth - 1, remaining));
                }
                out
            }
        }
    }

    /// Cartesian product of the symbols' derivations, each at `depth`.
    fn generate_all(&self, items: &[Symbol], depth: usize, limit: usize) -> Vec<Vec<String>> {
        let Some((first, rest)) = items.split_first() else {
            return vec![Vec::new()];
        };
        let heads = self.generate_one(first, depth, limit);
        if heads.is_empty() {
            return Vec::new();
        }
        let tails = self.generate_all(rest, depth, limit);
        let mut out = Vec::new();
        'outer: for head in &heads {
            for tail in &tails {
                if out.len() == limit {
                    break 'outer;
                }
                let mut s = head.clone();
                s.extend(tail.iter().cloned());
                out.push(s);
            }
        }
        out
    }

    // ── Random derivation ────────────────────────────────────────────

    /// One weighted random top-down derivation within `depth`, or `None`
    /// when the draw runs out of depth.
    pub fn derive<R: Rng + ?Sized>(&self, rng: &mut R, depth: usize) -> Option<Vec<String>> {
        let mut out = Vec::new();
        let start = Symbol::Nonterminal(self.start.clone());
        self.derive_into(rng, &start, depth, &mut out).then_some(out)
    }

    fn derive_into<R: Rng + ?Sized>(&self, rng: &mut R, sym: &Symbol, depth: usize, out: &mut Vec<String>) -> bool {
        if depth == 0 {
            return false;
        }
        match sym {
            Symbol::Terminal(t) => {
                out.push(t.clone());
                true
            }
            Symbol::Nonterminal(n) => {
                let alts = self.alternatives(n);
                let total: f64 = alts.iter().map(|&i| self.productions[i].weight).sum();
                if alts.is_empty() || total <= 0.0 {
                    return false;
                }
                let mut r = rng.gen_range(0.0..total);
                let mut chosen = alts[alts.len() - 1];
                for &i in alts {
                    let w = self.productions[i].weight;
                    if r < w {
                        chosen = i;
                        break;
                    }
                    r -= w;
                }
                self.productions[chosen]
                    .rhs
                    .iter()
                    .all(|child| self.derive_into(rng, child, depth - 1, out))
            }
        }
    }

    /// Draw a derivation, retrying up to `attempts` times when a draw runs
    /// out of depth.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R, depth: usize, attempts: usize) -> Result<Vec<String>> {
        for _ in 0..attempts {
            if let Some(s) = self.derive(rng, depth) {
                return Ok(s);
            }
        }
        Err(Error::data(format!(
            "no derivation of {} within depth {depth} after {attempts} attempts",
            self.start
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    const PARENS: &str = "
        S -> S S [0.2]
        S -> '(' S ')' [0.2] | '(' ')' [0.2]
        S -> '[' S ']' [0.2] | '[' ']' [0.2]
    ";

    #[test]
    fn test_parse_parens() {
        let g = Grammar::parse(PARENS).unwrap();
        assert_eq!(g.start(), "S");
        assert_eq!(g.productions().len(), 5);
        assert_eq!(g.terminals(), &["(", ")", "[", "]"]);
        assert_eq!(g.productions()[1].rhs.len(), 3);
        assert!((g.productions()[4].weight - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_parse_continuation_and_default_weight() {
        let g = Grammar::parse("S -> NP VP\nNP -> 'the' N\n | 'a' N\nN -> \"cat\" | 'dog'\nVP -> 'runs'").unwrap();
        assert_eq!(g.productions().len(), 6);
        assert_eq!(g.productions()[2].lhs, "NP");
        assert!(g.productions().iter().all(|p| p.weight == 1.0));
        assert_eq!(g.terminals(), &["a", "cat", "dog", "runs", "the"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Grammar::parse(""), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("S 'a'"), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("S -> 'a"), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("S -> 'a' [x]"), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("S -> 'a' [0.5] 'b'"), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("S -> 'a' [-1]"), Err(Error::Data(_))));
        assert!(matches!(Grammar::parse("| 'a'"), Err(Error::Data(_))));
        match Grammar::parse("S -> T 'a'") {
            Err(Error::Data(msg)) => assert!(msg.contains("T has no productions")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_generate_counts_by_depth() {
        let g = Grammar::parse(PARENS).unwrap();
        let counts: Vec<usize> = (1..=5).map(|d| g.generate(d, usize::MAX).len()).collect();
        assert_eq!(counts, vec![0, 2, 10, 122, 15130]);
    }

    #[test]
    fn test_generate_order_and_unique() {
        let g = Grammar::parse(PARENS).unwrap();
        let two = g.generate(2, usize::MAX);
        assert_eq!(two, vec![vec!["(", ")"], vec!["[", "]"]]);
        let all = g.generate(4, usize::MAX);
        let (unique, truncated) = g.generate_unique(4, usize::MAX);
        assert!(!truncated);
        assert!(unique.len() < all.len());
        let set: HashSet<_> = unique.iter().collect();
        assert_eq!(set.len(), unique.len());
    }

    #[test]
    fn test_generate_limit() {
        let g = Grammar::parse(PARENS).unwrap();
        assert_eq!(g.generate(5, 100).len(), 100);
        assert!(g.generate(5, 0).is_empty());
        let (unique, truncated) = g.generate_unique(5, 100);
        assert!(truncated && unique.len() <= 100);
    }

    #[test]
    fn test_derive_is_balanced_and_bounded() {
        let g = Grammar::parse(PARENS).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..50 {
            let s = g.sample(&mut rng, 5, 1000).unwrap();
            assert!(!s.is_empty() && s.len() <= 16, "{s:?}");
            let mut depth = 0i32;
            for t in &s {
                depth += if t == "(" || t == "[" { 1 } else { -1 };
                assert!(depth >= 0);
            }
            assert_eq!(depth, 0);
        }
    }

    #[test]
    fn test_sample_fails_when_depth_too_small() {
        let g = Grammar::parse(PARENS).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        assert!(matches!(g.sample(&mut rng, 1, 10), Err(Error::Data(_))));
    }

    #[test]
    fn test_derive_respects_weights() {
        let g = Grammar::parse("S -> 'a' [9] | 'b' [1]").unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let a_count = (0..1000)
            .filter(|_| g.derive(&mut rng, 2).unwrap() == vec!["a".to_string()])
            .count();
        assert!((850..=950).contains(&a_count), "a drawn {a_count} times");
    }
}
