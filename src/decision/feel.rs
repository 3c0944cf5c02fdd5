//! FEEL unary tests as used in decision table input entries.
//!
//! Only the subset needed by threshold tables is supported:
//!
//! ```text
//! -                    any value
//! < 80, >= 80, != "x"  comparison against a literal
//! 42, "OK", true       equality
//! [20..80), ]0..10]    ranges, bracket decides inclusiveness
//! 1, 2, [5..9]         disjunction
//! not(< 0, > 100)      negated disjunction
//! ```

use super::DecisionError;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    String(String),
    Boolean(bool),
    Null,
}

impl Literal {
    /// Orders `value` relative to this literal. `None` when the types differ.
    fn order_of(&self, value: &Value) -> Option<Ordering> {
        match (self, value) {
            (Literal::Number(n), Value::Number(v)) => v.as_f64()?.partial_cmp(n),
            (Literal::String(s), Value::String(v)) => Some(v.as_str().cmp(s.as_str())),
            (Literal::Boolean(b), Value::Bool(v)) => Some(v.cmp(b)),
            (Literal::Null, Value::Null) => Some(Ordering::Equal),
            _ => None,
        }
    }

    fn is_ordered(&self) -> bool {
        matches!(self, Literal::Number(_) | Literal::String(_))
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Number(n) => write!(f, "{}", n),
            Literal::String(s) => write!(f, "\"{}\"", s),
            Literal::Boolean(b) => write!(f, "{}", b),
            Literal::Null => write!(f, "null"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Comparator {
    fn holds(self, literal: &Literal, value: &Value) -> bool {
        if *literal == Literal::Null {
            return match self {
                Comparator::Eq => value.is_null(),
                Comparator::Ne => !value.is_null(),
                _ => false,
            };
        }
        let Some(ordering) = literal.order_of(value) else {
            return false;
        };
        match self {
            Comparator::Eq => ordering == Ordering::Equal,
            Comparator::Ne => ordering != Ordering::Equal,
            Comparator::Lt => literal.is_ordered() && ordering == Ordering::Less,
            Comparator::Le => literal.is_ordered() && ordering != Ordering::Greater,
            Comparator::Gt => literal.is_ordered() && ordering == Ordering::Greater,
            Comparator::Ge => literal.is_ordered() && ordering != Ordering::Less,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnaryTest {
    Compare(Comparator, Literal),
    Range {
        low: Literal,
        low_inclusive: bool,
        high: Literal,
        high_inclusive: bool,
    },
}

impl UnaryTest {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            UnaryTest::Compare(comparator, literal) => comparator.holds(literal, value),
            UnaryTest::Range {
                low,
                low_inclusive,
                high,
                high_inclusive,
            } => {
                let above_low = match low.order_of(value) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => *low_inclusive,
                    _ => false,
                };
                let below_high = match high.order_of(value) {
                    Some(Ordering::Less) => true,
                    Some(Ordering::Equal) => *high_inclusive,
                    _ => false,
                };
                above_low && below_high
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TestKind {
    Any,
    AnyOf(Vec<UnaryTest>),
    NoneOf(Vec<UnaryTest>),
}

/// A parsed input entry of a decision rule
#[derive(Debug, Clone, PartialEq)]
pub struct UnaryTests {
    source: String,
    kind: TestKind,
}

impl UnaryTests {
    pub fn any() -> Self {
        Self {
            source: "-".to_string(),
            kind: TestKind::Any,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, value: &Value) -> bool {
        match &self.kind {
            TestKind::Any => true,
            TestKind::AnyOf(tests) => tests.iter().any(|t| t.matches(value)),
            TestKind::NoneOf(tests) => {
                !value.is_null() && !tests.iter().any(|t| t.matches(value))
            }
        }
    }
}

impl fmt::Display for UnaryTests {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

impl FromStr for UnaryTests {
    type Err = DecisionError;

    fn from_str(src: &str) -> Result<Self, Self::Err> {
        let trimmed = src.trim();
        let invalid = |reason: &str| DecisionError::InvalidUnaryTest {
            expression: src.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() {
            return Err(invalid("empty expression"));
        }
        if trimmed == "-" {
            return Ok(Self::any());
        }

        let kind = match trimmed.strip_prefix("not") {
            Some(rest) if rest.trim_start().starts_with('(') => {
                let rest = rest.trim_start();
                let inner = rest
                    .strip_prefix('(')
                    .and_then(|r| r.strip_suffix(')'))
                    .ok_or_else(|| invalid("unbalanced parentheses in not(...)"))?;
                TestKind::NoneOf(Parser::new(inner).parse_list().map_err(|r| invalid(&r))?)
            }
            _ => TestKind::AnyOf(Parser::new(trimmed).parse_list().map_err(|r| invalid(&r))?),
        };

        Ok(Self {
            source: trimmed.to_string(),
            kind,
        })
    }
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, expected: char) -> Result<(), String> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(format!("expected '{}' but found '{}'", expected, c)),
            None => Err(format!("expected '{}' but reached end of input", expected)),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<UnaryTest>, String> {
        let mut tests = Vec::new();
        loop {
            self.skip_ws();
            tests.push(self.parse_test()?);
            self.skip_ws();
            match self.bump() {
                None => break,
                Some(',') => continue,
                Some(c) => return Err(format!("unexpected '{}' after test", c)),
            }
        }
        Ok(tests)
    }

    fn parse_test(&mut self) -> Result<UnaryTest, String> {
        let comparator = match (self.peek(), self.peek_at(1)) {
            (Some('<'), Some('=')) => Some((Comparator::Le, 2)),
            (Some('<'), _) => Some((Comparator::Lt, 1)),
            (Some('>'), Some('=')) => Some((Comparator::Ge, 2)),
            (Some('>'), _) => Some((Comparator::Gt, 1)),
            (Some('!'), Some('=')) => Some((Comparator::Ne, 2)),
            (Some('='), _) => Some((Comparator::Eq, 1)),
            _ => None,
        };

        if let Some((comparator, width)) = comparator {
            self.pos += width;
            self.skip_ws();
            let literal = self.parse_literal()?;
            return Ok(UnaryTest::Compare(comparator, literal));
        }

        match self.peek() {
            Some('[') | Some('(') | Some(']') => self.parse_range(),
            _ => Ok(UnaryTest::Compare(Comparator::Eq, self.parse_literal()?)),
        }
    }

    fn parse_range(&mut self) -> Result<UnaryTest, String> {
        let low_inclusive = self.bump() == Some('[');
        self.skip_ws();
        let low = self.parse_literal()?;
        self.skip_ws();
        self.expect('.')?;
        self.expect('.')?;
        self.skip_ws();
        let high = self.parse_literal()?;
        self.skip_ws();
        let high_inclusive = match self.bump() {
            Some(']') => true,
            Some(')') | Some('[') => false,
            Some(c) => return Err(format!("unexpected '{}' closing range", c)),
            None => return Err("unterminated range".to_string()),
        };

        match (&low, &high) {
            (Literal::Number(l), Literal::Number(h)) if l > h => {
                return Err(format!("range start {} exceeds end {}", l, h))
            }
            (Literal::String(l), Literal::String(h)) if l > h => {
                return Err(format!("range start \"{}\" exceeds end \"{}\"", l, h))
            }
            (Literal::Number(_), Literal::Number(_)) | (Literal::String(_), Literal::String(_)) => {}
            _ => return Err("range endpoints must both be numbers or both be strings".to_string()),
        }

        Ok(UnaryTest::Range {
            low,
            low_inclusive,
            high,
            high_inclusive,
        })
    }

    fn parse_literal(&mut self) -> Result<Literal, String> {
        match self.peek() {
            Some('"') => self.parse_string(),
            Some(c) if c == '-' || c == '.' || c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_alphabetic() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
                    self.pos += 1;
                }
                let word: String = self.chars[start..self.pos].iter().collect();
                match word.as_str() {
                    "true" => Ok(Literal::Boolean(true)),
                    "false" => Ok(Literal::Boolean(false)),
                    "null" => Ok(Literal::Null),
                    other => Err(format!("unsupported name '{}'", other)),
                }
            }
            Some(c) => Err(format!("unexpected '{}' where a literal was expected", c)),
            None => Err("missing literal".to_string()),
        }
    }

    fn parse_number(&mut self) -> Result<Literal, String> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.pos += 1;
        }
        while self.peek().is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
        }
        // a '.' followed by another '.' belongs to a range
        if self.peek() == Some('.') && self.peek_at(1).is_some_and(|c| c.is_ascii_digit()) {
            self.pos += 1;
            while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Literal::Number)
            .map_err(|_| format!("invalid number '{}'", text))
    }

    fn parse_string(&mut self) -> Result<Literal, String> {
        self.expect('"')?;
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(Literal::String(out)),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err("unterminated escape".to_string()),
                },
                Some(c) => out.push(c),
                None => return Err("unterminated string".to_string()),
            }
        }
    }
}
