//! Textual shorthand for set expressions.
//!
//! ```text
//! expr   := "(" OP [":" MERGE] source+ ")"
//! OP     := "U" | "I" | "D"
//! MERGE  := "First" | "FloatSum"
//! source := (range | expr) ["*" weight]
//! ```
//!
//! `(I:First USER_a_LIKES USER_b_LIKES)` is the intersection of two like
//! ranges. The output of [`SetExpression`]'s `Display` parses back to the same
//! tree, so expressions logged by the evaluator can be read back and replayed.

use crate::setop::{Merge, SetExpression, SetOp, SetOpKind, SetOpSource};
use crate::store::RangeKey;
use crate::CoreError;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Word(String),
}

/// Parse one expression. The result has no destination.
///
/// # Errors
/// Returns [`CoreError::Expression`] on unbalanced parentheses, unknown
/// operation or merge names, operations without sources, invalid weights, or
/// trailing input.
pub fn parse_expression(input: &str) -> Result<SetExpression, CoreError> {
    let tokens = tokenize(input);
    let mut parser = Parser { tokens, position: 0 };
    let op = parser.op()?;
    if parser.position != parser.tokens.len() {
        return Err(CoreError::Expression(format!(
            "unexpected input after expression at token {}",
            parser.position
        )));
    }
    Ok(SetExpression::new(op))
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in input.chars() {
        if ch == '(' || ch == ')' || ch.is_whitespace() {
            if !word.is_empty() {
                tokens.push(Token::Word(std::mem::take(&mut word)));
            }
            match ch {
                '(' => tokens.push(Token::Open),
                ')' => tokens.push(Token::Close),
                _ => {}
            }
        } else {
            word.push(ch);
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn op(&mut self) -> Result<SetOp, CoreError> {
        if self.next() != Some(Token::Open) {
            return Err(CoreError::Expression("expected '('".to_string()));
        }
        let Some(Token::Word(head)) = self.next() else {
            return Err(CoreError::Expression("expected operation after '('".to_string()));
        };
        let (kind, merge) = head.split_once(':').unwrap_or((head.as_str(), Merge::First.as_str()));
        let kind = SetOpKind::parse(kind)
            .ok_or_else(|| CoreError::Expression(format!("unknown operation: {kind}")))?;
        let merge = Merge::parse(merge)
            .ok_or_else(|| CoreError::Expression(format!("unknown merge: {merge}")))?;

        let mut op = SetOp::new(kind, merge);
        loop {
            match self.peek() {
                Some(Token::Close) => {
                    self.position += 1;
                    break;
                }
                Some(Token::Open) => {
                    let nested = self.op()?;
                    let source = match self.peek() {
                        Some(Token::Word(word)) if word.starts_with('*') => {
                            let weight = parse_weight(&word[1..])?;
                            self.position += 1;
                            SetOpSource::op(nested).weighted(weight)
                        }
                        _ => SetOpSource::op(nested),
                    };
                    op.push(source);
                }
                Some(Token::Word(word)) => {
                    let source = range_source(word)?;
                    self.position += 1;
                    op.push(source);
                }
                None => return Err(CoreError::Expression("unbalanced '('".to_string())),
            }
        }

        if op.sources.is_empty() {
            return Err(CoreError::Expression(format!("{head} has no sources")));
        }
        Ok(op)
    }
}

fn range_source(word: &str) -> Result<SetOpSource, CoreError> {
    match word.rsplit_once('*') {
        Some((name, weight)) if !name.is_empty() => {
            Ok(SetOpSource::range(RangeKey::new(name)).weighted(parse_weight(weight)?))
        }
        Some(_) => Err(CoreError::Expression(format!("weight without a source: {word}"))),
        None => Ok(SetOpSource::range(RangeKey::new(word))),
    }
}

fn parse_weight(raw: &str) -> Result<f64, CoreError> {
    raw.parse::<f64>().map_err(|err| CoreError::Expression(format!("invalid weight {raw}: {err}")))
}
