use super::expr::Expr;
use crate::basic::error::{PowerFlowError, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '^' => {
                tokens.push(Token::Caret);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent suffix, e.g. 1e-6
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| PowerFlowError::Parse(format!("invalid number `{text}`")))?;
                tokens.push(Token::Num(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(PowerFlowError::Parse(format!(
                    "unexpected character `{other}` at {i}"
                )));
            }
        }
    }
    Ok(tokens)
}

/// Recursive-descent parser.
///
/// ```text
/// expr   := term (('+' | '-') term)*
/// term   := unary (('*' | '/') unary)*
/// unary  := '-' unary | power
/// power  := atom ('^' unary)?
/// atom   := number | ident | 'sqrt' '(' expr ')' | '(' expr ')'
/// ```
struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == expected => Ok(()),
            other => Err(PowerFlowError::Parse(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut terms = vec![self.parse_term()?];
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    terms.push(self.parse_term()?);
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    terms.push(-self.parse_term()?);
                }
                _ => break,
            }
        }
        Ok(Expr::sum(terms))
    }

    fn parse_term(&mut self) -> Result<Expr> {
        let mut factors = vec![self.parse_unary()?];
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    factors.push(self.parse_unary()?);
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    factors.push(self.parse_unary()?.recip());
                }
                _ => break,
            }
        }
        Ok(Expr::product(factors))
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Minus) = self.peek() {
            self.pos += 1;
            return Ok(-self.parse_unary()?);
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr> {
        let base = self.parse_atom()?;
        if let Some(Token::Caret) = self.peek() {
            self.pos += 1;
            let exponent = self.parse_unary()?;
            return match exponent {
                Expr::Const(n) if n.fract() == 0.0 && n.abs() <= i32::MAX as f64 => {
                    Ok(Expr::pow(base, n as i32))
                }
                Expr::Const(n) if n == 0.5 => Ok(Expr::sqrt(base)),
                other => Err(PowerFlowError::Parse(format!(
                    "exponent must be an integer constant, found `{other}`"
                ))),
            };
        }
        Ok(base)
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Num(v)) => Ok(Expr::Const(v)),
            Some(Token::Ident(name)) if name == "sqrt" => {
                self.expect(Token::LParen)?;
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(Expr::sqrt(inner))
            }
            Some(Token::Ident(name)) => Ok(Expr::sym(&name)),
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(PowerFlowError::Parse(format!("unexpected token {other:?}"))),
        }
    }
}

/// Parses the textual form of an expression, the inverse of `Display` for [`Expr`].
pub fn parse_expression(input: &str) -> Result<Expr> {
    let mut parser = Parser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    let expr = parser.parse_expr()?;
    if parser.pos < parser.tokens.len() {
        return Err(PowerFlowError::Parse(format!(
            "trailing input after token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(e: &Expr, x: f64, y: f64) -> f64 {
        e.eval(&|s| match s {
            "x" => Some(x),
            "y" => Some(y),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn test_precedence() {
        let e = parse_expression("1 + 2*x^2 - y/4").unwrap();
        assert_eq!(eval(&e, 3.0, 8.0), 1.0 + 18.0 - 2.0);
    }

    #[test]
    fn test_unary_and_sqrt() {
        let e = parse_expression("-sqrt(x*x + y*y) * (-2)").unwrap();
        assert_eq!(eval(&e, 3.0, 4.0), 10.0);
    }

    #[test]
    fn test_negative_exponent_and_scientific() {
        let e = parse_expression("x^(-2) + 1e-1").unwrap();
        assert!((eval(&e, 2.0, 0.0) - 0.35).abs() < 1e-15);
    }

    #[test]
    fn test_display_reparses() {
        let text = "G*(Lr_f - Lr_t)*(Vr_f - Vr_t) + P*Vr*(Vr^2 + Vi^2)^(-1) - 0.5*sqrt(Vr)";
        let e = parse_expression(text).unwrap();
        let again = parse_expression(&e.to_string()).unwrap();
        assert_eq!(e, again);
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_expression("x +* y").is_err());
        assert!(parse_expression("x^y").is_err());
        assert!(parse_expression("(x").is_err());
        assert!(parse_expression("x $ y").is_err());
    }
}
