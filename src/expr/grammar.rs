//! Expression parser implementation using chumsky

use chumsky::input::{Stream, ValueInput};
use chumsky::prelude::*;

use crate::error::ParseError;
use crate::expr::ast::*;
use crate::expr::lexer::{lex_at, Token};
use crate::value::Value;

/// Parse a standalone expression
pub fn parse_expression(input: &str) -> Result<Spanned<Expr>, ParseError> {
    parse_expression_at(input, 0)
}

/// Parse an expression that sits at `offset` inside a larger field string
///
/// Spans in the returned tree and in errors are relative to that field.
pub fn parse_expression_at(input: &str, offset: usize) -> Result<Spanned<Expr>, ParseError> {
    let end = offset + input.len();
    let tokens = lex_at(input, offset)?;
    let token_iter = tokens
        .into_iter()
        .map(|(tok, span)| (tok, SimpleSpan::from(span)));

    // Turn the token iterator into a stream that chumsky can use
    let token_stream =
        Stream::from_iter(token_iter).map((end..end).into(), |(t, s): (_, _)| (t, s));

    expr_parser()
        .parse(token_stream)
        .into_result()
        .map_err(|errs| match errs.into_iter().next() {
            Some(err) => err.into(),
            None => ParseError::syntax(offset..end, "Invalid expression"),
        })
}

/// Helper to extract span range from chumsky's MapExtra
fn span_range(e: &impl chumsky::span::Span<Offset = usize>) -> std::ops::Range<usize> {
    e.start()..e.end()
}

/// Postfix accessor applied to an atom
#[derive(Debug, Clone)]
enum Accessor {
    Attr(String),
    Index(Spanned<Expr>),
}

/// One argument of a call, before positional and keyword args are separated
#[derive(Debug, Clone)]
enum Arg {
    Positional(Spanned<Expr>),
    Keyword(String, Spanned<Expr>),
}

type CallArgs = (Vec<Spanned<Expr>>, Vec<(String, Spanned<Expr>)>);

fn split_args(args: Vec<Arg>) -> Result<CallArgs, &'static str> {
    let mut positional = Vec::new();
    let mut keyword = Vec::new();
    for arg in args {
        match arg {
            Arg::Positional(expr) => {
                if !keyword.is_empty() {
                    return Err("positional argument after keyword argument");
                }
                positional.push(expr);
            }
            Arg::Keyword(name, expr) => keyword.push((name, expr)),
        }
    }
    Ok((positional, keyword))
}

fn binary(op: BinaryOp, left: Spanned<Expr>, right: Spanned<Expr>) -> Spanned<Expr> {
    let span = left.span.start..right.span.end;
    Spanned::new(
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        },
        span,
    )
}

fn expr_parser<'a, I>() -> impl Parser<'a, I, Spanned<Expr>, extra::Err<Rich<'a, Token>>> + Clone
where
    I: ValueInput<'a, Token = Token, Span = SimpleSpan>,
{
    let expression = recursive(|expr| {
        let identifier = select! {
            Token::Ident(s) => s,
        };

        let literal = select! {
            Token::Int(n) => Value::Int(n),
            Token::Float(x) => Value::Float(x),
            Token::String(s) => Value::String(s),
            Token::True => Value::Bool(true),
            Token::False => Value::Bool(false),
            Token::Null => Value::Null,
        }
        .map(Expr::Literal);

        let list = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::BracketOpen), just(Token::BracketClose))
            .map(Expr::List);

        // Keyword arguments are tried first so `name=value` never parses as a bare name
        let arg = choice((
            identifier
                .clone()
                .then_ignore(just(Token::Assign))
                .then(expr.clone())
                .map(|(name, value)| Arg::Keyword(name, value)),
            expr.clone().map(Arg::Positional),
        ));

        let arg_list = arg
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

        let call = identifier
            .clone()
            .then(arg_list)
            .try_map(|(function, args), span| {
                let (args, kwargs) = split_args(args).map_err(|msg| Rich::custom(span, msg))?;
                Ok(Expr::Call {
                    function,
                    args,
                    kwargs,
                })
            });

        let atom = choice((literal, call, identifier.clone().map(Expr::Name), list))
            .map_with(|node, e| Spanned::new(node, span_range(&e.span())))
            .or(expr
                .clone()
                .delimited_by(just(Token::ParenOpen), just(Token::ParenClose)))
            .boxed();

        // Postfix accessors: `.name`, `.0`, `[expr]`
        let accessor = choice((
            just(Token::Dot)
                .ignore_then(identifier.clone())
                .map(Accessor::Attr),
            just(Token::Dot)
                .ignore_then(select! { Token::Int(n) => n })
                .map_with(|n, e| {
                    Accessor::Index(Spanned::new(
                        Expr::Literal(Value::Int(n)),
                        span_range(&e.span()),
                    ))
                }),
            expr.clone()
                .delimited_by(just(Token::BracketOpen), just(Token::BracketClose))
                .map(Accessor::Index),
        ))
        .map_with(|acc, e| (acc, span_range(&e.span())));

        let postfix = atom.foldl(accessor.repeated(), |target, (acc, span)| {
            let full = target.span.start..span.end;
            let node = match acc {
                Accessor::Attr(name) => Expr::Attr {
                    target: Box::new(target),
                    name,
                },
                Accessor::Index(index) => Expr::Index {
                    target: Box::new(target),
                    index: Box::new(index),
                },
            };
            Spanned::new(node, full)
        });

        // Filters: `value | name` or `value | name(args)`
        let filter_args = expr
            .clone()
            .separated_by(just(Token::Comma))
            .allow_trailing()
            .collect::<Vec<_>>()
            .delimited_by(just(Token::ParenOpen), just(Token::ParenClose));

        let filter = postfix.foldl(
            just(Token::Pipe)
                .ignore_then(identifier)
                .then(filter_args.or_not())
                .map_with(|(name, args), e| (name, args.unwrap_or_default(), span_range(&e.span())))
                .repeated(),
            |value, (name, args, span)| {
                let full = value.span.start..span.end;
                Spanned::new(
                    Expr::Filter {
                        value: Box::new(value),
                        name,
                        args,
                    },
                    full,
                )
            },
        );

        let unary = just(Token::Minus)
            .map_with(|_, e| span_range(&e.span()))
            .repeated()
            .foldr(filter, |op_span, operand| {
                let full = op_span.start..operand.span.end;
                Spanned::new(
                    Expr::Unary {
                        op: UnaryOp::Neg,
                        operand: Box::new(operand),
                    },
                    full,
                )
            })
            .boxed();

        let product = unary.clone().foldl(
            choice((
                just(Token::Star).to(BinaryOp::Mul),
                just(Token::Slash).to(BinaryOp::Div),
                just(Token::Percent).to(BinaryOp::Rem),
            ))
            .then(unary)
            .repeated(),
            |left, (op, right)| binary(op, left, right),
        );

        let sum = product.clone().foldl(
            choice((
                just(Token::Plus).to(BinaryOp::Add),
                just(Token::Minus).to(BinaryOp::Sub),
            ))
            .then(product)
            .repeated(),
            |left, (op, right)| binary(op, left, right),
        );

        let comparison = sum
            .clone()
            .then(
                choice((
                    just(Token::EqEq).to(BinaryOp::Eq),
                    just(Token::NotEq).to(BinaryOp::NotEq),
                    just(Token::LessOrEqual).to(BinaryOp::Le),
                    just(Token::GreaterOrEqual).to(BinaryOp::Ge),
                    just(Token::Less).to(BinaryOp::Lt),
                    just(Token::Greater).to(BinaryOp::Gt),
                ))
                .then(sum)
                .or_not(),
            )
            .map(|(left, rest)| match rest {
                Some((op, right)) => binary(op, left, right),
                None => left,
            })
            .boxed();

        let negation = just(Token::Not)
            .map_with(|_, e| span_range(&e.span()))
            .repeated()
            .foldr(comparison, |op_span, operand| {
                let full = op_span.start..operand.span.end;
                Spanned::new(
                    Expr::Unary {
                        op: UnaryOp::Not,
                        operand: Box::new(operand),
                    },
                    full,
                )
            });

        let conjunction = negation.clone().foldl(
            just(Token::And).ignore_then(negation).repeated(),
            |left, right| binary(BinaryOp::And, left, right),
        );

        conjunction
            .clone()
            .foldl(
                just(Token::Or).ignore_then(conjunction).repeated(),
                |left, right| binary(BinaryOp::Or, left, right),
            )
            .boxed()
    });

    expression.then_ignore(end())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> Expr {
        parse_expression(input).expect("Should parse").node
    }

    #[test]
    fn test_parse_literals() {
        assert_eq!(parse("42"), Expr::Literal(Value::Int(42)));
        assert_eq!(parse("2.5"), Expr::Literal(Value::Float(2.5)));
        assert_eq!(parse("'hi'"), Expr::Literal(Value::from("hi")));
        assert_eq!(parse("None"), Expr::Literal(Value::Null));
    }

    #[test]
    fn test_parse_dotted_access() {
        match parse("params.user.name") {
            Expr::Attr { target, name } => {
                assert_eq!(name, "name");
                match target.node {
                    Expr::Attr { target, name } => {
                        assert_eq!(name, "user");
                        assert_eq!(target.node, Expr::Name("params".to_string()));
                    }
                    other => panic!("Expected Attr, got {:?}", other),
                }
            }
            other => panic!("Expected Attr, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_numeric_attribute_is_index() {
        match parse("items.0") {
            Expr::Index { index, .. } => assert_eq!(index.node, Expr::Literal(Value::Int(0))),
            other => panic!("Expected Index, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_mul_over_add() {
        match parse("1 + 2 * 3") {
            Expr::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Add);
                assert!(matches!(
                    right.node,
                    Expr::Binary {
                        op: BinaryOp::Mul,
                        ..
                    }
                ));
            }
            other => panic!("Expected Binary, got {:?}", other),
        }
    }

    #[test]
    fn test_precedence_and_over_or() {
        match parse("a or b and not c") {
            Expr::Binary { op, right, .. } => {
                assert_eq!(op, BinaryOp::Or);
                match right.node {
                    Expr::Binary { op, right, .. } => {
                        assert_eq!(op, BinaryOp::And);
                        assert!(matches!(right.node, Expr::Unary { op: UnaryOp::Not, .. }));
                    }
                    other => panic!("Expected And, got {:?}", other),
                }
            }
            other => panic!("Expected Or, got {:?}", other),
        }
    }

    #[test]
    fn test_comparison_binds_looser_than_sum() {
        assert!(matches!(
            parse("vars.n + 1 < 3"),
            Expr::Binary {
                op: BinaryOp::Lt,
                ..
            }
        ));
    }

    #[test]
    fn test_filter_chain_with_args() {
        match parse("name | default('x') | upper") {
            Expr::Filter { value, name, args } => {
                assert_eq!(name, "upper");
                assert!(args.is_empty());
                match value.node {
                    Expr::Filter { name, args, .. } => {
                        assert_eq!(name, "default");
                        assert_eq!(args.len(), 1);
                    }
                    other => panic!("Expected Filter, got {:?}", other),
                }
            }
            other => panic!("Expected Filter, got {:?}", other),
        }
    }

    #[test]
    fn test_call_with_keyword_args() {
        match parse("shell('date', timeout=5)") {
            Expr::Call {
                function,
                args,
                kwargs,
            } => {
                assert_eq!(function, "shell");
                assert_eq!(args.len(), 1);
                assert_eq!(kwargs.len(), 1);
                assert_eq!(kwargs[0].0, "timeout");
            }
            other => panic!("Expected Call, got {:?}", other),
        }
    }

    #[test]
    fn test_positional_after_keyword_rejected() {
        assert!(parse_expression("f(a=1, 2)").is_err());
    }

    #[test]
    fn test_list_literal_and_index() {
        match parse("[1, 2, 3][1]") {
            Expr::Index { target, .. } => assert!(matches!(target.node, Expr::List(ref items) if items.len() == 3)),
            other => panic!("Expected Index, got {:?}", other),
        }
    }

    #[test]
    fn test_spans_cover_whole_expression() {
        let expr = parse_expression_at("a + bc", 3).unwrap();
        assert_eq!(expr.span, 3..9);
    }

    #[test]
    fn test_trailing_garbage_is_error() {
        let err = parse_expression("1 2").unwrap_err();
        assert_eq!(err.span(), &(2..3));
    }

    #[test]
    fn test_empty_expression_is_error() {
        let err = parse_expression("").unwrap_err();
        assert!(err.message().contains("end of expression"));
    }
}
