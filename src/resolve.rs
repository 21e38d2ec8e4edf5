//! Resolución de bloques.
//!
//! Una única pasada sobre el flujo optimizado empareja cada `if`, `else`,
//! `while`, `do` y `end` mediante una pila explícita de bloques abiertos.
//! Al terminar, cada marcador lleva el índice absoluto de token que el
//! generador de código necesita para emitir sus saltos:
//!
//! - `if`: primer token a ejecutar si la condición es falsa (el siguiente
//!   al `else`, o el `end` si no hay `else`).
//! - `else`: el `end` que cierra la rama.
//! - `while`: su propio índice.
//! - `do`: el `end` del ciclo.
//! - `end`: el marcador que lo abrió (`if`, `else` o `while`).
//!
//! Además, el entero que sigue a cada `apply` y `store` se consume como
//! anotación de ancho, por lo cual el flujo resultante puede ser más corto
//! que el de entrada. Los índices se toman siempre sobre el flujo de salida.

use crate::{
    error::{Categorized, Category},
    ir::{Optimized, Resolved},
    lex::{Token, Width},
    source::{Located, Location},
};

use std::fmt::{self, Display};
use thiserror::Error;
use tracing::debug;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("`else` without matching `if`")]
    ElseWithoutIf,

    #[error("`end` without matching block")]
    UnmatchedEnd,

    #[error("`while` without `do`")]
    WhileWithoutDo,

    #[error("`do` without `while`")]
    DoWithoutWhile,

    #[error("unclosed `{0}` block")]
    Unclosed(BlockKind),

    #[error("expected pointer width after `{0}`")]
    ExpectedWidth(Token),

    #[error("invalid pointer width {0}, expected 1, 2, 4 or 8")]
    BadWidth(i64),
}

impl Categorized for ResolveError {
    fn category(&self) -> Category {
        use ResolveError::*;

        match self {
            ExpectedWidth(_) | BadWidth(_) => Category::Syntax,
            _ => Category::Structural,
        }
    }
}

/// Tipo de un bloque abierto.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BlockKind {
    If,
    Else,
    While,
    Do,
}

impl Display for BlockKind {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BlockKind::If => "if",
            BlockKind::Else => "else",
            BlockKind::While => "while",
            BlockKind::Do => "do",
        };

        fmt.write_str(name)
    }
}

struct Block {
    kind: BlockKind,
    index: usize,
}

/// Resuelve marcadores de bloque y anchos de un flujo optimizado.
pub fn resolve(optimized: Optimized) -> Result<Resolved, Located<ResolveError>> {
    let (root, tokens, calls) = optimized.into_parts();

    let mut resolver = Resolver {
        output: Vec::with_capacity(tokens.len()),
        blocks: Vec::new(),
        blocks_seen: 0,
    };

    let mut tokens = tokens.into_iter();
    while let Some(token) = tokens.next() {
        resolver.feed(token, &mut tokens)?;
    }

    if let Some(block) = resolver.blocks.pop() {
        let location = resolver.output[block.index].location().clone();
        return Err(Located::at(ResolveError::Unclosed(block.kind), location));
    }

    debug!(
        tokens = resolver.output.len(),
        blocks = resolver.blocks_seen,
        "resolved control flow"
    );

    Ok(Resolved::new(root, resolver.output, calls))
}

struct Resolver {
    output: Vec<Located<Token>>,
    blocks: Vec<Block>,
    blocks_seen: usize,
}

impl Resolver {
    fn feed<I>(&mut self, token: Located<Token>, rest: &mut I) -> Result<(), Located<ResolveError>>
    where
        I: Iterator<Item = Located<Token>>,
    {
        let index = self.output.len();
        let (location, token) = token.split();

        let mut token = match token {
            Token::Apply(_) => Token::Apply(Some(width(&location, rest, Token::Apply(None))?)),
            Token::Store(_) => Token::Store(Some(width(&location, rest, Token::Store(None))?)),
            other => other,
        };

        match &mut token {
            Token::If(_) => self.open(BlockKind::If, index),
            Token::Do(_) => {
                match self.blocks.last() {
                    Some(Block {
                        kind: BlockKind::While,
                        ..
                    }) => (),
                    _ => return Err(Located::at(ResolveError::DoWithoutWhile, location)),
                }

                self.open(BlockKind::Do, index);
            }

            Token::While(target) => {
                *target = Some(index);
                self.open(BlockKind::While, index);
            }

            Token::Else(_) => match self.blocks.pop() {
                Some(Block {
                    kind: BlockKind::If,
                    index: opener,
                }) => {
                    self.mark(opener, index + 1);
                    self.open(BlockKind::Else, index);
                }

                _ => return Err(Located::at(ResolveError::ElseWithoutIf, location)),
            },

            Token::End(target) => match self.blocks.pop() {
                Some(Block {
                    kind: BlockKind::If | BlockKind::Else,
                    index: opener,
                }) => {
                    self.mark(opener, index);
                    *target = Some(opener);
                }

                Some(Block {
                    kind: BlockKind::Do,
                    index: body,
                }) => {
                    // Un `do` siempre se abre sobre su `while`
                    let opener = match self.blocks.pop() {
                        Some(Block {
                            kind: BlockKind::While,
                            index,
                        }) => index,
                        _ => return Err(Located::at(ResolveError::DoWithoutWhile, location)),
                    };

                    self.mark(body, index);
                    *target = Some(opener);
                }

                Some(Block {
                    kind: BlockKind::While,
                    ..
                }) => return Err(Located::at(ResolveError::WhileWithoutDo, location)),

                None => return Err(Located::at(ResolveError::UnmatchedEnd, location)),
            },

            _ => (),
        }

        self.output.push(Located::at(token, location));
        Ok(())
    }

    fn open(&mut self, kind: BlockKind, index: usize) {
        self.blocks.push(Block { kind, index });
        self.blocks_seen += 1;
    }

    /// Fija el destino de un marcador ya emitido.
    fn mark(&mut self, index: usize, destination: usize) {
        if let Token::If(target) | Token::Else(target) | Token::Do(target) =
            self.output[index].val_mut()
        {
            *target = Some(destination);
        }
    }
}

/// Consume la anotación de ancho que sigue a `apply` o `store`.
fn width<I>(
    location: &Location,
    rest: &mut I,
    name: Token,
) -> Result<Width, Located<ResolveError>>
where
    I: Iterator<Item = Located<Token>>,
{
    match rest.next().map(Located::split) {
        Some((location, Token::Int(bytes))) => Width::from_bytes(bytes)
            .ok_or_else(|| Located::at(ResolveError::BadWidth(bytes), location)),

        Some((location, _)) => Err(Located::at(ResolveError::ExpectedWidth(name), location)),
        None => Err(Located::at(ResolveError::ExpectedWidth(name), location.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expand, lex::Unit, opt, source::Source};
    use std::path::Path;

    fn resolved(text: &str) -> Result<Vec<Token>, Located<ResolveError>> {
        let source = Source::new("test.pang", None, String::from(text));
        let unit = Unit::lex(source, Path::new(".")).unwrap();
        let optimized = opt::passthrough(expand::expand(unit).unwrap());

        let resolved = resolve(optimized)?;
        let (_, tokens, _) = resolved.into_parts();

        Ok(tokens.into_iter().map(Located::into_inner).collect())
    }

    fn error(text: &str) -> ResolveError {
        resolved(text).unwrap_err().into_inner()
    }

    #[test]
    fn if_else_targets() {
        let tokens = resolved("1 if 5 else 6 end").unwrap();

        assert_eq!(tokens[1], Token::If(Some(4)));
        assert_eq!(tokens[3], Token::Else(Some(5)));
        assert_eq!(tokens[5], Token::End(Some(3)));
    }

    #[test]
    fn if_without_else_skips_to_end() {
        let tokens = resolved("1 if 2 end 3").unwrap();

        assert_eq!(tokens[1], Token::If(Some(3)));
        assert_eq!(tokens[3], Token::End(Some(1)));
    }

    #[test]
    fn loop_targets() {
        let tokens = resolved("10 while dup 0 > do 1 sub end").unwrap();

        assert_eq!(tokens[1], Token::While(Some(1)));
        assert_eq!(tokens[5], Token::Do(Some(8)));
        assert_eq!(tokens[8], Token::End(Some(1)));
    }

    #[test]
    fn nested_blocks() {
        let text = "while 1 do 1 if 2 else 3 end end";
        let tokens = resolved(text).unwrap();

        assert_eq!(tokens[0], Token::While(Some(0)));
        assert_eq!(tokens[2], Token::Do(Some(9)));
        assert_eq!(tokens[4], Token::If(Some(7)));
        assert_eq!(tokens[6], Token::Else(Some(8)));
        assert_eq!(tokens[8], Token::End(Some(6)));
        assert_eq!(tokens[9], Token::End(Some(0)));
    }

    #[test]
    fn imbalance_is_structural() {
        let cases = [
            "end",
            "1 else 2 end",
            "1 if 2 end end",
            "while 1 end",
            "1 do 2 end",
            "1 if 2",
        ];

        for text in cases {
            let error = error(text);
            assert_eq!(error.category(), Category::Structural, "{}", text);
        }
    }

    #[test]
    fn specific_structural_errors() {
        assert!(matches!(error("end"), ResolveError::UnmatchedEnd));
        assert!(matches!(error("1 if 2 else 3 else 4 end"), ResolveError::ElseWithoutIf));
        assert!(matches!(error("while 1 end"), ResolveError::WhileWithoutDo));
        assert!(matches!(error("1 do end"), ResolveError::DoWithoutWhile));
        assert!(matches!(error("while 1 do"), ResolveError::Unclosed(BlockKind::Do)));
    }

    #[test]
    fn unclosed_error_points_at_opener() {
        let error = resolved("1\n2 if\n3").unwrap_err();
        assert_eq!(error.location().line(), 2);
    }

    #[test]
    fn apply_consumes_width() {
        let tokens = resolved("x apply 8 1 if 2 end").unwrap();

        assert_eq!(tokens.len(), 6);
        assert_eq!(tokens[1], Token::Apply(Some(Width::Qword)));
        assert_eq!(tokens[3], Token::If(Some(5)));
    }

    #[test]
    fn store_consumes_width() {
        let tokens = resolved("7 x store 1").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Int(7),
                Token::Id("x".into()),
                Token::Store(Some(Width::Byte))
            ]
        );
    }

    #[test]
    fn bad_widths_are_syntax_errors() {
        assert!(matches!(error("x apply 3"), ResolveError::BadWidth(3)));
        assert!(matches!(error("x apply dup"), ResolveError::ExpectedWidth(Token::Apply(None))));
        assert!(matches!(error("x store"), ResolveError::ExpectedWidth(Token::Store(None))));
        assert_eq!(error("x apply").category(), Category::Syntax);
    }
}
