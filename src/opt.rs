//! Optimización peephole.
//!
//! Recorre el flujo expandido de izquierda a derecha manteniendo una pila
//! abstracta de valores conocidos: literales cuyo valor se sabe en tiempo
//! de compilación y cuyo token de origen sigue presente en la salida. Cada
//! `add`, `sub` o `mul` que opera sobre dos valores conocidos se reemplaza,
//! junto con los dos literales que lo alimentan, por un único literal.
//! Además, secuencias consecutivas de `drop` se combinan en un solo `drop`
//! con cuenta.
//!
//! Cualquier otro token invalida la pila abstracta, ya que su efecto sobre
//! la pila real puede ser arbitrario. El entero que sigue a `apply` o
//! `store` es una anotación de ancho y no un valor, por lo que nunca se
//! pliega.
//!
//! Los literales que se pliegan no siempre son contiguos en la salida (un
//! `drop` puede quedar entre ellos), por lo cual se eliminan marcando su
//! posición como vacía y compactando al final. Así el recorrido es lineal.

use crate::{
    error::{Categorized, Category},
    ir::{Expanded, Optimized},
    lex::Token,
    source::{Located, Location},
};

use thiserror::Error;
use tracing::debug;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum OptimizerError {
    /// Un literal conocido ya no se encuentra en la salida.
    #[error("optimizer lost track of an operand of `{0}`")]
    LostOperand(Token),
}

impl Categorized for OptimizerError {
    fn category(&self) -> Category {
        Category::Compile
    }
}

/// Aplica la optimización peephole a un flujo expandido.
pub fn optimize(expanded: Expanded) -> Result<Optimized, Located<OptimizerError>> {
    let (root, tokens, calls) = expanded.into_parts();

    let before = tokens.len();
    let tokens = peephole(tokens)?;
    debug!(before, after = tokens.len(), "peephole optimization");

    Ok(Optimized::new(root, tokens, calls))
}

/// Entrega un flujo expandido sin optimizarlo.
pub fn passthrough(expanded: Expanded) -> Optimized {
    let (root, tokens, calls) = expanded.into_parts();
    Optimized::new(root, tokens, calls)
}

/// Pliega constantes y combina `drop`s en un flujo cualquiera.
///
/// El resultado tiene a lo sumo tantos tokens como la entrada y el mismo
/// efecto observable sobre la pila. Aplicar esta función de nuevo sobre su
/// propia salida no la reduce más.
pub fn peephole(
    tokens: Vec<Located<Token>>,
) -> Result<Vec<Located<Token>>, Located<OptimizerError>> {
    let mut peephole = Peephole {
        output: Vec::with_capacity(tokens.len()),
        known: Vec::new(),
        annotated: false,
    };

    for token in tokens {
        peephole.feed(token)?;
    }

    Ok(peephole.output.into_iter().flatten().collect())
}

/// Un valor conocido en la pila abstracta y la posición del literal
/// que lo produce.
struct Known {
    value: i64,
    slot: usize,
}

struct Peephole {
    output: Vec<Option<Located<Token>>>,
    known: Vec<Known>,

    /// El token anterior fue `apply` o `store`.
    annotated: bool,
}

impl Peephole {
    fn feed(&mut self, token: Located<Token>) -> Result<(), Located<OptimizerError>> {
        let (location, token) = token.split();
        let annotated = std::mem::replace(
            &mut self.annotated,
            matches!(token, Token::Apply(_) | Token::Store(_)),
        );

        match token {
            Token::Int(value) if annotated => self.emit(Token::Int(value), location),

            Token::Int(value) => {
                self.known.push(Known {
                    value,
                    slot: self.output.len(),
                });

                self.emit(Token::Int(value), location);
            }

            Token::Add | Token::Sub | Token::Mul if self.known.len() >= 2 => {
                self.fold(token, location)?;
            }

            Token::Drop(count) => {
                for _ in 0..count {
                    self.known.pop();
                }

                let previous = match self.output.last() {
                    Some(Some(last)) => match last.val() {
                        Token::Drop(previous) => Some(*previous),
                        _ => None,
                    },

                    _ => None,
                };

                // Se combina con el `drop` anterior, tomando la ubicación
                // del más reciente
                let count = match previous {
                    Some(previous) => {
                        self.output.pop();
                        previous + count
                    }

                    None => count,
                };

                self.emit(Token::Drop(count), location);
            }

            other => {
                self.known.clear();
                self.emit(other, location);
            }
        }

        Ok(())
    }

    /// Reemplaza una operación aritmética y sus dos operandos por un literal.
    fn fold(&mut self, operator: Token, location: Location) -> Result<(), Located<OptimizerError>> {
        let (top, second) = match (self.known.pop(), self.known.pop()) {
            (Some(top), Some(second)) => (top, second),
            _ => unreachable!("fold() without two known operands"),
        };

        // `sub` no es conmutativo: el segundo valor menos el tope
        let value = match operator {
            Token::Add => second.value.wrapping_add(top.value),
            Token::Sub => second.value.wrapping_sub(top.value),
            Token::Mul => second.value.wrapping_mul(top.value),
            _ => unreachable!("fold() on non-arithmetic token"),
        };

        for Known { slot, .. } in [top, second] {
            let removed = self.output.get_mut(slot).and_then(Option::take);
            if !matches!(removed.as_ref().map(Located::val), Some(Token::Int(_))) {
                return Err(Located::at(OptimizerError::LostOperand(operator), location));
            }
        }

        self.known.push(Known {
            value,
            slot: self.output.len(),
        });

        self.emit(Token::Int(value), location);
        Ok(())
    }

    fn emit(&mut self, token: Token, location: Location) {
        self.output.push(Some(Located::at(token, location)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expand, lex::Unit, source::Source};
    use std::path::Path;

    fn tokens(text: &str) -> Vec<Located<Token>> {
        let source = Source::new("test.pang", None, String::from(text));
        let unit = Unit::lex(source, Path::new(".")).unwrap();
        let (_, tokens, _) = expand::expand(unit).unwrap().into_parts();

        tokens
    }

    fn optimized(text: &str) -> Vec<Token> {
        peephole(tokens(text))
            .unwrap()
            .into_iter()
            .map(Located::into_inner)
            .collect()
    }

    #[test]
    fn folds_arithmetic_chain() {
        assert_eq!(optimized("2 3 add 4 mul"), vec![Token::Int(20)]);
    }

    #[test]
    fn subtraction_keeps_operand_order() {
        assert_eq!(optimized("10 3 sub"), vec![Token::Int(7)]);
        assert_eq!(optimized("3 10 sub"), vec![Token::Int(-7)]);
    }

    #[test]
    fn folds_expanded_macro() {
        assert_eq!(optimized("macro inc 1 add end 5 inc"), vec![Token::Int(6)]);
    }

    #[test]
    fn only_two_nearest_literals_fold() {
        assert_eq!(
            optimized("1 2 3 add"),
            vec![Token::Int(1), Token::Int(5)]
        );
    }

    #[test]
    fn unknown_operand_blocks_folding() {
        let result = optimized("dup 3 add 4 add");
        assert_eq!(
            result,
            vec![Token::Dup, Token::Int(3), Token::Add, Token::Int(4), Token::Add]
        );
    }

    #[test]
    fn folding_never_crosses_other_operations() {
        let result = optimized("1 2 swap add");
        assert_eq!(result, vec![Token::Int(1), Token::Int(2), Token::Swap, Token::Add]);
    }

    #[test]
    fn drops_coalesce() {
        for count in 1..=6 {
            let text = format!("x{}", " drop".repeat(count));

            let result = optimized(&text);
            assert_eq!(result.len(), 2);
            assert_eq!(result[1], Token::Drop(count as u32));
        }
    }

    #[test]
    fn dropped_literal_is_not_folded() {
        // 1 2 drop 3 add == 1 3 add
        let result = optimized("1 2 drop 3 add");
        assert_eq!(result, vec![Token::Int(2), Token::Drop(1), Token::Int(4)]);
    }

    #[test]
    fn separated_drops_do_not_merge() {
        let result = optimized("x drop 1 drop");
        assert_eq!(
            result,
            vec![
                Token::Id("x".into()),
                Token::Drop(1),
                Token::Int(1),
                Token::Drop(1)
            ]
        );
    }

    #[test]
    fn width_annotations_are_not_folded() {
        let result = optimized("x apply 4 2 add 1 x store 8 3 mul");
        assert_eq!(
            result,
            vec![
                Token::Id("x".into()),
                Token::Apply(None),
                Token::Int(4),
                Token::Int(2),
                Token::Add,
                Token::Int(1),
                Token::Id("x".into()),
                Token::Store(None),
                Token::Int(8),
                Token::Int(3),
                Token::Mul,
            ]
        );
    }

    #[test]
    fn arithmetic_wraps() {
        let result = optimized("9223372036854775807 1 add");
        assert_eq!(result, vec![Token::Int(i64::MIN)]);
    }

    #[test]
    fn second_run_is_idempotent() {
        for text in [
            "2 3 add 4 mul",
            "1 2 drop 3 add",
            "x 1 add 2 3 mul drop drop 5",
            "while dup 0 > do 1 sub end 1 2 3 drop drop",
        ] {
            let once = peephole(tokens(text)).unwrap();
            let length = once.len();
            let twice = peephole(once).unwrap();

            assert_eq!(twice.len(), length, "reoptimized `{}`", text);
        }
    }

    #[test]
    fn folded_literal_takes_operator_location() {
        let result = peephole(tokens("2\n3\nadd")).unwrap();
        assert_eq!(result[0].location().line(), 3);
    }
}
