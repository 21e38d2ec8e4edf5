//! Flujos de tokens entre fases.
//!
//! Cada fase posterior al análisis léxico consume por movimiento el flujo
//! producido por la anterior y entrega uno nuevo, envuelto en un tipo que
//! certifica por cuáles fases ha pasado. Solo los módulos de cada fase pueden
//! construir su tipo de salida, por lo cual el orden expandir → optimizar →
//! resolver → generar queda garantizado en tiempo de compilación. En
//! particular, el resolvedor solo acepta flujos ya optimizados: el plegado
//! de constantes cambia índices de los que dependen los saltos.

use crate::{
    lex::{Identifier, Token},
    source::{Located, Source},
};

use std::{collections::BTreeSet, rc::Rc};

macro_rules! stage {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name {
            root: Rc<Source>,
            tokens: Vec<Located<Token>>,
            calls: BTreeSet<Identifier>,
        }

        impl $name {
            pub(crate) fn new(
                root: Rc<Source>,
                tokens: Vec<Located<Token>>,
                calls: BTreeSet<Identifier>,
            ) -> Self {
                $name {
                    root,
                    tokens,
                    calls,
                }
            }

            /// Origen del archivo raíz de la unidad.
            pub fn root(&self) -> &Rc<Source> {
                &self.root
            }

            /// Flujo de tokens.
            pub fn tokens(&self) -> &[Located<Token>] {
                &self.tokens
            }

            /// Símbolos externos referenciados por el programa.
            pub fn calls(&self) -> &BTreeSet<Identifier> {
                &self.calls
            }

            pub(crate) fn into_parts(
                self,
            ) -> (Rc<Source>, Vec<Located<Token>>, BTreeSet<Identifier>) {
                (self.root, self.tokens, self.calls)
            }
        }
    };
}

stage! {
    /// Flujo plano, sin definiciones ni referencias a macros.
    Expanded
}

stage! {
    /// Flujo luego de la optimización peephole.
    Optimized
}

stage! {
    /// Flujo con todos los marcadores de bloque y anchos resueltos.
    Resolved
}
