//! Expansión de macros.
//!
//! Opera sobre el flujo completo de una [`Unit`], luego de aplanar todas
//! las inclusiones. Consiste de dos recorridos:
//!
//! 1. Recolección ([`MacroTable::collect()`]): cada región `macro nombre ... end`
//!    se registra en la tabla. Las referencias a macros dentro del cuerpo se
//!    sustituyen en ese momento por el cuerpo ya expandido de la macro
//!    referida, por lo cual una macro solo puede referirse a macros definidas
//!    antes que ella.
//! 2. Sustitución ([`substitute()`]): se descartan las definiciones y cada
//!    identificador que nombra una macro se reemplaza por su cuerpo, reubicado
//!    en el sitio de invocación. Los identificadores restantes se conservan
//!    y se tratan como símbolos externos.
//!
//! Los bloques `if ... end` y `while ... do ... end` dentro de una macro
//! también terminan en `end`, así que un contador de profundidad distingue
//! esos `end` internos del que cierra la macro.

use crate::{
    codegen,
    error::{Categorized, Category},
    ir::Expanded,
    lex::{Identifier, Token, Unit},
    source::{Located, Location, Source},
};

use std::{
    collections::{BTreeSet, HashMap},
    rc::Rc,
};

use chrono::{Local, NaiveDateTime};
use thiserror::Error;
use tracing::{debug, trace};

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum ExpandError {
    #[error("macro name must be an identifier")]
    ExpectedName,

    #[error("redefinition of macro `{0}`")]
    Redefinition(Identifier),

    #[error("macro cannot define a macro in itself")]
    NestedMacro,

    /// Una macro se refiere a algo que no es una macro definida previamente.
    #[error("undefined reference to identifier `{0}`")]
    Undefined(Identifier),

    #[error("macro `{0}` is never closed by `end`")]
    Unterminated(Identifier),

    /// El nombre de un símbolo externo choca con el ensamblador.
    #[error("`{0}` is reserved and cannot name an external symbol")]
    ReservedSymbol(Identifier),
}

impl Categorized for ExpandError {
    fn category(&self) -> Category {
        match self {
            ExpandError::Unterminated(_) => Category::Structural,
            _ => Category::Name,
        }
    }
}

pub type Expansion<T> = Result<T, Located<ExpandError>>;

/// Macros predefinidas por el compilador.
const PREDEFINED: &[&str] = &[
    "__LINE__",
    "__FILE__",
    "__BASE_FILE__",
    "__VERSION__",
    "__ARCH__",
    "__ENUM__",
    "__DATE__",
    "__TIME__",
];

/// Tabla de macros de una unidad de compilación.
///
/// Se construye una única vez y no cambia luego de la recolección.
#[derive(Default)]
pub struct MacroTable {
    macros: HashMap<Identifier, Rc<[Located<Token>]>>,
}

impl MacroTable {
    /// Recolecta todas las definiciones de macros de un flujo.
    pub fn collect(tokens: &[Located<Token>]) -> Expansion<Self> {
        let mut table = MacroTable::default();
        let mut tokens = tokens.iter();

        while let Some(token) = tokens.next() {
            if let Token::Macro = token.val() {
                let (location, name) = match tokens.next() {
                    Some(next) => match next.val() {
                        Token::Id(name) => (next.location().clone(), name.clone()),
                        _ => return Err(expected_name(next.location())),
                    },

                    None => return Err(expected_name(token.location())),
                };

                if table.macros.contains_key(&name) || is_predefined(&name) {
                    return Err(Located::at(ExpandError::Redefinition(name), location));
                }

                let body = table.capture(&name, token.location(), &mut tokens)?;
                trace!("macro `{}` defined with {} tokens", name, body.len());

                table.macros.insert(name, body.into());
            }
        }

        Ok(table)
    }

    /// Cuerpo completamente expandido de una macro.
    pub fn get(&self, name: &Identifier) -> Option<&[Located<Token>]> {
        self.macros.get(name).map(|body| &**body)
    }

    fn len(&self) -> usize {
        self.macros.len()
    }

    /// Captura el cuerpo de una macro hasta su `end` correspondiente.
    ///
    /// `__LINE__` y `__FILE__` toman aquí los valores del sitio de
    /// definición. Las demás macros predefinidas se evalúan al invocar.
    fn capture<'t, I>(
        &self,
        name: &Identifier,
        at: &Location,
        tokens: &mut I,
    ) -> Expansion<Vec<Located<Token>>>
    where
        I: Iterator<Item = &'t Located<Token>>,
    {
        let mut body = Vec::new();
        let mut depth = 0u32;

        for token in tokens {
            match token.val() {
                Token::Macro => {
                    return Err(Located::at(ExpandError::NestedMacro, token.location().clone()))
                }

                Token::End(_) if depth == 0 => return Ok(body),
                Token::End(_) => depth -= 1,
                Token::If(_) | Token::While(_) => depth += 1,

                Token::Call(target) => check_symbol(target, token.location())?,

                Token::Id(reference) if is_predefined(reference) => {
                    if let Some(value) = site_value(reference, token.location()) {
                        body.push(Located::at(value, token.location().clone()));
                        continue;
                    }
                }

                Token::Id(reference) => match self.macros.get(reference) {
                    Some(expansion) => {
                        body.extend(expansion.iter().cloned());
                        continue;
                    }

                    None => {
                        let error = ExpandError::Undefined(reference.clone());
                        return Err(Located::at(error, token.location().clone()));
                    }
                },

                _ => (),
            }

            body.push(token.clone());
        }

        Err(Located::at(ExpandError::Unterminated(name.clone()), at.clone()))
    }
}

/// Expande todas las macros de una unidad.
pub fn expand(unit: Unit) -> Expansion<Expanded> {
    let table = MacroTable::collect(unit.tokens())?;
    let (root, tokens, mut calls) = unit.into_parts();

    let tokens = substitute(tokens, &table, &root, &mut calls)?;
    debug!(
        macros = table.len(),
        tokens = tokens.len(),
        calls = calls.len(),
        "expanded macros"
    );

    Ok(Expanded::new(root, tokens, calls))
}

/// Sustituye referencias a macros, descartando definiciones.
///
/// Todo identificador que no nombra una macro se conserva y se
/// registra en `calls`.
pub fn substitute(
    tokens: Vec<Located<Token>>,
    table: &MacroTable,
    root: &Source,
    calls: &mut BTreeSet<Identifier>,
) -> Expansion<Vec<Located<Token>>> {
    let base_file = root
        .path()
        .map(|path| path.display().to_string())
        .unwrap_or_else(|| root.name().to_owned());

    let (date, time) = timestamp(&Local::now().naive_local());

    let mut expander = Expander {
        table,
        calls,
        base_file: Rc::from(base_file.into_bytes()),
        date: Rc::from(date.into_bytes()),
        time: Rc::from(time.into_bytes()),
        enumerator: 0,
    };

    expander.substitute(tokens)
}

struct Expander<'a> {
    table: &'a MacroTable,
    calls: &'a mut BTreeSet<Identifier>,
    base_file: Rc<[u8]>,
    date: Rc<[u8]>,
    time: Rc<[u8]>,
    enumerator: i64,
}

impl Expander<'_> {
    fn substitute(&mut self, tokens: Vec<Located<Token>>) -> Expansion<Vec<Located<Token>>> {
        let mut output = Vec::with_capacity(tokens.len());
        let mut tokens = tokens.into_iter();

        while let Some(token) = tokens.next() {
            let (location, token) = token.split();

            match token {
                // Las definiciones ya fueron validadas durante la recolección
                Token::Macro => skip_definition(&mut tokens),
                Token::Id(name) => self.reference(name, location, &mut output)?,

                Token::Call(target) => {
                    check_symbol(&target, &location)?;
                    self.calls.insert(target.clone());
                    output.push(Located::at(Token::Call(target), location));
                }

                token => output.push(Located::at(token, location)),
            }
        }

        Ok(output)
    }

    fn reference(
        &mut self,
        name: Identifier,
        at: Location,
        output: &mut Vec<Located<Token>>,
    ) -> Expansion<()> {
        if let Some(token) = self.predefined(&name, &at) {
            output.push(Located::at(token, at));
            return Ok(());
        }

        let body = match self.table.macros.get(&name) {
            Some(body) => Rc::clone(body),
            None => {
                check_symbol(&name, &at)?;
                self.calls.insert(name.clone());
                output.push(Located::at(Token::Id(name), at));
                return Ok(());
            }
        };

        for token in body.iter() {
            let token = match token.val() {
                Token::Id(inner) => match self.predefined(inner, &at) {
                    Some(token) => token,
                    None => unreachable!("unexpanded reference `{}` in macro body", inner),
                },

                Token::Call(target) => {
                    self.calls.insert(target.clone());
                    token.val().clone()
                }

                other => other.clone(),
            };

            output.push(Located::at(token, at.clone()));
        }

        Ok(())
    }

    /// Valor de una macro predefinida en un sitio de invocación.
    fn predefined(&mut self, name: &Identifier, at: &Location) -> Option<Token> {
        if let Some(value) = site_value(name, at) {
            return Some(value);
        }

        let token = match name.as_ref() {
            "__BASE_FILE__" => Token::Str(Rc::clone(&self.base_file)),
            "__VERSION__" => Token::Int(version()),
            "__ARCH__" => Token::Str(Rc::from(&b"x86_64"[..])),
            "__DATE__" => Token::Str(Rc::clone(&self.date)),
            "__TIME__" => Token::Str(Rc::clone(&self.time)),
            "__ENUM__" => {
                let value = self.enumerator;
                self.enumerator += 1;
                Token::Int(value)
            }

            _ => return None,
        };

        Some(token)
    }
}

/// Macros predefinidas cuyo valor depende solo de una ubicación.
fn site_value(name: &Identifier, at: &Location) -> Option<Token> {
    match name.as_ref() {
        "__LINE__" => Some(Token::Int(at.line() as i64)),
        "__FILE__" => {
            let source = at.source();
            let file = source
                .path()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| source.name().to_owned());

            Some(Token::Str(Rc::from(file.into_bytes())))
        }

        _ => None,
    }
}

/// Descarta una definición de macro, comenzando por su nombre.
fn skip_definition<I: Iterator<Item = Located<Token>>>(tokens: &mut I) {
    let mut depth = 0u32;

    // Nombre
    tokens.next();

    for token in tokens {
        match token.val() {
            Token::End(_) if depth == 0 => return,
            Token::End(_) => depth -= 1,
            Token::If(_) | Token::While(_) => depth += 1,
            _ => (),
        }
    }
}

fn expected_name(at: &Location) -> Located<ExpandError> {
    Located::at(ExpandError::ExpectedName, at.clone())
}

/// Rechaza símbolos externos que el ensamblador no puede declarar.
fn check_symbol(name: &Identifier, at: &Location) -> Expansion<()> {
    if codegen::is_reserved_symbol(name.as_ref()) {
        let error = ExpandError::ReservedSymbol(name.clone());
        return Err(Located::at(error, at.clone()));
    }

    Ok(())
}

fn is_predefined(name: &Identifier) -> bool {
    PREDEFINED.contains(&name.as_ref())
}

/// Versión del compilador como entero: `mayor * 100 + menor`.
fn version() -> i64 {
    let major: i64 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: i64 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);

    major * 100 + minor
}

/// Fecha y hora de compilación con los formatos `"Mmm dd yyyy"` y
/// `"hh:mm:ss"` de C.
fn timestamp(now: &NaiveDateTime) -> (String, String) {
    let date = now.format("%b %e %Y").to_string();
    let time = now.format("%H:%M:%S").to_string();

    (date, time)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn unit(text: &str) -> Unit {
        let source = Source::new("test.pang", None, String::from(text));
        Unit::lex(source, Path::new(".")).unwrap()
    }

    fn expanded(text: &str) -> Expansion<Vec<Token>> {
        let expanded = expand(unit(text))?;
        Ok(expanded.tokens().iter().map(|token| token.val().clone()).collect())
    }

    #[test]
    fn macro_is_inlined_at_reference() {
        let tokens = expanded("macro inc 1 add end 5 inc").unwrap();
        assert_eq!(tokens, vec![Token::Int(5), Token::Int(1), Token::Add]);
    }

    #[test]
    fn nested_blocks_do_not_close_macro() {
        let tokens = expanded("macro m while dup do 1 sub end 2 if 3 end end m").unwrap();
        assert_eq!(tokens.len(), 10);
        assert_eq!(tokens.last(), Some(&Token::End(None)));
    }

    #[test]
    fn macros_expand_earlier_macros_in_body() {
        let tokens = expanded("macro one 1 end macro two one one add end two").unwrap();
        assert_eq!(tokens, vec![Token::Int(1), Token::Int(1), Token::Add]);
    }

    #[test]
    fn forward_reference_in_body_is_undefined() {
        let error = expanded("macro a b end macro b 1 end").unwrap_err();
        assert!(matches!(error.val(), ExpandError::Undefined(name) if name.as_ref() == "b"));
        assert_eq!(error.val().category(), Category::Name);
    }

    #[test]
    fn redefinition_is_rejected() {
        let error = expanded("macro a 1 end macro a 2 end").unwrap_err();
        assert!(matches!(error.val(), ExpandError::Redefinition(_)));
    }

    #[test]
    fn macro_name_must_be_identifier() {
        let error = expanded("macro 5 end").unwrap_err();
        assert!(matches!(error.val(), ExpandError::ExpectedName));
    }

    #[test]
    fn macro_cannot_define_macro() {
        let error = expanded("macro a macro b end end").unwrap_err();
        assert!(matches!(error.val(), ExpandError::NestedMacro));
    }

    #[test]
    fn unterminated_macro_is_structural() {
        let error = expanded("macro a 1 2").unwrap_err();
        assert!(matches!(error.val(), ExpandError::Unterminated(_)));
        assert_eq!(error.val().category(), Category::Structural);
    }

    #[test]
    fn unknown_identifiers_become_calls() {
        let expanded = expand(unit("1 puts call exit")).unwrap();

        assert_eq!(
            expanded.tokens()[1].val(),
            &Token::Id(Identifier::from("puts"))
        );

        let calls: Vec<_> = expanded.calls().iter().map(|id| id.to_string()).collect();
        assert_eq!(calls, vec!["exit", "puts"]);
    }

    #[test]
    fn expansion_is_relocated_to_invocation() {
        let expanded = expand(unit("macro two\n2\nend\n\n\ntwo")).unwrap();
        assert_eq!(expanded.tokens()[0].location().line(), 6);
    }

    #[test]
    fn predefined_macros() {
        let text = "__LINE__\n__ENUM__ __ENUM__ macro e __ENUM__ end e __ARCH__";
        let tokens = expanded(text).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Int(1),
                Token::Int(0),
                Token::Int(1),
                Token::Int(2),
                Token::Str(Rc::from(&b"x86_64"[..])),
            ]
        );
    }

    #[test]
    fn line_and_file_in_body_keep_definition_site() {
        let tokens = expanded("macro l __LINE__ end\n\n\nl __LINE__").unwrap();
        assert_eq!(tokens, vec![Token::Int(1), Token::Int(4)]);

        let tokens = expanded("macro f __FILE__ end f __FILE__ __BASE_FILE__").unwrap();
        let file = Token::Str(Rc::from(&b"test.pang"[..]));
        assert_eq!(tokens, vec![file.clone(), file.clone(), file]);
    }

    #[test]
    fn version_and_timestamp() {
        let tokens = expanded("__VERSION__ __DATE__ __TIME__").unwrap();
        assert_eq!(tokens[0], Token::Int(100));

        match (&tokens[1], &tokens[2]) {
            (Token::Str(date), Token::Str(time)) => {
                assert_eq!(date.len(), "Dec  4 2025".len());
                assert_eq!(time.len(), "14:30:00".len());
                assert_eq!(time[2], b':');
            }

            other => panic!("expected strings, found {:?}", other),
        }
    }

    #[test]
    fn timestamp_uses_c_formats() {
        let now = chrono::NaiveDate::from_ymd_opt(2025, 12, 4)
            .and_then(|date| date.and_hms_opt(14, 30, 5))
            .unwrap();

        assert_eq!(
            timestamp(&now),
            (String::from("Dec  4 2025"), String::from("14:30:05"))
        );
    }

    #[test]
    fn reserved_symbols_are_rejected() {
        for text in ["main", "call main", "rax", "call qword", "macro m call r9d end"] {
            let error = expanded(text).unwrap_err();
            assert!(matches!(error.val(), ExpandError::ReservedSymbol(_)), "{}", text);
            assert_eq!(error.val().category(), Category::Name);
        }

        assert!(expanded("mainly r16 call raxes").is_ok());
    }

    #[test]
    fn table_is_explicit() {
        let unit = unit("macro a 1 end macro b a a end b");
        let table = MacroTable::collect(unit.tokens()).unwrap();
        assert_eq!(table.len(), 2);

        let body: Vec<_> = table
            .get(&Identifier::from("b"))
            .unwrap()
            .iter()
            .map(|token| token.val().clone())
            .collect();

        assert_eq!(body, vec![Token::Int(1), Token::Int(1)]);

        let mut calls = BTreeSet::new();
        let (root, tokens, _) = unit.into_parts();
        let tokens = substitute(tokens, &table, &root, &mut calls).unwrap();
        assert_eq!(tokens.len(), 2);
        assert!(calls.is_empty());
    }
}
