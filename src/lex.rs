//! Análisis léxico.
//!
//! # Tokenization
//! Esta es la primera fase del compilador. Descompone un [`InputStream`]
//! (flujo de caracteres) en unidades léxicas denominadas tokens. Los espacios
//! en blanco y los comentarios se descartan durante esta operación. Cada
//! token emitido está asociado a una ubicación en el código fuente original,
//! lo cual permite rastrear errores tanto en los mismos como en fases
//! posteriores.
//!
//! # Contenido de un token
//! Este lexer no produce lexemas para casos donde no son necesarios. Las
//! palabras clave y los operadores se identifican por el hecho de lo que son
//! y su ortografía se recupera por medio de [`Display`]. Los identificadores
//! sí incluyen su lexema original. Las constantes literales se resuelven a
//! sus valores en vez de preservar sus lexemas.
//!
//! # Inclusiones
//! `include "ruta"` e `include 'biblioteca'` no producen tokens: el lexer
//! emite una solicitud de inclusión que [`Unit::lex()`] resuelve abriendo
//! otro lexer sobre el archivo indicado. Cada archivo se incluye a lo sumo
//! una vez por unidad. Las macros no se expanden aquí; eso ocurre una única
//! vez sobre el flujo completo, en [`crate::expand`].
//!
//! # Errores
//! Todo error léxico es fatal. Luego del primer error, el lexer no emite
//! más elementos.

use crate::{
    error::{Categorized, Category},
    source::{self, InputStream, Located, Location, Source},
};

use std::{
    collections::{BTreeSet, HashSet},
    fmt::{self, Display},
    fs, io,
    iter::Peekable,
    mem,
    path::{Path, PathBuf},
    rc::Rc,
    str::FromStr,
};

use thiserror::Error;
use tracing::{debug, trace};

/// Error de escaneo.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LexerError {
    /// Carácter desconocido o inesperado en el flujo de entrada.
    #[error("invalid character {0:?}")]
    BadChar(char),

    /// `/` que no inicia un comentario.
    #[error("expected `//` or `/* */` comment")]
    LoneSlash,

    #[error("unterminated block comment")]
    UnterminatedComment,

    /// Un literal decimal con ceros a la izquierda es ambiguo.
    #[error("leading zeros in integer literals are prohibited; use 0o for octal integers instead")]
    LeadingZero,

    #[error("expected digits after radix prefix")]
    EmptyRadix,

    /// Una constante entera no cabe en una palabra nativa.
    #[error(
        "integer literal exceeds the native word width, valid range is [{}, {}]",
        i64::MIN,
        i64::MAX
    )]
    IntOverflow,

    #[error("unterminated string literal")]
    UnterminatedString,

    #[error("unterminated char literal")]
    UnterminatedChar,

    #[error("char must be exactly 1 character long")]
    CharLength,

    #[error("unknown escape sequence `\\{0}`")]
    BadEscape(String),

    /// `include` debe ir seguido de una ruta entre comillas.
    #[error("must include a string or system library")]
    ExpectedIncludePath,

    #[error("unterminated include path")]
    UnterminatedPath,

    /// No fue posible abrir o leer un archivo incluido.
    #[error("cannot include `{path}`: {source}")]
    Include {
        path: String,
        #[source]
        source: io::Error,
    },

    /// `call` debe ir seguido de un identificador que no sea palabra clave.
    #[error("expected identifier after `call`")]
    ExpectedCallTarget,
}

impl Categorized for LexerError {
    fn category(&self) -> Category {
        match self {
            LexerError::IntOverflow => Category::Compile,
            _ => Category::Syntax,
        }
    }
}

/// Un identificador.
///
/// Los identificadores que no nombran macros terminan siendo
/// símbolos externos, por lo cual se ordenan para emitirse de
/// manera determinista.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Identifier(Rc<str>);

impl From<&str> for Identifier {
    fn from(name: &str) -> Self {
        Identifier(Rc::from(name))
    }
}

impl From<String> for Identifier {
    fn from(name: String) -> Self {
        Identifier(Rc::from(name))
    }
}

impl AsRef<str> for Identifier {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Display for Identifier {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str(&self.0)
    }
}

/// Ancho en bytes de un acceso a memoria por `apply` o `store`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Width {
    Byte,
    Word,
    Dword,
    Qword,
}

impl Width {
    /// Interpreta una anotación de ancho.
    pub fn from_bytes(bytes: i64) -> Option<Self> {
        match bytes {
            1 => Some(Width::Byte),
            2 => Some(Width::Word),
            4 => Some(Width::Dword),
            8 => Some(Width::Qword),
            _ => None,
        }
    }

    pub fn bytes(self) -> u32 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Dword => 4,
            Width::Qword => 8,
        }
    }
}

/// Objeto resultante del análisis léxico.
///
/// Los marcadores de bloque llevan el índice absoluto de token al que
/// saltan (o del que provienen), el cual es `None` hasta que el flujo
/// pasa por [`crate::resolve`]. De la misma forma, `apply` y `store`
/// reciben su ancho durante esa fase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Identificador: referencia a macro o símbolo externo.
    Id(Identifier),

    /// `call name`
    Call(Identifier),

    /// Literal entero o de carácter.
    Int(i64),

    /// Literal de string, ya decodificado a bytes.
    Str(Rc<[u8]>),

    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Dup,
    Swap,

    /// `drop`, con la cantidad de elementos a descartar.
    Drop(u32),

    /// `=`
    Equal,

    /// `!`
    NotEqual,

    /// `>`
    Greater,

    /// `<`
    Smaller,

    BitAnd,
    BitOr,
    Xor,
    BitNot,
    LeftShift,
    RightShift,

    /// Desreferencia.
    Apply(Option<Width>),

    /// Toma de dirección.
    Quote,

    /// Escritura a memoria.
    Store(Option<Width>),

    If(Option<usize>),
    Else(Option<usize>),
    While(Option<usize>),
    Do(Option<usize>),
    End(Option<usize>),

    Macro,
}

impl Display for Token {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Token::*;

        let keyword = match self {
            Id(id) => return write!(fmt, "{}", id),
            Call(id) => return write!(fmt, "call {}", id),
            Int(integer) => return write!(fmt, "{}", integer),
            Str(string) => return write!(fmt, "{:?}", String::from_utf8_lossy(string)),
            Equal => return fmt.write_str("="),
            NotEqual => return fmt.write_str("!"),
            Greater => return fmt.write_str(">"),
            Smaller => return fmt.write_str("<"),

            Add => Keyword::Add,
            Sub => Keyword::Sub,
            Mul => Keyword::Mul,
            Div => Keyword::Div,
            Mod => Keyword::Mod,
            Dup => Keyword::Dup,
            Swap => Keyword::Swap,
            Drop(_) => Keyword::Drop,
            BitAnd => Keyword::BitAnd,
            BitOr => Keyword::BitOr,
            Xor => Keyword::Xor,
            BitNot => Keyword::BitNot,
            LeftShift => Keyword::LeftShift,
            RightShift => Keyword::RightShift,
            Apply(_) => Keyword::Apply,
            Quote => Keyword::Quote,
            Store(_) => Keyword::Store,
            If(_) => Keyword::If,
            Else(_) => Keyword::Else,
            While(_) => Keyword::While,
            Do(_) => Keyword::Do,
            End(_) => Keyword::End,
            Macro => Keyword::Macro,
        };

        Display::fmt(&keyword, fmt)
    }
}

/// Una palabra clave.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Keyword {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Dup,
    Swap,
    Drop,
    BitAnd,
    BitOr,
    Xor,
    BitNot,
    LeftShift,
    RightShift,
    Apply,
    Quote,
    Store,
    If,
    Else,
    While,
    Do,
    End,
    Macro,
    Include,
    Call,
}

impl Keyword {
    /// Token que produce esta palabra clave, si produce alguno.
    ///
    /// `include` y `call` se procesan directamente en el lexer.
    fn token(self) -> Option<Token> {
        use Keyword::*;

        let token = match self {
            Add => Token::Add,
            Sub => Token::Sub,
            Mul => Token::Mul,
            Div => Token::Div,
            Mod => Token::Mod,
            Dup => Token::Dup,
            Swap => Token::Swap,
            Drop => Token::Drop(1),
            BitAnd => Token::BitAnd,
            BitOr => Token::BitOr,
            Xor => Token::Xor,
            BitNot => Token::BitNot,
            LeftShift => Token::LeftShift,
            RightShift => Token::RightShift,
            Apply => Token::Apply(None),
            Quote => Token::Quote,
            Store => Token::Store(None),
            If => Token::If(None),
            Else => Token::Else(None),
            While => Token::While(None),
            Do => Token::Do(None),
            End => Token::End(None),
            Macro => Token::Macro,
            Include | Call => return None,
        };

        Some(token)
    }
}

#[rustfmt::skip]
const KEYWORDS: &[(&str, Keyword)] = &[
    ("add",     Keyword::Add),
    ("sub",     Keyword::Sub),
    ("mul",     Keyword::Mul),
    ("div",     Keyword::Div),
    ("mod",     Keyword::Mod),
    ("dup",     Keyword::Dup),
    ("swap",    Keyword::Swap),
    ("drop",    Keyword::Drop),
    ("band",    Keyword::BitAnd),
    ("bor",     Keyword::BitOr),
    ("xor",     Keyword::Xor),
    ("bnot",    Keyword::BitNot),
    ("lshift",  Keyword::LeftShift),
    ("rshift",  Keyword::RightShift),
    ("apply",   Keyword::Apply),
    ("quote",   Keyword::Quote),
    ("store",   Keyword::Store),
    ("if",      Keyword::If),
    ("else",    Keyword::Else),
    ("while",   Keyword::While),
    ("do",      Keyword::Do),
    ("end",     Keyword::End),
    ("macro",   Keyword::Macro),
    ("include", Keyword::Include),
    ("call",    Keyword::Call),
];

impl Display for Keyword {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, _) = KEYWORDS
            .iter()
            .find(|&&(_, keyword)| keyword == *self)
            .expect("keyword missing from table");

        fmt.write_str(name)
    }
}

impl FromStr for Keyword {
    type Err = ();

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        KEYWORDS
            .iter()
            .find(|&&(name, _)| name == string)
            .map(|&(_, keyword)| keyword)
            .ok_or(())
    }
}

/// Solicitud de inclusión de otro archivo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Include {
    /// `include "ruta"`, relativa al archivo que incluye.
    Relative(String),

    /// `include 'nombre'`, dentro del directorio de bibliotecas del sistema.
    System(String),
}

/// Elemento emitido por el lexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lexeme {
    Token(Token),
    Include(Include),
}

/// Máquina de estados para análisis léxico.
///
/// Un lexer puede encontrarse en uno de diversos estados. La
/// salida del lexer, así como su siguiente estado, se define
/// a partir de tanto su estado actual como el siguiente carácter
/// encontrado en el flujo de entrada.
pub struct Lexer<S: Iterator> {
    source: Peekable<S>,
    state: State,
    start: Location,
    done: bool,
}

/// Posibles estados del lexer.
enum State {
    /// Estado que ocurre antes de encontrar el inicio de un token.
    Start,

    /// Estado de completitud; siempre emite el elemento incluido,
    /// consume la entrada actual y pasa a [`State::Start`].
    Complete(Lexeme),

    /// Se encontró `/`.
    ///
    /// Debería seguir otro `/` o un `*` para entrar en un comentario.
    Slash,

    /// Comentario de línea.
    ///
    /// Este estado vuelve a [`State::Start`] al encontrar `'\n'`.
    LineComment,

    /// Comentario de bloque. `star` indica si el último carácter fue `*`.
    BlockComment { star: bool },

    /// Se encontró `+` o `-`, debe seguir un dígito.
    Sign { negative: bool },

    /// Un `0` inicial, que puede ser un prefijo de base.
    Zero { negative: bool },

    /// Constante entera en cualquier base.
    ///
    /// Este estado incluirá dígitos en el token mientras que
    /// el siguiente carácter sea un dígito válido en la base.
    Integer {
        radix: u32,
        value: i64,
        negative: bool,
        digits: u32,
    },

    /// Término que puede ser un identificador o una palabra clave.
    Word(String),

    /// Literal de string. `escaped` indica si el último carácter fue `\`.
    Str { raw: String, escaped: bool },

    /// `r"..."`, sin secuencias de escape.
    RawStr(String),

    /// Literal de carácter.
    Char { raw: String, escaped: bool },

    /// Se encontró `include`, se espera una ruta.
    AfterInclude,

    /// Ruta de inclusión entre comillas dobles o simples.
    Path { path: String, system: bool },

    /// Se encontró `call`, se espera un identificador.
    AfterCall,

    /// Nombre de una función externa.
    CallTarget(String),
}

impl<S: InputStream> Lexer<S> {
    /// Crea un lexer en estado inicial a partir de un flujo.
    pub fn new(start: Location, source: S) -> Self {
        Lexer {
            source: source.peekable(),
            state: State::Start,
            start,
            done: false,
        }
    }

    /// Intenta construir un siguiente elemento.
    fn lex(&mut self) -> Result<Option<Lexeme>, LexerError> {
        use State::*;

        let lexeme = loop {
            let next_char = match self.source.peek() {
                None => None,
                Some((c, location)) => {
                    // La posición de origen se mueve junto a la posición
                    // siguiente siempre que no se haya encontrado una
                    // frontera de token
                    if let Start = self.state {
                        self.start = location.clone();
                    }

                    Some(*c)
                }
            };

            // Switch table principal, determina cambios de estado
            // y de salida del lexer a partir de combinaciones del
            // estado actual y el siguiente carácter
            match (&mut self.state, next_char) {
                (Start, None) => return Ok(None),

                // Tokens triviales
                (Start, Some('=')) => self.state = Complete(Lexeme::Token(Token::Equal)),
                (Start, Some('!')) => self.state = Complete(Lexeme::Token(Token::NotEqual)),
                (Start, Some('>')) => self.state = Complete(Lexeme::Token(Token::Greater)),
                (Start, Some('<')) => self.state = Complete(Lexeme::Token(Token::Smaller)),
                (Start, Some('/')) => self.state = Slash,

                // Literales
                (Start, Some('"')) => {
                    self.state = Str {
                        raw: String::new(),
                        escaped: false,
                    }
                }

                (Start, Some('\'')) => {
                    self.state = Char {
                        raw: String::new(),
                        escaped: false,
                    }
                }

                (Start, Some('+')) => self.state = Sign { negative: false },
                (Start, Some('-')) => self.state = Sign { negative: true },
                (Start, Some('0')) => self.state = Zero { negative: false },

                // Inicio de una constante decimal. No se consume el dígito,
                // ya que esta lógica ya está implementada en el respectivo
                // caso para un estado de constante entera.
                (Start, Some(c)) if c.is_ascii_digit() => {
                    self.state = Integer {
                        radix: 10,
                        value: 0,
                        negative: false,
                        digits: 0,
                    };

                    continue;
                }

                // Identificadores y palabras clave
                (Start, Some(c)) if is_word_start(c) => self.state = Word(c.to_string()),

                // Espacios en blanco y caracteres inesperados
                (Start, Some(c)) if c.is_ascii_whitespace() => (),
                (Start, Some(c)) => break Err(LexerError::BadChar(c)),

                // Emisión retardada de elementos cualesquiera
                (Complete(lexeme), _) => {
                    break Ok(mem::replace(lexeme, Lexeme::Token(Token::Quote)))
                }

                (Slash, Some('/')) => self.state = LineComment,
                (Slash, Some('*')) => self.state = BlockComment { star: false },
                (Slash, _) => break Err(LexerError::LoneSlash),

                (LineComment, Some('\n')) | (LineComment, None) => self.state = Start,
                (LineComment, Some(_)) => (),

                (BlockComment { star: true }, Some('/')) => self.state = Start,
                (BlockComment { star }, Some(c)) => *star = c == '*',
                (BlockComment { .. }, None) => break Err(LexerError::UnterminatedComment),

                (Sign { negative }, Some(c)) if c.is_ascii_digit() => {
                    let negative = *negative;
                    self.state = if c == '0' {
                        Zero { negative }
                    } else {
                        Integer {
                            radix: 10,
                            value: 0,
                            negative,
                            digits: 0,
                        }
                    };

                    // El cero se consume, los demás dígitos se acumulan
                    if c != '0' {
                        continue;
                    }
                }

                (Sign { negative: true }, _) => break Err(LexerError::BadChar('-')),
                (Sign { negative: false }, _) => break Err(LexerError::BadChar('+')),

                (Zero { negative }, Some(prefix @ ('x' | 'X' | 'o' | 'O'))) => {
                    let negative = *negative;
                    let radix = if matches!(prefix, 'x' | 'X') { 16 } else { 8 };
                    self.state = Integer {
                        radix,
                        value: 0,
                        negative,
                        digits: 0,
                    };
                }

                (Zero { .. }, Some(c)) if c.is_ascii_digit() => break Err(LexerError::LeadingZero),
                (Zero { .. }, _) => break Ok(Lexeme::Token(Token::Int(0))),

                // Acumulación dígito por dígito de constantes enteras
                (
                    Integer {
                        radix,
                        value,
                        negative,
                        digits,
                    },
                    Some(c),
                ) if c.is_digit(*radix) => {
                    *value = accumulate(*value, c, *radix, *negative)?;
                    *digits += 1;
                }

                // Si sigue algo que no es un dígito, la constante ha terminado
                (Integer { digits: 0, .. }, _) => break Err(LexerError::EmptyRadix),
                (Integer { value, .. }, _) => break Ok(Lexeme::Token(Token::Int(*value))),

                // Prefijo de string sin escapes
                (Word(word), Some('"')) if word.as_str() == "r" => {
                    self.state = RawStr(String::new())
                }

                // Extensión de términos
                (Word(word), Some(c)) if is_word_char(c) => word.push(c),

                // Si sigue algo que no puede formar parte del término, ha terminado
                (Word(word), _) => {
                    let word = mem::take(word);

                    match Keyword::from_str(&word) {
                        Ok(Keyword::Include) => self.state = AfterInclude,
                        Ok(Keyword::Call) => self.state = AfterCall,
                        Ok(keyword) => match keyword.token() {
                            Some(token) => break Ok(Lexeme::Token(token)),
                            None => unreachable!("keyword {} has no token", keyword),
                        },

                        Err(()) => break Ok(Lexeme::Token(Token::Id(Identifier::from(word)))),
                    }

                    // El carácter actual no forma parte de la palabra clave
                    continue;
                }

                (Str { raw, escaped: false }, Some('"')) => {
                    let mut bytes = Vec::with_capacity(raw.len());
                    for decoded in unescape(raw)? {
                        decoded.encode(&mut bytes);
                    }

                    self.state = Complete(Lexeme::Token(Token::Str(Rc::from(bytes))));
                }

                (Str { raw, escaped }, Some(c)) => {
                    *escaped = c == '\\' && !*escaped;
                    raw.push(c);
                }

                (Str { .. }, None) => break Err(LexerError::UnterminatedString),

                (RawStr(raw), Some('"')) => {
                    let raw = mem::take(raw).into_bytes();
                    self.state = Complete(Lexeme::Token(Token::Str(Rc::from(raw))));
                }

                (RawStr(raw), Some(c)) => raw.push(c),
                (RawStr(_), None) => break Err(LexerError::UnterminatedString),

                (Char { raw, escaped: false }, Some('\'')) => {
                    match unescape(raw)?.as_slice() {
                        [decoded] => {
                            let value = decoded.value();
                            self.state = Complete(Lexeme::Token(Token::Int(value)));
                        }

                        _ => break Err(LexerError::CharLength),
                    }
                }

                (Char { raw, escaped }, Some(c)) => {
                    *escaped = c == '\\' && !*escaped;
                    raw.push(c);
                }

                (Char { .. }, None) => break Err(LexerError::UnterminatedChar),

                (AfterInclude, Some(c)) if c.is_ascii_whitespace() => (),
                (AfterInclude, Some('"')) => {
                    self.state = Path {
                        path: String::new(),
                        system: false,
                    }
                }

                (AfterInclude, Some('\'')) => {
                    self.state = Path {
                        path: String::new(),
                        system: true,
                    }
                }

                (AfterInclude, _) => break Err(LexerError::ExpectedIncludePath),

                (Path { path, system }, Some(c)) if c == closing_quote(*system) => {
                    let path = mem::take(path);
                    let include = if *system {
                        Include::System(path)
                    } else {
                        Include::Relative(path)
                    };

                    self.state = Complete(Lexeme::Include(include));
                }

                (Path { .. }, Some('\n')) | (Path { .. }, None) => {
                    break Err(LexerError::UnterminatedPath)
                }

                (Path { path, .. }, Some(c)) => path.push(c),

                (AfterCall, Some(c)) if c.is_ascii_whitespace() => (),
                (AfterCall, Some(c)) if is_word_start(c) => self.state = CallTarget(c.to_string()),
                (AfterCall, _) => break Err(LexerError::ExpectedCallTarget),

                (CallTarget(name), Some(c)) if is_word_char(c) => name.push(c),
                (CallTarget(name), _) => {
                    if Keyword::from_str(name).is_ok() {
                        break Err(LexerError::ExpectedCallTarget);
                    }

                    let name = mem::take(name);
                    break Ok(Lexeme::Token(Token::Call(Identifier::from(name))));
                }
            }

            // Si no hubo `continue` ni `break`, aquí se consume el carácter
            // que se observó con lookahead anteriormente
            self.source.next();
        };

        lexeme.map(Some)
    }
}

impl<S: InputStream> Iterator for Lexer<S> {
    type Item = Result<Located<Lexeme>, Located<LexerError>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.lex() {
            Ok(None) => {
                self.done = true;
                None
            }

            Ok(Some(lexeme)) => {
                self.state = State::Start;
                Some(Ok(Located::at(lexeme, self.start.clone())))
            }

            // Los errores se reportan en el inicio del token, de manera
            // que un literal sin terminar señala la línea donde abre
            Err(error) => {
                self.done = true;
                Some(Err(Located::at(error, self.start.clone())))
            }
        }
    }
}

/// Resultado del análisis léxico de un archivo raíz y todas sus inclusiones.
pub struct Unit {
    root: Rc<Source>,
    tokens: Vec<Located<Token>>,
    includes: HashSet<PathBuf>,
    calls: BTreeSet<Identifier>,
}

impl Unit {
    /// Analiza léxicamente un origen, incluyendo recursivamente los
    /// archivos que este solicite.
    ///
    /// Las inclusiones de sistema se resuelven dentro de `library`.
    pub fn lex(root: Rc<Source>, library: &Path) -> Result<Self, Located<LexerError>> {
        let mut includes = HashSet::new();
        if let Some(path) = root.path() {
            includes.insert(path.to_path_buf());
        }

        let mut calls = BTreeSet::new();
        let mut context = Includes {
            library,
            visited: &mut includes,
            calls: &mut calls,
        };

        let tokens = lex_source(&root, &mut context)?;
        debug!(
            tokens = tokens.len(),
            files = includes.len(),
            calls = calls.len(),
            "lexed {}",
            root.name()
        );

        Ok(Unit {
            root,
            tokens,
            includes,
            calls,
        })
    }

    /// Flujo de tokens, con inclusiones ya aplanadas.
    pub fn tokens(&self) -> &[Located<Token>] {
        &self.tokens
    }

    /// Rutas canónicas de todos los archivos visitados.
    pub fn includes(&self) -> &HashSet<PathBuf> {
        &self.includes
    }

    /// Objetivos de `call` encontrados en cualquier archivo de la unidad.
    pub fn calls(&self) -> &BTreeSet<Identifier> {
        &self.calls
    }

    /// Descompone la unidad en origen raíz, tokens y símbolos de llamada.
    pub fn into_parts(self) -> (Rc<Source>, Vec<Located<Token>>, BTreeSet<Identifier>) {
        (self.root, self.tokens, self.calls)
    }
}

/// Estado compartido por todos los lexers anidados de una unidad.
struct Includes<'a> {
    library: &'a Path,
    visited: &'a mut HashSet<PathBuf>,
    calls: &'a mut BTreeSet<Identifier>,
}

impl Includes<'_> {
    /// Determina la ruta canónica de una inclusión.
    fn resolve(&self, from: &Source, include: &Include) -> Result<PathBuf, LexerError> {
        let candidate = match include {
            Include::System(name) => self.library.join(name),
            Include::Relative(name) => {
                let beside = from.path().and_then(Path::parent).map(|dir| dir.join(name));
                match beside {
                    Some(path) if path.exists() => path,
                    _ => PathBuf::from(name),
                }
            }
        };

        fs::canonicalize(&candidate).map_err(|source| LexerError::Include {
            path: candidate.display().to_string(),
            source,
        })
    }
}

fn lex_source(
    source: &Rc<Source>,
    includes: &mut Includes<'_>,
) -> Result<Vec<Located<Token>>, Located<LexerError>> {
    let mut tokens = Vec::new();

    for lexeme in Lexer::new(Location::start_of(source), source::consume(source)) {
        let (location, lexeme) = lexeme?.split();

        match lexeme {
            Lexeme::Token(token) => {
                if let Token::Call(target) = &token {
                    includes.calls.insert(target.clone());
                }

                tokens.push(Located::at(token, location));
            }

            Lexeme::Include(include) => {
                let path = includes
                    .resolve(source, &include)
                    .map_err(|error| Located::at(error, location.clone()))?;

                if !includes.visited.insert(path.clone()) {
                    trace!("skipping {}, already included", path.display());
                    continue;
                }

                let text = fs::read_to_string(&path).map_err(|error| {
                    let error = LexerError::Include {
                        path: path.display().to_string(),
                        source: error,
                    };

                    Located::at(error, location.clone())
                })?;

                trace!("including {}", path.display());

                let name = path.display().to_string();
                let included = Source::new(name, Some(path), text);
                tokens.extend(lex_source(&included, includes)?);
            }
        }
    }

    Ok(tokens)
}

/// Agrega un dígito a una constante, fallando si la misma se desborda.
fn accumulate(value: i64, digit: char, radix: u32, negative: bool) -> Result<i64, LexerError> {
    let digit = digit.to_digit(radix).unwrap_or(0) as i64;
    let shifted = value.checked_mul(radix as i64);

    let result = if negative {
        shifted.and_then(|n| n.checked_sub(digit))
    } else {
        shifted.and_then(|n| n.checked_add(digit))
    };

    result.ok_or(LexerError::IntOverflow)
}

/// Unidad decodificada de un literal.
///
/// `\xHH` nombra un byte exacto, no un carácter, por lo que no puede
/// representarse como `char` sin cambiar su codificación.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Decoded {
    Char(char),
    Byte(u8),
}

impl Decoded {
    /// Agrega la codificación de esta unidad a un string de bytes.
    fn encode(self, bytes: &mut Vec<u8>) {
        match self {
            Decoded::Char(c) => bytes.extend_from_slice(c.encode_utf8(&mut [0; 4]).as_bytes()),
            Decoded::Byte(byte) => bytes.push(byte),
        }
    }

    /// Valor entero de un literal de carácter.
    fn value(self) -> i64 {
        match self {
            Decoded::Char(c) => c as i64,
            Decoded::Byte(byte) => byte as i64,
        }
    }
}

/// Decodifica secuencias de escape.
fn unescape(raw: &str) -> Result<Vec<Decoded>, LexerError> {
    let mut decoded = Vec::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            decoded.push(Decoded::Char(c));
            continue;
        }

        let escaped = match chars.next() {
            Some('n') => '\n',
            Some('t') => '\t',
            Some('r') => '\r',
            Some('0') => '\0',
            Some('\\') => '\\',
            Some('"') => '"',
            Some('\'') => '\'',
            Some('x') => {
                let digits: String = chars.by_ref().take(2).collect();
                match u8::from_str_radix(&digits, 16) {
                    Ok(byte) if digits.len() == 2 => {
                        decoded.push(Decoded::Byte(byte));
                        continue;
                    }

                    _ => return Err(LexerError::BadEscape(format!("x{}", digits))),
                }
            }

            Some(other) => return Err(LexerError::BadEscape(other.to_string())),
            None => return Err(LexerError::BadEscape(String::new())),
        };

        decoded.push(Decoded::Char(escaped));
    }

    Ok(decoded)
}

/// Comilla que cierra una ruta de inclusión.
fn closing_quote(system: bool) -> char {
    if system {
        '\''
    } else {
        '"'
    }
}

/// Determina si un carácter puede iniciar un término.
fn is_word_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

/// Determina si un carácter puede pertenecer a un término.
fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(text: &str) -> Result<Vec<Token>, LexerError> {
        let source = Source::new("test.pang", None, String::from(text));
        let unit = Unit::lex(source, Path::new(".")).map_err(Located::into_inner)?;

        Ok(unit.tokens().iter().map(|token| token.val().clone()).collect())
    }

    #[test]
    fn keywords_and_identifiers() {
        let tokens = lex("dup swap drop foo_1 _bar if while do end").unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Dup,
                Token::Swap,
                Token::Drop(1),
                Token::Id(Identifier::from("foo_1")),
                Token::Id(Identifier::from("_bar")),
                Token::If(None),
                Token::While(None),
                Token::Do(None),
                Token::End(None),
            ]
        );
    }

    #[test]
    fn integer_literals() {
        let tokens = lex("0 42 -7 +3 0x1F 0XfF 0o17 0O17 -0x10").unwrap();
        let values: Vec<_> = tokens
            .into_iter()
            .map(|token| match token {
                Token::Int(value) => value,
                other => panic!("expected integer, found {:?}", other),
            })
            .collect();

        assert_eq!(values, vec![0, 42, -7, 3, 31, 255, 15, 15, -16]);
    }

    #[test]
    fn leading_zero_is_rejected() {
        assert!(matches!(lex("007"), Err(LexerError::LeadingZero)));
    }

    #[test]
    fn integer_overflow_is_a_compile_error() {
        let error = lex("9223372036854775808").unwrap_err();
        assert!(matches!(error, LexerError::IntOverflow));
        assert_eq!(error.category(), Category::Compile);

        assert_eq!(lex("-9223372036854775808").unwrap(), vec![Token::Int(i64::MIN)]);
    }

    #[test]
    fn strings_and_chars() {
        let tokens = lex(r#""a\tb\"c" r"x\ny" 'A' '\n' '\x41'"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Str(Rc::from(&b"a\tb\"c"[..])),
                Token::Str(Rc::from(&b"x\\ny"[..])),
                Token::Int(65),
                Token::Int(10),
                Token::Int(65),
            ]
        );
    }

    #[test]
    fn hex_escapes_are_raw_bytes() {
        let tokens = lex(r#""\xff\x80" "ñ" '\xff'"#).unwrap();
        assert_eq!(
            tokens,
            vec![
                Token::Str(Rc::from(&[0xff, 0x80][..])),
                Token::Str(Rc::from("ñ".as_bytes())),
                Token::Int(255),
            ]
        );

        assert!(matches!(lex(r#""\xg0""#), Err(LexerError::BadEscape(_))));
    }

    #[test]
    fn unterminated_string_reports_opening_line() {
        let source = Source::new("test.pang", None, String::from("1\n\"abc\n\ndef"));
        let error = Unit::lex(source, Path::new(".")).err().unwrap();

        assert!(matches!(error.val(), LexerError::UnterminatedString));
        assert_eq!(error.location().line(), 2);
    }

    #[test]
    fn char_must_hold_one_character() {
        assert!(matches!(lex("'ab'"), Err(LexerError::CharLength)));
        assert!(matches!(lex("''"), Err(LexerError::CharLength)));
    }

    #[test]
    fn comments_are_skipped() {
        let tokens = lex("1 // comment\n/* block\n comment */ 2").unwrap();
        assert_eq!(tokens, vec![Token::Int(1), Token::Int(2)]);
    }

    #[test]
    fn unterminated_block_comment() {
        let source = Source::new("test.pang", None, String::from("1\n/* never\nclosed"));
        let error = Unit::lex(source, Path::new(".")).err().unwrap();

        assert!(matches!(error.val(), LexerError::UnterminatedComment));
        assert_eq!(error.val().category(), Category::Syntax);
        assert_eq!(error.location().line(), 2);
    }

    #[test]
    fn lone_slash_is_an_error() {
        assert!(matches!(lex("1 / 2"), Err(LexerError::LoneSlash)));
    }

    #[test]
    fn comparison_atoms() {
        let tokens = lex("= ! > <").unwrap();
        assert_eq!(
            tokens,
            vec![Token::Equal, Token::NotEqual, Token::Greater, Token::Smaller]
        );
    }

    #[test]
    fn call_targets_are_collected() {
        let source = Source::new("test.pang", None, String::from("call puts\ncall  exit"));
        let unit = Unit::lex(source, Path::new(".")).unwrap();

        assert_eq!(unit.tokens()[0].val(), &Token::Call(Identifier::from("puts")));
        assert_eq!(unit.tokens()[1].location().line(), 2);
        assert!(unit.calls().contains(&Identifier::from("exit")));
    }

    #[test]
    fn call_requires_identifier() {
        assert!(matches!(lex("call 5"), Err(LexerError::ExpectedCallTarget)));
        assert!(matches!(lex("call dup"), Err(LexerError::ExpectedCallTarget)));
    }

    #[test]
    fn include_requires_path() {
        assert!(matches!(lex("include 5"), Err(LexerError::ExpectedIncludePath)));
        assert!(matches!(
            lex("include \"does/not/exist.pang\""),
            Err(LexerError::Include { .. })
        ));
    }

    #[test]
    fn tokens_record_lines() {
        let source = Source::new("test.pang", None, String::from("1\n\n  add"));
        let unit = Unit::lex(source, Path::new(".")).unwrap();

        let add = &unit.tokens()[1];
        assert_eq!(add.location().line(), 3);
        assert_eq!(add.location().position().column(), 3);
    }
}
