//! Rastreo de ubicaciones originales en código fuente.
//!
//! Los distintos objetos internos que el compilador construye
//! deben llevar cuenta de la posición en el código fuente original
//! de la que provienen, lo cual permite determinar un punto exacto
//! o aproximado en donde ocurre un error. Como los archivos incluidos
//! se combinan en un único flujo de tokens, cada ubicación también
//! recuerda el archivo del que proviene.

use std::{
    fmt::{self, Debug, Display, Formatter},
    path::{Path, PathBuf},
    rc::Rc,
};

/// Ancho de los divisores de tabulador.
const TAB_STOP: u32 = 4;

/// Un flujo de entrada, carácter por carácter.
pub trait InputStream: Iterator<Item = (char, Location)> {}

impl<I: Iterator<Item = (char, Location)>> InputStream for I {}

/// Un objeto cualquiera con una posición original asociada.
#[derive(Debug, Clone)]
pub struct Located<T> {
    location: Location,
    value: T,
}

impl<T> Located<T> {
    /// Obtiene el valor.
    pub fn val(&self) -> &T {
        &self.value
    }

    /// Obtiene el valor de manera mutable.
    pub fn val_mut(&mut self) -> &mut T {
        &mut self.value
    }

    /// Obtiene la ubicación.
    pub fn location(&self) -> &Location {
        &self.location
    }

    /// Descarta la ubicación y toma ownership del valor.
    pub fn into_inner(self) -> T {
        self.value
    }

    /// Descompone y toma ownership de las dos partes.
    pub fn split(self) -> (Location, T) {
        (self.location, self.value)
    }

    /// Construye a partir de un valor y una ubicación.
    pub fn at(value: T, location: Location) -> Self {
        Located { value, location }
    }
}

impl<T> AsRef<T> for Located<T> {
    fn as_ref(&self) -> &T {
        &self.value
    }
}

/// Una ubicación está conformada por un origen y una posición.
#[derive(Clone)]
pub struct Location {
    from: Rc<Source>,
    position: Position,
}

impl Location {
    /// Ubicación inicial de un origen.
    pub fn start_of(from: &Rc<Source>) -> Self {
        Location {
            from: Rc::clone(from),
            position: Position::default(),
        }
    }

    /// Obtiene la posición.
    pub fn position(&self) -> Position {
        self.position
    }

    /// Número de línea, comenzando en 1.
    pub fn line(&self) -> u32 {
        self.position.line
    }

    /// Origen de esta ubicación.
    pub fn source(&self) -> &Rc<Source> {
        &self.from
    }
}

impl Display for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.from.name, self.position)
    }
}

impl Debug for Location {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        <Self as Display>::fmt(self, formatter)
    }
}

/// Una posición línea-columna en un archivo.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Position {
    line: u32,
    column: u32,
}

impl Position {
    /// Obtiene el número de línea.
    pub fn line(&self) -> u32 {
        self.line
    }

    /// Obtiene el número de columna.
    pub fn column(&self) -> u32 {
        self.column
    }

    /// Incrementa el número de columna.
    pub fn advance(self) -> Position {
        Position {
            line: self.line,
            column: self.column + 1,
        }
    }

    /// Incrementa el número de línea y retorna a la columna 1.
    pub fn newline(self) -> Position {
        Position {
            line: self.line + 1,
            column: 1,
        }
    }

    /// Ajusta la posición a la siguiente columna de tabulador.
    pub fn tab(self) -> Position {
        let column = 1 + ((self.column - 1) / TAB_STOP + 1) * TAB_STOP;
        Position {
            line: self.line,
            column,
        }
    }
}

impl Default for Position {
    fn default() -> Self {
        Position { line: 1, column: 1 }
    }
}

impl Display for Position {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.line, self.column)
    }
}

/// Nombre de origen, ruta canónica (si existe) y contenido.
pub struct Source {
    name: String,
    path: Option<PathBuf>,
    text: String,
}

impl Source {
    /// Construye un origen en memoria.
    ///
    /// `path` debería ser la ruta canónica del archivo cuando el
    /// origen proviene del sistema de archivos. Los orígenes sin
    /// ruta (como `<stdin>`) resuelven sus inclusiones relativas
    /// al directorio actual.
    pub fn new<S: Into<String>>(name: S, path: Option<PathBuf>, text: String) -> Rc<Self> {
        Rc::new(Source {
            name: name.into(),
            path,
            text,
        })
    }

    /// Nombre con el que se reporta este origen.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ruta canónica del archivo, si la hay.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Invoca a `callback` con el contenido de una línea, o una línea
    /// vacía si el número está fuera de rango.
    pub fn with_line<R, F>(&self, line: u32, callback: F) -> R
    where
        F: FnOnce(&str) -> R,
    {
        let text = self
            .text
            .lines()
            .nth(line.saturating_sub(1) as usize)
            .unwrap_or("");

        callback(text)
    }
}

/// Recorre un origen carácter por carácter.
///
/// Cada carácter emitido se acompaña de su propia ubicación.
pub fn consume(source: &Rc<Source>) -> impl InputStream + '_ {
    let mut position = Position::default();

    source.text.chars().map(move |c| {
        let here = position;
        position = match c {
            '\n' => here.newline(),
            '\t' => here.tab(),
            _ => here.advance(),
        };

        let location = Location {
            from: Rc::clone(source),
            position: here,
        };

        (c, location)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_follow_lines_and_tabs() {
        let source = Source::new("test", None, String::from("a\n\tb"));
        let positions: Vec<_> = consume(&source)
            .map(|(c, location)| (c, location.position()))
            .collect();

        assert_eq!(positions[0].1, Position { line: 1, column: 1 });
        assert_eq!(positions[2].1, Position { line: 2, column: 1 });
        assert_eq!(positions[3].1, Position { line: 2, column: 5 });
    }

    #[test]
    fn lines_are_looked_up_by_number() {
        let source = Source::new("test", None, String::from("first\nsecond"));
        assert_eq!(source.with_line(2, str::to_owned), "second");
        assert_eq!(source.with_line(7, str::to_owned), "");
    }
}
