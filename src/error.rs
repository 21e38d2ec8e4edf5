//! Reporte de errores.
//!
//! Todo error de compilación es fatal. Cada fase define su propio
//! tipo de error, el cual se asocia a una ubicación por medio de
//! [`Located`] y a una [`Category`]. [`Diagnostics`] se encarga de
//! presentar el error junto a la línea de código que lo origina.

use crate::source::{Located, Location};
use std::{
    error::Error,
    fmt::{self, Display},
};

/// Clasificación de un error, según la fase o la naturaleza del problema.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    /// Literales mal formados, palabras clave faltantes, anotaciones inválidas.
    Syntax,

    /// Referencias indefinidas o redefiniciones.
    Name,

    /// Bloques desbalanceados.
    Structural,

    /// Invariantes internas del compilador o límites del objetivo.
    Compile,

    /// Instrucciones de construcción faltantes o contradictorias.
    Command,
}

impl Display for Category {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Category::Syntax => "Syntax",
            Category::Name => "Name",
            Category::Structural => "Structural",
            Category::Compile => "Compile",
            Category::Command => "Command",
        };

        fmt.write_str(name)
    }
}

/// Un error que conoce su propia categoría.
pub trait Categorized {
    fn category(&self) -> Category;
}

mod sealed {
    pub trait Sealed {}
}

pub trait LocatedError: sealed::Sealed {
    fn source(&self) -> &dyn Error;
    fn location(&self) -> &Location;
    fn category(&self) -> Category;
}

/// Un error fatal listo para ser presentado al usuario.
pub struct Diagnostics {
    error: Box<dyn 'static + LocatedError>,
}

impl Diagnostics {
    /// Categoría del error contenido.
    pub fn category(&self) -> Category {
        self.error.category()
    }

    /// Ubicación del error contenido.
    pub fn location(&self) -> &Location {
        self.error.location()
    }

    /// Mensaje del error, sin ubicación.
    pub fn message(&self) -> String {
        self.error.source().to_string()
    }
}

impl<E: 'static + LocatedError> From<E> for Diagnostics {
    fn from(error: E) -> Self {
        Diagnostics {
            error: Box::new(error),
        }
    }
}

impl Display for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let error = &self.error;
        writeln!(fmt, "{}Error: {}", error.category(), error.source())?;

        let location = error.location();
        writeln!(fmt, " --> {}", location)?;

        let line_number = location.line();
        let digits = line_number.to_string().chars().count();
        writeln!(fmt, "{:digits$} |", "", digits = digits)?;

        location.source().with_line(line_number, |line| {
            writeln!(fmt, "{:>digits$} | {}", line_number, line, digits = digits)
        })?;

        let skip = (location.position().column() - 1) as usize;
        writeln!(
            fmt,
            "{:digits$} | {:skip$}^",
            "",
            "",
            digits = digits,
            skip = skip
        )
    }
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "{}Error at {}: {}",
            self.category(),
            self.location(),
            self.message()
        )
    }
}

impl<E: Error + Categorized> sealed::Sealed for Located<E> {}

impl<E: Error + Categorized> LocatedError for Located<E> {
    fn source(&self) -> &dyn Error {
        self.as_ref()
    }

    fn location(&self) -> &Location {
        Located::location(self)
    }

    fn category(&self) -> Category {
        self.as_ref().category()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{self, Source};
    use thiserror::Error;

    #[derive(Error, Debug)]
    #[error("something went wrong")]
    struct Broken;

    impl Categorized for Broken {
        fn category(&self) -> Category {
            Category::Structural
        }
    }

    #[test]
    fn renders_category_location_and_caret() {
        let source = Source::new("main.pang", None, String::from("1 2\n  end"));
        let (_, location) = source::consume(&source).nth(6).unwrap();

        let diagnostics = Diagnostics::from(Located::at(Broken, location));
        let rendered = diagnostics.to_string();

        assert!(rendered.starts_with("StructuralError: something went wrong\n"));
        assert!(rendered.contains(" --> main.pang:2:3\n"));
        assert!(rendered.contains("2 |   end\n"));
        assert!(rendered.ends_with("  |   ^\n"));
    }
}
