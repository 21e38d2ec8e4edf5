//! Compilador para el lenguaje de pila Pang.
//!
//! # Front end
//! Cada programa deriva de un único archivo de código fuente. Este
//! archivo se somete primero a análisis léxico en [`lex`], donde también
//! se resuelven recursivamente las inclusiones, de lo cual se obtiene un
//! flujo plano de tokens. Las definiciones de macros se recogen y se
//! sustituyen en [`expand`].
//!
//! # Middle end
//! El flujo expandido se simplifica en [`opt`] plegando aritmética de
//! constantes y combinando `drop`s consecutivos. Luego, [`resolve`]
//! empareja los marcadores de bloque y anota en cada uno el índice de
//! token al que salta. Los tipos de [`ir`] garantizan que estas fases
//! ocurran en ese orden.
//!
//! # Back end
//! En [`codegen`] se emite ensamblador x86-64 en sintaxis NASM para la
//! convención de llamada de Windows x64. El ensamblado y el enlazado se
//! delegan a herramientas externas en [`link`].

#[macro_use]
mod macros;

pub mod codegen;
pub mod error;
pub mod expand;
pub mod ir;
pub mod lex;
pub mod link;
pub mod opt;
pub mod resolve;
pub mod source;

use crate::{
    error::{Categorized, Category, Diagnostics},
    lex::Unit,
    source::{Located, Location, Source},
};

use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    rc::Rc,
};

use thiserror::Error;
use tracing::info;

/// Parámetros de una compilación.
#[derive(Clone, Debug)]
pub struct Options {
    /// Directorio donde se buscan las inclusiones de sistema.
    pub library: PathBuf,

    /// Habilita la optimización peephole.
    pub optimize: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            library: PathBuf::from("lib"),
            optimize: true,
        }
    }
}

/// Un error previo a cualquier fase de compilación.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("cannot read source file: {0}")]
    Read(String, #[source] std::io::Error),
}

impl Categorized for DriverError {
    fn category(&self) -> Category {
        Category::Command
    }
}

/// Compila un archivo de código fuente, escribiendo ensamblador a `output`.
pub fn compile_file<W: Write>(
    path: &Path,
    options: &Options,
    output: &mut W,
) -> Result<(), Diagnostics> {
    let name = path.display().to_string();
    let read = fs::canonicalize(path).and_then(|canonical| {
        let text = fs::read_to_string(&canonical)?;
        Ok((canonical, text))
    });

    match read {
        Ok((canonical, text)) => {
            let root = Source::new(name, Some(canonical), text);
            compile(root, options, output)
        }

        Err(error) => {
            let source = Source::new(name.clone(), None, String::new());
            let location = Location::start_of(&source);

            Err(Located::at(DriverError::Read(name, error), location).into())
        }
    }
}

/// Compila código fuente en memoria.
///
/// Las inclusiones relativas se resuelven contra el directorio actual.
pub fn compile_str<W: Write>(
    name: &str,
    text: &str,
    options: &Options,
    output: &mut W,
) -> Result<(), Diagnostics> {
    compile(Source::new(name, None, String::from(text)), options, output)
}

fn compile<W: Write>(
    root: Rc<Source>,
    options: &Options,
    output: &mut W,
) -> Result<(), Diagnostics> {
    info!("compiling {}", root.name());

    let unit = Unit::lex(root, &options.library)?;
    let expanded = expand::expand(unit)?;

    let optimized = if options.optimize {
        opt::optimize(expanded)?
    } else {
        opt::passthrough(expanded)
    };

    let resolved = resolve::resolve(optimized)?;
    codegen::emit(&resolved, output)?;

    Ok(())
}
