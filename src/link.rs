//! Construcción de ejecutables.
//!
//! Una vez que se ha emitido código ensamblador, este debe ser ensamblado
//! con `nasm` y enlazado con `gcc` para producir un binario ejecutable de
//! Windows x64. Ambas herramientas se invocan como procesos externos.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process::{Command, ExitStatus},
};

use bitflags::bitflags;
use thiserror::Error;
use tracing::{debug, warn};

/// Ensamblador externo.
const ASSEMBLER: &str = "nasm";

/// Formato de objeto que se solicita al ensamblador.
const OBJECT_FORMAT: &str = "win64";

/// Enlazador externo.
const LINKER: &str = "gcc";

bitflags! {
    /// Opciones a aplicar durante el enlazado.
    pub struct LinkOptions: u32 {
        /// Remover símbolos de depuración del ejecutable final.
        const STRIP = 0x01;
    }
}

/// Un error de ensamblado o enlazado.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LinkerError {
    /// Ocurrió un evento de error de E/S durante la invocación
    /// de comandos externos.
    #[error("I/O error while running {tool}")]
    Io {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// No fue posible escribir los archivos intermedios.
    #[error("failed to write {}", .0.display())]
    Intermediate(PathBuf, #[source] std::io::Error),

    /// La herramienta inició su ejecución, pero terminó con error.
    #[error("{tool} exited with status code {status:?}")]
    Failed {
        tool: &'static str,
        status: ExitStatus,
    },
}

/// Instancia del enlazador para un ejecutable definido.
///
/// El ensamblador se escribe a un archivo `.asm` junto a la salida, el cual
/// se ensambla a un `.obj` y se enlaza. Ambos intermedios se eliminan al
/// terminar, sin importar el resultado.
pub struct Linker {
    output: PathBuf,
    intermediates: Intermediates,
    writer: BufWriter<File>,
    options: LinkOptions,
}

impl Linker {
    /// Inicia una instancia del enlazador.
    ///
    /// El enlazador tratará de emitir un ejecutable y escribirlo a
    /// la ruta indicada por `output`.
    pub fn spawn<O>(output: &O, options: LinkOptions) -> Result<Self, LinkerError>
    where
        O: AsRef<Path>,
    {
        let output = output.as_ref().to_path_buf();
        let intermediates = Intermediates::for_output(&output);

        let file = File::create(&intermediates.assembly)
            .map_err(|error| LinkerError::Intermediate(intermediates.assembly.clone(), error))?;

        Ok(Linker {
            output,
            intermediates,
            writer: BufWriter::new(file),
            options,
        })
    }

    /// Obtiene el destino del código ensamblador.
    ///
    /// Luego de crear una instancia con [`Linker::spawn()`], se debe
    /// escribir código ensamblador en la forma exacta en que fue emitido
    /// por la fase de generación de código.
    pub fn asm(&mut self) -> &mut BufWriter<File> {
        &mut self.writer
    }

    /// Indica el fin del flujo de código y finaliza el enlazado.
    pub fn finish(self) -> Result<(), LinkerError> {
        let Linker {
            output,
            intermediates,
            mut writer,
            options,
        } = self;

        let flushed = writer
            .flush()
            .map_err(|error| LinkerError::Intermediate(intermediates.assembly.clone(), error));

        // El archivo debe cerrarse antes de que nasm lo lea
        drop(writer);

        let result = flushed.and_then(|()| intermediates.build(&output, options));
        intermediates.remove();
        result
    }
}

/// Archivos temporales de un enlazado.
struct Intermediates {
    assembly: PathBuf,
    object: PathBuf,
}

impl Intermediates {
    fn for_output(output: &Path) -> Self {
        Intermediates {
            assembly: beside(output, "asm"),
            object: beside(output, "obj"),
        }
    }

    fn build(&self, output: &Path, options: LinkOptions) -> Result<(), LinkerError> {
        let mut assemble = Command::new(ASSEMBLER);
        assemble
            .args(&["-f", OBJECT_FORMAT, "-o"])
            .arg(&self.object)
            .arg(&self.assembly);

        run(ASSEMBLER, &mut assemble)?;

        let mut link = Command::new(LINKER);
        link.arg("-o").arg(output).arg(&self.object);

        if options.contains(LinkOptions::STRIP) {
            link.arg("-s");
        }

        run(LINKER, &mut link)
    }

    fn remove(&self) {
        for path in [&self.assembly, &self.object] {
            if let Err(error) = fs::remove_file(path) {
                if error.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), %error, "failed to remove intermediate file");
                }
            }
        }
    }
}

/// Ruta intermedia junto a la salida, nunca igual a esta.
fn beside(output: &Path, extension: &str) -> PathBuf {
    let path = output.with_extension(extension);
    if path != output {
        return path;
    }

    // La salida ya tiene la extensión del intermedio
    let mut name = output.as_os_str().to_owned();
    name.push(".");
    name.push(extension);

    PathBuf::from(name)
}

fn run(tool: &'static str, command: &mut Command) -> Result<(), LinkerError> {
    debug!(?command, "running {}", tool);

    let status = command
        .status()
        .map_err(|source| LinkerError::Io { tool, source })?;

    if status.success() {
        Ok(())
    } else {
        Err(LinkerError::Failed { tool, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intermediates_sit_beside_output() {
        let intermediates = Intermediates::for_output(Path::new("build/hello.exe"));

        assert_eq!(intermediates.assembly, Path::new("build/hello.asm"));
        assert_eq!(intermediates.object, Path::new("build/hello.obj"));
    }

    #[test]
    fn extensionless_output() {
        let intermediates = Intermediates::for_output(Path::new("hello"));

        assert_eq!(intermediates.assembly, Path::new("hello.asm"));
        assert_eq!(intermediates.object, Path::new("hello.obj"));
    }

    #[test]
    fn intermediates_never_replace_output() {
        let intermediates = Intermediates::for_output(Path::new("prog.asm"));
        assert_eq!(intermediates.assembly, Path::new("prog.asm.asm"));
        assert_eq!(intermediates.object, Path::new("prog.obj"));

        let intermediates = Intermediates::for_output(Path::new("out/prog.obj"));
        assert_eq!(intermediates.assembly, Path::new("out/prog.asm"));
        assert_eq!(intermediates.object, Path::new("out/prog.obj.obj"));
    }
}
