//! Punto de entrada ("driver").
//!
//! Este módulo orquesta las diferentes fases del proceso de
//! compilación y expone una CLI.

use anyhow::{self, bail, Context};
use clap::{crate_version, Arg, Command};
use pangc::{
    error::Diagnostics,
    link::{LinkOptions, Linker},
    Options,
};

use std::{
    env,
    fs::File,
    io::{self, Write},
    path::{Path, PathBuf},
    process,
    str::FromStr,
};

use tracing::{debug, Level};

fn main() -> anyhow::Result<()> {
    // Parsing de CLI
    let args = Command::new("Pang compiler")
        .version(crate_version!())
        .arg(
            Arg::new("source")
                .required(true)
                .value_name("SOURCE")
                .help("Source file to compile"),
        )
        .arg(
            Arg::new("asm")
                .short('S')
                .help("Generate assembly instead of linking"),
        )
        .arg(Arg::new("strip").short('s').help("Strip executables"))
        .arg(
            Arg::new("opt-level")
                .short('O')
                .takes_value(true)
                .value_name("LEVEL")
                .default_value("1")
                .possible_values(["0", "1"])
                .help("Optimization level ('0' disables constant folding)"),
        )
        .arg(
            Arg::new("library")
                .short('L')
                .long("library")
                .takes_value(true)
                .value_name("DIR")
                .help("Directory for system includes (default: lib/ beside the compiler)"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .takes_value(true)
                .value_name("LEVEL")
                .default_value("warn")
                .possible_values(["error", "warn", "info", "debug", "trace"])
                .help("Maximum level of log messages"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .takes_value(true)
                .required(true)
                .value_name("FILE")
                .help("Output file ('-' along with -S for stdout)"),
        )
        .get_matches();

    let level = Level::from_str(args.value_of("log-level").unwrap()).context("Bad log level")?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .init();

    // Se extraen argumentos necesarios
    let source = Path::new(args.value_of("source").unwrap());
    let asm = args.is_present("asm");
    let output = args.value_of("output").unwrap();

    let library = match args.value_of("library") {
        Some(library) => PathBuf::from(library),
        None => default_library()?,
    };

    let options = Options {
        library,
        optimize: args.value_of("opt-level") != Some("0"),
    };

    debug!(?options, "starting compilation");

    // Todo error de compilación es fatal; nada se escribe hasta
    // que el programa completo haya sido generado
    let mut assembly = Vec::new();
    if let Err(diagnostics) = pangc::compile_file(source, &options, &mut assembly) {
        report(diagnostics);
    }

    match (asm, output) {
        // Salida a stdout sin enlazado
        (true, "-") => {
            let stdout = io::stdout();
            stdout
                .lock()
                .write_all(&assembly)
                .context("Failed to emit to stdout")?;
        }

        // Salida a archivo sin enlazado
        (true, path) => {
            let mut file = File::create(path)
                .with_context(|| format!("Failed to open for writing: {}", path))?;

            file.write_all(&assembly)
                .with_context(|| format!("Failed to emit to file: {}", path))?;
        }

        // Salida a stdout con enlazado
        (false, "-") => bail!("Refusing to write executable to stdout"),

        // Salida a archivo con enlazado
        (false, path) => {
            let mut options = LinkOptions::empty();
            if args.is_present("strip") {
                options |= LinkOptions::STRIP;
            }

            let mut linker = Linker::spawn(&path, options).context("Failed to link")?;
            linker
                .asm()
                .write_all(&assembly)
                .context("Failed to emit assembly to assembler")?;

            linker
                .finish()
                .with_context(|| format!("Failed to generate executable: {}", path))?;
        }
    };

    Ok(())
}

/// Directorio `lib/` junto al ejecutable del compilador.
fn default_library() -> anyhow::Result<PathBuf> {
    let mut library = env::current_exe().context("Failed to locate compiler executable")?;
    library.pop(); // "<...>/pangc" => "<...>"
    library.push("lib");

    Ok(library)
}

fn report(diagnostics: Diagnostics) -> ! {
    eprint!("{}", diagnostics);
    process::exit(1)
}
