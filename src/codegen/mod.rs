//! Generación de código.
//!
//! El flujo resuelto se traduce token por token a ensamblador x86-64 en
//! sintaxis NASM, para la convención de llamada de Windows x64. La pila
//! del lenguaje es directamente la pila nativa: cada valor ocupa una
//! ranura de 64 bits.
//!
//! Antes de emitir se recorre el flujo una vez para reunir los strings
//! literales (en orden de primer uso) y los índices que son destino de
//! algún salto, de forma que cada etiqueta se emita una única vez.

use crate::{
    error::{Categorized, Category},
    ir::Resolved,
    lex::{Identifier, Token},
    source::{Located, Location},
};

use std::{
    collections::{BTreeSet, HashMap},
    io::{self, Write},
    rc::Rc,
};

use thiserror::Error;
use tracing::debug;

mod x86_64;

use x86_64::Emitter;

/// Rutina del sistema que termina el proceso.
const EXIT_ROUTINE: &str = "ExitProcess";

/// Símbolo de entrada del programa.
const ENTRY_POINT: &str = "main";

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum CodegenError {
    /// Un token que no tiene traducción llegó a esta fase.
    #[error("`{0}` is not implemented")]
    NotImplemented(Token),

    #[error("failed to write assembly")]
    Io(#[from] io::Error),
}

impl Categorized for CodegenError {
    fn category(&self) -> Category {
        match self {
            CodegenError::NotImplemented(_) => Category::Compile,
            CodegenError::Io(_) => Category::Command,
        }
    }
}

/// Emite el programa completo, incluyendo sección de datos.
pub fn emit<W: Write>(program: &Resolved, output: &mut W) -> Result<(), Located<CodegenError>> {
    let tokens = program.tokens();
    let layout = Layout::scan(tokens);

    let start = Location::start_of(program.root());
    let at_start = |error: io::Error| Located::at(CodegenError::from(error), start.clone());

    let externs: BTreeSet<&str> = program
        .calls()
        .iter()
        .map(|call: &Identifier| -> &str { call.as_ref() })
        .chain(std::iter::once(EXIT_ROUTINE))
        .collect();

    debug!(
        tokens = tokens.len(),
        strings = layout.strings.len(),
        externs = externs.len(),
        "emitting assembly"
    );

    header(output, &externs).map_err(at_start)?;

    let mut emitter = Emitter::new(output, tokens, &layout);
    emitter.prologue().map_err(at_start)?;

    for (index, token) in tokens.iter().enumerate() {
        emitter
            .put_token(index, token.val())
            .map_err(|error| Located::at(error, token.location().clone()))?;
    }

    let end = tokens.last().map(Located::location).unwrap_or(&start).clone();
    emitter
        .epilogue()
        .map_err(|error| Located::at(CodegenError::from(error), end))?;

    data(output, &layout.strings).map_err(at_start)
}

/// Determina si un nombre no puede declararse como símbolo externo,
/// ya sea por chocar con el punto de entrada o con el ensamblador.
pub fn is_reserved_symbol(name: &str) -> bool {
    name == ENTRY_POINT || x86_64::is_reserved(name)
}

/// Información del flujo que se reúne antes de emitir.
struct Layout {
    strings: Vec<Rc<[u8]>>,
    string_labels: HashMap<Rc<[u8]>, usize>,
    targets: BTreeSet<usize>,
}

impl Layout {
    fn scan(tokens: &[Located<Token>]) -> Self {
        let mut layout = Layout {
            strings: Vec::new(),
            string_labels: HashMap::new(),
            targets: BTreeSet::new(),
        };

        for token in tokens {
            match token.val() {
                Token::Str(string) => {
                    if !layout.string_labels.contains_key(string) {
                        layout.string_labels.insert(Rc::clone(string), layout.strings.len());
                        layout.strings.push(Rc::clone(string));
                    }
                }

                Token::If(Some(target))
                | Token::Else(Some(target))
                | Token::While(Some(target))
                | Token::Do(Some(target)) => {
                    layout.targets.insert(*target);
                }

                _ => (),
            }
        }

        layout
    }

    fn is_target(&self, index: usize) -> bool {
        self.targets.contains(&index)
    }

    /// Etiqueta de datos de un string ya reunido.
    fn string_label(&self, string: &[u8]) -> Option<StringLabel> {
        self.string_labels.get(string).copied().map(StringLabel)
    }
}

/// Etiqueta de código asociada a un índice de token.
#[derive(Copy, Clone)]
struct Label(usize);

impl std::fmt::Display for Label {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, ".L{}", self.0)
    }
}

/// Etiqueta de un string en la sección de datos.
#[derive(Copy, Clone)]
struct StringLabel(usize);

impl std::fmt::Display for StringLabel {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(fmt, "str_{}", self.0)
    }
}

fn header<W: Write>(output: &mut W, externs: &BTreeSet<&str>) -> io::Result<()> {
    writeln!(output, "bits 64")?;
    writeln!(output, "default rel")?;
    writeln!(output)?;

    for name in externs {
        writeln!(output, "extern {}", name)?;
    }

    writeln!(output)?;
    writeln!(output, "section .text")?;
    writeln!(output, "global {0}\n{0}:", ENTRY_POINT)
}

fn data<W: Write>(output: &mut W, strings: &[Rc<[u8]>]) -> io::Result<()> {
    if strings.is_empty() {
        return Ok(());
    }

    writeln!(output)?;
    writeln!(output, "section .data")?;

    for (index, string) in strings.iter().enumerate() {
        write!(output, "{}: db ", StringLabel(index))?;
        for byte in string.iter() {
            write!(output, "{}, ", byte)?;
        }

        // Terminador nulo
        writeln!(output, "0")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{expand, lex::Unit, opt, resolve, source::Source};
    use std::path::Path;

    fn assembly(text: &str) -> String {
        let source = Source::new("test.pang", None, String::from(text));
        let unit = Unit::lex(source, Path::new(".")).unwrap();
        let optimized = opt::optimize(expand::expand(unit).unwrap()).unwrap();
        let resolved = resolve::resolve(optimized).unwrap();

        let mut output = Vec::new();
        emit(&resolved, &mut output).unwrap();

        String::from_utf8(output).unwrap()
    }

    fn lines(assembly: &str) -> Vec<String> {
        assembly
            .lines()
            .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
            .filter(|line| !line.is_empty())
            .collect()
    }

    fn position(lines: &[String], line: &str) -> usize {
        lines
            .iter()
            .position(|candidate| candidate == line)
            .unwrap_or_else(|| panic!("`{}` not found in:\n{}", line, lines.join("\n")))
    }

    #[test]
    fn header_and_externs() {
        let lines = lines(&assembly("\"hi\" puts drop"));

        assert_eq!(lines[0], "bits 64");
        assert_eq!(lines[1], "default rel");
        assert!(lines.contains(&String::from("extern ExitProcess")));
        assert!(lines.contains(&String::from("extern puts")));
        assert!(lines.contains(&String::from("global main")));
    }

    #[test]
    fn strings_are_pooled_once() {
        let lines = lines(&assembly("\"hi\" \"hi\" \"\" drop drop drop"));

        assert!(lines.contains(&String::from("str_0: db 104, 105, 0")));
        assert!(lines.contains(&String::from("str_1: db 0")));
        assert!(!lines.iter().any(|line| line.starts_with("str_2")));
        assert_eq!(lines.iter().filter(|line| *line == "lea rax, [rel str_0]").count(), 2);
    }

    #[test]
    fn strings_are_emitted_as_raw_bytes() {
        let lines = lines(&assembly(r#""\xff" "é" drop drop"#));

        assert!(lines.contains(&String::from("str_0: db 255, 0")));
        assert!(lines.contains(&String::from("str_1: db 195, 169, 0")));
    }

    #[test]
    fn literals_use_immediates_when_possible() {
        let lines = lines(&assembly("x 5 x 5000000000 x"));

        assert!(lines.contains(&String::from("push qword 5")));
        assert!(lines.contains(&String::from("mov rax, 5000000000")));
    }

    #[test]
    fn branches_jump_to_else_on_zero() {
        let lines = lines(&assembly("x if 5 else 6 end x"));

        let jz = position(&lines, "jz .L4");
        let jmp = position(&lines, "jmp .L5");
        let label = position(&lines, ".L4:");
        let six = position(&lines, "push qword 6");
        let end = position(&lines, ".L5:");

        assert_eq!(lines[jz - 1], "test rax, rax");
        assert!(jz < jmp && jmp < label && label < six && six < end);
    }

    #[test]
    fn loops_exit_after_backward_jump() {
        let lines = lines(&assembly("10 while dup 0 > do 1 sub end"));

        let head = position(&lines, ".L1:");
        let exit = position(&lines, "jz .L8");
        let back = position(&lines, "jmp .L1");
        let label = position(&lines, ".L8:");

        assert!(head < exit && exit < back && back + 1 == label);
    }

    #[test]
    fn shared_targets_get_a_single_label() {
        let assembly = assembly("x if 1 else end x");
        assert_eq!(assembly.matches(".L4:").count(), 1);
    }

    #[test]
    fn calls_use_four_registers() {
        let lines = lines(&assembly("1 2 3 4 call f"));
        let call = position(&lines, "call f");

        for operands in ["rcx, [rsp]", "rdx, [rsp + 8]", "r8, [rsp + 16]", "r9, [rsp + 24]"] {
            let line = format!("mov {}", operands);
            assert!(position(&lines, &line) < call, "{}", line);
        }

        assert_eq!(lines[call - 1], "sub rsp, 32");
        assert_eq!(lines[call + 2], "push rax");
    }

    #[test]
    fn drops_adjust_stack_pointer() {
        let lines = lines(&assembly("x drop drop drop"));
        assert!(lines.contains(&String::from("add rsp, 24")));
    }

    #[test]
    fn memory_widths() {
        let lines = lines(&assembly("x apply 1 x apply 8 7 x store 2"));

        assert!(lines.contains(&String::from("movzx eax, byte [rax]")));
        assert!(lines.contains(&String::from("mov rax, qword [rax]")));
        assert!(lines.contains(&String::from("mov word [rax], bx")));
    }

    #[test]
    fn comparisons_use_conditional_moves() {
        let lines = lines(&assembly("x x > x x = x x ! x x <"));

        for cmov in ["cmovg", "cmove", "cmovne", "cmovl"] {
            assert!(lines.iter().any(|line| line == &format!("{} rcx, rdx", cmov)));
        }

        assert!(!lines.iter().any(|line| line.starts_with("j") && !line.starts_with("jmp")));
    }

    #[test]
    fn epilogue_exits_with_zero() {
        let lines = lines(&assembly(""));
        let exit = position(&lines, "call ExitProcess");

        assert_eq!(lines[exit - 1], "xor ecx, ecx");
    }

    #[test]
    fn reserved_symbols() {
        for name in ["main", "rax", "r8d", "r15", "qword", "xmm31", "st0", "rel"] {
            assert!(is_reserved_symbol(name), "{}", name);
        }

        for name in ["puts", "r16", "rd", "xmm32", "mainly", "ExitProcess"] {
            assert!(!is_reserved_symbol(name), "{}", name);
        }
    }

    #[test]
    fn unexpanded_macro_is_not_implemented() {
        let source = Source::new("test.pang", None, String::new());
        let start = Location::start_of(&source);

        let tokens = vec![Located::at(Token::Macro, start)];
        let resolved = Resolved::new(source, tokens, BTreeSet::new());

        let error = emit(&resolved, &mut Vec::new()).unwrap_err();
        assert!(matches!(error.as_ref(), CodegenError::NotImplemented(Token::Macro)));
        assert_eq!(error.as_ref().category(), Category::Compile);
    }
}
