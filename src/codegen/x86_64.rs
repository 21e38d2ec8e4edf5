use super::{CodegenError, Label, Layout, EXIT_ROUTINE};
use crate::{
    lex::{Token, Width},
    source::Located,
};

use std::{
    fmt,
    io::{self, Write},
};

// Esta es una arquitectura de 64 bits
const VALUE_SIZE: u32 = 8;

/* La ABI de Windows x64 exige que quien llama reserve 32 bytes de "shadow
 * space" justo encima de la dirección de retorno, y que %rsp esté alineado
 * a 16 bytes en el momento de la llamada.
 */
const SHADOW_SPACE: u32 = 32;
const STACK_ALIGNMENT: u32 = 16;

#[derive(Copy, Clone)]
pub enum Reg {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    R8,
    R9,
    Rsp,
}

impl Reg {
    /* Los primeros cuatro argumentos enteros van en %rcx, %rdx, %r8 y %r9,
     * en ese orden. El valor de retorno queda en %rax.
     */
    const MAX_ARGS: u32 = 4;

    fn argument_sequence() -> impl Iterator<Item = Reg> {
        use Reg::*;

        std::iter::successors(Some(Rcx), |last| match last {
            Rcx => Some(Rdx),
            Rdx => Some(R8),
            R8 => Some(R9),
            _ => None,
        })
    }

    /// Nombre de la porción del registro con el ancho indicado.
    fn sized(self, width: Width) -> &'static str {
        use Reg::*;
        use Width::*;

        match (self, width) {
            (Rax, Byte) => "al",
            (Rax, Word) => "ax",
            (Rax, Dword) => "eax",
            (Rbx, Byte) => "bl",
            (Rbx, Word) => "bx",
            (Rbx, Dword) => "ebx",
            (Rcx, Byte) => "cl",
            (Rcx, Word) => "cx",
            (Rcx, Dword) => "ecx",
            (Rdx, Byte) => "dl",
            (Rdx, Word) => "dx",
            (Rdx, Dword) => "edx",
            (register, Qword) => register.name(),

            // Los registros de argumentos y %rsp solo se usan completos
            (R8 | R9 | Rsp, _) => unreachable!(),
        }
    }

    fn name(self) -> &'static str {
        use Reg::*;

        match self {
            Rax => "rax",
            Rbx => "rbx",
            Rcx => "rcx",
            Rdx => "rdx",
            R8 => "r8",
            R9 => "r9",
            Rsp => "rsp",
        }
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.name())
    }
}

/// Palabras que NASM interpreta como reservadas dentro de operandos.
#[rustfmt::skip]
const RESERVED: &[&str] = &[
    "byte", "word", "dword", "qword", "tword", "oword", "yword", "zword",
    "rel", "abs", "seg", "wrt", "strict", "nosplit",
    "al", "ah", "ax", "eax", "rax",
    "bl", "bh", "bx", "ebx", "rbx",
    "cl", "ch", "cx", "ecx", "rcx",
    "dl", "dh", "dx", "edx", "rdx",
    "sil", "si", "esi", "rsi",
    "dil", "di", "edi", "rdi",
    "bpl", "bp", "ebp", "rbp",
    "spl", "sp", "esp", "rsp",
    "rip", "cs", "ds", "es", "fs", "gs", "ss",
];

/// Registros numerados, con el último índice válido de cada familia.
const NUMBERED: &[(&str, u32)] = &[
    ("xmm", 31),
    ("ymm", 31),
    ("zmm", 31),
    ("mm", 7),
    ("st", 7),
    ("cr", 15),
    ("dr", 15),
    ("k", 7),
];

/// Determina si un nombre choca con un registro o palabra reservada.
pub fn is_reserved(name: &str) -> bool {
    // r8 a r15, con sus porciones r8b, r8w y r8d
    let extended = name
        .strip_prefix('r')
        .map(|rest| rest.strip_suffix(|c| matches!(c, 'b' | 'w' | 'd')).unwrap_or(rest));

    RESERVED.contains(&name)
        || matches!(extended.map(str::parse::<u32>), Some(Ok(8..=15)))
        || NUMBERED.iter().any(|&(prefix, last)| {
            match name.strip_prefix(prefix).map(str::parse::<u32>) {
                Some(Ok(index)) => index <= last,
                _ => false,
            }
        })
}

/// Calificador de tamaño de un operando en memoria.
fn size_of(width: Width) -> &'static str {
    match width {
        Width::Byte => "byte",
        Width::Word => "word",
        Width::Dword => "dword",
        Width::Qword => "qword",
    }
}

pub struct Emitter<'a, W> {
    output: &'a mut W,
    tokens: &'a [Located<Token>],
    layout: &'a Layout,
}

impl<'a, W: Write> Emitter<'a, W> {
    pub fn new(output: &'a mut W, tokens: &'a [Located<Token>], layout: &'a Layout) -> Self {
        Emitter {
            output,
            tokens,
            layout,
        }
    }

    /// Siembra la pila con los argumentos del proceso.
    pub fn prologue(&mut self) -> io::Result<()> {
        // main(argc, argv): argc queda en el tope
        emit!(self, "push", "{}", Reg::Rdx)?;
        emit!(self, "push", "{}", Reg::Rcx)
    }

    /// Termina el proceso con código de salida cero.
    pub fn epilogue(&mut self) -> io::Result<()> {
        self.align_for_call()?;
        emit!(self, "xor", "ecx, ecx")?;
        emit!(self, "call", "{}", EXIT_ROUTINE)
    }

    pub fn put_token(&mut self, index: usize, token: &Token) -> Result<(), CodegenError> {
        use Token::*;

        // El `end` de un ciclo salta de vuelta a su `while`; la salida del
        // ciclo se ubica después de ese salto
        let loop_head = match token {
            End(Some(opener)) => match self.tokens.get(*opener).map(Located::val) {
                Some(While(_)) => Some(*opener),
                _ => None,
            },

            _ => None,
        };

        if self.layout.is_target(index) && loop_head.is_none() {
            self.label(index)?;
        }

        match token {
            Int(value) => self.push_int(*value)?,
            Str(string) => match self.layout.string_label(string) {
                Some(label) => {
                    emit!(self, "lea", "{}, [rel {}]", Reg::Rax, label)?;
                    emit!(self, "push", "{}", Reg::Rax)?;
                }

                None => return Err(CodegenError::NotImplemented(token.clone())),
            },

            Id(target) | Call(target) => self.call(target.as_ref())?,

            Add => self.binary("add")?,
            Sub => self.binary("sub")?,
            Mul => self.binary("imul")?,
            BitAnd => self.binary("and")?,
            BitOr => self.binary("or")?,
            Xor => self.binary("xor")?,
            Div => self.divide(Reg::Rax)?,
            Mod => self.divide(Reg::Rdx)?,
            LeftShift => self.shift("shl")?,
            RightShift => self.shift("sar")?,
            BitNot => emit!(self, "not", "qword [{}]", Reg::Rsp)?,

            Equal => self.compare("cmove")?,
            NotEqual => self.compare("cmovne")?,
            Greater => self.compare("cmovg")?,
            Smaller => self.compare("cmovl")?,

            Dup => emit!(self, "push", "qword [{}]", Reg::Rsp)?,
            Drop(count) => self.move_rsp(*count as i32)?,
            Swap => {
                emit!(self, "pop", "{}", Reg::Rax)?;
                emit!(self, "pop", "{}", Reg::Rbx)?;
                emit!(self, "push", "{}", Reg::Rax)?;
                emit!(self, "push", "{}", Reg::Rbx)?;
            }

            // La dirección del valor en el tope
            Quote => emit!(self, "push", "{}", Reg::Rsp)?,
            Apply(Some(width)) => self.load(*width)?,
            Store(Some(width)) => self.store(*width)?,

            If(Some(target)) | Do(Some(target)) => self.jump_if_false(*target)?,
            Else(Some(target)) => emit!(self, "jmp", "{}", Label(*target))?,
            While(Some(_)) => (),
            End(Some(_)) => {
                if let Some(head) = loop_head {
                    emit!(self, "jmp", "{}", Label(head))?;
                    self.label(index)?;
                }
            }

            Macro | Apply(None) | Store(None) | If(None) | Else(None) | While(None) | Do(None)
            | End(None) => return Err(CodegenError::NotImplemented(token.clone())),
        }

        Ok(())
    }

    fn label(&mut self, index: usize) -> io::Result<()> {
        writeln!(self.output, "{}:", Label(index))
    }

    fn push_int(&mut self, value: i64) -> io::Result<()> {
        // push solo acepta inmediatos de 32 bits con extensión de signo
        match i32::try_from(value) {
            Ok(immediate) => emit!(self, "push", "qword {}", immediate),
            Err(_) => {
                emit!(self, "mov", "{}, {}", Reg::Rax, value)?;
                emit!(self, "push", "{}", Reg::Rax)
            }
        }
    }

    /// Saca el tope a %rbx y el segundo valor a %rax.
    fn pop_operands(&mut self) -> io::Result<()> {
        emit!(self, "pop", "{}", Reg::Rbx)?;
        emit!(self, "pop", "{}", Reg::Rax)
    }

    fn binary(&mut self, opcode: &str) -> io::Result<()> {
        self.pop_operands()?;
        emit!(self, opcode, "{}, {}", Reg::Rax, Reg::Rbx)?;
        emit!(self, "push", "{}", Reg::Rax)
    }

    /// `idiv` deja el cociente en %rax y el residuo en %rdx.
    fn divide(&mut self, result: Reg) -> io::Result<()> {
        self.pop_operands()?;
        emit!(self, "cqo")?;
        emit!(self, "idiv", "{}", Reg::Rbx)?;
        emit!(self, "push", "{}", result)
    }

    fn shift(&mut self, opcode: &str) -> io::Result<()> {
        emit!(self, "pop", "{}", Reg::Rcx)?;
        emit!(self, "pop", "{}", Reg::Rax)?;
        emit!(self, opcode, "{}, {}", Reg::Rax, Reg::Rcx.sized(Width::Byte))?;
        emit!(self, "push", "{}", Reg::Rax)
    }

    /// Produce 1 o 0 sin saltos.
    fn compare(&mut self, cmov: &str) -> io::Result<()> {
        self.pop_operands()?;
        emit!(self, "xor", "{0}, {0}", Reg::Rcx.sized(Width::Dword))?;
        emit!(self, "mov", "{}, 1", Reg::Rdx.sized(Width::Dword))?;
        emit!(self, "cmp", "{}, {}", Reg::Rax, Reg::Rbx)?;
        emit!(self, cmov, "{}, {}", Reg::Rcx, Reg::Rdx)?;
        emit!(self, "push", "{}", Reg::Rcx)
    }

    fn load(&mut self, width: Width) -> io::Result<()> {
        emit!(self, "pop", "{}", Reg::Rax)?;

        let (opcode, destination) = match width {
            Width::Byte | Width::Word => ("movzx", Reg::Rax.sized(Width::Dword)),

            // Escribir a %eax limpia la mitad superior de %rax
            Width::Dword => ("mov", Reg::Rax.sized(Width::Dword)),
            Width::Qword => ("mov", Reg::Rax.sized(Width::Qword)),
        };

        emit!(self, opcode, "{}, {} [{}]", destination, size_of(width), Reg::Rax)?;
        emit!(self, "push", "{}", Reg::Rax)
    }

    /// `valor dirección store`
    fn store(&mut self, width: Width) -> io::Result<()> {
        emit!(self, "pop", "{}", Reg::Rax)?;
        emit!(self, "pop", "{}", Reg::Rbx)?;
        emit!(
            self,
            "mov",
            "{} [{}], {}",
            size_of(width),
            Reg::Rax,
            Reg::Rbx.sized(width)
        )
    }

    fn jump_if_false(&mut self, target: usize) -> io::Result<()> {
        emit!(self, "pop", "{}", Reg::Rax)?;
        emit!(self, "test", "{0}, {0}", Reg::Rax)?;
        emit!(self, "jz", "{}", Label(target))
    }

    fn call(&mut self, target: &str) -> io::Result<()> {
        // Los argumentos se leen de las primeras ranuras sin sacarlos
        for (register, slot) in Reg::argument_sequence().zip(0..Reg::MAX_ARGS) {
            match slot {
                0 => emit!(self, "mov", "{}, [{}]", register, Reg::Rsp)?,
                _ => emit!(self, "mov", "{}, [{} + {}]", register, Reg::Rsp, slot * VALUE_SIZE)?,
            }
        }

        // %rbx se preserva a través de llamadas en esta ABI
        emit!(self, "mov", "{}, {}", Reg::Rbx, Reg::Rsp)?;
        self.align_for_call()?;
        emit!(self, "call", "{}", target)?;
        emit!(self, "mov", "{}, {}", Reg::Rsp, Reg::Rbx)?;
        emit!(self, "push", "{}", Reg::Rax)
    }

    fn align_for_call(&mut self) -> io::Result<()> {
        emit!(self, "and", "{}, -{}", Reg::Rsp, STACK_ALIGNMENT)?;
        emit!(self, "sub", "{}, {}", Reg::Rsp, SHADOW_SPACE)
    }

    fn move_rsp(&mut self, slots: i32) -> io::Result<()> {
        let instruction = if slots < 0 { "sub" } else { "add" };
        let offset = slots.abs() * VALUE_SIZE as i32;
        emit!(self, instruction, "{}, {}", Reg::Rsp, offset)
    }
}
