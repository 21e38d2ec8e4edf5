/// Emite una instrucción, opcionalmente con operandos.
///
/// `$self` debe tener un campo `output` que implemente [`std::io::Write`].
/// El resultado es un [`std::io::Result`].
macro_rules! emit {
    ($self:expr, $opcode:expr) => {
        writeln!($self.output, "\t{}", $opcode)
    };

    ($self:expr, $opcode:expr, $($format:tt)*) => {{
        write!($self.output, "\t{:8}", $opcode)?;
        writeln!($self.output, $($format)*)
    }};
}
