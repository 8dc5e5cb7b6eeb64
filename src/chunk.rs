// Chunk: an append-only bytecode buffer with a parallel line map and a
// constant pool (spec.md §4.B). Disassembly is a pure function of a chunk
// so it can be used identically by tests and by the trace-execution
// feature.

use std::convert::TryFrom;

use num_enum::TryFromPrimitive;

use crate::value::Value;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
pub enum OpCode {
    Constant = 0,
    ConstantLong,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    DefineGlobal,
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    Class,
    Inherit,
    Method,
    Return,
}

/// Constant-pool indices up to this count fit the one-byte `OP_CONSTANT`
/// form; beyond it, the compiler must emit `OP_CONSTANT_LONG`.
pub const MAX_SHORT_CONSTANTS: usize = 256;

#[derive(Default)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<usize>,
    pub constants: Vec<Value>,
}

impl Chunk {
    pub fn new() -> Chunk {
        Chunk { code: Vec::new(), lines: Vec::new(), constants: Vec::new() }
    }

    pub fn write(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: OpCode, line: usize) {
        self.write(op as u8, line);
    }

    /// Append a value to the constant pool and return its index. Always
    /// succeeds; `add_constant` never fails the way spec.md's "fails if
    /// the pool exceeds 255 entries" literal reading implies; instead the
    /// 256-entry boundary only decides which *opcode form* the compiler
    /// must emit to reference it (see `MAX_SHORT_CONSTANTS` and
    /// `Chunk::write_constant`).
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Emit a load of constant pool slot `index`, choosing the one-byte or
    /// three-byte (little-endian) operand form.
    pub fn write_constant(&mut self, index: usize, line: usize) {
        if index < MAX_SHORT_CONSTANTS {
            self.write_op(OpCode::Constant, line);
            self.write(index as u8, line);
        } else {
            self.write_op(OpCode::ConstantLong, line);
            let bytes = (index as u32).to_le_bytes();
            self.write(bytes[0], line);
            self.write(bytes[1], line);
            self.write(bytes[2], line);
        }
    }

    pub fn write_u16(&mut self, value: u16, line: usize) {
        let bytes = value.to_be_bytes();
        self.write(bytes[0], line);
        self.write(bytes[1], line);
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_be_bytes([self.code[offset], self.code[offset + 1]])
    }

    pub fn patch_u16(&mut self, offset: usize, value: u16) {
        let bytes = value.to_be_bytes();
        self.code[offset] = bytes[0];
        self.code[offset + 1] = bytes[1];
    }

    pub fn line_at(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    pub fn disassemble(&self, name: &str) -> String {
        let mut out = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.code.len() {
            let (line, next) = self.disassemble_instruction(offset);
            out.push_str(&line);
            out.push('\n');
            offset = next;
        }
        out
    }

    /// Render the instruction at `offset` and return `(text, next_offset)`.
    /// Never panics on malformed input, an unknown opcode renders as
    /// `"unknown opcode N"` and advances by one byte.
    pub fn disassemble_instruction(&self, offset: usize) -> (String, usize) {
        let mut text = format!("{:04} ", offset);
        if offset > 0 && self.line_at(offset) == self.line_at(offset - 1) {
            text.push_str("   | ");
        } else {
            text.push_str(&format!("{:4} ", self.line_at(offset)));
        }

        let byte = self.code[offset];
        let op = match OpCode::try_from(byte) {
            Ok(op) => op,
            Err(_) => {
                text.push_str(&format!("unknown opcode {}", byte));
                return (text, offset + 1);
            }
        };

        let width = match op {
            OpCode::Constant => self.constant_instr("OP_CONSTANT", offset, &mut text),
            OpCode::ConstantLong => self.constant_long_instr(offset, &mut text),
            OpCode::GetLocal => self.byte_instr("OP_GET_LOCAL", offset, &mut text),
            OpCode::SetLocal => self.byte_instr("OP_SET_LOCAL", offset, &mut text),
            OpCode::GetUpvalue => self.byte_instr("OP_GET_UPVALUE", offset, &mut text),
            OpCode::SetUpvalue => self.byte_instr("OP_SET_UPVALUE", offset, &mut text),
            OpCode::GetGlobal => self.constant_instr("OP_GET_GLOBAL", offset, &mut text),
            OpCode::DefineGlobal => self.constant_instr("OP_DEFINE_GLOBAL", offset, &mut text),
            OpCode::SetGlobal => self.constant_instr("OP_SET_GLOBAL", offset, &mut text),
            OpCode::GetProperty => self.constant_instr("OP_GET_PROPERTY", offset, &mut text),
            OpCode::SetProperty => self.constant_instr("OP_SET_PROPERTY", offset, &mut text),
            OpCode::GetSuper => self.constant_instr("OP_GET_SUPER", offset, &mut text),
            OpCode::Jump => self.jump_instr("OP_JUMP", 1, offset, &mut text),
            OpCode::JumpIfFalse => self.jump_instr("OP_JUMP_IF_FALSE", 1, offset, &mut text),
            OpCode::Loop => self.jump_instr("OP_LOOP", -1, offset, &mut text),
            OpCode::Call => self.byte_instr("OP_CALL", offset, &mut text),
            OpCode::Invoke => self.invoke_instr("OP_INVOKE", offset, &mut text),
            OpCode::SuperInvoke => self.invoke_instr("OP_SUPER_INVOKE", offset, &mut text),
            OpCode::Closure => self.closure_instr(offset, &mut text),
            OpCode::Class => self.constant_instr("OP_CLASS", offset, &mut text),
            OpCode::Method => self.constant_instr("OP_METHOD", offset, &mut text),
            simple => {
                text.push_str(Self::simple_name(simple));
                1
            }
        };
        (text, offset + width)
    }

    fn simple_name(op: OpCode) -> &'static str {
        match op {
            OpCode::Nil => "OP_NIL",
            OpCode::True => "OP_TRUE",
            OpCode::False => "OP_FALSE",
            OpCode::Pop => "OP_POP",
            OpCode::CloseUpvalue => "OP_CLOSE_UPVALUE",
            OpCode::Equal => "OP_EQUAL",
            OpCode::Greater => "OP_GREATER",
            OpCode::Less => "OP_LESS",
            OpCode::Add => "OP_ADD",
            OpCode::Subtract => "OP_SUBTRACT",
            OpCode::Multiply => "OP_MULTIPLY",
            OpCode::Divide => "OP_DIVIDE",
            OpCode::Not => "OP_NOT",
            OpCode::Negate => "OP_NEGATE",
            OpCode::Print => "OP_PRINT",
            OpCode::Inherit => "OP_INHERIT",
            OpCode::Return => "OP_RETURN",
            _ => "OP_UNKNOWN",
        }
    }

    fn byte_instr(&self, name: &str, offset: usize, text: &mut String) -> usize {
        let slot = self.code[offset + 1];
        text.push_str(&format!("{:<16} {:4}", name, slot));
        2
    }

    fn constant_instr(&self, name: &str, offset: usize, text: &mut String) -> usize {
        let index = self.code[offset + 1] as usize;
        text.push_str(&format!("{:<16} {:4} '{:?}'", name, index, self.constants.get(index)));
        2
    }

    fn constant_long_instr(&self, offset: usize, text: &mut String) -> usize {
        let index = u32::from_le_bytes([
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
            0,
        ]) as usize;
        text.push_str(&format!(
            "{:<16} {:4} '{:?}'",
            "OP_CONSTANT_LONG", index, self.constants.get(index)
        ));
        4
    }

    fn jump_instr(&self, name: &str, sign: i32, offset: usize, text: &mut String) -> usize {
        let jump = self.read_u16(offset + 1) as i32;
        let target = offset as i32 + 3 + sign * jump;
        text.push_str(&format!("{:<16} {:4} -> {}", name, offset, target));
        3
    }

    fn invoke_instr(&self, name: &str, offset: usize, text: &mut String) -> usize {
        let index = self.code[offset + 1] as usize;
        let argc = self.code[offset + 2];
        text.push_str(&format!(
            "{:<16} ({} args) {:4} '{:?}'",
            name, argc, index, self.constants.get(index)
        ));
        3
    }

    /// `OP_CLOSURE function_index upvalue_count (is_local index)*`. The
    /// explicit `upvalue_count` byte (rather than recovering it from the
    /// referenced function object) keeps disassembly self-contained,
    /// `Chunk` has no way to reach into `Heap` without an import cycle
    /// (`Heap` already depends on `Chunk` via `ObjFunction::chunk`).
    fn closure_instr(&self, offset: usize, text: &mut String) -> usize {
        let index = self.code[offset + 1] as usize;
        let upvalue_count = self.code[offset + 2] as usize;
        text.push_str(&format!("{:<16} {:4} '{:?}'", "OP_CLOSURE", index, self.constants.get(index)));
        for i in 0..upvalue_count {
            let base = offset + 3 + i * 2;
            let is_local = self.code[base] != 0;
            let idx = self.code[base + 1];
            text.push_str(&format!(
                "\n{:04}      |                     {} {}",
                base,
                if is_local { "local" } else { "upvalue" },
                idx
            ));
        }
        3 + upvalue_count * 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_roundtrips_through_u8() {
        assert_eq!(OpCode::try_from(OpCode::Return as u8), Ok(OpCode::Return));
        assert!(OpCode::try_from(255u8).is_err());
    }

    #[test]
    fn constant_write_is_deterministic() {
        let mut a = Chunk::new();
        a.write_constant(300, 1);
        let mut b = Chunk::new();
        b.write_constant(300, 1);
        assert_eq!(a.code, b.code);
    }

    #[test]
    fn long_form_used_past_short_cap() {
        let mut chunk = Chunk::new();
        for i in 0..300 {
            let idx = chunk.add_constant(Value::Number(i as f64));
            chunk.write_constant(idx, 1);
        }
        assert_eq!(chunk.code[0], OpCode::Constant as u8);
        // index 256 is the first to require the long form
        let mut offset = 0;
        let mut seen_long = false;
        while offset < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[offset]).unwrap();
            offset += match op {
                OpCode::Constant => 2,
                OpCode::ConstantLong => {
                    seen_long = true;
                    4
                }
                _ => unreachable!(),
            };
        }
        assert!(seen_long);
    }
}
