//! disasm.rs — Désassembleur lisible pour un chunk
//!
//! Sert le mode trace de la VM et les tests. Les constantes sont résolues
//! via le tas (`/* … */` en commentaire), les lignes répétées s'affichent
//! en `|` comme dans les sorties habituelles.

use std::fmt::Write as _;

use crate::bytecode::chunk::Chunk;
use crate::bytecode::ops::{Op, OperandKind};
use crate::heap::Heap;

/// Désassemble tout le chunk sous un titre.
pub fn disassemble_chunk(heap: &Heap, chunk: &Chunk, title: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(&mut out, "== {title} ==");
    let mut offset = 0;
    while offset < chunk.len() {
        let (text, next) = disassemble_instruction(heap, chunk, offset);
        let _ = writeln!(&mut out, "{text}");
        offset = next;
    }
    out
}

/// Désassemble l'instruction à `offset` ; renvoie (texte, offset suivant).
pub fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut out = String::new();
    let _ = write!(&mut out, "{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        let _ = write!(&mut out, "   | ");
    } else {
        let _ = write!(&mut out, "{:4} ", chunk.line_at(offset));
    }

    let byte = chunk.code[offset];
    let op = match Op::from_byte(byte) {
        Some(op) => op,
        None => {
            let _ = write!(&mut out, "octet inconnu {byte:#04x}");
            return (out, offset + 1);
        }
    };

    let rendered_const = |idx: u8| -> String {
        let value = chunk.constant(idx as usize);
        format!("{} /* {} */", idx, heap.value_to_string(value))
    };

    match op.operands() {
        OperandKind::None => {
            let _ = write!(&mut out, "{}", op.mnemonic());
            (out, offset + 1)
        }
        OperandKind::Const => {
            let idx = chunk.code[offset + 1];
            let _ = write!(&mut out, "{:12} {}", op.mnemonic(), rendered_const(idx));
            (out, offset + 2)
        }
        OperandKind::Byte => {
            let b = chunk.code[offset + 1];
            let _ = write!(&mut out, "{:12} {b}", op.mnemonic());
            (out, offset + 2)
        }
        OperandKind::Short => {
            let hi = chunk.code[offset + 1] as usize;
            let lo = chunk.code[offset + 2] as usize;
            let jump = (hi << 8) | lo;
            let target = if op == Op::Loop {
                offset + 3 - jump
            } else {
                offset + 3 + jump
            };
            let _ = write!(&mut out, "{:12} {offset} -> {target}", op.mnemonic());
            (out, offset + 3)
        }
        OperandKind::ConstByte => {
            let idx = chunk.code[offset + 1];
            let argc = chunk.code[offset + 2];
            let _ = write!(
                &mut out,
                "{:12} ({argc} args) {}",
                op.mnemonic(),
                rendered_const(idx)
            );
            (out, offset + 3)
        }
        OperandKind::ConstConstByte => {
            let name = chunk.code[offset + 1];
            let alias = chunk.code[offset + 2];
            let slot = chunk.code[offset + 3];
            let _ = write!(
                &mut out,
                "{:12} {} as {} -> slot {slot}",
                op.mnemonic(),
                rendered_const(name),
                rendered_const(alias)
            );
            (out, offset + 4)
        }
        OperandKind::ConstByteByte => {
            let name = chunk.code[offset + 1];
            let local = chunk.code[offset + 2];
            let upvalue = chunk.code[offset + 3];
            let _ = write!(
                &mut out,
                "{:12} {} local {local} upvalue {upvalue}",
                op.mnemonic(),
                rendered_const(name)
            );
            (out, offset + 4)
        }
        OperandKind::ConstPairs => {
            let idx = chunk.code[offset + 1];
            let function = chunk.constant(idx as usize);
            let _ = write!(&mut out, "{:12} {}", op.mnemonic(), rendered_const(idx));
            let upvalue_count = if function.is_obj() {
                heap.function(function.as_obj()).upvalue_count
            } else {
                0
            };
            let mut next = offset + 2;
            for _ in 0..upvalue_count {
                let is_local = chunk.code[next];
                let index = chunk.code[next + 1];
                let _ = write!(
                    &mut out,
                    "\n{:04}    |   {} {index}",
                    next,
                    if is_local == 1 { "local" } else { "upvalue" }
                );
                next += 2;
            }
            (out, next)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn renders_constants_and_jumps() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new(0);
        let k = chunk.add_constant(Value::number(3.0));
        chunk.write_op(Op::Constant, 1);
        chunk.write(k as u8, 1);
        chunk.write_op(Op::JumpIfFalse, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(Op::Print, 2);
        chunk.write_op(Op::Return, 2);

        let s = heap.intern("x"); // le tas doit être vivant pour le rendu
        let _ = s;
        let text = disassemble_chunk(&heap, &chunk, "test");
        assert!(text.contains("== test =="));
        assert!(text.contains("const"));
        assert!(text.contains("/* 3 */"));
        assert!(text.contains("jz"));
        assert!(text.contains("2 -> 7"));
        assert!(text.contains("print"));
    }
}
