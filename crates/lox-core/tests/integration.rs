//! Tests d'intégration du cœur : les briques jouent ensemble sans VM.

use pretty_assertions::assert_eq;

use lox_core::bytecode::{disassemble_chunk, Chunk, Op};
use lox_core::heap::Heap;
use lox_core::object::flags;
use lox_core::scanner::{Scanner, TokenKind};
use lox_core::table::{hash_bytes, Table};
use lox_core::value::Value;

#[test]
fn scanner_feeds_a_chunk_of_interned_constants() {
    // un mini frontend : chaque littéral scanné devient une constante
    let mut heap = Heap::new();
    let mut chunk = Chunk::new(0);
    let mut scanner = Scanner::new("\"a\" \"b\" \"a\" 1 2 1");

    loop {
        let tok = scanner.scan_token();
        match tok.kind {
            TokenKind::String => {
                let inner = &tok.lexeme[1..tok.lexeme.len() - 1];
                let v = heap.intern_value(inner);
                let idx = chunk.add_constant(v);
                chunk.write_op(Op::Constant, tok.line);
                chunk.write(idx as u8, tok.line);
            }
            TokenKind::Number => {
                let v = Value::number(tok.lexeme.parse().unwrap());
                let idx = chunk.add_constant(v);
                chunk.write_op(Op::Constant, tok.line);
                chunk.write(idx as u8, tok.line);
            }
            TokenKind::Eof => break,
            other => panic!("token inattendu {other:?}"),
        }
    }
    chunk.write_op(Op::Return, 1);

    // internement + dé-dupe : "a" et 1 ne comptent qu'une fois
    assert_eq!(chunk.constants.len(), 4);
    let text = disassemble_chunk(&heap, &chunk, "littéraux");
    assert!(text.contains("/* a */"));
    assert!(text.contains("/* 2 */"));
    assert!(text.contains("ret"));
}

#[test]
fn table_entries_survive_a_gc_cycle_when_marked() {
    let mut heap = Heap::new();
    let mut table = Table::new();
    for word in ["un", "deux", "trois"] {
        let key = heap.intern(word);
        table.set(key, Value::number(word.len() as f64));
    }

    // cycle : la table externe est une racine, ses clés doivent survivre
    heap.gc_begin();
    let pairs: Vec<_> = table.iter().collect();
    for (k, v) in pairs {
        heap.mark_object(k.obj, flags::MARKED);
        heap.mark_value(v, flags::MARKED);
    }
    heap.trace(flags::MARKED);
    heap.sweep_infant();

    for word in ["un", "deux", "trois"] {
        let key = heap.find_string(word, hash_bytes(word.as_bytes())).expect("interné");
        assert_eq!(table.get(key), Some(Value::number(word.len() as f64)));
        assert!(heap.is_live(key.obj));
    }
}

#[test]
fn promotion_then_older_sweep_frees_the_unreachable() {
    let mut heap = Heap::new();
    let keep = heap.intern("gardé");
    let drop = heap.intern("jeté");

    // tout le monde survit au premier cycle et passe older
    heap.gc_begin();
    heap.mark_object(keep.obj, flags::MARKED);
    heap.mark_object(drop.obj, flags::MARKED);
    heap.trace(flags::MARKED);
    heap.sweep_infant();
    assert!(heap.get(keep.obj).has_flag(flags::OLDER));
    assert!(heap.get(drop.obj).has_flag(flags::OLDER));

    // cycle older : seul `keep` est encore une racine
    heap.gc_begin();
    heap.mark_object(keep.obj, flags::MARKED_OLDER);
    heap.trace(flags::MARKED_OLDER);
    heap.sweep_older();

    assert!(heap.is_live(keep.obj));
    assert!(!heap.is_live(drop.obj));
    // la table d'internement a lâché la clé morte avant libération
    assert!(heap.find_string("jeté", hash_bytes("jeté".as_bytes())).is_none());
    assert!(heap.find_string("gardé", hash_bytes("gardé".as_bytes())).is_some());
}

#[test]
fn jump_encoding_round_trips_through_the_disassembler() {
    let mut heap = Heap::new();
    let t = heap.intern("t");
    let _ = t;

    let mut chunk = Chunk::new(0);
    chunk.write_op(Op::True, 1); // 0
    chunk.write_op(Op::JumpIfFalse, 1); // 1
    chunk.write(0x01, 1);
    chunk.write(0x00, 1); // saut de 256 octets
    chunk.write_op(Op::Loop, 2); // 4
    chunk.write(0x00, 2);
    chunk.write(0x05, 2); // retour à l'offset 2 ... cible = 7 - 5 = 2

    let (jz, next) = lox_core::bytecode::disassemble_instruction(&heap, &chunk, 1);
    assert_eq!(next, 4);
    assert!(jz.contains("1 -> 260"), "{jz}");
    let (lp, next) = lox_core::bytecode::disassemble_instruction(&heap, &chunk, 4);
    assert_eq!(next, 7);
    assert!(lp.contains("4 -> 2"), "{lp}");
}
