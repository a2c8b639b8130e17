//! chunk.rs — Buffer de bytecode d'une fonction
//!
//! `code` et `lines` sont des tableaux parallèles : `lines[i]` est la ligne
//! source de `code[i]`. Le pool de constantes déduplique par égalité de
//! valeur — les handles d'objets via un index annexe `ahash`, les nombres par
//! balayage.

use ahash::AHashMap;

use crate::bytecode::ops::Op;
use crate::module::ModuleId;
use crate::value::Value;

/// Un chunk de bytecode, possédé par sa fonction.
#[derive(Debug)]
pub struct Chunk {
    pub code: Vec<u8>,
    pub lines: Vec<u32>,
    pub constants: Vec<Value>,
    /// Module propriétaire (registre de la VM).
    pub module: ModuleId,
    /// Index annexe : handle d'objet → index de constante (dé-dupe).
    obj_index: AHashMap<u32, usize>,
}

impl Chunk {
    pub fn new(module: ModuleId) -> Chunk {
        Chunk {
            code: Vec::new(),
            lines: Vec::new(),
            constants: Vec::new(),
            module,
            obj_index: AHashMap::new(),
        }
    }

    /// Longueur du code, en octets.
    #[inline]
    pub fn len(&self) -> usize {
        self.code.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Émet un octet brut avec sa ligne source.
    pub fn write(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    pub fn write_op(&mut self, op: Op, line: u32) {
        self.write(op.as_byte(), line);
    }

    /// Corrige un octet déjà émis (patch de saut, constante d'import).
    pub fn patch(&mut self, offset: usize, byte: u8) {
        self.code[offset] = byte;
    }

    /// Ajoute une constante, en dédupliquant par égalité de valeur.
    /// Renvoie son index (le compilateur vérifie la limite d'un octet).
    pub fn add_constant(&mut self, value: Value) -> usize {
        if value.is_obj() {
            let key = value.as_obj().index();
            if let Some(&idx) = self.obj_index.get(&key) {
                return idx;
            }
            let idx = self.constants.len();
            self.constants.push(value);
            self.obj_index.insert(key, idx);
            return idx;
        }
        if let Some(idx) = self.constants.iter().position(|c| c.equals(value)) {
            return idx;
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    #[inline]
    pub fn constant(&self, index: usize) -> Value {
        self.constants[index]
    }

    /// Ligne source de l'octet `offset`.
    pub fn line_at(&self, offset: usize) -> u32 {
        self.lines.get(offset).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjRef;
    use pretty_assertions::assert_eq;

    #[test]
    fn code_and_lines_stay_parallel() {
        let mut c = Chunk::new(0);
        c.write_op(Op::Nil, 1);
        c.write_op(Op::Print, 2);
        c.write_op(Op::Return, 2);
        assert_eq!(c.code.len(), c.lines.len());
        assert_eq!(c.line_at(0), 1);
        assert_eq!(c.line_at(2), 2);
    }

    #[test]
    fn constants_deduplicate_by_value() {
        let mut c = Chunk::new(0);
        let a = c.add_constant(Value::number(1.5));
        let b = c.add_constant(Value::number(2.0));
        let a2 = c.add_constant(Value::number(1.5));
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(c.constants.len(), 2);
    }

    #[test]
    fn object_constants_deduplicate_by_handle() {
        let mut c = Chunk::new(0);
        let s = Value::object(ObjRef::new(12));
        let t = Value::object(ObjRef::new(13));
        let i = c.add_constant(s);
        let j = c.add_constant(t);
        assert_eq!(c.add_constant(s), i);
        assert_eq!(c.add_constant(t), j);
        assert_eq!(c.constants.len(), 2);
    }

    #[test]
    fn nan_constant_never_merges() {
        let mut c = Chunk::new(0);
        let a = c.add_constant(Value::number(f64::NAN));
        let b = c.add_constant(Value::number(f64::NAN));
        assert_ne!(a, b);
    }

    #[test]
    fn patch_rewrites_in_place() {
        let mut c = Chunk::new(0);
        c.write_op(Op::Jump, 1);
        c.write(0xFF, 1);
        c.write(0xFF, 1);
        c.patch(1, 0x01);
        c.patch(2, 0x02);
        assert_eq!(&c.code[1..], &[0x01, 0x02]);
    }
}
