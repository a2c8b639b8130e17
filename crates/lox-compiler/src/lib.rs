//! lox-compiler — Frontend du langage
//!
//! Parseur Pratt **une passe** : pas d'AST, le bytecode sort directement dans
//! le chunk de la fonction en cours. Voir [`compile`] pour un module complet
//! et [`compile_eval`] pour une expression évaluée dans un frame vivant
//! (chemin `print` du débogueur).
//!
//! Les erreurs s'accumulent façon panic-mode : après une erreur, on jette
//! des tokens jusqu'à une frontière d'instruction et on continue, pour
//! rapporter plusieurs diagnostics en une passe.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

mod compiler;

use std::fmt;

use lox_core::heap::Heap;
use lox_core::object::{LocalVar, ObjRef};

pub use compiler::{compile, compile_eval};

/// Genre de fonction en cours de compilation. Pilote le slot 0 (`this` pour
/// les méthodes, vide pour les fonctions, absent pour l'eval), le retour
/// implicite et les interdits (`return` au top-level…).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionType {
    Script,
    Function,
    Initializer,
    Method,
    Eval,
}

/// Un diagnostic de compilation, au format historique
/// `[line L] Error at 'lexeme': message`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    /// Lexème fautif ; `None` à la fin de fichier, vide sur un token
    /// d'erreur du scanner (le message se suffit).
    pub lexeme: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[line {}] Error", self.line)?;
        match &self.lexeme {
            Some(l) if !l.is_empty() => write!(f, " at '{l}'")?,
            Some(_) => {}
            None => write!(f, " at end")?,
        }
        write!(f, ": {}", self.message)
    }
}

/// Échec de compilation : la liste des diagnostics accumulés.
#[derive(Debug)]
pub struct CompileError {
    pub diagnostics: Vec<Diagnostic>,
}

impl std::error::Error for CompileError {}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, d) in self.diagnostics.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{d}")?;
        }
        Ok(())
    }
}

/// Remonte la chaîne de métadonnées pour retrouver le slot local qui a donné
/// naissance à l'upvalue `index` de `function`.
///
/// Le débogueur s'en sert pour nommer les upvalues (`info locals`), l'eval
/// pour résoudre un nom dans le frame visé.
pub fn upvalue_local(heap: &Heap, mut function: ObjRef, mut index: usize) -> Option<LocalVar> {
    loop {
        let f = heap.function(function);
        let desc = *f.meta.upvalues.get(index)?;
        let enclosing = f.meta.enclosing?;
        if desc.is_local {
            return heap.function(enclosing).meta.locals.get(desc.index as usize).cloned();
        }
        index = desc.index as usize;
        function = enclosing;
    }
}

/// Cherche, par nom, un upvalue existant de `function`. Renvoie son index.
pub fn upvalue_by_name(heap: &Heap, function: ObjRef, name: &str) -> Option<usize> {
    let count = heap.function(function).upvalue_count;
    (0..count).find(|&i| {
        upvalue_local(heap, function, i).map(|l| l.name == name).unwrap_or(false)
    })
}
