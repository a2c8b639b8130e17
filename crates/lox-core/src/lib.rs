//! lox-core — Cœur du langage Lox (valeurs, tas, bytecode, scanner)
//!
//! Ce crate fournit les briques partagées par le compilateur et la VM :
//!
//! - [`value::Value`] : représentation 64-bit NaN-boxée (nil, bool, f64,
//!   handle d'objet tas dans la charge utile 48 bits) ;
//! - [`object`] : les variantes d'objets tas (chaînes internées, fonctions,
//!   fermetures, upvalues, classes, instances, dicts, tableaux, natifs,
//!   prototypes, modules, références inter-modules) ;
//! - [`heap::Heap`] : l'arène d'allocation et le GC mark-sweep à **deux
//!   générations** (infant / older), pile grise explicite, promotion après
//!   collecte, table d'internement faible ;
//! - [`table::Table`] : table à adressage ouvert (sondage linéaire,
//!   tombstones, facteur de charge 0.75) clé = chaîne internée ;
//! - [`bytecode`] : le `Chunk` (code + lignes + pool de constantes dédupliqué)
//!   et le jeu d'opcodes, plus un désassembleur lisible ;
//! - [`scanner`] : le lexer à états empilables (stash) avec `peek(n)`.
//!
//! Aucune E/S ici : tout ce qui touche aux fichiers, au REPL ou au débogueur
//! vit dans `lox-vm` / `lox-cli`.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod bytecode;
pub mod heap;
pub mod module;
pub mod object;
pub mod scanner;
pub mod table;
pub mod value;

pub use bytecode::{Chunk, Op};
pub use heap::Heap;
pub use module::{Module, ModuleId};
pub use object::{ObjPayload, ObjRef};
pub use table::{InternedStr, Table};
pub use value::Value;
