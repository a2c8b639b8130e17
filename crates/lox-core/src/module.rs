//! module.rs — Un module chargé (données ; le registre vit dans la VM)
//!
//! Un module garde son texte source (le débogueur s'en sert pour `list`),
//! la fonction racine produite par le compilateur, la fermeture racine une
//! fois lancée, et sa table `exports` : nom exporté → `ObjReference`.
//!
//! La référence est créée *cassée* à la compilation (pas encore de fermeture
//! propriétaire) ; `OP_EXPORT` la rend vivante quand le top-level tourne —
//! la construction en deux temps évite un cycle observable par le GC.

use crate::object::ObjRef;
use crate::table::{InternedStr, Table};

/// Index d'un module dans le registre de la VM.
pub type ModuleId = usize;

pub struct Module {
    pub name: Option<InternedStr>,
    pub path: Option<InternedStr>,
    /// Copie du texte source, pour les listings du débogueur.
    pub source: String,
    pub root_function: Option<ObjRef>,
    pub closure: Option<ObjRef>,
    /// nom exporté → `Value` d'`ObjReference`.
    pub exports: Table,
}

impl Module {
    pub fn new(name: Option<InternedStr>, path: Option<InternedStr>) -> Module {
        Module {
            name,
            path,
            source: String::new(),
            root_function: None,
            closure: None,
            exports: Table::new(),
        }
    }
}
