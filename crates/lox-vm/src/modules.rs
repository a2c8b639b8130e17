//! modules.rs — Registre des modules et chargement à la demande
//!
//! La VM possède la liste des modules chargés. `OP_IMPORT_MODULE` passe par
//! [`Vm::resolve_import`] : recherche par chemin normalisé, sinon par nom
//! avec `.lox` apposé, chargement du fichier au premier import. Deux imports
//! du même chemin partagent le même module (exports déjà peuplés).
//!
//! L'exécution du top-level d'un module importé pose `exit_at_frame` sur le
//! frame appelant : le `OP_RETURN` final du module rend la main au site
//! d'import au lieu de terminer la VM.

use camino::Utf8Path;

use lox_core::module::{Module, ModuleId};
use lox_core::object::ObjClosure;
use lox_core::object::ObjPayload;
use lox_core::value::Value;

use crate::vm::Vm;
use crate::{InterpretError, InterpretResult};

impl Vm {
    /// Crée un module vide et l'enregistre. `path` est normalisé.
    pub fn create_module(&mut self, name: &str, path: Option<&str>) -> ModuleId {
        let was_enabled = self.heap.set_gc_enabled(false);
        let name_key = self.heap.intern(name);
        let path_key = path.map(|p| {
            let normalized = normalize_path(p);
            self.heap.intern(&normalized)
        });
        self.modules.push(Module::new(Some(name_key), path_key));
        self.heap.set_gc_enabled(was_enabled);
        self.modules.len() - 1
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Compile `source` comme racine du module (copie du texte conservée
    /// pour les listings du débogueur). Les diagnostics partent sur stderr.
    pub fn compile_module(&mut self, id: ModuleId, source: &str) -> InterpretResult {
        let was_enabled = self.heap.set_gc_enabled(false);
        self.modules[id].source = source.to_string();
        let compiled = lox_compiler::compile(
            source,
            &mut self.heap,
            &self.globals,
            &mut self.modules[id],
            id,
        );
        let result = match compiled {
            Ok(function) => {
                self.modules[id].root_function = Some(function);
                Ok(())
            }
            Err(e) => {
                eprintln!("{e}");
                Err(InterpretError::Compile)
            }
        };
        self.heap.set_gc_enabled(was_enabled);
        result
    }

    /// Enveloppe la fonction racine dans une fermeture, l'empile et entre
    /// dedans avec zéro argument.
    pub fn interpret_module(&mut self, id: ModuleId) -> InterpretResult {
        let was_enabled = self.heap.set_gc_enabled(false);
        let root = match self.modules[id].root_function {
            Some(f) => f,
            None => {
                self.heap.set_gc_enabled(was_enabled);
                return Err(InterpretError::Compile);
            }
        };
        let count = self.heap.function(root).upvalue_count;
        let closure = self
            .heap
            .alloc(ObjPayload::Closure(ObjClosure { function: root, upvalues: vec![None; count] }));
        self.modules[id].closure = Some(closure);
        self.push(Value::object(closure));
        self.heap.set_gc_enabled(was_enabled);

        self.call_closure(closure, 0)?;
        self.debugger_run_init_commands();
        self.run()
    }

    /// Lit, compile et exécute le fichier du module, en marquant le frame
    /// de sortie pour qu'un import rende la main à l'appelant.
    pub fn load_module(&mut self, id: ModuleId) -> InterpretResult {
        let path = match self.modules[id].path {
            Some(p) => self.heap.str_chars(p.obj).to_string(),
            None => return Err(InterpretError::Compile),
        };
        let source = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) => {
                eprintln!("Could not read \"{path}\": {e}.");
                return Err(InterpretError::Runtime);
            }
        };
        self.compile_module(id, &source)?;
        self.run_module_top_level(id)
    }

    /// Exécute le top-level d'un module déjà compilé, borné au frame
    /// appelant.
    fn run_module_top_level(&mut self, id: ModuleId) -> InterpretResult {
        let old_exit = self.exit_at_frame;
        self.exit_at_frame = self.frames.len();
        let result = self.interpret_module(id);
        self.exit_at_frame = old_exit;
        result
    }

    /// Point d'entrée du driver : exécute `path` comme module `__main__`.
    pub fn run_file(&mut self, path: &str) -> InterpretResult {
        let id = self.create_module("__main__", Some(path));
        self.load_module(id)
    }

    /// Compile puis exécute `source` dans le module `id` (REPL, tests).
    pub fn interpret_source(&mut self, id: ModuleId, source: &str) -> InterpretResult {
        self.compile_module(id, source)?;
        let old_exit = self.exit_at_frame;
        self.exit_at_frame = self.frames.len();
        let result = self.interpret_module(id);
        self.exit_at_frame = old_exit;
        result
    }

    /// Pré-enregistre un module avec sa source, sans l'exécuter : le premier
    /// import le fera tourner (les tests d'import s'en servent, et le REPL
    /// pour ses pseudo-fichiers).
    pub fn register_module_source(&mut self, path: &str, source: &str) -> ModuleId {
        let name = Utf8Path::new(path).file_stem().unwrap_or(path).to_string();
        let id = self.create_module(&name, Some(path));
        self.modules[id].source = source.to_string();
        id
    }

    /// Cherche un module déjà enregistré par chemin puis par nom.
    pub(crate) fn find_module(&self, path: &str) -> Option<ModuleId> {
        let normalized = normalize_path(path);
        self.modules.iter().position(|m| {
            let by_path = m
                .path
                .map(|p| self.heap.str_chars(p.obj) == normalized)
                .unwrap_or(false);
            let by_name =
                m.name.map(|n| self.heap.str_chars(n.obj) == path).unwrap_or(false);
            by_path || by_name
        })
    }

    /// Résout la cible d'un `OP_IMPORT_MODULE`, en chargeant le fichier au
    /// premier passage. Un module trouvé mais jamais lancé (source
    /// pré-enregistrée) est exécuté ici, pour amorcer ses exports.
    pub(crate) fn resolve_import(&mut self, path: &str) -> Result<ModuleId, InterpretError> {
        if let Some(id) = self.find_module(path) {
            if self.modules[id].closure.is_none() {
                if self.modules[id].root_function.is_none() {
                    let source = self.modules[id].source.clone();
                    if source.is_empty() {
                        return self.load_for_import(id, path);
                    }
                    self.compile_module(id, &source).map_err(|_| {
                        self.runtime_error(&format!("Failed to load script from: {path}"))
                    })?;
                }
                self.run_module_top_level(id).map_err(|_| {
                    self.runtime_error(&format!("Failed to load script from: {path}"))
                })?;
            }
            return Ok(id);
        }

        // pas encore enregistré : tenter le fichier, puis `nom.lox`
        let candidate = if file_exists(path) {
            path.to_string()
        } else {
            let with_ext = format!("{path}.lox");
            if file_exists(&with_ext) {
                with_ext
            } else {
                return Err(self.runtime_error(&format!("Failed to load script from: {path}")));
            }
        };

        let name = Utf8Path::new(&candidate)
            .file_stem()
            .unwrap_or(candidate.as_str())
            .to_string();
        let id = self.create_module(&name, Some(&candidate));
        self.load_for_import(id, path)
    }

    fn load_for_import(&mut self, id: ModuleId, path: &str) -> Result<ModuleId, InterpretError> {
        match self.load_module(id) {
            Ok(()) => Ok(id),
            Err(_) => {
                // chargement raté : on retire le module du registre
                if id + 1 == self.modules.len() {
                    self.modules.pop();
                }
                Err(self.runtime_error(&format!("Failed to load script from: {path}")))
            }
        }
    }
}

/// Normalise un chemin (séparateurs, `.` superflus) pour les comparaisons
/// du registre.
fn normalize_path(path: &str) -> String {
    let p = Utf8Path::new(path);
    let mut out = String::new();
    for component in p.components() {
        match component {
            camino::Utf8Component::CurDir => {}
            camino::Utf8Component::RootDir => out.push('/'),
            other => {
                if !out.is_empty() && !out.ends_with('/') {
                    out.push('/');
                }
                out.push_str(other.as_str());
            }
        }
    }
    if out.is_empty() {
        path.to_string()
    } else {
        out
    }
}

fn file_exists(path: &str) -> bool {
    std::path::Path::new(path).is_file()
}
