//! lox-vm — Machine virtuelle du langage
//!
//! La [`Vm`] possède tout l'état mutable du processus : tas GC, pile de
//! valeurs, frames d'appel, globales, registre de modules, débogueur. Tout
//! passe par la boucle d'interprétation ([`Vm::run`] en interne) ou par les
//! chemins d'initialisation — une seule exécution, pas de threads.
//!
//! Points d'entrée :
//! - [`Vm::run_file`] : charge et exécute un fichier comme module `__main__` ;
//! - [`Vm::interpret_source`] : compile puis exécute une source dans un
//!   module donné (le REPL s'en sert) ;
//! - [`Vm::eval`] : évalue une expression dans le frame courant (débogueur).
//!
//! Les sorties du programme (`print`) passent par le trait [`Host`], ce qui
//! permet aux tests de capturer la sortie sans toucher à stdout.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![deny(unused_must_use)]

pub mod debugger;
pub mod host;
mod modules;
mod native;
mod vm;

pub use debugger::{Breakpoint, Debugger, DebuggerState, Watchpoint};
pub use host::{CaptureHost, DefaultHost, Host};
pub use vm::{Vm, FRAMES_MAX, STACK_MAX};

/// Issue d'une interprétation. Le détail (message, trace de pile) est déjà
/// parti sur stderr au moment où l'erreur remonte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InterpretError {
    #[error("compile error")]
    Compile,
    #[error("runtime error")]
    Runtime,
}

pub type InterpretResult = Result<(), InterpretError>;
