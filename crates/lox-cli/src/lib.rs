//! lox-cli — Le driver en ligne de commande
//!
//! `lox [drapeaux] fichier…` exécute chaque fichier comme module `__main__` ;
//! sans fichier, ouvre le REPL. Codes de sortie hérités de la tradition
//! sysexits : 65 erreur de compilation, 70 erreur d'exécution (ou fichier
//! introuvable), 74 fichier de commandes débogueur illisible, 0 sinon.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]

use std::io::{BufRead as _, Write as _};
use std::process::ExitCode;

use anyhow::Result;
use camino::Utf8PathBuf;
use clap::Parser;

use lox_core::scanner::KEYWORDS;
use lox_vm::{DebuggerState, InterpretError, Vm};

/// Implémentation du langage Lox (modules, tableaux, dicts, débogueur).
#[derive(Parser, Debug)]
#[command(name = "lox", disable_version_flag = true)]
struct Cli {
    /// Démarre arrêté dans le débogueur
    #[arg(short = 'd')]
    debug: bool,

    /// Démarre arrêté et exécute les commandes débogueur de FICHIER
    #[arg(short = 'D', value_name = "FICHIER")]
    debug_commands: Option<Utf8PathBuf>,

    /// Affiche la version
    #[arg(short = 'v')]
    version: bool,

    /// Scripts à exécuter ; REPL interactif si absent
    files: Vec<Utf8PathBuf>,
}

pub fn run() -> Result<ExitCode> {
    let cli = Cli::parse();

    if cli.version {
        println!("lox version {}", env!("CARGO_PKG_VERSION"));
        return Ok(ExitCode::SUCCESS);
    }

    if cli.files.is_empty() {
        repl();
        return Ok(ExitCode::SUCCESS);
    }

    let mut init_state = DebuggerState::Run;
    let mut init_commands: Option<String> = None;
    if let Some(path) = &cli.debug_commands {
        match std::fs::read_to_string(path) {
            Ok(commands) => {
                init_commands = Some(commands);
                init_state = DebuggerState::Halt;
            }
            Err(_) => {
                eprintln!("***Debugger commands file not found {path}.");
                return Ok(ExitCode::from(74));
            }
        }
    } else if cli.debug {
        init_state = DebuggerState::Halt;
    }

    for file in &cli.files {
        let mut vm = Vm::new();
        vm.set_debugger_state(init_state);
        if let Some(commands) = &init_commands {
            vm.set_init_commands(commands.clone());
        }
        log::debug!("exécution de {file}");
        match vm.run_file(file.as_str()) {
            Ok(()) => {}
            Err(InterpretError::Compile) => return Ok(ExitCode::from(65)),
            Err(InterpretError::Runtime) => return Ok(ExitCode::from(70)),
        }
    }

    Ok(ExitCode::SUCCESS)
}

/// Lit-compile-exécute en boucle dans un module `__main__` partagé.
/// Chaque ligne est un script : les globales natives persistent, les
/// variables d'une ligne ne survivent pas à la suivante.
fn repl() {
    let mut vm = Vm::new();
    let module = vm.create_module("__main__", None);

    let stdin = std::io::stdin();
    loop {
        print!("> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if line.trim().is_empty() {
                    continue;
                }
                // l'erreur est déjà rapportée sur stderr ; le REPL continue
                let _ = vm.interpret_source(module, &line);
            }
        }
    }
}

/// Candidats de complétion du REPL : mots-clés puis globales connues.
/// Exposé pour qu'un éditeur de ligne hôte puisse s'y brancher.
pub fn completion_candidates(vm: &Vm, prefix: &str) -> Vec<String> {
    let mut out: Vec<String> = KEYWORDS
        .iter()
        .filter(|k| k.starts_with(prefix))
        .map(|k| k.to_string())
        .collect();
    for name in vm.global_names() {
        if name.starts_with(prefix) && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flags_parse() {
        let cli = Cli::parse_from(["lox", "-d", "script.lox"]);
        assert!(cli.debug);
        assert_eq!(cli.files.len(), 1);

        let cli = Cli::parse_from(["lox", "-D", "cmds.txt", "a.lox", "b.lox"]);
        assert_eq!(cli.debug_commands.as_deref().map(|p| p.as_str()), Some("cmds.txt"));
        assert_eq!(cli.files.len(), 2);

        let cli = Cli::parse_from(["lox", "-v"]);
        assert!(cli.version);
        assert!(cli.files.is_empty());
    }

    #[test]
    fn completion_mixes_keywords_and_globals() {
        let vm = Vm::new();
        let candidates = completion_candidates(&vm, "c");
        assert!(candidates.contains(&"class".to_string()));
        assert!(candidates.contains(&"continue".to_string()));
        assert!(candidates.contains(&"clock".to_string()));
        assert!(!candidates.contains(&"var".to_string()));
    }
}
