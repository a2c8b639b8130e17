//! lox-cli/src/main.rs
//!
//! Point d'entrée du binaire `lox`.
//! On prépare l'environnement (rapports d'erreurs, logs) puis on délègue
//! toute la logique à `lox_cli::run()` — qui reste testable en unité.

use std::process::ExitCode;

fn main() -> ExitCode {
    if let Err(e) = color_eyre::install() {
        eprintln!("Impossible d'initialiser color-eyre: {e}");
    }

    // logs activés via RUST_LOG (gc, chargement de modules, trace d'exécution)
    env_logger::init();

    match lox_cli::run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Erreur: {err}");
            ExitCode::FAILURE
        }
    }
}
