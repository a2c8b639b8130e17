//! host.rs — Sorties du programme interprété
//!
//! `print` n'écrit jamais directement sur stdout : la VM passe par ce trait,
//! l'hôte par défaut écrivant les octets tels quels (un NUL embarqué dans
//! une chaîne ne tronque pas la sortie).

use std::cell::RefCell;
use std::io::Write as _;
use std::rc::Rc;

/// Environnement hôte minimal de la VM.
pub trait Host {
    /// Sortie utilisateur (l'instruction `print`).
    fn print(&mut self, text: &str);
}

/// Hôte par défaut : stdout du processus.
#[derive(Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn print(&mut self, text: &str) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(text.as_bytes());
        let _ = out.flush();
    }
}

/// Hôte de capture : accumule la sortie dans un tampon partagé.
/// Sert aux tests et aux intégrations qui veulent relire la sortie.
#[derive(Default, Clone)]
pub struct CaptureHost {
    buffer: Rc<RefCell<String>>,
}

impl CaptureHost {
    pub fn new() -> CaptureHost {
        CaptureHost::default()
    }

    /// Poignée partagée sur le tampon, à garder avant de céder l'hôte.
    pub fn handle(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.buffer)
    }

    pub fn contents(&self) -> String {
        self.buffer.borrow().clone()
    }
}

impl Host for CaptureHost {
    fn print(&mut self, text: &str) {
        self.buffer.borrow_mut().push_str(text);
    }
}
