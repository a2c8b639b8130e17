//! debugger.rs — Débogueur source intégré à la boucle d'interprétation
//!
//! Machine à états consultée entre deux opcodes (`debugger_tick`) :
//! - `Run`    : ignorer les points d'arrêt ;
//! - `Armed`  : s'arrêter sur la prochaine ligne qui matche un point d'arrêt ;
//! - `Step`   : s'arrêter à la prochaine instruction ;
//! - `Next`   : idem sans descendre dans les appels (step over) ;
//! - `StepOut`: s'arrêter après le prochain `OP_RETURN` ;
//! - `Halt`   : arrêt inconditionnel au prochain tick ;
//! - `Stop`   : fin de session (réservé).
//!
//! À l'arrêt, une petite boucle de commandes façon GDB lit stdin : points
//! d'arrêt conditionnels (la condition est compilée paresseusement via
//! l'eval de la VM et tourne sur l'état vif), points de surveillance,
//! navigation de frames, listings de source, `print` d'expressions.

use std::io::Write as _;

use lox_core::bytecode::Op;
use lox_core::module::ModuleId;
use lox_core::object::ObjRef;

use crate::vm::Vm;
use crate::InterpretResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerState {
    Run,
    Armed,
    Step,
    StepOut,
    Next,
    Halt,
    Stop,
}

/// Un point d'arrêt, identifié par (module, ligne).
pub struct Breakpoint {
    pub module: ModuleId,
    pub line: u32,
    pub enabled: bool,
    pub ignore_count: u32,
    pub hits: u32,
    /// Condition textuelle ; compilée au premier déclenchement.
    pub condition: Option<String>,
    /// Fermeture compilée de la condition — racine GC.
    pub eval_condition: Option<ObjRef>,
    /// Commandes rejouées à chaque déclenchement.
    pub commands: Option<String>,
    pub silence_cmds: bool,
}

impl Breakpoint {
    pub fn new(module: ModuleId, line: u32) -> Breakpoint {
        Breakpoint {
            module,
            line,
            enabled: true,
            ignore_count: 0,
            hits: 0,
            condition: None,
            eval_condition: None,
            commands: None,
            silence_cmds: false,
        }
    }
}

/// Une expression surveillée, évaluée et affichée à chaque arrêt.
pub struct Watchpoint {
    pub expr: String,
}

pub struct Debugger {
    pub state: DebuggerState,
    pub is_halted: bool,
    pub breakpoints: Vec<Breakpoint>,
    pub watchpoints: Vec<Watchpoint>,
    pub(crate) init_commands: Option<String>,
    /// Niveau de pile sélectionné (0 = frame au sommet).
    pub(crate) selected_frame: usize,
    pub(crate) list_line: Option<u32>,
    /// Dernier arrêt (module, ligne) : évite de re-déclencher sur place.
    pub(crate) last_halt: Option<(ModuleId, u32)>,
    /// Profondeur enregistrée par `next` (step over).
    pub(crate) next_depth: usize,
    pub(crate) silent: bool,
}

impl Default for Debugger {
    fn default() -> Self {
        Debugger::new()
    }
}

impl Debugger {
    pub fn new() -> Debugger {
        Debugger {
            state: DebuggerState::Run,
            is_halted: false,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            init_commands: None,
            selected_frame: 0,
            list_line: None,
            last_halt: None,
            next_depth: 0,
            silent: false,
        }
    }

    /// Insère trié par (module, ligne) ; remplace un doublon exact.
    pub fn set_breakpoint(&mut self, breakpoint: Breakpoint) {
        for (i, bp) in self.breakpoints.iter().enumerate() {
            if bp.module == breakpoint.module {
                if bp.line == breakpoint.line {
                    self.breakpoints[i] = breakpoint;
                    return;
                }
                if bp.line > breakpoint.line {
                    self.breakpoints.insert(i, breakpoint);
                    return;
                }
            }
        }
        self.breakpoints.push(breakpoint);
    }

    pub fn set_breakpoint_at(&mut self, line: u32, module: ModuleId) {
        self.set_breakpoint(Breakpoint::new(module, line));
    }

    pub fn get_breakpoint(&self, line: u32, module: ModuleId) -> Option<&Breakpoint> {
        self.breakpoints.iter().find(|bp| bp.module == module && bp.line == line)
    }

    /// Index 1-based, comme l'interface utilisateur.
    pub fn breakpoint_by_index(&mut self, nr: usize) -> Option<&mut Breakpoint> {
        if nr == 0 {
            return None;
        }
        self.breakpoints.get_mut(nr - 1)
    }

    pub fn clear_breakpoint_at(&mut self, line: u32, module: ModuleId) -> bool {
        match self.breakpoints.iter().position(|bp| bp.module == module && bp.line == line) {
            Some(i) => {
                self.breakpoints.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear_breakpoint_by_index(&mut self, nr: usize) -> bool {
        if nr == 0 || nr > self.breakpoints.len() {
            return false;
        }
        self.breakpoints.remove(nr - 1);
        true
    }

    /// Ajoute ou remplace (même expression) un point de surveillance.
    pub fn set_watchpoint(&mut self, expr: &str) {
        if let Some(w) = self.watchpoints.iter_mut().find(|w| w.expr == expr) {
            w.expr = expr.to_string();
            return;
        }
        self.watchpoints.push(Watchpoint { expr: expr.to_string() });
    }

    pub fn clear_watchpoint(&mut self, expr: &str) -> bool {
        match self.watchpoints.iter().position(|w| w.expr == expr) {
            Some(i) => {
                self.watchpoints.remove(i);
                true
            }
            None => false,
        }
    }
}

/* ───────────────────────── curseur de commandes ───────────────────────── */

pub(crate) struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(text: &'a str) -> Cursor<'a> {
        Cursor { bytes: text.as_bytes(), pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn at_line_end(&self) -> bool {
        self.at_end() || self.bytes[self.pos] == b'\n'
    }

    fn peek(&self) -> u8 {
        if self.at_end() {
            0
        } else {
            self.bytes[self.pos]
        }
    }

    fn bump(&mut self) {
        self.pos += 1;
    }

    /// Blancs de la ligne courante (pas les retours à la ligne).
    fn skip_ws(&mut self) {
        while !self.at_line_end() && self.peek().is_ascii_whitespace() {
            self.bump();
        }
    }

    /// Blancs, retours à la ligne compris (entre deux commandes).
    fn skip_all_ws(&mut self) {
        while !self.at_end() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn skip_to_line_end(&mut self) {
        while !self.at_line_end() {
            self.bump();
        }
    }

    fn read_int(&mut self) -> Option<u32> {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_ascii_digit() {
            self.bump();
        }
        if start == self.pos {
            return None;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).ok()?.parse().ok()
    }

    /// Un mot (identifiant de commande), en minuscules.
    fn read_word(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while self.peek().is_ascii_alphanumeric() || self.peek() == b'_' {
            self.bump();
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).to_lowercase()
    }

    /// Un chemin de fichier : jusqu'au `:` ou à la fin de ligne.
    fn read_path(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        while !self.at_line_end() && self.peek() != b':' {
            self.bump();
        }
        String::from_utf8_lossy(&self.bytes[start..self.pos]).trim().to_string()
    }

    /// Le reste de la ligne, consommé.
    fn rest_of_row(&mut self) -> String {
        self.skip_ws();
        let start = self.pos;
        self.skip_to_line_end();
        String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string()
    }

    /// La ligne courante entière, retour à la ligne consommé.
    fn read_line(&mut self) -> String {
        let start = self.pos;
        self.skip_to_line_end();
        let line = String::from_utf8_lossy(&self.bytes[start..self.pos]).to_string();
        if !self.at_end() {
            self.bump();
        }
        line
    }

    /// La ligne courante, sans bouger le curseur.
    fn peek_line(&self) -> String {
        let mut end = self.pos;
        while end < self.bytes.len() && self.bytes[end] != b'\n' {
            end += 1;
        }
        String::from_utf8_lossy(&self.bytes[self.pos..end]).to_string()
    }
}

/* ───────────────────────── aide en ligne ───────────────────────── */

const HELP: &[(&str, &str)] = &[
    ("backtrace", "backtrace       Prints the stacktrace of current state.\nbacktrace nr    Print backtrace, limit to nr.\n"),
    ("bt", "bt              Shorthand for backtrace.\n"),
    ("break", "break           Sets a breakpoint at current line.\nbreak line      Sets a breakpoint at line in current file.\nbreak file:line Sets a breakpoint at line in file.\n"),
    ("b", "b               Shorthand for break.\n"),
    ("clear", "clear           Clears breakpoint at current line.\nclear file:line Clears breakpoint at line in file.\n"),
    ("commands", "commands nr [silent]\n...list of commands\nend\n                Commands run each time breakpoint nr triggers,\n                silent suppresses their output.\n"),
    ("cond", "cond nr expression   Sets a condition that triggers breakpoint.\ncond nr              Clears condition for breakpoint nr.\n"),
    ("continue", "continue        Continues execution until next breakpoint triggers.\n"),
    ("c", "c               Shorthand for continue.\n"),
    ("delete", "delete nr       Deletes breakpoint with nr.\n"),
    ("del", "del nr          Shorthand for delete.\n"),
    ("disable", "disable         Disables all breakpoints.\ndisable nr      Disables breakpoint with nr.\n"),
    ("dis", "dis             Shorthand for disable.\n"),
    ("down", "down            Go down in backtrace.\n"),
    ("echo", "echo string     Prints string, might be multiline if escaped.\n"),
    ("enable", "enable          Enables all breakpoints.\nenable nr       Enables breakpoint with nr.\n"),
    ("en", "en              Shorthand for enable.\n"),
    ("end", "end             Ends a command list for a breakpoint.\n"),
    ("frame", "frame           Select current frame.\nframe nr        Select frame nr in backtrace.\n"),
    ("finish", "finish          Run until current function returns.\n"),
    ("info", "info break      Show breakpoints.\ninfo watch      Show watchpoints.\ninfo frame      Show selected frame.\ninfo locals     Show all locals in current frame.\ninfo globals    Show all globals.\n"),
    ("ignore", "ignore nr hits  Ignore the first number of hits to breakpoint nr.\n"),
    ("list", "list            Show next 10 lines of code.\nlist -          Show previous 10 lines of code.\nlist nr         Show 10 lines surrounding line at nr.\n"),
    ("l", "l               Shorthand for list.\n"),
    ("next", "next            Step forward one, step over function calls.\n"),
    ("n", "n               Shorthand for next.\n"),
    ("print", "print expression    Prints result of expression, might be a variable.\n"),
    ("p", "p expression        Shorthand for print.\n"),
    ("quit", "quit            Exits debugger.\n"),
    ("step", "step            Steps to next pos in code.\n"),
    ("s", "s               Shorthand for step.\n"),
    ("up", "up              Goes up a frame in backtrace.\n"),
    ("watch", "watch expression    A watchpoint that gets evaluated each stop.\n"),
];

/* ───────────────────────── pilotage côté VM ───────────────────────── */

impl Vm {
    pub fn set_debugger_state(&mut self, state: DebuggerState) {
        self.debugger.state = state;
    }

    /// Commandes exécutées au lancement (le fichier du drapeau `-D`).
    pub fn set_init_commands(&mut self, commands: String) {
        self.debugger.init_commands = Some(commands);
    }

    pub(crate) fn debugger_run_init_commands(&mut self) {
        if let Some(commands) = self.debugger.init_commands.clone() {
            self.parse_commands(&commands);
        }
    }

    /// Le tick entre deux opcodes : l'op décodé n'est pas encore exécuté.
    pub(crate) fn debugger_tick(&mut self, op: Op) -> InterpretResult {
        match self.debugger.state {
            DebuggerState::Run | DebuggerState::Stop => Ok(()),
            DebuggerState::StepOut => {
                // se re-signaler après le retour : Halt s'arrête au tick
                // suivant, donc dans l'appelant
                if op == Op::Return {
                    self.debugger.state = DebuggerState::Halt;
                }
                Ok(())
            }
            DebuggerState::Next => {
                if self.frames.len() <= self.debugger.next_depth {
                    self.halt_and_repl()
                } else {
                    Ok(())
                }
            }
            DebuggerState::Armed => self.check_breakpoints(),
            DebuggerState::Step | DebuggerState::Halt => self.halt_and_repl(),
        }
    }

    fn selected_frame_index(&self) -> usize {
        self.frames.len() - 1 - self.debugger.selected_frame.min(self.frames.len() - 1)
    }

    fn selected_module(&self) -> ModuleId {
        let frame = &self.frames[self.selected_frame_index()];
        self.heap.function(frame.function).chunk.module
    }

    fn dbg_print(&self, text: &str) {
        if !self.debugger.silent {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
    }

    fn dbg_err(&self, text: &str) {
        if !self.debugger.silent {
            eprint!("{text}");
        }
    }

    /// Fenêtre de source autour de `baseline`, `*` sur la ligne d'arrêt.
    fn print_source(&mut self, baseline: u32, window: u32) {
        let module = self.selected_module();
        let current = self.frame_line(self.debugger.selected_frame);
        let from = baseline.saturating_sub(window).max(1);
        let to = baseline + window;
        let source = self.modules[module].source.clone();

        let mut out = String::from("\n");
        for (i, line) in source.lines().enumerate() {
            let n = i as u32 + 1;
            if n >= from && n <= to {
                let marker = if n == current { "*" } else { " " };
                out.push_str(&format!("{n:<4}{marker} {line}\n"));
            }
        }
        self.dbg_print(&out);
    }

    fn print_watchpoints(&mut self) {
        let exprs: Vec<String> =
            self.debugger.watchpoints.iter().map(|w| w.expr.clone()).collect();
        for expr in exprs {
            if let Ok(value) = self.eval(&expr) {
                if !value.is_nil() {
                    let rendered = self.heap.value_to_string(value);
                    self.dbg_print(&format!(" {expr}:{rendered}\n"));
                }
            }
        }
    }

    /// État `Armed` : un point d'arrêt (module, ligne) matche-t-il ici ?
    fn check_breakpoints(&mut self) -> InterpretResult {
        let module = self.current_module();
        let line = self.frame_line(0);

        // ne pas re-déclencher tant qu'on n'a pas quitté la ligne d'arrêt
        match self.debugger.last_halt {
            Some(halt) if halt == (module, line) => return Ok(()),
            Some(_) => self.debugger.last_halt = None,
            None => {}
        }

        let index = match self
            .debugger
            .breakpoints
            .iter()
            .position(|bp| bp.module == module && bp.line == line)
        {
            Some(i) => i,
            None => return Ok(()),
        };
        if !self.debugger.breakpoints[index].enabled {
            return Ok(());
        }

        // condition : compilée au premier passage, évaluée sur l'état vif
        if let Some(cond) = self.debugger.breakpoints[index].condition.clone() {
            if self.debugger.breakpoints[index].eval_condition.is_none() {
                match self.eval_build(&cond) {
                    Ok(closure) => {
                        self.pop(); // la racine est désormais le breakpoint
                        self.debugger.breakpoints[index].eval_condition = Some(closure);
                    }
                    Err(_) => {
                        self.dbg_print(&format!(
                            "Breakpoint {} condition invalid.({cond})\n",
                            index + 1
                        ));
                        self.debugger.breakpoints[index].condition = None;
                    }
                }
            }
            if let Some(closure) = self.debugger.breakpoints[index].eval_condition {
                if let Ok(value) = self.eval_run(closure) {
                    if value.is_falsey() {
                        return Ok(());
                    }
                }
            }
        }

        {
            let bp = &mut self.debugger.breakpoints[index];
            bp.hits += 1;
            if bp.hits <= bp.ignore_count {
                return Ok(());
            }
        }

        self.debugger.last_halt = Some((module, line));
        let (name, path) = self.module_display(module);
        self.dbg_print(&format!(
            "\n* stopped at breakpoint {} in {name}\n* file:{path}\n",
            index + 1
        ));
        self.debugger.selected_frame = 0;
        self.print_source(line, 2);

        if let Some(commands) = self.debugger.breakpoints[index].commands.clone() {
            let saved = self.debugger.silent;
            self.debugger.silent = self.debugger.breakpoints[index].silence_cmds;
            self.parse_commands(&commands);
            self.debugger.silent = saved;
        }

        self.halt_and_repl()
    }

    fn module_display(&self, module: ModuleId) -> (String, String) {
        let name = match self.modules[module].name {
            Some(n) => self.heap.str_chars(n.obj).to_string(),
            None => String::from("<module>"),
        };
        let path = match self.modules[module].path {
            Some(p) => self.heap.str_chars(p.obj).to_string(),
            None => name.clone(),
        };
        (name, path)
    }

    /// La boucle de commandes. En sort quand une commande de reprise
    /// (`continue`, `step`, …) désarme `is_halted`, ou sur EOF.
    fn halt_and_repl(&mut self) -> InterpretResult {
        self.debugger.is_halted = true;
        self.debugger.selected_frame = 0;
        self.debugger.list_line = None;
        self.print_watchpoints();

        let mut previous = String::new();
        while self.debugger.is_halted {
            self.dbg_print("**** debugger interface ****\n> ");
            let mut line = String::new();
            match std::io::stdin().read_line(&mut line) {
                Ok(0) | Err(_) => {
                    // stdin fermé : on laisse tourner
                    self.debugger.state = DebuggerState::Run;
                    self.debugger.is_halted = false;
                }
                Ok(_) => {
                    let trimmed = line.trim_end_matches(['\n', '\r']);
                    let text = if trimmed.is_empty() {
                        previous.clone()
                    } else {
                        previous = trimmed.to_string();
                        previous.clone()
                    };
                    self.parse_commands(&text);
                }
            }
        }
        Ok(())
    }

    /* ───────────── l'interpréteur de commandes ───────────── */

    /// Exécute une suite de commandes débogueur, une par ligne,
    /// `#` en commentaire.
    pub fn parse_commands(&mut self, text: &str) {
        let mut cur = Cursor::new(text);
        loop {
            cur.skip_all_ws();
            if cur.at_end() {
                break;
            }
            if cur.peek() == b'#' {
                cur.skip_to_line_end();
                continue;
            }
            let word = cur.read_word();
            match word.as_str() {
                "backtrace" | "bt" => self.cmd_backtrace(&mut cur),
                "break" | "b" => self.cmd_break(&mut cur),
                "clear" => self.cmd_clear(&mut cur),
                "commands" => self.cmd_commands(&mut cur),
                "cond" => self.cmd_cond(&mut cur),
                "continue" | "c" => self.cmd_continue(),
                "delete" | "del" => self.cmd_delete(&mut cur),
                "disable" | "dis" => self.cmd_set_enabled(&mut cur, false),
                "down" => self.cmd_down(),
                "echo" => self.cmd_echo(&mut cur),
                "enable" | "en" => self.cmd_set_enabled(&mut cur, true),
                "end" => {}
                "frame" => self.cmd_frame(&mut cur),
                "finish" => self.cmd_finish(),
                "help" => self.cmd_help(&mut cur),
                "info" => self.cmd_info(&mut cur),
                "ignore" => self.cmd_ignore(&mut cur),
                "list" | "l" => self.cmd_list(&mut cur),
                "next" | "n" => self.cmd_next(),
                "print" | "p" => self.cmd_print(&mut cur),
                "quit" => std::process::exit(0),
                "step" | "s" => self.cmd_step(),
                "up" => self.cmd_up(),
                "watch" => self.cmd_watch(&mut cur),
                _ => {
                    let rest = cur.rest_of_row();
                    self.dbg_err(&format!("***Unrecognized command: '{word}{rest}'\n"));
                }
            }
            cur.skip_to_line_end();
        }
    }

    fn cmd_backtrace(&mut self, cur: &mut Cursor<'_>) {
        if !self.require_frames() {
            return;
        }
        self.dbg_print("backtrace\n");
        let mut limit = self.frames.len();
        if let Some(n) = cur.read_int() {
            if (n as usize) < limit {
                limit = n as usize;
            }
        }
        let mut out = String::new();
        for level in 0..limit {
            let frame = &self.frames[self.frames.len() - 1 - level];
            let function = self.heap.function(frame.function);
            let name = match function.name {
                Some(n) => self.heap.str_chars(n.obj),
                None => "<script>",
            };
            let (_, path) = self.module_display(function.chunk.module);
            let marker = if level == self.debugger.selected_frame { "*" } else { " " };
            out.push_str(&format!(
                "#{level} {marker} {name} at {path}:{}\n",
                self.frame_line(level)
            ));
        }
        self.dbg_print(&out);
    }

    /// Vrai si un frame est actif ; sinon signale et renonce (une commande
    /// de position n'a pas de sens hors exécution).
    fn require_frames(&self) -> bool {
        if self.frames.is_empty() {
            self.dbg_print("No active frame.\n");
            return false;
        }
        true
    }

    /// `[file:]line` optionnels ; par défaut la position d'arrêt courante.
    fn read_line_and_module(&mut self, cur: &mut Cursor<'_>) -> Option<(u32, ModuleId)> {
        if !self.require_frames() {
            return None;
        }
        cur.skip_ws();
        let mut line = self.frame_line(self.debugger.selected_frame.min(self.frames.len() - 1));
        let mut module = self.selected_module();
        if !cur.at_line_end() {
            if cur.peek().is_ascii_alphabetic() || cur.peek() == b'/' || cur.peek() == b'.' {
                let path = cur.read_path();
                if cur.peek() != b':' {
                    self.dbg_print(&format!(
                        "Expected ':' between file and linenr, but got: {}.\n",
                        cur.peek() as char
                    ));
                    return None;
                }
                cur.bump();
                match self.find_module(&path) {
                    Some(m) => module = m,
                    None => {
                        self.dbg_print(&format!("Module with path:{path} not loaded.\n"));
                        return None;
                    }
                }
            }
            if let Some(n) = cur.read_int() {
                line = n;
            }
        }
        Some((line, module))
    }

    fn cmd_break(&mut self, cur: &mut Cursor<'_>) {
        if let Some((line, module)) = self.read_line_and_module(cur) {
            self.debugger.set_breakpoint_at(line, module);
            let (_, path) = self.module_display(module);
            self.dbg_print(&format!("Set breakpoint at {path}:{line}\n"));
        }
    }

    fn cmd_clear(&mut self, cur: &mut Cursor<'_>) {
        if let Some((line, module)) = self.read_line_and_module(cur) {
            let (_, path) = self.module_display(module);
            if self.debugger.clear_breakpoint_at(line, module) {
                self.dbg_print(&format!("Cleared breakpoint at {path}:{line}\n"));
            } else {
                self.dbg_print(&format!("Breakpoint not found, {path}:{line}\n"));
            }
        }
    }

    /// `commands nr [silent] … end` : mémorise le bloc pour le point d'arrêt.
    fn cmd_commands(&mut self, cur: &mut Cursor<'_>) {
        let nr = match cur.read_int() {
            Some(n) => n as usize,
            None => {
                self.dbg_err("Expects a breakpoint nr.\n");
                return;
            }
        };
        if self.debugger.breakpoint_by_index(nr).is_none() {
            self.dbg_err(&format!("Breakpoint {nr} not found\n"));
            return;
        }

        cur.skip_ws();
        let silent = {
            let word = cur.read_word();
            word == "silent"
        };
        cur.skip_to_line_end();
        if !cur.at_end() {
            cur.bump();
        }

        let mut body = String::new();
        let mut found_end = false;
        while !cur.at_end() {
            let line = cur.peek_line();
            if line.trim() == "end" {
                // ne consomme que jusqu'au bout de la ligne `end` : le
                // retour à la ligne reste pour la boucle de commandes
                cur.skip_to_line_end();
                found_end = true;
                break;
            }
            cur.read_line();
            body.push_str(&line);
            body.push('\n');
        }
        if !found_end {
            self.dbg_err("End not found in commands list.\n");
            return;
        }

        if let Some(bp) = self.debugger.breakpoint_by_index(nr) {
            bp.commands = Some(body);
            bp.silence_cmds = silent;
        }
    }

    fn cmd_cond(&mut self, cur: &mut Cursor<'_>) {
        let nr = match cur.read_int() {
            Some(n) => n as usize,
            None => {
                self.dbg_print("Expect breakpoint nr after 'cond'.\n");
                return;
            }
        };
        if self.debugger.breakpoint_by_index(nr).is_none() {
            self.dbg_print(&format!("Breakpoint {nr} not found.\n"));
            return;
        }

        cur.skip_ws();
        let expr = cur.rest_of_row();
        let (module, line) = {
            let bp = self.debugger.breakpoint_by_index(nr).expect("vérifié");
            bp.eval_condition = None;
            if expr.is_empty() {
                bp.condition = None;
            } else {
                bp.condition = Some(expr.clone());
            }
            (bp.module, bp.line)
        };
        let (_, path) = self.module_display(module);
        if expr.is_empty() {
            self.dbg_print(&format!("Cleared condition for breakpoint {nr} at {path}:{line}.\n"));
        } else {
            self.dbg_print(&format!("condition {expr} set for breakpoint {nr} at {path}:{line}\n"));
        }
    }

    fn cmd_continue(&mut self) {
        self.debugger.state = DebuggerState::Armed;
        self.debugger.is_halted = false;
    }

    fn cmd_delete(&mut self, cur: &mut Cursor<'_>) {
        match cur.read_int() {
            Some(nr) => {
                if self.debugger.clear_breakpoint_by_index(nr as usize) {
                    self.dbg_print("Deleted breakpoint.\n");
                } else {
                    self.dbg_print(&format!("Breakpoint {nr} not found.\n"));
                }
            }
            None => self.dbg_print("Expects breakpoint nr after delete command.\n"),
        }
    }

    fn cmd_set_enabled(&mut self, cur: &mut Cursor<'_>, enabled: bool) {
        match cur.read_int() {
            Some(nr) => match self.debugger.breakpoint_by_index(nr as usize) {
                Some(bp) => {
                    bp.enabled = enabled;
                    self.dbg_print(&format!(
                        "Breakpoint {nr} {}.\n",
                        if enabled { "enabled" } else { "disabled" }
                    ));
                }
                None => self.dbg_print(&format!("Breakpoint {nr} not found.\n")),
            },
            None => {
                for bp in &mut self.debugger.breakpoints {
                    bp.enabled = enabled;
                }
            }
        }
    }

    fn cmd_up(&mut self) {
        let level = self.debugger.selected_frame;
        let new_level = if level + 1 < self.frames.len() { level + 1 } else { level };
        self.dbg_print(&format!("up to frame #{new_level}\n"));
        self.debugger.selected_frame = new_level;
        self.debugger.list_line = None;
    }

    fn cmd_down(&mut self) {
        let level = self.debugger.selected_frame.saturating_sub(1);
        self.dbg_print(&format!("down to frame #{level}\n"));
        self.debugger.selected_frame = level;
        self.debugger.list_line = None;
    }

    fn cmd_frame(&mut self, cur: &mut Cursor<'_>) {
        let level = cur.read_int().unwrap_or(0) as usize;
        if level >= self.frames.len() {
            self.dbg_print("Invalid frame nr.\n");
            return;
        }
        self.dbg_print(&format!("Select frame {level}\n"));
        self.debugger.selected_frame = level;
        self.debugger.list_line = None;
    }

    fn cmd_finish(&mut self) {
        self.debugger.is_halted = false;
        self.debugger.state = DebuggerState::StepOut;
    }

    fn cmd_echo(&mut self, cur: &mut Cursor<'_>) {
        let row = cur.rest_of_row();
        let mut out = String::new();
        let mut chars = row.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                match chars.next() {
                    Some('n') => out.push('\n'),
                    Some(other) => out.push(other),
                    None => {}
                }
            } else {
                out.push(c);
            }
        }
        self.dbg_print(&out);
    }

    fn cmd_help(&mut self, cur: &mut Cursor<'_>) {
        cur.skip_ws();
        if cur.at_line_end() {
            let mut out = String::new();
            for (_, msg) in HELP {
                out.push('\n');
                out.push_str(msg);
            }
            self.dbg_print(&out);
            return;
        }
        let topic = cur.read_word();
        match HELP.iter().find(|(name, _)| *name == topic) {
            Some((_, msg)) => self.dbg_print(msg),
            None => self.dbg_print(&format!("Unrecognized command to help {topic}\n")),
        }
    }

    fn cmd_ignore(&mut self, cur: &mut Cursor<'_>) {
        let nr = match cur.read_int() {
            Some(n) => n as usize,
            None => {
                self.dbg_print("Expect breakpoint nr after ignore cmd\n");
                return;
            }
        };
        let hits = match cur.read_int() {
            Some(n) => n,
            None => {
                self.dbg_print("Expect ignore count after breakpoint nr.\n");
                return;
            }
        };
        if let Some(bp) = self.debugger.breakpoint_by_index(nr) {
            bp.ignore_count = hits;
        }
    }

    fn cmd_info(&mut self, cur: &mut Cursor<'_>) {
        let what = cur.read_word();
        match what.as_str() {
            "break" => self.info_breakpoints(),
            "watch" => self.info_watchpoints(),
            "frame" => self.info_frame(),
            "locals" => self.info_locals(),
            "globals" => self.info_globals(),
            other => self.dbg_print(&format!("Unrecognized info cmd {other}\n")),
        }
    }

    fn info_breakpoints(&mut self) {
        let mut out = String::from("breakpoint info\n");
        for (i, bp) in self.debugger.breakpoints.iter().enumerate() {
            let (_, path) = self.module_display(bp.module);
            out.push_str(&format!("[{}] breakpoint at {path}:{}\n", i + 1, bp.line));
            out.push_str(&format!(
                "      hits:{} ignoreCount:{} enabled:{}\n",
                bp.hits, bp.ignore_count, bp.enabled as u8
            ));
            if let Some(cond) = &bp.condition {
                out.push_str(&format!("      condition:{cond}\n"));
            }
        }
        self.dbg_print(&out);
    }

    fn info_watchpoints(&mut self) {
        let mut out = String::from("watchpoint info\n");
        for (i, w) in self.debugger.watchpoints.iter().enumerate() {
            out.push_str(&format!("[{}] watchpoint expr:{}\n", i + 1, w.expr));
        }
        self.dbg_print(&out);
    }

    fn info_frame(&mut self) {
        if !self.require_frames() {
            return;
        }
        let frame = &self.frames[self.selected_frame_index()];
        let function = self.heap.function(frame.function);
        let name = match function.name {
            Some(n) => self.heap.str_chars(n.obj).to_string(),
            None => String::from("<script>"),
        };
        let (mod_name, path) = self.module_display(function.chunk.module);
        let line = self.frame_line(self.debugger.selected_frame);
        self.dbg_print(&format!(
            "info frame\nStack level #{} frame '{name}' in module '{mod_name}'\n at '{path}'\n at line:{line}\n",
            self.debugger.selected_frame
        ));
    }

    /// Locaux du frame sélectionné (noms depuis les métadonnées de
    /// compilation) + upvalues de sa fermeture, triés par nom.
    fn info_locals(&mut self) {
        if !self.require_frames() {
            return;
        }
        let index = self.selected_frame_index();
        let frame = self.frames[index];
        let mut pairs: Vec<(String, lox_core::value::Value)> = Vec::new();

        let local_count = self.heap.function(frame.function).meta.locals.len();
        for i in 0..local_count {
            let local = &self.heap.function(frame.function).meta.locals[i];
            if local.name.is_empty() {
                continue;
            }
            let name = local.name.clone();
            if frame.base + i < self.stack.len() {
                pairs.push((name, self.stack[frame.base + i]));
            }
        }

        let upvalue_count = self.heap.closure(frame.closure).upvalues.len();
        for i in 0..upvalue_count {
            let name = match lox_compiler::upvalue_local(&self.heap, frame.function, i) {
                Some(local) if !local.name.is_empty() => local.name,
                _ => continue,
            };
            if let Some(Some(u)) = self.heap.closure(frame.closure).upvalues.get(i).copied() {
                pairs.push((name, self.upvalue_value(u)));
            }
        }

        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = String::from("info locals\n");
        for (name, value) in pairs {
            out.push_str(&format!(
                "[{}] {name:>12} = {}\n",
                self.heap.type_of(value),
                self.heap.value_to_string(value)
            ));
        }
        self.dbg_print(&out);
    }

    fn info_globals(&mut self) {
        let mut pairs: Vec<(String, lox_core::value::Value)> = self
            .globals
            .iter()
            .map(|(k, v)| (self.heap.str_chars(k.obj).to_string(), v))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = String::from("info globals\n");
        for (name, value) in pairs {
            out.push_str(&format!(
                "[{:<12}] {name}:{}\n",
                self.heap.type_of(value),
                self.heap.value_to_string(value)
            ));
        }
        self.dbg_print(&out);
    }

    /// Fenêtres de 10 lignes, `-` pour reculer, `nr` pour recentrer.
    fn cmd_list(&mut self, cur: &mut Cursor<'_>) {
        if !self.require_frames() {
            return;
        }
        cur.skip_ws();
        let current = self.frame_line(self.debugger.selected_frame.min(self.frames.len() - 1));
        let mut line = match self.debugger.list_line {
            None => current + 5,
            Some(l) => l + 10,
        };
        if cur.peek() == b'-' {
            cur.bump();
            line = if line > 21 { line - 20 } else { 1 };
        } else if let Some(n) = cur.read_int() {
            line = n;
        }
        self.debugger.list_line = Some(line);
        self.print_source(line, 5);
    }

    fn cmd_next(&mut self) {
        self.debugger.next_depth = self.frames.len();
        self.debugger.state = DebuggerState::Next;
        self.debugger.is_halted = false;
    }

    fn cmd_step(&mut self) {
        self.debugger.state = DebuggerState::Step;
        self.debugger.is_halted = false;
    }

    fn cmd_print(&mut self, cur: &mut Cursor<'_>) {
        let expr = cur.rest_of_row();
        if expr.is_empty() {
            self.dbg_print("Expect a expression as param to print.\n");
            return;
        }
        let value = self.eval(&expr).unwrap_or(lox_core::value::Value::NIL);
        let rendered = self.heap.value_to_string(value);
        // toujours affiché, même en mode silencieux
        println!("print ({expr}) = {rendered}");
    }

    fn cmd_watch(&mut self, cur: &mut Cursor<'_>) {
        let expr = cur.rest_of_row();
        if expr.is_empty() {
            self.dbg_print("Expect a expression as param to watch.\n");
            return;
        }
        self.dbg_print(&format!("Setting watch {expr}\n"));
        self.debugger.set_watchpoint(&expr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breakpoints_sorted_and_replaced() {
        let mut d = Debugger::new();
        d.set_breakpoint_at(10, 0);
        d.set_breakpoint_at(3, 0);
        d.set_breakpoint_at(7, 0);
        let lines: Vec<u32> = d.breakpoints.iter().map(|b| b.line).collect();
        assert_eq!(lines, vec![3, 7, 10]);

        // même (module, ligne) : remplacement, pas de doublon
        let mut again = Breakpoint::new(0, 7);
        again.ignore_count = 5;
        d.set_breakpoint(again);
        assert_eq!(d.breakpoints.len(), 3);
        assert_eq!(d.get_breakpoint(7, 0).map(|b| b.ignore_count), Some(5));
    }

    #[test]
    fn breakpoint_index_is_one_based() {
        let mut d = Debugger::new();
        d.set_breakpoint_at(1, 0);
        d.set_breakpoint_at(2, 0);
        assert!(d.breakpoint_by_index(0).is_none());
        assert_eq!(d.breakpoint_by_index(1).map(|b| b.line), Some(1));
        assert_eq!(d.breakpoint_by_index(2).map(|b| b.line), Some(2));
        assert!(d.breakpoint_by_index(3).is_none());
        assert!(d.clear_breakpoint_by_index(1));
        assert_eq!(d.breakpoints.len(), 1);
    }

    #[test]
    fn breakpoints_by_module_are_independent() {
        let mut d = Debugger::new();
        d.set_breakpoint_at(4, 0);
        d.set_breakpoint_at(4, 1);
        assert_eq!(d.breakpoints.len(), 2);
        assert!(d.clear_breakpoint_at(4, 0));
        assert!(!d.clear_breakpoint_at(4, 0));
        assert!(d.get_breakpoint(4, 1).is_some());
    }

    #[test]
    fn watchpoints_deduplicate_by_expression() {
        let mut d = Debugger::new();
        d.set_watchpoint("a + 1");
        d.set_watchpoint("b");
        d.set_watchpoint("a + 1");
        assert_eq!(d.watchpoints.len(), 2);
        assert!(d.clear_watchpoint("b"));
        assert!(!d.clear_watchpoint("b"));
    }

    #[test]
    fn cursor_reads_words_ints_and_paths() {
        let mut cur = Cursor::new("break lib.lox:42 extra");
        assert_eq!(cur.read_word(), "break");
        let path = cur.read_path();
        assert_eq!(path, "lib.lox");
        assert_eq!(cur.peek(), b':');
        cur.bump();
        assert_eq!(cur.read_int(), Some(42));
        assert_eq!(cur.rest_of_row(), "extra");
    }

    #[test]
    fn cursor_stops_at_line_end() {
        let mut cur = Cursor::new("cond 2 a == 1\nnext");
        assert_eq!(cur.read_word(), "cond");
        assert_eq!(cur.read_int(), Some(2));
        assert_eq!(cur.rest_of_row(), "a == 1");
        cur.skip_all_ws();
        assert_eq!(cur.read_word(), "next");
    }
}
