//! compiler.rs — Parseur Pratt et émission de bytecode
//!
//! (*grammaire*)
//! ```text
//! program        -> declaration* EOF ;
//! declaration    -> classDecl | funDecl | varDecl | exportDecl | statement ;
//! statement      -> exprStmt | forStmt | ifStmt | printStmt | returnStmt
//!                 | whileStmt | importStmt | breakStmt | continueStmt | block ;
//! importStmt     -> "import" "{" importParam ("," importParam)* "}"
//!                   "from" STRING ";" ;
//! importParam    -> IDENTIFIER ("as" IDENTIFIER)? ;
//! exportDecl     -> "export" ( "{" IDENTIFIER ("," IDENTIFIER)* "}" ";"?
//!                 | funDecl | classDecl | IDENTIFIER ";" ) ;
//! expression     -> assignment ;
//! assignment     -> (call ".")? IDENTIFIER ("="|"+="|"-="|"*="|"/=") assignment
//!                 | logic_or ;
//! call           -> primary ( "(" arguments? ")" | "." IDENTIFIER | "[" expression "]" )* ;
//! primary        -> "true" | "false" | "nil" | NUMBER | STRING | IDENTIFIER
//!                 | "(" expression ")" | "[" … "]" | "{" … "}"
//!                 | "super" "." IDENTIFIER | "this" ;
//! ```
//!
//! Une passe, pas d'AST : chaque règle émet directement dans le chunk de la
//! fonction en cours. La pile d'états (`FnState`) matérialise la chaîne des
//! compilateurs imbriqués ; les métadonnées (locaux, upvalues, englobant)
//! sont recopiées dans l'`ObjFunction` fini pour la VM et le débogueur.

use lox_core::bytecode::{disassemble_chunk, Chunk, Op};
use lox_core::heap::Heap;
use lox_core::module::{Module, ModuleId};
use lox_core::object::{FnMeta, LocalVar, ObjFunction, ObjPayload, ObjRef, ObjReference, UpvalueDesc};
use lox_core::scanner::{Scanner, Token, TokenKind};
use lox_core::table::Table;
use lox_core::value::Value;

use crate::{upvalue_by_name, CompileError, Diagnostic, FunctionType};

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;

/// Compile `source` comme script racine de `module`.
///
/// La collecte est coupée le temps de la passe (les objets en cours
/// d'assemblage — fonctions, constantes — ne sont pas encore tous
/// joignables). Les exports sont enregistrés *cassés* dans
/// `module.exports` ; `OP_EXPORT` les rendra vivants à l'exécution.
pub fn compile(
    source: &str,
    heap: &mut Heap,
    globals: &Table,
    module: &mut Module,
    module_id: ModuleId,
) -> Result<ObjRef, CompileError> {
    let was_enabled = heap.set_gc_enabled(false);
    let mut c = Compiler::new(source, heap, globals, module, module_id);
    c.init_state(FunctionType::Script);
    c.advance();
    while !c.matches(TokenKind::Eof) {
        c.declaration();
    }
    let (function, _) = c.end_compiler();
    let result = c.finish(function);
    heap.set_gc_enabled(was_enabled);
    result
}

/// Compile une expression à évaluer dans un frame vivant (débogueur).
///
/// Le slot 0 n'est pas réservé ; la résolution des noms continue dans les
/// métadonnées de `frame_function` (locaux du frame, upvalues existants) et
/// le code se termine par `OP_EVAL_EXIT` au lieu d'un retour.
pub fn compile_eval(
    source: &str,
    heap: &mut Heap,
    globals: &Table,
    module: &mut Module,
    module_id: ModuleId,
    frame_function: ObjRef,
) -> Result<ObjRef, CompileError> {
    let was_enabled = heap.set_gc_enabled(false);
    let mut c = Compiler::new(source, heap, globals, module, module_id);
    c.eval_frame = Some(frame_function);
    c.init_state(FunctionType::Eval);
    c.advance();
    while !c.matches(TokenKind::Eof) {
        c.expression();
    }
    c.emit_op(Op::EvalExit);
    let (function, _) = c.end_compiler();
    let result = c.finish(function);
    heap.set_gc_enabled(was_enabled);
    result
}

/* ───────────────────────── États internes ───────────────────────── */

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . () []
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

/// Précédence infixe d'un token (NONE = pas d'infixe).
fn infix_precedence(kind: TokenKind) -> Precedence {
    match kind {
        TokenKind::LeftParen | TokenKind::Dot | TokenKind::LeftBracket => Precedence::Call,
        TokenKind::Minus | TokenKind::Plus => Precedence::Term,
        TokenKind::Slash | TokenKind::Star => Precedence::Factor,
        TokenKind::BangEqual | TokenKind::EqualEqual => Precedence::Equality,
        TokenKind::Greater
        | TokenKind::GreaterEqual
        | TokenKind::Less
        | TokenKind::LessEqual => Precedence::Comparison,
        TokenKind::And => Precedence::And,
        TokenKind::Or => Precedence::Or,
        _ => Precedence::None,
    }
}

struct Parser<'s> {
    current: Token<'s>,
    previous: Token<'s>,
    pre_previous: Token<'s>,
}

#[derive(Clone, Copy)]
struct Local<'s> {
    name: &'s str,
    depth: i32,
    is_captured: bool,
    is_reference: bool,
}

#[derive(Default)]
struct LoopState {
    break_patches: Vec<usize>,
    continue_patches: Vec<usize>,
}

/// Un compilateur de fonction : un par fonction imbriquée, empilés.
struct FnState<'s> {
    function: ObjRef,
    fn_type: FunctionType,
    locals: Vec<Local<'s>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    loops: Vec<LoopState>,
    last_op: Option<Op>,
}

struct ClassState {
    has_superclass: bool,
}

struct Compiler<'s, 'c> {
    scanner: Scanner<'s>,
    parser: Parser<'s>,
    heap: &'c mut Heap,
    globals: &'c Table,
    module: &'c mut Module,
    module_id: ModuleId,
    states: Vec<FnState<'s>>,
    classes: Vec<ClassState>,
    eval_frame: Option<ObjRef>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'s, 'c> Compiler<'s, 'c> {
    fn new(
        source: &'s str,
        heap: &'c mut Heap,
        globals: &'c Table,
        module: &'c mut Module,
        module_id: ModuleId,
    ) -> Compiler<'s, 'c> {
        let eof = Token { kind: TokenKind::Eof, lexeme: "", line: 0 };
        Compiler {
            scanner: Scanner::new(source),
            parser: Parser { current: eof, previous: eof, pre_previous: eof },
            heap,
            globals,
            module,
            module_id,
            states: Vec::new(),
            classes: Vec::new(),
            eval_frame: None,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        }
    }

    fn finish(self, function: ObjRef) -> Result<ObjRef, CompileError> {
        if self.had_error {
            Err(CompileError { diagnostics: self.diagnostics })
        } else {
            Ok(function)
        }
    }

    /* ───────────── erreurs ───────────── */

    fn error_at(&mut self, token: Token<'s>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        let lexeme = match token.kind {
            TokenKind::Eof => None,
            TokenKind::Error => Some(String::new()),
            _ => Some(token.lexeme.to_string()),
        };
        let diag = Diagnostic { line: token.line, lexeme, message: message.to_string() };
        log::debug!("{diag}");
        self.diagnostics.push(diag);
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.parser.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.parser.current, message);
    }

    /* ───────────── curseur de tokens ───────────── */

    fn advance(&mut self) {
        self.parser.pre_previous = self.parser.previous;
        self.parser.previous = self.parser.current;
        loop {
            self.parser.current = self.scanner.scan_token();
            if self.parser.current.kind != TokenKind::Error {
                break;
            }
            let msg = self.parser.current.lexeme;
            self.error_at_current(msg);
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.parser.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.parser.current.kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    /* ───────────── émission ───────────── */

    fn cur(&self) -> &FnState<'s> {
        self.states.last().expect("pile de compilation vide")
    }

    fn cur_mut(&mut self) -> &mut FnState<'s> {
        self.states.last_mut().expect("pile de compilation vide")
    }

    fn chunk(&self) -> &Chunk {
        &self.heap.function(self.cur().function).chunk
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        let f = self.cur().function;
        &mut self.heap.function_mut(f).chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line;
        self.chunk_mut().write(byte, line);
    }

    fn emit_op(&mut self, op: Op) {
        let line = self.parser.previous.line;
        self.chunk_mut().write_op(op, line);
        self.cur_mut().last_op = Some(op);
    }

    fn emit_op_byte(&mut self, op: Op, byte: u8) {
        self.emit_op(op);
        self.emit_byte(byte);
    }

    /// Émet un saut avant avec placeholder ; renvoie l'offset à patcher.
    fn emit_jump(&mut self, op: Op) -> usize {
        self.emit_op(op);
        self.emit_byte(0xFF);
        self.emit_byte(0xFF);
        self.chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 : l'offset lui-même occupe deux octets
        let jump = self.chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        self.chunk_mut().patch(offset, ((jump >> 8) & 0xFF) as u8);
        self.chunk_mut().patch(offset + 1, (jump & 0xFF) as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(Op::Loop);
        let offset = self.chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xFF) as u8);
        self.emit_byte((offset & 0xFF) as u8);
    }

    /// Patche les `break`/`continue` d'une boucle vers `target`, en
    /// ré-encodant en `OP_LOOP` quand la cible est derrière.
    fn patch_loop_jumps(&mut self, patches: Vec<usize>, target: usize) {
        for patch_pos in patches {
            let jump;
            if target < patch_pos {
                self.chunk_mut().patch(patch_pos - 1, Op::Loop.as_byte());
                jump = patch_pos - target + 2;
            } else {
                jump = target - patch_pos - 2;
            }
            if jump > u16::MAX as usize {
                self.error("Too much code to jump over.");
            }
            self.chunk_mut().patch(patch_pos, ((jump >> 8) & 0xFF) as u8);
            self.chunk_mut().patch(patch_pos + 1, (jump & 0xFF) as u8);
        }
    }

    fn emit_nil_return(&mut self) {
        if self.cur().fn_type == FunctionType::Initializer {
            self.emit_op_byte(Op::GetLocal, 0);
        } else {
            self.emit_op(Op::Nil);
        }
        self.emit_op(Op::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.chunk_mut().add_constant(value);
        if index > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let v = self.heap.intern_value(name);
        self.make_constant(v)
    }

    /* ───────────── états de fonction ───────────── */

    fn init_state(&mut self, fn_type: FunctionType) {
        let name = match fn_type {
            FunctionType::Script | FunctionType::Eval => None,
            _ => Some(self.heap.intern(self.parser.previous.lexeme)),
        };
        let function = self.heap.alloc(ObjPayload::Function(ObjFunction {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(self.module_id),
            name,
            meta: FnMeta::default(),
        }));
        self.heap.temp_roots.push(Value::object(function));

        let mut state = FnState {
            function,
            fn_type,
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            loops: Vec::new(),
            last_op: None,
        };
        if fn_type != FunctionType::Eval {
            // slot 0 : `this` pour les méthodes, réservé vide sinon
            let slot0 = match fn_type {
                FunctionType::Method | FunctionType::Initializer => "this",
                _ => "",
            };
            state.locals.push(Local {
                name: slot0,
                depth: 0,
                is_captured: false,
                is_reference: false,
            });
        }
        self.states.push(state);
    }

    /// Clôt la fonction courante : retour implicite, métadonnées recopiées
    /// dans l'objet fonction, état dépilé. Renvoie (fonction, upvalues) pour
    /// que l'appelant émette `OP_CLOSURE` et ses paires.
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        if self.cur().fn_type != FunctionType::Eval && self.cur().last_op != Some(Op::Return) {
            self.emit_nil_return();
        }

        let state = self.states.pop().expect("pile de compilation vide");
        let enclosing = if state.fn_type == FunctionType::Eval {
            self.eval_frame
        } else {
            self.states.last().map(|s| s.function)
        };

        let locals: Vec<LocalVar> = state
            .locals
            .iter()
            .map(|l| LocalVar {
                name: l.name.to_string(),
                depth: l.depth,
                is_captured: l.is_captured,
                is_reference: l.is_reference,
            })
            .collect();

        let f = self.heap.function_mut(state.function);
        f.upvalue_count = state.upvalues.len();
        f.meta.locals = locals;
        f.meta.upvalues = state.upvalues.clone();
        f.meta.enclosing = enclosing;

        self.heap.temp_roots.pop();

        if log::log_enabled!(log::Level::Trace) && !self.had_error {
            let fun = self.heap.function(state.function);
            let title = match fun.name {
                Some(n) => self.heap.str_chars(n.obj).to_string(),
                None => "<script>".to_string(),
            };
            log::trace!("{}", disassemble_chunk(self.heap, &fun.chunk, &title));
        }

        (state.function, state.upvalues)
    }

    fn begin_scope(&mut self) {
        self.cur_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.cur_mut().scope_depth -= 1;
        loop {
            let pop_op = {
                let state = self.cur();
                match state.locals.last() {
                    Some(l) if l.depth > state.scope_depth => {
                        if l.is_captured {
                            Op::CloseUpvalue
                        } else {
                            Op::Pop
                        }
                    }
                    _ => break,
                }
            };
            self.emit_op(pop_op);
            self.cur_mut().locals.pop();
        }
    }

    /* ───────────── variables ───────────── */

    fn add_local(&mut self, name: &'s str, is_reference: bool) {
        if self.cur().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.cur_mut().locals.push(Local { name, depth: -1, is_captured: false, is_reference });
    }

    fn declare_variable(&mut self, is_reference: bool) {
        let name = self.parser.previous;
        let duplicate = {
            let state = self.cur();
            let mut found = false;
            for local in state.locals.iter().rev() {
                if local.depth != -1 && local.depth < state.scope_depth {
                    break;
                }
                if local.name == name.lexeme {
                    found = true;
                    break;
                }
            }
            found
        };
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name.lexeme, is_reference);
    }

    fn mark_initialized(&mut self) {
        let depth = self.cur().scope_depth;
        if let Some(l) = self.cur_mut().locals.last_mut() {
            l.depth = depth;
        }
    }

    /// `var x` / paramètre / alias d'import : déclare et rend la constante
    /// du nom (sert aux imports).
    fn parse_variable(&mut self, message: &str, is_reference: bool) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable(is_reference);
        self.identifier_constant(self.parser.previous.lexeme)
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let found = {
            let state = &self.states[state_idx];
            state
                .locals
                .iter()
                .rposition(|l| l.name == name)
                .inspect(|&i| uninitialized = state.locals[i].depth == -1)
        };
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found.map(|i| i as u8)
    }

    fn add_upvalue(&mut self, state_idx: usize, desc: UpvalueDesc) -> u8 {
        if let Some(i) = self.states[state_idx].upvalues.iter().position(|u| *u == desc) {
            return i as u8;
        }
        if self.states[state_idx].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.states[state_idx].upvalues.push(desc);
        (self.states[state_idx].upvalues.len() - 1) as u8
    }

    /// Résolution en chaîne : local de l'englobant (capture directe), sinon
    /// upvalue de l'englobant (capture relayée), en marquant `is_captured`
    /// à chaque niveau traversé.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            // plus d'englobant compilé ; l'eval continue dans le frame vivant
            if self.states[0].fn_type == FunctionType::Eval {
                return self.resolve_frame_upvalue(name);
            }
            return None;
        }
        let enclosing = state_idx - 1;
        if let Some(local) = self.resolve_local(enclosing, name) {
            self.states[enclosing].locals[local as usize].is_captured = true;
            return Some(self.add_upvalue(state_idx, UpvalueDesc { is_local: true, index: local }));
        }
        if let Some(upvalue) = self.resolve_upvalue(enclosing, name) {
            return Some(
                self.add_upvalue(state_idx, UpvalueDesc { is_local: false, index: upvalue }),
            );
        }
        None
    }

    /// Pour l'eval : capture un local du frame visé, ou relaie un upvalue
    /// existant de sa fermeture.
    fn resolve_frame_upvalue(&mut self, name: &str) -> Option<u8> {
        let frame_fn = self.eval_frame?;
        let local = {
            let meta = &self.heap.function(frame_fn).meta;
            meta.locals.iter().rposition(|l| l.depth >= 0 && l.name == name)
        };
        if let Some(i) = local {
            if i > u8::MAX as usize {
                return None;
            }
            return Some(self.add_upvalue(0, UpvalueDesc { is_local: true, index: i as u8 }));
        }
        let upvalue = upvalue_by_name(self.heap, frame_fn, name)?;
        Some(self.add_upvalue(0, UpvalueDesc { is_local: false, index: upvalue as u8 }))
    }

    /// Ordre de résolution d'un identifiant : locaux, upvalues, globales.
    /// Renvoie (op de lecture, op d'écriture, opérande).
    fn variable_access(&mut self, name: &'s str) -> Option<(Op, Op, u8)> {
        let cur = self.states.len() - 1;
        if let Some(slot) = self.resolve_local(cur, name) {
            return Some(if self.states[cur].locals[slot as usize].is_reference {
                (Op::GetReference, Op::SetReference, slot)
            } else {
                (Op::GetLocal, Op::SetLocal, slot)
            });
        }
        if let Some(upvalue) = self.resolve_upvalue(cur, name) {
            return Some((Op::GetUpvalue, Op::SetUpvalue, upvalue));
        }
        let key = self.heap.intern(name);
        if self.globals.has_key(key) {
            let constant = self.make_constant(Value::object(key.obj));
            return Some((Op::GetGlobal, Op::SetGlobal, constant));
        }
        None
    }

    /// Quel op arithmétique pour `+=`/`-=`/`*=`/`/=` ; consomme le token.
    fn mutate(&mut self, can_assign: bool) -> Option<Op> {
        if !can_assign {
            return None;
        }
        let op = match self.parser.current.kind {
            TokenKind::PlusEqual => Op::Add,
            TokenKind::MinusEqual => Op::Subtract,
            TokenKind::StarEqual => Op::Multiply,
            TokenKind::SlashEqual => Op::Divide,
            _ => return None,
        };
        self.advance();
        Some(op)
    }

    fn named_variable(&mut self, name: Token<'s>, can_assign: bool) {
        let access = self.variable_access(name.lexeme);
        let (get_op, set_op, arg) = match access {
            Some(a) => a,
            None => {
                self.error(&format!("Undefined variable '{}'.", name.lexeme));
                return;
            }
        };

        if let Some(mutate_op) = self.mutate(can_assign) {
            // x op= e  ≡  get x ; e ; op ; set x
            self.emit_op_byte(get_op, arg);
            self.expression();
            self.emit_op(mutate_op);
            self.emit_op_byte(set_op, arg);
        } else if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(set_op, arg);
        } else {
            self.emit_op_byte(get_op, arg);
        }
    }

    /* ───────────── règles d'expression ───────────── */

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let can_assign = precedence <= Precedence::Assignment;
        if !self.prefix_rule(self.parser.previous.kind, can_assign) {
            self.error("Expect expression.");
            return;
        }

        while precedence <= infix_precedence(self.parser.current.kind) {
            self.advance();
            self.infix_rule(self.parser.previous.kind, can_assign);
        }
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    /// Dispatch préfixe ; faux si le token n'ouvre pas une expression.
    fn prefix_rule(&mut self, kind: TokenKind, can_assign: bool) -> bool {
        match kind {
            TokenKind::LeftParen => self.grouping(),
            TokenKind::LeftBrace => self.dict(),
            TokenKind::LeftBracket => self.array_literal(),
            TokenKind::Minus | TokenKind::Bang => self.unary(),
            TokenKind::Identifier => self.variable(can_assign),
            TokenKind::String => self.string_literal(),
            TokenKind::Number => self.number(),
            TokenKind::False | TokenKind::Nil | TokenKind::True => self.literal(),
            TokenKind::Super => self.super_(),
            TokenKind::This => self.this_(),
            _ => return false,
        }
        true
    }

    fn infix_rule(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::LeftParen => self.call(),
            TokenKind::Dot => self.dot(can_assign),
            TokenKind::LeftBracket => self.subscript(can_assign),
            TokenKind::And => self.and_(),
            TokenKind::Or => self.or_(),
            _ => self.binary(),
        }
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Bang => self.emit_op(Op::Not),
            TokenKind::Minus => self.emit_op(Op::Negate),
            _ => {}
        }
    }

    fn binary(&mut self) {
        let operator = self.parser.previous.kind;
        self.parse_precedence(infix_precedence(operator).next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(Op::Equal);
                self.emit_op(Op::Not);
            }
            TokenKind::EqualEqual => self.emit_op(Op::Equal),
            TokenKind::Greater => self.emit_op(Op::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(Op::Less);
                self.emit_op(Op::Not);
            }
            TokenKind::Less => self.emit_op(Op::Less),
            TokenKind::LessEqual => {
                self.emit_op(Op::Greater);
                self.emit_op(Op::Not);
            }
            TokenKind::Plus => self.emit_op(Op::Add),
            TokenKind::Minus => self.emit_op(Op::Subtract),
            TokenKind::Star => self.emit_op(Op::Multiply),
            TokenKind::Slash => self.emit_op(Op::Divide),
            _ => {}
        }
    }

    fn and_(&mut self) {
        let end_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self) {
        let else_jump = self.emit_jump(Op::JumpIfFalse);
        let end_jump = self.emit_jump(Op::Jump);
        self.patch_jump(else_jump);
        self.emit_op(Op::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        let value: f64 = self.parser.previous.lexeme.parse().unwrap_or(0.0);
        let constant = self.make_constant(Value::number(value));
        self.emit_op_byte(Op::Constant, constant);
    }

    fn literal(&mut self) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit_op(Op::False),
            TokenKind::Nil => self.emit_op(Op::Nil),
            TokenKind::True => self.emit_op(Op::True),
            _ => {}
        }
    }

    /// Résout les échappes et interne la chaîne ; renvoie l'index constant.
    fn string_constant(&mut self) -> u8 {
        if self.parser.previous.kind != TokenKind::String {
            // un consume raté a déjà signalé l'erreur
            return 0;
        }
        let lexeme = self.parser.previous.lexeme;
        let raw = &lexeme[1..lexeme.len() - 1]; // sans les guillemets
        let escaped = escape_string(raw);
        let v = self.heap.intern_value(&escaped);
        self.make_constant(v)
    }

    fn string_literal(&mut self) {
        let constant = self.string_constant();
        self.emit_op_byte(Op::Constant, constant);
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.parser.previous, can_assign);
    }

    fn this_(&mut self) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn super_(&mut self) {
        let (in_class, has_superclass) = match self.classes.last() {
            None => (false, false),
            Some(c) => (true, c.has_superclass),
        };
        if !in_class {
            self.error("Can't use 'super' outside of a class.");
        } else if !has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        self.named_variable(Token::synthetic("this"), false);
        if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(Op::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_op_byte(Op::GetSuper, name);
        }
    }

    fn call(&mut self) {
        let arg_count = self.argument_list();
        self.emit_op_byte(Op::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count.min(255) as u8
    }

    /// `.` : accès propriété, affectation, ou invocation fusionnée.
    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.parser.previous.lexeme);

        if let Some(mutate_op) = self.mutate(can_assign) {
            // ré-émet le chargement du récepteur (2 octets), puis
            // get ; e ; op ; set — le récepteur est évalué deux fois
            let n = self.chunk().len();
            if n < 2 {
                self.error("Invalid compound assignment target.");
                return;
            }
            let (b1, b2) = (self.chunk().code[n - 2], self.chunk().code[n - 1]);
            self.emit_byte(b1);
            self.emit_byte(b2);
            self.emit_op_byte(Op::GetProperty, name);
            self.expression();
            self.emit_op(mutate_op);
            self.emit_op_byte(Op::SetProperty, name);
        } else if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op_byte(Op::SetProperty, name);
        } else if self.matches(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_op_byte(Op::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_op_byte(Op::GetProperty, name);
        }
    }

    /// `[` : indexation. La VM passe par `__getitem__`/`__setitem__` du
    /// prototype du récepteur.
    fn subscript(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightBracket, "Expect ']'.");

        if self.mutate(can_assign).is_some() {
            self.error("Can't use compound assignment through '[]'.");
        } else if can_assign && self.matches(TokenKind::Equal) {
            self.expression();
            self.emit_op(Op::SetIndexer);
        } else if self.matches(TokenKind::LeftParen) {
            self.emit_op(Op::GetIndexer);
            let arg_count = self.argument_list();
            self.emit_op_byte(Op::Call, arg_count);
        } else {
            self.emit_op(Op::GetIndexer);
        }
    }

    fn array_literal(&mut self) {
        self.emit_op(Op::DefineArray);
        while !self.check(TokenKind::RightBracket) && !self.check(TokenKind::Eof) {
            self.expression();
            if !self.check(TokenKind::RightBracket) {
                self.consume(TokenKind::Comma, "Expect ',' between array items.");
            }
            self.emit_op(Op::ArrayPush);
        }
        self.consume(TokenKind::RightBracket, "Expect ']' after array declaration.");
    }

    fn dict(&mut self) {
        self.emit_op(Op::DefineDict);
        while self.check(TokenKind::Identifier) {
            self.advance();
            let constant = self.identifier_constant(self.parser.previous.lexeme);
            self.consume(TokenKind::Colon, "Expect ':' after dict key.");
            self.expression();
            if !self.check(TokenKind::RightBrace) {
                self.consume(TokenKind::Comma, "Expect ',' between dict fields.");
            }
            self.emit_op_byte(Op::DictField, constant);
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict declaration.");
    }

    /* ───────────── déclarations ───────────── */

    fn declaration(&mut self) {
        match self.parser.current.kind {
            TokenKind::Class => {
                self.advance();
                self.class_declaration();
            }
            TokenKind::Fun => {
                self.advance();
                self.fun_declaration();
            }
            TokenKind::Var => {
                self.advance();
                self.var_declaration();
            }
            TokenKind::Export => {
                self.advance();
                self.export_declaration();
            }
            _ => self.statement(),
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.parser.current.kind != TokenKind::Eof {
            if self.parser.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.parser.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return
                | TokenKind::Export
                | TokenKind::Import => return,
                _ => {}
            }
            self.advance();
        }
    }

    fn var_declaration(&mut self) {
        self.parse_variable("Expect variable name.", false);

        if self.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(Op::Nil);
        }

        if self.matches(TokenKind::Comma) {
            self.mark_initialized();
            self.var_declaration();
        } else {
            self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
            self.mark_initialized();
        }
    }

    fn fun_declaration(&mut self) {
        self.parse_variable("Expect function name.", false);
        self.mark_initialized();
        self.function(FunctionType::Function);
    }

    fn function(&mut self, fn_type: FunctionType) {
        self.init_state(fn_type);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        let mut arity: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                arity += 1;
                if arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                self.parse_variable("Expect parameter name.", false);
                self.mark_initialized();
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        {
            let f = self.cur().function;
            self.heap.function_mut(f).arity = arity.min(255) as u8;
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::object(function));
        self.emit_op_byte(Op::Closure, constant);
        for up in upvalues {
            self.emit_byte(if up.is_local { 1 } else { 0 });
            self.emit_byte(up.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.parser.previous.lexeme);
        let fn_type = if self.parser.previous.lexeme == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(fn_type);
        self.emit_op_byte(Op::Method, constant);
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.parser.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable(false);

        self.emit_op_byte(Op::Class, name_constant);
        self.mark_initialized();

        self.classes.push(ClassState { has_superclass: false });

        if self.matches(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if class_name.lexeme == self.parser.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            self.begin_scope();
            self.add_local("super", false);
            self.mark_initialized();

            self.named_variable(class_name, false);
            self.emit_op(Op::Inherit);
            if let Some(c) = self.classes.last_mut() {
                c.has_superclass = true;
            }
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(Op::Pop);

        let has_superclass = self.classes.last().map(|c| c.has_superclass).unwrap_or(false);
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    /* ───────────── imports / exports ───────────── */

    /// `import { a, b as c } from "chemin";`
    fn import_statement(&mut self) {
        self.consume(TokenKind::LeftBrace, "Expect '{' after import.");
        self.emit_op(Op::ImportModule);
        self.emit_byte(0xFF); // constante du chemin, patchée après `from`
        let path_pos = self.chunk().len() - 1;

        loop {
            self.import_param();
            if !self.matches(TokenKind::Comma) {
                break;
            }
        }

        self.consume(TokenKind::RightBrace, "Expect '}' in import statement.");
        self.consume(TokenKind::From, "Expect 'from' after import params.");
        self.consume(TokenKind::String, "Expect module path string.");
        let path_constant = self.string_constant();
        self.chunk_mut().patch(path_pos, path_constant);
        self.consume(TokenKind::Semicolon, "Expect ';' after path.");
    }

    /// Un paramètre d'import : `nom` ou `nom as alias`. L'alias est un local
    /// *référence* — lectures/écritures passent par l'`ObjReference`.
    fn import_param(&mut self) {
        let name_constant = self.identifier_constant(self.parser.current.lexeme);

        if self.scanner.peek_token(1).kind == TokenKind::As {
            self.advance();
            self.advance();
        }
        let alias_constant = self.parse_variable("Expect identifier in import statement.", true);
        self.mark_initialized();
        let alias_token = self.parser.previous;

        let slot = match self.variable_access(alias_token.lexeme) {
            Some((_, _, slot)) => slot,
            None => 0,
        };

        self.emit_op_byte(Op::ImportVariable, name_constant);
        self.emit_byte(alias_constant);
        self.emit_byte(slot);
    }

    /// `export {a, b};` / `export fun f…` / `export class C…` / `export x;`
    fn export_declaration(&mut self) {
        if self.cur().fn_type != FunctionType::Script {
            self.error("Can't export outside of top-level code.");
        }

        match self.parser.current.kind {
            TokenKind::LeftBrace => {
                self.advance();
                while self.check(TokenKind::Identifier) {
                    self.advance();
                    let token = self.parser.previous;
                    self.export_identifier(token);
                    if !self.check(TokenKind::RightBrace) {
                        self.consume(TokenKind::Comma, "Expect ',' between exported names.");
                    }
                }
                self.consume(TokenKind::RightBrace, "Expect '}' after export list.");
                self.matches(TokenKind::Semicolon);
            }
            TokenKind::Fun => {
                self.advance();
                let name = self.parser.current;
                self.fun_declaration();
                self.export_identifier(name);
            }
            TokenKind::Class => {
                self.advance();
                let name = self.parser.current;
                self.class_declaration();
                self.export_identifier(name);
            }
            TokenKind::Identifier => {
                self.advance();
                let token = self.parser.previous;
                self.export_identifier(token);
                self.consume(TokenKind::Semicolon, "Expect ';' after export.");
            }
            _ => self.error_at_current("Expect valid export."),
        }
    }

    /// Exporte un nom : capture le local comme upvalue du script, crée la
    /// référence *cassée* dans la table d'exports, émet `OP_EXPORT`.
    fn export_identifier(&mut self, token: Token<'s>) {
        let access = self.variable_access(token.lexeme);
        let slot = match access {
            None => {
                self.error(&format!("Identifier '{}' not found.", token.lexeme));
                return;
            }
            Some((Op::GetGlobal, _, _)) => {
                self.error(&format!("Can't export '{}' because it's a global.", token.lexeme));
                return;
            }
            Some((_, _, slot)) => slot,
        };

        let ident_constant = self.identifier_constant(token.lexeme);
        let cur = self.states.len() - 1;
        let up_idx = self.add_upvalue(cur, UpvalueDesc { is_local: true, index: slot });

        let key = self.heap.intern(token.lexeme);
        match self.module.exports.get(key) {
            // recompilation du module (REPL) : les importeurs gardent la
            // même référence, re-cassée jusqu'au prochain run du top-level
            Some(existing) => {
                let r = self.heap.reference_mut(existing.as_obj());
                r.upvalue_index = up_idx;
                r.closure = None;
            }
            None => {
                let reference = self.heap.alloc(ObjPayload::Reference(ObjReference {
                    name: key,
                    module: self.module_id,
                    upvalue_index: up_idx,
                    closure: None,
                }));
                self.module.exports.set(key, Value::object(reference));
            }
        }

        self.emit_op_byte(Op::Export, ident_constant);
        self.emit_byte(slot);
        self.emit_byte(up_idx);
    }

    /* ───────────── instructions ───────────── */

    fn statement(&mut self) {
        match self.parser.current.kind {
            TokenKind::Print => {
                self.advance();
                self.print_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::Import => {
                self.advance();
                self.import_statement();
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(Op::Pop);
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(Op::Print);
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();

        let else_jump = self.emit_jump(Op::Jump);
        self.patch_jump(then_jump);
        self.emit_op(Op::Pop);

        if self.matches(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn return_statement(&mut self) {
        if self.cur().fn_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.matches(TokenKind::Semicolon) {
            self.emit_nil_return();
        } else {
            if self.cur().fn_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(Op::Return);
        }
    }

    fn while_statement(&mut self) {
        self.cur_mut().loops.push(LoopState::default());
        let loop_start = self.chunk().len();

        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(Op::JumpIfFalse);
        self.emit_op(Op::Pop);
        self.statement();

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit_op(Op::Pop);

        let loop_state = self.cur_mut().loops.pop().unwrap_or_default();
        self.patch_loop_jumps(loop_state.continue_patches, loop_start);
        let after = self.chunk().len();
        self.patch_loop_jumps(loop_state.break_patches, after);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.cur_mut().loops.push(LoopState::default());

        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.matches(TokenKind::Semicolon) {
            // pas d'initialisation
        } else if self.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.chunk().len();
        let mut exit_jump = None;
        if !self.matches(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Op::JumpIfFalse));
            self.emit_op(Op::Pop);
        }

        if !self.matches(TokenKind::RightParen) {
            let body_jump = self.emit_jump(Op::Jump);
            let increment_start = self.chunk().len();
            self.expression();
            self.emit_op(Op::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit) = exit_jump {
            self.patch_jump(exit);
            self.emit_op(Op::Pop);
        }

        let loop_state = self.cur_mut().loops.pop().unwrap_or_default();
        self.patch_loop_jumps(loop_state.continue_patches, loop_start);
        let after = self.chunk().len();
        self.patch_loop_jumps(loop_state.break_patches, after);

        self.end_scope();
    }

    fn break_statement(&mut self) {
        if self.cur().loops.is_empty() {
            self.error("Can't use 'break' outside of a loop.");
            return;
        }
        let jump = self.emit_jump(Op::Jump);
        if let Some(l) = self.cur_mut().loops.last_mut() {
            l.break_patches.push(jump);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.");
    }

    fn continue_statement(&mut self) {
        if self.cur().loops.is_empty() {
            self.error("Can't use 'continue' outside of a loop.");
            return;
        }
        let jump = self.emit_jump(Op::Jump);
        if let Some(l) = self.cur_mut().loops.last_mut() {
            l.continue_patches.push(jump);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.");
    }
}

/// Résout les échappes `\n \t \r \0 \b \f \\ \"` ; une échappe inconnue
/// laisse passer le caractère tel quel.
fn escape_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('0') => out.push('\0'),
            Some('b') => out.push('\u{0008}'),
            Some('f') => out.push('\u{000C}'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn compile_src(source: &str) -> (Heap, Module, Result<ObjRef, CompileError>) {
        let mut heap = Heap::new();
        let globals = Table::new();
        let mut module = Module::new(None, None);
        let result = compile(source, &mut heap, &globals, &mut module, 0);
        (heap, module, result)
    }

    fn ops_of(heap: &Heap, f: ObjRef) -> Vec<Op> {
        // décode uniquement les opcodes, en sautant les immédiats
        let chunk = &heap.function(f).chunk;
        let mut out = Vec::new();
        let mut i = 0;
        while i < chunk.code.len() {
            let op = Op::from_byte(chunk.code[i]).expect("opcode valide");
            out.push(op);
            i += 1;
            i += match op.operands() {
                lox_core::bytecode::OperandKind::None => 0,
                lox_core::bytecode::OperandKind::Const
                | lox_core::bytecode::OperandKind::Byte => 1,
                lox_core::bytecode::OperandKind::Short => 2,
                lox_core::bytecode::OperandKind::ConstByte => 2,
                lox_core::bytecode::OperandKind::ConstConstByte
                | lox_core::bytecode::OperandKind::ConstByteByte => 3,
                lox_core::bytecode::OperandKind::ConstPairs => {
                    let idx = chunk.code[i] as usize;
                    let fref = chunk.constant(idx).as_obj();
                    1 + 2 * heap.function(fref).upvalue_count
                }
            };
        }
        out
    }

    #[test]
    fn arithmetic_lowering() {
        let (heap, _m, r) = compile_src("print 1 + 2;");
        let f = r.expect("compile ok");
        assert_eq!(
            ops_of(&heap, f),
            vec![Op::Constant, Op::Constant, Op::Add, Op::Print, Op::Nil, Op::Return]
        );
    }

    #[test]
    fn string_constants_are_deduplicated() {
        let (heap, _m, r) = compile_src("print \"a\"; print \"a\"; print \"b\";");
        let f = r.expect("compile ok");
        assert_eq!(heap.function(f).chunk.constants.len(), 2);
    }

    #[test]
    fn compound_assignment_lowering() {
        let (heap, _m, r) = compile_src("var x = 1; x += 2;");
        let f = r.expect("compile ok");
        assert_eq!(
            ops_of(&heap, f),
            vec![
                Op::Constant,  // 1
                Op::GetLocal,  // x
                Op::Constant,  // 2
                Op::Add,
                Op::SetLocal,  // x
                Op::Pop,
                Op::Nil,
                Op::Return
            ]
        );
    }

    #[test]
    fn undefined_variable_is_a_compile_error() {
        let (_h, _m, r) = compile_src("print inconnu;");
        let err = r.expect_err("doit échouer");
        assert!(err.diagnostics[0].message.contains("Undefined variable 'inconnu'"));
        assert_eq!(
            format!("{}", err.diagnostics[0]),
            "[line 1] Error at 'inconnu': Undefined variable 'inconnu'."
        );
    }

    #[test]
    fn local_read_in_own_initializer_is_an_error() {
        let (_h, _m, r) = compile_src("{ var a = 1; { var a = a; } }");
        let err = r.expect_err("doit échouer");
        assert!(err.diagnostics[0].message.contains("own initializer"));
    }

    #[test]
    fn compound_assignment_through_subscript_is_rejected() {
        let (_h, _m, r) = compile_src("var a = [1]; a[0] += 1;");
        let err = r.expect_err("doit échouer");
        assert!(err.diagnostics[0].message.contains("compound assignment through '[]'"));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        let (_h, _m, r) = compile_src("break;");
        let err = r.expect_err("doit échouer");
        assert!(err.diagnostics[0].message.contains("outside of a loop"));
    }

    #[test]
    fn panic_mode_reports_several_errors() {
        let (_h, _m, r) = compile_src("var ; print 1;\nvar ; print 2;");
        let err = r.expect_err("doit échouer");
        assert_eq!(err.diagnostics.len(), 2);
    }

    #[test]
    fn closure_captures_produce_upvalue_descriptors() {
        let (heap, _m, r) = compile_src(
            "fun make() { var n = 0; fun inc() { n = n + 1; return n; } return inc; }",
        );
        let script = r.expect("compile ok");
        // retrouve make puis inc dans les constantes
        let make = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .copied()
            .filter(|v| v.is_obj())
            .find(|v| heap.kind(v.as_obj()) == lox_core::object::ObjKind::Function)
            .expect("make présent")
            .as_obj();
        let inc = heap
            .function(make)
            .chunk
            .constants
            .iter()
            .copied()
            .filter(|v| v.is_obj())
            .find(|v| heap.kind(v.as_obj()) == lox_core::object::ObjKind::Function)
            .expect("inc présent")
            .as_obj();

        let inc_fn = heap.function(inc);
        assert_eq!(inc_fn.upvalue_count, 1);
        assert_eq!(inc_fn.meta.upvalues[0], UpvalueDesc { is_local: true, index: 1 });
        // le local capturé de make est marqué
        assert!(heap.function(make).meta.locals[1].is_captured);
        assert_eq!(heap.function(make).meta.locals[1].name, "n");
    }

    #[test]
    fn function_metadata_records_arity_and_enclosing() {
        let (heap, _m, r) = compile_src("fun f(a, b) { return a + b; }");
        let script = r.expect("compile ok");
        let f = heap
            .function(script)
            .chunk
            .constants
            .iter()
            .copied()
            .filter(|v| v.is_obj())
            .find(|v| heap.kind(v.as_obj()) == lox_core::object::ObjKind::Function)
            .expect("f présent")
            .as_obj();
        let fun = heap.function(f);
        assert_eq!(fun.arity, 2);
        assert_eq!(fun.meta.enclosing, Some(script));
        let names: Vec<&str> = fun.meta.locals.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["", "a", "b"]);
    }

    #[test]
    fn import_emits_patched_path_and_reference_locals() {
        let (heap, _m, r) = compile_src("import { x as y } from \"lib.lox\";\nprint y;");
        let f = r.expect("compile ok");
        let ops = ops_of(&heap, f);
        assert_eq!(ops[0], Op::ImportModule);
        assert_eq!(ops[1], Op::ImportVariable);
        // la lecture de l'alias passe par la référence
        assert!(ops.contains(&Op::GetReference));
        // la constante de chemin a été patchée
        let chunk = &heap.function(f).chunk;
        let path = chunk.constant(chunk.code[1] as usize);
        assert_eq!(heap.value_to_string(path), "lib.lox");
        // métadonnées : l'alias est un local référence
        assert!(heap.function(f).meta.locals.iter().any(|l| l.name == "y" && l.is_reference));
    }

    #[test]
    fn export_registers_broken_reference_and_upvalue() {
        let (heap, module, r) = compile_src("var x = 41; export { x };");
        let f = r.expect("compile ok");
        let key = heap.find_string("x", lox_core::table::hash_bytes(b"x")).expect("interné");
        let reference = module.exports.get(key).expect("export enregistré");
        let obj = heap.reference(reference.as_obj());
        assert!(obj.closure.is_none(), "référence cassée avant exécution");
        assert_eq!(obj.upvalue_index, 0);
        // le script porte l'upvalue de capture
        assert_eq!(heap.function(f).upvalue_count, 1);
        assert!(ops_of(&heap, f).contains(&Op::Export));
    }

    #[test]
    fn class_with_methods_compiles() {
        let (heap, _m, r) = compile_src(
            "class A { init() { this.x = 1; } get() { return this.x; } } var a = A();",
        );
        let f = r.expect("compile ok");
        let ops = ops_of(&heap, f);
        assert!(ops.contains(&Op::Class));
        assert_eq!(ops.iter().filter(|&&o| o == Op::Method).count(), 2);
    }

    #[test]
    fn super_requires_superclass() {
        let (_h, _m, r) = compile_src("class A { m() { super.m(); } }");
        let err = r.expect_err("doit échouer");
        assert!(err.diagnostics[0].message.contains("no superclass"));
    }

    #[test]
    fn escapes_are_resolved() {
        assert_eq!(escape_string(r"a\nb\tc"), "a\nb\tc");
        assert_eq!(escape_string(r#"\"x\""#), "\"x\"");
        assert_eq!(escape_string(r"\\"), "\\");
        assert_eq!(escape_string(r"\z"), "z");
        assert_eq!(escape_string(r"fin\0"), "fin\0");
    }

    #[test]
    fn eval_compiles_against_frame_metadata() {
        // compile un script avec un local, puis une eval qui le capture
        let mut heap = Heap::new();
        let globals = Table::new();
        let mut module = Module::new(None, None);
        let script = compile("var a = 7; print a;", &mut heap, &globals, &mut module, 0)
            .expect("compile ok");

        let eval = compile_eval("a + 1", &mut heap, &globals, &mut module, 0, script)
            .expect("eval ok");
        let fun = heap.function(eval);
        assert_eq!(fun.upvalue_count, 1);
        assert!(fun.meta.upvalues[0].is_local);
        // capture le slot de `a` dans le frame du script
        let slot = fun.meta.upvalues[0].index as usize;
        assert_eq!(heap.function(script).meta.locals[slot].name, "a");
        // le code se termine par EvalExit
        let chunk = &heap.function(eval).chunk;
        assert_eq!(chunk.code.last().copied(), Some(Op::EvalExit.as_byte()));
    }
}
