//! vm.rs — Boucle d'interprétation et état d'exécution
//!
//! Une machine à pile classique : un tableau de frames (cap 64), une pile de
//! valeurs (cap 64 × 256), dispatch par `match` sur l'opcode décodé. Chaque
//! frame retient sa fermeture, son pointeur d'instruction et sa base de pile.
//!
//! Les upvalues ouverts forment une liste triée par slot de pile décroissant,
//! si bien qu'au retour d'un frame tous ceux au-dessus de la base se ferment
//! en O(k). `exit_at_frame` marque le frame où `OP_RETURN` doit rendre la
//! main (fin de script, ou retour au site d'import d'un module).
//!
//! La collecte est pilotée ici : le tas expose les primitives, la VM marque
//! les racines (pile, frames, upvalues ouverts, globales, modules, racines
//! temporaires, prototypes, conditions de points d'arrêt) en tête de boucle
//! quand le budget infant déborde.

use lox_core::bytecode::{disassemble_instruction, Op};
use lox_core::heap::Heap;
use lox_core::module::{Module, ModuleId};
use lox_core::object::{
    flags, ObjClosure, ObjInstance, ObjKind, ObjPayload, ObjRef, ObjUpvalue, UpvalueState,
};
use lox_core::table::{InternedStr, Table};
use lox_core::value::Value;

use crate::debugger::{Debugger, DebuggerState};
use crate::host::{DefaultHost, Host};
use crate::{InterpretError, InterpretResult};

/// Profondeur d'appels maximale.
pub const FRAMES_MAX: usize = 64;
/// Capacité de la pile de valeurs.
pub const STACK_MAX: usize = FRAMES_MAX * 256;

#[derive(Clone, Copy)]
pub(crate) struct CallFrame {
    pub closure: ObjRef,
    /// Fonction de `closure`, copiée ici pour éviter une indirection par octet lu.
    pub function: ObjRef,
    pub ip: usize,
    pub base: usize,
}

pub struct Vm {
    pub heap: Heap,
    pub(crate) frames: Vec<CallFrame>,
    pub(crate) stack: Vec<Value>,
    pub globals: Table,
    /// Upvalues ouverts, slots décroissants.
    pub(crate) open_upvalues: Vec<ObjRef>,
    pub(crate) modules: Vec<Module>,
    pub(crate) exit_at_frame: usize,
    pub(crate) debugger: Debugger,
    pub(crate) fail_on_runtime_err: bool,
    pub(crate) host: Box<dyn Host>,
    /// Prototypes singletons (base, string, array, dict), racines GC.
    pub(crate) protos: Vec<ObjRef>,
    init_string: InternedStr,
    pub(crate) getitem_key: InternedStr,
    pub(crate) setitem_key: InternedStr,
}

impl Default for Vm {
    fn default() -> Self {
        Vm::new()
    }
}

impl Vm {
    pub fn new() -> Vm {
        let mut heap = Heap::new();
        heap.set_gc_enabled(false);
        let init_string = heap.intern("init");
        let getitem_key = heap.intern("__getitem__");
        let setitem_key = heap.intern("__setitem__");

        let mut vm = Vm {
            heap,
            frames: Vec::with_capacity(FRAMES_MAX),
            stack: Vec::with_capacity(256),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            modules: Vec::new(),
            exit_at_frame: 0,
            debugger: Debugger::new(),
            fail_on_runtime_err: false,
            host: Box::new(DefaultHost),
            protos: Vec::new(),
            init_string,
            getitem_key,
            setitem_key,
        };
        crate::native::install(&mut vm);
        vm.heap.set_gc_enabled(true);
        vm
    }

    /// Redirige la sortie du programme (REPL, tests).
    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    /// Les noms globaux connus (complétion du REPL).
    pub fn global_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .globals
            .iter()
            .map(|(k, _)| self.heap.str_chars(k.obj).to_string())
            .collect();
        names.sort();
        names
    }

    pub fn debugger(&self) -> &Debugger {
        &self.debugger
    }

    pub fn debugger_mut(&mut self) -> &mut Debugger {
        &mut self.debugger
    }

    /* ───────────────────────── pile ───────────────────────── */

    #[inline]
    pub(crate) fn push(&mut self, value: Value) {
        debug_assert!(self.stack.len() < STACK_MAX, "pile de valeurs pleine");
        self.stack.push(value);
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Value {
        self.stack.pop().unwrap_or(Value::NIL)
    }

    #[inline]
    pub(crate) fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues.clear();
    }

    /// Erreur runtime : message + trace de pile (frame actif en premier),
    /// puis remise à zéro. Le drapeau d'échec silencieux (eval du débogueur)
    /// supprime tout l'affichage et préserve la pile.
    pub(crate) fn runtime_error(&mut self, message: &str) -> InterpretError {
        if !self.fail_on_runtime_err {
            eprintln!("{message}");
            for frame in self.frames.iter().rev() {
                let function = self.heap.function(frame.function);
                let line = function.chunk.line_at(frame.ip.saturating_sub(1));
                let name = match function.name {
                    Some(n) => self.heap.str_chars(n.obj),
                    None => "script",
                };
                eprintln!("[line {line}] in {name}");
            }
            self.reset_stack();
        }
        InterpretError::Runtime
    }

    /* ───────────────────────── décodage ───────────────────────── */

    #[inline]
    pub(crate) fn frame(&self) -> &CallFrame {
        self.frames.last().expect("aucun frame actif")
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last().expect("aucun frame actif");
        let byte = self.heap.function(frame.function).chunk.code[frame.ip];
        self.frames.last_mut().expect("aucun frame actif").ip += 1;
        byte
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte() as u16;
        let lo = self.read_byte() as u16;
        (hi << 8) | lo
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("aucun frame actif");
        self.heap.function(frame.function).chunk.constant(index)
    }

    fn read_string(&mut self) -> InternedStr {
        let v = self.read_constant();
        self.heap.as_key(v.as_obj())
    }

    /// Ligne source de l'instruction courante du frame `level` (0 = sommet).
    pub(crate) fn frame_line(&self, level: usize) -> u32 {
        let frame = &self.frames[self.frames.len() - 1 - level];
        self.heap
            .function(frame.function)
            .chunk
            .line_at(frame.ip.saturating_sub(1))
    }

    /// Module du frame au sommet.
    pub(crate) fn current_module(&self) -> ModuleId {
        let frame = self.frames.last().expect("aucun frame actif");
        self.heap.function(frame.function).chunk.module
    }

    /* ───────────────────────── upvalues ───────────────────────── */

    pub(crate) fn upvalue_value(&self, upvalue: ObjRef) -> Value {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => self.stack[slot],
            UpvalueState::Closed(v) => v,
        }
    }

    pub(crate) fn set_upvalue(&mut self, upvalue: ObjRef, value: Value) {
        match self.heap.upvalue(upvalue).state {
            UpvalueState::Open(slot) => self.stack[slot] = value,
            UpvalueState::Closed(_) => {
                self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
            }
        }
    }

    /// Réutilise l'upvalue ouvert sur `slot` s'il existe, sinon le crée, en
    /// maintenant la liste triée par slot décroissant.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            match self.heap.upvalue(self.open_upvalues[i]).state {
                UpvalueState::Open(s) if s > slot => i += 1,
                UpvalueState::Open(s) if s == slot => return self.open_upvalues[i],
                _ => break,
            }
        }
        let created = self
            .heap
            .alloc(ObjPayload::Upvalue(ObjUpvalue { state: UpvalueState::Open(slot) }));
        self.open_upvalues.insert(i, created);
        created
    }

    /// Ferme tous les upvalues ouverts sur un slot ≥ `last` (sortie de
    /// portée, retour de frame). Transition à sens unique.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(&upvalue) = self.open_upvalues.first() {
            let slot = match self.heap.upvalue(upvalue).state {
                UpvalueState::Open(s) => s,
                UpvalueState::Closed(_) => {
                    self.open_upvalues.remove(0);
                    continue;
                }
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
            self.open_upvalues.remove(0);
        }
    }

    /// Remplit le tableau d'upvalues d'une fermeture d'après les
    /// descripteurs de sa fonction : capture directe d'un slot du frame
    /// courant, ou relais d'un upvalue de la fermeture du frame.
    pub(crate) fn load_upvalues(&mut self, closure: ObjRef) -> InterpretResult {
        let function = self.heap.closure(closure).function;
        let count = self.heap.function(function).upvalue_count;
        let frame = *self.frames.last().expect("aucun frame actif");

        for i in 0..count {
            let desc = self.heap.function(function).meta.upvalues[i];
            let cell = if desc.is_local {
                self.capture_upvalue(frame.base + desc.index as usize)
            } else {
                match self.heap.closure(frame.closure).upvalues.get(desc.index as usize) {
                    Some(Some(u)) => *u,
                    _ => return Err(self.runtime_error("Unresolved upvalue.")),
                }
            };
            self.heap.closure_mut(closure).upvalues[i] = Some(cell);
        }
        Ok(())
    }

    /* ───────────────────────── références inter-modules ───────────────────────── */

    /// Lit à travers une `ObjReference`. Une référence cassée (le top-level
    /// de l'exportateur n'a pas tourné) rend une chaîne diagnostique.
    pub(crate) fn ref_get(&mut self, reference: ObjRef) -> Value {
        let (closure, index, name) = {
            let r = self.heap.reference(reference);
            (r.closure, r.upvalue_index as usize, r.name)
        };
        let broken = |vm: &mut Vm| {
            let n = vm.heap.str_chars(name.obj).to_string();
            vm.heap.intern_value(&format!("<broken reference '{n}'>"))
        };
        match closure {
            Some(c) => match self.heap.closure(c).upvalues.get(index).copied().flatten() {
                Some(u) => self.upvalue_value(u),
                None => broken(self),
            },
            None => broken(self),
        }
    }

    fn ref_set(&mut self, reference: ObjRef, value: Value) {
        let (closure, index) = {
            let r = self.heap.reference(reference);
            (r.closure, r.upvalue_index as usize)
        };
        if let Some(c) = closure {
            if let Some(Some(u)) = self.heap.closure(c).upvalues.get(index).copied() {
                self.set_upvalue(u, value);
            }
        }
    }

    /* ───────────────────────── appels ───────────────────────── */

    pub(crate) fn call_closure(&mut self, closure: ObjRef, arg_count: usize) -> InterpretResult {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity as usize;
        if arg_count != arity {
            return Err(
                self.runtime_error(&format!("Expected {arity} arguments but got {arg_count}."))
            );
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            function,
            ip: 0,
            base: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, arg_count: usize) -> InterpretResult {
        if callee.is_obj() {
            let r = callee.as_obj();
            match self.heap.kind(r) {
                ObjKind::BoundMethod => {
                    let (receiver, method) = {
                        let b = self.heap.bound_method(r);
                        (b.receiver, b.method)
                    };
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = receiver;
                    return self.call_closure(method, arg_count);
                }
                ObjKind::Class => {
                    let instance = self
                        .heap
                        .alloc(ObjPayload::Instance(ObjInstance { class: r, fields: Table::new() }));
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = Value::object(instance);
                    let initializer = self.heap.class(r).methods.get(self.init_string);
                    return match initializer {
                        Some(init) => self.call_closure(init.as_obj(), arg_count),
                        None if arg_count != 0 => Err(self
                            .runtime_error(&format!("Expected 0 arguments but got {arg_count}."))),
                        None => Ok(()),
                    };
                }
                ObjKind::Closure => return self.call_closure(r, arg_count),
                ObjKind::NativeFn => return self.call_native_fn(r, arg_count),
                ObjKind::NativeMethod => return self.call_native_method(r, arg_count),
                _ => {}
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call_native_fn(&mut self, native: ObjRef, arg_count: usize) -> InterpretResult {
        let (f, arity, name) = {
            let n = self.heap.native_fn(native);
            (n.function, n.arity as usize, n.name)
        };
        if arity != arg_count {
            let n = self.heap.str_chars(name.obj).to_string();
            return Err(self.runtime_error(&format!("{n} requires {arity} arguments.")));
        }
        let args: Vec<Value> = self.stack[self.stack.len() - arg_count..].to_vec();
        let result = match f(&mut self.heap, &args) {
            Ok(v) => v,
            Err(e) => return Err(self.runtime_error(&e)),
        };
        let new_len = self.stack.len() - arg_count - 1;
        self.stack.truncate(new_len);
        self.push(result);
        Ok(())
    }

    pub(crate) fn call_native_method(&mut self, native: ObjRef, arg_count: usize) -> InterpretResult {
        let (f, arity, name) = {
            let n = self.heap.native_method(native);
            (n.method, n.arity as usize, n.name)
        };
        if arity != arg_count {
            let n = self.heap.str_chars(name.obj).to_string();
            return Err(self.runtime_error(&format!("{n} requires {arity} arguments.")));
        }
        let receiver = self.peek(arg_count);
        let args: Vec<Value> = self.stack[self.stack.len() - arg_count..].to_vec();
        let result = match f(&mut self.heap, receiver, &args) {
            Ok(v) => v,
            Err(e) => return Err(self.runtime_error(&e)),
        };
        let new_len = self.stack.len() - arg_count - 1;
        self.stack.truncate(new_len);
        self.push(result);
        Ok(())
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: InternedStr, arg_count: usize) -> InterpretResult {
        let method = match self.heap.class(class).methods.get(name) {
            Some(m) => m,
            None => {
                let n = self.heap.str_chars(name.obj).to_string();
                return Err(self.runtime_error(&format!("Undefined property '{n}'.")));
            }
        };
        self.call_closure(method.as_obj(), arg_count)
    }

    fn invoke(&mut self, name: InternedStr, arg_count: usize) -> InterpretResult {
        let receiver = self.peek(arg_count);
        if !receiver.is_obj() {
            let n = self.heap.str_chars(name.obj).to_string();
            return Err(self.runtime_error(&format!("Method {n} not found.")));
        }
        let r = receiver.as_obj();
        match self.heap.kind(r) {
            ObjKind::Instance => {
                if let Some(field) = self.heap.instance(r).fields.get(name) {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = field;
                    return self.call_value(field, arg_count);
                }
                let class = self.heap.instance(r).class;
                self.invoke_from_class(class, name, arg_count)
            }
            ObjKind::Dict => {
                if let Some(field) = self.heap.dict(r).fields.get(name) {
                    let slot = self.stack.len() - arg_count - 1;
                    self.stack[slot] = field;
                    return self.call_value(field, arg_count);
                }
                match self.native_method_lookup(receiver, name) {
                    Some(m) => self.call_native_method(m, arg_count),
                    None => {
                        let n = self.heap.str_chars(name.obj).to_string();
                        Err(self.runtime_error(&format!("Method {n} not found.")))
                    }
                }
            }
            _ => match self.native_method_lookup(receiver, name) {
                Some(m) => self.call_native_method(m, arg_count),
                None => {
                    let n = self.heap.str_chars(name.obj).to_string();
                    Err(self.runtime_error(&format!("Method {n} not found.")))
                }
            },
        }
    }

    fn bind_method(&mut self, class: ObjRef, name: InternedStr) -> InterpretResult {
        let method = match self.heap.class(class).methods.get(name) {
            Some(m) => m,
            None => {
                let n = self.heap.str_chars(name.obj).to_string();
                return Err(self.runtime_error(&format!("Undefined property '{n}'.")));
            }
        };
        let bound = self.heap.alloc(ObjPayload::BoundMethod(lox_core::object::ObjBoundMethod {
            receiver: self.peek(0),
            method: method.as_obj(),
        }));
        self.pop();
        self.push(Value::object(bound));
        Ok(())
    }

    /* ───────────────────────── prototypes natifs ───────────────────────── */

    /// Remonte la chaîne de prototypes du récepteur pour une propriété.
    fn native_prop_lookup(&self, receiver: Value, name: InternedStr) -> Option<ObjRef> {
        let mut proto = self.heap.get(receiver.as_obj()).prototype;
        while let Some(p) = proto {
            let prototype = self.heap.prototype(p);
            if let Some(v) = prototype.props.get(name) {
                return Some(v.as_obj());
            }
            proto = prototype.parent;
        }
        None
    }

    /// Idem pour une méthode (`__getitem__`, `push`…).
    pub(crate) fn native_method_lookup(&self, receiver: Value, name: InternedStr) -> Option<ObjRef> {
        let mut proto = self.heap.get(receiver.as_obj()).prototype;
        while let Some(p) = proto {
            let prototype = self.heap.prototype(p);
            if let Some(v) = prototype.methods.get(name) {
                return Some(v.as_obj());
            }
            proto = prototype.parent;
        }
        None
    }

    fn native_prop_read(&mut self, receiver: Value, name: InternedStr) -> Result<Value, InterpretError> {
        if let Some(p) = self.native_prop_lookup(receiver, name) {
            if let Some(get) = self.heap.native_prop(p).get {
                return match get(&mut self.heap, receiver) {
                    Ok(v) => Ok(v),
                    Err(e) => Err(self.runtime_error(&e)),
                };
            }
        }
        Ok(Value::NIL)
    }

    /* ───────────────────────── arithmétique ───────────────────────── */

    fn binary_op(&mut self, op: Op) -> InterpretResult {
        let b = self.peek(0);
        let a = self.peek(1);
        if !a.is_number() || !b.is_number() {
            return Err(self.runtime_error("Operands must be numbers."));
        }
        self.pop();
        self.pop();
        let (a, b) = (a.as_number(), b.as_number());
        let v = match op {
            Op::Greater => Value::boolean(a > b),
            Op::Less => Value::boolean(a < b),
            Op::Subtract => Value::number(a - b),
            Op::Multiply => Value::number(a * b),
            Op::Divide => Value::number(a / b),
            _ => unreachable!("pas un opérateur binaire numérique"),
        };
        self.push(v);
        Ok(())
    }

    /* ───────────────────────── boucle principale ───────────────────────── */

    pub(crate) fn run(&mut self) -> InterpretResult {
        let mut import_module: Option<ModuleId> = None;

        loop {
            if self.heap.needs_gc() {
                self.collect_garbage();
            }

            if log::log_enabled!(log::Level::Trace) {
                let frame = self.frames.last().expect("aucun frame actif");
                let chunk = &self.heap.function(frame.function).chunk;
                let (text, _) = disassemble_instruction(&self.heap, chunk, frame.ip);
                log::trace!("{text}");
            }

            let byte = self.read_byte();
            let op = match Op::from_byte(byte) {
                Some(op) => op,
                None => return Err(self.runtime_error(&format!("Unknown opcode {byte:#04x}."))),
            };

            // tick du débogueur entre deux opcodes
            if self.debugger.state != DebuggerState::Run {
                self.debugger_tick(op)?;
            }

            match op {
                Op::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                Op::Nil => self.push(Value::NIL),
                Op::True => self.push(Value::TRUE),
                Op::False => self.push(Value::FALSE),
                Op::Pop => {
                    self.pop();
                }

                Op::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.push(self.stack[base + slot]);
                }
                Op::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    self.stack[base + slot] = self.peek(0);
                }
                Op::GetReference => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let v = self.stack[base + slot];
                    if !v.is_obj() || self.heap.kind(v.as_obj()) != ObjKind::Reference {
                        return Err(self.runtime_error("Slot does not hold a reference."));
                    }
                    let out = self.ref_get(v.as_obj());
                    self.push(out);
                }
                Op::SetReference => {
                    let slot = self.read_byte() as usize;
                    let base = self.frame().base;
                    let v = self.stack[base + slot];
                    if !v.is_obj() || self.heap.kind(v.as_obj()) != ObjKind::Reference {
                        return Err(self.runtime_error("Slot does not hold a reference."));
                    }
                    let value = self.peek(0);
                    self.ref_set(v.as_obj(), value);
                }

                Op::GetGlobal => {
                    let name = self.read_string();
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => {
                            let n = self.heap.str_chars(name.obj).to_string();
                            return Err(self.runtime_error(&format!("Undefined variable '{n}'.")));
                        }
                    }
                }
                Op::SetGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    if self.globals.set(name, value) {
                        self.globals.delete(name);
                        let n = self.heap.str_chars(name.obj).to_string();
                        return Err(self.runtime_error(&format!("Undefined variable '{n}'.")));
                    }
                }
                Op::DefineGlobal => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    self.globals.set(name, value);
                    self.pop();
                }

                Op::GetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    match self.heap.closure(closure).upvalues.get(slot).copied().flatten() {
                        Some(u) => {
                            let v = self.upvalue_value(u);
                            self.push(v);
                        }
                        None => return Err(self.runtime_error("Unresolved upvalue.")),
                    }
                }
                Op::SetUpvalue => {
                    let slot = self.read_byte() as usize;
                    let closure = self.frame().closure;
                    match self.heap.closure(closure).upvalues.get(slot).copied().flatten() {
                        Some(u) => {
                            let v = self.peek(0);
                            self.set_upvalue(u, v);
                        }
                        None => return Err(self.runtime_error("Unresolved upvalue.")),
                    }
                }

                Op::GetProperty => {
                    let name = self.read_string();
                    let receiver = self.peek(0);
                    if !receiver.is_obj() {
                        let t = self.heap.type_of(receiver);
                        return Err(
                            self.runtime_error(&format!("A {t} value has no properties."))
                        );
                    }
                    let r = receiver.as_obj();
                    match self.heap.kind(r) {
                        ObjKind::Instance => {
                            let field = self.heap.instance(r).fields.get(name);
                            match field {
                                Some(v) => {
                                    self.pop();
                                    self.push(v);
                                }
                                None => {
                                    let class = self.heap.instance(r).class;
                                    self.bind_method(class, name)?;
                                }
                            }
                        }
                        ObjKind::Dict => {
                            let v = match self.heap.dict(r).fields.get(name) {
                                Some(v) => v,
                                None => self.native_prop_read(receiver, name)?,
                            };
                            self.pop();
                            self.push(v);
                        }
                        _ => {
                            let v = self.native_prop_read(receiver, name)?;
                            self.pop();
                            self.push(v);
                        }
                    }
                }
                Op::SetProperty => {
                    let name = self.read_string();
                    let value = self.peek(0);
                    let receiver = self.peek(1);
                    if !receiver.is_obj() {
                        let n = self.heap.str_chars(name.obj).to_string();
                        return Err(self.runtime_error(&format!("Could not set '{n}'.")));
                    }
                    let r = receiver.as_obj();
                    match self.heap.kind(r) {
                        ObjKind::Instance => {
                            self.heap.instance_mut(r).fields.set(name, value);
                        }
                        ObjKind::Dict => {
                            self.heap.dict_mut(r).fields.set(name, value);
                        }
                        _ => {
                            let setter = self
                                .native_prop_lookup(receiver, name)
                                .and_then(|p| self.heap.native_prop(p).set);
                            match setter {
                                Some(set) => {
                                    if let Err(e) = set(&mut self.heap, receiver, value) {
                                        return Err(self.runtime_error(&e));
                                    }
                                }
                                None => {
                                    let n = self.heap.str_chars(name.obj).to_string();
                                    return Err(
                                        self.runtime_error(&format!("Could not set '{n}'."))
                                    );
                                }
                            }
                        }
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }

                Op::GetIndexer => {
                    let key = self.pop();
                    let receiver = self.pop();
                    if !receiver.is_obj() {
                        return Err(self.runtime_error("Object can't use indexer '[]'."));
                    }
                    match self.native_method_lookup(receiver, self.getitem_key) {
                        Some(m) => {
                            let f = self.heap.native_method(m).method;
                            match f(&mut self.heap, receiver, &[key]) {
                                Ok(v) => self.push(v),
                                Err(e) => return Err(self.runtime_error(&e)),
                            }
                        }
                        None => {
                            return Err(self.runtime_error("Object can't use indexer '[]'."))
                        }
                    }
                }
                Op::SetIndexer => {
                    let value = self.pop();
                    let key = self.pop();
                    let receiver = self.pop();
                    if !receiver.is_obj() {
                        return Err(self.runtime_error("Object can't use indexer '[]'."));
                    }
                    match self.native_method_lookup(receiver, self.setitem_key) {
                        Some(m) => {
                            let f = self.heap.native_method(m).method;
                            match f(&mut self.heap, receiver, &[key, value]) {
                                Ok(v) => self.push(v),
                                Err(e) => return Err(self.runtime_error(&e)),
                            }
                        }
                        None => {
                            return Err(self.runtime_error("Object can't use indexer '[]'."))
                        }
                    }
                }

                Op::GetSuper => {
                    let name = self.read_string();
                    let superclass = self.pop();
                    if !superclass.is_obj() || self.heap.kind(superclass.as_obj()) != ObjKind::Class
                    {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    self.bind_method(superclass.as_obj(), name)?;
                }

                Op::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::boolean(a.equals(b)));
                }
                Op::Greater | Op::Less | Op::Subtract | Op::Multiply | Op::Divide => {
                    self.binary_op(op)?;
                }
                Op::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    let both_strings = a.is_obj()
                        && b.is_obj()
                        && self.heap.kind(a.as_obj()) == ObjKind::String
                        && self.heap.kind(b.as_obj()) == ObjKind::String;
                    if both_strings {
                        let s = self.heap.concat(a.as_obj(), b.as_obj());
                        self.pop();
                        self.pop();
                        self.push(Value::object(s.obj));
                    } else if a.is_number() && b.is_number() {
                        self.pop();
                        self.pop();
                        self.push(Value::number(a.as_number() + b.as_number()));
                    } else {
                        return Err(
                            self.runtime_error("Operands must be two numbers or two strings.")
                        );
                    }
                }
                Op::Not => {
                    let v = self.pop();
                    self.push(Value::boolean(v.is_falsey()));
                }
                Op::Negate => {
                    if !self.peek(0).is_number() {
                        return Err(self.runtime_error("Operand must be a number."));
                    }
                    let v = self.pop();
                    self.push(Value::number(-v.as_number()));
                }

                Op::Print => {
                    let v = self.pop();
                    let mut text = self.heap.value_to_string(v);
                    text.push('\n');
                    self.host.print(&text);
                }

                Op::Jump => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("aucun frame actif").ip += offset;
                }
                Op::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    if self.peek(0).is_falsey() {
                        self.frames.last_mut().expect("aucun frame actif").ip += offset;
                    }
                }
                Op::Loop => {
                    let offset = self.read_short() as usize;
                    self.frames.last_mut().expect("aucun frame actif").ip -= offset;
                }

                Op::Call => {
                    let arg_count = self.read_byte() as usize;
                    self.call_value(self.peek(arg_count), arg_count)?;
                }
                Op::Invoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    self.invoke(name, arg_count)?;
                }
                Op::SuperInvoke => {
                    let name = self.read_string();
                    let arg_count = self.read_byte() as usize;
                    let superclass = self.pop();
                    if !superclass.is_obj() || self.heap.kind(superclass.as_obj()) != ObjKind::Class
                    {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    self.invoke_from_class(superclass.as_obj(), name, arg_count)?;
                }

                Op::Closure => {
                    let function = self.read_constant().as_obj();
                    let count = self.heap.function(function).upvalue_count;
                    let closure = self.heap.alloc(ObjPayload::Closure(ObjClosure {
                        function,
                        upvalues: vec![None; count],
                    }));
                    self.push(Value::object(closure));
                    self.load_upvalues(closure)?;
                    // saute les paires (is_local, index) embarquées
                    self.frames.last_mut().expect("aucun frame actif").ip += 2 * count;
                }
                Op::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }

                Op::Return => {
                    let result = self.pop();
                    let frame = self.frames.pop().expect("aucun frame actif");
                    self.close_upvalues(frame.base);
                    self.stack.truncate(frame.base);
                    if self.frames.len() == self.exit_at_frame {
                        // fin du script, ou retour au site d'import
                        return Ok(());
                    }
                    self.push(result);
                }
                Op::EvalExit => {
                    self.frames.pop();
                    return Ok(());
                }
                Op::Throw => {
                    return Err(self.runtime_error("'throw' is not implemented."));
                }

                Op::Class => {
                    let name = self.read_string();
                    let class = self.heap.alloc(ObjPayload::Class(lox_core::object::ObjClass {
                        name,
                        methods: Table::new(),
                    }));
                    self.push(Value::object(class));
                }
                Op::Inherit => {
                    let superclass = self.peek(1);
                    if !superclass.is_obj()
                        || self.heap.kind(superclass.as_obj()) != ObjKind::Class
                    {
                        return Err(self.runtime_error("Superclass must be a class."));
                    }
                    let subclass = self.peek(0).as_obj();
                    let methods: Vec<(InternedStr, Value)> =
                        self.heap.class(superclass.as_obj()).methods.iter().collect();
                    for (k, v) in methods {
                        self.heap.class_mut(subclass).methods.set(k, v);
                    }
                    self.pop();
                }
                Op::Method => {
                    let name = self.read_string();
                    let method = self.peek(0);
                    let class = self.peek(1).as_obj();
                    self.heap.class_mut(class).methods.set(name, method);
                    self.pop();
                }

                Op::DefineDict => {
                    let dict = self.heap.alloc(ObjPayload::Dict(lox_core::object::ObjDict {
                        fields: Table::new(),
                    }));
                    self.push(Value::object(dict));
                }
                Op::DictField => {
                    let name = self.read_string();
                    let value = self.pop();
                    let dict = self.peek(0).as_obj();
                    self.heap.dict_mut(dict).fields.set(name, value);
                }
                Op::DefineArray => {
                    let array = self.heap.alloc(ObjPayload::Array(lox_core::object::ObjArray {
                        values: Vec::new(),
                    }));
                    self.push(Value::object(array));
                }
                Op::ArrayPush => {
                    let value = self.pop();
                    let array = self.peek(0).as_obj();
                    self.heap.array_mut(array).values.push(value);
                }

                Op::ImportModule => {
                    let path_value = self.read_constant();
                    let path = self.heap.str_chars(path_value.as_obj()).to_string();
                    import_module = Some(self.resolve_import(&path)?);
                }
                Op::ImportVariable => {
                    let name = self.read_string();
                    let alias = self.read_string();
                    let slot = self.read_byte() as usize;
                    let module_id = match import_module {
                        Some(m) => m,
                        None => return Err(self.runtime_error("Import outside of import statement.")),
                    };
                    let reference = match self.modules[module_id].exports.get(name) {
                        Some(r) => r,
                        None => {
                            let n = self.heap.str_chars(name.obj).to_string();
                            let a = self.heap.str_chars(alias.obj).to_string();
                            let m = match self.modules[module_id].name {
                                Some(k) => self.heap.str_chars(k.obj).to_string(),
                                None => String::from("<module>"),
                            };
                            return Err(self.runtime_error(&format!(
                                "{n} is not exported from {m} as {a}."
                            )));
                        }
                    };
                    let absolute = self.frame().base + slot;
                    if absolute == self.stack.len() {
                        self.push(reference);
                    } else {
                        self.stack[absolute] = reference;
                    }
                }
                Op::Export => {
                    let name = self.read_string();
                    let local_idx = self.read_byte() as usize;
                    let up_idx = self.read_byte() as usize;
                    let frame = *self.frames.last().expect("aucun frame actif");

                    let cell = self.capture_upvalue(frame.base + local_idx);
                    let upvalues = &mut self.heap.closure_mut(frame.closure).upvalues;
                    if up_idx < upvalues.len() {
                        upvalues[up_idx] = Some(cell);
                    }

                    let module_id = self.heap.function(frame.function).chunk.module;
                    if let Some(reference) = self.modules[module_id].exports.get(name) {
                        self.heap.reference_mut(reference.as_obj()).closure =
                            Some(frame.closure);
                    }
                }
            }
        }
    }

    /* ───────────────────────── eval (débogueur) ───────────────────────── */

    /// Compile une expression liée au frame au sommet et construit sa
    /// fermeture (upvalues chargés depuis le frame). La fermeture reste
    /// poussée sur la pile.
    pub fn eval_build(&mut self, source: &str) -> Result<ObjRef, InterpretError> {
        let was_enabled = self.heap.set_gc_enabled(false);
        let frame = *self.frames.last().expect("aucun frame actif");
        let module_id = self.heap.function(frame.function).chunk.module;

        let compiled = lox_compiler::compile_eval(
            source,
            &mut self.heap,
            &self.globals,
            &mut self.modules[module_id],
            module_id,
            frame.function,
        );
        let function = match compiled {
            Ok(f) => f,
            Err(_) => {
                self.heap.set_gc_enabled(was_enabled);
                return Err(InterpretError::Compile);
            }
        };

        let count = self.heap.function(function).upvalue_count;
        let closure = self
            .heap
            .alloc(ObjPayload::Closure(ObjClosure { function, upvalues: vec![None; count] }));
        self.push(Value::object(closure));
        let loaded = self.load_upvalues(closure);
        self.heap.set_gc_enabled(was_enabled);
        loaded.map(|_| closure)
    }

    /// Exécute une fermeture d'eval sur l'état vif : erreurs runtime
    /// silencieuses, débogueur suspendu, frames restaurés. Rend la valeur
    /// (nil en cas d'échec).
    pub fn eval_run(&mut self, closure: ObjRef) -> Result<Value, InterpretError> {
        if self.stack.is_empty() || self.peek(0) != Value::object(closure) {
            self.push(Value::object(closure));
        }
        let stack_mark = self.stack.len() - 1; // slot de la fermeture
        let saved_fail = self.fail_on_runtime_err;
        let saved_frames = self.frames.len();
        let saved_state = self.debugger.state;
        self.fail_on_runtime_err = true;
        self.debugger.state = DebuggerState::Run;

        let result = self.call_closure(closure, 0).and_then(|_| self.run());
        let value = match result {
            Ok(()) => self.pop(),
            Err(_) => Value::NIL,
        };

        self.stack.truncate(stack_mark);
        self.frames.truncate(saved_frames);
        self.debugger.state = saved_state;
        self.fail_on_runtime_err = saved_fail;
        result.map(|_| value)
    }

    /// Compile + exécute une expression dans le frame courant.
    pub fn eval(&mut self, source: &str) -> Result<Value, InterpretError> {
        let closure = self.eval_build(source)?;
        self.eval_run(closure)
    }

    /* ───────────────────────── GC ───────────────────────── */

    fn mark_roots(&mut self, flag: u8) {
        for i in 0..self.stack.len() {
            let v = self.stack[i];
            self.heap.mark_value(v, flag);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure, flag);
        }
        for i in 0..self.open_upvalues.len() {
            let u = self.open_upvalues[i];
            self.heap.mark_object(u, flag);
        }
        self.heap.mark_object(self.init_string.obj, flag);
        self.heap.mark_object(self.getitem_key.obj, flag);
        self.heap.mark_object(self.setitem_key.obj, flag);

        // globales : racines fortes (la table d'internement reste faible)
        let globals = std::mem::take(&mut self.globals);
        self.heap.mark_table(&globals, flag);
        self.globals = globals;

        for i in 0..self.protos.len() {
            let p = self.protos[i];
            self.heap.mark_object(p, flag);
        }

        let modules = std::mem::take(&mut self.modules);
        for module in &modules {
            if let Some(n) = module.name {
                self.heap.mark_object(n.obj, flag);
            }
            if let Some(p) = module.path {
                self.heap.mark_object(p.obj, flag);
            }
            if let Some(f) = module.root_function {
                self.heap.mark_object(f, flag);
            }
            if let Some(c) = module.closure {
                self.heap.mark_object(c, flag);
            }
            self.heap.mark_table(&module.exports, flag);
        }
        self.modules = modules;

        for i in 0..self.heap.temp_roots.len() {
            let v = self.heap.temp_roots[i];
            self.heap.mark_value(v, flag);
        }

        let conditions: Vec<ObjRef> = self
            .debugger
            .breakpoints
            .iter()
            .filter_map(|bp| bp.eval_condition)
            .collect();
        for c in conditions {
            self.heap.mark_object(c, flag);
        }
    }

    pub(crate) fn collect_garbage(&mut self) {
        log::debug!("gc : cycle infant ({} octets vivants)", self.heap.bytes_allocated());
        self.heap.gc_begin();
        self.mark_roots(flags::MARKED);
        self.heap.trace(flags::MARKED);
        self.heap.trace_older(flags::MARKED);
        self.heap.sweep_infant();

        if self.heap.needs_older_gc() {
            log::debug!("gc : cycle older ({} octets vivants)", self.heap.bytes_allocated());
            self.heap.gc_begin();
            self.mark_roots(flags::MARKED_OLDER);
            self.heap.trace(flags::MARKED_OLDER);
            self.heap.sweep_older();
            self.heap.clear_infant_marks();
        }
    }
}
