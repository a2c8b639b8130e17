//! native.rs — Builtins et prototypes des types de base
//!
//! Installe au bootstrap :
//! - la chaîne de prototypes (base ← string/array/dict), singletons épinglés
//!   jamais collectés, qui portent le dispatch natif (`length`,
//!   `__getitem__`, `__setitem__`, `push`, `pop`, `keys`) ;
//! - les fonctions globales `clock`, `str`, `num`.
//!
//! Contrat d'appel natif : arité fixe vérifiée par la VM, arguments passés
//! en tranche, accès au tas seulement — un natif ne touche jamais la pile.

use std::sync::OnceLock;
use std::time::Instant;

use lox_core::heap::Heap;
use lox_core::object::{
    ObjArray, ObjKind, ObjNativeFn, ObjNativeMethod, ObjNativeProp, ObjPayload, ObjPrototype,
    ObjRef,
};
use lox_core::table::Table;
use lox_core::value::Value;

use crate::vm::Vm;

/* ───────────────────────── fonctions globales ───────────────────────── */

/// Origine de `clock()` : armée au bootstrap de la première VM, pour que
/// les mesures démarrent près de zéro (secondes écoulées du processus,
/// pas une date calendaire).
static CLOCK_START: OnceLock<Instant> = OnceLock::new();

fn clock_native(_heap: &mut Heap, _args: &[Value]) -> Result<Value, String> {
    let start = CLOCK_START.get_or_init(Instant::now);
    Ok(Value::number(start.elapsed().as_secs_f64()))
}

fn str_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    let text = heap.value_to_string(args[0]);
    Ok(heap.intern_value(&text))
}

fn num_native(heap: &mut Heap, args: &[Value]) -> Result<Value, String> {
    if args[0].is_number() {
        return Ok(args[0]);
    }
    let text = heap.value_to_string(args[0]);
    Ok(Value::number(leading_number(&text)))
}

/// Sémantique `strtod` : blancs de tête ignorés, puis le plus long préfixe
/// numérique valide (signe, chiffres, point, exposant) ; le reste de la
/// chaîne est ignoré. `"12px"` vaut 12, `"3.5xyz"` vaut 3.5, sans préfixe
/// numérique la valeur est 0.
fn leading_number(text: &str) -> f64 {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let start = i;

    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let mut digits = 0;
    while i < bytes.len() && bytes[i].is_ascii_digit() {
        i += 1;
        digits += 1;
    }
    if i < bytes.len() && bytes[i] == b'.' {
        let mut j = i + 1;
        let mut fraction = 0;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
            fraction += 1;
        }
        if digits > 0 || fraction > 0 {
            i = j;
            digits += fraction;
        }
    }
    if digits == 0 {
        return 0.0;
    }
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        let mut exp_digits = 0;
        while j < bytes.len() && bytes[j].is_ascii_digit() {
            j += 1;
            exp_digits += 1;
        }
        if exp_digits > 0 {
            i = j;
        }
    }

    text[start..i].parse().unwrap_or(0.0)
}

/* ───────────────────────── string ───────────────────────── */

fn string_length(heap: &mut Heap, receiver: Value) -> Result<Value, String> {
    Ok(Value::number(heap.str_chars(receiver.as_obj()).len() as f64))
}

/// `"abc"[1]` : caractère à l'index entier, nil hors bornes.
fn string_getitem(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() {
        return Err("String index must be a number.".to_string());
    }
    let index = args[0].as_number() as i64;
    if index < 0 {
        return Ok(Value::NIL);
    }
    let ch = heap.str_chars(receiver.as_obj()).chars().nth(index as usize);
    match ch {
        Some(c) => Ok(heap.intern_value(&c.to_string())),
        None => Ok(Value::NIL),
    }
}

/* ───────────────────────── array ───────────────────────── */

fn array_length(heap: &mut Heap, receiver: Value) -> Result<Value, String> {
    Ok(Value::number(heap.array(receiver.as_obj()).values.len() as f64))
}

fn array_getitem(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() {
        return Err("Array index must be a number.".to_string());
    }
    let index = args[0].as_number() as i64;
    let values = &heap.array(receiver.as_obj()).values;
    if index >= 0 && (index as usize) < values.len() {
        Ok(values[index as usize])
    } else {
        Ok(Value::NIL)
    }
}

fn array_setitem(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    if !args[0].is_number() {
        return Err("Array index must be a number.".to_string());
    }
    let index = args[0].as_number() as i64;
    let values = &mut heap.array_mut(receiver.as_obj()).values;
    if index >= 0 && (index as usize) < values.len() {
        values[index as usize] = args[1];
    }
    Ok(args[1])
}

fn array_push(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    heap.array_mut(receiver.as_obj()).values.push(args[0]);
    Ok(args[0])
}

fn array_pop(heap: &mut Heap, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    Ok(heap.array_mut(receiver.as_obj()).values.pop().unwrap_or(Value::NIL))
}

/* ───────────────────────── dict ───────────────────────── */

fn dict_length(heap: &mut Heap, receiver: Value) -> Result<Value, String> {
    Ok(Value::number(heap.dict(receiver.as_obj()).fields.len() as f64))
}

fn dict_key(heap: &Heap, key: Value) -> Result<lox_core::table::InternedStr, String> {
    if !key.is_obj() || heap.kind(key.as_obj()) != ObjKind::String {
        return Err("Dict key must be a string.".to_string());
    }
    Ok(heap.as_key(key.as_obj()))
}

fn dict_getitem(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = dict_key(heap, args[0])?;
    Ok(heap.dict(receiver.as_obj()).fields.get(key).unwrap_or(Value::NIL))
}

fn dict_setitem(heap: &mut Heap, receiver: Value, args: &[Value]) -> Result<Value, String> {
    let key = dict_key(heap, args[0])?;
    heap.dict_mut(receiver.as_obj()).fields.set(key, args[1]);
    Ok(args[1])
}

/// `d.keys()` : les clés, dans un tableau frais.
fn dict_keys(heap: &mut Heap, receiver: Value, _args: &[Value]) -> Result<Value, String> {
    let keys = heap.dict(receiver.as_obj()).fields.keys();
    let array = heap.alloc(ObjPayload::Array(ObjArray { values: keys }));
    Ok(Value::object(array))
}

/* ───────────────────────── installation ───────────────────────── */

fn new_prototype(heap: &mut Heap, parent: Option<ObjRef>) -> ObjRef {
    heap.alloc_pinned(ObjPayload::Prototype(ObjPrototype {
        parent,
        props: Table::new(),
        methods: Table::new(),
    }))
}

fn add_prop(
    vm: &mut Vm,
    proto: ObjRef,
    name: &str,
    get: lox_core::object::NativePropGet,
) {
    let key = vm.heap.intern(name);
    let prop = vm.heap.alloc_pinned(ObjPayload::NativeProp(ObjNativeProp {
        get: Some(get),
        set: None,
        name: key,
    }));
    vm.heap.prototype_mut(proto).props.set(key, Value::object(prop));
}

fn add_method(
    vm: &mut Vm,
    proto: ObjRef,
    name: &str,
    method: lox_core::object::NativeMethod,
    arity: u8,
) {
    let key = vm.heap.intern(name);
    let native = vm.heap.alloc_pinned(ObjPayload::NativeMethod(ObjNativeMethod {
        method,
        name: key,
        arity,
    }));
    vm.heap.prototype_mut(proto).methods.set(key, Value::object(native));
}

fn define_native_fn(vm: &mut Vm, name: &str, function: lox_core::object::NativeFn, arity: u8) {
    let key = vm.heap.intern(name);
    let native = vm.heap.alloc(ObjPayload::NativeFn(ObjNativeFn { function, name: key, arity }));
    vm.globals.set(key, Value::object(native));
}

/// Câble prototypes et builtins. Appelé une fois, GC coupé, au bootstrap.
pub(crate) fn install(vm: &mut Vm) {
    // arme l'origine de clock() dès la construction de la VM
    let _ = CLOCK_START.get_or_init(Instant::now);

    let base = new_prototype(&mut vm.heap, None);
    let string = new_prototype(&mut vm.heap, Some(base));
    let array = new_prototype(&mut vm.heap, Some(base));
    let dict = new_prototype(&mut vm.heap, Some(base));
    vm.heap.set_prototypes(base, string, array, dict);
    vm.protos = vec![base, string, array, dict];

    add_prop(vm, string, "length", string_length);
    add_method(vm, string, "__getitem__", string_getitem, 1);

    add_prop(vm, array, "length", array_length);
    add_method(vm, array, "__getitem__", array_getitem, 1);
    add_method(vm, array, "__setitem__", array_setitem, 2);
    add_method(vm, array, "push", array_push, 1);
    add_method(vm, array, "pop", array_pop, 0);

    add_prop(vm, dict, "length", dict_length);
    add_method(vm, dict, "__getitem__", dict_getitem, 1);
    add_method(vm, dict, "__setitem__", dict_setitem, 2);
    add_method(vm, dict, "keys", dict_keys, 0);

    define_native_fn(vm, "clock", clock_native, 0);
    define_native_fn(vm, "str", str_native, 1);
    define_native_fn(vm, "num", num_native, 1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leading_number_parses_the_numeric_prefix() {
        assert_eq!(leading_number("42"), 42.0);
        assert_eq!(leading_number("  41 "), 41.0);
        assert_eq!(leading_number("12px"), 12.0);
        assert_eq!(leading_number("3.5xyz"), 3.5);
        assert_eq!(leading_number("-2.5e2mm"), -250.0);
        assert_eq!(leading_number(".5abc"), 0.5);
        assert_eq!(leading_number("12."), 12.0);
        // exposant incomplet : seul le préfixe entier compte
        assert_eq!(leading_number("7e"), 7.0);
        assert_eq!(leading_number("7e+"), 7.0);
    }

    #[test]
    fn leading_number_without_prefix_is_zero() {
        assert_eq!(leading_number(""), 0.0);
        assert_eq!(leading_number("px12"), 0.0);
        assert_eq!(leading_number("-"), 0.0);
        assert_eq!(leading_number("."), 0.0);
        assert_eq!(leading_number("e5"), 0.0);
    }

    #[test]
    fn clock_counts_from_process_start() {
        let start = *CLOCK_START.get_or_init(Instant::now);
        let elapsed = start.elapsed().as_secs_f64();
        // des secondes écoulées, pas une date : l'ordre de grandeur est petit
        assert!(elapsed >= 0.0 && elapsed < 3600.0);
    }
}
