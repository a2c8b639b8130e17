//! heap.rs — Arène d'objets et GC mark-sweep à deux générations
//!
//! Les objets vivent dans une arène (vecteur de cases + liste libre) ; les
//! handles sont des index 32 bits. Pas de pointeurs bruts : le modèle reste
//! sûr et le NaN-boxing embarque l'index.
//!
//! Générations :
//! - **infant** : toute allocation naît ici ; seuil bas, balayée souvent ;
//! - **older**  : les survivants d'une collecte infant y sont promus
//!   (drapeau `OLDER`), seuil haut, balayée rarement.
//!
//! Il n'y a pas de write barrier older→infant : chaque collecte infant
//! re-noircit l'intégralité de la génération older (`trace_older`), donc un
//! infant pointé par un older survit. Quand le budget cumulé déborde, une
//! collecte older complète tourne.
//!
//! La table d'internement est **faible** : juste avant de libérer, on retire
//! les entrées dont la clé est condamnée par le cycle en cours.
//!
//! Qui marque les racines ? La VM : le tas n'expose que les primitives
//! (`mark_value`, `trace`, `sweep_*`). `set_gc_enabled` coupe la collecte
//! pendant les sections critiques (compilation, bootstrap) et rend l'état
//! précédent. La feature `gc-stress` force `needs_gc()` à vrai en permanence.

use crate::object::{flags, Obj, ObjKind, ObjPayload, ObjRef, ObjString};
use crate::table::{hash_bytes, InternedStr, Table};
use crate::value::Value;

/// Seuil de première collecte infant (octets).
pub const INFANT_GC_MIN: usize = 64 * 1024;
/// Seuil de première collecte older (octets).
pub const OLDER_GC_MIN: usize = 1024 * 1024;
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Prototypes connus du tas, pour câbler l'en-tête à l'allocation.
#[derive(Default, Clone, Copy)]
struct ProtoSet {
    base: Option<ObjRef>,
    string: Option<ObjRef>,
    array: Option<ObjRef>,
    dict: Option<ObjRef>,
}

pub struct Heap {
    slots: Vec<Option<Obj>>,
    free: Vec<u32>,
    infant: Vec<ObjRef>,
    older: Vec<ObjRef>,
    infant_bytes: usize,
    older_bytes: usize,
    infant_next_gc: usize,
    older_next_gc: usize,
    gray: Vec<ObjRef>,
    enabled: bool,
    protos: ProtoSet,
    /// Table d'internement des chaînes (faible côté GC).
    strings: Table,
    /// Racines temporaires : protège des objets en cours d'assemblage.
    pub temp_roots: Vec<Value>,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            free: Vec::new(),
            infant: Vec::new(),
            older: Vec::new(),
            infant_bytes: 0,
            older_bytes: 0,
            infant_next_gc: INFANT_GC_MIN,
            older_next_gc: OLDER_GC_MIN,
            gray: Vec::new(),
            enabled: true,
            protos: ProtoSet::default(),
            strings: Table::new(),
            temp_roots: Vec::new(),
        }
    }

    /* ───────────────────────── Allocation ───────────────────────── */

    /// Alloue un objet sur la liste infant, prototype câblé selon le genre.
    pub fn alloc(&mut self, payload: ObjPayload) -> ObjRef {
        let proto = match payload.kind() {
            ObjKind::String => self.protos.string,
            ObjKind::Array => self.protos.array,
            ObjKind::Dict => self.protos.dict,
            _ => self.protos.base,
        };
        self.alloc_raw(payload, proto, 0)
    }

    /// Alloue un singleton épinglé (prototypes, leurs clés).
    pub fn alloc_pinned(&mut self, payload: ObjPayload) -> ObjRef {
        self.alloc_raw(payload, None, flags::DONT_COLLECT)
    }

    fn alloc_raw(&mut self, payload: ObjPayload, prototype: Option<ObjRef>, fl: u8) -> ObjRef {
        let size = payload.heap_size();
        self.infant_bytes += size;
        let obj = Obj { flags: fl, prototype, size, payload };

        let index = match self.free.pop() {
            Some(i) => {
                self.slots[i as usize] = Some(obj);
                i
            }
            None => {
                self.slots.push(Some(obj));
                (self.slots.len() - 1) as u32
            }
        };
        let r = ObjRef::new(index);
        self.infant.push(r);
        log::trace!("alloc {} ({} octets, {:?})", r, size, self.get(r).kind());
        r
    }

    /// Installe les prototypes singletons (appelé au bootstrap de la VM).
    pub fn set_prototypes(
        &mut self,
        base: ObjRef,
        string: ObjRef,
        array: ObjRef,
        dict: ObjRef,
    ) {
        self.protos = ProtoSet {
            base: Some(base),
            string: Some(string),
            array: Some(array),
            dict: Some(dict),
        };
    }

    /* ───────────────────────── Accès ───────────────────────── */

    #[inline]
    pub fn get(&self, r: ObjRef) -> &Obj {
        self.slots[r.index() as usize]
            .as_ref()
            .unwrap_or_else(|| unreachable!("handle mort: {r}"))
    }

    #[inline]
    pub fn get_mut(&mut self, r: ObjRef) -> &mut Obj {
        self.slots[r.index() as usize]
            .as_mut()
            .unwrap_or_else(|| unreachable!("handle mort: {r}"))
    }

    #[inline]
    pub fn kind(&self, r: ObjRef) -> ObjKind {
        self.get(r).kind()
    }

    /// Vrai si la case est occupée (tests GC).
    pub fn is_live(&self, r: ObjRef) -> bool {
        self.slots
            .get(r.index() as usize)
            .map(|s| s.is_some())
            .unwrap_or(false)
    }
}

/// Accesseurs typés : chacun suppose le bon genre (invariant interne).
macro_rules! typed_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        impl Heap {
            #[inline]
            pub fn $get(&self, r: ObjRef) -> &$ty {
                match &self.get(r).payload {
                    ObjPayload::$variant(x) => x,
                    _ => unreachable!("{} n'est pas un {}", r, stringify!($variant)),
                }
            }

            #[inline]
            pub fn $get_mut(&mut self, r: ObjRef) -> &mut $ty {
                match &mut self.get_mut(r).payload {
                    ObjPayload::$variant(x) => x,
                    _ => unreachable!("{} n'est pas un {}", r, stringify!($variant)),
                }
            }
        }
    };
}

typed_accessors!(string, string_mut, String, ObjString);
typed_accessors!(function, function_mut, Function, crate::object::ObjFunction);
typed_accessors!(closure, closure_mut, Closure, crate::object::ObjClosure);
typed_accessors!(upvalue, upvalue_mut, Upvalue, crate::object::ObjUpvalue);
typed_accessors!(class, class_mut, Class, crate::object::ObjClass);
typed_accessors!(instance, instance_mut, Instance, crate::object::ObjInstance);
typed_accessors!(bound_method, bound_method_mut, BoundMethod, crate::object::ObjBoundMethod);
typed_accessors!(dict, dict_mut, Dict, crate::object::ObjDict);
typed_accessors!(array, array_mut, Array, crate::object::ObjArray);
typed_accessors!(native_fn, native_fn_mut, NativeFn, crate::object::ObjNativeFn);
typed_accessors!(native_method, native_method_mut, NativeMethod, crate::object::ObjNativeMethod);
typed_accessors!(native_prop, native_prop_mut, NativeProp, crate::object::ObjNativeProp);
typed_accessors!(prototype, prototype_mut, Prototype, crate::object::ObjPrototype);
typed_accessors!(module_obj, module_obj_mut, Module, crate::object::ObjModule);
typed_accessors!(reference, reference_mut, Reference, crate::object::ObjReference);

impl Heap {
    /* ───────────────────────── Internement ───────────────────────── */

    #[inline]
    pub fn str_chars(&self, r: ObjRef) -> &str {
        &self.string(r).chars
    }

    /// Reconstruit la clé de table d'une chaîne (le hash est en cache).
    #[inline]
    pub fn as_key(&self, r: ObjRef) -> InternedStr {
        InternedStr { obj: r, hash: self.string(r).hash }
    }

    /// Cherche une chaîne déjà internée par octets + hash.
    pub fn find_string(&self, s: &str, hash: u32) -> Option<InternedStr> {
        self.strings
            .probe_for_hash(hash)
            .find(|k| k.hash == hash && self.str_chars(k.obj) == s)
    }

    /// Interne `s` : au plus un `ObjString` par contenu.
    pub fn intern(&mut self, s: &str) -> InternedStr {
        let hash = hash_bytes(s.as_bytes());
        if let Some(k) = self.find_string(s, hash) {
            return k;
        }
        let r = self.alloc(ObjPayload::String(ObjString { chars: s.into(), hash }));
        let key = InternedStr { obj: r, hash };
        self.strings.set(key, Value::NIL);
        key
    }

    /// Interne une `String` déjà construite (concaténations).
    pub fn take_string(&mut self, s: String) -> InternedStr {
        let hash = hash_bytes(s.as_bytes());
        if let Some(k) = self.find_string(&s, hash) {
            return k;
        }
        let r = self.alloc(ObjPayload::String(ObjString { chars: s.into_boxed_str(), hash }));
        let key = InternedStr { obj: r, hash };
        self.strings.set(key, Value::NIL);
        key
    }

    pub fn intern_value(&mut self, s: &str) -> Value {
        Value::object(self.intern(s).obj)
    }

    /// Concatène deux chaînes en une chaîne internée.
    pub fn concat(&mut self, a: ObjRef, b: ObjRef) -> InternedStr {
        let mut s = String::with_capacity(self.str_chars(a).len() + self.str_chars(b).len());
        s.push_str(self.str_chars(a));
        s.push_str(self.str_chars(b));
        self.take_string(s)
    }

    /// Nombre de chaînes internées (tests).
    pub fn interned_count(&self) -> usize {
        self.strings.len()
    }

    /* ───────────────────────── Rendu ───────────────────────── */

    /// Nom de type côté langage.
    pub fn type_of(&self, v: Value) -> &'static str {
        if v.is_number() {
            "number"
        } else if v.is_bool() {
            "boolean"
        } else if v.is_nil() {
            "nil"
        } else {
            self.kind(v.as_obj()).type_name()
        }
    }

    /// Forme texte d'une valeur (celle de `print`).
    pub fn value_to_string(&self, v: Value) -> String {
        if v.is_number() {
            return crate::value::format_number(v.as_number());
        }
        if v.is_nil() {
            return "nil".to_string();
        }
        if v.is_bool() {
            return format!("{}", v.as_bool());
        }
        let r = v.as_obj();
        match &self.get(r).payload {
            ObjPayload::String(s) => s.chars.to_string(),
            ObjPayload::Function(f) => match f.name {
                Some(n) => format!("<fn {}>", self.str_chars(n.obj)),
                None => "<script>".to_string(),
            },
            ObjPayload::Closure(c) => self.value_to_string(Value::object(c.function)),
            ObjPayload::BoundMethod(b) => self.value_to_string(Value::object(b.method)),
            ObjPayload::Class(c) => format!("<class {}>", self.str_chars(c.name.obj)),
            ObjPayload::Instance(i) => {
                format!("<{} instance>", self.str_chars(self.class(i.class).name.obj))
            }
            ObjPayload::NativeFn(n) => format!("<native fn {}>", self.str_chars(n.name.obj)),
            ObjPayload::NativeMethod(n) => {
                format!("<native fn {}>", self.str_chars(n.name.obj))
            }
            ObjPayload::NativeProp(n) => {
                format!("<native prop {}>", self.str_chars(n.name.obj))
            }
            ObjPayload::Upvalue(_) => "upvalue".to_string(),
            ObjPayload::Prototype(_) => "<prototype>".to_string(),
            ObjPayload::Module(_) => "<module>".to_string(),
            ObjPayload::Reference(rf) => format!("<ref {}>", self.str_chars(rf.name.obj)),
            ObjPayload::Array(a) => {
                let items: Vec<String> =
                    a.values.iter().map(|&x| self.value_to_string(x)).collect();
                format!("[{}]", items.join(","))
            }
            ObjPayload::Dict(d) => {
                let mut items: Vec<(String, String)> = d
                    .fields
                    .iter()
                    .map(|(k, x)| (self.str_chars(k.obj).to_string(), self.value_to_string(x)))
                    .collect();
                items.sort();
                let body: Vec<String> =
                    items.into_iter().map(|(k, x)| format!("{k}: {x}")).collect();
                format!("{{{}}}", body.join(", "))
            }
        }
    }

    /* ───────────────────────── GC : marquage ───────────────────────── */

    /// Coupe/rallume la collecte ; rend l'état précédent.
    pub fn set_gc_enabled(&mut self, enable: bool) -> bool {
        std::mem::replace(&mut self.enabled, enable)
    }

    /// Le budget infant est-il dépassé ?
    pub fn needs_gc(&self) -> bool {
        if !self.enabled {
            return false;
        }
        if cfg!(feature = "gc-stress") {
            return true;
        }
        self.infant_bytes > self.infant_next_gc
    }

    /// Le budget cumulé impose-t-il une collecte older ?
    pub fn needs_older_gc(&self) -> bool {
        self.infant_bytes + self.older_bytes > self.infant_next_gc + self.older_next_gc
    }

    pub fn gc_begin(&mut self) {
        self.gray.clear();
    }

    #[inline]
    pub fn mark_value(&mut self, v: Value, flag: u8) {
        if v.is_obj() {
            self.mark_object(v.as_obj(), flag);
        }
    }

    /// Marque et met en gris. Idempotent par cycle.
    pub fn mark_object(&mut self, r: ObjRef, flag: u8) {
        let obj = match self.slots.get_mut(r.index() as usize) {
            Some(Some(o)) => o,
            _ => return,
        };
        if obj.flags & flag != 0 {
            return;
        }
        obj.flags |= flag;
        self.gray.push(r);
    }

    /// Marque clés et valeurs d'une table externe (globales, exports).
    pub fn mark_table(&mut self, table: &Table, flag: u8) {
        for (k, v) in table.iter() {
            self.mark_object(k.obj, flag);
            self.mark_value(v, flag);
        }
    }

    /// Vide la pile grise en noircissant transitivement.
    pub fn trace(&mut self, flag: u8) {
        while let Some(r) = self.gray.pop() {
            let children = self.children_of(r);
            for c in children {
                self.mark_value(c, flag);
            }
        }
    }

    /// Pas de write barrier : lors d'une collecte infant, tout objet older
    /// est re-noirci pour garder en vie les infants qu'il référence.
    pub fn trace_older(&mut self, flag: u8) {
        let older = self.older.clone();
        for r in older {
            if self.is_live(r) {
                let children = self.children_of(r);
                for c in children {
                    self.mark_value(c, flag);
                }
            }
        }
        self.trace(flag);
    }

    /// Les enfants directs d'un objet, en valeurs (phase de noircissement).
    fn children_of(&self, r: ObjRef) -> Vec<Value> {
        fn table_children(out: &mut Vec<Value>, t: &Table) {
            for (k, v) in t.iter() {
                out.push(Value::object(k.obj));
                out.push(v);
            }
        }

        let mut out = Vec::new();
        match &self.get(r).payload {
            ObjPayload::String(_) => {}
            ObjPayload::Function(f) => {
                if let Some(n) = f.name {
                    out.push(Value::object(n.obj));
                }
                out.extend(f.chunk.constants.iter().copied().filter(|c| c.is_obj()));
                if let Some(e) = f.meta.enclosing {
                    out.push(Value::object(e));
                }
            }
            ObjPayload::Closure(c) => {
                out.push(Value::object(c.function));
                out.extend(c.upvalues.iter().flatten().map(|&u| Value::object(u)));
            }
            ObjPayload::Upvalue(u) => {
                if let crate::object::UpvalueState::Closed(v) = u.state {
                    out.push(v);
                }
            }
            ObjPayload::Class(c) => {
                out.push(Value::object(c.name.obj));
                table_children(&mut out, &c.methods);
            }
            ObjPayload::Instance(i) => {
                out.push(Value::object(i.class));
                table_children(&mut out, &i.fields);
            }
            ObjPayload::BoundMethod(b) => {
                out.push(b.receiver);
                out.push(Value::object(b.method));
            }
            ObjPayload::Dict(d) => table_children(&mut out, &d.fields),
            ObjPayload::Array(a) => out.extend(a.values.iter().copied()),
            ObjPayload::NativeFn(n) => out.push(Value::object(n.name.obj)),
            ObjPayload::NativeMethod(n) => out.push(Value::object(n.name.obj)),
            ObjPayload::NativeProp(n) => out.push(Value::object(n.name.obj)),
            ObjPayload::Prototype(p) => {
                if let Some(parent) = p.parent {
                    out.push(Value::object(parent));
                }
                table_children(&mut out, &p.props);
                table_children(&mut out, &p.methods);
            }
            ObjPayload::Module(_) => {}
            ObjPayload::Reference(rf) => {
                out.push(Value::object(rf.name.obj));
                if let Some(c) = rf.closure {
                    out.push(Value::object(c));
                }
            }
        }
        out
    }

    /* ───────────────────────── GC : balayage ───────────────────────── */

    fn doomed_infant(&self, r: ObjRef) -> bool {
        match &self.slots[r.index() as usize] {
            Some(o) => {
                !o.has_flag(flags::OLDER)
                    && !o.has_flag(flags::MARKED)
                    && !o.has_flag(flags::DONT_COLLECT)
            }
            None => false,
        }
    }

    fn doomed_older(&self, r: ObjRef) -> bool {
        match &self.slots[r.index() as usize] {
            Some(o) => {
                o.has_flag(flags::OLDER)
                    && !o.has_flag(flags::MARKED_OLDER)
                    && !o.has_flag(flags::DONT_COLLECT)
            }
            None => false,
        }
    }

    fn free_object(&mut self, r: ObjRef) {
        let i = r.index() as usize;
        if let Some(obj) = self.slots[i].take() {
            log::trace!("free {} ({:?}, {} octets)", r, obj.kind(), obj.size);
            if obj.flags & flags::OLDER != 0 {
                self.older_bytes = self.older_bytes.saturating_sub(obj.size);
            } else {
                self.infant_bytes = self.infant_bytes.saturating_sub(obj.size);
            }
            self.free.push(i as u32);
        }
    }

    /// Balaye la génération infant et promeut les survivants.
    /// Renvoie le nombre d'objets libérés.
    pub fn sweep_infant(&mut self) -> usize {
        // table d'internement faible : retirer les clés condamnées avant
        // que leur case ne soit réutilisée
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_white(|r| self.doomed_infant(r));
        self.strings = strings;

        let mut freed = 0;
        let infant = std::mem::take(&mut self.infant);
        for r in infant {
            if self.doomed_infant(r) {
                self.free_object(r);
                freed += 1;
            } else {
                let obj = self.get_mut(r);
                obj.flags &= !flags::MARKED;
                obj.flags |= flags::OLDER;
                self.older.push(r);
            }
        }

        // promotion : le compteur d'octets suit les survivants
        self.older_bytes += self.infant_bytes;
        self.infant_bytes = 0;
        self.infant_next_gc = INFANT_GC_MIN;
        log::debug!(
            "gc infant : {} libérés, older = {} octets",
            freed,
            self.older_bytes
        );
        freed
    }

    /// Balaye la génération older. Renvoie le nombre d'objets libérés.
    pub fn sweep_older(&mut self) -> usize {
        let mut strings = std::mem::take(&mut self.strings);
        strings.remove_white(|r| self.doomed_older(r));
        self.strings = strings;

        let mut freed = 0;
        let older = std::mem::take(&mut self.older);
        for r in older {
            if self.doomed_older(r) {
                self.free_object(r);
                freed += 1;
            } else {
                if self.is_live(r) {
                    self.get_mut(r).flags &= !flags::MARKED_OLDER;
                    self.older.push(r);
                }
            }
        }

        self.older_next_gc = if self.older_bytes > OLDER_GC_MIN {
            self.older_bytes * GC_HEAP_GROW_FACTOR
        } else {
            OLDER_GC_MIN
        };
        log::debug!(
            "gc older : {} libérés, older = {} octets, prochain seuil {}",
            freed,
            self.older_bytes,
            self.older_next_gc
        );
        freed
    }

    /// Après une collecte older, la génération infant garde ses drapeaux
    /// `MARKED` posés par le traçage ; on les efface pour le cycle suivant.
    pub fn clear_infant_marks(&mut self) {
        for i in 0..self.infant.len() {
            let r = self.infant[i];
            if self.is_live(r) {
                self.get_mut(r).flags &= !(flags::MARKED | flags::MARKED_OLDER);
            }
        }
    }

    /* ───────────────────────── Statistiques ───────────────────────── */

    pub fn infant_len(&self) -> usize {
        self.infant.len()
    }

    pub fn older_len(&self) -> usize {
        self.older.len()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.infant_bytes + self.older_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjArray, UpvalueState};

    #[test]
    fn interning_yields_one_object_per_content() {
        let mut h = Heap::new();
        let a = h.intern("hello");
        let b = h.intern("hello");
        let c = h.intern("world");
        assert_eq!(a.obj, b.obj);
        assert_ne!(a.obj, c.obj);
        assert_eq!(h.interned_count(), 2);
        assert_eq!(h.str_chars(a.obj), "hello");
    }

    #[test]
    fn take_string_interns_too() {
        let mut h = Heap::new();
        let a = h.intern("abc");
        let b = h.take_string(String::from("abc"));
        assert_eq!(a.obj, b.obj);
    }

    #[test]
    fn concat_produces_interned_string() {
        let mut h = Heap::new();
        let a = h.intern("foo");
        let b = h.intern("bar");
        let c = h.concat(a.obj, b.obj);
        assert_eq!(h.str_chars(c.obj), "foobar");
        let again = h.intern("foobar");
        assert_eq!(c.obj, again.obj);
    }

    #[test]
    fn unreachable_infant_is_swept_and_survivors_promoted() {
        let mut h = Heap::new();
        let live = h.alloc(ObjPayload::Array(ObjArray { values: vec![] }));
        let dead = h.alloc(ObjPayload::Array(ObjArray { values: vec![] }));

        h.gc_begin();
        h.mark_object(live, flags::MARKED);
        h.trace(flags::MARKED);
        let freed = h.sweep_infant();

        assert_eq!(freed, 1);
        assert!(h.is_live(live));
        assert!(!h.is_live(dead));
        // promu : drapeau OLDER posé, liste infant vide
        assert!(h.get(live).has_flag(flags::OLDER));
        assert_eq!(h.infant_len(), 0);
        assert_eq!(h.older_len(), 1);
    }

    #[test]
    fn marking_traces_transitively() {
        let mut h = Heap::new();
        let inner = h.alloc(ObjPayload::Array(ObjArray { values: vec![] }));
        let outer = h.alloc(ObjPayload::Array(ObjArray {
            values: vec![Value::object(inner)],
        }));

        h.gc_begin();
        h.mark_object(outer, flags::MARKED);
        h.trace(flags::MARKED);
        h.sweep_infant();

        assert!(h.is_live(outer));
        assert!(h.is_live(inner));
    }

    #[test]
    fn older_keeps_infant_children_alive_without_barrier() {
        let mut h = Heap::new();
        let holder = h.alloc(ObjPayload::Array(ObjArray { values: vec![] }));

        // premier cycle : promotion du conteneur
        h.gc_begin();
        h.mark_object(holder, flags::MARKED);
        h.trace(flags::MARKED);
        h.sweep_infant();
        assert!(h.get(holder).has_flag(flags::OLDER));

        // un infant pointé uniquement par l'objet older
        let infant = h.alloc(ObjPayload::Array(ObjArray { values: vec![] }));
        h.array_mut(holder).values.push(Value::object(infant));

        // cycle infant sans racine : trace_older doit le sauver
        h.gc_begin();
        h.trace(flags::MARKED);
        h.trace_older(flags::MARKED);
        let freed = h.sweep_infant();
        assert_eq!(freed, 0);
        assert!(h.is_live(infant));
    }

    #[test]
    fn weak_intern_table_drops_dead_strings() {
        let mut h = Heap::new();
        let dead = h.intern("ephemere");
        let live = h.intern("durable");
        assert_eq!(h.interned_count(), 2);

        h.gc_begin();
        h.mark_object(live.obj, flags::MARKED);
        h.trace(flags::MARKED);
        h.sweep_infant();

        assert!(!h.is_live(dead.obj));
        assert_eq!(h.interned_count(), 1);
        // ré-interner le contenu mort donne un objet neuf, pas un handle pendouillant
        let again = h.intern("ephemere");
        assert!(h.is_live(again.obj));
    }

    #[test]
    fn pinned_objects_survive_everything() {
        let mut h = Heap::new();
        let pinned = h.alloc_pinned(ObjPayload::Array(ObjArray { values: vec![] }));
        h.gc_begin();
        h.trace(flags::MARKED);
        h.sweep_infant();
        h.gc_begin();
        h.trace(flags::MARKED_OLDER);
        h.sweep_older();
        assert!(h.is_live(pinned));
    }

    #[test]
    fn gc_toggle_returns_previous_state() {
        let mut h = Heap::new();
        assert!(h.set_gc_enabled(false));
        assert!(!h.set_gc_enabled(true));
        assert!(h.set_gc_enabled(true));
    }

    #[test]
    fn bytes_shrink_after_sweep() {
        let mut h = Heap::new();
        let before = h.bytes_allocated();
        for _ in 0..16 {
            h.alloc(ObjPayload::Array(ObjArray { values: vec![Value::NIL; 32] }));
        }
        let peak = h.bytes_allocated();
        assert!(peak > before);
        h.gc_begin();
        h.trace(flags::MARKED);
        h.sweep_infant();
        assert!(h.bytes_allocated() <= peak);
    }

    #[test]
    fn upvalue_closed_value_is_traced() {
        let mut h = Heap::new();
        let s = h.intern("capturé");
        let up = h.alloc(ObjPayload::Upvalue(crate::object::ObjUpvalue {
            state: UpvalueState::Closed(Value::object(s.obj)),
        }));
        h.gc_begin();
        h.mark_object(up, flags::MARKED);
        h.trace(flags::MARKED);
        h.sweep_infant();
        assert!(h.is_live(s.obj));
    }
}
