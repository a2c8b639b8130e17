//! object.rs — Variantes d'objets tas et handles typés
//!
//! Chaque objet vit dans l'arène du [`crate::heap::Heap`] ; un [`ObjRef`] est
//! un index 32 bits dedans (c'est lui qui voyage dans les `Value` NaN-boxées).
//! L'en-tête commun porte le genre, les drapeaux GC et le prototype de
//! dispatch natif ; la charge utile est l'enum [`ObjPayload`].

use std::fmt;

use crate::bytecode::Chunk;
use crate::module::ModuleId;
use crate::table::{InternedStr, Table};
use crate::value::Value;

/// Handle d'objet : un index dans l'arène du tas.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ObjRef(u32);

impl ObjRef {
    #[inline]
    pub fn new(index: u32) -> ObjRef {
        ObjRef(index)
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ref({})", self.0)
    }
}

/* ───────────────────────── Drapeaux GC ───────────────────────── */

/// Drapeaux d'en-tête, un octet. Voir `heap.rs` pour le cycle de vie.
pub mod flags {
    /// Marqué pendant une collecte infant.
    pub const MARKED: u8 = 0x01;
    /// L'objet a été promu dans la génération older.
    pub const OLDER: u8 = 0x02;
    /// Marqué pendant une collecte older.
    pub const MARKED_OLDER: u8 = 0x04;
    /// Singleton épinglé (prototypes et leurs clés) : jamais libéré.
    pub const DONT_COLLECT: u8 = 0x08;
}

/* ───────────────────────── Genres ───────────────────────── */

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjKind {
    Prototype,
    BoundMethod,
    Array,
    Dict,
    Class,
    Closure,
    Function,
    Instance,
    NativeFn,
    NativeProp,
    NativeMethod,
    String,
    Upvalue,
    Module,
    Reference,
}

impl ObjKind {
    /// Nom du type côté langage (`typeof`, messages d'erreur).
    pub fn type_name(self) -> &'static str {
        match self {
            ObjKind::Prototype => "prototype",
            ObjKind::BoundMethod => "bound method",
            ObjKind::Array => "array",
            ObjKind::Dict => "dict",
            ObjKind::Class => "class",
            ObjKind::Closure => "closure",
            ObjKind::Function => "function",
            ObjKind::Instance => "instance",
            ObjKind::NativeFn | ObjKind::NativeMethod => "function",
            ObjKind::NativeProp => "property",
            ObjKind::String => "string",
            ObjKind::Upvalue => "upvalue",
            ObjKind::Module => "module",
            ObjKind::Reference => "reference",
        }
    }
}

/* ───────────────────────── Charges utiles ───────────────────────── */

/// Chaîne immuable internée (hash FNV-1a mis en cache à la création).
#[derive(Debug)]
pub struct ObjString {
    pub chars: Box<str>,
    pub hash: u32,
}

/// Descripteur d'upvalue produit par le compilateur : d'où capturer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UpvalueDesc {
    /// Vrai : `index` est un slot local de la fonction englobante.
    /// Faux : `index` désigne un upvalue de la fermeture englobante.
    pub is_local: bool,
    pub index: u8,
}

/// Slot local tel que vu à la compilation (noms pour le débogueur,
/// `is_reference` pour les alias d'import).
#[derive(Clone, Debug)]
pub struct LocalVar {
    pub name: String,
    pub depth: i32,
    pub is_captured: bool,
    pub is_reference: bool,
}

/// Métadonnées de compilation conservées dans la fonction finie.
///
/// C'est ce qui remplace le pointeur arrière chunk→compilateur : la VM s'en
/// sert pour charger les upvalues d'une fermeture, le débogueur pour
/// `info locals` et l'eval pour résoudre les noms du frame visé.
#[derive(Debug, Default)]
pub struct FnMeta {
    pub locals: Vec<LocalVar>,
    pub upvalues: Vec<UpvalueDesc>,
    /// Fonction englobante (chaîne de résolution), `None` pour un script.
    pub enclosing: Option<ObjRef>,
}

#[derive(Debug)]
pub struct ObjFunction {
    pub arity: u8,
    pub upvalue_count: usize,
    pub chunk: Chunk,
    pub name: Option<InternedStr>,
    pub meta: FnMeta,
}

/// État d'un upvalue : ouvert (slot de pile vivant) puis fermé (valeur
/// rapatriée). La transition est à sens unique.
#[derive(Clone, Copy, Debug)]
pub enum UpvalueState {
    Open(usize),
    Closed(Value),
}

#[derive(Debug)]
pub struct ObjUpvalue {
    pub state: UpvalueState,
}

#[derive(Debug)]
pub struct ObjClosure {
    pub function: ObjRef,
    /// `None` tant que la capture n'a pas eu lieu (remplie à `OP_CLOSURE`,
    /// à `OP_EXPORT` ou par l'eval du débogueur).
    pub upvalues: Vec<Option<ObjRef>>,
}

#[derive(Debug)]
pub struct ObjClass {
    pub name: InternedStr,
    pub methods: Table,
}

#[derive(Debug)]
pub struct ObjInstance {
    pub class: ObjRef,
    pub fields: Table,
}

#[derive(Debug)]
pub struct ObjBoundMethod {
    pub receiver: Value,
    pub method: ObjRef,
}

#[derive(Debug)]
pub struct ObjDict {
    pub fields: Table,
}

#[derive(Debug)]
pub struct ObjArray {
    pub values: Vec<Value>,
}

/// Signature d'une fonction native (hôte). Le tas suffit : les natifs
/// allouent et lisent des objets mais ne touchent pas à la pile de la VM.
pub type NativeFn = fn(&mut crate::heap::Heap, &[Value]) -> Result<Value, String>;
/// Méthode native : reçoit le récepteur en plus des arguments.
pub type NativeMethod = fn(&mut crate::heap::Heap, Value, &[Value]) -> Result<Value, String>;
/// Accesseurs d'une propriété native.
pub type NativePropGet = fn(&mut crate::heap::Heap, Value) -> Result<Value, String>;
pub type NativePropSet = fn(&mut crate::heap::Heap, Value, Value) -> Result<(), String>;

pub struct ObjNativeFn {
    pub function: NativeFn,
    pub name: InternedStr,
    pub arity: u8,
}

pub struct ObjNativeMethod {
    pub method: NativeMethod,
    pub name: InternedStr,
    pub arity: u8,
}

pub struct ObjNativeProp {
    pub get: Option<NativePropGet>,
    pub set: Option<NativePropSet>,
    pub name: InternedStr,
}

/// Prototype : tables de propriétés/méthodes natives par type, chaînées en
/// héritage simple. Singletons épinglés, jamais collectés.
#[derive(Debug)]
pub struct ObjPrototype {
    pub parent: Option<ObjRef>,
    pub props: Table,
    pub methods: Table,
}

/// Pont GC vers un module du registre de la VM.
#[derive(Debug)]
pub struct ObjModule {
    pub module: ModuleId,
}

/// Liaison inter-modules : lit/écrit le stockage d'upvalue du module
/// exportateur. *Cassée* tant que `closure` est `None` (le top-level de
/// l'exportateur n'a pas encore tourné).
#[derive(Debug)]
pub struct ObjReference {
    pub name: InternedStr,
    pub module: ModuleId,
    pub upvalue_index: u8,
    pub closure: Option<ObjRef>,
}

/* ───────────────────────── Enum englobant ───────────────────────── */

pub enum ObjPayload {
    String(ObjString),
    Function(ObjFunction),
    Closure(ObjClosure),
    Upvalue(ObjUpvalue),
    Class(ObjClass),
    Instance(ObjInstance),
    BoundMethod(ObjBoundMethod),
    Dict(ObjDict),
    Array(ObjArray),
    NativeFn(ObjNativeFn),
    NativeMethod(ObjNativeMethod),
    NativeProp(ObjNativeProp),
    Prototype(ObjPrototype),
    Module(ObjModule),
    Reference(ObjReference),
}

impl ObjPayload {
    pub fn kind(&self) -> ObjKind {
        match self {
            ObjPayload::String(_) => ObjKind::String,
            ObjPayload::Function(_) => ObjKind::Function,
            ObjPayload::Closure(_) => ObjKind::Closure,
            ObjPayload::Upvalue(_) => ObjKind::Upvalue,
            ObjPayload::Class(_) => ObjKind::Class,
            ObjPayload::Instance(_) => ObjKind::Instance,
            ObjPayload::BoundMethod(_) => ObjKind::BoundMethod,
            ObjPayload::Dict(_) => ObjKind::Dict,
            ObjPayload::Array(_) => ObjKind::Array,
            ObjPayload::NativeFn(_) => ObjKind::NativeFn,
            ObjPayload::NativeMethod(_) => ObjKind::NativeMethod,
            ObjPayload::NativeProp(_) => ObjKind::NativeProp,
            ObjPayload::Prototype(_) => ObjKind::Prototype,
            ObjPayload::Module(_) => ObjKind::Module,
            ObjPayload::Reference(_) => ObjKind::Reference,
        }
    }

    /// Empreinte mémoire approchée, pour les budgets de génération.
    pub fn heap_size(&self) -> usize {
        let base = std::mem::size_of::<ObjPayload>();
        base + match self {
            ObjPayload::String(s) => s.chars.len(),
            ObjPayload::Function(f) => {
                f.chunk.code.len()
                    + f.chunk.lines.len() * 4
                    + f.chunk.constants.len() * 8
                    + f.meta.locals.len() * std::mem::size_of::<LocalVar>()
            }
            ObjPayload::Closure(c) => c.upvalues.len() * 8,
            ObjPayload::Array(a) => a.values.len() * 8,
            ObjPayload::Class(c) => c.methods.capacity() * 16,
            ObjPayload::Instance(i) => i.fields.capacity() * 16,
            ObjPayload::Dict(d) => d.fields.capacity() * 16,
            _ => 0,
        }
    }
}

/// En-tête + charge utile : une case de l'arène.
pub struct Obj {
    pub flags: u8,
    pub prototype: Option<ObjRef>,
    pub size: usize,
    pub payload: ObjPayload,
}

impl Obj {
    #[inline]
    pub fn kind(&self) -> ObjKind {
        self.payload.kind()
    }

    #[inline]
    pub fn has_flag(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}
