//! table.rs — Table de hachage à adressage ouvert, clés internées
//!
//! Sondage linéaire, tombstones, facteur de charge 0.75, capacité puissance
//! de deux. La clé transporte son hash FNV-1a mis en cache à l'internement :
//! aucune opération de table ne re-hache, et l'égalité des clés est l'égalité
//! des handles (les chaînes sont internées).
//!
//! `remove_white` est le crochet « table faible » du GC : il retire les
//! entrées dont la clé va être libérée avant que le handle ne pende.

use crate::object::ObjRef;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

/// Clé de table : handle de chaîne internée + hash en cache.
#[derive(Clone, Copy, Debug)]
pub struct InternedStr {
    pub obj: ObjRef,
    pub hash: u32,
}

impl PartialEq for InternedStr {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.obj == other.obj
    }
}
impl Eq for InternedStr {}

/// Hash FNV-1a 32 bits, celui mis en cache dans chaque `ObjString`.
pub fn hash_bytes(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for &b in bytes {
        hash ^= u32::from(b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    key: Option<InternedStr>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry { key: None, value: Value::NIL };

    #[inline]
    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value == Value::TRUE
    }
}

/// Table à adressage ouvert. `count` compte entrées vivantes **et**
/// tombstones (comme l'implémentation d'origine) ; `len()` ne compte que les
/// vivantes.
#[derive(Default, Debug)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table { count: 0, entries: Vec::new() }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Nombre d'entrées vivantes.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index de l'entrée pour `key` : la case occupée par la clé, sinon la
    /// première tombstone rencontrée, sinon la première case vide.
    fn find_entry(entries: &[Entry], key: InternedStr) -> usize {
        let mask = entries.len() - 1;
        let mut index = key.hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
                Some(k) if k == key => return index,
                Some(_) => {}
            }
            index = (index + 1) & mask;
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Table::find_entry(&self.entries, key);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }

    /// Insère ou remplace. Renvoie vrai si la clé est nouvelle.
    pub fn set(&mut self, key: InternedStr, value: Value) -> bool {
        if (self.count + 1) as f64 > self.entries.len() as f64 * TABLE_MAX_LOAD {
            let capacity = if self.entries.is_empty() { 8 } else { self.entries.len() * 2 };
            self.adjust_capacity(capacity);
        }

        let index = Table::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        entry.key = Some(key);
        entry.value = value;
        is_new
    }

    pub fn get(&self, key: InternedStr) -> Option<Value> {
        if self.entries.is_empty() {
            return None;
        }
        let index = Table::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    pub fn has_key(&self, key: InternedStr) -> bool {
        self.get(key).is_some()
    }

    /// Retire la clé en posant une tombstone. Renvoie vrai si elle existait.
    pub fn delete(&mut self, key: InternedStr) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        let index = Table::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        entry.key = None;
        entry.value = Value::TRUE;
        true
    }

    /// Copie toutes les entrées de `from` vers `to` (héritage de classes).
    pub fn add_all(from: &Table, to: &mut Table) {
        for (key, value) in from.iter() {
            to.set(key, value);
        }
    }

    /// Les clés, dans un tableau frais (ordre de table, non trié).
    pub fn keys(&self) -> Vec<Value> {
        self.iter().map(|(k, _)| Value::object(k.obj)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (InternedStr, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }

    /// Retire toute entrée dont la clé est condamnée par la collecte en
    /// cours. À appeler avant la libération effective.
    pub fn remove_white(&mut self, is_dead: impl Fn(ObjRef) -> bool) {
        for index in 0..self.entries.len() {
            if let Some(key) = self.entries[index].key {
                if is_dead(key.obj) {
                    self.entries[index].key = None;
                    self.entries[index].value = Value::TRUE;
                }
            }
        }
    }

    /// Sondage bas niveau pour l'internement : visite les entrées vivantes
    /// du bucket de `hash` en ordre de sondage. Le tas s'en sert pour
    /// comparer les octets (`find_string`).
    pub fn probe_for_hash(&self, hash: u32) -> impl Iterator<Item = InternedStr> + '_ {
        let cap = self.entries.len();
        let mask = cap.saturating_sub(1);
        let start = hash as usize & mask;
        (0..cap)
            .map(move |i| &self.entries[(start + i) & mask])
            .take_while(|e| e.key.is_some() || e.is_tombstone())
            .filter_map(|e| e.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn key(i: u32) -> InternedStr {
        // hash volontairement dégénéré pour forcer les collisions
        InternedStr { obj: ObjRef::new(i), hash: i % 4 }
    }

    #[test]
    fn set_get_replace() {
        let mut t = Table::new();
        assert!(t.set(key(1), Value::number(1.0)));
        assert!(!t.set(key(1), Value::number(2.0)));
        assert_eq!(t.get(key(1)), Some(Value::number(2.0)));
        assert_eq!(t.get(key(2)), None);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn delete_leaves_reachable_collisions() {
        let mut t = Table::new();
        for i in 0..8 {
            t.set(key(i), Value::number(f64::from(i)));
        }
        assert!(t.delete(key(2)));
        assert!(!t.delete(key(2)));
        // les clés en collision derrière la tombstone restent joignables
        for i in 0..8 {
            if i != 2 {
                assert_eq!(t.get(key(i)), Some(Value::number(f64::from(i))), "clé {i}");
            }
        }
        assert_eq!(t.get(key(2)), None);
    }

    #[test]
    fn tombstone_slot_is_reused() {
        let mut t = Table::new();
        t.set(key(1), Value::TRUE);
        let cap = t.capacity();
        t.delete(key(1));
        t.set(key(1), Value::FALSE);
        assert_eq!(t.capacity(), cap);
        assert_eq!(t.get(key(1)), Some(Value::FALSE));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(key(i), Value::number(f64::from(i)));
        }
        assert_eq!(t.len(), 100);
        assert!(t.capacity() >= 128);
        for i in 0..100 {
            assert_eq!(t.get(key(i)), Some(Value::number(f64::from(i))));
        }
    }

    #[test]
    fn add_all_and_keys() {
        let mut a = Table::new();
        a.set(key(1), Value::TRUE);
        a.set(key(2), Value::FALSE);
        let mut b = Table::new();
        b.set(key(2), Value::NIL);
        Table::add_all(&a, &mut b);
        assert_eq!(b.len(), 2);
        assert_eq!(b.get(key(2)), Some(Value::FALSE));
        assert_eq!(b.keys().len(), 2);
    }

    #[test]
    fn remove_white_drops_dead_keys() {
        let mut t = Table::new();
        for i in 0..6 {
            t.set(key(i), Value::NIL);
        }
        t.remove_white(|r| r.index() % 2 == 0);
        assert_eq!(t.len(), 3);
        assert!(t.get(key(0)).is_none());
        assert!(t.get(key(1)).is_some());
    }
}
