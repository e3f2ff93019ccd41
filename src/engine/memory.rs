use alloy_primitives::U256;
use std::collections::BTreeMap;
use std::rc::Rc;

use super::opcode::Opcode;
use super::value::{StackValue, Term, Word};
use crate::analyzers::annotation::AnnotationSet;

/// Highest offset the explorer is willing to materialize.
pub const MEMORY_LIMIT: usize = 1 << 20;

#[derive(Debug, Clone)]
enum Cell {
    Byte(u8),
    /// Byte `index` (big-endian) of a symbolic value.
    Part(Rc<StackValue>, u8),
}

/// Byte-addressable memory of one path.
///
/// Concrete words are stored as plain bytes, so their annotations do not survive
/// a store/load round trip. Symbolic words keep a reference to the stored value
/// and come back with their annotations intact.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    cells: BTreeMap<usize, Cell>,
    size: usize,
}

/// Content of a memory region read for hashing.
#[derive(Debug)]
pub struct Region {
    /// Raw bytes when every byte of the region is concrete.
    pub bytes: Option<Vec<u8>>,
    /// One term per 32-byte chunk.
    pub words: Vec<Word>,
    /// Union of the annotations of all symbolic values touched.
    pub annotations: AnnotationSet,
}

impl Memory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active memory size, rounded up to whole words.
    pub fn size(&self) -> usize {
        self.size
    }

    fn touch(&mut self, offset: usize, len: usize) {
        if len == 0 {
            return;
        }
        let end = (offset + len + 31) / 32 * 32;
        self.size = self.size.max(end);
    }

    pub fn store_word(&mut self, offset: usize, value: &Rc<StackValue>) {
        self.touch(offset, 32);
        match value.value() {
            Some(concrete) => {
                for (i, byte) in concrete.to_be_bytes::<32>().iter().enumerate() {
                    self.cells.insert(offset + i, Cell::Byte(*byte));
                }
            }
            None => {
                for i in 0..32 {
                    self.cells.insert(offset + i, Cell::Part(value.clone(), i as u8));
                }
            }
        }
    }

    pub fn store_byte(&mut self, offset: usize, value: &Rc<StackValue>) {
        self.touch(offset, 1);
        let cell = match value.value() {
            Some(concrete) => Cell::Byte(concrete.to_be_bytes::<32>()[31]),
            None => Cell::Part(value.clone(), 31),
        };
        self.cells.insert(offset, cell);
    }

    pub fn store_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.touch(offset, bytes.len());
        for (i, byte) in bytes.iter().enumerate() {
            self.cells.insert(offset + i, Cell::Byte(*byte));
        }
    }

    /// Fills `len` bytes with symbolic words produced by `source(chunk_offset)`.
    pub fn store_symbolic(&mut self, offset: usize, len: usize, mut source: impl FnMut(usize) -> Word) {
        self.touch(offset, len);
        for chunk in (0..len).step_by(32) {
            let value = Rc::new(StackValue::new(source(chunk)));
            for i in 0..32.min(len - chunk) {
                self.cells.insert(offset + chunk + i, Cell::Part(value.clone(), i as u8));
            }
        }
    }

    /// Replaces every referenced symbolic value by `f(value)`.
    pub fn remap(&mut self, mut f: impl FnMut(&Rc<StackValue>) -> Rc<StackValue>) {
        for cell in self.cells.values_mut() {
            if let Cell::Part(value, _) = cell {
                *value = f(value);
            }
        }
    }

    /// Loads one word. A word written whole by a single symbolic store is returned
    /// as that very value, annotations included.
    pub fn load_word(&mut self, offset: usize) -> Rc<StackValue> {
        self.touch(offset, 32);
        if let Some(Cell::Part(first, 0)) = self.cells.get(&offset) {
            let intact = (0..32).all(|i| {
                matches!(self.cells.get(&(offset + i)),
                    Some(Cell::Part(v, idx)) if Rc::ptr_eq(v, first) && *idx as usize == i)
            });
            if intact {
                return first.clone();
            }
        }
        let (word, annotations) = self.chunk(offset, 32);
        Rc::new(StackValue::with_annotations(word, annotations))
    }

    /// Concrete word at `offset`, `None` when any byte is symbolic.
    pub fn concrete_word(&self, offset: usize) -> Option<U256> {
        let mut bytes = [0u8; 32];
        for (i, byte) in bytes.iter_mut().enumerate() {
            match self.cells.get(&(offset + i)) {
                Some(Cell::Byte(b)) => *byte = *b,
                None => *byte = 0,
                Some(Cell::Part(..)) => return None,
            }
        }
        Some(U256::from_be_bytes(bytes))
    }

    pub fn read_region(&self, offset: usize, len: usize) -> Region {
        let mut bytes = Some(Vec::with_capacity(len));
        let mut annotations = AnnotationSet::new();
        for i in 0..len {
            match self.cells.get(&(offset + i)) {
                Some(Cell::Byte(b)) => {
                    if let Some(buf) = bytes.as_mut() {
                        buf.push(*b);
                    }
                }
                None => {
                    if let Some(buf) = bytes.as_mut() {
                        buf.push(0);
                    }
                }
                Some(Cell::Part(value, _)) => {
                    bytes = None;
                    annotations.extend(value.annotations().iter().cloned());
                }
            }
        }
        let words = (0..len)
            .step_by(32)
            .map(|chunk| self.chunk(offset + chunk, 32.min(len - chunk)).0)
            .collect();
        Region {
            bytes,
            words,
            annotations,
        }
    }

    fn chunk(&self, offset: usize, len: usize) -> (Word, AnnotationSet) {
        let mut annotations = AnnotationSet::new();
        let mut concrete = [0u8; 32];
        let mut parts = Vec::with_capacity(len);
        let mut symbolic = false;

        for i in 0..len {
            match self.cells.get(&(offset + i)) {
                Some(Cell::Byte(b)) => {
                    concrete[32 - len + i] = *b;
                    parts.push(Term::from_u64(*b as u64));
                }
                None => parts.push(Term::from_u64(0)),
                Some(Cell::Part(value, idx)) => {
                    symbolic = true;
                    annotations.extend(value.annotations().iter().cloned());
                    parts.push(Term::binary(Opcode::BYTE, &Term::from_u64(*idx as u64), value.word()));
                }
            }
        }

        if symbolic {
            (Term::concat(parts), annotations)
        } else {
            (Term::constant(U256::from_be_bytes(concrete)), annotations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::annotation::Annotation;

    fn symbolic(annotation: Annotation) -> Rc<StackValue> {
        let value = Rc::new(StackValue::new(Rc::new(Term::Env(Opcode::CALLER))));
        value.annotate(annotation);
        value
    }

    #[test]
    fn test_concrete_store_drops_annotations() {
        let mut memory = Memory::new();
        let value = Rc::new(StackValue::constant(U256::from(42)));
        value.annotate(Annotation::Role);
        memory.store_word(0x20, &value);
        let loaded = memory.load_word(0x20);
        assert_eq!(loaded.value(), Some(U256::from(42)));
        assert!(loaded.annotations().is_empty());
        assert_eq!(memory.concrete_word(0x20), Some(U256::from(42)));
        assert_eq!(memory.size(), 0x40);
    }

    #[test]
    fn test_symbolic_store_keeps_value() {
        let mut memory = Memory::new();
        let value = symbolic(Annotation::Caller);
        memory.store_word(0, &value);
        let loaded = memory.load_word(0);
        assert!(Rc::ptr_eq(&loaded, &value));
        assert!(memory.concrete_word(0).is_none());
    }

    #[test]
    fn test_region_collects_annotations_of_symbolic_bytes() {
        let mut memory = Memory::new();
        memory.store_word(0, &symbolic(Annotation::Input));
        memory.store_word(0x20, &Rc::new(StackValue::constant(U256::from(1))));
        let region = memory.read_region(0, 64);
        assert!(region.bytes.is_none());
        assert_eq!(region.words.len(), 2);
        assert_eq!(region.words[1].as_const(), Some(U256::from(1)));
        assert!(region.annotations.contains(&Annotation::Input));
    }

    #[test]
    fn test_unaligned_load_concatenates() {
        let mut memory = Memory::new();
        memory.store_word(0, &symbolic(Annotation::Caller));
        let loaded = memory.load_word(16);
        assert!(loaded.is_symbolic());
        assert!(loaded.has(&Annotation::Caller));
    }
}
