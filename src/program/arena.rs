use core::hash::Hash;
use core::marker::PhantomData;
use std::fmt;

/// Typed index into an [`Arena`].
pub struct Id<T> {
    index: u32,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub fn from_index(index: usize) -> Self {
        Self {
            index: index as u32,
            _phantom: PhantomData,
        }
    }

    pub fn index(self) -> usize {
        self.index as usize
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Id<T> {}
impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index.eq(&other.index)
    }
}
impl<T> Eq for Id<T> {}
impl<T> Hash for Id<T> {
    fn hash<H: std::hash::Hasher>(&self, h: &mut H) {
        self.index.hash(h);
    }
}
impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.index)
    }
}

/// Append-only storage addressed by [`Id`]. Ids are dense and follow
/// insertion order, which the serializer relies on for table indices.
#[derive(Debug, Clone, PartialEq)]
pub struct Arena<T> {
    store: Vec<T>,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self { store: vec![] }
    }

    pub fn alloc(&mut self, value: T) -> Id<T> {
        let id = Id::from_index(self.store.len());
        self.store.push(value);
        id
    }

    pub fn get(&self, id: Id<T>) -> Option<&T> {
        self.store.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Id<T>, &T)> {
        self.store
            .iter()
            .enumerate()
            .map(|(index, value)| (Id::from_index(index), value))
    }
}

impl<T> core::ops::Index<Id<T>> for Arena<T> {
    type Output = T;
    fn index(&self, id: Id<T>) -> &Self::Output {
        self.store.index(id.index())
    }
}

impl<T> core::ops::IndexMut<Id<T>> for Arena<T> {
    fn index_mut(&mut self, id: Id<T>) -> &mut Self::Output {
        self.store.index_mut(id.index())
    }
}
