//! Storage for the scheduler graph.
//!
//! Messages, jobs, peers, entries, destinations and transports refer to each
//! other in every direction. Each kind lives in its own [`Arena`] keyed by a
//! typed id, and ordered collections are doubly linked lists threaded through
//! the values themselves ([`Link`] fields), so unlinking or splicing at any
//! position is O(1).
//!
//! A value can sit on several lists at once, one [`Link`] per list. The
//! [`Linkage`] trait picks which field a given list uses.

use std::{
    fmt,
    hash::Hash,
    marker::PhantomData,
    ops::{Index, IndexMut},
};

use ahash::AHashMap;

macro_rules! arena_id {
    ($($(#[$meta:meta])* $name:ident),* $(,)?) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(u64);

            impl From<u64> for $name {
                fn from(raw: u64) -> Self {
                    Self(raw)
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, "{}#{}", stringify!($name), self.0)
                }
            }
        )*
    };
}

arena_id!(
    /// An in-core message
    MessageId,
    /// A (message, transport) scheduling unit
    JobId,
    /// A (job, destination) grouping of entries
    PeerId,
    /// A batch of recipients for one delivery attempt
    EntryId,
    /// A per-nexthop queue inside a transport
    DestinationId,
    /// A named delivery channel
    TransportId,
    /// An open delivery agent connection
    SessionId,
);

/// Values addressed by a generated id. Ids are never reused.
pub struct Arena<K, V> {
    items: AHashMap<K, V>,
    next: u64,
}

impl<K, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self {
            items: AHashMap::default(),
            next: 1,
        }
    }
}

impl<K: fmt::Debug, V> fmt::Debug for Arena<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.items.len())
            .field("next", &self.next)
            .finish()
    }
}

impl<K: Copy + Eq + Hash + From<u64>, V> Arena<K, V> {
    /// Store a value built from its own id.
    pub fn insert_with(&mut self, build: impl FnOnce(K) -> V) -> K {
        let id = K::from(self.next);
        self.next += 1;
        self.items.insert(id, build(id));
        id
    }

    pub fn remove(&mut self, id: K) -> Option<V> {
        self.items.remove(&id)
    }

    pub fn get(&self, id: K) -> Option<&V> {
        self.items.get(&id)
    }

    pub fn get_mut(&mut self, id: K) -> Option<&mut V> {
        self.items.get_mut(&id)
    }

    pub fn contains(&self, id: K) -> bool {
        self.items.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.items.iter().map(|(id, value)| (*id, value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.items.values()
    }
}

impl<K: Copy + Eq + Hash + fmt::Display, V> Index<K> for Arena<K, V> {
    type Output = V;

    /// # Panics
    ///
    /// On a dangling id; that is a scheduler bookkeeping bug.
    fn index(&self, id: K) -> &V {
        match self.items.get(&id) {
            Some(value) => value,
            None => panic!("dangling reference to {id}"),
        }
    }
}

impl<K: Copy + Eq + Hash + fmt::Display, V> IndexMut<K> for Arena<K, V> {
    fn index_mut(&mut self, id: K) -> &mut V {
        match self.items.get_mut(&id) {
            Some(value) => value,
            None => panic!("dangling reference to {id}"),
        }
    }
}

/// Neighbours of a value on one list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link<K> {
    pub prev: Option<K>,
    pub next: Option<K>,
}

impl<K> Default for Link<K> {
    fn default() -> Self {
        Self {
            prev: None,
            next: None,
        }
    }
}

/// Selects the [`Link`] field of `V` that a particular list threads through.
pub trait Linkage<K, V> {
    fn link(value: &V) -> &Link<K>;
    fn link_mut(value: &mut V) -> &mut Link<K>;
}

/// Head and tail of a list threaded through `Arena<K, V>` via linkage `L`.
pub struct List<K, L> {
    head: Option<K>,
    tail: Option<K>,
    len: usize,
    linkage: PhantomData<L>,
}

impl<K, L> Default for List<K, L> {
    fn default() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
            linkage: PhantomData,
        }
    }
}

impl<K: fmt::Debug, L> fmt::Debug for List<K, L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("List")
            .field("head", &self.head)
            .field("tail", &self.tail)
            .field("len", &self.len)
            .finish()
    }
}

impl<K, L> List<K, L>
where
    K: Copy + Eq + Hash + From<u64> + fmt::Display,
{
    pub const fn head(&self) -> Option<K> {
        self.head
    }

    pub const fn tail(&self) -> Option<K> {
        self.tail
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn next<V>(arena: &Arena<K, V>, id: K) -> Option<K>
    where
        L: Linkage<K, V>,
    {
        L::link(&arena[id]).next
    }

    pub fn prev<V>(arena: &Arena<K, V>, id: K) -> Option<K>
    where
        L: Linkage<K, V>,
    {
        L::link(&arena[id]).prev
    }

    /// Link `id` between `prev` and `next`, which must be adjacent (or the
    /// list ends when `None`).
    pub fn link_between<V>(&mut self, arena: &mut Arena<K, V>, prev: Option<K>, id: K, next: Option<K>)
    where
        L: Linkage<K, V>,
    {
        {
            let link = L::link_mut(&mut arena[id]);
            link.prev = prev;
            link.next = next;
        }
        match prev {
            Some(prev) => L::link_mut(&mut arena[prev]).next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(next) => L::link_mut(&mut arena[next]).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
    }

    pub fn append<V>(&mut self, arena: &mut Arena<K, V>, id: K)
    where
        L: Linkage<K, V>,
    {
        let tail = self.tail;
        self.link_between(arena, tail, id, None);
    }

    pub fn prepend<V>(&mut self, arena: &mut Arena<K, V>, id: K)
    where
        L: Linkage<K, V>,
    {
        let head = self.head;
        self.link_between(arena, None, id, head);
    }

    /// Insert `id` directly ahead of `before`.
    pub fn insert_before<V>(&mut self, arena: &mut Arena<K, V>, before: K, id: K)
    where
        L: Linkage<K, V>,
    {
        let prev = L::link(&arena[before]).prev;
        self.link_between(arena, prev, id, Some(before));
    }

    pub fn unlink<V>(&mut self, arena: &mut Arena<K, V>, id: K)
    where
        L: Linkage<K, V>,
    {
        let Link { prev, next } = std::mem::take(L::link_mut(&mut arena[id]));
        match prev {
            Some(prev) => L::link_mut(&mut arena[prev]).next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => L::link_mut(&mut arena[next]).prev = prev,
            None => self.tail = prev,
        }
        self.len -= 1;
    }

    /// Rotate so that `id` becomes the tail; everything after it moves to
    /// the front in order.
    pub fn rotate<V>(&mut self, arena: &mut Arena<K, V>, id: K)
    where
        L: Linkage<K, V>,
    {
        let (Some(head), Some(tail)) = (self.head, self.tail) else {
            return;
        };
        let Some(after) = L::link(&arena[id]).next else {
            return;
        };

        L::link_mut(&mut arena[tail]).next = Some(head);
        L::link_mut(&mut arena[head]).prev = Some(tail);
        L::link_mut(&mut arena[after]).prev = None;
        L::link_mut(&mut arena[id]).next = None;
        self.head = Some(after);
        self.tail = Some(id);
    }

    /// Snapshot of the ids in order, for walks that may mutate the list.
    pub fn ids<V>(&self, arena: &Arena<K, V>) -> Vec<K>
    where
        L: Linkage<K, V>,
    {
        let mut ids = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(id) = cursor {
            ids.push(id);
            cursor = L::link(&arena[id]).next;
        }
        ids
    }
}

/// Declare the [`Linkage`] marker for one [`Link`] field.
macro_rules! define_linkage {
    ($(#[$meta:meta])* $marker:ident: $key:ty, $value:ty => $field:ident) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $marker;

        impl $crate::arena::Linkage<$key, $value> for $marker {
            fn link(value: &$value) -> &$crate::arena::Link<$key> {
                &value.$field
            }

            fn link_mut(value: &mut $value) -> &mut $crate::arena::Link<$key> {
                &mut value.$field
            }
        }
    };
}

pub(crate) use define_linkage;

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[derive(Default)]
    struct Node {
        link: Link<JobId>,
    }

    struct Order;

    impl Linkage<JobId, Node> for Order {
        fn link(value: &Node) -> &Link<JobId> {
            &value.link
        }

        fn link_mut(value: &mut Node) -> &mut Link<JobId> {
            &mut value.link
        }
    }

    fn setup(count: usize) -> (Arena<JobId, Node>, List<JobId, Order>, Vec<JobId>) {
        let mut arena = Arena::default();
        let mut list = List::default();
        let ids: Vec<JobId> = (0..count).map(|_| arena.insert_with(|_| Node::default())).collect();
        for id in &ids {
            list.append(&mut arena, *id);
        }
        (arena, list, ids)
    }

    #[test]
    fn test_append_prepend_unlink() {
        let (mut arena, mut list, ids) = setup(3);
        assert_eq!(list.ids(&arena), ids);

        list.unlink(&mut arena, ids[1]);
        assert_eq!(list.ids(&arena), vec![ids[0], ids[2]]);
        assert_eq!(list.len(), 2);

        list.prepend(&mut arena, ids[1]);
        assert_eq!(list.ids(&arena), vec![ids[1], ids[0], ids[2]]);

        list.unlink(&mut arena, ids[2]);
        assert_eq!(list.tail(), Some(ids[0]));
        list.unlink(&mut arena, ids[1]);
        list.unlink(&mut arena, ids[0]);
        assert!(list.is_empty());
        assert_eq!(list.tail(), None);
    }

    #[test]
    fn test_insert_before() {
        let (mut arena, mut list, ids) = setup(2);
        let extra = arena.insert_with(|_| Node::default());
        list.insert_before(&mut arena, ids[0], extra);
        assert_eq!(list.ids(&arena), vec![extra, ids[0], ids[1]]);
        assert_eq!(List::<JobId, Order>::prev(&arena, ids[0]), Some(extra));

        let last = arena.insert_with(|_| Node::default());
        list.insert_before(&mut arena, ids[1], last);
        assert_eq!(list.ids(&arena), vec![extra, ids[0], last, ids[1]]);
    }

    #[test]
    fn test_rotate() {
        let (mut arena, mut list, ids) = setup(4);
        list.rotate(&mut arena, ids[1]);
        assert_eq!(list.ids(&arena), vec![ids[2], ids[3], ids[0], ids[1]]);

        // Rotating the tail is a no-op
        list.rotate(&mut arena, ids[1]);
        assert_eq!(list.ids(&arena), vec![ids[2], ids[3], ids[0], ids[1]]);
        assert_eq!(List::<JobId, Order>::prev(&arena, ids[2]), None);
        assert_eq!(List::<JobId, Order>::next(&arena, ids[1]), None);
    }

    #[test]
    #[should_panic(expected = "dangling reference")]
    fn test_dangling_index_panics() {
        let mut arena: Arena<JobId, Node> = Arena::default();
        let id = arena.insert_with(|_| Node::default());
        arena.remove(id);
        let _ = &arena[id];
    }
}
