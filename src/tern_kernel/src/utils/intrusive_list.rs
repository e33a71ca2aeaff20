//! Intrusive circular doubly-linked list backed by a container implementing
//! `core::ops::Index`.
//!
//! Links live inside the host objects, so insertion and removal never
//! allocate. A host is recovered from an index (usually [`Ident`], a
//! reference wrapper compared by address), and removal of an arbitrary
//! entry needs no reference to the list head.
#![allow(dead_code)]
use core::{fmt, ops};

use super::Init;

/// Circular linked list header.
#[derive(Copy, Clone)]
pub struct ListHead<Index> {
    pub first: Option<Index>,
}

impl<Index: fmt::Debug> fmt::Debug for ListHead<Index> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ListHead({:?})", &self.first)
    }
}

impl<Index> Init for ListHead<Index> {
    const INIT: Self = Self { first: None };
}

impl<Index> ListHead<Index> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn is_empty(&self) -> bool {
        self.first.is_none()
    }
}

/// Links to neighbor items.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Link<Index> {
    pub prev: Index,
    pub next: Index,
}

/// Reference wrapper that implements `PartialEq` and `Eq` by identity
/// comparison.
#[derive(Clone, Copy)]
pub struct Ident<T>(pub T);

impl<T> fmt::Debug for Ident<&'_ T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        // Do not print the pointee; the lists formed by these links are
        // circular, which would recurse forever.
        f.debug_tuple("Ident").field(&(self.0 as *const T)).finish()
    }
}

impl<T: ?Sized> PartialEq for Ident<&'_ T> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.0, other.0)
    }
}

impl<T: ?Sized> Eq for Ident<&'_ T> {}

/// A virtual container of `T`s that can be indexed by `Ident<&'static T>`.
#[derive(Debug, Clone, Copy)]
pub struct Static;

impl<T> ops::Index<Ident<&'static T>> for Static {
    type Output = T;

    #[inline]
    fn index(&self, index: Ident<&'static T>) -> &Self::Output {
        index.0
    }
}

/// Circular linked list header where elements are linked by
/// [`StaticLink`]`<Element>` (a pair of `&'static Element`).
pub type StaticListHead<Element> = ListHead<Ident<&'static Element>>;

/// Links to neighbor items with a `'static` lifetime.
pub type StaticLink<Element> = Link<Ident<&'static Element>>;

/// A cell whose contents are readable and writable given a key of type
/// `Key`. The kernel instantiates this with the CPU Lock token; unit tests
/// use plain `Cell`s with a `()` key.
pub trait CellLike<Key> {
    type Target;

    fn get(&self, key: &Key) -> Self::Target;
    fn set(&self, key: &mut Key, value: Self::Target);

    #[inline]
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T
    where
        Self: Sized,
    {
        let mut x = self.get(key);
        let ret = f(&mut x);
        self.set(key, x);
        ret
    }
}

impl<Element: Copy> CellLike<()> for core::cell::Cell<Element> {
    type Target = Element;

    fn get(&self, _: &()) -> Self::Target {
        self.get()
    }
    fn set(&self, _: &mut (), value: Self::Target) {
        self.set(value);
    }
}

impl<Key, Element: CellLike<Key>> CellLike<Key> for &Element {
    type Target = Element::Target;

    fn get(&self, key: &Key) -> Self::Target {
        (*self).get(key)
    }
    fn set(&self, key: &mut Key, value: Self::Target) {
        (*self).set(key, value);
    }
    fn modify<T>(&self, key: &mut Key, f: impl FnOnce(&mut Self::Target) -> T) -> T {
        (*self).modify(key, f)
    }
}

/// `Cell`-based accessor to a linked list.
///
/// The list is assumed to be structurally sound; violations are caught by
/// debug assertions only.
pub struct ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey> {
    head: HeadCell,
    pool: &'a Pool,
    map_link: MapLink,
    cell_key: CellKey,
}

impl<'a, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey>
    ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    pub fn new(head: HeadCell, pool: &'a Pool, map_link: MapLink, cell_key: CellKey) -> Self {
        ListAccessorCell {
            head,
            pool,
            map_link,
            cell_key,
        }
    }

    pub fn head(&self) -> ListHead<Index> {
        self.head.get(&self.cell_key)
    }

    pub fn set_head(&mut self, head: ListHead<Index>) {
        self.head.set(&mut self.cell_key, head);
    }

    pub fn pool(&self) -> &Pool {
        self.pool
    }

    pub fn cell_key(&self) -> &CellKey {
        &self.cell_key
    }

    pub fn is_empty(&self) -> bool {
        self.head().is_empty()
    }

    /// Is `item` currently linked into some list?
    pub fn is_linked(&self, item: Index) -> bool {
        (self.map_link)(&self.pool[item]).get(&self.cell_key).is_some()
    }

    #[inline]
    pub fn front(&self) -> Option<Index> {
        self.head().first
    }

    #[inline]
    pub fn back(&self) -> Option<Index> {
        self.head().first.map(|first| {
            let link = (self.map_link)(&self.pool[first]).get(&self.cell_key);
            debug_assert!(link.is_some(), "first item is unlinked");
            link.unwrap().prev
        })
    }

    #[inline]
    pub fn front_data(&self) -> Option<&Element> {
        self.front().map(|p| &self.pool[p])
    }

    /// Insert `item` before the position `p` (if `at` is `Some(p)`) or at
    /// the list's back (if `at` is `None`).
    pub fn insert(&mut self, item: Index, at: Option<Index>) {
        debug_assert!(!self.is_linked(item.clone()), "item is already linked");

        let mut head = self.head();

        if let Some(first) = head.first {
            let (next, update_first) = if let Some(at) = at {
                let update_first = at == first;
                (at, update_first)
            } else {
                (first, false)
            };

            let link = (self.map_link)(&self.pool[next.clone()]).get(&self.cell_key);
            debug_assert!(link.is_some(), "insertion point is unlinked");
            let prev = link.unwrap().prev;

            // prev.next = item
            (self.map_link)(&self.pool[prev.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().next = item.clone();
            });

            // next.prev = item
            (self.map_link)(&self.pool[next.clone()]).modify(&mut self.cell_key, |l| {
                l.as_mut().unwrap().prev = item.clone();
            });

            (self.map_link)(&self.pool[item.clone()])
                .set(&mut self.cell_key, Some(Link { prev, next }));

            if update_first {
                head.first = Some(item);
                self.set_head(head);
            }
        } else {
            debug_assert!(at.is_none());

            (self.map_link)(&self.pool[item.clone()]).set(
                &mut self.cell_key,
                Some(Link {
                    prev: item.clone(),
                    next: item.clone(),
                }),
            );

            head.first = Some(item);
            self.set_head(head);
        }
    }

    #[inline]
    pub fn push_back(&mut self, item: Index) {
        self.insert(item, None);
    }

    #[inline]
    pub fn push_front(&mut self, item: Index) {
        let at = self.front();
        self.insert(item, at);
    }

    /// Remove `item` from the list. Returns `false` if `item` was not
    /// linked.
    pub fn remove(&mut self, item: Index) -> bool {
        let link = match (self.map_link)(&self.pool[item.clone()]).get(&self.cell_key) {
            Some(link) => link,
            None => return false,
        };

        let mut head = self.head();
        if head.first.as_ref() == Some(&item) {
            if link.next == item {
                // The list just became empty
                head.first = None;
                self.set_head(head);
                (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);
                return true;
            }

            // Move the head pointer
            head.first = Some(link.next.clone());
            self.set_head(head);
        }

        // link.prev.next = link.next
        (self.map_link)(&self.pool[link.prev.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().next = link.next.clone();
        });

        // link.next.prev = link.prev
        (self.map_link)(&self.pool[link.next.clone()]).modify(&mut self.cell_key, |l| {
            l.as_mut().unwrap().prev = link.prev.clone();
        });

        (self.map_link)(&self.pool[item]).set(&mut self.cell_key, None);

        true
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<Index> {
        let first = self.front()?;
        self.remove(first.clone());
        Some(first)
    }

    #[inline]
    pub fn pop_back(&mut self) -> Option<Index> {
        let last = self.back()?;
        self.remove(last.clone());
        Some(last)
    }

    /// Get the next element of the specified element, `None` when `i` is
    /// the last element.
    #[inline]
    pub fn next(&self, i: Index) -> Option<Index> {
        let link = (self.map_link)(&self.pool[i]).get(&self.cell_key);
        debug_assert!(link.is_some(), "item is unlinked");
        let next = link.unwrap().next;
        if Some(&next) == self.head().first.as_ref() {
            None
        } else {
            Some(next)
        }
    }

    pub fn iter(&self) -> Iter<'_, Self, Index> {
        Iter {
            next: self.head().first,
            accessor: self,
        }
    }
}

/// An iterator over the elements of `ListAccessorCell`.
pub struct Iter<'b, Accessor, Index> {
    accessor: &'b Accessor,
    next: Option<Index>,
}

impl<'a, 'b, HeadCell, Index, Pool, MapLink, Element, LinkCell, CellKey> Iterator
    for Iter<'b, ListAccessorCell<'a, HeadCell, Pool, MapLink, CellKey>, Index>
where
    HeadCell: CellLike<CellKey, Target = ListHead<Index>>,
    Pool: ops::Index<Index, Output = Element>,
    MapLink: Fn(&Element) -> &LinkCell,
    Element: 'a,
    LinkCell: CellLike<CellKey, Target = Option<Link<Index>>>,
    Index: PartialEq + Clone,
{
    type Item = Index;

    fn next(&mut self) -> Option<Self::Item> {
        let next = self.next.take()?;
        self.next = self.accessor.next(next.clone());
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;
    use std::cell::Cell;
    use std::collections::VecDeque;

    fn push<Element>(this: &mut Vec<Element>, x: Element) -> usize {
        let i = this.len();
        this.push(x);
        i
    }

    macro_rules! get_accessor {
        ($head:expr, $pool:expr) => {
            ListAccessorCell::new($head, $pool, |(_, link): &(i32, _)| link, ())
        };
    }

    #[test]
    fn basic() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let ptr1 = push(&mut pool, (1, Cell::new(None)));
        get_accessor!(&head, &pool).push_back(ptr1);

        let ptr2 = push(&mut pool, (2, Cell::new(None)));
        get_accessor!(&head, &pool).push_back(ptr2);

        let ptr3 = push(&mut pool, (3, Cell::new(None)));
        get_accessor!(&head, &pool).push_front(ptr3);

        let mut accessor = get_accessor!(&head, &pool);
        assert!(!accessor.is_empty());
        assert_eq!(accessor.front(), Some(ptr3));
        assert_eq!(accessor.back(), Some(ptr2));
        assert_eq!(accessor.front_data().unwrap().0, 3);

        let items: Vec<_> = accessor.iter().map(|i| pool[i].0).collect();
        assert_eq!(items, vec![3, 1, 2]);

        assert!(accessor.remove(ptr1));
        assert!(accessor.remove(ptr2));
        assert!(accessor.remove(ptr3));
        assert!(!accessor.remove(ptr3));
        assert!(accessor.is_empty());
    }

    #[test]
    fn insert_before() {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());

        let a = push(&mut pool, (10, Cell::new(None)));
        let b = push(&mut pool, (30, Cell::new(None)));
        let c = push(&mut pool, (20, Cell::new(None)));

        let mut accessor = get_accessor!(&head, &pool);
        accessor.push_back(a);
        accessor.push_back(b);
        accessor.insert(c, Some(b));

        let items: Vec<_> = accessor.iter().map(|i| pool[i].0).collect();
        assert_eq!(items, vec![10, 20, 30]);
    }

    /// Random operation sequences agree with a `VecDeque` model.
    #[quickcheck]
    fn model(ops: Vec<u8>) {
        let mut pool = Vec::new();
        let head = Cell::new(ListHead::new());
        for i in 0..8 {
            push(&mut pool, (i as i32, Cell::new(None)));
        }

        let mut model: VecDeque<usize> = VecDeque::new();

        for op in ops {
            let mut accessor = get_accessor!(&head, &pool);
            match op % 4 {
                0 => {
                    let item = (op as usize / 4) % pool.len();
                    if !model.contains(&item) {
                        accessor.push_back(item);
                        model.push_back(item);
                    }
                }
                1 => {
                    let item = (op as usize / 4) % pool.len();
                    if !model.contains(&item) {
                        accessor.push_front(item);
                        model.push_front(item);
                    }
                }
                2 => {
                    assert_eq!(accessor.pop_front(), model.pop_front());
                }
                _ => {
                    let item = (op as usize / 4) % pool.len();
                    let in_model = model.contains(&item);
                    assert_eq!(accessor.remove(item), in_model);
                    model.retain(|&x| x != item);
                }
            }

            let items: Vec<_> = accessor.iter().collect();
            assert_eq!(items, Vec::from_iter(model.iter().cloned()));
            assert_eq!(accessor.front(), model.front().cloned());
            assert_eq!(accessor.back(), model.back().cloned());
        }
    }
}
