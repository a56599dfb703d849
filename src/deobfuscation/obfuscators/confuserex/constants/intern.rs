//! Shared interning of decrypted strings.

use std::sync::Arc;

use dashmap::DashMap;

/// A concurrent string intern table.
///
/// Equal strings decoded from any site, on any thread, come back as the same allocation,
/// matching the `String.Intern` call the decryptor performs at runtime.
#[derive(Debug, Default)]
pub struct StringInterner {
    strings: DashMap<Arc<str>, ()>,
}

impl StringInterner {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the canonical instance of `value`.
    pub fn intern(&self, value: &str) -> Arc<str> {
        if let Some(existing) = self.strings.get(value) {
            return Arc::clone(existing.key());
        }
        let entry = self.strings.entry(Arc::from(value)).or_insert(());
        Arc::clone(entry.key())
    }

    /// Number of distinct strings.
    #[must_use]
    pub fn len(&self) -> usize {
        self.strings.len()
    }

    /// Returns `true` if nothing was interned yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_allocation() {
        let interner = StringInterner::new();
        let a = interner.intern("hello");
        let b = interner.intern(&String::from("hello"));
        let c = interner.intern("world");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(interner.len(), 2);
    }

    #[test]
    fn test_concurrent_interning() {
        let interner = StringInterner::new();
        let results: Vec<Arc<str>> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| interner.intern("shared")))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(results.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(interner.len(), 1);
    }
}
