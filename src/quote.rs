//! Quote value record shared by parsers, queues and the order book.
//!
//! A `Quote` is a plain `Copy` struct so it can travel through the SPSC rings
//! without touching the heap. The symbol is stored inline with a fixed upper
//! bound instead of a `String` for the same reason.

use chrono::{DateTime, Utc};

/// Maximum symbol length in bytes; longer market ids are truncated.
pub const SYMBOL_MAX_LEN: usize = 32;

/// Which side of the book a quote belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Bid,
    Ask,
}

/// Fixed-capacity inline symbol (e.g. "BTC-EUR", "EUR/USD").
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Symbol {
    bytes: [u8; SYMBOL_MAX_LEN],
    len: u8,
}

impl Symbol {
    pub fn new(s: &str) -> Self {
        let mut bytes = [0u8; SYMBOL_MAX_LEN];
        // Truncate on a char boundary so the stored bytes stay valid UTF-8.
        let mut len = s.len().min(SYMBOL_MAX_LEN);
        while len > 0 && !s.is_char_boundary(len) {
            len -= 1;
        }
        bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        Self {
            bytes,
            len: len as u8,
        }
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: `new` only stores bytes up to a char boundary of a valid &str.
        unsafe { std::str::from_utf8_unchecked(&self.bytes[..self.len as usize]) }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Symbol({})", self.as_str())
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

/// A single price-level update produced by a venue parser.
///
/// `size == 0.0` is the canonical "delete this price level" signal.
#[derive(Debug, Clone, Copy)]
pub struct Quote {
    pub price: f64,
    pub size: f64,
    pub timestamp: DateTime<Utc>,
    pub symbol: Symbol,
    pub side: Side,
}

impl Quote {
    pub fn new(price: f64, size: f64, timestamp: DateTime<Utc>, symbol: &str, side: Side) -> Self {
        Self {
            price,
            size,
            timestamp,
            symbol: Symbol::new(symbol),
            side,
        }
    }

    /// Whether this quote deletes its price level rather than setting it.
    #[inline]
    pub fn is_delete(&self) -> bool {
        self.size == 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_roundtrip() {
        let sym = Symbol::new("BTC-EUR");
        assert_eq!(sym.as_str(), "BTC-EUR");
        assert!(!sym.is_empty());
    }

    #[test]
    fn test_symbol_truncates_long_input() {
        let long = "X".repeat(100);
        let sym = Symbol::new(&long);
        assert_eq!(sym.as_str().len(), SYMBOL_MAX_LEN);
    }

    #[test]
    fn test_symbol_truncates_on_char_boundary() {
        // 31 ASCII bytes followed by a 2-byte char straddling the limit.
        let s = format!("{}é", "a".repeat(31));
        let sym = Symbol::new(&s);
        assert_eq!(sym.as_str(), "a".repeat(31));
    }

    #[test]
    fn test_quote_delete_flag() {
        let q = Quote::new(101.5, 0.0, Utc::now(), "BTC-EUR", Side::Bid);
        assert!(q.is_delete());
        let q = Quote::new(101.5, 0.25, Utc::now(), "BTC-EUR", Side::Ask);
        assert!(!q.is_delete());
    }
}
