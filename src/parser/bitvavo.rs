//! Bitvavo book-frame parser.
//!
//! Frames are UTF-8 JSON. Field extraction is anchor-based rather than a full
//! JSON parse: the hot path only ever needs the first `[price, qty]` pair of
//! `"bids"` or `"asks"`. The anchor is the exact byte pattern `"<key>":[[`;
//! whitespace inside the anchor fails closed.

use chrono::Utc;
use tracing::debug;

use crate::quote::{Quote, Side};

const BOOK_EVENT: &str = r#""event":"book""#;
const BIDS_ANCHOR: &str = r#""bids":[["#;
const ASKS_ANCHOR: &str = r#""asks":[["#;

/// Parse a book frame into the first-level quote it carries.
///
/// Returns the first valid bid level if present, otherwise the first valid
/// ask level, otherwise `None`. Non-book events and malformed frames yield
/// `None`; the pipeline drops them and carries on.
pub fn parse_book_frame(frame: &[u8], market: &str) -> Option<Quote> {
    let text = std::str::from_utf8(frame).ok()?;
    if !text.contains(BOOK_EVENT) {
        return None;
    }

    let now = Utc::now();

    if let Some((price, qty)) = first_level(text, BIDS_ANCHOR) {
        return Some(Quote::new(price, qty, now, market, Side::Bid));
    }
    if let Some((price, qty)) = first_level(text, ASKS_ANCHOR) {
        return Some(Quote::new(price, qty, now, market, Side::Ask));
    }

    let mut preview_end = text.len().min(200);
    while !text.is_char_boundary(preview_end) {
        preview_end -= 1;
    }
    debug!(
        market,
        frame = &text[..preview_end],
        "book frame without a usable first level"
    );
    None
}

/// Extract the first `[price, qty]` pair following `anchor`.
fn first_level(frame: &str, anchor: &str) -> Option<(f64, f64)> {
    let start = frame.find(anchor)? + anchor.len();
    let end = frame[start..].find(']')?;
    let inner = &frame[start..start + end];

    let mut parts = inner.splitn(2, ',');
    let price = parse_decimal(parts.next()?)?;
    let qty = parse_decimal(parts.next()?)?;
    Some((price, qty))
}

/// Strict decimal parse: quotes and surrounding whitespace are stripped, but
/// an empty value or trailing non-numeric characters reject the frame.
fn parse_decimal(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_matches('"');
    if trimmed.is_empty() {
        return None;
    }
    let value: f64 = fast_float::parse(trimmed).ok()?;
    value.is_finite().then_some(value)
}

/// Numeric `nonce` field of a frame: the digits following `"nonce":`, zero
/// when the field is absent or does not start with a digit. Consumers use it
/// for gap detection; the core does not enforce it.
pub fn extract_nonce(frame: &str) -> u64 {
    let Some(pos) = frame.find(r#""nonce":"#) else {
        return 0;
    };
    let mut value = 0u64;
    for b in frame[pos + 8..].bytes() {
        if b.is_ascii_digit() {
            value = value * 10 + (b - b'0') as u64;
        } else {
            break;
        }
    }
    value
}
