//! FIX-like tag-value parser for market-data records.
//!
//! Accepts snapshot (`35=W`) and incremental (`35=X`) records and returns the
//! first repeating `269/270/271` entry as a quote. Numeric parsing is
//! prefix-tolerant the way `strtod` is: trailing non-numeric characters do
//! not fail the record. The side contract is deliberately lenient: `269=0`
//! is a bid, any other value is an ask.

use std::collections::HashMap;

use chrono::Utc;

use crate::quote::{Quote, Side};

/// Field terminator byte.
pub const SOH: u8 = 0x01;
const SOH_CHAR: char = '\x01';

/// Parse one SOH-delimited record into a quote, or `None` for anything that
/// is not a usable market-data record.
pub fn parse_record(record: &[u8]) -> Option<Quote> {
    let text = std::str::from_utf8(record).ok()?;

    let fields = scan_fields(text);

    let msg_type = *fields.get("35")?;
    if msg_type != "X" && msg_type != "W" {
        return None;
    }

    let symbol = fields.get("55").copied().unwrap_or("");
    let num_entries: u32 = lenient_u32(*fields.get("268")?)?;
    if num_entries == 0 {
        return None;
    }

    // First repeating group entry only; positional scan past the 268 field.
    let group_start = text.find("268=")?;
    let entry = group_start + text[group_start..].find("269=")?;
    let side_value = text.get(entry + 4..entry + 5)?;
    let side = if side_value == "0" { Side::Bid } else { Side::Ask };

    let price = entry_field(text, entry, "270=")?;
    let size = entry_field(text, entry, "271=")?;

    Some(Quote::new(price, size, Utc::now(), symbol, side))
}

/// Tag→value map of a record. Repeated tags keep the last occurrence, which
/// is why the repeating group is re-scanned positionally above.
fn scan_fields(text: &str) -> HashMap<&str, &str> {
    let mut fields = HashMap::new();
    let mut pos = 0;
    while pos < text.len() {
        let Some(eq) = text[pos..].find('=') else {
            break;
        };
        let eq = pos + eq;
        let Some(soh) = text[eq..].find(SOH_CHAR) else {
            break;
        };
        let soh = eq + soh;
        fields.insert(&text[pos..eq], &text[eq + 1..soh]);
        pos = soh + 1;
    }
    fields
}

/// Value of `tag` (e.g. `"270="`) at or after `from`, parsed leniently.
fn entry_field(text: &str, from: usize, tag: &str) -> Option<f64> {
    let start = from + text[from..].find(tag)? + tag.len();
    let end = start + text[start..].find(SOH_CHAR)?;
    lenient_f64(&text[start..end])
}

/// `strtod`-style parse: consume the longest numeric prefix, fail only when
/// no digits were consumed at all.
fn lenient_f64(s: &str) -> Option<f64> {
    let (value, consumed) = fast_float::parse_partial::<f64, _>(s).ok()?;
    (consumed > 0).then_some(value)
}

/// `stoi`-style parse: leading sign and digits, trailing junk ignored.
fn lenient_u32(s: &str) -> Option<u32> {
    let digits: &str = {
        let end = s
            .bytes()
            .position(|b| !b.is_ascii_digit())
            .unwrap_or(s.len());
        &s[..end]
    };
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
