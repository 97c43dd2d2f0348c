//! Outgoing FIX record construction and inbound record framing.
//!
//! Records are SOH-delimited tag=value sequences prefixed with
//! `8=FIX.4.4|9=<bodyLen>|` and terminated by `10=<3-digit checksum>|` where
//! the checksum is the byte sum of everything before the checksum field,
//! mod 256.

use chrono::Utc;

use crate::parser::fix::SOH;

pub const BEGIN_STRING: &str = "FIX.4.4";

/// Message types this client emits or recognises.
pub const MSG_TYPE_LOGON: &str = "A";
pub const MSG_TYPE_MARKET_DATA_REQUEST: &str = "V";

/// Mod-256 byte-sum checksum, zero-padded to three digits.
pub fn checksum(bytes: &[u8]) -> String {
    let sum: u32 = bytes.iter().map(|&b| b as u32).sum();
    format!("{:03}", sum % 256)
}

/// FIX UTC sending time, `YYYYMMDD-HH:MM:SS.mmm`.
pub fn sending_time_utc() -> String {
    Utc::now().format("%Y%m%d-%H:%M:%S%.3f").to_string()
}

fn push_field(out: &mut Vec<u8>, tag: &str, value: &str) {
    out.extend_from_slice(tag.as_bytes());
    out.push(b'=');
    out.extend_from_slice(value.as_bytes());
    out.push(SOH);
}

/// Assemble a full record: standard header, caller-supplied body fields
/// (already SOH-delimited), length prefix and checksum trailer.
pub fn build_record(
    msg_type: &str,
    seq_num: u32,
    sender_comp_id: &str,
    target_comp_id: &str,
    body_fields: &[u8],
) -> Vec<u8> {
    let mut body = Vec::with_capacity(128 + body_fields.len());
    push_field(&mut body, "35", msg_type);
    push_field(&mut body, "49", sender_comp_id);
    push_field(&mut body, "56", target_comp_id);
    push_field(&mut body, "34", &seq_num.to_string());
    push_field(&mut body, "52", &sending_time_utc());
    body.extend_from_slice(body_fields);

    let mut record = Vec::with_capacity(body.len() + 32);
    push_field(&mut record, "8", BEGIN_STRING);
    push_field(&mut record, "9", &body.len().to_string());
    record.extend_from_slice(&body);

    let trailer = checksum(&record);
    push_field(&mut record, "10", &trailer);
    record
}

/// Logon body: `98=0` (no encryption), `108=<heartbeat>`.
pub fn logon_body(heartbeat_secs: u32) -> Vec<u8> {
    let mut body = Vec::new();
    push_field(&mut body, "98", "0");
    push_field(&mut body, "108", &heartbeat_secs.to_string());
    body
}

/// Market-data request body for one symbol: top-of-book snapshot plus
/// updates, both sides.
pub fn market_data_request_body(request_id: u32, symbol: &str) -> Vec<u8> {
    let mut body = Vec::new();
    push_field(&mut body, "262", &format!("req-{request_id}"));
    push_field(&mut body, "263", "1");
    push_field(&mut body, "264", "1");
    push_field(&mut body, "265", "0");
    push_field(&mut body, "267", "2");
    push_field(&mut body, "269", "0");
    push_field(&mut body, "269", "1");
    push_field(&mut body, "146", "1");
    push_field(&mut body, "55", symbol);
    push_field(&mut body, "460", "4");
    body
}

/// Index one past the end of the first complete record in `buf`: the first
/// `10=` followed by three digits and a SOH. `None` when only a partial
/// record has arrived.
pub fn find_record_end(buf: &[u8]) -> Option<usize> {
    let mut search = 0;
    while search + 7 <= buf.len() {
        let Some(rel) = find_subslice(&buf[search..], b"10=") else {
            return None;
        };
        let pos = search + rel;
        if pos + 7 <= buf.len()
            && buf[pos + 3].is_ascii_digit()
            && buf[pos + 4].is_ascii_digit()
            && buf[pos + 5].is_ascii_digit()
            && buf[pos + 6] == SOH
        {
            return Some(pos + 7);
        }
        search = pos + 1;
    }
    None
}

/// Whether a record is the counterparty's logon acknowledgement: `35=A` with
/// the comp ids mirrored back.
pub fn is_logon_ack(record: &[u8], sender_comp_id: &str, target_comp_id: &str) -> bool {
    let sender_field = format!("49={target_comp_id}");
    let target_field = format!("56={sender_comp_id}");
    find_subslice(record, b"35=A").is_some()
        && find_subslice(record, sender_field.as_bytes()).is_some()
        && find_subslice(record, target_field.as_bytes()).is_some()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn as_display(record: &[u8]) -> String {
        record
            .iter()
            .map(|&b| if b == SOH { '|' } else { b as char })
            .collect()
    }

    #[test]
    fn test_checksum_known_value() {
        // "8=FIX.4.4<SOH>" byte-sums to 545; 545 mod 256 = 33.
        assert_eq!(checksum(b"8=FIX.4.4\x01"), "033");
        assert_eq!(checksum(b""), "000");
    }

    #[test]
    fn test_checksum_is_zero_padded() {
        assert_eq!(checksum(&[1, 2]).len(), 3);
        assert_eq!(checksum(&[5]), "005");
    }

    #[test]
    fn test_build_record_shape() {
        let record = build_record("A", 1, "CLIENT", "SERVER", &logon_body(30));
        let text = as_display(&record);

        assert!(text.starts_with("8=FIX.4.4|9="));
        assert!(text.contains("|35=A|"));
        assert!(text.contains("|49=CLIENT|"));
        assert!(text.contains("|56=SERVER|"));
        assert!(text.contains("|34=1|"));
        assert!(text.contains("|52="));
        assert!(text.contains("|98=0|"));
        assert!(text.contains("|108=30|"));
        assert!(text.ends_with("|") && text.contains("|10="));
    }

    #[test]
    fn test_build_record_body_length_and_checksum() {
        let record = build_record("A", 7, "CLIENT", "SERVER", &logon_body(30));

        // Body length is everything between the 9= field's SOH and "10=".
        let text = String::from_utf8_lossy(&record).into_owned();
        let nine = text.find("9=").unwrap();
        let body_start = nine + text[nine..].find('\x01').unwrap() + 1;
        let ten = text.rfind("10=").unwrap();
        let declared: usize = text[nine + 2..body_start - 1].parse().unwrap();
        assert_eq!(declared, ten - body_start);

        // Checksum covers everything before the 10= field.
        let declared_sum = &text[ten + 3..ten + 6];
        assert_eq!(declared_sum, checksum(&record[..ten]));
    }

    #[test]
    fn test_built_record_is_a_complete_frame() {
        let record = build_record("V", 2, "CLIENT", "SERVER", &market_data_request_body(1, "EUR/USD"));
        assert_eq!(find_record_end(&record), Some(record.len()));
    }

    #[test]
    fn test_market_data_request_fields() {
        let text = as_display(&market_data_request_body(3, "EUR/USD"));
        assert_eq!(
            text,
            "262=req-3|263=1|264=1|265=0|267=2|269=0|269=1|146=1|55=EUR/USD|460=4|"
        );
    }

    #[test]
    fn test_find_record_end_partial_buffer() {
        let record = build_record("A", 1, "C", "S", &logon_body(30));
        for cut in [1, record.len() / 2, record.len() - 1] {
            assert_eq!(find_record_end(&record[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn test_find_record_end_two_records() {
        let first = build_record("A", 1, "C", "S", &logon_body(30));
        let second = build_record("V", 2, "C", "S", &market_data_request_body(1, "X"));
        let mut buf = first.clone();
        buf.extend_from_slice(&second);
        assert_eq!(find_record_end(&buf), Some(first.len()));
    }

    #[test]
    fn test_find_record_end_requires_three_digits() {
        // "10=" appearing as payload (e.g. inside 108=...) must not match.
        let buf = b"108=30\x0135=A\x01".to_vec();
        assert_eq!(find_record_end(&buf), None);
        let buf = b"10=ab1\x01".to_vec();
        assert_eq!(find_record_end(&buf), None);
        let buf = b"10=123\x01".to_vec();
        assert_eq!(find_record_end(&buf), Some(7));
    }

    #[test]
    fn test_logon_ack_detection() {
        // The ack mirrors comp ids: its 49 is our target, its 56 is us.
        let ack = build_record("A", 1, "SERVER", "CLIENT", &logon_body(30));
        assert!(is_logon_ack(&ack, "CLIENT", "SERVER"));
        // Our own logon is not an ack.
        let own = build_record("A", 1, "CLIENT", "SERVER", &logon_body(30));
        assert!(!is_logon_ack(&own, "CLIENT", "SERVER"));
        // A market-data record is not an ack either.
        let md = build_record("W", 2, "SERVER", "CLIENT", b"268=0\x01");
        assert!(!is_logon_ack(&md, "CLIENT", "SERVER"));
    }
}
