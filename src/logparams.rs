//! Decoding of the `log_params` column for deletion log rows.
//!
//! Two generations of encoding exist side by side on the replicas:
//!
//! 1. The PHP-serialized associative form, e.g.
//!    `a:3:{s:6:"4::ids";a:1:{i:0;s:7:"1234567";}s:9:"5::ofield";i:1;s:9:"6::nfield";i:0;}`
//!    where keys carry an `N::name` prefix for message interpolation.
//! 2. The legacy newline form: the target kind on the first line, the
//!    revision ids on the second, then `ofield=`/`nfield=` lines with the
//!    old and new deletion bitmasks.
//!
//! Both decode into [`DeletionParams`]. Unparseable or empty payloads yield
//! `None`, which callers treat as a scrubbed (suppressed) cause.

use crate::models::{DeletionFlags, DeletionParams};

/// Minimal PHP-serialize value tree: just what deletion entries use.
#[derive(Debug, Clone, PartialEq)]
enum PhpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Array(Vec<(PhpValue, PhpValue)>),
}

impl PhpValue {
    fn as_int(&self) -> Option<i64> {
        match self {
            PhpValue::Int(value) => Some(*value),
            PhpValue::Str(value) => value.parse().ok(),
            _ => None,
        }
    }

    fn as_str(&self) -> Option<&str> {
        match self {
            PhpValue::Str(value) => Some(value),
            _ => None,
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            bytes: input.as_bytes(),
            pos: 0,
        }
    }

    fn expect(&mut self, byte: u8) -> Option<()> {
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Some(())
        } else {
            None
        }
    }

    /// Reads up to the next `stop` byte, leaving the cursor past it.
    fn take_until(&mut self, stop: u8) -> Option<&'a str> {
        let start = self.pos;
        while *self.bytes.get(self.pos)? != stop {
            self.pos += 1;
        }
        let end = self.pos;
        self.pos += 1;
        std::str::from_utf8(&self.bytes[start..end]).ok()
    }

    fn take_bytes(&mut self, len: usize) -> Option<&'a str> {
        let end = self.pos.checked_add(len)?;
        if end > self.bytes.len() {
            return None;
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        std::str::from_utf8(slice).ok()
    }

    fn parse_value(&mut self) -> Option<PhpValue> {
        let tag = *self.bytes.get(self.pos)?;
        self.pos += 1;
        match tag {
            b'N' => {
                self.expect(b';')?;
                Some(PhpValue::Null)
            }
            b'b' => {
                self.expect(b':')?;
                let raw = self.take_until(b';')?;
                Some(PhpValue::Bool(raw == "1"))
            }
            b'i' => {
                self.expect(b':')?;
                let raw = self.take_until(b';')?;
                Some(PhpValue::Int(raw.parse().ok()?))
            }
            b'd' => {
                self.expect(b':')?;
                let raw = self.take_until(b';')?;
                Some(PhpValue::Float(raw.parse().ok()?))
            }
            b's' => {
                self.expect(b':')?;
                let len: usize = self.take_until(b':')?.parse().ok()?;
                self.expect(b'"')?;
                let value = self.take_bytes(len)?.to_string();
                self.expect(b'"')?;
                self.expect(b';')?;
                Some(PhpValue::Str(value))
            }
            b'a' => {
                self.expect(b':')?;
                let count: usize = self.take_until(b':')?.parse().ok()?;
                self.expect(b'{')?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.parse_value()?;
                    let value = self.parse_value()?;
                    entries.push((key, value));
                }
                self.expect(b'}')?;
                Some(PhpValue::Array(entries))
            }
            _ => None,
        }
    }
}

/// Strips the `N::` international prefix from an associative key.
fn key_name(key: &PhpValue) -> Option<&str> {
    let name = key.as_str()?;
    Some(name.rsplit("::").next().unwrap_or(name))
}

fn parse_php_form(raw: &str) -> Option<DeletionParams> {
    let mut cursor = Cursor::new(raw);
    let PhpValue::Array(entries) = cursor.parse_value()? else {
        return None;
    };

    let mut kind = "revision".to_string();
    let mut ids = None;
    let mut old_bits = 0;
    let mut new_bits = 0;

    for (key, value) in &entries {
        match key_name(key)? {
            "type" => kind = value.as_str()?.to_string(),
            "ids" => {
                let PhpValue::Array(items) = value else {
                    return None;
                };
                let mut list = Vec::with_capacity(items.len());
                for (_, item) in items {
                    list.push(u64::try_from(item.as_int()?).ok()?);
                }
                ids = Some(list);
            }
            "ofield" => old_bits = value.as_int()? as u32,
            "nfield" => new_bits = value.as_int()? as u32,
            _ => {}
        }
    }

    Some(DeletionParams {
        kind,
        ids: ids?,
        old: DeletionFlags::from_bits(old_bits),
        new: DeletionFlags::from_bits(new_bits),
    })
}

fn parse_legacy_form(raw: &str) -> Option<DeletionParams> {
    let mut lines = raw.lines();
    let kind = lines.next()?.trim();
    if kind.is_empty() {
        return None;
    }

    let ids: Vec<u64> = lines
        .next()?
        .split(',')
        .map(|id| id.trim().parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if ids.is_empty() {
        return None;
    }

    let mut old_bits = 0;
    let mut new_bits = 0;
    for line in lines {
        if let Some(value) = line.trim().strip_prefix("ofield=") {
            old_bits = value.parse().ok()?;
        } else if let Some(value) = line.trim().strip_prefix("nfield=") {
            new_bits = value.parse().ok()?;
        }
    }

    Some(DeletionParams {
        kind: kind.to_string(),
        ids,
        old: DeletionFlags::from_bits(old_bits),
        new: DeletionFlags::from_bits(new_bits),
    })
}

/// Decodes a raw `log_params` payload; `None` means the cause cannot be
/// reconstructed (scrubbed, suppressed, or malformed).
pub fn parse_log_params(raw: &str) -> Option<DeletionParams> {
    let raw = raw.trim_start_matches('\u{feff}');
    if raw.is_empty() {
        return None;
    }
    if raw.starts_with("a:") {
        parse_php_form(raw)
    } else {
        parse_legacy_form(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn php_form_with_string_ids() {
        let raw = "a:3:{s:6:\"4::ids\";a:2:{i:0;s:7:\"1234567\";i:1;s:7:\"1234568\";}s:9:\"5::ofield\";i:0;s:9:\"6::nfield\";i:1;}";
        let params = parse_log_params(raw).unwrap();
        assert_eq!(params.kind, "revision");
        assert_eq!(params.ids, vec![1_234_567, 1_234_568]);
        assert_eq!(params.old, DeletionFlags::from_bits(0));
        assert_eq!(params.new, DeletionFlags::from_bits(1));
        assert!(params.new.content);
    }

    #[test]
    fn php_form_with_integer_ids_and_type() {
        let raw = "a:4:{s:7:\"4::type\";s:8:\"oldimage\";s:6:\"5::ids\";a:1:{i:0;i:42;}s:9:\"6::ofield\";i:5;s:9:\"7::nfield\";i:0;}";
        let params = parse_log_params(raw).unwrap();
        assert_eq!(params.kind, "oldimage");
        assert_eq!(params.ids, vec![42]);
        assert!(params.old.content && params.old.user);
        assert_eq!(params.new, DeletionFlags::from_bits(0));
    }

    #[test]
    fn php_string_lengths_are_bytes() {
        // "é" is two bytes; the declared length must be honored as bytes.
        let raw = "a:1:{s:6:\"4::ids\";a:1:{i:0;s:2:\"é\";}}";
        // "é" does not parse as an id, so the whole payload is rejected
        // rather than silently truncated.
        assert!(parse_log_params(raw).is_none());
    }

    #[test]
    fn legacy_form_parses() {
        let raw = "revision\n1234567\nofield=1\nnfield=0";
        let params = parse_log_params(raw).unwrap();
        assert_eq!(params.kind, "revision");
        assert_eq!(params.ids, vec![1_234_567]);
        assert!(params.old.content);
        assert_eq!(params.new, DeletionFlags::from_bits(0));
    }

    #[test]
    fn legacy_form_with_multiple_ids() {
        let raw = "revision\n100,101,102\nofield=0\nnfield=6";
        let params = parse_log_params(raw).unwrap();
        assert_eq!(params.ids, vec![100, 101, 102]);
        assert!(params.new.comment && params.new.user && !params.new.content);
    }

    #[test]
    fn malformed_payloads_yield_none() {
        assert!(parse_log_params("").is_none());
        assert!(parse_log_params("revision").is_none());
        assert!(parse_log_params("revision\nnot-a-number").is_none());
        assert!(parse_log_params("a:1:{s:4:\"oops\";").is_none());
        assert!(parse_log_params("a:1:{s:6:\"4::ids\";s:3:\"abc\";}").is_none());
    }

    #[test]
    fn restricted_bit_survives_decoding() {
        let raw = "revision\n555\nofield=0\nnfield=15";
        let params = parse_log_params(raw).unwrap();
        assert!(params.new.restricted);
        assert!(params.new.content && params.new.comment && params.new.user);
    }
}
