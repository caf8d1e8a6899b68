//! Store catalog records and catalog segmentation.

use crate::{DpsError, Result, encoding};

/// Metadata field holding the store name.
pub const STORE_NAME_FIELD: &str = "dps_name_of_this_store";
/// Metadata field holding the key type tag.
pub const KEY_TYPE_FIELD: &str = "dps_spl_type_name_of_key";
/// Metadata field holding the value type tag.
pub const VALUE_TYPE_FIELD: &str = "dps_spl_type_name_of_value";
/// Every store carries exactly these fields next to its items.
pub const RESERVED_FIELDS: [&str; 3] = [STORE_NAME_FIELD, KEY_TYPE_FIELD, VALUE_TYPE_FIELD];

const INFO_DELIMITER: &str = "_^^_";

#[allow(missing_docs)]
pub fn is_reserved(field: &str) -> bool {
    RESERVED_FIELDS.contains(&field)
}

/// Decoded store metadata as callers see it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    #[allow(missing_docs)]
    pub id: u64,
    #[allow(missing_docs)]
    pub name: String,
    #[allow(missing_docs)]
    pub key_type: String,
    #[allow(missing_docs)]
    pub value_type: String,
    /// Items, reserved fields excluded.
    pub item_count: u64,
}

/// The info record of a segmented catalog:
/// `count_^^_segments_^^_lastSegmentBytes_^^_b64name_^^_b64keyType_^^_b64valueType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentedInfo {
    #[allow(missing_docs)]
    pub item_count: u64,
    /// Number of segments, at least one.
    pub segment_count: u32,
    /// Byte length of the last segment.
    pub last_segment_size: usize,
    #[allow(missing_docs)]
    pub encoded_name: String,
    #[allow(missing_docs)]
    pub encoded_key_type: String,
    #[allow(missing_docs)]
    pub encoded_value_type: String,
}

impl SegmentedInfo {
    /// Info for an empty store with a single empty segment.
    pub fn empty(name: &str, key_type: &str, value_type: &str) -> Self {
        SegmentedInfo {
            item_count: 0,
            segment_count: 1,
            last_segment_size: 0,
            encoded_name: encoding::encode(name.as_bytes()),
            encoded_key_type: encoding::encode(key_type.as_bytes()),
            encoded_value_type: encoding::encode(value_type.as_bytes()),
        }
    }

    #[allow(missing_docs)]
    pub fn format(&self) -> String {
        [
            self.item_count.to_string(),
            self.segment_count.to_string(),
            self.last_segment_size.to_string(),
            self.encoded_name.clone(),
            self.encoded_key_type.clone(),
            self.encoded_value_type.clone(),
        ]
        .join(INFO_DELIMITER)
    }

    #[allow(missing_docs)]
    pub fn parse(raw: &str) -> Result<Self> {
        let bad = || DpsError::StoreInfo(format!("malformed store info '{raw}'"));
        let parts: Vec<&str> = raw.split(INFO_DELIMITER).collect();
        if parts.len() != 6 {
            return Err(bad());
        }
        Ok(SegmentedInfo {
            item_count: parts[0].parse().map_err(|_| bad())?,
            segment_count: parts[1].parse().map_err(|_| bad())?,
            last_segment_size: parts[2].parse().map_err(|_| bad())?,
            encoded_name: parts[3].to_string(),
            encoded_key_type: parts[4].to_string(),
            encoded_value_type: parts[5].to_string(),
        })
    }

    /// Decode into the caller-facing form.
    pub fn to_store_info(&self, id: u64) -> Result<StoreInfo> {
        Ok(StoreInfo {
            id,
            name: decode_text(&self.encoded_name)?,
            key_type: decode_text(&self.encoded_key_type)?,
            value_type: decode_text(&self.encoded_value_type)?,
            item_count: self.item_count,
        })
    }
}

pub(crate) fn decode_text(token: &str) -> Result<String> {
    let raw = encoding::decode(token)?;
    String::from_utf8(raw)
        .map_err(|e| DpsError::StoreInfo(format!("metadata is not utf-8: {e}")))
}

/// Bytes the segment grows by when `token` is appended.
pub fn appended_len(segment_len: usize, token: &str) -> usize {
    if segment_len == 0 {
        token.len()
    } else {
        token.len() + 1
    }
}

/// Whether `token` still fits into a segment of `segment_len` bytes.
pub fn fits(segment_len: usize, token: &str, max_segment_size: usize) -> bool {
    segment_len + appended_len(segment_len, token) <= max_segment_size
}

#[allow(missing_docs)]
pub fn append_token(segment: &mut String, token: &str) {
    if !segment.is_empty() {
        segment.push(',');
    }
    segment.push_str(token);
}

/// Erase exactly one comma-delimited occurrence of `token`.
///
/// Returns `None` when no element equals `token`; a token that is merely a
/// prefix or suffix of another element never matches.
pub fn remove_token(segment: &str, token: &str) -> Option<String> {
    if segment.is_empty() {
        return None;
    }
    let mut elements: Vec<&str> = segment.split(',').collect();
    let pos = elements.iter().position(|e| *e == token)?;
    elements.remove(pos);
    Some(elements.join(","))
}

/// Non-empty tokens of a segment, in insertion order.
pub fn tokens(segment: &str) -> impl Iterator<Item = &str> {
    segment.split(',').filter(|t| !t.is_empty())
}

/// Split a `segIdx_value` item record into its segment index and value.
pub fn split_tagged_value(raw: &[u8]) -> Result<(u32, &[u8])> {
    let bad = || DpsError::CatalogRead("missing catalog segment index on data item".to_string());
    let sep = raw.iter().position(|b| *b == b'_').ok_or_else(bad)?;
    let idx = std::str::from_utf8(&raw[..sep])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(bad)?;
    Ok((idx, &raw[sep + 1..]))
}

/// Prefix `value` with its segment index.
pub fn tag_value(segment: u32, value: &[u8]) -> Vec<u8> {
    let mut out = format!("{segment}_").into_bytes();
    out.extend_from_slice(value);
    out
}
