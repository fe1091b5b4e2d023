//! PSSH box parsing.
//!
//! `cenc` initialization data is a concatenation of ISO-BMFF boxes, usually one
//! `pssh` box per protection system. The controller derives the box that
//! belongs to the selected system before creating a session, and reads the
//! system-specific payload when looking for embedded license URLs.
use std::io::{self, Cursor, Read};

use base64::Engine;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Parsed PSSH box.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pssh {
    pub version: u8,
    pub flags: u32,
    pub system_id: Uuid,
    key_ids: Vec<Uuid>,
    pub init_data: Vec<u8>,
}

impl Pssh {
    /// Create a new PSSH box.
    ///
    /// Version 0 uses only init_data. Version 1 requires init_data or key_ids.
    pub fn new(
        system_id: Uuid,
        key_ids: Option<Vec<Uuid>>,
        init_data: Option<Vec<u8>>,
        version: u8,
        flags: u32,
    ) -> Result<Self> {
        let problem = match (version, &key_ids, &init_data) {
            (0, Some(_), _) => Some("Version 0 PSSH boxes cannot carry key ids".to_string()),
            (1, None, None) => Some("Version 1 PSSH boxes need init data or key ids".to_string()),
            (0 | 1, _, _) => None,
            _ => Some(format!("Invalid PSSH version {}", version)),
        };
        if let Some(problem) = problem {
            return Err(Error::InvalidInitData(problem));
        }

        Ok(Self {
            version,
            flags,
            system_id,
            key_ids: key_ids.unwrap_or_default(),
            init_data: init_data.unwrap_or_default(),
        })
    }

    /// Parse exactly one PSSH box.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (pssh, size) = parse_pssh_box(data)?;
        if size != data.len() {
            return Err(Error::InvalidInitData(
                "Trailing data after PSSH box".to_string(),
            ));
        }
        Ok(pssh)
    }

    /// Parse exactly one base64 encoded PSSH box.
    pub fn from_base64(data_b64: &str) -> Result<Self> {
        let data = base64::engine::general_purpose::STANDARD
            .decode(data_b64.trim())
            .map_err(Error::Base64DecodeError)?;
        Self::from_bytes(&data)
    }

    /// Serialize as a full PSSH box.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_pssh_box(self)
    }

    /// Serialize as a base64 PSSH box.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    /// Key ids carried by a version 1 box.
    pub fn key_ids(&self) -> &[Uuid] {
        &self.key_ids
    }
}

/// One box found in a PSSH list, with its exact source bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PsshEntry {
    pub pssh: Pssh,
    pub raw: Vec<u8>,
}

/// Whether `data` starts like an ISO-BMFF box sequence.
#[must_use]
pub fn is_box_sequence(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    box_size(data).is_some() && data[4..8].iter().all(|b| b.is_ascii_graphic())
}

/// Parse a concatenation of boxes.
///
/// Boxes that are not `pssh`, or `pssh` boxes with an unknown version, are
/// skipped. Parsing stops at the first truncated box and returns everything
/// parsed up to that point.
#[must_use]
pub fn parse_pssh_list(data: &[u8]) -> Vec<PsshEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;

    while data.len() >= offset + 8 {
        let rest = &data[offset..];
        let Some(size) = box_size(rest) else {
            break;
        };

        if &rest[4..8] == b"pssh" {
            match parse_pssh_box(&rest[..size]) {
                Ok((pssh, _)) => entries.push(PsshEntry {
                    pssh,
                    raw: rest[..size].to_vec(),
                }),
                Err(e) => trace!("skipping pssh box at offset {}: {}", offset, e),
            }
        }

        offset += size;
    }

    entries
}

/// Return the raw PSSH box for `system_id`, if present.
#[must_use]
pub fn pssh_for_system(data: &[u8], system_id: Uuid) -> Option<Vec<u8>> {
    parse_pssh_list(data)
        .into_iter()
        .find(|entry| entry.pssh.system_id == system_id)
        .map(|entry| entry.raw)
}

/// System-specific payload of a PSSH box; data that is not a PSSH box is
/// returned unchanged.
#[must_use]
pub fn pssh_data(data: &[u8]) -> Vec<u8> {
    match parse_pssh_box(data) {
        Ok((pssh, _)) => pssh.init_data,
        Err(_) => data.to_vec(),
    }
}

fn box_size(data: &[u8]) -> Option<usize> {
    let size = BigEndian::read_u32(&data[0..4]) as usize;
    let size = match size {
        0 => data.len(),
        1 => {
            if data.len() < 16 {
                return None;
            }
            usize::try_from(BigEndian::read_u64(&data[8..16])).ok()?
        }
        n => n,
    };
    if size < 8 || size > data.len() {
        return None;
    }
    Some(size)
}

fn truncated(_: io::Error) -> Error {
    Error::InvalidInitData("PSSH box truncated".to_string())
}

fn parse_pssh_box(data: &[u8]) -> Result<(Pssh, usize)> {
    if data.len() < 8 || &data[4..8] != b"pssh" {
        return Err(Error::InvalidInitData("Not a PSSH box".to_string()));
    }
    let size = box_size(data)
        .ok_or_else(|| Error::InvalidInitData("PSSH size exceeds data length".to_string()))?;
    let header = if BigEndian::read_u32(&data[0..4]) == 1 { 16 } else { 8 };
    let payload = data
        .get(header..size)
        .ok_or_else(|| Error::InvalidInitData("PSSH header incomplete".to_string()))?;

    let mut reader = Cursor::new(payload);
    let version = reader.read_u8().map_err(truncated)?;
    if version > 1 {
        return Err(Error::InvalidInitData(format!(
            "Unsupported PSSH version {}",
            version
        )));
    }
    let flags = reader.read_u24::<BigEndian>().map_err(truncated)?;
    let mut system_id = [0u8; 16];
    reader.read_exact(&mut system_id).map_err(truncated)?;

    let mut key_ids = Vec::new();
    if version == 1 {
        let count = reader.read_u32::<BigEndian>().map_err(truncated)? as usize;
        let remaining = payload.len().saturating_sub(reader.position() as usize);
        let needed = count
            .checked_mul(16)
            .ok_or_else(|| Error::InvalidInitData("KID count overflows".to_string()))?;
        if needed > remaining {
            return Err(Error::InvalidInitData("Missing KIDs".to_string()));
        }
        for _ in 0..count {
            let mut kid = [0u8; 16];
            reader.read_exact(&mut kid).map_err(truncated)?;
            key_ids.push(Uuid::from_bytes(kid));
        }
    }

    let data_size = reader.read_u32::<BigEndian>().map_err(truncated)? as usize;
    let init_data = payload
        .get(reader.position() as usize..)
        .and_then(|rest| rest.get(..data_size))
        .ok_or_else(|| Error::InvalidInitData("Missing init data".to_string()))?
        .to_vec();

    Ok((
        Pssh {
            version,
            flags,
            system_id: Uuid::from_bytes(system_id),
            key_ids,
            init_data,
        },
        size,
    ))
}

fn build_pssh_box(pssh: &Pssh) -> Vec<u8> {
    let kids_len = match pssh.version {
        1 => 4 + 16 * pssh.key_ids.len(),
        _ => 0,
    };
    let size = 8 + 4 + 16 + kids_len + 4 + pssh.init_data.len();

    let mut out = Vec::with_capacity(size);
    out.extend_from_slice(&(size as u32).to_be_bytes());
    out.extend_from_slice(b"pssh");
    out.push(pssh.version);
    out.extend_from_slice(&pssh.flags.to_be_bytes()[1..]);
    out.extend_from_slice(pssh.system_id.as_bytes());
    if pssh.version == 1 {
        out.extend_from_slice(&(pssh.key_ids.len() as u32).to_be_bytes());
        for kid in &pssh.key_ids {
            out.extend_from_slice(kid.as_bytes());
        }
    }
    out.extend_from_slice(&(pssh.init_data.len() as u32).to_be_bytes());
    out.extend_from_slice(&pssh.init_data);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYSTEM_A: Uuid = Uuid::from_u128(0xedef8ba979d64acea3c827dcd51d21ed);
    const SYSTEM_B: Uuid = Uuid::from_u128(0x9a04f07998404286ab92e65be0885f95);

    fn pssh_box(system_id: Uuid, payload: &[u8]) -> Vec<u8> {
        Pssh::new(system_id, None, Some(payload.to_vec()), 0, 0)
            .expect("create pssh")
            .to_bytes()
    }

    #[test]
    fn list_returns_each_box_with_exact_bytes() {
        let a = pssh_box(SYSTEM_A, b"alpha");
        let b = pssh_box(SYSTEM_B, b"bravo");
        let data = [a.clone(), b.clone()].concat();

        let entries = parse_pssh_list(&data);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].raw, a);
        assert_eq!(entries[1].pssh.system_id, SYSTEM_B);
        assert_eq!(entries[1].pssh.init_data, b"bravo");
    }

    #[test]
    fn list_skips_foreign_boxes_and_stops_on_truncation() {
        let mut free = Vec::new();
        free.extend_from_slice(&12u32.to_be_bytes());
        free.extend_from_slice(b"free");
        free.extend_from_slice(&[0, 0, 0, 0]);
        let a = pssh_box(SYSTEM_A, b"alpha");
        let mut data = [free, a.clone()].concat();
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(b"pssh");

        let entries = parse_pssh_list(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].raw, a);
    }

    #[test]
    fn pssh_for_system_selects_matching_box() {
        let a = pssh_box(SYSTEM_A, b"alpha");
        let b = pssh_box(SYSTEM_B, b"bravo");
        let data = [a, b.clone()].concat();

        assert_eq!(pssh_for_system(&data, SYSTEM_B), Some(b));
        assert_eq!(pssh_for_system(&data, Uuid::nil()), None);
    }

    #[test]
    fn pssh_data_strips_box_header() {
        let a = pssh_box(SYSTEM_A, b"alpha");
        assert_eq!(pssh_data(&a), b"alpha");
        assert_eq!(pssh_data(b"raw"), b"raw");
    }

    #[test]
    fn v1_box_keeps_key_ids() {
        let kid = Uuid::new_v4();
        let pssh = Pssh::new(SYSTEM_A, Some(vec![kid]), None, 1, 0).expect("create pssh");
        let parsed = Pssh::from_bytes(&pssh.to_bytes()).expect("parse pssh");
        assert_eq!(parsed.key_ids(), &[kid]);
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn box_sequence_detection() {
        assert!(is_box_sequence(&pssh_box(SYSTEM_A, b"x")));
        assert!(!is_box_sequence(br#"{"kids":["AAAA"]}"#));
        assert!(!is_box_sequence(b"short"));
    }

    #[test]
    fn from_base64_rejects_empty_input() {
        assert!(Pssh::from_base64("").is_err());
    }

    #[test]
    fn huge_kid_count_is_rejected() {
        let mut data = Pssh::new(SYSTEM_A, Some(vec![Uuid::nil()]), None, 1, 0)
            .expect("create pssh")
            .to_bytes();
        // Kid count sits after size, type, version/flags and system id.
        data[28..32].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Pssh::from_bytes(&data),
            Err(Error::InvalidInitData(_))
        ));
    }

    #[test]
    fn init_data_length_past_box_end_is_rejected() {
        let mut data = pssh_box(SYSTEM_A, b"alpha");
        let len = data.len();
        data[len - 9..len - 5].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(Pssh::from_bytes(&data).is_err());
    }

    #[test]
    fn flags_survive_a_rebuild() {
        let pssh = Pssh::new(SYSTEM_B, None, Some(b"x".to_vec()), 0, 0x010203).expect("create");
        assert_eq!(Pssh::from_bytes(&pssh.to_bytes()).expect("parse").flags, 0x010203);
    }
}
