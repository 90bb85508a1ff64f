//! Records packed into DEVICE_PAIR_REPLY and TRAFFIC_GET_REPLY lists
//!
//! Both lists are flat sequences of length-prefixed text fields; a record is
//! a fixed-size group of consecutive fields. Numbers are decimal text.

use crate::codec::{list_fields, PairKind};
use crate::error::DecodeError;

/// Fields per pairing record: pairing id, device, local port, remote port
const PAIRING_FIELDS: usize = 4;

/// Fields per traffic record: device, upload bytes, download bytes
const TRAFFIC_FIELDS: usize = 3;

/// One pairing assignment from the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRecord<'a> {
    pub cloud_id: &'a str,
    pub pairing_id: &'a str,
    pub device_id: &'a str,
    pub local_port: u16,
    pub remote_port: u16,
    pub pair_kind: PairKind,
}

/// Per-device traffic counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrafficRecord<'a> {
    pub device_id: &'a str,
    pub upload: u64,
    pub download: u64,
}

/// Split a packed list into groups of `width` fields
fn grouped(list: &[u8], width: usize) -> Result<Vec<&[u8]>, DecodeError> {
    let fields = list_fields(list).collect::<Result<Vec<_>, _>>()?;
    if fields.len() % width != 0 {
        return Err(DecodeError::MalformedList(format!(
            "{} fields do not form records of {}",
            fields.len(),
            width
        )));
    }
    Ok(fields)
}

fn text<'a>(field: &'static str, raw: &'a [u8]) -> Result<&'a str, DecodeError> {
    std::str::from_utf8(raw).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn number<T: std::str::FromStr>(field: &'static str, raw: &[u8]) -> Result<T, DecodeError> {
    let value = text(field, raw)?;
    value.parse().map_err(|_| DecodeError::InvalidField {
        field,
        value: value.to_string(),
    })
}

/// Unpack the pairing list of a successful DEVICE_PAIR_REPLY
///
/// `cloud` and `pair_kind` come from the reply itself and apply to every
/// record in the list.
pub fn pairing_records<'a>(
    cloud: &'a str,
    pair_kind: PairKind,
    list: &'a [u8],
) -> Result<Vec<PairingRecord<'a>>, DecodeError> {
    grouped(list, PAIRING_FIELDS)?
        .chunks_exact(PAIRING_FIELDS)
        .map(|f| {
            Ok(PairingRecord {
                cloud_id: cloud,
                pairing_id: text("pairing_id", f[0])?,
                device_id: text("device_id", f[1])?,
                local_port: number("local_port", f[2])?,
                remote_port: number("remote_port", f[3])?,
                pair_kind,
            })
        })
        .collect()
}

/// Unpack the list of a TRAFFIC_GET_REPLY
pub fn traffic_records(list: &[u8]) -> Result<Vec<TrafficRecord<'_>>, DecodeError> {
    grouped(list, TRAFFIC_FIELDS)?
        .chunks_exact(TRAFFIC_FIELDS)
        .map(|f| {
            Ok(TrafficRecord {
                device_id: text("device_id", f[0])?,
                upload: number("upload", f[1])?,
                download: number("download", f[2])?,
            })
        })
        .collect()
}
