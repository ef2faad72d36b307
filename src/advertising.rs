//! Advertising payload construction and AD structure parsing.

/// AD type: flags
pub const AD_TYPE_FLAGS: u8 = 0x01;
/// AD type: complete list of 16-bit service UUIDs
pub const AD_TYPE_SERVICE_UUID16: u8 = 0x03;
/// AD type: shortened local name
pub const AD_TYPE_SHORT_NAME: u8 = 0x08;
/// AD type: complete local name
pub const AD_TYPE_COMPLETE_NAME: u8 = 0x09;
/// AD type: manufacturer specific data
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// LE General Discoverable Mode, BR/EDR Not Supported.
pub const FLAGS_GENERAL_DISCOVERABLE: u8 = 0x06;

/// Maximum legacy advertising payload length.
pub const MAX_LEGACY_PAYLOAD: usize = 31;

/// What this device broadcasts while it scans.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    /// Complete local name
    pub name: String,
    /// 16-bit service UUIDs
    pub service_uuids: Vec<u16>,
    /// Manufacturer specific data, starting with the little-endian company ID
    pub manufacturer_data: Vec<u8>,
}

impl Advertisement {
    /// Encode as AD structures: flags, name, one entry per service, then
    /// manufacturer data. Empty fields are left out.
    pub fn payload(&self) -> Vec<u8> {
        let mut payload = vec![2, AD_TYPE_FLAGS, FLAGS_GENERAL_DISCOVERABLE];

        if !self.name.is_empty() {
            push_structure(&mut payload, AD_TYPE_COMPLETE_NAME, self.name.as_bytes());
        }

        for uuid in &self.service_uuids {
            push_structure(&mut payload, AD_TYPE_SERVICE_UUID16, &uuid.to_le_bytes());
        }

        if !self.manufacturer_data.is_empty() {
            push_structure(
                &mut payload,
                AD_TYPE_MANUFACTURER_DATA,
                &self.manufacturer_data,
            );
        }

        payload
    }

    /// Company identifier and body of the manufacturer data, if it has at
    /// least the two identifier bytes.
    pub fn manufacturer(&self) -> Option<(u16, &[u8])> {
        match self.manufacturer_data.as_slice() {
            [lo, hi, rest @ ..] => Some((u16::from_le_bytes([*lo, *hi]), rest)),
            _ => None,
        }
    }
}

fn push_structure(payload: &mut Vec<u8>, ad_type: u8, data: &[u8]) {
    // Length byte counts the type byte; longer data is truncated to fit.
    let data = &data[..data.len().min(u8::MAX as usize - 1)];
    payload.push(data.len() as u8 + 1);
    payload.push(ad_type);
    payload.extend_from_slice(data);
}

/// Iterate over `(ad_type, data)` pairs, stopping at a zero length or a
/// truncated structure.
pub fn ad_structures(adv: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    let mut offset = 0;
    std::iter::from_fn(move || {
        let len = *adv.get(offset)? as usize;
        if len == 0 || offset + 1 + len > adv.len() {
            return None;
        }
        let ad_type = adv[offset + 1];
        let data = &adv[offset + 2..offset + 1 + len];
        offset += 1 + len;
        Some((ad_type, data))
    })
}

/// First complete or shortened local name in an advertisement.
pub fn parse_local_name(adv: &[u8]) -> Option<String> {
    ad_structures(adv)
        .find(|(ad_type, _)| matches!(*ad_type, AD_TYPE_COMPLETE_NAME | AD_TYPE_SHORT_NAME))
        .map(|(_, data)| String::from_utf8_lossy(data).into_owned())
}
