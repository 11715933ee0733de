//! Advertisement filtering - finds the test service UUID in raw AD data.

/// AD type: incomplete list of 16-bit service UUIDs.
pub const AD_TYPE_UUID16_INCOMPLETE: u8 = 0x02;
/// AD type: complete list of 16-bit service UUIDs.
pub const AD_TYPE_UUID16_COMPLETE: u8 = 0x03;

/// Iterator over `{length, type, value...}` structures of an advertisement.
///
/// Stops at a zero length (padding) or at a structure whose declared
/// length runs past the buffer.
pub struct AdStructures<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> AdStructures<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
}

impl<'a> Iterator for AdStructures<'a> {
    /// `(ad_type, value)`
    type Item = (u8, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let i = self.pos;
        let len = *self.data.get(i)? as usize;
        if len == 0 || i + len >= self.data.len() {
            self.pos = self.data.len();
            return None;
        }
        self.pos = i + len + 1;
        Some((self.data[i + 1], &self.data[i + 2..i + 1 + len]))
    }
}

/// Matches advertisements listing a fixed 16-bit service UUID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdvertisementFilter {
    target: [u8; 2],
}

impl AdvertisementFilter {
    /// `target` is little-endian, as it appears on air.
    pub const fn new(target: [u8; 2]) -> Self {
        Self { target }
    }

    /// True if any 16-bit UUID list in `payload` contains the target.
    ///
    /// Malformed payloads never match past the point of corruption.
    pub fn matches(&self, payload: &[u8]) -> bool {
        AdStructures::new(payload)
            .filter(|(ad_type, _)| {
                *ad_type == AD_TYPE_UUID16_INCOMPLETE || *ad_type == AD_TYPE_UUID16_COMPLETE
            })
            .any(|(_, uuids)| uuids.chunks_exact(2).any(|uuid| uuid == self.target))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════
