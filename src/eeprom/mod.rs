//! SubDevice EEPROM (SII) image storage and parsing.
//!
//! The scan FSM reads the raw words over the SII interface; everything here works on the
//! complete in-memory image afterwards.

pub mod types;

use crate::{
    error::{EepromError, Error},
    fmt,
    mailbox::{MailboxGeometry, MailboxProtocols},
};
use ethercrab_wire::EtherCrabWireRead;
use types::{CategoryType, Pdo, SiiGeneral, SiiPdo, SiiPdoEntry, SiiSyncManager};

/// Word address of the first category header.
pub const SII_FIRST_CATEGORY: u16 = 0x0040;

/// Word address of the configured station alias.
pub const SII_ALIAS_WORD: u16 = 0x0004;

/// Word address of the checksum over words `0..7`.
pub const SII_CHECKSUM_WORD: u16 = 0x0007;

/// The ETG SII checksum: `x^8 + x^2 + x + 1`, initial value `0xff`, over bytes `0..14`.
const SII_CRC: crc::Algorithm<u8> = crc::Algorithm {
    width: 8,
    poly: 0x07,
    init: 0xff,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xfb,
    residue: 0x00,
};

/// Compute the SII configuration area checksum over the first 14 bytes of the image.
pub fn sii_checksum(config_area: &[u8]) -> u8 {
    crc::Crc::<u8>::new(&SII_CRC).checksum(&config_area[..14])
}

/// A SubDevice identity block, from EEPROM words `0x0008..0x0010`.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 16)]
pub struct SubDeviceIdentity {
    /// Vendor ID.
    #[wire(bytes = 4)]
    pub vendor_id: u32,
    /// Product code.
    #[wire(bytes = 4)]
    pub product_id: u32,
    /// Product revision.
    #[wire(bytes = 4)]
    pub revision: u32,
    /// Serial number.
    #[wire(bytes = 4)]
    pub serial: u32,
}

impl core::fmt::Display for SubDeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_fmt(format_args!(
            "vendor {:#010x}, product {:#010x}, rev {}, serial {}",
            self.vendor_id, self.product_id, self.revision, self.serial
        ))
    }
}

impl core::fmt::Debug for SubDeviceIdentity {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SubDeviceIdentity")
            .field("vendor_id", &format_args!("{:#010x}", self.vendor_id))
            .field("product_id", &format_args!("{:#010x}", self.product_id))
            .field("revision", &self.revision)
            .field("serial", &self.serial)
            .finish()
    }
}

/// Everything parsed out of the category area.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedCategories {
    /// The strings table; indices in other categories are 1-based into this.
    pub strings: Vec<heapless::String<64>>,
    /// General category, if present.
    pub general: Option<SiiGeneral>,
    /// FMMU usage hints.
    pub fmmu_usage: Vec<types::FmmuUsage>,
    /// Sync manager descriptors.
    pub sync_managers: Vec<SiiSyncManager>,
    /// TxPDOs (inputs to the MainDevice).
    pub tx_pdos: Vec<Pdo>,
    /// RxPDOs (outputs from the MainDevice).
    pub rx_pdos: Vec<Pdo>,
}

impl ParsedCategories {
    /// Look up a 1-based string index.
    pub fn string(&self, index: u8) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.strings.get(usize::from(i)))
            .map(|s| s.as_str())
    }

    /// The device name from the general category.
    pub fn name(&self) -> Option<&str> {
        self.general
            .as_ref()
            .and_then(|general| self.string(general.name_string_idx))
    }

    /// Find a PDO by index in either direction.
    pub fn pdo(&self, index: u16) -> Option<&Pdo> {
        self.tx_pdos
            .iter()
            .chain(self.rx_pdos.iter())
            .find(|pdo| pdo.descriptor.index == index)
    }
}

/// A complete EEPROM image, addressed in 16-bit words like the SII interface itself.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct EepromImage {
    bytes: Vec<u8>,
}

impl EepromImage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Size in 16-bit words.
    pub fn len_words(&self) -> usize {
        self.bytes.len() / 2
    }

    /// Raw image bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Read one word.
    pub fn word(&self, address: u16) -> Option<u16> {
        let offset = usize::from(address) * 2;

        let raw = self.bytes.get(offset..offset + 2)?;

        Some(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn long_word(&self, address: u16) -> Option<u32> {
        Some(u32::from(self.word(address)?) | u32::from(self.word(address + 1)?) << 16)
    }

    /// The configured station alias from word `0x0004`.
    pub fn alias(&self) -> u16 {
        self.word(SII_ALIAS_WORD).unwrap_or(0)
    }

    /// Identity block from words `0x0008..0x0010`.
    pub fn identity(&self) -> Result<SubDeviceIdentity, Error> {
        Ok(SubDeviceIdentity {
            vendor_id: self.long_word(0x0008).ok_or(EepromError::TooShort)?,
            product_id: self.long_word(0x000a).ok_or(EepromError::TooShort)?,
            revision: self.long_word(0x000c).ok_or(EepromError::TooShort)?,
            serial: self.long_word(0x000e).ok_or(EepromError::TooShort)?,
        })
    }

    /// Bootstrap mailbox geometry from words `0x0014..0x0018`.
    pub fn bootstrap_mailbox(&self) -> Result<MailboxGeometry, Error> {
        Ok(MailboxGeometry {
            rx_offset: self.word(0x0014).ok_or(EepromError::TooShort)?,
            rx_size: self.word(0x0015).ok_or(EepromError::TooShort)?,
            tx_offset: self.word(0x0016).ok_or(EepromError::TooShort)?,
            tx_size: self.word(0x0017).ok_or(EepromError::TooShort)?,
        })
    }

    /// Standard mailbox geometry from words `0x0018..0x001c`.
    pub fn standard_mailbox(&self) -> Result<MailboxGeometry, Error> {
        Ok(MailboxGeometry {
            rx_offset: self.word(0x0018).ok_or(EepromError::TooShort)?,
            rx_size: self.word(0x0019).ok_or(EepromError::TooShort)?,
            tx_offset: self.word(0x001a).ok_or(EepromError::TooShort)?,
            tx_size: self.word(0x001b).ok_or(EepromError::TooShort)?,
        })
    }

    /// Supported mailbox protocols from word `0x001c`.
    pub fn mailbox_protocols(&self) -> MailboxProtocols {
        MailboxProtocols::from_bits_truncate(self.word(0x001c).unwrap_or(0))
    }

    /// Whether the stored checksum over the configuration area is consistent.
    pub fn checksum_ok(&self) -> bool {
        let Some(stored) = self.word(SII_CHECKSUM_WORD) else {
            return false;
        };

        self.bytes.len() >= 14 && u16::from(sii_checksum(&self.bytes)) == stored & 0x00ff
    }

    /// Walk the category chain, yielding `(type, payload)` pairs.
    ///
    /// The chain starts at word `0x0040` and ends at an `0xffff` type word or the end of the
    /// image. A category whose declared size overruns the image is reported and the walk
    /// stops.
    pub fn categories(&self) -> CategoryIter<'_> {
        CategoryIter {
            image: self,
            word_offset: SII_FIRST_CATEGORY,
        }
    }

    /// Find the payload of the first category of the given type.
    pub fn find_category(&self, category: CategoryType) -> Option<&[u8]> {
        self.categories()
            .find(|(found, _)| *found == category)
            .map(|(_, payload)| payload)
    }

    /// Parse all recognised categories.
    pub fn parse_categories(&self) -> ParsedCategories {
        let mut parsed = ParsedCategories::default();

        for (category, payload) in self.categories() {
            match category {
                CategoryType::Strings => parsed.strings = parse_strings(payload),
                CategoryType::General => parsed.general = SiiGeneral::parse(payload),
                CategoryType::Fmmu => {
                    parsed.fmmu_usage = payload
                        .iter()
                        .map(|raw| types::FmmuUsage::from(*raw))
                        .collect();
                }
                CategoryType::SyncManager => {
                    parsed.sync_managers = payload
                        .chunks_exact(8)
                        .filter_map(|chunk| SiiSyncManager::unpack_from_slice(chunk).ok())
                        .collect();
                }
                CategoryType::TxPdo => parse_pdos(payload, &mut parsed.tx_pdos),
                CategoryType::RxPdo => parse_pdos(payload, &mut parsed.rx_pdos),
                _ => (),
            }
        }

        parsed
    }
}

/// Iterator over the SII category chain.
pub struct CategoryIter<'image> {
    image: &'image EepromImage,
    word_offset: u16,
}

impl<'image> Iterator for CategoryIter<'image> {
    type Item = (CategoryType, &'image [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let category = CategoryType::from(self.image.word(self.word_offset)?);

        if category == CategoryType::End {
            return None;
        }

        let len_words = self.image.word(self.word_offset + 1)?;

        let start = usize::from(self.word_offset + 2) * 2;
        let len = usize::from(len_words) * 2;

        let Some(payload) = self.image.bytes.get(start..start + len) else {
            fmt::warn!(
                "SII category {:?} at word {:#06x} overruns the EEPROM image",
                category,
                self.word_offset
            );

            return None;
        };

        self.word_offset += 2 + len_words;

        Some((category, payload))
    }
}

/// Parse the strings category: a count byte, then length-prefixed ASCII strings.
fn parse_strings(payload: &[u8]) -> Vec<heapless::String<64>> {
    let Some((count, mut rest)) = payload.split_first() else {
        return Vec::new();
    };

    let mut strings = Vec::with_capacity(usize::from(*count));

    for _ in 0..*count {
        let Some((len, tail)) = rest.split_first() else {
            break;
        };

        let len = usize::from(*len);

        let Some(raw) = tail.get(..len) else {
            break;
        };

        let mut string = heapless::String::new();

        for c in raw.iter().map(|byte| char::from(*byte)) {
            if string.push(c).is_err() {
                break;
            }
        }

        strings.push(string);

        rest = &tail[len..];
    }

    strings
}

/// Parse a TxPDO/RxPDO category: PDO headers each followed by their entries.
fn parse_pdos(payload: &[u8], out: &mut Vec<Pdo>) {
    let mut rest = payload;

    while rest.len() >= 8 {
        let Ok(descriptor) = SiiPdo::unpack_from_slice(rest) else {
            return;
        };

        rest = &rest[8..];

        let mut entries = Vec::with_capacity(usize::from(descriptor.num_entries));

        for _ in 0..descriptor.num_entries {
            if rest.len() < 8 {
                return;
            }

            if let Ok(entry) = SiiPdoEntry::unpack_from_slice(rest) {
                entries.push(entry);
            }

            rest = &rest[8..];
        }

        out.push(Pdo {
            descriptor,
            entries,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal EEPROM image: config area, identity, mailbox words, then categories.
    pub(crate) fn test_image() -> EepromImage {
        let mut words = vec![0u16; 0x40];

        words[0x0004] = 0xbeef; // alias

        words[0x0008] = 0x0002; // vendor low
        words[0x0009] = 0x0000;
        words[0x000a] = 0x3052; // product low
        words[0x000b] = 0x0444;

        words[0x0018] = 0x1000; // std rx offset
        words[0x0019] = 0x0080;
        words[0x001a] = 0x1080; // std tx offset
        words[0x001b] = 0x0080;
        words[0x001c] = 0x000c; // CoE + FoE

        // Strings category: 1 string, "EL2004"
        words.push(10); // type
        words.push(4); // 8 bytes
        let mut strings = vec![1u8, 6];
        strings.extend_from_slice(b"EL2004");
        for chunk in strings.chunks(2) {
            words.push(u16::from_le_bytes([chunk[0], *chunk.get(1).unwrap_or(&0)]));
        }

        // General category
        words.push(30);
        words.push(9);
        let mut general = vec![0u8; 18];
        general[3] = 1; // name string index
        general[5] = 0x04; // enable PDO assign
        for chunk in general.chunks(2) {
            words.push(u16::from_le_bytes([chunk[0], chunk[1]]));
        }

        words.push(0xffff);

        let bytes = words
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect::<Vec<_>>();

        EepromImage::from_bytes(bytes)
    }

    #[test]
    fn fixed_fields() {
        let image = test_image();

        assert_eq!(image.alias(), 0xbeef);

        let identity = image.identity().unwrap();

        assert_eq!(identity.vendor_id, 0x0000_0002);
        assert_eq!(identity.product_id, 0x0444_3052);

        let mailbox = image.standard_mailbox().unwrap();

        assert_eq!(mailbox.rx_offset, 0x1000);
        assert_eq!(mailbox.tx_size, 0x0080);

        assert!(image
            .mailbox_protocols()
            .contains(MailboxProtocols::COE | MailboxProtocols::FOE));
    }

    #[test]
    fn category_walk_and_parse() {
        let image = test_image();

        let parsed = image.parse_categories();

        assert_eq!(parsed.strings.len(), 1);
        assert_eq!(parsed.name(), Some("EL2004"));
        assert!(parsed
            .general
            .as_ref()
            .unwrap()
            .coe_details
            .contains(types::CoeDetails::ENABLE_PDO_ASSIGN));
    }

    #[test]
    fn crc_check_value() {
        assert_eq!(crc::Crc::<u8>::new(&SII_CRC).checksum(b"123456789"), 0xfb);
    }

    #[test]
    fn checksum_roundtrip() {
        let mut bytes = vec![0u8; 0x80];

        bytes[8] = 0xaa; // alias low byte, word 4

        let crc = sii_checksum(&bytes);

        bytes[14] = crc;

        let image = EepromImage::from_bytes(bytes);

        assert!(image.checksum_ok());
    }

    #[test]
    fn alias_change_invalidates_checksum() {
        let mut bytes = vec![0u8; 0x80];

        bytes[14] = sii_checksum(&bytes);

        bytes[8] = 0x01;

        assert!(!EepromImage::from_bytes(bytes).checksum_ok());
    }
}
