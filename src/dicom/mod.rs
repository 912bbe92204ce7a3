use chrono::Utc;
use std::collections::BTreeMap;

pub mod codec;

pub use codec::{read_file, write_file, CodecError};

/// DICOM attribute tag as `(group, element)`.
pub type Tag = (u16, u16);

pub mod tags {
    use super::Tag;

    pub const FILE_META_GROUP_LENGTH: Tag = (0x0002, 0x0000);
    pub const MEDIA_STORAGE_SOP_CLASS_UID: Tag = (0x0002, 0x0002);
    pub const MEDIA_STORAGE_SOP_INSTANCE_UID: Tag = (0x0002, 0x0003);
    pub const TRANSFER_SYNTAX_UID: Tag = (0x0002, 0x0010);
    pub const IMPLEMENTATION_CLASS_UID: Tag = (0x0002, 0x0012);
    pub const SOP_CLASS_UID: Tag = (0x0008, 0x0016);
    pub const SOP_INSTANCE_UID: Tag = (0x0008, 0x0018);
    pub const STUDY_DATE: Tag = (0x0008, 0x0020);
    pub const STUDY_TIME: Tag = (0x0008, 0x0030);
    pub const MODALITY: Tag = (0x0008, 0x0060);
    pub const SERIES_DESCRIPTION: Tag = (0x0008, 0x103E);
    pub const PATIENT_NAME: Tag = (0x0010, 0x0010);
    pub const PATIENT_ID: Tag = (0x0010, 0x0020);
    pub const STUDY_INSTANCE_UID: Tag = (0x0020, 0x000D);
    pub const SERIES_INSTANCE_UID: Tag = (0x0020, 0x000E);
    pub const SAMPLES_PER_PIXEL: Tag = (0x0028, 0x0002);
    pub const PHOTOMETRIC_INTERPRETATION: Tag = (0x0028, 0x0004);
    pub const ROWS: Tag = (0x0028, 0x0010);
    pub const COLUMNS: Tag = (0x0028, 0x0011);
    pub const BITS_ALLOCATED: Tag = (0x0028, 0x0100);
    pub const BITS_STORED: Tag = (0x0028, 0x0101);
    pub const HIGH_BIT: Tag = (0x0028, 0x0102);
    pub const PIXEL_REPRESENTATION: Tag = (0x0028, 0x0103);
    pub const PIXEL_DATA: Tag = (0x7FE0, 0x0010);
}

pub mod uids {
    pub const EXPLICIT_VR_LITTLE_ENDIAN: &str = "1.2.840.10008.1.2.1";
    pub const CT_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.2";
    pub const MR_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.4";
    pub const SECONDARY_CAPTURE_IMAGE_STORAGE: &str = "1.2.840.10008.5.1.4.1.1.7";
    pub const IMPLEMENTATION_CLASS: &str = "1.2.826.0.1.3680043.10.594.1";

    pub const UID_ROOT: &str = "1.2.826.0.1.3680043.10.594";
}

/// Two-letter value representation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Vr(pub [u8; 2]);

impl Vr {
    pub const CS: Vr = Vr(*b"CS");
    pub const DA: Vr = Vr(*b"DA");
    pub const LO: Vr = Vr(*b"LO");
    pub const OB: Vr = Vr(*b"OB");
    pub const OW: Vr = Vr(*b"OW");
    pub const PN: Vr = Vr(*b"PN");
    pub const SH: Vr = Vr(*b"SH");
    pub const TM: Vr = Vr(*b"TM");
    pub const UI: Vr = Vr(*b"UI");
    pub const UL: Vr = Vr(*b"UL");
    pub const US: Vr = Vr(*b"US");

    /// Explicit-VR encodings of these representations carry a two-byte
    /// reserved field and a four-byte length.
    pub fn uses_long_length(&self) -> bool {
        matches!(&self.0, b"OB" | b"OW" | b"OF" | b"SQ" | b"UT" | b"UN")
    }

    pub fn pad_byte(&self) -> u8 {
        match &self.0 {
            b"UI" | b"OB" | b"OW" | b"UN" => 0x00,
            _ => b' ',
        }
    }

    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.0).unwrap_or("??")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub vr: Vr,
    pub data: Vec<u8>,
}

/// In-memory image object: tag-ordered explicit-VR elements. Only the header
/// attributes the gateway routes and correlates on get typed accessors; pixel
/// data stays opaque bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DicomObject {
    elements: BTreeMap<Tag, Element>,
}

impl DicomObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_str(&mut self, tag: Tag, vr: Vr, value: &str) {
        let mut data = value.as_bytes().to_vec();
        if data.len() % 2 != 0 {
            data.push(vr.pad_byte());
        }
        self.elements.insert(tag, Element { vr, data });
    }

    pub fn set_u16(&mut self, tag: Tag, value: u16) {
        self.elements.insert(
            tag,
            Element {
                vr: Vr::US,
                data: value.to_le_bytes().to_vec(),
            },
        );
    }

    pub fn set_bytes(&mut self, tag: Tag, vr: Vr, mut data: Vec<u8>) {
        if data.len() % 2 != 0 {
            data.push(vr.pad_byte());
        }
        self.elements.insert(tag, Element { vr, data });
    }

    pub fn insert(&mut self, tag: Tag, element: Element) {
        self.elements.insert(tag, element);
    }

    pub fn get(&self, tag: Tag) -> Option<&Element> {
        self.elements.get(&tag)
    }

    pub fn get_str(&self, tag: Tag) -> Option<String> {
        let element = self.elements.get(&tag)?;
        let text = String::from_utf8_lossy(&element.data);
        Some(text.trim_end_matches(['\0', ' ']).to_string())
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.elements.contains_key(&tag)
    }

    pub fn elements(&self) -> impl Iterator<Item = (&Tag, &Element)> {
        self.elements.iter()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn study_instance_uid(&self) -> Option<String> {
        self.get_str(tags::STUDY_INSTANCE_UID)
    }

    pub fn series_instance_uid(&self) -> Option<String> {
        self.get_str(tags::SERIES_INSTANCE_UID)
    }

    pub fn sop_instance_uid(&self) -> Option<String> {
        self.get_str(tags::SOP_INSTANCE_UID)
    }

    pub fn sop_class_uid(&self) -> Option<String> {
        self.get_str(tags::SOP_CLASS_UID)
    }

    pub fn modality(&self) -> Option<String> {
        self.get_str(tags::MODALITY)
    }

    pub fn series_description(&self) -> Option<String> {
        self.get_str(tags::SERIES_DESCRIPTION)
    }

    pub fn patient_id(&self) -> Option<String> {
        self.get_str(tags::PATIENT_ID)
    }

    pub fn patient_name(&self) -> Option<String> {
        self.get_str(tags::PATIENT_NAME)
    }
}

/// `^[0-9]+(\.[0-9]+)*$`, at most 64 characters, no leading or trailing dot.
pub fn is_valid_uid(uid: &str) -> bool {
    if uid.is_empty() || uid.len() > 64 {
        return false;
    }
    uid.split('.')
        .all(|part| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()))
}

pub fn generate_uid() -> String {
    let millis = Utc::now().timestamp_millis();
    let mut buf = [0u8; 4];
    let nonce = match getrandom::getrandom(&mut buf) {
        Ok(()) => u32::from_le_bytes(buf),
        Err(_) => std::process::id(),
    };
    format!("{}.{}.{}", uids::UID_ROOT, millis, nonce)
}

/// Minimal single-pixel image object, the shape the synthetic harness sends.
pub fn synthetic_image(
    sop_class_uid: &str,
    study_uid: &str,
    series_uid: &str,
    sop_uid: &str,
    modality: &str,
) -> DicomObject {
    let now = Utc::now();
    let mut object = DicomObject::new();
    object.set_str(tags::SOP_CLASS_UID, Vr::UI, sop_class_uid);
    object.set_str(tags::SOP_INSTANCE_UID, Vr::UI, sop_uid);
    object.set_str(tags::STUDY_DATE, Vr::DA, &now.format("%Y%m%d").to_string());
    object.set_str(tags::STUDY_TIME, Vr::TM, &now.format("%H%M%S").to_string());
    object.set_str(tags::MODALITY, Vr::CS, modality);
    object.set_str(tags::PATIENT_NAME, Vr::PN, "UNKNOWN");
    object.set_str(tags::PATIENT_ID, Vr::LO, "UNKNOWN");
    object.set_str(tags::STUDY_INSTANCE_UID, Vr::UI, study_uid);
    object.set_str(tags::SERIES_INSTANCE_UID, Vr::UI, series_uid);
    object.set_u16(tags::SAMPLES_PER_PIXEL, 1);
    object.set_str(tags::PHOTOMETRIC_INTERPRETATION, Vr::CS, "MONOCHROME2");
    object.set_u16(tags::ROWS, 1);
    object.set_u16(tags::COLUMNS, 1);
    object.set_u16(tags::BITS_ALLOCATED, 16);
    object.set_u16(tags::BITS_STORED, 16);
    object.set_u16(tags::HIGH_BIT, 15);
    object.set_u16(tags::PIXEL_REPRESENTATION, 0);
    object.set_bytes(tags::PIXEL_DATA, Vr::OW, vec![0x00, 0x00]);
    object
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn odd_length_string_values_are_padded_even() {
        let mut object = DicomObject::new();
        object.set_str(tags::STUDY_INSTANCE_UID, Vr::UI, "1.2.3");
        let element = object.get(tags::STUDY_INSTANCE_UID).expect("element");
        assert_eq!(element.data.len() % 2, 0);
        assert_eq!(element.data.last(), Some(&0x00));
        assert_eq!(object.study_instance_uid().as_deref(), Some("1.2.3"));

        object.set_str(tags::MODALITY, Vr::CS, "C");
        let element = object.get(tags::MODALITY).expect("element");
        assert_eq!(element.data, b"C ");
        assert_eq!(object.modality().as_deref(), Some("C"));
    }

    #[test]
    fn uid_validation_matches_dotted_decimal_rules() {
        assert!(is_valid_uid("1"));
        assert!(is_valid_uid("1.2.840.10008.5.1.4.1.1.2"));
        assert!(!is_valid_uid(""));
        assert!(!is_valid_uid(".1.2"));
        assert!(!is_valid_uid("1.2."));
        assert!(!is_valid_uid("1..2"));
        assert!(!is_valid_uid("1.2a.3"));
        let long = "1.".repeat(32) + "1";
        assert!(long.len() > 64);
        assert!(!is_valid_uid(&long));
    }

    #[test]
    fn generated_uids_are_valid_and_distinct() {
        let first = generate_uid();
        let second = generate_uid();
        assert!(is_valid_uid(&first), "{first}");
        assert!(is_valid_uid(&second), "{second}");
        assert_ne!(first, second);
    }

    #[test]
    fn synthetic_image_carries_routing_header() {
        let object = synthetic_image(
            uids::CT_IMAGE_STORAGE,
            "1.2.3",
            "1.2.3.1",
            "1.2.3.4",
            "CT",
        );
        assert_eq!(object.sop_class_uid().as_deref(), Some(uids::CT_IMAGE_STORAGE));
        assert_eq!(object.study_instance_uid().as_deref(), Some("1.2.3"));
        assert_eq!(object.sop_instance_uid().as_deref(), Some("1.2.3.4"));
        assert_eq!(object.modality().as_deref(), Some("CT"));
        assert!(object.contains(tags::PIXEL_DATA));
    }
}
