use super::{tags, uids, DicomObject, Element, Tag, Vr};

const PREAMBLE_LEN: usize = 128;
const MAGIC: &[u8; 4] = b"DICM";

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("file too short for preamble and magic")]
    Truncated,
    #[error("missing DICM magic")]
    BadMagic,
    #[error("unsupported transfer syntax `{0}`")]
    UnsupportedTransferSyntax(String),
    #[error("malformed element at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },
}

/// Encode to a standard DICOM file: 128-byte preamble, `DICM`, file-meta
/// group, dataset in explicit-VR little-endian. The file-meta group length
/// is always recomputed; the remaining meta elements are synthesized from the
/// dataset when the object does not already carry them.
pub fn write_file(object: &DicomObject) -> Vec<u8> {
    let mut meta: Vec<(Tag, Element)> = object
        .elements()
        .filter(|((group, _), _)| *group == 0x0002)
        .filter(|(tag, _)| *tag != &tags::FILE_META_GROUP_LENGTH)
        .map(|(tag, element)| (*tag, element.clone()))
        .collect();
    if meta.is_empty() {
        meta = synthesize_meta(object);
    }

    let mut meta_body = Vec::new();
    for (tag, element) in &meta {
        encode_element(&mut meta_body, *tag, element);
    }

    let mut out = vec![0u8; PREAMBLE_LEN];
    out.extend_from_slice(MAGIC);
    encode_element(
        &mut out,
        tags::FILE_META_GROUP_LENGTH,
        &Element {
            vr: Vr::UL,
            data: (meta_body.len() as u32).to_le_bytes().to_vec(),
        },
    );
    out.extend_from_slice(&meta_body);

    for (tag, element) in object.elements() {
        if tag.0 == 0x0002 {
            continue;
        }
        encode_element(&mut out, *tag, element);
    }
    out
}

/// Decode a DICOM file. Only explicit-VR little-endian is accepted; the
/// gateway never re-encodes transfer syntaxes. With `stop_before_pixels` the
/// parse ends at the pixel-data element, which is what the router needs.
pub fn read_file(bytes: &[u8], stop_before_pixels: bool) -> Result<DicomObject, CodecError> {
    if bytes.len() < PREAMBLE_LEN + MAGIC.len() {
        return Err(CodecError::Truncated);
    }
    if &bytes[PREAMBLE_LEN..PREAMBLE_LEN + MAGIC.len()] != MAGIC {
        return Err(CodecError::BadMagic);
    }

    let mut object = DicomObject::new();
    let mut offset = PREAMBLE_LEN + MAGIC.len();
    let mut transfer_syntax: Option<String> = None;
    let mut past_meta = false;

    while offset < bytes.len() {
        let (tag, element, next) = decode_element(bytes, offset)?;

        if tag.0 != 0x0002 && !past_meta {
            past_meta = true;
            match transfer_syntax.as_deref() {
                Some(uids::EXPLICIT_VR_LITTLE_ENDIAN) => {}
                Some(other) => {
                    return Err(CodecError::UnsupportedTransferSyntax(other.to_string()))
                }
                None => {
                    return Err(CodecError::UnsupportedTransferSyntax("missing".to_string()))
                }
            }
        }

        if tag == tags::TRANSFER_SYNTAX_UID {
            let text = String::from_utf8_lossy(&element.data);
            transfer_syntax = Some(text.trim_end_matches(['\0', ' ']).to_string());
        }

        if stop_before_pixels && tag == tags::PIXEL_DATA {
            return Ok(object);
        }
        if tag != tags::FILE_META_GROUP_LENGTH {
            object.insert(tag, element);
        }
        offset = next;
    }

    Ok(object)
}

fn synthesize_meta(object: &DicomObject) -> Vec<(Tag, Element)> {
    let sop_class = object.sop_class_uid().unwrap_or_default();
    let sop_instance = object.sop_instance_uid().unwrap_or_default();
    let mut meta = DicomObject::new();
    meta.set_str(tags::MEDIA_STORAGE_SOP_CLASS_UID, Vr::UI, &sop_class);
    meta.set_str(tags::MEDIA_STORAGE_SOP_INSTANCE_UID, Vr::UI, &sop_instance);
    meta.set_str(
        tags::TRANSFER_SYNTAX_UID,
        Vr::UI,
        uids::EXPLICIT_VR_LITTLE_ENDIAN,
    );
    meta.set_str(
        tags::IMPLEMENTATION_CLASS_UID,
        Vr::UI,
        uids::IMPLEMENTATION_CLASS,
    );
    meta.elements()
        .map(|(tag, element)| (*tag, element.clone()))
        .collect()
}

fn encode_element(out: &mut Vec<u8>, tag: Tag, element: &Element) {
    out.extend_from_slice(&tag.0.to_le_bytes());
    out.extend_from_slice(&tag.1.to_le_bytes());
    out.extend_from_slice(&element.vr.0);
    if element.vr.uses_long_length() {
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&(element.data.len() as u32).to_le_bytes());
    } else {
        out.extend_from_slice(&(element.data.len() as u16).to_le_bytes());
    }
    out.extend_from_slice(&element.data);
}

fn decode_element(bytes: &[u8], offset: usize) -> Result<(Tag, Element, usize), CodecError> {
    let malformed = |reason: &str| CodecError::Malformed {
        offset,
        reason: reason.to_string(),
    };

    if bytes.len() < offset + 8 {
        return Err(malformed("element header past end of file"));
    }
    let group = u16::from_le_bytes([bytes[offset], bytes[offset + 1]]);
    let elem = u16::from_le_bytes([bytes[offset + 2], bytes[offset + 3]]);
    let vr = Vr([bytes[offset + 4], bytes[offset + 5]]);
    if !vr.0.iter().all(|b| b.is_ascii_uppercase()) {
        return Err(malformed("not an explicit-VR element"));
    }

    let (length, value_start) = if vr.uses_long_length() {
        if bytes.len() < offset + 12 {
            return Err(malformed("long element header past end of file"));
        }
        let length = u32::from_le_bytes([
            bytes[offset + 8],
            bytes[offset + 9],
            bytes[offset + 10],
            bytes[offset + 11],
        ]);
        if length == u32::MAX {
            return Err(malformed("undefined element length is unsupported"));
        }
        (length as usize, offset + 12)
    } else {
        let length = u16::from_le_bytes([bytes[offset + 6], bytes[offset + 7]]);
        (length as usize, offset + 8)
    };

    let value_end = value_start
        .checked_add(length)
        .ok_or_else(|| malformed("element length overflows"))?;
    if bytes.len() < value_end {
        return Err(malformed("element value past end of file"));
    }

    Ok((
        (group, elem),
        Element {
            vr,
            data: bytes[value_start..value_end].to_vec(),
        },
        value_end,
    ))
}
