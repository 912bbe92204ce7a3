use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

pub mod assoc;
pub mod server;

pub use assoc::{associate, AssocError, Association};
pub use server::{DimseHandlers, DimseServer, InboundStore};

pub const STATUS_SUCCESS: u16 = 0x0000;
pub const STATUS_REFUSED: u16 = 0xA700;

/// Upper bound on a single PDU body; an inbound frame larger than this is a
/// protocol violation, not an allocation request.
const MAX_PDU_BODY: u32 = 64 * 1024 * 1024;

const PDU_ASSOCIATE_RQ: u8 = 0x01;
const PDU_ASSOCIATE_AC: u8 = 0x02;
const PDU_ASSOCIATE_RJ: u8 = 0x03;
const PDU_COMMAND: u8 = 0x04;
const PDU_DATASET: u8 = 0x05;
const PDU_RELEASE_RQ: u8 = 0x06;
const PDU_RELEASE_RP: u8 = 0x07;
const PDU_ABORT: u8 = 0x08;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociateRq {
    pub calling_ae_title: String,
    pub called_ae_title: String,
    /// Abstract syntaxes (SOP class UIDs) the initiator proposes.
    pub presentation_contexts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociateAc {
    pub accepted_contexts: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssociateRj {
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    CEchoRq,
    CEchoRsp,
    CStoreRq,
    CStoreRsp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub message_id: u32,
    pub kind: CommandKind,
    #[serde(default)]
    pub sop_class_uid: Option<String>,
    #[serde(default)]
    pub sop_instance_uid: Option<String>,
    #[serde(default)]
    pub status: Option<u16>,
    /// A C-STORE request is followed by exactly one dataset PDU.
    #[serde(default)]
    pub has_dataset: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    AssociateRq(AssociateRq),
    AssociateAc(AssociateAc),
    AssociateRj(AssociateRj),
    Command(Command),
    Dataset(Vec<u8>),
    ReleaseRq,
    ReleaseRp,
    Abort,
}

pub fn write_pdu(stream: &mut impl Write, pdu: &Pdu) -> std::io::Result<()> {
    let (kind, body) = match pdu {
        Pdu::AssociateRq(rq) => (PDU_ASSOCIATE_RQ, serde_json::to_vec(rq)?),
        Pdu::AssociateAc(ac) => (PDU_ASSOCIATE_AC, serde_json::to_vec(ac)?),
        Pdu::AssociateRj(rj) => (PDU_ASSOCIATE_RJ, serde_json::to_vec(rj)?),
        Pdu::Command(command) => (PDU_COMMAND, serde_json::to_vec(command)?),
        Pdu::Dataset(bytes) => (PDU_DATASET, bytes.clone()),
        Pdu::ReleaseRq => (PDU_RELEASE_RQ, Vec::new()),
        Pdu::ReleaseRp => (PDU_RELEASE_RP, Vec::new()),
        Pdu::Abort => (PDU_ABORT, Vec::new()),
    };
    stream.write_all(&[kind])?;
    stream.write_all(&(body.len() as u32).to_be_bytes())?;
    stream.write_all(&body)?;
    stream.flush()
}

pub fn read_pdu(stream: &mut impl Read) -> std::io::Result<Pdu> {
    let mut header = [0u8; 5];
    stream.read_exact(&mut header)?;
    let kind = header[0];
    let length = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if length > MAX_PDU_BODY {
        return Err(invalid(format!("pdu body of {length} bytes exceeds limit")));
    }
    let mut body = vec![0u8; length as usize];
    stream.read_exact(&mut body)?;

    match kind {
        PDU_ASSOCIATE_RQ => Ok(Pdu::AssociateRq(decode_json(&body)?)),
        PDU_ASSOCIATE_AC => Ok(Pdu::AssociateAc(decode_json(&body)?)),
        PDU_ASSOCIATE_RJ => Ok(Pdu::AssociateRj(decode_json(&body)?)),
        PDU_COMMAND => Ok(Pdu::Command(decode_json(&body)?)),
        PDU_DATASET => Ok(Pdu::Dataset(body)),
        PDU_RELEASE_RQ => Ok(Pdu::ReleaseRq),
        PDU_RELEASE_RP => Ok(Pdu::ReleaseRp),
        PDU_ABORT => Ok(Pdu::Abort),
        other => Err(invalid(format!("unknown pdu type 0x{other:02x}"))),
    }
}

fn decode_json<T: for<'de> Deserialize<'de>>(body: &[u8]) -> std::io::Result<T> {
    serde_json::from_slice(body).map_err(|e| invalid(format!("malformed pdu body: {e}")))
}

fn invalid(message: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, message)
}
