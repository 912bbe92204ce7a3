use super::{
    read_pdu, write_pdu, AssociateRq, Command, CommandKind, Pdu,
};
use std::io;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum AssocError {
    #[error("peer did not answer within the timeout")]
    Timeout,
    #[error("association rejected: {0}")]
    Rejected(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("network failure: {0}")]
    Io(io::Error),
}

impl From<io::Error> for AssocError {
    fn from(source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => AssocError::Timeout,
            _ => AssocError::Io(source),
        }
    }
}

/// Established initiator-side association. One timeout value covers connect,
/// message exchange, and network idle.
#[derive(Debug)]
pub struct Association {
    stream: TcpStream,
    accepted_contexts: Vec<String>,
    next_message_id: u32,
}

pub fn associate(
    host: &str,
    port: u16,
    calling_ae_title: &str,
    called_ae_title: &str,
    presentation_contexts: &[String],
    timeout: Duration,
) -> Result<Association, AssocError> {
    let addr = (host, port)
        .to_socket_addrs()
        .map_err(|e| AssocError::Protocol(format!("unresolvable peer {host}:{port}: {e}")))?
        .next()
        .ok_or_else(|| AssocError::Protocol(format!("unresolvable peer {host}:{port}")))?;

    let stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let mut association = Association {
        stream,
        accepted_contexts: Vec::new(),
        next_message_id: 1,
    };
    write_pdu(
        &mut association.stream,
        &Pdu::AssociateRq(AssociateRq {
            calling_ae_title: calling_ae_title.to_string(),
            called_ae_title: called_ae_title.to_string(),
            presentation_contexts: presentation_contexts.to_vec(),
        }),
    )?;

    match read_pdu(&mut association.stream)? {
        Pdu::AssociateAc(ac) => {
            association.accepted_contexts = ac.accepted_contexts;
            Ok(association)
        }
        Pdu::AssociateRj(rj) => Err(AssocError::Rejected(rj.reason)),
        Pdu::Abort => Err(AssocError::Rejected("aborted by peer".to_string())),
        other => Err(AssocError::Protocol(format!(
            "unexpected answer to association request: {other:?}"
        ))),
    }
}

impl Association {
    pub fn accepted_contexts(&self) -> &[String] {
        &self.accepted_contexts
    }

    pub fn c_echo(&mut self) -> Result<u16, AssocError> {
        let message_id = self.take_message_id();
        write_pdu(
            &mut self.stream,
            &Pdu::Command(Command {
                message_id,
                kind: CommandKind::CEchoRq,
                sop_class_uid: None,
                sop_instance_uid: None,
                status: None,
                has_dataset: false,
            }),
        )?;
        let response = self.expect_response(CommandKind::CEchoRsp, message_id)?;
        response
            .status
            .ok_or_else(|| AssocError::Protocol("echo response without status".to_string()))
    }

    /// Returns the peer's status verbatim; a response with no status field is
    /// `None` so the caller can distinguish it from a failure code.
    pub fn c_store(
        &mut self,
        sop_class_uid: &str,
        sop_instance_uid: &str,
        dataset: &[u8],
    ) -> Result<Option<u16>, AssocError> {
        let message_id = self.take_message_id();
        write_pdu(
            &mut self.stream,
            &Pdu::Command(Command {
                message_id,
                kind: CommandKind::CStoreRq,
                sop_class_uid: Some(sop_class_uid.to_string()),
                sop_instance_uid: Some(sop_instance_uid.to_string()),
                status: None,
                has_dataset: true,
            }),
        )?;
        write_pdu(&mut self.stream, &Pdu::Dataset(dataset.to_vec()))?;
        let response = self.expect_response(CommandKind::CStoreRsp, message_id)?;
        Ok(response.status)
    }

    pub fn release(mut self) -> Result<(), AssocError> {
        write_pdu(&mut self.stream, &Pdu::ReleaseRq)?;
        match read_pdu(&mut self.stream) {
            Ok(Pdu::ReleaseRp) | Err(_) => Ok(()),
            Ok(other) => Err(AssocError::Protocol(format!(
                "unexpected answer to release: {other:?}"
            ))),
        }
    }

    fn take_message_id(&mut self) -> u32 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    fn expect_response(
        &mut self,
        kind: CommandKind,
        message_id: u32,
    ) -> Result<Command, AssocError> {
        match read_pdu(&mut self.stream)? {
            Pdu::Command(command) if command.kind == kind && command.message_id == message_id => {
                Ok(command)
            }
            Pdu::Abort => Err(AssocError::Rejected("aborted by peer".to_string())),
            other => Err(AssocError::Protocol(format!(
                "unexpected response pdu: {other:?}"
            ))),
        }
    }
}
