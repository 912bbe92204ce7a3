use super::{
    read_pdu, write_pdu, AssociateAc, AssociateRj, Command, CommandKind, Pdu, STATUS_REFUSED,
};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One received C-STORE, as handed to the application handler.
#[derive(Debug, Clone)]
pub struct InboundStore {
    pub dataset: Vec<u8>,
    pub sop_class_uid: Option<String>,
    pub sop_instance_uid: Option<String>,
    pub calling_ae_title: String,
    pub called_ae_title: String,
    pub remote_ip: Option<String>,
}

pub trait DimseHandlers: Send + Sync {
    fn on_c_store(&self, request: InboundStore) -> u16;
    fn on_c_echo(&self, calling_ae_title: &str) -> u16;
}

/// Acceptor side of the association protocol: one listener, one thread per
/// association, verbs dispatched to the registered handlers.
pub struct DimseServer {
    listener: TcpListener,
    ae_title: String,
    supported_contexts: Vec<String>,
    handlers: Arc<dyn DimseHandlers>,
}

impl DimseServer {
    pub fn bind(
        host: &str,
        port: u16,
        ae_title: &str,
        supported_contexts: Vec<String>,
        handlers: Arc<dyn DimseHandlers>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind((host, port))?;
        Ok(Self {
            listener,
            ae_title: ae_title.to_string(),
            supported_contexts,
            handlers,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve associations until the process exits.
    pub fn run(self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(_) => continue,
            };
            let ae_title = self.ae_title.clone();
            let contexts = self.supported_contexts.clone();
            let handlers = Arc::clone(&self.handlers);
            thread::spawn(move || {
                let _ = serve_association(stream, &ae_title, &contexts, handlers);
            });
        }
        Ok(())
    }

    /// Background variant for callers that need the bound address first.
    pub fn spawn(self) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let addr = self.local_addr()?;
        let handle = thread::spawn(move || {
            let _ = self.run();
        });
        Ok((addr, handle))
    }
}

fn serve_association(
    mut stream: TcpStream,
    ae_title: &str,
    supported_contexts: &[String],
    handlers: Arc<dyn DimseHandlers>,
) -> io::Result<()> {
    let remote_ip = stream.peer_addr().ok().map(|addr| addr.ip().to_string());

    let request = match read_pdu(&mut stream)? {
        Pdu::AssociateRq(request) => request,
        _ => {
            let _ = write_pdu(&mut stream, &Pdu::Abort);
            return Ok(());
        }
    };

    let accepted: Vec<String> = request
        .presentation_contexts
        .iter()
        .filter(|context| supported_contexts.contains(context))
        .cloned()
        .collect();
    if accepted.is_empty() {
        write_pdu(
            &mut stream,
            &Pdu::AssociateRj(AssociateRj {
                reason: "no acceptable presentation contexts".to_string(),
            }),
        )?;
        return Ok(());
    }
    write_pdu(
        &mut stream,
        &Pdu::AssociateAc(AssociateAc {
            accepted_contexts: accepted,
        }),
    )?;

    loop {
        let pdu = match read_pdu(&mut stream) {
            Ok(pdu) => pdu,
            Err(_) => return Ok(()),
        };
        match pdu {
            Pdu::Command(command) => match command.kind {
                CommandKind::CEchoRq => {
                    let status = handlers.on_c_echo(&request.calling_ae_title);
                    respond(&mut stream, CommandKind::CEchoRsp, &command, status)?;
                }
                CommandKind::CStoreRq => {
                    let dataset = if command.has_dataset {
                        match read_pdu(&mut stream)? {
                            Pdu::Dataset(bytes) => bytes,
                            _ => {
                                let _ = write_pdu(&mut stream, &Pdu::Abort);
                                return Ok(());
                            }
                        }
                    } else {
                        Vec::new()
                    };
                    let status = handlers.on_c_store(InboundStore {
                        dataset,
                        sop_class_uid: command.sop_class_uid.clone(),
                        sop_instance_uid: command.sop_instance_uid.clone(),
                        calling_ae_title: request.calling_ae_title.clone(),
                        called_ae_title: ae_title.to_string(),
                        remote_ip: remote_ip.clone(),
                    });
                    respond(&mut stream, CommandKind::CStoreRsp, &command, status)?;
                }
                // Response verbs are initiator-side; answering one here is a
                // peer bug.
                CommandKind::CEchoRsp | CommandKind::CStoreRsp => {
                    respond(&mut stream, command.kind, &command, STATUS_REFUSED)?;
                }
            },
            Pdu::ReleaseRq => {
                let _ = write_pdu(&mut stream, &Pdu::ReleaseRp);
                return Ok(());
            }
            Pdu::Abort => return Ok(()),
            _ => {
                let _ = write_pdu(&mut stream, &Pdu::Abort);
                return Ok(());
            }
        }
    }
}

fn respond(
    stream: &mut TcpStream,
    kind: CommandKind,
    request: &Command,
    status: u16,
) -> io::Result<()> {
    write_pdu(
        stream,
        &Pdu::Command(Command {
            message_id: request.message_id,
            kind,
            sop_class_uid: request.sop_class_uid.clone(),
            sop_instance_uid: request.sop_instance_uid.clone(),
            status: Some(status),
            has_dataset: false,
        }),
    )
}
