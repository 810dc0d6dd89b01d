//! TCP link standing in for the GATT bearer: hello exchange, then
//! length-prefixed bincode frames carrying PDUs, one stream per connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ras_core::protocol::{Channel, ConnId, Pdu};
use ras_core::{RasHandle, SendError, ServiceError, Transport};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::Role;

pub const LINK_VERSION: u8 = 1;
const LEN_SIZE: usize = 4;
const MAX_FRAME_LEN: u32 = 64 * 1024;
/// Frames queued per connection before the link reports no buffers.
const SEND_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkFrame {
    /// First frame in each direction. Sent again to renegotiate the MTU.
    Hello { version: u8, mtu: u16 },
    Pdu(Pdu),
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame codec: {0}")]
    Codec(#[from] bincode::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("peer speaks link version {0}")]
    Version(u8),
    #[error("expected hello frame")]
    NoHello,
    #[error(transparent)]
    Service(#[from] ServiceError),
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &LinkFrame) -> Result<(), LinkError> {
    let bytes = bincode::serialize(frame)?;
    if bytes.len() > MAX_FRAME_LEN as usize {
        return Err(LinkError::FrameTooLarge(bytes.len()));
    }
    w.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<LinkFrame, LinkError> {
    let mut len_buf = [0u8; LEN_SIZE];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(LinkError::FrameTooLarge(len as usize));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf).await?;
    Ok(bincode::deserialize(&buf)?)
}

/// Transport handed to the ranging service. Each live connection owns a
/// bounded queue drained by its writer task.
#[derive(Clone, Default)]
pub struct LinkTransport {
    senders: Arc<Mutex<HashMap<ConnId, mpsc::Sender<LinkFrame>>>>,
}

impl LinkTransport {
    fn register(&self, conn: ConnId, tx: mpsc::Sender<LinkFrame>) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(conn, tx);
        }
    }

    fn unregister(&self, conn: ConnId) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(&conn);
        }
    }
}

impl Transport for LinkTransport {
    fn send(&mut self, conn: ConnId, pdu: &Pdu) -> Result<(), SendError> {
        let senders = self.senders.lock().map_err(|_| SendError::Disconnected)?;
        let tx = senders.get(&conn).ok_or(SendError::Disconnected)?;
        tx.try_send(LinkFrame::Pdu(pdu.clone())).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SendError::NoBuffers,
            mpsc::error::TrySendError::Closed(_) => SendError::Disconnected,
        })
    }
}

/// Exchange hellos, attach `conn` to the service in `role`, then pump frames
/// until the stream ends. The service is told about the disconnect either way.
pub async fn run_connection(
    stream: TcpStream,
    conn: ConnId,
    role: Role,
    local_mtu: u16,
    handle: RasHandle,
    transport: LinkTransport,
) -> Result<(), LinkError> {
    let (mut reader, mut writer) = stream.into_split();
    write_frame(
        &mut writer,
        &LinkFrame::Hello {
            version: LINK_VERSION,
            mtu: local_mtu,
        },
    )
    .await?;
    let mtu = match read_frame(&mut reader).await? {
        LinkFrame::Hello { version, .. } if version != LINK_VERSION => {
            return Err(LinkError::Version(version))
        }
        LinkFrame::Hello { mtu, .. } => mtu.min(local_mtu),
        LinkFrame::Pdu(_) => return Err(LinkError::NoHello),
    };
    info!(conn = %conn, mtu, ?role, "link up");

    let (tx, mut rx) = mpsc::channel::<LinkFrame>(SEND_QUEUE_DEPTH);
    transport.register(conn, tx);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                debug!(conn = %conn, error = %e, "link writer stopped");
                break;
            }
        }
    });

    let result = serve(&mut reader, conn, role, mtu, local_mtu, &handle).await;
    transport.unregister(conn);
    handle.disconnected(conn)?;
    info!(conn = %conn, "link down");
    result
}

async fn serve<R: AsyncRead + Unpin>(
    reader: &mut R,
    conn: ConnId,
    role: Role,
    mtu: u16,
    local_mtu: u16,
    handle: &RasHandle,
) -> Result<(), LinkError> {
    match role {
        Role::Responder => handle.alloc_responder(conn, mtu).await?,
        Role::Requester => {
            handle.alloc_requester(conn).await?;
            for channel in [
                Channel::ControlPoint,
                Channel::OnDemandData,
                Channel::RecordReady,
                Channel::RecordOverwritten,
            ] {
                handle.subscribe(conn, channel, true)?;
            }
        }
    }

    loop {
        let frame = match read_frame(reader).await {
            Ok(f) => f,
            Err(LinkError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };
        match frame {
            LinkFrame::Pdu(pdu) => handle.received(conn, pdu)?,
            LinkFrame::Hello { mtu, .. } => {
                let mtu = mtu.min(local_mtu);
                debug!(conn = %conn, mtu, "MTU renegotiated");
                handle.mtu_changed(conn, mtu)?;
            }
        }
    }
}

/// Connection ids handed out in accept order.
pub struct ConnIds(u16);

impl ConnIds {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn next(&mut self) -> ConnId {
        self.0 = self.0.wrapping_add(1).max(1);
        ConnId(self.0)
    }
}

impl Default for ConnIds {
    fn default() -> Self {
        Self::new()
    }
}

pub fn log_link_error(conn: ConnId, e: &LinkError) {
    match e {
        LinkError::Io(_) => debug!(conn = %conn, error = %e, "link closed"),
        _ => warn!(conn = %conn, error = %e, "link failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ras_core::{Config, RasService};

    #[tokio::test]
    async fn frames_cross_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let frames = [
            LinkFrame::Hello {
                version: LINK_VERSION,
                mtu: 185,
            },
            LinkFrame::Pdu(Pdu::Notify {
                channel: Channel::OnDemandData,
                payload: vec![0x03, 1, 2, 3],
            }),
        ];
        for f in &frames {
            write_frame(&mut a, f).await.unwrap();
        }
        for f in &frames {
            assert_eq!(&read_frame(&mut b).await.unwrap(), f);
        }
    }

    #[tokio::test]
    async fn oversized_length_is_refused() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAME_LEN + 1).to_le_bytes()).await.unwrap();
        assert!(matches!(
            read_frame(&mut b).await,
            Err(LinkError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn full_queue_reports_no_buffers() {
        let mut transport = LinkTransport::default();
        let pdu = Pdu::ReadRequest {
            channel: Channel::Features,
        };
        assert_eq!(
            transport.send(ConnId(1), &pdu),
            Err(SendError::Disconnected)
        );

        let (tx, rx) = mpsc::channel(1);
        transport.register(ConnId(1), tx);
        assert_eq!(transport.send(ConnId(1), &pdu), Ok(()));
        assert_eq!(transport.send(ConnId(1), &pdu), Err(SendError::NoBuffers));
        drop(rx);
        assert_eq!(
            transport.send(ConnId(1), &pdu),
            Err(SendError::Disconnected)
        );
    }

    #[test]
    fn conn_ids_skip_zero() {
        let mut ids = ConnIds(u16::MAX - 1);
        assert_eq!(ids.next(), ConnId(u16::MAX));
        assert_eq!(ids.next(), ConnId(1));
    }

    #[tokio::test]
    async fn record_fetched_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let rsp_transport = LinkTransport::default();
        let (rsp, _rsp_events) = RasService::spawn(Config::default(), rsp_transport.clone());
        let req_transport = LinkTransport::default();
        let (req, mut req_events) = RasService::spawn(Config::default(), req_transport.clone());

        let server = {
            let rsp = rsp.clone();
            tokio::spawn(async move {
                let (stream, _) = listener.accept().await.unwrap();
                run_connection(stream, ConnId(1), Role::Responder, 100, rsp, rsp_transport).await
            })
        };
        let stream = TcpStream::connect(addr).await.unwrap();
        let client = {
            let req = req.clone();
            tokio::spawn(async move {
                run_connection(stream, ConnId(7), Role::Requester, 64, req, req_transport).await
            })
        };

        // Features round-trip: both ends attached, subscriptions delivered.
        loop {
            match req.read_features(ConnId(7)).await {
                Ok(features) => {
                    assert_eq!(features, 0);
                    break;
                }
                Err(_) => tokio::time::sleep(std::time::Duration::from_millis(5)).await,
            }
        }

        let procedure = {
            let mut synth = crate::synth::ProcedureSynth::new(
                ras_core::ranging::CsRole::Reflector,
                2,
                2,
                12,
            );
            synth.next_procedure(&mut rand::thread_rng())
        };
        for s in procedure {
            rsp.subevent(ConnId(1), s).unwrap();
        }
        assert!(rsp.ready_check(ConnId(1), 0).await.unwrap());

        let expected = rsp.read_record(ConnId(1), 0).await.unwrap().unwrap();
        let got = req.get_record(ConnId(7), 0, 8192).await.unwrap();
        assert_eq!(got.as_slice(), &expected[..]);

        let mut announced = false;
        while let Ok(event) = req_events.try_recv() {
            if event
                == (ras_core::RasEvent::PeerRecordReady {
                    conn: ConnId(7),
                    ranging_counter: 0,
                })
            {
                announced = true;
            }
        }
        assert!(announced);

        client.abort();
        server.abort();
    }
}
