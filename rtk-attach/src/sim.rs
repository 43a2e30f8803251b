//! In-memory stand-ins for the UART and the controller, for tests.

use std::{
    collections::{HashMap, HashSet},
    io,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use bytes::{BufMut, Bytes, BytesMut};
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{Encoder, Framed};

use crate::h5::{Frame, FrameCodec, PacketType, SEQ_MASK};
use crate::hci::{Opcode, EVT_COMMAND_COMPLETE};
use crate::transport::Transport;

const PIPE_CAPACITY: usize = 16 * 1024;

/// Subversion a freshly powered chip reports.
pub const UNPATCHED_SUBVERSION: u16 = 0x000d;
/// Subversion reported once the patch is running.
pub const PATCHED_SUBVERSION: u16 = 0x8723;

#[derive(Debug)]
struct ProbeState {
    baud_rate: u32,
    history: Vec<u32>,
    discards: usize,
    reject_baud_changes: bool,
}

/// Observes and steers a [`SimPort`] from the test body.
#[derive(Debug, Clone)]
pub struct SimProbe(Arc<Mutex<ProbeState>>);

impl SimProbe {
    pub fn baud_rate(&self) -> u32 {
        self.0.lock().unwrap().baud_rate
    }

    /// Every rate applied after the port was created, in order.
    pub fn baud_history(&self) -> Vec<u32> {
        self.0.lock().unwrap().history.clone()
    }

    pub fn discards(&self) -> usize {
        self.0.lock().unwrap().discards
    }

    pub fn reject_baud_changes(&self) {
        self.0.lock().unwrap().reject_baud_changes = true;
    }
}

/// Host end of an in-memory pipe that pretends to be a UART.
#[derive(Debug)]
pub struct SimPort {
    io: DuplexStream,
    probe: SimProbe,
}

impl SimPort {
    /// A port at `baud_rate`, the chip's end of the pipe, and a probe.
    pub fn pair(baud_rate: u32) -> (SimPort, DuplexStream, SimProbe) {
        let (host, chip) = tokio::io::duplex(PIPE_CAPACITY);
        let probe = SimProbe(Arc::new(Mutex::new(ProbeState {
            baud_rate,
            history: Vec::new(),
            discards: 0,
            reject_baud_changes: false,
        })));
        let port = SimPort {
            io: host,
            probe: probe.clone(),
        };
        (port, chip, probe)
    }
}

impl Transport for SimPort {
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        let mut state = self.probe.0.lock().unwrap();
        if state.reject_baud_changes {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unsupported baud rate",
            ));
        }
        state.baud_rate = baud_rate;
        state.history.push(baud_rate);
        Ok(())
    }

    fn discard_buffers(&mut self) -> io::Result<()> {
        self.probe.0.lock().unwrap().discards += 1;
        Ok(())
    }
}

impl AsyncRead for SimPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for SimPort {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// The chip's end of the pipe, speaking frames.
pub struct ChipEnd {
    framed: Framed<DuplexStream, FrameCodec>,
}

impl ChipEnd {
    pub fn new(io: DuplexStream) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new()),
        }
    }

    pub async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    /// Write bytes that need not form a valid frame.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        SinkExt::<Frame>::flush(&mut self.framed).await.unwrap();
        self.framed.get_mut().write_all(bytes).await.unwrap();
    }

    /// Next well-formed frame from the host; `None` once the host is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            match self.framed.next().await? {
                Ok(Ok(frame)) => return Some(frame),
                Ok(Err(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// Payload of a command-complete event.
pub fn command_complete(opcode: u16, status: u8, return_params: &[u8]) -> Bytes {
    let mut payload = BytesMut::with_capacity(6 + return_params.len());
    payload.put_u8(EVT_COMMAND_COMPLETE);
    payload.put_u8((4 + return_params.len()) as u8);
    payload.put_u8(1);
    payload.put_u16_le(opcode);
    payload.put_u8(status);
    payload.put_slice(return_params);
    payload.freeze()
}

/// Return parameters of Read Local Version reporting `subversion`.
pub fn local_version(subversion: u16) -> Vec<u8> {
    let mut params = vec![0x08];
    params.extend_from_slice(&0x000du16.to_le_bytes());
    params.push(0x08);
    params.extend_from_slice(&0x005du16.to_le_bytes());
    params.extend_from_slice(&subversion.to_le_bytes());
    params
}

/// A command as the chip received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub opcode: u16,
    pub params: Vec<u8>,
}

/// A scripted controller that answers every command with command-complete.
///
/// It reports [`UNPATCHED_SUBVERSION`] until download mode has been entered
/// and then left again, and [`PATCHED_SUBVERSION`] afterwards.
#[derive(Debug, Default)]
pub struct SimChip {
    silent: bool,
    patched: bool,
    muted: HashSet<u16>,
    corrupted: HashSet<u16>,
    replies: HashMap<u16, (u8, Vec<u8>)>,
}

impl SimChip {
    pub fn new() -> Self {
        Self::default()
    }

    /// Never answer anything.
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Report the patched subversion from the start.
    pub fn already_patched(mut self) -> Self {
        self.patched = true;
        self
    }

    /// Swallow `opcode` without answering.
    pub fn mute(mut self, opcode: Opcode) -> Self {
        self.muted.insert(opcode as u16);
        self
    }

    /// Answer `opcode` with a frame whose checksum is wrong.
    pub fn corrupt(mut self, opcode: Opcode) -> Self {
        self.corrupted.insert(opcode as u16);
        self
    }

    /// Answer `opcode` with `status` and `return_params` instead of the usual reply.
    pub fn reply_with(mut self, opcode: Opcode, status: u8, return_params: &[u8]) -> Self {
        self.replies
            .insert(opcode as u16, (status, return_params.to_vec()));
        self
    }

    pub fn spawn(self, io: DuplexStream) -> SimChipHandle {
        let log = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(self.run(ChipEnd::new(io), log.clone()));
        SimChipHandle { log, task }
    }

    async fn run(mut self, mut end: ChipEnd, log: Arc<Mutex<Vec<ReceivedCommand>>>) {
        let mut seq = 0u8;
        let mut download_mode = false;

        while let Some(frame) = end.recv().await {
            if frame.packet_type() != PacketType::Command || frame.payload().len() < 3 {
                continue;
            }

            let payload = frame.payload();
            let opcode = u16::from_le_bytes([payload[0], payload[1]]);
            let params = payload[3..].to_vec();
            log.lock().unwrap().push(ReceivedCommand {
                opcode,
                params: params.clone(),
            });

            if self.silent || self.muted.contains(&opcode) {
                continue;
            }

            let (status, return_params) = match self.replies.get(&opcode).cloned() {
                Some(reply) => reply,
                None => (0x00, self.default_reply(opcode, &params, &mut download_mode)),
            };

            let ack = (frame.seq() + 1) & SEQ_MASK;
            let reply = Frame::new(
                ack,
                seq,
                PacketType::Event,
                command_complete(opcode, status, &return_params),
            )
            .unwrap();
            seq = (seq + 1) & SEQ_MASK;

            if self.corrupted.contains(&opcode) {
                let mut wire = BytesMut::new();
                FrameCodec::new().encode(reply, &mut wire).unwrap();
                let checksum_at = wire.len() - 2;
                wire[checksum_at] ^= 0xff;
                end.send_raw(&wire).await;
            } else {
                end.send(reply).await;
            }
        }
    }

    fn default_reply(&mut self, opcode: u16, params: &[u8], download_mode: &mut bool) -> Vec<u8> {
        match Opcode::from_repr(opcode) {
            Some(Opcode::ReadLocalVersion) => local_version(if self.patched {
                PATCHED_SUBVERSION
            } else {
                UNPATCHED_SUBVERSION
            }),
            Some(Opcode::VendorDownloadMode) => {
                match params.first() {
                    Some(0x01) => *download_mode = true,
                    Some(0x00) if *download_mode => {
                        *download_mode = false;
                        self.patched = true;
                    }
                    _ => {}
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }
}

/// Access to what a spawned [`SimChip`] has seen.
pub struct SimChipHandle {
    log: Arc<Mutex<Vec<ReceivedCommand>>>,
    task: JoinHandle<()>,
}

impl SimChipHandle {
    pub fn commands(&self) -> Vec<ReceivedCommand> {
        self.log.lock().unwrap().clone()
    }

    pub fn opcodes(&self) -> Vec<u16> {
        self.commands().iter().map(|c| c.opcode).collect()
    }

    pub fn count(&self, opcode: Opcode) -> usize {
        self.commands()
            .iter()
            .filter(|c| c.opcode == opcode as u16)
            .count()
    }
}

impl Drop for SimChipHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A well-formed firmware image of `total_len` bytes, header included.
pub fn firmware_image(total_len: usize) -> Vec<u8> {
    let patch_len = total_len - crate::firmware::HEADER_LEN;
    let mut image = Vec::with_capacity(total_len);
    image.extend_from_slice(crate::firmware::SIGNATURE);
    image.extend_from_slice(&0x0001u16.to_le_bytes());
    image.extend_from_slice(&1u16.to_le_bytes());
    image.extend_from_slice(&(patch_len as u32).to_le_bytes());
    image.extend((0..patch_len).map(|i| i as u8));
    image
}
