use std::io;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{Frame, FrameCodec};

const READ_CHUNK: usize = 1024;

/// Pulls checksummed frames out of a byte stream.
///
/// Bytes before a magic byte are skipped. A candidate frame that fails to
/// decode costs one byte and the scan resumes right after its magic, so a
/// corrupted frame never swallows the one behind it. An incomplete candidate
/// is abandoned as soon as a complete valid frame is buffered behind it.
pub struct FrameReader<R> {
    reader: R,
    codec: FrameCodec,
    buf: Vec<u8>,
    eof: bool,
    dropped: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, codec: FrameCodec) -> Self {
        Self {
            reader,
            codec,
            buf: Vec::with_capacity(READ_CHUNK),
            eof: false,
            dropped: 0,
        }
    }

    /// Number of candidate frames rejected so far.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Append one read's worth of bytes to `buf`. Returns false at EOF.
    async fn read_chunk(&mut self) -> io::Result<bool> {
        if self.eof {
            return Ok(false);
        }
        let mut chunk = [0u8; READ_CHUNK];
        let read = self.reader.read(&mut chunk).await?;
        if read == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.buf.extend_from_slice(&chunk[..read]);
        Ok(true)
    }

    /// Read until `buf` holds at least `n` bytes. Returns false if the stream ended first.
    async fn fill(&mut self, n: usize) -> io::Result<bool> {
        while self.buf.len() < n {
            if !self.read_chunk().await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Whether a complete, checksum-valid frame starts at `start`.
    fn frame_at(&self, start: usize) -> bool {
        let rest = &self.buf[start..];
        if rest.len() < FrameCodec::HEADER_LEN {
            return false;
        }
        match self.codec.declared_len([rest[1], rest[2]]) {
            Ok(len) => {
                let total = FrameCodec::frame_len(len);
                total <= rest.len() && self.codec.decode(&rest[..total]).is_ok()
            }
            Err(_) => false,
        }
    }

    /// Offset of the first complete valid frame behind the candidate at offset 0.
    fn later_frame(&self) -> Option<usize> {
        let magic = self.codec.magic;
        (1..self.buf.len()).find(|&i| self.buf[i] == magic && self.frame_at(i))
    }

    fn skip_to_magic(&mut self) {
        let magic = self.codec.magic;
        let skip = self
            .buf
            .iter()
            .position(|&b| b == magic)
            .unwrap_or(self.buf.len());
        if skip > 0 {
            debug!("Skipping {} bytes before magic", skip);
            self.buf.drain(..skip);
        }
    }

    /// Wait until the candidate at offset 0 is `total` bytes long.
    ///
    /// Gives up on the candidate (returning false) if the stream ends or a
    /// complete valid frame shows up behind it first, so a stray header never
    /// holds back data that has already arrived.
    async fn await_candidate(&mut self, total: usize) -> io::Result<bool> {
        while self.buf.len() < total {
            if let Some(start) = self.later_frame() {
                warn!(
                    "Dropping incomplete {} byte candidate, valid frame at offset {}",
                    total, start
                );
                self.dropped += 1;
                self.buf.drain(..start);
                return Ok(false);
            }
            if !self.read_chunk().await? {
                debug!("Stream ended inside a {} byte candidate frame", total);
                self.buf.drain(..1);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Next valid frame, or `None` once the stream is exhausted.
    pub async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            if !self.fill(1).await? {
                if !self.buf.is_empty() {
                    debug!("Discarding {} trailing bytes at EOF", self.buf.len());
                    self.buf.clear();
                }
                return Ok(None);
            }

            self.skip_to_magic();
            if self.buf.is_empty() {
                continue;
            }

            if !self.fill(FrameCodec::HEADER_LEN).await? {
                self.buf.drain(..1);
                continue;
            }

            let len = match self.codec.declared_len([self.buf[1], self.buf[2]]) {
                Ok(len) => len,
                Err(e) => {
                    warn!("{}, resyncing", e);
                    self.dropped += 1;
                    self.buf.drain(..1);
                    continue;
                }
            };

            let total = FrameCodec::frame_len(len);
            if !self.await_candidate(total).await? {
                continue;
            }

            match self.codec.decode(&self.buf[..total]) {
                Ok(frame) => {
                    self.buf.drain(..total);
                    return Ok(Some(frame));
                }
                Err(e) => {
                    warn!("Dropping frame: {}", e);
                    self.dropped += 1;
                    self.buf.drain(..1);
                }
            }
        }
    }
}

/// Writes frames to a byte stream, one flush per frame.
pub struct FrameWriter<W> {
    writer: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, codec: FrameCodec) -> Self {
        Self { writer, codec }
    }

    pub async fn send(&mut self, frame: &Frame) -> Result<()> {
        let bytes = self.codec.encode(frame)?;
        self.write_encoded(&bytes).await
    }

    /// Write bytes that are already a complete frame.
    pub async fn write_encoded(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer
            .write_all(bytes)
            .await
            .context("frame write")?;
        self.writer.flush().await.context("frame flush")?;
        Ok(())
    }

    /// Close the write side so the peer reads EOF.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.writer.shutdown().await.context("stream shutdown")?;
        Ok(())
    }
}

/// A duplex byte stream carrying frames, e.g. an RFCOMM or L2CAP socket.
pub struct FramedConnection<S> {
    stream: S,
    codec: FrameCodec,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(stream: S, codec: FrameCodec) -> Self {
        Self { stream, codec }
    }

    /// Split into read/write tasks. Returns a receiver for incoming frames
    /// and a sender for outgoing frames.
    pub fn into_split(
        self,
    ) -> (
        mpsc::Receiver<Frame>,
        mpsc::Sender<Frame>,
        JoinHandle<()>,
        JoinHandle<()>,
    ) {
        let (read_half, write_half) = tokio::io::split(self.stream);
        let (incoming_tx, incoming_rx) = mpsc::channel::<Frame>(64);
        let (outgoing_tx, outgoing_rx) = mpsc::channel::<Frame>(32);

        let read_task = tokio::spawn(recv_loop(
            FrameReader::new(read_half, self.codec),
            incoming_tx,
        ));
        let write_task = tokio::spawn(send_loop(
            FrameWriter::new(write_half, self.codec),
            outgoing_rx,
        ));

        (incoming_rx, outgoing_tx, read_task, write_task)
    }
}

async fn recv_loop<S: AsyncRead>(
    mut reader: FrameReader<ReadHalf<S>>,
    tx: mpsc::Sender<Frame>,
) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => {
                debug!("RX: {}", frame);
                if tx.send(frame).await.is_err() {
                    info!("Frame channel closed, stopping recv loop");
                    return;
                }
            }
            Ok(None) => {
                info!(
                    "Connection closed (EOF), {} frames dropped",
                    reader.dropped()
                );
                return;
            }
            Err(e) => {
                error!("Read error: {}", e);
                return;
            }
        }
    }
}

async fn send_loop<S: AsyncWrite>(
    mut writer: FrameWriter<WriteHalf<S>>,
    mut rx: mpsc::Receiver<Frame>,
) {
    while let Some(frame) = rx.recv().await {
        let bytes = match writer.codec.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Not sending frame: {}", e);
                continue;
            }
        };
        debug!("TX: {}", frame);
        if let Err(e) = writer.write_encoded(&bytes).await {
            error!("Write error: {:#}", e);
            return;
        }
    }
    info!("Outgoing channel closed, stopping send loop");
    if let Err(e) = writer.shutdown().await {
        warn!("Shutdown failed: {:#}", e);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::duplex;
    use tokio::time::timeout;

    use super::*;
    use crate::protocol::ByteOrder;

    fn encode_all(codec: &FrameCodec, payloads: &[&[u8]]) -> Vec<u8> {
        payloads
            .iter()
            .flat_map(|p| codec.encode(&Frame::new(*p)).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_reads_back_to_back_frames() {
        let codec = FrameCodec::default();
        let data = encode_all(&codec, &[b"one", b"two", b""]);

        let mut reader = FrameReader::new(&data[..], codec);
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"one".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"two".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(Vec::new())));
        assert_eq!(reader.next_frame().await.unwrap(), None);
        assert_eq!(reader.dropped(), 0);
    }

    #[tokio::test]
    async fn test_skips_leading_garbage() {
        let codec = FrameCodec::default();
        let mut data = vec![0x00, 0x11, 0x22];
        data.extend(encode_all(&codec, &[b"ok"]));

        let mut reader = FrameReader::new(&data[..], codec);
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"ok".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_drops_corrupt_frame_and_recovers() {
        let codec = FrameCodec::default();
        let good = encode_all(&codec, &[b"first"]);
        let mut bad = encode_all(&codec, &[b"second"]);
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        let tail = encode_all(&codec, &[b"third"]);

        let data = [good, bad, tail].concat();
        let mut reader = FrameReader::new(&data[..], codec);

        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"first".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"third".to_vec())));
        assert_eq!(reader.next_frame().await.unwrap(), None);
        assert!(reader.dropped() >= 1);
    }

    #[tokio::test]
    async fn test_rejects_oversized_length() {
        let codec = FrameCodec::new(0x5A, ByteOrder::Big, 8);
        let mut data = vec![0x5A, 0xFF, 0xFF];
        data.extend(encode_all(&codec, &[b"small"]));

        let mut reader = FrameReader::new(&data[..], codec);
        assert_eq!(reader.next_frame().await.unwrap(), Some(Frame::new(b"small".to_vec())));
        assert_eq!(reader.dropped(), 1);
    }

    #[tokio::test]
    async fn test_truncated_frame_at_eof() {
        let codec = FrameCodec::default();
        let data = encode_all(&codec, &[b"cut short"]);

        let mut reader = FrameReader::new(&data[..data.len() - 1], codec);
        assert_eq!(reader.next_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_split_connection_exchanges_frames() {
        let codec = FrameCodec::new(0x5A, ByteOrder::Little, 256);
        let (local, remote) = duplex(64);

        let (mut local_rx, local_tx, local_read, local_write) =
            FramedConnection::new(local, codec).into_split();
        let (mut remote_rx, remote_tx, remote_read, remote_write) =
            FramedConnection::new(remote, codec).into_split();

        local_tx.send(Frame::new(b"ping".to_vec())).await.unwrap();
        assert_eq!(remote_rx.recv().await, Some(Frame::new(b"ping".to_vec())));

        // Larger than the duplex buffer, so the reader has to assemble it.
        let big = vec![0x42; 200];
        remote_tx.send(Frame::new(big.clone())).await.unwrap();
        assert_eq!(local_rx.recv().await, Some(Frame::new(big)));

        // Closing the senders shuts down each write side, so the peers see EOF.
        drop(local_tx);
        local_write.await.unwrap();
        drop(remote_tx);
        remote_write.await.unwrap();

        assert_eq!(remote_rx.recv().await, None);
        assert_eq!(local_rx.recv().await, None);
        local_read.await.unwrap();
        remote_read.await.unwrap();
    }

    #[tokio::test]
    async fn test_stray_header_does_not_stall_open_stream() {
        let codec = FrameCodec::new(0x5A, ByteOrder::Big, 8);
        let (mut writer, reader) = duplex(64);

        // Header claiming 8 payload bytes that never arrive, then a real frame.
        let mut data = vec![0x5A, 0x00, 0x08];
        data.extend(encode_all(&codec, &[b"ok"]));
        writer.write_all(&data).await.unwrap();

        // `writer` stays open, so the reader cannot lean on EOF.
        let mut reader = FrameReader::new(reader, codec);
        let frame = timeout(Duration::from_secs(1), reader.next_frame())
            .await
            .expect("reader stalled behind stray header")
            .unwrap();
        assert_eq!(frame, Some(Frame::new(b"ok".to_vec())));
        assert_eq!(reader.dropped(), 1);
        drop(writer);
    }

    #[tokio::test]
    async fn test_oversized_outgoing_frame_is_skipped() {
        let codec = FrameCodec::new(0x5A, ByteOrder::Big, 8);
        let (local, remote) = duplex(64);

        let (_local_rx, local_tx, _local_read, local_write) =
            FramedConnection::new(local, codec).into_split();
        let (mut remote_rx, _remote_tx, _remote_read, _remote_write) =
            FramedConnection::new(remote, codec).into_split();

        local_tx.send(Frame::new(vec![0x01; 9])).await.unwrap();
        local_tx.send(Frame::new(b"ok".to_vec())).await.unwrap();

        let got = timeout(Duration::from_secs(1), remote_rx.recv())
            .await
            .expect("valid frame after oversized one never arrived");
        assert_eq!(got, Some(Frame::new(b"ok".to_vec())));

        // The write side still shuts down cleanly, so the peer sees EOF.
        drop(local_tx);
        local_write.await.unwrap();
        let end = timeout(Duration::from_secs(1), remote_rx.recv()).await.unwrap();
        assert_eq!(end, None);
    }
}
