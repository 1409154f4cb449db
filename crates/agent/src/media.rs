//! Media ingest from the local streamer.
//!
//! The streamer connects over TCP and writes length-prefixed
//! [`SamplePacket`]s of encoded H.264. In the other direction the agent writes
//! the capture area the encoder should use, one `WxH+X+Y` line per change.

use std::sync::Arc;

use async_trait::async_trait;
use cloudplay_protocol::{SAMPLE_PREFIX_SIZE, SampleError, SamplePacket};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capture::CaptureArea;
use crate::peer::AnswerPeer;

/// Destination for ingested video samples.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn write_sample(&self, packet: &SamplePacket) -> anyhow::Result<()>;
}

#[async_trait]
impl SampleSink for AnswerPeer {
    async fn write_sample(&self, packet: &SamplePacket) -> anyhow::Result<()> {
        self.write_video_sample(packet).await
    }
}

/// Read one packet. `Ok(None)` on a clean end of stream between packets.
pub async fn read_sample<R>(reader: &mut R) -> Result<Option<SamplePacket>, SampleError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; SAMPLE_PREFIX_SIZE];
    let first = reader.read(&mut prefix).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut prefix[first..]).await?;
    let len = SamplePacket::check_frame_len(prefix)?;
    let mut frame = vec![0u8; len];
    reader.read_exact(&mut frame).await?;
    SamplePacket::decode(&frame).map(Some)
}

/// Forward every packet from `reader` to `sink` until end of stream.
/// Returns the number of packets forwarded.
pub async fn pump_samples<R>(reader: &mut R, sink: &dyn SampleSink) -> Result<u64, SampleError>
where
    R: AsyncRead + Unpin,
{
    let mut forwarded = 0u64;
    while let Some(packet) = read_sample(reader).await? {
        // A sample the peer cannot take is dropped; the stream stays in sync.
        if let Err(e) = sink.write_sample(&packet).await {
            debug!("Dropping sample: {e}");
            continue;
        }
        forwarded += 1;
    }
    Ok(forwarded)
}

async fn write_area<W: AsyncWrite + Unpin>(writer: &mut W, area: &CaptureArea) -> std::io::Result<()> {
    writer.write_all(format!("{area}\n").as_bytes()).await?;
    writer.flush().await
}

/// Serve one streamer at a time on `listener` until `cancel` fires.
///
/// `areas` carries capture-area changes; the latest one is written to each
/// streamer as it connects and again whenever it changes.
pub async fn serve_media(
    listener: TcpListener,
    sink: Arc<dyn SampleSink>,
    mut areas: mpsc::Receiver<CaptureArea>,
    mut current: Option<CaptureArea>,
    cancel: CancellationToken,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => return,
            update = areas.recv() => {
                match update {
                    Some(area) => current = Some(area),
                    None => return,
                }
                continue;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    info!(%peer_addr, "Media streamer connected");
                    stream
                }
                Err(e) => {
                    warn!("Failed to accept media connection: {e}");
                    continue;
                }
            },
        };
        if !handle_streamer(stream, &sink, &mut areas, &mut current, &cancel).await {
            return;
        }
    }
}

/// Returns `false` when serving should stop altogether.
async fn handle_streamer(
    stream: TcpStream,
    sink: &Arc<dyn SampleSink>,
    areas: &mut mpsc::Receiver<CaptureArea>,
    current: &mut Option<CaptureArea>,
    cancel: &CancellationToken,
) -> bool {
    let (mut reader, mut writer) = stream.into_split();
    if let Some(area) = current.as_ref()
        && let Err(e) = write_area(&mut writer, area).await
    {
        warn!("Failed to send capture area to streamer: {e}");
    }

    // Reads are not cancel-safe, so they run in their own task.
    let mut pump = tokio::spawn({
        let sink = Arc::clone(sink);
        async move { pump_samples(&mut reader, sink.as_ref()).await }
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                pump.abort();
                break false;
            }
            done = &mut pump => {
                match done {
                    Ok(Ok(count)) => info!(count, "Media streamer disconnected"),
                    Ok(Err(e)) => warn!("Media stream error: {e}"),
                    Err(e) => warn!("Media pump task failed: {e}"),
                }
                break true;
            }
            update = areas.recv() => {
                let Some(area) = update else {
                    pump.abort();
                    break false;
                };
                *current = Some(area);
                if let Err(e) = write_area(&mut writer, &area).await {
                    debug!("Failed to send capture area to streamer: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct Collect(Mutex<Vec<SamplePacket>>);

    #[async_trait]
    impl SampleSink for Collect {
        async fn write_sample(&self, packet: &SamplePacket) -> anyhow::Result<()> {
            self.0.lock().await.push(packet.clone());
            Ok(())
        }
    }

    fn wire(packets: &[SamplePacket]) -> Vec<u8> {
        packets.iter().flat_map(|p| p.encode().unwrap()).collect()
    }

    #[tokio::test]
    async fn reads_until_clean_eof() {
        let packets = vec![
            SamplePacket::new(vec![0, 0, 0, 1, 0x65], Duration::from_millis(16)),
            SamplePacket::new(Vec::new(), Duration::ZERO),
        ];
        let mut reader = Cursor::new(wire(&packets));
        let sink = Collect::default();
        assert_eq!(pump_samples(&mut reader, &sink).await.unwrap(), 2);
        assert_eq!(*sink.0.lock().await, packets);
    }

    #[tokio::test]
    async fn truncated_stream_is_an_error() {
        let mut bytes = wire(&[SamplePacket::new(vec![1, 2, 3], Duration::from_millis(1))]);
        bytes.truncate(bytes.len() - 1);
        let err = read_sample(&mut Cursor::new(bytes)).await.unwrap_err();
        assert!(matches!(err, SampleError::Io(_)));
    }

    #[tokio::test]
    async fn bogus_length_is_rejected() {
        let bytes = u32::MAX.to_le_bytes().to_vec();
        let err = read_sample(&mut Cursor::new(bytes)).await.unwrap_err();
        assert!(matches!(err, SampleError::TooLarge(_)));
    }

    #[tokio::test]
    async fn streamer_gets_area_and_samples_reach_sink() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sink = Arc::new(Collect::default());
        let (area_tx, area_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let initial = CaptureArea::new(0, 0, 1280, 720);
        let server = tokio::spawn(serve_media(
            listener,
            Arc::clone(&sink) as Arc<dyn SampleSink>,
            area_rx,
            Some(initial),
            cancel.clone(),
        ));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "1280x720+0+0");

        let packet = SamplePacket::new(vec![9; 32], Duration::from_millis(33));
        writer.write_all(&packet.encode().unwrap()).await.unwrap();

        area_tx.send(CaptureArea::new(10, 20, 640, 480)).await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "640x480+10+20");

        tokio::time::timeout(Duration::from_secs(5), async {
            while sink.0.lock().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(sink.0.lock().await[0], packet);

        cancel.cancel();
        server.await.unwrap();
    }
}
