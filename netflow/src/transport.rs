//! Capture of observed packets from the kernel to a [`PacketSink`].

use crate::{
    codec::PacketRecord,
    error::{BoxError, NetflowError},
    packet::{self, PooledPacket},
    sink::{ErrorSink, PacketSink},
};
use aya::{
    maps::{perf::AsyncPerfEventArrayBuffer, AsyncPerfEventArray, Map, MapData, RingBuf},
    util::online_cpus,
};
use bytes::{Bytes, BytesMut};
use netflow_common::OBSERVED_PACKET_SIZE;
use std::{
    future::Future,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    io::unix::AsyncFd,
    sync::{mpsc, watch},
    task::JoinHandle,
};

/// Events buffered between the per-CPU readers and the transport loop.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4096;

// Perf events copied per read call of a CPU buffer
const PERF_READ_BATCH: usize = 16;

// Pause after a failed read of a CPU buffer
const PERF_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Source of decoded packet records.
pub trait PacketReader: Send + 'static {
    /// Waits for the next record. Fails with [`NetflowError::TransportClosed`]
    /// once the source is gone. Dropping the future must not lose a record.
    fn read(&mut self) -> impl Future<Output = Result<PooledPacket, NetflowError>> + Send;

    fn close(&mut self);
}

/// Records from a `BPF_MAP_TYPE_RINGBUF` map.
pub struct RingBufReader {
    ring: Option<AsyncFd<RingBuf<MapData>>>,
}

impl RingBufReader {
    pub fn new(map: Map) -> Result<Self, NetflowError> {
        let ring =
            RingBuf::try_from(map).map_err(|e| NetflowError::kernel("Can't open ring buffer", e))?;
        let ring = AsyncFd::new(ring)
            .map_err(|e| NetflowError::kernel("Can't register ring buffer", e))?;
        Ok(Self { ring: Some(ring) })
    }

    async fn read(&mut self) -> Result<PooledPacket, NetflowError> {
        let ring = self.ring.as_mut().ok_or(NetflowError::TransportClosed)?;
        loop {
            let mut guard = ring
                .readable_mut()
                .await
                .map_err(|e| NetflowError::kernel("Can't poll ring buffer", e))?;

            if let Some(item) = guard.get_inner_mut().next() {
                let mut pkt = packet::acquire();
                pkt.decode_from(&item)?;
                return Ok(pkt);
            }

            guard.clear_ready();
        }
    }

    fn close(&mut self) {
        self.ring = None;
    }
}

type RawEvent = Result<Bytes, NetflowError>;

/// Outcome of one read of a per-CPU perf buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct PerfRead {
    read: usize,
    lost: usize,
}

/// Per-CPU perf buffer drained by [`forward_perf_events`].
trait PerfSource: Send + 'static {
    fn read_events(
        &mut self,
        buffers: &mut [BytesMut],
    ) -> impl Future<Output = Result<PerfRead, BoxError>> + Send;
}

impl PerfSource for AsyncPerfEventArrayBuffer<MapData> {
    async fn read_events(&mut self, buffers: &mut [BytesMut]) -> Result<PerfRead, BoxError> {
        let events = AsyncPerfEventArrayBuffer::read_events(self, buffers).await?;
        Ok(PerfRead {
            read: events.read,
            lost: events.lost,
        })
    }
}

/// Copies the events of one CPU buffer into the channel. Read failures are
/// sent along and the buffer is read again, the loop only ends once the
/// channel is closed.
async fn forward_perf_events<S: PerfSource>(
    cpu: u32,
    mut source: S,
    tx: mpsc::Sender<RawEvent>,
) {
    let mut buffers = (0..PERF_READ_BATCH)
        .map(|_| BytesMut::with_capacity(OBSERVED_PACKET_SIZE * 2))
        .collect::<Vec<_>>();

    loop {
        let events = match source.read_events(&mut buffers).await {
            Ok(events) => events,
            Err(e) => {
                let err = NetflowError::kernel(format!("Can't read perf buffer of cpu {}", cpu), e);
                if tx.send(Err(err)).await.is_err() {
                    return;
                }
                tokio::time::sleep(PERF_RETRY_DELAY).await;
                continue;
            }
        };

        if events.lost > 0 && tx.send(Err(NetflowError::LostEvents(events.lost))).await.is_err() {
            return;
        }

        for data in buffers.iter().take(events.read) {
            if tx.send(Ok(Bytes::copy_from_slice(data))).await.is_err() {
                return;
            }
        }
    }
}

/// Records pushed through a channel, either by the per-CPU perf buffer
/// readers or by a [`CaptureSender`] in mocked environments.
pub struct ChannelReader {
    rx: mpsc::Receiver<RawEvent>,
    workers: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ChannelReader {
    async fn read(&mut self) -> Result<PooledPacket, NetflowError> {
        if self.closed {
            return Err(NetflowError::TransportClosed);
        }

        match self.rx.recv().await {
            Some(Ok(data)) => {
                let mut pkt = packet::acquire();
                pkt.decode_from(&data)?;
                Ok(pkt)
            }
            Some(Err(e)) => Err(e),
            None => Err(NetflowError::TransportClosed),
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.rx.close();
        for worker in self.workers.drain(..) {
            worker.abort();
        }
    }
}

impl Drop for ChannelReader {
    fn drop(&mut self) {
        self.close();
    }
}

/// Feeds a channel backed [`CaptureReader`].
#[derive(Clone)]
pub struct CaptureSender(mpsc::Sender<RawEvent>);

impl CaptureSender {
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), NetflowError> {
        self.0
            .send(Ok(Bytes::copy_from_slice(data)))
            .await
            .map_err(|_| NetflowError::TransportClosed)
    }

    pub async fn send(&self, pkt: &PacketRecord) -> Result<(), NetflowError> {
        use crate::codec::WireLayout;
        self.send_raw(&pkt.marshal()?).await
    }

    pub async fn send_error(&self, err: NetflowError) -> Result<(), NetflowError> {
        self.0
            .send(Err(err))
            .await
            .map_err(|_| NetflowError::TransportClosed)
    }
}

pub enum CaptureReader {
    RingBuf(RingBufReader),
    Channel(ChannelReader),
}

impl CaptureReader {
    pub fn ring_buf(map: Map) -> Result<Self, NetflowError> {
        RingBufReader::new(map).map(Self::RingBuf)
    }

    /// Opens the perf buffer of every online CPU, each drained by its own task.
    pub fn perf_event(map: Map, capacity: usize) -> Result<Self, NetflowError> {
        let mut perf = AsyncPerfEventArray::try_from(map)
            .map_err(|e| NetflowError::kernel("Can't open perf event array", e))?;
        let cpus = online_cpus()
            .map_err(|(what, e)| NetflowError::kernel(format!("Can't read {}", what), e))?;

        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut workers = Vec::with_capacity(cpus.len());

        for cpu in cpus {
            let buf = match perf.open(cpu, None) {
                Ok(buf) => buf,
                Err(e) => {
                    workers.iter().for_each(JoinHandle::abort);
                    return Err(NetflowError::kernel(
                        format!("Can't open perf buffer of cpu {}", cpu),
                        e,
                    ));
                }
            };
            let tx = tx.clone();

            workers.push(tokio::spawn(forward_perf_events(cpu, buf, tx)));
        }

        Ok(Self::Channel(ChannelReader {
            rx,
            workers,
            closed: false,
        }))
    }

    /// Reader fed by the returned sender, used when capture is mocked.
    pub fn channel(capacity: usize) -> (CaptureSender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let reader = ChannelReader {
            rx,
            workers: vec![],
            closed: false,
        };
        (CaptureSender(tx), Self::Channel(reader))
    }
}

impl PacketReader for CaptureReader {
    async fn read(&mut self) -> Result<PooledPacket, NetflowError> {
        match self {
            CaptureReader::RingBuf(r) => r.read().await,
            CaptureReader::Channel(r) => r.read().await,
        }
    }

    fn close(&mut self) {
        match self {
            CaptureReader::RingBuf(r) => r.close(),
            CaptureReader::Channel(r) => r.close(),
        }
    }
}

/// Forwards every record of a [`PacketReader`] to a packet sink.
pub struct PacketTransport<R> {
    reader: R,
    packets: Arc<dyn PacketSink>,
    errors: Arc<dyn ErrorSink>,
}

impl<R: PacketReader> PacketTransport<R> {
    pub fn new(reader: R, packets: Arc<dyn PacketSink>, errors: Arc<dyn ErrorSink>) -> Self {
        Self {
            reader,
            packets,
            errors,
        }
    }

    /// Starts the read loop on its own task.
    pub fn spawn(self, ifname: &str) -> TransportHandle {
        let (stop, stopped) = watch::channel(false);
        let ifname = ifname.to_string();
        let task = tokio::spawn(self.run(ifname, stopped));
        TransportHandle {
            stop,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(mut self, ifname: String, mut stop: watch::Receiver<bool>) {
        log::debug!("[{}] packet transport started", ifname);

        loop {
            let result = tokio::select! {
                biased;
                // also fires when the handle is dropped
                _ = stop.changed() => break,
                result = self.reader.read() => result,
            };

            match result {
                // the record goes back to the pool at the end of the arm
                Ok(pkt) => self.packets.on_observed_packet(&pkt),
                Err(e) if e.is_closed() => break,
                Err(e) => self.errors.on_error(e),
            }
        }

        self.reader.close();
        log::debug!("[{}] packet transport stopped", ifname);
    }
}

/// Stops the read loop of a spawned [`PacketTransport`].
pub struct TransportHandle {
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportHandle {
    /// Signals the loop to stop, the reader is closed by the loop on exit.
    pub fn close(&self) {
        let _ = self.stop.send(true);
    }

    /// Closes and waits for the loop to exit.
    pub async fn join(&self) {
        self.close();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::error!("Packet transport task failed, {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{codec::WireLayout, protocols::Transport, sink::testing::RecordingErrorSink};
    use std::{collections::VecDeque, net::Ipv4Addr};

    /// Perf buffer replaying a fixed sequence of reads, then idle.
    struct ScriptedPerf(VecDeque<Result<(Vec<Vec<u8>>, usize), String>>);

    impl PerfSource for ScriptedPerf {
        async fn read_events(&mut self, buffers: &mut [BytesMut]) -> Result<PerfRead, BoxError> {
            match self.0.pop_front() {
                None => std::future::pending().await,
                Some(Err(e)) => Err(e.into()),
                Some(Ok((events, lost))) => {
                    for (buf, data) in buffers.iter_mut().zip(&events) {
                        buf.clear();
                        buf.extend_from_slice(data);
                    }
                    Ok(PerfRead {
                        read: events.len(),
                        lost,
                    })
                }
            }
        }
    }

    fn record(port: u16) -> PacketRecord {
        PacketRecord {
            source_ip: Ipv4Addr::new(10, 0, 0, 2),
            dest_ip: Ipv4Addr::new(10, 0, 0, 1),
            source_port: 40000,
            dest_port: port,
            transport: Transport::Udp,
        }
    }

    fn packet_sink() -> (Arc<dyn PacketSink>, mpsc::UnboundedReceiver<u16>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = move |pkt: &PacketRecord| {
            let _ = tx.send(pkt.dest_port);
        };
        (Arc::new(sink), rx)
    }

    #[tokio::test]
    async fn forwards_packets_in_order() {
        let (sender, reader) = CaptureReader::channel(8);
        let (packets, mut seen) = packet_sink();
        let errors = RecordingErrorSink::default();
        let handle = PacketTransport::new(reader, packets, Arc::new(errors.clone())).spawn("if0");

        for port in [53, 80, 443] {
            sender.send(&record(port)).await.unwrap();
        }

        for port in [53, 80, 443] {
            assert_eq!(seen.recv().await, Some(port));
        }

        handle.join().await;
        assert!(handle.is_finished());
        assert!(errors.errors().is_empty());
    }

    #[tokio::test]
    async fn read_errors_do_not_stop_the_loop() {
        let (sender, reader) = CaptureReader::channel(8);
        let (packets, mut seen) = packet_sink();
        let errors = RecordingErrorSink::default();
        let handle = PacketTransport::new(reader, packets, Arc::new(errors.clone())).spawn("if0");

        sender.send_error(NetflowError::LostEvents(3)).await.unwrap();
        sender.send_raw(&[0; 4]).await.unwrap();
        sender.send(&record(22)).await.unwrap();

        assert_eq!(seen.recv().await, Some(22));
        let errors = errors.errors();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], "lost 3 events");

        handle.join().await;
    }

    #[tokio::test]
    async fn closed_source_ends_the_loop_silently() {
        let (sender, reader) = CaptureReader::channel(8);
        let (packets, _seen) = packet_sink();
        let errors = RecordingErrorSink::default();
        let handle = PacketTransport::new(reader, packets, Arc::new(errors.clone())).spawn("if0");

        drop(sender);
        handle.join().await;
        assert!(errors.errors().is_empty());
    }

    #[tokio::test]
    async fn close_unblocks_a_pending_read() {
        let (sender, reader) = CaptureReader::channel(8);
        let (packets, _seen) = packet_sink();
        let handle =
            PacketTransport::new(reader, packets, Arc::new(RecordingErrorSink::default()))
                .spawn("if0");

        tokio::task::yield_now().await;
        handle.close();
        handle.close();
        handle.join().await;
        handle.join().await;
        assert!(handle.is_finished());

        // reader was closed by the loop
        assert!(sender.send(&record(1)).await.is_err());
    }

    #[tokio::test]
    async fn closed_reader_reports_closed() {
        let (_sender, mut reader) = CaptureReader::channel(1);
        reader.close();
        assert!(reader.read().await.unwrap_err().is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn perf_reader_keeps_reading_after_a_failure() {
        let data = record(53).marshal().unwrap();
        let source = ScriptedPerf(VecDeque::from([
            Err("Input/output error".to_string()),
            Err("Input/output error".to_string()),
            Ok((vec![data.clone()], 2)),
        ]));
        let (tx, mut rx) = mpsc::channel(8);
        let worker = tokio::spawn(forward_perf_events(3, source, tx));

        for _ in 0..2 {
            let err = rx.recv().await.unwrap().unwrap_err();
            assert!(matches!(err, NetflowError::Kernel { .. }));
            assert!(err.to_string().contains("cpu 3"));
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            Err(NetflowError::LostEvents(2))
        ));
        assert_eq!(&rx.recv().await.unwrap().unwrap()[..], &data[..]);

        drop(rx);
        worker.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn perf_reader_stops_once_the_channel_closes() {
        let source = ScriptedPerf(VecDeque::from([Err("Input/output error".to_string())]));
        let (tx, rx) = mpsc::channel(8);
        drop(rx);

        tokio::time::timeout(
            Duration::from_secs(1),
            forward_perf_events(0, source, tx),
        )
        .await
        .unwrap();
    }
}
