//! Packet capture.
//!
//! Each capture session owns one [`PacketSource`] and a blocking receive
//! loop running on the tokio blocking pool. Accepted packets go to the
//! aggregator over a bounded channel.
//!
//! Restarts are serialised: the old session's stop flag is raised and its
//! thread joined before a new source is opened, so once a restart returns
//! nothing more from the old socket is forwarded. A loop waiting on a full
//! channel gives up its packet when stopped rather than holding the join.

use crate::error::{MonitorError, Result};
use crate::ip_header::Ipv4Header;
use crate::packet_filter::classify;
use crate::raw_socket::{is_timeout, PacketSource, SourceFactory, MAX_DATAGRAM, READ_TIMEOUT};
use crate::traffic_monitor::CapturedPacket;
use ipnetwork::Ipv4Network;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const DEFAULT_BIND_RETRIES: u32 = 3;
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Consecutive receive errors tolerated before the loop starts pacing itself.
const ERROR_BURST: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Stopped,
    Starting,
    Receiving,
}

struct Session {
    address: Ipv4Addr,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub struct PacketCapture {
    factory: Arc<dyn SourceFactory>,
    local_ranges: Arc<Vec<Ipv4Network>>,
    sender: mpsc::Sender<CapturedPacket>,
    state: Arc<Mutex<CaptureState>>,
    session: Option<Session>,
    bind_retries: u32,
    retry_backoff: Duration,
}

impl PacketCapture {
    pub fn new(
        factory: Arc<dyn SourceFactory>,
        local_ranges: Vec<Ipv4Network>,
        sender: mpsc::Sender<CapturedPacket>,
    ) -> Self {
        PacketCapture {
            factory,
            local_ranges: Arc::new(local_ranges),
            sender,
            state: Arc::new(Mutex::new(CaptureState::Stopped)),
            session: None,
            bind_retries: DEFAULT_BIND_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Override rebind attempts and the initial backoff (doubled per attempt).
    #[cfg(test)]
    pub fn with_retry(mut self, retries: u32, backoff: Duration) -> Self {
        self.bind_retries = retries.max(1);
        self.retry_backoff = backoff;
        self
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock()
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.session.as_ref().map(|s| s.address)
    }

    /// Open the capture on `local`. A failure here is not retried.
    pub async fn start(&mut self, local: Ipv4Addr) -> Result<()> {
        self.stop().await;
        self.open(local)
    }

    /// Rebind on `local`, retrying with backoff. A no-op while a live session
    /// already covers `local`, whether or not its loop has started receiving.
    pub async fn restart(&mut self, local: Ipv4Addr) -> Result<()> {
        let state = self.state();
        if self.address() == Some(local) && state != CaptureState::Stopped {
            debug!("Capture already {:?} on {}, restart skipped", state, local);
            return Ok(());
        }

        info!("Restarting capture on {}", local);
        self.stop().await;

        let mut backoff = self.retry_backoff;
        let mut attempt = 1;
        loop {
            match self.open(local) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.bind_retries => {
                    error!("Giving up binding capture on {} after {} attempts: {}", local, attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("Bind attempt {}/{} on {} failed: {}", attempt, self.bind_retries, local, e);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Stop the current session and wait for its receive loop to exit.
    pub async fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            session.stop.store(true, Ordering::SeqCst);
            if let Err(e) = session.handle.await {
                warn!("Capture task on {} ended abnormally: {}", session.address, e);
            }
            info!("Capture on {} stopped", session.address);
        }
        *self.state.lock() = CaptureState::Stopped;
    }

    fn open(&mut self, local: Ipv4Addr) -> Result<()> {
        *self.state.lock() = CaptureState::Starting;

        let source = match self.factory.open(local) {
            Ok(source) => source,
            Err(e) => {
                *self.state.lock() = CaptureState::Stopped;
                return Err(e);
            }
        };

        let stop = Arc::new(AtomicBool::new(false));
        let receiver = ReceiveLoop {
            local,
            local_ranges: self.local_ranges.clone(),
            sender: self.sender.clone(),
            runtime: Handle::current(),
            stop: stop.clone(),
            state: self.state.clone(),
        };
        let handle = tokio::task::spawn_blocking(move || receiver.run(source));

        info!("Monitoring traffic on {}", local);
        self.session = Some(Session {
            address: local,
            stop,
            handle,
        });
        Ok(())
    }
}

struct ReceiveLoop {
    local: Ipv4Addr,
    local_ranges: Arc<Vec<Ipv4Network>>,
    sender: mpsc::Sender<CapturedPacket>,
    runtime: Handle,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<CaptureState>>,
}

impl ReceiveLoop {
    /// Hand a packet to the aggregator. Returns false when the loop should exit.
    fn forward(&self, packet: CapturedPacket) -> bool {
        let packet = match self.sender.try_send(packet) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => return false,
            Err(TrySendError::Full(packet)) => packet,
        };

        loop {
            let reserved = self
                .runtime
                .block_on(tokio::time::timeout(READ_TIMEOUT, self.sender.reserve()));
            match reserved {
                Ok(Ok(permit)) => {
                    permit.send(packet);
                    return true;
                }
                Ok(Err(_)) => return false,
                Err(_) if self.stop.load(Ordering::SeqCst) => {
                    debug!("Channel full while stopping capture on {}, packet dropped", self.local);
                    return false;
                }
                Err(_) => continue,
            }
        }
    }

    fn run(self, mut source: Box<dyn PacketSource>) {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let mut consecutive_errors = 0u32;
        *self.state.lock() = CaptureState::Receiving;

        while !self.stop.load(Ordering::SeqCst) {
            let len = match source.recv(&mut buf) {
                Ok(len) => {
                    consecutive_errors = 0;
                    len
                }
                Err(e) if is_timeout(&e) => continue,
                Err(e) => {
                    consecutive_errors += 1;
                    warn!("{} (on {})", MonitorError::Receive(e), self.local);
                    if consecutive_errors > ERROR_BURST {
                        std::thread::sleep(READ_TIMEOUT);
                    }
                    continue;
                }
            };

            let header = Ipv4Header::parse(&buf, len);
            let verdict = classify(&header, self.local, &self.local_ranges);
            if !verdict.accept {
                continue;
            }

            let packet = CapturedPacket {
                header,
                inbound: verdict.inbound,
            };
            if !self.forward(packet) {
                if !self.stop.load(Ordering::SeqCst) {
                    debug!("Aggregator closed, capture on {} exiting", self.local);
                }
                break;
            }
        }
        *self.state.lock() = CaptureState::Stopped;
        // source dropped here, closing the socket
    }
}

/// Drive capture restarts from local address changes until shutdown.
pub async fn run_supervisor(
    mut capture: PacketCapture,
    mut address: watch::Receiver<Ipv4Addr>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut following = true;
    loop {
        tokio::select! {
            changed = address.changed(), if following => {
                if changed.is_err() {
                    warn!("Address watcher gone, capture stays on {:?} until shutdown", capture.address());
                    following = false;
                    continue;
                }
                let local = *address.borrow_and_update();
                if let Err(e) = capture.restart(local).await {
                    error!("Capture disabled until the next network change: {}", e);
                }
            }
            _ = shutdown.changed() => {
                info!("Capture supervisor shutting down");
                break;
            }
        }
    }
    capture.stop().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_header::{build_datagram, PROTO_TCP, PROTO_UDP};
    use crate::raw_socket::testing::MockFactory;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn capture(factory: Arc<MockFactory>) -> (PacketCapture, mpsc::Receiver<CapturedPacket>) {
        let (tx, rx) = mpsc::channel(64);
        let capture = PacketCapture::new(factory, vec!["10.0.0.0/8".parse().unwrap()], tx)
            .with_retry(3, Duration::from_millis(1));
        (capture, rx)
    }

    async fn next(rx: &mut mpsc::Receiver<CapturedPacket>) -> Option<CapturedPacket> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_only_external_udp_forwarded() {
        let factory = Arc::new(MockFactory::default());
        let feed = factory.feed();
        let (mut capture, mut rx) = capture(factory.clone());

        capture.start(LOCAL).await.unwrap();

        let external: Ipv4Addr = "8.8.8.8".parse().unwrap();
        feed.send(build_datagram(PROTO_TCP, LOCAL, external)).unwrap();
        feed.send(build_datagram(PROTO_UDP, LOCAL, "10.0.0.9".parse().unwrap())).unwrap();
        feed.send(vec![0x45, 0x00]).unwrap();
        feed.send(build_datagram(PROTO_UDP, LOCAL, external)).unwrap();

        let packet = next(&mut rx).await.expect("packet forwarded");
        assert_eq!(packet.header.destination, external);
        assert!(!packet.inbound);
        assert_eq!(capture.state(), CaptureState::Receiving);

        capture.stop().await;
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_same_address_is_noop() {
        let factory = Arc::new(MockFactory::default());
        let (mut capture, _rx) = capture(factory.clone());

        // no wait: the loop may still be Starting
        capture.start(LOCAL).await.unwrap();
        assert_ne!(capture.state(), CaptureState::Stopped);
        capture.restart(LOCAL).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.restart(LOCAL).await.unwrap();

        assert_eq!(factory.opened(), vec![LOCAL]);
        capture.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_reopens_after_loop_exit() {
        let factory = Arc::new(MockFactory::default());
        let feed = factory.feed();
        let (mut capture, rx) = capture(factory.clone());

        capture.start(LOCAL).await.unwrap();
        drop(rx);
        feed.send(build_datagram(PROTO_UDP, "1.2.3.4".parse().unwrap(), LOCAL)).unwrap();

        for _ in 0..100 {
            if capture.state() == CaptureState::Stopped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(capture.state(), CaptureState::Stopped);

        capture.restart(LOCAL).await.unwrap();
        assert_eq!(factory.opened(), vec![LOCAL, LOCAL]);
        capture.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_cuts_off_busy_old_source() {
        let factory = Arc::new(MockFactory::default());
        let old_feed = factory.feed();
        let new_feed = factory.feed();
        let (mut capture, mut rx) = capture(factory.clone());
        let new_local: Ipv4Addr = "10.0.0.77".parse().unwrap();
        let remote: Ipv4Addr = "1.2.3.4".parse().unwrap();

        capture.start(LOCAL).await.unwrap();

        let feeding = Arc::new(AtomicBool::new(true));
        let feeder = {
            let feeding = feeding.clone();
            std::thread::spawn(move || {
                while feeding.load(Ordering::SeqCst) {
                    let _ = old_feed.send(build_datagram(PROTO_UDP, remote, LOCAL));
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        capture.restart(new_local).await.unwrap();
        // whatever was queued before the restart returned
        while rx.try_recv().is_ok() {}

        tokio::time::sleep(Duration::from_millis(100)).await;
        new_feed.send(build_datagram(PROTO_UDP, remote, new_local)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        feeding.store(false, Ordering::SeqCst);
        feeder.join().unwrap();

        let mut received = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            received.push(packet);
        }
        assert!(!received.is_empty());
        for packet in &received {
            assert!(
                packet.header.destination == new_local || packet.header.source == new_local,
                "old session leaked {:?}",
                packet.header
            );
        }
        capture.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_with_full_channel_does_not_hang() {
        let factory = Arc::new(MockFactory::default());
        let old_feed = factory.feed();
        let new_feed = factory.feed();
        let (tx, mut rx) = mpsc::channel(1);
        let mut capture = PacketCapture::new(factory.clone(), vec!["10.0.0.0/8".parse().unwrap()], tx)
            .with_retry(1, Duration::from_millis(1));
        let new_local: Ipv4Addr = "10.0.0.77".parse().unwrap();
        let remote: Ipv4Addr = "1.2.3.4".parse().unwrap();

        capture.start(LOCAL).await.unwrap();
        for _ in 0..3 {
            old_feed.send(build_datagram(PROTO_UDP, remote, LOCAL)).unwrap();
        }
        // one packet fills the channel, the loop is now waiting on the next
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), capture.restart(new_local))
            .await
            .expect("restart blocked by a full channel")
            .unwrap();

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.header.destination, LOCAL);
        assert!(rx.try_recv().is_err());

        new_feed.send(build_datagram(PROTO_UDP, remote, new_local)).unwrap();
        let packet = next(&mut rx).await.expect("packet on new address");
        assert_eq!(packet.header.destination, new_local);

        capture.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_switches_address() {
        let factory = Arc::new(MockFactory::default());
        let old_feed = factory.feed();
        let new_feed = factory.feed();
        let (mut capture, mut rx) = capture(factory.clone());
        let new_local: Ipv4Addr = "10.0.0.77".parse().unwrap();
        let remote: Ipv4Addr = "1.2.3.4".parse().unwrap();

        capture.start(LOCAL).await.unwrap();
        capture.restart(new_local).await.unwrap();

        // the old session has been joined, nothing sent to it is observed
        let _ = old_feed.send(build_datagram(PROTO_UDP, remote, LOCAL));
        new_feed.send(build_datagram(PROTO_UDP, remote, new_local)).unwrap();

        let packet = next(&mut rx).await.expect("packet on new address");
        assert_eq!(packet.header.destination, new_local);
        assert!(packet.inbound);
        assert_eq!(capture.address(), Some(new_local));
        assert_eq!(factory.opened(), vec![LOCAL, new_local]);

        capture.stop().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_start_failure_is_reported() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_next.store(1, Ordering::SeqCst);
        let (mut capture, _rx) = capture(factory.clone());

        let err = capture.start(LOCAL).await.unwrap_err();

        assert!(matches!(err, MonitorError::Bind { .. }));
        assert_eq!(capture.state(), CaptureState::Stopped);
        assert_eq!(factory.opened().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_restart_retries_bind() {
        let factory = Arc::new(MockFactory::default());
        factory.fail_next.store(2, Ordering::SeqCst);
        let (mut capture, _rx) = capture(factory.clone());

        capture.restart(LOCAL).await.unwrap();
        assert_eq!(factory.opened().len(), 3);

        factory.fail_next.store(5, Ordering::SeqCst);
        let err = capture.restart("10.0.0.8".parse().unwrap()).await.unwrap_err();
        assert!(matches!(err, MonitorError::Bind { .. }));
        assert_eq!(factory.opened().len(), 6);
        assert_eq!(capture.state(), CaptureState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervisor_follows_address_changes() {
        let factory = Arc::new(MockFactory::default());
        let (capture, _rx) = capture(factory.clone());
        let (addr_tx, addr_rx) = watch::channel(LOCAL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_supervisor(capture, addr_rx, shutdown_rx));

        addr_tx.send("10.0.0.6".parse().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        addr_tx.send("10.0.0.7".parse().unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        let opened: Vec<String> = factory.opened().iter().map(|a| a.to_string()).collect();
        assert_eq!(opened, vec!["10.0.0.6", "10.0.0.7"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_supervisor_keeps_capture_when_watcher_gone() {
        let factory = Arc::new(MockFactory::default());
        let feed = factory.feed();
        let (mut capture, mut rx) = capture(factory.clone());
        capture.start(LOCAL).await.unwrap();

        let (addr_tx, addr_rx) = watch::channel(LOCAL);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run_supervisor(capture, addr_rx, shutdown_rx));

        drop(addr_tx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        feed.send(build_datagram(PROTO_UDP, "1.2.3.4".parse().unwrap(), LOCAL)).unwrap();
        assert!(next(&mut rx).await.is_some());

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(factory.opened(), vec![LOCAL]);
    }
}
