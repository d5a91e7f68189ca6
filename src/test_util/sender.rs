use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;

use crate::notice::notice::Notice;
use crate::transport::PacketSender;

/// Records every packet sent through it, decoded as a notice. Can be switched to failing every
///  send to simulate transport errors.
#[derive(Debug, Default)]
pub struct RecordingSender {
    sent: Mutex<Vec<(SocketAddr, Notice)>>,
    failing: AtomicBool,
}

impl RecordingSender {
    pub fn new() -> RecordingSender {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<Vec<(SocketAddr, Notice)>> {
        self.sent.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// removes and returns everything sent so far
    pub fn take(&self) -> Vec<(SocketAddr, Notice)> {
        std::mem::take(&mut *self.lock())
    }

    pub fn assert_no_remaining_notices(&self) {
        let sent = self.take();
        assert!(sent.is_empty(), "unexpected notices: {:?}", sent);
    }
}

impl PacketSender for RecordingSender {
    fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> anyhow::Result<()> {
        if self.failing.load(Ordering::Acquire) {
            return Err(anyhow!("simulated send failure"));
        }
        let notice = Notice::try_deser(packet)?;
        self.lock().push((to, notice));
        Ok(())
    }
}
