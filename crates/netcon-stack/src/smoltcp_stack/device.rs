use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

use crate::packet::EthernetFrame;
use crate::FrameOutput;

/// In-memory Ethernet device: inbound frames are queued by `inject`, outbound frames go straight
/// to the stack's output callback.
pub(crate) struct FrameDevice {
    rx: VecDeque<Vec<u8>>,
    output: FrameOutput,
    mtu: usize,
}

impl FrameDevice {
    pub fn new(output: FrameOutput, mtu: usize) -> Self {
        Self {
            rx: VecDeque::new(),
            output,
            mtu,
        }
    }

    pub fn push_rx(&mut self, frame: &[u8]) {
        self.rx.push_back(frame.to_vec());
    }
}

pub(crate) struct FrameRx(Vec<u8>);

impl RxToken for FrameRx {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.0)
    }
}

pub(crate) struct FrameTx<'a> {
    output: &'a FrameOutput,
}

impl TxToken for FrameTx<'_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buf = vec![0u8; len];
        let r = f(&mut buf);
        (self.output)(&buf);
        r
    }
}

impl Device for FrameDevice {
    type RxToken<'a>
        = FrameRx
    where
        Self: 'a;
    type TxToken<'a>
        = FrameTx<'a>
    where
        Self: 'a;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = self.rx.pop_front()?;
        Some((FrameRx(frame), FrameTx { output: &self.output }))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(FrameTx { output: &self.output })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ethernet;
        caps.max_transmission_unit = self.mtu + EthernetFrame::HEADER_LEN;
        caps
    }
}
