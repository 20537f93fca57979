//! Progress-report decoding for both generations.
//!
//! V5 devices interleave progress as status packets: the sentinel
//! `0x40040004` followed by a u32 percentage, repeated, then the terminal
//! sentinel `0x40040005` followed by the operation's final status. V6
//! devices announce `CMD:PROGRESS-REPORT` and then stream
//! `OK!PROGRESS@<pct>` tokens until `OK!EOT\0`.
//!
//! Both are exposed as one lazy, finite, non-restartable sequence of
//! [`ProgressEvent`]s so callers stay protocol-agnostic.

use crate::error::{DaError, DeviceFailure, Result};
use crate::protocol::constants::{
    STATUS_PROGRESS, STATUS_PROGRESS_END, TOK_EOT, TOK_OK, TOK_PROGRESS_PREFIX,
};
use crate::protocol::packet::Channel;
use crate::protocol::status::StatusWord;

/// One element of a progress sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressEvent {
    /// 0..=100, non-decreasing within one operation.
    Percentage(u8),
    /// Terminates the sequence.
    Done,
}

/// Pure sequencing rules for progress events, shared by both decoders:
/// percentages are 0..=100 and non-decreasing, and nothing follows `Done`.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
    done: bool,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept(&mut self, event: ProgressEvent) -> Result<()> {
        if self.done {
            return Err(DaError::proto("progress event after Done"));
        }
        match event {
            ProgressEvent::Percentage(pct) => {
                if pct > 100 {
                    return Err(DaError::proto(format!("percentage {} out of range", pct)));
                }
                if let Some(last) = self.last {
                    if pct < last {
                        return Err(DaError::proto(format!(
                            "percentage went backwards: {} after {}",
                            pct, last
                        )));
                    }
                }
                self.last = Some(pct);
            }
            ProgressEvent::Done => self.done = true,
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.done
    }
}

enum Mode {
    V5,
    V6,
}

/// A lazy, finite progress sequence read off the wire.
///
/// Yields `Percentage` events and exactly one final `Done`; the iterator
/// then fuses. Any out-of-order input surfaces as a `ProtocolError`.
pub struct ProgressStream<'a> {
    channel: &'a mut Channel,
    mode: Mode,
    tracker: ProgressTracker,
    failed: bool,
}

impl<'a> ProgressStream<'a> {
    /// Decode V5 sentinel/status packets.
    pub fn v5(channel: &'a mut Channel) -> Self {
        Self {
            channel,
            mode: Mode::V5,
            tracker: ProgressTracker::new(),
            failed: false,
        }
    }

    /// Decode V6 progress tokens. The caller has already consumed (and
    /// acked) the `CMD:PROGRESS-REPORT` announcement.
    pub fn v6(channel: &'a mut Channel) -> Self {
        Self {
            channel,
            mode: Mode::V6,
            tracker: ProgressTracker::new(),
            failed: false,
        }
    }

    /// Consume the whole sequence, forwarding percentages to `sink`.
    pub fn drain(mut self, sink: &mut dyn FnMut(u8)) -> Result<()> {
        while let Some(event) = self.next() {
            if let ProgressEvent::Percentage(pct) = event? {
                sink(pct);
            }
        }
        Ok(())
    }

    fn next_v5(&mut self) -> Result<ProgressEvent> {
        let sentinel = self.channel.recv()?.as_u32()?;
        match sentinel {
            STATUS_PROGRESS => {
                let pct = self.channel.recv()?.as_u32()?;
                let pct = u8::try_from(pct)
                    .map_err(|_| DaError::proto(format!("percentage {} out of range", pct)))?;
                Ok(ProgressEvent::Percentage(pct))
            }
            STATUS_PROGRESS_END => {
                let status = StatusWord::from_raw(self.channel.recv()?.as_u32()?);
                if status.is_ok() {
                    Ok(ProgressEvent::Done)
                } else {
                    Err(DaError::Device(DeviceFailure::Status(status)))
                }
            }
            other => Err(DaError::proto(format!(
                "expected progress sentinel, got 0x{:08X}",
                other
            ))),
        }
    }

    fn next_v6(&mut self) -> Result<ProgressEvent> {
        let packet = self.channel.recv()?;
        if packet.payload == TOK_EOT {
            return Ok(ProgressEvent::Done);
        }

        let text = std::str::from_utf8(&packet.payload)
            .map_err(|_| DaError::proto("progress token is not ASCII"))?
            .trim_end_matches('\0');

        let digits = text
            .strip_prefix(TOK_PROGRESS_PREFIX)
            .ok_or_else(|| DaError::proto(format!("unexpected progress token {:?}", text)))?;
        let pct: u8 = digits
            .parse()
            .map_err(|_| DaError::proto(format!("bad progress percentage {:?}", digits)))?;

        // Each report is acked to keep the flow lockstep.
        self.channel.send_token(TOK_OK)?;
        Ok(ProgressEvent::Percentage(pct))
    }
}

impl Iterator for ProgressStream<'_> {
    type Item = Result<ProgressEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.tracker.is_done() {
            return None;
        }

        let event = match self.mode {
            Mode::V5 => self.next_v5(),
            Mode::V6 => self.next_v6(),
        };

        match event {
            Ok(event) => {
                if let Err(e) = self.tracker.accept(event) {
                    self.failed = true;
                    return Some(Err(e));
                }
                Some(Ok(event))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn channel_with(mock: MockTransport) -> Channel {
        Channel::new(Box::new(mock))
    }

    #[test]
    fn test_tracker_accepts_monotonic_sequence() {
        let mut tracker = ProgressTracker::new();
        for event in [
            ProgressEvent::Percentage(10),
            ProgressEvent::Percentage(45),
            ProgressEvent::Percentage(90),
            ProgressEvent::Done,
        ] {
            tracker.accept(event).unwrap();
        }
        assert!(tracker.is_done());
    }

    #[test]
    fn test_tracker_rejects_events_after_done() {
        let mut tracker = ProgressTracker::new();
        tracker.accept(ProgressEvent::Done).unwrap();
        let err = tracker.accept(ProgressEvent::Percentage(95)).unwrap_err();
        assert!(matches!(err, DaError::Protocol(_)));
    }

    #[test]
    fn test_tracker_rejects_regression() {
        let mut tracker = ProgressTracker::new();
        tracker.accept(ProgressEvent::Percentage(50)).unwrap();
        assert!(tracker.accept(ProgressEvent::Percentage(49)).is_err());
    }

    #[test]
    fn test_v5_stream() {
        let mut mock = MockTransport::new();
        for pct in [10u32, 45, 90] {
            mock.queue_status(STATUS_PROGRESS);
            mock.queue_status(pct);
        }
        mock.queue_status(STATUS_PROGRESS_END);
        mock.queue_status(0);

        let mut channel = channel_with(mock);
        let events: Vec<_> = ProgressStream::v5(&mut channel)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(
            events,
            vec![
                ProgressEvent::Percentage(10),
                ProgressEvent::Percentage(45),
                ProgressEvent::Percentage(90),
                ProgressEvent::Done,
            ]
        );
    }

    #[test]
    fn test_v5_terminal_failure_status() {
        let mut mock = MockTransport::new();
        mock.queue_status(STATUS_PROGRESS_END);
        mock.queue_status(0xC0040006);

        let mut channel = channel_with(mock);
        let result: Result<Vec<_>> = ProgressStream::v5(&mut channel).collect();
        assert!(matches!(result, Err(DaError::Device(_))));
    }

    #[test]
    fn test_v6_stream_acks_each_report() {
        let mut mock = MockTransport::new();
        mock.queue_token(b"OK!PROGRESS@30");
        mock.queue_token(b"OK!PROGRESS@100");
        mock.queue_token(TOK_EOT);

        let handle = mock.clone();
        let mut channel = channel_with(mock);
        let mut seen = Vec::new();
        ProgressStream::v6(&mut channel)
            .drain(&mut |pct| seen.push(pct))
            .unwrap();
        assert_eq!(seen, vec![30, 100]);

        // One OK ack (header + token) per report, none for EOT.
        let acks: Vec<_> = handle
            .writes()
            .into_iter()
            .filter(|w| w.as_slice() == TOK_OK)
            .collect();
        assert_eq!(acks.len(), 2);
    }

    #[test]
    fn test_v6_unexpected_token_is_protocol_error() {
        let mut mock = MockTransport::new();
        mock.queue_token(TOK_OK);

        let mut channel = channel_with(mock);
        let result: Result<Vec<_>> = ProgressStream::v6(&mut channel).collect();
        assert!(matches!(result, Err(DaError::Protocol(_))));
    }
}
