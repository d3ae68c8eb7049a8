//! Shared-memory channel.
//!
//! A co-located unit exchanges messages with the orchestrator through two
//! file-backed regions, one per direction, each carrying the fixed layout
//! from [`tactus_proto::shm`]. There is no handshake: creating (orchestrator)
//! or opening (unit) the pre-sized pair is the whole attach.
//!
//! Single writer per region: the orchestrator writes only the request
//! region, the unit only the response region. Commit protocol:
//!
//! - writer: record array and count first, then a release-ordered store of
//!   `current_time_us`;
//! - reader: acquire-load `current_time_us`, copy the array, then re-check
//!   the time — a changed value means a newer message landed mid-copy and
//!   the read retries, so an observed time is always paired with its own
//!   fully written array.
//!
//! The region direction implies the message kind, and the monotonically
//! increasing time field doubles as the new-message signal: `poll` compares
//! it against the last value seen and fires at most once per new value.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering, fence};
use std::time::Duration;

use memmap2::MmapMut;
use tactus_proto::shm::{COUNT_OFFSET, HEADER_SIZE, RECORD_SIZE, Record, region_size};
use tactus_proto::{Message, StepRequest, StepResponse, Variable};
use zerocopy::{FromBytes, IntoBytes};

use crate::{ChannelState, TransportError};

/// Interval between cooperative polls while awaiting a message.
const POLL_INTERVAL: Duration = Duration::from_micros(200);

/// Retries before a continuously changing region is reported unstable.
const READ_ATTEMPTS: usize = 16;

/// Which side of the channel this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharedRole {
    /// Writes requests, reads responses.
    Orchestrator,
    /// Reads requests, writes responses.
    Unit,
}

/// One mapped region with the fixed header + record layout.
#[derive(Debug)]
struct Region {
    map: MmapMut,
    capacity: usize,
}

impl Region {
    /// Create the backing file, size it, and map it.
    fn create(path: &Path, capacity: usize) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(region_size(capacity) as u64)?;
        Self::map(&file, path, capacity)
    }

    /// Map a region created by the peer, validating the agreed size.
    fn open(path: &Path, capacity: usize) -> Result<Self, TransportError> {
        let file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
        let expected = region_size(capacity) as u64;
        let actual = file.metadata()?.len();
        if actual != expected {
            return Err(TransportError::Region {
                detail: format!(
                    "{} is {actual} bytes, capacity {capacity} needs {expected}",
                    path.display()
                ),
            });
        }
        Self::map(&file, path, capacity)
    }

    fn map(file: &std::fs::File, path: &Path, capacity: usize) -> Result<Self, TransportError> {
        // SAFETY: the file is exclusively ours by protocol (single writer,
        // single reader, agreed size); concurrent access is governed by the
        // commit protocol on the time field, not by the mapping itself.
        let map = unsafe { MmapMut::map_mut(file) }.map_err(|e| TransportError::Region {
            detail: format!("mapping {} failed: {e}", path.display()),
        })?;
        Ok(Self { map, capacity })
    }

    /// The commit field at offset 0.
    fn commit_field(&self) -> &AtomicU64 {
        // SAFETY: the mapping is page-aligned and at least HEADER_SIZE
        // bytes, so offset 0 is valid and 8-byte aligned for the lifetime
        // of `self`. Cross-process visibility relies on the release store /
        // acquire load pairing done by the callers.
        unsafe { &*self.map.as_ptr().cast::<AtomicU64>() }
    }

    /// Publish one message: records and count first, time last.
    fn write_message(
        &mut self,
        time_us: u64,
        variables: &[Variable],
    ) -> Result<(), TransportError> {
        if variables.len() > self.capacity {
            return Err(TransportError::CapacityExceeded {
                count: variables.len(),
                capacity: self.capacity,
            });
        }

        for (i, variable) in variables.iter().enumerate() {
            let record = Record::from_variable(variable)?;
            let offset = HEADER_SIZE + i * RECORD_SIZE;
            self.map[offset..offset + RECORD_SIZE].copy_from_slice(record.as_bytes());
        }
        let count = u32::try_from(variables.len()).unwrap_or(u32::MAX);
        self.map[COUNT_OFFSET..COUNT_OFFSET + 4].copy_from_slice(&count.to_le_bytes());

        self.commit_field().store(time_us, Ordering::Release);
        Ok(())
    }

    /// Read the current message if its time differs from `last_seen`.
    ///
    /// Retries when the writer lands a newer message mid-copy, so the
    /// returned array is always consistent with the returned time.
    fn read_message(
        &self,
        last_seen: u64,
    ) -> Result<Option<(u64, Vec<Variable>)>, TransportError> {
        for _ in 0..READ_ATTEMPTS {
            let observed = self.commit_field().load(Ordering::Acquire);
            if observed == last_seen {
                return Ok(None);
            }

            let mut count_bytes = [0u8; 4];
            count_bytes.copy_from_slice(&self.map[COUNT_OFFSET..COUNT_OFFSET + 4]);
            let count = u32::from_le_bytes(count_bytes) as usize;
            if count > self.capacity {
                return Err(TransportError::Region {
                    detail: format!(
                        "region declares {count} records, capacity is {}",
                        self.capacity
                    ),
                });
            }

            let mut raw = vec![[0u8; RECORD_SIZE]; count];
            for (i, record_bytes) in raw.iter_mut().enumerate() {
                let offset = HEADER_SIZE + i * RECORD_SIZE;
                record_bytes.copy_from_slice(&self.map[offset..offset + RECORD_SIZE]);
            }

            fence(Ordering::Acquire);
            if self.commit_field().load(Ordering::Relaxed) != observed {
                // A newer message landed while copying; try again.
                continue;
            }

            let mut variables = Vec::with_capacity(count);
            for record_bytes in &raw {
                let record = Record::read_from_bytes(record_bytes.as_slice()).map_err(|_| {
                    TransportError::Region { detail: "record size mismatch".to_owned() }
                })?;
                variables.push(record.to_variable()?);
            }
            return Ok(Some((observed, variables)));
        }

        Err(TransportError::Region { detail: "region did not stabilize".to_owned() })
    }
}

/// Shared-memory channel: one region pair plus the commit bookkeeping.
#[derive(Debug)]
pub struct SharedChannel {
    request: Region,
    response: Region,
    role: SharedRole,
    /// Last time value observed on the region we read.
    last_seen: u64,
    /// Last time value we published on the region we write.
    clock: u64,
    state: ChannelState,
}

impl SharedChannel {
    /// Create the region pair (orchestrator side).
    ///
    /// `base` names the pair: requests land in `<base>.req`, responses in
    /// `<base>.rsp`. Putting it on a tmpfs mount such as `/dev/shm` keeps
    /// the copies purely in memory.
    pub fn create(base: &Path, capacity: usize) -> Result<Self, TransportError> {
        let request = Region::create(&request_path(base), capacity)?;
        let response = Region::create(&response_path(base), capacity)?;
        Ok(Self {
            request,
            response,
            role: SharedRole::Orchestrator,
            last_seen: 0,
            clock: 0,
            state: ChannelState::Connected,
        })
    }

    /// Map a region pair created by the orchestrator (unit side).
    pub fn open(base: &Path, capacity: usize) -> Result<Self, TransportError> {
        let request = Region::open(&request_path(base), capacity)?;
        let response = Region::open(&response_path(base), capacity)?;
        Ok(Self {
            request,
            response,
            role: SharedRole::Unit,
            last_seen: 0,
            clock: 0,
            state: ChannelState::Connected,
        })
    }

    /// This side's role.
    pub fn role(&self) -> SharedRole {
        self.role
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Publish one message into this side's write region.
    ///
    /// The orchestrator publishes step requests (the region time advances
    /// to the post-step target time); the unit publishes step responses
    /// (echoing the request time it answers).
    pub fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if self.state != ChannelState::Connected {
            return Err(TransportError::NotConnected);
        }

        match (self.role, message) {
            (SharedRole::Orchestrator, Message::StepRequest(request)) => {
                if request.timestep_us == 0 {
                    return Err(TransportError::Send {
                        detail: "step request carries a zero timestep".to_owned(),
                    });
                }
                let target = self.clock + request.timestep_us;
                self.request.write_message(target, &request.inputs)?;
                self.clock = target;
                Ok(())
            },
            (SharedRole::Unit, Message::StepResponse(response)) => {
                if self.last_seen == 0 {
                    return Err(TransportError::Send {
                        detail: "response before any request was observed".to_owned(),
                    });
                }
                self.response.write_message(self.last_seen, &response.outputs)?;
                self.clock = self.last_seen;
                Ok(())
            },
            _ => Err(TransportError::Send {
                detail: "message kind not valid for this role on a shared channel".to_owned(),
            }),
        }
    }

    /// Check the read region for a new message.
    ///
    /// Fires at most once per new time value. The unit side recovers the
    /// request timestep as the delta between consecutive region times
    /// (global time starts at zero).
    pub fn poll(&mut self) -> Result<Option<Message>, TransportError> {
        if self.state != ChannelState::Connected {
            return Err(TransportError::NotConnected);
        }

        let region = match self.role {
            SharedRole::Orchestrator => &self.response,
            SharedRole::Unit => &self.request,
        };
        let Some((time, variables)) = region.read_message(self.last_seen)? else {
            return Ok(None);
        };

        match self.role {
            SharedRole::Unit => {
                let timestep_us = time.saturating_sub(self.last_seen);
                self.last_seen = time;
                Ok(Some(Message::StepRequest(StepRequest { timestep_us, inputs: variables })))
            },
            SharedRole::Orchestrator => {
                self.last_seen = time;
                Ok(Some(Message::StepResponse(StepResponse { outputs: variables })))
            },
        }
    }

    /// Await the next message by cooperative polling, bounded by `deadline`.
    pub async fn next_message(&mut self, deadline: Duration) -> Result<Message, TransportError> {
        let expiry = tokio::time::Instant::now() + deadline;
        loop {
            if let Some(message) = self.poll()? {
                return Ok(message);
            }
            if tokio::time::Instant::now() >= expiry {
                return Err(TransportError::Timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Discard an unread stale message, if any.
    pub fn drain(&mut self) -> usize {
        match self.poll() {
            Ok(Some(_)) => 1,
            _ => 0,
        }
    }

    /// Close the channel. The backing files stay for the peer to notice.
    pub fn close(&mut self) {
        self.state = ChannelState::Closed;
    }
}

fn request_path(base: &Path) -> PathBuf {
    base.with_extension("req")
}

fn response_path(base: &Path) -> PathBuf {
    base.with_extension("rsp")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tactus_proto::Value;

    use super::*;

    fn pair(capacity: usize) -> (SharedChannel, SharedChannel, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("unit1");
        let orchestrator = SharedChannel::create(&base, capacity).unwrap();
        let unit = SharedChannel::open(&base, capacity).unwrap();
        (orchestrator, unit, dir)
    }

    fn request(timestep_us: u64, inputs: Vec<Variable>) -> Message {
        Message::StepRequest(StepRequest { timestep_us, inputs })
    }

    #[test]
    fn request_response_roundtrip() {
        let (mut orchestrator, mut unit, _dir) = pair(4);

        let inputs =
            vec![Variable::new(0, Value::Real(1.5)), Variable::new(1, Value::Boolean(true))];
        orchestrator.send(&request(1000, inputs.clone())).unwrap();

        let received = unit.poll().unwrap().unwrap();
        assert_eq!(received, request(1000, inputs));

        let outputs = vec![Variable::new(2, Value::Integer(7))];
        unit.send(&Message::StepResponse(StepResponse { outputs: outputs.clone() })).unwrap();

        let received = orchestrator.poll().unwrap().unwrap();
        assert_eq!(received, Message::StepResponse(StepResponse { outputs }));
    }

    #[test]
    fn poll_fires_once_per_message() {
        let (mut orchestrator, mut unit, _dir) = pair(4);

        assert!(unit.poll().unwrap().is_none());

        orchestrator.send(&request(1000, vec![])).unwrap();
        assert!(unit.poll().unwrap().is_some());
        assert!(unit.poll().unwrap().is_none());
    }

    #[test]
    fn timestep_recovered_across_rounds() {
        let (mut orchestrator, mut unit, _dir) = pair(4);

        for _ in 0..3 {
            orchestrator.send(&request(1000, vec![])).unwrap();
            match unit.poll().unwrap().unwrap() {
                Message::StepRequest(received) => assert_eq!(received.timestep_us, 1000),
                other => panic!("unexpected message: {other:?}"),
            }
            unit.send(&Message::StepResponse(StepResponse { outputs: vec![] })).unwrap();
            assert!(orchestrator.poll().unwrap().is_some());
        }
    }

    #[test]
    fn capacity_is_enforced() {
        let (mut orchestrator, _unit, _dir) = pair(1);

        let inputs =
            vec![Variable::new(0, Value::Real(0.0)), Variable::new(1, Value::Real(0.0))];
        let result = orchestrator.send(&request(1000, inputs));
        assert!(
            matches!(result, Err(TransportError::CapacityExceeded { count: 2, capacity: 1 })),
            "{result:?}"
        );
    }

    #[test]
    fn string_values_are_rejected() {
        let (mut orchestrator, _unit, _dir) = pair(4);

        let inputs = vec![Variable::new(0, Value::String("x".to_owned()))];
        let result = orchestrator.send(&request(1000, inputs));
        assert!(matches!(result, Err(TransportError::UnsupportedValue(_))), "{result:?}");
    }

    #[test]
    fn response_before_request_is_refused() {
        let (_orchestrator, mut unit, _dir) = pair(4);

        let result = unit.send(&Message::StepResponse(StepResponse { outputs: vec![] }));
        assert!(matches!(result, Err(TransportError::Send { .. })), "{result:?}");
    }

    #[test]
    fn open_validates_region_size() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("unit1");
        let _orchestrator = SharedChannel::create(&base, 4).unwrap();

        let result = SharedChannel::open(&base, 8);
        assert!(matches!(result, Err(TransportError::Region { .. })), "{result:?}");
    }

    #[test]
    fn reader_never_observes_a_torn_array() {
        const ROUNDS: u64 = 5_000;
        const VARS: usize = 4;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("torn.req");
        let mut writer = Region::create(&path, VARS).unwrap();
        let reader = Region::open(&path, VARS).unwrap();

        let handle = std::thread::spawn(move || {
            for time in 1..=ROUNDS {
                // Every record value equals the committed time, so any mix
                // of generations is detectable.
                #[allow(clippy::cast_precision_loss)]
                let variables: Vec<Variable> = (0..VARS as u32)
                    .map(|reference| Variable::new(reference, Value::Real(time as f64)))
                    .collect();
                writer.write_message(time, &variables).unwrap();
                std::thread::yield_now();
            }
        });

        let mut last_seen = 0u64;
        while last_seen < ROUNDS {
            match reader.read_message(last_seen) {
                Ok(Some((time, variables))) => {
                    assert_eq!(variables.len(), VARS);
                    #[allow(clippy::cast_precision_loss)]
                    for variable in &variables {
                        assert_eq!(
                            variable.value,
                            Value::Real(time as f64),
                            "torn read at time {time}"
                        );
                    }
                    last_seen = time;
                },
                Ok(None) => {},
                // A hot writer can outrun the retry bound; only torn data
                // is a failure here.
                Err(TransportError::Region { .. }) => {},
                Err(error) => panic!("unexpected error: {error:?}"),
            }
        }

        handle.join().unwrap();
    }
}
