use crate::pubsub::Correlation;
use ferrite::time::timestamp_millis;
use indexmap::IndexMap;
use std::collections::VecDeque;

/// Per-slot cap on buffered stdout+stderr between polls. Older bytes are
/// dropped circularly once the cap is reached.
pub const OUTPUT_BUFFER_LIMIT: usize = 8192;

/// How long an exited, never-drained slot lingers before the background
/// watcher reclaims it.
pub const ABANDONED_GRACE_MS: u64 = 60_000;

#[derive(Debug, PartialEq, Eq)]
pub enum ProcessError {
    SlotsExhausted,
    UnknownPid,
}

impl ProcessError {
    pub fn reason(&self) -> &'static str {
        match self {
            ProcessError::SlotsExhausted => "process-slots-exhausted",
            ProcessError::UnknownPid => "unknown-pid",
        }
    }
}

/// Who asked for the process, deciding where its completion goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOrigin {
    /// MCU PROCESS_RUN: a single response frame on completion.
    McuSync,
    /// MCU PROCESS_RUN_ASYNC: results drained through PROCESS_POLL.
    McuAsync,
    /// MQTT `sh/run`: one publication on completion.
    MqttSync(Correlation),
    /// MQTT `sh/run_async`: results drained through `sh/poll/<pid>`.
    MqttAsync(Correlation),
}

pub struct ProcessSlot {
    pub command_line: String,
    pub origin: ProcessOrigin,
    running: bool,
    exit_code: u8,
    output: VecDeque<u8>,
    dropped_output: u64,
    exited_at_ms: Option<u64>,
    kill_requested: bool,
}

impl ProcessSlot {
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running
    }

    #[inline]
    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.output.len()
    }
}

/// Result of draining a slot through a poll.
#[derive(Debug, PartialEq, Eq)]
pub struct PollChunk {
    pub running: bool,
    pub exit_code: u8,
    pub chunk: Vec<u8>,
    /// True when this chunk delivered the retained exit code and emptied the
    /// buffer; the slot is gone afterwards.
    pub finished: bool,
}

/// The async-process bookkeeping: bounded slots keyed by bridge-local PID,
/// kept in spawn order. The table never spawns anything itself; the daemon's
/// runner executes the spawn/kill requests and feeds output back in.
pub struct ProcessTable {
    slots: IndexMap<u16, ProcessSlot>,
    next_pid: u16,
    slot_limit: usize,
    rejections: u64,
}

impl ProcessTable {
    pub fn new(slot_limit: usize) -> ProcessTable {
        ProcessTable {
            slots: IndexMap::new(),
            next_pid: 1,
            slot_limit,
            rejections: 0,
        }
    }

    #[inline]
    pub fn slots_used(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn slot_limit(&self) -> usize {
        self.slot_limit
    }

    #[inline]
    pub fn rejections(&self) -> u64 {
        self.rejections
    }

    pub fn get(&self, pid: u16) -> Option<&ProcessSlot> {
        self.slots.get(&pid)
    }

    /// Claim a slot and a bridge-local PID for a new process.
    pub fn allocate(
        &mut self,
        command_line: &str,
        origin: ProcessOrigin,
    ) -> Result<u16, ProcessError> {
        if self.slots.len() >= self.slot_limit {
            self.rejections += 1;
            return Err(ProcessError::SlotsExhausted);
        }

        let pid = self.next_free_pid();
        self.slots.insert(
            pid,
            ProcessSlot {
                command_line: command_line.to_string(),
                origin,
                running: true,
                exit_code: 0,
                output: VecDeque::new(),
                dropped_output: 0,
                exited_at_ms: None,
                kill_requested: false,
            },
        );

        Ok(pid)
    }

    /// Append streamed output, dropping the oldest bytes past the cap.
    pub fn push_output(&mut self, pid: u16, bytes: &[u8]) {
        if let Some(slot) = self.slots.get_mut(&pid) {
            for &byte in bytes {
                if slot.output.len() >= OUTPUT_BUFFER_LIMIT {
                    slot.output.pop_front();
                    slot.dropped_output += 1;
                }
                slot.output.push_back(byte);
            }
        }
    }

    /// The runner observed the process exit. The exit code is retained until
    /// the consumer drains the final chunk.
    pub fn mark_exited(&mut self, pid: u16, exit_code: u8) {
        if let Some(slot) = self.slots.get_mut(&pid) {
            slot.running = false;
            slot.exit_code = exit_code;
            slot.exited_at_ms = Some(timestamp_millis());
        }
    }

    /// Drain up to `max` buffered bytes. Frees the slot once the process has
    /// exited and the buffer is empty after this chunk.
    pub fn poll(&mut self, pid: u16, max: usize) -> Result<PollChunk, ProcessError> {
        let slot = self.slots.get_mut(&pid).ok_or(ProcessError::UnknownPid)?;

        let take = std::cmp::min(max, slot.output.len());
        let chunk: Vec<u8> = slot.output.drain(..take).collect();

        let finished = !slot.running && slot.output.is_empty();
        let result = PollChunk {
            running: slot.running,
            exit_code: slot.exit_code,
            chunk,
            finished,
        };

        if finished {
            self.slots.shift_remove(&pid);
        }

        Ok(result)
    }

    /// Record a kill request; the runner delivers the actual signal.
    pub fn request_kill(&mut self, pid: u16) -> Result<(), ProcessError> {
        let slot = self.slots.get_mut(&pid).ok_or(ProcessError::UnknownPid)?;
        slot.kill_requested = true;
        Ok(())
    }

    /// Background watcher sweep: frees slots whose consumer never drained
    /// them, so a dead poller cannot exhaust the table. Returns the freed
    /// PIDs.
    pub fn reap_abandoned(&mut self, now_ms: u64, grace_ms: u64) -> Vec<u16> {
        let doomed: Vec<u16> = self
            .slots
            .iter()
            .filter(|(_, slot)| match slot.exited_at_ms {
                Some(at) => now_ms.saturating_sub(at) >= grace_ms,
                None => false,
            })
            .map(|(&pid, _)| pid)
            .collect();

        for pid in doomed.iter() {
            self.slots.shift_remove(pid);
        }

        doomed
    }

    /// Drop everything, e.g. on link reset for MCU-originated slots.
    pub fn drain_mcu_slots(&mut self) -> Vec<u16> {
        let doomed: Vec<u16> = self
            .slots
            .iter()
            .filter(|(_, slot)| {
                matches!(slot.origin, ProcessOrigin::McuSync | ProcessOrigin::McuAsync)
            })
            .map(|(&pid, _)| pid)
            .collect();

        for pid in doomed.iter() {
            self.slots.shift_remove(pid);
        }

        doomed
    }

    fn next_free_pid(&mut self) -> u16 {
        loop {
            let pid = self.next_pid;
            self.next_pid = if self.next_pid == u16::max_value() {
                1
            } else {
                self.next_pid + 1
            };

            if !self.slots.contains_key(&pid) {
                return pid;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_slot_limit() {
        let mut table = ProcessTable::new(2);

        let first = table.allocate("sleep 1", ProcessOrigin::McuAsync).unwrap();
        let second = table.allocate("sleep 2", ProcessOrigin::McuAsync).unwrap();
        assert_ne!(first, second);

        assert_eq!(
            table.allocate("sleep 3", ProcessOrigin::McuAsync),
            Err(ProcessError::SlotsExhausted)
        );
        assert_eq!(table.rejections(), 1);
    }

    #[test]
    fn test_poll_streams_then_finishes() {
        let mut table = ProcessTable::new(2);
        let pid = table.allocate("cat", ProcessOrigin::McuAsync).unwrap();

        table.push_output(pid, b"first ");
        let chunk = table.poll(pid, 64).unwrap();
        assert!(chunk.running);
        assert!(!chunk.finished);
        assert_eq!(chunk.chunk, b"first ");

        table.push_output(pid, b"second");
        table.mark_exited(pid, 3);

        // The exit code rides along while output remains.
        let chunk = table.poll(pid, 3).unwrap();
        assert!(!chunk.running);
        assert!(!chunk.finished);
        assert_eq!(chunk.exit_code, 3);
        assert_eq!(chunk.chunk, b"sec");

        // Draining the rest frees the slot.
        let chunk = table.poll(pid, 64).unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.chunk, b"ond");
        assert_eq!(table.poll(pid, 64), Err(ProcessError::UnknownPid));
        assert_eq!(table.slots_used(), 0);
    }

    #[test]
    fn test_exit_with_no_output_finishes_on_first_poll() {
        let mut table = ProcessTable::new(2);
        let pid = table.allocate("true", ProcessOrigin::McuAsync).unwrap();

        table.mark_exited(pid, 0);

        let chunk = table.poll(pid, 64).unwrap();
        assert!(chunk.finished);
        assert_eq!(chunk.exit_code, 0);
        assert!(chunk.chunk.is_empty());
    }

    #[test]
    fn test_output_buffer_is_circular() {
        let mut table = ProcessTable::new(1);
        let pid = table.allocate("yes", ProcessOrigin::McuAsync).unwrap();

        table.push_output(pid, &[b'x'; OUTPUT_BUFFER_LIMIT]);
        table.push_output(pid, b"tail");

        let slot = table.get(pid).unwrap();
        assert_eq!(slot.buffered(), OUTPUT_BUFFER_LIMIT);

        let chunk = table.poll(pid, OUTPUT_BUFFER_LIMIT).unwrap();
        assert!(chunk.chunk.ends_with(b"tail"));
    }

    #[test]
    fn test_reap_abandoned_slots() {
        let mut table = ProcessTable::new(2);
        let pid = table.allocate("true", ProcessOrigin::MqttAsync(Default::default())).unwrap();

        table.mark_exited(pid, 0);
        let exited_at = table.get(pid).unwrap().exited_at_ms.unwrap();

        // Within the grace period nothing is reaped.
        assert!(table.reap_abandoned(exited_at + 1, ABANDONED_GRACE_MS).is_empty());

        let reaped = table.reap_abandoned(exited_at + ABANDONED_GRACE_MS, ABANDONED_GRACE_MS);
        assert_eq!(reaped, vec![pid]);
        assert_eq!(table.slots_used(), 0);
    }

    #[test]
    fn test_pids_not_reused_while_live() {
        let mut table = ProcessTable::new(8);

        let first = table.allocate("a", ProcessOrigin::McuAsync).unwrap();
        let second = table.allocate("b", ProcessOrigin::McuAsync).unwrap();

        table.mark_exited(first, 0);
        table.poll(first, 64).unwrap();

        let third = table.allocate("c", ProcessOrigin::McuAsync).unwrap();
        assert_ne!(third, second);
    }

    #[test]
    fn test_drain_mcu_slots_spares_mqtt() {
        let mut table = ProcessTable::new(4);

        let mcu = table.allocate("a", ProcessOrigin::McuAsync).unwrap();
        let mqtt = table
            .allocate("b", ProcessOrigin::MqttAsync(Default::default()))
            .unwrap();

        let drained = table.drain_mcu_slots();
        assert_eq!(drained, vec![mcu]);
        assert!(table.get(mqtt).is_some());
    }

    #[test]
    fn test_kill_unknown_pid() {
        let mut table = ProcessTable::new(1);
        assert_eq!(table.request_kill(99), Err(ProcessError::UnknownPid));
    }
}
