//! Loopback test bookkeeping for one earbud.

use heapless::Vec;
use rand::rngs::SmallRng;
use rand::{RngCore, SeedableRng};

use super::commands::CommandError;
use super::CASE_LOOPBACK_SEED;
use crate::ccp::CCP_MAX_PAYLOAD_SIZE;
use crate::TIMER_FREQUENCY_HZ;

pub type LoopbackData = Vec<u8, CCP_MAX_PAYLOAD_SIZE>;

/// Parameters of a loopback command
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackRequest<'a> {
    /// Round trips to run; 0 sends a single message without a rate report
    pub iterations: u16,
    /// Payload length, defaulting to the largest message body
    pub len: Option<u8>,
    /// Pattern repeated to fill `len`; generated data is used when absent
    pub data: Option<&'a [u8]>,
}

#[derive(Debug, Default)]
pub(crate) struct LoopbackTest {
    pub iterations: u16,
    pub count: u16,
    pub nack_count: u16,
    pub start_time: u32,
    generated: bool,
    len: usize,
    data: [u8; CCP_MAX_PAYLOAD_SIZE],
}

impl LoopbackTest {
    pub fn configure(&mut self, request: &LoopbackRequest<'_>, now: u32) -> Result<(), CommandError> {
        let mut len = request.len.map_or(CCP_MAX_PAYLOAD_SIZE, usize::from);
        if len > CCP_MAX_PAYLOAD_SIZE {
            return Err(CommandError::InvalidArgument);
        }

        let mut data = [0u8; CCP_MAX_PAYLOAD_SIZE];
        let generated = match request.data {
            None => true,
            Some([]) => return Err(CommandError::InvalidArgument),
            Some(pattern) if pattern.len() > CCP_MAX_PAYLOAD_SIZE => {
                return Err(CommandError::InvalidArgument)
            }
            Some(pattern) => {
                data[..pattern.len()].copy_from_slice(pattern);
                if pattern.len() < len {
                    for i in pattern.len()..len {
                        data[i] = data[i % pattern.len()];
                    }
                } else {
                    len = pattern.len();
                }
                false
            }
        };

        *self = Self {
            iterations: request.iterations,
            count: 0,
            nack_count: 0,
            start_time: now,
            generated,
            len,
            data,
        };
        Ok(())
    }

    /// Payload for the next message
    ///
    /// Generated data restarts from the same seed every time, so each
    /// message of a run carries identical bytes.
    pub fn next_payload(&mut self) -> LoopbackData {
        if self.generated {
            SmallRng::seed_from_u64(CASE_LOOPBACK_SEED).fill_bytes(&mut self.data);
        }
        LoopbackData::from_slice(&self.data[..self.len]).unwrap_or_default()
    }

    /// True if `echoed` is exactly what was sent
    pub fn matches(&self, echoed: &[u8]) -> bool {
        echoed == &self.data[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Bytes per second moved by a loopback run, counting both directions
pub fn loopback_data_rate(iterations: u16, len: usize, elapsed_ticks: u32) -> u32 {
    (u32::from(iterations) * len as u32 * 2 * TIMER_FREQUENCY_HZ) / elapsed_ticks.max(1)
}
