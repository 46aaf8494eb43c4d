use std::time::Duration;
use anyhow::bail;

use crate::messaging::cm_messages::REQ_PRIVATE_DATA_LEN;


#[derive(Debug, Clone)]
pub struct CmConfig {
    /// number of REQ retransmissions before a connect attempt times out
    pub max_req_retry: u8,
    /// number of REP retransmissions before an accept times out; also caps the retries a remote
    ///  client asks for in its REQ
    pub max_rep_retry: u8,
    /// upper limit for the number of not-yet-accepted inbound requests per listener, used when the
    ///  listener does not set its own backlog
    pub max_backlog: u32,
    pub max_ceps_per_wait: usize,

    /// initial value for the adaptive estimate of the remote CM's turnaround time
    pub default_turnaround: Duration,
    pub min_turnaround: Duration,
    pub max_turnaround: Duration,

    /// base timeout for SIDR requests, packet lifetime is added on top
    pub sidr_req_timeout: Duration,

    /// capacity of the queue feeding the notification worker
    pub notification_queue_capacity: usize,
    /// maximum length of a listen discriminator including its offset into the REQ's private data
    pub max_discriminator_len: usize,
}

impl CmConfig {
    pub fn new() -> CmConfig {
        CmConfig {
            max_req_retry: 8,
            max_rep_retry: 8,
            max_backlog: 1024,
            max_ceps_per_wait: 2048,
            default_turnaround: Duration::from_millis(60),
            min_turnaround: Duration::from_millis(40),
            max_turnaround: Duration::from_secs(4),
            sidr_req_timeout: Duration::from_millis(8),
            notification_queue_capacity: 128,
            max_discriminator_len: REQ_PRIVATE_DATA_LEN,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_turnaround > self.max_turnaround {
            bail!("min turnaround {:?} exceeds max turnaround {:?}", self.min_turnaround, self.max_turnaround);
        }
        if self.max_turnaround.as_micros() >= u32::MAX as u128 {
            bail!("max turnaround {:?} is too large", self.max_turnaround);
        }
        if self.max_backlog == 0 {
            bail!("max backlog must be positive");
        }
        if self.max_ceps_per_wait == 0 {
            bail!("max CEPs per wait must be positive");
        }
        if self.notification_queue_capacity == 0 {
            bail!("notification queue capacity must be positive");
        }
        if self.max_discriminator_len > REQ_PRIVATE_DATA_LEN {
            bail!("discriminator length {} exceeds the REQ's private data ({} bytes)", self.max_discriminator_len, REQ_PRIVATE_DATA_LEN);
        }
        Ok(())
    }

    pub(crate) fn initial_turnaround_us(&self) -> u64 {
        self.default_turnaround.max(self.min_turnaround).as_micros() as u64
    }
}

impl Default for CmConfig {
    fn default() -> Self {
        CmConfig::new()
    }
}
